//! Deterministic random number generation.
//!
//! All randomness consumed by the precompute pipeline flows through
//! [`SeededRng`], a 32-bit-state generator chosen for bit-identical output
//! across platforms and releases. Registry RNG crates reserve the right to
//! change their streams between versions, which would silently break replay
//! of persisted races, so the generator is written out in full here.
//!
//! Exactly one generator instance exists per pipeline role:
//!
//! - `paths`: consumed by the path builder, four draws per horse in
//!   ascending horse order.
//! - `timeline`: consumed by the event scheduler, one draw per candidate in
//!   catalog order, then occurrence order.
//!
//! Role seeds are derived from the opaque cycle seed via [`seed_from_str`]
//! so the two streams are decorrelated.

use sha2::{Digest, Sha256};

/// Deterministic generator over a 32-bit state (mulberry32 construction).
///
/// For the same seed and the same sequence of calls, output is bit-identical
/// on every platform: all arithmetic is wrapping `u32` and the [0,1) mapping
/// divides by 2^32 exactly.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u32,
}

impl SeededRng {
    /// Create a generator from a 32-bit seed.
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Create the generator for a named pipeline role.
    pub fn for_role(cycle_seed: &str, role: &str) -> Self {
        Self::new(seed_from_str(&format!("{cycle_seed}|{role}")))
    }

    /// Next raw 32-bit value.
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Next uniform value in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / 4_294_967_296.0
    }

    /// Next uniform value in [lo, hi).
    pub fn next_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

/// Hash a byte string to a 32-bit seed: the leading four bytes of the
/// SHA-256 digest, big-endian.
pub fn hash32(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// [`hash32`] over a string.
pub fn seed_from_str(s: &str) -> u32 {
    hash32(s.as_bytes())
}
