//! Furlong Simulation Core
//!
//! This crate contains the deterministic race precompute pipeline. It is the
//! authoritative source of truth for every race outcome: given a cycle seed,
//! it produces the complete per-tick state of the race before the first
//! frame is broadcast.
//!
//! # Architecture Constraints
//!
//! The Simulation Core MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//! - Use ambient/unseeded randomness
//! - Iterate unordered containers without an explicit deterministic sort
//!
//! All external communication happens through the serializable artifacts this
//! crate returns; the server edge owns the clock and the transport.
//!
//! # Pipeline
//!
//! ```text
//! seed ─► SeededRng ─► base speed paths ─┐
//! seed ─► SeededRng ─► event timeline  ──┼─► state matrix ─► outcome + checksum
//!                      event catalog   ──┘
//! ```

#![deny(unsafe_code)]

pub mod apply;
pub mod catalog;
pub mod outcome;
pub mod path;
pub mod rng;
pub mod schedule;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use apply::{apply_events, HorseTickState, RaceMatrix};
pub use catalog::{EventCatalog, EventCategory, EventDef};
pub use outcome::{derive_outcome, race_checksum, RaceOutcome};
pub use path::{build_base_paths, BasePaths, HorsePath};
pub use rng::{hash32, seed_from_str, SeededRng};
pub use schedule::{schedule_events, EventInstance, EventTimeline, PacingPlan};
pub use validate::{validate_matrix, MatrixViolation, ValidationReport};

// ============================================================================
// Type Aliases
// ============================================================================

/// A single discrete simulation timestep; the atomic unit of race time.
///
/// Tick `i` corresponds to `i * tick_ms` milliseconds from race start. The
/// tick index is the authoritative clock for every downstream consumer.
pub type Tick = u32;

// ============================================================================
// Normative Constants
// ============================================================================

/// Default number of horses per race.
pub const DEFAULT_HORSE_COUNT: usize = 10;

/// Default tick period in milliseconds (20 Hz).
pub const DEFAULT_TICK_MS: u64 = 50;

/// Default race duration in milliseconds.
pub const DEFAULT_DURATION_MS: u64 = 20_000;

/// Default track length in meters.
pub const DEFAULT_TRACK_LENGTH_M: f64 = 1_000.0;

/// Base speed draw band (m/s), consumed from the `roster` RNG role. Sized
/// so a typical field covers the default track within the default duration.
pub const BASE_SPEED_BAND: (f64, f64) = (52.0, 58.0);

/// Accel variance draw band (m/s); curve-shaping amplitude only.
pub const ACCEL_VARIANCE_BAND: (f64, f64) = (1.5, 3.5);

/// Fixed roster of display names; horse `i` takes entry `i`.
const DISPLAY_NAMES: [&str; 10] = [
    "Brass Comet",
    "Cinder Gale",
    "Dust Devil",
    "Ember Crown",
    "Gallant Fog",
    "Iron Meadow",
    "Night Ledger",
    "Quarry Song",
    "Saffron Bolt",
    "Winter Parade",
];

// ============================================================================
// Race Configuration
// ============================================================================

/// Immutable race configuration, fixed at seeding time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceConfig {
    /// Race identifier, unique per cycle.
    pub race_id: String,
    /// Opaque cycle seed string; all determinism flows from it.
    pub seed: String,
    /// Track length in meters.
    pub track_length: f64,
    /// Finish line as a fraction of track length, in (0, 1].
    pub finish_ratio: f64,
    /// Race duration in milliseconds.
    pub duration_ms: u64,
    /// Tick period in milliseconds.
    pub tick_ms: u64,
    /// Number of horses in the field.
    pub horse_count: usize,
}

impl RaceConfig {
    /// Create a configuration with default distance and timing parameters.
    pub fn new(race_id: impl Into<String>, seed: impl Into<String>) -> Self {
        Self {
            race_id: race_id.into(),
            seed: seed.into(),
            track_length: DEFAULT_TRACK_LENGTH_M,
            finish_ratio: 1.0,
            duration_ms: DEFAULT_DURATION_MS,
            tick_ms: DEFAULT_TICK_MS,
            horse_count: DEFAULT_HORSE_COUNT,
        }
    }

    /// Derived 32-bit seed for instance-id hashing.
    pub fn seed_u32(&self) -> u32 {
        seed_from_str(&self.seed)
    }

    /// Total ticks in the race grid: `floor(duration_ms / tick_ms) + 1`.
    pub fn total_ticks(&self) -> Tick {
        (self.duration_ms / self.tick_ms) as Tick + 1
    }

    /// Finish line position in meters.
    pub fn finish_line(&self) -> f64 {
        self.track_length * self.finish_ratio
    }

    /// Tick period in seconds.
    pub fn dt_s(&self) -> f64 {
        self.tick_ms as f64 / 1000.0
    }

    /// Timestamp of tick `i` in milliseconds from race start.
    pub fn tick_ts_ms(&self, tick: Tick) -> u64 {
        u64::from(tick) * self.tick_ms
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }
        if self.duration_ms < self.tick_ms {
            return Err(ConfigError::DurationShorterThanTick {
                duration_ms: self.duration_ms,
                tick_ms: self.tick_ms,
            });
        }
        if !(self.finish_ratio > 0.0 && self.finish_ratio <= 1.0) {
            return Err(ConfigError::FinishRatioOutOfRange(self.finish_ratio));
        }
        if !(self.track_length > 0.0) {
            return Err(ConfigError::NonPositiveTrackLength(self.track_length));
        }
        if self.horse_count < 2 {
            return Err(ConfigError::TooFewHorses(self.horse_count));
        }
        // Ids are zero-padded to two digits; beyond 99 lexicographic id
        // order would diverge from field order.
        if self.horse_count > 99 {
            return Err(ConfigError::TooManyHorses(self.horse_count));
        }
        Ok(())
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ZeroTick,
    DurationShorterThanTick { duration_ms: u64, tick_ms: u64 },
    FinishRatioOutOfRange(f64),
    NonPositiveTrackLength(f64),
    TooFewHorses(usize),
    TooManyHorses(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroTick => write!(f, "tick_ms must be positive"),
            Self::DurationShorterThanTick {
                duration_ms,
                tick_ms,
            } => write!(
                f,
                "duration_ms ({duration_ms}) must be at least one tick ({tick_ms})"
            ),
            Self::FinishRatioOutOfRange(r) => {
                write!(f, "finish_ratio must be in (0, 1], got {r}")
            }
            Self::NonPositiveTrackLength(l) => {
                write!(f, "track_length must be positive, got {l}")
            }
            Self::TooFewHorses(n) => write!(f, "need at least 2 horses, got {n}"),
            Self::TooManyHorses(n) => write!(f, "field is capped at 99 horses, got {n}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Horse Seeds
// ============================================================================

/// Per-horse seeding record, fixed before the race is computed.
///
/// `accel_variance` shapes the speed-curve amplitude only; it never feeds
/// position directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorseSeed {
    pub id: String,
    pub display_name: String,
    /// Base speed in m/s.
    pub base_speed: f64,
    /// Curve-shaping amplitude in m/s.
    pub accel_variance: f64,
    /// Per-horse derived seed, carried in artifacts and the checksum.
    pub rng_seed: u32,
}

/// Derive the horse field from the cycle seed.
///
/// Consumes the `roster` RNG role: two draws per horse (base speed, accel
/// variance) in ascending horse order. Horse ids are zero-padded so that
/// lexicographic order equals field order.
pub fn derive_horses(config: &RaceConfig) -> Vec<HorseSeed> {
    let mut rng = SeededRng::for_role(&config.seed, "roster");

    (0..config.horse_count)
        .map(|i| {
            let id = format!("h{:02}", i + 1);
            let base_speed = rng.next_range(BASE_SPEED_BAND.0, BASE_SPEED_BAND.1);
            let accel_variance = rng.next_range(ACCEL_VARIANCE_BAND.0, ACCEL_VARIANCE_BAND.1);
            let rng_seed = seed_from_str(&format!("{}|horse|{id}", config.seed));
            HorseSeed {
                display_name: DISPLAY_NAMES[i % DISPLAY_NAMES.len()].to_string(),
                id,
                base_speed,
                accel_variance,
                rng_seed,
            }
        })
        .collect()
}

// ============================================================================
// Precompute Entry Point
// ============================================================================

/// A fully precomputed race: every artifact reachable from here is deeply
/// immutable. Construction happens once per cycle; no mutable access is
/// exposed afterwards.
#[derive(Debug, Clone)]
pub struct PrecomputedRace {
    pub config: RaceConfig,
    pub horses: Vec<HorseSeed>,
    pub base_paths: BasePaths,
    pub timeline: EventTimeline,
    pub matrix: RaceMatrix,
    pub outcome: RaceOutcome,
    pub report: ValidationReport,
}

/// Precompute pipeline error.
#[derive(Debug, Clone, PartialEq)]
pub enum PrecomputeError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Determinism violation detected in the finished matrix. Fatal: the
    /// cycle must abort and the race is marked unsaved.
    Invariant(MatrixViolation),
}

impl std::fmt::Display for PrecomputeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid race config: {e}"),
            Self::Invariant(v) => write!(f, "matrix invariant violation: {v}"),
        }
    }
}

impl std::error::Error for PrecomputeError {}

impl From<ConfigError> for PrecomputeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<MatrixViolation> for PrecomputeError {
    fn from(v: MatrixViolation) -> Self {
        Self::Invariant(v)
    }
}

/// Run the full precompute pipeline for one race.
///
/// Pure: two runs with the same configuration produce byte-identical
/// artifacts (matrix, timeline, outcome, checksum).
pub fn precompute_race(config: RaceConfig) -> Result<PrecomputedRace, PrecomputeError> {
    precompute_race_with_catalog(config, EventCatalog::default_catalog())
}

/// [`precompute_race`] with an explicit catalog; used by tests that pin
/// events to known ticks.
pub fn precompute_race_with_catalog(
    config: RaceConfig,
    catalog: EventCatalog,
) -> Result<PrecomputedRace, PrecomputeError> {
    config.validate()?;

    let (catalog, catalog_warnings) = catalog.validate();
    let horses = derive_horses(&config);
    let base_paths = build_base_paths(&config, &horses);
    let timeline = schedule_events(&config, &catalog, &PacingPlan::default_plan());
    let matrix = apply_events(&config, &horses, &base_paths, &timeline, &catalog);
    let outcome = derive_outcome(&config, &horses, &matrix, &timeline);

    let mut report = validate_matrix(&config, &matrix)?;
    report.warnings.splice(0..0, catalog_warnings);

    Ok(PrecomputedRace {
        config,
        horses,
        base_paths,
        timeline,
        matrix,
        outcome,
        report,
    })
}

// ============================================================================
// Tests
// ============================================================================
