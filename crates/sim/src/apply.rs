//! Effect application: overlay the event timeline onto base paths and
//! produce the canonical per-tick state matrix.
//!
//! This is a pure fold: no randomness, no hidden state. Target selection
//! hashes instance ids, so the same timeline always hits the same horses.
//!
//! Per-tick order of operations:
//! 1. Materialize the tick's events, sorted by catalog order then
//!    instance id.
//! 2. Apply each event: register active windows, extend stun spans, record
//!    swap windows, mark removals, accumulate instant offsets.
//! 3. Fold each horse: stun-gated base delta plus instant offsets (offsets
//!    land even while stunned), then swap-window exchange, then
//!    removal/finish holds, then clamp to `[0, finish_line]`.
//! 4. Populate per-horse `active_events` from the windows covering the tick.

use serde::Serialize;

use crate::catalog::{
    EventCatalog, AERIAL_DUEL, BOMB_THROW, CHAIN_REACTION, CHAIN_STUN, HOOK_SHOT, LUCK_CHARM,
    POSITION_SWAP, ROCKET_BOOST, UFO_ABDUCTION,
};
use crate::path::BasePaths;
use crate::rng::hash32;
use crate::schedule::{EventInstance, EventTimeline};
use crate::{HorseSeed, RaceConfig, Tick};

/// Instant backward offset of a hook shot, meters.
pub const HOOK_SHOT_SETBACK_M: f64 = 15.0;

/// Instant forward offset of a rocket boost, meters.
pub const ROCKET_BOOST_SURGE_M: f64 = 20.0;

/// Length of the global stun a chain reaction applies.
pub const CHAIN_STUN_TICKS: Tick = 20;

// ============================================================================
// Final State Matrix
// ============================================================================

/// State of one horse at one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorseTickState {
    pub horse_id: String,
    pub position: f64,
    pub lane: u8,
    pub speed: f64,
    pub is_stunned: bool,
    pub is_removed: bool,
    /// Active-window ids covering this tick for this horse, sorted.
    pub active_events: Vec<String>,
}

/// The canonical final state matrix: one slice per tick, one entry per horse,
/// horse order identical across all ticks. Frozen at construction; only
/// shared references are handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceMatrix {
    ticks: Vec<Vec<HorseTickState>>,
}

impl RaceMatrix {
    /// Test-only constructor for exercising validation paths.
    #[cfg(test)]
    pub(crate) fn from_ticks(ticks: Vec<Vec<HorseTickState>>) -> Self {
        Self { ticks }
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.len()
    }

    /// States at `tick`, in horse order. Empty slice past the end.
    pub fn tick_states(&self, tick: Tick) -> &[HorseTickState] {
        self.ticks
            .get(tick as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ascending iteration over all tick slices.
    pub fn iter(&self) -> impl Iterator<Item = (Tick, &[HorseTickState])> + '_ {
        self.ticks
            .iter()
            .enumerate()
            .map(|(t, s)| (t as Tick, s.as_slice()))
    }

    /// Positions at `tick`, in horse order (compact form for frames and
    /// persisted artifacts).
    pub fn positions_at(&self, tick: Tick) -> Vec<f64> {
        self.tick_states(tick).iter().map(|s| s.position).collect()
    }
}

// ============================================================================
// Internal bookkeeping
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Targets {
    All,
    Field(Vec<usize>),
}

impl Targets {
    fn covers(&self, horse: usize) -> bool {
        match self {
            Self::All => true,
            Self::Field(indices) => indices.contains(&horse),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveWindow {
    label: String,
    start: Tick,
    end: Tick,
    targets: Targets,
}

impl ActiveWindow {
    fn covers(&self, tick: Tick) -> bool {
        self.start <= tick && tick <= self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct SwapWindow {
    a: usize,
    b: usize,
    start: Tick,
    end: Tick,
}

/// Deterministic target pick: `hash32(instance_id || salt) mod n`.
fn pick_index(instance_id: &str, salt: char, n: usize) -> usize {
    hash32(format!("{instance_id}{salt}").as_bytes()) as usize % n
}

/// Second distinct target, with a `+1` skip on collision.
fn pick_partner(instance_id: &str, first: usize, n: usize) -> usize {
    let second = pick_index(instance_id, 'B', n);
    if second == first {
        (second + 1) % n
    } else {
        second
    }
}

struct FoldState {
    stun_end: Vec<Option<Tick>>,
    removed_at: Vec<Option<Tick>>,
    windows: Vec<ActiveWindow>,
    swaps: Vec<SwapWindow>,
}

impl FoldState {
    fn new(n: usize) -> Self {
        Self {
            stun_end: vec![None; n],
            removed_at: vec![None; n],
            windows: Vec::new(),
            swaps: Vec::new(),
        }
    }

    fn is_removed(&self, horse: usize, tick: Tick) -> bool {
        self.removed_at[horse].is_some_and(|r| r <= tick)
    }

    fn is_stunned(&self, horse: usize, tick: Tick) -> bool {
        self.stun_end[horse].is_some_and(|end| tick <= end)
    }

    fn charm_active(&self, horse: usize, tick: Tick) -> bool {
        self.windows
            .iter()
            .any(|w| w.label == LUCK_CHARM && w.covers(tick) && w.targets.covers(horse))
    }

    /// Luck-charm rerouting for negative effects: when the picked horse has
    /// an active charm window, advance by 1 modulo `n` until a non-removed
    /// horse is found; if none exists, the original target is used. Charm
    /// status of the candidates does not extend the search.
    fn reroute_negative(&self, original: usize, tick: Tick, n: usize) -> usize {
        if !self.charm_active(original, tick) {
            return original;
        }
        for step in 1..n {
            let candidate = (original + step) % n;
            if !self.is_removed(candidate, tick) {
                return candidate;
            }
        }
        original
    }

    fn push_window(&mut self, label: &str, start: Tick, end: Tick, targets: Targets) {
        self.windows.push(ActiveWindow {
            label: label.to_string(),
            start,
            end,
            targets,
        });
    }

    fn extend_stun(&mut self, horse: usize, end: Tick) {
        let new_end = match self.stun_end[horse] {
            Some(old) => old.max(end),
            None => end,
        };
        self.stun_end[horse] = Some(new_end);
    }
}

// ============================================================================
// Application
// ============================================================================

/// Overlay the event timeline onto base paths.
///
/// Returns the canonical final state matrix; see the crate root for the
/// invariants it upholds.
pub fn apply_events(
    config: &RaceConfig,
    horses: &[HorseSeed],
    paths: &BasePaths,
    timeline: &EventTimeline,
    catalog: &EventCatalog,
) -> RaceMatrix {
    let n = horses.len();
    let total = config.total_ticks();
    let finish_line = config.finish_line();
    let dt = config.dt_s();
    let last_tick = total - 1;

    let mut state = FoldState::new(n);
    let mut prev_positions = vec![0.0f64; n];
    let mut ticks: Vec<Vec<HorseTickState>> = Vec::with_capacity(total as usize);

    for t in 0..total {
        // Step 1: events at this tick, catalog order then instance id.
        let mut events: Vec<&EventInstance> = timeline.events_at(t).iter().collect();
        events.sort_by(|a, b| {
            catalog
                .index_of(&a.id)
                .cmp(&catalog.index_of(&b.id))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        // Step 2: apply each event.
        let mut offsets = vec![0.0f64; n];
        for event in events {
            let Some(def) = catalog.get(&event.id) else {
                // Unknown id in a stubbed timeline: ignore.
                continue;
            };
            let window_end = (t + def.duration_ticks).min(last_tick);

            match event.id.as_str() {
                HOOK_SHOT => {
                    let target =
                        state.reroute_negative(pick_index(&event.instance_id, 'A', n), t, n);
                    offsets[target] -= HOOK_SHOT_SETBACK_M;
                    state.push_window(HOOK_SHOT, t, t, Targets::Field(vec![target]));
                }
                ROCKET_BOOST => {
                    let target = pick_index(&event.instance_id, 'A', n);
                    offsets[target] += ROCKET_BOOST_SURGE_M;
                    state.push_window(ROCKET_BOOST, t, t, Targets::Field(vec![target]));
                }
                BOMB_THROW => {
                    let target =
                        state.reroute_negative(pick_index(&event.instance_id, 'A', n), t, n);
                    state.extend_stun(target, window_end);
                    state.push_window(BOMB_THROW, t, window_end, Targets::Field(vec![target]));
                }
                POSITION_SWAP => {
                    let a = pick_index(&event.instance_id, 'A', n);
                    let b = pick_partner(&event.instance_id, a, n);
                    state.swaps.push(SwapWindow {
                        a,
                        b,
                        start: t,
                        end: window_end,
                    });
                    state.push_window(POSITION_SWAP, t, window_end, Targets::Field(vec![a, b]));
                }
                UFO_ABDUCTION => {
                    let target =
                        state.reroute_negative(pick_index(&event.instance_id, 'A', n), t, n);
                    if state.removed_at[target].is_none() {
                        state.removed_at[target] = Some(t);
                    }
                    state.push_window(UFO_ABDUCTION, t, last_tick, Targets::Field(vec![target]));
                }
                CHAIN_REACTION => {
                    // Global stun of everything still in the race; the
                    // stun is labeled separately from the event window.
                    let stun_end = (t + CHAIN_STUN_TICKS).min(last_tick);
                    let survivors: Vec<usize> =
                        (0..n).filter(|&h| !state.is_removed(h, t)).collect();
                    for &h in &survivors {
                        state.extend_stun(h, stun_end);
                    }
                    state.push_window(CHAIN_STUN, t, stun_end, Targets::Field(survivors));
                    state.push_window(CHAIN_REACTION, t, window_end, Targets::All);
                }
                LUCK_CHARM => {
                    let target = pick_index(&event.instance_id, 'A', n);
                    state.push_window(LUCK_CHARM, t, window_end, Targets::Field(vec![target]));
                }
                AERIAL_DUEL => {
                    let a = pick_index(&event.instance_id, 'A', n);
                    let b = pick_partner(&event.instance_id, a, n);
                    state.push_window(AERIAL_DUEL, t, window_end, Targets::Field(vec![a, b]));
                }
                _ => {
                    // Marker event: active window only, no motion effect.
                    let targets = if def.affects_multiple_horses {
                        Targets::All
                    } else {
                        Targets::Field(vec![pick_index(&event.instance_id, 'A', n)])
                    };
                    state.push_window(&event.id, t, window_end, targets);
                }
            }
        }

        // Step 3a: per-horse tentative positions.
        let mut tentative = vec![0.0f64; n];
        for h in 0..n {
            let prev = prev_positions[h];
            let base = &paths.horses[h].positions;
            let base_delta = if t == 0 {
                0.0
            } else {
                base[t as usize] - base[(t - 1) as usize]
            };
            let move_delta = if state.is_stunned(h, t) { 0.0 } else { base_delta };
            tentative[h] = (prev + move_delta + offsets[h]).max(0.0);
        }

        // Step 3b: swap-window exchange of tentative position and lane.
        let mut lanes: Vec<u8> = paths.horses.iter().map(|p| p.lane).collect();
        for swap in &state.swaps {
            if swap.start <= t && t <= swap.end {
                tentative.swap(swap.a, swap.b);
                lanes.swap(swap.a, swap.b);
            }
        }

        // Step 3c: removal/finish holds, clamp, realized speed.
        let mut slice = Vec::with_capacity(n);
        for h in 0..n {
            let prev = prev_positions[h];
            let removed = state.is_removed(h, t);
            let stunned = state.is_stunned(h, t);

            let position = if removed {
                prev
            } else if prev >= finish_line {
                finish_line
            } else {
                tentative[h].min(finish_line)
            };

            let speed = if t == 0 || removed {
                0.0
            } else {
                ((position - prev) / dt).max(0.0)
            };

            // Step 4: active windows covering this horse at this tick.
            let mut active_events: Vec<String> = state
                .windows
                .iter()
                .filter(|w| w.covers(t) && w.targets.covers(h))
                .map(|w| w.label.clone())
                .collect();
            active_events.sort();
            active_events.dedup();

            slice.push(HorseTickState {
                horse_id: horses[h].id.clone(),
                position,
                lane: lanes[h],
                speed,
                is_stunned: stunned,
                is_removed: removed,
                active_events,
            });
        }

        for (h, entry) in slice.iter().enumerate() {
            prev_positions[h] = entry.position;
        }
        ticks.push(slice);
    }

    RaceMatrix { ticks }
}

// ============================================================================
// Tests
// ============================================================================
