//! Event scheduling: deterministic, constraint-valid event placement.
//!
//! Placement rules, applied greedily over candidates sorted by
//! `(tick asc, weight desc, insertion asc)`:
//! - Minimum spacing: successive placed instances of one id sit at least
//!   [`MIN_SPACING_TICKS`] apart.
//! - Concurrency cap: same-id active windows overlapping any one tick never
//!   exceed the catalog's `max_concurrent`.
//! - Conflict symmetry: no two instances with conflicting ids share a tick.
//!
//! Rejected candidates are dropped without retry. The result is an
//! [`EventTimeline`]: tick-indexed slices, iterable in ascending tick order,
//! with no mutation API.

use serde::{Deserialize, Serialize};

use crate::catalog::EventCatalog;
use crate::rng::{hash32, SeededRng};
use crate::{RaceConfig, Tick};

/// Minimum tick distance between successive instances of the same event id.
pub const MIN_SPACING_TICKS: Tick = 15;

/// One placed event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInstance {
    /// Catalog event id.
    pub id: String,
    /// Tick index the instance starts at.
    pub tick: Tick,
    /// Deterministic identity: stable across identical seeds.
    pub instance_id: String,
}

// ============================================================================
// Pacing
// ============================================================================

/// One race phase: covers `[start of previous, until_pct)` of the race and
/// assigns a weight per pacing bucket (powerup, combat, environmental, chaos).
#[derive(Debug, Clone, PartialEq)]
pub struct PacingPhase {
    pub until_pct: f64,
    pub weights: [u32; 4],
}

/// Phase plan plus the optional linear ramp that blends adjacent phase
/// weights within a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingPlan {
    phases: Vec<PacingPhase>,
    ramp: bool,
}

impl PacingPlan {
    /// Defaults: an early phase without chaos, a combat-heavy middle, a
    /// chaos-leaning finale. Ramp off.
    pub fn default_plan() -> Self {
        Self {
            phases: vec![
                PacingPhase {
                    until_pct: 0.30,
                    weights: [3, 1, 2, 0],
                },
                PacingPhase {
                    until_pct: 0.70,
                    weights: [2, 3, 2, 2],
                },
                PacingPhase {
                    until_pct: 1.00,
                    weights: [1, 2, 1, 3],
                },
            ],
            ramp: false,
        }
    }

    pub fn with_ramp(mut self, ramp: bool) -> Self {
        self.ramp = ramp;
        self
    }

    /// Weight for a pacing bucket at race fraction `frac` in [0, 1).
    pub fn weight_at(&self, frac: f64, bucket: usize) -> f64 {
        let mut start = 0.0;
        for (i, phase) in self.phases.iter().enumerate() {
            if frac < phase.until_pct || i == self.phases.len() - 1 {
                let own = f64::from(phase.weights[bucket]);
                if !self.ramp {
                    return own;
                }
                let Some(next) = self.phases.get(i + 1) else {
                    return own;
                };
                let width = phase.until_pct - start;
                let local = if width > 0.0 { (frac - start) / width } else { 0.0 };
                let next_w = f64::from(next.weights[bucket]);
                return own + (next_w - own) * local.clamp(0.0, 1.0);
            }
            start = phase.until_pct;
        }
        0.0
    }
}

// ============================================================================
// Timeline
// ============================================================================

/// Immutable mapping from tick index to the insertion-ordered event
/// instances starting at that tick.
///
/// Backed by a dense tick-indexed array of slices; iteration is ascending by
/// construction and does not rely on any hash-map ordering. No mutating
/// method exists: the timeline is frozen at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTimeline {
    total_ticks: Tick,
    slots: Vec<Vec<EventInstance>>,
}

impl EventTimeline {
    /// Build a timeline from explicit instances (artifact reload, pinned
    /// test events). Instances keep their relative order within a tick;
    /// out-of-grid ticks are clamped to the last tick.
    pub fn from_instances(total_ticks: Tick, instances: Vec<EventInstance>) -> Self {
        let mut slots = vec![Vec::new(); total_ticks as usize];
        for mut instance in instances {
            instance.tick = instance.tick.min(total_ticks - 1);
            slots[instance.tick as usize].push(instance);
        }
        Self { total_ticks, slots }
    }

    pub fn total_ticks(&self) -> Tick {
        self.total_ticks
    }

    /// Instances starting at `tick`, in insertion order.
    pub fn events_at(&self, tick: Tick) -> &[EventInstance] {
        self.slots
            .get(tick as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ascending iteration over non-empty ticks.
    pub fn iter(&self) -> impl Iterator<Item = (Tick, &[EventInstance])> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(tick, v)| (tick as Tick, v.as_slice()))
    }

    /// All instances in ascending tick order (flattened copy, for artifacts).
    pub fn instances(&self) -> Vec<EventInstance> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn instance_count(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Canonical serialization used by the race checksum:
    /// `tick:id|instanceId,id|instanceId;…` with ticks ascending and the
    /// inner pairs sorted lexicographically.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (tick, instances) in self.iter() {
            let mut pairs: Vec<String> = instances
                .iter()
                .map(|i| format!("{}|{}", i.id, i.instance_id))
                .collect();
            pairs.sort();
            out.push_str(&format!("{tick}:{};", pairs.join(",")));
        }
        out
    }
}

// ============================================================================
// Scheduling
// ============================================================================

#[derive(Debug, Clone)]
struct Candidate {
    def_index: usize,
    tick: Tick,
    weight: f64,
    insertion: u32,
}

/// Produce the deterministic event timeline for a race.
///
/// RNG contract: consumes the `timeline` role, exactly one draw per
/// candidate, iterating the catalog in order and each entry's occurrence
/// budget in order.
pub fn schedule_events(
    config: &RaceConfig,
    catalog: &EventCatalog,
    plan: &PacingPlan,
) -> EventTimeline {
    let mut rng = SeededRng::for_role(&config.seed, "timeline");
    let total = config.total_ticks();
    let seed_u32 = config.seed_u32();

    // Candidate generation: every entry gets its full occurrence budget.
    let mut candidates = Vec::new();
    let mut insertion = 0u32;
    for (def_index, def) in catalog.entries().iter().enumerate() {
        for _ in 0..def.max_occurrences_per_race {
            let draw = rng.next_f64();
            let tick = ((draw * f64::from(total)) as Tick).min(total - 1);
            let frac = f64::from(tick) / f64::from(total);
            let weight = plan.weight_at(frac, def.category.pacing_bucket());
            candidates.push(Candidate {
                def_index,
                tick,
                weight,
                insertion,
            });
            insertion += 1;
        }
    }

    // Zero-weight candidates never reach placement.
    candidates.retain(|c| c.weight > 0.0);

    candidates.sort_by(|a, b| {
        a.tick
            .cmp(&b.tick)
            .then_with(|| b.weight.total_cmp(&a.weight))
            .then_with(|| a.insertion.cmp(&b.insertion))
    });

    // Greedy placement under spacing / concurrency / conflict rules.
    let mut placed_ticks: Vec<Vec<Tick>> = vec![Vec::new(); catalog.len()];
    let mut slots: Vec<Vec<EventInstance>> = vec![Vec::new(); total as usize];

    for c in candidates {
        let def = &catalog.entries()[c.def_index];

        // Minimum spacing against the latest same-id placement.
        if let Some(&last) = placed_ticks[c.def_index].last() {
            if c.tick - last < MIN_SPACING_TICKS {
                continue;
            }
        }

        // Concurrency cap: same-id windows still covering this tick.
        let overlapping = placed_ticks[c.def_index]
            .iter()
            .filter(|&&p| p + def.duration_ticks >= c.tick)
            .count() as u32;
        if overlapping + 1 > def.max_concurrent {
            continue;
        }

        // Conflict check against everything already on this exact tick,
        // in both directions.
        let conflicted = slots[c.tick as usize].iter().any(|placed| {
            let other = catalog.get(&placed.id).expect("placed id is in catalog");
            def.conflicts_with.contains(&other.id) || other.conflicts_with.contains(&def.id)
        });
        if conflicted {
            continue;
        }

        let occurrence = placed_ticks[c.def_index].len() as u32;
        let instance_id = format!(
            "evt-{:08x}",
            hash32(format!("{seed_u32}|{}|{}|{occurrence}", def.id, c.tick).as_bytes())
        );

        placed_ticks[c.def_index].push(c.tick);
        slots[c.tick as usize].push(EventInstance {
            id: def.id.clone(),
            tick: c.tick,
            instance_id,
        });
    }

    EventTimeline {
        total_ticks: total,
        slots,
    }
}
