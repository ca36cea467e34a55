//! Event catalog: the process-wide, immutable set of event definitions.
//!
//! Catalog order is semantic: it is the application order used when several
//! events fire on the same tick, and the candidate-generation order of the
//! scheduler. Conflict relations must be symmetric; [`EventCatalog::validate`]
//! symmetrizes the relation and reports every asymmetry as a warning so a
//! miswritten catalog fails loudly at build time instead of biasing placement.

use serde::{Deserialize, Serialize};

use crate::Tick;

// Well-known event ids.
pub const ROCKET_BOOST: &str = "rocket_boost";
pub const LUCK_CHARM: &str = "luck_charm";
pub const HOOK_SHOT: &str = "hook_shot";
pub const BOMB_THROW: &str = "bomb_throw";
pub const AERIAL_DUEL: &str = "aerial_duel";
pub const POSITION_SWAP: &str = "position_swap";
pub const UFO_ABDUCTION: &str = "ufo_abduction";
pub const CHAIN_REACTION: &str = "chain_reaction";
pub const HEAD_WIND: &str = "head_wind";
pub const MUD_PATCH: &str = "mud_patch";
pub const CROWD_SURGE: &str = "crowd_surge";

/// Label exposed in `active_events` for the global stun that
/// `chain_reaction` applies, kept distinct from the event's own window.
pub const CHAIN_STUN: &str = "chain_stun";

/// Event category. `Meta` folds into `Chaos` for pacing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Powerup,
    Combat,
    Environmental,
    Chaos,
    Meta,
}

impl EventCategory {
    /// Pacing bucket index (powerup, combat, environmental, chaos).
    pub fn pacing_bucket(self) -> usize {
        match self {
            Self::Powerup => 0,
            Self::Combat => 1,
            Self::Environmental => 2,
            Self::Chaos | Self::Meta => 3,
        }
    }
}

/// One catalog entry. Immutable process-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDef {
    pub id: String,
    pub category: EventCategory,
    /// Active-window length in ticks; 0 for instantaneous effects.
    pub duration_ticks: Tick,
    pub max_occurrences_per_race: u32,
    /// Cap on same-id active windows overlapping any single tick.
    pub max_concurrent: u32,
    /// Ids this event may not share a tick with. Must be symmetric; see
    /// [`EventCatalog::validate`].
    pub conflicts_with: Vec<String>,
    pub affects_multiple_horses: bool,
    pub removes_horse: bool,
    /// Declares that stacked same-id windows on one horse confer nothing
    /// extra; overlapping windows simply merge in `active_events`.
    pub exclusive_per_horse: bool,
}

impl EventDef {
    fn new(id: &str, category: EventCategory) -> Self {
        Self {
            id: id.to_string(),
            category,
            duration_ticks: 0,
            max_occurrences_per_race: 1,
            max_concurrent: 1,
            conflicts_with: Vec::new(),
            affects_multiple_horses: false,
            removes_horse: false,
            exclusive_per_horse: false,
        }
    }

    fn duration(mut self, ticks: Tick) -> Self {
        self.duration_ticks = ticks;
        self
    }

    fn occurrences(mut self, n: u32) -> Self {
        self.max_occurrences_per_race = n;
        self
    }

    fn concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = n;
        self
    }

    fn conflicts(mut self, ids: &[&str]) -> Self {
        self.conflicts_with = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn multi(mut self) -> Self {
        self.affects_multiple_horses = true;
        self
    }

    fn removes(mut self) -> Self {
        self.removes_horse = true;
        self
    }

    fn exclusive(mut self) -> Self {
        self.exclusive_per_horse = true;
        self
    }
}

/// Ordered event catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCatalog {
    entries: Vec<EventDef>,
}

impl EventCatalog {
    /// Build a catalog from explicit entries (tests and stubs).
    pub fn with_entries(entries: Vec<EventDef>) -> Self {
        Self { entries }
    }

    /// The shipped catalog.
    ///
    /// `aerial_duel` deliberately declares a conflict with `head_wind` that
    /// `head_wind` does not reciprocate; `validate` repairs and reports it.
    pub fn default_catalog() -> Self {
        use EventCategory::*;

        Self {
            entries: vec![
                EventDef::new(ROCKET_BOOST, Powerup).occurrences(4).concurrent(2),
                EventDef::new(LUCK_CHARM, Powerup)
                    .duration(60)
                    .occurrences(3)
                    .concurrent(2)
                    .exclusive(),
                EventDef::new(HOOK_SHOT, Combat).occurrences(4).concurrent(2),
                EventDef::new(BOMB_THROW, Combat)
                    .duration(30)
                    .occurrences(3)
                    .conflicts(&[CHAIN_REACTION]),
                EventDef::new(AERIAL_DUEL, Combat)
                    .duration(15)
                    .occurrences(2)
                    .conflicts(&[HEAD_WIND])
                    .multi(),
                EventDef::new(POSITION_SWAP, Chaos)
                    .duration(40)
                    .occurrences(2)
                    .conflicts(&[UFO_ABDUCTION])
                    .multi(),
                EventDef::new(UFO_ABDUCTION, Chaos)
                    .conflicts(&[POSITION_SWAP])
                    .removes(),
                EventDef::new(CHAIN_REACTION, Meta)
                    .duration(20)
                    .conflicts(&[BOMB_THROW])
                    .multi(),
                EventDef::new(HEAD_WIND, Environmental)
                    .duration(50)
                    .occurrences(2)
                    .multi(),
                EventDef::new(MUD_PATCH, Environmental)
                    .duration(35)
                    .occurrences(2)
                    .multi(),
                EventDef::new(CROWD_SURGE, Environmental)
                    .duration(25)
                    .occurrences(2)
                    .concurrent(2)
                    .multi(),
            ],
        }
    }

    /// Entries in catalog order.
    pub fn entries(&self) -> &[EventDef] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of an id in catalog order.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&EventDef> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Validate and repair the catalog.
    ///
    /// Returns the catalog with a symmetrized, sorted, deduplicated conflict
    /// relation, plus one warning per repair:
    /// - a conflict edge whose reverse is missing (added), or
    /// - a conflict referencing an unknown id (dropped).
    pub fn validate(mut self) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let known: Vec<String> = self.entries.iter().map(|e| e.id.clone()).collect();

        // Drop unknown conflict targets first.
        for entry in &mut self.entries {
            entry.conflicts_with.retain(|target| {
                let ok = known.contains(target);
                if !ok {
                    warnings.push(format!(
                        "catalog: {} conflicts with unknown id {target}; dropped",
                        entry.id
                    ));
                }
                ok
            });
        }

        // Symmetrize: every surviving edge gets its reverse.
        let edges: Vec<(String, String)> = self
            .entries
            .iter()
            .flat_map(|e| {
                e.conflicts_with
                    .iter()
                    .map(|t| (e.id.clone(), t.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (from, to) in edges {
            let reverse_present = self
                .get(&to)
                .map(|e| e.conflicts_with.contains(&from))
                .unwrap_or(false);
            if !reverse_present {
                warnings.push(format!(
                    "catalog: conflict {from} -> {to} is asymmetric; added reverse edge"
                ));
                if let Some(entry) = self.entries.iter_mut().find(|e| e.id == to) {
                    entry.conflicts_with.push(from);
                }
            }
        }

        for entry in &mut self.entries {
            entry.conflicts_with.sort();
            entry.conflicts_with.dedup();
        }

        (self, warnings)
    }
}
