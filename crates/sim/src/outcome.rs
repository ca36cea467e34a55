//! Outcome derivation and the canonical race checksum.
//!
//! The final state matrix is the single source of truth for placement: the
//! first tick at which any horse sits on the finish line decides the race,
//! and ties break to the lexicographically smallest horse id. The path
//! builder's interpolated crossing times are reference data only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::apply::RaceMatrix;
use crate::schedule::EventTimeline;
use crate::{HorseSeed, RaceConfig, Tick};

/// Comparison slack for clamped finish-line positions.
const FINISH_EPS: f64 = 1e-9;

/// Derived race outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceOutcome {
    pub winner_id: String,
    /// Every horse id, best placement first.
    pub finish_order: Vec<String>,
    /// Milliseconds from race start, finishers only, keyed by horse id.
    pub finish_times_ms: BTreeMap<String, f64>,
    /// Tick at which the race was decided (last tick if nobody finished).
    pub finish_tick_index: Tick,
    /// SHA-256 over the canonical race document, hex.
    pub checksum: String,
}

/// Derive the outcome from the frozen matrix.
pub fn derive_outcome(
    config: &RaceConfig,
    horses: &[HorseSeed],
    matrix: &RaceMatrix,
    timeline: &EventTimeline,
) -> RaceOutcome {
    let finish_line = config.finish_line();
    let last_tick = config.total_ticks() - 1;

    // First tick each horse reaches the line, if any.
    let first_finish: Vec<Option<Tick>> = (0..horses.len())
        .map(|h| {
            (0..config.total_ticks())
                .find(|&t| matrix.tick_states(t)[h].position >= finish_line - FINISH_EPS)
        })
        .collect();

    let winning_tick = first_finish.iter().flatten().copied().min();

    let (winner_id, finish_tick_index) = match winning_tick {
        Some(tick) => {
            // Horses are in ascending id order, so the first hit is the
            // lexicographically smallest id at the winning tick.
            let winner = horses
                .iter()
                .zip(&first_finish)
                .find(|(_, f)| **f == Some(tick))
                .map(|(h, _)| h.id.clone())
                .expect("winning tick implies a finisher");
            (winner, tick)
        }
        None => {
            // Nobody reached the line inside the grid: furthest position at
            // the last tick wins, ties to the smallest id.
            let winner = horses
                .iter()
                .enumerate()
                .max_by(|(ai, a), (bi, b)| {
                    let pa = matrix.tick_states(last_tick)[*ai].position;
                    let pb = matrix.tick_states(last_tick)[*bi].position;
                    pa.total_cmp(&pb).then_with(|| b.id.cmp(&a.id))
                })
                .map(|(_, h)| h.id.clone())
                .expect("field is non-empty");
            (winner, last_tick)
        }
    };

    // Placement: finishers by crossing tick then id, stragglers by final
    // position descending then id.
    let mut order: Vec<usize> = (0..horses.len()).collect();
    order.sort_by(|&a, &b| match (first_finish[a], first_finish[b]) {
        (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| horses[a].id.cmp(&horses[b].id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => {
            let pa = matrix.tick_states(last_tick)[a].position;
            let pb = matrix.tick_states(last_tick)[b].position;
            pb.total_cmp(&pa).then_with(|| horses[a].id.cmp(&horses[b].id))
        }
    });
    let finish_order: Vec<String> = order.iter().map(|&h| horses[h].id.clone()).collect();

    let finish_times_ms: BTreeMap<String, f64> = horses
        .iter()
        .zip(&first_finish)
        .filter_map(|(horse, finish)| {
            finish.map(|t| (horse.id.clone(), f64::from(t) * config.tick_ms as f64))
        })
        .collect();

    let checksum = race_checksum(
        config,
        horses,
        matrix,
        timeline,
        &finish_order,
        &finish_times_ms,
    );

    RaceOutcome {
        winner_id,
        finish_order,
        finish_times_ms,
        finish_tick_index,
        checksum,
    }
}

/// SHA-256 over the canonical race document.
///
/// The document is JSON with sorted keys: race id, seed, horse seeds (in id
/// order), first- and last-tick positions, total tick count, finish order,
/// finish times keyed by horse id, and a secondary hash over the serialized
/// timeline (`tick:id|instanceId,…;` form).
pub fn race_checksum(
    config: &RaceConfig,
    horses: &[HorseSeed],
    matrix: &RaceMatrix,
    timeline: &EventTimeline,
    finish_order: &[String],
    finish_times_ms: &BTreeMap<String, f64>,
) -> String {
    let timeline_hash = hex_sha256(timeline.canonical_string().as_bytes());

    let document = json!({
        "raceId": config.race_id,
        "seed": config.seed,
        "horses": horses,
        "firstTick": matrix.positions_at(0),
        "lastTick": matrix.positions_at(config.total_ticks() - 1),
        "totalTicks": config.total_ticks(),
        "finishOrder": finish_order,
        "finishTimesMs": finish_times_ms,
        "eventTimelineHash": timeline_hash,
    });

    let canonical = serde_json::to_string(&document).expect("checksum document serializes");
    hex_sha256(canonical.as_bytes())
}

fn hex_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precompute_race;

    fn race() -> crate::PrecomputedRace {
        precompute_race(RaceConfig::new("race-1", "cycle-1")).expect("precompute")
    }

    /// The winner is the smallest id among the earliest finishers, verified
    /// by an independent matrix scan.
    #[test]
    fn test_winner_matches_matrix_scan() {
        let race = race();
        let finish = race.config.finish_line();

        let mut earliest: Option<(Tick, String)> = None;
        for t in 0..race.config.total_ticks() {
            for state in race.matrix.tick_states(t) {
                if state.position >= finish - 1e-9 {
                    match &earliest {
                        Some((tick, id)) if *tick < t || (*tick == t && *id <= state.horse_id) => {}
                        _ => earliest = Some((t, state.horse_id.clone())),
                    }
                }
            }
            if earliest.is_some() {
                break;
            }
        }

        if let Some((tick, id)) = earliest {
            assert_eq!(race.outcome.winner_id, id);
            assert_eq!(race.outcome.finish_tick_index, tick);
            assert_eq!(race.outcome.finish_order[0], race.outcome.winner_id);
        }
    }

    #[test]
    fn test_finish_order_is_a_permutation() {
        let race = race();
        let mut order = race.outcome.finish_order.clone();
        order.sort();
        let mut ids: Vec<String> = race.horses.iter().map(|h| h.id.clone()).collect();
        ids.sort();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_finish_times_match_first_crossing() {
        let race = race();
        let finish = race.config.finish_line();

        for (id, &ms) in &race.outcome.finish_times_ms {
            let h = race.horses.iter().position(|x| &x.id == id).unwrap();
            let first = (0..race.config.total_ticks())
                .find(|&t| race.matrix.tick_states(t)[h].position >= finish - 1e-9)
                .expect("finish time implies a crossing");
            assert_eq!(ms, f64::from(first) * race.config.tick_ms as f64);
        }
    }

    #[test]
    fn test_checksum_deterministic_and_seed_sensitive() {
        let a = race();
        let b = race();
        assert_eq!(a.outcome.checksum, b.outcome.checksum);

        let other =
            precompute_race(RaceConfig::new("race-2", "cycle-2")).expect("precompute");
        assert_ne!(a.outcome.checksum, other.outcome.checksum);
    }

    /// Checksum inputs survive a JSON round trip bit-for-bit.
    #[test]
    fn test_checksum_stable_across_serialization() {
        let race = race();

        let horses_json = serde_json::to_string(&race.horses).unwrap();
        let horses_back: Vec<HorseSeed> = serde_json::from_str(&horses_json).unwrap();
        assert_eq!(race.horses, horses_back);

        let times_json = serde_json::to_string(&race.outcome.finish_times_ms).unwrap();
        let times_back: BTreeMap<String, f64> = serde_json::from_str(&times_json).unwrap();

        let instances_json = serde_json::to_string(&race.timeline.instances()).unwrap();
        let instances_back: Vec<crate::EventInstance> =
            serde_json::from_str(&instances_json).unwrap();
        let timeline_back =
            EventTimeline::from_instances(race.config.total_ticks(), instances_back);

        let recomputed = race_checksum(
            &race.config,
            &horses_back,
            &race.matrix,
            &timeline_back,
            &race.outcome.finish_order,
            &times_back,
        );
        assert_eq!(race.outcome.checksum, recomputed);
    }

    /// When nobody reaches the line, the furthest horse wins at the last
    /// tick and no finish times are recorded.
    #[test]
    fn test_no_finisher_fallback() {
        let mut config = RaceConfig::new("race-short", "cycle-short");
        config.duration_ms = 1_000; // one second: nowhere near the line
        let race = precompute_race(config).expect("precompute");

        assert!(race.outcome.finish_times_ms.is_empty());
        assert_eq!(
            race.outcome.finish_tick_index,
            race.config.total_ticks() - 1
        );

        let last = race.config.total_ticks() - 1;
        let best = race
            .matrix
            .tick_states(last)
            .iter()
            .max_by(|a, b| {
                a.position
                    .total_cmp(&b.position)
                    .then_with(|| b.horse_id.cmp(&a.horse_id))
            })
            .unwrap();
        assert_eq!(race.outcome.winner_id, best.horse_id);
    }
}
