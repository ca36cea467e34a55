//! Engine counters exposed through `/metrics`.
//!
//! Writers touch atomics only; the snapshot is assembled on read. Per-race
//! series (drops, latest seq) keep a bounded retention window in true
//! insertion order, the same discipline the replay crate's history uses.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Number of per-race series kept before evicting the oldest.
const RACE_SERIES_CAP: usize = 20;

/// Bounded per-race value series. Eviction follows insertion order; race id
/// strings are not ordered chronologically (`race-cycle-10` sorts before
/// `race-cycle-2`), so key order must never decide who falls off.
#[derive(Debug, Default)]
struct RaceSeries {
    values: BTreeMap<String, u64>,
    order: VecDeque<String>,
}

impl RaceSeries {
    fn slot(&mut self, race_id: &str) -> &mut u64 {
        if !self.values.contains_key(race_id) {
            self.order.push_back(race_id.to_string());
            if self.order.len() > RACE_SERIES_CAP {
                if let Some(oldest) = self.order.pop_front() {
                    self.values.remove(&oldest);
                }
            }
        }
        self.values.entry(race_id.to_string()).or_insert(0)
    }

    fn get(&self, race_id: &str) -> Option<u64> {
        self.values.get(race_id).copied()
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.clone()
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    ticks_emitted: AtomicU64,
    drift_warnings: AtomicU64,
    last_drift_us: AtomicI64,
    max_drift_us: AtomicI64,
    subscriber_count: AtomicUsize,
    precompute_ms_last: AtomicU64,
    dropped_by_race: Mutex<RaceSeries>,
    latest_seq_by_race: Mutex<RaceSeries>,
}

/// Point-in-time metrics view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub tick_ms: u64,
    pub ticks_emitted: u64,
    pub drift_warnings: u64,
    pub last_drift_us: i64,
    pub max_drift_us: i64,
    pub subscriber_count: usize,
    pub precompute_ms_last: u64,
    pub dropped_tick_frames: BTreeMap<String, u64>,
    pub latest_seq: BTreeMap<String, u64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record measured drift (signed, microseconds); `warned` marks drifts
    /// beyond the warning threshold.
    pub fn record_drift(&self, drift_us: i64, warned: bool) {
        self.last_drift_us.store(drift_us, Ordering::Relaxed);
        self.max_drift_us.fetch_max(drift_us.abs(), Ordering::Relaxed);
        if warned {
            self.drift_warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_precompute_ms(&self, ms: u64) {
        self.precompute_ms_last.store(ms, Ordering::Relaxed);
    }

    pub fn subscriber_joined(&self) {
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_left(&self) {
        self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_dropped_tick_frame(&self, race_id: &str) {
        let mut series = self.dropped_by_race.lock().expect("metrics lock");
        *series.slot(race_id) += 1;
    }

    pub fn record_seq(&self, race_id: &str, seq: u64) {
        let mut series = self.latest_seq_by_race.lock().expect("metrics lock");
        *series.slot(race_id) = seq;
    }

    pub fn dropped_for(&self, race_id: &str) -> u64 {
        self.dropped_by_race
            .lock()
            .expect("metrics lock")
            .get(race_id)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, tick_ms: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            tick_ms,
            ticks_emitted: self.ticks_emitted.load(Ordering::Relaxed),
            drift_warnings: self.drift_warnings.load(Ordering::Relaxed),
            last_drift_us: self.last_drift_us.load(Ordering::Relaxed),
            max_drift_us: self.max_drift_us.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
            precompute_ms_last: self.precompute_ms_last.load(Ordering::Relaxed),
            dropped_tick_frames: self
                .dropped_by_race
                .lock()
                .expect("metrics lock")
                .snapshot(),
            latest_seq: self
                .latest_seq_by_race
                .lock()
                .expect("metrics lock")
                .snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_counter_is_per_race() {
        let metrics = EngineMetrics::new();
        metrics.record_dropped_tick_frame("race-cycle-1");
        metrics.record_dropped_tick_frame("race-cycle-1");
        metrics.record_dropped_tick_frame("race-cycle-2");

        assert_eq!(metrics.dropped_for("race-cycle-1"), 2);
        assert_eq!(metrics.dropped_for("race-cycle-2"), 1);
        assert_eq!(metrics.dropped_for("race-cycle-3"), 0);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_tick();
        metrics.record_tick();
        metrics.record_drift(7_500, true);
        metrics.record_drift(-1_000, false);
        metrics.subscriber_joined();
        metrics.record_seq("race-cycle-1", 42);

        let snap = metrics.snapshot(50);
        assert_eq!(snap.tick_ms, 50);
        assert_eq!(snap.ticks_emitted, 2);
        assert_eq!(snap.drift_warnings, 1);
        assert_eq!(snap.last_drift_us, -1_000);
        assert_eq!(snap.max_drift_us, 7_500);
        assert_eq!(snap.subscriber_count, 1);
        assert_eq!(snap.latest_seq.get("race-cycle-1"), Some(&42));
    }

    /// Eviction is by true insertion order across the two-digit cycle
    /// boundary, where lexicographic order diverges from arrival order
    /// (`race-cycle-10` < `race-cycle-2` as strings).
    #[test]
    fn test_series_evicts_oldest_insertion() {
        let metrics = EngineMetrics::new();
        for i in 1..=RACE_SERIES_CAP + 5 {
            metrics.record_seq(&format!("race-cycle-{i}"), i as u64);
        }

        let snap = metrics.snapshot(50);
        assert_eq!(snap.latest_seq.len(), RACE_SERIES_CAP);
        // The first five arrivals fell off, nothing else.
        for i in 1..=5 {
            assert!(
                !snap.latest_seq.contains_key(&format!("race-cycle-{i}")),
                "race-cycle-{i} should have been evicted"
            );
        }
        for i in 6..=RACE_SERIES_CAP + 5 {
            assert!(
                snap.latest_seq.contains_key(&format!("race-cycle-{i}")),
                "race-cycle-{i} should have been retained"
            );
        }
    }

    /// Updating an already-tracked race never counts as a new insertion.
    #[test]
    fn test_series_update_does_not_evict() {
        let metrics = EngineMetrics::new();
        for i in 1..=RACE_SERIES_CAP {
            metrics.record_seq(&format!("race-cycle-{i}"), 1);
        }
        metrics.record_seq("race-cycle-1", 99);

        let snap = metrics.snapshot(50);
        assert_eq!(snap.latest_seq.len(), RACE_SERIES_CAP);
        assert_eq!(snap.latest_seq.get("race-cycle-1"), Some(&99));
    }
}
