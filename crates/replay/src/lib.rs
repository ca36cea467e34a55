//! Furlong Replay System
//!
//! Persisted race artifacts for audit and replay, plus the retention window
//! that feeds the inspection endpoints.
//!
//! # Layout (per race, under a store prefix)
//!
//! - `summary.json`: outcome, config, checksum, artifact flags. Written
//!   last and atomically (temp file + rename on filesystems, single PUT on
//!   object stores).
//! - `precomputedPaths.json`: final matrix positions per tick.
//! - `eventTimeline.json`: tick-indexed event instances.
//! - `ticks.json`: optional raw base tick stream.
//! - `UNSAVED.flag`: best-effort marker when any non-summary write failed.
//!
//! Persistence runs after the finish frame and never blocks the tick path;
//! failures mark the race unsaved and are logged, they do not surface as
//! subscriber errors.

#![deny(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use furlong_sim::{
    EventInstance, EventTimeline, PrecomputedRace, RaceConfig, RaceOutcome, Tick,
};

/// Artifact object names.
pub const SUMMARY_JSON: &str = "summary.json";
pub const PRECOMPUTED_PATHS_JSON: &str = "precomputedPaths.json";
pub const EVENT_TIMELINE_JSON: &str = "eventTimeline.json";
pub const TICKS_JSON: &str = "ticks.json";
pub const UNSAVED_FLAG: &str = "UNSAVED.flag";

/// Number of race records retained for `/history`.
pub const HISTORY_CAP: usize = 20;

// ============================================================================
// Artifact Types
// ============================================================================

/// `summary.json`: the canonical per-race record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceSummary {
    pub race_id: String,
    pub seed: String,
    pub outcome: RaceOutcome,
    pub winner: String,
    pub config: RaceConfig,
    pub checksum: String,
    pub has_tick_stream: bool,
    pub has_precomputed_paths: bool,
    pub events_count: usize,
}

/// `eventTimeline.json`: flat instance list plus the grid size needed to
/// rebuild the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineArtifact {
    pub total_ticks: Tick,
    pub instances: Vec<EventInstance>,
}

impl TimelineArtifact {
    pub fn from_timeline(timeline: &EventTimeline) -> Self {
        Self {
            total_ticks: timeline.total_ticks(),
            instances: timeline.instances(),
        }
    }

    pub fn into_timeline(self) -> EventTimeline {
        EventTimeline::from_instances(self.total_ticks, self.instances)
    }
}

/// A race reloaded from the store for restart-in-window recovery.
#[derive(Debug, Clone)]
pub struct RecoveredRace {
    pub summary: RaceSummary,
    /// Final matrix positions per tick, if persisted.
    pub positions: Option<Vec<Vec<f64>>>,
    pub timeline: Option<EventTimeline>,
}

// ============================================================================
// Stores
// ============================================================================

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {race_id}/{name} not found")]
    NotFound { race_id: String, name: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact storage: a filesystem directory or an object-store prefix.
///
/// `put` must be atomic per object: readers never observe a partial write.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, race_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get(&self, race_id: &str, name: &str) -> Result<Vec<u8>, StoreError>;
}

/// Filesystem store: one directory per race, temp-file-plus-rename writes.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn object_path(&self, race_id: &str, name: &str) -> PathBuf {
        self.base.join(race_id).join(name)
    }
}

impl ArtifactStore for FileStore {
    fn put(&self, race_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(race_id, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, race_id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(race_id, name);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                race_id: race_id.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory object store: the object-store backend stand-in. Each `put` is
/// a single atomic insert.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_names(&self, race_id: &str) -> Vec<String> {
        self.objects
            .lock()
            .expect("store lock")
            .keys()
            .filter(|(r, _)| r == race_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

impl ArtifactStore for MemoryStore {
    fn put(&self, race_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.objects
            .lock()
            .expect("store lock")
            .insert((race_id.to_string(), name.to_string()), bytes.to_vec());
        Ok(())
    }

    fn get(&self, race_id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .expect("store lock")
            .get(&(race_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                race_id: race_id.to_string(),
                name: name.to_string(),
            })
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Persistence error. Only a failed summary write is fatal to the persist
/// call; non-summary failures degrade to the unsaved marker.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("serialize {artifact}: {source}")]
    Serialize {
        artifact: &'static str,
        source: serde_json::Error,
    },
}

/// Persist a finished race.
///
/// Non-summary artifacts are written first; any failure is recorded in
/// `UNSAVED.flag` (best effort) and reflected in the summary's artifact
/// flags. The summary itself is written last, atomically.
pub fn persist_race(
    store: &dyn ArtifactStore,
    race: &PrecomputedRace,
    include_tick_stream: bool,
) -> Result<RaceSummary, PersistError> {
    let race_id = &race.config.race_id;
    let mut failures: Vec<String> = Vec::new();

    let positions: Vec<Vec<f64>> = (0..race.config.total_ticks())
        .map(|t| race.matrix.positions_at(t))
        .collect();
    let has_precomputed_paths = put_json(
        store,
        race_id,
        PRECOMPUTED_PATHS_JSON,
        &positions,
        &mut failures,
    );

    let timeline_artifact = TimelineArtifact::from_timeline(&race.timeline);
    // Timeline write failure also degrades to the unsaved marker.
    put_json(
        store,
        race_id,
        EVENT_TIMELINE_JSON,
        &timeline_artifact,
        &mut failures,
    );

    let has_tick_stream = include_tick_stream
        && put_json(store, race_id, TICKS_JSON, &race.base_paths, &mut failures);

    if !failures.is_empty() {
        warn!(race_id, failures = failures.len(), "race artifacts incomplete");
        let marker = failures.join("\n");
        if let Err(e) = store.put(race_id, UNSAVED_FLAG, marker.as_bytes()) {
            warn!(race_id, error = %e, "unsaved marker write failed");
        }
    }

    let summary = summarize_race(race, has_tick_stream, has_precomputed_paths);

    let bytes = serde_json::to_vec(&summary).map_err(|source| PersistError::Serialize {
        artifact: SUMMARY_JSON,
        source,
    })?;
    store.put(race_id, SUMMARY_JSON, &bytes)?;

    Ok(summary)
}

/// Build the summary record for a race. Used by [`persist_race`] and by the
/// driver when persistence fails and the race still needs a history entry.
pub fn summarize_race(
    race: &PrecomputedRace,
    has_tick_stream: bool,
    has_precomputed_paths: bool,
) -> RaceSummary {
    RaceSummary {
        race_id: race.config.race_id.clone(),
        seed: race.config.seed.clone(),
        outcome: race.outcome.clone(),
        winner: race.outcome.winner_id.clone(),
        config: race.config.clone(),
        checksum: race.outcome.checksum.clone(),
        has_tick_stream,
        has_precomputed_paths,
        events_count: race.timeline.instance_count(),
    }
}

fn put_json<T: Serialize>(
    store: &dyn ArtifactStore,
    race_id: &str,
    name: &'static str,
    value: &T,
    failures: &mut Vec<String>,
) -> bool {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            failures.push(format!("{name}: serialize: {e}"));
            return false;
        }
    };
    match store.put(race_id, name, &bytes) {
        Ok(()) => true,
        Err(e) => {
            failures.push(format!("{name}: {e}"));
            false
        }
    }
}

/// Load a race summary.
pub fn load_summary(store: &dyn ArtifactStore, race_id: &str) -> Result<RaceSummary, PersistError> {
    let bytes = store.get(race_id, SUMMARY_JSON)?;
    serde_json::from_slice(&bytes).map_err(|source| PersistError::Serialize {
        artifact: SUMMARY_JSON,
        source,
    })
}

/// Load whatever survives of a persisted race for restart recovery.
///
/// The summary is required; positions and timeline are best-effort (their
/// absence is already recorded in the summary's artifact flags).
pub fn load_recovery(
    store: &dyn ArtifactStore,
    race_id: &str,
) -> Result<RecoveredRace, PersistError> {
    let summary = load_summary(store, race_id)?;

    let positions = store
        .get(race_id, PRECOMPUTED_PATHS_JSON)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Vec<Vec<f64>>>(&bytes).ok());

    let timeline = store
        .get(race_id, EVENT_TIMELINE_JSON)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<TimelineArtifact>(&bytes).ok())
        .map(TimelineArtifact::into_timeline);

    Ok(RecoveredRace {
        summary,
        positions,
        timeline,
    })
}

// ============================================================================
// Retention
// ============================================================================

/// In-memory retention window over finished races, newest last. Feeds the
/// `/previous` and `/history` endpoints.
#[derive(Debug, Default)]
pub struct RaceHistory {
    records: VecDeque<RaceSummary>,
}

impl RaceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, summary: RaceSummary) {
        if self.records.len() == HISTORY_CAP {
            self.records.pop_front();
        }
        self.records.push_back(summary);
    }

    /// Most recent finished race.
    pub fn previous(&self) -> Option<&RaceSummary> {
        self.records.back()
    }

    /// All retained records, newest first.
    pub fn list(&self) -> Vec<&RaceSummary> {
        self.records.iter().rev().collect()
    }

    pub fn find(&self, race_id: &str) -> Option<&RaceSummary> {
        self.records.iter().rev().find(|r| r.race_id == race_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use furlong_sim::precompute_race;

    fn race() -> PrecomputedRace {
        precompute_race(RaceConfig::new("race-1", "cycle-1")).expect("precompute")
    }

    /// Store that fails every write to a configured object name.
    struct FlakyStore {
        inner: MemoryStore,
        broken: &'static str,
    }

    impl ArtifactStore for FlakyStore {
        fn put(&self, race_id: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
            if name == self.broken {
                return Err(StoreError::Io(std::io::Error::other("injected failure")));
            }
            self.inner.put(race_id, name, bytes)
        }

        fn get(&self, race_id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(race_id, name)
        }
    }

    #[test]
    fn test_persist_writes_all_artifacts() {
        let store = MemoryStore::new();
        let race = race();
        let summary = persist_race(&store, &race, true).expect("persist");

        assert!(summary.has_precomputed_paths);
        assert!(summary.has_tick_stream);
        assert_eq!(summary.winner, race.outcome.winner_id);
        assert_eq!(summary.checksum, race.outcome.checksum);
        assert_eq!(summary.events_count, race.timeline.instance_count());

        let mut names = store.object_names("race-1");
        names.sort();
        assert_eq!(
            names,
            vec![
                EVENT_TIMELINE_JSON,
                PRECOMPUTED_PATHS_JSON,
                SUMMARY_JSON,
                TICKS_JSON
            ]
        );
    }

    #[test]
    fn test_persist_without_tick_stream() {
        let store = MemoryStore::new();
        let summary = persist_race(&store, &race(), false).expect("persist");

        assert!(!summary.has_tick_stream);
        assert!(store.get("race-1", TICKS_JSON).is_err());
        assert!(store.get("race-1", UNSAVED_FLAG).is_err(), "no failure, no marker");
    }

    #[test]
    fn test_summary_roundtrip() {
        let store = MemoryStore::new();
        let written = persist_race(&store, &race(), false).expect("persist");
        let loaded = load_summary(&store, "race-1").expect("load");
        assert_eq!(written, loaded);
    }

    #[test]
    fn test_recovery_roundtrip() {
        let store = MemoryStore::new();
        let race = race();
        persist_race(&store, &race, false).expect("persist");

        let recovered = load_recovery(&store, "race-1").expect("recover");
        assert_eq!(recovered.summary.checksum, race.outcome.checksum);

        let positions = recovered.positions.expect("positions persisted");
        assert_eq!(positions.len() as Tick, race.config.total_ticks());
        assert_eq!(positions[0], race.matrix.positions_at(0));

        let timeline = recovered.timeline.expect("timeline persisted");
        assert_eq!(timeline.instances(), race.timeline.instances());
    }

    #[test]
    fn test_non_summary_failure_marks_unsaved() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            broken: PRECOMPUTED_PATHS_JSON,
        };
        let summary = persist_race(&store, &race(), false).expect("summary still writes");

        assert!(!summary.has_precomputed_paths);
        let marker = store.get("race-1", UNSAVED_FLAG).expect("marker written");
        assert!(String::from_utf8(marker).unwrap().contains(PRECOMPUTED_PATHS_JSON));

        // Summary itself landed.
        assert!(load_summary(&store, "race-1").is_ok());
    }

    #[test]
    fn test_summary_failure_is_fatal() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            broken: SUMMARY_JSON,
        };
        assert!(persist_race(&store, &race(), false).is_err());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        store.put("race-1", SUMMARY_JSON, b"{}").expect("put");
        assert_eq!(store.get("race-1", SUMMARY_JSON).expect("get"), b"{}");

        // Overwrite goes through the temp file and replaces cleanly.
        store.put("race-1", SUMMARY_JSON, b"{\"a\":1}").expect("overwrite");
        assert_eq!(store.get("race-1", SUMMARY_JSON).expect("get"), b"{\"a\":1}");

        // No temp residue next to the object.
        let entries: Vec<_> = fs::read_dir(dir.path().join("race-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![SUMMARY_JSON.to_string()]);
    }

    #[test]
    fn test_file_store_missing_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.get("race-9", SUMMARY_JSON),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_history_retention_cap() {
        let store = MemoryStore::new();
        let base = persist_race(&store, &race(), false).expect("persist");

        let mut history = RaceHistory::new();
        for i in 0..25 {
            let mut record = base.clone();
            record.race_id = format!("race-{i}");
            history.push(record);
        }

        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history.previous().unwrap().race_id, "race-24");
        // Oldest five fell off.
        assert!(history.find("race-4").is_none());
        assert!(history.find("race-5").is_some());

        let listed = history.list();
        assert_eq!(listed[0].race_id, "race-24");
        assert_eq!(listed.last().unwrap().race_id, "race-5");
    }
}
