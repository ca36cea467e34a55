//! Furlong Server Edge
//!
//! Owns everything the pure simulation core must not touch: the wall clock,
//! the network, persistence, and logging. The cycle driver maps wall time
//! onto the 60-second phase cycle, precomputes each race, and feeds the
//! broadcast fabric, which fans frames out to WebSocket subscribers with
//! per-subscriber back-pressure. HTTP endpoints expose the current and
//! recent races for inspection.
//!
//! # Concurrency model
//!
//! The cycle driver and tick loop run as one cooperative task; nothing
//! inside tick processing blocks or takes a subscriber lock. Per-subscriber
//! writer tasks perform the actual socket I/O behind bounded queues. The
//! precomputed race is immutable once installed; readers grab an `Arc` and
//! never hold a lock across a tick.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod cycle;
pub mod http;
pub mod metrics;
pub mod options;
pub mod subscriber;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use furlong_replay::{ArtifactStore, FileStore, MemoryStore, RaceHistory, RaceSummary};
use furlong_sim::{PrecomputedRace, Tick};
use furlong_wire::FrameSigner;
use tracing::info;

use crate::broadcast::BroadcastFabric;
use crate::cycle::CyclePhase;
use crate::metrics::EngineMetrics;
use crate::options::{EngineOptions, PersistenceBackend};

// ============================================================================
// Live State
// ============================================================================

/// The race currently being broadcast.
pub struct ActiveRace {
    pub race: Arc<PrecomputedRace>,
    /// Epoch milliseconds of tick 0.
    pub start_ts_ms: u64,
    /// Authoritative clock, published monotonically by the tick loop.
    current_tick: AtomicU32,
}

impl ActiveRace {
    pub fn new(race: Arc<PrecomputedRace>, start_ts_ms: u64, start_tick: Tick) -> Self {
        Self {
            race,
            start_ts_ms,
            current_tick: AtomicU32::new(start_tick),
        }
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick.load(Ordering::Acquire)
    }

    pub fn publish_tick(&self, tick: Tick) {
        self.current_tick.store(tick, Ordering::Release);
    }
}

struct LiveInner {
    phase: CyclePhase,
    current: Option<Arc<ActiveRace>>,
    previous: Option<Arc<PrecomputedRace>>,
    history: RaceHistory,
}

/// Shared view of the engine's races. Writers are the cycle driver and the
/// tick loop; all critical sections are short and none sit on the tick path.
pub struct LiveState {
    inner: RwLock<LiveInner>,
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LiveInner {
                phase: CyclePhase::Idle,
                current: None,
                previous: None,
                history: RaceHistory::new(),
            }),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.inner.read().expect("live lock").phase
    }

    pub fn set_phase(&self, phase: CyclePhase) {
        self.inner.write().expect("live lock").phase = phase;
    }

    pub fn install_current(&self, active: Arc<ActiveRace>) {
        self.inner.write().expect("live lock").current = Some(active);
    }

    pub fn current(&self) -> Option<Arc<ActiveRace>> {
        self.inner.read().expect("live lock").current.clone()
    }

    /// Retire the active race: it becomes the previous-race snapshot and
    /// enters the retention window.
    pub fn retire_current(&self, summary: RaceSummary) {
        let mut inner = self.inner.write().expect("live lock");
        if let Some(active) = inner.current.take() {
            inner.previous = Some(Arc::clone(&active.race));
        }
        inner.history.push(summary);
    }

    pub fn previous(&self) -> Option<Arc<PrecomputedRace>> {
        self.inner.read().expect("live lock").previous.clone()
    }

    pub fn history(&self) -> Vec<RaceSummary> {
        self.inner
            .read()
            .expect("live lock")
            .history
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn find_summary(&self, race_id: &str) -> Option<RaceSummary> {
        self.inner
            .read()
            .expect("live lock")
            .history
            .find(race_id)
            .cloned()
    }

    /// Full race record by id, if still held in memory (current or previous).
    pub fn find_race(&self, race_id: &str) -> Option<Arc<PrecomputedRace>> {
        let inner = self.inner.read().expect("live lock");
        if let Some(active) = &inner.current {
            if active.race.config.race_id == race_id {
                return Some(Arc::clone(&active.race));
            }
        }
        inner
            .previous
            .as_ref()
            .filter(|r| r.config.race_id == race_id)
            .cloned()
    }
}

// ============================================================================
// Engine assembly
// ============================================================================

/// Engine construction error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("signing secret at {path}: {source}")]
    SigningSecret {
        path: String,
        source: std::io::Error,
    },
    #[error("signing secret at {path} must be 32 raw bytes or 64 hex chars")]
    BadSecretShape { path: String },
    #[error("signer init: {0}")]
    Signer(#[from] furlong_wire::SignError),
}

/// Everything the HTTP layer and the driver share.
pub struct Engine {
    pub options: EngineOptions,
    pub metrics: Arc<EngineMetrics>,
    pub fabric: Arc<BroadcastFabric>,
    pub live: Arc<LiveState>,
    pub store: Arc<dyn ArtifactStore>,
    pub signer: Option<Arc<FrameSigner>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let metrics = Arc::new(EngineMetrics::new());
        let signer = load_signer(&options)?;

        let fabric = Arc::new(BroadcastFabric::new(
            options.keyframe_interval_ticks,
            options.backpressure_threshold,
            signer.clone(),
            Arc::clone(&metrics),
        ));

        let store: Arc<dyn ArtifactStore> = match options.persistence_backend {
            PersistenceBackend::File => Arc::new(FileStore::new(&options.persist_base)),
            PersistenceBackend::ObjectStore => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            options,
            metrics,
            fabric,
            live: Arc::new(LiveState::new()),
            store,
            signer,
        })
    }

    pub fn driver(&self) -> cycle::CycleDriver {
        cycle::CycleDriver::new(
            self.options.clone(),
            Arc::clone(&self.fabric),
            Arc::clone(&self.metrics),
            Arc::clone(&self.live),
            Arc::clone(&self.store),
        )
    }
}

/// Load or create the frame-signing key per the configured options.
fn load_signer(options: &EngineOptions) -> Result<Option<Arc<FrameSigner>>, EngineError> {
    if !options.signing_enabled {
        return Ok(None);
    }

    let Some(path) = &options.signing_secret_path else {
        let signer = FrameSigner::generate()?;
        info!(key_id = signer.key_id(), "generated ephemeral signing key");
        return Ok(Some(Arc::new(signer)));
    };

    if path.exists() {
        let secret = read_secret(path)?;
        let signer = FrameSigner::from_secret_bytes(&secret)?;
        info!(key_id = signer.key_id(), "loaded signing key");
        return Ok(Some(Arc::new(signer)));
    }

    // First use: generate and persist the secret.
    let signer = FrameSigner::generate()?;
    fs::write(path, signer.secret_bytes()).map_err(|source| EngineError::SigningSecret {
        path: path.display().to_string(),
        source,
    })?;
    info!(key_id = signer.key_id(), "generated and stored signing key");
    Ok(Some(Arc::new(signer)))
}

fn read_secret(path: &Path) -> Result<[u8; 32], EngineError> {
    let raw = fs::read(path).map_err(|source| EngineError::SigningSecret {
        path: path.display().to_string(),
        source,
    })?;

    if raw.len() == 32 {
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&raw);
        return Ok(secret);
    }

    // Hex form, possibly newline-terminated.
    let text = String::from_utf8_lossy(&raw);
    let text = text.trim();
    if text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut secret = [0u8; 32];
        for (i, chunk) in secret.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&text[2 * i..2 * i + 2], 16).expect("checked hex");
        }
        return Ok(secret);
    }

    Err(EngineError::BadSecretShape {
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use furlong_sim::{precompute_race, RaceConfig};

    fn engine() -> Engine {
        let mut options = EngineOptions::default();
        options.persistence_backend = PersistenceBackend::ObjectStore;
        Engine::new(options).expect("engine")
    }

    #[test]
    fn test_live_state_lifecycle() {
        let engine = engine();
        let live = &engine.live;
        assert_eq!(live.phase(), CyclePhase::Idle);
        assert!(live.current().is_none());
        assert!(live.previous().is_none());

        let race = Arc::new(precompute_race(RaceConfig::new("race-1", "cycle-1")).unwrap());
        let active = Arc::new(ActiveRace::new(Arc::clone(&race), 1_000, 0));
        live.install_current(Arc::clone(&active));

        assert!(live.current().is_some());
        assert!(live.find_race("race-1").is_some());
        assert!(live.find_race("race-9").is_none());

        active.publish_tick(42);
        assert_eq!(live.current().unwrap().current_tick(), 42);

        let summary = furlong_replay::summarize_race(&race, false, false);
        live.retire_current(summary);

        assert!(live.current().is_none());
        assert_eq!(live.previous().unwrap().config.race_id, "race-1");
        assert_eq!(live.history().len(), 1);
        assert!(live.find_summary("race-1").is_some());
        // The full record survives through `previous`.
        assert!(live.find_race("race-1").is_some());
    }

    #[test]
    fn test_signer_disabled_by_default() {
        assert!(engine().signer.is_none());
    }

    #[test]
    fn test_signer_secret_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("signing.key");

        let mut options = EngineOptions::default();
        options.persistence_backend = PersistenceBackend::ObjectStore;
        options.signing_enabled = true;
        options.signing_secret_path = Some(secret_path.clone());

        // First engine generates and stores the secret.
        let first = Engine::new(options.clone()).expect("engine");
        let first_key = first.signer.as_ref().unwrap().key_id().to_string();
        assert!(secret_path.exists());

        // Second engine loads the same key.
        let second = Engine::new(options).expect("engine");
        assert_eq!(second.signer.as_ref().unwrap().key_id(), first_key);
    }

    #[test]
    fn test_signer_rejects_malformed_secret() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("signing.key");
        fs::write(&secret_path, b"too short").unwrap();

        let mut options = EngineOptions::default();
        options.signing_enabled = true;
        options.signing_secret_path = Some(secret_path);

        assert!(matches!(
            Engine::new(options),
            Err(EngineError::BadSecretShape { .. })
        ));
    }
}
