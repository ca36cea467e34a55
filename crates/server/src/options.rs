//! Engine runtime options.
//!
//! All recognized switches live in one explicit value; nothing reads the
//! environment after startup. `from_env` maps `FURLONG_*` variables onto the
//! defaults, ignoring unparseable values.

use std::net::SocketAddr;
use std::path::PathBuf;

use furlong_sim::{RaceConfig, Tick, DEFAULT_DURATION_MS, DEFAULT_HORSE_COUNT, DEFAULT_TICK_MS, DEFAULT_TRACK_LENGTH_M};

/// Delta-mode keyframe cadence, in ticks.
pub const DEFAULT_KEYFRAME_INTERVAL_TICKS: Tick = 20;

/// Outbound-buffer drop threshold, bytes.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 1_000_000;

/// Keepalive ping period.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// Upper bound on ticks in one catch-up response.
pub const MAX_CATCHUP_TICKS: Tick = 50;

/// Catch-up window when the request names no `fromTick`.
pub const DEFAULT_CATCHUP_WINDOW: Tick = 10;

/// Per-subscriber cooldown between catch-up requests.
pub const SYNC_COOLDOWN_MS: u64 = 2_000;

/// Persistence backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceBackend {
    File,
    ObjectStore,
}

/// The full set of recognized engine options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tick_ms: u64,
    pub duration_ms: u64,
    pub track_length: f64,
    pub finish_ratio: f64,
    pub horse_count: usize,
    pub keyframe_interval_ticks: Tick,
    pub backpressure_threshold: usize,
    pub ping_interval_ms: u64,
    pub signing_enabled: bool,
    /// 32-byte signing secret file; generated on first use when signing is
    /// enabled and the file is absent.
    pub signing_secret_path: Option<PathBuf>,
    pub require_token: bool,
    pub auth_token: Option<String>,
    pub persistence_backend: PersistenceBackend,
    pub persist_base: PathBuf,
    pub include_tick_stream: bool,
    pub bind_addr: SocketAddr,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            duration_ms: DEFAULT_DURATION_MS,
            track_length: DEFAULT_TRACK_LENGTH_M,
            finish_ratio: 1.0,
            horse_count: DEFAULT_HORSE_COUNT,
            keyframe_interval_ticks: DEFAULT_KEYFRAME_INTERVAL_TICKS,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            signing_enabled: false,
            signing_secret_path: None,
            require_token: false,
            auth_token: None,
            persistence_backend: PersistenceBackend::File,
            persist_base: PathBuf::from("./races"),
            include_tick_stream: false,
            bind_addr: "127.0.0.1:8700".parse().expect("default bind addr"),
        }
    }
}

impl EngineOptions {
    /// Defaults overridden by `FURLONG_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        read_env("FURLONG_TICK_MS", &mut options.tick_ms);
        read_env("FURLONG_DURATION_MS", &mut options.duration_ms);
        read_env("FURLONG_TRACK_LENGTH", &mut options.track_length);
        read_env("FURLONG_FINISH_RATIO", &mut options.finish_ratio);
        read_env("FURLONG_HORSE_COUNT", &mut options.horse_count);
        read_env(
            "FURLONG_KEYFRAME_INTERVAL_TICKS",
            &mut options.keyframe_interval_ticks,
        );
        read_env(
            "FURLONG_BACKPRESSURE_THRESHOLD",
            &mut options.backpressure_threshold,
        );
        read_env("FURLONG_PING_INTERVAL_MS", &mut options.ping_interval_ms);
        read_env("FURLONG_SIGNING_ENABLED", &mut options.signing_enabled);
        read_env("FURLONG_REQUIRE_TOKEN", &mut options.require_token);
        read_env("FURLONG_INCLUDE_TICK_STREAM", &mut options.include_tick_stream);
        read_env("FURLONG_BIND", &mut options.bind_addr);

        if let Ok(v) = std::env::var("FURLONG_SIGNING_SECRET") {
            options.signing_secret_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("FURLONG_TOKEN") {
            options.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("FURLONG_PERSIST_BASE") {
            options.persist_base = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FURLONG_PERSISTENCE_BACKEND") {
            options.persistence_backend = match v.as_str() {
                "objectStore" | "object-store" | "memory" => PersistenceBackend::ObjectStore,
                _ => PersistenceBackend::File,
            };
        }

        options
    }

    /// Race configuration for one cycle.
    pub fn race_config(&self, race_id: &str, seed: &str) -> RaceConfig {
        RaceConfig {
            race_id: race_id.to_string(),
            seed: seed.to_string(),
            track_length: self.track_length,
            finish_ratio: self.finish_ratio,
            duration_ms: self.duration_ms,
            tick_ms: self.tick_ms,
            horse_count: self.horse_count,
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse::<T>() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let options = EngineOptions::default();
        assert_eq!(options.tick_ms, 50);
        assert_eq!(options.duration_ms, 20_000);
        assert_eq!(options.keyframe_interval_ticks, 20);
        assert_eq!(options.backpressure_threshold, 1_000_000);
        assert_eq!(options.ping_interval_ms, 30_000);
        assert!(!options.signing_enabled);
        assert!(!options.require_token);
    }

    #[test]
    fn test_race_config_carries_options() {
        let mut options = EngineOptions::default();
        options.tick_ms = 25;
        options.duration_ms = 10_000;
        options.finish_ratio = 0.8;

        let config = options.race_config("race-7", "cycle-7");
        assert_eq!(config.race_id, "race-7");
        assert_eq!(config.seed, "cycle-7");
        assert_eq!(config.tick_ms, 25);
        assert_eq!(config.total_ticks(), 401);
        assert_eq!(config.finish_line(), 800.0);
    }
}
