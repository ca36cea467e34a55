//! Cycle driver: the 60-second phase state machine and the fixed-rate tick
//! loop.
//!
//! Phase schedule (seconds within the cycle):
//!
//! | Seconds | Phase             |
//! |---------|-------------------|
//! | 0–26    | `idle`            |
//! | 27–29   | `countdown` (seed assigned, race precomputed at 27) |
//! | 30      | `race_starting` → `race_running` |
//! | 30–50   | `race_running` (tick loop) |
//! | 51      | `race_finished` → `results_showing` (persist + finish) |
//! | 51–59   | `results_showing` |
//!
//! The tick loop advances `planned += tick_ms` rather than `now + tick_ms`,
//! so a late tick is followed by the missed indices in order instead of a
//! permanently shifted schedule. The tick index is the authoritative clock.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use furlong_replay::{load_summary, persist_race, summarize_race, ArtifactStore};
use furlong_sim::{precompute_race, PrecomputedRace, Tick};

use crate::broadcast::BroadcastFabric;
use crate::metrics::EngineMetrics;
use crate::options::EngineOptions;
use crate::{ActiveRace, LiveState};

/// Second of the cycle at which the seed is assigned and the race computed.
pub const PRECOMPUTE_SECOND: u64 = 27;

/// Second of the cycle at which the race starts.
pub const RACE_START_SECOND: u64 = 30;

/// Drift magnitude that triggers a warning: half a tick period, so the
/// threshold scales with the configured tick rate.
pub fn drift_warn_threshold_us(tick_ms: u64) -> i64 {
    (tick_ms * 500) as i64
}

// ============================================================================
// Phase state machine
// ============================================================================

/// The six phases of the cycle. Transitions form a strict cycle; anything
/// else is a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Countdown,
    RaceStarting,
    RaceRunning,
    RaceFinished,
    ResultsShowing,
}

impl CyclePhase {
    /// The only legal successor.
    pub fn successor(self) -> CyclePhase {
        match self {
            Self::Idle => Self::Countdown,
            Self::Countdown => Self::RaceStarting,
            Self::RaceStarting => Self::RaceRunning,
            Self::RaceRunning => Self::RaceFinished,
            Self::RaceFinished => Self::ResultsShowing,
            Self::ResultsShowing => Self::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Countdown => "countdown",
            Self::RaceStarting => "race_starting",
            Self::RaceRunning => "race_running",
            Self::RaceFinished => "race_finished",
            Self::ResultsShowing => "results_showing",
        }
    }

    /// Steady-state phase for a second of the cycle (the transient
    /// `race_starting`/`race_finished` phases live inside their boundary
    /// seconds).
    pub fn for_second(second: u64) -> CyclePhase {
        match second {
            0..=26 => Self::Idle,
            27..=29 => Self::Countdown,
            30..=50 => Self::RaceRunning,
            _ => Self::ResultsShowing,
        }
    }
}

/// Attempted transition outside the strict cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: CyclePhase,
    pub to: CyclePhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal phase transition {} -> {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Mutable cycle state: phase, cycle counter, and the live seed.
#[derive(Debug)]
pub struct CycleState {
    phase: CyclePhase,
    cycle_number: u64,
    seed: Option<String>,
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycle_number: 0,
            seed: None,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn seed(&self) -> Option<&str> {
        self.seed.as_deref()
    }

    /// Transition to `to`, which must be the strict successor. Fatal in
    /// debug builds; refused and reported in release.
    pub fn transition(&mut self, to: CyclePhase) -> Result<(), TransitionError> {
        if self.phase.successor() != to {
            debug_assert!(
                false,
                "illegal phase transition {} -> {}",
                self.phase.as_str(),
                to.as_str()
            );
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Assign the next monotone cycle seed (`cycle-N`).
    pub fn begin_cycle(&mut self) -> String {
        self.cycle_number += 1;
        let seed = format!("cycle-{}", self.cycle_number);
        self.seed = Some(seed.clone());
        seed
    }

    pub fn clear_seed(&mut self) {
        self.seed = None;
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Recovery error.
#[derive(Debug, thiserror::Error)]
pub enum RecoverError {
    #[error("persisted record unavailable: {0}")]
    Load(#[from] furlong_replay::PersistError),
    #[error("recomputed race diverged from persisted checksum")]
    ChecksumMismatch,
    #[error("recompute failed: {0}")]
    Precompute(#[from] furlong_sim::PrecomputeError),
}

pub struct CycleDriver {
    options: EngineOptions,
    fabric: Arc<BroadcastFabric>,
    metrics: Arc<EngineMetrics>,
    live: Arc<LiveState>,
    store: Arc<dyn ArtifactStore>,
}

impl CycleDriver {
    pub fn new(
        options: EngineOptions,
        fabric: Arc<BroadcastFabric>,
        metrics: Arc<EngineMetrics>,
        live: Arc<LiveState>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            options,
            fabric,
            metrics,
            live,
            store,
        }
    }

    /// Run cycles until the shutdown signal flips.
    ///
    /// If a recovered race was installed before startup (restart within the
    /// cycle window), its broadcast resumes first, from the authoritative
    /// tick index.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Some(active) = self.live.current() {
            info!(
                race_id = %active.race.config.race_id,
                resume_tick = active.current_tick(),
                "resuming recovered race"
            );
            self.live.set_phase(CyclePhase::RaceRunning);
            self.broadcast_race(&active, &mut shutdown, true).await;
            self.live.set_phase(CyclePhase::Idle);
        }

        let mut state = CycleState::new();
        let mut pending: Option<Arc<PrecomputedRace>> = None;

        while !*shutdown.borrow() {
            let second = second_of_cycle();

            match state.phase() {
                CyclePhase::Idle if second >= PRECOMPUTE_SECOND && second < RACE_START_SECOND => {
                    let seed = state.begin_cycle();
                    let race_id = format!("race-{seed}");
                    let config = self.options.race_config(&race_id, &seed);

                    let started = std::time::Instant::now();
                    match precompute_race(config) {
                        Ok(race) => {
                            let elapsed = started.elapsed().as_millis() as u64;
                            self.metrics.record_precompute_ms(elapsed);
                            for warning in &race.report.warnings {
                                warn!(race_id = %race.config.race_id, warning = %warning, "precompute warning");
                            }
                            info!(
                                race_id = %race.config.race_id,
                                checksum = %race.outcome.checksum,
                                elapsed_ms = elapsed,
                                "race precomputed"
                            );
                            pending = Some(Arc::new(race));
                            let _ = state.transition(CyclePhase::Countdown);
                            self.live.set_phase(state.phase());
                        }
                        Err(e) => {
                            // Determinism violation or bad config: abort the
                            // cycle, return to idle at the next boundary.
                            error!(seed = %seed, error = %e, "precompute failed; cycle aborted");
                            state.clear_seed();
                        }
                    }
                }
                CyclePhase::Countdown if second >= RACE_START_SECOND && second <= 50 => {
                    if let Some(race) = pending.take() {
                        let _ = state.transition(CyclePhase::RaceStarting);
                        self.live.set_phase(state.phase());

                        let completed = self.run_race_now(race, &mut state, &mut shutdown).await;
                        if !completed {
                            break;
                        }
                    }
                }
                CyclePhase::ResultsShowing if second < PRECOMPUTE_SECOND => {
                    let _ = state.transition(CyclePhase::Idle);
                    self.live.set_phase(state.phase());
                    state.clear_seed();
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(until_next_second()) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("cycle driver stopped");
    }

    /// Start and broadcast one race immediately: bind the start time, emit
    /// `race:start`, run the tick loop, then persist and retire the race.
    ///
    /// Drives `race_starting → race_running → race_finished →
    /// results_showing`. Returns false if cancelled mid-race.
    pub async fn run_race_now(
        &self,
        race: Arc<PrecomputedRace>,
        state: &mut CycleState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let active = Arc::new(ActiveRace::new(Arc::clone(&race), epoch_ms(), 0));
        self.live.install_current(Arc::clone(&active));

        self.fabric
            .begin_race(&race.config, &race.horses, active.start_ts_ms);

        let _ = state.transition(CyclePhase::RaceRunning);
        self.live.set_phase(state.phase());

        let completed = self.broadcast_race(&active, shutdown, false).await;
        if !completed {
            return false;
        }

        let _ = state.transition(CyclePhase::RaceFinished);
        self.live.set_phase(state.phase());

        self.fabric.finish_race(&race.outcome);
        self.persist_and_retire(&race).await;

        let _ = state.transition(CyclePhase::ResultsShowing);
        self.live.set_phase(state.phase());
        true
    }

    /// The fixed-rate tick loop. Returns true when the final tick was
    /// emitted, false on cancellation (no further frames are sent).
    async fn broadcast_race(
        &self,
        active: &ActiveRace,
        shutdown: &mut watch::Receiver<bool>,
        retire_after: bool,
    ) -> bool {
        let config = &active.race.config;
        let total = config.total_ticks();
        let period = Duration::from_millis(config.tick_ms);
        let warn_threshold_us = drift_warn_threshold_us(config.tick_ms);

        let mut tick: Tick = active.current_tick();
        let mut planned = Instant::now();

        loop {
            // Drift against the planned schedule; the loop self-corrects by
            // never re-anchoring `planned` to `now`.
            let now = Instant::now();
            let drift_us = signed_us(now, planned);
            let warned = drift_us.abs() > warn_threshold_us;
            if warned {
                warn!(tick, drift_us, "tick drift beyond threshold");
            }
            self.metrics.record_drift(drift_us, warned);

            self.fabric
                .broadcast_tick(tick, active.race.matrix.positions_at(tick));
            active.publish_tick(tick);
            self.metrics.record_tick();

            if tick == total - 1 {
                if retire_after {
                    self.fabric.finish_race(&active.race.outcome);
                    self.persist_and_retire(&active.race).await;
                }
                return true;
            }
            tick += 1;
            planned += period;

            let now = Instant::now();
            if planned > now {
                tokio::select! {
                    _ = tokio::time::sleep_until(planned) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return false;
                        }
                    }
                }
            } else if *shutdown.borrow() {
                // Behind schedule: emit the missed index immediately, but
                // still honor cancellation at the boundary.
                return false;
            }
        }
    }

    /// Persist artifacts off the tick path and retire the race into the
    /// previous/history window. Persistence failure marks the race unsaved
    /// and never surfaces to subscribers.
    async fn persist_and_retire(&self, race: &Arc<PrecomputedRace>) {
        let store = Arc::clone(&self.store);
        let race_for_persist = Arc::clone(race);
        let include_ticks = self.options.include_tick_stream;

        let result = tokio::task::spawn_blocking(move || {
            persist_race(store.as_ref(), &race_for_persist, include_ticks)
        })
        .await;

        let summary = match result {
            Ok(Ok(summary)) => {
                info!(race_id = %summary.race_id, "race artifacts persisted");
                summary
            }
            Ok(Err(e)) => {
                error!(race_id = %race.config.race_id, error = %e, "race persist failed; marked unsaved");
                summarize_race(race, false, false)
            }
            Err(e) => {
                error!(race_id = %race.config.race_id, error = %e, "persist task panicked");
                summarize_race(race, false, false)
            }
        };

        self.live.retire_current(summary);
    }

    /// Restart-in-window recovery: reload the persisted summary, recompute
    /// the race from its seed, and verify the checksum before installing it
    /// for resumption at `resume_tick`.
    pub fn try_recover(&self, race_id: &str, resume_tick: Tick) -> Result<(), RecoverError> {
        let summary = load_summary(self.store.as_ref(), race_id)?;
        let race = precompute_race(summary.config.clone())?;

        if race.outcome.checksum != summary.checksum {
            return Err(RecoverError::ChecksumMismatch);
        }

        let resume_tick = resume_tick.min(race.config.total_ticks() - 1);
        let start_ts_ms =
            epoch_ms().saturating_sub(u64::from(resume_tick) * race.config.tick_ms);
        let active = Arc::new(ActiveRace::new(Arc::new(race), start_ts_ms, resume_tick));

        self.fabric
            .begin_race(&active.race.config, &active.race.horses, start_ts_ms);
        self.live.install_current(active);
        Ok(())
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn second_of_cycle() -> u64 {
    (epoch_ms() / 1000) % 60
}

fn until_next_second() -> Duration {
    let ms = epoch_ms() % 1000;
    Duration::from_millis(1000 - ms)
}

fn signed_us(now: Instant, planned: Instant) -> i64 {
    if now >= planned {
        now.duration_since(planned).as_micros() as i64
    } else {
        -(planned.duration_since(now).as_micros() as i64)
    }
}

// ============================================================================
// Tests
// ============================================================================
