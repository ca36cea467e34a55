//! Broadcast fabric: sequencing, encoding, and per-subscriber delivery.
//!
//! The tick dispatcher never blocks on a subscriber. Every subscriber owns a
//! bounded queue drained by its writer task; the fabric only ever
//! `try_send`s into it. Slow consumers lose droppable frames (`race:tick`,
//! `race:delta`) once their outbound buffer passes the threshold; keyframes
//! and lifecycle frames are always attempted and a subscriber that cannot
//! even accept those is cut loose.
//!
//! Sequencing: one `seq` per emission instant, starting at 1 when a race
//! starts. A non-keyframe tick emits a `race:tick` and a `race:delta`
//! carrying the same `seq`; each subscriber sees exactly one of the two, so
//! per-subscriber `seq` is strictly increasing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use furlong_sim::{HorseSeed, RaceConfig, RaceOutcome, Tick};
use furlong_wire::{encode_frame, Frame, FrameSigner, Seq, WireMessage, PROTO_VER};

use crate::metrics::EngineMetrics;
use crate::options::{
    DEFAULT_CATCHUP_WINDOW, MAX_CATCHUP_TICKS, SYNC_COOLDOWN_MS,
};

/// Depth of each subscriber's outbound queue.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

pub type SubscriberId = u64;

/// Negotiated tick encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Delta,
}

/// Node role supplied by an external leader elector. Only the leader
/// sequences, signs, and publishes; edges re-broadcast verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Edge,
}

/// Optional external message bus the leader publishes sequenced frames to.
pub trait FrameBus: Send + Sync {
    fn publish(&self, race_id: &str, payload: &str);
}

// ============================================================================
// Subscriber handles
// ============================================================================

/// Fabric-side view of one subscriber.
pub struct SubscriberHandle {
    pub id: SubscriberId,
    pub mode: Encoding,
    pub binary: bool,
    tx: mpsc::Sender<WireMessage>,
    /// Outbound bytes enqueued but not yet written by the writer task.
    buffered_bytes: Arc<AtomicUsize>,
    /// Delta-mode gate: drop deltas until the next keyframe passes.
    needs_keyframe: AtomicBool,
    last_sync: Mutex<Option<Instant>>,
}

impl SubscriberHandle {
    /// Buffered-byte counter shared with the writer task.
    pub fn buffered_bytes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.buffered_bytes)
    }
}

// ============================================================================
// Fabric
// ============================================================================

struct RaceMeta {
    race_id: String,
    config: RaceConfig,
    start_ts_ms: u64,
}

struct KeyframeState {
    frame: Frame,
    positions: Vec<f64>,
    tick: Tick,
}

#[derive(Default)]
struct CatchupBuffer {
    start_tick: Tick,
    ticks: VecDeque<Vec<f64>>,
    current_tick: Tick,
}

struct FabricInner {
    subscribers: BTreeMap<SubscriberId, Arc<SubscriberHandle>>,
    next_id: SubscriberId,
    seq: Seq,
    race: Option<RaceMeta>,
    keyframe: Option<KeyframeState>,
    catchup: CatchupBuffer,
}

pub struct BroadcastFabric {
    keyframe_interval: Tick,
    backpressure_threshold: usize,
    signer: Option<Arc<FrameSigner>>,
    metrics: Arc<EngineMetrics>,
    role: RwLock<Role>,
    bus: Option<Arc<dyn FrameBus>>,
    inner: Mutex<FabricInner>,
}

impl BroadcastFabric {
    pub fn new(
        keyframe_interval: Tick,
        backpressure_threshold: usize,
        signer: Option<Arc<FrameSigner>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            keyframe_interval: keyframe_interval.max(1),
            backpressure_threshold,
            signer,
            metrics,
            role: RwLock::new(Role::Leader),
            bus: None,
            inner: Mutex::new(FabricInner {
                subscribers: BTreeMap::new(),
                next_id: 1,
                seq: 0,
                race: None,
                keyframe: None,
                catchup: CatchupBuffer::default(),
            }),
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn FrameBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn role(&self) -> Role {
        *self.role.read().expect("role lock")
    }

    /// Role flips on external input (leader elector).
    pub fn set_role(&self, role: Role) {
        *self.role.write().expect("role lock") = role;
        info!(?role, "broadcast role changed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("fabric lock").subscribers.len()
    }

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------

    /// Register a subscriber. Returns its handle, the queue end its writer
    /// task drains, and the greeting frame (already queued accounting-wise:
    /// the caller just sends what it receives).
    pub fn subscribe(
        &self,
        mode: Encoding,
        binary: bool,
    ) -> (Arc<SubscriberHandle>, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);

        let mut inner = self.inner.lock().expect("fabric lock");
        let id = inner.next_id;
        inner.next_id += 1;

        let handle = Arc::new(SubscriberHandle {
            id,
            mode,
            binary,
            tx,
            buffered_bytes: Arc::new(AtomicUsize::new(0)),
            needs_keyframe: AtomicBool::new(mode == Encoding::Delta),
            last_sync: Mutex::new(None),
        });

        let info = Frame::Info {
            race_id: inner.race.as_ref().map(|r| r.race_id.clone()),
            config: inner.race.as_ref().map(|r| r.config.clone()),
            current_tick_index: inner.race.as_ref().map(|_| inner.catchup.current_tick),
            proto_ver: PROTO_VER,
        };
        self.enqueue(&handle, &info);

        inner.subscribers.insert(id, Arc::clone(&handle));
        drop(inner);

        self.metrics.subscriber_joined();
        debug!(id, ?mode, binary, "subscriber joined");
        (handle, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self
            .inner
            .lock()
            .expect("fabric lock")
            .subscribers
            .remove(&id);
        if removed.is_some() {
            self.metrics.subscriber_left();
            debug!(id, "subscriber left");
        }
    }

    // ------------------------------------------------------------------
    // Race lifecycle (leader only)
    // ------------------------------------------------------------------

    /// Reset sequencing for a new race and broadcast `race:start`.
    pub fn begin_race(&self, config: &RaceConfig, horses: &[HorseSeed], start_ts_ms: u64) {
        let mut inner = self.inner.lock().expect("fabric lock");
        inner.seq = 0;
        inner.keyframe = None;
        inner.catchup = CatchupBuffer::default();
        inner.race = Some(RaceMeta {
            race_id: config.race_id.clone(),
            config: config.clone(),
            start_ts_ms,
        });

        let seq = self.next_seq(&mut inner);
        let frame = Frame::Start {
            seq,
            race_id: config.race_id.clone(),
            horses: horses.to_vec(),
            config: config.clone(),
            tick_ts: start_ts_ms,
            proto_ver: PROTO_VER,
        };
        self.fan_out(&inner, &frame, None);
    }

    /// Broadcast one tick of the active race.
    pub fn broadcast_tick(&self, tick: Tick, positions: Vec<f64>) {
        let mut inner = self.inner.lock().expect("fabric lock");
        let Some(race) = &inner.race else {
            warn!(tick, "tick broadcast with no active race");
            return;
        };
        let race_id = race.race_id.clone();
        let tick_ts = race.start_ts_ms + u64::from(tick) * race.config.tick_ms;

        // Maintain the catch-up ring.
        inner.catchup.current_tick = tick;
        if inner.catchup.ticks.is_empty() {
            inner.catchup.start_tick = tick;
        }
        inner.catchup.ticks.push_back(positions.clone());
        while inner.catchup.ticks.len() > MAX_CATCHUP_TICKS as usize {
            inner.catchup.ticks.pop_front();
            inner.catchup.start_tick += 1;
        }

        let is_keyframe = tick % self.keyframe_interval == 0;
        let seq = self.next_seq(&mut inner);

        if is_keyframe {
            let frame = Frame::Keyframe {
                seq,
                race_id,
                tick_index: tick,
                tick_ts,
                positions: positions.clone(),
                proto_ver: PROTO_VER,
            };
            inner.keyframe = Some(KeyframeState {
                frame: frame.clone(),
                positions,
                tick,
            });
            self.fan_out(&inner, &frame, None);
            // Delta subscribers are anchored from here on.
            for handle in inner.subscribers.values() {
                handle.needs_keyframe.store(false, Ordering::Relaxed);
            }
            return;
        }

        let tick_frame = Frame::Tick {
            seq,
            race_id: race_id.clone(),
            tick_index: tick,
            tick_ts,
            positions: positions.clone(),
            proto_ver: PROTO_VER,
        };

        let delta_frame = inner.keyframe.as_ref().map(|kf| Frame::Delta {
            seq,
            race_id,
            tick_index: tick,
            tick_ts,
            keyframe_tick: kf.tick,
            deltas: positions
                .iter()
                .zip(&kf.positions)
                .map(|(p, k)| p - k)
                .collect(),
            proto_ver: PROTO_VER,
        });

        self.fan_out(&inner, &tick_frame, delta_frame.as_ref());
    }

    /// Broadcast `race:finish`.
    pub fn finish_race(&self, outcome: &RaceOutcome) {
        let mut inner = self.inner.lock().expect("fabric lock");
        let Some(race) = &inner.race else {
            return;
        };
        let race_id = race.race_id.clone();
        let tick_ts =
            race.start_ts_ms + u64::from(inner.catchup.current_tick) * race.config.tick_ms;

        let seq = self.next_seq(&mut inner);
        let frame = Frame::Finish {
            seq,
            race_id,
            winner: outcome.winner_id.clone(),
            placements: outcome.finish_order.clone(),
            tick_ts,
            proto_ver: PROTO_VER,
        };
        self.fan_out(&inner, &frame, None);
    }

    // ------------------------------------------------------------------
    // Catch-up
    // ------------------------------------------------------------------

    /// Handle a subscriber's `sync:request`.
    ///
    /// Rate-limited per subscriber; the window is clamped so the response
    /// never exceeds [`MAX_CATCHUP_TICKS`] ticks nor the current tick.
    pub fn handle_sync_request(
        &self,
        handle: &SubscriberHandle,
        race_id: &str,
        from_tick: Option<Tick>,
        now: Instant,
    ) {
        {
            let mut last = handle.last_sync.lock().expect("sync lock");
            if let Some(prev) = *last {
                if now.duration_since(prev) < Duration::from_millis(SYNC_COOLDOWN_MS) {
                    // Abuse throttling: silently ignored.
                    return;
                }
            }
            *last = Some(now);
        }

        let inner = self.inner.lock().expect("fabric lock");
        let active = inner.race.as_ref().map(|r| r.race_id.clone());
        if active.as_deref() != Some(race_id) {
            self.enqueue(
                handle,
                &Frame::Error {
                    message: format!("unknown race {race_id}"),
                    proto_ver: PROTO_VER,
                },
            );
            return;
        }

        let current = inner.catchup.current_tick;
        let window_floor = current.saturating_sub(MAX_CATCHUP_TICKS.saturating_sub(1));
        let requested = from_tick.unwrap_or_else(|| {
            current.saturating_sub(DEFAULT_CATCHUP_WINDOW.saturating_sub(1))
        });
        let from = requested
            .clamp(window_floor, current)
            .max(inner.catchup.start_tick);

        let ticks: Vec<Vec<f64>> = (from..=current)
            .filter_map(|t| {
                let offset = t.checked_sub(inner.catchup.start_tick)? as usize;
                inner.catchup.ticks.get(offset).cloned()
            })
            .collect();

        // Delta subscribers need an anchor before any further deltas.
        if handle.mode == Encoding::Delta {
            if let Some(kf) = &inner.keyframe {
                let anchor = kf.frame.clone();
                self.enqueue(handle, &anchor);
                handle.needs_keyframe.store(false, Ordering::Relaxed);
            }
        }

        self.enqueue(
            handle,
            &Frame::Catchup {
                race_id: race_id.to_string(),
                start_index: from,
                ticks,
                current_tick_index: current,
                proto_ver: PROTO_VER,
            },
        );
        self.enqueue(
            handle,
            &Frame::SyncComplete {
                race_id: race_id.to_string(),
                current_tick_index: current,
                proto_ver: PROTO_VER,
            },
        );
    }

    // ------------------------------------------------------------------
    // Edge re-broadcast
    // ------------------------------------------------------------------

    /// Re-broadcast an already-sequenced frame received from the bus.
    /// Edges never modify `seq`, `sig`, or `keyId`.
    pub fn rebroadcast_text(&self, payload: &str) {
        let droppable = furlong_wire::decode_frame(payload)
            .map(|f| f.is_droppable())
            .unwrap_or(false);

        let inner = self.inner.lock().expect("fabric lock");
        for handle in inner.subscribers.values() {
            self.deliver_encoded(
                handle,
                WireMessage::Text(payload.to_string()),
                droppable,
                None,
            );
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn next_seq(&self, inner: &mut FabricInner) -> Seq {
        inner.seq += 1;
        if let Some(race) = &inner.race {
            self.metrics.record_seq(&race.race_id, inner.seq);
        }
        inner.seq
    }

    /// Deliver a frame to every subscriber, honoring mode. `delta_frame`
    /// (when present) replaces `frame` for delta-mode subscribers.
    fn fan_out(&self, inner: &FabricInner, frame: &Frame, delta_frame: Option<&Frame>) {
        if let (Some(bus), Role::Leader) = (&self.bus, self.role()) {
            if let Some(race) = &inner.race {
                if let Ok(WireMessage::Text(text)) =
                    encode_frame(frame, self.signer.as_deref(), false)
                {
                    bus.publish(&race.race_id, &text);
                }
            }
        }

        for handle in inner.subscribers.values() {
            let chosen = match (handle.mode, delta_frame) {
                (Encoding::Delta, Some(delta)) => delta,
                _ => frame,
            };

            // A delta subscriber that has not seen a keyframe yet skips
            // droppable frames; its stream starts at the next keyframe.
            if handle.mode == Encoding::Delta
                && chosen.is_droppable()
                && handle.needs_keyframe.load(Ordering::Relaxed)
            {
                continue;
            }

            self.enqueue(handle, chosen);
        }
    }

    /// Encode for one subscriber and apply the drop policy.
    fn enqueue(&self, handle: &SubscriberHandle, frame: &Frame) {
        let race_id = frame_race_id(frame);
        match encode_frame(frame, self.signer.as_deref(), handle.binary) {
            Ok(message) => {
                self.deliver_encoded(handle, message, frame.is_droppable(), race_id);
            }
            Err(e) => warn!(subscriber = handle.id, error = %e, "frame encoding failed"),
        }
    }

    fn deliver_encoded(
        &self,
        handle: &SubscriberHandle,
        message: WireMessage,
        droppable: bool,
        race_id: Option<String>,
    ) {
        if droppable {
            let buffered = handle.buffered_bytes.load(Ordering::Relaxed);
            if buffered > self.backpressure_threshold {
                if let Some(race_id) = &race_id {
                    self.metrics.record_dropped_tick_frame(race_id);
                }
                return;
            }
        }

        let len = message.len();
        match handle.tx.try_send(message) {
            Ok(()) => {
                handle.buffered_bytes.fetch_add(len, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if droppable {
                    if let Some(race_id) = &race_id {
                        self.metrics.record_dropped_tick_frame(race_id);
                    }
                } else {
                    // A subscriber that cannot accept even critical frames
                    // is beyond saving; its writer task will observe the
                    // closed queue and tear the connection down.
                    warn!(subscriber = handle.id, "critical frame overflow, disconnecting");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn frame_race_id(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Start { race_id, .. }
        | Frame::Tick { race_id, .. }
        | Frame::Keyframe { race_id, .. }
        | Frame::Delta { race_id, .. }
        | Frame::Finish { race_id, .. }
        | Frame::Catchup { race_id, .. }
        | Frame::SyncComplete { race_id, .. } => Some(race_id.clone()),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use furlong_sim::{derive_horses, RaceConfig};
    use furlong_wire::decode_frame;

    fn fabric() -> Arc<BroadcastFabric> {
        Arc::new(BroadcastFabric::new(
            20,
            1_000_000,
            None,
            Arc::new(EngineMetrics::new()),
        ))
    }

    fn start_race(fabric: &BroadcastFabric) -> RaceConfig {
        let config = RaceConfig::new("race-1", "cycle-1");
        let horses = derive_horses(&config);
        fabric.begin_race(&config, &horses, 1_000);
        config
    }

    fn drain(
        rx: &mut mpsc::Receiver<WireMessage>,
        buffered: &Arc<AtomicUsize>,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            buffered.fetch_sub(message.len(), Ordering::Relaxed);
            if let WireMessage::Text(text) = message {
                frames.push(decode_frame(&text).expect("frame decodes"));
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_info_frame_arrives_first() {
        let fabric = fabric();
        start_race(&fabric);
        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);

        let frames = drain(&mut rx, &handle.buffered_bytes());
        assert!(matches!(
            frames[0],
            Frame::Info {
                race_id: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_plain_subscriber_sees_monotone_seq() {
        let fabric = fabric();
        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);
        start_race(&fabric);

        for tick in 0..45 {
            fabric.broadcast_tick(tick, vec![1.0, 2.0]);
        }

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let seqs: Vec<Seq> = frames.iter().filter_map(Frame::seq).collect();
        assert!(!seqs.is_empty());
        assert_eq!(seqs[0], 1, "seq restarts at 1 on race start");
        for pair in seqs.windows(2) {
            assert!(pair[1] > pair[0], "seq must be strictly increasing");
        }

        // Plain mode: no delta frames ever.
        assert!(!frames.iter().any(|f| matches!(f, Frame::Delta { .. })));
    }

    /// A delta subscriber joining mid-race gets a keyframe before any delta.
    #[tokio::test]
    async fn test_late_delta_join_waits_for_keyframe() {
        let fabric = fabric();
        start_race(&fabric);
        for tick in 0..=137 {
            fabric.broadcast_tick(tick, vec![f64::from(tick)]);
        }

        let (handle, mut rx) = fabric.subscribe(Encoding::Delta, false);

        // Mid-interval ticks: still droppable, still gated.
        for tick in 138..140 {
            fabric.broadcast_tick(tick, vec![f64::from(tick)]);
        }
        // Next keyframe boundary.
        fabric.broadcast_tick(140, vec![140.0]);
        fabric.broadcast_tick(141, vec![141.0]);

        let frames = drain(&mut rx, &handle.buffered_bytes());
        assert!(matches!(frames[0], Frame::Info { .. }));

        let first_race_frame = frames
            .iter()
            .find(|f| !matches!(f, Frame::Info { .. }))
            .expect("race frames arrived");
        assert!(
            matches!(first_race_frame, Frame::Keyframe { tick_index: 140, .. }),
            "first frame after info must be a keyframe, got {first_race_frame:?}"
        );

        // The delta that follows anchors to that keyframe.
        let delta = frames
            .iter()
            .find(|f| matches!(f, Frame::Delta { .. }))
            .expect("delta after keyframe");
        if let Frame::Delta {
            keyframe_tick,
            tick_index,
            ..
        } = delta
        {
            assert_eq!(*keyframe_tick, 140);
            assert_eq!(*tick_index, 141);
        }
    }

    /// Back-pressure isolates subscribers: the slow one loses tick frames
    /// only, the healthy one sees everything.
    #[tokio::test]
    async fn test_backpressure_isolation() {
        let metrics = Arc::new(EngineMetrics::new());
        let fabric = Arc::new(BroadcastFabric::new(20, 1_000_000, None, Arc::clone(&metrics)));
        let config = start_race(&fabric);

        let (slow, mut slow_rx) = fabric.subscribe(Encoding::Plain, false);
        let (healthy, mut healthy_rx) = fabric.subscribe(Encoding::Plain, false);

        // Force the slow subscriber's outbound buffer over the threshold.
        slow.buffered_bytes().store(2_000_000, Ordering::Relaxed);

        for tick in 0..45 {
            fabric.broadcast_tick(tick, vec![1.0, 2.0, 3.0]);
        }

        let slow_frames = drain(&mut slow_rx, &slow.buffered_bytes());
        let healthy_frames = drain(&mut healthy_rx, &healthy.buffered_bytes());

        // Healthy subscriber: every tick frame, every keyframe.
        let healthy_ticks = healthy_frames
            .iter()
            .filter(|f| matches!(f, Frame::Tick { .. }))
            .count();
        let healthy_keyframes = healthy_frames
            .iter()
            .filter(|f| matches!(f, Frame::Keyframe { .. }))
            .count();
        assert_eq!(healthy_ticks, 42); // 45 ticks minus keyframes at 0/20/40
        assert_eq!(healthy_keyframes, 3);

        // Slow subscriber: keyframes arrive, tick frames do not.
        let slow_ticks = slow_frames
            .iter()
            .filter(|f| matches!(f, Frame::Tick { .. }))
            .count();
        let slow_keyframes = slow_frames
            .iter()
            .filter(|f| matches!(f, Frame::Keyframe { .. }))
            .count();
        assert_eq!(slow_ticks, 0);
        assert_eq!(slow_keyframes, 3);

        // The drop counter moved exactly by the slow subscriber's losses.
        assert_eq!(metrics.dropped_for(&config.race_id), 42);
    }

    /// Catch-up respects the window bound and the current tick.
    #[tokio::test]
    async fn test_catchup_window_bounds() {
        let fabric = fabric();
        let config = start_race(&fabric);
        for tick in 0..=120 {
            fabric.broadcast_tick(tick, vec![f64::from(tick)]);
        }

        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);
        fabric.handle_sync_request(&handle, &config.race_id, Some(0), Instant::now());

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let catchup = frames
            .iter()
            .find_map(|f| match f {
                Frame::Catchup {
                    start_index,
                    ticks,
                    current_tick_index,
                    ..
                } => Some((*start_index, ticks.clone(), *current_tick_index)),
                _ => None,
            })
            .expect("catchup frame");

        let (start, ticks, current) = catchup;
        assert_eq!(current, 120);
        assert!(ticks.len() as Tick <= MAX_CATCHUP_TICKS);
        assert_eq!(start, 120 - (MAX_CATCHUP_TICKS - 1));
        assert_eq!(ticks.len() as Tick, MAX_CATCHUP_TICKS);
        // Oldest entry first.
        assert_eq!(ticks[0], vec![f64::from(start)]);
        assert_eq!(ticks.last().unwrap(), &vec![120.0]);

        // Completion marker follows.
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::SyncComplete { current_tick_index: 120, .. })));
    }

    #[tokio::test]
    async fn test_catchup_default_window() {
        let fabric = fabric();
        let config = start_race(&fabric);
        for tick in 0..=100 {
            fabric.broadcast_tick(tick, vec![f64::from(tick)]);
        }

        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);
        fabric.handle_sync_request(&handle, &config.race_id, None, Instant::now());

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let ticks = frames
            .iter()
            .find_map(|f| match f {
                Frame::Catchup { ticks, .. } => Some(ticks.len() as Tick),
                _ => None,
            })
            .expect("catchup frame");
        assert_eq!(ticks, DEFAULT_CATCHUP_WINDOW);
    }

    #[tokio::test]
    async fn test_catchup_cooldown_silently_ignores() {
        let fabric = fabric();
        let config = start_race(&fabric);
        for tick in 0..10 {
            fabric.broadcast_tick(tick, vec![0.0]);
        }

        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);
        let t0 = Instant::now();
        fabric.handle_sync_request(&handle, &config.race_id, None, t0);
        fabric.handle_sync_request(&handle, &config.race_id, None, t0 + Duration::from_millis(500));

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let catchups = frames
            .iter()
            .filter(|f| matches!(f, Frame::Catchup { .. }))
            .count();
        assert_eq!(catchups, 1, "second request inside cooldown must be ignored");

        // After the cooldown, requests work again.
        fabric.handle_sync_request(&handle, &config.race_id, None, t0 + Duration::from_secs(3));
        let frames = drain(&mut rx, &handle.buffered_bytes());
        assert!(frames.iter().any(|f| matches!(f, Frame::Catchup { .. })));
    }

    #[tokio::test]
    async fn test_catchup_unknown_race_errors() {
        let fabric = fabric();
        start_race(&fabric);
        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);

        fabric.handle_sync_request(&handle, "race-404", None, Instant::now());
        let frames = drain(&mut rx, &handle.buffered_bytes());
        assert!(frames.iter().any(|f| matches!(f, Frame::Error { .. })));
    }

    /// Delta-mode catch-up re-sends the anchoring keyframe first.
    #[tokio::test]
    async fn test_delta_catchup_includes_keyframe() {
        let fabric = fabric();
        let config = start_race(&fabric);
        for tick in 0..=45 {
            fabric.broadcast_tick(tick, vec![f64::from(tick)]);
        }

        let (handle, mut rx) = fabric.subscribe(Encoding::Delta, false);
        fabric.handle_sync_request(&handle, &config.race_id, None, Instant::now());

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let keyframe_pos = frames
            .iter()
            .position(|f| matches!(f, Frame::Keyframe { .. }))
            .expect("keyframe in catchup response");
        let catchup_pos = frames
            .iter()
            .position(|f| matches!(f, Frame::Catchup { .. }))
            .expect("catchup frame");
        assert!(keyframe_pos < catchup_pos, "keyframe must precede the window");

        if let Frame::Keyframe { tick_index, .. } = frames[keyframe_pos] {
            assert_eq!(tick_index, 40, "latest keyframe is the anchor");
        }
    }

    #[tokio::test]
    async fn test_edge_rebroadcast_preserves_payload() {
        let fabric = fabric();
        fabric.set_role(Role::Edge);
        start_race(&fabric);
        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);
        let _ = drain(&mut rx, &handle.buffered_bytes());

        let payload = r#"{"type":"race:tick","seq":9,"raceId":"race-1","tickIndex":3,"tickTs":1150,"positions":[5.0],"protoVer":1}"#;
        fabric.rebroadcast_text(payload);

        let message = rx.try_recv().expect("rebroadcast delivered");
        let WireMessage::Text(text) = message else {
            panic!("rebroadcast must stay text");
        };
        assert_eq!(text, payload, "edges must not alter sequenced frames");
    }

    #[tokio::test]
    async fn test_seq_resets_per_race() {
        let fabric = fabric();
        let (handle, mut rx) = fabric.subscribe(Encoding::Plain, false);

        start_race(&fabric);
        fabric.broadcast_tick(0, vec![0.0]);
        let _ = drain(&mut rx, &handle.buffered_bytes());

        // Second race: seq starts over at 1.
        let config = RaceConfig::new("race-2", "cycle-2");
        let horses = derive_horses(&config);
        fabric.begin_race(&config, &horses, 61_000);

        let frames = drain(&mut rx, &handle.buffered_bytes());
        let start = frames
            .iter()
            .find(|f| matches!(f, Frame::Start { .. }))
            .expect("start frame");
        assert_eq!(start.seq(), Some(1));
    }
}
