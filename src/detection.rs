// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `DetectionWorker` and the per-stream trigger controller.
//!
//! One `DetectionWorker` per stream subscribes to the `PacketBus` with
//! [`DropPolicy::DropNewest`], samples a frame every `detection_interval`
//! seconds, and dispatches decode+inference to a shared [`WorkerPool`]
//! bounded to (by default) the CPU count. The [`TriggerController`] owns
//! the Idle/Active state machine and is the only thing allowed to call
//! into [`Mp4SegmenterHandle`]'s detection hooks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;
use tracing::{debug, warn};

use db::detection::{BoundingBox, NewDetection};
use db::schema::Database;

use crate::bus::{DropPolicy, PacketBus, Subscription};
use crate::detector::{Backend, FrameRgb};
use crate::mp4_segmenter::Mp4SegmenterHandle;
use crate::packet::Packet;
use crate::preroll::PreRollBuffer;

/// Bounded shared executor for decode+inference. This workspace
/// carries no thread-pool crate, so permits are tracked with a plain atomic
/// counter and work runs on a short-lived `std::thread::spawn` per sample --
/// detection sampling is already rate-limited to one frame per
/// `detection_interval` per stream, so pool churn is bounded by stream count
/// times sample rate, not by packet rate.
pub struct WorkerPool {
    capacity: usize,
    in_use: AtomicUsize,
    pub dropped_samples: AtomicUsize,
}

pub struct PoolPermit<'a> {
    pool: &'a WorkerPool,
}

impl Drop for PoolPermit<'_> {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        WorkerPool {
            capacity: capacity.max(1),
            in_use: AtomicUsize::new(0),
            dropped_samples: AtomicUsize::new(0),
        }
    }

    pub fn cpu_count() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    pub fn try_acquire(&self) -> Option<PoolPermit<'_>> {
        let mut cur = self.in_use.load(Ordering::Acquire);
        loop {
            if cur >= self.capacity {
                self.dropped_samples.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            match self
                .in_use
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(PoolPermit { pool: self }),
                Err(observed) => cur = observed,
            }
        }
    }
}

/// Decodes an encoded keyframe (plus any following P-frames up to the
/// sample point) into RGB. This workspace carries no video decoder, so
/// decoding is itself behind a trait supplied by the embedder, matching the
/// `Detector` seam in `crate::detector`.
pub trait Decoder: Send + Sync {
    fn decode_to_rgb(&self, packets: &[Packet]) -> Option<(u32, u32, Vec<u8>)>;
}

/// Publishes fired detections to the external event collaborator. Calls are
/// fire-and-forget; errors are logged by the implementation, not propagated.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, stream: &str, wall_time: jiff::Timestamp, detections: &[DetectionBoxEvent]);
}

#[derive(Clone, Debug)]
pub struct DetectionBoxEvent {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub track_id: Option<i64>,
}

/// A no-op publisher for configurations with no telemetry sink wired up.
pub struct NullPublisher;
impl EventPublisher for NullPublisher {
    fn publish(&self, _stream: &str, _wall_time: jiff::Timestamp, _detections: &[DetectionBoxEvent]) {}
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TriggerState {
    Idle,
    Active { active_until: jiff::Timestamp },
}

/// The Idle/Active state machine, one instance per stream. The state lock
/// is held across the pre-roll drain and the call into the segmenter handle
/// so a concurrent detection can't observe a torn Idle-to-Active transition;
/// both of those are non-blocking (`Mp4SegmenterHandle` only enqueues a
/// command), so this never holds the lock across real I/O.
pub struct TriggerController {
    stream: String,
    pre_roll_sec: f64,
    post_roll_sec: f64,
    state: Mutex<TriggerState>,
}

impl TriggerController {
    pub fn new(stream: impl Into<String>, pre_roll_sec: f64, post_roll_sec: f64) -> Self {
        TriggerController {
            stream: stream.into(),
            pre_roll_sec,
            post_roll_sec,
            state: Mutex::new(TriggerState::Idle),
        }
    }

    /// `Idle, detection fires -> drain PreRollBuffer into a new segment;
    /// Active, detection fires -> extend`.
    fn on_detection(&self, now: jiff::Timestamp, preroll: &PreRollBuffer, mp4: &Mp4SegmenterHandle) {
        let active_until = now + Duration::from_secs_f64(self.post_roll_sec.max(0.0));
        let mut state = self.state.lock().unwrap();
        match *state {
            TriggerState::Idle => {
                let drained = preroll.drain_from_last_keyframe(self.pre_roll_sec, now);
                mp4.trigger_detection(drained, active_until);
                debug!(stream = %self.stream, active_until = %active_until, "detection opened recording window");
                *state = TriggerState::Active { active_until };
            }
            TriggerState::Active { active_until: cur } => {
                let extended = cur.max(active_until);
                mp4.extend(extended);
                *state = TriggerState::Active { active_until: extended };
            }
        }
    }

    /// `Active, now >= active_until -> Idle`. Called on every timer tick;
    /// the actual segment close happens inside `Mp4Segmenter` once its own
    /// deadline check observes the same expired extension, so this just
    /// tracks the controller's own state for the next detection to arrive.
    fn on_timer_tick(&self, now: jiff::Timestamp) {
        let mut state = self.state.lock().unwrap();
        if let TriggerState::Active { active_until } = *state {
            if now >= active_until {
                *state = TriggerState::Idle;
            }
        }
    }

    /// `Active, stream disabled/shutdown -> close immediately`.
    fn on_disabled_or_shutdown(&self, mp4: &Mp4SegmenterHandle) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, TriggerState::Active { .. }) {
            mp4.cancel_extension();
            *state = TriggerState::Idle;
        }
    }
}

pub struct DetectionWorkerConfig {
    pub interval: Duration,
    pub threshold: f64,
    pub object_filter: HashSet<String>,
}

/// One detection sampler for one stream. Owns its `TriggerController`;
/// `run` blocks the calling thread until shutdown, matching every other
/// per-stream worker in this codebase.
pub struct DetectionWorker {
    stream: String,
    config: DetectionWorkerConfig,
    backend: Arc<Backend>,
    decoder: Arc<dyn Decoder>,
    pool: Arc<WorkerPool>,
    db: Arc<Database>,
    preroll: Arc<PreRollBuffer>,
    controller: Arc<TriggerController>,
    publisher: Arc<dyn EventPublisher>,
}

impl DetectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: impl Into<String>,
        config: DetectionWorkerConfig,
        backend: Arc<Backend>,
        decoder: Arc<dyn Decoder>,
        pool: Arc<WorkerPool>,
        db: Arc<Database>,
        preroll: Arc<PreRollBuffer>,
        controller: Arc<TriggerController>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        DetectionWorker {
            stream: stream.into(),
            config,
            backend,
            decoder,
            pool,
            db,
            preroll,
            controller,
            publisher,
        }
    }

    pub fn controller(&self) -> Arc<TriggerController> {
        self.controller.clone()
    }

    /// Subscribes to `bus` for sample material, ticks its own interval
    /// timer, and drives `mp4` through `self.controller`. Returns on
    /// shutdown.
    pub fn run<C: Clocks>(&self, clocks: &C, bus: &PacketBus, shutdown_rx: &ShutdownReceiver, mp4: &Mp4SegmenterHandle) {
        let sub = bus.subscribe(16, DropPolicy::DropNewest);
        let in_flight = Arc::new(AtomicBool::new(false));
        let mut pending: Vec<Packet> = Vec::new();
        let mut next_sample = clocks.realtime();

        loop {
            if shutdown_rx.check().is_err() {
                self.controller.on_disabled_or_shutdown(mp4);
                return;
            }

            let now = clocks.realtime();
            self.controller.on_timer_tick(now);

            let Some(packet) = sub.recv_timeout(Duration::from_millis(100)) else {
                continue;
            };
            if !packet.is_video() {
                continue;
            }
            if packet.is_keyframe {
                pending.clear();
            }
            pending.push(packet.clone());

            if now < next_sample {
                continue;
            }
            next_sample = now + self.config.interval;

            if in_flight.load(Ordering::Acquire) {
                continue; // at most one sample in flight per stream
            }
            let Some(permit) = self.pool.try_acquire() else {
                debug!(stream = %self.stream, "detection worker pool saturated, dropping sample");
                continue;
            };

            in_flight.store(true, Ordering::Release);
            let sample_packets = pending.clone();
            let Some((width, height, rgb)) = self.decoder.decode_to_rgb(&sample_packets) else {
                drop(permit);
                in_flight.store(false, Ordering::Release);
                continue;
            };
            let frame = FrameRgb { width, height, rgb: &rgb };
            let result = self.backend.detector().detect(&frame, self.config.threshold);
            drop(permit);
            in_flight.store(false, Ordering::Release);

            let boxes = match result {
                Ok(boxes) => boxes,
                Err(e) => {
                    // DetectorError is SampleSkipped: logged, stream stays healthy.
                    warn!(stream = %self.stream, err = %e.chain(), "detector call failed, skipping sample");
                    continue;
                }
            };

            let fired: Vec<_> = boxes
                .into_iter()
                .filter(|b| b.confidence >= self.config.threshold)
                .filter(|b| self.config.object_filter.is_empty() || self.config.object_filter.contains(&b.label))
                .collect();
            if fired.is_empty() {
                continue;
            }

            for b in &fired {
                let row = NewDetection {
                    recording_id: None,
                    stream: self.stream.clone(),
                    wall_time: now.as_second(),
                    label: b.label.clone(),
                    confidence: b.confidence,
                    bbox: b.bbox.clone(),
                    track_id: None,
                };
                if let Err(e) = self.db.insert_detection(&row) {
                    warn!(stream = %self.stream, err = %e.chain(), "failed to record detection");
                }
            }
            self.controller.on_detection(now, &self.preroll, mp4);

            let events: Vec<_> = fired
                .into_iter()
                .map(|b| DetectionBoxEvent {
                    label: b.label,
                    confidence: b.confidence,
                    bbox: b.bbox,
                    track_id: None,
                })
                .collect();
            self.publisher.publish(&self.stream, now, &events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::detector::testutil::ScriptedDetector;
    use crate::mp4_segmenter::{Mp4Segmenter, SegmenterConfig};
    use crate::packet::{TimeBase, STREAM_INDEX_VIDEO};
    use base::clock::SimulatedClocks;
    use tempfile::TempDir;

    struct IdentityDecoder;
    impl Decoder for IdentityDecoder {
        fn decode_to_rgb(&self, packets: &[Packet]) -> Option<(u32, u32, Vec<u8>)> {
            if packets.is_empty() {
                None
            } else {
                Some((4, 4, vec![0u8; 48]))
            }
        }
    }

    fn pkt(pts: i64, keyframe: bool) -> Packet {
        Packet {
            stream_index: STREAM_INDEX_VIDEO,
            pts,
            dts: pts,
            duration: 0,
            is_keyframe: keyframe,
            payload: bytes::Bytes::from_static(b"x"),
            time_base: TimeBase { num: 1, den: 90_000 },
        }
    }

    #[test]
    fn worker_pool_drops_when_saturated() {
        let pool = WorkerPool::new(1);
        let p1 = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.dropped_samples.load(Ordering::Relaxed), 1);
        drop(p1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn trigger_controller_opens_then_closes_after_post_roll() {
        let preroll = PreRollBuffer::new(5.0, 15.0);
        let t0 = jiff::Timestamp::from_second(1_000).unwrap();
        preroll.push(t0, pkt(0, true));

        let (_tmp, db, seg_config) = harness_db();
        let (segmenter, handle) = Mp4Segmenter::new("cam1", seg_config, db.clone());
        let bus = Arc::new(PacketBus::named("cam1", BusConfig::default()));
        bus.set_video_sample_entry(crate::media::VideoSampleEntry {
            data: vec![0u8; 8],
            rfc6381_codec: "avc1.4d401e".to_string(),
            width: 64,
            height: 64,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        });

        let controller = TriggerController::new("cam1", 5.0, 10.0);
        controller.on_detection(t0, &preroll, &handle);
        assert!(matches!(*controller.state.lock().unwrap(), TriggerState::Active { .. }));

        let later = t0 + Duration::from_secs(20);
        controller.on_timer_tick(later);
        assert_eq!(*controller.state.lock().unwrap(), TriggerState::Idle);

        let _ = segmenter;
        let _ = bus;
    }

    fn harness_db() -> (TempDir, Arc<Database>, SegmenterConfig) {
        db::testutil::init();
        let tmp = tempfile::Builder::new().prefix("detect-test").tempdir().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("lightnvr.db")).unwrap());
        let config = SegmenterConfig {
            mp4_root: tmp.path().join("mp4"),
            thumbnails_root: tmp.path().join("thumbnails"),
            segment_duration_sec: 900,
            thumbnails_enabled: false,
        };
        (tmp, db, config)
    }

    #[test]
    fn scripted_detector_respects_threshold() {
        let det = ScriptedDetector {
            wants_hit: || true,
            label: "person".to_string(),
            confidence: 0.4,
        };
        let frame = FrameRgb { width: 1, height: 1, rgb: &[0, 0, 0] };
        use crate::detector::Detector;
        assert!(det.detect(&frame, 0.5).unwrap().is_empty());
        assert_eq!(det.detect(&frame, 0.3).unwrap().len(), 1);
    }

    #[test]
    fn decoder_returns_none_on_empty_sample() {
        let decoder = IdentityDecoder;
        assert!(decoder.decode_to_rgb(&[]).is_none());
        assert!(decoder.decode_to_rgb(&[pkt(0, true)]).is_some());
    }

    #[test]
    fn null_publisher_does_not_panic() {
        NullPublisher.publish("cam1", jiff::Timestamp::UNIX_EPOCH, &[]);
    }

    #[test]
    fn simulated_clock_advances_interval_deterministically() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap());
        let t0 = clocks.realtime();
        clocks.sleep(Duration::from_secs(5));
        assert_eq!(clocks.realtime().as_second() - t0.as_second(), 5);
    }
}
