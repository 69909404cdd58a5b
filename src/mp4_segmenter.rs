// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `Mp4Segmenter`: produces an append-only series of indexed `.mp4` files
//! per stream.
//!
//! Runs on its own dedicated worker thread, subscribing to a stream's
//! [`PacketBus`] with [`DropPolicy::BlockThenDropOldestNonKeyframe`]. A
//! [`Mp4SegmenterHandle`] lets the `Supervisor` start/stop continuous
//! scheduled recording and lets `DetectionWorker` drive the
//! detection-triggered "extend the current segment" hook without either of
//! them touching the writer's internal state directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::err;
use base::shutdown::Receiver as ShutdownReceiver;
use base::Error;
use tracing::{debug, info, warn};

use db::recording::{NewRecording, Trigger};
use db::schema::Database;

use crate::bus::{PacketBus, Subscription};
use crate::mp4_box_writer::{Mp4BoxWriter, MP4_TIME_BASE};
use crate::packet::Packet;

#[derive(Clone, Debug)]
pub struct SegmenterConfig {
    pub mp4_root: PathBuf,
    pub thumbnails_root: PathBuf,
    pub segment_duration_sec: i64,
    pub thumbnails_enabled: bool,
}

struct Control {
    enabled: AtomicBool,
    extend_until_micros: AtomicI64,
    pending_preroll: Mutex<Vec<Packet>>,
    current_path: Mutex<Option<PathBuf>>,
    disk_full: AtomicBool,
    quota_exceeded: AtomicBool,
}

/// A cheaply-cloneable handle to control a running [`Mp4Segmenter`] from
/// other components.
#[derive(Clone)]
pub struct Mp4SegmenterHandle {
    control: Arc<Control>,
}

impl Mp4SegmenterHandle {
    /// Turns continuous, schedule-triggered recording on or off. Used by the
    /// `Supervisor` for `StreamConfig.record` and the `start`/`stop`
    /// contract operations.
    pub fn set_enabled(&self, enabled: bool) {
        self.control.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.control.enabled.load(Ordering::Acquire)
    }

    /// Called by `DetectionWorker` when a detection fires while idle: seeds
    /// the about-to-open segment with the drained pre-roll buffer and
    /// requests the segment stay open until `active_until`.
    pub fn trigger_detection(&self, preroll: Vec<Packet>, active_until: jiff::Timestamp) {
        *self.control.pending_preroll.lock().unwrap() = preroll;
        self.extend(active_until);
    }

    /// Pushes the extension deadline further out: overlapping triggers,
    /// the `Active -> Active` self-transition.
    pub fn extend(&self, active_until: jiff::Timestamp) {
        let micros = active_until.as_microsecond();
        let mut cur = self.control.extend_until_micros.load(Ordering::Acquire);
        while micros > cur {
            match self.control.extend_until_micros.compare_exchange_weak(
                cur,
                micros,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    fn extend_until(&self) -> Option<jiff::Timestamp> {
        let micros = self.control.extend_until_micros.load(Ordering::Acquire);
        if micros == 0 {
            return None;
        }
        jiff::Timestamp::from_microsecond(micros).ok()
    }

    /// Drops any pending detection extension without waiting for it to
    /// expire naturally: the `Active, stream disabled/shutdown -> close
    /// immediately` transition calls this before disabling so
    /// `wants_open` stops being held true by a stale extension.
    pub fn cancel_extension(&self) {
        self.control.extend_until_micros.store(0, Ordering::Release);
    }

    fn take_pending_preroll(&self) -> Vec<Packet> {
        std::mem::take(&mut self.control.pending_preroll.lock().unwrap())
    }

    /// The path of the currently-open segment, if any. Used by
    /// `RetentionTask` to keep an in-flight segment out of both the age and
    /// quota reclamation passes.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.control.current_path.lock().unwrap().clone()
    }

    /// Health flag surfaced to the API collaborator: set when
    /// the last segment open failed due to an actual out-of-space error or
    /// a quota refusal.
    pub fn disk_full(&self) -> bool {
        self.control.disk_full.load(Ordering::Acquire)
    }

    /// Set by the `RetentionTask` after each tick. Checked
    /// before every segment open; does not affect a segment already open.
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.control.quota_exceeded.store(exceeded, Ordering::Release);
    }
}

/// True for either an actual out-of-space error or a quota refusal
///, both surfaced through the same health flag.
fn is_disk_full(e: &Error) -> bool {
    let msg = e.chain().to_lowercase();
    msg.contains("no space left") || msg.contains("quota exceeded")
}

struct OpenSegment {
    trigger: Trigger,
    wall_start: jiff::Timestamp,
    deadline: jiff::Timestamp,
    path: PathBuf,
    writer: Mp4BoxWriter,
    last_pts_secs: Option<f64>,
    has_detection: bool,
    thumbnail_candidate: Option<Vec<u8>>,
}

pub struct Mp4Segmenter {
    stream: String,
    config: SegmenterConfig,
    db: Arc<Database>,
}

impl Mp4Segmenter {
    pub fn new(stream: impl Into<String>, config: SegmenterConfig, db: Arc<Database>) -> (Self, Mp4SegmenterHandle) {
        let handle = Mp4SegmenterHandle {
            control: Arc::new(Control {
                enabled: AtomicBool::new(false),
                extend_until_micros: AtomicI64::new(0),
                pending_preroll: Mutex::new(Vec::new()),
                current_path: Mutex::new(None),
                disk_full: AtomicBool::new(false),
                quota_exceeded: AtomicBool::new(false),
            }),
        };
        (
            Mp4Segmenter {
                stream: stream.into(),
                config,
                db,
            },
            handle,
        )
    }

    /// Wraps `open_segment`, updating `handle`'s `disk_full` flag and logging
    /// on failure instead of propagating the error. Used by the rotation
    /// points that can't otherwise report an open failure to a caller.
    fn try_open_segment(&self, now: jiff::Timestamp, bus: &PacketBus, handle: &Mp4SegmenterHandle) -> Option<OpenSegment> {
        match self.open_segment(now, bus, handle) {
            Ok(seg) => {
                handle.control.disk_full.store(false, Ordering::Release);
                Some(seg)
            }
            Err(e) => {
                if is_disk_full(&e) {
                    handle.control.disk_full.store(true, Ordering::Release);
                }
                warn!(stream = %self.stream, err = %e.chain(), "failed to reopen segment");
                None
            }
        }
    }

    fn segment_path(&self, wall_start: jiff::Timestamp) -> Result<PathBuf, Error> {
        let zoned = wall_start.to_zoned(jiff::tz::TimeZone::UTC);
        Ok(self
            .config
            .mp4_root
            .join(&self.stream)
            .join(format!("{:04}", zoned.year()))
            .join(format!("{:02}", zoned.month()))
            .join(format!("{:02}", zoned.day()))
            .join(format!("{:02}{:02}{:02}.mp4", zoned.hour(), zoned.minute(), zoned.second())))
    }

    /// Blocks until `shutdown_rx` fires, consuming `sub` and writing
    /// segments per `handle`'s control state. Any in-flight segment is
    /// finalized (moov flushed, indexed) before returning, never discarded.
    pub fn run<C: Clocks>(
        &self,
        clocks: &C,
        bus: &PacketBus,
        sub: &Subscription,
        handle: &Mp4SegmenterHandle,
        shutdown_rx: &ShutdownReceiver,
    ) {
        let mut open: Option<OpenSegment> = None;
        loop {
            if shutdown_rx.check().is_err() {
                if let Some(seg) = open.take() {
                    self.finalize(seg, handle);
                }
                return;
            }

            let wants_open = handle.is_enabled() || handle.extend_until().is_some();

            let packet = match sub.recv_timeout(Duration::from_millis(100)) {
                Some(p) => p,
                None => {
                    if !wants_open {
                        if let Some(seg) = open.take() {
                            info!(stream = %self.stream, "recording disabled, closing segment");
                            self.finalize(seg, handle);
                        }
                    }
                    continue;
                }
            };
            if packet.is_audio() {
                // This codebase's ingest path (`crate::stream`) only demuxes
                // video; see `mp4_box_writer`'s module doc.
                continue;
            }

            let now = clocks.realtime();

            if open.is_none() {
                if !wants_open || !packet.is_keyframe {
                    continue;
                }
                match self.open_segment(now, bus, handle) {
                    Ok(seg) => {
                        handle.control.disk_full.store(false, Ordering::Release);
                        open = Some(seg)
                    }
                    Err(e) => {
                        if is_disk_full(&e) {
                            handle.control.disk_full.store(true, Ordering::Release);
                        }
                        warn!(stream = %self.stream, err = %e.chain(), "failed to open segment");
                        continue;
                    }
                }
            }

            if let Some(seg) = open.as_ref() {
                if let Some(last) = seg.last_pts_secs {
                    let delta = packet.time_base.ticks_to_secs_f64(packet.pts) - last;
                    if delta.abs() > 2.0 * self.config.segment_duration_sec as f64 {
                        info!(stream = %self.stream, "pts discontinuity, closing segment early");
                        let finished = open.take().unwrap();
                        self.finalize(finished, handle);
                        if packet.is_keyframe && wants_open {
                            open = self.try_open_segment(now, bus, handle);
                        }
                    }
                }
            }
            if open.is_none() {
                continue;
            }

            let active_until = handle.extend_until();
            // Either the schedule-based rotation point, or a detection's
            // post-roll extension expiring, closes the segment -- whichever
            // comes first.
            let deadline_hit =
                packet.is_keyframe && (now >= open.as_ref().unwrap().deadline || active_until.is_some_and(|d| now >= d));
            if deadline_hit {
                let still_active = active_until.is_some_and(|d| now < d);
                if still_active {
                    let seg = open.as_mut().unwrap();
                    seg.trigger = Trigger::Detection;
                    seg.has_detection = true;
                } else {
                    let finished = open.take().unwrap();
                    self.finalize(finished, handle);
                    // The extension just expired: clear it so a stale
                    // `extend_until_micros` doesn't keep `wants_open` true
                    // forever and reopen a fresh `trigger=detection`
                    // segment on every subsequent keyframe.
                    handle.cancel_extension();
                    if handle.is_enabled() {
                        open = self.try_open_segment(now, bus, handle);
                    }
                }
            }
            if open.is_none() {
                continue;
            }

            if let Some(seg) = open.as_mut() {
                self.write_packet(seg, &packet);
            }
        }
    }

    fn open_segment(
        &self,
        now: jiff::Timestamp,
        bus: &PacketBus,
        handle: &Mp4SegmenterHandle,
    ) -> Result<OpenSegment, Error> {
        if handle.control.quota_exceeded.load(Ordering::Acquire) {
            return Err(err!(ResourceExhausted, msg("storage quota exceeded, refusing new mp4 segment")));
        }
        let preroll = handle.take_pending_preroll();
        let trigger = if preroll.is_empty() && handle.is_enabled() {
            Trigger::Schedule
        } else {
            Trigger::Detection
        };
        let video_entry = bus
            .video_sample_entry()
            .ok_or_else(|| err!(FailedPrecondition, msg("no video sample entry yet, stream not connected")))?;
        let path = self.segment_path(now)?;
        let writer = Mp4BoxWriter::create(&path, video_entry)?;
        *handle.control.current_path.lock().unwrap() = Some(path.clone());
        let mut seg = OpenSegment {
            trigger,
            wall_start: now,
            deadline: now + Duration::from_secs(self.config.segment_duration_sec.max(1) as u64),
            path,
            writer,
            last_pts_secs: None,
            has_detection: !preroll.is_empty(),
            thumbnail_candidate: None,
        };
        for p in &preroll {
            if p.is_video() {
                self.write_packet(&mut seg, p);
            }
        }
        Ok(seg)
    }

    fn write_packet(&self, seg: &mut OpenSegment, packet: &Packet) {
        let ticks = MP4_TIME_BASE.secs_to_ticks(packet.time_base.ticks_to_secs_f64(packet.pts));
        seg.last_pts_secs = Some(packet.time_base.ticks_to_secs_f64(packet.pts));
        if packet.is_keyframe && seg.thumbnail_candidate.is_none() && seg.writer.sample_count() > 0 {
            seg.thumbnail_candidate = Some(packet.payload.to_vec());
        }
        if let Err(e) = seg.writer.write_sample(ticks, &packet.payload, packet.is_keyframe) {
            warn!(stream = %self.stream, err = %e.chain(), "dropping sample, write failed");
        }
    }

    fn finalize(&self, seg: OpenSegment, handle: &Mp4SegmenterHandle) {
        *handle.control.current_path.lock().unwrap() = None;
        let wall_start = seg.wall_start;
        let trigger = seg.trigger;
        let has_detection = seg.has_detection;
        let thumbnail_candidate = seg.thumbnail_candidate.clone();
        let finished = match seg.writer.finish() {
            Ok(f) => f,
            Err(e) => {
                warn!(stream = %self.stream, err = %e.chain(), "failed to finalize segment");
                return;
            }
        };
        if finished.sample_count == 0 {
            let _ = std::fs::remove_file(&finished.path);
            return;
        }
        let wall_end_secs = wall_start.as_second() + (finished.duration_ticks / MP4_TIME_BASE.den as u64) as i64;
        let new_recording = NewRecording {
            stream: self.stream.clone(),
            file_path: finished.path.clone(),
            wall_start: wall_start.as_second(),
            wall_end: wall_end_secs.max(wall_start.as_second() + 1),
            size_bytes: finished.size_bytes as i64,
            trigger,
            has_detection,
            thumbnail_path: None,
        };
        match self.db.insert_recording(&new_recording) {
            Ok(id) => {
                info!(stream = %self.stream, recording_id = id, samples = finished.sample_count, "segment indexed");
                if has_detection {
                    match self.db.link_detections_to_recording(&self.stream, wall_start.as_second(), wall_end_secs.max(wall_start.as_second() + 1), id) {
                        Ok(n) => debug!(stream = %self.stream, recording_id = id, linked = n, "linked detections to segment"),
                        Err(e) => warn!(stream = %self.stream, recording_id = id, err = %e.chain(), "failed to link detections"),
                    }
                }
                if self.config.thumbnails_enabled {
                    if let Some(jpeg) = thumbnail_candidate {
                        if let Some(path) = self.write_thumbnail(id, &jpeg) {
                            let _ = self.db.set_thumbnail(id, &path);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(stream = %self.stream, err = %e.chain(), "failed to index finalized segment");
            }
        }
    }

    /// Best-effort thumbnail from a mid-segment keyframe. Only Motion-JPEG
    /// payloads can be thumbnailed without a video decoder dependency this
    /// workspace doesn't carry; H.264/H.265 keyframes are skipped (see
    /// `DESIGN.md`).
    fn write_thumbnail(&self, id: db::RecordingId, jpeg_bytes: &[u8]) -> Option<PathBuf> {
        let img = match image::load_from_memory(jpeg_bytes) {
            Ok(img) => img,
            Err(_) => {
                debug!(stream = %self.stream, recording_id = id, "keyframe is not a decodable still image, skipping thumbnail");
                return None;
            }
        };
        let thumb = img.thumbnail(320, 180);
        let path = self.config.thumbnails_root.join(format!("{id}.jpg"));
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return None;
            }
        }
        match thumb.save(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(stream = %self.stream, recording_id = id, err = %e, "failed to write thumbnail");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, DropPolicy};
    use crate::media::VideoSampleEntry;
    use crate::packet::{TimeBase, STREAM_INDEX_VIDEO};
    use base::clock::SimulatedClocks;
    use tempfile::TempDir;

    fn test_video_entry() -> VideoSampleEntry {
        VideoSampleEntry {
            data: vec![0u8; 16],
            rfc6381_codec: "avc1.4d401e".to_string(),
            width: 640,
            height: 480,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        }
    }

    fn pkt(pts: i64, keyframe: bool) -> Packet {
        Packet {
            stream_index: STREAM_INDEX_VIDEO,
            pts,
            dts: pts,
            duration: 0,
            is_keyframe: keyframe,
            payload: bytes::Bytes::from_static(b"nal-unit-payload"),
            time_base: TimeBase { num: 1, den: 90_000 },
        }
    }

    struct Harness {
        _tmp: TempDir,
        db: Arc<Database>,
        segmenter: Mp4Segmenter,
        handle: Mp4SegmenterHandle,
        bus: Arc<PacketBus>,
    }

    fn harness(segment_duration_sec: i64) -> Harness {
        db::testutil::init();
        let tmp = tempfile::Builder::new().prefix("mp4seg-test").tempdir().unwrap();
        let db = Arc::new(Database::open(&tmp.path().join("lightnvr.db")).unwrap());
        let config = SegmenterConfig {
            mp4_root: tmp.path().join("mp4"),
            thumbnails_root: tmp.path().join("thumbnails"),
            segment_duration_sec,
            thumbnails_enabled: false,
        };
        let (segmenter, handle) = Mp4Segmenter::new("cam1", config, db.clone());
        let bus = Arc::new(PacketBus::named("cam1", BusConfig::default()));
        bus.set_video_sample_entry(test_video_entry());
        Harness {
            _tmp: tmp,
            db,
            segmenter,
            handle,
            bus,
        }
    }

    #[test]
    fn rotates_on_keyframe_at_deadline_and_indexes_rows() {
        let h = harness(2);
        h.handle.set_enabled(true);
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(1_000_000).unwrap());
        let sub = h.bus.subscribe(64, DropPolicy::BlockThenDropOldestNonKeyframe);
        let (tx, rx) = base::shutdown::channel();
        let bus = h.bus.clone();
        let handle = h.handle.clone();
        let clocks_for_worker = clocks.clone();
        let worker = std::thread::spawn(move || h.segmenter.run(&clocks_for_worker, &bus, &sub, &handle, &rx));

        for i in 0..7i64 {
            let is_key = i % 3 == 0;
            h.bus.publish(pkt(i * 90_000, is_key));
            std::thread::sleep(Duration::from_millis(30));
            if is_key {
                clocks.sleep(Duration::from_secs(3));
            }
        }
        drop(tx);
        worker.join().unwrap();

        let rows = h.db.list_recordings(&Default::default()).unwrap();
        assert!(!rows.is_empty(), "expected at least one finalized segment");
        for row in &rows {
            assert_eq!(row.trigger, Trigger::Schedule);
            assert!(row.file_path.exists());
        }
    }

    #[test]
    fn disabled_stream_writes_nothing() {
        let h = harness(2);
        let sub = h.bus.subscribe(64, DropPolicy::BlockThenDropOldestNonKeyframe);
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(2_000_000).unwrap());
        let (tx, rx) = base::shutdown::channel();
        let bus = h.bus.clone();
        let handle = h.handle.clone();
        let worker = std::thread::spawn(move || h.segmenter.run(&clocks, &bus, &sub, &handle, &rx));
        h.bus.publish(pkt(0, true));
        h.bus.publish(pkt(90_000, false));
        std::thread::sleep(Duration::from_millis(50));
        drop(tx);
        worker.join().unwrap();
        assert!(h.db.list_recordings(&Default::default()).unwrap().is_empty());
    }

    #[test]
    fn detection_trigger_opens_segment_with_preroll() {
        let h = harness(30);
        let sub = h.bus.subscribe(64, DropPolicy::BlockThenDropOldestNonKeyframe);
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(3_000_000).unwrap());
        let active_until = clocks.realtime() + Duration::from_secs(5);
        h.handle.trigger_detection(vec![pkt(0, true), pkt(3_000, false)], active_until);
        let (tx, rx) = base::shutdown::channel();
        let bus = h.bus.clone();
        let handle = h.handle.clone();
        let clocks_for_worker = clocks.clone();
        let worker = std::thread::spawn(move || h.segmenter.run(&clocks_for_worker, &bus, &sub, &handle, &rx));

        h.bus.publish(pkt(180_000, true));
        std::thread::sleep(Duration::from_millis(30));
        clocks.sleep(Duration::from_secs(6));
        h.bus.publish(pkt(270_000, true));
        std::thread::sleep(Duration::from_millis(30));
        drop(tx);
        worker.join().unwrap();

        let rows = h.db.list_recordings(&Default::default()).unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0].trigger, Trigger::Detection);
        assert!(rows[0].has_detection);
    }
}
