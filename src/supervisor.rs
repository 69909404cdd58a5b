// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wires one running stream's workers together and owns the set of running
//! streams.
//!
//! Each stream gets its own thread per named worker (`Ingest`, `HlsWriter`,
//! `Mp4Segmenter`, `PreRollBuffer`, `DetectionWorker`), all fed by one
//! `PacketBus`. A single `RetentionTask` thread runs process-wide. Every
//! worker thread is registered with the `ShutdownCoordinator` so a SIGTERM
//! stops them in a bounded, observable order; `apply_config` tears down and
//! rebuilds only the streams a config change actually touches.

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use base::clock::RealClocks;
use base::shutdown::{self, Receiver as ShutdownReceiver};
use base::shutdown_coordinator::{ComponentHandle, ShutdownCoordinator};
use base::Error;

use db::retention::{GlobalPolicy, JobTracker, StreamPolicy, Tier};
use db::schema::Database;

use crate::bus::{BusConfig, DropPolicy, PacketBus};
use crate::config::{Config, DetectionConfig, GlobalConfig, Protocol, StreamConfig};
use crate::detection::{DetectionWorker, DetectionWorkerConfig, NullPublisher, WorkerPool};
use crate::detector::{Backend, Detector, DetectionBox, FrameRgb, JpegFrameDecoder};
use crate::health::{GlobalHealth, StreamHealth};
use crate::hls::{HlsConfig, HlsWriter, HlsWriterHandle};
use crate::mp4_segmenter::{Mp4Segmenter, Mp4SegmenterHandle, SegmenterConfig};
use crate::preroll::PreRollBuffer;
use crate::retention_task::{OpenFiles, RetentionTask};
use crate::stream::{self, Opener, Options};

/// Ordering of worker classes in the stop sequence: higher stops first.
/// Ingest is cut first so nothing new is published while downstream
/// writers drain and finalize what they already have; `RetentionTask`
/// (process-wide, registered separately) has the lowest priority of all.
mod priority {
    pub const INGEST: i32 = 50;
    pub const DETECTION: i32 = 40;
    pub const PREROLL: i32 = 30;
    pub const HLS: i32 = 20;
    pub const MP4: i32 = 20;
    pub const RETENTION: i32 = 0;
}

/// A detector that never fires. The actual embedded model is an external
/// collaborator this workspace doesn't link; this is
/// the stand-in wired in when no embedder-supplied `Detector` is passed to
/// [`Supervisor::new`], so a stream with `[detection]` configured still
/// runs (samples, decodes, calls the backend) rather than failing to
/// start. See `DESIGN.md`.
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, _frame: &FrameRgb, _threshold: f64) -> Result<Vec<DetectionBox>, Error> {
        Ok(Vec::new())
    }
}

/// A source of numbers in `[0, 1)` for `Backoff`'s jitter term. Seeded from
/// `std::collections::hash_map::RandomState`, which std itself seeds from
/// OS randomness on every construction — enough for jitter without adding
/// a dependency on a dedicated RNG crate.
fn rand_unit() -> f64 {
    let state = std::collections::hash_map::RandomState::new();
    let bits = state.build_hasher().finish();
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

/// Bridges the process-wide shutdown signal and a stream-specific stop
/// request into one [`ShutdownReceiver`], since every worker's `run` takes
/// exactly one. Returns a receiver that fires when either the global
/// coordinator shuts down or `stop_flag` is set, plus the thread driving
/// that bridge (joined when the stream is torn down).
fn spawn_stream_bridge(
    global_rx: ShutdownReceiver,
    stop_flag: Arc<AtomicBool>,
) -> (ShutdownReceiver, JoinHandle<()>) {
    let (local_tx, local_rx) = shutdown::channel();
    let handle = std::thread::Builder::new()
        .name("stream-bridge".into())
        .spawn(move || {
            let _local_tx = local_tx;
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    return;
                }
                match global_rx.wait_for(Duration::from_millis(200)) {
                    Ok(()) => continue,
                    Err(_) => return,
                }
            }
        })
        .expect("spawn stream-bridge thread");
    (local_rx, handle)
}

struct Worker {
    name: String,
    handle: ComponentHandle,
    join: JoinHandle<()>,
}

/// The process-wide retention worker plus the bridge that lets
/// `apply_config` restart it on its own, independent of a full process
/// shutdown (same mechanism as [`spawn_stream_bridge`], just not scoped to
/// one stream).
struct RetentionRuntime {
    worker: Worker,
    stop_flag: Arc<AtomicBool>,
    bridge: JoinHandle<()>,
}

/// Everything backing one configured, running stream.
struct StreamRuntime {
    config: StreamConfig,
    bus: Arc<PacketBus>,
    health: Arc<StreamHealth>,
    hls_handle: HlsWriterHandle,
    mp4_handle: Mp4SegmenterHandle,
    stop_flag: Arc<AtomicBool>,
    bridge: JoinHandle<()>,
    workers: Vec<Worker>,
}

impl StreamRuntime {
    fn open_paths(&self) -> HashSet<std::path::PathBuf> {
        let mut set = HashSet::new();
        if let Some(p) = self.hls_handle.current_path() {
            set.insert(p);
        }
        if let Some(p) = self.mp4_handle.current_path() {
            set.insert(p);
        }
        set
    }
}

/// Ties every per-stream worker together, owns the process-wide retention
/// task, and answers config reloads and health queries.
pub struct Supervisor {
    coordinator: Arc<ShutdownCoordinator>,
    db: Arc<Database>,
    global: Mutex<GlobalConfig>,
    streams: Mutex<HashMap<String, StreamRuntime>>,
    open_files: Arc<OpenFiles>,
    job_tracker: Arc<JobTracker>,
    retention: Mutex<Option<RetentionRuntime>>,
    detector: Arc<dyn Detector>,
    opener: Arc<dyn Opener>,
    global_health: Mutex<GlobalHealth>,
}

impl Supervisor {
    /// Builds a supervisor from a config snapshot and starts every enabled
    /// stream plus the retention task. `detector` is the embedder-supplied
    /// backend; pass `None` to run with [`NoopDetector`].
    pub fn new(
        coordinator: Arc<ShutdownCoordinator>,
        db: Arc<Database>,
        config: Config,
        detector: Option<Arc<dyn Detector>>,
    ) -> Result<Arc<Self>, Error> {
        if let Err(e) = db::recovery::recover(&db, &config.global.storage_root.join("mp4")) {
            warn!(err = %e.chain(), "startup crash-recovery scan failed, continuing without it");
        }

        let sup = Arc::new(Supervisor {
            coordinator,
            db,
            global: Mutex::new(config.global.clone()),
            streams: Mutex::new(HashMap::new()),
            open_files: Arc::new(OpenFiles::new()),
            job_tracker: Arc::new(JobTracker::new()),
            retention: Mutex::new(None),
            detector: detector.unwrap_or_else(|| Arc::new(NoopDetector)),
            opener: Arc::new(stream::OPENER),
            global_health: Mutex::new(GlobalHealth::ok()),
        });

        sup.start_retention(&config.global, &config.streams);
        for stream_cfg in config.streams {
            sup.start_stream(stream_cfg)?;
        }
        Ok(sup)
    }

    fn stream_policies(streams: &[StreamConfig]) -> HashMap<String, StreamPolicy> {
        streams
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    StreamPolicy {
                        retention_days: None,
                        tier: Tier::Important,
                        storage_priority: s.priority,
                    },
                )
            })
            .collect()
    }

    fn start_retention(&self, global: &GlobalConfig, streams: &[StreamConfig]) {
        let policy = GlobalPolicy {
            storage_root: global.storage_root.clone(),
            retention_days: global.retention_days,
            max_storage_size: global.max_storage_size,
            auto_delete_oldest: global.auto_delete_oldest,
        };
        let task = RetentionTask::new(
            self.db.clone(),
            policy,
            Self::stream_policies(streams),
            self.open_files.clone(),
            self.job_tracker.clone(),
        );
        let global_rx = self.coordinator.shutdown_rx();
        let handle = self.coordinator.register("retention", priority::RETENTION);
        let coordinator = self.coordinator.clone();
        let join = std::thread::Builder::new()
            .name("retention".into())
            .spawn(move || {
                task.run(&RealClocks, &global_rx);
                coordinator.report_stopped(handle);
            })
            .expect("spawn retention thread");
        *self.retention.lock().unwrap() = Some(Worker {
            name: "retention".to_string(),
            handle,
            join,
        });
    }

    fn stop_retention(&self) {
        if let Some(w) = self.retention.lock().unwrap().take() {
            let _ = w.join.join();
        }
    }

    /// Starts one stream's full worker set: `Ingest`, `HlsWriter`,
    /// `Mp4Segmenter`, and (if `[detection]` is configured) `PreRollBuffer`
    /// plus `DetectionWorker`.
    pub fn start_stream(self: &Arc<Self>, cfg: StreamConfig) -> Result<(), Error> {
        if !cfg.enabled {
            return Ok(());
        }
        let global = self.global.lock().unwrap().clone();
        let name = cfg.name.clone();

        let bus = Arc::new(PacketBus::named(name.clone(), BusConfig::default()));
        let health = Arc::new(StreamHealth::new());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (local_rx, bridge) = spawn_stream_bridge(self.coordinator.shutdown_rx(), stop_flag.clone());

        let mut workers = Vec::new();

        // Ingest
        {
            let url = cfg.url.clone();
            let username = url.username().to_string();
            let password = url.password().map(|s| s.to_string());
            let transport = match cfg.protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            };
            let options_factory: Box<dyn Fn() -> Options + Send> = Box::new(move || {
                let creds = if username.is_empty() {
                    None
                } else {
                    Some(retina::client::Credentials {
                        username: username.clone(),
                        password: password.clone().unwrap_or_default(),
                    })
                };
                let mut setup = retina::client::SetupOptions::default();
                if let Ok(t) = retina::client::Transport::from_str(transport) {
                    setup = setup.transport(t);
                }
                Options {
                    session: retina::client::SessionOptions::default().creds(creds),
                    setup,
                }
            });
            let ingest = crate::ingest::Ingest::new(
                name.clone(),
                url,
                options_factory,
                self.opener.clone(),
                bus.clone(),
                health.clone(),
            );
            let rx = local_rx.clone();
            let handle = self.coordinator.register(format!("{name}-ingest"), priority::INGEST);
            let coordinator = self.coordinator.clone();
            let worker_name = format!("{name}-ingest");
            let join = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    ingest.run(&RealClocks, &rx, rand_unit);
                    coordinator.report_stopped(handle);
                })
                .expect("spawn ingest thread");
            workers.push(Worker { name: worker_name, handle, join });
        }

        // HlsWriter: live view is independent of archival recording; it runs
        // whenever the stream is enabled, regardless of `record`.
        let (hls_writer, hls_handle) = HlsWriter::new(name.clone(), HlsConfig {
            hls_root: global.hls_root.join(&name),
            ..HlsConfig::default()
        });
        hls_handle.enable(4);
        {
            let sub = bus.subscribe(32, DropPolicy::BlockThenDropOldestNonKeyframe);
            let handle_clone = hls_handle.clone();
            let bus_clone = bus.clone();
            let rx = local_rx.clone();
            let handle = self.coordinator.register(format!("{name}-hls"), priority::HLS);
            let coordinator = self.coordinator.clone();
            let worker_name = format!("{name}-hls");
            let join = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    hls_writer.run(&RealClocks, &bus_clone, &sub, &handle_clone, &rx);
                    coordinator.report_stopped(handle);
                })
                .expect("spawn hls thread");
            workers.push(Worker { name: worker_name, handle, join });
        }

        // Mp4Segmenter
        let (mp4_segmenter, mp4_handle) = Mp4Segmenter::new(name.clone(), SegmenterConfig {
            mp4_root: global.storage_root.join("mp4").join(&name),
            thumbnails_root: global.storage_root.join("thumbnails").join(&name),
            segment_duration_sec: cfg.segment_duration_sec,
            thumbnails_enabled: true,
        }, self.db.clone());
        mp4_handle.set_enabled(cfg.record);
        {
            let sub = bus.subscribe(32, DropPolicy::BlockThenDropOldestNonKeyframe);
            let handle_clone = mp4_handle.clone();
            let bus_clone = bus.clone();
            let rx = local_rx.clone();
            let handle = self.coordinator.register(format!("{name}-mp4"), priority::MP4);
            let coordinator = self.coordinator.clone();
            let worker_name = format!("{name}-mp4");
            let join = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    mp4_segmenter.run(&RealClocks, &bus_clone, &sub, &handle_clone, &rx);
                    coordinator.report_stopped(handle);
                })
                .expect("spawn mp4 thread");
            workers.push(Worker { name: worker_name, handle, join });
        }

        // PreRollBuffer + DetectionWorker, only if `[detection]` is set.
        if let Some(det_cfg) = cfg.detection.clone() {
            let preroll = Arc::new(PreRollBuffer::new(det_cfg.pre_roll_sec, cfg.fps));
            {
                let bus_clone = bus.clone();
                let preroll_clone = preroll.clone();
                let rx = local_rx.clone();
                let handle = self.coordinator.register(format!("{name}-preroll"), priority::PREROLL);
                let coordinator = self.coordinator.clone();
                let worker_name = format!("{name}-preroll");
                let join = std::thread::Builder::new()
                    .name(worker_name.clone())
                    .spawn(move || {
                        preroll_clone.run(&RealClocks, &bus_clone, &rx);
                        coordinator.report_stopped(handle);
                    })
                    .expect("spawn preroll thread");
                workers.push(Worker { name: worker_name, handle, join });
            }

            let backend = Arc::new(Backend::InProcess({
                // `Backend`'s variants each carry a boxed `Detector`; both
                // point at the same embedder-supplied (or no-op) instance,
                // since this workspace doesn't choose between them itself.
                struct Shared(Arc<dyn Detector>);
                impl Detector for Shared {
                    fn detect(&self, frame: &FrameRgb, threshold: f64) -> Result<Vec<DetectionBox>, Error> {
                        self.0.detect(frame, threshold)
                    }
                }
                Box::new(Shared(self.detector.clone()))
            }));
            let worker = DetectionWorker::new(
                name.clone(),
                DetectionWorkerConfig {
                    interval: Duration::from_secs_f64(det_cfg.interval_sec.max(0.1)),
                    threshold: det_cfg.threshold,
                    object_filter: det_cfg.object_filter.iter().cloned().collect(),
                },
                backend,
                Arc::new(JpegFrameDecoder),
                Arc::new(WorkerPool::cpu_count()),
                self.db.clone(),
                preroll,
                Arc::new(crate::detection::TriggerController::new(
                    name.clone(),
                    det_cfg.pre_roll_sec,
                    det_cfg.post_roll_sec,
                )),
                Arc::new(NullPublisher),
            );
            let bus_clone = bus.clone();
            let mp4_clone = mp4_handle.clone();
            let rx = local_rx.clone();
            let handle = self.coordinator.register(format!("{name}-detection"), priority::DETECTION);
            let coordinator = self.coordinator.clone();
            let worker_name = format!("{name}-detection");
            let join = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    worker.run(&RealClocks, &bus_clone, &rx, &mp4_clone);
                    coordinator.report_stopped(handle);
                })
                .expect("spawn detection thread");
            workers.push(Worker { name: worker_name, handle, join });
        }

        let runtime = StreamRuntime {
            config: cfg,
            bus,
            health,
            hls_handle,
            mp4_handle,
            stop_flag,
            bridge,
            workers,
        };
        self.streams.lock().unwrap().insert(name.clone(), runtime);
        info!(stream = %name, "stream started");
        Ok(())
    }

    /// Stops and removes one stream. Workers drain in-flight segments
    /// before their threads return (each `run` finalizes its open segment
    /// on shutdown); this blocks until that's done.
    pub fn stop_stream(&self, name: &str) {
        let runtime = self.streams.lock().unwrap().remove(name);
        let Some(runtime) = runtime else { return };
        runtime.stop_flag.store(true, Ordering::Release);
        runtime.bus.close();
        for w in runtime.workers {
            if w.join.join().is_err() {
                warn!(stream = %name, worker = %w.name, "worker thread panicked during stop");
            }
        }
        let _ = runtime.bridge.join();
        info!(stream = %name, "stream stopped");
    }

    /// Diffs `new` against the running configuration and applies the delta
    /// in place: streams are started, stopped, or restarted
    /// individually; `storage_root`/`web_port` changes are refused because
    /// they'd invalidate paths already baked into in-flight segments and
    /// open listeners, and require a full process restart instead.
    pub fn apply_config(self: &Arc<Self>, new: Config) -> Result<(), Error> {
        {
            let current = self.global.lock().unwrap();
            if new.global.storage_root != current.storage_root || new.global.web_port != current.web_port {
                base::bail!(
                    FailedPrecondition,
                    msg("storage_root/web_port changes require a process restart")
                );
            }
        }

        let mut wanted: HashMap<String, StreamConfig> =
            new.streams.iter().cloned().map(|s| (s.name.clone(), s)).collect();

        let existing_names: Vec<String> = self.streams.lock().unwrap().keys().cloned().collect();
        for name in existing_names {
            match wanted.remove(&name) {
                None => self.stop_stream(&name),
                Some(cfg) => {
                    let changed = {
                        let streams = self.streams.lock().unwrap();
                        streams.get(&name).map(|r| !stream_config_eq(&r.config, &cfg)).unwrap_or(false)
                    };
                    if changed {
                        self.stop_stream(&name);
                        self.start_stream(cfg)?;
                    }
                }
            }
        }
        for (_, cfg) in wanted {
            self.start_stream(cfg)?;
        }

        self.stop_retention();
        self.start_retention(&new.global, &new.streams);
        *self.global.lock().unwrap() = new.global;
        info!("configuration reloaded");
        Ok(())
    }

    /// Snapshot of every open segment path across all streams, fed to
    /// [`RetentionTask`] before each tick so it never reclaims a file a
    /// writer still has open.
    pub fn refresh_open_files(&self) {
        let mut all = HashSet::new();
        for runtime in self.streams.lock().unwrap().values() {
            all.extend(runtime.open_paths());
        }
        self.open_files.set(all);
    }

    /// Aggregated health: per-stream state plus any process-wide
    /// degradation flagged elsewhere (disk, database).
    pub fn health(&self) -> (HashMap<String, crate::health::StreamHealthState>, GlobalHealth) {
        let streams = self
            .streams
            .lock()
            .unwrap()
            .iter()
            .map(|(name, r)| (name.clone(), r.health.state()))
            .collect();
        (streams, self.global_health.lock().unwrap().clone())
    }

    pub fn degrade(&self, reason: impl Into<String>) {
        self.global_health.lock().unwrap().degrade(reason);
    }

    /// Blocks until every registered component has reported stopped, per
    /// `coordinator.initiate_shutdown`'s contract; called from `main` after
    /// requesting shutdown.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.streams.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.stop_stream(&name);
        }
        self.stop_retention();
    }
}

fn stream_config_eq(a: &StreamConfig, b: &StreamConfig) -> bool {
    a.url == b.url
        && a.enabled == b.enabled
        && a.protocol == b.protocol
        && a.record == b.record
        && a.segment_duration_sec == b.segment_duration_sec
        && a.fps == b.fps
        && detection_config_eq(a.detection.as_ref(), b.detection.as_ref())
}

fn detection_config_eq(a: Option<&DetectionConfig>, b: Option<&DetectionConfig>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.model == b.model
                && a.interval_sec == b.interval_sec
                && a.threshold == b.threshold
                && a.pre_roll_sec == b.pre_roll_sec
                && a.post_roll_sec == b.post_roll_sec
                && a.object_filter == b.object_filter
        }
        _ => false,
    }
}
