// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Timer worker for `db::retention`'s policy logic.
//!
//! The policy evaluation (what to delete, in what order, within what time
//! budget) lives in `db::retention`; this module only owns the schedule and
//! the set of currently-open segment paths that must be excluded from
//! either pass.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use db::retention::{self, GlobalPolicy, JobTracker, StreamPolicy};
use db::schema::Database;
use tracing::{debug, error, info};

use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(7 * 86_400);

/// Tracks the file paths the retention tick must never pick, because a
/// `Mp4Segmenter`/`HlsWriter` currently has them open. Populated by the
/// Supervisor from each stream's writers before every tick.
#[derive(Default)]
pub struct OpenFiles(Mutex<HashSet<PathBuf>>);

impl OpenFiles {
    pub fn new() -> Self {
        OpenFiles::default()
    }

    pub fn set(&self, paths: HashSet<PathBuf>) {
        *self.0.lock().unwrap() = paths;
    }

    fn snapshot(&self) -> HashSet<PathBuf> {
        self.0.lock().unwrap().clone()
    }
}

/// Runs the 60s retention tick and weekly orphan sweep until shutdown.
/// Blocks the calling thread; intended to be its own worker thread, one
/// thread or task per named worker.
pub struct RetentionTask {
    db: Arc<Database>,
    global: GlobalPolicy,
    stream_policies: HashMap<String, StreamPolicy>,
    open_files: Arc<OpenFiles>,
    jobs: Arc<JobTracker>,
}

impl RetentionTask {
    pub fn new(
        db: Arc<Database>,
        global: GlobalPolicy,
        stream_policies: HashMap<String, StreamPolicy>,
        open_files: Arc<OpenFiles>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        RetentionTask {
            db,
            global,
            stream_policies,
            open_files,
            jobs,
        }
    }

    pub fn job_tracker(&self) -> Arc<JobTracker> {
        self.jobs.clone()
    }

    pub fn run<C: Clocks>(&self, clocks: &C, shutdown_rx: &ShutdownReceiver) {
        let mut next_tick = clocks.monotonic();
        let mut next_sweep = clocks.monotonic() + SWEEP_INTERVAL;

        loop {
            if shutdown_rx.check().is_err() {
                return;
            }

            let now_mono = clocks.monotonic();
            if now_mono >= next_tick {
                next_tick = now_mono + TICK_INTERVAL;
                self.run_tick(clocks);
            }
            if now_mono >= next_sweep {
                next_sweep = now_mono + SWEEP_INTERVAL;
                self.run_sweep(clocks);
            }

            clocks.sleep(Duration::from_secs(1));
        }
    }

    fn run_tick<C: Clocks>(&self, clocks: &C) {
        let now = clocks.realtime().as_second();
        let open = self.open_files.snapshot();
        match retention::run_tick(&self.db, &self.global, &self.stream_policies, now, &open) {
            Ok(report) => {
                if report.age_deleted > 0 || report.quota_deleted > 0 {
                    info!(
                        age_deleted = report.age_deleted,
                        quota_deleted = report.quota_deleted,
                        used_bytes_after = report.used_bytes_after,
                        "retention tick reclaimed storage"
                    );
                } else {
                    debug!(used_bytes_after = report.used_bytes_after, "retention tick: nothing to reclaim");
                }
            }
            Err(e) => error!(err = %e.chain(), "retention tick failed"),
        }
    }

    fn run_sweep<C: Clocks>(&self, clocks: &C) {
        let now = clocks.realtime();
        let system_now = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(now.as_second().max(0) as u64);
        match retention::sweep_orphans(&self.db, &self.global.storage_root, system_now) {
            Ok(n) if n > 0 => info!(removed = n, "weekly orphan sweep removed unindexed files"),
            Ok(_) => debug!("weekly orphan sweep found nothing to remove"),
            Err(e) => error!(err = %e.chain(), "weekly orphan sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use base::shutdown;
    use db::recording::{NewRecording, Trigger};

    fn db() -> Arc<Database> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.db");
        std::mem::forget(dir);
        Arc::new(Database::open(&path).unwrap())
    }

    #[test]
    fn tick_runs_immediately_then_waits_full_interval() {
        let db = db();
        db.insert_recording(&NewRecording {
            stream: "front".to_string(),
            file_path: PathBuf::from("/mp4/front/0.mp4"),
            wall_start: 0,
            wall_end: 100,
            size_bytes: 1000,
            trigger: Trigger::Schedule,
            has_detection: false,
            thumbnail_path: None,
        })
        .unwrap();

        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 1,
            max_storage_size: 0,
            auto_delete_oldest: false,
        };
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(2 * 86_400).unwrap());
        let task = RetentionTask::new(db.clone(), global, HashMap::new(), Arc::new(OpenFiles::new()), Arc::new(JobTracker::new()));

        task.run_tick(&clocks);
        assert_eq!(db.list_recordings(&Default::default()).unwrap().len(), 0);
    }

    #[test]
    fn open_files_are_excluded_from_a_tick() {
        let db = db();
        let path = PathBuf::from("/mp4/front/0.mp4");
        db.insert_recording(&NewRecording {
            stream: "front".to_string(),
            file_path: path.clone(),
            wall_start: 0,
            wall_end: 100,
            size_bytes: 1000,
            trigger: Trigger::Schedule,
            has_detection: false,
            thumbnail_path: None,
        })
        .unwrap();

        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 1,
            max_storage_size: 0,
            auto_delete_oldest: false,
        };
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(2 * 86_400).unwrap());
        let open_files = Arc::new(OpenFiles::new());
        open_files.set(HashSet::from([path]));
        let task = RetentionTask::new(db.clone(), global, HashMap::new(), open_files, Arc::new(JobTracker::new()));

        task.run_tick(&clocks);
        assert_eq!(db.list_recordings(&Default::default()).unwrap().len(), 1);
    }

    #[test]
    fn shutdown_stops_the_loop_promptly() {
        let db = db();
        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 30,
            max_storage_size: 0,
            auto_delete_oldest: false,
        };
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let task = RetentionTask::new(db, global, HashMap::new(), Arc::new(OpenFiles::new()), Arc::new(JobTracker::new()));
        let (tx, rx) = shutdown::channel();
        drop(tx);
        task.run(&clocks, &rx);
    }
}
