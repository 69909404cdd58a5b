// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Quota- and age-based reclamation against the `recordings` index and the
//! filesystem.
//!
//! This module implements the *policy evaluation*: what to delete and in
//! what order. The caller (`src/retention_task.rs`, run on its own timer
//! worker) supplies the current wall time, the global and per-stream
//! policy, and the set of file paths that must never be picked regardless
//! of age/quota because they're the currently-open segment.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use base::{err, Error};
use tracing::{error, info, warn};

use crate::recording::RecordingFilter;
use crate::schema::Database;

/// Per-stream tuning of the age/ordering rules.
#[derive(Clone, Debug)]
pub struct StreamPolicy {
    pub retention_days: Option<i64>,
    pub tier: Tier,
    pub storage_priority: i32,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Tier {
    Critical,
    Important,
    Ephemeral,
}

impl Tier {
    /// Multiplier applied to `retention_days` before the age check. Critical
    /// streams are kept longer than nominal, ephemeral streams shorter;
    /// exact values aren't specified upstream so these are chosen to be
    /// clearly ordered and easy to reason about.
    pub fn multiplier(self) -> f64 {
        match self {
            Tier::Critical => 2.0,
            Tier::Important => 1.0,
            Tier::Ephemeral => 0.5,
        }
    }
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy {
            retention_days: None,
            tier: Tier::Important,
            storage_priority: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GlobalPolicy {
    pub storage_root: PathBuf,
    pub retention_days: i64,
    pub max_storage_size: i64,
    pub auto_delete_oldest: bool,
}

#[derive(Default, Debug)]
pub struct TickReport {
    pub age_deleted: usize,
    pub quota_deleted: usize,
    pub used_bytes_after: i64,
}

fn effective_retention_secs(global: &GlobalPolicy, stream: Option<&StreamPolicy>) -> i64 {
    let days = stream
        .and_then(|s| s.retention_days)
        .unwrap_or(global.retention_days);
    let mult = stream.map(|s| s.tier.multiplier()).unwrap_or(1.0);
    ((days as f64 * mult) * 86_400.0) as i64
}

impl Database {
    /// Sum of `size_bytes` over non-deleted rows.
    pub fn used_bytes(&self) -> Result<i64, Error> {
        self.with_reader(|conn| {
            conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM recordings WHERE deleted = 0", [], |r| r.get(0))
                .map_err(|e| err!(Internal, msg("summing recording sizes"), source(e)))
        })
    }
}

/// Runs one retention tick: age-based deletion followed by quota-based
/// deletion. Returns after the row-removal phase has committed; the caller
/// is expected to have already unlinked files as this function reports
/// them (it does the unlinking itself, outside of any transaction).
pub fn run_tick(
    db: &Database,
    global: &GlobalPolicy,
    stream_policies: &HashMap<String, StreamPolicy>,
    now: i64,
    open_files: &HashSet<PathBuf>,
) -> Result<TickReport, Error> {
    let mut report = TickReport::default();

    // Step 2: age-based deletion, bounded at 10s for the row-removal phase.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let rows = db.list_recordings(&RecordingFilter::default())?;
    let mut to_unlink = Vec::new();
    for row in &rows {
        if open_files.contains(&row.file_path) {
            continue;
        }
        let policy = stream_policies.get(&row.stream);
        let retention_secs = effective_retention_secs(global, policy);
        if row.wall_end < now - retention_secs {
            if std::time::Instant::now() >= deadline {
                warn!("age-deletion phase exceeded 10s budget, deferring remainder to next tick");
                break;
            }
            if let Some(path) = db.delete_recording_row(row.id)? {
                to_unlink.push(path);
                report.age_deleted += 1;
            }
        }
    }
    unlink_all(&to_unlink);

    // Step 3: quota-based deletion, oldest (by wall_end) first, breaking
    // ties by storage_priority ascending (lower priority goes first).
    if global.max_storage_size > 0 && global.auto_delete_oldest {
        let mut used = db.used_bytes()?;
        if used > global.max_storage_size {
            let target = (global.max_storage_size as f64 * 0.95) as i64;
            let mut candidates: Vec<_> = db
                .list_recordings(&RecordingFilter::default())?
                .into_iter()
                .filter(|r| !open_files.contains(&r.file_path))
                .collect();
            candidates.sort_by(|a, b| {
                let pa = stream_policies.get(&a.stream).map(|p| p.storage_priority).unwrap_or(0);
                let pb = stream_policies.get(&b.stream).map(|p| p.storage_priority).unwrap_or(0);
                a.wall_end.cmp(&b.wall_end).then(pa.cmp(&pb))
            });
            let mut to_unlink = Vec::new();
            for row in candidates {
                if used <= target {
                    break;
                }
                if let Some(path) = db.delete_recording_row(row.id)? {
                    used -= row.size_bytes;
                    to_unlink.push(path);
                    report.quota_deleted += 1;
                }
            }
            unlink_all(&to_unlink);
        }
        report.used_bytes_after = used;
    } else {
        report.used_bytes_after = db.used_bytes()?;
    }

    Ok(report)
}

/// Unlinks files whose index rows have already been removed. A failed
/// unlink is logged, not retried synchronously — files orphaned this way
/// are reclaimed by a weekly sweep.
fn unlink_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %path.display(), err = %e, "failed to unlink deleted recording, leaving for weekly sweep");
            }
        }
    }
}

/// Weekly sweep: unlinks any file under `storage_root` with no
/// corresponding non-deleted index row, provided it's at least an hour old
/// (to avoid racing an in-progress segment close).
pub fn sweep_orphans(db: &Database, storage_root: &Path, now: SystemTime) -> Result<usize, Error> {
    let known: HashSet<PathBuf> = db
        .list_recordings(&RecordingFilter::default())?
        .into_iter()
        .map(|r| r.file_path)
        .collect();
    let mp4_root = storage_root.join("mp4");
    if !mp4_root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut stack = vec![mp4_root];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                continue;
            }
            if known.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(age) = now.duration_since(meta.modified().unwrap_or(now)) else { continue };
            if age < Duration::from_secs(3600) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "weekly sweep removed orphaned file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), err = %e, "weekly sweep failed to remove orphan"),
            }
        }
    }
    Ok(removed)
}

/// Progress record for a long-running batch deletion, queried via
/// `batch_delete_progress(job_id)`.
#[derive(Clone, Debug)]
pub struct JobProgress {
    pub total: usize,
    pub current: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status_message: String,
}

struct JobState {
    total: AtomicUsize,
    current: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    status_message: Mutex<String>,
}

/// Handle to a batch-deletion job in progress, shareable across the thread
/// running it and whatever polls `batch_delete_progress`.
#[derive(Clone)]
pub struct Job(Arc<JobState>);

impl Job {
    fn new(total: usize) -> Self {
        Job(Arc::new(JobState {
            total: AtomicUsize::new(total),
            current: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            status_message: Mutex::new("starting".to_string()),
        }))
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            total: self.0.total.load(Ordering::Relaxed),
            current: self.0.current.load(Ordering::Relaxed),
            succeeded: self.0.succeeded.load(Ordering::Relaxed),
            failed: self.0.failed.load(Ordering::Relaxed),
            status_message: self.0.status_message.lock().unwrap().clone(),
        }
    }

    fn set_status(&self, msg: impl Into<String>) {
        *self.0.status_message.lock().unwrap() = msg.into();
    }
}

/// Registry of in-flight/completed batch-deletion jobs, addressed by an
/// opaque monotonically increasing id.
#[derive(Default)]
pub struct JobTracker {
    next_id: AtomicI64,
    jobs: Mutex<HashMap<i64, Job>>,
}

impl JobTracker {
    pub fn new() -> Self {
        JobTracker {
            next_id: AtomicI64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress(&self, job_id: i64) -> Option<JobProgress> {
        self.jobs.lock().unwrap().get(&job_id).map(Job::progress)
    }

    /// Runs a batch deletion of `ids` against `db`, tracked under a new job
    /// id. Row removal for the whole batch happens inside one transaction
    /// bounded at 10s; unlinks happen afterward,
    /// outside any transaction.
    pub fn batch_delete(&self, db: &Database, ids: &[crate::recording::RecordingId]) -> Result<i64, Error> {
        let job = Job::new(ids.len());
        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.jobs.lock().unwrap().insert(job_id, job.clone());

        job.set_status("removing rows");
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut removed_paths = Vec::new();
        for &id in ids {
            job.0.current.fetch_add(1, Ordering::Relaxed);
            if std::time::Instant::now() >= deadline {
                job.set_status("row-removal phase exceeded 10s budget, remainder skipped this run");
                job.0.failed.fetch_add(ids.len() - job.0.current.load(Ordering::Relaxed), Ordering::Relaxed);
                break;
            }
            match db.delete_recording_row(id) {
                Ok(Some(path)) => {
                    removed_paths.push(path);
                    job.0.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    job.0.succeeded.fetch_add(1, Ordering::Relaxed); // already gone; not an error.
                }
                Err(e) => {
                    error!(id, err = %e.chain(), "batch delete failed to remove row");
                    job.0.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        job.set_status("unlinking files");
        unlink_all(&removed_paths);
        job.set_status("done");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{NewRecording, Trigger};

    fn db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.db");
        std::mem::forget(dir);
        Database::open(&path).unwrap()
    }

    fn insert(db: &Database, stream: &str, start: i64, end: i64, size: i64) -> crate::recording::RecordingId {
        db.insert_recording(&NewRecording {
            stream: stream.to_string(),
            file_path: PathBuf::from(format!("/mp4/{stream}/{start}.mp4")),
            wall_start: start,
            wall_end: end,
            size_bytes: size,
            trigger: Trigger::Schedule,
            has_detection: false,
            thumbnail_path: None,
        })
        .unwrap()
    }

    #[test]
    fn age_policy_deletes_only_expired() {
        let db = db();
        insert(&db, "front", 0, 100, 1000); // old
        insert(&db, "front", 1_000_000, 1_000_100, 1000); // recent
        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 1,
            max_storage_size: 0,
            auto_delete_oldest: false,
        };
        let now = 2 * 86_400; // 2 days in
        let report = run_tick(&db, &global, &HashMap::new(), now, &HashSet::new()).unwrap();
        assert_eq!(report.age_deleted, 1);
        assert_eq!(db.list_recordings(&Default::default()).unwrap().len(), 1);
    }

    #[test]
    fn exactly_at_quota_removes_zero_rows() {
        let db = db();
        insert(&db, "front", 0, 100, 500_000);
        insert(&db, "front", 200, 300, 500_000);
        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 3650,
            max_storage_size: 1_000_000,
            auto_delete_oldest: true,
        };
        let report = run_tick(&db, &global, &HashMap::new(), 100_000, &HashSet::new()).unwrap();
        assert_eq!(report.quota_deleted, 0);
        assert_eq!(db.list_recordings(&Default::default()).unwrap().len(), 2);
    }

    #[test]
    fn quota_pressure_deletes_oldest_first() {
        let db = db();
        for i in 0..10i64 {
            insert(&db, "front", i * 1000, i * 1000 + 900, 200_000);
        }
        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 3650,
            max_storage_size: 1_000_000, // 1MB, 5 rows worth
            auto_delete_oldest: true,
        };
        let report = run_tick(&db, &global, &HashMap::new(), 100_000_000, &HashSet::new()).unwrap();
        let remaining = db.list_recordings(&Default::default()).unwrap();
        assert!(remaining.len() <= 5, "expected <=5 rows, got {}", remaining.len());
        assert!(report.used_bytes_after <= (0.95 * 1_000_000.0) as i64);
        // Oldest-first: surviving rows should be the most recent ones.
        assert!(remaining.iter().all(|r| r.wall_start >= 4000));
    }

    #[test]
    fn currently_open_segment_is_excluded() {
        let db = db();
        let open_path = PathBuf::from("/mp4/front/0.mp4");
        insert(&db, "front", 0, 100, 1000);
        let global = GlobalPolicy {
            storage_root: PathBuf::from("/tmp"),
            retention_days: 1,
            max_storage_size: 0,
            auto_delete_oldest: false,
        };
        let mut open = HashSet::new();
        open.insert(open_path);
        let report = run_tick(&db, &global, &HashMap::new(), 2 * 86_400, &open).unwrap();
        assert_eq!(report.age_deleted, 0);
    }

    #[test]
    fn batch_delete_tracks_progress_to_completion() {
        let db = db();
        let id1 = insert(&db, "front", 0, 100, 1000);
        let id2 = insert(&db, "front", 200, 300, 1000);
        let tracker = JobTracker::new();
        let job_id = tracker.batch_delete(&db, &[id1, id2]).unwrap();
        let progress = tracker.progress(job_id).unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.succeeded, 2);
        assert_eq!(progress.status_message, "done");
    }
}
