// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Crash-recovery re-indexing of orphaned `.mp4` files.
//!
//! Grounded on `db/dir/scan.rs`'s orphan-reconciliation pass in the
//! teacher, adapted: the teacher scans its own composite sample-file
//! format; this repository's files are standalone, `mp4`-crate-readable
//! `.mp4`s laid out at
//! `<storage_root>/mp4/<stream>/<YYYY>/<MM>/<DD>/<HHMMSS>.mp4`,
//! so recovery parses the real container instead.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base::{err, Error};
use tracing::{info, warn};

use crate::recording::{NewRecording, Trigger};
use crate::schema::Database;

#[derive(Default, Debug)]
pub struct RecoveryReport {
    pub reindexed: Vec<PathBuf>,
    pub broken: Vec<PathBuf>,
}

/// Parses `<YYYY>/<MM>/<DD>/<HHMMSS>.mp4` into a wall-clock second, using
/// UTC to keep recovery independent of the local zone the process happens
/// to boot with.
fn wall_start_from_path(path: &Path, stream_dir: &Path) -> Option<i64> {
    let rel = path.strip_prefix(stream_dir).ok()?;
    let mut comps = rel.components();
    let year: i32 = comps.next()?.as_os_str().to_str()?.parse().ok()?;
    let month: i8 = comps.next()?.as_os_str().to_str()?.parse().ok()?;
    let day: i8 = comps.next()?.as_os_str().to_str()?.parse().ok()?;
    let stem = comps.next()?.as_os_str().to_str()?.strip_suffix(".mp4")?;
    if stem.len() != 6 {
        return None;
    }
    let hour: i8 = stem[0..2].parse().ok()?;
    let min: i8 = stem[2..4].parse().ok()?;
    let sec: i8 = stem[4..6].parse().ok()?;
    let dt = jiff::civil::date(year, month, day)
        .at(hour, min, sec, 0)
        .to_zoned(jiff::tz::TimeZone::UTC)
        .ok()?;
    Some(dt.timestamp().as_second())
}

/// Reads the duration (in whole seconds) out of a standalone `.mp4`'s
/// `moov` box, the thing that makes it parseable for re-indexing.
fn parse_duration_secs(path: &Path) -> Result<f64, Error> {
    let data = fs::read(path).map_err(|e| err!(Unavailable, msg("reading {}", path.display()), source(e)))?;
    let len = data.len() as u64;
    let reader = mp4::Mp4Reader::read_header(Cursor::new(data), len)
        .map_err(|e| err!(DataLoss, msg("parsing moov in {}", path.display()), source(e)))?;
    let timescale = reader.moov.mvhd.timescale.max(1) as f64;
    Ok(reader.moov.mvhd.duration as f64 / timescale)
}

/// Walks `mp4_root` (`<storage_root>/mp4`), finds every `.mp4` file with no
/// corresponding non-deleted `recordings` row, and either re-indexes it
/// (parseable) or renames it `.broken` (not).
///
/// This only ever inserts rows and renames files that are already orphans;
/// it never touches a file that's already indexed, so it's safe to run
/// unconditionally at every startup.
pub fn recover(db: &Database, mp4_root: &Path) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport::default();
    if !mp4_root.is_dir() {
        return Ok(report);
    }
    let known: std::collections::HashSet<PathBuf> = db
        .list_recordings(&Default::default())?
        .into_iter()
        .map(|r| r.file_path)
        .collect();

    for stream_entry in fs::read_dir(mp4_root).map_err(|e| err!(Unavailable, msg("reading {}", mp4_root.display()), source(e)))? {
        let stream_entry = stream_entry.map_err(|e| err!(Unavailable, source(e)))?;
        if !stream_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let stream_dir = stream_entry.path();
        let stream_name = stream_entry.file_name().to_string_lossy().to_string();
        for path in walk_mp4_files(&stream_dir)? {
            if known.contains(&path) {
                continue;
            }
            match parse_duration_secs(&path) {
                Ok(duration_secs) => {
                    let wall_start = wall_start_from_path(&path, &stream_dir).unwrap_or(0);
                    let wall_end = wall_start + duration_secs.ceil().max(1.0) as i64;
                    let size_bytes = fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);
                    let rec = NewRecording {
                        stream: stream_name.clone(),
                        file_path: path.clone(),
                        wall_start,
                        wall_end,
                        size_bytes,
                        trigger: Trigger::Schedule,
                        has_detection: false,
                        thumbnail_path: None,
                    };
                    db.insert_recording(&rec)?;
                    info!(path = %path.display(), "re-indexed orphaned recording");
                    report.reindexed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), err = %e.chain(), "orphaned recording failed to parse, marking broken");
                    let broken = path.with_extension("mp4.broken");
                    if let Err(e) = fs::rename(&path, &broken) {
                        warn!(path = %path.display(), err = %e, "failed to rename broken recording");
                    }
                    report.broken.push(path);
                }
            }
        }
    }
    Ok(report)
}

fn walk_mp4_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = fs::read_dir(&d) else { continue };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("mp4") {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.db");
        std::mem::forget(dir);
        Database::open(&path).unwrap()
    }

    #[test]
    fn missing_root_is_a_noop() {
        let db = db();
        let report = recover(&db, Path::new("/nonexistent/mp4/root")).unwrap();
        assert!(report.reindexed.is_empty());
        assert!(report.broken.is_empty());
    }

    #[test]
    fn garbage_file_is_marked_broken() {
        let db = db();
        let root = tempfile::tempdir().unwrap();
        let stream_dir = root.path().join("front").join("2026").join("01").join("02");
        fs::create_dir_all(&stream_dir).unwrap();
        let file = stream_dir.join("030405.mp4");
        fs::write(&file, b"not an mp4").unwrap();
        let report = recover(&db, root.path()).unwrap();
        assert_eq!(report.broken.len(), 1);
        assert!(report.reindexed.is_empty());
        assert!(!file.exists());
        assert!(file.with_extension("mp4.broken").exists());
    }
}
