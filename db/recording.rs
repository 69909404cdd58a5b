// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `recordings` table: one row per finalized `Segment`.

use std::path::{Path, PathBuf};

use base::{err, Error};
use rusqlite::{params, OptionalExtension, Row};

use crate::schema::Database;

/// Row id, monotonically increasing.
pub type RecordingId = i64;

#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord)]
pub enum Trigger {
    Schedule,
    Detection,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Detection => "detection",
        }
    }

    fn from_str(s: &str) -> Trigger {
        match s {
            "detection" => Trigger::Detection,
            _ => Trigger::Schedule,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordingRow {
    pub id: RecordingId,
    pub stream: String,
    pub file_path: PathBuf,
    pub wall_start: i64,
    pub wall_end: i64,
    pub size_bytes: i64,
    pub trigger: Trigger,
    pub has_detection: bool,
    pub thumbnail_path: Option<PathBuf>,
}

/// A new recording to insert, prior to having an id assigned.
pub struct NewRecording {
    pub stream: String,
    pub file_path: PathBuf,
    pub wall_start: i64,
    pub wall_end: i64,
    pub size_bytes: i64,
    pub trigger: Trigger,
    pub has_detection: bool,
    pub thumbnail_path: Option<PathBuf>,
}

#[derive(Default, Clone, Debug)]
pub struct RecordingFilter {
    pub stream: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub trigger: Option<Trigger>,
}

fn row_to_recording(row: &Row) -> rusqlite::Result<RecordingRow> {
    let trigger: String = row.get("trigger")?;
    let thumbnail: Option<String> = row.get("thumbnail_path")?;
    Ok(RecordingRow {
        id: row.get("id")?,
        stream: row.get("stream")?,
        file_path: PathBuf::from(row.get::<_, String>("file_path")?),
        wall_start: row.get("wall_start")?,
        wall_end: row.get("wall_end")?,
        size_bytes: row.get("size_bytes")?,
        trigger: Trigger::from_str(&trigger),
        has_detection: row.get::<_, i64>("has_detection")? != 0,
        thumbnail_path: thumbnail.map(PathBuf::from),
    })
}

impl Database {
    /// Inserts a finalized recording. The row insert happens-before the
    /// file becomes readable — callers must call this only after the
    /// file's final fsync+rename has completed.
    pub fn insert_recording(&self, r: &NewRecording) -> Result<RecordingId, Error> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO recordings \
                 (stream, file_path, wall_start, wall_end, size_bytes, trigger, has_detection, thumbnail_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.stream,
                    r.file_path.to_string_lossy(),
                    r.wall_start,
                    r.wall_end,
                    r.size_bytes,
                    r.trigger.as_str(),
                    r.has_detection as i64,
                    r.thumbnail_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting recording"), source(e)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn set_thumbnail(&self, id: RecordingId, thumbnail_path: &Path) -> Result<(), Error> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE recordings SET thumbnail_path = ?1 WHERE id = ?2",
                params![thumbnail_path.to_string_lossy(), id],
            )
            .map_err(|e| err!(Internal, msg("setting thumbnail"), source(e)))?;
            Ok(())
        })
    }

    pub fn mark_has_detection(&self, id: RecordingId) -> Result<(), Error> {
        self.with_writer(|conn| {
            conn.execute(
                "UPDATE recordings SET has_detection = 1 WHERE id = ?1",
                params![id],
            )
            .map_err(|e| err!(Internal, msg("marking detection"), source(e)))?;
            Ok(())
        })
    }

    pub fn get_recording(&self, id: RecordingId) -> Result<Option<RecordingRow>, Error> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT * FROM recordings WHERE id = ?1 AND deleted = 0",
                params![id],
                row_to_recording,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("reading recording {id}"), source(e)))
        })
    }

    pub fn list_recordings(&self, filter: &RecordingFilter) -> Result<Vec<RecordingRow>, Error> {
        self.with_reader(|conn| {
            let mut sql = String::from("SELECT * FROM recordings WHERE deleted = 0");
            if filter.stream.is_some() {
                sql.push_str(" AND stream = :stream");
            }
            if filter.start.is_some() {
                sql.push_str(" AND wall_end >= :start");
            }
            if filter.end.is_some() {
                sql.push_str(" AND wall_start < :end");
            }
            if filter.trigger.is_some() {
                sql.push_str(" AND trigger = :trigger");
            }
            sql.push_str(" ORDER BY wall_start ASC");
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| err!(Internal, msg("preparing recording list query"), source(e)))?;
            let trigger_str = filter.trigger.map(Trigger::as_str);
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(s) = &filter.stream {
                named.push((":stream", s));
            }
            if let Some(s) = &filter.start {
                named.push((":start", s));
            }
            if let Some(e) = &filter.end {
                named.push((":end", e));
            }
            if let Some(t) = &trigger_str {
                named.push((":trigger", t));
            }
            let mut rows = Vec::new();
            let mut query_rows = stmt
                .query(named.as_slice())
                .map_err(|e| err!(Internal, msg("querying recordings"), source(e)))?;
            while let Some(row) = query_rows
                .next()
                .map_err(|e| err!(Internal, msg("iterating recordings"), source(e)))?
            {
                rows.push(row_to_recording(row).map_err(|e| err!(Internal, source(e)))?);
            }
            Ok(rows)
        })
    }

    /// Two-phase deletion, step one: removes the row inside a transaction.
    /// The caller must unlink the file afterward, outside any transaction.
    pub fn delete_recording_row(&self, id: RecordingId) -> Result<Option<PathBuf>, Error> {
        self.with_writer(|conn| {
            let path: Option<String> = conn
                .query_row(
                    "SELECT file_path FROM recordings WHERE id = ?1 AND deleted = 0",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| err!(Internal, msg("reading recording {id} for delete"), source(e)))?;
            if path.is_none() {
                return Ok(None);
            }
            conn.execute("UPDATE recordings SET deleted = 1 WHERE id = ?1", params![id])
                .map_err(|e| err!(Internal, msg("marking recording deleted"), source(e)))?;
            Ok(path.map(PathBuf::from))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightnvr.db");
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        Database::open(&path).unwrap()
    }

    fn sample(stream: &str, start: i64, end: i64) -> NewRecording {
        NewRecording {
            stream: stream.to_string(),
            file_path: PathBuf::from(format!("/mp4/{stream}/{start}.mp4")),
            wall_start: start,
            wall_end: end,
            size_bytes: 1024,
            trigger: Trigger::Schedule,
            has_detection: false,
            thumbnail_path: None,
        }
    }

    #[test]
    fn insert_then_get() {
        let db = db();
        let id = db.insert_recording(&sample("front", 0, 900)).unwrap();
        let row = db.get_recording(id).unwrap().unwrap();
        assert_eq!(row.stream, "front");
        assert_eq!(row.wall_end, 900);
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let db = db();
        let id = db.insert_recording(&sample("front", 0, 900)).unwrap();
        let path = db.delete_recording_row(id).unwrap().unwrap();
        assert_eq!(path, PathBuf::from("/mp4/front/0.mp4"));
        assert!(db.get_recording(id).unwrap().is_none());
        // Second delete is a no-op, not an error.
        assert!(db.delete_recording_row(id).unwrap().is_none());
    }

    #[test]
    fn list_filters_by_stream() {
        let db = db();
        db.insert_recording(&sample("front", 0, 900)).unwrap();
        db.insert_recording(&sample("back", 0, 900)).unwrap();
        let rows = db
            .list_recordings(&RecordingFilter {
                stream: Some("front".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stream, "front");
    }
}
