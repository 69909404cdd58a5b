// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `detections` table: one row per `DetectionLabel`.
//!
//! A segment's `has_detection` flag (stored on `recordings`, see
//! [`crate::recording`]) is derived from this table: it's true iff at least
//! one row exists with `wall_time` inside `[wall_start, wall_end)` for the
//! same stream. The trigger controller is responsible for
//! calling [`Database::mark_has_detection`] when it associates a detection
//! with the segment it caused; this module just stores the raw events for
//! querying/audit and for the `has_detection` backfill on crash recovery.

use base::{err, Error};
use rusqlite::params;

use crate::recording::RecordingId;
use crate::schema::Database;

#[derive(Clone, Debug)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Clone, Debug)]
pub struct NewDetection {
    pub recording_id: Option<RecordingId>,
    pub stream: String,
    pub wall_time: i64,
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub track_id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct DetectionRow {
    pub id: i64,
    pub recording_id: Option<RecordingId>,
    pub stream: String,
    pub wall_time: i64,
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub track_id: Option<i64>,
}

fn row_to_detection(row: &rusqlite::Row) -> rusqlite::Result<DetectionRow> {
    Ok(DetectionRow {
        id: row.get("id")?,
        recording_id: row.get("recording_id")?,
        stream: row.get("stream")?,
        wall_time: row.get("wall_time")?,
        label: row.get("label")?,
        confidence: row.get("confidence")?,
        bbox: BoundingBox {
            x: row.get("bbox_x")?,
            y: row.get("bbox_y")?,
            w: row.get("bbox_w")?,
            h: row.get("bbox_h")?,
        },
        track_id: row.get("track_id")?,
    })
}

impl Database {
    /// Inserts one detection event. Called by the trigger controller for
    /// every box that clears the configured threshold, whether or not it
    /// fires a trigger transition.
    pub fn insert_detection(&self, d: &NewDetection) -> Result<i64, Error> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO detections \
                 (recording_id, stream, wall_time, label, confidence, bbox_x, bbox_y, bbox_w, bbox_h, track_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    d.recording_id,
                    d.stream,
                    d.wall_time,
                    d.label,
                    d.confidence,
                    d.bbox.x,
                    d.bbox.y,
                    d.bbox.w,
                    d.bbox.h,
                    d.track_id,
                ],
            )
            .map_err(|e| err!(Internal, msg("inserting detection"), source(e)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Backfills `recording_id` on every detection for `stream` whose
    /// `wall_time` falls in `[wall_start, wall_end)` and that doesn't
    /// already reference a recording. Used once a segment closes and its
    /// `RecordingRow` has an id.
    pub fn link_detections_to_recording(
        &self,
        stream: &str,
        wall_start: i64,
        wall_end: i64,
        recording_id: RecordingId,
    ) -> Result<usize, Error> {
        self.with_writer(|conn| {
            let n = conn
                .execute(
                    "UPDATE detections SET recording_id = ?1 \
                     WHERE stream = ?2 AND wall_time >= ?3 AND wall_time < ?4 AND recording_id IS NULL",
                    params![recording_id, stream, wall_start, wall_end],
                )
                .map_err(|e| err!(Internal, msg("linking detections to recording {recording_id}"), source(e)))?;
            Ok(n)
        })
    }

    pub fn list_detections_for_recording(&self, recording_id: RecordingId) -> Result<Vec<DetectionRow>, Error> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM detections WHERE recording_id = ?1 ORDER BY wall_time ASC")
                .map_err(|e| err!(Internal, msg("preparing detection query"), source(e)))?;
            let rows = stmt
                .query_map(params![recording_id], row_to_detection)
                .map_err(|e| err!(Internal, msg("querying detections"), source(e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| err!(Internal, msg("iterating detections"), source(e)))?;
            Ok(rows)
        })
    }
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

    fn sample(stream: &str, wall_time: i64) -> NewDetection {
        NewDetection {
            recording_id: None,
            stream: stream.to_string(),
            wall_time,
            label: "person".to_string(),
            confidence: 0.9,
            bbox: BoundingBox { x: 0.1, y: 0.1, w: 0.2, h: 0.3 },
            track_id: None,
        }
    }

    #[test]
    fn link_detections_backfills_recording_id() {
        let db = db();
        db.insert_detection(&sample("front", 30)).unwrap();
        db.insert_detection(&sample("front", 100)).unwrap(); // out of window
        let rec = crate::recording::NewRecording {
            stream: "front".to_string(),
            file_path: "/mp4/front/0.mp4".into(),
            wall_start: 25,
            wall_end: 45,
            size_bytes: 100,
            trigger: crate::recording::Trigger::Detection,
            has_detection: true,
            thumbnail_path: None,
        };
        let id = db.insert_recording(&rec).unwrap();
        let n = db.link_detections_to_recording("front", 25, 45, id).unwrap();
        assert_eq!(n, 1);
        let rows = db.list_detections_for_recording(id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wall_time, 30);
    }
}
