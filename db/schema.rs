// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! SQLite schema and connection management.
//!
//! `recordings` and `detections` are the two tables this crate writes.
//! `users` and `auth_sessions` exist in the on-disk schema for
//! the HTTP/auth layer, which is an external collaborator; this crate
//! creates their tables so the database file is self-consistent but never
//! reads or writes rows in them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{bail, err, Error, ErrorKind};
use parking_lot::Mutex;
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recordings (
    id              INTEGER PRIMARY KEY,
    stream          TEXT NOT NULL,
    file_path       TEXT NOT NULL,
    wall_start      INTEGER NOT NULL,
    wall_end        INTEGER NOT NULL,
    size_bytes      INTEGER NOT NULL,
    trigger         TEXT NOT NULL,
    has_detection   INTEGER NOT NULL DEFAULT 0,
    thumbnail_path  TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS recordings_stream_wall_end ON recordings (stream, wall_end);
CREATE INDEX IF NOT EXISTS recordings_wall_end ON recordings (wall_end) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS detections (
    id              INTEGER PRIMARY KEY,
    recording_id    INTEGER REFERENCES recordings (id),
    stream          TEXT NOT NULL,
    wall_time       INTEGER NOT NULL,
    label           TEXT NOT NULL,
    confidence      REAL NOT NULL,
    bbox_x          REAL NOT NULL,
    bbox_y          REAL NOT NULL,
    bbox_w          REAL NOT NULL,
    bbox_h          REAL NOT NULL,
    track_id        INTEGER
);
CREATE INDEX IF NOT EXISTS detections_recording ON detections (recording_id);

CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    username        TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_sessions (
    id              INTEGER PRIMARY KEY,
    user_id         INTEGER NOT NULL REFERENCES users (id),
    token_hash      TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL
);
";

/// A SQLite-backed handle enforcing a simple concurrency model: at
/// most one writer at a time (serialized through `writer`), any number of
/// concurrent readers pulled from a small pool, WAL mode, no nested
/// transactions.
pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    max_readers: usize,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let writer = open_conn(path)?;
        writer
            .execute_batch(SCHEMA)
            .map_err(|e| err!(Internal, msg("applying schema"), source(e)))?;
        Ok(Database {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            max_readers: 4,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with exclusive access to the single writer connection.
    /// Nested calls (from the same thread, re-entrantly) deadlock by
    /// design: nested transactions are forbidden.
    pub fn with_writer<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        let conn = self.writer.lock();
        f(&conn)
    }

    /// Runs `f` inside a single transaction on the writer connection.
    /// Callers are responsible for keeping the work inside bounded in time
    /// (the retention job's row-removal phase caps itself at 10s); this
    /// layer doesn't attempt to preempt a running transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T, Error>) -> Result<T, Error> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(|e| err!(Internal, msg("beginning transaction"), source(e)))?;
        let result = f(&tx)?;
        tx.commit()
            .map_err(|e| err!(Internal, msg("committing transaction"), source(e)))?;
        Ok(result)
    }

    /// Runs `f` with a reader connection checked out of the pool, opening a
    /// new one (up to `max_readers`) if none is idle.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        let mut conn = {
            let mut readers = self.readers.lock();
            match readers.pop() {
                Some(c) => c,
                None if readers.len() < self.max_readers => open_conn(&self.path)?,
                None => open_conn(&self.path)?,
            }
        };
        let result = f(&conn);
        // Best-effort: if something left a transaction open, don't return
        // this connection to the pool.
        if conn.is_autocommit() {
            let mut readers = self.readers.lock();
            if readers.len() < self.max_readers {
                readers.push(conn);
            }
        } else {
            let _ = conn.execute_batch("ROLLBACK");
        }
        result
    }
}

fn open_conn(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path).map_err(|e| err!(Unavailable, msg("opening {}", path.display()), source(e)))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|e| err!(Internal, msg("setting busy_timeout"), source(e)))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| err!(Internal, msg("enabling WAL"), source(e)))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| err!(Internal, msg("enabling foreign keys"), source(e)))?;
    Ok(conn)
}

/// Convenience used by the retention job and the crash-recovery scan: the
/// error kind to surface when the database itself is unreachable (SQLite
/// corruption, disk unmounted). This is a global, cross-stream condition,
/// not a per-stream one.
pub fn classify_sqlite_err(e: &rusqlite::Error) -> ErrorKind {
    match e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseCorrupt
                || code.code == rusqlite::ErrorCode::DiskIOFailure
                || code.code == rusqlite::ErrorCode::CannotOpen =>
        {
            ErrorKind::DataLoss
        }
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("lightnvr.db")).unwrap();
        db.with_reader(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'recordings'",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn transaction_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("lightnvr.db")).unwrap();
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO recordings (stream, file_path, wall_start, wall_end, size_bytes, trigger) \
                 VALUES ('front', '/x.mp4', 0, 10, 100, 'schedule')",
                [],
            )
            .map_err(|e| err!(Internal, source(e)))?;
            Ok(())
        })
        .unwrap();
        db.with_reader(|conn| {
            let count: i64 = conn
                .query_row("SELECT count(*) FROM recordings", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }
}
