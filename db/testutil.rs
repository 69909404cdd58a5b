// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for tests of this crate and of the `lightnvr` binary crate.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::recording::{NewRecording, RecordingId, Trigger};
use crate::schema::Database;

static INIT: std::sync::Once = std::sync::Once::new();

/// Global test init: logging plus a fixed time zone so calendar-sensitive
/// tests (recovery's path-derived timestamps, display formatting) are
/// reproducible regardless of the machine running them.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        base::time::testutil::init_zone();
    });
}

/// An open [`Database`] backed by a temporary directory that lives as long
/// as this struct does.
pub struct TestDb {
    pub db: Database,
    pub tmpdir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        init();
        let tmpdir = tempfile::Builder::new().prefix("lightnvr-test").tempdir().unwrap();
        let db = Database::open(&tmpdir.path().join("lightnvr.db")).unwrap();
        TestDb { db, tmpdir }
    }

    pub fn mp4_root(&self) -> PathBuf {
        self.tmpdir.path().join("mp4")
    }

    /// Inserts a recording with placeholder content, returning its id.
    pub fn insert_recording(&self, stream: &str, wall_start: i64, wall_end: i64) -> RecordingId {
        self.db
            .insert_recording(&NewRecording {
                stream: stream.to_string(),
                file_path: self.mp4_root().join(stream).join(format!("{wall_start}.mp4")),
                wall_start,
                wall_end,
                size_bytes: 1024,
                trigger: Trigger::Schedule,
                has_detection: false,
                thumbnail_path: None,
            })
            .unwrap()
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
