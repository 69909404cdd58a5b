// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream and global health state:
//! "per-stream errors never crash the process; they mark the stream with a
//! typed health state. Cross-stream errors ... are global and surface
//! through the Supervisor as a degraded health state."

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// One stream's current health, read by the API collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamHealthState {
    Running,
    Reconnecting { attempt: u32, next_retry_at: jiff::Timestamp },
    Disabled { reason: String },
}

/// Lock-free-on-the-hot-path health cell: `Ingest` updates this on every
/// connect/disconnect without contending with API reads.
pub struct StreamHealth {
    running: AtomicBool,
    attempt: AtomicU32,
    next_retry_at_micros: AtomicU64,
    disabled_reason: Mutex<Option<String>>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHealth {
    pub fn new() -> Self {
        StreamHealth {
            running: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            next_retry_at_micros: AtomicU64::new(0),
            disabled_reason: Mutex::new(None),
        }
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
        self.attempt.store(0, Ordering::Release);
        *self.disabled_reason.lock().unwrap() = None;
    }

    pub fn mark_reconnecting(&self, attempt: u32, next_retry_at: jiff::Timestamp) {
        self.running.store(false, Ordering::Release);
        self.attempt.store(attempt, Ordering::Release);
        self.next_retry_at_micros
            .store(next_retry_at.as_microsecond() as u64, Ordering::Release);
    }

    /// A `SourceFatal` error moves a stream to `Disabled(reason)` and
    /// keeps it there until re-enabled through configuration.
    pub fn mark_disabled(&self, reason: impl Into<String>) {
        self.running.store(false, Ordering::Release);
        *self.disabled_reason.lock().unwrap() = Some(reason.into());
    }

    pub fn state(&self) -> StreamHealthState {
        if let Some(reason) = self.disabled_reason.lock().unwrap().clone() {
            return StreamHealthState::Disabled { reason };
        }
        if self.running.load(Ordering::Acquire) {
            return StreamHealthState::Running;
        }
        let micros = self.next_retry_at_micros.load(Ordering::Acquire) as i64;
        StreamHealthState::Reconnecting {
            attempt: self.attempt.load(Ordering::Acquire),
            next_retry_at: jiff::Timestamp::from_microsecond(micros).unwrap_or(jiff::Timestamp::UNIX_EPOCH),
        }
    }
}

/// Process-wide health, aggregated by the Supervisor from every stream plus
/// cross-stream conditions such as SQLite corruption or the storage volume
/// unmounting.
#[derive(Clone, Debug, Default)]
pub struct GlobalHealth {
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub disk_full: bool,
}

impl GlobalHealth {
    pub fn ok() -> Self {
        GlobalHealth::default()
    }

    pub fn degrade(&mut self, reason: impl Into<String>) {
        self.degraded = true;
        self.degraded_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_reconnecting_until_first_success() {
        let h = StreamHealth::new();
        assert_eq!(h.state(), StreamHealthState::Reconnecting { attempt: 0, next_retry_at: jiff::Timestamp::UNIX_EPOCH });
        h.mark_running();
        assert_eq!(h.state(), StreamHealthState::Running);
    }

    #[test]
    fn disabled_overrides_reconnecting() {
        let h = StreamHealth::new();
        h.mark_reconnecting(3, jiff::Timestamp::now());
        h.mark_disabled("no video stream");
        assert!(matches!(h.state(), StreamHealthState::Disabled { .. }));
    }
}
