// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod detection;
pub mod recording;
pub mod recovery;
pub mod retention;
pub mod schema;
pub mod testutil;

pub use crate::recording::{RecordingFilter, RecordingId, RecordingRow, Trigger};
pub use crate::schema::Database;
