// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock time handling.
//!
//! Segment and recording boundaries are all wall-clock, unlike packet `pts`/`dts`, which stay in
//! each stream's own rational time base and never get converted to wall
//! time except to pick segment boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

/// The time zone used when rendering local-time strings (log timestamps,
/// `%FT%T%:z`-style display). Assigned once from `jiff::tz::TimeZone::system()`
/// at startup; tests pin it to a fixed zone so results are reproducible.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .cloned()
        .unwrap_or(jiff::tz::TimeZone::UTC)
}

/// A wall-clock instant, stored as whole seconds since the Unix epoch.
/// Sub-second precision isn't meaningful at segment-boundary granularity,
/// so unlike the packet time base this deliberately doesn't carry one.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize, Hash)]
pub struct WallTime(pub i64);

impl WallTime {
    pub const MIN: Self = WallTime(i64::MIN);
    pub const MAX: Self = WallTime(i64::MAX);

    pub fn now() -> Self {
        WallTime(jiff::Timestamp::now().as_second())
    }

    pub fn unix_seconds(&self) -> i64 {
        self.0
    }

    /// Renders as an ISO-8601 UTC string, the format used for
    /// recording timestamps.
    pub fn to_iso8601_utc(self) -> String {
        jiff::Timestamp::from_second(self.0)
            .map(|ts| ts.to_string())
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

impl From<jiff::Timestamp> for WallTime {
    fn from(ts: jiff::Timestamp) -> Self {
        WallTime(ts.as_second())
    }
}

impl fmt::Debug for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(ts) = jiff::Timestamp::from_second(self.0) else {
            return write!(f, "{}", self.0);
        };
        let zoned = jiff::Zoned::new(ts, global_zone());
        write!(f, "{}", zoned.strftime("%FT%T%:z"))
    }
}

impl ops::Sub for WallTime {
    type Output = std::time::Duration;
    fn sub(self, rhs: WallTime) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.saturating_sub(rhs.0).max(0) as u64)
    }
}

impl ops::Add<std::time::Duration> for WallTime {
    type Output = WallTime;
    fn add(self, rhs: std::time::Duration) -> WallTime {
        WallTime(self.0 + rhs.as_secs() as i64)
    }
}

impl ops::Sub<std::time::Duration> for WallTime {
    type Output = WallTime;
    fn sub(self, rhs: std::time::Duration) -> WallTime {
        WallTime(self.0 - rhs.as_secs() as i64)
    }
}

pub mod testutil {
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles")
                .expect("America/Los_Angeles should exist")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_local_zone() {
        testutil::init_zone();
        // 2006-01-02T15:04:05 in America/Los_Angeles (PST, -08:00).
        let t = WallTime(1136239445);
        assert_eq!(format!("{t}"), "2006-01-02T15:04:05-08:00");
    }

    #[test]
    fn iso8601_is_utc() {
        let t = WallTime(1136239445);
        assert_eq!(t.to_iso8601_utc(), "2006-01-02T23:04:05Z");
    }

    #[test]
    fn sub_produces_duration() {
        let a = WallTime(100);
        let b = WallTime(70);
        assert_eq!(a - b, std::time::Duration::from_secs(30));
    }
}
