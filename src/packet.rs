// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! [`Packet`]: one demuxed unit as it flows `Ingest` -> `PacketBus` ->
//! writers.

use bytes::Bytes;

pub const STREAM_INDEX_VIDEO: u8 = 0;
pub const STREAM_INDEX_AUDIO: u8 = 1;

/// A rational time base, `num/den` seconds per tick. Packet `pts`/`dts` are
/// in these units and are never converted to wall time except by writers
/// picking segment boundaries.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const MICROS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    /// Converts a tick count in this time base to whole seconds, rounding
    /// down. Used only for segment-boundary bookkeeping, never for
    /// re-encoding timestamps.
    pub fn ticks_to_secs_f64(&self, ticks: i64) -> f64 {
        (ticks as f64 * self.num as f64) / self.den as f64
    }

    pub fn secs_to_ticks(&self, secs: f64) -> i64 {
        (secs * self.den as f64 / self.num as f64).round() as i64
    }
}

/// One demuxed access unit, reference-counted so a subscriber can hold a
/// clone past the producer's next iteration.
#[derive(Clone, Debug)]
pub struct Packet {
    pub stream_index: u8,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_keyframe: bool,
    pub payload: Bytes,
    pub time_base: TimeBase,
}

impl Packet {
    pub fn is_video(&self) -> bool {
        self.stream_index == STREAM_INDEX_VIDEO
    }

    pub fn is_audio(&self) -> bool {
        self.stream_index == STREAM_INDEX_AUDIO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_base_round_trips_seconds() {
        let tb = TimeBase { num: 1, den: 90_000 };
        let ticks = tb.secs_to_ticks(2.0);
        assert_eq!(ticks, 180_000);
        assert!((tb.ticks_to_secs_f64(ticks) - 2.0).abs() < 1e-9);
    }
}
