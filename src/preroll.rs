// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `PreRollBuffer`: holds the last `pre_roll_sec` of packets per stream so a
//! detection trigger can begin a segment "in the past".
//!
//! Subscribes to a stream's [`crate::bus::PacketBus`] with
//! [`DropPolicy::OverwriteOldest`] — "definitionally a ring". Each packet is
//! stamped with the wall-clock time it was pushed so
//! [`PreRollBuffer::drain_from_last_keyframe`] can answer "everything from
//! the last keyframe at or before `now - pre_roll_sec`".

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;

use crate::bus::{DropPolicy, PacketBus, Subscription};
use crate::packet::Packet;

struct Entry {
    wall_time: jiff::Timestamp,
    packet: Packet,
}

/// Sized at `pre_roll_sec * fps * 1.2` plus a 64-packet cushion. Stores clones of the shared [`Packet`], not copies of its
/// payload bytes (`Packet::payload` is a reference-counted `Bytes`).
pub struct PreRollBuffer {
    ring: Mutex<VecDeque<Entry>>,
    capacity: usize,
}

fn capacity_for(pre_roll_sec: f64, fps: f64) -> usize {
    ((pre_roll_sec * fps * 1.2).ceil() as usize).saturating_add(64)
}

impl PreRollBuffer {
    pub fn new(pre_roll_sec: f64, fps: f64) -> Self {
        PreRollBuffer {
            ring: Mutex::new(VecDeque::new()),
            capacity: capacity_for(pre_roll_sec, fps),
        }
    }

    /// O(1): appends `packet`, evicting the oldest entry if at capacity.
    pub fn push(&self, wall_time: jiff::Timestamp, packet: Packet) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(Entry { wall_time, packet });
    }

    /// Returns the keyframe at or before `now - pre_roll_sec` and every
    /// packet after it, in producer order. Never empty as long as the ring
    /// holds at least one keyframe: with `pre_roll_sec == 0` this degrades
    /// to "the most recent keyframe onward", never an empty or negative
    /// prefix.
    pub fn drain_from_last_keyframe(&self, pre_roll_sec: f64, now: jiff::Timestamp) -> Vec<Packet> {
        let ring = self.ring.lock().unwrap();
        let cutoff = now - std::time::Duration::from_secs_f64(pre_roll_sec.max(0.0));
        let start = ring
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.packet.is_video() && e.packet.is_keyframe && e.wall_time <= cutoff)
            .map(|(i, _)| i);
        let start = match start {
            Some(i) => i,
            // No keyframe old enough: fall back to the oldest keyframe we
            // do have, so the result still begins on one.
            None => match ring.iter().position(|e| e.packet.is_video() && e.packet.is_keyframe) {
                Some(i) => i,
                None => return Vec::new(),
            },
        };
        ring.iter().skip(start).map(|e| e.packet.clone()).collect()
    }

    /// Called when the owning stream is disabled.
    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
    }

    /// Subscribes to `bus` with [`DropPolicy::OverwriteOldest`] -- this
    /// buffer is already a ring, so a drop policy that blocks the publisher
    /// would be redundant -- and feeds every packet in until `shutdown_rx`
    /// fires. Meant to run on its own dedicated thread alongside the other
    /// per-stream workers.
    pub fn run<C: Clocks>(&self, clocks: &C, bus: &PacketBus, shutdown_rx: &ShutdownReceiver) {
        let sub: Subscription = bus.subscribe(256, DropPolicy::OverwriteOldest);
        loop {
            if shutdown_rx.check().is_err() {
                return;
            }
            match sub.recv_timeout(Duration::from_millis(200)) {
                Some(packet) => self.push(clocks.realtime(), packet),
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{TimeBase, STREAM_INDEX_VIDEO};

    fn pkt(pts: i64, keyframe: bool) -> Packet {
        Packet {
            stream_index: STREAM_INDEX_VIDEO,
            pts,
            dts: pts,
            duration: 0,
            is_keyframe: keyframe,
            payload: bytes::Bytes::new(),
            time_base: TimeBase { num: 1, den: 90_000 },
        }
    }

    fn t(secs: i64) -> jiff::Timestamp {
        jiff::Timestamp::from_second(secs).unwrap()
    }

    #[test]
    fn drains_from_keyframe_before_cutoff() {
        let buf = PreRollBuffer::new(5.0, 15.0);
        buf.push(t(0), pkt(0, true));
        buf.push(t(1), pkt(1, false));
        buf.push(t(5), pkt(2, true));
        buf.push(t(6), pkt(3, false));
        buf.push(t(10), pkt(4, true));
        buf.push(t(11), pkt(5, false));
        // now=11, pre_roll=5 -> cutoff=6: the last keyframe at or before 6 is t=5 (pts=2).
        let drained = buf.drain_from_last_keyframe(5.0, t(11));
        assert_eq!(drained.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert!(drained[0].is_keyframe);
    }

    #[test]
    fn zero_pre_roll_yields_single_keyframe_prefix_never_empty() {
        let buf = PreRollBuffer::new(0.0, 15.0);
        buf.push(t(0), pkt(0, true));
        buf.push(t(1), pkt(1, false));
        let drained = buf.drain_from_last_keyframe(0.0, t(1));
        assert!(!drained.is_empty());
        assert!(drained[0].is_keyframe);
    }

    #[test]
    fn ring_overwrites_oldest_past_capacity() {
        let buf = PreRollBuffer::new(0.1, 10.0); // capacity = 0.1*10*1.2 + 64 = 65, rounds up
        for i in 0..100i64 {
            buf.push(t(i), pkt(i, i % 10 == 0));
        }
        let ring = buf.ring.lock().unwrap();
        assert!(ring.len() <= 65);
        assert_eq!(ring.front().unwrap().packet.pts, 35);
    }

    #[test]
    fn clear_empties_ring() {
        let buf = PreRollBuffer::new(5.0, 15.0);
        buf.push(t(0), pkt(0, true));
        buf.clear();
        assert!(buf.drain_from_last_keyframe(5.0, t(0)).is_empty());
    }
}
