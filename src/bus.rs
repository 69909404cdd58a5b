// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `PacketBus`: single-producer, multi-consumer fan-out with a drop policy
//! per consumer type.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::media::VideoSampleEntry;
use crate::packet::Packet;

/// How a subscriber's queue behaves when full.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DropPolicy {
    /// Producer blocks up to `block_for`, then the oldest non-keyframe
    /// packet is evicted to make room (HlsWriter, Mp4Segmenter).
    BlockThenDropOldestNonKeyframe,
    /// Always succeeds by evicting the oldest packet unconditionally
    /// (PreRollBuffer: "definitionally a ring").
    OverwriteOldest,
    /// The new packet is discarded if the queue is full; existing queued
    /// packets are left alone (Detection: "coalesce to latest frame
    /// cadence").
    DropNewest,
}

#[derive(Copy, Clone, Debug)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub block_for: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            queue_capacity: 64,
            block_for: Duration::from_millis(50),
        }
    }
}

struct SubscriberState {
    queue: Mutex<VecDeque<Packet>>,
    condvar: Condvar,
    capacity: usize,
    drop_policy: DropPolicy,
    /// True once this subscriber has observed a video keyframe; packets
    /// before that are skipped so a subscriber added mid-stream starts on a
    /// keyframe.
    started: AtomicBool,
    closed: AtomicBool,
}

/// A subscription handle. Dropping it unsubscribes.
pub struct Subscription {
    state: Arc<SubscriberState>,
    bus: Arc<PacketBusInner>,
    id: u64,
}

impl Subscription {
    /// Blocks up to 100ms, the suspension-point polling interval used
    /// throughout the runtime's worker loops, for the next packet, returning
    /// `None` on timeout so the caller can re-check its shutdown flag.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Packet> {
        let mut q = self.state.queue.lock().unwrap();
        loop {
            if let Some(p) = q.pop_front() {
                return Some(p);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            let (guard, result) = self.state.condvar.wait_timeout(q, timeout).unwrap();
            q = guard;
            if result.timed_out() {
                return None;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

struct PacketBusInner {
    subscribers: Mutex<Vec<(u64, Arc<SubscriberState>)>>,
    next_id: AtomicU64,
}

/// Fans out one stream's packets to any number of subscribers. The producer
/// side (`publish`) is the only writer; subscribe/unsubscribe takes a short
/// lock.
pub struct PacketBus {
    inner: Arc<PacketBusInner>,
    video_sample_entry: Mutex<Option<VideoSampleEntry>>,
    stream: String,
}

impl PacketBus {
    pub fn new(_config: BusConfig) -> Self {
        PacketBus {
            inner: Arc::new(PacketBusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            video_sample_entry: Mutex::new(None),
            stream: String::new(),
        }
    }

    pub fn named(stream: impl Into<String>, config: BusConfig) -> Self {
        PacketBus {
            stream: stream.into(),
            ..Self::new(config)
        }
    }

    pub fn set_video_sample_entry(&self, entry: VideoSampleEntry) {
        *self.video_sample_entry.lock().unwrap() = Some(entry);
    }

    pub fn video_sample_entry(&self) -> Option<VideoSampleEntry> {
        self.video_sample_entry.lock().unwrap().clone()
    }

    pub fn subscribe(&self, capacity: usize, drop_policy: DropPolicy) -> Subscription {
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            condvar: Condvar::new(),
            capacity,
            drop_policy,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().push((id, state.clone()));
        Subscription {
            state,
            bus: self.inner.clone(),
            id,
        }
    }

    /// Publishes one packet to every subscriber, applying each one's drop
    /// policy independently. Never blocks longer than `BlockThenDrop...`'s
    /// `block_for` per subscriber.
    pub fn publish(&self, packet: Packet) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for (_, sub) in subscribers.iter() {
            deliver(&self.stream, sub, packet.clone());
        }
    }

    /// Closes every subscriber's queue, waking blocked receivers so they
    /// can observe end-of-stream (used on `Ingest` shutdown/EOF).
    pub fn close(&self) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for (_, sub) in subscribers.iter() {
            sub.closed.store(true, Ordering::Release);
            sub.condvar.notify_all();
        }
    }
}

fn deliver(stream: &str, sub: &Arc<SubscriberState>, packet: Packet) {
    if !sub.started.load(Ordering::Acquire) {
        if packet.is_video() && packet.is_keyframe {
            sub.started.store(true, Ordering::Release);
        } else {
            return;
        }
    }

    let mut q = sub.queue.lock().unwrap();
    if q.len() < sub.capacity {
        q.push_back(packet);
        sub.condvar.notify_one();
        return;
    }

    match sub.drop_policy {
        DropPolicy::OverwriteOldest => {
            q.pop_front();
            q.push_back(packet);
            sub.condvar.notify_one();
        }
        DropPolicy::DropNewest => {
            warn!(stream, "detection queue full, dropping newest frame");
        }
        DropPolicy::BlockThenDropOldestNonKeyframe => {
            drop(q);
            std::thread::sleep(Duration::from_millis(50));
            q = sub.queue.lock().unwrap();
            if q.len() < sub.capacity {
                q.push_back(packet);
                sub.condvar.notify_one();
                return;
            }
            let evict = q.iter().position(|p| !p.is_keyframe);
            match evict {
                Some(i) => {
                    q.remove(i);
                }
                None => {
                    warn!(stream, "writer queue full of keyframes, dropping oldest");
                    q.pop_front();
                }
            }
            q.push_back(packet);
            sub.condvar.notify_one();
            warn!(stream, "writer queue overflowed, dropped a packet to catch up");
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

    #[test]
    fn subscriber_skips_until_first_keyframe() {
        let bus = PacketBus::new(BusConfig::default());
        let sub = bus.subscribe(8, DropPolicy::OverwriteOldest);
        bus.publish(pkt(0, false));
        bus.publish(pkt(1, true));
        bus.publish(pkt(2, false));
        let p0 = sub.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(p0.pts, 1);
        let p1 = sub.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(p1.pts, 2);
    }

    #[test]
    fn preroll_ring_overwrites_oldest() {
        let bus = PacketBus::new(BusConfig::default());
        let sub = bus.subscribe(2, DropPolicy::OverwriteOldest);
        bus.publish(pkt(0, true));
        bus.publish(pkt(1, false));
        bus.publish(pkt(2, false)); // evicts pts=0
        let p0 = sub.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(p0.pts, 1);
        let p1 = sub.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(p1.pts, 2);
    }

    #[test]
    fn detection_drops_newest_when_full() {
        let bus = PacketBus::new(BusConfig::default());
        let sub = bus.subscribe(1, DropPolicy::DropNewest);
        bus.publish(pkt(0, true));
        bus.publish(pkt(1, false)); // dropped, queue already has pts=0
        let p0 = sub.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(p0.pts, 0);
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn unsubscribe_removes_from_fan_out() {
        let bus = PacketBus::new(BusConfig::default());
        let sub = bus.subscribe(8, DropPolicy::OverwriteOldest);
        drop(sub);
        bus.publish(pkt(0, true)); // must not panic with no subscribers
        assert_eq!(bus.inner.subscribers.lock().unwrap().len(), 0);
    }
}
