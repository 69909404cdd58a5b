// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `Ingest`: one live network connection per enabled stream, reconnecting
//! with backoff, producing an ordered [`Packet`] sequence.
//!
//! Built on [`crate::stream`]'s synchronous-looking Retina wrapper: this
//! module owns the reconnect loop, the backoff policy, and the
//! `retina::codec::VideoFrame` -> `Packet` conversion that `stream.rs`
//! itself doesn't need to know about.

use std::sync::Arc;
use std::time::Duration;

use base::clock::{Backoff, Clocks};
use base::shutdown::Receiver as ShutdownReceiver;
use base::{Error, ErrorKind};
use tracing::{info, warn};
use url::Url;

use crate::bus::PacketBus;
use crate::error::RuntimeErrorKind;
use crate::health::StreamHealth;
use crate::packet::{Packet, TimeBase, STREAM_INDEX_VIDEO};
use crate::stream::{Opener, Options, Stream};

/// Classifies a failed `open`/`next` per §7: `SourceFatal` (auth failure,
/// no video stream, unsupported codec) moves the stream to
/// `Disabled(reason)` and stops `run` for good; everything else is
/// `SourceTransient` and reconnects with backoff.
fn classify(e: &Error) -> RuntimeErrorKind {
    match e.kind() {
        ErrorKind::FailedPrecondition | ErrorKind::PermissionDenied | ErrorKind::Unauthenticated | ErrorKind::Unimplemented => {
            RuntimeErrorKind::SourceFatal
        }
        _ => RuntimeErrorKind::SourceTransient,
    }
}

/// Microsecond time base: the units `retina::codec::VideoFrame::timestamp`
/// already uses (`.elapsed()` returns elapsed 90kHz ticks -- see below),
/// kept as-is rather than renormalized: pts/dts discontinuities across a
/// reconnect are not rewritten.
const RTP_VIDEO_TIME_BASE: TimeBase = TimeBase { num: 1, den: 90_000 };

/// Result of a connect attempt: protocol test surface for the API.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub width: u16,
    pub height: u16,
    pub codec: String,
}

#[derive(Debug)]
pub struct ProbeError {
    pub message: String,
}

/// Probes a URL without starting continuous ingest. `fps` isn't knowable
/// from a single frame and is intentionally left for the caller to derive
/// from `StreamConfig` instead (this repository doesn't decode audio/video
/// timing statistics beyond what's needed for segmenting).
pub fn probe(opener: &dyn Opener, label: &str, url: Url, options: Options) -> Result<ProbeResult, ProbeError> {
    let stream = opener
        .open(label.to_string(), url, options)
        .map_err(|e| ProbeError { message: e.chain() })?;
    let entry = stream.video_sample_entry();
    Ok(ProbeResult {
        width: entry.width,
        height: entry.height,
        codec: entry.rfc6381_codec.clone(),
    })
}

/// One running ingest worker for a single stream. Owns the reconnect loop;
/// `run` blocks the calling (dedicated, one per stream) thread until
/// cancelled.
pub struct Ingest {
    label: String,
    url: Url,
    options_factory: Box<dyn Fn() -> Options + Send>,
    opener: Arc<dyn Opener>,
    bus: Arc<PacketBus>,
    health: Arc<StreamHealth>,
}

impl Ingest {
    pub fn new(
        label: String,
        url: Url,
        options_factory: Box<dyn Fn() -> Options + Send>,
        opener: Arc<dyn Opener>,
        bus: Arc<PacketBus>,
        health: Arc<StreamHealth>,
    ) -> Self {
        Ingest {
            label,
            url,
            options_factory,
            opener,
            bus,
            health,
        }
    }

    /// Runs until `shutdown_rx` fires, the source reaches EOF, or a
    /// `SourceFatal`-class error is hit (marking the stream
    /// `Disabled(reason)` via `self.health` before returning); everything
    /// else is `SourceTransient` and reconnects with [`Backoff::INGEST`].
    /// Never synthesizes packets across a reconnect gap.
    pub fn run<C: Clocks>(&self, clocks: &C, shutdown_rx: &ShutdownReceiver, rand_unit: impl Fn() -> f64) {
        let mut failures: u32 = 0;
        loop {
            if shutdown_rx.check().is_err() {
                return;
            }
            match self.opener.open(self.label.clone(), self.url.clone(), (self.options_factory)()) {
                Ok(mut stream) => {
                    failures = 0;
                    self.health.mark_running();
                    let mut sample_entry = stream.video_sample_entry().clone();
                    self.bus.set_video_sample_entry(sample_entry.clone());
                    loop {
                        if shutdown_rx.check().is_err() {
                            return;
                        }
                        match stream.next() {
                            Ok(frame) => {
                                if frame.new_video_sample_entry {
                                    sample_entry = stream.video_sample_entry().clone();
                                    self.bus.set_video_sample_entry(sample_entry.clone());
                                }
                                self.bus.publish(frame_to_packet(&frame));
                            }
                            Err(e) if e.kind() == ErrorKind::OutOfRange => {
                                info!(stream = %self.label, "ingest reached end of stream, stopping");
                                return;
                            }
                            Err(e) => {
                                if classify(&e) == RuntimeErrorKind::SourceFatal {
                                    warn!(stream = %self.label, err = %e.chain(), "fatal ingest read failure, disabling stream");
                                    self.health.mark_disabled(e.chain());
                                    return;
                                }
                                warn!(stream = %self.label, err = %e.chain(), "ingest read failed, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    if classify(&e) == RuntimeErrorKind::SourceFatal {
                        warn!(stream = %self.label, err = %e.chain(), "fatal ingest connect failure, disabling stream");
                        self.health.mark_disabled(e.chain());
                        return;
                    }
                    warn!(stream = %self.label, err = %e.chain(), "ingest connect failed, reconnecting");
                }
            }
            failures += 1;
            let delay = Backoff::INGEST.delay(failures, rand_unit());
            self.health.mark_reconnecting(failures, clocks.realtime() + delay);
            info!(stream = %self.label, attempt = failures, delay = ?delay, "reconnecting after backoff");
            clocks.sleep(delay.min(Duration::from_secs(30)));
        }
    }
}

fn frame_to_packet(frame: &crate::stream::VideoFrame) -> Packet {
    Packet {
        stream_index: STREAM_INDEX_VIDEO,
        pts: frame.pts,
        dts: frame.pts,
        duration: 0,
        is_keyframe: frame.is_key,
        payload: frame.data.clone(),
        time_base: RTP_VIDEO_TIME_BASE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use base::clock::SimulatedClocks;
    use base::err;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyOpener {
        attempts: AtomicUsize,
        fail_until: usize,
    }

    impl Opener for FlakyOpener {
        fn open(&self, _label: String, _url: Url, _options: Options) -> Result<Box<dyn Stream>, Error> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_until {
                return Err(err!(Unavailable, msg("connect refused")));
            }
            Err(err!(Cancelled, msg("test stream has no real frames to offer")))
        }
    }

    #[test]
    fn reconnects_with_backoff_before_giving_up_on_shutdown() {
        let opener = Arc::new(FlakyOpener {
            attempts: AtomicUsize::new(0),
            fail_until: 3,
        });
        let bus = Arc::new(PacketBus::new(BusConfig::default()));
        let health = Arc::new(StreamHealth::new());
        let ingest = Ingest::new(
            "test".to_string(),
            Url::parse("rtsp://example.invalid/stream").unwrap(),
            Box::new(|| Options {
                session: retina::client::SessionOptions::default(),
                setup: retina::client::SetupOptions::default(),
            }),
            opener.clone(),
            bus,
            health.clone(),
        );
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap());
        let (tx, rx) = base::shutdown::channel();
        // Drop the sender from another thread after a bounded number of
        // simulated-clock sleeps so the loop actually terminates: each
        // failed connect sleeps once, advancing the simulated clock.
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = done.clone();
        std::thread::spawn(move || {
            while !done2.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            drop(tx);
        });
        let rand = || 0.5;
        // Run on a separate thread with a watchdog, since a stuck loop
        // would otherwise hang the test forever.
        let rx2 = rx.clone();
        let handle = std::thread::spawn(move || ingest.run(&clocks, &rx2, rand));
        std::thread::sleep(Duration::from_millis(50));
        done.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(opener.attempts.load(Ordering::SeqCst) >= 1);
    }
}
