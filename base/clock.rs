// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Everything here is built around `std::time::Instant` for monotonic time
//! and `jiff::Timestamp` for wall-clock time, rather than going through
//! `libc::clock_gettime` directly: the standard library's `Instant` already
//! guarantees monotonicity on every platform we target, and `jiff` is the
//! time library used everywhere else in the tree.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::Error;
use crate::shutdown::{Receiver as ShutdownReceiver, ShutdownError};

/// Abstract interface to the system clocks, for testability.
pub trait Clocks: Send + Sync + 'static {
    /// The current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// The current monotonic time. Only meaningful relative to another call
    /// on the same `Clocks` instance.
    fn monotonic(&self) -> Instant;

    /// Blocks the current thread for `how_long`.
    fn sleep(&self, how_long: Duration);

    /// Returns a future that resolves after `how_long`.
    fn sleep_async(&self, how_long: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Retries `f` until it succeeds or shutdown is requested, sleeping a fixed
/// 1s between attempts. Used on pure-synchronous retry loops (streamer
/// worker threads outside of the tokio runtime).
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &ShutdownReceiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "sleeping for 1s after error");
        clocks.sleep(Duration::from_secs(1));
    }
}

/// Exponential backoff with jitter, per the reconnect policy in the ingest
/// component contract: starts at `base`, doubles each failure, caps at
/// `max`, and is perturbed by up to `jitter_frac` in either direction so
/// that many streams failing at once don't all retry in lockstep.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_frac: f64,
}

impl Backoff {
    pub const INGEST: Backoff = Backoff {
        base: Duration::from_secs(1),
        max: Duration::from_secs(30),
        jitter_frac: 0.2,
    };

    /// Returns the delay to use after `failure_count` consecutive failures
    /// (1 for the first failure), using `rand_unit` — a caller-supplied
    /// value in `[0, 1)` — as the jitter source so this stays deterministic
    /// under test.
    pub fn delay(&self, failure_count: u32, rand_unit: f64) -> Duration {
        let shift = failure_count.saturating_sub(1).min(10);
        let nominal = self.base.saturating_mul(1u32 << shift).min(self.max);
        let jitter = (rand_unit * 2.0 - 1.0) * self.jitter_frac;
        nominal.mul_f64((1.0 + jitter).max(0.0))
    }
}

#[derive(Copy, Clone)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }

    fn sleep_async(&self, how_long: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(how_long))
    }
}

/// Logs a warning if the guard lives "too long" (>= 1s), using the label
/// built by a supplied closure. Dropped without cost in the common case.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_duration_since(self.start);
        if elapsed >= Duration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for deterministic tests of rotation/retention/backoff
/// timing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot_realtime: jiff::Timestamp,
    boot_monotonic: Instant,
    elapsed: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot_realtime: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot_realtime,
            boot_monotonic: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        self.0.boot_realtime + *self.0.elapsed.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        self.0.boot_monotonic + *self.0.elapsed.lock().unwrap()
    }

    /// Advances the simulated clock without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.elapsed.lock().unwrap();
        *l += how_long;
    }

    fn sleep_async(&self, how_long: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        self.sleep(how_long);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        let b = Backoff::INGEST;
        assert_eq!(b.delay(1, 0.5), Duration::from_secs(1));
        assert_eq!(b.delay(2, 0.5), Duration::from_secs(2));
        assert_eq!(b.delay(6, 0.5), Duration::from_secs(30)); // 32s clamped to 30s
        assert_eq!(b.delay(100, 0.5), Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_bounds() {
        let b = Backoff::INGEST;
        let lo = b.delay(3, 0.0); // 4s base, -20%
        let hi = b.delay(3, 1.0); // 4s base, +20%
        assert_eq!(lo, Duration::from_millis(3200));
        assert_eq!(hi, Duration::from_millis(4800));
    }

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap());
        let t0 = c.monotonic();
        c.sleep(Duration::from_secs(5));
        assert_eq!(c.monotonic() - t0, Duration::from_secs(5));
        assert_eq!(c.realtime().as_second(), 5);
    }
}
