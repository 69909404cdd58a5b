// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

#![cfg_attr(all(feature = "nightly", test), feature(test))]

use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base::Error;
use bpaf::Bpaf;
use db::schema::Database;
use tracing::{debug, error, info};

mod bus;
mod config;
mod detection;
mod detector;
mod error;
mod health;
mod hls;
mod ingest;
mod media;
mod mp4_box_writer;
mod mp4_segmenter;
mod packet;
mod preroll;
mod retention_task;
mod stream;
mod supervisor;

use supervisor::Supervisor;

const DEFAULT_CONFIG_PATH: &str = "/etc/lightnvr/lightnvr.conf";
const PID_LOCK_PATH: &str = "/var/lib/lightnvr/lightnvr.lock";

// This is either in the environment when `cargo` is invoked or set from within `build.rs`.
const VERSION: &str = env!("VERSION");

/// LightNVR: a lightweight network video recorder core.
///
/// Exactly these four flags, no subcommands.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
struct Args {
    /// Detach and run in the background.
    daemon: bool,

    /// Path to the INI configuration file.
    #[bpaf(argument("PATH"), fallback(DEFAULT_CONFIG_PATH.into()), debug_fallback())]
    config: PathBuf,
}

/// Holds an exclusive `flock` on a lock file for the lifetime of the
/// process, so a second instance started against the same state directory
/// fails fast rather than
/// silently corrupting the database or fighting over segment files.
struct PidLock {
    fd: RawFd,
}

impl PidLock {
    fn acquire(path: &Path) -> Result<Self, Error> {
        use nix::fcntl::{self, FlockArg, OFlag};
        use nix::sys::stat::Mode;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| base::err!(Internal, msg("creating {}", parent.display()), source(e)))?;
        }
        let fd = fcntl::open(path, OFlag::O_CREAT | OFlag::O_RDWR, Mode::from_bits_truncate(0o644))
            .map_err(|e| base::err!(Internal, msg("opening pid lock {}", path.display()), source(e)))?;
        if let Err(e) = fcntl::flock(fd, FlockArg::LockExclusiveNonblock) {
            let _ = nix::unistd::close(fd);
            return Err(base::err!(
                AlreadyExists,
                msg("another instance already holds the lock on {}", path.display()),
                source(e)
            ));
        }
        Ok(PidLock { fd })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

/// SIGPIPE's default action (process termination) is wrong for a program
/// that writes to sockets and pipes as a matter of course.
fn install_signal_ignores() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run(args: Args) -> Result<i32, Error> {
    let _pid_lock = PidLock::acquire(&PathBuf::from(PID_LOCK_PATH))?;

    let config = config::load(&args.config).map_err(|e| {
        base::err!(InvalidArgument, msg("loading config {}", args.config.display()), source(e))
    })?;

    std::fs::create_dir_all(&config.global.storage_root)
        .map_err(|e| base::err!(Internal, msg("creating storage root"), source(e)))?;
    std::fs::create_dir_all(&config.global.hls_root)
        .map_err(|e| base::err!(Internal, msg("creating hls root"), source(e)))?;
    if let Some(parent) = config.global.db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| base::err!(Internal, msg("creating db dir"), source(e)))?;
    }

    let db = Arc::new(Database::open(&config.global.db_path)?);

    let coordinator = Arc::new(base::shutdown_coordinator::ShutdownCoordinator::new());
    let sup = Supervisor::new(coordinator.clone(), db, config.clone(), None)?;

    install_signal_ignores();
    unsafe {
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_reload_signal as libc::sighandler_t);
    }

    // A periodic open-files refresh feeding the retention task, plus a
    // SIGHUP-driven config reload, both serviced from the main thread while
    // it waits for a shutdown signal.
    let config_path = args.config.clone();
    loop {
        if SHUTDOWN_REQUESTED.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }
        if RELOAD_REQUESTED.swap(false, std::sync::atomic::Ordering::AcqRel) {
            match config::load(&config_path) {
                Ok(new_config) => {
                    if let Err(e) = sup.apply_config(new_config) {
                        error!(err = %e.chain(), "config reload rejected");
                    }
                }
                Err(e) => error!(err = %e.chain(), "config reload failed to parse, keeping running config"),
            }
        }
        sup.refresh_open_files();
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("shutdown requested, stopping all workers");
    base::shutdown_coordinator::spawn_watchdog(Duration::from_secs(60));
    coordinator.initiate_shutdown(&base::clock::RealClocks, Duration::from_secs(30), Duration::from_millis(100));
    sup.shutdown();
    info!("shutdown complete");
    Ok(0)
}

static SHUTDOWN_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
static RELOAD_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, std::sync::atomic::Ordering::Release);
}

extern "C" fn handle_reload_signal(_sig: libc::c_int) {
    RELOAD_REQUESTED.store(true, std::sync::atomic::Ordering::Release);
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(3);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/nvr`: `nvr`),
    // falling back to the crate name if conversion to a path/UTF-8 string fails.
    // `bpaf`'s default logic is similar but doesn't have the fallback.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let parsed = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {parsed:#?}");

    if parsed.daemon {
        // `--daemon` only needs to detach; this follows the conventional
        // fork-and-detach shape rather than any particular discipline.
        match unsafe { libc::fork() } {
            -1 => {
                error!("fork failed");
                std::process::exit(3);
            }
            0 => unsafe {
                libc::setsid();
            },
            _ => std::process::exit(0),
        }
    }

    match run(parsed) {
        Err(e) => {
            let code = match e.kind() {
                base::ErrorKind::InvalidArgument => 1,
                base::ErrorKind::AlreadyExists => 2,
                _ => 3,
            };
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(code);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
