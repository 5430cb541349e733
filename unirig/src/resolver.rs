//! Find the process that actually consumes resources.
//!
//! Unikernel launchers are thin wrappers: `ops run` forks a virtualization
//! engine (qemu) and the launcher process itself does almost nothing. The
//! resolver scans the live process table for a child of the launcher
//! whose name contains a marker substring and returns that child's pid.
//! The scan is bounded: it retries with a short, capped backoff until a
//! wait budget is exhausted, and it notices the launcher dying early.

use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Why the worker process never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The launcher exited before any matching descendant appeared.
    LauncherExited,
    /// The wait budget was exhausted with the launcher still running.
    TimedOut,
    /// The platform exposes no process table to scan.
    UnsupportedPlatform,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Reason::LauncherExited => write!(f, "launcher exited first"),
            Reason::TimedOut => write!(f, "wait budget exhausted"),
            Reason::UnsupportedPlatform => write!(f, "unsupported platform"),
        }
    }
}

/// Errors produced by [`resolve_worker`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No worker matching the marker appeared before resolution gave up.
    /// The caller must not proceed to sampling.
    #[error("worker process matching {marker:?} never started: {reason}")]
    TargetNeverStarted {
        /// The marker that was searched for.
        marker: String,
        /// Why resolution gave up.
        reason: Reason,
    },
    /// Wrapper for [`procfs::ProcError`]
    #[cfg(target_os = "linux")]
    #[error("process table scan failed: {0}")]
    Procfs(#[from] procfs::ProcError),
}

/// The virtualization engine binary name differs by CPU architecture.
#[must_use]
pub fn default_worker_marker() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "qemu-system-x86_64"
    } else {
        "qemu-system-aarch64"
    }
}

const INITIAL_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_millis(500);

/// Resolve the worker process behind a just-launched launcher.
///
/// Scans the process table immediately and then on a capped backoff until
/// a descendant of `launcher_pid` whose name contains `marker` appears.
/// The launcher pid itself is never returned. If several descendants
/// match, the first encountered in scan order wins; in practice exactly
/// one matches.
///
/// # Errors
///
/// Returns [`Error::TargetNeverStarted`] if the launcher exits before a
/// match appears or if `timeout` elapses first.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)]
pub async fn resolve_worker(
    launcher_pid: i32,
    marker: &str,
    timeout: Duration,
) -> Result<i32, Error> {
    use std::time::Instant;

    let start = Instant::now();
    let mut poll = INITIAL_POLL;

    loop {
        if let Some(pid) = scan(launcher_pid, marker)? {
            debug!(
                launcher_pid,
                worker_pid = pid,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "resolved worker process"
            );
            return Ok(pid);
        }

        if !launcher_alive(launcher_pid) {
            return Err(Error::TargetNeverStarted {
                marker: marker.to_owned(),
                reason: Reason::LauncherExited,
            });
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::TargetNeverStarted {
                marker: marker.to_owned(),
                reason: Reason::TimedOut,
            });
        }

        tokio::time::sleep(poll.min(timeout - elapsed)).await;
        poll = (poll * 2).min(MAX_POLL);
    }
}

/// "Resolve" the worker process on platforms without a process table.
///
/// # Errors
///
/// Always returns [`Error::TargetNeverStarted`]: a marker was given, so
/// falling back to the launcher pid would measure the wrong process.
#[cfg(not(target_os = "linux"))]
#[allow(clippy::unused_async)]
pub async fn resolve_worker(
    _launcher_pid: i32,
    marker: &str,
    _timeout: Duration,
) -> Result<i32, Error> {
    Err(Error::TargetNeverStarted {
        marker: marker.to_owned(),
        reason: Reason::UnsupportedPlatform,
    })
}

/// One pass over the process table.
#[cfg(target_os = "linux")]
fn scan(launcher_pid: i32, marker: &str) -> Result<Option<i32>, Error> {
    for proc in procfs::process::all_processes()? {
        // Processes vanish mid-scan all the time; skip them.
        let Ok(proc) = proc else { continue };
        let Ok(stat) = proc.stat() else { continue };
        if stat.ppid != launcher_pid || proc.pid() == launcher_pid {
            continue;
        }
        if process_name(&proc, &stat.comm).contains(marker) {
            return Ok(Some(proc.pid()));
        }
    }
    Ok(None)
}

/// The kernel truncates `comm` to 15 characters, which would hide a
/// marker like "qemu-system-x86_64". Prefer the basename of the first
/// cmdline argument when one exists.
#[cfg(target_os = "linux")]
fn process_name(proc: &procfs::process::Process, comm: &str) -> String {
    if let Ok(cmdline) = proc.cmdline()
        && let Some(argv0) = cmdline.first()
    {
        let basename = argv0.rsplit('/').next().unwrap_or(argv0);
        if !basename.is_empty() {
            return basename.to_owned();
        }
    }
    comm.to_owned()
}

/// Whether the launcher is still running. A zombie counts as exited: it
/// can no longer fork the worker.
#[cfg(target_os = "linux")]
fn launcher_alive(pid: i32) -> bool {
    match procfs::process::Process::new(pid) {
        Ok(proc) => match proc.stat() {
            Ok(stat) => stat.state != 'Z' && stat.state != 'X',
            Err(_) => false,
        },
        Err(_) => false,
    }
}
