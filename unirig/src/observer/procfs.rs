//! Process sampling out of procfs.
//!
//! CPU utilization is derived the way `proc(5)` intends: utime and stime
//! are cumulative clock ticks, so each reading differences them against
//! the previous reading and divides by the wall time that passed. The
//! result is a percentage of one core summed across cores, so a process
//! saturating four cores reads 400. Memory is resident set size in bytes.

use std::time::Instant;

use procfs::process::Process;
use unirig_capture::json::RawSample;

use super::{Outcome, unix_now};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Sampler`]
pub enum Error {
    /// Wrapper for [`procfs::ProcError`]
    #[error("procfs read failed: {0}")]
    Procfs(#[from] procfs::ProcError),
}

struct Snapshot {
    wall: Instant,
    cpu_ticks: u64,
}

/// Polls one process for CPU ticks and resident memory.
pub(crate) struct Sampler {
    proc: Process,
    ticks_per_second: u64,
    page_size: u64,
    baseline_bytes: u64,
    prev: Option<Snapshot>,
}

impl Sampler {
    /// Attach to a live process and record its pre-monitoring footprint.
    pub(crate) fn new(pid: i32) -> Result<Self, Error> {
        let proc = Process::new(pid)?;
        let page_size = procfs::page_size();
        let baseline_bytes = proc.stat()?.rss * page_size;
        Ok(Self {
            proc,
            ticks_per_second: procfs::ticks_per_second(),
            page_size,
            baseline_bytes,
            prev: None,
        })
    }

    /// Resident memory at attach time.
    pub(crate) fn baseline_bytes(&self) -> u64 {
        self.baseline_bytes
    }

    /// Take one reading. The first reading of a series reports 0.0 CPU
    /// since there is no prior snapshot to difference against.
    pub(crate) fn sample(&mut self) -> Result<Outcome, Error> {
        let stat = match self.proc.stat() {
            Ok(stat) => stat,
            Err(procfs::ProcError::NotFound(_)) => return Ok(Outcome::TargetGone),
            Err(e) => return Err(e.into()),
        };
        // A zombie holds its pid but consumes nothing further.
        if stat.state == 'Z' || stat.state == 'X' {
            return Ok(Outcome::TargetGone);
        }

        let now = Instant::now();
        let cpu_ticks = stat.utime + stat.stime;

        let cpu_percent = match self.prev {
            Some(ref prev) => {
                let wall_seconds = now.duration_since(prev.wall).as_secs_f64();
                if wall_seconds > 0.0 {
                    let delta_ticks = cpu_ticks.saturating_sub(prev.cpu_ticks);
                    let cpu_seconds = delta_ticks as f64 / self.ticks_per_second as f64;
                    (cpu_seconds / wall_seconds) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev = Some(Snapshot { wall: now, cpu_ticks });

        Ok(Outcome::Sample(RawSample {
            time: unix_now(),
            cpu_percent,
            memory_bytes: stat.rss * self.page_size,
        }))
    }
}
