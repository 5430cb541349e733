//! Container sampling out of the runtime's stats stream.
//!
//! The container runtime reports CPU consumption as cumulative
//! nanosecond counters scoped to the container, alongside a system-wide
//! counter covering all cores. Utilization for an interval is the
//! container's share of the system delta scaled by core count; see
//! [`crate::counters`]. Memory usage arrives already scoped to the
//! container, so no baseline subtraction applies downstream.

use std::pin::Pin;

use bollard::Docker;
use bollard::models::ContainerStatsResponse;
use bollard::query_parameters::StatsOptionsBuilder;
use futures::{Stream, StreamExt};
use unirig_capture::json::{CounterSample, RawSample};

use super::{Outcome, unix_now};
use crate::counters;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Sampler`]
pub enum Error {
    /// Wrapper for [`bollard::errors::Error`]
    #[error(transparent)]
    Bollard(#[from] bollard::errors::Error),
    /// The runtime delivered a stats frame missing required counters
    #[error("stats frame missing cpu or memory counters")]
    IncompleteStats,
}

type StatsStream =
    Pin<Box<dyn Stream<Item = Result<ContainerStatsResponse, bollard::errors::Error>> + Send>>;

/// Pulls one container's stats stream and differences its counters.
pub(crate) struct Sampler {
    // The stream holds its own transport but the client must outlive it.
    _docker: Docker,
    stream: StatsStream,
    prev: Option<CounterSample>,
    cores: usize,
}

impl Sampler {
    /// Open the stats stream for a named container.
    pub(crate) fn connect(name: &str) -> Result<Self, Error> {
        let docker = Docker::connect_with_socket_defaults()?;
        let options = StatsOptionsBuilder::default().stream(true).build();
        let stream = docker.stats(name, Some(options));
        Ok(Self {
            _docker: docker,
            stream: Box::pin(stream),
            prev: None,
            cores: num_cpus::get(),
        })
    }

    /// Wait for the next stats frame and difference it against the
    /// previous one. The runtime controls the cadence, roughly one frame
    /// per second. A closed stream means the container stopped.
    pub(crate) async fn next(&mut self) -> Result<Outcome, Error> {
        match self.stream.next().await {
            None => Ok(Outcome::TargetGone),
            Some(Err(e)) => Err(Error::Bollard(e)),
            Some(Ok(frame)) => {
                let (counters, online_cpus) =
                    extract_counters(&frame).ok_or(Error::IncompleteStats)?;
                if let Some(online) = online_cpus {
                    self.cores = online as usize;
                }
                let cpu_percent = match self.prev {
                    Some(ref prev) => counters::cpu_percent(prev, &counters, self.cores),
                    None => 0.0,
                };
                let sample = RawSample {
                    time: counters.time,
                    cpu_percent,
                    memory_bytes: counters.memory_usage_bytes,
                };
                self.prev = Some(counters);
                Ok(Outcome::Sample(sample))
            }
        }
    }
}

/// Pull the counters this sampler needs out of a stats frame. Every
/// field in the runtime's response is optional at the type level; a
/// frame missing any required counter yields `None`.
fn extract_counters(frame: &ContainerStatsResponse) -> Option<(CounterSample, Option<u32>)> {
    let cpu = frame.cpu_stats.as_ref()?;
    let cpu_total_usage_ns = cpu.cpu_usage.as_ref()?.total_usage?;
    let system_cpu_usage_ns = cpu.system_cpu_usage?;
    let memory_usage_bytes = frame.memory_stats.as_ref()?.usage?;
    Some((
        CounterSample {
            time: unix_now(),
            cpu_total_usage_ns,
            system_cpu_usage_ns,
            memory_usage_bytes,
        },
        cpu.online_cpus,
    ))
}
