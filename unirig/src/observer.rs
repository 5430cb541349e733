//! Manage the resource observer
//!
//! The observer is the half of unirig that watches rather than drives. Once
//! the target server broadcasts what to monitor, this module polls it for
//! CPU and memory consumption on a fixed period and appends each reading to
//! a durable artifact as it is taken. Process targets are read out of procfs
//! on Linux; container targets are read from the container runtime's stats
//! stream on any platform. Both present the same cancellable sample source
//! to the run loop, so shutdown behaves identically for either.

use metrics::gauge;
use serde::Deserialize;
use tracing::{info, warn};
use unirig_capture::{json::RawSample, writer::ArtifactWriter};

use crate::target::{TargetId, TargetReceiver};

pub mod docker;
#[cfg(target_os = "linux")]
pub mod procfs;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// The target channel closed before a monitor target was received
    #[error("target channel closed before a monitor target was received")]
    TargetChannelClosed,
    /// Process targets require procfs
    #[error("process targets cannot be observed on this platform")]
    UnsupportedPlatform,
    /// Wrapper for [`docker::Error`]
    #[error("container sampling error: {0}")]
    Docker(#[from] docker::Error),
    #[cfg(target_os = "linux")]
    /// Wrapper for [`procfs::Error`]
    #[error("process sampling error: {0}")]
    Procfs(#[from] procfs::Error),
    /// Wrapper for [`unirig_capture::writer::Error`]
    #[error("artifact write error: {0}")]
    Capture(#[from] unirig_capture::writer::Error),
}

/// Wall-clock seconds since the epoch, the timebase every artifact uses.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// A single reading from a sample source, or notice that no further
/// readings will come.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// A complete reading.
    Sample(RawSample),
    /// The monitored entity is gone. The series is over.
    TargetGone,
}

/// Configuration for [`Server`]
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interval between samples, milliseconds.
    pub sample_period_milliseconds: u64,
}

/// What a finished series looked like, for the session to report and for
/// the normalizer to consume.
#[derive(Debug)]
pub struct SeriesSummary {
    /// Every reading taken, in order.
    pub samples: Vec<RawSample>,
    /// Resident memory immediately before monitoring began. Always 0 for
    /// container targets, whose runtime reports usage already scoped to
    /// the container.
    pub baseline_bytes: u64,
    /// Sample attempts that failed transiently and were skipped.
    pub dropped: u64,
    /// True when the series ended because the target vanished rather than
    /// because a shutdown signal arrived.
    pub truncated: bool,
}

/// The observer server.
///
/// Samples whatever [`crate::target::Server`] resolves and persists each
/// reading before taking the next. No action is taken until
/// [`Server::run`] is called.
#[derive(Debug)]
pub struct Server {
    config: Config,
    shutdown: unirig_signal::Watcher,
}

enum SampleSource {
    #[cfg(target_os = "linux")]
    Process(procfs::Sampler, tokio::time::Interval),
    Docker(docker::Sampler),
}

impl SampleSource {
    /// Wait for and take the next reading. Cancel safe: dropping the
    /// future between readings loses nothing.
    async fn next(&mut self) -> Result<Outcome, Error> {
        match self {
            #[cfg(target_os = "linux")]
            SampleSource::Process(sampler, interval) => {
                interval.tick().await;
                Ok(sampler.sample()?)
            }
            SampleSource::Docker(sampler) => Ok(sampler.next().await?),
        }
    }

    fn baseline_bytes(&self) -> u64 {
        match self {
            #[cfg(target_os = "linux")]
            SampleSource::Process(sampler, _) => sampler.baseline_bytes(),
            SampleSource::Docker(_) => 0,
        }
    }
}

impl Server {
    /// Create a new [`Server`] instance
    #[must_use]
    pub fn new(config: Config, shutdown: unirig_signal::Watcher) -> Self {
        Self { config, shutdown }
    }

    /// Run this [`Server`] to completion
    ///
    /// Waits for the target server to broadcast a [`crate::target::MonitorTarget`],
    /// then samples it until the target vanishes or a shutdown signal
    /// arrives. Each reading is appended to `writer` and flushed before
    /// the next is taken, so the artifact on disk is complete up to the
    /// last reading even if the session dies.
    ///
    /// # Errors
    ///
    /// Function will return an error if the target channel closes before
    /// a target arrives, if the sample source cannot be constructed, or
    /// if a reading cannot be persisted.
    pub async fn run(
        self,
        mut target_rcv: TargetReceiver,
        mut writer: ArtifactWriter<RawSample>,
    ) -> Result<SeriesSummary, Error> {
        let target = match target_rcv.recv().await {
            Ok(target) => target,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                // Capacity is 1 and there is a single send, so a lag means
                // the one message was missed entirely.
                return Err(Error::TargetChannelClosed);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(Error::TargetChannelClosed);
            }
        };
        drop(target_rcv);

        let period = std::time::Duration::from_millis(self.config.sample_period_milliseconds);
        let mut source = match target.id {
            #[cfg(target_os = "linux")]
            TargetId::Process(pid) => {
                let sampler = procfs::Sampler::new(pid)?;
                SampleSource::Process(sampler, tokio::time::interval(period))
            }
            #[cfg(not(target_os = "linux"))]
            TargetId::Process(_) => return Err(Error::UnsupportedPlatform),
            TargetId::Container(name) => {
                SampleSource::Docker(docker::Sampler::connect(&name)?)
            }
        };

        info!(label = %target.label, "observer sampling started");

        let mut summary = SeriesSummary {
            samples: Vec::with_capacity(1024),
            baseline_bytes: source.baseline_bytes(),
            dropped: 0,
            truncated: false,
        };

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                outcome = source.next() => {
                    match outcome {
                        Ok(Outcome::Sample(sample)) => {
                            gauge!("observer.cpu_percent").set(sample.cpu_percent);
                            gauge!("observer.memory_bytes").set(sample.memory_bytes as f64);
                            writer.append(&sample)?;
                            summary.samples.push(sample);
                        }
                        Ok(Outcome::TargetGone) => {
                            info!(
                                samples = summary.samples.len(),
                                "target gone, closing series"
                            );
                            summary.truncated = true;
                            break;
                        }
                        Err(e) => {
                            warn!("sample attempt failed, skipping reading: {e}");
                            summary.dropped += 1;
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!(
                        samples = summary.samples.len(),
                        "shutdown signal received"
                    );
                    break;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use uuid::Uuid;
    use unirig_capture::json::{SeriesKind, SeriesMeta};

    use super::*;
    use crate::target::MonitorTarget;

    #[tokio::test]
    async fn samples_a_live_process_until_shutdown() {
        let mut child = Command::new("sleep")
            .arg("5")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = i32::try_from(child.id()).expect("pid fits i32");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.jsonl");
        let meta = SeriesMeta {
            run_id: Uuid::new_v4(),
            label: String::from("test"),
            kind: SeriesKind::RawSamples,
        };
        let writer = ArtifactWriter::create(&path, &meta).expect("create writer");

        let (shutdown_watcher, shutdown) = unirig_signal::signal();
        let (snd, rcv) = tokio::sync::broadcast::channel(1);
        let server = Server::new(
            Config {
                sample_period_milliseconds: 50,
            },
            shutdown_watcher,
        );
        let handle = tokio::spawn(server.run(rcv, writer));

        // The baseline is read at attach; let the child finish exec first
        // so its RSS is populated.
        tokio::time::sleep(Duration::from_millis(150)).await;
        snd.send(MonitorTarget {
            id: TargetId::Process(pid),
            label: String::from("test"),
        })
        .expect("send target");
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.signal();

        let summary = handle
            .await
            .expect("task join")
            .expect("observer run");
        assert!(!summary.samples.is_empty());
        assert!(!summary.truncated);
        assert!(summary.baseline_bytes > 0);
        // First reading of a series has no prior snapshot to difference.
        assert!((summary.samples[0].cpu_percent - 0.0).abs() < f64::EPSILON);

        let contents = std::fs::read_to_string(&path).expect("read artifact");
        // Meta line plus one line per sample.
        assert_eq!(contents.lines().count(), summary.samples.len() + 1);

        let _ = child.kill();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn vanished_process_truncates_the_series() {
        let mut child = Command::new("sleep")
            .arg("0.15")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = i32::try_from(child.id()).expect("pid fits i32");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.jsonl");
        let meta = SeriesMeta {
            run_id: Uuid::new_v4(),
            label: String::from("test"),
            kind: SeriesKind::RawSamples,
        };
        let writer = ArtifactWriter::create(&path, &meta).expect("create writer");

        let (shutdown_watcher, _shutdown) = unirig_signal::signal();
        let (snd, rcv) = tokio::sync::broadcast::channel(1);
        let server = Server::new(
            Config {
                sample_period_milliseconds: 50,
            },
            shutdown_watcher,
        );
        let handle = tokio::spawn(server.run(rcv, writer));

        snd.send(MonitorTarget {
            id: TargetId::Process(pid),
            label: String::from("test"),
        })
        .expect("send target");
        // Give the observer its first reading, then reap the child so the
        // pid leaves the process table.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = child.wait();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("observer noticed the exit")
            .expect("task join")
            .expect("observer run");
        assert!(summary.truncated);
    }
}
