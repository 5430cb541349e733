//! Manages the monitored workload.
//!
//! A unirig 'target' is the workload whose resources are measured while
//! the benchmark matrix drives load into it. Two modes are supported. In
//! binary mode unirig launches a command and, because unikernel
//! launchers are thin wrappers around a virtualization engine, may
//! resolve the real resource-consuming descendant via
//! [`crate::resolver`] before monitoring begins. In docker mode unirig
//! follows a container that is managed externally, resolving its name to
//! a pid through the container runtime.
//!
//! The target exiting on its own is a normal way for a session to end:
//! this server signals `target_done` and returns cleanly so the observer
//! can close its series.

use std::{io, process::Stdio, time::Duration};

use bollard::Docker;
use bollard::query_parameters::InspectContainerOptionsBuilder;
use metrics::gauge;
use nix::{
    errno::Errno,
    sys::signal::{SIGTERM, kill},
    unistd::Pid,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::{process::Command, time};
use tracing::{info, warn};
use unirig_signal::Broadcaster;

use crate::common::stdio;
use crate::resolver;
pub use crate::common::{Behavior, Output};

/// What the observer should watch, published once the real
/// resource-consuming entity is resolved. Read-only thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    /// Identity of the monitored entity.
    pub id: TargetId,
    /// Human name used for artifact naming, e.g. "nanos" or "docker".
    pub label: String,
}

/// Identity of a monitored entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetId {
    /// A process id on this host.
    Process(i32),
    /// A container known to the local container runtime, by name.
    Container(String),
}

/// Type used to receive the monitor target once it is resolved.
#[allow(clippy::module_name_repetitions)]
pub type TargetReceiver = tokio::sync::broadcast::Receiver<MonitorTarget>;

#[allow(clippy::module_name_repetitions)]
type TargetSender = tokio::sync::broadcast::Sender<MonitorTarget>;

/// Errors produced by [`Server`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to spawn the launcher
    #[error("unable to spawn launcher: {0}")]
    LauncherSpawn(io::Error),
    /// Unable to await target exit
    #[error("unable to wait for target exit: {0}")]
    TargetWait(io::Error),
    /// Unable to route launcher stdout/stderr
    #[error("unable to open output destination: {0}")]
    Io(#[from] io::Error),
    /// SIGTERM error
    #[error("unable to terminate target process: {0}")]
    SigTerm(Errno),
    /// See [`crate::resolver::Error`]
    #[error(transparent)]
    Resolve(#[from] resolver::Error),
    /// The container never reported a usable pid before the wait budget
    /// ran out
    #[error("container {name} never started within {timeout_seconds}s")]
    ContainerNeverStarted {
        /// Container name that was polled
        name: String,
        /// The exhausted wait budget
        timeout_seconds: u64,
    },
    /// See [`SendError`]
    #[error(transparent)]
    Send(#[from] tokio::sync::broadcast::error::SendError<MonitorTarget>),
    /// Process already finished error
    #[error("Child has already been polled to completion")]
    ProcessFinished,
    /// Wrapper for [`bollard::errors::Error`]
    #[error(transparent)]
    Bollard(#[from] bollard::errors::Error),
}

fn default_resolve_timeout() -> u64 {
    5
}

fn default_container_wait() -> u64 {
    30
}

/// Configuration for binary launch mode
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BinaryConfig {
    /// The launcher executable, e.g. `ops`.
    pub command: String,
    /// Arguments for the launcher.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Inherit the environment variables from unirig's environment.
    #[serde(default)]
    pub inherit_environment: bool,
    /// Environment variables to set for the launcher. Unirig's own
    /// environment is only propagated if `inherit_environment` is set.
    #[serde(default)]
    pub environment_variables: FxHashMap<String, String>,
    /// Manages stderr, stdout of the launcher.
    #[serde(default)]
    pub output: Output,
    /// Substring identifying the worker process name. When set, the
    /// resolved descendant -- never the launcher itself -- is monitored.
    /// Note the marker is architecture dependent for qemu workers; see
    /// [`crate::resolver::default_worker_marker`].
    #[serde(default)]
    pub worker_marker: Option<String>,
    /// Wait budget for worker resolution, seconds.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_seconds: u64,
}

/// Configuration for docker watch mode
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    /// Container name to watch
    pub name: String,
    /// Wait budget for the container to report a usable pid, seconds.
    #[serde(default = "default_container_wait")]
    pub wait_timeout_seconds: u64,
}

/// Configuration for [`Server`]
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Config {
    /// A launcher binary that will be spawned and managed directly
    Binary(BinaryConfig),
    /// A docker managed container, resolved by name
    Docker(DockerConfig),
}

#[derive(Debug)]
/// The target server.
///
/// This struct manages the workload under measurement. No action is taken
/// until [`Server::run`] is called. It is assumed that only one instance
/// of this struct will ever exist at a time, although there are no
/// protections for that.
pub struct Server {
    config: Config,
    label: String,
    shutdown: unirig_signal::Watcher,
}

impl Server {
    /// Create a new [`Server`] instance
    #[must_use]
    pub fn new(config: Config, label: String, shutdown: unirig_signal::Watcher) -> Self {
        Self {
            config,
            label,
            shutdown,
        }
    }

    /// Run this [`Server`] to completion
    ///
    /// The resolved [`MonitorTarget`] is transmitted once through
    /// `target_snd`; `target_running` is signaled at the same moment.
    /// `target_done` is signaled when the workload ends, whether on its
    /// own or because a shutdown signal arrived.
    ///
    /// # Errors
    ///
    /// Function will return an error if the launcher cannot be spawned,
    /// the worker cannot be resolved, or the container never starts.
    pub async fn run(
        self,
        target_snd: TargetSender,
        target_running: Broadcaster,
        target_done: Broadcaster,
    ) -> Result<(), Error> {
        match self.config {
            Config::Binary(config) => {
                Self::execute_binary(
                    config,
                    self.label,
                    target_snd,
                    target_running,
                    target_done,
                    self.shutdown,
                )
                .await
            }
            Config::Docker(config) => {
                Self::watch_container(
                    config,
                    self.label,
                    target_snd,
                    target_running,
                    target_done,
                    self.shutdown,
                )
                .await
            }
        }
    }

    /// Launch the workload behind its launcher and watch it to completion.
    async fn execute_binary(
        config: BinaryConfig,
        label: String,
        target_snd: TargetSender,
        target_running: Broadcaster,
        target_done: Broadcaster,
        shutdown: unirig_signal::Watcher,
    ) -> Result<(), Error> {
        let mut launcher_cmd = Command::new(&config.command);
        launcher_cmd
            .stdin(Stdio::null())
            .stdout(stdio(&config.output.stdout)?)
            .stderr(stdio(&config.output.stderr)?);
        if !config.inherit_environment {
            launcher_cmd.env_clear();
        }
        launcher_cmd
            .kill_on_drop(true)
            .args(&config.arguments)
            .envs(config.environment_variables.iter());
        let mut launcher = launcher_cmd.spawn().map_err(Error::LauncherSpawn)?;
        let launcher_id = launcher.id().ok_or(Error::ProcessFinished)?;
        let launcher_pid =
            i32::try_from(launcher_id).expect("PID_MAX_LIMIT is 2^22, fits i32");
        info!(launcher_pid, command = %config.command, "launcher started");

        // The launcher is usually a thin wrapper; with a marker set the
        // monitored pid is the resolved worker, never the launcher.
        let monitored_pid = if let Some(ref marker) = config.worker_marker {
            resolver::resolve_worker(
                launcher_pid,
                marker,
                Duration::from_secs(config.resolve_timeout_seconds),
            )
            .await?
        } else {
            launcher_pid
        };

        target_snd.send(MonitorTarget {
            id: TargetId::Process(monitored_pid),
            label,
        })?;
        drop(target_snd);
        target_running.signal();

        let mut interval = time::interval(Duration::from_millis(400));
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    gauge!("target.running").set(1.0);
                },
                res = launcher.wait() => {
                    match res {
                        Ok(status) => info!("target exited with {status}"),
                        Err(e) => warn!("target exit status unavailable ({e})"),
                    }
                    gauge!("target.running").set(0.0);
                    target_done.signal();
                    break Ok(());
                },
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    // `Child::kill` sends SIGKILL which is not what we
                    // want. We instead send SIGTERM so that the child has
                    // a chance to clean up.
                    let pid = Pid::from_raw(launcher_pid);
                    kill(pid, SIGTERM).map_err(Error::SigTerm)?;
                    launcher.wait().await.map_err(Error::TargetWait)?;
                    target_done.signal();
                    break Ok(());
                }
            }
        }
    }

    /// Watch a container running elsewhere on the system.
    async fn watch_container(
        config: DockerConfig,
        label: String,
        target_snd: TargetSender,
        target_running: Broadcaster,
        target_done: Broadcaster,
        shutdown: unirig_signal::Watcher,
    ) -> Result<(), Error> {
        let docker = Docker::connect_with_socket_defaults()?;

        let wait_budget = Duration::from_secs(config.wait_timeout_seconds);
        let poll_started = std::time::Instant::now();
        let pid: i64 = loop {
            if poll_started.elapsed() >= wait_budget {
                return Err(Error::ContainerNeverStarted {
                    name: config.name,
                    timeout_seconds: config.wait_timeout_seconds,
                });
            }
            let inspect_options = InspectContainerOptionsBuilder::default().build();
            match docker
                .inspect_container(&config.name, Some(inspect_options))
                .await
            {
                Ok(container) => {
                    // In some cases docker reports pid 0, or no state at
                    // all, for a freshly created container; believed to
                    // be a race. Keep polling.
                    match container.state.and_then(|state| state.pid) {
                        Some(pid) if pid != 0 => break pid,
                        _ => {
                            info!(
                                "Found container with name {name} but no usable pid. Polling.",
                                name = config.name
                            );
                        }
                    }
                }
                Err(_) => {
                    info!(
                        "Could not find container with name {name}, polling.",
                        name = config.name
                    );
                }
            }
            time::sleep(Duration::from_secs(1)).await;
        };
        let raw_pid = i32::try_from(pid).expect("cannot convert pid to 32 bit type");
        info!(pid = raw_pid, name = %config.name, "container running");

        target_snd.send(MonitorTarget {
            id: TargetId::Container(config.name.clone()),
            label,
        })?;
        drop(target_snd);
        target_running.signal();

        // Watch the container's init process by polling the pid. The
        // container stopping on its own closes the session normally.
        let target_wait = async move {
            let pid = Pid::from_raw(raw_pid);
            loop {
                if kill(pid, None).is_err() {
                    break;
                }
                time::sleep(Duration::from_secs(1)).await;
            }
        };

        let mut interval = time::interval(Duration::from_millis(400));
        tokio::pin!(target_wait);
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    gauge!("target.running").set(1.0);
                },
                () = &mut target_wait => {
                    info!(name = %config.name, "container exited");
                    gauge!("target.running").set(0.0);
                    target_done.signal();
                    break Ok(());
                },
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    target_done.signal();
                    break Ok(());
                }
            }
        }
    }
}
