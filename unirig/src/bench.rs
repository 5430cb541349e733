//! Drive a load matrix into the target.
//!
//! The matrix is an ordered list of load points, each naming a
//! concurrency level and an amount of work. Points run strictly one at a
//! time with a cooldown between them so readings from one point cannot
//! bleed into the next. Warm-up points are executed in full and their
//! results discarded. A point whose tool invocation fails, times out, or
//! produces unparseable output is a gap: it is logged and counted, and
//! the sweep continues.

use std::num::NonZeroU32;
use std::process::Stdio;
use std::time::Duration;

use metrics::counter;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};
use unirig_capture::{
    json::{BenchmarkRecord, LoadSpec, Work},
    writer::ArtifactWriter,
};
use unirig_signal::Broadcaster;

pub mod redis;
pub mod wrk;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Wrapper for [`unirig_capture::writer::Error`]
    #[error("artifact write error: {0}")]
    Capture(#[from] unirig_capture::writer::Error),
}

fn default_wrk_command() -> String {
    String::from("wrk")
}

fn default_threads() -> NonZeroU32 {
    NonZeroU32::new(2).expect("2 is nonzero")
}

/// Configuration for the wrk HTTP load driver
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WrkConfig {
    /// The tool executable.
    #[serde(default = "default_wrk_command")]
    pub command: String,
    /// The URL load is driven into.
    pub target_url: String,
    /// Worker threads for the tool itself.
    #[serde(default = "default_threads")]
    pub threads: NonZeroU32,
}

fn default_redis_command() -> String {
    String::from("redis-benchmark")
}

fn default_redis_host() -> String {
    String::from("127.0.0.1")
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_tests() -> Vec<String> {
    vec![String::from("get"), String::from("set")]
}

/// Configuration for the redis-benchmark load driver
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RedisBenchmarkConfig {
    /// The tool executable.
    #[serde(default = "default_redis_command")]
    pub command: String,
    /// Server host to drive load into.
    #[serde(default = "default_redis_host")]
    pub host: String,
    /// Server port to drive load into.
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Which benchmark tests to run, passed through `-t`.
    #[serde(default = "default_redis_tests")]
    pub tests: Vec<String>,
}

/// Which load tool drives the matrix
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Driver {
    /// wrk, for HTTP targets. Expresses duration work only.
    Wrk(WrkConfig),
    /// redis-benchmark, for redis targets. Expresses request-count work
    /// only.
    RedisBenchmark(RedisBenchmarkConfig),
}

fn default_invocation_timeout_seconds() -> u64 {
    300
}

fn default_cooldown_seconds() -> u64 {
    2
}

/// Configuration for [`Server`]
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The load tool and its connection details.
    pub driver: Driver,
    /// Ordered load points to sweep, warm-ups included.
    pub matrix: Vec<LoadSpec>,
    /// Hard ceiling on a single tool invocation. On expiry the tool is
    /// killed and the point becomes a gap.
    #[serde(default = "default_invocation_timeout_seconds")]
    pub invocation_timeout_seconds: u64,
    /// Quiet period between points.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

/// What a finished sweep looked like.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MatrixSummary {
    /// Points that produced persisted records.
    pub completed: usize,
    /// Points that failed, timed out, or produced nothing parseable.
    pub gaps: usize,
    /// Warm-up points executed and discarded.
    pub warmups_discarded: usize,
}

/// The benchmark matrix server.
///
/// Runs the configured load matrix point by point once the target is up.
/// No action is taken until [`Server::run`] is called.
#[derive(Debug)]
pub struct Server {
    config: Config,
    shutdown: unirig_signal::Watcher,
}

impl Server {
    /// Create a new [`Server`] instance
    #[must_use]
    pub fn new(config: Config, shutdown: unirig_signal::Watcher) -> Self {
        Self { config, shutdown }
    }

    /// Run this [`Server`] to completion
    ///
    /// Sweeps the matrix in order, appending records for each completed
    /// point to `writer` before the next point starts. `bench_done` is
    /// signaled when the sweep ends, whether it ran out of points or a
    /// shutdown signal cut it short.
    ///
    /// # Errors
    ///
    /// Function will return an error if a record cannot be persisted.
    /// Per-point failures, spawn failures included, are gaps, not
    /// errors.
    pub async fn run(
        self,
        mut writer: ArtifactWriter<BenchmarkRecord>,
        bench_done: Broadcaster,
    ) -> Result<MatrixSummary, Error> {
        let mut summary = MatrixSummary::default();
        let invocation_timeout = Duration::from_secs(self.config.invocation_timeout_seconds);
        let cooldown = Duration::from_secs(self.config.cooldown_seconds);

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);

        let total = self.config.matrix.len();
        for (index, spec) in self.config.matrix.iter().enumerate() {
            info!(
                point = index + 1,
                total,
                concurrency = spec.concurrency.get(),
                warmup = spec.warmup,
                "matrix point starting"
            );

            let Some(mut command) = invocation(&self.config.driver, spec) else {
                warn!(
                    concurrency = spec.concurrency.get(),
                    "driver cannot express this work shape, gap"
                );
                counter!("bench.gaps").increment(1);
                summary.gaps += 1;
                continue;
            };

            let records = tokio::select! {
                outcome = run_point(&mut command, invocation_timeout, &self.config.driver, spec) => outcome,
                () = &mut shutdown_wait => {
                    info!("shutdown signal received mid-sweep");
                    bench_done.signal();
                    return Ok(summary);
                }
            };

            match records {
                Ok(records) if spec.warmup => {
                    info!(records = records.len(), "warm-up point discarded");
                    summary.warmups_discarded += 1;
                }
                Ok(records) if records.is_empty() => {
                    warn!("point produced no parseable records, gap");
                    counter!("bench.gaps").increment(1);
                    summary.gaps += 1;
                }
                Ok(records) => {
                    for record in &records {
                        writer.append(record)?;
                    }
                    counter!("bench.points_completed").increment(1);
                    summary.completed += 1;
                }
                Err(gap) => {
                    warn!("point failed, gap: {gap}");
                    counter!("bench.gaps").increment(1);
                    summary.gaps += 1;
                }
            }

            // Cooldown keeps one point's tail out of the next point's
            // readings. Skipped after the final point.
            if index + 1 < total {
                tokio::select! {
                    () = tokio::time::sleep(cooldown) => {}
                    () = &mut shutdown_wait => {
                        info!("shutdown signal received during cooldown");
                        break;
                    }
                }
            }
        }

        info!(
            completed = summary.completed,
            gaps = summary.gaps,
            warmups = summary.warmups_discarded,
            "matrix sweep finished"
        );
        bench_done.signal();
        Ok(summary)
    }
}

/// Why a single point produced nothing.
#[derive(thiserror::Error, Debug)]
enum Gap {
    #[error("tool could not be run: {0}")]
    Io(std::io::Error),
    #[error("tool exceeded the invocation timeout")]
    TimedOut,
    #[error("tool exited with {0}")]
    NonZeroExit(std::process::ExitStatus),
}

/// Run one tool invocation to completion and parse its output.
async fn run_point(
    command: &mut Command,
    timeout: Duration,
    driver: &Driver,
    spec: &LoadSpec,
) -> Result<Vec<BenchmarkRecord>, Gap> {
    // Dropping the output future on timeout kills the tool via
    // kill_on_drop.
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(Gap::Io(err)),
        Err(_elapsed) => return Err(Gap::TimedOut),
    };
    if !output.status.success() {
        return Err(Gap::NonZeroExit(output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let concurrency = spec.concurrency.get();
    let records = match driver {
        Driver::Wrk(_) => {
            let record = wrk::parse(&stdout, concurrency, spec.work);
            if record.is_vacant() {
                Vec::new()
            } else {
                vec![record]
            }
        }
        Driver::RedisBenchmark(_) => redis::parse(&stdout, concurrency, spec.work),
    };
    Ok(records)
}

/// Build the tool invocation for one load point, or `None` when the
/// driver cannot express the point's work shape.
fn invocation(driver: &Driver, spec: &LoadSpec) -> Option<Command> {
    let mut command = match driver {
        Driver::Wrk(config) => {
            let Work::DurationSeconds(seconds) = spec.work else {
                return None;
            };
            let mut command = Command::new(&config.command);
            command.args([
                format!("-t{threads}", threads = config.threads.get()),
                format!("-c{concurrency}", concurrency = spec.concurrency.get()),
                format!("-d{seconds}s"),
                String::from("--latency"),
                config.target_url.clone(),
            ]);
            command
        }
        Driver::RedisBenchmark(config) => {
            let Work::Requests(requests) = spec.work else {
                return None;
            };
            let mut command = Command::new(&config.command);
            command.args([
                String::from("-h"),
                config.host.clone(),
                String::from("-p"),
                config.port.to_string(),
                String::from("-c"),
                spec.concurrency.get().to_string(),
                String::from("-n"),
                requests.to_string(),
                String::from("-t"),
                config.tests.join(","),
                String::from("--csv"),
            ]);
            command
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    Some(command)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use unirig_capture::json::{SeriesKind, SeriesMeta};

    use super::*;

    fn spec(concurrency: u32, work: Work, warmup: bool) -> LoadSpec {
        LoadSpec {
            concurrency: NonZeroU32::new(concurrency).expect("nonzero"),
            work,
            warmup,
        }
    }

    fn record_writer(dir: &tempfile::TempDir) -> ArtifactWriter<BenchmarkRecord> {
        let meta = SeriesMeta {
            run_id: Uuid::new_v4(),
            label: String::from("test"),
            kind: SeriesKind::BenchmarkRecords,
        };
        ArtifactWriter::create(dir.path().join("bench.jsonl"), &meta).expect("create writer")
    }

    #[test]
    fn wrk_invocation_shape() {
        let driver = Driver::Wrk(WrkConfig {
            command: String::from("wrk"),
            target_url: String::from("http://127.0.0.1:8083/"),
            threads: NonZeroU32::new(2).expect("nonzero"),
        });
        let command = invocation(&driver, &spec(100, Work::DurationSeconds(15), false))
            .expect("duration work is expressible");
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-t2", "-c100", "-d15s", "--latency", "http://127.0.0.1:8083/"]
        );
    }

    #[test]
    fn work_shape_mismatches_are_inexpressible() {
        let wrk = Driver::Wrk(WrkConfig {
            command: String::from("wrk"),
            target_url: String::from("http://127.0.0.1:8083/"),
            threads: NonZeroU32::new(2).expect("nonzero"),
        });
        assert!(invocation(&wrk, &spec(10, Work::Requests(100_000), false)).is_none());

        let redis = Driver::RedisBenchmark(RedisBenchmarkConfig {
            command: String::from("redis-benchmark"),
            host: String::from("127.0.0.1"),
            port: 6379,
            tests: vec![String::from("get")],
        });
        assert!(invocation(&redis, &spec(10, Work::DurationSeconds(15), false)).is_none());
    }

    #[tokio::test]
    async fn unparseable_output_is_a_gap() {
        // echo happily accepts wrk's arguments and prints nothing wrk
        // shaped, exercising the gap path end to end.
        let config = Config {
            driver: Driver::Wrk(WrkConfig {
                command: String::from("echo"),
                target_url: String::from("http://127.0.0.1:8083/"),
                threads: NonZeroU32::new(2).expect("nonzero"),
            }),
            matrix: vec![spec(100, Work::DurationSeconds(1), false)],
            invocation_timeout_seconds: 5,
            cooldown_seconds: 0,
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = record_writer(&dir);
        let (shutdown_watcher, _shutdown) = unirig_signal::signal();
        let (_done_watcher, done) = unirig_signal::signal();

        let summary = Server::new(config, shutdown_watcher)
            .run(writer, done)
            .await
            .expect("sweep runs");
        assert_eq!(
            summary,
            MatrixSummary {
                completed: 0,
                gaps: 1,
                warmups_discarded: 0
            }
        );
    }

    #[tokio::test]
    async fn warmups_run_but_are_discarded() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let tool = dir.path().join("fake-wrk");
        std::fs::write(
            &tool,
            "#!/bin/sh\nprintf 'Requests/sec:  31427.51\\n'\n",
        )
        .expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
            .expect("chmod tool");

        let config = Config {
            driver: Driver::Wrk(WrkConfig {
                command: tool.to_string_lossy().into_owned(),
                target_url: String::from("http://127.0.0.1:8083/"),
                threads: NonZeroU32::new(2).expect("nonzero"),
            }),
            matrix: vec![
                spec(100, Work::DurationSeconds(1), true),
                spec(100, Work::DurationSeconds(1), false),
            ],
            invocation_timeout_seconds: 5,
            cooldown_seconds: 0,
        };
        let writer = record_writer(&dir);
        let path = writer.path().to_owned();
        let (shutdown_watcher, _shutdown) = unirig_signal::signal();
        let (_done_watcher, done) = unirig_signal::signal();

        let summary = Server::new(config, shutdown_watcher)
            .run(writer, done)
            .await
            .expect("sweep runs");
        assert_eq!(
            summary,
            MatrixSummary {
                completed: 1,
                gaps: 0,
                warmups_discarded: 1
            }
        );

        // Only the measured point landed in the artifact.
        let contents = std::fs::read_to_string(path).expect("read artifact");
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn timeout_kills_the_tool_and_records_a_gap() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let tool = dir.path().join("hung-wrk");
        std::fs::write(&tool, "#!/bin/sh\nsleep 30\n").expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
            .expect("chmod tool");

        let config = Config {
            driver: Driver::Wrk(WrkConfig {
                command: tool.to_string_lossy().into_owned(),
                target_url: String::from("ignored"),
                threads: NonZeroU32::new(2).expect("nonzero"),
            }),
            matrix: vec![spec(1, Work::DurationSeconds(30), false)],
            invocation_timeout_seconds: 1,
            cooldown_seconds: 0,
        };
        let writer = record_writer(&dir);
        let (shutdown_watcher, _shutdown) = unirig_signal::signal();
        let (_done_watcher, done) = unirig_signal::signal();

        let summary = Server::new(config, shutdown_watcher)
            .run(writer, done)
            .await
            .expect("sweep runs");
        assert_eq!(summary.gaps, 1);
    }
}
