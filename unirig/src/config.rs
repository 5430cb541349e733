//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{bench, target};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for deserializing the Config
    #[error("Config deserialization error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}

fn default_sample_period_milliseconds() -> u64 {
    100
}

fn default_artifact_directory() -> PathBuf {
    PathBuf::from("./artifacts")
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Human name for the session, used in artifact naming. Usually the
    /// platform under measurement, e.g. "nanos" or "docker".
    pub label: String,
    /// The workload to launch or follow.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub target: target::Config,
    /// Interval between resource samples.
    #[serde(default = "default_sample_period_milliseconds")]
    pub sample_period_milliseconds: u64,
    /// Directory that receives sample and benchmark artifacts. Created if
    /// absent.
    #[serde(default = "default_artifact_directory")]
    pub artifact_directory: PathBuf,
    /// The load matrix to drive into the target. Without one the session
    /// samples an idle target until it exits.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub benchmark: Option<bench::Config>,
}

impl Config {
    /// Parse a [`Config`] from a YAML document.
    ///
    /// # Errors
    ///
    /// Function will return an error if the contents are not valid YAML
    /// or do not match the schema.
    pub fn deserialize(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use unirig_capture::json::Work;

    use super::*;

    #[test]
    fn minimal_docker_session() {
        let contents = r#"
label: "docker"
target:
  docker:
    name: "sdk_monitor_container"
"#;
        let config = Config::deserialize(contents).expect("deserializes");
        assert_eq!(config.label, "docker");
        assert_eq!(config.sample_period_milliseconds, 100);
        assert_eq!(config.artifact_directory, PathBuf::from("./artifacts"));
        assert!(config.benchmark.is_none());
    }

    #[test]
    fn full_binary_session_with_matrix() {
        let contents = r#"
label: "nanos"
target:
  binary:
    command: "ops"
    arguments: ["run", "-c", "config.json", "server_image"]
    worker_marker: "qemu-system-x86_64"
sample_period_milliseconds: 250
artifact_directory: "/tmp/unirig-out"
benchmark:
  driver:
    wrk:
      target_url: "http://127.0.0.1:8083/"
  matrix:
    - concurrency: 100
      work:
        duration_seconds: 15
      warmup: true
    - concurrency: 100
      work:
        duration_seconds: 15
    - concurrency: 200
      work:
        duration_seconds: 15
"#;
        let config = Config::deserialize(contents).expect("deserializes");
        assert_eq!(config.sample_period_milliseconds, 250);

        let benchmark = config.benchmark.expect("benchmark present");
        assert_eq!(benchmark.matrix.len(), 3);
        assert!(benchmark.matrix[0].warmup);
        assert!(!benchmark.matrix[1].warmup);
        assert_eq!(
            benchmark.matrix[2].concurrency,
            NonZeroU32::new(200).expect("nonzero")
        );
        assert_eq!(benchmark.matrix[2].work, Work::DurationSeconds(15));
    }

    #[test]
    fn redis_session_with_request_work() {
        let contents = r#"
label: "docker"
target:
  docker:
    name: "redis_container"
benchmark:
  driver:
    redis_benchmark:
      host: "127.0.0.1"
  matrix:
    - concurrency: 50
      work:
        requests: 100000
"#;
        let config = Config::deserialize(contents).expect("deserializes");
        let benchmark = config.benchmark.expect("benchmark present");
        let bench::Driver::RedisBenchmark(ref redis) = benchmark.driver else {
            panic!("expected the redis driver");
        };
        assert_eq!(redis.port, 6379);
        assert_eq!(benchmark.matrix[0].work, Work::Requests(100_000));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = r#"
label: "nanos"
target:
  docker:
    name: "c"
surprise: true
"#;
        assert!(Config::deserialize(contents).is_err());
    }
}
