//! JSON forms of unirig's artifact records, meant to be read line by line
//! from a file.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// The kind of series held in an artifact file.
pub enum SeriesKind {
    /// Raw `(time, cpu_percent, memory_bytes)` observations.
    RawSamples,
    /// Baseline-relative, elapsed-time observations.
    NormalizedSamples,
    /// Parsed load-generator results.
    BenchmarkRecords,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
/// The first line of every artifact file, identifying the series.
pub struct SeriesMeta {
    /// An id mostly unique to this run, distinguishing duplications of the
    /// same observational setup.
    pub run_id: Uuid,
    /// Human name of the monitored target, e.g. "nanos" or "docker".
    pub label: String,
    /// What the remaining lines of the file hold.
    pub kind: SeriesKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
/// One resource observation of the target.
///
/// Samples are ordered by acquisition time. Duplicate timestamps are
/// permitted and preserve arrival order.
pub struct RawSample {
    /// Wall-clock time of the observation, seconds since the UNIX epoch.
    pub time: f64,
    /// CPU utilization over the preceding sample window, percent. The
    /// first sample of a series is 0.0 by convention.
    pub cpu_percent: f64,
    /// Resident memory at observation time, bytes.
    pub memory_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
/// A [`RawSample`] rebased to elapsed time and baseline-relative memory.
pub struct NormalizedSample {
    /// Seconds since the first sample of the series. Non-decreasing across
    /// a series.
    pub elapsed_seconds: f64,
    /// CPU utilization over the preceding sample window, percent.
    pub cpu_percent: f64,
    /// Resident memory relative to the session baseline, truncated to
    /// whole KiB. May be negative when the baseline was read after the
    /// target's own startup allocations; this is a documented accounting
    /// artifact, not an error.
    pub memory_delta_kb: i64,
    /// `memory_delta_kb` floor-divided to whole MiB.
    pub memory_delta_mb: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
/// Raw cumulative counters for a container target, as pushed by the
/// container runtime's stats stream.
///
/// The usage counters are monotonic non-decreasing at the source; a
/// decrease observed here means the counter reset and the interval
/// contributes zero CPU.
pub struct CounterSample {
    /// Wall-clock time of the snapshot, seconds since the UNIX epoch.
    pub time: f64,
    /// Cumulative CPU consumed by the container, nanoseconds.
    pub cpu_total_usage_ns: u64,
    /// Cumulative CPU consumed by the whole system, nanoseconds.
    pub system_cpu_usage_ns: u64,
    /// Point-in-time memory usage, bytes. Not cumulative.
    pub memory_usage_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// How much load one benchmark invocation drives.
pub enum Work {
    /// A fixed number of requests, e.g. redis-benchmark `-n`.
    Requests(u64),
    /// A fixed duration in seconds, e.g. wrk `-d`.
    DurationSeconds(u64),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// One point in the benchmark load matrix.
///
/// A matrix is an ordered sequence of these; order matters because later
/// runs must not observe warm-up transients. Repeated specs at the same
/// concurrency are independent trials.
pub struct LoadSpec {
    /// Concurrent connections to drive.
    pub concurrency: NonZeroU32,
    /// Request count or duration for the invocation.
    pub work: Work,
    /// Warm-up runs execute but their records are discarded.
    #[serde(default)]
    pub warmup: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// The operation a benchmark record measured.
pub enum OperationKind {
    /// Read operations, e.g. redis-benchmark GET rows.
    Get,
    /// Write operations, e.g. redis-benchmark SET rows.
    Set,
    /// A generic request, for load generators that report one aggregate.
    Request,
    /// Any other operation name reported by the load generator.
    Other(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
/// One parsed result row from a load-generator invocation.
///
/// A single invocation may yield multiple records, e.g. separate GET and
/// SET rows. Latency percentiles are optional because not every load
/// generator reports them. Fields that failed to parse are retained as
/// opaque text in `unparsed` rather than dropped, so downstream consumers
/// can detect anomalies instead of silently losing a row.
pub struct BenchmarkRecord {
    /// The operation measured by this record.
    pub operation: OperationKind,
    /// Observed request throughput, requests per second.
    pub requests_per_second: Option<f64>,
    /// Average latency, milliseconds.
    pub latency_avg_ms: Option<f64>,
    /// Minimum latency, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_min_ms: Option<f64>,
    /// 50th percentile latency, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_p50_ms: Option<f64>,
    /// 95th percentile latency, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_p95_ms: Option<f64>,
    /// 99th percentile latency, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_p99_ms: Option<f64>,
    /// Maximum latency, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency_max_ms: Option<f64>,
    /// Concurrency of the invocation that produced this record.
    pub concurrency: u32,
    /// Request count or duration of the invocation.
    pub work: Work,
    /// Output fields or lines that did not match the expected shape,
    /// retained verbatim.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub unparsed: Vec<String>,
}

impl BenchmarkRecord {
    /// A record with every measurement unset, tagged with its source load
    /// parameters. Parsers fill in what they find.
    #[must_use]
    pub fn empty(operation: OperationKind, concurrency: u32, work: Work) -> Self {
        Self {
            operation,
            requests_per_second: None,
            latency_avg_ms: None,
            latency_min_ms: None,
            latency_p50_ms: None,
            latency_p95_ms: None,
            latency_p99_ms: None,
            latency_max_ms: None,
            concurrency,
            work,
            unparsed: Vec::new(),
        }
    }

    /// Whether the record carries no parsed measurement at all.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.requests_per_second.is_none()
            && self.latency_avg_ms.is_none()
            && self.latency_min_ms.is_none()
            && self.latency_p50_ms.is_none()
            && self.latency_p95_ms.is_none()
            && self.latency_p99_ms.is_none()
            && self.latency_max_ms.is_none()
    }
}
