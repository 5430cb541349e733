//! Reduce benchmark records to per-group summary statistics.
//!
//! Records are grouped by operation and concurrency level, and each
//! numeric field is reduced to its minimum, mean, and maximum within the
//! group. A field that no record in the group carries reduces to
//! [`Aggregate::NoData`] rather than a fabricated zero, so a sweep run
//! against an old tool version is distinguishable from a sweep that
//! measured zero latency.

use rustc_hash::FxHashMap;
use serde::Serialize;
use unirig_capture::json::{BenchmarkRecord, OperationKind};

/// The numeric fields of a [`BenchmarkRecord`] that reduce to summary
/// statistics.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Throughput, requests per second.
    RequestsPerSecond,
    /// Mean latency, milliseconds.
    LatencyAvgMs,
    /// Minimum latency, milliseconds.
    LatencyMinMs,
    /// Median latency, milliseconds.
    LatencyP50Ms,
    /// 95th percentile latency, milliseconds.
    LatencyP95Ms,
    /// 99th percentile latency, milliseconds.
    LatencyP99Ms,
    /// Maximum latency, milliseconds.
    LatencyMaxMs,
}

impl Field {
    /// Every field, in report order.
    pub const ALL: [Field; 7] = [
        Field::RequestsPerSecond,
        Field::LatencyAvgMs,
        Field::LatencyMinMs,
        Field::LatencyP50Ms,
        Field::LatencyP95Ms,
        Field::LatencyP99Ms,
        Field::LatencyMaxMs,
    ];

    fn get(self, record: &BenchmarkRecord) -> Option<f64> {
        match self {
            Field::RequestsPerSecond => record.requests_per_second,
            Field::LatencyAvgMs => record.latency_avg_ms,
            Field::LatencyMinMs => record.latency_min_ms,
            Field::LatencyP50Ms => record.latency_p50_ms,
            Field::LatencyP95Ms => record.latency_p95_ms,
            Field::LatencyP99Ms => record.latency_p99_ms,
            Field::LatencyMaxMs => record.latency_max_ms,
        }
    }
}

/// Identity of one group of records.
#[derive(Debug, Serialize, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// The operation the records measured.
    pub operation: OperationKind,
    /// The concurrency level the records ran at.
    pub concurrency: u32,
}

/// Summary statistics over the present values of one field in one group.
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Smallest observed value.
    pub min: f64,
    /// Arithmetic mean of observed values.
    pub mean: f64,
    /// Largest observed value.
    pub max: f64,
    /// How many records carried the field.
    pub count: usize,
}

/// The reduction of one field within one group.
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    /// No record in the group carried this field.
    NoData,
    /// Statistics over the records that carried this field.
    Stats(Summary),
}

/// One group's reductions, in [`Field::ALL`] order.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct GroupReport {
    /// The group's identity.
    #[serde(flatten)]
    pub key: GroupKey,
    /// How many records landed in the group.
    pub records: usize,
    /// Per-field reductions.
    pub fields: Vec<(Field, Aggregate)>,
}

/// A full sweep reduced to summary statistics, ordered by operation then
/// concurrency.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Report {
    /// Every group observed in the input.
    pub groups: Vec<GroupReport>,
}

/// Reduce a record set to per-group summary statistics.
#[must_use]
pub fn aggregate(records: &[BenchmarkRecord]) -> Report {
    let mut groups: FxHashMap<GroupKey, Vec<&BenchmarkRecord>> = FxHashMap::default();
    for record in records {
        let key = GroupKey {
            operation: record.operation.clone(),
            concurrency: record.concurrency,
        };
        groups.entry(key).or_default().push(record);
    }

    let mut reports: Vec<GroupReport> = groups
        .into_iter()
        .map(|(key, members)| {
            let fields = Field::ALL
                .iter()
                .map(|&field| {
                    let values: Vec<f64> =
                        members.iter().filter_map(|r| field.get(r)).collect();
                    (field, reduce(&values))
                })
                .collect();
            GroupReport {
                key,
                records: members.len(),
                fields,
            }
        })
        .collect();
    reports.sort_by(|a, b| {
        operation_rank(&a.key.operation)
            .cmp(&operation_rank(&b.key.operation))
            .then(a.key.concurrency.cmp(&b.key.concurrency))
    });

    Report { groups: reports }
}

fn reduce(values: &[f64]) -> Aggregate {
    let Some(&first) = values.first() else {
        return Aggregate::NoData;
    };
    let mut min = first;
    let mut max = first;
    let mut sum = 0.0;
    for &value in values {
        min = min.min(value);
        max = max.max(value);
        sum += value;
    }
    Aggregate::Stats(Summary {
        min,
        mean: sum / values.len() as f64,
        max,
        count: values.len(),
    })
}

fn operation_rank(operation: &OperationKind) -> (u8, &str) {
    match operation {
        OperationKind::Get => (0, ""),
        OperationKind::Set => (1, ""),
        OperationKind::Request => (2, ""),
        OperationKind::Other(name) => (3, name.as_str()),
    }
}
