//! Parse redis-benchmark's `--csv` report.
//!
//! Every field is double quoted. The first line is a header naming the
//! columns; data rows carry the test name, throughput, then six latency
//! columns in milliseconds. Older tool versions emit only the test name
//! and throughput, which still parses here with the latency columns
//! absent. Rows for tests other than GET and SET keep their name on the
//! record instead of being dropped, and a numeric column that fails to
//! parse is retained as opaque text rather than discarded.

use tracing::warn;
use unirig_capture::json::{BenchmarkRecord, OperationKind, Work};

/// Parse one `--csv` report into one record per data row.
pub(crate) fn parse(output: &str, concurrency: u32, work: Work) -> Vec<BenchmarkRecord> {
    let mut records = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(fields) = split_csv(line) else {
            warn!(line, "unquoted line in csv report, skipping");
            continue;
        };
        // Header row.
        if fields.first().map(String::as_str) == Some("test") {
            continue;
        }
        records.push(row_to_record(&fields, concurrency, work));
    }

    records
}

/// Split a fully double-quoted csv line into its fields. Returns `None`
/// for lines that are not quoted csv at all.
fn split_csv(line: &str) -> Option<Vec<String>> {
    let inner = line.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.split("\",\"").map(str::to_owned).collect())
}

fn row_to_record(fields: &[String], concurrency: u32, work: Work) -> BenchmarkRecord {
    let operation = match fields.first().map(String::as_str) {
        Some("GET") => OperationKind::Get,
        Some("SET") => OperationKind::Set,
        Some(other) => OperationKind::Other(other.to_owned()),
        // split_csv yields at least one field; an empty name still names
        // the row.
        None => OperationKind::Other(String::new()),
    };

    let mut record = BenchmarkRecord::empty(operation, concurrency, work);
    record.requests_per_second = numeric(fields, 1, &mut record.unparsed);
    // Latency columns arrived in redis 6.2; their absence is not an
    // error.
    record.latency_avg_ms = numeric(fields, 2, &mut record.unparsed);
    record.latency_min_ms = numeric(fields, 3, &mut record.unparsed);
    record.latency_p50_ms = numeric(fields, 4, &mut record.unparsed);
    record.latency_p95_ms = numeric(fields, 5, &mut record.unparsed);
    record.latency_p99_ms = numeric(fields, 6, &mut record.unparsed);
    record.latency_max_ms = numeric(fields, 7, &mut record.unparsed);
    record
}

/// Read one numeric column. An absent column is `None`; a column that is
/// present but not numeric is also `None`, with the raw text retained on
/// the record so the anomaly survives into the artifact.
fn numeric(fields: &[String], index: usize, unparsed: &mut Vec<String>) -> Option<f64> {
    let field = fields.get(index)?;
    match field.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(field = %field, index, "non-numeric csv field kept as opaque text");
            unparsed.push(field.clone());
            None
        }
    }
}
