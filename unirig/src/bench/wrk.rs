//! Parse wrk's human-readable report.
//!
//! wrk prints one report per invocation. The load summary lives on two
//! lines, `Requests/sec:` and the `Latency` row of the thread stats
//! table, with latencies carrying a unit suffix (us, ms, s, m). Passing
//! `--latency` adds a percentile block. Lines that carry signal but no
//! structured home here, socket errors chief among them, are kept
//! verbatim on the record rather than dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use unirig_capture::json::{BenchmarkRecord, OperationKind, Work};

static REQUESTS_PER_SEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Requests/sec:\s+([0-9.]+)").expect("valid regex")
});
// Thread stats row: Latency <avg> <stdev> <max> <+/- stdev>.
static LATENCY_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Latency\s+(\S+)\s+(\S+)\s+(\S+)").expect("valid regex")
});
// Percentile block rows from --latency: "    50%    1.23ms".
static PERCENTILE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)%\s+(\S+)").expect("valid regex")
});

/// Parse one wrk report into a single record.
///
/// A report that yields neither a throughput figure nor any latency
/// figure comes back vacant; see [`BenchmarkRecord::is_vacant`].
pub(crate) fn parse(output: &str, concurrency: u32, work: Work) -> BenchmarkRecord {
    let mut record = BenchmarkRecord::empty(OperationKind::Request, concurrency, work);

    for line in output.lines() {
        if let Some(caps) = REQUESTS_PER_SEC.captures(line) {
            record.requests_per_second = caps[1].parse().ok();
        } else if let Some(caps) = LATENCY_ROW.captures(line) {
            record.latency_avg_ms = latency_ms(&caps[1]);
            record.latency_max_ms = latency_ms(&caps[3]);
        } else if let Some(caps) = PERCENTILE_ROW.captures(line) {
            let value = latency_ms(&caps[2]);
            match &caps[1] {
                "50" => record.latency_p50_ms = value,
                "95" => record.latency_p95_ms = value,
                "99" => record.latency_p99_ms = value,
                // wrk also prints 75% and 90%; no structured home.
                _ => record.unparsed.push(line.trim().to_owned()),
            }
        } else if line.contains("Socket errors") || line.contains("Non-2xx") {
            record.unparsed.push(line.trim().to_owned());
        }
    }

    record
}

/// Convert a wrk latency token to milliseconds. wrk suffixes values with
/// us, ms, s, or m and never prints bare numbers.
fn latency_ms(token: &str) -> Option<f64> {
    let (digits, scale) = if let Some(stripped) = token.strip_suffix("us") {
        (stripped, 1e-3)
    } else if let Some(stripped) = token.strip_suffix("ms") {
        (stripped, 1.0)
    } else if let Some(stripped) = token.strip_suffix('s') {
        (stripped, 1e3)
    } else if let Some(stripped) = token.strip_suffix('m') {
        (stripped, 60.0 * 1e3)
    } else {
        return None;
    };
    digits.parse::<f64>().ok().map(|value| value * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
Running 15s test @ http://127.0.0.1:8083/
  2 threads and 100 connections
  Thread Stats   Avg      Stdev     Max   +/- Stdev
    Latency     3.17ms    1.82ms   43.12ms   87.51%
    Req/Sec    15.91k     1.33k   18.45k    71.33%
  Latency Distribution
     50%    2.89ms
     75%    3.77ms
     90%    4.94ms
     99%    9.56ms
  475491 requests in 15.02s, 57.60MB read
  Socket errors: connect 0, read 12, write 0, timeout 3
Requests/sec:  31653.57
Transfer/sec:      3.83MB
";

    #[test]
    fn full_report() {
        let record = parse(REPORT, 100, Work::DurationSeconds(15));
        assert!(!record.is_vacant());
        assert_eq!(record.operation, OperationKind::Request);
        assert_eq!(record.concurrency, 100);

        let rps = record.requests_per_second.expect("rps parsed");
        assert!((rps - 31_653.57).abs() < 1e-9);
        let avg = record.latency_avg_ms.expect("avg parsed");
        assert!((avg - 3.17).abs() < 1e-9);
        let max = record.latency_max_ms.expect("max parsed");
        assert!((max - 43.12).abs() < 1e-9);
        let p50 = record.latency_p50_ms.expect("p50 parsed");
        assert!((p50 - 2.89).abs() < 1e-9);
        assert!(record.latency_p95_ms.is_none());
        let p99 = record.latency_p99_ms.expect("p99 parsed");
        assert!((p99 - 9.56).abs() < 1e-9);

        // 75%, 90%, and the socket error line survive verbatim.
        assert_eq!(record.unparsed.len(), 3);
        assert!(record.unparsed[2].starts_with("Socket errors"));
    }

    #[test]
    fn report_without_percentile_block() {
        let report = "\
  Thread Stats   Avg      Stdev     Max   +/- Stdev
    Latency   850.12us  120.00us    2.10ms   91.00%
Requests/sec:  104233.80
";
        let record = parse(report, 10, Work::DurationSeconds(10));
        let avg = record.latency_avg_ms.expect("avg parsed");
        assert!((avg - 0.850_12).abs() < 1e-9);
        let max = record.latency_max_ms.expect("max parsed");
        assert!((max - 2.10).abs() < 1e-9);
        assert!(record.latency_p50_ms.is_none());
    }

    #[test]
    fn latency_units() {
        assert_eq!(latency_ms("250.00us"), Some(0.25));
        assert_eq!(latency_ms("3.50ms"), Some(3.5));
        assert_eq!(latency_ms("1.20s"), Some(1200.0));
        assert_eq!(latency_ms("1.00m"), Some(60_000.0));
        assert_eq!(latency_ms("garbage"), None);
    }

    #[test]
    fn garbage_is_vacant() {
        let record = parse("nothing wrk shaped here\n", 10, Work::DurationSeconds(10));
        assert!(record.is_vacant());
        assert!(record.unparsed.is_empty());
    }
}
