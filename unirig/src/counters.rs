//! Cumulative counter arithmetic.
//!
//! Container runtimes report CPU consumption as monotonic cumulative
//! counters. Utilization is derived by differencing consecutive
//! snapshots: the container's share of the system-wide CPU delta, scaled
//! by the number of available cores. This module is pure; sampling and
//! persistence live in [`crate::observer`].

use metrics::counter;
use tracing::warn;
use unirig_capture::json::CounterSample;

/// Derive CPU utilization percent from two consecutive counter
/// snapshots.
///
/// Returns `(cpu_delta / sys_delta) * cores * 100.0` when both counters
/// advanced and the system delta is positive. A non-positive system
/// delta yields 0.0. A counter that decreased indicates a reset or
/// wraparound at the source; the interval contributes 0.0 rather than a
/// negative value, and the regression is logged.
#[must_use]
pub fn cpu_percent(prev: &CounterSample, curr: &CounterSample, cores: usize) -> f64 {
    let cpu_delta = match curr.cpu_total_usage_ns.checked_sub(prev.cpu_total_usage_ns) {
        Some(delta) => delta,
        None => {
            warn!(
                prev = prev.cpu_total_usage_ns,
                curr = curr.cpu_total_usage_ns,
                "container cpu counter regressed, zeroing interval"
            );
            counter!("counter_regressions").increment(1);
            return 0.0;
        }
    };
    let sys_delta = match curr.system_cpu_usage_ns.checked_sub(prev.system_cpu_usage_ns) {
        Some(delta) => delta,
        None => {
            warn!(
                prev = prev.system_cpu_usage_ns,
                curr = curr.system_cpu_usage_ns,
                "system cpu counter regressed, zeroing interval"
            );
            counter!("counter_regressions").increment(1);
            return 0.0;
        }
    };

    if sys_delta == 0 {
        return 0.0;
    }

    (cpu_delta as f64 / sys_delta as f64) * (cores as f64) * 100.0
}
