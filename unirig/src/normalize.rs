//! Rebase raw sample series to the canonical metrics schema.
//!
//! Raw series from different targets start at different wall-clock times
//! and different resident footprints. Comparison requires rebasing: time
//! becomes seconds elapsed since the first sample, memory becomes the
//! delta against the baseline reading taken immediately before
//! monitoring began. Conversions truncate rather than round so every
//! series is rebased the same way.

use tracing::warn;
use unirig_capture::json::{NormalizedSample, RawSample};

/// Rebase a raw series against a baseline memory reading.
///
/// Stateless and idempotent: the same raw series and baseline always
/// yield the same output. `memory_delta_kb` may be negative when the
/// baseline was read after the target's own startup allocations inflated
/// its footprint; negative deltas are flagged in the log but emitted
/// unmodified, since downstream comparisons are relative.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn normalize(samples: &[RawSample], baseline_bytes: u64) -> Vec<NormalizedSample> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };

    let baseline_kb = (baseline_bytes / 1024) as i64;
    let mut negative_deltas: u64 = 0;

    let normalized = samples
        .iter()
        .map(|sample| {
            let memory_delta_kb = (sample.memory_bytes / 1024) as i64 - baseline_kb;
            if memory_delta_kb < 0 {
                negative_deltas += 1;
            }
            NormalizedSample {
                elapsed_seconds: sample.time - first.time,
                cpu_percent: sample.cpu_percent,
                memory_delta_kb,
                // div_euclid floors toward negative infinity, keeping the
                // MB column consistent with the KB column's sign.
                memory_delta_mb: memory_delta_kb.div_euclid(1024),
            }
        })
        .collect();

    if negative_deltas > 0 {
        warn!(
            count = negative_deltas,
            baseline_bytes, "series contains memory readings below the baseline"
        );
    }

    normalized
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample(time: f64, cpu: f64, mem: u64) -> RawSample {
        RawSample {
            time,
            cpu_percent: cpu,
            memory_bytes: mem,
        }
    }

    #[test]
    fn rebases_against_first_sample_and_baseline() {
        let raw = vec![
            sample(100.0, 5.0, 204_800_000),
            sample(100.5, 7.0, 209_715_200),
        ];
        let normalized = normalize(&raw, 204_800_000);

        assert_eq!(normalized.len(), 2);
        assert!((normalized[0].elapsed_seconds - 0.0).abs() < f64::EPSILON);
        assert!((normalized[0].cpu_percent - 5.0).abs() < f64::EPSILON);
        assert_eq!(normalized[0].memory_delta_kb, 0);
        assert_eq!(normalized[0].memory_delta_mb, 0);

        assert!((normalized[1].elapsed_seconds - 0.5).abs() < f64::EPSILON);
        assert!((normalized[1].cpu_percent - 7.0).abs() < f64::EPSILON);
        assert_eq!(normalized[1].memory_delta_kb, 4800);
        assert_eq!(normalized[1].memory_delta_mb, 4);
    }

    #[test]
    fn truncating_conversion_uses_whole_kib() {
        // 200_000_000 bytes is 195_312.5 KiB; truncation keeps 195_312.
        let raw = vec![sample(0.0, 0.0, 204_800_000)];
        let normalized = normalize(&raw, 200_000_000);
        assert_eq!(normalized[0].memory_delta_kb, 200_000 - 195_312);
    }

    #[test]
    fn negative_deltas_are_preserved_not_clamped() {
        let raw = vec![sample(0.0, 1.0, 1_024_000)];
        let normalized = normalize(&raw, 2_048_000);
        assert_eq!(normalized[0].memory_delta_kb, -1000);
        assert_eq!(normalized[0].memory_delta_mb, -1);
    }

    #[test]
    fn empty_series_normalizes_to_empty() {
        assert!(normalize(&[], 1_000_000).is_empty());
    }

    proptest! {
        #[test]
        fn idempotent(
            times in proptest::collection::vec(0.0_f64..1e9, 0..64),
            mems in proptest::collection::vec(0_u64..1_u64 << 40, 0..64),
            baseline in 0_u64..1_u64 << 40,
        ) {
            let raw: Vec<RawSample> = times
                .iter()
                .zip(mems.iter())
                .map(|(&t, &m)| sample(t, 0.0, m))
                .collect();
            let once = normalize(&raw, baseline);
            let twice = normalize(&raw, baseline);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn elapsed_is_non_decreasing_for_ordered_input(
            start in 0.0_f64..1e9,
            steps in proptest::collection::vec(0.0_f64..10.0, 1..64),
        ) {
            let mut time = start;
            let mut raw = Vec::with_capacity(steps.len());
            for step in steps {
                time += step;
                raw.push(sample(time, 0.0, 1_048_576));
            }
            let normalized = normalize(&raw, 0);
            for pair in normalized.windows(2) {
                prop_assert!(pair[1].elapsed_seconds >= pair[0].elapsed_seconds);
            }
        }
    }
}
