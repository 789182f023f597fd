//! Running statistics for one stress-test run.
//!
//! [`LoadStats`] holds the counters and duration samples mutated by the
//! collector under the executor's stats lock. Percentiles are computed once,
//! at finalization, by sorting the sample sequence and selecting the
//! ceiling-indexed element; observers get value-copy snapshots.

use serde::Serialize;

/// Mutable accumulator. The executor guards it with a single mutex; the
/// collector is the only writer of result counters, the scheduler the only
/// writer of `requests_sent`.
#[derive(Debug)]
pub struct LoadStats {
    /// Configured target; progress denominator, not the sample count.
    pub total_requests: u64,

    /// Tasks handed to the request channel so far.
    pub requests_sent: u64,

    /// Results observed by the collector.
    pub completed_requests: u64,

    /// Transport-level failures (timeout, refused, body read).
    pub error_count: u64,

    /// Successful exchanges that failed a configured predicate.
    pub validation_error_count: u64,

    /// Exchanges that passed transport and validation.
    pub success_count: u64,

    sum_duration_ms: u64,
    min_duration_ms: u64,
    max_duration_ms: u64,

    /// Append-only duration samples, percentile source at finalization.
    samples: Vec<u64>,
}

/// Value copy served to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub requests_sent: u64,
    pub completed_requests: u64,
    pub error_count: u64,
    pub validation_error_count: u64,
    pub success_count: u64,
    pub active_workers: i64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub samples: Vec<u64>,
}

/// Duration summary derived from the samples at finalization.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DurationSummary {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LoadStats {
    pub fn new(total_requests: u64) -> Self {
        Self {
            total_requests,
            requests_sent: 0,
            completed_requests: 0,
            error_count: 0,
            validation_error_count: 0,
            success_count: 0,
            sum_duration_ms: 0,
            min_duration_ms: u64::MAX,
            max_duration_ms: 0,
            samples: Vec::new(),
        }
    }

    /// Records one completed request.
    ///
    /// Network errors take precedence over validation errors; exactly one of
    /// the three outcome counters is incremented, keeping
    /// `errors + validation_errors + successes == completed`.
    pub fn add_result(&mut self, duration_ms: u64, is_network_error: bool, is_validation_error: bool) {
        self.completed_requests += 1;
        self.samples.push(duration_ms);
        self.sum_duration_ms += duration_ms;
        self.min_duration_ms = self.min_duration_ms.min(duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);

        if is_network_error {
            self.error_count += 1;
        } else if is_validation_error {
            self.validation_error_count += 1;
        } else {
            self.success_count += 1;
        }
    }

    /// Mean duration over observed results, 0.0 before the first result.
    pub fn avg_duration_ms(&self) -> f64 {
        if self.completed_requests == 0 {
            0.0
        } else {
            self.sum_duration_ms as f64 / self.completed_requests as f64
        }
    }

    /// Value copy including a copy of the samples slice.
    pub fn snapshot(&self, active_workers: i64) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests,
            requests_sent: self.requests_sent,
            completed_requests: self.completed_requests,
            error_count: self.error_count,
            validation_error_count: self.validation_error_count,
            success_count: self.success_count,
            active_workers,
            min_duration_ms: if self.samples.is_empty() {
                0
            } else {
                self.min_duration_ms
            },
            max_duration_ms: self.max_duration_ms,
            avg_duration_ms: self.avg_duration_ms(),
            samples: self.samples.clone(),
        }
    }

    /// Sorts the samples and derives the summary. Empty samples yield zeros.
    pub fn summarize(&self) -> DurationSummary {
        if self.samples.is_empty() {
            return DurationSummary::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        DurationSummary {
            avg_ms: self.avg_duration_ms(),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

/// Smallest sample value v such that at least `pct` percent of samples
/// are <= v, via ceiling index over the sorted slice.
///
/// The slice must be sorted ascending and non-empty.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    let rank = (pct * sorted.len() as f64 / 100.0).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters_partition_completed() {
        let mut stats = LoadStats::new(10);
        stats.add_result(10, false, false);
        stats.add_result(20, true, false);
        stats.add_result(30, false, true);
        // Network error wins even when a validation flag is also set.
        stats.add_result(40, true, true);

        assert_eq!(stats.completed_requests, 4);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.validation_error_count, 1);
        assert_eq!(
            stats.error_count + stats.validation_error_count + stats.success_count,
            stats.completed_requests
        );
    }

    #[test]
    fn test_percentile_ceiling_index() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), 50);
        assert_eq!(percentile(&sorted, 95.0), 95);
        assert_eq!(percentile(&sorted, 99.0), 99);

        let small = vec![7];
        assert_eq!(percentile(&small, 50.0), 7);
        assert_eq!(percentile(&small, 99.0), 7);

        let pair = vec![10, 20];
        assert_eq!(percentile(&pair, 50.0), 10);
        assert_eq!(percentile(&pair, 95.0), 20);
    }

    #[test]
    fn test_summary_monotonic() {
        let mut stats = LoadStats::new(100);
        for d in [5u64, 80, 3, 42, 17, 91, 64, 8, 120, 33] {
            stats.add_result(d, false, false);
        }

        let summary = stats.summarize();
        assert_eq!(summary.min_ms, 3);
        assert_eq!(summary.max_ms, 120);
        assert!(summary.min_ms <= summary.p50_ms);
        assert!(summary.p50_ms <= summary.p95_ms);
        assert!(summary.p95_ms <= summary.p99_ms);
        assert!(summary.p99_ms <= summary.max_ms);
    }

    #[test]
    fn test_empty_summary_is_zero() {
        let stats = LoadStats::new(5);
        let summary = stats.summarize();
        assert_eq!(summary.min_ms, 0);
        assert_eq!(summary.max_ms, 0);
        assert_eq!(summary.p50_ms, 0);
        assert_eq!(summary.p99_ms, 0);
        assert_eq!(summary.avg_ms, 0.0);
    }

    #[test]
    fn test_snapshot_is_value_copy() {
        let mut stats = LoadStats::new(10);
        stats.add_result(15, false, false);

        let snap = stats.snapshot(3);
        stats.add_result(25, false, false);

        assert_eq!(snap.completed_requests, 1);
        assert_eq!(snap.samples, vec![15]);
        assert_eq!(snap.active_workers, 3);
        assert_eq!(snap.total_requests, 10);
        assert_eq!(stats.samples.len(), 2);
    }

    #[test]
    fn test_min_zero_before_first_sample() {
        let stats = LoadStats::new(1);
        let snap = stats.snapshot(0);
        assert_eq!(snap.min_duration_ms, 0);
        assert_eq!(snap.max_duration_ms, 0);
    }
}
