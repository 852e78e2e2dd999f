//! Per-node reliability metrics.
//!
//! Counters are monotonic; latency history is a fixed-capacity ring so memory
//! stays bounded regardless of traffic. Stats live only in-process — reset
//! happens on restart or explicit admin action, never implicitly.
//!
//! Nodes with fewer than `warm_requests` completed attempts are ranked with a
//! success-rate prior of 1.0 so a freshly discovered node is not penalized
//! for having no history.

use std::{collections::VecDeque, time::Duration};

use dashmap::DashMap;
use serde::Serialize;

use crate::client::ClientError;

/// Why a terminated attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    HttpStatus(u16),
    Timeout,
    Malformed,
    Canceled,
    Oom,
}

impl From<&ClientError> for FailureKind {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Unreachable(_) => Self::Unreachable,
            ClientError::HttpStatus { status, .. } => Self::HttpStatus(*status),
            ClientError::Timeout => Self::Timeout,
            ClientError::MalformedResponse(_) => Self::Malformed,
            ClientError::Canceled => Self::Canceled,
            ClientError::OomSuspected(_) => Self::Oom,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => f.write_str("unreachable"),
            Self::HttpStatus(code) => write!(f, "http_{code}"),
            Self::Timeout => f.write_str("timeout"),
            Self::Malformed => f.write_str("malformed"),
            Self::Canceled => f.write_str("canceled"),
            Self::Oom => f.write_str("oom"),
        }
    }
}

#[derive(Debug, Default)]
struct NodeStats {
    total: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    latencies: VecDeque<Duration>,
}

impl NodeStats {
    fn push_latency(&mut self, latency: Duration, window: usize) {
        if self.latencies.len() == window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    fn latency_mean_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        sum / self.latencies.len() as f64
    }

    /// Population variance over the ring, in ms².
    fn latency_variance(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let mean = self.latency_mean_ms();
        let sum: f64 = self
            .latencies
            .iter()
            .map(|d| {
                let ms = d.as_secs_f64() * 1000.0;
                (ms - mean) * (ms - mean)
            })
            .sum();
        sum / self.latencies.len() as f64
    }
}

/// Read-only view of one node's reliability.
#[derive(Debug, Clone, Serialize)]
pub struct ReliabilityStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub success_rate: f64,
    pub latency_mean_ms: f64,
    /// Population variance of the latency ring, in ms².
    pub latency_variance: f64,
}

impl ReliabilityStats {
    fn fresh() -> Self {
        Self {
            total: 0,
            successes: 0,
            failures: 0,
            timeouts: 0,
            success_rate: 1.0,
            latency_mean_ms: 0.0,
            latency_variance: 0.0,
        }
    }
}

/// Rolling per-node metrics, sharded by node id.
pub struct ReliabilityTracker {
    window: usize,
    warm_requests: u64,
    stats: DashMap<String, NodeStats>,
}

impl ReliabilityTracker {
    pub fn new(window: usize, warm_requests: u64) -> Self {
        Self {
            window,
            warm_requests,
            stats: DashMap::new(),
        }
    }

    pub fn record_success(&self, id: &str, latency: Duration) {
        let mut entry = self.stats.entry(id.to_owned()).or_default();
        entry.total += 1;
        entry.successes += 1;
        entry.push_latency(latency, self.window);
    }

    pub fn record_failure(&self, id: &str, kind: FailureKind, latency: Option<Duration>) {
        let mut entry = self.stats.entry(id.to_owned()).or_default();
        entry.total += 1;
        entry.failures += 1;
        if kind == FailureKind::Timeout {
            entry.timeouts += 1;
        }
        if let Some(latency) = latency {
            entry.push_latency(latency, self.window);
        }
    }

    /// Current stats for a node; a node with no history reads as perfect.
    pub fn stats(&self, id: &str) -> ReliabilityStats {
        match self.stats.get(id) {
            Some(s) => ReliabilityStats {
                total: s.total,
                successes: s.successes,
                failures: s.failures,
                timeouts: s.timeouts,
                success_rate: s.success_rate(),
                latency_mean_ms: s.latency_mean_ms(),
                latency_variance: s.latency_variance(),
            },
            None => ReliabilityStats::fresh(),
        }
    }

    /// Whether the node has completed enough requests for RELIABLE ranking to
    /// trust its observed rate.
    pub fn is_warm(&self, id: &str) -> bool {
        self.stats.get(id).map(|s| s.total >= self.warm_requests).unwrap_or(false)
    }

    /// Success rate with the cold-node prior applied.
    pub fn ranking_rate(&self, id: &str) -> f64 {
        match self.stats.get(id) {
            Some(s) if s.total >= self.warm_requests => s.success_rate(),
            _ => 1.0,
        }
    }

    /// Node ids at or above `min_success_rate`, most reliable first:
    /// success rate descending, then latency variance ascending, then mean
    /// latency ascending.
    pub fn most_reliable(&self, min_success_rate: f64) -> Vec<String> {
        let mut ranked: Vec<(String, f64, f64, f64)> = self
            .stats
            .iter()
            .map(|entry| {
                let rate = if entry.total >= self.warm_requests {
                    entry.success_rate()
                } else {
                    1.0
                };
                (entry.key().clone(), rate, entry.latency_variance(), entry.latency_mean_ms())
            })
            .filter(|(_, rate, _, _)| *rate >= min_success_rate)
            .collect();

        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(a.2.total_cmp(&b.2))
                .then(a.3.total_cmp(&b.3))
                .then(a.0.cmp(&b.0))
        });
        ranked.into_iter().map(|(id, ..)| id).collect()
    }

    /// Admin-only: wipe one node's history.
    pub fn reset(&self, id: &str) {
        self.stats.remove(id);
    }

    /// Admin-only: wipe all history.
    pub fn reset_all(&self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_node_reads_as_perfect() {
        let tracker = ReliabilityTracker::new(100, 10);
        let stats = tracker.stats("a");
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.latency_mean_ms, 0.0);
    }

    #[test]
    fn successes_and_failures_sum_to_total() {
        let tracker = ReliabilityTracker::new(100, 10);
        tracker.record_success("a", ms(10));
        tracker.record_success("a", ms(20));
        tracker.record_failure("a", FailureKind::Unreachable, None);

        let stats = tracker.stats("a");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.successes + stats.failures, stats.total);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn timeouts_are_counted_within_failures() {
        let tracker = ReliabilityTracker::new(100, 10);
        tracker.record_failure("a", FailureKind::Timeout, Some(ms(500)));
        tracker.record_failure("a", FailureKind::HttpStatus(500), None);

        let stats = tracker.stats("a");
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.timeouts, 1);
        assert!(stats.timeouts <= stats.failures);
    }

    // -----------------------------------------------------------------------
    // Latency ring
    // -----------------------------------------------------------------------

    #[test]
    fn ring_evicts_oldest_latency_on_overflow() {
        let tracker = ReliabilityTracker::new(3, 10);
        for latency in [10, 20, 30, 100] {
            tracker.record_success("a", ms(latency));
        }
        // The 10ms sample fell out: mean over {20, 30, 100} = 50
        let stats = tracker.stats("a");
        assert!((stats.latency_mean_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn variance_is_population_variance() {
        let tracker = ReliabilityTracker::new(100, 10);
        for latency in [10, 20, 30] {
            tracker.record_success("a", ms(latency));
        }
        let stats = tracker.stats("a");
        assert!((stats.latency_mean_ms - 20.0).abs() < 1e-9);
        // ((10-20)² + 0 + (30-20)²) / 3
        assert!((stats.latency_variance - 200.0 / 3.0).abs() < 1e-6);
    }

    // -----------------------------------------------------------------------
    // Warm-up prior
    // -----------------------------------------------------------------------

    #[test]
    fn cold_node_ranks_with_prior_of_one() {
        let tracker = ReliabilityTracker::new(100, 10);
        // 1 of 3 succeeded, but total < warm_requests
        tracker.record_success("a", ms(10));
        tracker.record_failure("a", FailureKind::Unreachable, None);
        tracker.record_failure("a", FailureKind::Unreachable, None);

        assert!(!tracker.is_warm("a"));
        assert_eq!(tracker.ranking_rate("a"), 1.0);
        // The raw rate is still observable
        assert!(tracker.stats("a").success_rate < 0.5);
    }

    #[test]
    fn warm_node_ranks_with_observed_rate() {
        let tracker = ReliabilityTracker::new(100, 2);
        tracker.record_success("a", ms(10));
        tracker.record_failure("a", FailureKind::Timeout, None);
        assert!(tracker.is_warm("a"));
        assert!((tracker.ranking_rate("a") - 0.5).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // most_reliable
    // -----------------------------------------------------------------------

    #[test]
    fn most_reliable_orders_by_rate_then_variance_then_mean() {
        let tracker = ReliabilityTracker::new(100, 2);
        // a: rate 1.0, jittery latencies
        tracker.record_success("a", ms(10));
        tracker.record_success("a", ms(200));
        // b: rate 1.0, steady latencies
        tracker.record_success("b", ms(50));
        tracker.record_success("b", ms(50));
        // c: rate 0.5
        tracker.record_success("c", ms(10));
        tracker.record_failure("c", FailureKind::Unreachable, None);

        let ranked = tracker.most_reliable(0.0);
        assert_eq!(ranked, vec!["b", "a", "c"]);
    }

    #[test]
    fn most_reliable_filters_below_floor() {
        let tracker = ReliabilityTracker::new(100, 2);
        tracker.record_success("good", ms(10));
        tracker.record_success("good", ms(10));
        tracker.record_failure("bad", FailureKind::Unreachable, None);
        tracker.record_failure("bad", FailureKind::Unreachable, None);

        let ranked = tracker.most_reliable(0.95);
        assert_eq!(ranked, vec!["good"]);
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    #[test]
    fn reset_wipes_history_for_one_node() {
        let tracker = ReliabilityTracker::new(100, 10);
        tracker.record_failure("a", FailureKind::Unreachable, None);
        tracker.record_success("b", ms(10));

        tracker.reset("a");
        assert_eq!(tracker.stats("a").total, 0);
        assert_eq!(tracker.stats("b").total, 1);

        tracker.reset_all();
        assert_eq!(tracker.stats("b").total, 0);
    }
}
