//! Diagnostic counters for the replication layer
//!
//! Duplicate and late replica responses are never errors; they only show up
//! here. The registry renders Prometheus text so an outer daemon can expose it.

use crate::replication::OpResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for finalize latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A lock-free latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide replication metrics
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    pub admitted: Counter,
    pub rejected: Counter,

    /// Finalizations by terminal result
    pub succeeded: Counter,
    pub failed: Counter,
    pub errored: Counter,
    pub timed_out: Counter,
    pub invalid_version: Counter,

    /// Responses for a replica whose entry was already terminal
    pub duplicate_responses: Counter,
    /// Responses for operations no longer registered
    pub late_responses: Counter,
    /// Responses naming a replica outside the operation's replica set
    pub stray_responses: Counter,

    pub retries_sent: Counter,
    pub replica_timeouts: Counter,
    pub cancelled: Counter,

    pub in_flight: Gauge,

    /// Admit to finalize
    pub finalize_latency: Histogram,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finalization
    pub fn record_finalized(&self, result: OpResult, elapsed: Duration) {
        match result {
            OpResult::Succeeded => self.succeeded.inc(),
            OpResult::Failed => self.failed.inc(),
            OpResult::Error => self.errored.inc(),
            OpResult::Timeout => self.timed_out.inc(),
            OpResult::InvalidVersion => self.invalid_version.inc(),
            OpResult::Incomplete => {
                tracing::error!("finalization recorded with non-terminal result");
                return;
            }
        }
        self.in_flight.dec();
        self.finalize_latency
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn finalized_total(&self) -> u64 {
        self.succeeded.get()
            + self.failed.get()
            + self.errored.get()
            + self.timed_out.get()
            + self.invalid_version.get()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, u64); 8] = [
            ("kvquorum_ops_admitted_total", "Operations admitted", self.admitted.get()),
            ("kvquorum_ops_rejected_total", "Operations rejected at admission", self.rejected.get()),
            ("kvquorum_duplicate_responses_total", "Replica responses dropped as duplicates", self.duplicate_responses.get()),
            ("kvquorum_late_responses_total", "Replica responses for operations already retired", self.late_responses.get()),
            ("kvquorum_stray_responses_total", "Responses from replicas outside the replica set", self.stray_responses.get()),
            ("kvquorum_retries_sent_total", "Replica requests re-sent after a timeout", self.retries_sent.get()),
            ("kvquorum_replica_timeouts_total", "Replicas marked timed out after exhausting retries", self.replica_timeouts.get()),
            ("kvquorum_ops_cancelled_total", "Operations cancelled before a quorum decision", self.cancelled.get()),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out.push_str("# HELP kvquorum_ops_finalized_total Operations finalized by result\n");
        out.push_str("# TYPE kvquorum_ops_finalized_total counter\n");
        for (result, value) in [
            (OpResult::Succeeded, self.succeeded.get()),
            (OpResult::Failed, self.failed.get()),
            (OpResult::Error, self.errored.get()),
            (OpResult::Timeout, self.timed_out.get()),
            (OpResult::InvalidVersion, self.invalid_version.get()),
        ] {
            let _ = writeln!(
                out,
                "kvquorum_ops_finalized_total{{result=\"{}\"}} {}",
                result, value
            );
        }

        out.push_str("# HELP kvquorum_ops_in_flight Operations currently registered\n");
        out.push_str("# TYPE kvquorum_ops_in_flight gauge\n");
        let _ = writeln!(out, "kvquorum_ops_in_flight {}", self.in_flight.get());

        out.push_str("# HELP kvquorum_finalize_latency_ms Admit to finalize latency\n");
        out.push_str("# TYPE kvquorum_finalize_latency_ms histogram\n");
        for (le, count) in self.finalize_latency.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(
                out,
                "kvquorum_finalize_latency_ms_bucket{{le=\"{}\"}} {}",
                le, count
            );
        }
        let _ = writeln!(
            out,
            "kvquorum_finalize_latency_ms_sum {}",
            self.finalize_latency.sum()
        );
        let _ = writeln!(
            out,
            "kvquorum_finalize_latency_ms_count {}",
            self.finalize_latency.count()
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(15.0);
        hist.observe(150.0);
        hist.observe(9000.0);

        assert_eq!(hist.count(), 4);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 4);
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_record_finalized() {
        let metrics = ReplicationMetrics::new();
        metrics.in_flight.set(2);

        metrics.record_finalized(OpResult::Succeeded, Duration::from_millis(3));
        metrics.record_finalized(OpResult::Timeout, Duration::from_millis(300));

        assert_eq!(metrics.succeeded.get(), 1);
        assert_eq!(metrics.timed_out.get(), 1);
        assert_eq!(metrics.finalized_total(), 2);
        assert_eq!(metrics.in_flight.get(), 0);
        assert_eq!(metrics.finalize_latency.count(), 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ReplicationMetrics::new();
        metrics.duplicate_responses.add(3);
        metrics.in_flight.set(1);
        metrics.record_finalized(OpResult::InvalidVersion, Duration::from_millis(1));

        let text = metrics.to_prometheus();
        assert!(text.contains("kvquorum_duplicate_responses_total 3"));
        assert!(text.contains("kvquorum_ops_finalized_total{result=\"invalid_version\"} 1"));
        assert!(text.contains("kvquorum_finalize_latency_ms_bucket{le=\"+Inf\"} 1"));
    }
}
