//! Prometheus metrics for kaos-rank.
//!
//! # Example
//!
//! ```rust,ignore
//! use kaos_rank::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_upsert("applied");
//!
//! // Get Prometheus text format
//! let output = metrics.gather();
//! ```

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Leaderboard engine metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Live store
    /// Score events by outcome (applied, unchanged, dropped, restored).
    pub upserts_total: IntCounterVec,

    // Materializer
    /// Snapshots by kind (periodic, final).
    pub snapshots_total: IntCounterVec,
    /// Snapshot duration in seconds by kind.
    pub snapshot_duration: HistogramVec,
    /// Rows written by snapshots.
    pub snapshot_rows_total: IntCounter,
    /// Restores by outcome.
    pub restores_total: IntCounterVec,
    /// Retried storage calls by operation.
    pub storage_retries_total: IntCounterVec,

    // Schedule
    /// Schedule transitions by target state.
    pub schedule_transitions_total: IntCounterVec,
    /// Finalize attempts by outcome.
    pub finalize_total: IntCounterVec,

    // Awards
    /// Award messages published.
    pub awards_published_total: IntCounter,
    /// Prizes processed by kind and outcome.
    pub prizes_total: IntCounterVec,

    /// Operator alerts by code.
    pub alerts_total: IntCounterVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help), labels).expect("metric can be created");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric can be registered");
    metric
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric can be created");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric can be registered");
    metric
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let upserts_total = counter_vec(
            &registry,
            "kaosrank_upserts_total",
            "Score events by outcome",
            &["outcome"],
        );

        let snapshots_total = counter_vec(
            &registry,
            "kaosrank_snapshots_total",
            "Snapshots written",
            &["kind"],
        );

        let snapshot_duration = HistogramVec::new(
            HistogramOpts::new("kaosrank_snapshot_duration_seconds", "Snapshot duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["kind"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(snapshot_duration.clone()))
            .expect("metric can be registered");

        let snapshot_rows_total = counter(
            &registry,
            "kaosrank_snapshot_rows_total",
            "Rows written by snapshots",
        );

        let restores_total = counter_vec(
            &registry,
            "kaosrank_restores_total",
            "Live store restores",
            &["outcome"],
        );

        let storage_retries_total = counter_vec(
            &registry,
            "kaosrank_storage_retries_total",
            "Retried storage calls",
            &["op"],
        );

        let schedule_transitions_total = counter_vec(
            &registry,
            "kaosrank_schedule_transitions_total",
            "Schedule item transitions",
            &["state"],
        );

        let finalize_total = counter_vec(
            &registry,
            "kaosrank_finalize_total",
            "Finalize attempts",
            &["outcome"],
        );

        let awards_published_total = counter(
            &registry,
            "kaosrank_awards_published_total",
            "Award messages published",
        );

        let prizes_total = counter_vec(
            &registry,
            "kaosrank_prizes_total",
            "Prizes processed",
            &["kind", "outcome"],
        );

        let alerts_total = counter_vec(
            &registry,
            "kaosrank_alerts_total",
            "Operator alerts raised",
            &["code"],
        );

        Self {
            registry,
            upserts_total,
            snapshots_total,
            snapshot_duration,
            snapshot_rows_total,
            restores_total,
            storage_retries_total,
            schedule_transitions_total,
            finalize_total,
            awards_published_total,
            prizes_total,
            alerts_total,
        }
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn record_upsert(&self, outcome: &str) {
        self.upserts_total.with_label_values(&[outcome]).inc();
    }

    /// Record a completed snapshot.
    pub fn record_snapshot(&self, kind: &str, rows: usize, duration_secs: f64) {
        self.snapshots_total.with_label_values(&[kind]).inc();
        self.snapshot_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
        self.snapshot_rows_total.inc_by(rows as u64);
    }

    pub fn record_prize(&self, kind: &str, outcome: &str) {
        self.prizes_total.with_label_values(&[kind, outcome]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.record_upsert("applied");
        metrics.record_upsert("applied");
        metrics.awards_published_total.inc();

        let output = metrics.gather();
        assert!(output.contains("kaosrank_upserts_total{outcome=\"applied\"} 2"));
        assert!(output.contains("kaosrank_awards_published_total 1"));
    }

    #[test]
    fn test_snapshot_metrics() {
        let metrics = Metrics::new();
        metrics.record_snapshot("final", 3, 0.02);
        metrics.record_prize("cash", "applied");

        let output = metrics.gather();
        assert!(output.contains("kaosrank_snapshot_duration_seconds"));
        assert!(output.contains("kaosrank_snapshot_rows_total 3"));
        assert!(output.contains("kaosrank_prizes_total"));
    }
}
