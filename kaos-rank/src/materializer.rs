//! Snapshot and restore between the live store and durable storage.
//!
//! A snapshot reads a board best-first, numbers the rows 1..n and upserts them
//! in batches, then runs a rank-recompute pass over the durable rows so rows
//! the live board no longer holds are ranked consistently. Running it twice
//! writes the same rows.
//!
//! A final snapshot marks the leaderboard closed before writing its rows.
//! From then on durable storage refuses periodic writes, so a sweep that read
//! the board before the freeze cannot overwrite the final ranking.
//!
//! A restore loads the durable rows back into the live store with their
//! running `(points, tie_breaker)` pairs, so the rebuilt board orders exactly
//! as the one that was snapshotted.

use crate::alerts::{Alert, AlertCode, AlertSink};
use crate::clock::Clock;
use crate::durable::DurableStore;
use crate::entry::{rank_entries, LiveEntry};
use crate::error::{RankError, Result};
use crate::live::LiveScoreStore;
use crate::retry::RetryPolicy;
use crate::schedule::{ScheduleManager, ScheduleState};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub leaderboard_id: String,
    /// Rows written.
    pub rows: usize,
    /// Rows whose rank changed in the recompute pass.
    pub reranked: usize,
    /// Set for final snapshots.
    pub final_snapshot_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub leaderboard_id: String,
    pub entries: usize,
    pub frozen: bool,
}

/// Outcome of [`RankMaterializer::snapshot_active`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub snapshotted: Vec<String>,
    pub skipped: usize,
    pub failed: Vec<String>,
}

pub struct RankMaterializer {
    live: Arc<dyn LiveScoreStore>,
    durable: Arc<dyn DurableStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    batch_size: usize,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl RankMaterializer {
    pub fn new(
        live: Arc<dyn LiveScoreStore>,
        durable: Arc<dyn DurableStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            live,
            durable,
            alerts,
            clock,
            retry: RetryPolicy::default(),
            batch_size: 1000,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn live(&self) -> &Arc<dyn LiveScoreStore> {
        &self.live
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    /// Persist the current live ranking.
    ///
    /// Fails with `Frozen` once the board is frozen or its final snapshot has
    /// been marked; only [`snapshot_final`](Self::snapshot_final) writes then.
    pub async fn snapshot(&self, leaderboard_id: &str) -> Result<SnapshotReport> {
        let result = self.write_periodic(leaderboard_id).await;
        self.alert_on_exhausted(AlertCode::SnapshotFailed, leaderboard_id, &result);
        result
    }

    async fn write_periodic(&self, leaderboard_id: &str) -> Result<SnapshotReport> {
        if self.live.is_frozen(leaderboard_id).await? {
            return Err(RankError::frozen(leaderboard_id));
        }
        self.write_snapshot(leaderboard_id, "periodic", false).await
    }

    /// Persist the final ranking and mark the leaderboard closed.
    ///
    /// The board should already be frozen. The closed mark is stored first, so
    /// a failure part way leaves the board closed and a repeated call rewrites
    /// the rows. The first `final_snapshot_at` is kept.
    pub async fn snapshot_final(&self, leaderboard_id: &str) -> Result<SnapshotReport> {
        let result = self.write_final(leaderboard_id).await;
        self.alert_on_exhausted(AlertCode::SnapshotFailed, leaderboard_id, &result);
        result
    }

    async fn write_final(&self, leaderboard_id: &str) -> Result<SnapshotReport> {
        let now = self.clock.now_millis();
        let durable = &self.durable;
        let marked = self
            .retry
            .run_observed(
                "mark_final_snapshot",
                self.retry_counter("mark_final_snapshot"),
                move || durable.mark_final_snapshot(leaderboard_id, now),
            )
            .await?;
        let mut report = self.write_snapshot(leaderboard_id, "final", true).await?;
        info!(leaderboard_id, rows = report.rows, final_snapshot_at = marked, "Final snapshot written");
        report.final_snapshot_at = Some(marked);
        Ok(report)
    }

    async fn write_snapshot(
        &self,
        leaderboard_id: &str,
        kind: &str,
        is_final: bool,
    ) -> Result<SnapshotReport> {
        let started = Instant::now();
        let live = &self.live;
        let durable = &self.durable;

        let entries = self
            .retry
            .run_observed("live_entries", self.retry_counter("live_entries"), move || {
                live.entries(leaderboard_id)
            })
            .await?;
        let rows = rank_entries(leaderboard_id, entries);

        for batch in rows.chunks(self.batch_size) {
            self.retry
                .run_observed(
                    "upsert_entries",
                    self.retry_counter("upsert_entries"),
                    move || durable.upsert_entries(leaderboard_id, batch, is_final),
                )
                .await?;
        }

        let reranked = self
            .retry
            .run_observed(
                "recompute_ranks",
                self.retry_counter("recompute_ranks"),
                move || durable.recompute_ranks(leaderboard_id),
            )
            .await?;

        let elapsed = started.elapsed();
        debug!(
            leaderboard_id,
            kind,
            rows = rows.len(),
            reranked,
            elapsed_ms = elapsed.as_millis() as u64,
            "Snapshot written"
        );
        self.record_snapshot(kind, rows.len(), elapsed.as_secs_f64());

        Ok(SnapshotReport {
            leaderboard_id: leaderboard_id.to_string(),
            rows: rows.len(),
            reranked,
            final_snapshot_at: None,
        })
    }

    /// Rebuild a live board from durable storage.
    ///
    /// With `include_entries = false` only the empty board is recreated, but
    /// its tie-breaker sequence still resumes after the durable rows. A
    /// leaderboard with a final snapshot comes back frozen.
    pub async fn restore(&self, leaderboard_id: &str, include_entries: bool) -> Result<RestoreReport> {
        let result = self.load_from_durable(leaderboard_id, include_entries).await;
        self.alert_on_exhausted(AlertCode::RestoreFailed, leaderboard_id, &result);
        self.record_restore(match &result {
            Ok(_) => "restored",
            Err(e) if e.is_not_found() => "not_found",
            Err(_) => "failed",
        });
        result
    }

    async fn load_from_durable(&self, leaderboard_id: &str, include_entries: bool) -> Result<RestoreReport> {
        let durable = &self.durable;
        let meta = self
            .retry
            .run_observed("get_leaderboard", self.retry_counter("get_leaderboard"), move || {
                durable.get_leaderboard(leaderboard_id)
            })
            .await?
            .ok_or_else(|| RankError::not_found(leaderboard_id))?;

        let rows = self
            .retry
            .run_observed("durable_entries", self.retry_counter("durable_entries"), move || {
                durable.entries(leaderboard_id)
            })
            .await?;
        let last_tie_breaker = rows
            .iter()
            .map(|row| row.tie_breaker.max(row.running_tie_breaker))
            .max()
            .unwrap_or(0);
        let entries: Vec<LiveEntry> = if include_entries {
            rows.iter().map(|row| row.to_live()).collect()
        } else {
            Vec::new()
        };

        let count = entries.len();
        let frozen = meta.is_closed();
        let live = &self.live;
        self.retry
            .run_observed("live_load", self.retry_counter("live_load"), move || {
                live.load(
                    leaderboard_id,
                    meta.point_mode,
                    entries.clone(),
                    last_tie_breaker,
                    frozen,
                )
            })
            .await?;

        info!(leaderboard_id, entries = count, frozen, "Live board restored");
        Ok(RestoreReport {
            leaderboard_id: leaderboard_id.to_string(),
            entries: count,
            frozen,
        })
    }

    /// Snapshot every leaderboard with an `Active` or `Ended` schedule item.
    ///
    /// Boards that are not loaded or already frozen are skipped. A failure on
    /// one leaderboard does not stop the others.
    pub async fn snapshot_active(&self, schedule: &ScheduleManager) -> Result<SweepReport> {
        let mut ids = BTreeSet::new();
        for state in [ScheduleState::Active, ScheduleState::Ended] {
            for item in schedule.list_by_state(state).await? {
                ids.insert(item.leaderboard_id);
            }
        }

        let mut report = SweepReport::default();
        for id in ids {
            match self.snapshot(&id).await {
                Ok(_) => report.snapshotted.push(id),
                Err(e) if e.is_not_found() => {
                    debug!(leaderboard_id = %id, "Board not loaded, snapshot skipped");
                    report.skipped += 1;
                }
                Err(RankError::Frozen { .. }) => {
                    debug!(leaderboard_id = %id, "Board closed, snapshot skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(leaderboard_id = %id, error = %e, "Periodic snapshot failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    fn alert_on_exhausted<T>(&self, code: AlertCode, leaderboard_id: &str, result: &Result<T>) {
        if let Err(e) = result {
            if e.is_transient() {
                self.alerts.raise(
                    Alert::new(code, leaderboard_id, e.to_string()).with_leaderboard(leaderboard_id),
                );
            }
        }
    }

    #[cfg(feature = "metrics")]
    fn retry_counter(&self, op: &'static str) -> impl FnMut(u32) + '_ {
        move |_| {
            if let Some(ref m) = self.metrics {
                m.storage_retries_total.with_label_values(&[op]).inc();
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn retry_counter(&self, _op: &'static str) -> impl FnMut(u32) + '_ {
        |_| {}
    }

    #[cfg(feature = "metrics")]
    fn record_snapshot(&self, kind: &str, rows: usize, duration_secs: f64) {
        if let Some(ref m) = self.metrics {
            m.record_snapshot(kind, rows, duration_secs);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_snapshot(&self, _kind: &str, _rows: usize, _duration_secs: f64) {}

    #[cfg(feature = "metrics")]
    fn record_restore(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.restores_total.with_label_values(&[outcome]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_restore(&self, _outcome: &str) {}
}
