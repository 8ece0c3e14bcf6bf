//! Finalization of ended schedule items.
//!
//! Each poll ends items past their end time, then for every item past its
//! grace period takes the `Finalizing` claim and runs freeze, final snapshot,
//! evict and payout before committing `Finalized`. Every step can be repeated,
//! so a poll resuming a released or expired claim converges on the same durable
//! result. Award ids are deterministic, so a payout repeated after a crash is
//! absorbed by idempotent processors.

use crate::alerts::{Alert, AlertCode, AlertSink};
use crate::awards::{compute_awards, PrizeDispatcher, PrizeTable};
use crate::error::{RankError, Result};
use crate::materializer::RankMaterializer;
use crate::schedule::{ClaimOutcome, FinaliseOutcome, ScheduleItem, ScheduleManager};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Outcome of one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Items moved `Active -> Ended` by this poll.
    pub ended: usize,
    /// Items this poll finalized.
    pub finalized: Vec<String>,
    /// Items another poll had already finalized.
    pub already_finalized: Vec<String>,
    /// Items another poller is finalizing right now.
    pub in_progress: Vec<String>,
    /// `(schedule_item_id, error)` for items that failed.
    pub failed: Vec<(String, String)>,
    pub awards_published: usize,
    pub expired: usize,
}

/// Outcome of [`Finalizer::finalize_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// This call committed `Finalized` after publishing `published` awards.
    Finalized { published: usize },
    AlreadyFinalized,
    /// Another poller holds the claim.
    InProgress,
}

pub struct Finalizer {
    schedule: Arc<ScheduleManager>,
    materializer: Arc<RankMaterializer>,
    prizes: Arc<dyn PrizeTable>,
    dispatcher: Arc<PrizeDispatcher>,
    alerts: Arc<dyn AlertSink>,
    poll_interval: Duration,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl Finalizer {
    pub fn new(
        schedule: Arc<ScheduleManager>,
        materializer: Arc<RankMaterializer>,
        prizes: Arc<dyn PrizeTable>,
        dispatcher: Arc<PrizeDispatcher>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            schedule,
            materializer,
            prizes,
            dispatcher,
            alerts,
            poll_interval: Duration::from_secs(60),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One poll over the schedule.
    pub async fn run_once(&self) -> Result<FinalizeReport> {
        let mut report = FinalizeReport {
            ended: self.schedule.end_due().await?.len(),
            ..Default::default()
        };

        for item in self.schedule.get_ended_items(false).await? {
            match self.finalize_item(&item).await {
                Ok(ItemOutcome::Finalized { published }) => {
                    self.record_outcome("finalized");
                    report.awards_published += published;
                    report.finalized.push(item.id);
                }
                Ok(ItemOutcome::AlreadyFinalized) => {
                    self.record_outcome("already_finalized");
                    report.already_finalized.push(item.id);
                }
                Ok(ItemOutcome::InProgress) => {
                    self.record_outcome("in_progress");
                    report.in_progress.push(item.id);
                }
                Err(e) => {
                    error!(
                        schedule_item_id = %item.id,
                        leaderboard_id = %item.leaderboard_id,
                        error = %e,
                        "Finalization failed"
                    );
                    self.alerts.raise(
                        Alert::new(AlertCode::FinalizeFailed, &item.id, e.to_string())
                            .with_leaderboard(&item.leaderboard_id),
                    );
                    self.record_outcome("failed");
                    report.failed.push((item.id, e.to_string()));
                }
            }
        }

        for item in self.schedule.expire_due().await? {
            report.expired += 1;
            if let Err(e) = self.materializer.live().evict(&item.leaderboard_id).await {
                warn!(leaderboard_id = %item.leaderboard_id, error = %e, "Evict on expiry failed");
            }
        }

        if !report.finalized.is_empty() || !report.failed.is_empty() {
            info!(
                ended = report.ended,
                finalized = report.finalized.len(),
                already_finalized = report.already_finalized.len(),
                failed = report.failed.len(),
                awards = report.awards_published,
                expired = report.expired,
                "Finalize poll complete"
            );
        }
        Ok(report)
    }

    /// Finalize one item under its `Finalizing` claim.
    ///
    /// On error the claim is released, so the next poll retries every step,
    /// payout included.
    pub async fn finalize_item(&self, item: &ScheduleItem) -> Result<ItemOutcome> {
        match self.schedule.claim_item(&item.id).await? {
            ClaimOutcome::Claimed { .. } => {}
            ClaimOutcome::Busy => return Ok(ItemOutcome::InProgress),
            ClaimOutcome::AlreadyFinalized => return Ok(ItemOutcome::AlreadyFinalized),
        }

        match self.finalize_claimed(item).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release) = self.schedule.release_item(&item.id).await {
                    warn!(
                        schedule_item_id = %item.id,
                        error = %release,
                        "Claim release failed, waiting for the lease to expire"
                    );
                }
                Err(e)
            }
        }
    }

    async fn finalize_claimed(&self, item: &ScheduleItem) -> Result<ItemOutcome> {
        self.close_live(&item.leaderboard_id).await?;

        let published = if item.auto_payout {
            self.payout(item).await?
        } else {
            0
        };

        Ok(match self.schedule.finalise_item(&item.id).await? {
            FinaliseOutcome::Finalized => ItemOutcome::Finalized { published },
            FinaliseOutcome::AlreadyFinalized => ItemOutcome::AlreadyFinalized,
        })
    }

    /// Freeze, final snapshot and evict.
    async fn close_live(&self, leaderboard_id: &str) -> Result<()> {
        let live = self.materializer.live();

        match live.freeze(leaderboard_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                if self.closed_durably(leaderboard_id).await? {
                    debug!(leaderboard_id, "Final snapshot already persisted");
                    return Ok(());
                }
                match self.materializer.restore(leaderboard_id, true).await {
                    Ok(_) => live.freeze(leaderboard_id).await?,
                    Err(e) if e.is_not_found() => {
                        warn!(leaderboard_id, "No live or durable leaderboard, nothing to close");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        match self.materializer.snapshot_final(leaderboard_id).await {
            Ok(_) => {}
            // A concurrent poll evicted the board after its own final snapshot.
            Err(e) if e.is_not_found() && self.closed_durably(leaderboard_id).await? => {}
            Err(e) => return Err(e),
        }

        live.evict(leaderboard_id).await?;
        Ok(())
    }

    async fn closed_durably(&self, leaderboard_id: &str) -> Result<bool> {
        Ok(self
            .materializer
            .durable()
            .get_leaderboard(leaderboard_id)
            .await?
            .map(|meta| meta.is_closed())
            .unwrap_or(false))
    }

    async fn payout(&self, item: &ScheduleItem) -> Result<usize> {
        let entries = self
            .materializer
            .durable()
            .entries(&item.leaderboard_id)
            .await?;
        let bands = self.prizes.prize_bands(&item.leaderboard_id).await?;
        let awards = compute_awards(item, &entries, &bands);
        let report = self.dispatcher.dispatch(&awards).await;
        info!(
            schedule_item_id = %item.id,
            leaderboard_id = %item.leaderboard_id,
            awards = awards.len(),
            published = report.published,
            failed = report.failed.len(),
            "Payout dispatched"
        );
        if !report.failed.is_empty() {
            return Err(RankError::Channel(format!(
                "{} of {} awards not published",
                report.failed.len(),
                awards.len()
            )));
        }
        Ok(report.published)
    }

    /// Poll every `poll_interval` until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.poll_interval.as_secs(), "Finalizer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Finalize poll failed");
                    }
                }
            }
        }
        info!("Finalizer stopped");
    }

    #[cfg(feature = "metrics")]
    fn record_outcome(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.finalize_total.with_label_values(&[outcome]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_outcome(&self, _outcome: &str) {}
}
