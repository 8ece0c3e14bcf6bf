//! Score ingestion and live queries.

use crate::durable::DurableStore;
use crate::entry::{LeaderboardMeta, LiveEntry, PointMode, ScoreUpdate};
use crate::error::{RankError, Result};
use crate::live::LiveScoreStore;
use crate::materializer::RankMaterializer;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// One score event from a game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub leaderboard_id: String,
    pub user_id: String,
    pub score: i64,
    pub point_mode: PointMode,
}

/// What happened to a submitted score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Applied(ScoreUpdate),
    /// The leaderboard was frozen; the event was discarded.
    Dropped,
}

impl Submission {
    pub fn is_applied(&self) -> bool {
        matches!(self, Submission::Applied(_))
    }
}

pub struct ScoreService {
    live: Arc<dyn LiveScoreStore>,
    durable: Arc<dyn DurableStore>,
    materializer: Arc<RankMaterializer>,
    /// Point mode per leaderboard, learned from durable metadata.
    modes: DashMap<String, PointMode>,
    /// Serializes restores of the same board within this process.
    restoring: DashMap<String, Arc<Mutex<()>>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ScoreService {
    pub fn new(materializer: Arc<RankMaterializer>) -> Self {
        Self {
            live: materializer.live().clone(),
            durable: materializer.durable().clone(),
            materializer,
            modes: DashMap::new(),
            restoring: DashMap::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a leaderboard durably and open its live board.
    ///
    /// Reopening keeps the existing point mode and live entries.
    pub async fn open_leaderboard(&self, meta: &LeaderboardMeta) -> Result<()> {
        if let Some(existing) = self.durable.get_leaderboard(&meta.id).await? {
            if existing.point_mode != meta.point_mode {
                return Err(RankError::Config(format!(
                    "leaderboard {} already uses point mode {}",
                    meta.id,
                    existing.point_mode.as_str()
                )));
            }
        }
        self.durable.put_leaderboard(meta).await?;
        let created = self.live.open(&meta.id, meta.point_mode).await?;
        self.modes.insert(meta.id.clone(), meta.point_mode);
        info!(
            leaderboard_id = %meta.id,
            point_mode = meta.point_mode.as_str(),
            created,
            "Leaderboard opened"
        );
        Ok(())
    }

    /// Apply a score for a user.
    ///
    /// A board missing from the live store is restored from durable storage
    /// and the upsert retried once. Scores for a frozen board are dropped.
    pub async fn submit(&self, leaderboard_id: &str, user_id: &str, score: i64) -> Result<Submission> {
        match self.live.upsert(leaderboard_id, user_id, score).await {
            Err(e) if e.is_not_found() => {
                self.restore_missing(leaderboard_id).await?;
                self.settle(leaderboard_id, user_id, self.live.upsert(leaderboard_id, user_id, score).await)
            }
            result => self.settle(leaderboard_id, user_id, result),
        }
    }

    /// Apply a [`ScoreEvent`].
    ///
    /// The point mode of a leaderboard is fixed when it is opened; an event
    /// carrying a different mode is applied with the leaderboard's own.
    pub async fn submit_event(&self, event: &ScoreEvent) -> Result<Submission> {
        if let Some(mode) = self.point_mode(&event.leaderboard_id).await? {
            if mode != event.point_mode {
                warn!(
                    leaderboard_id = %event.leaderboard_id,
                    user_id = %event.user_id,
                    expected = mode.as_str(),
                    got = event.point_mode.as_str(),
                    "Point mode mismatch, using leaderboard mode"
                );
            }
        }
        self.submit(&event.leaderboard_id, &event.user_id, event.score)
            .await
    }

    pub async fn rank_of(&self, leaderboard_id: &str, user_id: &str) -> Result<u64> {
        self.live.rank_of(leaderboard_id, user_id).await
    }

    pub async fn top_n(&self, leaderboard_id: &str, n: usize) -> Result<Vec<LiveEntry>> {
        self.live.top_n(leaderboard_id, n).await
    }

    async fn point_mode(&self, leaderboard_id: &str) -> Result<Option<PointMode>> {
        if let Some(mode) = self.modes.get(leaderboard_id) {
            return Ok(Some(*mode));
        }
        let mode = self
            .durable
            .get_leaderboard(leaderboard_id)
            .await?
            .map(|meta| meta.point_mode);
        if let Some(mode) = mode {
            self.modes.insert(leaderboard_id.to_string(), mode);
        }
        Ok(mode)
    }

    async fn restore_missing(&self, leaderboard_id: &str) -> Result<()> {
        let lock = self
            .restoring
            .entry(leaderboard_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;
        // Another submit may have restored it while we waited.
        if self.live.contains(leaderboard_id).await? {
            return Ok(());
        }
        info!(leaderboard_id, "Live board missing, restoring");
        self.materializer.restore(leaderboard_id, true).await?;
        Ok(())
    }

    fn settle(
        &self,
        leaderboard_id: &str,
        user_id: &str,
        result: Result<ScoreUpdate>,
    ) -> Result<Submission> {
        match result {
            Ok(update) => {
                debug!(leaderboard_id, user_id, points = update.points, changed = update.changed, "Score applied");
                self.record_upsert(if update.changed { "applied" } else { "unchanged" });
                Ok(Submission::Applied(update))
            }
            Err(RankError::Frozen { .. }) => {
                warn!(leaderboard_id, user_id, "Leaderboard frozen, score dropped");
                self.record_upsert("dropped");
                Ok(Submission::Dropped)
            }
            Err(e) => {
                self.record_upsert("failed");
                Err(e)
            }
        }
    }

    #[cfg(feature = "metrics")]
    fn record_upsert(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.record_upsert(outcome);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_upsert(&self, _outcome: &str) {}
}
