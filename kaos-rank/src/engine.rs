//! Wiring for a complete ranking engine.
//!
//! [`EngineBuilder`] takes every backend as an injected dependency and falls
//! back to the in-memory implementation for anything not supplied.

use crate::alerts::{AlertSink, LogAlerts};
use crate::awards::{
    AwardChannel, AwardWorker, LoggingProcessor, MemoryAwardChannel, MemoryPrizeTable,
    PrizeDispatcher, PrizeTable, ProcessorRegistry,
};
use crate::clock::{Clock, SystemClock};
use crate::config::RankConfig;
use crate::durable::{DurableStore, MemoryDurableStore};
use crate::error::Result;
use crate::finalizer::Finalizer;
use crate::live::{LiveScoreStore, MemoryLiveStore};
use crate::materializer::RankMaterializer;
use crate::schedule::{MemoryScheduleStore, ScheduleManager, ScheduleStore};
use crate::service::ScoreService;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

#[derive(Default)]
pub struct EngineBuilder {
    config: RankConfig,
    live: Option<Arc<dyn LiveScoreStore>>,
    durable: Option<Arc<dyn DurableStore>>,
    schedule_store: Option<Arc<dyn ScheduleStore>>,
    prizes: Option<Arc<dyn PrizeTable>>,
    channel: Option<Arc<dyn AwardChannel>>,
    clock: Option<Arc<dyn Clock>>,
    alerts: Option<Arc<dyn AlertSink>>,
    registry: Option<ProcessorRegistry>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RankConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_live_store(mut self, live: Arc<dyn LiveScoreStore>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_durable_store(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.schedule_store = Some(store);
        self
    }

    pub fn with_prize_table(mut self, prizes: Arc<dyn PrizeTable>) -> Self {
        self.prizes = Some(prizes);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn AwardChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Processors for the award worker. Defaults to [`LoggingProcessor`] for every kind.
    pub fn with_processors(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = self.config;

        let live = self.live.unwrap_or_else(|| Arc::new(MemoryLiveStore::new()));
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(MemoryDurableStore::new()));
        let schedule_store = self
            .schedule_store
            .unwrap_or_else(|| Arc::new(MemoryScheduleStore::new()));
        let prizes = self
            .prizes
            .unwrap_or_else(|| Arc::new(MemoryPrizeTable::new()));
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(MemoryAwardChannel::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = self
            .registry
            .unwrap_or_else(|| ProcessorRegistry::new().with_all(Arc::new(LoggingProcessor)));

        #[cfg(feature = "metrics")]
        let metrics = self.metrics;

        let alerts = match self.alerts {
            Some(alerts) => alerts,
            None => {
                let alerts = LogAlerts::new();
                #[cfg(feature = "metrics")]
                let alerts = match &metrics {
                    Some(m) => alerts.with_metrics(m.clone()),
                    None => alerts,
                };
                Arc::new(alerts) as Arc<dyn AlertSink>
            }
        };

        let materializer = RankMaterializer::new(live.clone(), durable, alerts.clone(), clock.clone())
            .with_retry(config.retry.clone())
            .with_batch_size(config.snapshot_batch_size);
        let schedule = ScheduleManager::new(schedule_store, clock, &config);
        let dispatcher = PrizeDispatcher::new(channel.clone(), alerts.clone());
        let worker = AwardWorker::new(channel.clone(), registry, alerts.clone())
            .with_max_attempts(config.award_max_attempts);

        #[cfg(feature = "metrics")]
        let (materializer, schedule, dispatcher, worker) = match &metrics {
            Some(m) => (
                materializer.with_metrics(m.clone()),
                schedule.with_metrics(m.clone()),
                dispatcher.with_metrics(m.clone()),
                worker.with_metrics(m.clone()),
            ),
            None => (materializer, schedule, dispatcher, worker),
        };

        let materializer = Arc::new(materializer);
        let schedule = Arc::new(schedule);
        let dispatcher = Arc::new(dispatcher);

        let score = ScoreService::new(materializer.clone());
        #[cfg(feature = "metrics")]
        let score = match &metrics {
            Some(m) => score.with_metrics(m.clone()),
            None => score,
        };

        let finalizer = Finalizer::new(
            schedule.clone(),
            materializer.clone(),
            prizes,
            dispatcher.clone(),
            alerts.clone(),
        )
        .with_poll_interval(config.poll_interval());
        #[cfg(feature = "metrics")]
        let finalizer = match &metrics {
            Some(m) => finalizer.with_metrics(m.clone()),
            None => finalizer,
        };

        Ok(Engine {
            live,
            score: Arc::new(score),
            materializer,
            schedule,
            finalizer: Arc::new(finalizer),
            dispatcher,
            worker: Arc::new(worker),
            channel,
            alerts,
            config,
            #[cfg(feature = "metrics")]
            metrics,
        })
    }
}

/// A wired engine. Cheap accessors hand out the shared components.
pub struct Engine {
    live: Arc<dyn LiveScoreStore>,
    score: Arc<ScoreService>,
    materializer: Arc<RankMaterializer>,
    schedule: Arc<ScheduleManager>,
    finalizer: Arc<Finalizer>,
    dispatcher: Arc<PrizeDispatcher>,
    worker: Arc<AwardWorker>,
    channel: Arc<dyn AwardChannel>,
    alerts: Arc<dyn AlertSink>,
    config: RankConfig,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn score(&self) -> &Arc<ScoreService> {
        &self.score
    }

    pub fn materializer(&self) -> &Arc<RankMaterializer> {
        &self.materializer
    }

    pub fn schedule(&self) -> &Arc<ScheduleManager> {
        &self.schedule
    }

    pub fn finalizer(&self) -> &Arc<Finalizer> {
        &self.finalizer
    }

    pub fn dispatcher(&self) -> &Arc<PrizeDispatcher> {
        &self.dispatcher
    }

    pub fn worker(&self) -> &Arc<AwardWorker> {
        &self.worker
    }

    pub fn channel(&self) -> &Arc<dyn AwardChannel> {
        &self.channel
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn config(&self) -> &RankConfig {
        &self.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// One pass of the snapshot loop: activate due items, load their boards,
    /// then snapshot every running leaderboard.
    pub async fn snapshot_tick(&self) -> Result<()> {
        for item in self.schedule.activate_due().await? {
            if self.live.contains(&item.leaderboard_id).await? {
                continue;
            }
            match self.materializer.restore(&item.leaderboard_id, true).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => warn!(
                    schedule_item_id = %item.id,
                    leaderboard_id = %item.leaderboard_id,
                    "Activated item has no leaderboard"
                ),
                Err(e) => return Err(e),
            }
        }

        let report = self.materializer.snapshot_active(&self.schedule).await?;
        debug!(
            snapshotted = report.snapshotted.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            "Snapshot sweep complete"
        );
        Ok(())
    }

    async fn snapshot_loop<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.snapshot_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot_tick().await {
                        warn!(error = %e, "Snapshot sweep failed");
                    }
                }
            }
        }
    }

    /// Run the finalize poll, the snapshot sweep and the award worker until
    /// `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (tx, rx) = watch::channel(false);
        let stopped = |mut rx: watch::Receiver<bool>| async move {
            let _ = rx.wait_for(|stop| *stop).await;
        };

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            snapshot_interval_secs = self.config.snapshot_interval_secs,
            "Engine started"
        );
        tokio::join!(
            async move {
                shutdown.await;
                let _ = tx.send(true);
            },
            self.finalizer.clone().run(stopped(rx.clone())),
            self.snapshot_loop(stopped(rx.clone())),
            self.worker.run(stopped(rx)),
        );
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awards::{Prize, RankBand};
    use crate::clock::ManualClock;
    use crate::entry::{LeaderboardMeta, PointMode};
    use std::time::Duration;

    const MINUTE: i64 = 60_000;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let engine = Engine::builder().build().unwrap();
        assert_eq!(engine.config(), &RankConfig::default());
    }

    #[tokio::test]
    async fn test_build_rejects_bad_config() {
        let config = RankConfig::default().with_poll_interval(0);
        assert!(Engine::builder().with_config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let clock = Arc::new(ManualClock::new(0));
        let prizes = Arc::new(MemoryPrizeTable::new());
        prizes.set(
            "weekly",
            vec![RankBand::new(
                1,
                1,
                vec![Prize::Upgrade {
                    level: 1,
                    duration_secs: 3600,
                }],
            )],
        );
        let channel = Arc::new(MemoryAwardChannel::new());
        let engine = Engine::builder()
            .with_clock(clock.clone())
            .with_prize_table(prizes)
            .with_channel(channel.clone())
            .build()
            .unwrap();

        engine
            .score()
            .open_leaderboard(&LeaderboardMeta::new("weekly", PointMode::Highest, 0))
            .await
            .unwrap();
        let item = engine
            .schedule()
            .create_item("weekly", 0, 10 * MINUTE, true)
            .await
            .unwrap();
        engine.snapshot_tick().await.unwrap();

        engine.score().submit("weekly", "a", 10).await.unwrap();
        engine.score().submit("weekly", "b", 12).await.unwrap();

        clock.set(30 * MINUTE);
        let report = engine.finalizer().run_once().await.unwrap();
        assert_eq!(report.finalized, vec![item.id]);
        assert_eq!(report.awards_published, 1);

        let envelope = channel.try_receive().await.unwrap();
        let handled = engine.worker().handle(envelope).await.unwrap();
        assert_eq!(handled.applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let engine = Engine::builder().build().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            engine.run(tokio::time::sleep(Duration::from_secs(1))),
        )
        .await
        .unwrap();
    }
}
