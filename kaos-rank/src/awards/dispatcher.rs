//! Award publication and the prize worker.

use super::channel::{AwardChannel, AwardEnvelope};
use super::processor::{PrizeContext, ProcessorRegistry};
use super::{Prize, PrizeAward, PrizeKind};
use crate::alerts::{Alert, AlertCode, AlertSink};
use crate::error::{RankError, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    /// Award ids that could not be published.
    pub failed: Vec<String>,
}

/// Publishes one message per award.
pub struct PrizeDispatcher {
    channel: Arc<dyn AwardChannel>,
    alerts: Arc<dyn AlertSink>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl PrizeDispatcher {
    pub fn new(channel: Arc<dyn AwardChannel>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            channel,
            alerts,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish every award. A failed publish is alerted and does not stop the rest.
    pub async fn dispatch(&self, awards: &[PrizeAward]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for award in awards {
            let result = match serde_json::to_value(award) {
                Ok(body) => self.channel.publish(AwardEnvelope::new(body)).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    debug!(award_id = %award.award_id, user_id = %award.user_id, rank = award.rank, "Award published");
                    report.published += 1;
                }
                Err(e) => {
                    error!(award_id = %award.award_id, error = %e, "Award publish failed");
                    self.alerts.raise(
                        Alert::new(AlertCode::PublishFailed, &award.award_id, e.to_string())
                            .with_leaderboard(&award.leaderboard_id),
                    );
                    report.failed.push(award.award_id.clone());
                }
            }
        }
        self.record_published(report.published);
        report
    }

    #[cfg(feature = "metrics")]
    fn record_published(&self, count: usize) {
        if let Some(ref m) = self.metrics {
            m.awards_published_total.inc_by(count as u64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_published(&self, _count: usize) {}
}

/// Outcome of handling one envelope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandleReport {
    pub applied: usize,
    /// Prizes that failed permanently, including unsupported types.
    pub rejected: usize,
    /// Prizes that failed transiently.
    pub failed: usize,
    /// The envelope was published again for another attempt.
    pub redelivered: bool,
}

/// Consumes award messages and applies each prize.
pub struct AwardWorker {
    channel: Arc<dyn AwardChannel>,
    registry: ProcessorRegistry,
    alerts: Arc<dyn AlertSink>,
    max_attempts: u32,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

/// A prize as decoded from the wire, before its type is known to be supported.
enum Decoded {
    Known(Prize),
    Invalid { tag: String, error: serde_json::Error },
}

fn decode_prizes(body: &serde_json::Value) -> Result<(PrizeAward, Vec<Decoded>)> {
    let raw = body
        .get("prizes")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    // Decode the header without the prizes so one unknown tag cannot reject the award.
    let mut header = body.clone();
    if let Some(obj) = header.as_object_mut() {
        obj.insert("prizes".into(), serde_json::Value::Array(Vec::new()));
    }
    let award: PrizeAward = serde_json::from_value(header)?;

    let prizes = raw
        .into_iter()
        .map(|value| {
            let tag = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>")
                .to_string();
            match serde_json::from_value::<Prize>(value) {
                Ok(prize) => Decoded::Known(prize),
                Err(error) => Decoded::Invalid { tag, error },
            }
        })
        .collect();
    Ok((award, prizes))
}

impl AwardWorker {
    pub fn new(
        channel: Arc<dyn AwardChannel>,
        registry: ProcessorRegistry,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            channel,
            registry,
            alerts,
            max_attempts: 5,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply every prize in one envelope.
    ///
    /// Each prize is independent. Unsupported types are rejected and alerted.
    /// If any prize failed transiently the whole envelope is published again,
    /// relying on idempotent processors to skip prizes already applied.
    pub async fn handle(&self, envelope: AwardEnvelope) -> Result<HandleReport> {
        let (award, prizes) = match decode_prizes(&envelope.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(message_id = %envelope.message_id, error = %e, "Malformed award message");
                self.alerts.raise(Alert::new(
                    AlertCode::PrizeFailed,
                    &envelope.message_id,
                    format!("malformed award message: {}", e),
                ));
                return Err(e);
            }
        };

        let mut report = HandleReport::default();
        for (prize_index, decoded) in prizes.into_iter().enumerate() {
            let ctx = PrizeContext {
                award_id: award.award_id.clone(),
                leaderboard_id: award.leaderboard_id.clone(),
                user_id: award.user_id.clone(),
                rank: award.rank,
                prize_index,
            };
            let (kind, result) = match decoded {
                Decoded::Known(prize) => {
                    let kind = prize.kind().as_str().to_string();
                    let result = match self.registry.get(prize.kind()) {
                        Ok(processor) => processor.process(&ctx, &prize).await,
                        Err(e) => Err(e),
                    };
                    (kind, result)
                }
                // A known tag with bad fields is malformed, not unsupported.
                Decoded::Invalid { tag, error } => match PrizeKind::parse(&tag) {
                    Some(_) => (tag, Err(RankError::Serde(error))),
                    None => {
                        let err = RankError::unsupported_prize_type(&tag);
                        (tag, Err(err))
                    }
                },
            };

            match result {
                Ok(()) => {
                    report.applied += 1;
                    self.record_prize(&kind, "applied");
                }
                Err(e @ RankError::UnsupportedPrizeType { .. }) => {
                    error!(award_id = %ctx.award_id, prize_index, kind = %kind, "Unsupported prize type");
                    self.alerts.raise(
                        Alert::new(AlertCode::UnsupportedPrizeType, ctx.idempotency_key(), e.to_string())
                            .with_leaderboard(&ctx.leaderboard_id),
                    );
                    report.rejected += 1;
                    self.record_prize(&kind, "unsupported");
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        award_id = %ctx.award_id,
                        prize_index,
                        attempt = envelope.attempt,
                        error = %e,
                        "Prize failed, will retry"
                    );
                    report.failed += 1;
                    self.record_prize(&kind, "retry");
                }
                Err(e) => {
                    error!(award_id = %ctx.award_id, prize_index, error = %e, "Prize failed permanently");
                    self.alerts.raise(
                        Alert::new(AlertCode::PrizeFailed, ctx.idempotency_key(), e.to_string())
                            .with_leaderboard(&ctx.leaderboard_id),
                    );
                    report.rejected += 1;
                    self.record_prize(&kind, "failed");
                }
            }
        }

        if report.failed > 0 {
            if envelope.attempt < self.max_attempts {
                self.channel.publish(envelope.retry()).await?;
                report.redelivered = true;
            } else {
                error!(
                    award_id = %award.award_id,
                    attempts = envelope.attempt,
                    failed = report.failed,
                    "Award retries exhausted"
                );
                self.alerts.raise(
                    Alert::new(
                        AlertCode::PrizeFailed,
                        &award.award_id,
                        format!("{} prize(s) failed after {} attempts", report.failed, envelope.attempt),
                    )
                    .with_leaderboard(&award.leaderboard_id),
                );
            }
        }

        Ok(report)
    }

    /// Consume messages until `shutdown` resolves or the channel closes.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Award worker started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = self.channel.receive() => match next {
                    Some(envelope) => {
                        if let Err(e) = self.handle(envelope).await {
                            warn!(error = %e, "Award message not handled");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Award worker stopped");
    }

    #[cfg(feature = "metrics")]
    fn record_prize(&self, kind: &str, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.record_prize(kind, outcome);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_prize(&self, _kind: &str, _outcome: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlerts;
    use crate::awards::{Idempotent, MemoryAwardChannel, PrizeProcessor};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, usize)>>,
        fail_times: Mutex<usize>,
    }

    #[async_trait]
    impl PrizeProcessor for Recorder {
        async fn process(&self, ctx: &PrizeContext, _prize: &Prize) -> Result<()> {
            {
                let mut fail = self.fail_times.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(RankError::Processor("wallet unavailable".into()));
                }
            }
            self.seen.lock().push((ctx.award_id.clone(), ctx.prize_index));
            Ok(())
        }
    }

    fn award(prizes: serde_json::Value) -> AwardEnvelope {
        AwardEnvelope::new(serde_json::json!({
            "award_id": "item-1:alice",
            "schedule_item_id": "item-1",
            "leaderboard_id": "weekly",
            "user_id": "alice",
            "rank": 1,
            "prizes": prizes,
        }))
    }

    fn setup(recorder: Arc<Recorder>) -> (Arc<MemoryAwardChannel>, Arc<MemoryAlerts>, AwardWorker) {
        let channel = Arc::new(MemoryAwardChannel::new());
        let alerts = Arc::new(MemoryAlerts::new());
        let registry = ProcessorRegistry::new()
            .with(PrizeKind::Cash, recorder.clone())
            .with(PrizeKind::Upgrade, recorder);
        let worker = AwardWorker::new(channel.clone(), registry, alerts.clone()).with_max_attempts(2);
        (channel, alerts, worker)
    }

    #[tokio::test]
    async fn test_unknown_and_unregistered_types_are_isolated() {
        let recorder = Arc::new(Recorder::default());
        let (_channel, alerts, worker) = setup(recorder.clone());
        let envelope = award(serde_json::json!([
            {"type": "cash", "amount": 100, "currency_code": "USD"},
            {"type": "voucher", "code": "X"},
            {"type": "tangible", "name": "Mug", "short_name": "Mug"},
            {"type": "upgrade", "level": 1, "duration_secs": 60},
        ]));

        let report = worker.handle(envelope).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.rejected, 2);
        assert!(!report.redelivered);
        assert_eq!(alerts.count(AlertCode::UnsupportedPrizeType), 2);
        assert_eq!(
            *recorder.seen.lock(),
            vec![("item-1:alice".to_string(), 0), ("item-1:alice".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_redelivers_then_alerts() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_times.lock() = 10;
        let (channel, alerts, worker) = setup(recorder);

        let first = worker
            .handle(award(serde_json::json!([{"type": "cash", "amount": 1, "currency_code": "USD"}])))
            .await
            .unwrap();
        assert!(first.redelivered);

        let again = channel.try_receive().await.unwrap();
        assert_eq!(again.attempt, 2);
        let second = worker.handle(again).await.unwrap();
        assert!(!second.redelivered);
        assert_eq!(alerts.count(AlertCode::PrizeFailed), 1);
        assert!(channel.try_receive().await.is_none());
    }

    #[tokio::test]
    async fn test_redelivery_skips_applied_prizes() {
        let flaky = Arc::new(Recorder::default());
        *flaky.fail_times.lock() = 1;
        let channel = Arc::new(MemoryAwardChannel::new());
        let alerts = Arc::new(MemoryAlerts::new());
        let cash = Arc::new(Idempotent::new(Recorder::default()));
        let registry = ProcessorRegistry::new()
            .with(PrizeKind::Cash, cash.clone())
            .with(PrizeKind::Upgrade, flaky.clone());
        let worker = AwardWorker::new(channel.clone(), registry, alerts);

        let envelope = award(serde_json::json!([
            {"type": "cash", "amount": 1, "currency_code": "USD"},
            {"type": "upgrade", "level": 1, "duration_secs": 60},
        ]));
        assert!(worker.handle(envelope).await.unwrap().redelivered);
        let retry = channel.try_receive().await.unwrap();
        let report = worker.handle(retry).await.unwrap();
        assert_eq!(report.applied, 2);

        assert_eq!(cash.inner().seen.lock().len(), 1);
        assert_eq!(flaky.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_each_award() {
        let channel = Arc::new(MemoryAwardChannel::new());
        let dispatcher = PrizeDispatcher::new(channel.clone(), Arc::new(MemoryAlerts::new()));
        let awards: Vec<PrizeAward> = ["a", "b"]
            .iter()
            .map(|user| PrizeAward {
                award_id: PrizeAward::award_id("item", user),
                schedule_item_id: "item".into(),
                leaderboard_id: "lb".into(),
                user_id: user.to_string(),
                rank: 1,
                prizes: vec![],
            })
            .collect();

        let report = dispatcher.dispatch(&awards).await;
        assert_eq!(report.published, 2);
        assert_eq!(channel.pending().await, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_channel, _alerts, worker) = setup(Arc::new(Recorder::default()));
        worker.run(async {}).await;
    }
}
