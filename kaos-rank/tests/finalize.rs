//! Finalization, payout and fault handling end to end.
//!
//! Run: cargo test --test finalize

use kaos_rank::{
    AlertCode, DurableStore, Engine, FinaliseOutcome, Idempotent, LeaderboardMeta,
    LiveScoreStore, LoggingProcessor, ManualClock, MemoryAlerts, MemoryAwardChannel, MemoryDurableStore,
    MemoryLiveStore, MemoryPrizeTable, PointMode, Prize, PrizeKind, ProcessorRegistry, RankBand,
    RankConfig, RankMaterializer, RetryPolicy, ScheduleState,
};
use kaos_test_support::chaos::FaultPlan;
use kaos_test_support::{ChaosStore, DuplicatingChannel, RankVerifier, RecordingProcessor};
use std::sync::Arc;

const MINUTE: i64 = 60_000;

fn prize_table() -> Arc<MemoryPrizeTable> {
    let prizes = Arc::new(MemoryPrizeTable::new());
    prizes.set(
        "weekly",
        vec![
            RankBand::new(
                1,
                1,
                vec![
                    Prize::Cash {
                        amount: 10_000,
                        currency_code: "USD".into(),
                    },
                    Prize::Upgrade {
                        level: 3,
                        duration_secs: 7 * 86_400,
                    },
                ],
            ),
            RankBand::new(
                2,
                3,
                vec![Prize::Tangible {
                    name: "Team jersey".into(),
                    short_name: "Jersey".into(),
                    image_url: None,
                    cash_alternative_amount: Some(2_500),
                }],
            ),
        ],
    );
    prizes
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2.0,
    }
}

/// Opens "weekly", schedules one item over `[0, 10min)` and plays some scores.
async fn play_week(engine: &Engine) -> String {
    engine
        .score()
        .open_leaderboard(&LeaderboardMeta::new("weekly", PointMode::Cumulative, 0))
        .await
        .unwrap();
    let item = engine
        .schedule()
        .create_item("weekly", 0, 10 * MINUTE, true)
        .await
        .unwrap();
    engine.snapshot_tick().await.unwrap();

    for (user, score) in [("ann", 40), ("bo", 25), ("cy", 60), ("di", 10), ("ann", 30)] {
        engine.score().submit("weekly", user, score).await.unwrap();
    }
    item.id
}

#[tokio::test]
async fn test_finalize_twice_dispatches_once() {
    let clock = Arc::new(ManualClock::new(0));
    let channel = Arc::new(MemoryAwardChannel::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_channel(channel.clone())
        .with_durable_store(durable.clone())
        .with_prize_table(prize_table())
        .build()
        .unwrap();
    let item_id = play_week(&engine).await;

    clock.set(30 * MINUTE);
    let (a, b) = tokio::join!(
        engine.finalizer().run_once(),
        engine.finalizer().run_once()
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.awards_published + b.awards_published, 3);
    assert_eq!(a.finalized.len() + b.finalized.len(), 1);
    let snapshot = durable.entries("weekly").await.unwrap();

    let again = engine.finalizer().run_once().await.unwrap();
    assert!(again.finalized.is_empty());
    assert_eq!(again.awards_published, 0);
    assert_eq!(durable.entries("weekly").await.unwrap(), snapshot);
    assert_eq!(channel.pending().await, 3);

    let item = engine.schedule().get(&item_id).await.unwrap();
    assert_eq!(item.state, ScheduleState::Finalized);
    let mut verifier = RankVerifier::new();
    verifier.check_rows(&snapshot).assert_ok();
    assert_eq!(snapshot[0].user_id, "ann");
    assert_eq!(snapshot[0].points, 70);
}

#[tokio::test]
async fn test_late_scores_after_finalize_are_dropped() {
    let clock = Arc::new(ManualClock::new(0));
    let durable = Arc::new(MemoryDurableStore::new());
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_durable_store(durable.clone())
        .build()
        .unwrap();
    play_week(&engine).await;

    clock.set(30 * MINUTE);
    engine.finalizer().run_once().await.unwrap();

    // The board is evicted; restoring a closed leaderboard brings it back frozen.
    let submission = engine.score().submit("weekly", "di", 1_000).await.unwrap();
    assert!(!submission.is_applied());
    let rows = durable.entries("weekly").await.unwrap();
    assert_eq!(rows.iter().find(|r| r.user_id == "di").unwrap().points, 10);
}

#[tokio::test]
async fn test_duplicate_delivery_pays_once() {
    let clock = Arc::new(ManualClock::new(0));
    let channel = Arc::new(DuplicatingChannel::always(MemoryAwardChannel::new()));
    let processor = Arc::new(Idempotent::new(RecordingProcessor::new()));
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_channel(channel.clone())
        .with_prize_table(prize_table())
        .with_processors(ProcessorRegistry::new().with_all(processor.clone()))
        .build()
        .unwrap();
    play_week(&engine).await;

    clock.set(30 * MINUTE);
    engine.finalizer().run_once().await.unwrap();
    assert_eq!(channel.duplicated(), 3);

    while let Some(envelope) = channel.inner().try_receive().await {
        engine.worker().handle(envelope).await.unwrap();
    }

    let recorder = processor.inner();
    // Winner gets two prizes, ranks 2 and 3 one each.
    assert_eq!(recorder.len(), 4);
    assert_eq!(recorder.max_applications(), 1);
    let winner: Vec<_> = recorder
        .applied()
        .into_iter()
        .filter(|a| a.rank == 1)
        .collect();
    assert_eq!(winner.len(), 2);
    assert!(winner.iter().all(|a| a.user_id == "ann"));
}

#[tokio::test]
async fn test_transient_processor_failure_redelivers() {
    let clock = Arc::new(ManualClock::new(0));
    let channel = Arc::new(MemoryAwardChannel::new());
    let processor = Arc::new(Idempotent::new(RecordingProcessor::failing_first(2)));
    let alerts = Arc::new(MemoryAlerts::new());
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_channel(channel.clone())
        .with_alerts(alerts.clone())
        .with_prize_table(prize_table())
        .with_processors(ProcessorRegistry::new().with_all(processor.clone()))
        .build()
        .unwrap();
    play_week(&engine).await;

    clock.set(30 * MINUTE);
    engine.finalizer().run_once().await.unwrap();

    let mut handled = 0;
    while let Some(envelope) = channel.try_receive().await {
        engine.worker().handle(envelope).await.unwrap();
        handled += 1;
    }
    assert!(handled > 3);
    assert_eq!(processor.inner().len(), 4);
    assert_eq!(processor.inner().max_applications(), 1);
    assert_eq!(alerts.count(AlertCode::PrizeFailed), 0);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_retries_transient_storage_errors() {
    let live = Arc::new(MemoryLiveStore::new());
    let durable = Arc::new(
        ChaosStore::new(MemoryDurableStore::new())
            .fail_first(2)
            .only_ops(["upsert_entries", "recompute_ranks"]),
    );
    let alerts = Arc::new(MemoryAlerts::new());
    let materializer = RankMaterializer::new(
        live.clone(),
        durable.clone(),
        alerts.clone(),
        Arc::new(ManualClock::new(0)),
    )
    .with_retry(fast_retry());

    durable
        .put_leaderboard(&LeaderboardMeta::new("lb", PointMode::Highest, 0))
        .await
        .unwrap();
    live.open("lb", PointMode::Highest).await.unwrap();
    live.upsert("lb", "a", 3).await.unwrap();
    live.upsert("lb", "b", 5).await.unwrap();

    let report = materializer.snapshot("lb").await.unwrap();
    assert_eq!(report.rows, 2);
    assert_eq!(durable.events_triggered(), 2);
    assert!(alerts.is_empty());

    durable.set_plan(FaultPlan::Always);
    assert!(materializer.snapshot("lb").await.is_err());
    assert_eq!(alerts.count(AlertCode::SnapshotFailed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_finalize_failure_is_isolated_and_retried() {
    let clock = Arc::new(ManualClock::new(0));
    let durable = Arc::new(
        ChaosStore::new(MemoryDurableStore::new())
            .with_plan(FaultPlan::None)
            .only_ops(["mark_final_snapshot"]),
    );
    let alerts = Arc::new(MemoryAlerts::new());
    let config = RankConfig::default().with_retry(fast_retry());
    let engine = Engine::builder()
        .with_config(config)
        .with_clock(clock.clone())
        .with_durable_store(durable.clone())
        .with_alerts(alerts.clone())
        .build()
        .unwrap();
    let item_id = play_week(&engine).await;

    clock.set(30 * MINUTE);
    durable.set_plan(FaultPlan::Always);
    let failed = engine.finalizer().run_once().await.unwrap();
    assert_eq!(failed.failed.len(), 1);
    assert_eq!(alerts.count(AlertCode::FinalizeFailed), 1);
    let held = engine.schedule().get(&item_id).await.unwrap();
    assert_eq!(held.state, ScheduleState::Finalizing);
    assert_eq!(held.claimed_at, None);

    // The claim was released; the next poll resumes and completes the item.
    durable.set_plan(FaultPlan::None);
    let report = engine.finalizer().run_once().await.unwrap();
    assert_eq!(report.finalized, vec![item_id.clone()]);
    assert_eq!(
        engine.schedule().finalise_item(&item_id).await.unwrap(),
        FinaliseOutcome::AlreadyFinalized
    );
}

#[tokio::test]
async fn test_unsupported_prize_is_alerted_not_retried() {
    let clock = Arc::new(ManualClock::new(0));
    let channel = Arc::new(MemoryAwardChannel::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let processor = Arc::new(RecordingProcessor::new());
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_channel(channel.clone())
        .with_alerts(alerts.clone())
        .with_prize_table(prize_table())
        .with_processors(ProcessorRegistry::new().with(PrizeKind::Cash, processor.clone()))
        .build()
        .unwrap();
    play_week(&engine).await;

    clock.set(30 * MINUTE);
    engine.finalizer().run_once().await.unwrap();
    let mut handled = 0;
    while let Some(envelope) = channel.try_receive().await {
        engine.worker().handle(envelope).await.unwrap();
        handled += 1;
    }

    // One delivery per award: unsupported prizes are never redelivered.
    assert_eq!(handled, 3);
    assert_eq!(processor.len(), 1);
    // Upgrade for rank 1, tangible for ranks 2 and 3.
    assert_eq!(alerts.count(AlertCode::UnsupportedPrizeType), 3);
}

#[tokio::test]
async fn test_dry_run_registry_handles_every_prize() {
    let clock = Arc::new(ManualClock::new(0));
    let channel = Arc::new(MemoryAwardChannel::new());
    let alerts = Arc::new(MemoryAlerts::new());
    let registry = ProcessorRegistry::new().with_all(Arc::new(Idempotent::new(LoggingProcessor)));
    for kind in PrizeKind::ALL {
        assert!(registry.supports(kind));
    }
    let engine = Engine::builder()
        .with_clock(clock.clone())
        .with_channel(channel.clone())
        .with_alerts(alerts.clone())
        .with_prize_table(prize_table())
        .with_processors(registry)
        .build()
        .unwrap();
    play_week(&engine).await;

    clock.set(30 * MINUTE);
    engine.finalizer().run_once().await.unwrap();
    let mut handled = 0;
    while let Some(envelope) = channel.try_receive().await {
        engine.worker().handle(envelope).await.unwrap();
        handled += 1;
    }
    assert_eq!(handled, 3);
    assert!(alerts.is_empty());
}
