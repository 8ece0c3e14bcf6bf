//! # kaos-rank
//!
//! Ranked leaderboard engine for game backends.
//!
//! ## Features
//!
//! - **Live ranking**: per-leaderboard ordered store with strict
//!   `(points DESC, tie_breaker ASC)` order, in memory or Redis
//! - **Snapshots**: ranked rows persisted in batches, restorable bit-for-bit
//! - **Scheduling**: time-boxed leaderboard instances with a forward-only lifecycle
//! - **Finalization**: freeze, final snapshot and payout, safe to repeat
//! - **Prizes**: award messages over an at-least-once channel, one processor per prize kind
//!
//! ## Example
//!
//! ```rust,ignore
//! use kaos_rank::{Engine, LeaderboardMeta, PointMode};
//!
//! let engine = Engine::builder().build()?;
//! engine
//!     .score()
//!     .open_leaderboard(&LeaderboardMeta::new("weekly", PointMode::Highest, 0))
//!     .await?;
//! engine.score().submit("weekly", "alice", 120).await?;
//!
//! engine.run(tokio::signal::ctrl_c().map(|_| ())).await;
//! ```

pub mod alerts;
pub mod awards;
pub mod clock;
pub mod config;
pub mod durable;
pub mod engine;
pub mod entry;
pub mod error;
pub mod finalizer;
pub mod live;
pub mod materializer;
pub mod retry;
pub mod schedule;
pub mod service;
pub mod telemetry;

#[cfg(feature = "metrics")]
pub mod metrics;

// Re-exports
pub use alerts::{Alert, AlertCode, AlertSink, LogAlerts, MemoryAlerts};
pub use awards::{
    compute_awards, AwardChannel, AwardEnvelope, AwardWorker, Idempotent, LoggingProcessor,
    MemoryAwardChannel, MemoryPrizeTable, Prize, PrizeAward, PrizeContext, PrizeDispatcher,
    PrizeKind, PrizeProcessor, PrizeTable, ProcessorRegistry, RankBand,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RankConfig;
pub use durable::{DurableStore, MemoryDurableStore};
pub use engine::{Engine, EngineBuilder};
pub use entry::{LeaderboardEntry, LeaderboardMeta, LiveEntry, PointMode, ScoreUpdate};
pub use error::{RankError, Result};
pub use finalizer::{FinalizeReport, Finalizer, ItemOutcome};
pub use live::{LiveScoreStore, MemoryLiveStore};
pub use materializer::RankMaterializer;
pub use retry::RetryPolicy;
pub use schedule::{
    ClaimOutcome, FinaliseOutcome, ScheduleItem, ScheduleManager, ScheduleState, ScheduleStore,
};
pub use service::{ScoreEvent, ScoreService, Submission};
pub use telemetry::{init_tracing, TracingConfig};

#[cfg(feature = "metrics")]
pub use metrics::Metrics;

#[cfg(feature = "postgres")]
pub use durable::PostgresStore;

#[cfg(feature = "redis")]
pub use live::RedisLiveStore;
