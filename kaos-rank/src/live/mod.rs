//! Live score store.
//!
//! Holds the working ranking of every running leaderboard. Workers share one
//! store; atomicity of each upsert comes from the store itself (a board lock in
//! memory, a Lua script in Redis), never from the caller.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryLiveStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLiveStore;

use crate::entry::{LiveEntry, PointMode, ScoreUpdate};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait LiveScoreStore: Send + Sync {
    /// Create an empty board. Returns false if one already exists.
    async fn open(&self, leaderboard_id: &str, mode: PointMode) -> Result<bool>;

    /// Apply one score event for a user.
    ///
    /// A fresh tie-breaker is drawn only when the user's points change or the
    /// user is new. Fails with `Frozen` after [`freeze`](Self::freeze) and with
    /// `NotFound` when the board is not loaded.
    async fn upsert(&self, leaderboard_id: &str, user_id: &str, value: i64) -> Result<ScoreUpdate>;

    /// 1-based rank of a user.
    async fn rank_of(&self, leaderboard_id: &str, user_id: &str) -> Result<u64>;

    /// Best `n` entries, best first.
    async fn top_n(&self, leaderboard_id: &str, n: usize) -> Result<Vec<LiveEntry>>;

    /// Every entry, best first.
    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LiveEntry>>;

    /// Make the board read-only. Idempotent.
    async fn freeze(&self, leaderboard_id: &str) -> Result<()>;

    async fn is_frozen(&self, leaderboard_id: &str) -> Result<bool>;

    /// Drop the board. Returns false if it was already gone.
    async fn evict(&self, leaderboard_id: &str) -> Result<bool>;

    /// Replace the board with `entries`.
    ///
    /// The tie-breaker sequence resumes after the larger of `last_tie_breaker`
    /// and the largest loaded tie-breaker, so a board rebuilt without its rows
    /// never reissues a tie-breaker already held in durable storage. Readers
    /// see either the old board or the complete new one.
    async fn load(
        &self,
        leaderboard_id: &str,
        mode: PointMode,
        entries: Vec<LiveEntry>,
        last_tie_breaker: i64,
        frozen: bool,
    ) -> Result<()>;

    async fn contains(&self, leaderboard_id: &str) -> Result<bool>;
}
