//! Durable storage for leaderboard metadata and committed entries.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryDurableStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::entry::{LeaderboardEntry, LeaderboardMeta};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_leaderboard(&self, leaderboard_id: &str) -> Result<Option<LeaderboardMeta>>;

    /// Insert metadata. An existing row keeps its `final_snapshot_at`.
    async fn put_leaderboard(&self, meta: &LeaderboardMeta) -> Result<()>;

    /// Record that the final snapshot has been persisted.
    ///
    /// The first mark wins; returns the timestamp actually stored.
    async fn mark_final_snapshot(&self, leaderboard_id: &str, at: i64) -> Result<i64>;

    /// Insert or overwrite rows keyed by `(leaderboard_id, user_id)`.
    ///
    /// Once `final_snapshot_at` is set only writes with `is_final` are
    /// accepted; any other write fails with [`RankError::Frozen`]. The check
    /// and the write are atomic with respect to [`mark_final_snapshot`].
    ///
    /// [`RankError::Frozen`]: crate::RankError::Frozen
    /// [`mark_final_snapshot`]: DurableStore::mark_final_snapshot
    async fn upsert_entries(
        &self,
        leaderboard_id: &str,
        entries: &[LeaderboardEntry],
        is_final: bool,
    ) -> Result<usize>;

    /// Reassign ranks over all rows by `(points DESC, tie_breaker ASC)`.
    ///
    /// Returns how many rows changed rank.
    async fn recompute_ranks(&self, leaderboard_id: &str) -> Result<usize>;

    /// All rows, best first.
    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LeaderboardEntry>>;
}
