//! In-process live score store.

use super::LiveScoreStore;
use crate::entry::{LiveEntry, PointMode, RankKey, ScoreUpdate};
use crate::error::{RankError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct LiveBoard {
    mode: PointMode,
    frozen: bool,
    next_tie_breaker: i64,
    by_user: HashMap<String, RankKey>,
    /// Sorted best-first; positions are ranks.
    order: Vec<(RankKey, String)>,
}

impl LiveBoard {
    fn new(mode: PointMode) -> Self {
        Self {
            mode,
            frozen: false,
            next_tie_breaker: 1,
            by_user: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn position(&self, key: RankKey) -> std::result::Result<usize, usize> {
        self.order.binary_search_by(|(k, _)| k.cmp(&key))
    }

    fn insert(&mut self, key: RankKey, user_id: String) {
        let pos = match self.position(key) {
            Ok(pos) | Err(pos) => pos,
        };
        self.order.insert(pos, (key, user_id));
    }

    fn remove(&mut self, key: RankKey) {
        if let Ok(pos) = self.position(key) {
            self.order.remove(pos);
        }
    }

    fn apply(&mut self, user_id: &str, value: i64) -> ScoreUpdate {
        let current = self.by_user.get(user_id).copied();
        let points = self.mode.combine(current.map(|k| k.points), value);

        if let Some(key) = current {
            if key.points == points {
                return ScoreUpdate {
                    points,
                    tie_breaker: key.tie_breaker,
                    changed: false,
                };
            }
            self.remove(key);
        }

        let key = RankKey::new(points, self.next_tie_breaker);
        self.next_tie_breaker += 1;
        self.by_user.insert(user_id.to_string(), key);
        self.insert(key, user_id.to_string());
        ScoreUpdate {
            points,
            tie_breaker: key.tie_breaker,
            changed: true,
        }
    }

    fn entries(&self, limit: usize) -> Vec<LiveEntry> {
        self.order
            .iter()
            .take(limit)
            .map(|(key, user_id)| LiveEntry::new(user_id.clone(), key.points, key.tie_breaker))
            .collect()
    }
}

/// Live boards held in process memory.
///
/// Upserts take the board's write lock, so each one is atomic with respect to
/// [`freeze`](LiveScoreStore::freeze) and to other upserts on the same board.
pub struct MemoryLiveStore {
    boards: DashMap<String, Arc<RwLock<LiveBoard>>>,
}

impl MemoryLiveStore {
    pub fn new() -> Self {
        Self {
            boards: DashMap::new(),
        }
    }

    fn board(&self, leaderboard_id: &str) -> Result<Arc<RwLock<LiveBoard>>> {
        self.boards
            .get(leaderboard_id)
            .map(|b| b.clone())
            .ok_or_else(|| RankError::not_found(leaderboard_id))
    }

    /// Number of loaded boards.
    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}

impl Default for MemoryLiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveScoreStore for MemoryLiveStore {
    async fn open(&self, leaderboard_id: &str, mode: PointMode) -> Result<bool> {
        let mut created = false;
        self.boards
            .entry(leaderboard_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(LiveBoard::new(mode)))
            });
        Ok(created)
    }

    async fn upsert(&self, leaderboard_id: &str, user_id: &str, value: i64) -> Result<ScoreUpdate> {
        let board = self.board(leaderboard_id)?;
        let mut board = board.write();
        if board.frozen {
            return Err(RankError::frozen(leaderboard_id));
        }
        Ok(board.apply(user_id, value))
    }

    async fn rank_of(&self, leaderboard_id: &str, user_id: &str) -> Result<u64> {
        let board = self.board(leaderboard_id)?;
        let board = board.read();
        let key = board
            .by_user
            .get(user_id)
            .copied()
            .ok_or_else(|| RankError::entry_not_found(leaderboard_id, user_id))?;
        board
            .position(key)
            .map(|pos| (pos + 1) as u64)
            .map_err(|_| RankError::entry_not_found(leaderboard_id, user_id))
    }

    async fn top_n(&self, leaderboard_id: &str, n: usize) -> Result<Vec<LiveEntry>> {
        let board = self.board(leaderboard_id)?;
        let entries = board.read().entries(n);
        Ok(entries)
    }

    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LiveEntry>> {
        self.top_n(leaderboard_id, usize::MAX).await
    }

    async fn freeze(&self, leaderboard_id: &str) -> Result<()> {
        let board = self.board(leaderboard_id)?;
        board.write().frozen = true;
        Ok(())
    }

    async fn is_frozen(&self, leaderboard_id: &str) -> Result<bool> {
        let board = self.board(leaderboard_id)?;
        let frozen = board.read().frozen;
        Ok(frozen)
    }

    async fn evict(&self, leaderboard_id: &str) -> Result<bool> {
        Ok(self.boards.remove(leaderboard_id).is_some())
    }

    async fn load(
        &self,
        leaderboard_id: &str,
        mode: PointMode,
        entries: Vec<LiveEntry>,
        last_tie_breaker: i64,
        frozen: bool,
    ) -> Result<()> {
        let mut board = LiveBoard::new(mode);
        board.frozen = frozen;
        let mut max_tie_breaker = last_tie_breaker.max(0);
        for entry in entries {
            let key = entry.key();
            max_tie_breaker = max_tie_breaker.max(key.tie_breaker);
            board.by_user.insert(entry.user_id.clone(), key);
            board.order.push((key, entry.user_id));
        }
        board.order.sort_by(|a, b| a.0.cmp(&b.0));
        board.next_tie_breaker = max_tie_breaker + 1;
        self.boards
            .insert(leaderboard_id.to_string(), Arc::new(RwLock::new(board)));
        Ok(())
    }

    async fn contains(&self, leaderboard_id: &str) -> Result<bool> {
        Ok(self.boards.contains_key(leaderboard_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(mode: PointMode) -> MemoryLiveStore {
        let store = MemoryLiveStore::new();
        assert!(store.open("lb", mode).await.unwrap());
        store
    }

    #[tokio::test]
    async fn test_cumulative_scenario() {
        let store = store_with(PointMode::Cumulative).await;
        store.upsert("lb", "a", 10).await.unwrap();
        store.upsert("lb", "b", 8).await.unwrap();
        store.upsert("lb", "a", 5).await.unwrap();
        store.upsert("lb", "b", 6).await.unwrap();

        let top = store.top_n("lb", 10).await.unwrap();
        assert_eq!(top[0].user_id, "a");
        assert_eq!(top[0].points, 15);
        assert_eq!(top[1].user_id, "b");
        assert_eq!(top[1].points, 14);
        assert_eq!(store.rank_of("lb", "a").await.unwrap(), 1);
        assert_eq!(store.rank_of("lb", "b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_highest_keeps_tie_breaker_when_unchanged() {
        let store = store_with(PointMode::Highest).await;
        let first = store.upsert("lb", "a", 10).await.unwrap();
        let second = store.upsert("lb", "a", 3).await.unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.points, 10);
        assert_eq!(second.tie_breaker, first.tie_breaker);
    }

    #[tokio::test]
    async fn test_first_to_reach_total_wins_tie() {
        let store = store_with(PointMode::Cumulative).await;
        store.upsert("lb", "late", 5).await.unwrap();
        store.upsert("lb", "early", 10).await.unwrap();
        store.upsert("lb", "late", 5).await.unwrap();

        let top = store.top_n("lb", 2).await.unwrap();
        assert_eq!(top[0].user_id, "early");
        assert_eq!(top[1].user_id, "late");
        assert!(top[0].tie_breaker < top[1].tie_breaker);
    }

    #[tokio::test]
    async fn test_freeze_rejects_upserts() {
        let store = store_with(PointMode::Cumulative).await;
        store.upsert("lb", "a", 1).await.unwrap();
        store.freeze("lb").await.unwrap();
        store.freeze("lb").await.unwrap();
        assert!(store.is_frozen("lb").await.unwrap());
        assert!(matches!(
            store.upsert("lb", "a", 1).await,
            Err(RankError::Frozen { .. })
        ));
        assert_eq!(store.entries("lb").await.unwrap()[0].points, 1);
    }

    #[tokio::test]
    async fn test_missing_board_and_user() {
        let store = store_with(PointMode::Cumulative).await;
        assert!(matches!(
            store.upsert("other", "a", 1).await,
            Err(RankError::NotFound { .. })
        ));
        assert!(matches!(
            store.rank_of("lb", "ghost").await,
            Err(RankError::EntryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let store = store_with(PointMode::Cumulative).await;
        assert!(!store.open("lb", PointMode::Cumulative).await.unwrap());
        assert!(store.evict("lb").await.unwrap());
        assert!(!store.evict("lb").await.unwrap());
        assert!(!store.contains("lb").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_resumes_sequence() {
        let store = MemoryLiveStore::new();
        store
            .load(
                "lb",
                PointMode::Cumulative,
                vec![LiveEntry::new("b", 14, 4), LiveEntry::new("a", 15, 7)],
                0,
                false,
            )
            .await
            .unwrap();
        assert_eq!(store.rank_of("lb", "a").await.unwrap(), 1);

        let update = store.upsert("lb", "c", 1).await.unwrap();
        assert_eq!(update.tie_breaker, 8);
    }

    #[tokio::test]
    async fn test_empty_load_resumes_after_floor() {
        let store = MemoryLiveStore::new();
        store
            .load("lb", PointMode::Cumulative, Vec::new(), 41, false)
            .await
            .unwrap();
        let update = store.upsert("lb", "a", 1).await.unwrap();
        assert_eq!(update.tie_breaker, 42);
    }
}
