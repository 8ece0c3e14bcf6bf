//! In-memory durable store, for tests and single-node runs.

use super::DurableStore;
use crate::entry::{LeaderboardEntry, LeaderboardMeta};
use crate::error::{RankError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

pub struct MemoryDurableStore {
    leaderboards: DashMap<String, LeaderboardMeta>,
    /// leaderboard_id -> user_id -> row
    entries: DashMap<String, HashMap<String, LeaderboardEntry>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            leaderboards: DashMap::new(),
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get_leaderboard(&self, leaderboard_id: &str) -> Result<Option<LeaderboardMeta>> {
        Ok(self.leaderboards.get(leaderboard_id).map(|m| m.clone()))
    }

    async fn put_leaderboard(&self, meta: &LeaderboardMeta) -> Result<()> {
        self.leaderboards
            .entry(meta.id.clone())
            .and_modify(|existing| {
                let final_snapshot_at = existing.final_snapshot_at;
                *existing = meta.clone();
                existing.final_snapshot_at = final_snapshot_at.or(meta.final_snapshot_at);
            })
            .or_insert_with(|| meta.clone());
        Ok(())
    }

    async fn mark_final_snapshot(&self, leaderboard_id: &str, at: i64) -> Result<i64> {
        // Lock order: entries, then leaderboards.
        let _rows = self.entries.entry(leaderboard_id.to_string()).or_default();
        let mut meta = self
            .leaderboards
            .get_mut(leaderboard_id)
            .ok_or_else(|| RankError::not_found(leaderboard_id))?;
        Ok(*meta.final_snapshot_at.get_or_insert(at))
    }

    async fn upsert_entries(
        &self,
        leaderboard_id: &str,
        entries: &[LeaderboardEntry],
        is_final: bool,
    ) -> Result<usize> {
        let mut rows = self.entries.entry(leaderboard_id.to_string()).or_default();
        let closed = self
            .leaderboards
            .get(leaderboard_id)
            .is_some_and(|meta| meta.is_closed());
        if closed && !is_final {
            return Err(RankError::frozen(leaderboard_id));
        }
        for entry in entries {
            rows.insert(entry.user_id.clone(), entry.clone());
        }
        Ok(entries.len())
    }

    async fn recompute_ranks(&self, leaderboard_id: &str) -> Result<usize> {
        let Some(mut rows) = self.entries.get_mut(leaderboard_id) else {
            return Ok(0);
        };
        let mut order: Vec<_> = rows.values().map(|e| (e.key(), e.user_id.clone())).collect();
        order.sort();

        let mut changed = 0;
        for (i, (_, user_id)) in order.into_iter().enumerate() {
            let rank = Some((i + 1) as u64);
            if let Some(row) = rows.get_mut(&user_id) {
                if row.rank != rank {
                    row.rank = rank;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LeaderboardEntry>> {
        let mut rows: Vec<_> = self
            .entries
            .get(leaderboard_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.key().cmp(&b.key()).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(rows)
    }
}
