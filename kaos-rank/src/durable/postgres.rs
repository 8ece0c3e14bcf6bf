//! PostgreSQL durable and schedule storage.
//!
//! Enable with the `postgres` feature flag:
//! ```toml
//! kaos-rank = { version = "0.1", features = ["postgres"] }
//! ```

use super::DurableStore;
use crate::entry::{LeaderboardEntry, LeaderboardMeta, PointMode};
use crate::error::{RankError, Result};
use crate::schedule::{
    claim_step, finalise_step, ClaimOutcome, FinaliseOutcome, ScheduleItem, ScheduleState,
    ScheduleStore,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

/// PostgreSQL store for leaderboards, entries and schedule items.
pub struct PostgresStore {
    pool: PgPool,
    batch_size: usize,
}

fn storage_err(e: impl std::fmt::Display) -> RankError {
    RankError::Storage(e.to_string())
}

impl PostgresStore {
    /// Create a new store with a connection string.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        Ok(Self::with_pool(pool))
    }

    /// Create with an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: 1000,
        }
    }

    /// Rows per `INSERT` statement in [`upsert_entries`](DurableStore::upsert_entries).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run migrations to set up the schema.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS leaderboard (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                point_mode TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                final_snapshot_at BIGINT
            );

            CREATE TABLE IF NOT EXISTS leaderboard_entry (
                leaderboard_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                points BIGINT NOT NULL,
                tie_breaker BIGINT NOT NULL,
                running_points BIGINT NOT NULL,
                running_tie_breaker BIGINT NOT NULL,
                rank BIGINT,
                PRIMARY KEY (leaderboard_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entry_order
                ON leaderboard_entry(leaderboard_id, points DESC, tie_breaker ASC);

            CREATE TABLE IF NOT EXISTS leaderboard_schedule_item (
                id TEXT PRIMARY KEY,
                leaderboard_id TEXT NOT NULL,
                start_time BIGINT NOT NULL,
                end_time BIGINT NOT NULL,
                state TEXT NOT NULL,
                auto_payout BOOLEAN NOT NULL DEFAULT FALSE,
                finalized_at BIGINT,
                claimed_at BIGINT
            );

            ALTER TABLE leaderboard_schedule_item ADD COLUMN IF NOT EXISTS claimed_at BIGINT;

            CREATE INDEX IF NOT EXISTS idx_schedule_state
                ON leaderboard_schedule_item(state, end_time);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_meta(row: &PgRow) -> Result<LeaderboardMeta> {
        let mode: String = row.try_get("point_mode").map_err(storage_err)?;
        Ok(LeaderboardMeta {
            id: row.try_get("id").map_err(storage_err)?,
            name: row.try_get("name").map_err(storage_err)?,
            point_mode: PointMode::parse(&mode)
                .ok_or_else(|| RankError::Storage(format!("unknown point mode: {}", mode)))?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            final_snapshot_at: row.try_get("final_snapshot_at").map_err(storage_err)?,
        })
    }

    fn row_to_entry(row: &PgRow) -> Result<LeaderboardEntry> {
        let rank: Option<i64> = row.try_get("rank").map_err(storage_err)?;
        Ok(LeaderboardEntry {
            leaderboard_id: row.try_get("leaderboard_id").map_err(storage_err)?,
            user_id: row.try_get("user_id").map_err(storage_err)?,
            points: row.try_get("points").map_err(storage_err)?,
            tie_breaker: row.try_get("tie_breaker").map_err(storage_err)?,
            running_points: row.try_get("running_points").map_err(storage_err)?,
            running_tie_breaker: row.try_get("running_tie_breaker").map_err(storage_err)?,
            rank: rank.map(|r| r as u64),
        })
    }

    fn row_to_item(row: &PgRow) -> Result<ScheduleItem> {
        let state: String = row.try_get("state").map_err(storage_err)?;
        Ok(ScheduleItem {
            id: row.try_get("id").map_err(storage_err)?,
            leaderboard_id: row.try_get("leaderboard_id").map_err(storage_err)?,
            start_time: row.try_get("start_time").map_err(storage_err)?,
            end_time: row.try_get("end_time").map_err(storage_err)?,
            auto_payout: row.try_get("auto_payout").map_err(storage_err)?,
            state: ScheduleState::parse(&state)
                .ok_or_else(|| RankError::Storage(format!("unknown schedule state: {}", state)))?,
            finalized_at: row.try_get("finalized_at").map_err(storage_err)?,
            claimed_at: row.try_get("claimed_at").map_err(storage_err)?,
        })
    }
}

const ITEM_COLUMNS: &str =
    "id, leaderboard_id, start_time, end_time, state, auto_payout, finalized_at, claimed_at";

#[async_trait]
impl DurableStore for PostgresStore {
    async fn get_leaderboard(&self, leaderboard_id: &str) -> Result<Option<LeaderboardMeta>> {
        let row = sqlx::query(
            "SELECT id, name, point_mode, created_at, final_snapshot_at FROM leaderboard WHERE id = $1",
        )
        .bind(leaderboard_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_meta).transpose()
    }

    async fn put_leaderboard(&self, meta: &LeaderboardMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leaderboard (id, name, point_mode, created_at, final_snapshot_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                point_mode = EXCLUDED.point_mode,
                final_snapshot_at = COALESCE(leaderboard.final_snapshot_at, EXCLUDED.final_snapshot_at)
            "#,
        )
        .bind(&meta.id)
        .bind(&meta.name)
        .bind(meta.point_mode.as_str())
        .bind(meta.created_at)
        .bind(meta.final_snapshot_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn mark_final_snapshot(&self, leaderboard_id: &str, at: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE leaderboard
            SET final_snapshot_at = COALESCE(final_snapshot_at, $2)
            WHERE id = $1
            RETURNING final_snapshot_at
            "#,
        )
        .bind(leaderboard_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| RankError::not_found(leaderboard_id))?;

        row.try_get("final_snapshot_at").map_err(storage_err)
    }

    async fn upsert_entries(
        &self,
        leaderboard_id: &str,
        entries: &[LeaderboardEntry],
        is_final: bool,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Shares the row lock that mark_final_snapshot takes exclusively.
        let closed = sqlx::query(
            "SELECT final_snapshot_at FROM leaderboard WHERE id = $1 FOR SHARE",
        )
        .bind(leaderboard_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .map(|row| row.try_get::<Option<i64>, _>("final_snapshot_at"))
        .transpose()
        .map_err(storage_err)?
        .flatten()
        .is_some();
        if closed && !is_final {
            return Err(RankError::frozen(leaderboard_id));
        }

        let mut written = 0;
        for batch in entries.chunks(self.batch_size) {
            let users: Vec<&str> = batch.iter().map(|e| e.user_id.as_str()).collect();
            let points: Vec<i64> = batch.iter().map(|e| e.points).collect();
            let tie_breakers: Vec<i64> = batch.iter().map(|e| e.tie_breaker).collect();
            let running_points: Vec<i64> = batch.iter().map(|e| e.running_points).collect();
            let running_tie_breakers: Vec<i64> =
                batch.iter().map(|e| e.running_tie_breaker).collect();
            let ranks: Vec<Option<i64>> = batch.iter().map(|e| e.rank.map(|r| r as i64)).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO leaderboard_entry
                    (leaderboard_id, user_id, points, tie_breaker,
                     running_points, running_tie_breaker, rank)
                SELECT $1, * FROM UNNEST($2::text[], $3::int8[], $4::int8[],
                                         $5::int8[], $6::int8[], $7::int8[])
                ON CONFLICT (leaderboard_id, user_id) DO UPDATE SET
                    points = EXCLUDED.points,
                    tie_breaker = EXCLUDED.tie_breaker,
                    running_points = EXCLUDED.running_points,
                    running_tie_breaker = EXCLUDED.running_tie_breaker,
                    rank = EXCLUDED.rank
                "#,
            )
            .bind(leaderboard_id)
            .bind(&users)
            .bind(&points)
            .bind(&tie_breakers)
            .bind(&running_points)
            .bind(&running_tie_breakers)
            .bind(&ranks)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            written += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(written)
    }

    async fn recompute_ranks(&self, leaderboard_id: &str) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE leaderboard_entry e
            SET rank = r.new_rank
            FROM (
                SELECT user_id,
                       ROW_NUMBER() OVER (ORDER BY points DESC, tie_breaker ASC, user_id ASC) AS new_rank
                FROM leaderboard_entry
                WHERE leaderboard_id = $1
            ) r
            WHERE e.leaderboard_id = $1
              AND e.user_id = r.user_id
              AND e.rank IS DISTINCT FROM r.new_rank
            "#,
        )
        .bind(leaderboard_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT leaderboard_id, user_id, points, tie_breaker,
                   running_points, running_tie_breaker, rank
            FROM leaderboard_entry
            WHERE leaderboard_id = $1
            ORDER BY points DESC, tie_breaker ASC, user_id ASC
            "#,
        )
        .bind(leaderboard_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn insert(&self, item: &ScheduleItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO leaderboard_schedule_item
                (id, leaderboard_id, start_time, end_time, state, auto_payout, finalized_at, claimed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.leaderboard_id)
        .bind(item.start_time)
        .bind(item.end_time)
        .bind(item.state.as_str())
        .bind(item.auto_payout)
        .bind(item.finalized_at)
        .bind(item.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(RankError::already_exists(&item.id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduleItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM leaderboard_schedule_item WHERE id = $1",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn list_by_state(&self, state: ScheduleState) -> Result<Vec<ScheduleItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM leaderboard_schedule_item WHERE state = $1 ORDER BY end_time",
            ITEM_COLUMNS
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn compare_and_set(
        &self,
        id: &str,
        from: ScheduleState,
        to: ScheduleState,
        _at: i64,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(RankError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        let result = sqlx::query(
            "UPDATE leaderboard_schedule_item SET state = $3 WHERE id = $1 AND state = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(RankError::schedule_item_not_found(id)),
        }
    }

    async fn claim(&self, id: &str, at: i64, lease_ms: i64) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM leaderboard_schedule_item WHERE id = $1 FOR UPDATE",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| RankError::schedule_item_not_found(id))?;

        let item = Self::row_to_item(&row)?;
        if let Some(outcome) = claim_step(&item, at, lease_ms)? {
            return Ok(outcome);
        }

        sqlx::query(
            "UPDATE leaderboard_schedule_item SET state = $2, claimed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(ScheduleState::Finalizing.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(ClaimOutcome::Claimed {
            resumed: item.state == ScheduleState::Finalizing,
        })
    }

    async fn release(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE leaderboard_schedule_item SET claimed_at = NULL WHERE id = $1 AND state = $2",
        )
        .bind(id)
        .bind(ScheduleState::Finalizing.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 && self.get(id).await?.is_none() {
            return Err(RankError::schedule_item_not_found(id));
        }
        Ok(())
    }

    async fn finalise(&self, id: &str, at: i64) -> Result<FinaliseOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM leaderboard_schedule_item WHERE id = $1 FOR UPDATE",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| RankError::schedule_item_not_found(id))?;

        let item = Self::row_to_item(&row)?;
        if let Some(outcome) = finalise_step(&item)? {
            return Ok(outcome);
        }

        sqlx::query(
            "UPDATE leaderboard_schedule_item SET state = $2, finalized_at = $3, claimed_at = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(ScheduleState::Finalized.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(FinaliseOutcome::Finalized)
    }
}
