//! Leaderboard entries, point modes and the rank ordering.
//!
//! Every leaderboard is a strict total order over `(points DESC, tie_breaker ASC)`.
//! Tie-breakers come from a per-leaderboard sequence that only ever grows, so among
//! users with equal points the one who reached that total first holds the lower
//! tie-breaker and the better rank.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How a new score combines with a user's existing points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointMode {
    /// Every score is added to the running total.
    Cumulative,
    /// A score replaces the running value only if it is higher.
    Highest,
}

impl PointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointMode::Cumulative => "cumulative",
            PointMode::Highest => "highest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cumulative" => Some(PointMode::Cumulative),
            "highest" => Some(PointMode::Highest),
            _ => None,
        }
    }

    /// Points after applying `value` on top of `current`.
    pub fn combine(self, current: Option<i64>, value: i64) -> i64 {
        match (self, current) {
            (_, None) => value,
            (PointMode::Cumulative, Some(points)) => points.saturating_add(value),
            (PointMode::Highest, Some(points)) => points.max(value),
        }
    }
}

/// Sort key for ordered storage. Ascending order is best-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankKey {
    pub points: i64,
    pub tie_breaker: i64,
}

impl RankKey {
    pub fn new(points: i64, tie_breaker: i64) -> Self {
        Self {
            points,
            tie_breaker,
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .points
            .cmp(&self.points)
            .then(self.tie_breaker.cmp(&other.tie_breaker))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One user's live standing, as held by the live score store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    pub user_id: String,
    pub points: i64,
    pub tie_breaker: i64,
}

impl LiveEntry {
    pub fn new(user_id: impl Into<String>, points: i64, tie_breaker: i64) -> Self {
        Self {
            user_id: user_id.into(),
            points,
            tie_breaker,
        }
    }

    pub fn key(&self) -> RankKey {
        RankKey::new(self.points, self.tie_breaker)
    }
}

/// Result of applying one score event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub points: i64,
    pub tie_breaker: i64,
    /// False when the event left the user's points untouched.
    pub changed: bool,
}

/// A durable leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub leaderboard_id: String,
    pub user_id: String,
    /// Points as of the last committed snapshot.
    pub points: i64,
    /// Tie-breaker as of the last committed snapshot.
    pub tie_breaker: i64,
    /// Live points when the row was last written.
    pub running_points: i64,
    /// Live tie-breaker when the row was last written.
    pub running_tie_breaker: i64,
    /// 1-based rank, assigned at snapshot time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
}

impl LeaderboardEntry {
    /// Row committed from a live entry at the given rank.
    pub fn committed(leaderboard_id: &str, live: &LiveEntry, rank: u64) -> Self {
        Self {
            leaderboard_id: leaderboard_id.to_string(),
            user_id: live.user_id.clone(),
            points: live.points,
            tie_breaker: live.tie_breaker,
            running_points: live.points,
            running_tie_breaker: live.tie_breaker,
            rank: Some(rank),
        }
    }

    pub fn key(&self) -> RankKey {
        RankKey::new(self.points, self.tie_breaker)
    }

    /// The live entry this row restores to.
    pub fn to_live(&self) -> LiveEntry {
        LiveEntry::new(
            self.user_id.clone(),
            self.running_points,
            self.running_tie_breaker,
        )
    }
}

/// Durable metadata for a leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardMeta {
    pub id: String,
    pub name: String,
    pub point_mode: PointMode,
    pub created_at: i64,
    /// Set once the final snapshot has been persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_snapshot_at: Option<i64>,
}

impl LeaderboardMeta {
    pub fn new(id: impl Into<String>, point_mode: PointMode, created_at: i64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            point_mode,
            created_at,
            final_snapshot_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Closed leaderboards accept no further scores.
    pub fn is_closed(&self) -> bool {
        self.final_snapshot_at.is_some()
    }
}

/// Sorts best-first and assigns 1-based ranks by position.
pub fn rank_entries(leaderboard_id: &str, mut live: Vec<LiveEntry>) -> Vec<LeaderboardEntry> {
    live.sort_by_key(LiveEntry::key);
    live.iter()
        .enumerate()
        .map(|(i, entry)| LeaderboardEntry::committed(leaderboard_id, entry, (i + 1) as u64))
        .collect()
}
