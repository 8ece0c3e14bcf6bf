//! Prize tables, award computation and payout.
//!
//! A finalized leaderboard yields one [`PrizeAward`] per winner. Awards travel
//! over an at-least-once [`AwardChannel`]; an [`AwardWorker`] hands each prize
//! to the processor registered for its [`PrizeKind`].

mod channel;
mod dispatcher;
mod processor;

pub use channel::{AwardChannel, AwardEnvelope, MemoryAwardChannel};
pub use dispatcher::{AwardWorker, DispatchReport, HandleReport, PrizeDispatcher};
pub use processor::{
    Idempotent, LoggingProcessor, PrizeContext, PrizeProcessor, ProcessorRegistry,
    DEFAULT_IDEMPOTENCY_CAPACITY,
};

use crate::entry::LeaderboardEntry;
use crate::error::Result;
use crate::schedule::ScheduleItem;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A single prize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prize {
    /// Currency credited to the winner. `amount` is in minor units.
    Cash { amount: i64, currency_code: String },
    /// A physical item, optionally redeemable for cash.
    Tangible {
        name: String,
        short_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cash_alternative_amount: Option<i64>,
    },
    /// A time-limited account upgrade.
    Upgrade { level: u32, duration_secs: u64 },
}

impl Prize {
    pub fn kind(&self) -> PrizeKind {
        match self {
            Prize::Cash { .. } => PrizeKind::Cash,
            Prize::Tangible { .. } => PrizeKind::Tangible,
            Prize::Upgrade { .. } => PrizeKind::Upgrade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrizeKind {
    Cash,
    Tangible,
    Upgrade,
}

impl PrizeKind {
    pub const ALL: [PrizeKind; 3] = [PrizeKind::Cash, PrizeKind::Tangible, PrizeKind::Upgrade];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrizeKind::Cash => "cash",
            PrizeKind::Tangible => "tangible",
            PrizeKind::Upgrade => "upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            PrizeKind::Cash => 0,
            PrizeKind::Tangible => 1,
            PrizeKind::Upgrade => 2,
        }
    }
}

/// Prizes for an inclusive range of ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankBand {
    pub from_rank: u64,
    pub to_rank: u64,
    pub prizes: Vec<Prize>,
}

impl RankBand {
    pub fn new(from_rank: u64, to_rank: u64, prizes: Vec<Prize>) -> Self {
        Self {
            from_rank,
            to_rank,
            prizes,
        }
    }

    pub fn contains(&self, rank: u64) -> bool {
        (self.from_rank..=self.to_rank).contains(&rank)
    }
}

/// Everything one winner receives for one schedule item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeAward {
    /// `{schedule_item_id}:{user_id}`, stable across redeliveries.
    pub award_id: String,
    pub schedule_item_id: String,
    pub leaderboard_id: String,
    pub user_id: String,
    pub rank: u64,
    pub prizes: Vec<Prize>,
}

impl PrizeAward {
    pub fn award_id(schedule_item_id: &str, user_id: &str) -> String {
        format!("{}:{}", schedule_item_id, user_id)
    }
}

/// Source of prize bands per leaderboard.
#[async_trait]
pub trait PrizeTable: Send + Sync {
    async fn prize_bands(&self, leaderboard_id: &str) -> Result<Vec<RankBand>>;
}

/// Prize bands held in memory.
#[derive(Default)]
pub struct MemoryPrizeTable {
    bands: DashMap<String, Vec<RankBand>>,
}

impl MemoryPrizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, leaderboard_id: impl Into<String>, bands: Vec<RankBand>) {
        self.bands.insert(leaderboard_id.into(), bands);
    }
}

#[async_trait]
impl PrizeTable for MemoryPrizeTable {
    async fn prize_bands(&self, leaderboard_id: &str) -> Result<Vec<RankBand>> {
        Ok(self
            .bands
            .get(leaderboard_id)
            .map(|b| b.clone())
            .unwrap_or_default())
    }
}

/// One award per ranked entry that falls in a band with prizes.
///
/// When bands overlap the first matching band wins.
pub fn compute_awards(
    item: &ScheduleItem,
    entries: &[LeaderboardEntry],
    bands: &[RankBand],
) -> Vec<PrizeAward> {
    entries
        .iter()
        .filter_map(|entry| {
            let rank = entry.rank?;
            let band = bands.iter().find(|band| band.contains(rank))?;
            if band.prizes.is_empty() {
                return None;
            }
            Some(PrizeAward {
                award_id: PrizeAward::award_id(&item.id, &entry.user_id),
                schedule_item_id: item.id.clone(),
                leaderboard_id: item.leaderboard_id.clone(),
                user_id: entry.user_id.clone(),
                rank,
                prizes: band.prizes.clone(),
            })
        })
        .collect()
}
