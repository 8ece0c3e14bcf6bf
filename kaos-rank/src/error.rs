//! Error types for kaos-rank.

use crate::schedule::ScheduleState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RankError>;

#[derive(Error, Debug)]
pub enum RankError {
    #[error("leaderboard not found: {id}")]
    NotFound { id: String },

    #[error("entry not found: {leaderboard_id}/{user_id}")]
    EntryNotFound {
        leaderboard_id: String,
        user_id: String,
    },

    #[error("leaderboard is frozen: {id}")]
    Frozen { id: String },

    #[error("already exists: {id}")]
    AlreadyExists { id: String },

    #[error("schedule item not found: {id}")]
    ScheduleItemNotFound { id: String },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ScheduleState,
        to: ScheduleState,
    },

    #[error("unsupported prize type: {kind}")]
    UnsupportedPrizeType { kind: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("live store error: {0}")]
    LiveStore(String),

    #[error("award channel error: {0}")]
    Channel(String),

    #[error("prize processor failed: {0}")]
    Processor(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RankError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn entry_not_found(leaderboard_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::EntryNotFound {
            leaderboard_id: leaderboard_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn frozen(id: impl Into<String>) -> Self {
        Self::Frozen { id: id.into() }
    }

    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    pub fn schedule_item_not_found(id: impl Into<String>) -> Self {
        Self::ScheduleItemNotFound { id: id.into() }
    }

    pub fn unsupported_prize_type(kind: impl Into<String>) -> Self {
        Self::UnsupportedPrizeType { kind: kind.into() }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::LiveStore(_)
                | Self::Channel(_)
                | Self::Processor(_)
                | Self::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RankError::Storage("connection reset".into()).is_transient());
        assert!(RankError::LiveStore("timeout".into()).is_transient());
        assert!(RankError::Channel("queue full".into()).is_transient());
        assert!(!RankError::frozen("lb").is_transient());
        assert!(!RankError::unsupported_prize_type("voucher").is_transient());
        assert!(!RankError::not_found("lb").is_transient());
    }

    #[test]
    fn test_display() {
        let err = RankError::InvalidTransition {
            id: "item-1".into(),
            from: ScheduleState::Active,
            to: ScheduleState::Finalized,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for item-1: active -> finalized"
        );
    }
}
