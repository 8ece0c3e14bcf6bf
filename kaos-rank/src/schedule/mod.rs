//! Scheduled leaderboard instances and their lifecycle.
//!
//! A schedule item moves strictly forward through
//! `Scheduled -> Active -> Ended -> Finalizing -> Finalized -> Expired`.
//! Only [`ScheduleManager`] moves items, and every move is a compare-and-set in
//! the [`ScheduleStore`], so concurrent pollers cannot both win a transition.
//!
//! `Finalizing` is a durable claim with a lease. The poller holding it closes
//! the board and dispatches awards before committing `Finalized`. A claim whose
//! holder failed is released at once; one whose holder died is taken over when
//! the lease runs out.

mod memory;

pub use memory::MemoryScheduleStore;

use crate::clock::Clock;
use crate::config::RankConfig;
use crate::error::{RankError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Lifecycle state of a schedule item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Created, not yet started.
    Scheduled,
    /// Accepting scores.
    Active,
    /// Past its end time, waiting for the grace period.
    Ended,
    /// Finalization claimed, not yet committed.
    Finalizing,
    /// Final snapshot committed.
    Finalized,
    /// Past retention. Terminal.
    Expired,
}

impl ScheduleState {
    pub const ALL: [ScheduleState; 6] = [
        ScheduleState::Scheduled,
        ScheduleState::Active,
        ScheduleState::Ended,
        ScheduleState::Finalizing,
        ScheduleState::Finalized,
        ScheduleState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Scheduled => "scheduled",
            ScheduleState::Active => "active",
            ScheduleState::Ended => "ended",
            ScheduleState::Finalizing => "finalizing",
            ScheduleState::Finalized => "finalized",
            ScheduleState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    fn ordinal(self) -> u8 {
        match self {
            ScheduleState::Scheduled => 0,
            ScheduleState::Active => 1,
            ScheduleState::Ended => 2,
            ScheduleState::Finalizing => 3,
            ScheduleState::Finalized => 4,
            ScheduleState::Expired => 5,
        }
    }

    /// Only the immediate successor is reachable.
    pub fn can_transition_to(self, next: ScheduleState) -> bool {
        next.ordinal() == self.ordinal() + 1
    }

    pub fn is_terminal(self) -> bool {
        self == ScheduleState::Expired
    }

    /// True once the final snapshot has been committed.
    pub fn is_finalized(self) -> bool {
        matches!(self, ScheduleState::Finalized | ScheduleState::Expired)
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time-boxed instance of a leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: String,
    pub leaderboard_id: String,
    /// Start time (ms since epoch).
    pub start_time: i64,
    /// End time (ms since epoch).
    pub end_time: i64,
    /// Pay out prizes automatically after finalization.
    pub auto_payout: bool,
    pub state: ScheduleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<i64>,
    /// When the current finalization claim was taken. `None` while unclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
}

impl ScheduleItem {
    pub fn new(
        leaderboard_id: impl Into<String>,
        start_time: i64,
        end_time: i64,
        auto_payout: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            leaderboard_id: leaderboard_id.into(),
            start_time,
            end_time,
            auto_payout,
            state: ScheduleState::Scheduled,
            finalized_at: None,
            claimed_at: None,
        }
    }
}

/// Result of [`ScheduleManager::finalise_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinaliseOutcome {
    /// This call committed the transition to `Finalized`.
    Finalized,
    /// Some earlier call already did.
    AlreadyFinalized,
}

/// Result of [`ScheduleManager::claim_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call holds the claim. `resumed` is set when it took over a
    /// released or expired claim instead of moving the item out of `Ended`.
    Claimed { resumed: bool },
    /// Another poller holds a live claim.
    Busy,
    /// The item is already `Finalized` or `Expired`.
    AlreadyFinalized,
}

/// Persistence for schedule items.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new item. Fails with `AlreadyExists` on a duplicate id.
    async fn insert(&self, item: &ScheduleItem) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ScheduleItem>>;

    async fn list_by_state(&self, state: ScheduleState) -> Result<Vec<ScheduleItem>>;

    /// Move `id` from `from` to `to` if it is still in `from`.
    ///
    /// Returns false when the item was in some other state.
    async fn compare_and_set(
        &self,
        id: &str,
        from: ScheduleState,
        to: ScheduleState,
        at: i64,
    ) -> Result<bool>;

    /// Atomically take the finalization claim: `Ended -> Finalizing`, or take
    /// over a `Finalizing` item whose claim was released or is older than `lease_ms`.
    async fn claim(&self, id: &str, at: i64, lease_ms: i64) -> Result<ClaimOutcome>;

    /// Drop the claim on a `Finalizing` item so the next poll can take it.
    async fn release(&self, id: &str) -> Result<()>;

    /// Atomically commit `Ended | Finalizing -> Finalized`.
    async fn finalise(&self, id: &str, at: i64) -> Result<FinaliseOutcome>;
}

/// Outcome of the claim state check, shared by store backends.
///
/// `None` means the caller should write the claim.
pub(crate) fn claim_step(item: &ScheduleItem, at: i64, lease_ms: i64) -> Result<Option<ClaimOutcome>> {
    match item.state {
        ScheduleState::Ended => Ok(None),
        ScheduleState::Finalizing => match item.claimed_at {
            Some(claimed_at) if at - claimed_at < lease_ms => Ok(Some(ClaimOutcome::Busy)),
            _ => Ok(None),
        },
        ScheduleState::Finalized | ScheduleState::Expired => {
            Ok(Some(ClaimOutcome::AlreadyFinalized))
        }
        state => Err(RankError::InvalidTransition {
            id: item.id.clone(),
            from: state,
            to: ScheduleState::Finalizing,
        }),
    }
}

/// Outcome of the finalise state check, shared by store backends.
pub(crate) fn finalise_step(item: &ScheduleItem) -> Result<Option<FinaliseOutcome>> {
    match item.state {
        ScheduleState::Finalizing => Ok(None),
        ScheduleState::Finalized | ScheduleState::Expired => {
            Ok(Some(FinaliseOutcome::AlreadyFinalized))
        }
        state => Err(RankError::InvalidTransition {
            id: item.id.clone(),
            from: state,
            to: ScheduleState::Finalized,
        }),
    }
}

/// Owns schedule item state.
pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    grace_period_ms: i64,
    retention_ms: i64,
    lease_ms: i64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>, config: &RankConfig) -> Self {
        Self {
            store,
            clock,
            grace_period_ms: config.grace_period().as_millis() as i64,
            retention_ms: config.retention().as_millis() as i64,
            lease_ms: config.finalize_lease().as_millis() as i64,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create a new item in `Scheduled`.
    pub async fn create_item(
        &self,
        leaderboard_id: &str,
        start_time: i64,
        end_time: i64,
        auto_payout: bool,
    ) -> Result<ScheduleItem> {
        if end_time <= start_time {
            return Err(RankError::Config(format!(
                "schedule item end_time {} must be after start_time {}",
                end_time, start_time
            )));
        }
        let item = ScheduleItem::new(leaderboard_id, start_time, end_time, auto_payout);
        self.store.insert(&item).await?;
        info!(
            schedule_item_id = %item.id,
            leaderboard_id,
            start_time,
            end_time,
            "Schedule item created"
        );
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<ScheduleItem> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| RankError::schedule_item_not_found(id))
    }

    pub async fn list_by_state(&self, state: ScheduleState) -> Result<Vec<ScheduleItem>> {
        self.store.list_by_state(state).await
    }

    /// `Scheduled -> Active` for items whose start time has arrived.
    pub async fn activate_due(&self) -> Result<Vec<ScheduleItem>> {
        let now = self.clock.now_millis();
        self.advance_where(ScheduleState::Scheduled, ScheduleState::Active, |item| {
            item.start_time <= now
        })
        .await
    }

    /// `Active -> Ended` for items whose end time has passed.
    pub async fn end_due(&self) -> Result<Vec<ScheduleItem>> {
        let now = self.clock.now_millis();
        self.advance_where(ScheduleState::Active, ScheduleState::Ended, |item| {
            item.end_time <= now
        })
        .await
    }

    /// Items past `end_time + grace_period`.
    ///
    /// With `finalized = false` these are the items due for finalization: still
    /// `Ended`, or `Finalizing` under a claim that may need taking over. With
    /// `finalized = true` the ones already `Finalized`.
    pub async fn get_ended_items(&self, finalized: bool) -> Result<Vec<ScheduleItem>> {
        let states: &[ScheduleState] = if finalized {
            &[ScheduleState::Finalized]
        } else {
            &[ScheduleState::Ended, ScheduleState::Finalizing]
        };
        let cutoff = self.clock.now_millis() - self.grace_period_ms;
        let mut items = Vec::new();
        for state in states {
            items.extend(
                self.store
                    .list_by_state(*state)
                    .await?
                    .into_iter()
                    .filter(|item| item.end_time <= cutoff),
            );
        }
        items.sort_by_key(|item| item.end_time);
        Ok(items)
    }

    /// Take the finalization claim on an item.
    pub async fn claim_item(&self, id: &str) -> Result<ClaimOutcome> {
        let now = self.clock.now_millis();
        let outcome = self.store.claim(id, now, self.lease_ms).await?;
        match outcome {
            ClaimOutcome::Claimed { resumed: false } => {
                debug!(schedule_item_id = id, "Finalization claimed");
                self.record_transition(ScheduleState::Finalizing);
            }
            ClaimOutcome::Claimed { resumed: true } => {
                info!(schedule_item_id = id, "Finalization resumed from an earlier claim");
            }
            ClaimOutcome::Busy => {
                debug!(schedule_item_id = id, "Finalization claimed elsewhere");
            }
            ClaimOutcome::AlreadyFinalized => {}
        }
        Ok(outcome)
    }

    /// Release a claim after a failed attempt.
    pub async fn release_item(&self, id: &str) -> Result<()> {
        self.store.release(id).await
    }

    /// Commit finalization of an item.
    ///
    /// Safe to call repeatedly: the first successful call returns
    /// [`FinaliseOutcome::Finalized`], later ones [`FinaliseOutcome::AlreadyFinalized`].
    pub async fn finalise_item(&self, id: &str) -> Result<FinaliseOutcome> {
        let now = self.clock.now_millis();
        let outcome = self.store.finalise(id, now).await?;
        match outcome {
            FinaliseOutcome::Finalized => {
                info!(schedule_item_id = id, "Schedule item finalized");
                self.record_transition(ScheduleState::Finalized);
            }
            FinaliseOutcome::AlreadyFinalized => {
                debug!(schedule_item_id = id, "Schedule item already finalized");
            }
        }
        Ok(outcome)
    }

    /// `Finalized -> Expired` once retention has elapsed since `end_time`.
    pub async fn expire_due(&self) -> Result<Vec<ScheduleItem>> {
        let cutoff = self.clock.now_millis() - self.retention_ms;
        self.advance_where(ScheduleState::Finalized, ScheduleState::Expired, |item| {
            item.end_time <= cutoff
        })
        .await
    }

    async fn advance_where<F>(
        &self,
        from: ScheduleState,
        to: ScheduleState,
        due: F,
    ) -> Result<Vec<ScheduleItem>>
    where
        F: Fn(&ScheduleItem) -> bool,
    {
        let now = self.clock.now_millis();
        let mut moved = Vec::new();
        for mut item in self.store.list_by_state(from).await? {
            if !due(&item) {
                continue;
            }
            // Another poller may have won the race.
            if self.store.compare_and_set(&item.id, from, to, now).await? {
                debug!(
                    schedule_item_id = %item.id,
                    leaderboard_id = %item.leaderboard_id,
                    from = %from,
                    to = %to,
                    "Schedule item advanced"
                );
                self.record_transition(to);
                item.state = to;
                moved.push(item);
            }
        }
        Ok(moved)
    }

    #[cfg(feature = "metrics")]
    fn record_transition(&self, to: ScheduleState) {
        if let Some(ref m) = self.metrics {
            m.schedule_transitions_total
                .with_label_values(&[to.as_str()])
                .inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_transition(&self, _to: ScheduleState) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: i64 = 60_000;

    fn manager(clock: Arc<ManualClock>) -> ScheduleManager {
        ScheduleManager::new(
            Arc::new(MemoryScheduleStore::new()),
            clock,
            &RankConfig::default(),
        )
    }

    #[test]
    fn test_transitions_are_one_directional() {
        use ScheduleState::*;
        assert!(Scheduled.can_transition_to(Active));
        assert!(Ended.can_transition_to(Finalizing));
        assert!(Finalized.can_transition_to(Expired));
        assert!(!Active.can_transition_to(Scheduled));
        assert!(!Active.can_transition_to(Finalized));
        assert!(!Expired.can_transition_to(Scheduled));
        assert!(Expired.is_terminal());
    }

    #[test]
    fn test_state_parse() {
        for state in ScheduleState::ALL {
            assert_eq!(ScheduleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ScheduleState::parse("cancelled"), None);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let clock = Arc::new(ManualClock::new(0));
        let schedule = manager(clock.clone());
        let item = schedule
            .create_item("weekly", 10 * MINUTE, 70 * MINUTE, true)
            .await
            .unwrap();
        assert_eq!(item.state, ScheduleState::Scheduled);

        assert!(schedule.activate_due().await.unwrap().is_empty());
        clock.set(10 * MINUTE);
        assert_eq!(schedule.activate_due().await.unwrap().len(), 1);

        clock.set(70 * MINUTE);
        assert_eq!(schedule.end_due().await.unwrap().len(), 1);
        assert_eq!(
            schedule.get(&item.id).await.unwrap().state,
            ScheduleState::Ended
        );

        // Still inside the 15 minute grace period.
        clock.set(84 * MINUTE);
        assert!(schedule.get_ended_items(false).await.unwrap().is_empty());
        clock.set(85 * MINUTE);
        let due = schedule.get_ended_items(false).await.unwrap();
        assert_eq!(due.len(), 1);

        // Finalized is only reachable through a claim.
        assert!(matches!(
            schedule.finalise_item(&item.id).await,
            Err(RankError::InvalidTransition {
                from: ScheduleState::Ended,
                to: ScheduleState::Finalized,
                ..
            })
        ));
        schedule.claim_item(&item.id).await.unwrap();
        assert_eq!(
            schedule.finalise_item(&item.id).await.unwrap(),
            FinaliseOutcome::Finalized
        );
        assert_eq!(
            schedule.finalise_item(&item.id).await.unwrap(),
            FinaliseOutcome::AlreadyFinalized
        );
        let finalized = schedule.get(&item.id).await.unwrap();
        assert_eq!(finalized.state, ScheduleState::Finalized);
        assert_eq!(finalized.finalized_at, Some(85 * MINUTE));
        assert!(schedule.get_ended_items(false).await.unwrap().is_empty());
        assert_eq!(schedule.get_ended_items(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released_or_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let schedule = manager(clock.clone());
        let item = schedule.create_item("lb", 0, MINUTE, true).await.unwrap();
        schedule.activate_due().await.unwrap();
        clock.set(MINUTE);
        schedule.end_due().await.unwrap();
        clock.set(20 * MINUTE);

        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::Claimed { resumed: false }
        );
        let claimed = schedule.get(&item.id).await.unwrap();
        assert_eq!(claimed.state, ScheduleState::Finalizing);
        assert_eq!(claimed.claimed_at, Some(20 * MINUTE));
        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::Busy
        );
        // A claimed item stays visible to pollers so it can be taken over.
        assert_eq!(schedule.get_ended_items(false).await.unwrap().len(), 1);

        schedule.release_item(&item.id).await.unwrap();
        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::Claimed { resumed: true }
        );

        // Default lease is five minutes.
        clock.set(24 * MINUTE);
        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::Busy
        );
        clock.set(25 * MINUTE);
        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::Claimed { resumed: true }
        );

        assert_eq!(
            schedule.finalise_item(&item.id).await.unwrap(),
            FinaliseOutcome::Finalized
        );
        let finalized = schedule.get(&item.id).await.unwrap();
        assert_eq!(finalized.claimed_at, None);
        assert_eq!(
            schedule.claim_item(&item.id).await.unwrap(),
            ClaimOutcome::AlreadyFinalized
        );
    }

    #[tokio::test]
    async fn test_claim_rejects_active_item() {
        let clock = Arc::new(ManualClock::new(0));
        let schedule = manager(clock.clone());
        let item = schedule.create_item("lb", 0, MINUTE, false).await.unwrap();
        schedule.activate_due().await.unwrap();
        assert!(matches!(
            schedule.claim_item(&item.id).await,
            Err(RankError::InvalidTransition {
                from: ScheduleState::Active,
                to: ScheduleState::Finalizing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_finalise_rejects_active_item() {
        let clock = Arc::new(ManualClock::new(0));
        let schedule = manager(clock.clone());
        let item = schedule.create_item("lb", 0, MINUTE, false).await.unwrap();
        schedule.activate_due().await.unwrap();

        let err = schedule.finalise_item(&item.id).await.unwrap_err();
        assert!(matches!(
            err,
            RankError::InvalidTransition {
                from: ScheduleState::Active,
                to: ScheduleState::Finalized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_expire_after_retention() {
        let clock = Arc::new(ManualClock::new(0));
        let schedule = manager(clock.clone());
        let item = schedule.create_item("lb", 0, MINUTE, false).await.unwrap();
        schedule.activate_due().await.unwrap();
        clock.set(MINUTE);
        schedule.end_due().await.unwrap();
        schedule.claim_item(&item.id).await.unwrap();
        schedule.finalise_item(&item.id).await.unwrap();

        clock.set(MINUTE + 6 * 24 * 60 * MINUTE);
        assert!(schedule.expire_due().await.unwrap().is_empty());
        clock.set(MINUTE + 7 * 24 * 60 * MINUTE);
        assert_eq!(schedule.expire_due().await.unwrap().len(), 1);

        assert_eq!(
            schedule.finalise_item(&item.id).await.unwrap(),
            FinaliseOutcome::AlreadyFinalized
        );
    }

    #[tokio::test]
    async fn test_create_item_validates_window() {
        let schedule = manager(Arc::new(ManualClock::new(0)));
        assert!(matches!(
            schedule.create_item("lb", MINUTE, MINUTE, false).await,
            Err(RankError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_item() {
        let schedule = manager(Arc::new(ManualClock::new(0)));
        assert!(matches!(
            schedule.get("nope").await,
            Err(RankError::ScheduleItemNotFound { .. })
        ));
        assert!(matches!(
            schedule.finalise_item("nope").await,
            Err(RankError::ScheduleItemNotFound { .. })
        ));
    }
}
