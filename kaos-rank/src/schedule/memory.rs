//! In-memory schedule store.

use super::{
    claim_step, finalise_step, ClaimOutcome, FinaliseOutcome, ScheduleItem, ScheduleState,
    ScheduleStore,
};
use crate::error::{RankError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Schedule items keyed by id.
///
/// Each transition runs under the shard lock of its item.
pub struct MemoryScheduleStore {
    items: DashMap<String, ScheduleItem>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for MemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, item: &ScheduleItem) -> Result<()> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Err(RankError::already_exists(&item.id)),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduleItem>> {
        Ok(self.items.get(id).map(|item| item.clone()))
    }

    async fn list_by_state(&self, state: ScheduleState) -> Result<Vec<ScheduleItem>> {
        Ok(self
            .items
            .iter()
            .filter(|item| item.state == state)
            .map(|item| item.clone())
            .collect())
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
        let mut item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RankError::schedule_item_not_found(id))?;
        if item.state != from {
            return Ok(false);
        }
        item.state = to;
        Ok(true)
    }

    async fn claim(&self, id: &str, at: i64, lease_ms: i64) -> Result<ClaimOutcome> {
        let mut item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RankError::schedule_item_not_found(id))?;
        if let Some(outcome) = claim_step(&item, at, lease_ms)? {
            return Ok(outcome);
        }
        let resumed = item.state == ScheduleState::Finalizing;
        item.state = ScheduleState::Finalizing;
        item.claimed_at = Some(at);
        Ok(ClaimOutcome::Claimed { resumed })
    }

    async fn release(&self, id: &str) -> Result<()> {
        let mut item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RankError::schedule_item_not_found(id))?;
        if item.state == ScheduleState::Finalizing {
            item.claimed_at = None;
        }
        Ok(())
    }

    async fn finalise(&self, id: &str, at: i64) -> Result<FinaliseOutcome> {
        let mut item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RankError::schedule_item_not_found(id))?;
        if let Some(outcome) = finalise_step(&item)? {
            return Ok(outcome);
        }
        item.state = ScheduleState::Finalized;
        item.finalized_at = Some(at);
        item.claimed_at = None;
        Ok(FinaliseOutcome::Finalized)
    }
}
