//! Prize processor that records what it was asked to apply.

use async_trait::async_trait;
use kaos_rank::awards::PrizeContext;
use kaos_rank::{Prize, PrizeProcessor, RankError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub award_id: String,
    pub user_id: String,
    pub rank: u64,
    pub prize_index: usize,
    pub prize: Prize,
}

/// Records every call and optionally fails the first few.
#[derive(Default)]
pub struct RecordingProcessor {
    applied: Mutex<Vec<Applied>>,
    fail_remaining: Mutex<usize>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a transient error.
    pub fn failing_first(count: usize) -> Self {
        Self {
            fail_remaining: Mutex::new(count),
            ..Self::default()
        }
    }

    /// Successful calls, in order.
    pub fn applied(&self) -> Vec<Applied> {
        self.applied.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.lock().is_empty()
    }

    /// Successful calls per `(award_id, prize_index)`. Anything above 1 is a double payout.
    pub fn counts(&self) -> HashMap<(String, usize), usize> {
        let mut counts = HashMap::new();
        for applied in self.applied.lock().iter() {
            *counts
                .entry((applied.award_id.clone(), applied.prize_index))
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn max_applications(&self) -> usize {
        self.counts().values().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl PrizeProcessor for RecordingProcessor {
    async fn process(&self, ctx: &PrizeContext, prize: &Prize) -> Result<()> {
        {
            let mut remaining = self.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RankError::Processor(format!(
                    "injected failure for {}",
                    ctx.idempotency_key()
                )));
            }
        }
        self.applied.lock().push(Applied {
            award_id: ctx.award_id.clone(),
            user_id: ctx.user_id.clone(),
            rank: ctx.rank,
            prize_index: ctx.prize_index,
            prize: prize.clone(),
        });
        Ok(())
    }
}
