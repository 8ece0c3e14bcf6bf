//! Prize processors and their registry.

use super::{Prize, PrizeKind};
use crate::error::{RankError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Identifies one prize within one award.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrizeContext {
    pub award_id: String,
    pub leaderboard_id: String,
    pub user_id: String,
    pub rank: u64,
    /// Position of the prize in the award.
    pub prize_index: usize,
}

impl PrizeContext {
    /// Stable key for the `(award, prize)` pair.
    pub fn idempotency_key(&self) -> String {
        format!("{}/{}", self.award_id, self.prize_index)
    }
}

/// Applies one kind of prize.
///
/// May be called more than once for the same context; wrap non-idempotent
/// processors in [`Idempotent`].
#[async_trait]
pub trait PrizeProcessor: Send + Sync {
    async fn process(&self, ctx: &PrizeContext, prize: &Prize) -> Result<()>;
}

/// One processor per prize kind, fixed at startup.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: [Option<Arc<dyn PrizeProcessor>>; 3],
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: PrizeKind, processor: Arc<dyn PrizeProcessor>) -> Self {
        self.processors[kind.index()] = Some(processor);
        self
    }

    /// Register `processor` for every kind.
    pub fn with_all(mut self, processor: Arc<dyn PrizeProcessor>) -> Self {
        for kind in PrizeKind::ALL {
            self.processors[kind.index()] = Some(processor.clone());
        }
        self
    }

    pub fn get(&self, kind: PrizeKind) -> Result<&Arc<dyn PrizeProcessor>> {
        self.processors[kind.index()]
            .as_ref()
            .ok_or_else(|| RankError::unsupported_prize_type(kind.as_str()))
    }

    pub fn supports(&self, kind: PrizeKind) -> bool {
        self.processors[kind.index()].is_some()
    }
}

/// Completed keys remembered by [`Idempotent::new`].
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 100_000;

/// Runs the inner processor at most once per `(award_id, prize_index)`.
///
/// Concurrent calls for the same key wait for the first; a failed call leaves
/// the key open for a retry. Only the last `capacity` completed keys are
/// remembered, oldest evicted first, so the window must cover the award
/// channel's redelivery horizon.
pub struct Idempotent<P> {
    inner: P,
    done: DashMap<String, Arc<Mutex<bool>>>,
    /// Completed keys, oldest first.
    completed: parking_lot::Mutex<VecDeque<String>>,
    capacity: usize,
}

impl<P: PrizeProcessor> Idempotent<P> {
    pub fn new(inner: P) -> Self {
        Self::with_capacity(inner, DEFAULT_IDEMPOTENCY_CAPACITY)
    }

    pub fn with_capacity(inner: P, capacity: usize) -> Self {
        Self {
            inner,
            done: DashMap::new(),
            completed: parking_lot::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Keys currently held, completed or in flight.
    pub fn tracked(&self) -> usize {
        self.done.len()
    }

    fn complete(&self, key: String) {
        let mut completed = self.completed.lock();
        completed.push_back(key);
        while completed.len() > self.capacity {
            if let Some(oldest) = completed.pop_front() {
                self.done.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl<P: PrizeProcessor> PrizeProcessor for Idempotent<P> {
    async fn process(&self, ctx: &PrizeContext, prize: &Prize) -> Result<()> {
        let key = ctx.idempotency_key();
        let slot = self.done.entry(key.clone()).or_default().clone();
        let mut done = slot.lock().await;
        if *done {
            return Ok(());
        }
        match self.inner.process(ctx, prize).await {
            Ok(()) => {
                *done = true;
                drop(done);
                self.complete(key);
                Ok(())
            }
            Err(e) => {
                drop(done);
                // Forget the key unless another call is waiting on it.
                self.done.remove_if(&key, |_, held| {
                    Arc::ptr_eq(held, &slot) && Arc::strong_count(held) == 2
                });
                Err(e)
            }
        }
    }
}

/// Logs prizes instead of applying them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl PrizeProcessor for LoggingProcessor {
    async fn process(&self, ctx: &PrizeContext, prize: &Prize) -> Result<()> {
        info!(
            award_id = %ctx.award_id,
            leaderboard_id = %ctx.leaderboard_id,
            user_id = %ctx.user_id,
            rank = ctx.rank,
            prize_index = ctx.prize_index,
            kind = prize.kind().as_str(),
            prize = ?prize,
            "Prize awarded (dry run)"
        );
        Ok(())
    }
}
