//! Fault injection for durable storage.
//!
//! [`ChaosStore`] wraps any [`DurableStore`] and fails selected calls with a
//! transient `Storage` error, the way a flaky database connection would.

use async_trait::async_trait;
use kaos_rank::{DurableStore, LeaderboardEntry, LeaderboardMeta, RankError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Which calls to fail.
#[derive(Debug, Clone)]
pub enum FaultPlan {
    /// No faults - pass through
    None,
    /// Fail the next `count` matching calls, then pass.
    FailFirst { count: usize },
    /// Fail each matching call with the given probability (0.0-1.0)
    Random { probability: f64 },
    /// Fail every matching call.
    Always,
}

/// A [`DurableStore`] that injects transient failures.
///
/// # Example
///
/// ```
/// use kaos_rank::MemoryDurableStore;
/// use kaos_test_support::chaos::ChaosStore;
///
/// let store = ChaosStore::new(MemoryDurableStore::new())
///     .fail_first(2)
///     .only_ops(["upsert_entries"]);
/// ```
pub struct ChaosStore<S> {
    inner: S,
    plan: Mutex<FaultPlan>,
    ops: Option<HashSet<&'static str>>,
    delay: Option<Duration>,
    rng: Mutex<StdRng>,
    calls: AtomicUsize,
    events_triggered: AtomicUsize,
}

impl<S: DurableStore> ChaosStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::None),
            ops: None,
            delay: None,
            rng: Mutex::new(StdRng::from_entropy()),
            calls: AtomicUsize::new(0),
            events_triggered: AtomicUsize::new(0),
        }
    }

    pub fn fail_first(self, count: usize) -> Self {
        self.with_plan(FaultPlan::FailFirst { count })
    }

    pub fn with_failure_probability(self, probability: f64) -> Self {
        self.with_plan(FaultPlan::Random {
            probability: probability.clamp(0.0, 1.0),
        })
    }

    pub fn with_plan(self, plan: FaultPlan) -> Self {
        *self.plan.lock() = plan;
        self
    }

    /// Restrict faults to the named operations (e.g. `"upsert_entries"`).
    pub fn only_ops(mut self, ops: impl IntoIterator<Item = &'static str>) -> Self {
        self.ops = Some(ops.into_iter().collect());
        self
    }

    /// Delay every call, faulty or not.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Seed the random plan for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Replace the plan on a live store.
    pub fn set_plan(&self, plan: FaultPlan) {
        *self.plan.lock() = plan;
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls seen, faulty or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of injected failures.
    pub fn events_triggered(&self) -> usize {
        self.events_triggered.load(Ordering::Relaxed)
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.ops.as_ref().is_some_and(|ops| !ops.contains(op)) {
            return Ok(());
        }

        let fail = {
            let mut plan = self.plan.lock();
            match &mut *plan {
                FaultPlan::None => false,
                FaultPlan::Always => true,
                FaultPlan::FailFirst { count } if *count > 0 => {
                    *count -= 1;
                    true
                }
                FaultPlan::FailFirst { .. } => false,
                FaultPlan::Random { probability } => self.rng.lock().gen::<f64>() < *probability,
            }
        };
        if fail {
            self.events_triggered.fetch_add(1, Ordering::Relaxed);
            return Err(RankError::Storage(format!("injected failure in {}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DurableStore> DurableStore for ChaosStore<S> {
    async fn get_leaderboard(&self, leaderboard_id: &str) -> Result<Option<LeaderboardMeta>> {
        self.enter("get_leaderboard").await?;
        self.inner.get_leaderboard(leaderboard_id).await
    }

    async fn put_leaderboard(&self, meta: &LeaderboardMeta) -> Result<()> {
        self.enter("put_leaderboard").await?;
        self.inner.put_leaderboard(meta).await
    }

    async fn mark_final_snapshot(&self, leaderboard_id: &str, at: i64) -> Result<i64> {
        self.enter("mark_final_snapshot").await?;
        self.inner.mark_final_snapshot(leaderboard_id, at).await
    }

    async fn upsert_entries(
        &self,
        leaderboard_id: &str,
        entries: &[LeaderboardEntry],
        is_final: bool,
    ) -> Result<usize> {
        self.enter("upsert_entries").await?;
        self.inner.upsert_entries(leaderboard_id, entries, is_final).await
    }

    async fn recompute_ranks(&self, leaderboard_id: &str) -> Result<usize> {
        self.enter("recompute_ranks").await?;
        self.inner.recompute_ranks(leaderboard_id).await
    }

    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LeaderboardEntry>> {
        self.enter("entries").await?;
        self.inner.entries(leaderboard_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaos_rank::{MemoryDurableStore, PointMode};

    fn meta() -> LeaderboardMeta {
        LeaderboardMeta::new("lb", PointMode::Cumulative, 0)
    }

    #[tokio::test]
    async fn test_no_chaos() {
        let store = ChaosStore::new(MemoryDurableStore::new());
        for _ in 0..100 {
            store.put_leaderboard(&meta()).await.unwrap();
        }
        assert_eq!(store.events_triggered(), 0);
        assert_eq!(store.calls(), 100);
    }

    #[tokio::test]
    async fn test_fail_first() {
        let store = ChaosStore::new(MemoryDurableStore::new()).fail_first(2);
        assert!(store.put_leaderboard(&meta()).await.is_err());
        let err = store.put_leaderboard(&meta()).await.unwrap_err();
        assert!(err.is_transient());
        store.put_leaderboard(&meta()).await.unwrap();
        assert_eq!(store.events_triggered(), 2);
    }

    #[tokio::test]
    async fn test_only_ops() {
        let store = ChaosStore::new(MemoryDurableStore::new())
            .with_plan(FaultPlan::Always)
            .only_ops(["entries"]);
        store.put_leaderboard(&meta()).await.unwrap();
        assert!(store.entries("lb").await.is_err());
    }

    #[tokio::test]
    async fn test_random_failures() {
        let store = ChaosStore::new(MemoryDurableStore::new())
            .with_failure_probability(0.1)
            .with_seed(7);
        let mut failures = 0;
        for _ in 0..10_000 {
            if store.get_leaderboard("lb").await.is_err() {
                failures += 1;
            }
        }
        assert!(failures > 800 && failures < 1200, "failures = {}", failures);
    }
}
