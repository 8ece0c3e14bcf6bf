//! Duplicate delivery simulation for award channels.
//!
//! At-least-once transports redeliver; [`DuplicatingChannel`] makes that
//! happen on demand so idempotency can be tested.

use async_trait::async_trait;
use kaos_rank::{AwardChannel, AwardEnvelope, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Which published messages get a second copy.
#[derive(Debug, Clone)]
pub enum DuplicatePattern {
    /// No duplicates - pass everything once
    None,
    /// Duplicate every message
    Always,
    /// Duplicate every Nth message
    Periodic { every_n: usize },
    /// Duplicate with given probability (0.0-1.0)
    Random { probability: f64 },
}

/// An [`AwardChannel`] that publishes some messages twice.
///
/// # Example
///
/// ```
/// use kaos_rank::MemoryAwardChannel;
/// use kaos_test_support::loss::{DuplicatingChannel, DuplicatePattern};
///
/// let channel = DuplicatingChannel::new(MemoryAwardChannel::new(), DuplicatePattern::Always);
/// ```
pub struct DuplicatingChannel<C> {
    inner: C,
    pattern: DuplicatePattern,
    rng: Mutex<StdRng>,
    published: AtomicUsize,
    duplicated: AtomicUsize,
}

impl<C: AwardChannel> DuplicatingChannel<C> {
    pub fn new(inner: C, pattern: DuplicatePattern) -> Self {
        Self {
            inner,
            pattern,
            rng: Mutex::new(StdRng::from_entropy()),
            published: AtomicUsize::new(0),
            duplicated: AtomicUsize::new(0),
        }
    }

    /// Create a channel that duplicates every message
    pub fn always(inner: C) -> Self {
        Self::new(inner, DuplicatePattern::Always)
    }

    /// Create a channel that duplicates every Nth message
    pub fn periodic(inner: C, every_n: usize) -> Self {
        Self::new(inner, DuplicatePattern::Periodic { every_n })
    }

    /// Create a channel with random duplication probability
    pub fn random(inner: C, probability: f64) -> Self {
        Self::new(
            inner,
            DuplicatePattern::Random {
                probability: probability.clamp(0.0, 1.0),
            },
        )
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Messages published by callers, not counting duplicates.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Extra copies injected.
    pub fn duplicated(&self) -> usize {
        self.duplicated.load(Ordering::Relaxed)
    }

    fn should_duplicate(&self, count: usize) -> bool {
        match &self.pattern {
            DuplicatePattern::None => false,
            DuplicatePattern::Always => true,
            DuplicatePattern::Periodic { every_n } => *every_n > 0 && count % *every_n == 0,
            DuplicatePattern::Random { probability } => self.rng.lock().gen::<f64>() < *probability,
        }
    }
}

#[async_trait]
impl<C: AwardChannel> AwardChannel for DuplicatingChannel<C> {
    async fn publish(&self, envelope: AwardEnvelope) -> Result<()> {
        let count = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        if self.should_duplicate(count) {
            self.inner.publish(envelope.clone()).await?;
            self.duplicated.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.publish(envelope).await
    }

    async fn receive(&self) -> Option<AwardEnvelope> {
        self.inner.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaos_rank::MemoryAwardChannel;

    fn envelope(n: u64) -> AwardEnvelope {
        AwardEnvelope::new(serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_no_duplicates() {
        let channel = DuplicatingChannel::new(MemoryAwardChannel::new(), DuplicatePattern::None);
        for n in 0..10 {
            channel.publish(envelope(n)).await.unwrap();
        }
        assert_eq!(channel.inner().pending().await, 10);
        assert_eq!(channel.duplicated(), 0);
    }

    #[tokio::test]
    async fn test_always_duplicates_same_message() {
        let channel = DuplicatingChannel::always(MemoryAwardChannel::new());
        let sent = envelope(1);
        channel.publish(sent.clone()).await.unwrap();

        let first = channel.receive().await.unwrap();
        let second = channel.receive().await.unwrap();
        assert_eq!(first, sent);
        assert_eq!(second.message_id, sent.message_id);
        assert_eq!(channel.published(), 1);
    }

    #[tokio::test]
    async fn test_periodic_duplicates() {
        let channel = DuplicatingChannel::periodic(MemoryAwardChannel::new(), 10);
        for n in 0..100 {
            channel.publish(envelope(n)).await.unwrap();
        }
        assert_eq!(channel.duplicated(), 10);
        assert_eq!(channel.inner().pending().await, 110);
    }

    #[tokio::test]
    async fn test_random_duplicates() {
        let channel = DuplicatingChannel::random(MemoryAwardChannel::new(), 0.1);
        for n in 0..10_000 {
            channel.publish(envelope(n)).await.unwrap();
        }
        let duplicated = channel.duplicated();
        assert!(duplicated > 800 && duplicated < 1200, "duplicated = {}", duplicated);
    }
}
