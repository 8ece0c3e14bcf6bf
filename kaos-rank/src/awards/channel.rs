//! At-least-once transport for award messages.

use crate::error::{RankError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// One award message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardEnvelope {
    pub message_id: String,
    /// 1 for the first delivery.
    pub attempt: u32,
    /// Serialized [`PrizeAward`](super::PrizeAward).
    pub body: serde_json::Value,
}

impl AwardEnvelope {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            attempt: 1,
            body,
        }
    }

    /// The same message, for redelivery.
    pub fn retry(&self) -> Self {
        Self {
            message_id: self.message_id.clone(),
            attempt: self.attempt + 1,
            body: self.body.clone(),
        }
    }
}

/// Message transport. Delivery may repeat; order across awards is not kept.
#[async_trait]
pub trait AwardChannel: Send + Sync {
    async fn publish(&self, envelope: AwardEnvelope) -> Result<()>;

    /// Next message, or `None` once the channel is closed and drained.
    async fn receive(&self) -> Option<AwardEnvelope>;
}

/// In-process channel backed by an unbounded mpsc queue.
pub struct MemoryAwardChannel {
    tx: mpsc::UnboundedSender<AwardEnvelope>,
    rx: Mutex<mpsc::UnboundedReceiver<AwardEnvelope>>,
}

impl MemoryAwardChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Take a message without waiting.
    pub async fn try_receive(&self) -> Option<AwardEnvelope> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Messages queued and not yet received.
    pub async fn pending(&self) -> usize {
        self.rx.lock().await.len()
    }
}

impl Default for MemoryAwardChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AwardChannel for MemoryAwardChannel {
    async fn publish(&self, envelope: AwardEnvelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| RankError::Processor("award channel closed".into()))
    }

    async fn receive(&self) -> Option<AwardEnvelope> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_receive() {
        let channel = MemoryAwardChannel::new();
        let envelope = AwardEnvelope::new(serde_json::json!({"award_id": "x"}));
        channel.publish(envelope.clone()).await.unwrap();
        assert_eq!(channel.pending().await, 1);

        let received = channel.receive().await.unwrap();
        assert_eq!(received, envelope);
        assert!(channel.try_receive().await.is_none());
    }

    #[test]
    fn test_retry_keeps_message_id() {
        let envelope = AwardEnvelope::new(serde_json::json!({}));
        let again = envelope.retry();
        assert_eq!(again.message_id, envelope.message_id);
        assert_eq!(again.attempt, 2);
    }
}
