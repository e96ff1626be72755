//! Notification Bus - fans out new blocks and validation outcomes
//!
//! One bounded broadcast channel per streaming channel. Each subscriber owns
//! its own receiver; a subscriber that falls behind loses the oldest messages
//! instead of holding back the sender.

use dashmap::DashMap;
use l2_consensus::{Channel, ServerMessage, ValidationReport};
use l2_runtime::Block;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;

/// Subscription ID
pub type SubscriptionId = u64;

/// A message as delivered to subscribers, serialized once per publish
pub type Notification = Arc<String>;

/// Subscription entry
#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel: Channel,
}

pub struct NotificationBus {
    blocks: broadcast::Sender<Notification>,
    validations: broadcast::Sender<Notification>,
    /// Active subscriptions by ID
    subscriptions: DashMap<SubscriptionId, Subscription>,
    /// Next subscription ID
    next_id: AtomicU64,
}

impl NotificationBus {
    /// `capacity` bounds each subscriber's backlog
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (blocks, _) = broadcast::channel(capacity);
        let (validations, _) = broadcast::channel(capacity);
        Self {
            blocks,
            validations,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Notification> {
        match channel {
            Channel::Blocks => &self.blocks,
            Channel::Validations => &self.validations,
        }
    }

    pub fn subscribe(&self, channel: Channel) -> (SubscriptionId, broadcast::Receiver<Notification>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let receiver = self.sender(channel).subscribe();
        self.subscriptions.insert(id, Subscription { id, channel });
        tracing::debug!("Created subscription {} for {:?}", id, channel);
        (id, receiver)
    }

    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self.subscriptions.remove(&subscription_id).is_some();
        if removed {
            tracing::debug!("Removed subscription {}", subscription_id);
        }
        removed
    }

    /// Publish a committed block on `blocks`; returns how many receivers got it
    pub fn publish_block(&self, block: &Block) -> usize {
        let message = ServerMessage::NewBlock {
            block: block.clone(),
        };
        self.publish(Channel::Blocks, message)
    }

    pub fn publish_validation(&self, report: ValidationReport) -> usize {
        self.publish(Channel::Validations, ServerMessage::Validation { data: report })
    }

    fn publish(&self, channel: Channel, message: ServerMessage) -> usize {
        // No receivers is not an error
        self.sender(channel)
            .send(Arc::new(message.to_json()))
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn has_subscription(&self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&subscription_id)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l2_runtime::{Address, Bytes, H256};
    use tokio::sync::broadcast::error::RecvError;

    fn block(height: u64) -> Block {
        Block::assemble(
            height,
            H256::zero(),
            1_700_000_000,
            vec![],
            0,
            30_000_000,
            Address([1u8; 20]),
            Bytes::default(),
        )
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = NotificationBus::new(8);
        let (id, mut blocks) = bus.subscribe(Channel::Blocks);
        let (_, mut validations) = bus.subscribe(Channel::Validations);
        assert_eq!(id, 1);
        assert_eq!(bus.subscription_count(), 2);

        assert_eq!(bus.publish_block(&block(1)), 1);

        let msg: serde_json::Value = serde_json::from_str(&blocks.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "newBlock");
        assert_eq!(msg["block"]["height"], 1);
        assert!(validations.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = NotificationBus::new(2);
        let (_, mut slow) = bus.subscribe(Channel::Blocks);

        for h in 1..=5 {
            bus.publish_block(&block(h));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        let msg: serde_json::Value = serde_json::from_str(&slow.recv().await.unwrap()).unwrap();
        assert_eq!(msg["block"]["height"], 4);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = NotificationBus::default();
        assert_eq!(bus.publish_block(&block(1)), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = NotificationBus::default();
        let (id, _) = bus.subscribe(Channel::Validations);
        assert!(bus.has_subscription(id));
        assert!(bus.unsubscribe(id));
        assert!(!bus.has_subscription(id));
        assert!(!bus.unsubscribe(id));
    }
}
