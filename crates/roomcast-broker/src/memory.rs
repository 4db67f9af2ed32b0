//! In-process broker for Roomcast.
//!
//! Fans messages out over `tokio::sync::broadcast`, one channel per room.
//! Suitable for single-node deployments and tests; the channel table is the
//! only state, created implicitly on first subscribe and garbage-collected
//! once a publish finds no remaining receivers.

use crate::traits::{Broker, BrokerError, Delivery, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default per-channel broadcast capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An in-process pub/sub broker.
///
/// Deliveries reach every current subscriber of a channel, including the
/// publisher's own subscription, matching the self-delivery semantics of
/// channel-based brokers such as Redis.
pub struct MemoryBroker {
    /// Broadcast senders indexed by channel name.
    channels: DashMap<String, broadcast::Sender<Delivery>>,
    /// Per-channel buffer capacity.
    capacity: usize,
}

impl MemoryBroker {
    /// Create a new broker with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new broker with a specific per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of current subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let Some(tx) = self.channels.get(channel) else {
            trace!(channel = %channel, "Publish to channel with no subscribers");
            return Ok(());
        };

        if tx.receiver_count() == 0 {
            // Last subscriber is gone; the channel's existence ends with it.
            drop(tx);
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
            trace!(channel = %channel, "Deleted empty channel");
            return Ok(());
        }

        let recipients = tx
            .send(Delivery::new(channel, payload))
            .unwrap_or_default();
        trace!(channel = %channel, recipients = recipients, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let tx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                trace!(channel = %channel, "Creating channel");
                broadcast::channel(self.capacity).0
            });

        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            receiver: tx.subscribe(),
        }))
    }
}

/// Subscription backed by a broadcast receiver.
struct MemorySubscription {
    channel: String,
    receiver: broadcast::Receiver<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped = skipped, "Subscriber lagging, messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
