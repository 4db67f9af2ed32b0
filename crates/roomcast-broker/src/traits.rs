//! Broker abstraction traits for Roomcast.
//!
//! These traits define the interface every broker implementation must provide,
//! allowing the relay core to be broker-agnostic.

use async_trait::async_trait;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker was unreachable or rejected the connection handshake.
    ///
    /// Fatal for the session being established: the session is aborted,
    /// not retried.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// A publish could not be handed to the broker.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A subscription could not be established.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The subscription stream broke after it was established.
    #[error("Subscription stream failed: {0}")]
    Stream(String),

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),
}

/// A message delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel the message was published to.
    pub channel: String,
    /// Message payload, forwarded verbatim to clients.
    pub payload: String,
}

impl Delivery {
    /// Create a new delivery.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A handle to a pub/sub broker.
///
/// Publishing is best-effort and unacknowledged. The handle is effectively
/// append-only, so it can be shared freely across a session's relay loops.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publish`] if the underlying transport is broken.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to a channel.
    ///
    /// The returned subscription yields messages published strictly after
    /// the subscription completes; there is no replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A lazy, unbounded, non-restartable stream of channel deliveries.
///
/// Implementations consume any subscription-management control traffic
/// (acknowledgments, heartbeats) internally; `next` yields message
/// deliveries only.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next delivery.
    ///
    /// Returns `Ok(None)` when the broker ends the stream cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Stream`] if the stream breaks.
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;
}
