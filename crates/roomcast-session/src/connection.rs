//! Client connection seam for the relay.
//!
//! The session's two relay loops run as separate tasks, so the connection
//! splits into a send half and a receive half. Implementations adapt a
//! concrete duplex transport (the server provides an axum WebSocket one).

use async_trait::async_trait;
use thiserror::Error;

/// Client connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Failed to send a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// A duplex text-frame connection to a single client.
#[async_trait]
pub trait ClientConnection: Send + Sized + 'static {
    /// Send half handed to the outbound loop.
    type Sink: ClientSink;
    /// Receive half handed to the inbound loop.
    type Stream: ClientStream;

    /// Split the connection into its send and receive halves.
    fn split(self) -> (Self::Sink, Self::Stream);

    /// Close the connection with an error indication.
    ///
    /// Used before the relay starts, when session setup fails; the client
    /// must never be left hanging on an accepted but unrelayed connection.
    async fn close_with_error(self, reason: &str) -> Result<(), ConnectionError>;
}

/// The receive half of a client connection.
#[async_trait]
pub trait ClientStream: Send + 'static {
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` when the client disconnects cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ReceiveFailed`] on an abrupt failure.
    async fn next_text(&mut self) -> Result<Option<String>, ConnectionError>;
}

/// The send half of a client connection.
#[async_trait]
pub trait ClientSink: Send + 'static {
    /// Send a text frame to the client.
    async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}
