//! Axum WebSocket adapter for the relay's connection seam.
//!
//! Maps the axum socket onto the session crate's `ClientConnection` traits:
//! text frames pass through, pings are answered by axum itself, binary
//! frames are ignored, and a close frame or stream end reads as a clean
//! disconnect.

use crate::metrics;
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_session::{ClientConnection, ClientSink, ClientStream, ConnectionError};
use tracing::debug;

/// A client connection backed by an axum WebSocket.
pub struct WsClientConnection {
    socket: WebSocket,
}

impl WsClientConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ClientConnection for WsClientConnection {
    type Sink = WsClientSink;
    type Stream = WsClientStream;

    fn split(self) -> (WsClientSink, WsClientStream) {
        let (sink, stream) = self.socket.split();
        (WsClientSink { sink }, WsClientStream { stream })
    }

    async fn close_with_error(mut self, reason: &str) -> Result<(), ConnectionError> {
        self.socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }
}

/// Receive half of an axum WebSocket.
pub struct WsClientStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl ClientStream for WsClientStream {
    async fn next_text(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    metrics::record_message(text.len(), "inbound");
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame");
                }
                // axum answers pings on its own
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(ConnectionError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Send half of an axum WebSocket.
pub struct WsClientSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ClientSink for WsClientSink {
    async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        metrics::record_message(text.len(), "outbound");
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }
}
