//! Remote broker client.
//!
//! Connects to an external pub/sub service over a WebSocket and speaks a
//! small text protocol, one command per frame:
//!
//! - upstream: `AUTH <secret>`, `SUB <channel>`, `PUB <channel> <payload>`
//! - downstream: `+OK <detail>` / `-ERR <detail>` control frames,
//!   `MSG <channel> <payload>` deliveries
//!
//! The connection's read half is consumed by the (single) subscription;
//! control frames are filtered there and never reach the relay loops.

use crate::traits::{Broker, BrokerError, Delivery, Subscription};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Validate a channel name against the space-delimited wire framing.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidChannel`] if the name cannot be framed.
pub fn validate_channel(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() {
        return Err(BrokerError::InvalidChannel("channel name cannot be empty"));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BrokerError::InvalidChannel(
            "channel name contains whitespace or control characters",
        ));
    }
    Ok(())
}

/// Parse a downstream frame into a delivery.
///
/// Control frames and anything else that is not a `MSG` yield `None`.
fn parse_delivery(line: &str) -> Option<Delivery> {
    let rest = line.strip_prefix("MSG ")?;
    let (channel, payload) = rest.split_once(' ')?;
    Some(Delivery::new(channel, payload))
}

/// A client connection to an external pub/sub broker.
///
/// One logical subscription per connection: `subscribe` hands the read half
/// to the returned subscription, and a second call fails. The write half is
/// shared behind a mutex so publishes can run concurrently with the
/// subscription stream.
pub struct RemoteBroker {
    sink: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
}

impl RemoteBroker {
    /// Connect to the broker, optionally authenticating.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the broker is unreachable or
    /// rejects the credential handshake. The caller must treat this as
    /// fatal for the session being established.
    pub async fn connect(url: &str, credentials: Option<&str>) -> Result<Self, BrokerError> {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        if let Some(secret) = credentials {
            ws.send(Message::Text(format!("AUTH {secret}")))
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            await_ack(&mut ws, BrokerError::Connection).await?;
        }

        info!(url = %url, "Connected to broker");

        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(Some(stream)),
        })
    }
}

/// Read frames until the broker acks (`+OK`) or rejects (`-ERR`) the
/// pending command.
async fn await_ack<S>(
    stream: &mut S,
    to_error: fn(String) -> BrokerError,
) -> Result<(), BrokerError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(line))) => {
                if line.starts_with("+OK") {
                    return Ok(());
                }
                if let Some(detail) = line.strip_prefix("-ERR ") {
                    return Err(to_error(detail.to_string()));
                }
                trace!(line = %line, "Ignoring frame while awaiting ack");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(to_error(e.to_string())),
            None => return Err(to_error("broker closed the connection".to_string())),
        }
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        validate_channel(channel)?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(format!("PUB {channel} {payload}")))
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        validate_channel(channel)?;

        // The subscription consumes the connection's only read stream.
        let mut stream = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(BrokerError::Subscribe(
                "subscription stream already in use".to_string(),
            ))?;

        {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(format!("SUB {channel}")))
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }

        await_ack(&mut stream, BrokerError::Subscribe).await?;
        debug!(channel = %channel, "Subscribed");

        Ok(Box::new(RemoteSubscription {
            channel: channel.to_string(),
            stream,
        }))
    }
}

/// Subscription backed by the connection's read half.
struct RemoteSubscription {
    channel: String,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Subscription for RemoteSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(line))) => {
                    if let Some(delivery) = parse_delivery(&line) {
                        return Ok(Some(delivery));
                    }
                    trace!(channel = %self.channel, line = %line, "Ignoring control frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    debug!(channel = %self.channel, "Ignoring binary frame from broker");
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BrokerError::Stream(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}
