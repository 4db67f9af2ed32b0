//! The relay state machine.
//!
//! A session owns one client connection and one broker subscription, bound
//! to exactly one room. It joins the room, runs the inbound and outbound
//! relay loops concurrently, and tears both down the moment either one
//! finishes, whatever the reason.

use crate::connection::{ClientConnection, ClientSink, ClientStream};
use crate::message;
use roomcast_broker::{Broker, BrokerError, Subscription};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, debug_span, error, warn, Instrument};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Establishing the broker subscription and publishing the join notice.
    Joining,
    /// Both relay loops running.
    Relaying,
    /// One loop finished; the sibling is being cancelled.
    Closing,
    /// Subscription and connection released. Terminal.
    Closed,
}

/// Why a session's relay phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client connection closed or errored while reading. Expected.
    ClientDisconnected,
    /// The broker stream or a client write failed.
    RelayFailure,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The broker was unusable while the session was being established.
    /// The client connection has been closed with an error indication.
    #[error("Session setup failed: {0}")]
    Setup(#[from] BrokerError),
}

/// A relay session pairing one client connection with one room subscription.
pub struct Session {
    room: String,
    client_id: String,
    state: SessionState,
}

impl Session {
    /// Create a session in the `Joining` state.
    ///
    /// Both identifiers are opaque; neither is validated.
    #[must_use]
    pub fn new(room: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            client_id: client_id.into(),
            state: SessionState::Joining,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The room this session is bound to.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Drive the session to completion. Call once.
    ///
    /// Subscribes to the session's room, publishes the join notice, then
    /// relays until either loop finishes. On return the subscription and
    /// the connection have both been released.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Setup`] if the broker is unusable before the
    /// relay starts; the client connection is closed before returning.
    pub async fn run<C: ClientConnection>(
        &mut self,
        connection: C,
        broker: Arc<dyn Broker>,
    ) -> Result<SessionOutcome, SessionError> {
        let subscription = match broker.subscribe(&self.room).await {
            Ok(subscription) => subscription,
            Err(err) => return self.abort_setup(connection, err).await,
        };

        let join_notice = message::joined(&self.room, &self.client_id);
        if let Err(err) = broker.publish(&self.room, &join_notice).await {
            return self.abort_setup(connection, err).await;
        }

        self.state = SessionState::Relaying;
        debug!(room = %self.room, client = %self.client_id, "Relaying");

        let (sink, stream) = connection.split();

        let mut inbound = tokio::spawn(
            inbound_loop(
                stream,
                Arc::clone(&broker),
                self.room.clone(),
                self.client_id.clone(),
            )
            .instrument(debug_span!("inbound")),
        );
        let mut outbound =
            tokio::spawn(outbound_loop(subscription, sink).instrument(debug_span!("outbound")));

        // First loop to finish wins the race.
        let finished = tokio::select! {
            res = &mut inbound => Finished::Inbound(res),
            res = &mut outbound => Finished::Outbound(res),
        };

        self.state = SessionState::Closing;

        // Cancel the sibling and await it, so no wait is left pending on
        // the connection or the subscription when we report back.
        let outcome = match finished {
            Finished::Inbound(res) => {
                outbound.abort();
                let _ = outbound.await;
                resolve(res)
            }
            Finished::Outbound(res) => {
                inbound.abort();
                let _ = inbound.await;
                resolve(res)
            }
        };

        self.state = SessionState::Closed;
        debug!(room = %self.room, client = %self.client_id, outcome = ?outcome, "Session closed");
        Ok(outcome)
    }

    /// Tear down a session that never reached `Relaying`, closing the
    /// client connection so it is not left accepted but unrelayed.
    async fn abort_setup<C: ClientConnection>(
        &mut self,
        connection: C,
        err: BrokerError,
    ) -> Result<SessionOutcome, SessionError> {
        warn!(
            room = %self.room,
            client = %self.client_id,
            error = %err,
            "Session setup failed, closing client connection"
        );
        if let Err(close_err) = connection.close_with_error("broker unavailable").await {
            debug!(error = %close_err, "Close after failed setup also failed");
        }
        self.state = SessionState::Closed;
        Err(SessionError::Setup(err))
    }
}

/// Which relay loop finished first.
enum Finished {
    Inbound(Result<SessionOutcome, JoinError>),
    Outbound(Result<SessionOutcome, JoinError>),
}

fn resolve(res: Result<SessionOutcome, JoinError>) -> SessionOutcome {
    match res {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "Relay loop failed to complete");
            SessionOutcome::RelayFailure
        }
    }
}

/// Bridge the client connection to the broker: each non-empty text frame
/// becomes a formatted chat publish to the session's room.
async fn inbound_loop<S: ClientStream>(
    mut stream: S,
    broker: Arc<dyn Broker>,
    room: String,
    client_id: String,
) -> SessionOutcome {
    loop {
        match stream.next_text().await {
            Ok(Some(text)) => {
                if text.is_empty() {
                    continue;
                }
                let line = message::chat(&room, &client_id, &text);
                if let Err(err) = broker.publish(&room, &line).await {
                    error!(room = %room, client = %client_id, error = %err, "Publish failed");
                    return SessionOutcome::RelayFailure;
                }
            }
            Ok(None) => {
                debug!(room = %room, client = %client_id, "Client disconnected");
                publish_leave(broker.as_ref(), &room, &client_id).await;
                return SessionOutcome::ClientDisconnected;
            }
            Err(err) => {
                // Abrupt disconnects take the same leave path as clean ones.
                debug!(room = %room, client = %client_id, error = %err, "Client read failed");
                publish_leave(broker.as_ref(), &room, &client_id).await;
                return SessionOutcome::ClientDisconnected;
            }
        }
    }
}

async fn publish_leave(broker: &dyn Broker, room: &str, client_id: &str) {
    if let Err(err) = broker.publish(room, &message::left(room, client_id)).await {
        error!(room = %room, client = %client_id, error = %err, "Leave notice publish failed");
    }
}

/// Bridge the broker back to the client: each delivery's payload is
/// forwarded verbatim as a text frame.
async fn outbound_loop<K: ClientSink>(
    mut subscription: Box<dyn Subscription>,
    mut sink: K,
) -> SessionOutcome {
    loop {
        match subscription.next().await {
            Ok(Some(delivery)) => {
                if let Err(err) = sink.send_text(&delivery.payload).await {
                    error!(channel = %delivery.channel, error = %err, "Write to client failed");
                    return SessionOutcome::RelayFailure;
                }
            }
            Ok(None) => {
                warn!("Broker stream ended");
                let _ = sink.close().await;
                return SessionOutcome::RelayFailure;
            }
            Err(err) => {
                error!(error = %err, "Broker stream failed");
                let _ = sink.close().await;
                return SessionOutcome::RelayFailure;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionError;
    use async_trait::async_trait;
    use roomcast_broker::{Delivery, MemoryBroker};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Server-side test double for a duplex client connection.
    struct TestConnection {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
        closed_with_error: Arc<AtomicBool>,
    }

    struct TestStream {
        incoming: mpsc::UnboundedReceiver<String>,
    }

    struct TestSink {
        outgoing: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl ClientConnection for TestConnection {
        type Sink = TestSink;
        type Stream = TestStream;

        fn split(self) -> (TestSink, TestStream) {
            (
                TestSink {
                    outgoing: self.outgoing,
                },
                TestStream {
                    incoming: self.incoming,
                },
            )
        }

        async fn close_with_error(self, _reason: &str) -> Result<(), ConnectionError> {
            self.closed_with_error.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ClientStream for TestStream {
        async fn next_text(&mut self) -> Result<Option<String>, ConnectionError> {
            Ok(self.incoming.recv().await)
        }
    }

    #[async_trait]
    impl ClientSink for TestSink {
        async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
            self.outgoing
                .send(text.to_string())
                .map_err(|_| ConnectionError::Closed)
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    /// The client's side of a [`TestConnection`].
    struct TestClient {
        to_server: Option<mpsc::UnboundedSender<String>>,
        from_server: Option<mpsc::UnboundedReceiver<String>>,
        closed_with_error: Arc<AtomicBool>,
    }

    impl TestClient {
        fn send(&self, text: &str) {
            self.to_server
                .as_ref()
                .expect("client already disconnected")
                .send(text.to_string())
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            match self.from_server.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        }

        /// Simulate the client going away.
        fn disconnect(&mut self) {
            self.to_server = None;
        }

        /// Simulate a broken downstream: the server's next write fails.
        fn stop_reading(&mut self) {
            self.from_server = None;
        }

        fn was_closed_with_error(&self) -> bool {
            self.closed_with_error.load(Ordering::SeqCst)
        }
    }

    fn test_connection() -> (TestConnection, TestClient) {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        let closed_with_error = Arc::new(AtomicBool::new(false));

        (
            TestConnection {
                incoming,
                outgoing,
                closed_with_error: Arc::clone(&closed_with_error),
            },
            TestClient {
                to_server: Some(to_server),
                from_server: Some(from_server),
                closed_with_error,
            },
        )
    }

    fn spawn_session(
        room: &str,
        client_id: &str,
        connection: TestConnection,
        broker: Arc<dyn Broker>,
    ) -> tokio::task::JoinHandle<Result<SessionOutcome, SessionError>> {
        let mut session = Session::new(room, client_id);
        tokio::spawn(async move { session.run(connection, broker).await })
    }

    /// Broker that is unreachable from the start.
    struct UnreachableBroker;

    #[async_trait]
    impl Broker for UnreachableBroker {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BrokerError> {
            Err(BrokerError::Connection("connection refused".to_string()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            Err(BrokerError::Connection("connection refused".to_string()))
        }
    }

    /// Broker whose transport breaks between subscribe and publish.
    struct PublishFailsBroker {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl Broker for PublishFailsBroker {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BrokerError> {
            Err(BrokerError::Publish("transport broken".to_string()))
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            self.inner.subscribe(channel).await
        }
    }

    /// Broker whose subscription stream fails as soon as it is read.
    struct BrokenStreamBroker;

    struct BrokenStream;

    #[async_trait]
    impl Subscription for BrokenStream {
        async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
            Err(BrokerError::Stream("stream reset".to_string()))
        }
    }

    #[async_trait]
    impl Broker for BrokenStreamBroker {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
            Ok(Box::new(BrokenStream))
        }
    }

    #[tokio::test]
    async fn test_chat_relayed_between_sessions() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (conn_a, mut client_a) = test_connection();
        let a = spawn_session("lobby", "1", conn_a, Arc::clone(&broker));
        // A's own join notice confirms its subscription is live.
        assert_eq!(client_a.recv().await.unwrap(), "Client 1 joined the lobby");

        let (conn_b, mut client_b) = test_connection();
        let b = spawn_session("lobby", "2", conn_b, Arc::clone(&broker));
        assert_eq!(client_b.recv().await.unwrap(), "Client 2 joined the lobby");
        assert_eq!(client_a.recv().await.unwrap(), "Client 2 joined the lobby");

        client_a.send("hi");
        assert_eq!(client_b.recv().await.unwrap(), "[lobby]1: hi");
        // The broker delivers to the publisher's own subscription too.
        assert_eq!(client_a.recv().await.unwrap(), "[lobby]1: hi");

        client_a.disconnect();
        assert_eq!(
            client_b.recv().await.unwrap(),
            "Client [lobby]1 left the chat"
        );
        assert_eq!(
            a.await.unwrap().unwrap(),
            SessionOutcome::ClientDisconnected
        );

        client_b.disconnect();
        assert_eq!(
            b.await.unwrap().unwrap(),
            SessionOutcome::ClientDisconnected
        );
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (conn_a, mut client_a) = test_connection();
        let _a = spawn_session("lobby", "1", conn_a, Arc::clone(&broker));
        assert_eq!(client_a.recv().await.unwrap(), "Client 1 joined the lobby");

        let (conn_c, mut client_c) = test_connection();
        let _c = spawn_session("other", "3", conn_c, Arc::clone(&broker));
        assert_eq!(client_c.recv().await.unwrap(), "Client 3 joined the other");

        client_a.send("hi");
        client_c.send("ping");

        // C's next delivery is its own message; the lobby chat never
        // crossed rooms.
        assert_eq!(client_c.recv().await.unwrap(), "[other]3: ping");
    }

    #[tokio::test]
    async fn test_late_joiner_misses_earlier_messages() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (conn_a, mut client_a) = test_connection();
        let _a = spawn_session("x", "1", conn_a, Arc::clone(&broker));
        assert_eq!(client_a.recv().await.unwrap(), "Client 1 joined the x");

        client_a.send("early");
        assert_eq!(client_a.recv().await.unwrap(), "[x]1: early");

        let (conn_b, mut client_b) = test_connection();
        let _b = spawn_session("x", "2", conn_b, Arc::clone(&broker));
        assert_eq!(client_b.recv().await.unwrap(), "Client 2 joined the x");

        client_a.send("late");
        // B sees everything from its subscription onwards, nothing before.
        assert_eq!(client_b.recv().await.unwrap(), "[x]1: late");
    }

    #[tokio::test]
    async fn test_empty_frames_are_not_relayed() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (conn_a, mut client_a) = test_connection();
        let _a = spawn_session("lobby", "1", conn_a, Arc::clone(&broker));
        assert_eq!(client_a.recv().await.unwrap(), "Client 1 joined the lobby");

        client_a.send("");
        client_a.send("x");

        assert_eq!(client_a.recv().await.unwrap(), "[lobby]1: x");
    }

    #[tokio::test]
    async fn test_join_and_leave_notices_published_once() {
        let broker = Arc::new(MemoryBroker::new());
        let mut watcher = broker.subscribe("solo").await.unwrap();

        let (conn, mut client) = test_connection();
        client.disconnect();

        let mut session = Session::new("solo", "9");
        assert_eq!(session.state(), SessionState::Joining);

        let broker_dyn: Arc<dyn Broker> = Arc::clone(&broker) as Arc<dyn Broker>;
        let outcome = session.run(conn, broker_dyn).await.unwrap();
        assert_eq!(outcome, SessionOutcome::ClientDisconnected);
        assert_eq!(session.state(), SessionState::Closed);

        broker.publish("solo", "sentinel").await.unwrap();

        assert_eq!(
            watcher.next().await.unwrap().unwrap().payload,
            "Client 9 joined the solo"
        );
        assert_eq!(
            watcher.next().await.unwrap().unwrap().payload,
            "Client [solo]9 left the chat"
        );
        // Nothing else was published in between or after.
        assert_eq!(watcher.next().await.unwrap().unwrap().payload, "sentinel");
    }

    #[tokio::test]
    async fn test_unreachable_broker_closes_client() {
        let (conn, client) = test_connection();

        let mut session = Session::new("lobby", "1");
        let err = session
            .run(conn, Arc::new(UnreachableBroker))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Setup(BrokerError::Connection(_))));
        assert!(client.was_closed_with_error());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_join_notice_publish_failure_is_fatal() {
        let (conn, client) = test_connection();
        let broker = Arc::new(PublishFailsBroker {
            inner: MemoryBroker::new(),
        });

        let mut session = Session::new("lobby", "1");
        let err = session.run(conn, broker).await.unwrap_err();

        assert!(matches!(err, SessionError::Setup(BrokerError::Publish(_))));
        assert!(client.was_closed_with_error());
    }

    #[tokio::test]
    async fn test_broker_stream_failure_is_relay_failure() {
        let (conn, _client) = test_connection();

        let mut session = Session::new("lobby", "1");
        let outcome = session
            .run(conn, Arc::new(BrokenStreamBroker))
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::RelayFailure);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_client_write_failure_is_relay_failure() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (conn_a, mut client_a) = test_connection();
        let _a = spawn_session("lobby", "1", conn_a, Arc::clone(&broker));
        assert_eq!(client_a.recv().await.unwrap(), "Client 1 joined the lobby");

        let (conn_b, mut client_b) = test_connection();
        let b = spawn_session("lobby", "2", conn_b, Arc::clone(&broker));
        assert_eq!(client_b.recv().await.unwrap(), "Client 2 joined the lobby");

        client_b.stop_reading();
        client_a.send("hi");

        assert_eq!(b.await.unwrap().unwrap(), SessionOutcome::RelayFailure);
    }

    #[tokio::test]
    async fn test_no_relay_after_close() {
        let broker = Arc::new(MemoryBroker::new());

        let (conn, mut client) = test_connection();
        let handle = spawn_session("lobby", "1", conn, Arc::clone(&broker) as Arc<dyn Broker>);
        assert_eq!(client.recv().await.unwrap(), "Client 1 joined the lobby");

        client.disconnect();
        assert_eq!(
            handle.await.unwrap().unwrap(),
            SessionOutcome::ClientDisconnected
        );

        // Published after the session closed; its connection must not see it.
        broker.publish("lobby", "late").await.unwrap();
        while let Some(text) = client.recv().await {
            assert_ne!(text, "late");
        }
    }
}
