//! HTTP and WebSocket handlers for the Roomcast server.
//!
//! The endpoint layer accepts duplex connections at
//! `/ws/{room_id}/{client_id}` and runs one relay session per accepted
//! connection; the accept handler's lifetime equals the session's. No
//! session table or room registry is kept here: a room exists purely as a
//! broker channel name.

use crate::config::{BrokerMode, BrokerSettings, Config};
use crate::metrics::{self, SessionMetricsGuard};
use crate::ws::WsClientConnection;
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use roomcast_broker::{Broker, BrokerError, MemoryBroker, RemoteBroker};
use roomcast_session::{ClientConnection, Session};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, Instrument};

/// Hands each session its broker.
///
/// Remote mode opens one broker connection per session; memory mode shares
/// the process-wide broker, which then does the fan-out itself.
pub enum BrokerProvider {
    Memory(Arc<MemoryBroker>),
    Remote { url: String, password: Option<String> },
}

impl BrokerProvider {
    /// Build a provider from configuration.
    #[must_use]
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        match settings.mode {
            BrokerMode::Memory => Self::Memory(Arc::new(MemoryBroker::new())),
            BrokerMode::Remote => Self::Remote {
                url: settings.url.clone(),
                password: settings.password.clone(),
            },
        }
    }

    /// Get a broker handle for one session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the remote broker is
    /// unreachable; fatal for the session being established.
    pub async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        match self {
            Self::Memory(broker) => Ok(Arc::clone(broker) as Arc<dyn Broker>),
            Self::Remote { url, password } => {
                let broker = RemoteBroker::connect(url, password.as_deref()).await?;
                Ok(Arc::new(broker))
            }
        }
    }
}

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Broker source for new sessions.
    pub broker: BrokerProvider,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker = BrokerProvider::from_settings(&config.broker);
        Self { config, broker }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config));

    // Start metrics server if enabled
    if state.config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(state.config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = state.config.bind_addr()?;

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health-check", get(health_handler))
        .route("/ws/:room_id/:client_id", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind(addr).await?;

    info!("Roomcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/{{room_id}}/{{client_id}}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Liveness probe.
async fn health_handler() -> &'static str {
    "healthy"
}

/// Demo chat page.
async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

/// WebSocket upgrade handler.
///
/// Both path parameters are opaque; any value is accepted.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((room_id, client_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, client_id))
}

/// Run one relay session over an upgraded socket.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room_id: String, client_id: String) {
    let _metrics_guard = SessionMetricsGuard::new();
    let span = info_span!("session", room = %room_id, client = %client_id);

    let broker = match state.broker.connect().await {
        Ok(broker) => broker,
        Err(err) => {
            error!(
                room = %room_id,
                client = %client_id,
                error = %err,
                "Broker connect failed, closing client connection"
            );
            metrics::record_error("broker_connect");
            let connection = WsClientConnection::new(socket);
            if let Err(close_err) = connection.close_with_error("broker unavailable").await {
                debug!(error = %close_err, "Close after failed broker connect also failed");
            }
            return;
        }
    };

    let mut session = Session::new(room_id, client_id);
    match session
        .run(WsClientConnection::new(socket), broker)
        .instrument(span)
        .await
    {
        Ok(outcome) => debug!(outcome = ?outcome, "Session finished"),
        Err(err) => {
            debug!(error = %err, "Session never reached relaying");
            metrics::record_error("session_setup");
        }
    }
}
