//! [`GatewayServer`] – HTTP + WebSocket front door of the live subsystem.
//!
//! Listens on `127.0.0.1:8000` by default (see [`GatewayServer::with_host`]
//! and [`GatewayServer::with_port`]).
//!
//! * WebSocket upgrades on a live path → one [`Connection`][smartanom_hub::Connection]
//!   bridged to the socket.
//! * Everything else → the JSON API or the embedded test page.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{Html, IntoResponse, Response},
    routing::{MethodRouter, get},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use smartanom_hub::{Hub, OpenedConnection, OutboundFrame};
use smartanom_store::SqliteStore;
use smartanom_types::{SmartanomError, TopicKey};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::api::{self, ApiError};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8000;
/// Default bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// The compiled-in WebSocket test page.
const TEST_PAGE_HTML: &str = include_str!("websocket_test.html");

type WsSink = SplitSink<WebSocket, Message>;

/// Router state shared by every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hub: Hub,
    pub(crate) store: Arc<SqliteStore>,
    /// Live sessions run outside the HTTP server once upgraded; tracked here
    /// so shutdown can wait for them.
    pub(crate) sessions: TaskTracker,
    pub(crate) shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

/// Serves the live WebSocket endpoints and the JSON API.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use smartanom_gateway::GatewayServer;
/// use smartanom_hub::{Hub, HubSettings};
/// use smartanom_store::SqliteStore;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(SqliteStore::open("smartanom.db").unwrap());
///     let hub = Hub::from_sqlite(Arc::clone(&store), HubSettings::default());
///     GatewayServer::new(hub, store)
///         .run(CancellationToken::new())
///         .await
///         .unwrap();
/// }
/// ```
pub struct GatewayServer {
    hub: Hub,
    store: Arc<SqliteStore>,
    host: String,
    port: u16,
}

impl GatewayServer {
    /// Create a server on [`DEFAULT_HOST`]:[`DEFAULT_PORT`].
    ///
    /// `hub` must have been built over `store` (see [`Hub::from_sqlite`]).
    pub fn new(hub: Hub, store: Arc<SqliteStore>) -> Self {
        Self {
            hub,
            store,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SmartanomError::Transport`] if the TCP listener cannot bind.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SmartanomError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SmartanomError::Transport(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// On shutdown every open connection is sent a close frame and removed
    /// from the registry before this returns.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SmartanomError> {
        let local = listener
            .local_addr()
            .map_err(|e| SmartanomError::Transport(e.to_string()))?;
        info!(%local, "gateway listening");

        let sessions = TaskTracker::new();
        let app = router(AppState {
            hub: self.hub,
            store: self.store,
            sessions: sessions.clone(),
            shutdown: shutdown.clone(),
        });

        let signal = shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
        .map_err(|e| SmartanomError::Transport(format!("server error on {local}: {e}")))?;

        sessions.close();
        sessions.wait().await;
        info!(%local, "gateway stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub(crate) fn router(state: AppState) -> Router {
    let app = Router::new().route("/", get(test_page));
    let app = with_slash(app, "/websocket-test", get(test_page));
    let app = with_slash(app, "/ws/sensor-data", get(live_global));
    let app = with_slash(app, "/ws/device/{device_id}", get(live_device));
    let app = with_slash(app, "/ws/sensor/{sensor_id}", get(live_sensor));

    app.merge(api::routes())
        .fallback(api::not_found)
        .with_state(state)
}

/// Register `path` both with and without a trailing slash.
pub(crate) fn with_slash(
    router: Router<AppState>,
    path: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(path, handler.clone())
        .route(&format!("{path}/"), handler)
}

async fn test_page() -> Html<&'static str> {
    Html(TEST_PAGE_HTML)
}

// ---------------------------------------------------------------------------
// WebSocket: one Connection per socket
// ---------------------------------------------------------------------------

async fn live_global(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, peer, state, TopicKey::Global).await
}

async fn live_device(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    match device_id.parse() {
        Ok(id) => upgrade(ws, peer, state, TopicKey::Device(id)).await,
        Err(_) => ApiError::not_found().into_response(),
    }
}

async fn live_sensor(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Response {
    match sensor_id.parse() {
        Ok(id) => upgrade(ws, peer, state, TopicKey::Sensor(id)).await,
        Err(_) => ApiError::not_found().into_response(),
    }
}

/// Open the connection first and only then accept the handshake, so a
/// refused connect never sees a WebSocket frame.
async fn upgrade(ws: WebSocketUpgrade, peer: SocketAddr, state: AppState, topic: TopicKey) -> Response {
    let opened = match state.hub.open(topic).await {
        Ok(opened) => opened,
        Err(e) => {
            info!(%peer, %topic, error = %e, "connection refused");
            return match e {
                SmartanomError::NotFound { .. } => ApiError::not_found(),
                SmartanomError::Transport(_) => {
                    ApiError::Unavailable("Too many connections".to_string())
                }
                other => ApiError::Internal(other.to_string()),
            }
            .into_response();
        }
    };

    let sessions = state.sessions.clone();
    let shutdown = state.shutdown.clone();
    // If the upgrade never completes the callback is dropped, and with it
    // the connection, which leaves the registry on drop.
    ws.on_failed_upgrade(move |e| debug!(%peer, %topic, error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| sessions.track_future(live_session(socket, opened, peer, shutdown)))
}

async fn live_session(
    socket: WebSocket,
    opened: OpenedConnection,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let OpenedConnection {
        mut connection,
        mut outbound,
        welcome,
    } = opened;
    let topic = connection.topic();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let reason = if send_frame(&mut ws_tx, &welcome).await.is_err() {
        "send failed"
    } else {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break "server shutdown";
                }
                // ── Downstream: broadcasts → client ──────────────────────────
                Some(payload) = outbound.recv() => {
                    if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break "send failed";
                    }
                }
                // ── Upstream: client frames → dispatcher ────────────────────
                msg = ws_rx.next() => {
                    let reply = match msg {
                        Some(Ok(Message::Text(text))) => connection.dispatch(text.as_str()).await,
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => connection.dispatch(text).await,
                            Err(_) => Some(OutboundFrame::error("Frame is not valid UTF-8")),
                        },
                        Some(Ok(Message::Close(_))) | None => break "client closed",
                        Some(Err(_)) => break "transport error",
                        Some(Ok(_)) => None,
                    };
                    if let Some(reply) = reply
                        && send_frame(&mut ws_tx, &reply).await.is_err()
                    {
                        break "send failed";
                    }
                }
            }
        }
    };

    connection.close();
    debug!(%peer, %topic, reason, "live session ended");
}

async fn send_frame(ws_tx: &mut WsSink, frame: &OutboundFrame) -> Result<(), SmartanomError> {
    let text = frame.to_json()?;
    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| SmartanomError::Transport(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
