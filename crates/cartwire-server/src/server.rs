//! `CartwireServer`: wires every manager and serves HTTP + WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use cartwire_auth::{AuthStats, SessionAuthManager};
use cartwire_core::SessionId;
use cartwire_hub::{Hub, HubStats, QueueConfig, QueueStats, ReliableQueue};
use cartwire_settings::CartwireSettings;
use cartwire_sync::{
    CartConfig, CartManager, CartStats, InventoryConfig, InventoryManager, InventoryStats,
    NotificationConfig, NotificationManager, NotificationStats,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthResponse};
use crate::metrics::{AUTH_SESSIONS_ACTIVE, CARTS_ACTIVE, QUEUE_AWAITING_ACK, QUEUE_DEPTH};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::clients::{ClientConfig, ClientManager, ClientStats};
use crate::websocket::handler::Dispatcher;
use crate::websocket::transport::split_websocket;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection lifecycle.
    pub clients: Arc<ClientManager>,
    /// Sessions.
    pub auth: Arc<SessionAuthManager>,
    /// Reliable delivery.
    pub queue: Arc<ReliableQueue>,
    /// Carts.
    pub carts: Arc<CartManager>,
    /// Inventory broadcasts.
    pub inventory: Arc<InventoryManager>,
    /// Notifications.
    pub notifications: Arc<NotificationManager>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// Snapshot of every manager's counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            hub: self.clients.hub().stats(),
            clients: self.clients.stats(),
            auth: self.auth.stats(),
            queue: self.queue.stats(),
            carts: self.carts.stats(),
            inventory: self.inventory.stats(),
            notifications: self.notifications.stats(),
        }
    }
}

/// `/stats` response body.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Registry and fan-out counters.
    pub hub: HubStats,
    /// Lifecycle counters.
    pub clients: ClientStats,
    /// Session counters.
    pub auth: AuthStats,
    /// Queue counters.
    pub queue: QueueStats,
    /// Cart counters.
    pub carts: CartStats,
    /// Inventory broadcast counters.
    pub inventory: InventoryStats,
    /// Notification counters.
    pub notifications: NotificationStats,
}

/// The cartwire server.
pub struct CartwireServer {
    settings: CartwireSettings,
    state: AppState,
}

impl CartwireServer {
    /// Build every manager from `settings`.
    pub fn new(settings: CartwireSettings) -> Self {
        let hub = Arc::new(Hub::new());
        let queue = Arc::new(ReliableQueue::new(
            QueueConfig::from(&settings.queue),
            Arc::clone(&hub),
        ));
        let auth = Arc::new(SessionAuthManager::from_settings(&settings.auth));
        let carts = Arc::new(CartManager::new(
            CartConfig::from(&settings.cart),
            Arc::clone(&hub),
        ));
        let inventory = Arc::new(InventoryManager::new(
            InventoryConfig::from(&settings.inventory),
            Arc::clone(&hub),
            Arc::clone(&queue),
        ));
        let notifications = Arc::new(NotificationManager::new(
            NotificationConfig::from(&settings.notifications),
            Arc::clone(&hub),
            Arc::clone(&queue),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&auth),
            Arc::clone(&carts),
            Arc::clone(&notifications),
            Arc::clone(&queue),
        ));
        let clients = Arc::new(ClientManager::new(
            ClientConfig::from(&settings.server),
            hub,
            dispatcher,
        ));

        let state = AppState {
            clients,
            auth,
            queue,
            carts,
            inventory,
            notifications,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        };
        Self { settings, state }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Spawn every background sweep. Each stops when the shutdown token is
    /// cancelled.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let token = self.state.shutdown.token();
        vec![
            self.state.clients.start(token.clone()),
            self.state.auth.start(token.clone()),
            self.state.queue.start(token.clone()),
            self.state.carts.start(token.clone()),
            self.state.inventory.start(token.clone()),
            self.state.notifications.start(token),
        ]
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(token.cancelled_owned());
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
            info!("listener stopped");
        });
        info!(addr = %local_addr, "cartwire listening");
        Ok((local_addr, handle))
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Settings the server was built from.
    pub fn settings(&self) -> &CartwireSettings {
        &self.settings
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Hub.
    pub fn hub(&self) -> &Arc<Hub> {
        self.state.clients.hub()
    }

    /// Connection lifecycle.
    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.state.clients
    }

    /// Sessions.
    pub fn auth(&self) -> &Arc<SessionAuthManager> {
        &self.state.auth
    }

    /// Reliable queue.
    pub fn queue(&self) -> &Arc<ReliableQueue> {
        &self.state.queue
    }

    /// Carts.
    pub fn carts(&self) -> &Arc<CartManager> {
        &self.state.carts
    }

    /// Inventory broadcasts.
    pub fn inventory(&self) -> &Arc<InventoryManager> {
        &self.state.inventory
    }

    /// Notifications.
    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.state.notifications
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(&state.stats(), state.shutdown.is_shutting_down());
    Json(resp)
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<ServerStats> {
    Json(state.stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response();
    };
    let stats = state.stats();
    metrics::gauge!(QUEUE_DEPTH).set((stats.queue.depth + stats.queue.retry_depth) as f64);
    metrics::gauge!(QUEUE_AWAITING_ACK).set(stats.queue.awaiting_ack as f64);
    metrics::gauge!(AUTH_SESSIONS_ACTIVE).set(stats.auth.active_sessions as f64);
    metrics::gauge!(CARTS_ACTIVE).set(stats.carts.carts as f64);
    crate::metrics::render(handle).into_response()
}

/// Query string of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Session to join. A fresh session is minted when absent.
    pub session_id: Option<String>,
}

/// GET /ws
/// Frames up to this multiple of the payload limit are still read, so the
/// client gets a `message_too_large` reply instead of a dropped socket.
const TRANSPORT_HEADROOM: usize = 4;

/// Largest message or frame the WebSocket codec will buffer for a payload
/// limit of `max_message_bytes`.
pub(crate) fn transport_limit(max_message_bytes: usize) -> usize {
    max_message_bytes.saturating_mul(TRANSPORT_HEADROOM)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let max = state.clients.config().max_connections;
    if state.clients.connection_count() >= max {
        warn!(max, "refusing upgrade at connection limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map_or_else(SessionId::new, |s| SessionId::from(s.as_str()));

    let limit = transport_limit(state.clients.config().max_message_bytes);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            let (source, sink) = split_websocket(socket);
            if let Err(e) = state.clients.add_connection(source, sink, session_id) {
                warn!(code = e.code(), error = %e, "upgraded socket refused");
            }
        })
}
