//! `ChatServer`: Axum HTTP + WebSocket server.
//!
//! Routes:
//! - `GET /ws/chat/{room}/` (trailing slash optional): WebSocket upgrade
//! - `GET /health`: liveness and counters
//! - `GET /metrics`: Prometheus text, when a recorder handle is attached

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use huddle_core::{ErrorBody, OutboundFrame, RoomName};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{self, Authenticator};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::room::RoomRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::FileStore;
use crate::websocket::session::{SessionContext, run_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session dependencies (registry, dispatcher, router, config).
    pub sessions: Arc<SessionContext>,
    /// Resolves session handles to display names.
    pub authenticator: Arc<dyn Authenticator>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The chat server.
pub struct ChatServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionContext>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ChatServer {
    /// Create a server with its auth and file storage collaborators.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(RoomRegistry::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let sessions = Arc::new(SessionContext::new(
            config.clone(),
            registry.clone(),
            store,
            shutdown.token(),
        ));
        Self {
            config,
            registry,
            sessions,
            authenticator,
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: self.sessions.clone(),
            authenticator: self.authenticator.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/chat/{room}", get(ws_handler))
            .route("/ws/chat/{room}/", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind to the configured address and serve until shutdown.
    ///
    /// Port `0` picks a free port; the bound address is returned. The
    /// server stops accepting when the shutdown token is cancelled.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, "listening");
        Ok((addr, handle))
    }

    /// Room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.sessions.registry;
    Json(health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.room_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws/chat/{room}/
///
/// Everything that can refuse the client happens before the upgrade, so a
/// refused client gets a plain HTTP error with an error frame body.
async fn ws_handler(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "server is shutting down".into(),
        );
    }

    let room = match RoomName::parse(&room) {
        Ok(room) => room,
        Err(e) => return refuse(StatusCode::BAD_REQUEST, e.code(), e.to_string()),
    };

    let handle = auth::session_handle(&headers, &query);
    let display_name = match state.authenticator.display_name(handle.as_deref()).await {
        Ok(name) => name,
        Err(e) => return refuse(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", e.to_string()),
    };

    let config = &state.sessions.config;
    let live = state.sessions.registry.connection_count();
    if live >= config.max_connections {
        warn!(live, max = config.max_connections, "connection limit reached");
        return refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVER_FULL",
            format!("connection limit of {} reached", config.max_connections),
        );
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            counter!(WS_REJECTED_TOTAL, "reason" => "not_upgradable").increment(1);
            return rejection.into_response();
        }
    };

    let sessions = state.sessions.clone();
    let shutdown = state.shutdown.clone();
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            // tracked so graceful shutdown waits for the close handshake
            shutdown.track(tokio::spawn(async move {
                let end = run_session(stream, sink, room, display_name, sessions).await;
                debug!(reason = end.label(), "session task finished");
            }));
        })
}

fn refuse(status: StatusCode, code: &'static str, message: String) -> Response {
    counter!(WS_REJECTED_TOTAL, "reason" => code).increment(1);
    debug!(%status, code, %message, "refusing websocket upgrade");
    let body = OutboundFrame::Error {
        error: ErrorBody {
            code: code.to_owned(),
            message,
        },
    };
    (status, Json(body)).into_response()
}
