//! HTTP layer for Parley.
//!
//! Serves the WebSocket upgrade entrypoint plus the REST endpoints whose
//! effects are fanned out to live connections (reactions, forwards, chat
//! creation), the presence query, health and Prometheus metrics.

mod handlers;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::db::ChatStore;
use crate::telemetry::MetricsRegistry;
use crate::websocket::{ws_upgrade_handler, WebSocketState};

pub use handlers::{
    AddReactionRequest, CreateChatForm, CreateChatResponse, ForwardMessageRequest,
    GroupChatResponse, HealthResponse, UserStatusQuery, UserStatusResponse,
};

/// Largest accepted group creation form, image included.
pub const GROUP_FORM_LIMIT: usize = 10 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub ws: Arc<WebSocketState>,
    pub store: Arc<dyn ChatStore>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>, ws: Arc<WebSocketState>, metrics: MetricsRegistry) -> Self {
        Self { ws, store, metrics }
    }
}

/// Build the API router.
///
/// ```rust,ignore
/// let state = AppState::new(store, ws, metrics);
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/ws", get(ws_upgrade_handler))
        .route("/user-status", get(handlers::user_status))
        .route("/add-reaction", post(handlers::add_reaction))
        .route("/forward-message", post(handlers::forward_message))
        .route("/chats", post(handlers::create_chat))
        .route(
            "/group-chats",
            post(handlers::create_group_chat).layer(DefaultBodyLimit::max(GROUP_FORM_LIMIT)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
