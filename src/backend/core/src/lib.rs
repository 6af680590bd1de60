#![allow(clippy::result_large_err)]
//! # Parley Core
//!
//! Real-time core of a chat backend: live connections, presence and event
//! fan-out.
//!
//! ## Architecture
//!
//! - **Connection Registry**: every live connection with its user and chat
//! - **Presence Tracker**: per-user online status across devices
//! - **Ingest Bridge**: persists inbound messages and enriches them for delivery
//! - **Broadcast Router**: targeted fan-out with dead connection pruning
//! - **Command Dispatcher**: edits and deletions with author checks
//! - **API**: WebSocket upgrade plus the REST endpoints that trigger fan-out
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod telemetry;
pub mod websocket;

/// Identifier of a user.
pub type UserId = i64;
/// Identifier of a direct or group chat.
pub type ChatId = i64;
/// Identifier of a stored message.
pub type MessageId = i64;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, ParleyError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::config::{Config, WebSocketConfig};
    pub use crate::db::{ChatStore, MemoryChatStore, PgChatStore};
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, ParleyError, Result};
    pub use crate::websocket::{
        BroadcastRouter, ChatMessage, ClientCommand, ClientFrame, CommandDispatcher,
        ConnectionId, ConnectionRegistry, ConnectionSession, DeliveryReport, DispatchOutcome,
        InboundMessage, MessageIngest, Notification, OutboundEvent, PresenceTracker,
        TargetingRule, WebSocketState, WebSocketStats,
    };
    pub use crate::{ChatId, MessageId, UserId};
}
