//! Real-time connection core.
//!
//! This module provides:
//! - A registry of live connections with their user and chat identity
//! - Per-user presence that survives multiple devices
//! - The ingest bridge from inbound messages to the chat store
//! - Targeted fan-out with per-recipient `isMe` and dead connection pruning
//! - Command dispatch for edits and deletions
//! - The upgrade entrypoint and per-connection socket loop

mod broadcast;
mod dispatcher;
mod handler;
mod ingest;
mod message;
mod presence;
mod registry;
mod session;

pub use broadcast::{BroadcastRouter, BroadcastStats, DeliveryReport, TargetingRule};
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use handler::{parse_id, ws_upgrade_handler, WsConnectParams};
pub use ingest::{MessageIngest, UNKNOWN_SENDER};
pub use message::{
    format_timestamp, ChatMessage, ClientCommand, ClientFrame, InboundMessage, Notification,
    OutboundEvent, RawCommand,
};
pub use presence::{PresenceState, PresenceTracker};
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRecord, ConnectionRegistry,
    RegistryStats,
};
pub use session::ConnectionSession;

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::WebSocketConfig;
use crate::db::ChatStore;
use crate::telemetry::{ConnectionMetrics, FrameMetrics};
use crate::UserId;

/// Shared state for the real-time core.
pub struct WebSocketState {
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub router: Arc<BroadcastRouter>,
    pub ingest: MessageIngest,
    pub dispatcher: CommandDispatcher,
    pub config: WebSocketConfig,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl WebSocketState {
    pub fn new(store: Arc<dyn ChatStore>, config: WebSocketConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let ingest = MessageIngest::new(store);
        let dispatcher = CommandDispatcher::new(ingest.clone(), router.clone());

        Self {
            registry,
            presence: Arc::new(PresenceTracker::new()),
            router,
            ingest,
            dispatcher,
            config,
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        self.ingest.store()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.is_online(user_id)
    }

    /// Count a new connection for `user_id`. The first one announces the
    /// user online to every connection.
    pub fn user_connected(&self, user_id: UserId) -> bool {
        self.presence
            .connect(user_id, |online_users| self.announce_status(user_id, true, online_users))
    }

    /// Release a connection for `user_id`. The last one announces the user
    /// offline to every connection.
    pub fn user_disconnected(&self, user_id: UserId) -> bool {
        self.presence
            .disconnect(user_id, |online_users| self.announce_status(user_id, false, online_users))
    }

    // Runs under the presence lock, so announcements keep transition order.
    fn announce_status(&self, user_id: UserId, online: bool, online_users: usize) {
        ConnectionMetrics::set_users_online(online_users);
        let event = OutboundEvent::from(Notification::UserStatus { user_id, online });
        self.router.deliver(&event, &TargetingRule::AllConnections, None);
    }

    /// Send the status of every known user to a single connection as one
    /// `presence_snapshot` frame. Nothing is sent when no user is known.
    ///
    /// Returns whether the frame was queued.
    pub fn send_presence_snapshot(&self, id: ConnectionId) -> bool {
        let Some(handle) = self.registry.handle(id) else {
            return false;
        };
        let statuses = self.presence.snapshot();
        if statuses.is_empty() {
            return false;
        }

        let users = statuses.len();
        let frame = match serde_json::to_string(&Notification::PresenceSnapshot { statuses }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to serialize presence snapshot");
                return false;
            }
        };
        match handle.try_send(Message::Text(frame)) {
            Ok(()) => {
                debug!(connection_id = %id, users = users, "Presence snapshot sent");
                true
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Presence snapshot not sent");
                false
            }
        }
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        FrameMetrics::record_received();
    }

    pub(crate) fn record_frame_dropped(&self, reason: &'static str) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        FrameMetrics::record_dropped(reason);
    }

    pub fn stats(&self) -> WebSocketStats {
        let registry = self.registry.stats();
        let router = self.router.stats();
        WebSocketStats {
            active_connections: registry.active_connections,
            total_connections: registry.total_connections,
            total_disconnections: registry.total_disconnections,
            online_users: self.presence.online_count(),
            events_delivered: router.total_delivered,
            delivery_failures: router.total_failed,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of real-time activity, reported by `/health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSocketStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub online_users: usize,
    pub events_delivered: u64,
    pub delivery_failures: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}
