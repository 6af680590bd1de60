//! Lifecycle of one live connection.
//!
//! Opening a session registers the connection and updates presence; the
//! matching teardown runs exactly once, from [`ConnectionSession::close`] or
//! from `Drop`, whichever comes first.

use axum::extract::ws::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::dispatcher::DispatchOutcome;
use super::registry::{ConnectionHandle, ConnectionId, ConnectionRecord};
use super::WebSocketState;
use crate::error::{ErrorCode, ParleyError, Result};
use crate::telemetry::ConnectionMetrics;
use crate::{ChatId, UserId};

/// A registered connection and the state it touches.
pub struct ConnectionSession {
    state: Arc<WebSocketState>,
    id: ConnectionId,
    user_id: UserId,
    chat_id: ChatId,
    handle: ConnectionHandle,
    closed: bool,
}

impl ConnectionSession {
    /// Register a connection and return it with the receiving end of its
    /// outbound queue.
    pub fn open(
        state: Arc<WebSocketState>,
        user_id: UserId,
        chat_id: ChatId,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel(state.config.outbound_buffer);
        let record = ConnectionRecord::new(user_id, chat_id, handle.clone());
        let id = record.id;

        state.registry.register(record);
        ConnectionMetrics::record_connected(state.registry.len());

        state.user_connected(user_id);
        if state.config.send_presence_snapshot {
            state.send_presence_snapshot(id);
        }

        info!(
            connection_id = %id,
            user_id = user_id,
            chat_id = chat_id,
            "Connection opened"
        );

        let session = Self {
            state,
            id,
            user_id,
            chat_id,
            handle,
            closed: false,
        };
        (session, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Cancelled when the connection should stop, by the router or by
    /// teardown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.handle.shutdown_token()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle one text frame from the client.
    pub async fn handle_frame(&self, text: &str) -> Result<DispatchOutcome> {
        self.state.record_frame_received();
        let outcome = self.state.dispatcher.dispatch(text, self.id).await;

        match &outcome {
            Ok(DispatchOutcome::Rejected { .. }) => self.state.record_frame_dropped("unauthorized"),
            Err(e) => self.state.record_frame_dropped(drop_reason(e)),
            Ok(_) => {}
        }
        outcome
    }

    /// Queue a protocol ping.
    pub fn ping(&self) -> Result<()> {
        self.handle.try_send(Message::Ping(Vec::new()))
    }

    /// Run teardown now.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handle.close();

        let removed = self.state.registry.deregister(self.id).is_some();
        ConnectionMetrics::record_disconnected(self.state.registry.len());

        self.state.user_disconnected(self.user_id);

        if !removed {
            debug!(connection_id = %self.id, "Connection already pruned by the router");
        }
        info!(
            connection_id = %self.id,
            user_id = self.user_id,
            "Connection closed"
        );
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn drop_reason(error: &ParleyError) -> &'static str {
    match error.code() {
        ErrorCode::InvalidFrame | ErrorCode::DeserializationError => "invalid_frame",
        code if code.category() == "validation" => "validation",
        code if code.category() == "database" => "store",
        _ => "internal",
    }
}
