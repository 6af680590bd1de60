//! Registry of live connections.
//!
//! Every live connection has exactly one record here. All reads and writes go
//! through a single lock so a broadcast pass never observes a half-applied
//! register or deregister.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, ParleyError, Result};
use crate::{ChatId, UserId};

/// Unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write side of a connection: its outbound queue plus a shutdown signal.
///
/// Sending never blocks. A full or closed queue is reported to the caller,
/// which decides whether the connection is dead.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>, shutdown: CancellationToken) -> Self {
        Self { sender, shutdown }
    }

    /// A handle together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::new(ErrorCode::ConnectionClosed, "Connection closed"));
        }
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                ParleyError::new(ErrorCode::SendQueueFull, "Outbound queue is full")
            }
            TrySendError::Closed(_) => {
                ParleyError::new(ErrorCode::ConnectionClosed, "Connection closed")
            }
        })
    }

    /// Ask the connection's tasks to stop.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// A live connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    /// 0 when the client did not supply a usable user id
    pub user_id: UserId,
    /// 0 when the client did not supply a usable chat id
    pub chat_id: ChatId,
    pub handle: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(user_id: UserId, chat_id: ChatId, handle: ConnectionHandle) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            chat_id,
            handle,
            connected_at: Utc::now(),
        }
    }
}

/// Identifying fields of a connection, copied out of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub chat_id: ChatId,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_disconnections: u64,
}

/// The set of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    total_connections: AtomicU64,
    total_disconnections: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. An existing record under the same id is replaced and
    /// returned.
    pub fn register(&self, record: ConnectionRecord) -> Option<ConnectionRecord> {
        let id = record.id;
        let user_id = record.user_id;
        let chat_id = record.chat_id;

        let (previous, active) = {
            let mut connections = self.connections.lock();
            let previous = connections.insert(id, record);
            (previous, connections.len())
        };

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            warn!(connection_id = %id, "Connection id registered twice, replacing record");
        }
        debug!(
            connection_id = %id,
            user_id = user_id,
            chat_id = chat_id,
            active = active,
            "Connection registered"
        );
        previous
    }

    /// Remove a record. Removing an absent id is a no-op.
    pub fn deregister(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let removed = self.connections.lock().remove(&id);
        if removed.is_some() {
            self.total_disconnections.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id = %id, "Connection deregistered");
        }
        removed
    }

    /// Remove several records in one locked pass.
    pub fn remove_many(&self, ids: &[ConnectionId]) -> Vec<ConnectionRecord> {
        if ids.is_empty() {
            return Vec::new();
        }

        let removed: Vec<ConnectionRecord> = {
            let mut connections = self.connections.lock();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        self.total_disconnections
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Visit every record while holding the registry lock.
    ///
    /// The visitor must not call back into the registry.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&ConnectionRecord),
    {
        let connections = self.connections.lock();
        for record in connections.values() {
            visit(record);
        }
    }

    /// Handle of a single connection.
    pub fn handle(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.lock().get(&id).map(|r| r.handle.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .values()
            .map(|r| ConnectionInfo {
                id: r.id,
                user_id: r.user_id,
                chat_id: r.chat_id,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_disconnections: self.total_disconnections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: UserId, chat_id: ChatId) -> (ConnectionRecord, mpsc::Receiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel(4);
        (ConnectionRecord::new(user_id, chat_id, handle), rx)
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = record(1, 10);
        let (b, _rx_b) = record(2, 10);
        let a_id = a.id;

        assert!(registry.register(a).is_none());
        assert!(registry.register(b).is_none());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a_id));

        assert!(registry.deregister(a_id).is_some());
        assert!(registry.deregister(a_id).is_none());
        assert_eq!(registry.len(), 1);

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.total_disconnections, 1);
    }

    #[test]
    fn test_register_same_id_replaces() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = record(1, 10);
        let (mut second, _rx2) = record(1, 20);
        second.id = first.id;

        registry.register(first);
        let previous = registry.register(second).unwrap();
        assert_eq!(previous.chat_id, 10);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].chat_id, 20);
    }

    #[test]
    fn test_remove_many_skips_missing() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = record(1, 1);
        let a_id = a.id;
        registry.register(a);

        let removed = registry.remove_many(&[a_id, ConnectionId::new()]);
        assert_eq!(removed.len(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_disconnections, 1);
    }

    #[test]
    fn test_handle_try_send_reports_full_and_closed() {
        let (handle, mut rx) = ConnectionHandle::channel(1);
        handle.try_send(Message::Text("one".into())).unwrap();

        let err = handle.try_send(Message::Text("two".into())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SendQueueFull);

        assert!(matches!(rx.try_recv(), Ok(Message::Text(t)) if t == "one"));
        drop(rx);
        let err = handle.try_send(Message::Text("three".into())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionClosed);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_handle_close_cancels_token() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        let token = handle.shutdown_token();
        handle.close();
        assert!(token.is_cancelled());
        assert!(handle.try_send(Message::Text("x".into())).is_err());
    }
}
