//! Fan-out of outbound events to the connections a targeting rule selects.
//!
//! Delivery happens in one pass over the registry while its lock is held.
//! Each write is a non-blocking enqueue onto the connection's own queue, so
//! one slow or dead connection cannot stall the pass. Connections whose
//! write fails are closed and then removed in a second locked pass.

use axum::extract::ws::Message;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::message::{ChatMessage, OutboundEvent};
use super::registry::{ConnectionId, ConnectionRecord, ConnectionRegistry};
use crate::error::Result;
use crate::telemetry::DeliveryMetrics;
use crate::{ChatId, UserId};

/// Which connections an event goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetingRule {
    /// Every registered connection
    AllConnections,
    /// Connections registered with this chat id
    ByChatId(ChatId),
    /// Connections belonging to any of these users
    ByUserIds(HashSet<UserId>),
    /// A single connection
    Connection(ConnectionId),
}

impl TargetingRule {
    pub fn by_user_ids<I>(user_ids: I) -> Self
    where
        I: IntoIterator<Item = UserId>,
    {
        TargetingRule::ByUserIds(user_ids.into_iter().collect())
    }

    pub fn matches(&self, record: &ConnectionRecord) -> bool {
        match self {
            TargetingRule::AllConnections => true,
            TargetingRule::ByChatId(chat_id) => record.chat_id == *chat_id,
            TargetingRule::ByUserIds(user_ids) => user_ids.contains(&record.user_id),
            TargetingRule::Connection(id) => record.id == *id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TargetingRule::AllConnections => "all",
            TargetingRule::ByChatId(_) => "chat",
            TargetingRule::ByUserIds(_) => "users",
            TargetingRule::Connection(_) => "connection",
        }
    }
}

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections the rule selected
    pub matched: usize,
    /// Frames enqueued
    pub delivered: usize,
    /// Writes that failed; those connections were closed and removed
    pub failed: usize,
}

/// Router statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub total_broadcasts: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
}

/// Serialized forms of an event.
enum RenderedEvent {
    /// Same bytes for every recipient
    Shared(String),
    /// Chat messages differ only in `isMe`
    PerRecipient { mine: String, others: String },
}

impl RenderedEvent {
    fn render(event: &OutboundEvent) -> Result<Self> {
        Ok(match event {
            OutboundEvent::Message(message) => Self::render_message(message)?,
            OutboundEvent::Notification(notification) => {
                RenderedEvent::Shared(serde_json::to_string(notification)?)
            }
        })
    }

    fn render_message(message: &Arc<ChatMessage>) -> Result<Self> {
        Ok(RenderedEvent::PerRecipient {
            mine: message.to_frame(true)?,
            others: message.to_frame(false)?,
        })
    }

    fn frame_for(&self, is_origin: bool) -> Message {
        match self {
            RenderedEvent::Shared(text) => Message::Text(text.clone()),
            RenderedEvent::PerRecipient { mine, others } => {
                Message::Text(if is_origin { mine.clone() } else { others.clone() })
            }
        }
    }
}

/// Delivers events to registered connections.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    total_broadcasts: AtomicU64,
    total_delivered: AtomicU64,
    total_failed: AtomicU64,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            total_broadcasts: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver `event` to every connection `rule` selects.
    ///
    /// `origin` is the connection that caused the event, if any. For chat
    /// messages it alone receives `isMe: true`.
    pub fn deliver(
        &self,
        event: &OutboundEvent,
        rule: &TargetingRule,
        origin: Option<ConnectionId>,
    ) -> DeliveryReport {
        let kind = event.kind();
        let rendered = match RenderedEvent::render(event) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(kind = kind, error = %e, "Failed to serialize outbound event");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        let mut dead: Vec<ConnectionId> = Vec::new();

        self.registry.for_each(|record| {
            if !rule.matches(record) {
                return;
            }
            report.matched += 1;

            let frame = rendered.frame_for(origin == Some(record.id));
            match record.handle.try_send(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        connection_id = %record.id,
                        user_id = record.user_id,
                        kind = kind,
                        error = %e,
                        "Write failed, closing connection"
                    );
                    record.handle.close();
                    dead.push(record.id);
                }
            }
        });

        report.failed = dead.len();
        self.registry.remove_many(&dead);

        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.total_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        DeliveryMetrics::record(kind, report.delivered, report.failed);

        debug!(
            kind = kind,
            rule = rule.label(),
            matched = report.matched,
            delivered = report.delivered,
            failed = report.failed,
            "Event delivered"
        );
        report
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::message::Notification;
    use crate::websocket::registry::ConnectionHandle;
    use chrono::Utc;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Client {
        id: ConnectionId,
        rx: mpsc::Receiver<Message>,
    }

    impl Client {
        fn next(&mut self) -> Option<Value> {
            match self.rx.try_recv() {
                Ok(Message::Text(text)) => serde_json::from_str(&text).ok(),
                _ => None,
            }
        }
    }

    fn connect(registry: &ConnectionRegistry, user_id: UserId, chat_id: ChatId, buffer: usize) -> Client {
        let (handle, rx) = ConnectionHandle::channel(buffer);
        let record = ConnectionRecord::new(user_id, chat_id, handle);
        let id = record.id;
        registry.register(record);
        Client { id, rx }
    }

    fn status(user_id: UserId) -> OutboundEvent {
        Notification::UserStatus { user_id, online: true }.into()
    }

    #[test]
    fn test_all_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let mut a = connect(&registry, 1, 1, 4);
        let mut b = connect(&registry, 2, 2, 4);

        let report = router.deliver(&status(1), &TargetingRule::AllConnections, None);
        assert_eq!(report, DeliveryReport { matched: 2, delivered: 2, failed: 0 });
        assert_eq!(a.next().unwrap()["type"], "user_status");
        assert_eq!(b.next().unwrap()["user_id"], 1);
    }

    #[test]
    fn test_by_user_ids_reaches_every_device() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let mut phone = connect(&registry, 5, 1, 4);
        let mut laptop = connect(&registry, 5, 2, 4);
        let mut other = connect(&registry, 6, 1, 4);

        let rule = TargetingRule::by_user_ids([5]);
        let report = router.deliver(&status(5), &rule, None);
        assert_eq!(report.delivered, 2);
        assert!(phone.next().is_some());
        assert!(laptop.next().is_some());
        assert!(other.next().is_none());
    }

    #[test]
    fn test_connection_rule() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let mut a = connect(&registry, 1, 1, 4);
        let mut b = connect(&registry, 1, 1, 4);

        router.deliver(&status(1), &TargetingRule::Connection(a.id), None);
        assert!(a.next().is_some());
        assert!(b.next().is_none());
    }

    #[test]
    fn test_is_me_only_for_origin() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let mut sender = connect(&registry, 1, 3, 4);
        let mut same_user_other_device = connect(&registry, 1, 3, 4);
        let mut peer = connect(&registry, 2, 3, 4);

        let message = ChatMessage {
            id: 1,
            chat_id: 3,
            user_id: 1,
            text: "hi".to_string(),
            created_at: Utc::now(),
            sender_name: "alice".to_string(),
            parent_message_id: None,
            parent_content: None,
            is_forwarded: false,
            original_sender_id: None,
            original_chat_id: None,
            original_sender_name: None,
        };
        router.deliver(&OutboundEvent::from(message), &TargetingRule::ByChatId(3), Some(sender.id));

        assert_eq!(sender.next().unwrap()["isMe"], true);
        assert_eq!(same_user_other_device.next().unwrap()["isMe"], false);
        assert_eq!(peer.next().unwrap()["isMe"], false);
    }

    #[test]
    fn test_failed_write_is_isolated_and_pruned() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let dead = connect(&registry, 1, 1, 4);
        let mut b = connect(&registry, 2, 1, 4);
        let mut c = connect(&registry, 3, 1, 4);
        let dead_id = dead.id;
        let dead_token = registry.handle(dead_id).unwrap().shutdown_token();
        drop(dead);

        let report = router.deliver(&status(9), &TargetingRule::ByChatId(1), None);
        assert_eq!(report, DeliveryReport { matched: 3, delivered: 2, failed: 1 });
        assert!(b.next().is_some());
        assert!(c.next().is_some());
        assert!(!registry.contains(dead_id));
        assert!(dead_token.is_cancelled());

        let stats = router.stats();
        assert_eq!(stats.total_delivered, 2);
        assert_eq!(stats.total_failed, 1);
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        let mut slow = connect(&registry, 1, 1, 1);

        assert_eq!(router.deliver(&status(1), &TargetingRule::AllConnections, None).delivered, 1);
        let report = router.deliver(&status(2), &TargetingRule::AllConnections, None);
        assert_eq!(report.failed, 1);
        assert!(registry.is_empty());
        assert!(slow.next().is_some());
    }
}
