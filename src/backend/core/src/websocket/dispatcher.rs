//! Routes inbound frames to the matching handler.
//!
//! Commands (`edit_message`, `delete_for_everyone`, `delete_for_me`) act on
//! stored messages. Anything else is a chat message for the ingest bridge.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::broadcast::{BroadcastRouter, DeliveryReport, TargetingRule};
use super::ingest::MessageIngest;
use super::message::{ClientCommand, ClientFrame, InboundMessage, Notification, OutboundEvent};
use super::registry::ConnectionId;
use crate::db::{ChatStore, MessageAuthor};
use crate::error::{ErrorCode, ParleyError, Result};
use crate::{MessageId, UserId};

/// What handling a frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        message_id: MessageId,
        report: DeliveryReport,
    },
    Edited {
        message_id: MessageId,
        report: DeliveryReport,
    },
    Deleted {
        message_id: MessageId,
        report: DeliveryReport,
    },
    DeletedForMe {
        message_id: MessageId,
        report: DeliveryReport,
    },
    /// The requester may not touch the message. Nothing was changed or sent.
    Rejected {
        message_id: MessageId,
        requester: UserId,
    },
}

/// Classifies frames and runs their handlers.
#[derive(Clone)]
pub struct CommandDispatcher {
    ingest: MessageIngest,
    router: Arc<BroadcastRouter>,
}

impl CommandDispatcher {
    pub fn new(ingest: MessageIngest, router: Arc<BroadcastRouter>) -> Self {
        Self { ingest, router }
    }

    fn store(&self) -> &Arc<dyn ChatStore> {
        self.ingest.store()
    }

    /// Handle one text frame received on `origin`.
    pub async fn dispatch(&self, frame: &str, origin: ConnectionId) -> Result<DispatchOutcome> {
        match ClientFrame::parse(frame)? {
            ClientFrame::Command(command) => self.dispatch_command(command, origin).await,
            ClientFrame::Message(message) => self.send_message(message, origin).await,
        }
    }

    pub async fn dispatch_command(
        &self,
        command: ClientCommand,
        origin: ConnectionId,
    ) -> Result<DispatchOutcome> {
        if command.message_id() <= 0 {
            return Err(ParleyError::invalid_input("Invalid message_id")
                .with_context("message_id", command.message_id()));
        }
        debug!(
            connection_id = %origin,
            kind = command.kind(),
            message_id = command.message_id(),
            user_id = command.user_id(),
            "Dispatching command"
        );

        match command {
            ClientCommand::EditMessage {
                message_id,
                user_id,
                new_text,
            } => self.edit_message(message_id, user_id, new_text, origin).await,
            ClientCommand::DeleteForEveryone {
                message_id,
                user_id,
            } => self.delete_for_everyone(message_id, user_id, origin).await,
            ClientCommand::DeleteForMe {
                message_id,
                user_id,
            } => self.delete_for_me(message_id, user_id, origin).await,
        }
    }

    /// Persist a chat message and fan it out to the chat's participants.
    pub async fn send_message(
        &self,
        message: InboundMessage,
        origin: ConnectionId,
    ) -> Result<DispatchOutcome> {
        let (message, rule) = self.ingest.ingest(message).await?;
        let message_id = message.id;
        let report = self
            .router
            .deliver(&OutboundEvent::from(message), &rule, Some(origin));
        Ok(DispatchOutcome::Sent { message_id, report })
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        requester: UserId,
        new_text: String,
        origin: ConnectionId,
    ) -> Result<DispatchOutcome> {
        let author = match self.authorize(message_id, requester, "edit_message").await? {
            Some(author) => author,
            None => return Ok(DispatchOutcome::Rejected { message_id, requester }),
        };

        let edited_at = self.store().mark_edited(message_id, &new_text).await?;
        let event = Notification::MessageEdited {
            id: message_id,
            chat_id: author.chat_id,
            new_text,
            edited_at,
        };
        let rule = self.ingest.audience(author.chat_id).await;
        let report = self.router.deliver(&OutboundEvent::from(event), &rule, Some(origin));

        info!(message_id = message_id, chat_id = author.chat_id, "Message edited");
        Ok(DispatchOutcome::Edited { message_id, report })
    }

    async fn delete_for_everyone(
        &self,
        message_id: MessageId,
        requester: UserId,
        origin: ConnectionId,
    ) -> Result<DispatchOutcome> {
        let author = match self.authorize(message_id, requester, "delete_for_everyone").await? {
            Some(author) => author,
            None => return Ok(DispatchOutcome::Rejected { message_id, requester }),
        };

        self.store().mark_deleted(message_id).await?;
        let rule = self.ingest.audience(author.chat_id).await;
        let event = Notification::MessageDeleted { id: message_id };
        let report = self.router.deliver(&OutboundEvent::from(event), &rule, Some(origin));

        info!(message_id = message_id, chat_id = author.chat_id, "Message deleted for everyone");
        Ok(DispatchOutcome::Deleted { message_id, report })
    }

    async fn delete_for_me(
        &self,
        message_id: MessageId,
        requester: UserId,
        origin: ConnectionId,
    ) -> Result<DispatchOutcome> {
        if requester <= 0 {
            return Err(ParleyError::invalid_user(requester));
        }

        self.store().insert_deleted_for_me(message_id, requester).await?;
        let event = Notification::deleted_for_me(message_id);
        let report = self
            .router
            .deliver(&OutboundEvent::from(event), &TargetingRule::Connection(origin), Some(origin));

        debug!(message_id = message_id, user_id = requester, "Message deleted for requester");
        Ok(DispatchOutcome::DeletedForMe { message_id, report })
    }

    /// The stored author, if `requester` is it.
    ///
    /// A foreign or missing message yields `None` and is only logged. Any
    /// other store failure is returned.
    async fn authorize(
        &self,
        message_id: MessageId,
        requester: UserId,
        action: &'static str,
    ) -> Result<Option<MessageAuthor>> {
        match self.store().get_message_author(message_id).await {
            Ok(author) if author.author_id == requester => Ok(Some(author)),
            Ok(author) => {
                let err = ParleyError::not_message_author(message_id, requester, author.author_id);
                warn!(
                    action = action,
                    message_id = message_id,
                    user_id = requester,
                    error = %err,
                    "Unauthorized message change dropped"
                );
                Ok(None)
            }
            Err(e) if e.code() == ErrorCode::RecordNotFound => {
                warn!(
                    action = action,
                    message_id = message_id,
                    user_id = requester,
                    error = %e,
                    "Message not found, change dropped"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryChatStore, NewMessage, DELETED_MESSAGE_TOMBSTONE};
    use crate::websocket::registry::{ConnectionHandle, ConnectionRecord, ConnectionRegistry};
    use axum::extract::ws::Message;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryChatStore>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: CommandDispatcher,
        chat_id: i64,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryChatStore::new());
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        let chat_id = store.add_chat(false, &[1, 2]);

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let dispatcher = CommandDispatcher::new(MessageIngest::new(store.clone()), router);
        Fixture {
            store,
            registry,
            dispatcher,
            chat_id,
        }
    }

    fn connect(f: &Fixture, user_id: UserId) -> (ConnectionId, mpsc::Receiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel(8);
        let record = ConnectionRecord::new(user_id, f.chat_id, handle);
        let id = record.id;
        f.registry.register(record);
        (id, rx)
    }

    fn frames(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    async fn seed(f: &Fixture, user_id: UserId, text: &str) -> MessageId {
        f.store
            .insert_message(&NewMessage {
                chat_id: f.chat_id,
                user_id,
                text: text.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_message_is_ingested_and_broadcast() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f, 1);
        let (_bob, mut bob_rx) = connect(&f, 2);

        let frame = format!(r#"{{"chat_id":{},"user_id":1,"text":"hello"}}"#, f.chat_id);
        let outcome = f.dispatcher.dispatch(&frame, alice).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent { report, .. } if report.delivered == 2));

        assert_eq!(frames(&mut alice_rx)[0]["isMe"], true);
        let bob_frames = frames(&mut bob_rx);
        assert_eq!(bob_frames[0]["isMe"], false);
        assert_eq!(bob_frames[0]["sender_name"], "alice");
    }

    #[tokio::test]
    async fn test_edit_by_author() {
        let f = fixture();
        let message_id = seed(&f, 1, "typo").await;
        let (alice, mut alice_rx) = connect(&f, 1);
        let (_bob, mut bob_rx) = connect(&f, 2);

        let outcome = f
            .dispatcher
            .dispatch_command(
                ClientCommand::EditMessage {
                    message_id,
                    user_id: 1,
                    new_text: "fixed".to_string(),
                },
                alice,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Edited { .. }));

        let stored = f.store.message(message_id).unwrap();
        assert_eq!(stored.content, "fixed");
        assert!(stored.is_edited);

        let bob_frames = frames(&mut bob_rx);
        assert_eq!(bob_frames[0]["type"], "message_edited");
        assert_eq!(bob_frames[0]["new_text"], "fixed");
        assert_eq!(frames(&mut alice_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_edit_by_non_author_is_dropped() {
        let f = fixture();
        let message_id = seed(&f, 1, "mine").await;
        let (bob, mut bob_rx) = connect(&f, 2);
        let (_alice, mut alice_rx) = connect(&f, 1);

        let outcome = f
            .dispatcher
            .dispatch(
                &format!(
                    r#"{{"type":"edit_message","message_id":{},"user_id":2,"new_text":"hacked"}}"#,
                    message_id
                ),
                bob,
            )
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Rejected { message_id, requester: 2 });
        assert_eq!(f.store.message(message_id).unwrap().content, "mine");
        assert!(frames(&mut bob_rx).is_empty());
        assert!(frames(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_delete_for_everyone() {
        let f = fixture();
        let message_id = seed(&f, 2, "oops").await;
        let (bob, mut bob_rx) = connect(&f, 2);
        let (_alice, mut alice_rx) = connect(&f, 1);

        let outcome = f
            .dispatcher
            .dispatch_command(ClientCommand::DeleteForEveryone { message_id, user_id: 2 }, bob)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deleted { .. }));

        let stored = f.store.message(message_id).unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.content, DELETED_MESSAGE_TOMBSTONE);
        assert_eq!(frames(&mut alice_rx)[0]["type"], "message_deleted");
        assert_eq!(frames(&mut bob_rx)[0]["id"], message_id);
    }

    #[tokio::test]
    async fn test_delete_for_everyone_unknown_message_is_dropped() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f, 1);
        let outcome = f
            .dispatcher
            .dispatch_command(ClientCommand::DeleteForEveryone { message_id: 777, user_id: 1 }, alice)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Rejected { .. }));
        assert!(frames(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_author_lookup_failure_is_an_error() {
        let f = fixture();
        let message_id = seed(&f, 1, "kept").await;
        let (alice, mut alice_rx) = connect(&f, 1);
        f.store.set_unavailable(true);

        let err = f
            .dispatcher
            .dispatch_command(ClientCommand::DeleteForEveryone { message_id, user_id: 1 }, alice)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DatabaseConnectionFailed);

        let err = f
            .dispatcher
            .dispatch_command(
                ClientCommand::EditMessage {
                    message_id,
                    user_id: 1,
                    new_text: "changed".into(),
                },
                alice,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DatabaseConnectionFailed);

        f.store.set_unavailable(false);
        assert!(!f.store.message(message_id).unwrap().is_deleted);
        assert!(frames(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_delete_for_me_replies_only_to_requester() {
        let f = fixture();
        let message_id = seed(&f, 1, "hidden").await;
        let (bob, mut bob_rx) = connect(&f, 2);
        let (_bob_other_device, mut bob_other_rx) = connect(&f, 2);
        let (_alice, mut alice_rx) = connect(&f, 1);

        f.dispatcher
            .dispatch_command(ClientCommand::DeleteForMe { message_id, user_id: 2 }, bob)
            .await
            .unwrap();

        assert!(f.store.is_deleted_for(message_id, 2));
        assert!(!f.store.message(message_id).unwrap().is_deleted);

        let reply = frames(&mut bob_rx);
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0]["type"], "message_deleted_for_me");
        assert_eq!(reply[0]["deleted_for_me"], true);
        assert!(frames(&mut bob_other_rx).is_empty());
        assert!(frames(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_frames_are_errors() {
        let f = fixture();
        let (alice, _rx) = connect(&f, 1);

        let err = f.dispatcher.dispatch("{", alice).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFrame);

        let err = f
            .dispatcher
            .dispatch(r#"{"type":"delete_for_me","message_id":0,"user_id":1}"#, alice)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = f
            .dispatcher
            .dispatch(r#"{"chat_id":0,"user_id":1,"text":"x"}"#, alice)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
