//! Wire schema for client and server frames.
//!
//! Inbound frames are either commands (`{type, message_id, user_id, new_text}`)
//! or plain chat messages. Outbound frames are either a bare chat message
//! object or a notification tagged by `type`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::NewMessage;
use crate::error::Result;
use crate::{ChatId, MessageId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Client → Server
// ═══════════════════════════════════════════════════════════════════════════════

/// Command frame as decoded, before classification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCommand {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message_id: MessageId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub new_text: String,
}

impl RawCommand {
    /// The command this frame names, if its `type` is a known one.
    pub fn into_command(self) -> Option<ClientCommand> {
        let command = match self.kind.as_deref()? {
            "delete_for_me" => ClientCommand::DeleteForMe {
                message_id: self.message_id,
                user_id: self.user_id,
            },
            "delete_for_everyone" => ClientCommand::DeleteForEveryone {
                message_id: self.message_id,
                user_id: self.user_id,
            },
            "edit_message" => ClientCommand::EditMessage {
                message_id: self.message_id,
                user_id: self.user_id,
                new_text: self.new_text,
            },
            _ => return None,
        };
        Some(command)
    }
}

/// A recognised command. `user_id` is the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    DeleteForMe {
        message_id: MessageId,
        user_id: UserId,
    },
    DeleteForEveryone {
        message_id: MessageId,
        user_id: UserId,
    },
    EditMessage {
        message_id: MessageId,
        user_id: UserId,
        new_text: String,
    },
}

impl ClientCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::DeleteForMe { .. } => "delete_for_me",
            ClientCommand::DeleteForEveryone { .. } => "delete_for_everyone",
            ClientCommand::EditMessage { .. } => "edit_message",
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            ClientCommand::DeleteForMe { message_id, .. }
            | ClientCommand::DeleteForEveryone { message_id, .. }
            | ClientCommand::EditMessage { message_id, .. } => *message_id,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            ClientCommand::DeleteForMe { user_id, .. }
            | ClientCommand::DeleteForEveryone { user_id, .. }
            | ClientCommand::EditMessage { user_id, .. } => *user_id,
        }
    }
}

/// A plain chat message sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub chat_id: ChatId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub original_sender_id: Option<UserId>,
    #[serde(default)]
    pub original_chat_id: Option<ChatId>,
}

impl InboundMessage {
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            chat_id: self.chat_id,
            user_id: self.user_id,
            text: self.text.clone(),
            parent_message_id: self.parent_message_id,
            is_forwarded: self.is_forwarded,
            original_sender_id: self.original_sender_id,
            original_chat_id: self.original_chat_id,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Command(ClientCommand),
    Message(InboundMessage),
}

impl ClientFrame {
    /// Classify a text frame.
    ///
    /// A frame whose `type` names a known command is that command. Anything
    /// else, including a command-shaped frame that fails to decode, is read
    /// as a plain message.
    pub fn parse(text: &str) -> Result<Self> {
        if let Ok(raw) = serde_json::from_str::<RawCommand>(text) {
            if let Some(command) = raw.into_command() {
                return Ok(ClientFrame::Command(command));
            }
        }
        Ok(ClientFrame::Message(serde_json::from_str(text)?))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server → Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Timestamps on the wire are RFC 3339 with whole seconds.
pub mod rfc3339_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A persisted chat message, enriched for delivery.
///
/// Serialized as a bare object; `isMe` is added per recipient by
/// [`ChatMessage::to_frame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: String,
    #[serde(with = "rfc3339_seconds")]
    pub created_at: DateTime<Utc>,
    pub sender_name: String,
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_content: Option<String>,
    pub is_forwarded: bool,
    pub original_sender_id: Option<UserId>,
    pub original_chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sender_name: Option<String>,
}

#[derive(Serialize)]
struct ChatMessageView<'a> {
    #[serde(flatten)]
    message: &'a ChatMessage,
    #[serde(rename = "isMe")]
    is_me: bool,
}

impl ChatMessage {
    /// Serialize for one recipient.
    pub fn to_frame(&self, is_me: bool) -> Result<String> {
        Ok(serde_json::to_string(&ChatMessageView {
            message: self,
            is_me,
        })?)
    }
}

/// Every non-message event, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Reaction {
        message_id: MessageId,
        user_id: UserId,
        reaction: String,
    },
    MessageEdited {
        id: MessageId,
        chat_id: ChatId,
        new_text: String,
        #[serde(with = "rfc3339_seconds")]
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        id: MessageId,
    },
    MessageDeletedForMe {
        id: MessageId,
        deleted_for_me: bool,
    },
    UserStatus {
        user_id: UserId,
        online: bool,
    },
    NewChat {
        chat_id: ChatId,
        is_group: bool,
        user_ids: Vec<UserId>,
    },
    NewGroup {
        chat_id: ChatId,
        chat_name: String,
        is_group: bool,
        user_ids: Vec<UserId>,
        /// Base64 of the group image, empty when there is none
        group_image: String,
    },
    /// Status of every known user, sent once to a connection that just opened
    PresenceSnapshot {
        statuses: BTreeMap<UserId, bool>,
    },
}

impl Notification {
    pub fn deleted_for_me(id: MessageId) -> Self {
        Notification::MessageDeletedForMe {
            id,
            deleted_for_me: true,
        }
    }

    pub fn new_chat(chat_id: ChatId, user_ids: Vec<UserId>) -> Self {
        Notification::NewChat {
            chat_id,
            is_group: false,
            user_ids,
        }
    }

    pub fn new_group(
        chat_id: ChatId,
        chat_name: impl Into<String>,
        user_ids: Vec<UserId>,
        group_image: impl Into<String>,
    ) -> Self {
        Notification::NewGroup {
            chat_id,
            chat_name: chat_name.into(),
            is_group: true,
            user_ids,
            group_image: group_image.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Reaction { .. } => "reaction",
            Notification::MessageEdited { .. } => "message_edited",
            Notification::MessageDeleted { .. } => "message_deleted",
            Notification::MessageDeletedForMe { .. } => "message_deleted_for_me",
            Notification::UserStatus { .. } => "user_status",
            Notification::NewChat { .. } => "new_chat",
            Notification::NewGroup { .. } => "new_group",
            Notification::PresenceSnapshot { .. } => "presence_snapshot",
        }
    }
}

/// An event to fan out. Immutable once built; shared across recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Message(Arc<ChatMessage>),
    Notification(Notification),
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Message(_) => "new_message",
            OutboundEvent::Notification(n) => n.kind(),
        }
    }
}

impl From<ChatMessage> for OutboundEvent {
    fn from(message: ChatMessage) -> Self {
        OutboundEvent::Message(Arc::new(message))
    }
}

impl From<Notification> for OutboundEvent {
    fn from(notification: Notification) -> Self {
        OutboundEvent::Notification(notification)
    }
}
