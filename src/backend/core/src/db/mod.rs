//! Persistence collaborator for the real-time core.
//!
//! The websocket layer talks to storage only through [`ChatStore`]. Two
//! implementations ship with the crate: [`PgChatStore`] over a sqlx
//! PostgreSQL pool and [`MemoryChatStore`] for tests and database-less runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{ChatId, MessageId, UserId};

/// Content written over a message deleted for everyone.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "Message deleted";

/// System message inserted when a direct chat is created.
pub const DIRECT_CHAT_CREATED: &str = "Chat created";

/// System message inserted when a group chat is created.
pub const GROUP_CHAT_CREATED: &str = "Group chat created";

/// A message to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: String,
    pub parent_message_id: Option<MessageId>,
    pub is_forwarded: bool,
    pub original_sender_id: Option<UserId>,
    pub original_chat_id: Option<ChatId>,
}

/// Where a stored message lives and who wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAuthor {
    pub chat_id: ChatId,
    pub author_id: UserId,
}

/// A direct or group chat to create.
#[derive(Debug, Clone, Default)]
pub struct NewGroupChat {
    pub name: String,
    pub description: String,
    pub created_by: UserId,
    pub is_group: bool,
    /// Every participant, creator included. The creator becomes admin.
    pub user_ids: Vec<UserId>,
    pub image: Option<Vec<u8>>,
}

/// A message row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// `None` for system messages
    pub user_id: Option<UserId>,
    pub content: String,
    pub parent_message_id: Option<MessageId>,
    pub is_forwarded: bool,
    pub original_sender_id: Option<UserId>,
    pub original_chat_id: Option<ChatId>,
    pub is_deleted: bool,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage operations the real-time core and the REST handlers need.
///
/// Implementations must be safe for concurrent use; pooling is their concern.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Persist a message and return its generated id.
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId>;

    /// Display name of a user.
    async fn get_username(&self, user_id: UserId) -> Result<String>;

    /// User ids participating in a chat, direct or group.
    async fn get_participant_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>>;

    /// Current content of a message.
    async fn get_message_content(&self, message_id: MessageId) -> Result<String>;

    /// Chat and author of a message.
    async fn get_message_author(&self, message_id: MessageId) -> Result<MessageAuthor>;

    /// Tombstone a message for everyone.
    async fn mark_deleted(&self, message_id: MessageId) -> Result<()>;

    /// Replace a message's content and return the edit time.
    async fn mark_edited(&self, message_id: MessageId, text: &str) -> Result<DateTime<Utc>>;

    /// Hide a message for one user only.
    async fn insert_deleted_for_me(&self, message_id: MessageId, user_id: UserId) -> Result<()>;

    /// Set a user's reaction to a message, replacing any previous one.
    async fn upsert_reaction(&self, message_id: MessageId, user_id: UserId, reaction: &str) -> Result<()>;

    /// Create a two-person chat and return its id.
    async fn create_direct_chat(&self, current_user_id: UserId, other_user_id: UserId) -> Result<ChatId>;

    /// Create a chat from a group form and return its id.
    async fn create_group_chat(&self, chat: &NewGroupChat) -> Result<ChatId>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
