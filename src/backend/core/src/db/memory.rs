//! In-memory [`ChatStore`] used for tests and database-less runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    ChatStore, MessageAuthor, NewGroupChat, NewMessage, StoredMessage, DELETED_MESSAGE_TOMBSTONE,
    DIRECT_CHAT_CREATED, GROUP_CHAT_CREATED,
};
use crate::error::{ErrorCode, ParleyError, Result};
use crate::{ChatId, MessageId, UserId};

#[derive(Debug, Clone)]
struct ChatRow {
    is_group: bool,
    group: Option<GroupRow>,
    participants: Vec<Participant>,
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
struct GroupRow {
    name: String,
    description: String,
    created_by: UserId,
    image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct Participant {
    user_id: UserId,
    is_admin: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_chat_id: ChatId,
    next_message_id: MessageId,
    users: HashMap<UserId, String>,
    chats: BTreeMap<ChatId, ChatRow>,
    messages: BTreeMap<MessageId, StoredMessage>,
    reactions: HashMap<(MessageId, UserId), String>,
    deleted_for_me: HashSet<(MessageId, UserId)>,
}

impl MemoryState {
    fn allocate_chat(&mut self, is_group: bool, group: Option<GroupRow>) -> ChatId {
        self.next_chat_id += 1;
        let chat_id = self.next_chat_id;
        self.chats.insert(
            chat_id,
            ChatRow {
                is_group,
                group,
                participants: Vec::new(),
            },
        );
        chat_id
    }

    fn push_message(&mut self, mut message: StoredMessage) -> MessageId {
        self.next_message_id += 1;
        message.id = self.next_message_id;
        self.messages.insert(message.id, message);
        self.next_message_id
    }

    fn system_message(chat_id: ChatId, content: &str) -> StoredMessage {
        StoredMessage {
            id: 0,
            chat_id,
            user_id: None,
            content: content.to_string(),
            parent_message_id: None,
            is_forwarded: false,
            original_sender_id: None,
            original_chat_id: None,
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            is_system: true,
            created_at: Utc::now(),
        }
    }

    fn message_mut(&mut self, message_id: MessageId) -> Result<&mut StoredMessage> {
        self.messages
            .get_mut(&message_id)
            .ok_or_else(|| ParleyError::not_found("message", message_id.to_string()))
    }
}

/// A [`ChatStore`] kept entirely in process memory.
///
/// Mirrors the PostgreSQL schema closely enough for the real-time paths:
/// messages must reference an existing chat, reactions and per-user
/// deletions are upserts, chat creation is all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and their display name.
    pub fn add_user(&self, user_id: UserId, username: impl Into<String>) {
        self.state.lock().users.insert(user_id, username.into());
    }

    /// Create a chat with the given participants and return its id.
    pub fn add_chat(&self, is_group: bool, participants: &[UserId]) -> ChatId {
        let mut state = self.state.lock();
        let chat_id = state.allocate_chat(is_group, None);
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            chat.participants = participants
                .iter()
                .map(|&user_id| Participant {
                    user_id,
                    is_admin: false,
                })
                .collect();
        }
        chat_id
    }

    /// A stored message, if present.
    pub fn message(&self, message_id: MessageId) -> Option<StoredMessage> {
        self.state.lock().messages.get(&message_id).cloned()
    }

    /// All messages of a chat in insertion order.
    pub fn chat_messages(&self, chat_id: ChatId) -> Vec<StoredMessage> {
        self.state
            .lock()
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn reaction(&self, message_id: MessageId, user_id: UserId) -> Option<String> {
        self.state
            .lock()
            .reactions
            .get(&(message_id, user_id))
            .cloned()
    }

    pub fn is_deleted_for(&self, message_id: MessageId, user_id: UserId) -> bool {
        self.state
            .lock()
            .deleted_for_me
            .contains(&(message_id, user_id))
    }

    /// Whether `user_id` administers `chat_id`.
    pub fn is_admin(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.state
            .lock()
            .chats
            .get(&chat_id)
            .map(|c| c.participants.iter().any(|p| p.user_id == user_id && p.is_admin))
            .unwrap_or(false)
    }

    pub fn is_group(&self, chat_id: ChatId) -> Option<bool> {
        self.state.lock().chats.get(&chat_id).map(|c| c.is_group)
    }

    pub fn group_name(&self, chat_id: ChatId) -> Option<String> {
        self.state
            .lock()
            .chats
            .get(&chat_id)
            .and_then(|c| c.group.as_ref().map(|g| g.name.clone()))
    }

    /// Make every subsequent call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ParleyError::new(
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.chats.contains_key(&message.chat_id) {
            return Err(ParleyError::not_found("chat", message.chat_id.to_string()));
        }

        let id = state.push_message(StoredMessage {
            id: 0,
            chat_id: message.chat_id,
            user_id: Some(message.user_id),
            content: message.text.clone(),
            parent_message_id: message.parent_message_id,
            is_forwarded: message.is_forwarded,
            original_sender_id: message.original_sender_id,
            original_chat_id: message.original_chat_id,
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            is_system: false,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn get_username(&self, user_id: UserId) -> Result<String> {
        self.check_available()?;
        self.state
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| ParleyError::not_found("user", user_id.to_string()))
    }

    async fn get_participant_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .chats
            .get(&chat_id)
            .map(|c| c.participants.iter().map(|p| p.user_id).collect())
            .unwrap_or_default())
    }

    async fn get_message_content(&self, message_id: MessageId) -> Result<String> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(state.message_mut(message_id)?.content.clone())
    }

    async fn get_message_author(&self, message_id: MessageId) -> Result<MessageAuthor> {
        self.check_available()?;
        let mut state = self.state.lock();
        let message = state.message_mut(message_id)?;
        let author_id = message
            .user_id
            .ok_or_else(|| ParleyError::not_found("message author", message_id.to_string()))?;
        Ok(MessageAuthor {
            chat_id: message.chat_id,
            author_id,
        })
    }

    async fn mark_deleted(&self, message_id: MessageId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let message = state.message_mut(message_id)?;
        message.is_deleted = true;
        message.content = DELETED_MESSAGE_TOMBSTONE.to_string();
        Ok(())
    }

    async fn mark_edited(&self, message_id: MessageId, text: &str) -> Result<DateTime<Utc>> {
        self.check_available()?;
        let mut state = self.state.lock();
        let message = state.message_mut(message_id)?;
        let edited_at = Utc::now();
        message.content = text.to_string();
        message.is_edited = true;
        message.edited_at = Some(edited_at);
        Ok(edited_at)
    }

    async fn insert_deleted_for_me(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.message_mut(message_id)?;
        state.deleted_for_me.insert((message_id, user_id));
        Ok(())
    }

    async fn upsert_reaction(&self, message_id: MessageId, user_id: UserId, reaction: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.message_mut(message_id)?;
        state
            .reactions
            .insert((message_id, user_id), reaction.to_string());
        Ok(())
    }

    async fn create_direct_chat(&self, current_user_id: UserId, other_user_id: UserId) -> Result<ChatId> {
        self.check_available()?;
        let mut state = self.state.lock();
        let chat_id = state.allocate_chat(false, None);
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            chat.participants = vec![
                Participant {
                    user_id: current_user_id,
                    is_admin: false,
                },
                Participant {
                    user_id: other_user_id,
                    is_admin: false,
                },
            ];
        }
        state.push_message(MemoryState::system_message(chat_id, DIRECT_CHAT_CREATED));
        Ok(chat_id)
    }

    async fn create_group_chat(&self, chat: &NewGroupChat) -> Result<ChatId> {
        self.check_available()?;
        let mut state = self.state.lock();

        let group = chat.is_group.then(|| GroupRow {
            name: chat.name.clone(),
            description: chat.description.clone(),
            created_by: chat.created_by,
            image: chat.image.clone(),
        });
        let chat_id = state.allocate_chat(chat.is_group, group);

        let mut seen = HashSet::new();
        let participants: Vec<Participant> = chat
            .user_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|&user_id| Participant {
                user_id,
                is_admin: user_id == chat.created_by,
            })
            .collect();
        if let Some(row) = state.chats.get_mut(&chat_id) {
            row.participants = participants;
        }

        let content = if chat.is_group {
            GROUP_CHAT_CREATED
        } else {
            DIRECT_CHAT_CREATED
        };
        state.push_message(MemoryState::system_message(chat_id, content));
        Ok(chat_id)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_chat() -> (MemoryChatStore, ChatId) {
        let store = MemoryChatStore::new();
        store.add_user(1, "alice");
        store.add_user(2, "bob");
        let chat_id = store.add_chat(false, &[1, 2]);
        (store, chat_id)
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (store, chat_id) = store_with_chat();
        let id = store
            .insert_message(&NewMessage {
                chat_id,
                user_id: 1,
                text: "hello".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.get_message_content(id).await.unwrap(), "hello");
        let author = store.get_message_author(id).await.unwrap();
        assert_eq!(author, MessageAuthor { chat_id, author_id: 1 });
        assert_eq!(store.get_participant_ids(chat_id).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_insert_into_unknown_chat_fails() {
        let store = MemoryChatStore::new();
        let err = store
            .insert_message(&NewMessage {
                chat_id: 99,
                user_id: 1,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let store = MemoryChatStore::new();
        assert!(store.get_username(5).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_deleted_writes_tombstone() {
        let (store, chat_id) = store_with_chat();
        let id = store
            .insert_message(&NewMessage {
                chat_id,
                user_id: 2,
                text: "secret".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        store.mark_deleted(id).await.unwrap();
        let stored = store.message(id).unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.content, DELETED_MESSAGE_TOMBSTONE);
    }

    #[tokio::test]
    async fn test_mark_edited_sets_timestamp() {
        let (store, chat_id) = store_with_chat();
        let id = store
            .insert_message(&NewMessage {
                chat_id,
                user_id: 1,
                text: "helo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let edited_at = store.mark_edited(id, "hello").await.unwrap();
        let stored = store.message(id).unwrap();
        assert!(stored.is_edited);
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.edited_at, Some(edited_at));
    }

    #[tokio::test]
    async fn test_reaction_upsert_replaces() {
        let (store, chat_id) = store_with_chat();
        let id = store
            .insert_message(&NewMessage {
                chat_id,
                user_id: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        store.upsert_reaction(id, 2, "👍").await.unwrap();
        store.upsert_reaction(id, 2, "❤️").await.unwrap();
        assert_eq!(store.reaction(id, 2).as_deref(), Some("❤️"));
    }

    #[tokio::test]
    async fn test_delete_for_me_is_per_user() {
        let (store, chat_id) = store_with_chat();
        let id = store
            .insert_message(&NewMessage {
                chat_id,
                user_id: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        store.insert_deleted_for_me(id, 2).await.unwrap();
        store.insert_deleted_for_me(id, 2).await.unwrap();
        assert!(store.is_deleted_for(id, 2));
        assert!(!store.is_deleted_for(id, 1));
        assert!(!store.message(id).unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_create_direct_chat_adds_system_message() {
        let store = MemoryChatStore::new();
        let chat_id = store.create_direct_chat(3, 4).await.unwrap();

        assert_eq!(store.get_participant_ids(chat_id).await.unwrap(), vec![3, 4]);
        assert_eq!(store.is_group(chat_id), Some(false));
        let messages = store.chat_messages(chat_id);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_system);
        assert_eq!(messages[0].content, DIRECT_CHAT_CREATED);
    }

    #[tokio::test]
    async fn test_create_group_chat_marks_creator_admin() {
        let store = MemoryChatStore::new();
        let chat_id = store
            .create_group_chat(&NewGroupChat {
                name: "team".to_string(),
                created_by: 1,
                is_group: true,
                user_ids: vec![2, 3, 1, 1],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.get_participant_ids(chat_id).await.unwrap(), vec![2, 3, 1]);
        assert!(store.is_admin(chat_id, 1));
        assert!(!store.is_admin(chat_id, 2));
        assert_eq!(store.group_name(chat_id).as_deref(), Some("team"));
        assert_eq!(store.chat_messages(chat_id)[0].content, GROUP_CHAT_CREATED);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let (store, chat_id) = store_with_chat();
        store.set_unavailable(true);

        let err = store.get_participant_ids(chat_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DatabaseConnectionFailed);
        assert!(store.ping().await.is_err());

        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
