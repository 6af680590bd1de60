//! Turns an inbound chat message into a persisted, enriched event.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::broadcast::TargetingRule;
use super::message::{ChatMessage, InboundMessage};
use crate::db::ChatStore;
use crate::error::{ParleyError, Result};
use crate::{ChatId, UserId};

/// Display name used when the sender's name cannot be resolved.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Bridge between inbound messages and the chat store.
#[derive(Clone)]
pub struct MessageIngest {
    store: Arc<dyn ChatStore>,
}

impl MessageIngest {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Validate, persist and enrich `inbound`.
    ///
    /// Fails without side effects on invalid ids, and fails after nothing but
    /// the insert attempt when the store rejects the message. Enrichment
    /// lookups never fail the ingest.
    pub async fn ingest(&self, inbound: InboundMessage) -> Result<(ChatMessage, TargetingRule)> {
        if inbound.chat_id <= 0 {
            return Err(ParleyError::invalid_chat(inbound.chat_id));
        }
        if inbound.user_id <= 0 {
            return Err(ParleyError::invalid_user(inbound.user_id));
        }

        let id = self.store.insert_message(&inbound.to_new_message()).await?;
        let created_at = Utc::now();

        let sender_name = self.display_name(inbound.user_id).await;

        let parent_content = match inbound.parent_message_id {
            Some(parent_id) => match self.store.get_message_content(parent_id).await {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!(
                        message_id = id,
                        parent_message_id = parent_id,
                        error = %e,
                        "Parent message lookup failed, omitting parent content"
                    );
                    None
                }
            },
            None => None,
        };

        let original_sender_name = match inbound.original_sender_id {
            Some(original) if inbound.is_forwarded => Some(self.display_name(original).await),
            _ => None,
        };

        let rule = self.audience(inbound.chat_id).await;

        debug!(
            message_id = id,
            chat_id = inbound.chat_id,
            user_id = inbound.user_id,
            "Message ingested"
        );

        let message = ChatMessage {
            id,
            chat_id: inbound.chat_id,
            user_id: inbound.user_id,
            text: inbound.text,
            created_at,
            sender_name,
            parent_message_id: inbound.parent_message_id,
            parent_content,
            is_forwarded: inbound.is_forwarded,
            original_sender_id: inbound.original_sender_id,
            original_chat_id: inbound.original_chat_id,
            original_sender_name,
        };
        Ok((message, rule))
    }

    /// Everyone who should see events for `chat_id`.
    ///
    /// Resolved from the chat's participants. Falls back to connections
    /// registered on the chat when the participant lookup fails.
    pub async fn audience(&self, chat_id: ChatId) -> TargetingRule {
        match self.store.get_participant_ids(chat_id).await {
            Ok(participants) => TargetingRule::by_user_ids(participants),
            Err(e) => {
                warn!(
                    chat_id = chat_id,
                    error = %e,
                    "Participant lookup failed, targeting by chat"
                );
                TargetingRule::ByChatId(chat_id)
            }
        }
    }

    async fn display_name(&self, user_id: UserId) -> String {
        match self.store.get_username(user_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!(user_id = user_id, error = %e, "Username lookup failed");
                UNKNOWN_SENDER.to_string()
            }
        }
    }
}
