//! PostgreSQL [`ChatStore`] backed by a sqlx pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::future::Future;
use std::time::Duration;

use super::{
    ChatStore, MessageAuthor, NewGroupChat, NewMessage, DELETED_MESSAGE_TOMBSTONE,
    DIRECT_CHAT_CREATED, GROUP_CHAT_CREATED,
};
use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, ParleyError, Result};
use crate::telemetry::StoreTimer;
use crate::{ChatId, MessageId, UserId};

/// Chat storage in PostgreSQL.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    /// Connect a pool sized from configuration.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn timed<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let timer = StoreTimer::start(operation);
    let result = fut.await;
    timer.finish(result.is_ok());
    result.map_err(ParleyError::from)
}

fn unique_participants(user_ids: &[UserId]) -> Vec<UserId> {
    let mut seen = std::collections::HashSet::new();
    user_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[async_trait]
impl ChatStore for PgChatStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        timed(
            "insert_message",
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO messages
                    (chat_id, user_id, content, parent_message_id, is_forwarded, original_sender_id, original_chat_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(message.chat_id)
            .bind(message.user_id)
            .bind(&message.text)
            .bind(message.parent_message_id)
            .bind(message.is_forwarded)
            .bind(message.original_sender_id)
            .bind(message.original_chat_id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_username(&self, user_id: UserId) -> Result<String> {
        timed(
            "get_username",
            sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_participant_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        timed(
            "get_participant_ids",
            sqlx::query_scalar::<_, i64>("SELECT user_id FROM participants WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn get_message_content(&self, message_id: MessageId) -> Result<String> {
        timed(
            "get_message_content",
            sqlx::query_scalar::<_, String>("SELECT content FROM messages WHERE id = $1")
                .bind(message_id)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_message_author(&self, message_id: MessageId) -> Result<MessageAuthor> {
        let (chat_id, author_id) = timed(
            "get_message_author",
            sqlx::query_as::<_, (i64, Option<i64>)>(
                "SELECT chat_id, user_id FROM messages WHERE id = $1",
            )
            .bind(message_id)
            .fetch_one(&self.pool),
        )
        .await?;

        let author_id = author_id
            .ok_or_else(|| ParleyError::not_found("message author", message_id.to_string()))?;
        Ok(MessageAuthor { chat_id, author_id })
    }

    async fn mark_deleted(&self, message_id: MessageId) -> Result<()> {
        let result = timed(
            "mark_deleted",
            sqlx::query("UPDATE messages SET is_deleted = TRUE, content = $2 WHERE id = $1")
                .bind(message_id)
                .bind(DELETED_MESSAGE_TOMBSTONE)
                .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(ParleyError::not_found("message", message_id.to_string()));
        }
        Ok(())
    }

    async fn mark_edited(&self, message_id: MessageId, text: &str) -> Result<DateTime<Utc>> {
        timed(
            "mark_edited",
            sqlx::query_scalar::<_, DateTime<Utc>>(
                r#"
                UPDATE messages
                SET content = $1, is_edited = TRUE, edited_at = NOW()
                WHERE id = $2
                RETURNING edited_at
                "#,
            )
            .bind(text)
            .bind(message_id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn insert_deleted_for_me(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        timed(
            "insert_deleted_for_me",
            sqlx::query(
                r#"
                INSERT INTO deleted_messages (message_id, user_id)
                VALUES ($1, $2)
                ON CONFLICT (message_id, user_id) DO UPDATE SET deleted = TRUE
                "#,
            )
            .bind(message_id)
            .bind(user_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn upsert_reaction(&self, message_id: MessageId, user_id: UserId, reaction: &str) -> Result<()> {
        timed(
            "upsert_reaction",
            sqlx::query(
                r#"
                INSERT INTO message_reactions (message_id, user_id, reaction)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id, user_id) DO UPDATE SET reaction = EXCLUDED.reaction
                "#,
            )
            .bind(message_id)
            .bind(user_id)
            .bind(reaction)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn create_direct_chat(&self, current_user_id: UserId, other_user_id: UserId) -> Result<ChatId> {
        let timer = StoreTimer::start("create_direct_chat");
        let result = async {
            let mut tx = self.pool.begin().await?;

            let chat_id: i64 =
                sqlx::query_scalar("INSERT INTO chats (is_group) VALUES (FALSE) RETURNING id")
                    .fetch_one(&mut *tx)
                    .await?;

            sqlx::query(
                "INSERT INTO participants (chat_id, user_id) VALUES ($1, $2), ($1, $3) ON CONFLICT DO NOTHING",
            )
            .bind(chat_id)
            .bind(current_user_id)
            .bind(other_user_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO messages (chat_id, content, is_system) VALUES ($1, $2, TRUE)")
                .bind(chat_id)
                .bind(DIRECT_CHAT_CREATED)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(chat_id)
        }
        .await;
        timer.finish(result.is_ok());

        result.map_err(|e| {
            ParleyError::from(e).with_internal_message("direct chat transaction rolled back")
        })
    }

    async fn create_group_chat(&self, chat: &NewGroupChat) -> Result<ChatId> {
        let participants = unique_participants(&chat.user_ids);
        if participants.is_empty() {
            return Err(ParleyError::new(
                ErrorCode::MissingRequiredField,
                "No user IDs provided",
            ));
        }

        let timer = StoreTimer::start("create_group_chat");
        let result = async {
            let mut tx = self.pool.begin().await?;

            let chat_id: i64 =
                sqlx::query_scalar("INSERT INTO chats (is_group) VALUES ($1) RETURNING id")
                    .bind(chat.is_group)
                    .fetch_one(&mut *tx)
                    .await?;

            if chat.is_group {
                sqlx::query(
                    r#"
                    INSERT INTO group_chats (chat_id, name, description, created_by, image)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(chat_id)
                .bind(&chat.name)
                .bind(&chat.description)
                .bind(chat.created_by)
                .bind(chat.image.as_deref())
                .execute(&mut *tx)
                .await?;
            }

            for user_id in &participants {
                sqlx::query("INSERT INTO participants (chat_id, user_id, is_admin) VALUES ($1, $2, $3)")
                    .bind(chat_id)
                    .bind(*user_id)
                    .bind(*user_id == chat.created_by)
                    .execute(&mut *tx)
                    .await?;
            }

            let content = if chat.is_group {
                GROUP_CHAT_CREATED
            } else {
                DIRECT_CHAT_CREATED
            };
            sqlx::query("INSERT INTO messages (chat_id, content, is_system) VALUES ($1, $2, TRUE)")
                .bind(chat_id)
                .bind(content)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(chat_id)
        }
        .await;
        timer.finish(result.is_ok());

        result.map_err(|e| {
            ParleyError::from(e).with_internal_message("group chat transaction rolled back")
        })
    }

    async fn ping(&self) -> Result<()> {
        timed("ping", sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_participants_keeps_first_occurrence() {
        assert_eq!(unique_participants(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
        assert!(unique_participants(&[]).is_empty());
    }
}
