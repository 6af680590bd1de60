//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, ParleyError>` so that
//! errors are converted to HTTP status codes by the `IntoResponse`
//! implementation on `ParleyError`. Handlers that change chat state fan the
//! change out to live connections through the shared router.

use axum::{
    extract::{rejection::JsonRejection, Multipart, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Form, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::db::{ChatStore, NewGroupChat};
use crate::error::{ErrorCode, ParleyError, Result};
use crate::telemetry::MetricsRegistry;
use crate::websocket::{
    InboundMessage, Notification, OutboundEvent, TargetingRule, WebSocketState, WebSocketStats,
};
use crate::{ChatId, MessageId, UserId};

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ParleyError::invalid_input("Invalid request body").with_internal_message(e.body_text()))
}

fn parse_form_id(raw: &str, field: &'static str) -> Result<i64> {
    raw.trim()
        .parse()
        .map_err(|_| ParleyError::invalid_input(format!("Invalid {}", field)).with_context("field", field))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub store: String,
    pub connections: WebSocketStats,
}

pub async fn health_check(
    State(ws): State<Arc<WebSocketState>>,
    State(store): State<Arc<dyn ChatStore>>,
) -> impl IntoResponse {
    let status = match store.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            warn!(error = %e, "Chat store health check failed");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        store: store.backend().to_string(),
        connections: ws.stats(),
    })
}

pub async fn prometheus_metrics(State(metrics): State<MetricsRegistry>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Presence
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct UserStatusQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserStatusResponse {
    pub online: bool,
}

pub async fn user_status(
    State(ws): State<Arc<WebSocketState>>,
    Query(query): Query<UserStatusQuery>,
) -> Result<impl IntoResponse> {
    let user_id = parse_form_id(query.user_id.as_deref().unwrap_or(""), "user_id")?;
    let online = ws.is_online(user_id);
    debug!(user_id = user_id, online = online, "User status queried");
    Ok(Json(UserStatusResponse { online }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reactions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct AddReactionRequest {
    #[serde(default)]
    pub message_id: MessageId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub reaction: String,
}

pub async fn add_reaction(
    State(state): State<AppState>,
    payload: std::result::Result<Json<AddReactionRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let req = json_body(payload)?;

    state
        .store
        .upsert_reaction(req.message_id, req.user_id, &req.reaction)
        .await?;

    let rule = match state.store.get_message_author(req.message_id).await {
        Ok(author) => state.ws.ingest.audience(author.chat_id).await,
        Err(e) => {
            warn!(
                message_id = req.message_id,
                error = %e,
                "Could not resolve chat of reacted message, notifying everyone"
            );
            TargetingRule::AllConnections
        }
    };

    let event = OutboundEvent::from(Notification::Reaction {
        message_id: req.message_id,
        user_id: req.user_id,
        reaction: req.reaction,
    });
    state.ws.router.deliver(&event, &rule, None);

    Ok((StatusCode::OK, "Reaction added successfully"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Forwarding
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardMessageRequest {
    #[serde(default)]
    pub chat_id: ChatId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub original_sender_id: Option<UserId>,
    #[serde(default)]
    pub original_chat_id: Option<ChatId>,
}

pub async fn forward_message(
    State(ws): State<Arc<WebSocketState>>,
    payload: std::result::Result<Json<ForwardMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let req = json_body(payload)?;
    if req.chat_id == 0 || req.user_id == 0 {
        return Err(ParleyError::new(
            ErrorCode::MissingRequiredField,
            "Missing required fields",
        ));
    }

    let (message, rule) = ws
        .ingest
        .ingest(InboundMessage {
            chat_id: req.chat_id,
            user_id: req.user_id,
            text: req.text,
            parent_message_id: None,
            is_forwarded: true,
            original_sender_id: req.original_sender_id,
            original_chat_id: req.original_chat_id,
        })
        .await?;

    let message_id = message.id;
    let report = ws.router.deliver(&OutboundEvent::from(message), &rule, None);
    info!(
        message_id = message_id,
        chat_id = req.chat_id,
        delivered = report.delivered,
        "Message forwarded"
    );

    Ok((StatusCode::OK, "Message forwarded successfully"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Chat Creation
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChatForm {
    #[serde(default)]
    pub current_user_id: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChatResponse {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
}

pub async fn create_chat(
    State(state): State<AppState>,
    Form(form): Form<CreateChatForm>,
) -> Result<impl IntoResponse> {
    let current_user_id = parse_form_id(&form.current_user_id, "current_user_id")?;
    let other_user_id = parse_form_id(&form.user_id, "user_id")?;

    let chat_id = state
        .store
        .create_direct_chat(current_user_id, other_user_id)
        .await?;

    let user_ids = vec![current_user_id, other_user_id];
    let rule = TargetingRule::by_user_ids(user_ids.iter().copied());
    let event = OutboundEvent::from(Notification::new_chat(chat_id, user_ids));
    state.ws.router.deliver(&event, &rule, None);

    info!(chat_id = chat_id, user_id = current_user_id, "Direct chat created");
    Ok(Json(CreateChatResponse { chat_id }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupChatResponse {
    pub chat_id: ChatId,
    pub is_group: bool,
}

/// Split a comma separated id list. Blank entries are skipped.
fn parse_user_ids(raw: &str) -> Result<Vec<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_form_id(s, "user_ids"))
        .collect()
}

pub async fn create_group_chat(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut name = String::new();
    let mut description = String::new();
    let mut created_by = String::new();
    let mut is_group = false;
    let mut user_ids_raw = String::new();
    let mut image: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => name = field.text().await?,
            "description" => description = field.text().await?,
            "created_by" => created_by = field.text().await?,
            "is_group" => is_group = field.text().await? == "true",
            "user_ids" => user_ids_raw = field.text().await?,
            "image" => {
                let bytes = field.bytes().await?;
                if !bytes.is_empty() {
                    image = Some(bytes.to_vec());
                }
            }
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    let created_by = parse_form_id(&created_by, "created_by")?;
    let mut user_ids = parse_user_ids(&user_ids_raw)?;
    user_ids.push(created_by);

    let chat = NewGroupChat {
        name,
        description,
        created_by,
        is_group,
        user_ids,
        image: if is_group { image } else { None },
    };
    let chat_id = state.store.create_group_chat(&chat).await?;

    if chat.is_group {
        let group_image = chat
            .image
            .as_deref()
            .map(|bytes| STANDARD.encode(bytes))
            .unwrap_or_default();
        let rule = TargetingRule::by_user_ids(chat.user_ids.iter().copied());
        let event = OutboundEvent::from(Notification::new_group(
            chat_id,
            chat.name.clone(),
            chat.user_ids.clone(),
            group_image,
        ));
        state.ws.router.deliver(&event, &rule, None);
    }

    info!(
        chat_id = chat_id,
        created_by = created_by,
        is_group = is_group,
        participants = chat.user_ids.len(),
        "Chat created from group form"
    );
    Ok(Json(GroupChatResponse { chat_id, is_group }))
}
