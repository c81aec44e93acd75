//! Chat send/read operations shared by the REST endpoints and the socket
//! protocol, plus the REST handlers themselves.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use khanasathi_proto::{ChatMessage, ChatThread, Role};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::chat::broadcast;
use crate::chat::store::{ActiveChat, NewChatMessage};
use crate::error::ApiError;
use crate::orders::store::{load_order, OrderRecord};
use crate::state::AppState;

// --- Request / Response types ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub thread: Option<ChatThread>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadQuery {
    pub thread: Option<ChatThread>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub thread: Option<ChatThread>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

// --- Operations ---

/// Validate, persist, then fan out. Nothing is broadcast unless the store
/// accepted the message.
pub async fn send_message(
    state: &AppState,
    claims: &Claims,
    order_id: &str,
    request: SendMessageRequest,
) -> Result<ChatMessage, ApiError> {
    let content = request.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::validation("Message content is required"));
    }
    if content.chars().count() > state.realtime.max_message_length {
        return Err(ApiError::validation(format!(
            "Message exceeds {} characters",
            state.realtime.max_message_length
        )));
    }
    if request.attachments.len() > state.realtime.max_attachments {
        return Err(ApiError::validation(format!(
            "At most {} attachments per message",
            state.realtime.max_attachments
        )));
    }
    if request.attachments.iter().any(|url| url.trim().is_empty()) {
        return Err(ApiError::validation("Attachment URLs must not be empty"));
    }

    let order = load_order(&state.db, order_id).await?;
    let thread = request.thread.unwrap_or_default();
    require_thread_member(&order, claims, thread)?;

    let store = state.transcripts.clone();
    let new_message = NewChatMessage {
        order_id: order.id.clone(),
        thread,
        sender_id: claims.sub.clone(),
        sender_name: claims.name.clone(),
        sender_role: claims.role,
        content,
        attachments: request.attachments,
    };

    let message = tokio::task::spawn_blocking(move || store.append(new_message))
        .await?
        .map_err(|e| {
            tracing::error!(order_id = %order.id, error = %e, "Failed to persist chat message");
            ApiError::from(e)
        })?;

    broadcast::broadcast_new_message(&state.relay, &order, &message);
    tracing::debug!(
        order_id = %order.id,
        thread = %thread,
        message_id = %message.id,
        "Chat message sent"
    );
    Ok(message)
}

/// Mark a thread read for the caller. Returns how many messages flipped.
pub async fn mark_read(
    state: &AppState,
    claims: &Claims,
    order_id: &str,
    thread: Option<ChatThread>,
) -> Result<usize, ApiError> {
    let order = load_order(&state.db, order_id).await?;
    let thread = thread.unwrap_or_default();
    // Readers outside the thread must not clear its members' unread state
    if !order.is_thread_member(&claims.sub, thread) {
        return Err(ApiError::forbidden("Not a member of this chat thread"));
    }

    let store = state.transcripts.clone();
    let reader = claims.sub.clone();
    let oid = order.id.clone();
    let updated = tokio::task::spawn_blocking(move || store.mark_read(&oid, thread, &reader))
        .await??;
    Ok(updated)
}

fn require_thread_member(
    order: &OrderRecord,
    claims: &Claims,
    thread: ChatThread,
) -> Result<(), ApiError> {
    if order.is_thread_member(&claims.sub, thread) {
        return Ok(());
    }
    let rider_missing = thread.member_roles().contains(&Role::DeliveryStaff)
        && order.delivery_staff_id.is_none()
        && order.participant_role(&claims.sub).is_some_and(|role| {
            thread.member_roles().contains(&role)
        });
    if rider_missing {
        Err(ApiError::validation("No delivery staff assigned to this order yet"))
    } else {
        Err(ApiError::forbidden("Not a member of this chat thread"))
    }
}

// --- Handlers ---

/// GET /api/chat/active
/// Conversations the caller takes part in, most recent first.
pub async fn list_active_chats(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<ActiveChat>>, ApiError> {
    let store = state.transcripts.clone();
    let user_id = claims.sub;
    let chats = tokio::task::spawn_blocking(move || store.list_active(&user_id)).await??;
    Ok(Json(chats))
}

/// GET /api/chat/{order_id}/messages?thread={thread}
/// Full transcript in send order. Without a thread, every thread the caller
/// may read is included.
pub async fn get_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let order = load_order(&state.db, &order_id).await?;
    if !order.can_view(&claims) {
        return Err(ApiError::forbidden("Not a participant of this order"));
    }
    if let Some(thread) = query.thread {
        if !order.can_read_thread(&claims, thread) {
            return Err(ApiError::forbidden("Not a member of this chat thread"));
        }
    }

    let store = state.transcripts.clone();
    let thread = query.thread;
    let messages = tokio::task::spawn_blocking(move || store.transcript(&order_id, thread)).await??;

    Ok(Json(
        messages
            .into_iter()
            .filter(|m| order.can_read_thread(&claims, m.thread))
            .collect(),
    ))
}

/// POST /api/chat/{order_id}/messages
pub async fn create_message(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let message = send_message(&state, &claims, &order_id, body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// PUT /api/chat/{order_id}/read
pub async fn mark_thread_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = mark_read(&state, &claims, &order_id, body.thread).await?;
    Ok(Json(MarkReadResponse { updated }))
}
