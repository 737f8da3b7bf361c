//! REST endpoints for sending messages and acknowledging their status.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::{Message, MessageStatus, NewMessage};
use crate::proto::ServerEvent;
use crate::state::AppState;
use crate::store::StoreError;

/// Maximum message text length (chars).
const MAX_TEXT_LENGTH: usize = 4000;

// --- Request types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: MessageStatus,
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// --- Handlers ---

/// POST /api/messages — Persist a message and fan it out. JWT auth required.
/// The caller is the sender. Returns 201 with the stored message.
pub async fn send_message(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), StatusCode> {
    let sender_id = claims.sub;
    let text = body
        .text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let media_ref = body.media_ref.filter(|m| !m.trim().is_empty());

    if body.conversation_id.is_empty() || body.receiver_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if text.is_none() && media_ref.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if text.as_ref().is_some_and(|t| t.chars().count() > MAX_TEXT_LENGTH) {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let participants = state
        .store
        .conversation_participants(&body.conversation_id)
        .await
        .map_err(|e| store_status(&e))?;
    if !participants.contains(&sender_id) {
        return Err(StatusCode::FORBIDDEN);
    }
    if body.receiver_id == sender_id || !participants.contains(&body.receiver_id) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message = state
        .store
        .insert_message(NewMessage {
            conversation_id: body.conversation_id.clone(),
            sender_id: sender_id.clone(),
            receiver_id: body.receiver_id.clone(),
            text,
            media_ref,
        })
        .await
        .map_err(|e| {
            tracing::error!(
                conversation_id = %body.conversation_id,
                error = %e,
                "Failed to store message"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    // Lazy room join for both parties, then one copy per live connection.
    state.rooms.join_user(&sender_id, &message.conversation_id);
    state.rooms.join_user(&message.receiver_id, &message.conversation_id);
    let reached = state.rooms.broadcast_to_room_and_users(
        &message.conversation_id,
        &[message.receiver_id.as_str(), sender_id.as_str()],
        &ServerEvent::ReceiveMessage {
            message: (&message).into(),
        },
    );
    tracing::debug!(message_id = %message.id, reached, "Message dispatched");

    // The message is durable; a failed status write must not make the client
    // resend it, so the pending copy is returned instead.
    let stored = match state.status.mark_sent(&message.id).await {
        Ok(Some(sent)) => sent,
        Ok(None) => message,
        Err(e) => {
            tracing::warn!(message_id = %message.id, error = %e, "Message left pending");
            message
        }
    };

    Ok((StatusCode::CREATED, Json(stored)))
}

/// PUT /api/messages/{message_id}/status — Receiver acknowledges a message.
/// JWT auth required. Only moves forward; a stale status returns the current one.
pub async fn update_message_status(
    State(state): State<AppState>,
    claims: Claims,
    Path(message_id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<Message>, StatusCode> {
    if body.status == MessageStatus::Pending {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message = state
        .status
        .advance_message(&message_id, &claims.sub, body.status)
        .await
        .map_err(|e| store_status(&e))?;

    Ok(Json(message))
}

/// GET /api/messages/{conversation_id} — Conversation history, oldest first.
/// JWT auth required; participants only.
pub async fn get_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let participants = state
        .store
        .conversation_participants(&conversation_id)
        .await
        .map_err(|e| store_status(&e))?;
    if !participants.contains(&claims.sub) {
        return Err(StatusCode::FORBIDDEN);
    }

    let messages = state
        .store
        .conversation_messages(&conversation_id)
        .await
        .map_err(|e| {
            tracing::error!(conversation_id = %conversation_id, error = %e, "History lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(messages))
}
