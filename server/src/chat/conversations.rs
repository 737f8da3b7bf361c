//! REST endpoints for two-party conversations.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::db::models::{Conversation, ConversationSummary, Message};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    /// The other participant
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListItem {
    pub id: String,
    pub participants: Vec<String>,
    pub other_user_id: Option<String>,
    /// Whether the other participant has a live session right now
    pub is_online: bool,
    pub last_message: Option<Message>,
    /// Latest message time, or the last activity when there is none
    pub last_message_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationListItem>,
}

impl ConversationListItem {
    fn from_summary(summary: ConversationSummary, user_id: &str, state: &AppState) -> Self {
        let other_user_id = summary
            .participants
            .iter()
            .find(|p| p.as_str() != user_id)
            .cloned();
        let is_online = other_user_id
            .as_deref()
            .is_some_and(|other| state.registry.lookup(other).is_some());
        Self {
            last_message_time: summary
                .last_message
                .as_ref()
                .map_or(summary.updated_at, |m| m.created_at),
            id: summary.id,
            participants: summary.participants,
            other_user_id,
            is_online,
            last_message: summary.last_message,
            updated_at: summary.updated_at,
        }
    }
}

/// GET /api/conversations — The caller's conversations, most recently active
/// first. JWT auth required.
pub async fn list_conversations(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ConversationListResponse>, StatusCode> {
    let summaries = state
        .store
        .list_conversations(&claims.sub)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %claims.sub, error = %e, "Conversation list failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let conversations = summaries
        .into_iter()
        .map(|summary| ConversationListItem::from_summary(summary, &claims.sub, &state))
        .collect();
    Ok(Json(ConversationListResponse { conversations }))
}

/// POST /api/conversations — Create or get the conversation with another user.
/// JWT auth required. Both participants' live sessions join its room, so the
/// first message reaches them without a client-side join.
pub async fn create_conversation(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), StatusCode> {
    let other = body.user_id.trim();
    if other.is_empty() || other == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (conversation, created) = state
        .store
        .get_or_create_conversation(&claims.sub, other)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %claims.sub, error = %e, "Conversation lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    for participant in &conversation.participants {
        state.rooms.join_user(participant, &conversation.id);
    }

    if created {
        tracing::info!(conversation_id = %conversation.id, "Conversation created");
        Ok((StatusCode::CREATED, Json(conversation)))
    } else {
        Ok((StatusCode::OK, Json(conversation)))
    }
}
