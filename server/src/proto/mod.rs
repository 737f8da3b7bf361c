//! WebSocket wire protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<snake_case name>", "data": {...}}` with camelCase fields.
//! Events without a body (`heartbeat`) omit `data`.

use axum::extract::ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Message, MessageStatus};

/// Message content relayed over the socket. Clients send what the HTTP send
/// path accepted; the server forwards it to the room unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            conversation_id: message.conversation_id.clone(),
            sender_id: Some(message.sender_id.clone()),
            receiver_id: Some(message.receiver_id.clone()),
            text: message.text.clone(),
            media_ref: message.media_ref.clone(),
            status: Some(message.status),
            created_at: Some(message.created_at),
        }
    }
}

/// Events accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    Logout {
        user_id: String,
    },
    Heartbeat,
    JoinRoom {
        conversation_id: String,
    },
    LeaveRoom {
        conversation_id: String,
    },
    SendMessage(MessagePayload),
    TypingStart {
        conversation_id: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
    TypingStop {
        conversation_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    MessageReceived {
        message_id: String,
        conversation_id: String,
        receiver_id: String,
    },
    MarkMessagesRead {
        conversation_id: String,
        user_id: String,
    },
    ForceUserLogout {
        user_id: String,
    },
}

/// Events pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    UserStatusChange {
        user_id: String,
        is_online: bool,
        last_seen: DateTime<Utc>,
    },
    ReceiveMessage {
        message: MessagePayload,
    },
    UserTyping {
        user_id: String,
        #[serde(default)]
        username: Option<String>,
    },
    UserStoppedTyping {
        user_id: String,
    },
    MessageStatusUpdate {
        message_id: String,
        status: MessageStatus,
        conversation_id: String,
    },
    MessagesMarkedRead {
        conversation_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    AuthError {
        message: String,
    },
    ForceUserLogout {
        user_id: String,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn status_update(message: &Message) -> Self {
        Self::MessageStatusUpdate {
            message_id: message.id.clone(),
            status: message.status,
            conversation_id: message.conversation_id.clone(),
        }
    }

    /// Encode as a WebSocket text frame.
    pub fn to_ws_message(&self) -> Option<WsMessage> {
        match serde_json::to_string(self) {
            Ok(text) => Some(WsMessage::Text(text.into())),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server event");
                None
            }
        }
    }
}
