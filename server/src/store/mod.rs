//! Durable store seam for the realtime core.
//!
//! The core never talks to SQLite directly: presence, status and membership
//! lookups all go through [`Store`], so handlers can be exercised against any
//! backing implementation.

pub mod retry;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{
    Conversation, ConversationSummary, Message, MessageStatus, NewMessage, PresenceRecord,
};

pub use retry::{with_retry, RetryPolicy};
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed. Only lock contention
    /// counts for SQLite; constraint and CHECK failures repeat every time.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(error, _)) => matches!(
                error.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Database(_) => false,
            StoreError::LockPoisoned | StoreError::Join(_) => true,
            StoreError::NotFound(_) | StoreError::Corrupt(_) => false,
        }
    }
}

/// Which messages a status advance applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTarget {
    /// One message, optionally restricted to a specific receiver.
    Message {
        message_id: String,
        receiver_id: Option<String>,
    },
    /// One message, only if `sender_id` sent it in `conversation_id`.
    Outgoing {
        message_id: String,
        conversation_id: String,
        sender_id: String,
    },
    /// Every message in a conversation addressed to `receiver_id`.
    Conversation {
        conversation_id: String,
        receiver_id: String,
    },
}

/// Outcome of [`Store::advance_message_status`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusAdvance {
    /// Messages moved forward by this call, carrying their new status.
    pub advanced: Vec<Message>,
    /// Matched messages already at or past the requested status.
    pub unchanged: Vec<Message>,
}

impl StatusAdvance {
    pub fn is_empty(&self) -> bool {
        self.advanced.is_empty() && self.unchanged.is_empty()
    }

    /// First matched message regardless of whether it moved.
    pub fn first(&self) -> Option<&Message> {
        self.advanced.first().or_else(|| self.unchanged.first())
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn find_conversations_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Returns the two-party conversation and whether it was created by this call.
    async fn get_or_create_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<(Conversation, bool), StoreError>;

    async fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Refresh `last_seen` without touching `is_online`.
    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError>;

    /// All presence records currently marked online.
    async fn online_presence(&self) -> Result<Vec<PresenceRecord>, StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Conversation history, oldest first.
    async fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    /// The user's conversations, most recently active first, each with its
    /// latest message.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Move matching messages forward to `status`. Never moves a status backwards.
    async fn advance_message_status(
        &self,
        target: &StatusTarget,
        status: MessageStatus,
    ) -> Result<StatusAdvance, StoreError>;
}
