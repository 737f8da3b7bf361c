//! Message status engine: pending → sent → delivered → read.
//!
//! Transitions are forward-only and enforced by the store inside one
//! transaction, so concurrent acknowledgements cannot regress a message.
//! Each real transition to `delivered` or `read` is announced to the
//! conversation room and to the sender's live session.

use chrono::Utc;
use std::sync::Arc;

use crate::db::models::{Message, MessageStatus};
use crate::proto::ServerEvent;
use crate::store::{with_retry, RetryPolicy, StatusAdvance, StatusTarget, Store, StoreError};
use crate::ws::RoomRouter;

pub struct StatusEngine {
    store: Arc<dyn Store>,
    rooms: Arc<RoomRouter>,
    retry: RetryPolicy,
}

impl StatusEngine {
    pub fn new(store: Arc<dyn Store>, rooms: Arc<RoomRouter>, retry: RetryPolicy) -> Self {
        Self {
            store,
            rooms,
            retry,
        }
    }

    async fn advance(
        &self,
        target: StatusTarget,
        status: MessageStatus,
    ) -> Result<StatusAdvance, StoreError> {
        with_retry(&self.retry, "advance_message_status", || {
            let store = self.store.clone();
            let target = target.clone();
            async move { store.advance_message_status(&target, status).await }
        })
        .await
    }

    fn announce(&self, message: &Message) {
        self.rooms.broadcast_to_room_and_users(
            &message.conversation_id,
            &[message.sender_id.as_str()],
            &ServerEvent::status_update(message),
        );
    }

    /// pending → sent, once the message has been dispatched. Silent.
    pub async fn mark_sent(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let outcome = self
            .advance(
                StatusTarget::Message {
                    message_id: message_id.to_string(),
                    receiver_id: None,
                },
                MessageStatus::Sent,
            )
            .await?;
        Ok(outcome.first().cloned())
    }

    /// pending → sent for a message relayed over the socket. Only the sender's
    /// own message in that conversation moves. Silent.
    pub async fn mark_relayed(
        &self,
        message_id: &str,
        conversation_id: &str,
        sender_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let outcome = self
            .advance(
                StatusTarget::Outgoing {
                    message_id: message_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    sender_id: sender_id.to_string(),
                },
                MessageStatus::Sent,
            )
            .await?;
        Ok(outcome.first().cloned())
    }

    /// Receiver acknowledged the message. Announces `delivered` whenever the
    /// message now sits at `delivered`, so a repeated ack re-announces the
    /// same state instead of moving it. Nothing is announced for a message
    /// that has already been read.
    pub async fn mark_delivered(
        &self,
        message_id: &str,
        conversation_id: &str,
        receiver_id: &str,
    ) -> Result<Message, StoreError> {
        let outcome = self
            .advance(
                StatusTarget::Message {
                    message_id: message_id.to_string(),
                    receiver_id: Some(receiver_id.to_string()),
                },
                MessageStatus::Delivered,
            )
            .await?;
        let message = outcome
            .first()
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;

        if message.conversation_id != conversation_id {
            tracing::debug!(
                message_id = %message_id,
                claimed = %conversation_id,
                stored = %message.conversation_id,
                "Delivery ack names a different conversation; using the stored one"
            );
        }
        if message.status == MessageStatus::Delivered {
            self.announce(&message);
        }
        Ok(message)
    }

    /// Bulk read for everything addressed to `receiver_id` in the
    /// conversation. Always announces the aggregate `messages_marked_read`;
    /// per-message updates only go out for messages that actually moved.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        receiver_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let outcome = self
            .advance(
                StatusTarget::Conversation {
                    conversation_id: conversation_id.to_string(),
                    receiver_id: receiver_id.to_string(),
                },
                MessageStatus::Read,
            )
            .await?;

        self.rooms.broadcast_to_room(
            conversation_id,
            &ServerEvent::MessagesMarkedRead {
                conversation_id: conversation_id.to_string(),
                user_id: receiver_id.to_string(),
                timestamp: Utc::now(),
            },
        );
        for message in &outcome.advanced {
            self.announce(message);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            receiver_id = %receiver_id,
            advanced = outcome.advanced.len(),
            "Messages marked read"
        );
        Ok(outcome.advanced)
    }

    /// Receiver-driven advance of a single message to any later status.
    pub async fn advance_message(
        &self,
        message_id: &str,
        receiver_id: &str,
        status: MessageStatus,
    ) -> Result<Message, StoreError> {
        let outcome = self
            .advance(
                StatusTarget::Message {
                    message_id: message_id.to_string(),
                    receiver_id: Some(receiver_id.to_string()),
                },
                status,
            )
            .await?;
        let moved = !outcome.advanced.is_empty();
        let message = outcome
            .first()
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;

        if moved && message.status >= MessageStatus::Delivered {
            self.announce(&message);
        }
        Ok(message)
    }
}
