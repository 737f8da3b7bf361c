//! Socket authentication handshake.
//!
//! A connection starts anonymous. Presenting a valid credential binds it to a
//! user: the registry evicts any older session, the user goes online, the
//! connection joins a room for every conversation the user belongs to, and
//! it receives a snapshot of who is online. A failed handshake leaves the
//! connection open and unauthenticated.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::chat::presence::PresenceManager;
use crate::proto::ServerEvent;
use crate::store::{with_retry, RetryPolicy, Store};
use crate::ws::rooms::send_event;
use crate::ws::{ConnectionHandle, RoomRouter};

/// Turns an opaque credential into a user identifier.
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    async fn verify(&self, credential: &str) -> Result<String, VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("credential expired")]
    Expired,
    #[error("credential invalid")]
    Invalid,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Credential(#[from] VerifyError),
    #[error("credential verification timed out")]
    Timeout,
    #[error("connection already authenticated as another user")]
    AlreadyBound,
}

impl HandshakeError {
    /// Text carried by the `auth_error` event.
    fn client_message(&self) -> &'static str {
        match self {
            HandshakeError::Credential(VerifyError::Expired) => "Token expired",
            HandshakeError::Credential(VerifyError::Invalid) => "Invalid token",
            HandshakeError::Timeout => "Authentication timed out",
            HandshakeError::AlreadyBound => "Connection already authenticated",
        }
    }
}

pub struct Handshake {
    verifier: Arc<dyn CredentialVerifier>,
    store: Arc<dyn Store>,
    rooms: Arc<RoomRouter>,
    presence: Arc<PresenceManager>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Handshake {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        store: Arc<dyn Store>,
        rooms: Arc<RoomRouter>,
        presence: Arc<PresenceManager>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            store,
            rooms,
            presence,
            retry,
            timeout,
        }
    }

    /// Authenticate `connection` with `credential`. On failure the client
    /// gets an `auth_error` event and the connection stays open.
    pub async fn authenticate(
        &self,
        connection: &ConnectionHandle,
        credential: &str,
    ) -> Result<String, HandshakeError> {
        match self.bind(connection, credential).await {
            Ok(user_id) => Ok(user_id),
            Err(err) => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error = %err,
                    "Handshake rejected"
                );
                send_event(
                    connection,
                    &ServerEvent::AuthError {
                        message: err.client_message().to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn bind(
        &self,
        connection: &ConnectionHandle,
        credential: &str,
    ) -> Result<String, HandshakeError> {
        let user_id = tokio::time::timeout(self.timeout, self.verifier.verify(credential))
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        let registry = self.rooms.registry();
        if let Some(bound) = registry.owner_of(connection.id()) {
            if bound != user_id {
                return Err(HandshakeError::AlreadyBound);
            }
            tracing::debug!(user_id = %user_id, "Repeated handshake for bound connection");
        }

        registry.register(&user_id, connection.clone());
        tracing::info!(
            user_id = %user_id,
            connection_id = %connection.id(),
            "Connection authenticated"
        );

        // Store failures are logged by the retry layer; the session is live
        // regardless and the sweep or the next transition reconciles.
        let _ = self.presence.mark_online(&user_id).await;
        self.join_conversations(connection, &user_id).await;
        if let Err(e) = self.presence.send_snapshot(connection).await {
            tracing::warn!(user_id = %user_id, error = %e, "Presence snapshot unavailable");
        }

        Ok(user_id)
    }

    async fn join_conversations(&self, connection: &ConnectionHandle, user_id: &str) {
        let conversations = with_retry(&self.retry, "find_conversations_for_user", || {
            let store = self.store.clone();
            let user_id = user_id.to_string();
            async move { store.find_conversations_for_user(&user_id).await }
        })
        .await;

        match conversations {
            Ok(conversations) => {
                let joined = conversations
                    .iter()
                    .filter(|id| self.rooms.join_room(connection.id(), id))
                    .count();
                tracing::debug!(user_id = %user_id, rooms = joined, "Joined conversation rooms");
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Conversation lookup failed; rooms will be joined on demand"
                );
            }
        }
    }
}
