use std::sync::Arc;
use std::time::Duration;

use crate::auth::handshake::{CredentialVerifier, Handshake};
use crate::chat::presence::PresenceManager;
use crate::chat::status::StatusEngine;
use crate::config::Config;
use crate::store::{RetryPolicy, Store};
use crate::ws::{ConnectionRegistry, RoomRouter};

/// Tunables for the realtime core, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    pub stale_after: Duration,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RealtimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: config.retry_policy(),
            handshake_timeout: config.handshake_timeout(),
            stale_after: Duration::from_secs(config.presence().stale_after_secs),
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Durable presence, membership and message status
    pub store: Arc<dyn Store>,
    /// Live user <-> connection relation and room index
    pub registry: Arc<ConnectionRegistry>,
    /// Room and user fan-out
    pub rooms: Arc<RoomRouter>,
    pub presence: Arc<PresenceManager>,
    pub status: Arc<StatusEngine>,
    pub handshake: Arc<Handshake>,
    /// HS256 secret for the Claims extractor on REST routes
    pub jwt_secret: Vec<u8>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        verifier: Arc<dyn CredentialVerifier>,
        jwt_secret: Vec<u8>,
        settings: RealtimeSettings,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRouter::new(registry.clone()));
        let presence = Arc::new(PresenceManager::new(
            store.clone(),
            rooms.clone(),
            settings.retry,
            settings.stale_after,
        ));
        let status = Arc::new(StatusEngine::new(store.clone(), rooms.clone(), settings.retry));
        let handshake = Arc::new(Handshake::new(
            verifier,
            store.clone(),
            rooms.clone(),
            presence.clone(),
            settings.retry,
            settings.handshake_timeout,
        ));

        Self {
            store,
            registry,
            rooms,
            presence,
            status,
            handshake,
            jwt_secret,
        }
    }
}
