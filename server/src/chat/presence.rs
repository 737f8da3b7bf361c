//! Server-side presence tracking and broadcast.
//!
//! The live registry is the source of truth for "connected"; the durable
//! presence record follows it. Every transition is written through the store
//! and then broadcast to all live sessions. A periodic sweep flips records
//! left online by connections that vanished without a close event.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::auth::middleware::Claims;
use crate::proto::ServerEvent;
use crate::state::AppState;
use crate::store::{with_retry, RetryPolicy, Store, StoreError};
use crate::ws::rooms::send_event;
use crate::ws::{ConnectionHandle, ConnectionId, ConnectionRegistry, RoomRouter, CLOSE_LOGGED_OUT};

/// Shortest sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct PresenceManager {
    store: Arc<dyn Store>,
    rooms: Arc<RoomRouter>,
    retry: RetryPolicy,
    stale_after: chrono::Duration,
}

impl PresenceManager {
    pub fn new(
        store: Arc<dyn Store>,
        rooms: Arc<RoomRouter>,
        retry: RetryPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            rooms,
            retry,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::weeks(52)),
        }
    }

    fn registry(&self) -> &ConnectionRegistry {
        self.rooms.registry()
    }

    fn is_live(&self, user_id: &str) -> bool {
        self.registry().lookup(user_id).is_some()
    }

    async fn write_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        with_retry(&self.retry, "set_presence", || {
            let store = self.store.clone();
            let user_id = user_id.to_string();
            async move { store.set_presence(&user_id, is_online, last_seen).await }
        })
        .await
    }

    fn broadcast_status(&self, user_id: &str, is_online: bool, last_seen: DateTime<Utc>) {
        self.rooms.broadcast_all(&ServerEvent::UserStatusChange {
            user_id: user_id.to_string(),
            is_online,
            last_seen,
        });
    }

    /// offline → online. Broadcast even when the store write fails: the live
    /// session exists regardless, and the error is returned for the caller.
    pub async fn mark_online(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = self.write_presence(user_id, true, now).await;
        self.broadcast_status(user_id, true, now);
        tracing::info!(user_id = %user_id, "User online");
        result
    }

    /// online → offline, unless the user has a live session. Returns whether
    /// the transition happened.
    pub async fn mark_offline(&self, user_id: &str) -> Result<bool, StoreError> {
        self.force_offline(user_id, Utc::now()).await
    }

    async fn force_offline(&self, user_id: &str, last_seen: DateTime<Utc>) -> Result<bool, StoreError> {
        if self.is_live(user_id) {
            tracing::debug!(user_id = %user_id, "Skipping offline transition, session is live");
            return Ok(false);
        }

        self.write_presence(user_id, false, last_seen).await?;

        // A handshake may have landed while the write was in flight.
        if self.is_live(user_id) {
            tracing::debug!(user_id = %user_id, "Session appeared during offline write, restoring");
            self.write_presence(user_id, true, Utc::now()).await?;
            return Ok(false);
        }

        self.broadcast_status(user_id, false, last_seen);
        tracing::info!(user_id = %user_id, "User offline");
        Ok(true)
    }

    /// Connection closed: drop its session and go offline if it was still the
    /// user's live session. Connections already evicted produce no transition.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<String> {
        let session = self.registry().unregister(connection_id)?;
        tracing::debug!(
            user_id = %session.user_id,
            connection_id = %connection_id,
            rooms = session.joined_rooms.len(),
            "Connection unregistered"
        );
        if let Err(e) = self.mark_offline(&session.user_id).await {
            tracing::warn!(
                user_id = %session.user_id,
                error = %e,
                "Offline transition not persisted; sweep will reconcile"
            );
        }
        Some(session.user_id)
    }

    /// Explicit logout: evict the session, go offline, tell every client.
    /// The session itself hears the notice before its close frame, since the
    /// global broadcast runs after eviction.
    pub async fn logout(&self, user_id: &str) -> Result<(), StoreError> {
        let notice = ServerEvent::ForceUserLogout {
            user_id: user_id.to_string(),
        };
        self.rooms.broadcast_to_user(user_id, &notice);
        if self
            .registry()
            .evict_user(user_id, CLOSE_LOGGED_OUT, "Logged out")
            .is_some()
        {
            tracing::info!(user_id = %user_id, "Session evicted by logout");
        }
        let result = self.mark_offline(user_id).await;
        self.rooms.broadcast_all(&notice);
        result.map(|_| ())
    }

    /// Refresh `last_seen` only.
    pub async fn heartbeat(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        with_retry(&self.retry, "touch_last_seen", || {
            let store = self.store.clone();
            let user_id = user_id.to_string();
            async move { store.touch_last_seen(&user_id, now).await }
        })
        .await
    }

    /// Send the connection one `user_status_change` per user recorded online.
    pub async fn send_snapshot(&self, connection: &ConnectionHandle) -> Result<usize, StoreError> {
        let online = self.store.online_presence().await?;
        let sent = online
            .iter()
            .filter(|record| {
                send_event(
                    connection,
                    &ServerEvent::UserStatusChange {
                        user_id: record.user_id.clone(),
                        is_online: true,
                        last_seen: record.last_seen,
                    },
                )
            })
            .count();
        Ok(sent)
    }

    pub async fn sweep(&self) -> Result<Vec<String>, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Flip to offline every user recorded online whose `last_seen` is older
    /// than the staleness threshold and who has no live session. The record
    /// keeps its last real activity time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let online = with_retry(&self.retry, "online_presence", || {
            let store = self.store.clone();
            async move { store.online_presence().await }
        })
        .await?;

        let mut flipped = Vec::new();
        for record in online {
            if now.signed_duration_since(record.last_seen) <= self.stale_after {
                continue;
            }
            match self.force_offline(&record.user_id, record.last_seen).await {
                Ok(true) => flipped.push(record.user_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        user_id = %record.user_id,
                        error = %e,
                        "Sweep could not flip stale presence"
                    );
                }
            }
        }
        Ok(flipped)
    }

    /// Run the sweep every `every` (at least [`MIN_SWEEP_INTERVAL`]) until the
    /// runtime shuts down.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(flipped) if !flipped.is_empty() => {
                        tracing::info!(count = flipped.len(), "Presence sweep flipped stale users offline");
                    }
                    Ok(_) => tracing::debug!("Presence sweep: nothing stale"),
                    Err(e) => tracing::error!(error = %e, "Presence sweep failed"),
                }
            }
        })
    }
}

// --- REST endpoint handlers ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub active_session: Option<String>,
}

/// GET /api/presence/{user_id} — Live status plus durable last activity. JWT auth required.
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, StatusCode> {
    let active = state.registry.lookup(&user_id);
    let record = state.store.get_presence(&user_id).await.map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "Presence lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(PresenceResponse {
        user_id,
        is_online: active.is_some(),
        last_seen: record.map(|r| r.last_seen),
        active_session: active.map(|c| c.id().to_string()),
    }))
}

/// POST /api/auth/logout — End the caller's session. JWT auth required.
pub async fn logout(State(state): State<AppState>, claims: Claims) -> StatusCode {
    match state.presence.logout(&claims.sub).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::store::SqliteStore;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        presence: PresenceManager,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(open_in_memory()));
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRouter::new(registry.clone()));
        let presence = PresenceManager::new(
            store.clone(),
            rooms,
            RetryPolicy::default(),
            Duration::from_secs(600),
        );
        Fixture {
            store,
            registry,
            presence,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn online_transition_is_persisted_and_broadcast_globally() {
        let f = fixture();
        let (watcher, mut watcher_rx) = ConnectionHandle::channel();
        f.registry.register("carol", watcher);
        f.registry.register("alice", ConnectionHandle::channel().0);

        f.presence.mark_online("alice").await.unwrap();

        let record = f.store.get_presence("alice").await.unwrap().unwrap();
        assert!(record.is_online);
        let events = drain(&mut watcher_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStatusChange { user_id, is_online: true, .. }] if user_id == "alice"
        ));
    }

    #[tokio::test]
    async fn offline_is_skipped_while_a_session_is_live() {
        let f = fixture();
        f.registry.register("alice", ConnectionHandle::channel().0);
        f.presence.mark_online("alice").await.unwrap();

        assert!(!f.presence.mark_offline("alice").await.unwrap());
        assert!(f.store.get_presence("alice").await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn disconnect_of_evicted_connection_keeps_user_online() {
        let f = fixture();
        let old = ConnectionHandle::channel().0;
        let new = ConnectionHandle::channel().0;
        f.registry.register("alice", old.clone());
        f.presence.mark_online("alice").await.unwrap();
        f.registry.register("alice", new);

        assert!(f.presence.disconnect(old.id()).await.is_none());
        assert!(f.store.get_presence("alice").await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn disconnect_of_live_connection_goes_offline() {
        let f = fixture();
        let conn = ConnectionHandle::channel().0;
        f.registry.register("alice", conn.clone());
        f.presence.mark_online("alice").await.unwrap();

        assert_eq!(f.presence.disconnect(conn.id()).await.as_deref(), Some("alice"));
        assert!(!f.store.get_presence("alice").await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_last_seen_only() {
        let f = fixture();
        let old = Utc::now() - chrono::Duration::hours(1);
        f.store.set_presence("alice", false, old).await.unwrap();

        f.presence.heartbeat("alice").await.unwrap();

        let record = f.store.get_presence("alice").await.unwrap().unwrap();
        assert!(!record.is_online);
        assert!(record.last_seen > old);
    }

    #[tokio::test]
    async fn sweep_flips_only_stale_users_without_sessions() {
        let f = fixture();
        let now = Utc::now();
        let stale = now - chrono::Duration::minutes(11);
        f.store.set_presence("gone", true, stale).await.unwrap();
        f.store.set_presence("idle_but_connected", true, stale).await.unwrap();
        f.store
            .set_presence("recent", true, now - chrono::Duration::minutes(2))
            .await
            .unwrap();
        f.registry
            .register("idle_but_connected", ConnectionHandle::channel().0);
        let (watcher, mut watcher_rx) = ConnectionHandle::channel();
        f.registry.register("watcher", watcher);

        let flipped = f.presence.sweep_at(now).await.unwrap();
        assert_eq!(flipped, vec!["gone".to_string()]);

        let gone = f.store.get_presence("gone").await.unwrap().unwrap();
        assert!(!gone.is_online);
        assert_eq!(gone.last_seen.timestamp_millis(), stale.timestamp_millis());
        assert!(f.store.get_presence("idle_but_connected").await.unwrap().unwrap().is_online);
        assert!(f.store.get_presence("recent").await.unwrap().unwrap().is_online);

        let events = drain(&mut watcher_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStatusChange { user_id, is_online: false, .. }] if user_id == "gone"
        ));
    }

    #[tokio::test]
    async fn logout_evicts_and_announces() {
        let f = fixture();
        let (alice, mut alice_rx) = ConnectionHandle::channel();
        let (bob, mut bob_rx) = ConnectionHandle::channel();
        f.registry.register("alice", alice);
        f.registry.register("bob", bob);
        f.presence.mark_online("alice").await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        f.presence.logout("alice").await.unwrap();

        assert!(f.registry.lookup("alice").is_none());
        assert!(!f.store.get_presence("alice").await.unwrap().unwrap().is_online);
        match alice_rx.try_recv() {
            Ok(Message::Text(text)) => assert!(matches!(
                serde_json::from_str(text.as_str()).unwrap(),
                ServerEvent::ForceUserLogout { user_id } if user_id == "alice"
            )),
            other => panic!("expected the logout notice first, got {:?}", other),
        }
        assert!(matches!(alice_rx.try_recv(), Ok(Message::Close(_))));
        let events = drain(&mut bob_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::UserStatusChange { user_id, is_online: false, .. } if user_id == "alice"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ForceUserLogout { user_id } if user_id == "alice"
        )));
    }

    #[tokio::test]
    async fn sweeper_survives_a_zero_period() {
        let presence = Arc::new(fixture().presence);
        let handle = presence.spawn_sweeper(Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
