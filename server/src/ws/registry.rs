//! Connection registry: the live user ↔ connection relation.
//!
//! Holds both directions of the mapping plus the room index behind a single
//! lock, so eviction-then-insert and unregister-with-room-purge are atomic
//! with respect to every other registry call. The lock is never held across
//! an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{ConnectionHandle, ConnectionId, CLOSE_SESSION_REPLACED};

/// One live, authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub connection: ConnectionHandle,
    pub joined_rooms: HashSet<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// user_id -> session
    sessions: HashMap<String, Session>,
    /// connection_id -> user_id
    owners: HashMap<ConnectionId, String>,
    /// conversation_id -> joined connections
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove_session(&mut self, user_id: &str) -> Option<Session> {
        let session = self.sessions.remove(user_id)?;
        self.owners.remove(&session.connection.id());
        let connection_id = session.connection.id();
        for room in &session.joined_rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(session)
    }

    fn handles(&self, ids: impl Iterator<Item = ConnectionId>) -> Vec<ConnectionHandle> {
        ids.filter_map(|id| self.owners.get(&id))
            .filter_map(|user| self.sessions.get(user))
            .map(|session| session.connection.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Every critical section leaves the maps consistent before it can
        // panic, so a poisoned lock still guards valid data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind `connection` to `user_id`. A different connection already bound
    /// to the user is closed and removed first; the evicted session is
    /// returned. Registering the same connection twice is a no-op.
    pub fn register(&self, user_id: &str, connection: ConnectionHandle) -> Option<Session> {
        let mut inner = self.lock();

        if let Some(existing) = inner.sessions.get(user_id) {
            if existing.connection.id() == connection.id() {
                return None;
            }
        }

        let evicted = inner.remove_session(user_id);
        if let Some(old) = &evicted {
            old.connection.close(CLOSE_SESSION_REPLACED, "Session replaced");
        }

        inner.owners.insert(connection.id(), user_id.to_string());
        inner.sessions.insert(
            user_id.to_string(),
            Session {
                user_id: user_id.to_string(),
                connection,
                joined_rooms: HashSet::new(),
            },
        );
        drop(inner);

        if let Some(old) = &evicted {
            tracing::info!(
                user_id = %user_id,
                evicted_connection = %old.connection.id(),
                "Evicted previous session"
            );
        }
        evicted
    }

    /// Current connection for a user, if any.
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.lock()
            .sessions
            .get(user_id)
            .map(|session| session.connection.clone())
    }

    /// User bound to a connection, if any.
    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.lock().owners.get(&connection_id).cloned()
    }

    /// Remove whichever session owns `connection_id`. Idempotent.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Session> {
        let mut inner = self.lock();
        let user_id = inner.owners.get(&connection_id).cloned()?;
        inner.remove_session(&user_id)
    }

    /// Remove and close the user's session, if any.
    pub fn evict_user(&self, user_id: &str, code: u16, reason: &str) -> Option<Session> {
        let evicted = self.lock().remove_session(user_id);
        if let Some(session) = &evicted {
            session.connection.close(code, reason);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles for every live session.
    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.lock()
            .sessions
            .values()
            .map(|session| session.connection.clone())
            .collect()
    }

    // --- Room membership, driven by RoomRouter ---

    /// Returns false when the connection has no live session.
    pub(crate) fn join_room(&self, connection_id: ConnectionId, room: &str) -> bool {
        let mut inner = self.lock();
        let Some(user_id) = inner.owners.get(&connection_id).cloned() else {
            return false;
        };
        if let Some(session) = inner.sessions.get_mut(&user_id) {
            session.joined_rooms.insert(room.to_string());
        }
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        true
    }

    /// Returns whether the connection was a member.
    pub(crate) fn leave_room(&self, connection_id: ConnectionId, room: &str) -> bool {
        let mut inner = self.lock();
        let Some(user_id) = inner.owners.get(&connection_id).cloned() else {
            return false;
        };
        if let Some(session) = inner.sessions.get_mut(&user_id) {
            session.joined_rooms.remove(room);
        }
        let mut was_member = false;
        if let Some(members) = inner.rooms.get_mut(room) {
            was_member = members.remove(&connection_id);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        was_member
    }

    pub fn is_in_room(&self, connection_id: ConnectionId, room: &str) -> bool {
        self.lock()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub fn room_members(&self, room: &str) -> Vec<ConnectionHandle> {
        let inner = self.lock();
        match inner.rooms.get(room) {
            Some(members) => inner.handles(members.iter().copied()),
            None => Vec::new(),
        }
    }

    /// Rooms the user's live session has joined.
    pub fn joined_rooms(&self, user_id: &str) -> HashSet<String> {
        self.lock()
            .sessions
            .get(user_id)
            .map(|session| session.joined_rooms.clone())
            .unwrap_or_default()
    }
}
