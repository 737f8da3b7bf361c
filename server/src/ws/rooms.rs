//! Room fan-out: conversation rooms are the live subset of the registry
//! joined to a conversation. Delivery is fire-and-forget.

use std::sync::Arc;

use super::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::proto::ServerEvent;

pub struct RoomRouter {
    registry: Arc<ConnectionRegistry>,
}

impl RoomRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn join_room(&self, connection_id: ConnectionId, conversation_id: &str) -> bool {
        let joined = self.registry.join_room(connection_id, conversation_id);
        if joined {
            tracing::debug!(
                connection_id = %connection_id,
                conversation_id = %conversation_id,
                "Joined room"
            );
        }
        joined
    }

    pub fn leave_room(&self, connection_id: ConnectionId, conversation_id: &str) -> bool {
        self.registry.leave_room(connection_id, conversation_id)
    }

    /// Join the user's live session, if any, to a room.
    pub fn join_user(&self, user_id: &str, conversation_id: &str) -> bool {
        match self.registry.lookup(user_id) {
            Some(connection) => self.join_room(connection.id(), conversation_id),
            None => false,
        }
    }

    /// Deliver to every connection joined to the room. Returns how many were queued.
    pub fn broadcast_to_room(&self, conversation_id: &str, event: &ServerEvent) -> usize {
        deliver(&self.registry.room_members(conversation_id), event)
    }

    /// Room broadcast that skips the originating connection.
    pub fn broadcast_to_room_except(
        &self,
        conversation_id: &str,
        except: ConnectionId,
        event: &ServerEvent,
    ) -> usize {
        let members: Vec<_> = self
            .registry
            .room_members(conversation_id)
            .into_iter()
            .filter(|c| c.id() != except)
            .collect();
        deliver(&members, event)
    }

    /// Deliver to the user's live connection. No-op when the user is offline.
    pub fn broadcast_to_user(&self, user_id: &str, event: &ServerEvent) -> bool {
        match self.registry.lookup(user_id) {
            Some(connection) => deliver(std::slice::from_ref(&connection), event) == 1,
            None => false,
        }
    }

    /// Deliver once to the union of the room's members and the users' live
    /// connections. A connection that is both a member and a named user gets
    /// one copy.
    pub fn broadcast_to_room_and_users(
        &self,
        conversation_id: &str,
        user_ids: &[&str],
        event: &ServerEvent,
    ) -> usize {
        let mut targets = self.registry.room_members(conversation_id);
        for user_id in user_ids {
            if let Some(connection) = self.registry.lookup(user_id) {
                if !targets.iter().any(|c| c.id() == connection.id()) {
                    targets.push(connection);
                }
            }
        }
        deliver(&targets, event)
    }

    /// Deliver to every live session.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        deliver(&self.registry.all_connections(), event)
    }
}

/// Send one event to a single connection, authenticated or not.
pub fn send_event(connection: &ConnectionHandle, event: &ServerEvent) -> bool {
    deliver(std::slice::from_ref(connection), event) == 1
}

fn deliver(connections: &[ConnectionHandle], event: &ServerEvent) -> usize {
    if connections.is_empty() {
        return 0;
    }
    let Some(frame) = event.to_ws_message() else {
        return 0;
    };
    connections
        .iter()
        .filter(|connection| connection.send(frame.clone()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (ConnectionHandle, UnboundedReceiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(user, handle.clone());
        (handle, rx)
    }

    fn next_event(rx: &mut UnboundedReceiver<Message>) -> Option<ServerEvent> {
        match rx.try_recv().ok()? {
            Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }

    #[test]
    fn room_broadcast_reaches_only_members() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RoomRouter::new(registry.clone());
        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (bob, mut bob_rx) = connect(&registry, "bob");
        let (_carol, mut carol_rx) = connect(&registry, "carol");
        router.join_room(alice.id(), "c1");
        router.join_room(bob.id(), "c1");

        let event = ServerEvent::UserStoppedTyping {
            user_id: "alice".into(),
        };
        assert_eq!(router.broadcast_to_room("c1", &event), 2);
        assert_eq!(next_event(&mut alice_rx), Some(event.clone()));
        assert_eq!(next_event(&mut bob_rx), Some(event));
        assert!(next_event(&mut carol_rx).is_none());
    }

    #[test]
    fn typing_style_broadcast_excludes_sender() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RoomRouter::new(registry.clone());
        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (bob, mut bob_rx) = connect(&registry, "bob");
        router.join_room(alice.id(), "c1");
        router.join_room(bob.id(), "c1");

        let event = ServerEvent::UserTyping {
            user_id: "alice".into(),
            username: Some("Alice".into()),
        };
        assert_eq!(router.broadcast_to_room_except("c1", alice.id(), &event), 1);
        assert!(next_event(&mut alice_rx).is_none());
        assert_eq!(next_event(&mut bob_rx), Some(event));
    }

    #[test]
    fn user_broadcast_is_noop_when_offline() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RoomRouter::new(registry.clone());
        let event = ServerEvent::ForceUserLogout {
            user_id: "alice".into(),
        };
        assert!(!router.broadcast_to_user("alice", &event));

        let (_alice, mut rx) = connect(&registry, "alice");
        assert!(router.broadcast_to_user("alice", &event));
        assert_eq!(next_event(&mut rx), Some(event));
    }

    #[test]
    fn room_and_user_fan_out_sends_one_copy_per_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RoomRouter::new(registry.clone());
        let (alice, mut alice_rx) = connect(&registry, "alice");
        let (_bob, mut bob_rx) = connect(&registry, "bob");
        router.join_room(alice.id(), "c1");

        let event = ServerEvent::UserStoppedTyping {
            user_id: "alice".into(),
        };
        assert_eq!(
            router.broadcast_to_room_and_users("c1", &["alice", "bob", "nobody"], &event),
            2
        );
        assert_eq!(next_event(&mut alice_rx), Some(event.clone()));
        assert!(next_event(&mut alice_rx).is_none());
        assert_eq!(next_event(&mut bob_rx), Some(event));
    }

    #[test]
    fn join_user_uses_the_live_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = RoomRouter::new(registry.clone());
        assert!(!router.join_user("alice", "c1"));

        let (alice, _rx) = connect(&registry, "alice");
        assert!(router.join_user("alice", "c1"));
        assert!(registry.is_in_room(alice.id(), "c1"));
    }
}
