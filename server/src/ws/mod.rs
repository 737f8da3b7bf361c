pub mod actor;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod rooms;

use axum::extract::ws::{CloseFrame, Message};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub use registry::{ConnectionRegistry, Session};
pub use rooms::RoomRouter;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Close code sent to a session replaced by a newer handshake for the same user.
pub const CLOSE_SESSION_REPLACED: u16 = 4000;
/// Close code sent to a session ended by an explicit logout.
pub const CLOSE_LOGGED_OUT: u16 = 4001;

/// Identifies one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cloneable handle to a connection actor: its outbound queue plus a
/// shutdown signal the actor's reader loop listens on.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: ConnectionSender,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(sender: ConnectionSender) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle plus the receiving end of its outbound queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for the writer task. Returns false once the writer is gone.
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Queue a close frame and stop the actor's reader loop.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
        // notify_one stores a permit, so a shutdown requested before the
        // actor starts waiting is not lost.
        self.shutdown.notify_one();
    }

    /// Resolves once `close` has been called on any clone of this handle.
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }
}
