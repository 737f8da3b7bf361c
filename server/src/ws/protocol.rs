use crate::proto::{ClientEvent, MessagePayload, ServerEvent};
use crate::state::AppState;
use crate::store::StoreError;
use crate::ws::rooms::send_event;
use crate::ws::ConnectionHandle;

/// What the actor should do after an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handle an incoming text (JSON) frame.
/// Decodes the event, dispatches it, and reports protocol errors back to the client.
pub async fn handle_text_message(text: &str, connection: &ConnectionHandle, state: &AppState) -> Flow {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                connection_id = %connection.id(),
                error = %e,
                "Failed to decode client event"
            );
            send_error(connection, 400, "Invalid event");
            return Flow::Continue;
        }
    };

    dispatch_event(event, connection, state).await
}

/// Dispatch a decoded event. The registry, not the actor, decides who the
/// connection belongs to, so an evicted connection is treated as anonymous.
async fn dispatch_event(event: ClientEvent, connection: &ConnectionHandle, state: &AppState) -> Flow {
    let owner = state.registry.owner_of(connection.id());

    match event {
        ClientEvent::Authenticate { token } => {
            let _ = state.handshake.authenticate(connection, &token).await;
            Flow::Continue
        }
        ClientEvent::Heartbeat => {
            if let Some(user_id) = owner {
                let _ = state.presence.heartbeat(&user_id).await;
            }
            Flow::Continue
        }
        ClientEvent::ForceUserLogout { user_id } => {
            // Acknowledgement from a client told to log out
            if owner.as_deref() == Some(user_id.as_str()) {
                connection.close(1000, "Logged out");
                return Flow::Close;
            }
            Flow::Continue
        }
        event => match owner {
            Some(user_id) => handle_authenticated(event, &user_id, connection, state).await,
            None => {
                send_error(connection, 401, "Not authenticated");
                Flow::Continue
            }
        },
    }
}

async fn handle_authenticated(
    event: ClientEvent,
    user_id: &str,
    connection: &ConnectionHandle,
    state: &AppState,
) -> Flow {
    match event {
        ClientEvent::Logout { user_id: target } => {
            if target != user_id {
                send_error(connection, 403, "Cannot log out another user");
                return Flow::Continue;
            }
            // Eviction queues the close frame for this connection.
            if let Err(e) = state.presence.logout(user_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Logout not persisted");
            }
            Flow::Close
        }
        ClientEvent::JoinRoom { conversation_id } => {
            if !require_id(connection, &conversation_id) {
                return Flow::Continue;
            }
            if ensure_participant(connection, state, &conversation_id, user_id).await {
                state.rooms.join_room(connection.id(), &conversation_id);
            }
            Flow::Continue
        }
        ClientEvent::LeaveRoom { conversation_id } => {
            state.rooms.leave_room(connection.id(), &conversation_id);
            Flow::Continue
        }
        ClientEvent::SendMessage(payload) => {
            relay_message(payload, user_id, connection, state).await;
            Flow::Continue
        }
        ClientEvent::TypingStart {
            conversation_id,
            username,
            ..
        } => {
            if state.registry.is_in_room(connection.id(), &conversation_id) {
                state.rooms.broadcast_to_room_except(
                    &conversation_id,
                    connection.id(),
                    &ServerEvent::UserTyping {
                        user_id: user_id.to_string(),
                        username,
                    },
                );
            }
            Flow::Continue
        }
        ClientEvent::TypingStop { conversation_id, .. } => {
            if state.registry.is_in_room(connection.id(), &conversation_id) {
                state.rooms.broadcast_to_room_except(
                    &conversation_id,
                    connection.id(),
                    &ServerEvent::UserStoppedTyping {
                        user_id: user_id.to_string(),
                    },
                );
            }
            Flow::Continue
        }
        ClientEvent::MessageReceived {
            message_id,
            conversation_id,
            receiver_id,
        } => {
            if !require_id(connection, &message_id) {
                return Flow::Continue;
            }
            if receiver_id != user_id {
                send_error(connection, 403, "Only the receiver can acknowledge delivery");
                return Flow::Continue;
            }
            if let Err(e) = state
                .status
                .mark_delivered(&message_id, &conversation_id, user_id)
                .await
            {
                send_store_error(connection, &e);
            }
            Flow::Continue
        }
        ClientEvent::MarkMessagesRead {
            conversation_id,
            user_id: reader,
        } => {
            if !require_id(connection, &conversation_id) {
                return Flow::Continue;
            }
            if reader != user_id {
                send_error(connection, 403, "Only the receiver can mark messages read");
                return Flow::Continue;
            }
            if !ensure_participant(connection, state, &conversation_id, user_id).await {
                return Flow::Continue;
            }
            if let Err(e) = state.status.mark_read(&conversation_id, user_id).await {
                send_store_error(connection, &e);
            }
            Flow::Continue
        }
        // Handled before authentication is checked.
        ClientEvent::Authenticate { .. } | ClientEvent::Heartbeat | ClientEvent::ForceUserLogout { .. } => {
            Flow::Continue
        }
    }
}

/// Relay a message the client already persisted over HTTP to its room.
/// A stored id is only carried, and only advanced to `sent`, when the caller
/// sent that message in this conversation.
async fn relay_message(
    mut payload: MessagePayload,
    user_id: &str,
    connection: &ConnectionHandle,
    state: &AppState,
) {
    if !require_id(connection, &payload.conversation_id) {
        return;
    }
    if payload.sender_id.as_deref().is_some_and(|sender| sender != user_id) {
        send_error(connection, 403, "Sender does not match the authenticated user");
        return;
    }

    let conversation_id = payload.conversation_id.clone();
    if !state.registry.is_in_room(connection.id(), &conversation_id) {
        if !ensure_participant(connection, state, &conversation_id, user_id).await {
            return;
        }
        state.rooms.join_room(connection.id(), &conversation_id);
    }

    let owned_id = match payload.id.take() {
        Some(message_id) => owned_message(state, &message_id, &conversation_id, user_id)
            .await
            .then_some(message_id),
        None => None,
    };
    payload.id = owned_id.clone();
    payload.sender_id = Some(user_id.to_string());
    let reached = state
        .rooms
        .broadcast_to_room(&conversation_id, &ServerEvent::ReceiveMessage { message: payload });
    tracing::debug!(conversation_id = %conversation_id, reached, "Message relayed");

    if let Some(message_id) = owned_id {
        if let Err(e) = state
            .status
            .mark_relayed(&message_id, &conversation_id, user_id)
            .await
        {
            tracing::warn!(message_id = %message_id, error = %e, "Sent status not persisted");
        }
    }
}

/// Whether `message_id` is a stored message `user_id` sent in `conversation_id`.
async fn owned_message(
    state: &AppState,
    message_id: &str,
    conversation_id: &str,
    user_id: &str,
) -> bool {
    match state.store.get_message(message_id).await {
        Ok(Some(stored)) if stored.conversation_id == conversation_id && stored.sender_id == user_id => {
            true
        }
        Ok(_) => {
            tracing::debug!(
                message_id = %message_id,
                conversation_id = %conversation_id,
                user_id = %user_id,
                "Relayed id is not the sender's stored message; dropping it"
            );
            false
        }
        Err(e) => {
            tracing::warn!(message_id = %message_id, error = %e, "Relayed message lookup failed");
            false
        }
    }
}

/// Durable membership check; reports 403/404 to the client on failure.
async fn ensure_participant(
    connection: &ConnectionHandle,
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
) -> bool {
    match state.store.conversation_participants(conversation_id).await {
        Ok(participants) if participants.iter().any(|p| p == user_id) => true,
        Ok(_) => {
            send_error(connection, 403, "Not a participant in this conversation");
            false
        }
        Err(e) => {
            send_store_error(connection, &e);
            false
        }
    }
}

fn require_id(connection: &ConnectionHandle, value: &str) -> bool {
    if value.trim().is_empty() {
        send_error(connection, 400, "Missing identifier");
        return false;
    }
    true
}

fn send_store_error(connection: &ConnectionHandle, error: &StoreError) {
    match error {
        StoreError::NotFound(_) => send_error(connection, 404, &error.to_string()),
        _ => {
            tracing::error!(connection_id = %connection.id(), error = %error, "Store call failed");
            send_error(connection, 500, "Internal error");
        }
    }
}

/// Send an error event to the client.
fn send_error(connection: &ConnectionHandle, code: u16, message: &str) {
    send_event(connection, &ServerEvent::error(code, message));
}
