use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::proto::ServerEvent;
use crate::state::AppState;
use crate::ws::protocol::{self, Flow};
use crate::ws::rooms::send_event;
use crate::ws::ConnectionHandle;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Keeps half-open connections from lingering in the registry.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer may keep flushing queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the actor-per-connection pattern for a WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: processes incoming frames, dispatches to protocol handlers
///
/// The connection starts anonymous; `token` from the upgrade query, when
/// present, runs the handshake before the first frame is read.
pub async fn run_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (connection, rx) = ConnectionHandle::channel();

    // Spawn writer task: forwards queued messages to the WebSocket sink
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    tracing::info!(connection_id = %connection.id(), "WebSocket actor started");

    if let Some(token) = token {
        let _ = state.handshake.authenticate(&connection, &token).await;
    }

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_connection = connection.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if !ping_connection.send(Message::Ping(vec![1, 2, 3, 4].into())) {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(
                        connection_id = %ping_connection.id(),
                        "Pong timeout, closing connection"
                    );
                    ping_connection.close(1001, "Pong timeout");
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming frames until the client leaves or the
    // server closes this connection (eviction, logout, pong timeout).
    loop {
        let incoming = tokio::select! {
            _ = connection.closed() => {
                tracing::info!(connection_id = %connection.id(), "Connection closed by server");
                break;
            }
            incoming = ws_receiver.next() => incoming,
        };

        match incoming {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    if protocol::handle_text_message(text.as_str(), &connection, &state).await
                        == Flow::Close
                    {
                        break;
                    }
                }
                Message::Binary(_) => {
                    send_event(
                        &connection,
                        &ServerEvent::error(400, "Binary frames are not supported"),
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    connection.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection.id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection.id(), "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();

    // Connections already evicted by a newer handshake are not in the
    // registry any more, so this is a no-op for them.
    let user_id = state.presence.disconnect(connection.id()).await;

    // Once every handle is dropped the writer flushes what is queued (close
    // frames included) and exits.
    let connection_id = connection.id();
    drop(connection);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = ?user_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            // Send failed or close handshake started; nothing more can go out
            break;
        }
    }
}
