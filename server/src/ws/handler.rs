use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// `token` is optional: clients may instead send an `authenticate` event.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws[?token=JWT]
/// WebSocket upgrade endpoint. Every upgrade gets an actor; authentication
/// happens inside it, so a bad token yields `auth_error` instead of a close.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.filter(|t| !t.is_empty());
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, token))
}
