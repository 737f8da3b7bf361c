use axum::{middleware, routing, Router};

use crate::auth::middleware::JwtSecret;
use crate::chat::{conversations, messages, presence};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Authenticated routes (JWT required, Claims extractor validates token)
    let authenticated_routes = Router::new()
        .route("/api/auth/logout", routing::post(presence::logout))
        .route("/api/presence/{user_id}", routing::get(presence::get_presence))
        .route(
            "/api/conversations",
            routing::get(conversations::list_conversations)
                .post(conversations::create_conversation),
        )
        .route("/api/messages", routing::post(messages::send_message))
        // Both routes share the `{id}` segment: a conversation id for history,
        // a message id for status.
        .route("/api/messages/{id}", routing::get(messages::get_messages))
        .route(
            "/api/messages/{id}/status",
            routing::put(messages::update_message_status),
        );

    // WebSocket endpoint (auth via handshake event or ?token=, not JWT header)
    let ws_routes = Router::new().route("/ws", routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", routing::get(health_check));

    Router::new()
        .merge(authenticated_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
