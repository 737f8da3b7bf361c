//! Shared harness for the integration tests: an in-process server on a random
//! port, token minting, and small WebSocket helpers.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use murmur_server::auth::jwt::JwtVerifier;
use murmur_server::auth::middleware::Claims;
use murmur_server::db::models::{Message as StoredMessage, MessageStatus, NewMessage};
use murmur_server::state::{AppState, RealtimeSettings};
use murmur_server::store::SqliteStore;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;
pub type WsRead = futures_util::stream::SplitStream<WsStream>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub secret: Vec<u8>,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestServer {
    pub fn token(&self, user_id: &str) -> String {
        token_for(&self.secret, user_id, 900)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Connect with `?token=` and wait for the handshake's own online broadcast.
    pub async fn connect_as(&self, user_id: &str) -> (WsWrite, WsRead) {
        let (write, mut read) = self.connect(Some(&self.token(user_id))).await;
        wait_for(&mut read, |e| {
            e["event"] == "user_status_change"
                && e["data"]["userId"] == user_id
                && e["data"]["isOnline"] == true
        })
        .await;
        drain(&mut read).await;
        (write, read)
    }

    pub async fn connect(&self, token: Option<&str>) -> (WsWrite, WsRead) {
        let url = match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        };
        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Failed to connect WebSocket");
        stream.split()
    }

    /// POST /api/conversations as `user_id` with `other`; returns the conversation id.
    pub async fn create_conversation(&self, user_id: &str, other: &str) -> String {
        let resp = self
            .client
            .post(self.url("/api/conversations"))
            .bearer_auth(self.token(user_id))
            .json(&json!({ "userId": other }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success(), "create conversation: {}", resp.status());
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn post_message(
        &self,
        sender: &str,
        conversation_id: &str,
        receiver: &str,
        text: &str,
    ) -> reqwest::Response {
        self.client
            .post(self.url("/api/messages"))
            .bearer_auth(self.token(sender))
            .json(&json!({
                "conversationId": conversation_id,
                "receiverId": receiver,
                "text": text,
            }))
            .send()
            .await
            .unwrap()
    }

    pub async fn get_as(&self, user_id: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(self.token(user_id))
            .send()
            .await
            .unwrap()
    }

    /// Store a message directly, leaving it `pending`.
    pub async fn seed_pending(
        &self,
        conversation_id: &str,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> StoredMessage {
        self.state
            .store
            .insert_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_id: sender.to_string(),
                receiver_id: receiver.to_string(),
                text: Some(text.to_string()),
                media_ref: None,
            })
            .await
            .unwrap()
    }

    /// Poll the stored status until it equals `expected` or two seconds pass.
    pub async fn wait_for_status(&self, message_id: &str, expected: MessageStatus) -> MessageStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = self
                .state
                .store
                .get_message(message_id)
                .await
                .unwrap()
                .expect("stored message")
                .status;
            if status == expected || tokio::time::Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn presence_of(&self, viewer: &str, user_id: &str) -> Value {
        let resp = self
            .client
            .get(self.url(&format!("/api/presence/{}", user_id)))
            .bearer_auth(self.token(viewer))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }
}

pub fn token_for(secret: &[u8], user_id: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Helper: start the server on a random port.
pub async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = murmur_server::db::init_db(&data_dir).expect("Failed to init DB");
    let secret = b"integration-test-secret".to_vec();
    let state = AppState::new(
        Arc::new(SqliteStore::new(db)),
        Arc::new(JwtVerifier::new(secret.clone())),
        secret.clone(),
        RealtimeSettings::default(),
    );

    let app = murmur_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        secret,
        state,
        client: reqwest::Client::new(),
    }
}

pub async fn send_event(write: &mut WsWrite, event: Value) {
    write
        .send(Message::Text(event.to_string().into()))
        .await
        .expect("Failed to send event");
}

/// Next frame within `wait`, skipping pings and pongs.
pub async fn next_frame(read: &mut WsRead, wait: Duration) -> Option<Message> {
    loop {
        match tokio::time::timeout(wait, read.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(msg))) => return Some(msg),
            _ => return None,
        }
    }
}

/// Next JSON event within 2 seconds.
pub async fn next_event(read: &mut WsRead) -> Option<Value> {
    match next_frame(read, Duration::from_secs(2)).await? {
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

/// Read events until one matches, panicking after 3 seconds.
pub async fn wait_for(read: &mut WsRead, matches: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_frame(read, remaining).await {
            Some(Message::Text(text)) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                if matches(&event) {
                    return event;
                }
            }
            Some(_) => continue,
            None => panic!("Timed out waiting for event"),
        }
    }
}

/// Collect every event that arrives within 300ms.
pub async fn drain(read: &mut WsRead) -> Vec<Value> {
    let mut events = Vec::new();
    while let Some(frame) = next_frame(read, Duration::from_millis(300)).await {
        if let Message::Text(text) = frame {
            if let Ok(event) = serde_json::from_str(text.as_str()) {
                events.push(event);
            }
        }
    }
    events
}

/// Wait for a close frame and return its code.
pub async fn close_code(read: &mut WsRead) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_frame(read, remaining).await? {
            Message::Close(Some(frame)) => return Some(u16::from(frame.code)),
            Message::Close(None) => return None,
            _ => continue,
        }
    }
}
