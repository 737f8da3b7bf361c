//! Integration tests for the socket handshake, session eviction and event dispatch.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_query_token_handshake_marks_user_online() {
    let server = start_test_server().await;
    let (_write, _read) = server.connect_as("alice").await;

    let presence = server.presence_of("bob", "alice").await;
    assert_eq!(presence["userId"], "alice");
    assert_eq!(presence["isOnline"], true);
    assert!(presence["activeSession"].is_string());
    assert!(presence["lastSeen"].is_string());
}

#[tokio::test]
async fn test_authenticate_event_after_anonymous_connect() {
    let server = start_test_server().await;
    let (mut write, mut read) = server.connect(None).await;

    send_event(
        &mut write,
        json!({"event": "authenticate", "data": {"token": server.token("alice")}}),
    )
    .await;

    let event = wait_for(&mut read, |e| e["event"] == "user_status_change").await;
    assert_eq!(event["data"]["userId"], "alice");
    assert_eq!(event["data"]["isOnline"], true);
    assert!(server.state.registry.lookup("alice").is_some());
}

#[tokio::test]
async fn test_invalid_token_gets_auth_error_and_connection_stays_open() {
    let server = start_test_server().await;
    let (mut write, mut read) = server.connect(None).await;

    send_event(
        &mut write,
        json!({"event": "authenticate", "data": {"token": "not-a-jwt"}}),
    )
    .await;
    let event = next_event(&mut read).await.expect("auth_error");
    assert_eq!(event["event"], "auth_error");

    // Still open, still anonymous
    send_event(
        &mut write,
        json!({"event": "join_room", "data": {"conversationId": "c1"}}),
    )
    .await;
    let event = next_event(&mut read).await.expect("error event");
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["code"], 401);
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let server = start_test_server().await;
    let expired = token_for(&server.secret, "alice", -3600);
    let (_write, mut read) = server.connect(Some(&expired)).await;

    let event = next_event(&mut read).await.expect("auth_error");
    assert_eq!(event["event"], "auth_error");
    assert_eq!(event["data"]["message"], "Token expired");
    assert!(server.state.registry.lookup("alice").is_none());
}

#[tokio::test]
async fn test_second_connection_evicts_first_without_going_offline() {
    let server = start_test_server().await;
    let (_bob_write, mut bob_read) = server.connect_as("bob").await;
    let (_first_write, mut first_read) = server.connect_as("alice").await;
    drain(&mut bob_read).await;

    let (_second_write, _second_read) = server.connect_as("alice").await;

    assert_eq!(close_code(&mut first_read).await, Some(4000));

    // Give the evicted actor time to run its disconnect path
    tokio::time::sleep(Duration::from_millis(300)).await;
    let presence = server.presence_of("bob", "alice").await;
    assert_eq!(presence["isOnline"], true);
    assert_eq!(server.state.registry.len(), 2);

    // Observers never see alice go offline
    let events = drain(&mut bob_read).await;
    assert!(!events.iter().any(|e| {
        e["event"] == "user_status_change"
            && e["data"]["userId"] == "alice"
            && e["data"]["isOnline"] == false
    }));
}

#[tokio::test]
async fn test_disconnect_marks_offline_and_broadcasts() {
    let server = start_test_server().await;
    let (_bob_write, mut bob_read) = server.connect_as("bob").await;
    let (alice_write, alice_read) = server.connect_as("alice").await;
    drain(&mut bob_read).await;

    drop(alice_write);
    drop(alice_read);

    let event = wait_for(&mut bob_read, |e| {
        e["event"] == "user_status_change" && e["data"]["userId"] == "alice"
    })
    .await;
    assert_eq!(event["data"]["isOnline"], false);

    let presence = server.presence_of("bob", "alice").await;
    assert_eq!(presence["isOnline"], false);
    assert!(presence["activeSession"].is_null());
}

#[tokio::test]
async fn test_new_connection_receives_presence_snapshot() {
    let server = start_test_server().await;
    let (_alice_write, _alice_read) = server.connect_as("alice").await;

    let (_bob_write, mut bob_read) = server.connect(Some(&server.token("bob"))).await;
    let events = drain(&mut bob_read).await;

    let online: Vec<&str> = events
        .iter()
        .filter(|e| e["event"] == "user_status_change" && e["data"]["isOnline"] == true)
        .filter_map(|e| e["data"]["userId"].as_str())
        .collect();
    assert!(online.contains(&"alice"));
    assert!(online.contains(&"bob"));
}

#[tokio::test]
async fn test_malformed_event_returns_error() {
    let server = start_test_server().await;
    let (mut write, mut read) = server.connect_as("alice").await;

    send_event(&mut write, json!({"event": "no_such_event", "data": {}})).await;
    let event = next_event(&mut read).await.expect("error event");
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["code"], 400);

    send_event(
        &mut write,
        json!({"event": "join_room", "data": {"conversationId": ""}}),
    )
    .await;
    let event = next_event(&mut read).await.expect("error event");
    assert_eq!(event["data"]["code"], 400);
}

#[tokio::test]
async fn test_rest_requires_bearer_token() {
    let server = start_test_server().await;
    let resp = server
        .client
        .get(server.url("/api/presence/alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .get(server.url("/api/presence/alice"))
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
