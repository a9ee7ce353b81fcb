//! WebSocket integration tests against a live listener.
//!
//! Run with: `cargo test --test websocket_integration_test`

mod helpers;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use helpers::{spawn_test_server, test_state};
use http_body_util::BodyExt;
use huddle_server::api::create_router;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WebSocket connect failed");
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send failed");
}

/// Next JSON text frame, skipping control frames.
async fn next_frame(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame is not JSON");
        }
    }
}

/// Read frames until one with the given event name arrives.
async fn expect_event(ws: &mut Client, event: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["event"] == event {
            return frame["data"].clone();
        }
    }
}

#[tokio::test]
async fn test_identity_and_peer_joined_over_socket() {
    let state = test_state();
    let (addr, _server) = spawn_test_server(state.clone()).await;

    let mut alice = connect(addr).await;
    send(&mut alice, json!({ "event": "set-identity", "data": "alice" })).await;
    let confirmed = expect_event(&mut alice, "identity-confirmed").await;
    assert_eq!(confirmed["username"], "alice");

    let mut bob = connect(addr).await;
    send(&mut bob, json!({ "event": "set-username", "data": "bob", "ack": 1 })).await;
    let ack = expect_event(&mut bob, "ack").await;
    assert_eq!(ack["id"], 1);
    assert_eq!(ack["data"]["username"], "bob");

    let joined = expect_event(&mut alice, "peer-joined").await;
    assert_eq!(joined["username"], "bob");
    assert_eq!(joined["message"], "bob has joined the chat");

    assert_eq!(state.presence.online().await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_chat_message_relayed_verbatim() {
    let state = test_state();
    let (addr, _server) = spawn_test_server(state).await;

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    send(&mut bob, json!({ "event": "ping", "ack": 1 })).await;
    expect_event(&mut bob, "ack").await;

    let message = json!({ "id": "m1", "text": "hi bob", "meta": { "nested": [1, 2] } });
    send(&mut alice, json!({ "event": "send-message", "data": message, "ack": 5 })).await;

    let relayed = expect_event(&mut bob, "message").await;
    assert_eq!(relayed, message);

    let ack = expect_event(&mut alice, "ack").await;
    assert_eq!(ack["id"], 5);
    assert_eq!(ack["data"]["delivered"], 1);
}

#[tokio::test]
async fn test_bad_frame_keeps_connection_open() {
    let state = test_state();
    let (addr, _server) = spawn_test_server(state).await;

    let mut ws = connect(addr).await;
    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = expect_event(&mut ws, "error").await;
    assert_eq!(error["code"], "invalid_payload");

    send(&mut ws, json!({ "event": "ping" })).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["event"], "pong");
}

#[tokio::test]
async fn test_socket_close_broadcasts_peer_left() {
    let state = test_state();
    let (addr, _server) = spawn_test_server(state.clone()).await;

    let mut alice = connect(addr).await;
    send(&mut alice, json!({ "event": "set-identity", "data": "alice" })).await;
    expect_event(&mut alice, "identity-confirmed").await;

    let mut bob = connect(addr).await;
    send(&mut bob, json!({ "event": "set-identity", "data": "bob" })).await;
    expect_event(&mut bob, "identity-confirmed").await;

    alice.close(None).await.unwrap();

    let left = expect_event(&mut bob, "peer-left").await;
    assert_eq!(left["username"], "alice");
    assert_eq!(state.presence.lookup("alice").await, None);
}

#[tokio::test]
async fn test_health_counts_live_socket() {
    let state = test_state();
    let (addr, _server) = spawn_test_server(state.clone()).await;

    let mut ws = connect(addr).await;
    send(&mut ws, json!({ "event": "set-identity", "data": "alice" })).await;
    expect_event(&mut ws, "identity-confirmed").await;

    let response = create_router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["onlineUsers"], 1);
    assert_eq!(health["connections"], 1);
}
