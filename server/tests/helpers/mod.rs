//! Reusable test helpers for integration tests.
//!
//! `TestPeer` drives the dispatch path in-process through
//! `handle_client_message`, `spawn_test_server` binds the full router on an
//! ephemeral port for socket-level tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use huddle_server::api::{create_router, AppState};
use huddle_server::config::Config;
use huddle_server::voice::InMemoryMediaEngine;
use huddle_server::ws::{handle_client_message, AckPayload, ServerEvent, Session};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fresh application state with the in-memory media engine.
pub fn test_state() -> AppState {
    let config = Config::default_for_test();
    let engine = Arc::new(InMemoryMediaEngine::from_config(&config));
    AppState::new(config, engine)
}

/// Serve the full router on 127.0.0.1 with an ephemeral port.
pub async fn spawn_test_server(state: AppState) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("No local addr");
    let app = create_router(state);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });

    (addr, handle)
}

/// In-process client: a session registered with the hub plus its inbox.
pub struct TestPeer {
    pub session: Session,
    rx: mpsc::Receiver<ServerEvent>,
    backlog: Vec<ServerEvent>,
    next_ack: u64,
}

impl TestPeer {
    /// Open a connection without an identity.
    pub fn connect(state: &AppState) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let session = Session::new(tx.clone());
        state.hub.register(session.conn_id, tx);
        Self {
            session,
            rx,
            backlog: Vec::new(),
            next_ack: 1,
        }
    }

    /// Open a connection and register `name`.
    pub async fn join(state: &AppState, name: &str) -> Self {
        let mut peer = Self::connect(state);
        peer.emit(state, "set-identity", json!(name)).await;
        peer
    }

    /// Send a frame without an ack id.
    pub async fn emit(&mut self, state: &AppState, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data });
        handle_client_message(&frame.to_string(), &mut self.session, state).await;
    }

    /// Send a frame with an ack id and return the matching ack.
    pub async fn request(&mut self, state: &AppState, event: &str, data: Value) -> AckPayload {
        let id = self.next_ack;
        self.next_ack += 1;

        let frame = json!({ "event": event, "data": data, "ack": id });
        handle_client_message(&frame.to_string(), &mut self.session, state).await;

        while let Ok(event) = self.rx.try_recv() {
            match event {
                ServerEvent::Ack(ack) if ack.id == id => return ack,
                other => self.backlog.push(other),
            }
        }
        panic!("no ack for {event} (id {id})");
    }

    /// Like `request`, but panics on an error ack and returns its data.
    pub async fn call(&mut self, state: &AppState, event: &str, data: Value) -> Value {
        let ack = self.request(state, event, data).await;
        assert!(ack.error.is_none(), "{event} failed: {ack:?}");
        ack.data.unwrap_or(Value::Null)
    }

    /// Everything received so far, oldest first.
    pub fn events(&mut self) -> Vec<ServerEvent> {
        let mut events = std::mem::take(&mut self.backlog);
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Opus send parameters as a browser would publish them.
pub fn opus_rtp_parameters(cname: &str) -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2,
            "parameters": { "minptime": 10, "useinbandfec": 1 }
        }],
        "encodings": [{ "ssrc": 11111111 }],
        "rtcp": { "cname": cname }
    })
}

/// DTLS parameters of a browser transport.
pub fn client_dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "E5:F5:CA:A7:2D:93:E6:16:AC:21:09:9F:23:51:62:8C:D0:66:E9:0C:22:54:2B:82:0C:DF:E0:C5:2C:7E:CD:53"
        }]
    })
}
