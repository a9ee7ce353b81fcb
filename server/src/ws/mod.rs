//! WebSocket Handler
//!
//! Real-time presence, chat relay, call signaling and media control over one
//! socket per client. Frames are JSON text: `{"event": ..., "data": ...}`,
//! with an optional client `ack` id answered by an `ack` event.

mod hub;
mod session;

pub use hub::ConnectionHub;
pub use session::Session;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::chat;
use crate::presence::{self, PresenceError};
use crate::voice::call::CallPhase;
use crate::voice::call_handlers::{handle_call_event, release_call_media};
use crate::voice::engine::{DtlsParameters, IceParameters};
use crate::voice::ws_handler::handle_voice_event;
use crate::voice::{
    CallError, ConsumerId, MediaKind, ProducerId, RoomId, RtpCapabilities, RtpParameters,
    TransportId, VoiceError,
};

/// Opaque handle of one live socket.
pub type ConnId = Uuid;

/// Client-to-server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Ping for keepalive
    Ping,
    /// Claim a username for this connection
    #[serde(alias = "set-username")]
    SetIdentity(String),

    /// Ring another user
    CallUser {
        #[serde(default)]
        from: Option<String>,
        to: String,
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        signal: Option<Value>,
    },
    /// Accept an incoming call
    #[serde(alias = "call-accepted")]
    CallAnswer {
        #[serde(default)]
        from: Option<String>,
        to: String,
        #[serde(default)]
        signal: Option<Value>,
    },
    /// Decline or abort a call
    CallFailed {
        to: String,
        #[serde(default)]
        message: Option<String>,
    },
    /// Hang up
    EndCall { to: String },
    /// Opaque ICE candidate for the other party
    IceCandidate { to: String, candidate: Value },

    /// Router capabilities of a room
    #[serde(rename = "getRouterRtpCapabilities")]
    GetRouterRtpCapabilities { room_id: RoomId },
    /// Join a room's broadcast group
    JoinRoom(RoomId),
    /// Release media in a room and leave its broadcast group
    LeaveRoom(RoomId),
    /// Allocate a transport
    #[serde(rename = "createWebRtcTransport")]
    CreateWebRtcTransport { room_id: RoomId },
    /// Complete the DTLS handshake of a transport
    #[serde(rename = "connectTransport")]
    ConnectTransport {
        transport_id: TransportId,
        #[serde(alias = "remoteParameters")]
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        ice_parameters: Option<IceParameters>,
    },
    /// Publish a stream
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        #[serde(alias = "params")]
        rtp_parameters: RtpParameters,
    },
    /// Subscribe to a producer
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        #[serde(alias = "capabilities")]
        rtp_capabilities: RtpCapabilities,
    },
    /// Unpause a consumer
    ResumeConsumer { consumer_id: ConsumerId },
    /// Stop publishing
    CloseProducer { producer_id: ProducerId },

    /// Chat message, relayed verbatim
    SendMessage(Value),
    /// Reaction added, relayed verbatim
    AddReaction(Value),
    /// Reaction removed, relayed verbatim
    RemoveReaction(Value),
}

impl ClientEvent {
    /// Wire name, for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SetIdentity(_) => "set-identity",
            Self::CallUser { .. } => "call-user",
            Self::CallAnswer { .. } => "call-answer",
            Self::CallFailed { .. } => "call-failed",
            Self::EndCall { .. } => "end-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            Self::JoinRoom(_) => "join-room",
            Self::LeaveRoom(_) => "leave-room",
            Self::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::CloseProducer { .. } => "close-producer",
            Self::SendMessage(_) => "send-message",
            Self::AddReaction(_) => "add-reaction",
            Self::RemoveReaction(_) => "remove-reaction",
        }
    }
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Pong response
    Pong,
    /// Answer to a request carrying an `ack` id
    Ack(AckPayload),
    /// Username accepted for this connection
    IdentityConfirmed { username: String },
    /// Someone came online
    PeerJoined { username: String, message: String },
    /// Someone went offline
    PeerLeft { username: String, message: String },

    /// Someone is ringing you
    IncomingCall {
        from: String,
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<Value>,
    },
    /// Your call was answered
    CallAccepted {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<Value>,
    },
    /// Call could not be set up
    CallFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        message: String,
    },
    /// The other party hung up or went away
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// Relayed ICE candidate
    IceCandidate { from: String, candidate: Value },

    /// A room member started publishing
    NewProducer {
        room_id: RoomId,
        producer_id: ProducerId,
        kind: MediaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    /// A room member stopped publishing
    ProducerClosed {
        room_id: RoomId,
        producer_id: ProducerId,
    },

    /// Relayed chat message
    Message(Value),
    /// Relayed reaction
    MessageReaction(Value),
    /// Relayed reaction removal
    MessageReactionRemoved(Value),

    /// Error
    Error { code: String, message: String },
}

/// Body of an `ack` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Failure of one client event, reported back to that client only.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
}

impl EventError {
    /// Stable machine-readable code for the wire.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Presence(e) => e.code(),
            Self::Call(e) => e.code(),
            Self::Voice(e) => e.code(),
        }
    }

    /// Whether the client was already told through a domain event.
    const fn is_notified(&self) -> bool {
        match self {
            Self::Call(e) => e.is_notified(),
            _ => false,
        }
    }
}

/// WebSocket upgrade handler.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to the WebSocket
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.ws_event_buffer);
    let mut session = Session::new(tx.clone());
    let conn_id = session.conn_id;
    state.hub.register(conn_id, tx);

    info!(conn_id = %conn_id, "WebSocket connected");

    // Spawn task to forward events and keepalive pings to the WebSocket
    let ping_interval = state.config.ping_interval();
    let sender_handle: tokio::task::JoinHandle<()> = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let msg = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(conn_id = %conn_id, error = %e, "Failed to serialize event");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Handle incoming messages
    let idle_timeout = state.config.idle_timeout();
    loop {
        let msg = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                info!(conn_id = %conn_id, "WebSocket idle timeout");
                break;
            }
        };

        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(text.as_str(), &mut session, &state).await;
            }
            Ok(Message::Close(_)) => {
                info!(conn_id = %conn_id, "WebSocket closed");
                break;
            }
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    handle_disconnect(&session, &state).await;
    sender_handle.abort();

    info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Parse and dispatch one text frame. Failures are answered on the same
/// connection and never end it.
pub async fn handle_client_message(text: &str, session: &mut Session, state: &AppState) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            reply(session, None, Err(EventError::InvalidPayload(e.to_string()))).await;
            return;
        }
    };
    let ack = raw.get("ack").and_then(Value::as_u64);

    let event: ClientEvent = match serde_json::from_value(raw) {
        Ok(event) => event,
        Err(e) => {
            reply(session, ack, Err(EventError::InvalidPayload(e.to_string()))).await;
            return;
        }
    };

    debug!(conn_id = %session.conn_id, event = event.name(), ack = ?ack, "Client event");

    let result = dispatch(event, session, state).await;
    reply(session, ack, result).await;
}

async fn dispatch(
    event: ClientEvent,
    session: &mut Session,
    state: &AppState,
) -> Result<Value, EventError> {
    match event {
        ClientEvent::Ping => {
            session.send(ServerEvent::Pong).await;
            Ok(Value::Null)
        }
        ClientEvent::SetIdentity(username) => {
            presence::handle_set_identity(&state.presence, &state.hub, session, &username).await?;
            Ok(json!({ "username": session.identity() }))
        }
        event @ (ClientEvent::CallUser { .. }
        | ClientEvent::CallAnswer { .. }
        | ClientEvent::CallFailed { .. }
        | ClientEvent::EndCall { .. }
        | ClientEvent::IceCandidate { .. }) => Ok(handle_call_event(state, session, event).await?),
        event @ (ClientEvent::SendMessage(_)
        | ClientEvent::AddReaction(_)
        | ClientEvent::RemoveReaction(_)) => {
            let delivered = chat::relay(&state.hub, session.conn_id, event).await;
            Ok(json!({ "delivered": delivered }))
        }
        event => Ok(handle_voice_event(&state.sfu, session, event).await?),
    }
}

async fn reply(session: &Session, ack: Option<u64>, result: Result<Value, EventError>) {
    if let Err(e) = &result {
        warn!(conn_id = %session.conn_id, code = e.code(), error = %e, "Client event failed");
    }

    match (ack, result) {
        (Some(id), Ok(data)) => {
            session
                .send(ServerEvent::Ack(AckPayload {
                    id,
                    data: (!data.is_null()).then_some(data),
                    error: None,
                    code: None,
                }))
                .await;
        }
        (Some(id), Err(e)) => {
            session
                .send(ServerEvent::Ack(AckPayload {
                    id,
                    data: None,
                    error: Some(e.to_string()),
                    code: Some(e.code().to_string()),
                }))
                .await;
        }
        (None, Err(e)) if !e.is_notified() => {
            session
                .send(ServerEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
        }
        (None, _) => {}
    }
}

/// Tear down everything a closed connection held.
///
/// Order: media, calls (only while this connection still owns its identity),
/// presence, hub. Each step stands on its own.
pub async fn handle_disconnect(session: &Session, state: &AppState) {
    let conn_id = session.conn_id;

    let teardown = state.sfu.close_connection(conn_id).await;
    debug!(conn_id = %conn_id, transports = teardown.transports, "Media released on disconnect");

    if let Some(identity) = session.identity() {
        if state.presence.lookup(identity).await == Some(conn_id) {
            let closed = state.broker.handle_disconnect(identity).await;
            for call in closed.iter().filter(|c| c.previous == CallPhase::Accepted) {
                release_call_media(state, &call.session).await;
            }
        } else {
            debug!(conn_id = %conn_id, identity = %identity, "Stale connection, calls left to the current owner");
        }
    }

    presence::handle_disconnect(&state.presence, &state.hub, session).await;

    state.hub.unregister(conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_username_alias() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"set-username","data":"alice"}"#).unwrap();
        assert!(matches!(event, ClientEvent::SetIdentity(name) if name == "alice"));

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"set-identity","data":"bob"}"#).unwrap();
        assert!(matches!(event, ClientEvent::SetIdentity(name) if name == "bob"));
    }

    #[test]
    fn test_call_accepted_alias_and_camel_case_fields() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"call-accepted","data":{"from":"bob","to":"alice","signal":{"sdp":"x"}}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::CallAnswer { to, signal: Some(_), .. } if to == "alice"));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"call-user","data":{"to":"bob","roomId":"r1"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::CallUser { room_id: Some(r), .. } if r == "r1"));
    }

    #[test]
    fn test_media_verbs_keep_their_names() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"getRouterRtpCapabilities","data":{"roomId":"r1"}}"#,
        )
        .unwrap();
        assert_eq!(event.name(), "getRouterRtpCapabilities");

        let transport_id = Uuid::new_v4();
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "connectTransport",
            "data": {
                "transportId": transport_id,
                "remoteParameters": {"fingerprints": [{"algorithm": "sha-256", "value": "AA"}]}
            }
        }))
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::ConnectTransport { transport_id: t, ice_parameters: None, .. } if t == transport_id
        ));

        let event: ClientEvent = serde_json::from_value(json!({
            "event": "connectTransport",
            "data": {
                "transportId": transport_id,
                "dtlsParameters": {"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AA"}]},
                "iceParameters": {"usernameFragment": "uf", "password": "pw"}
            }
        }))
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::ConnectTransport { ice_parameters: Some(ice), .. } if ice.username_fragment == "uf" && !ice.ice_lite
        ));

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ping));
    }

    #[test]
    fn test_server_event_frames() {
        let frame = serde_json::to_value(ServerEvent::PeerJoined {
            username: "alice".into(),
            message: "alice has joined the chat".into(),
        })
        .unwrap();
        assert_eq!(frame["event"], "peer-joined");
        assert_eq!(frame["data"]["username"], "alice");

        let frame = serde_json::to_value(ServerEvent::IncomingCall {
            from: "alice".into(),
            room_id: "r1".into(),
            signal: None,
        })
        .unwrap();
        assert_eq!(frame, json!({"event": "incoming-call", "data": {"from": "alice", "roomId": "r1"}}));

        let frame = serde_json::to_value(ServerEvent::Ack(AckPayload {
            id: 7,
            data: None,
            error: Some("transport not found".into()),
            code: Some("transport_not_found".into()),
        }))
        .unwrap();
        assert_eq!(frame["event"], "ack");
        assert_eq!(frame["data"]["id"], 7);
        assert!(frame["data"].get("data").is_none());

        let frame = serde_json::to_value(ServerEvent::CallEnded { from: None }).unwrap();
        assert_eq!(frame, json!({"event": "call-ended", "data": {}}));
    }

    #[test]
    fn test_event_error_codes() {
        assert_eq!(EventError::InvalidPayload("x".into()).code(), "invalid_payload");
        assert_eq!(EventError::from(CallError::IdentityRequired).code(), "identity_required");
        assert!(EventError::from(CallError::Busy("bob".into())).is_notified());
        assert!(!EventError::from(VoiceError::ConnectionClosed).is_notified());
    }
}
