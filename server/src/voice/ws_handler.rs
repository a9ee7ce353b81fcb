//! Voice WebSocket Message Handlers
//!
//! Media control verbs. Each returns the data carried by the ack.

use serde_json::{json, Value};
use tracing::{debug, info};

use super::error::VoiceError;
use super::sfu::SfuServer;
use crate::ws::{ClientEvent, Session};

/// Handle a media-control client event.
pub async fn handle_voice_event(
    sfu: &SfuServer,
    session: &Session,
    event: ClientEvent,
) -> Result<Value, VoiceError> {
    match event {
        ClientEvent::GetRouterRtpCapabilities { room_id } => {
            require_room_id(&room_id)?;
            let capabilities = sfu.rtp_capabilities(&room_id).await;
            Ok(serde_json::to_value(capabilities)?)
        }
        ClientEvent::JoinRoom(room_id) => handle_join(sfu, session, &room_id).await,
        ClientEvent::LeaveRoom(room_id) => handle_leave(sfu, session, &room_id).await,
        ClientEvent::CreateWebRtcTransport { room_id } => {
            require_room_id(&room_id)?;
            let options = sfu.create_transport(session, &room_id).await?;
            Ok(serde_json::to_value(options)?)
        }
        ClientEvent::ConnectTransport {
            transport_id,
            dtls_parameters,
            ice_parameters,
        } => {
            sfu.connect_transport(
                session.conn_id,
                transport_id,
                &dtls_parameters,
                ice_parameters.as_ref(),
            )
            .await?;
            Ok(json!({ "connected": true }))
        }
        ClientEvent::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let id = sfu
                .produce(session.conn_id, transport_id, kind, rtp_parameters)
                .await?;
            Ok(json!({ "id": id }))
        }
        ClientEvent::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let consumer = sfu
                .consume(session.conn_id, transport_id, producer_id, &rtp_capabilities)
                .await?;
            Ok(serde_json::to_value(consumer)?)
        }
        ClientEvent::ResumeConsumer { consumer_id } => {
            sfu.resume_consumer(session.conn_id, consumer_id).await?;
            Ok(json!({ "resumed": true }))
        }
        ClientEvent::CloseProducer { producer_id } => {
            sfu.close_producer(session.conn_id, producer_id).await?;
            Ok(json!({ "closed": true }))
        }
        other => Err(VoiceError::Signaling(format!(
            "{} is not a media event",
            other.name()
        ))),
    }
}

fn require_room_id(room_id: &str) -> Result<(), VoiceError> {
    if room_id.is_empty() {
        return Err(VoiceError::Signaling("roomId must not be empty".into()));
    }
    Ok(())
}

async fn handle_join(sfu: &SfuServer, session: &Session, room_id: &str) -> Result<Value, VoiceError> {
    require_room_id(room_id)?;
    let room = sfu.join_room(session, room_id).await?;
    let members = room.member_count().await;
    debug!(room_id = %room_id, conn_id = %session.conn_id, members, "Room join handled");
    Ok(json!({ "roomId": room_id, "members": members }))
}

async fn handle_leave(sfu: &SfuServer, session: &Session, room_id: &str) -> Result<Value, VoiceError> {
    let teardown = sfu.leave_room(session.conn_id, room_id).await;
    info!(
        room_id = %room_id,
        conn_id = %session.conn_id,
        producers = teardown.producers,
        transports = teardown.transports,
        "User left media room"
    );
    Ok(json!({ "roomId": room_id }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::voice::engine::InMemoryMediaEngine;

    fn sfu() -> SfuServer {
        SfuServer::new(Arc::new(InMemoryMediaEngine::new("127.0.0.1", 40000, 40010)), 25)
    }

    #[tokio::test]
    async fn test_capabilities_and_transport_acks() {
        let sfu = sfu();
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(tx);

        let caps = handle_voice_event(
            &sfu,
            &session,
            ClientEvent::GetRouterRtpCapabilities {
                room_id: "r1".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(caps["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(caps["codecs"][0]["clockRate"], 48000);

        let transport = handle_voice_event(
            &sfu,
            &session,
            ClientEvent::CreateWebRtcTransport {
                room_id: "r1".into(),
            },
        )
        .await
        .unwrap();
        assert!(transport["iceParameters"]["usernameFragment"].is_string());
        assert_eq!(transport["dtlsParameters"]["fingerprints"][0]["algorithm"], "sha-256");
    }

    #[tokio::test]
    async fn test_resume_unknown_consumer_is_not_found() {
        let sfu = sfu();
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(tx);

        let err = handle_voice_event(
            &sfu,
            &session,
            ClientEvent::ResumeConsumer {
                consumer_id: uuid::Uuid::new_v4(),
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "not found");
        assert_eq!(err.code(), "consumer_not_found");
    }

    #[tokio::test]
    async fn test_empty_room_id_rejected_everywhere() {
        let sfu = sfu();
        let (tx, _rx) = mpsc::channel(8);
        let session = Session::new(tx);

        for event in [
            ClientEvent::JoinRoom(String::new()),
            ClientEvent::GetRouterRtpCapabilities {
                room_id: String::new(),
            },
            ClientEvent::CreateWebRtcTransport {
                room_id: String::new(),
            },
        ] {
            let err = handle_voice_event(&sfu, &session, event).await.unwrap_err();
            assert_eq!(err.code(), "invalid_payload");
        }

        assert_eq!(sfu.room_count().await, 0);
    }
}
