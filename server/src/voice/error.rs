//! Voice Service Errors

use thiserror::Error;

use super::{ConsumerId, ProducerId, TransportId};

/// Errors that can occur during media control operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Transport id unknown or owned by another connection.
    #[error("transport not found")]
    TransportNotFound(TransportId),

    /// Producer id unknown or owned by another connection.
    #[error("producer not found")]
    ProducerNotFound(ProducerId),

    /// Consumer id unknown or owned by another connection.
    #[error("not found")]
    ConsumerNotFound(ConsumerId),

    /// Receiver cannot consume the requested producer.
    #[error("cannot consume")]
    CannotConsume {
        /// Producer the subscriber asked for.
        producer_id: ProducerId,
    },

    /// Media kind or codec outside the router's profile.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// Room broadcast group is full.
    #[error("room is full (max: {max_participants})")]
    RoomFull {
        /// Maximum allowed participants.
        max_participants: usize,
    },

    /// Owning connection went away while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Media engine refused or failed an allocation.
    #[error("media engine error: {0}")]
    Engine(String),

    /// Malformed signaling payload.
    #[error("invalid payload: {0}")]
    Signaling(String),
}

impl VoiceError {
    /// Stable machine-readable code for the wire.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TransportNotFound(_) => "transport_not_found",
            Self::ProducerNotFound(_) => "producer_not_found",
            Self::ConsumerNotFound(_) => "consumer_not_found",
            Self::CannotConsume { .. } => "cannot_consume",
            Self::UnsupportedMedia(_) => "unsupported_media",
            Self::RoomFull { .. } => "room_full",
            Self::ConnectionClosed => "connection_closed",
            Self::Engine(_) => "engine_error",
            Self::Signaling(_) => "invalid_payload",
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Signaling(err.to_string())
    }
}

impl From<webrtc::Error> for VoiceError {
    fn from(err: webrtc::Error) -> Self {
        Self::Engine(err.to_string())
    }
}
