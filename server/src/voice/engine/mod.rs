//! Media Engine
//!
//! Boundary between the SFU control plane and whatever moves packets.
//! Every call here is a request/response round trip and may suspend.

mod memory;
mod webrtc_engine;

pub use memory::InMemoryMediaEngine;
pub use webrtc_engine::WebRtcMediaEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::VoiceError;
use super::rtp::{MediaKind, RtpParameters};
use super::{ConsumerId, ProducerId, TransportId};

/// Fingerprint hash functions accepted from remote peers.
const FINGERPRINT_ALGORITHMS: [&str; 5] = ["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

/// ICE credentials of one side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Local ICE candidate of a server-side transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub typ: String,
}

/// DTLS role negotiated for a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    fn is_well_formed(&self) -> bool {
        FINGERPRINT_ALGORITHMS.contains(&self.algorithm.to_ascii_lowercase().as_str())
            && !self.value.is_empty()
            && self
                .value
                .split(':')
                .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

/// DTLS handshake material of one side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsParameters {
    /// Reject remote parameters no DTLS stack could verify against.
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.fingerprints.is_empty() {
            return Err(VoiceError::Signaling(
                "dtlsParameters.fingerprints must not be empty".into(),
            ));
        }
        if let Some(bad) = self.fingerprints.iter().find(|f| !f.is_well_formed()) {
            return Err(VoiceError::Signaling(format!(
                "unsupported fingerprint {}",
                bad.algorithm
            )));
        }
        Ok(())
    }
}

/// Everything a client needs to connect to a new transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Allocation backend for transports, producers and consumers.
///
/// Close operations are idempotent: closing an unknown id is a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocate a transport for `room_id`.
    async fn create_transport(&self, room_id: &str) -> Result<TransportOptions, VoiceError>;

    /// Hand the remote side's DTLS parameters, and its ICE credentials when
    /// the client sent them, to a transport.
    async fn connect_transport(
        &self,
        transport_id: TransportId,
        remote: &DtlsParameters,
        remote_ice: Option<&IceParameters>,
    ) -> Result<(), VoiceError>;

    /// Start receiving a published stream on a transport.
    async fn create_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, VoiceError>;

    /// Start forwarding `producer_id` over a transport. Consumers start paused.
    async fn create_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_parameters: &RtpParameters,
    ) -> Result<ConsumerId, VoiceError>;

    /// Unpause a consumer.
    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), VoiceError>;

    /// Release a transport.
    async fn close_transport(&self, transport_id: TransportId);

    /// Release a producer.
    async fn close_producer(&self, producer_id: ProducerId);

    /// Release a consumer.
    async fn close_consumer(&self, consumer_id: ConsumerId);
}
