//! In-memory media engine.
//!
//! Tracks handles and hands out well-formed ICE/DTLS material without binding
//! sockets or holding a certificate. Used by tests and by anything that only
//! exercises the control plane; the server binary runs `WebRtcMediaEngine`.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaEngine,
    TransportOptions,
};
use crate::config::Config;
use crate::voice::error::VoiceError;
use crate::voice::rtp::{MediaKind, RtpParameters};
use crate::voice::{ConsumerId, ProducerId, TransportId};

struct MemoryTransport {
    port: u16,
    connected: bool,
}

/// Handle-tracking engine with no packet plane.
pub struct InMemoryMediaEngine {
    announced_ip: String,
    min_port: u16,
    port_span: u32,
    next_port: AtomicU32,
    transports: DashMap<TransportId, MemoryTransport>,
    producers: DashMap<ProducerId, TransportId>,
    consumers: DashMap<ConsumerId, bool>,
}

impl InMemoryMediaEngine {
    /// Create an engine advertising `announced_ip` and ports in `[min_port, max_port]`.
    #[must_use]
    pub fn new(announced_ip: impl Into<String>, min_port: u16, max_port: u16) -> Self {
        let (min_port, max_port) = if min_port <= max_port {
            (min_port, max_port)
        } else {
            (max_port, min_port)
        };

        Self {
            announced_ip: announced_ip.into(),
            min_port,
            port_span: u32::from(max_port - min_port) + 1,
            next_port: AtomicU32::new(0),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        }
    }

    /// Create an engine from server configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rtc_announced_ip.clone(),
            config.rtc_min_port,
            config.rtc_max_port,
        )
    }

    fn allocate_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % self.port_span;
        self.min_port + offset as u16
    }

    /// Number of live transports.
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Number of live producers.
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Stable per-transport SHA-256 value in SDP fingerprint form.
fn transport_fingerprint(id: TransportId) -> String {
    Sha256::digest(id.as_bytes())
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for InMemoryMediaEngine {
    async fn create_transport(&self, room_id: &str) -> Result<TransportOptions, VoiceError> {
        let id = Uuid::new_v4();
        let port = self.allocate_port();

        self.transports.insert(
            id,
            MemoryTransport {
                port,
                connected: false,
            },
        );

        debug!(room_id = %room_id, transport_id = %id, port, "Allocated in-memory transport");

        Ok(TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.announced_ip.clone(),
                port,
                protocol: "udp".to_string(),
                typ: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: transport_fingerprint(id),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        remote: &DtlsParameters,
        _remote_ice: Option<&IceParameters>,
    ) -> Result<(), VoiceError> {
        remote.validate()?;

        let mut transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or(VoiceError::TransportNotFound(transport_id))?;

        if transport.connected {
            return Err(VoiceError::Engine("transport already connected".into()));
        }
        transport.connected = true;

        debug!(transport_id = %transport_id, port = transport.port, "Transport connected");
        Ok(())
    }

    async fn create_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        _rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, VoiceError> {
        if !self.transports.contains_key(&transport_id) {
            return Err(VoiceError::TransportNotFound(transport_id));
        }

        let id = Uuid::new_v4();
        self.producers.insert(id, transport_id);
        debug!(transport_id = %transport_id, producer_id = %id, kind = %kind, "Producer created");
        Ok(id)
    }

    async fn create_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        _rtp_parameters: &RtpParameters,
    ) -> Result<ConsumerId, VoiceError> {
        if !self.transports.contains_key(&transport_id) {
            return Err(VoiceError::TransportNotFound(transport_id));
        }
        if !self.producers.contains_key(&producer_id) {
            return Err(VoiceError::ProducerNotFound(producer_id));
        }

        let id = Uuid::new_v4();
        self.consumers.insert(id, true);
        debug!(
            transport_id = %transport_id,
            producer_id = %producer_id,
            consumer_id = %id,
            "Consumer created (paused)"
        );
        Ok(id)
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), VoiceError> {
        let mut paused = self
            .consumers
            .get_mut(&consumer_id)
            .ok_or(VoiceError::ConsumerNotFound(consumer_id))?;
        *paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: TransportId) {
        self.transports.remove(&transport_id);
    }

    async fn close_producer(&self, producer_id: ProducerId) {
        self.producers.remove(&producer_id);
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) {
        self.consumers.remove(&consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AB:CD".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_transport_options_shape() {
        let engine = InMemoryMediaEngine::new("10.0.0.5", 40000, 40001);
        let options = engine.create_transport("r1").await.unwrap();

        assert_eq!(options.ice_parameters.username_fragment.len(), 16);
        assert_eq!(options.ice_parameters.password.len(), 32);
        assert!(options.ice_parameters.ice_lite);
        assert_eq!(options.ice_candidates[0].ip, "10.0.0.5");
        assert!(options.dtls_parameters.validate().is_ok());
        // 32 bytes -> 32 hex pairs joined by 31 colons
        assert_eq!(options.dtls_parameters.fingerprints[0].value.len(), 95);

        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("iceParameters").is_some());
        assert_eq!(json["iceCandidates"][0]["type"], "host");
    }

    #[tokio::test]
    async fn test_ports_cycle_through_range() {
        let engine = InMemoryMediaEngine::new("127.0.0.1", 40000, 40001);
        let a = engine.create_transport("r1").await.unwrap();
        let b = engine.create_transport("r1").await.unwrap();
        let c = engine.create_transport("r1").await.unwrap();

        assert_eq!(a.ice_candidates[0].port, 40000);
        assert_eq!(b.ice_candidates[0].port, 40001);
        assert_eq!(c.ice_candidates[0].port, 40000);
    }

    #[tokio::test]
    async fn test_connect_requires_fingerprint_and_happens_once() {
        let engine = InMemoryMediaEngine::new("127.0.0.1", 40000, 40010);
        let options = engine.create_transport("r1").await.unwrap();

        let empty = DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![],
        };
        assert!(matches!(
            engine.connect_transport(options.id, &empty, None).await,
            Err(VoiceError::Signaling(_))
        ));

        assert!(engine
            .connect_transport(options.id, &client_dtls(), None)
            .await
            .is_ok());
        assert!(matches!(
            engine.connect_transport(options.id, &client_dtls(), None).await,
            Err(VoiceError::Engine(_))
        ));
        assert!(matches!(
            engine
                .connect_transport(Uuid::new_v4(), &client_dtls(), None)
                .await,
            Err(VoiceError::TransportNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = InMemoryMediaEngine::new("127.0.0.1", 40000, 40010);
        let transport = engine.create_transport("r1").await.unwrap();
        let params = RtpParameters::default();
        let producer = engine
            .create_producer(transport.id, MediaKind::Audio, &params)
            .await
            .unwrap();
        let consumer = engine
            .create_consumer(transport.id, producer, &params)
            .await
            .unwrap();
        assert!(engine.resume_consumer(consumer).await.is_ok());

        engine.close_consumer(consumer).await;
        engine.close_consumer(consumer).await;
        engine.close_producer(producer).await;
        engine.close_producer(producer).await;
        engine.close_transport(transport.id).await;
        engine.close_transport(transport.id).await;

        assert_eq!(engine.transport_count(), 0);
        assert_eq!(engine.producer_count(), 0);
        assert_eq!(engine.consumer_count(), 0);
        assert!(engine.resume_consumer(consumer).await.is_err());
    }
}
