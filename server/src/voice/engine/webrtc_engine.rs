//! WebRTC-backed media engine.
//!
//! Each transport is an ICE-lite gatherer bound to a UDP port in the configured
//! range, an ICE transport in the controlled role and a DTLS transport holding
//! a freshly generated certificate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::dtls_transport::dtls_fingerprint::RTCDtlsFingerprint;
use webrtc::dtls_transport::dtls_parameters::DTLSParameters;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::dtls_transport::RTCDtlsTransport;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer::{RTCIceGatherOptions, RTCIceGatherer};
use webrtc::ice_transport::ice_parameters::RTCIceParameters;
use webrtc::ice_transport::ice_role::RTCIceRole;
use webrtc::ice_transport::RTCIceTransport;

use super::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaEngine,
    TransportOptions,
};
use crate::config::Config;
use crate::voice::error::VoiceError;
use crate::voice::rtp::{MediaKind, RtpParameters};
use crate::voice::{ConsumerId, ProducerId, TransportId};

/// Upper bound on local candidate gathering per transport.
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

struct RtcTransport {
    gatherer: Arc<RTCIceGatherer>,
    ice: Arc<RTCIceTransport>,
    dtls: Arc<RTCDtlsTransport>,
    connected: bool,
    handshake: Option<JoinHandle<()>>,
}

/// Media engine that allocates real ICE/DTLS transports.
pub struct WebRtcMediaEngine {
    api: API,
    transports: DashMap<TransportId, RtcTransport>,
    producers: DashMap<ProducerId, TransportId>,
    consumers: DashMap<ConsumerId, bool>,
}

impl WebRtcMediaEngine {
    /// Build the engine from server configuration.
    ///
    /// # Errors
    /// Returns [`VoiceError::Engine`] if the UDP port range is invalid.
    pub fn from_config(config: &Config) -> Result<Self, VoiceError> {
        let ephemeral = EphemeralUDP::new(config.rtc_min_port, config.rtc_max_port)
            .map_err(|e| VoiceError::Engine(format!("invalid UDP port range: {e}")))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        setting_engine.set_network_types(vec![NetworkType::Udp4]);
        setting_engine.set_lite(true);
        setting_engine.set_nat_1to1_ips(
            vec![config.rtc_announced_ip.clone()],
            RTCIceCandidateType::Host,
        );

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();

        info!(
            announced_ip = %config.rtc_announced_ip,
            min_port = config.rtc_min_port,
            max_port = config.rtc_max_port,
            "WebRTC media engine initialized"
        );

        Ok(Self {
            api,
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        })
    }

    /// Number of live transports.
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    async fn gather(gatherer: &Arc<RTCIceGatherer>) -> Result<Vec<RTCIceCandidate>, VoiceError> {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut done_tx = Some(done_tx);
        gatherer.on_local_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if candidate.is_none() {
                done_tx.take();
            }
            Box::pin(async {})
        }));

        gatherer.gather().await?;

        if tokio::time::timeout(GATHER_TIMEOUT, done_rx.recv())
            .await
            .is_err()
        {
            warn!("ICE gathering did not complete in time, using partial candidates");
        }

        Ok(gatherer.get_local_candidates().await?)
    }

    async fn teardown(transport: RtcTransport) {
        if let Some(handshake) = transport.handshake {
            handshake.abort();
        }
        if let Err(e) = transport.dtls.stop().await {
            debug!(error = %e, "DTLS transport stop failed");
        }
        if let Err(e) = transport.ice.stop().await {
            debug!(error = %e, "ICE transport stop failed");
        }
        if let Err(e) = transport.gatherer.close().await {
            debug!(error = %e, "ICE gatherer close failed");
        }
    }
}

fn local_candidate(candidate: &RTCIceCandidate) -> IceCandidate {
    IceCandidate {
        foundation: candidate.foundation.clone(),
        priority: candidate.priority,
        ip: candidate.address.clone(),
        port: candidate.port,
        protocol: candidate.protocol.to_string(),
        typ: candidate.typ.to_string(),
    }
}

const fn local_role(role: DTLSRole) -> DtlsRole {
    match role {
        DTLSRole::Client => DtlsRole::Client,
        DTLSRole::Server => DtlsRole::Server,
        DTLSRole::Auto | DTLSRole::Unspecified => DtlsRole::Auto,
    }
}

const fn remote_role(role: DtlsRole) -> DTLSRole {
    match role {
        DtlsRole::Auto => DTLSRole::Auto,
        DtlsRole::Client => DTLSRole::Client,
        DtlsRole::Server => DTLSRole::Server,
    }
}

fn remote_dtls(remote: &DtlsParameters) -> DTLSParameters {
    DTLSParameters {
        role: remote_role(remote.role),
        fingerprints: remote
            .fingerprints
            .iter()
            .map(|f| RTCDtlsFingerprint {
                algorithm: f.algorithm.to_ascii_lowercase(),
                value: f.value.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create_transport(&self, room_id: &str) -> Result<TransportOptions, VoiceError> {
        let gatherer = Arc::new(self.api.new_ice_gatherer(RTCIceGatherOptions::default())?);
        let ice = Arc::new(self.api.new_ice_transport(Arc::clone(&gatherer)));
        let dtls = Arc::new(self.api.new_dtls_transport(Arc::clone(&ice), vec![])?);

        let candidates = match Self::gather(&gatherer).await {
            Ok(candidates) => candidates,
            Err(e) => {
                let _ = gatherer.close().await;
                return Err(e);
            }
        };
        let ice_local = gatherer.get_local_parameters().await?;
        let dtls_local = dtls.get_local_parameters()?;

        let id = Uuid::new_v4();
        let options = TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: ice_local.username_fragment,
                password: ice_local.password,
                ice_lite: true,
            },
            ice_candidates: candidates.iter().map(local_candidate).collect(),
            dtls_parameters: DtlsParameters {
                role: local_role(dtls_local.role),
                fingerprints: dtls_local
                    .fingerprints
                    .into_iter()
                    .map(|f| DtlsFingerprint {
                        algorithm: f.algorithm,
                        value: f.value,
                    })
                    .collect(),
            },
        };

        self.transports.insert(
            id,
            RtcTransport {
                gatherer,
                ice,
                dtls,
                connected: false,
                handshake: None,
            },
        );

        debug!(
            room_id = %room_id,
            transport_id = %id,
            candidates = options.ice_candidates.len(),
            "Allocated WebRTC transport"
        );
        Ok(options)
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        remote: &DtlsParameters,
        remote_ice: Option<&IceParameters>,
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

        let Some(remote_ice) = remote_ice else {
            debug!(transport_id = %transport_id, "Remote ICE credentials absent, handshake deferred");
            return Ok(());
        };

        let ice = Arc::clone(&transport.ice);
        let dtls = Arc::clone(&transport.dtls);
        let ice_params = RTCIceParameters {
            username_fragment: remote_ice.username_fragment.clone(),
            password: remote_ice.password.clone(),
            ice_lite: remote_ice.ice_lite,
        };
        let dtls_params = remote_dtls(remote);

        transport.handshake = Some(tokio::spawn(async move {
            if let Err(e) = ice.start(&ice_params, Some(RTCIceRole::Controlled)).await {
                warn!(transport_id = %transport_id, error = %e, "ICE start failed");
                return;
            }
            match dtls.start(dtls_params).await {
                Ok(()) => debug!(transport_id = %transport_id, "DTLS handshake complete"),
                Err(e) => warn!(transport_id = %transport_id, error = %e, "DTLS handshake failed"),
            }
        }));

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
        let Some((_, transport)) = self.transports.remove(&transport_id) else {
            return;
        };
        self.producers.retain(|_, owner| *owner != transport_id);
        Self::teardown(transport).await;
        debug!(transport_id = %transport_id, "WebRTC transport closed");
    }

    async fn close_producer(&self, producer_id: ProducerId) {
        self.producers.remove(&producer_id);
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) {
        self.consumers.remove(&consumer_id);
    }
}
