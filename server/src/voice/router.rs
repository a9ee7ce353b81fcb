//! Media Router
//!
//! Per-room routing domain. Holds the fixed audio codec profile and decides
//! whether a subscriber can receive a given producer.

use std::collections::BTreeMap;

use serde_json::json;

use super::error::VoiceError;
use super::rtp::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters,
};

/// Opus mime type served by every router.
pub const OPUS_MIME_TYPE: &str = "audio/opus";
/// Opus clock rate.
pub const OPUS_CLOCK_RATE: u32 = 48000;
/// Opus channel count.
pub const OPUS_CHANNELS: u8 = 2;
/// Payload type the router prefers for Opus.
pub const OPUS_PAYLOAD_TYPE: u8 = 100;

/// Routing domain for one room.
#[derive(Debug, Clone)]
pub struct MediaRouter {
    capabilities: RtpCapabilities,
}

impl MediaRouter {
    /// Create a router with the fixed audio-only Opus profile.
    #[must_use]
    pub fn new() -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("minptime".to_string(), json!(10));
        parameters.insert("useinbandfec".to_string(), json!(1));

        let opus = RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: OPUS_MIME_TYPE.to_string(),
            preferred_payload_type: Some(OPUS_PAYLOAD_TYPE),
            clock_rate: OPUS_CLOCK_RATE,
            channels: Some(OPUS_CHANNELS),
            parameters,
            rtcp_feedback: vec![RtcpFeedback {
                typ: "transport-cc".to_string(),
                parameter: String::new(),
            }],
        };

        Self {
            capabilities: RtpCapabilities {
                codecs: vec![opus],
                header_extensions: vec![],
            },
        }
    }

    /// Router capabilities handed to clients before they build transports.
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    /// Reject publish attempts outside the router's profile.
    pub fn validate_producer(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<(), VoiceError> {
        if kind != MediaKind::Audio {
            return Err(VoiceError::UnsupportedMedia(format!(
                "{kind} is not routed, audio only"
            )));
        }

        let codec = rtp_parameters
            .codecs
            .first()
            .ok_or_else(|| VoiceError::UnsupportedMedia("no codec in rtpParameters".into()))?;

        let supported = self
            .capabilities
            .codecs
            .iter()
            .any(|c| c.kind == kind && c.matches(&codec.mime_type, codec.clock_rate, codec.channels));

        if supported {
            Ok(())
        } else {
            Err(VoiceError::UnsupportedMedia(format!(
                "{}/{} is not in the router profile",
                codec.mime_type, codec.clock_rate
            )))
        }
    }

    /// Find the receiver codec able to decode `producer`, if any.
    fn matching_receiver_codec<'a>(
        &self,
        kind: MediaKind,
        producer: &RtpParameters,
        receiver: &'a RtpCapabilities,
    ) -> Option<&'a RtpCodecCapability> {
        let source = producer.codecs.first()?;

        // Must also be a codec this router forwards.
        let routed = self
            .capabilities
            .codecs
            .iter()
            .any(|c| c.matches(&source.mime_type, source.clock_rate, source.channels));
        if !routed {
            return None;
        }

        receiver.codecs.iter().find(|c| {
            c.kind == kind && c.matches(&source.mime_type, source.clock_rate, source.channels)
        })
    }

    /// Build the RTP parameters a consumer sends to its subscriber.
    ///
    /// Uses the receiver's preferred payload type and a fresh SSRC; the
    /// `mid` is assigned by the caller per receive transport.
    pub fn consumer_parameters(
        &self,
        kind: MediaKind,
        producer: &RtpParameters,
        receiver: &RtpCapabilities,
        mid: String,
    ) -> Option<RtpParameters> {
        let source = producer.codecs.first()?;
        let codec = self.matching_receiver_codec(kind, producer, receiver)?;

        Some(RtpParameters {
            mid: Some(mid),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(source.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: source.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::random::<u32>()),
                dtx: None,
            }],
            rtcp: RtcpParameters {
                cname: producer.rtcp.cname.clone(),
                reduced_size: true,
            },
        })
    }
}

impl Default for MediaRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_parameters(channels: Option<u8>) -> RtpParameters {
        RtpParameters {
            mid: Some("0".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".into(),
                payload_type: 111,
                clock_rate: 48000,
                channels,
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![],
            }],
            rtcp: RtcpParameters {
                cname: Some("alice-cname".into()),
                reduced_size: true,
            },
            ..Default::default()
        }
    }

    fn receiver_caps(mime_type: &str, payload_type: u8) -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: mime_type.into(),
                preferred_payload_type: Some(payload_type),
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
        }
    }

    #[test]
    fn test_router_profile_is_single_opus_codec() {
        let router = MediaRouter::new();
        let caps = router.rtp_capabilities();

        assert_eq!(caps.codecs.len(), 1);
        assert_eq!(caps.codecs[0].mime_type, OPUS_MIME_TYPE);
        assert_eq!(caps.codecs[0].clock_rate, 48000);
        assert_eq!(caps.codecs[0].channels, Some(2));
    }

    #[test]
    fn test_validate_producer_rejects_video_and_foreign_codecs() {
        let router = MediaRouter::new();

        assert!(router
            .validate_producer(MediaKind::Audio, &opus_parameters(Some(2)))
            .is_ok());
        assert!(matches!(
            router.validate_producer(MediaKind::Video, &opus_parameters(Some(2))),
            Err(VoiceError::UnsupportedMedia(_))
        ));

        let mut pcmu = opus_parameters(None);
        pcmu.codecs[0].mime_type = "audio/PCMU".into();
        pcmu.codecs[0].clock_rate = 8000;
        assert!(router.validate_producer(MediaKind::Audio, &pcmu).is_err());

        let empty = RtpParameters::default();
        assert!(router.validate_producer(MediaKind::Audio, &empty).is_err());
    }

    #[test]
    fn test_consume_requires_matching_receiver_codec() {
        let router = MediaRouter::new();
        let producer = opus_parameters(Some(2));
        let consumable = |caps: &RtpCapabilities| {
            router
                .consumer_parameters(MediaKind::Audio, &producer, caps, "0".into())
                .is_some()
        };

        assert!(consumable(&receiver_caps("audio/opus", 109)));
        assert!(!consumable(&receiver_caps("audio/G722", 9)));
        assert!(!consumable(&RtpCapabilities::default()));
    }

    #[test]
    fn test_consumer_parameters_use_receiver_payload_type() {
        let router = MediaRouter::new();
        let producer = opus_parameters(Some(2));

        let params = router
            .consumer_parameters(
                MediaKind::Audio,
                &producer,
                &receiver_caps("audio/opus", 109),
                "3".into(),
            )
            .expect("Should be consumable");

        assert_eq!(params.mid.as_deref(), Some("3"));
        assert_eq!(params.codecs[0].payload_type, 109);
        assert_eq!(params.encodings.len(), 1);
        assert!(params.encodings[0].ssrc.is_some());
        assert_eq!(params.rtcp.cname.as_deref(), Some("alice-cname"));
    }
}
