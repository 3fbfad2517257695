//! Media Engine
//!
//! Builds the process-wide WebRTC API with the relay's fixed codec
//! catalogue. The catalogue is registered once at startup; rooms record the
//! subset each producer actually negotiates and viewers are offered exactly
//! that subset.

pub mod error;
pub mod session;

use tokio::net::UdpSocket;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::config::Config;
use error::SessionError;

pub use session::{CandidateBuffer, MediaSession, SessionEvent};

/// The video codec catalogue: mime type, fmtp, payload type. Several H.264
/// profile levels plus H.265, AV1 and both common VP9 profiles, with stable
/// payload type numbers across the mesh.
const VIDEO_CODECS: &[(&str, &str, u8)] = &[
    (
        "video/H264",
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
        102,
    ),
    (
        "video/H264",
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        125,
    ),
    (
        "video/H264",
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f",
        108,
    ),
    (
        "video/H264",
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=64001f",
        123,
    ),
    ("video/H265", "", 116),
    ("video/AV1", "", 45),
    ("video/VP9", "profile-id=0", 98),
    ("video/VP9", "profile-id=2", 100),
];

/// Process-wide media engine state. Fixed at startup, shared by every
/// session.
pub struct MediaStack {
    api: API,
}

impl MediaStack {
    /// The WebRTC API handle.
    #[must_use]
    pub const fn api(&self) -> &API {
        &self.api
    }

    /// Peer connection configuration. The relay serves from its own
    /// addresses (host candidates, optionally NAT-mapped), so no ICE servers
    /// are configured.
    #[must_use]
    pub fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration::default()
    }
}

/// Feedback set enabled on every video codec.
fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ]
}

/// The audio capability every room negotiates.
#[must_use]
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Fallback video capability for rooms whose producer has not delivered a
/// video track yet.
#[must_use]
pub fn default_video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: video_rtcp_feedback(),
    }
}

/// Build the media stack: codec catalogue, default interceptors (NACK
/// generator/responder, RTCP reports), and the UDP strategy from the CLI
/// flags (single-port mux, restricted ephemeral range, 1:1 NAT mapping).
pub async fn build(config: &Config) -> Result<MediaStack, SessionError> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| SessionError::WebRtc(e.to_string()))?;

    for (mime, fmtp, payload_type) in VIDEO_CODECS {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: (*mime).to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: (*fmtp).to_string(),
                        rtcp_feedback: video_rtcp_feedback(),
                    },
                    payload_type: *payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| SessionError::WebRtc(e.to_string()))?;
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| SessionError::WebRtc(e.to_string()))?;

    let mut setting_engine = SettingEngine::default();

    if config.udp_mux_port != 0 {
        let socket = UdpSocket::bind(("0.0.0.0", config.udp_mux_port))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        setting_engine
            .set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
                socket,
            ))));
        info!(port = config.udp_mux_port, "Media UDP mux enabled");
    } else if config.webrtc_udp_start != 0 && config.webrtc_udp_end != 0 {
        let ephemeral = EphemeralUDP::new(config.webrtc_udp_start, config.webrtc_udp_end)
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        info!(
            start = config.webrtc_udp_start,
            end = config.webrtc_udp_end,
            "Media UDP port range restricted"
        );
    }

    if let Some(ip) = &config.nat_1to1_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        info!(ip = %ip, "Advertising 1:1 NAT address in ICE candidates");
    }

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    info!("Media engine initialized");
    Ok(MediaStack { api })
}
