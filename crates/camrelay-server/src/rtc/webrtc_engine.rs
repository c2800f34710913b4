//! webrtc-rs backed engine
//!
//! One shared `API` builds every peer connection. Publishers receive video;
//! their inbound track is wrapped in a [`TrackRelay`] and each viewer gets a
//! fresh [`RelayView`] of it.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use camrelay_protocol::IceServer;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9, MediaEngine,
};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;

use super::track_relay::{RelayView, TrackRelay};
use super::{
    ConnectionState, InboundMedia, InboundMediaHandler, PeerConnection, RtcEngine, SdpType,
    SessionDescription, StateChangeHandler,
};

/// Engine producing real WebRTC peer connections
pub struct WebRtcEngine {
    /// WebRTC API (shared for all connections)
    api: Arc<API>,
    /// ICE servers configuration
    ice_servers: Vec<RTCIceServer>,
    /// Video codecs registered with the media engine
    video_codecs: Vec<RTCRtpCodecParameters>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self> {
        // Publishers and viewers share one media engine, so anything a camera
        // negotiates can be mirrored to the viewer without transcoding
        let mut media_engine = MediaEngine::default();

        let video_codecs = video_codecs();
        for codec in &video_codecs {
            media_engine.register_codec(codec.clone(), RTPCodecType::Video)?;
        }

        // Audio is never relayed, but cameras commonly offer it
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let setting_engine = SettingEngine::default();

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            video_codecs,
        })
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    type Source = Arc<TrackRelay>;
    type View = RelayView;
    type Connection = WebRtcConnection;

    async fn create_connection(&self) -> Result<Arc<WebRtcConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);
        let connection = WebRtcConnection {
            id: Uuid::new_v4(),
            peer_connection,
            closed: AtomicBool::new(false),
        };

        tracing::debug!(connection = %connection.id, "Created peer connection");

        Ok(Arc::new(connection))
    }

    async fn subscribe(&self, source: &Arc<TrackRelay>) -> Result<RelayView> {
        // The negotiated capability can carry fmtp parameters in a different
        // order or with extras, which add_track would reject; send with the
        // registered codec it was matched against instead
        let negotiated = source.codec_capability();
        let Some(capability) = registered_capability(&self.video_codecs, &negotiated) else {
            bail!(
                "no registered codec matches {} ({})",
                negotiated.mime_type,
                negotiated.sdp_fmtp_line
            );
        };

        source.add_view(capability)
    }
}

/// A webrtc-rs peer connection
pub struct WebRtcConnection {
    id: Uuid,
    peer_connection: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    type Source = Arc<TrackRelay>;
    type View = RelayView;

    fn id(&self) -> Uuid {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        to_connection_state(self.peer_connection.connection_state())
    }

    async fn set_remote_offer(&self, offer: SessionDescription) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            bail!("expected an SDP offer, got {}", offer.sdp_type);
        }

        let offer = RTCSessionDescription::offer(offer.sdp)?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")
    }

    async fn create_local_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("failed to create answer")?;

        // Signaling is a single HTTP round trip, so candidates must be in the
        // answer itself
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(answer)
            .await
            .context("failed to set local description")?;

        let _ = gather_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("no local description after gathering")?;

        answer_from_local(local)
    }

    async fn attach_outbound_media(&self, view: RelayView) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = view.track();
        let rtp_sender = self
            .peer_connection
            .add_track(track)
            .await
            .context("failed to add relay track")?;

        // Drain RTCP so interceptors (NACK, reports) keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });

        tracing::debug!(connection = %self.id, view = %view.id(), "Attached relay view");
        Ok(())
    }

    fn on_inbound_media(&self, handler: InboundMediaHandler<Arc<TrackRelay>>) {
        let publisher = Arc::downgrade(&self.peer_connection);
        let connection_id = self.id;

        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let handler = handler.clone();
                let publisher = publisher.clone();

                Box::pin(async move {
                    if track.kind() != RTPCodecType::Video {
                        tracing::debug!(
                            connection = %connection_id,
                            kind = ?track.kind(),
                            "Ignoring non-video track"
                        );
                        return;
                    }

                    tracing::info!(connection = %connection_id, track = %track.id(), "Received publisher video track");

                    let relay = TrackRelay::spawn(track, publisher);
                    handler(InboundMedia::Started(relay.clone())).await;

                    // on_track handlers are serialized; watch for the end elsewhere
                    tokio::spawn(async move {
                        relay.closed().await;
                        handler(InboundMedia::Ended(relay.id().to_string())).await;
                    });
                })
            }));
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        let connection_id = self.id;

        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!(connection = %connection_id, state = %state, "Peer connection state changed");

                // The handler may close this very connection, which re-enters
                // webrtc-rs state handling; run it off the callback
                tokio::spawn(handler(to_connection_state(state)));
                Box::pin(async {})
            }));
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!(connection = %self.id, error = %e, "Error closing peer connection");
        }
    }
}

fn to_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn answer_from_local(local: RTCSessionDescription) -> Result<SessionDescription> {
    if local.sdp_type != RTCSdpType::Answer {
        bail!("local description is {}, not an answer", local.sdp_type);
    }
    Ok(SessionDescription::answer(local.sdp))
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    let codec = |mime_type: &str, sdp_fmtp_line: &str, payload_type: u8| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
            rtcp_feedback: video_rtcp_feedback(),
        },
        payload_type,
        ..Default::default()
    };

    vec![
        codec(MIME_TYPE_VP8, "", 96),
        codec(MIME_TYPE_VP9, "profile-id=0", 98),
        codec(
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            102,
        ),
        codec(
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f",
            127,
        ),
        codec(
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            125,
        ),
        codec(
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
            108,
        ),
    ]
}

/// Find the registered codec a negotiated capability was matched against
fn registered_capability(
    codecs: &[RTCRtpCodecParameters],
    negotiated: &RTCRtpCodecCapability,
) -> Option<RTCRtpCodecCapability> {
    let candidates: Vec<&RTCRtpCodecCapability> = codecs
        .iter()
        .map(|codec| &codec.capability)
        .filter(|capability| capability.mime_type.eq_ignore_ascii_case(&negotiated.mime_type))
        .collect();

    candidates
        .iter()
        .find(|capability| capability.sdp_fmtp_line == negotiated.sdp_fmtp_line)
        .or_else(|| {
            candidates.iter().find(|capability| {
                fmtp_compatible(
                    &negotiated.mime_type,
                    &capability.sdp_fmtp_line,
                    &negotiated.sdp_fmtp_line,
                )
            })
        })
        .map(|capability| (*capability).clone())
}

/// Same comparison the media engine makes when matching codecs: H264 by
/// packetization mode and profile (level ignored), VP9 by profile
fn fmtp_compatible(mime_type: &str, registered: &str, negotiated: &str) -> bool {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        packetization_mode(registered) == packetization_mode(negotiated)
            && h264_profile(registered) == h264_profile(negotiated)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
        fmtp_param(registered, "profile-id").unwrap_or("0")
            == fmtp_param(negotiated, "profile-id").unwrap_or("0")
    } else {
        true
    }
}

fn packetization_mode(fmtp_line: &str) -> &str {
    fmtp_param(fmtp_line, "packetization-mode").unwrap_or("0")
}

fn h264_profile(fmtp_line: &str) -> Option<String> {
    fmtp_param(fmtp_line, "profile-level-id")
        .and_then(|id| id.get(..4))
        .map(str::to_ascii_lowercase)
}

fn fmtp_param<'a>(fmtp_line: &'a str, key: &str) -> Option<&'a str> {
    fmtp_line.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.eq_ignore_ascii_case(key).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_rtc_states_map_to_terminal() {
        assert!(to_connection_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(to_connection_state(RTCPeerConnectionState::Closed).is_terminal());
        assert!(to_connection_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(!to_connection_state(RTCPeerConnectionState::Connected).is_terminal());
    }

    fn capability(mime_type: &str, sdp_fmtp_line: &str) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_reordered_h264_fmtp_maps_to_registered_codec() {
        let codecs = video_codecs();
        // Camera omits level-asymmetry-allowed and uses a higher level
        let negotiated = capability(
            "video/h264",
            "profile-level-id=42e028;packetization-mode=1",
        );

        let registered = registered_capability(&codecs, &negotiated).unwrap();
        assert_eq!(registered.mime_type, MIME_TYPE_H264);
        assert_eq!(
            registered.sdp_fmtp_line,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
        );
        assert!(!registered.rtcp_feedback.is_empty());
    }

    #[test]
    fn test_h264_packetization_mode_must_match() {
        let codecs = video_codecs();
        let negotiated = capability(MIME_TYPE_H264, "profile-level-id=42001f");

        let registered = registered_capability(&codecs, &negotiated).unwrap();
        assert_eq!(fmtp_param(&registered.sdp_fmtp_line, "packetization-mode"), Some("0"));
        assert_eq!(h264_profile(&registered.sdp_fmtp_line).as_deref(), Some("4200"));
    }

    #[test]
    fn test_exact_and_unknown_codecs() {
        let codecs = video_codecs();

        let vp8 = registered_capability(&codecs, &capability(MIME_TYPE_VP8, "")).unwrap();
        assert_eq!(vp8.mime_type, MIME_TYPE_VP8);

        let vp9 = capability(MIME_TYPE_VP9, "profile-id=2");
        assert!(registered_capability(&codecs, &vp9).is_none());

        let av1 = capability("video/AV1", "");
        assert!(registered_capability(&codecs, &av1).is_none());
    }

    #[test]
    fn test_unspecified_local_description_is_rejected() {
        assert!(answer_from_local(RTCSessionDescription::default()).is_err());

        let mut offer = RTCSessionDescription::default();
        offer.sdp_type = RTCSdpType::Offer;
        offer.sdp = "v=0\r\n".to_string();
        assert!(answer_from_local(offer).is_err());

        let mut answer = RTCSessionDescription::default();
        answer.sdp_type = RTCSdpType::Answer;
        answer.sdp = "v=0\r\n".to_string();
        let answer = answer_from_local(answer).unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(answer.sdp, "v=0\r\n");
    }

    #[tokio::test]
    async fn test_create_and_close_connection() {
        let engine = WebRtcEngine::new(&[]).unwrap();
        let connection = engine.create_connection().await.unwrap();

        assert_eq!(connection.connection_state(), ConnectionState::New);

        connection.close().await;
        // Second close is a no-op
        connection.close().await;
    }
}
