//! Peer transport backed by the `webrtc` crate.
//!
//! Local tracks are registered as Opus/VP8 sample tracks; whatever captures
//! media writes samples into them through [`WebRtcPeer::local_track`].
//! Gathered candidates, connection state and remote tracks are reported on
//! the usual [`PeerEvent`] channel.

use async_trait::async_trait;
use chatify_core::signaling::{IceCandidate, SdpType, SessionDescription};
use chatify_core::types::CallMode;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::media::{LocalStream, RemoteStream, TrackKind};
use super::peer::{PeerConfig, PeerEvent, PeerTransport, PeerTransportFactory, TransportState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One `RTCPeerConnection`.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_tracks: DashMap<String, Arc<TrackLocalStaticSample>>,
}

impl WebRtcPeer {
    /// Sample track registered for the local capture track `id`.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.get(id).map(|t| t.clone())
    }

    /// Add a receive-only transceiver for `kind` unless one already exists.
    async fn ensure_receiving(&self, kind: RTPCodecType) -> Result<(), webrtc::Error> {
        let present = self
            .pc
            .get_transceivers()
            .await
            .iter()
            .any(|t| t.kind() == kind);
        if !present {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Checking),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), anyhow::Error> {
        for track in stream.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));
            self.pc
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            self.local_tracks.insert(track.id().to_string(), local);
        }
        debug!("Added {} local tracks", stream.tracks().len());
        Ok(())
    }

    async fn create_offer(&self, mode: CallMode) -> Result<SessionDescription, anyhow::Error> {
        // Ask for the remote side's media even when nothing local is sent.
        // Audio calls never carry a video section.
        self.ensure_receiving(RTPCodecType::Audio).await?;
        if mode.has_video() {
            self.ensure_receiving(RTPCodecType::Video).await?;
        }
        let offer = self.pc.create_offer(None).await?;
        debug!("Created {} offer ({} bytes)", mode, offer.sdp.len());
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), anyhow::Error> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), anyhow::Error> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        self.local_tracks.clear();
    }
}

/// Builds [`WebRtcPeer`]s with the default codecs and interceptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let cand_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = cand_tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let mut ice = IceCandidate::new(init.candidate);
                        ice.sdp_mid = init.sdp_mid;
                        ice.sdp_m_line_index = init.sdp_mline_index;
                        ice.username_fragment = init.username_fragment;
                        let _ = tx.send(PeerEvent::CandidateDiscovered(ice)).await;
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!("Peer connection state: {}", s);
            let tx = state_tx.clone();
            Box::pin(async move {
                if let Some(state) = map_state(s) {
                    let _ = tx.send(PeerEvent::StateChanged(state)).await;
                }
            })
        }));

        let track_tx = tx;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let stream_id = track.stream_id().to_string();
                info!("Remote {} track on stream {}", track.kind(), stream_id);
                let _ = tx
                    .send(PeerEvent::TrackReceived(RemoteStream::new(stream_id)))
                    .await;
            })
        }));

        let peer = WebRtcPeer {
            pc,
            local_tracks: DashMap::new(),
        };
        Ok((Arc::new(peer), rx))
    }
}
