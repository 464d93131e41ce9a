//! Peer connections backed by the `webrtc` crate
//!
//! ICE, DTLS and SRTP are handled by `RTCPeerConnection`; this module only
//! adapts it to the [`PeerConnection`] seam and forwards its callbacks to the
//! orchestrator's event sink.

use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSink,
};
use crate::types::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcPeerConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcPeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

fn backend(e: webrtc::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

type SharedSink = Arc<Mutex<Option<PeerEventSink>>>;

fn emit(sink: &SharedSink, event: PeerEvent) {
    let sink = sink.lock().clone();
    if let Some(sink) = sink {
        sink.emit(event);
    }
}

/// `RTCPeerConnection` behind the [`PeerConnection`] seam
pub struct WebRtcPeer {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    sink: SharedSink,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeer {
    /// Local tracks to write encoded samples into
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().clone()
    }

    fn install_handlers(&self) {
        let sink = self.sink.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &sink,
                        PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    ),
                    Err(e) => tracing::warn!(error = %e, "Unserializable local candidate"),
                }
            })
        }));

        let sink = self.sink.clone();
        let remote = self.remote.clone();
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let sink = sink.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    tracing::debug!(remote = %remote, %kind, ssrc = track.ssrc(), "Remote track received");
                    emit(
                        &sink,
                        PeerEvent::Track(MediaTrack::new(
                            format!("{remote}-{kind}-{}", track.ssrc()),
                            kind,
                            format!("{remote} {kind}"),
                        )),
                    );
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let sink = sink.clone();
                Box::pin(async move {
                    emit(&sink, PeerEvent::StateChanged(map_state(state)));
                })
            }));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));
            self.pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(backend)?;
            self.local_tracks.lock().push(local);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(backend)
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_state(self.pc.connection_state())
    }

    fn detach_handlers(&self) {
        self.sink.lock().take();
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(backend)
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

/// Creates [`WebRtcPeer`]s
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory {
    config: WebRtcPeerConfig,
}

impl WebRtcPeerFactory {
    /// Factory using the given ICE servers
    #[must_use]
    pub fn new(config: WebRtcPeerConfig) -> Self {
        Self { config }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        remote: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = self.new_peer_connection().await.map_err(backend)?;
        let peer = WebRtcPeer {
            remote: remote.to_string(),
            pc,
            sink: Arc::new(Mutex::new(Some(sink))),
            local_tracks: Mutex::new(Vec::new()),
        };
        peer.install_handlers();
        tracing::debug!(remote = %remote, "WebRTC peer connection created");
        Ok(Arc::new(peer))
    }
}
