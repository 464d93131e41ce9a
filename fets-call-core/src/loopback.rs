//! In-memory peer connections
//!
//! `LoopbackPeer` negotiates against nothing: it fabricates SDP, reports one
//! host candidate per local description and declares itself connected as soon
//! as both descriptions are in place. Every connection a factory creates is
//! kept so tests can inspect what the orchestrator did with it.

use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSink,
};
use crate::types::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn synthetic_sdp(kinds: &[TrackKind]) -> String {
    let session = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut sdp = format!("v=0\r\no=- {session} 2 IN IP4 127.0.0.1\r\ns=fets-loopback\r\nt=0 0\r\n");
    for (mid, kind) in kinds.iter().enumerate() {
        let payload_type = match kind {
            TrackKind::Audio => 111,
            TrackKind::Video => 96,
        };
        sdp.push_str(&format!(
            "m={kind} 9 UDP/TLS/RTP/SAVPF {payload_type}\r\na=mid:{mid}\r\na=sendrecv\r\n"
        ));
    }
    sdp
}

fn media_kinds(sdp: &str) -> Vec<TrackKind> {
    sdp.lines()
        .filter_map(|line| {
            if line.starts_with("m=audio") {
                Some(TrackKind::Audio)
            } else if line.starts_with("m=video") {
                Some(TrackKind::Video)
            } else {
                None
            }
        })
        .collect()
}

/// Deterministic in-memory peer connection
pub struct LoopbackPeer {
    remote: String,
    sink: Mutex<Option<PeerEventSink>>,
    local_kinds: Mutex<Vec<TrackKind>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    state: Mutex<PeerConnectionState>,
    fail_negotiation: bool,
    closed: AtomicBool,
    detached: AtomicBool,
}

impl LoopbackPeer {
    fn new(remote: &str, sink: PeerEventSink, fail_negotiation: bool) -> Self {
        Self {
            remote: remote.to_string(),
            sink: Mutex::new(Some(sink)),
            local_kinds: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            state: Mutex::new(PeerConnectionState::New),
            fail_negotiation,
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: PeerEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let remote_sdp = match (
            self.local_description.lock().is_some(),
            self.remote_description.lock().clone(),
        ) {
            (true, Some(desc)) => desc.sdp,
            _ => return,
        };
        {
            let mut state = self.state.lock();
            if *state == PeerConnectionState::Connected {
                return;
            }
            *state = PeerConnectionState::Connected;
        }

        for (n, kind) in media_kinds(&remote_sdp).into_iter().enumerate() {
            let track = MediaTrack::new(
                format!("{}-{kind}-{n}", self.remote),
                kind,
                format!("{} {kind}", self.remote),
            );
            self.emit(PeerEvent::Track(track));
        }
        self.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
    }

    /// Force a connectivity state and report it
    pub fn simulate_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
        self.emit(PeerEvent::StateChanged(state));
    }

    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    /// Kinds of the local tracks attached so far
    pub fn local_track_kinds(&self) -> Vec<TrackKind> {
        self.local_kinds.lock().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether handlers were detached
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        let mut kinds = self.local_kinds.lock();
        for track in stream.tracks() {
            if !kinds.contains(&track.kind()) {
                kinds.push(track.kind());
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.fail_negotiation {
            return Err(PeerError::Backend("offer generation failed".to_string()));
        }
        let kinds = self.local_kinds.lock().clone();
        Ok(SessionDescription::offer(synthetic_sdp(&kinds)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.fail_negotiation {
            return Err(PeerError::Backend("answer generation failed".to_string()));
        }
        let offer = self
            .remote_description
            .lock()
            .clone()
            .ok_or(PeerError::NoRemoteDescription)?;
        if offer.sdp_type != SdpType::Offer {
            return Err(PeerError::InvalidDescription(
                "remote description is not an offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(synthetic_sdp(&media_kinds(
            &offer.sdp,
        ))))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.local_description.lock() = Some(desc);
        *self.state.lock() = PeerConnectionState::Connecting;

        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                40000 + SESSION_COUNTER.load(Ordering::Relaxed) % 20000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidDescription(
                "missing version line".to_string(),
            ));
        }
        *self.remote_description.lock() = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.remote_description.lock().is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    fn detach_handlers(&self) {
        self.detached.store(true, Ordering::Release);
        self.sink.lock().take();
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.state.lock() = PeerConnectionState::Closed;
        tracing::trace!(remote = %self.remote, "Loopback peer closed");
        Ok(())
    }
}

/// Factory for [`LoopbackPeer`]s
#[derive(Default)]
pub struct LoopbackPeerFactory {
    created: Mutex<Vec<Arc<LoopbackPeer>>>,
    fail_negotiation: AtomicBool,
}

impl LoopbackPeerFactory {
    /// Factory whose peers negotiate successfully
    pub fn new() -> Self {
        Self::default()
    }

    /// Make peers created from now on fail to produce offers and answers
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::Release);
    }

    /// Every connection created so far, in creation order
    pub fn created(&self) -> Vec<Arc<LoopbackPeer>> {
        self.created.lock().clone()
    }

    /// Most recent connection created for `remote`
    pub fn connection(&self, remote: &str) -> Option<Arc<LoopbackPeer>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|pc| pc.remote == remote)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        remote: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(LoopbackPeer::new(
            remote,
            sink,
            self.fail_negotiation.load(Ordering::Acquire),
        ));
        self.created.lock().push(pc.clone());
        tracing::debug!(remote = %remote, "Loopback peer created");
        Ok(pc)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer::PeerNotification;
    use crate::types::CallId;
    use tokio::sync::mpsc;

    fn audio_video() -> MediaStream {
        MediaStream::with_tracks(
            "local",
            vec![
                MediaTrack::new("a", TrackKind::Audio, "mic"),
                MediaTrack::new("v", TrackKind::Video, "cam"),
            ],
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerNotification>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(n) = rx.try_recv() {
            events.push(n.event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let factory = LoopbackPeerFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let call_id = CallId::new();

        let caller = factory
            .create("callee", PeerEventSink::new(call_id, "callee", tx.clone()))
            .await
            .unwrap();
        let callee = factory
            .create("caller", PeerEventSink::new(call_id, "caller", tx))
            .await
            .unwrap();

        caller.add_local_stream(&audio_video()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        assert_eq!(caller.connection_state(), PeerConnectionState::Connected);
        assert_eq!(callee.connection_state(), PeerConnectionState::Connected);

        let events = drain(&mut rx);
        let candidates = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::LocalCandidate(_)))
            .count();
        let tracks = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::Track(_)))
            .count();
        assert_eq!(candidates, 2);
        assert_eq!(tracks, 4);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let factory = LoopbackPeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory
            .create("u2", PeerEventSink::new(CallId::new(), "u2", tx))
            .await
            .unwrap();

        let err = pc
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::NoRemoteDescription);

        pc.close().await.unwrap();
        let err = pc
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::Closed);
        assert!(factory.connection("u2").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_detached_peer_is_silent() {
        let factory = LoopbackPeerFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = factory
            .create("u2", PeerEventSink::new(CallId::new(), "u2", tx))
            .await
            .unwrap();

        pc.detach_handlers();
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        factory
            .connection("u2")
            .unwrap()
            .simulate_state(PeerConnectionState::Failed);

        assert!(drain(&mut rx).is_empty());
        assert!(factory.connection("u2").unwrap().is_detached());
    }

    #[tokio::test]
    async fn test_failing_negotiation() {
        let factory = LoopbackPeerFactory::new();
        factory.set_fail_negotiation(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory
            .create("u2", PeerEventSink::new(CallId::new(), "u2", tx))
            .await
            .unwrap();
        assert!(matches!(
            pc.create_offer().await,
            Err(PeerError::Backend(_))
        ));
    }

    #[test]
    fn test_media_kinds_follow_m_lines() {
        let sdp = synthetic_sdp(&[TrackKind::Audio]);
        assert_eq!(media_kinds(&sdp), vec![TrackKind::Audio]);
        assert!(media_kinds("v=0\r\n").is_empty());
    }
}
