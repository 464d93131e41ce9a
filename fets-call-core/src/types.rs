//! Call types and data structures

use crate::identity::PeerIdentity;
use crate::media::MediaStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of one call attempt
///
/// A fresh id is issued every time the session leaves `Idle` and every time it
/// is reset, so work that completes after a teardown can tell it is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call, fixed for the lifetime of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Camera and microphone
    Video,
    /// Microphone only
    Audio,
}

impl CallType {
    /// Capture constraints for this call type
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::Video => MediaConstraints::video_call(),
            Self::Audio => MediaConstraints::audio_only(),
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Phase of the local call session
///
/// Exactly one phase holds at any time; the legacy `isInCall` / `isCalling` /
/// `isReceivingCall` flags are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    Idle,
    /// Outgoing offers sent, awaiting an answer
    Calling,
    /// Incoming offer pending the user's decision
    Receiving,
    /// Media session established with at least one answer exchanged
    InCall,
}

impl CallPhase {
    /// Any phase other than `Idle`
    pub fn is_active(self) -> bool {
        self != Self::Idle
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Receiving => "receiving",
            Self::InCall => "in-call",
        };
        f.write_str(s)
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description, in the shape browsers exchange (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, in the shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only a candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Why a call offer was declined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    /// The callee is already engaged in another call
    Busy,
    /// The callee declined
    Declined,
    /// Any reason this client does not know
    #[serde(other)]
    Other,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The local user hung up
    LocalHangup,
    /// The last remote participant hung up
    RemoteHangup,
    /// A remote participant rejected the outgoing call
    Rejected,
    /// The local user declined the incoming call
    Declined,
    /// Local media could not be acquired
    DeviceError,
    /// Session description negotiation failed
    SetupFailed,
    /// Nobody answered within the configured setup timeout
    TimedOut,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: I,
        /// Requested call type
        call_type: CallType,
    },
    /// Outgoing call started
    CallStarted {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        participants: Vec<I>,
        /// Call type
        call_type: CallType,
    },
    /// A remote participant answered or was answered
    PeerJoined {
        /// Call identifier
        call_id: CallId,
        /// The participant
        peer: I,
    },
    /// A remote participant left the call
    PeerLeft {
        /// Call identifier
        call_id: CallId,
        /// The participant
        peer: I,
    },
    /// Inbound media from a participant became available
    RemoteStreamAdded {
        /// Call identifier
        call_id: CallId,
        /// The participant
        peer: I,
    },
    /// Inbound media from a participant went away
    RemoteStreamRemoved {
        /// Call identifier
        call_id: CallId,
        /// The participant
        peer: I,
    },
    /// A remote participant rejected the outgoing call
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Who rejected
        by: I,
        /// Reason given, if any
        reason: Option<RejectReason>,
    },
    /// Local media could not be acquired
    MediaFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
    /// Call ended and all resources were released
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
}

/// Read-only snapshot of the call session for rendering
#[derive(Debug, Clone)]
pub struct CallState<I: PeerIdentity> {
    /// Current call attempt
    pub call_id: CallId,
    /// Current phase
    pub phase: CallPhase,
    /// Originator of the pending or answered incoming call
    pub caller_id: Option<I>,
    /// Remote identities targeted by the outgoing call, or the answered caller
    pub participants: Vec<I>,
    /// Call type of the current or pending call
    pub call_type: Option<CallType>,
    /// When the call entered `InCall`
    pub start_time: Option<DateTime<Utc>>,
    /// Local capture, while held
    pub local_stream: Option<MediaStream>,
    /// Inbound media keyed by remote identity
    pub remote_streams: BTreeMap<String, MediaStream>,
}

impl<I: PeerIdentity> CallState<I> {
    /// Idle baseline for the given call id
    pub fn idle(call_id: CallId) -> Self {
        Self {
            call_id,
            phase: CallPhase::Idle,
            caller_id: None,
            participants: Vec::new(),
            call_type: None,
            start_time: None,
            local_stream: None,
            remote_streams: BTreeMap::new(),
        }
    }

    /// Media is flowing or negotiating with answered peers
    pub fn is_in_call(&self) -> bool {
        self.phase == CallPhase::InCall
    }

    /// Outgoing call awaiting an answer
    pub fn is_calling(&self) -> bool {
        self.phase == CallPhase::Calling
    }

    /// Incoming call awaiting the user's decision
    pub fn is_receiving_call(&self) -> bool {
        self.phase == CallPhase::Receiving
    }

    /// Time spent in the call so far
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.start_time.map(|start| Utc::now() - start)
    }

    /// Whether every field equals the idle baseline
    pub fn is_idle_baseline(&self) -> bool {
        self.phase == CallPhase::Idle
            && self.caller_id.is_none()
            && self.participants.is_empty()
            && self.call_type.is_none()
            && self.start_time.is_none()
            && self.local_stream.is_none()
            && self.remote_streams.is_empty()
    }
}
