//! Call signaling protocol
//!
//! All five message kinds travel over one shared broadcast channel as a single
//! event type. Every envelope names its sender and recipient; because the
//! channel is a broadcast and not point-to-point, receivers drop anything not
//! addressed to them.

use crate::identity::PeerIdentity;
use crate::types::{CallType, IceCandidate, RejectReason, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Event name carrying every signaling message
pub const SIGNAL_EVENT: &str = "video-signal";

/// Well-known channel shared by every portal client
pub const DEFAULT_CHANNEL: &str = "video-calls";

/// Maximum SDP string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate line length
pub const MAX_CANDIDATE_LENGTH: usize = 4 * 1024;

/// Maximum identity length
const MAX_IDENTITY_LENGTH: usize = 256;

/// Envelope validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Sender or recipient missing
    #[error("Envelope has an empty {0} identity")]
    EmptyIdentity(&'static str),

    /// Identity too long
    #[error("Envelope {0} identity exceeds {MAX_IDENTITY_LENGTH} bytes")]
    IdentityTooLong(&'static str),

    /// Invalid SDP
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Invalid ICE candidate
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Message-specific part of a signaling envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Session offer opening a pairwise session
    Offer {
        /// SDP offer
        offer: SessionDescription,
        /// Requested call type
        #[serde(rename = "callType")]
        call_type: CallType,
    },

    /// Session answer accepting an offer
    Answer {
        /// SDP answer
        answer: SessionDescription,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
    },

    /// Decline an offer
    RejectCall {
        /// Optional reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },

    /// Leave the call
    EndCall,
}

impl SignalPayload {
    /// Wire name of the message kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RejectCall { .. } => "reject-call",
            Self::EndCall => "end-call",
        }
    }

    /// Check payload limits
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated limit
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::Offer { offer: desc, .. } | Self::Answer { answer: desc } => {
                if desc.sdp.trim().is_empty() {
                    return Err(SignalingError::InvalidSdp("empty".to_string()));
                }
                if desc.sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::InvalidSdp(format!(
                        "{} bytes exceeds {MAX_SDP_LENGTH}",
                        desc.sdp.len()
                    )));
                }
                Ok(())
            }
            Self::IceCandidate { candidate } => {
                if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::InvalidCandidate(format!(
                        "{} bytes exceeds {MAX_CANDIDATE_LENGTH}",
                        candidate.candidate.len()
                    )));
                }
                Ok(())
            }
            Self::RejectCall { .. } | Self::EndCall => Ok(()),
        }
    }
}

/// Signaling envelope: `{from, to, type, ...fields}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(bound = "I: PeerIdentity")]
pub struct SignalEnvelope<I: PeerIdentity> {
    /// Sender
    pub from: I,
    /// Intended recipient
    pub to: I,
    /// Message body
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl<I: PeerIdentity> SignalEnvelope<I> {
    /// Build an envelope
    pub fn new(from: I, to: I, payload: SignalPayload) -> Self {
        Self { from, to, payload }
    }

    /// Whether the envelope is addressed to `local`
    pub fn is_for(&self, local: &I) -> bool {
        self.to.same_as(local)
    }

    /// Check identities and payload limits
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated rule
    pub fn validate(&self) -> Result<(), SignalingError> {
        for (field, id) in [("from", &self.from), ("to", &self.to)] {
            let repr = id.to_string_repr();
            if repr.trim().is_empty() {
                return Err(SignalingError::EmptyIdentity(field));
            }
            if repr.len() > MAX_IDENTITY_LENGTH {
                return Err(SignalingError::IdentityTooLong(field));
            }
        }
        self.payload.validate()
    }
}

/// Signaling transport trait
///
/// Implement this for the realtime backend in use. `publish` broadcasts to
/// every subscriber of the channel; `receive` yields the next envelope seen on
/// the channel, whoever it is addressed to. Delivery is best-effort.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Participant identifier type
    type PeerId: PeerIdentity;

    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Broadcast an envelope on the channel
    async fn publish(&self, envelope: SignalEnvelope<Self::PeerId>) -> Result<(), Self::Error>;

    /// Receive the next envelope from the channel
    async fn receive(&self) -> Result<SignalEnvelope<Self::PeerId>, Self::Error>;

    /// Whether the channel is gone for good
    fn is_closed(&self) -> bool {
        false
    }
}

/// Signaling handler bound to the local participant
///
/// Stamps outgoing envelopes with the local identity, filters inbound
/// envelopes by recipient and backs off after consecutive receive errors.
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    local: T::PeerId,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>, local: T::PeerId) -> Self {
        Self {
            transport,
            local,
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &T::PeerId {
        &self.local
    }

    /// Send a signaling message to a participant
    ///
    /// # Errors
    ///
    /// Returns error if publishing fails
    #[tracing::instrument(skip(self, payload), fields(peer = %to, message_type = payload.kind()))]
    pub async fn send(&self, to: &T::PeerId, payload: SignalPayload) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        let envelope = SignalEnvelope::new(self.local.clone(), to.clone(), payload);
        self.transport.publish(envelope).await
    }

    /// Receive the next valid envelope addressed to the local participant
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails; a capped backoff is applied first
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn receive(&self) -> Result<SignalEnvelope<T::PeerId>, T::Error> {
        loop {
            match self.transport.receive().await {
                Ok(envelope) => {
                    *self.error_count.lock().await = 0;

                    if !envelope.is_for(&self.local) {
                        tracing::trace!(to = %envelope.to, "Ignoring envelope for another recipient");
                        continue;
                    }
                    if let Err(e) = envelope.validate() {
                        tracing::warn!(from = %envelope.from, error = %e, "Dropping invalid envelope");
                        continue;
                    }

                    tracing::debug!(
                        from = %envelope.from,
                        message_type = envelope.payload.kind(),
                        "Received signaling message"
                    );
                    return Ok(envelope);
                }
                Err(e) => {
                    let mut error_count = self.error_count.lock().await;
                    *error_count += 1;
                    let count = *error_count;
                    drop(error_count);

                    let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                    tracing::warn!(
                        error_count = count,
                        backoff_ms = backoff_duration.as_millis(),
                        "Error receiving message, backing off"
                    );
                    sleep(backoff_duration).await;

                    return Err(e);
                }
            }
        }
    }

    /// Whether the underlying transport is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
