//! Call session state machine
//!
//! `CallSession` is the single owner of call state. It performs no I/O: every
//! local intent and every inbound signal is a plain method that mutates the
//! session and returns the [`Effect`]s the orchestrator has to carry out. That
//! keeps the transition table testable without a transport, devices or peer
//! connections.
//!
//! ```text
//!          start_call                    answer
//!   Idle ─────────────▶ Calling ─────────────────────┐
//!    │ ▲                  │                          ▼
//!    │ │ reject/end/      │ reject / last peer     InCall
//!    │ │ device failure   │ leaves / hang up         │
//!    │ └──────────────────┴──────────────────────────┤
//!    │ offer                                         │
//!    ▼                       answer_call             │
//!  Receiving ────────────────────────────────────────┘
//! ```

use crate::call::CallError;
use crate::identity::PeerIdentity;
use crate::media::{MediaStream, MediaTrack};
use crate::peer::PeerConnectionState;
use crate::signaling::{SignalEnvelope, SignalPayload};
use crate::types::{
    CallEvent, CallId, CallPhase, CallState, CallType, EndReason, IceCandidate, RejectReason,
    SessionDescription,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Candidates buffered per remote before the oldest are dropped
const MAX_BUFFERED_CANDIDATES: usize = 64;

/// Side effect requested by a session transition
#[derive(Debug, Clone)]
pub enum Effect<I: PeerIdentity> {
    /// Publish a signaling message
    Send {
        /// Recipient
        to: I,
        /// Message
        payload: SignalPayload,
    },
    /// Notify the UI layer
    Notify(CallEvent<I>),
    /// Apply a remote answer to the peer's connection
    ApplyAnswer {
        /// Answering participant
        peer: I,
        /// The answer
        answer: SessionDescription,
    },
    /// Apply a remote candidate to the peer's connection
    AddIceCandidate {
        /// Participant the candidate came from
        peer: I,
        /// The candidate
        candidate: IceCandidate,
    },
    /// Detach, unregister and close one peer's connection
    ClosePeer {
        /// The participant
        peer: I,
    },
    /// Release everything and return to `Idle`
    Teardown {
        /// Why the call ended
        reason: EndReason,
    },
}

/// Outgoing call registered by [`CallSession::begin_outgoing`]
#[derive(Debug, Clone)]
pub struct OutgoingCall<I: PeerIdentity> {
    /// Call attempt
    pub call_id: CallId,
    /// Deduplicated targets, local identity removed
    pub targets: Vec<I>,
    /// Call type
    pub call_type: CallType,
}

/// Incoming offer handed out by [`CallSession::take_pending_offer`]
#[derive(Debug, Clone)]
pub struct PendingAnswer<I: PeerIdentity> {
    /// Call attempt
    pub call_id: CallId,
    /// Who is calling
    pub caller: I,
    /// Their offer
    pub offer: SessionDescription,
    /// Requested call type
    pub call_type: CallType,
}

/// State of the one local call session
#[derive(Debug, Clone)]
pub struct CallSession<I: PeerIdentity> {
    call_id: CallId,
    phase: CallPhase,
    caller: Option<I>,
    participants: Vec<I>,
    call_type: Option<CallType>,
    pending_offer: Option<SessionDescription>,
    pending_call_type: Option<CallType>,
    pending_candidates: BTreeMap<String, Vec<IceCandidate>>,
    peers: BTreeMap<String, I>,
    awaiting_answer: BTreeSet<String>,
    signaled: BTreeSet<String>,
    outbound_candidates: BTreeMap<String, Vec<IceCandidate>>,
    remote_streams: BTreeMap<String, MediaStream>,
    parked_streams: BTreeMap<String, MediaStream>,
    start_time: Option<DateTime<Utc>>,
}

impl<I: PeerIdentity> Default for CallSession<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: PeerIdentity> CallSession<I> {
    /// Idle session with a fresh call id
    #[must_use]
    pub fn new() -> Self {
        Self {
            call_id: CallId::new(),
            phase: CallPhase::Idle,
            caller: None,
            participants: Vec::new(),
            call_type: None,
            pending_offer: None,
            pending_call_type: None,
            pending_candidates: BTreeMap::new(),
            peers: BTreeMap::new(),
            awaiting_answer: BTreeSet::new(),
            signaled: BTreeSet::new(),
            outbound_candidates: BTreeMap::new(),
            remote_streams: BTreeMap::new(),
            parked_streams: BTreeMap::new(),
            start_time: None,
        }
    }

    /// Current call attempt
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Remotes with a registered connection
    #[must_use]
    pub fn peers(&self) -> Vec<I> {
        self.peers.values().cloned().collect()
    }

    /// Whether an answer from `remote` is still outstanding
    #[must_use]
    pub fn is_awaiting_answer(&self, remote: &I) -> bool {
        self.awaiting_answer.contains(&remote.unique_id())
    }

    /// Return to the idle baseline under a fresh call id
    pub fn reset(&mut self) -> CallId {
        *self = Self::new();
        self.call_id
    }

    /// Render a snapshot for the UI layer
    #[must_use]
    pub fn snapshot(&self, local_stream: Option<MediaStream>) -> CallState<I> {
        CallState {
            call_id: self.call_id,
            phase: self.phase,
            caller_id: self.caller.clone(),
            participants: self.participants.clone(),
            call_type: self.call_type,
            start_time: self.start_time,
            local_stream,
            remote_streams: self.remote_streams.clone(),
        }
    }

    /// Leave `Idle` for `Calling`
    ///
    /// # Errors
    ///
    /// `InvalidState` unless idle, `NoTargets` when nobody but the local
    /// participant was named
    pub fn begin_outgoing(
        &mut self,
        local: &I,
        targets: Vec<I>,
        call_type: CallType,
    ) -> Result<OutgoingCall<I>, CallError> {
        if self.phase != CallPhase::Idle {
            return Err(CallError::InvalidState(self.phase));
        }

        let mut seen = BTreeSet::new();
        let targets: Vec<I> = targets
            .into_iter()
            .filter(|t| !t.same_as(local) && seen.insert(t.unique_id()))
            .collect();
        if targets.is_empty() {
            return Err(CallError::NoTargets);
        }

        self.call_id = CallId::new();
        self.phase = CallPhase::Calling;
        self.participants = targets.clone();
        self.call_type = Some(call_type);
        self.awaiting_answer = seen;

        Ok(OutgoingCall {
            call_id: self.call_id,
            targets,
            call_type,
        })
    }

    /// Record a connection for `remote`
    ///
    /// Returns `false` when the call attempt is gone or `remote` is no longer
    /// part of it, in which case the connection should be discarded.
    pub fn register_peer(&mut self, call_id: CallId, remote: &I) -> bool {
        if call_id != self.call_id || !self.phase.is_active() {
            return false;
        }
        let key = remote.unique_id();
        let wanted = self.awaiting_answer.contains(&key)
            || self.peers.contains_key(&key)
            || self.caller.as_ref().is_some_and(|c| c.same_as(remote));
        if wanted {
            self.peers.insert(key, remote.clone());
        }
        wanted
    }

    /// Send the offer created for `target`
    ///
    /// Local candidates gathered before this point were held back so the
    /// remote never sees a candidate ahead of the description.
    ///
    /// # Errors
    ///
    /// `Cancelled` when the call or the target went away in the meantime
    pub fn offer_created(
        &mut self,
        call_id: CallId,
        target: &I,
        offer: SessionDescription,
        call_type: CallType,
    ) -> Result<Vec<Effect<I>>, CallError> {
        if call_id != self.call_id || !self.awaiting_answer.contains(&target.unique_id()) {
            return Err(CallError::Cancelled);
        }
        let mut effects = vec![Effect::Send {
            to: target.clone(),
            payload: SignalPayload::Offer { offer, call_type },
        }];
        effects.extend(self.mark_signaled(target));
        Ok(effects)
    }

    /// Hand out the pending incoming offer, once
    ///
    /// The phase stays `Receiving` until [`complete_answer`](Self::complete_answer)
    /// so a hang-up from the caller during media acquisition still tears down.
    pub fn take_pending_offer(&mut self) -> Option<PendingAnswer<I>> {
        if self.phase != CallPhase::Receiving {
            return None;
        }
        let offer = self.pending_offer.take()?;
        let caller = self.caller.clone()?;
        let call_type = self.pending_call_type.take().unwrap_or(CallType::Video);
        Some(PendingAnswer {
            call_id: self.call_id,
            caller,
            offer,
            call_type,
        })
    }

    /// Enter `InCall` and send the answer created for the caller
    ///
    /// # Errors
    ///
    /// `Cancelled` when the incoming call went away in the meantime
    pub fn complete_answer(
        &mut self,
        call_id: CallId,
        answer: SessionDescription,
    ) -> Result<Vec<Effect<I>>, CallError> {
        if call_id != self.call_id || self.phase != CallPhase::Receiving {
            return Err(CallError::Cancelled);
        }
        let caller = self.caller.take().ok_or(CallError::Cancelled)?;

        self.phase = CallPhase::InCall;
        self.participants = vec![caller.clone()];
        self.start_time = Some(Utc::now());
        self.peers.insert(caller.unique_id(), caller.clone());

        let mut effects = vec![Effect::Send {
            to: caller.clone(),
            payload: SignalPayload::Answer { answer },
        }];
        effects.extend(self.mark_signaled(&caller));
        effects.extend(self.flush_candidates(&caller));
        effects.push(Effect::Notify(CallEvent::PeerJoined {
            call_id: self.call_id,
            peer: caller,
        }));
        Ok(effects)
    }

    /// Decline the pending incoming call
    pub fn reject_incoming(&mut self) -> Vec<Effect<I>> {
        if self.phase != CallPhase::Receiving {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if let Some(caller) = self.caller.clone() {
            effects.push(Effect::Send {
                to: caller,
                payload: SignalPayload::RejectCall { reason: None },
            });
        }
        effects.push(Effect::Teardown {
            reason: EndReason::Declined,
        });
        effects
    }

    /// Leave the call, telling every known remote
    pub fn hang_up(&mut self, reason: EndReason) -> Vec<Effect<I>> {
        if self.phase == CallPhase::Idle {
            return Vec::new();
        }

        let mut seen = BTreeSet::new();
        let recipients = self
            .participants
            .iter()
            .chain(self.peers.values())
            .chain(self.caller.iter())
            .filter(|id| seen.insert(id.unique_id()))
            .cloned()
            .collect::<Vec<_>>();

        let mut effects: Vec<Effect<I>> = recipients
            .into_iter()
            .map(|to| Effect::Send {
                to,
                payload: SignalPayload::EndCall,
            })
            .collect();
        effects.push(Effect::Teardown { reason });
        effects
    }

    /// Give up on one remote after its negotiation failed
    pub fn drop_peer(&mut self, call_id: CallId, remote: &I, reason: EndReason) -> Vec<Effect<I>> {
        if call_id != self.call_id || !self.phase.is_active() {
            return Vec::new();
        }
        if self.phase == CallPhase::Receiving {
            return self.hang_up(reason);
        }
        let mut effects = vec![Effect::Send {
            to: remote.clone(),
            payload: SignalPayload::EndCall,
        }];
        effects.extend(self.remove_peer(remote, reason));
        effects
    }

    /// Route an inbound envelope to its handler
    pub fn dispatch(&mut self, local: &I, envelope: SignalEnvelope<I>) -> Vec<Effect<I>> {
        let SignalEnvelope { from, payload, .. } = envelope;
        if from.same_as(local) {
            tracing::trace!("Ignoring envelope sent by the local participant");
            return Vec::new();
        }
        match payload {
            SignalPayload::Offer { offer, call_type } => self.on_offer(from, offer, call_type),
            SignalPayload::Answer { answer } => self.on_answer(from, answer),
            SignalPayload::IceCandidate { candidate } => self.on_ice_candidate(from, candidate),
            SignalPayload::RejectCall { reason } => self.on_reject(from, reason),
            SignalPayload::EndCall => self.on_end(from),
        }
    }

    /// Inbound offer
    pub fn on_offer(
        &mut self,
        from: I,
        offer: SessionDescription,
        call_type: CallType,
    ) -> Vec<Effect<I>> {
        if self.phase == CallPhase::Idle {
            self.call_id = CallId::new();
            self.phase = CallPhase::Receiving;
            self.caller = Some(from.clone());
            self.call_type = Some(call_type);
            self.pending_offer = Some(offer);
            self.pending_call_type = Some(call_type);
            tracing::info!(call_id = %self.call_id, caller = %from, %call_type, "Incoming call");
            return vec![Effect::Notify(CallEvent::IncomingCall {
                call_id: self.call_id,
                caller: from,
                call_type,
            })];
        }

        let ringing = self.phase == CallPhase::Receiving
            && self.caller.as_ref().is_some_and(|c| c.same_as(&from));
        if ringing {
            tracing::debug!(from = %from, "Ignoring repeated offer");
            return Vec::new();
        }

        // Includes our own targets calling back (glare); their reject handling
        // tears down both sides.
        tracing::info!(from = %from, phase = %self.phase, "Busy, rejecting offer");
        vec![Effect::Send {
            to: from,
            payload: SignalPayload::RejectCall {
                reason: Some(RejectReason::Busy),
            },
        }]
    }

    /// Inbound answer
    pub fn on_answer(&mut self, from: I, answer: SessionDescription) -> Vec<Effect<I>> {
        let accepting = matches!(self.phase, CallPhase::Calling | CallPhase::InCall);
        if !accepting || !self.awaiting_answer.remove(&from.unique_id()) {
            tracing::debug!(from = %from, phase = %self.phase, "Ignoring unexpected answer");
            return Vec::new();
        }

        self.phase = CallPhase::InCall;
        self.start_time.get_or_insert_with(Utc::now);

        let mut effects = vec![Effect::ApplyAnswer {
            peer: from.clone(),
            answer,
        }];
        effects.extend(self.flush_candidates(&from));
        effects.push(Effect::Notify(CallEvent::PeerJoined {
            call_id: self.call_id,
            peer: from,
        }));
        effects
    }

    /// Inbound ICE candidate
    ///
    /// Candidates from a remote whose description exchange is still pending
    /// are buffered; anything from an unknown remote is discarded.
    pub fn on_ice_candidate(&mut self, from: I, candidate: IceCandidate) -> Vec<Effect<I>> {
        let key = from.unique_id();
        let from_caller = self.phase == CallPhase::Receiving
            && self.caller.as_ref().is_some_and(|c| c.same_as(&from));

        if from_caller || self.awaiting_answer.contains(&key) {
            push_bounded(self.pending_candidates.entry(key).or_default(), candidate);
            return Vec::new();
        }
        if self.peers.contains_key(&key) {
            return vec![Effect::AddIceCandidate {
                peer: from,
                candidate,
            }];
        }

        tracing::trace!(from = %from, "Discarding candidate for unknown peer");
        Vec::new()
    }

    /// Inbound rejection of the outgoing call
    pub fn on_reject(&mut self, from: I, reason: Option<RejectReason>) -> Vec<Effect<I>> {
        let outgoing = matches!(self.phase, CallPhase::Calling | CallPhase::InCall);
        if !outgoing || !self.participants.iter().any(|p| p.same_as(&from)) {
            tracing::debug!(from = %from, "Ignoring rejection from non-participant");
            return Vec::new();
        }

        tracing::info!(call_id = %self.call_id, by = %from, ?reason, "Call rejected");
        let notify = Effect::Notify(CallEvent::CallRejected {
            call_id: self.call_id,
            by: from.clone(),
            reason,
        });
        // everyone else still ringing or connected is hung up on
        let mut effects: Vec<Effect<I>> = self
            .hang_up(EndReason::Rejected)
            .into_iter()
            .filter(|effect| !matches!(effect, Effect::Send { to, .. } if to.same_as(&from)))
            .collect();
        effects.insert(0, notify);
        effects
    }

    /// Inbound hang-up from one remote
    pub fn on_end(&mut self, from: I) -> Vec<Effect<I>> {
        match self.phase {
            CallPhase::Idle => Vec::new(),
            CallPhase::Receiving => {
                if self.caller.as_ref().is_some_and(|c| c.same_as(&from)) {
                    vec![Effect::Teardown {
                        reason: EndReason::RemoteHangup,
                    }]
                } else {
                    Vec::new()
                }
            }
            CallPhase::Calling | CallPhase::InCall => {
                let key = from.unique_id();
                if !self.peers.contains_key(&key) && !self.awaiting_answer.contains(&key) {
                    return Vec::new();
                }
                self.remove_peer(&from, EndReason::RemoteHangup)
            }
        }
    }

    /// Local candidate discovered by `remote`'s connection
    pub fn on_local_candidate(
        &mut self,
        call_id: CallId,
        remote: &str,
        candidate: IceCandidate,
    ) -> Vec<Effect<I>> {
        let Some(to) = self.peer_for(call_id, remote) else {
            return Vec::new();
        };
        if !self.signaled.contains(remote) {
            push_bounded(
                self.outbound_candidates
                    .entry(remote.to_string())
                    .or_default(),
                candidate,
            );
            return Vec::new();
        }
        vec![Effect::Send {
            to,
            payload: SignalPayload::IceCandidate { candidate },
        }]
    }

    /// Inbound track on `remote`'s connection
    pub fn on_remote_track(
        &mut self,
        call_id: CallId,
        remote: &str,
        track: MediaTrack,
    ) -> Vec<Effect<I>> {
        let Some(peer) = self.peer_for(call_id, remote) else {
            return Vec::new();
        };
        if let Some(parked) = self.parked_streams.get_mut(remote) {
            parked.add_track(track);
            return Vec::new();
        }
        if let Some(stream) = self.remote_streams.get_mut(remote) {
            stream.add_track(track);
            return Vec::new();
        }

        let stream = MediaStream::with_tracks(format!("{remote}-remote"), vec![track]);
        self.remote_streams.insert(remote.to_string(), stream);
        vec![Effect::Notify(CallEvent::RemoteStreamAdded {
            call_id: self.call_id,
            peer,
        })]
    }

    /// Connectivity change on `remote`'s connection
    ///
    /// Failure parks the remote stream instead of closing the connection;
    /// only an end-call or a local action removes a peer. A later
    /// `Connected` restores the parked stream.
    pub fn on_peer_state(
        &mut self,
        call_id: CallId,
        remote: &str,
        state: PeerConnectionState,
    ) -> Vec<Effect<I>> {
        let Some(peer) = self.peer_for(call_id, remote) else {
            return Vec::new();
        };
        match state {
            PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                match self.remote_streams.remove(remote) {
                    Some(stream) => {
                        tracing::info!(peer = %peer, ?state, "Peer connectivity lost, pruning stream");
                        self.parked_streams.insert(remote.to_string(), stream);
                        vec![Effect::Notify(CallEvent::RemoteStreamRemoved {
                            call_id: self.call_id,
                            peer,
                        })]
                    }
                    None => Vec::new(),
                }
            }
            PeerConnectionState::Connected => match self.parked_streams.remove(remote) {
                Some(stream) => {
                    tracing::info!(peer = %peer, "Peer recovered, restoring stream");
                    self.remote_streams.insert(remote.to_string(), stream);
                    vec![Effect::Notify(CallEvent::RemoteStreamAdded {
                        call_id: self.call_id,
                        peer,
                    })]
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn peer_for(&self, call_id: CallId, remote: &str) -> Option<I> {
        if call_id != self.call_id {
            return None;
        }
        self.peers.get(remote).cloned()
    }

    fn mark_signaled(&mut self, peer: &I) -> Vec<Effect<I>> {
        let key = peer.unique_id();
        let held = self.outbound_candidates.remove(&key).unwrap_or_default();
        self.signaled.insert(key);
        held.into_iter()
            .map(|candidate| Effect::Send {
                to: peer.clone(),
                payload: SignalPayload::IceCandidate { candidate },
            })
            .collect()
    }

    fn flush_candidates(&mut self, peer: &I) -> Vec<Effect<I>> {
        self.pending_candidates
            .remove(&peer.unique_id())
            .unwrap_or_default()
            .into_iter()
            .map(|candidate| Effect::AddIceCandidate {
                peer: peer.clone(),
                candidate,
            })
            .collect()
    }

    fn remove_peer(&mut self, remote: &I, reason: EndReason) -> Vec<Effect<I>> {
        let key = remote.unique_id();
        let mut effects = Vec::new();

        if self.peers.remove(&key).is_some() {
            effects.push(Effect::ClosePeer {
                peer: remote.clone(),
            });
        }
        self.awaiting_answer.remove(&key);
        self.signaled.remove(&key);
        self.pending_candidates.remove(&key);
        self.outbound_candidates.remove(&key);
        self.parked_streams.remove(&key);
        if self.remote_streams.remove(&key).is_some() {
            effects.push(Effect::Notify(CallEvent::RemoteStreamRemoved {
                call_id: self.call_id,
                peer: remote.clone(),
            }));
        }
        effects.push(Effect::Notify(CallEvent::PeerLeft {
            call_id: self.call_id,
            peer: remote.clone(),
        }));

        if self.peers.is_empty() && self.awaiting_answer.is_empty() {
            effects.push(Effect::Teardown { reason });
        }
        effects
    }
}

fn push_bounded(buffer: &mut Vec<IceCandidate>, candidate: IceCandidate) {
    if buffer.len() >= MAX_BUFFERED_CANDIDATES {
        buffer.remove(0);
    }
    buffer.push(candidate);
}
