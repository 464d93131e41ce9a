//! Call orchestration
//!
//! `CallManager` drives the [`CallSession`] state machine. It feeds the session
//! local intents, inbound signals and peer events, then carries out the
//! effects the session returns against the signaling channel, the capture
//! devices and the peer connections.
//!
//! The session, the peer registry and the local stream sit behind one async
//! mutex that is never held across a device, peer or signaling await. Each
//! continuation re-checks the [`CallId`] it started with and backs out if the
//! attempt was torn down in the meantime. Outgoing signals go through a single
//! FIFO queue so they reach the channel in the order the session produced
//! them.

use crate::identity::PeerIdentity;
use crate::media::{MediaDevices, MediaError, MediaStream, TrackKind};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, PeerNotification,
    PeerRegistry,
};
use crate::session::{CallSession, Effect, PendingAnswer};
use crate::signaling::{SignalEnvelope, SignalPayload, SignalingHandler, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallPhase, CallState, CallType, EndReason, IceCandidate, SessionDescription,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation not allowed in the current phase
    #[error("Operation not allowed while {0}")]
    InvalidState(CallPhase),

    /// Nobody to call
    #[error("No remote participants to call")]
    NoTargets,

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Peer connection failure
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// The call attempt ended while the operation was in flight
    #[error("Call attempt was torn down")]
    Cancelled,

    /// `start` was called twice
    #[error("Call manager already started")]
    AlreadyStarted,
}

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallManagerConfig {
    /// Hang up an outgoing call nobody answered within this long
    ///
    /// `None` keeps ringing until the user cancels.
    pub setup_timeout: Option<Duration>,
    /// Call events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            setup_timeout: None,
            event_capacity: 100,
        }
    }
}

struct Core<I: PeerIdentity> {
    session: CallSession<I>,
    registry: PeerRegistry,
    local_stream: Option<MediaStream>,
}

/// Peer work left over once the session lock is released
enum Task<I: PeerIdentity> {
    ApplyAnswer {
        call_id: CallId,
        peer: I,
        connection: Arc<dyn PeerConnection>,
        answer: SessionDescription,
    },
    AddCandidate {
        peer: I,
        connection: Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    },
    Close(Arc<dyn PeerConnection>),
}

enum Outbound<I: PeerIdentity> {
    Signal { to: I, payload: SignalPayload },
    Flush(oneshot::Sender<()>),
}

struct Inner<T: SignalingTransport> {
    signaling: Arc<SignalingHandler<T>>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    config: CallManagerConfig,
    core: Mutex<Core<T::PeerId>>,
    state_tx: watch::Sender<CallState<T::PeerId>>,
    event_tx: broadcast::Sender<CallEvent<T::PeerId>>,
    outbound_tx: mpsc::UnboundedSender<Outbound<T::PeerId>>,
    peer_tx: mpsc::UnboundedSender<PeerNotification>,
    peer_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PeerNotification>>>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Call manager
///
/// Coordinates the one call session of the local participant, as caller or
/// callee, across any number of remote participants. Cloning is cheap and
/// every clone drives the same session.
///
/// # Call Flow
///
/// ```text
///  caller                      channel                      callee
///  start_call ── offer ──────────▶──────────────────────▶ IncomingCall
///                                                          answer_call
///  PeerJoined ◀───────────────────◀──────────── answer ──
///       ◀──────────── ice-candidate (both directions) ────────▶
///  end_call ─── end-call ────────▶──────────────────────▶ CallEnded
/// ```
///
/// Calls with several targets open one independent pairwise session per
/// target, all sharing the same local stream.
pub struct CallManager<T: SignalingTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SignalingTransport> Clone for CallManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SignalingTransport + 'static> CallManager<T> {
    /// Create new call manager
    ///
    /// Spawns the task that publishes outgoing signals, so it must be called
    /// from within a Tokio runtime.
    pub async fn new(
        signaling: SignalingHandler<T>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        config: CallManagerConfig,
    ) -> Self {
        let session = CallSession::new();
        let (state_tx, _) = watch::channel(session.snapshot(None));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let signaling = Arc::new(signaling);
        tokio::spawn(publish_signals(signaling.clone(), outbound_rx));

        Self {
            inner: Arc::new(Inner {
                signaling,
                devices,
                factory,
                config,
                core: Mutex::new(Core {
                    session,
                    registry: PeerRegistry::new(),
                    local_stream: None,
                }),
                state_tx,
                event_tx,
                outbound_tx,
                peer_tx,
                peer_rx: parking_lot::Mutex::new(Some(peer_rx)),
                shutdown_tx,
                task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &T::PeerId {
        self.inner.signaling.local()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Start processing inbound signals and peer events
    ///
    /// Runs until [`shutdown`](Self::shutdown) or until the signaling channel
    /// closes. Dropping the last handle to the manager stops it as well.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call
    #[tracing::instrument(skip(self), fields(local = %self.local()))]
    pub async fn start(&self) -> Result<(), CallError> {
        let mut peer_rx = self
            .inner
            .peer_rx
            .lock()
            .take()
            .ok_or(CallError::AlreadyStarted)?;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let signaling = self.inner.signaling.clone();
        // the loop must not keep a dropped manager alive
        let inner = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let local = signaling.local().clone();
            tracing::info!(%local, "Call manager started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    Some(notification) = peer_rx.recv() => {
                        let Some(manager) = Self::upgrade(&inner) else { break };
                        manager.handle_peer_event(notification).await;
                    }
                    received = signaling.receive() => match received {
                        Ok(envelope) => {
                            let Some(manager) = Self::upgrade(&inner) else { break };
                            manager.handle_signal(envelope).await;
                        }
                        Err(e) if signaling.is_closed() => {
                            tracing::warn!(error = %e, "Signaling channel closed");
                            break;
                        }
                        Err(e) => tracing::debug!(error = %e, "Signaling receive failed"),
                    },
                }
            }
            tracing::info!(%local, "Call manager stopped");
        });

        *self.inner.task.lock() = Some(handle);
        Ok(())
    }

    /// Hang up, flush pending signals and stop the processing task
    #[tracing::instrument(skip(self), fields(local = %self.local()))]
    pub async fn shutdown(&self) {
        self.end_call().await;
        self.flush().await;
        let _ = self.inner.shutdown_tx.send(true);

        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Call manager task failed");
            }
        }
    }

    /// Wait until every signal queued so far was handed to the transport
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.outbound_tx.send(Outbound::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> CallState<T::PeerId> {
        self.inner.state_tx.borrow().clone()
    }

    /// Observe every published call state
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CallState<T::PeerId>> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<T::PeerId>> {
        self.inner.event_tx.subscribe()
    }

    /// Call one or more participants
    ///
    /// Opens one peer connection per distinct target and sends each its own
    /// offer. Returns once every offer was sent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless idle, `NoTargets`, a media error when local
    /// capture fails, the first peer error when no offer could be produced, or
    /// `Cancelled` when the call ended while it was being set up
    #[tracing::instrument(skip(self, targets), fields(local = %self.local(), targets = targets.len()))]
    pub async fn start_call(
        &self,
        targets: Vec<T::PeerId>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let call = {
            let mut core = self.inner.core.lock().await;
            let call = core
                .session
                .begin_outgoing(self.local(), targets, call_type)?;
            self.publish(&core);
            call
        };
        let call_id = call.call_id;
        tracing::info!(%call_id, participants = call.targets.len(), "Starting call");
        self.emit(CallEvent::CallStarted {
            call_id,
            participants: call.targets.clone(),
            call_type,
        });
        self.arm_setup_timeout(call_id);

        let stream = match self.inner.devices.acquire(call_type.constraints()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.media_failed(call_id, &e).await;
                return Err(e.into());
            }
        };
        self.adopt_local_stream(call_id, stream).await?;

        let results = join_all(
            call.targets
                .iter()
                .map(|target| self.offer_to(call_id, target, call_type)),
        )
        .await;

        let mut offered = 0usize;
        let mut first_error = None;
        for (target, result) in call.targets.iter().zip(results) {
            match result {
                Ok(()) => offered += 1,
                Err(CallError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(%call_id, peer = %target, error = %e, "Offer failed, dropping peer");
                    self.transition(|session| {
                        session.drop_peer(call_id, target, EndReason::SetupFailed)
                    })
                    .await;
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            if offered == 0 {
                return Err(e);
            }
        }
        if !self.is_current(call_id).await {
            return Err(CallError::Cancelled);
        }
        Ok(call_id)
    }

    /// Accept the pending incoming call; no-op when nothing is ringing
    ///
    /// # Errors
    ///
    /// Returns a media error when local capture fails, a peer error when the
    /// answer cannot be produced, or `Cancelled` when the caller hung up first
    #[tracing::instrument(skip(self), fields(local = %self.local()))]
    pub async fn answer_call(&self) -> Result<(), CallError> {
        let pending = self.inner.core.lock().await.session.take_pending_offer();
        let Some(pending) = pending else {
            tracing::debug!("No pending call to answer");
            return Ok(());
        };
        let call_id = pending.call_id;
        tracing::info!(%call_id, caller = %pending.caller, "Answering call");

        let stream = match self
            .inner
            .devices
            .acquire(pending.call_type.constraints())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.media_failed(call_id, &e).await;
                return Err(e.into());
            }
        };
        self.adopt_local_stream(call_id, stream).await?;

        match self.accept(&pending).await {
            Err(e) if e != CallError::Cancelled => {
                tracing::warn!(%call_id, error = %e, "Answering failed");
                self.abort(call_id, EndReason::SetupFailed).await;
                Err(e)
            }
            result => result,
        }
    }

    /// Decline the pending incoming call; no-op when nothing is ringing
    #[tracing::instrument(skip(self), fields(local = %self.local()))]
    pub async fn reject_call(&self) {
        self.transition(|session| session.reject_incoming()).await;
    }

    /// End the current call; safe to call in any phase, any number of times
    #[tracing::instrument(skip(self), fields(local = %self.local()))]
    pub async fn end_call(&self) {
        self.transition(|session| session.hang_up(EndReason::LocalHangup))
            .await;
    }

    /// Mute or unmute the microphone, returning whether audio is now enabled
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    /// Turn the camera off or on, returning whether video is now enabled
    pub async fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    /// Apply an inbound envelope
    ///
    /// Normally fed by the task spawned in [`start`](Self::start). Envelopes
    /// for another recipient and invalid envelopes are dropped.
    pub async fn handle_signal(&self, envelope: SignalEnvelope<T::PeerId>) {
        if !envelope.is_for(self.local()) {
            return;
        }
        if let Err(e) = envelope.validate() {
            tracing::warn!(from = %envelope.from, error = %e, "Dropping invalid envelope");
            return;
        }
        let local = self.local().clone();
        self.transition(move |session| session.dispatch(&local, envelope))
            .await;
    }

    async fn handle_peer_event(&self, notification: PeerNotification) {
        let PeerNotification {
            call_id,
            remote,
            event,
        } = notification;
        self.transition(move |session| match event {
            PeerEvent::LocalCandidate(candidate) => {
                session.on_local_candidate(call_id, &remote, candidate)
            }
            PeerEvent::Track(track) => session.on_remote_track(call_id, &remote, track),
            PeerEvent::StateChanged(state) => session.on_peer_state(call_id, &remote, state),
        })
        .await;
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let core = self.inner.core.lock().await;
        let enabled = core.local_stream.as_ref()?.toggle(kind)?;
        tracing::info!(%kind, enabled, "Local track toggled");
        Some(enabled)
    }

    async fn accept(&self, pending: &PendingAnswer<T::PeerId>) -> Result<(), CallError> {
        let connection = self.open_peer(pending.call_id, &pending.caller).await?;
        connection
            .set_remote_description(pending.offer.clone())
            .await?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        let tasks = {
            let mut core = self.inner.core.lock().await;
            let effects = core.session.complete_answer(pending.call_id, answer)?;
            self.settle(&mut core, effects)
        };
        self.run(tasks).await;
        tracing::info!(call_id = %pending.call_id, "Call answered");
        Ok(())
    }

    async fn offer_to(
        &self,
        call_id: CallId,
        target: &T::PeerId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let connection = self.open_peer(call_id, target).await?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        let tasks = {
            let mut core = self.inner.core.lock().await;
            let effects = core
                .session
                .offer_created(call_id, target, offer, call_type)?;
            self.settle(&mut core, effects)
        };
        self.run(tasks).await;
        tracing::debug!(%call_id, peer = %target, "Offer sent");
        Ok(())
    }

    /// Connection for `remote`, created and registered on first use
    async fn open_peer(
        &self,
        call_id: CallId,
        remote: &T::PeerId,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let key = remote.unique_id();
        {
            let core = self.inner.core.lock().await;
            if core.session.call_id() != call_id {
                return Err(CallError::Cancelled);
            }
            if let Some(existing) = core.registry.get(&key) {
                return Ok(existing);
            }
        }

        let sink = PeerEventSink::new(call_id, key.clone(), self.inner.peer_tx.clone());
        let created = self.inner.factory.create(&key, sink).await?;

        let registered = {
            let mut core = self.inner.core.lock().await;
            if core.session.register_peer(call_id, remote) {
                let (connection, inserted) = core.registry.insert_if_absent(&key, created.clone());
                Some((connection, inserted, core.local_stream.clone()))
            } else {
                None
            }
        };

        match registered {
            None => {
                tracing::debug!(%call_id, peer = %remote, "Call moved on, discarding new connection");
                discard(created).await;
                Err(CallError::Cancelled)
            }
            Some((connection, false, _)) => {
                discard(created).await;
                Ok(connection)
            }
            Some((connection, true, local_stream)) => {
                if let Some(stream) = local_stream {
                    connection.add_local_stream(&stream).await?;
                }
                tracing::debug!(%call_id, peer = %remote, "Peer connection opened");
                Ok(connection)
            }
        }
    }

    async fn adopt_local_stream(&self, call_id: CallId, stream: MediaStream) -> Result<(), CallError> {
        let mut core = self.inner.core.lock().await;
        if core.session.call_id() != call_id || !core.session.phase().is_active() {
            drop(core);
            stream.stop();
            tracing::debug!(%call_id, "Call ended while acquiring media, releasing stream");
            return Err(CallError::Cancelled);
        }
        if let Some(previous) = core.local_stream.replace(stream) {
            previous.stop();
        }
        self.publish(&core);
        Ok(())
    }

    async fn media_failed(&self, call_id: CallId, error: &MediaError) {
        tracing::warn!(%call_id, error = %error, "Local media unavailable");
        self.transition(|session| {
            if session.call_id() != call_id {
                return Vec::new();
            }
            let mut effects = vec![Effect::Notify(CallEvent::MediaFailed {
                call_id,
                error: error.to_string(),
            })];
            effects.extend(session.hang_up(EndReason::DeviceError));
            effects
        })
        .await;
    }

    async fn abort(&self, call_id: CallId, reason: EndReason) {
        self.transition(|session| {
            if session.call_id() != call_id {
                return Vec::new();
            }
            session.hang_up(reason)
        })
        .await;
    }

    fn arm_setup_timeout(&self, call_id: CallId) {
        let Some(timeout) = self.inner.config.setup_timeout else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = Self::upgrade(&inner) else {
                return;
            };
            manager
                .transition(|session| {
                    if session.call_id() != call_id || session.phase() != CallPhase::Calling {
                        return Vec::new();
                    }
                    tracing::info!(%call_id, ?timeout, "Nobody answered, giving up");
                    session.hang_up(EndReason::TimedOut)
                })
                .await;
        });
    }

    fn upgrade(inner: &Weak<Inner<T>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    async fn is_current(&self, call_id: CallId) -> bool {
        let core = self.inner.core.lock().await;
        core.session.call_id() == call_id && core.session.phase().is_active()
    }

    /// Run one session transition and carry out its effects
    async fn transition<F>(&self, f: F)
    where
        F: FnOnce(&mut CallSession<T::PeerId>) -> Vec<Effect<T::PeerId>> + Send,
    {
        let tasks = {
            let mut core = self.inner.core.lock().await;
            let effects = f(&mut core.session);
            self.settle(&mut core, effects)
        };
        self.run(tasks).await;
    }

    /// Apply effects that need no await, with the session lock held
    ///
    /// Signals are queued, teardown happens in full, the new state is
    /// published and events are emitted. Peer work that has to await is
    /// returned for [`run`](Self::run).
    fn settle(
        &self,
        core: &mut Core<T::PeerId>,
        effects: Vec<Effect<T::PeerId>>,
    ) -> Vec<Task<T::PeerId>> {
        let mut events = Vec::new();
        let mut tasks = Vec::new();

        for effect in effects {
            match effect {
                Effect::Send { to, payload } => {
                    let _ = self.inner.outbound_tx.send(Outbound::Signal { to, payload });
                }
                Effect::Notify(event) => events.push(event),
                Effect::ApplyAnswer { peer, answer } => {
                    match core.registry.get(&peer.unique_id()) {
                        Some(connection) => tasks.push(Task::ApplyAnswer {
                            call_id: core.session.call_id(),
                            peer,
                            connection,
                            answer,
                        }),
                        None => tracing::warn!(peer = %peer, "Answer for a peer without connection"),
                    }
                }
                Effect::AddIceCandidate { peer, candidate } => {
                    match core.registry.get(&peer.unique_id()) {
                        Some(connection) => tasks.push(Task::AddCandidate {
                            peer,
                            connection,
                            candidate,
                        }),
                        None => tracing::trace!(peer = %peer, "Discarding candidate, no connection"),
                    }
                }
                Effect::ClosePeer { peer } => {
                    if let Some(connection) = core.registry.remove(&peer.unique_id()) {
                        connection.detach_handlers();
                        tasks.push(Task::Close(connection));
                    }
                }
                Effect::Teardown { reason } => {
                    let closing = core.registry.drain();
                    for connection in &closing {
                        connection.detach_handlers();
                    }
                    if let Some(stream) = core.local_stream.take() {
                        let stopped = stream.stop();
                        tracing::debug!(stream_id = %stream.id(), stopped, "Local stream released");
                    }
                    let call_id = core.session.call_id();
                    core.session.reset();
                    tracing::info!(%call_id, ?reason, peers = closing.len(), "Call ended");

                    events.push(CallEvent::CallEnded { call_id, reason });
                    tasks.extend(closing.into_iter().map(Task::Close));
                }
            }
        }

        self.publish(core);
        for event in events {
            self.emit(event);
        }
        tasks
    }

    async fn run(&self, tasks: Vec<Task<T::PeerId>>) {
        let mut queue: VecDeque<_> = tasks.into();
        while let Some(task) = queue.pop_front() {
            match task {
                Task::ApplyAnswer {
                    call_id,
                    peer,
                    connection,
                    answer,
                } => {
                    if let Err(e) = connection.set_remote_description(answer).await {
                        tracing::warn!(%call_id, peer = %peer, error = %e, "Failed to apply answer, dropping peer");
                        let more = {
                            let mut core = self.inner.core.lock().await;
                            let effects =
                                core.session.drop_peer(call_id, &peer, EndReason::SetupFailed);
                            self.settle(&mut core, effects)
                        };
                        queue.extend(more);
                    }
                }
                Task::AddCandidate {
                    peer,
                    connection,
                    candidate,
                } => {
                    if let Err(e) = connection.add_ice_candidate(candidate).await {
                        tracing::debug!(peer = %peer, error = %e, "Discarding ICE candidate");
                    }
                }
                Task::Close(connection) => {
                    if let Err(e) = connection.close().await {
                        tracing::debug!(remote = connection.remote(), error = %e, "Error closing peer connection");
                    }
                }
            }
        }
    }

    fn publish(&self, core: &Core<T::PeerId>) {
        self.inner
            .state_tx
            .send_replace(core.session.snapshot(core.local_stream.clone()));
    }

    fn emit(&self, event: CallEvent<T::PeerId>) {
        let _ = self.inner.event_tx.send(event);
    }
}

async fn discard(connection: Arc<dyn PeerConnection>) {
    connection.detach_handlers();
    if let Err(e) = connection.close().await {
        tracing::debug!(remote = connection.remote(), error = %e, "Error closing discarded connection");
    }
}

async fn publish_signals<T: SignalingTransport>(
    signaling: Arc<SignalingHandler<T>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound<T::PeerId>>,
) {
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Signal { to, payload } => {
                let message_type = payload.kind();
                if let Err(e) = signaling.send(&to, payload).await {
                    tracing::warn!(peer = %to, message_type, error = %e, "Failed to send signaling message");
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::StaffId;
    use crate::loopback::LoopbackPeerFactory;
    use crate::media::SyntheticDevices;
    use crate::transport::{BroadcastHub, ChannelTransport};

    async fn manager(
        hub: &BroadcastHub,
        name: &str,
    ) -> (CallManager<ChannelTransport<StaffId>>, Arc<SyntheticDevices>) {
        let devices = Arc::new(SyntheticDevices::new(name));
        let signaling = SignalingHandler::new(Arc::new(hub.subscribe()), StaffId::new(name));
        let manager = CallManager::new(
            signaling,
            devices.clone(),
            Arc::new(LoopbackPeerFactory::new()),
            CallManagerConfig::default(),
        )
        .await;
        (manager, devices)
    }

    #[test]
    fn test_config_default() {
        let config = CallManagerConfig::default();
        assert!(config.setup_timeout.is_none());
        assert_eq!(config.event_capacity, 100);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let hub = BroadcastHub::default();
        let (alice, _) = manager(&hub, "alice").await;
        alice.start().await.unwrap();
        assert_eq!(alice.start().await.unwrap_err(), CallError::AlreadyStarted);
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_manager_releases_its_subscription() {
        let hub = BroadcastHub::default();
        let (alice, _) = manager(&hub, "alice").await;
        alice.start().await.unwrap();
        let channel = hub.config().channel.clone();
        assert_eq!(hub.publish_raw(&channel, "{}"), 1);

        let inner = Arc::downgrade(&alice.inner);
        drop(alice);
        assert!(inner.upgrade().is_none());

        tokio::time::timeout(Duration::from_secs(3), async {
            while hub.publish_raw(&channel, "{}") > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_call_requires_idle() {
        let hub = BroadcastHub::default();
        let (alice, _) = manager(&hub, "alice").await;

        let err = alice
            .start_call(vec![StaffId::new("alice")], CallType::Video)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::NoTargets);

        alice
            .start_call(vec![StaffId::new("bob")], CallType::Video)
            .await
            .unwrap();
        let err = alice
            .start_call(vec![StaffId::new("carol")], CallType::Video)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::InvalidState(CallPhase::Calling));
    }

    #[tokio::test]
    async fn test_toggles_follow_local_stream() {
        let hub = BroadcastHub::default();
        let (alice, _) = manager(&hub, "alice").await;
        assert_eq!(alice.toggle_audio().await, None);

        alice
            .start_call(vec![StaffId::new("bob")], CallType::Audio)
            .await
            .unwrap();
        assert_eq!(alice.toggle_audio().await, Some(false));
        assert_eq!(alice.toggle_audio().await, Some(true));
        assert_eq!(alice.toggle_video().await, None);
    }

    #[tokio::test]
    async fn test_answer_without_pending_call_is_noop() {
        let hub = BroadcastHub::default();
        let (alice, devices) = manager(&hub, "alice").await;
        alice.answer_call().await.unwrap();
        alice.reject_call().await;
        assert!(alice.state().is_idle_baseline());
        assert!(devices.issued().is_empty());
    }

    #[tokio::test]
    async fn test_end_call_releases_media() {
        let hub = BroadcastHub::default();
        let (alice, devices) = manager(&hub, "alice").await;
        let mut events = alice.subscribe_events();

        let call_id = alice
            .start_call(vec![StaffId::new("bob")], CallType::Video)
            .await
            .unwrap();
        assert!(alice.state().is_calling());
        assert!(alice.state().local_stream.is_some());

        alice.end_call().await;
        alice.end_call().await;
        assert!(alice.state().is_idle_baseline());
        assert!(devices.all_released());

        let mut ended = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::CallEnded { call_id, reason } = event {
                ended.push((call_id, reason));
            }
        }
        assert_eq!(ended, vec![(call_id, EndReason::LocalHangup)]);
    }
}
