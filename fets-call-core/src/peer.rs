//! Peer connection seam
//!
//! The orchestrator never negotiates media itself. It drives one
//! `PeerConnection` per remote participant through this trait and learns about
//! candidates, inbound tracks and connectivity through `PeerEvent`s delivered
//! on a `PeerEventSink`.

use crate::media::{MediaStream, MediaTrack};
use crate::types::{CallId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,

    /// Session description rejected
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Candidate arrived before the remote description
    #[error("No remote description set")]
    NoRemoteDescription,

    /// Backend failure
    #[error("Peer backend error: {0}")]
    Backend(String),
}

/// Connectivity state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    /// Created, nothing negotiated
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed
    Failed,
    /// Closed locally
    Closed,
}

/// Something a peer connection reports asynchronously
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Local ICE candidate to forward to the remote participant
    LocalCandidate(IceCandidate),
    /// Inbound media track
    Track(MediaTrack),
    /// Connectivity change
    StateChanged(PeerConnectionState),
}

/// Peer event tagged with its origin
#[derive(Debug, Clone)]
pub struct PeerNotification {
    /// Call attempt the connection belongs to
    pub call_id: CallId,
    /// Registry key of the remote participant
    pub remote: String,
    /// The event
    pub event: PeerEvent,
}

/// Where a peer connection delivers its events
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    call_id: CallId,
    remote: String,
    tx: mpsc::UnboundedSender<PeerNotification>,
}

impl PeerEventSink {
    /// Create a sink tagging events with the call and remote key
    #[must_use]
    pub fn new(
        call_id: CallId,
        remote: impl Into<String>,
        tx: mpsc::UnboundedSender<PeerNotification>,
    ) -> Self {
        Self {
            call_id,
            remote: remote.into(),
            tx,
        }
    }

    /// Call attempt this sink belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Remote key this sink belongs to
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Deliver an event; silently dropped once the orchestrator is gone
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerNotification {
            call_id: self.call_id,
            remote: self.remote.clone(),
            event,
        });
    }
}

/// One pairwise media session with a remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Registry key of the remote participant
    fn remote(&self) -> &str;

    /// Attach every track of the local stream
    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), PeerError>;

    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Current connectivity state
    fn connection_state(&self) -> PeerConnectionState;

    /// Stop delivering events; must be called before `close`
    fn detach_handlers(&self);

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection to `remote`, reporting events on `sink`
    async fn create(
        &self,
        remote: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// At most one connection per remote participant
#[derive(Default)]
pub struct PeerRegistry {
    connections: HashMap<String, Arc<dyn PeerConnection>>,
}

impl PeerRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection for `remote`, if any
    #[must_use]
    pub fn get(&self, remote: &str) -> Option<Arc<dyn PeerConnection>> {
        self.connections.get(remote).cloned()
    }

    /// Insert `connection` unless one already exists for `remote`
    ///
    /// Returns the registered connection and whether it was newly inserted.
    pub fn insert_if_absent(
        &mut self,
        remote: &str,
        connection: Arc<dyn PeerConnection>,
    ) -> (Arc<dyn PeerConnection>, bool) {
        if let Some(existing) = self.connections.get(remote) {
            return (existing.clone(), false);
        }
        self.connections
            .insert(remote.to_string(), connection.clone());
        (connection, true)
    }

    /// Remove the connection for `remote`
    pub fn remove(&mut self, remote: &str) -> Option<Arc<dyn PeerConnection>> {
        self.connections.remove(remote)
    }

    /// Remove every connection
    pub fn drain(&mut self) -> Vec<Arc<dyn PeerConnection>> {
        self.connections.drain().map(|(_, c)| c).collect()
    }

    /// Whether a connection exists for `remote`
    #[must_use]
    pub fn contains(&self, remote: &str) -> bool {
        self.connections.contains_key(remote)
    }

    /// Number of connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPeerFactory;

    fn sink(remote: &str) -> PeerEventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerEventSink::new(CallId::new(), remote, tx)
    }

    #[tokio::test]
    async fn test_registry_memoizes_by_remote() {
        let factory = LoopbackPeerFactory::new();
        let mut registry = PeerRegistry::new();

        let first = factory.create("u1", sink("u1")).await.unwrap();
        let second = factory.create("u1", sink("u1")).await.unwrap();

        let (kept, inserted) = registry.insert_if_absent("u1", first.clone());
        assert!(inserted);
        assert!(Arc::ptr_eq(&kept, &first));

        let (kept, inserted) = registry.insert_if_absent("u1", second);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_drain() {
        let factory = LoopbackPeerFactory::new();
        let mut registry = PeerRegistry::new();
        for remote in ["u1", "u2"] {
            let pc = factory.create(remote, sink(remote)).await.unwrap();
            registry.insert_if_absent(remote, pc);
        }
        assert!(registry.contains("u2"));
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.remove("u1").is_none());
    }

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let call_id = CallId::new();
        let sink = PeerEventSink::new(call_id, "u9", tx);
        sink.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));

        let n = rx.try_recv().unwrap();
        assert_eq!(n.call_id, call_id);
        assert_eq!(n.remote, "u9");
        assert!(matches!(
            n.event,
            PeerEvent::StateChanged(PeerConnectionState::Connected)
        ));
    }
}
