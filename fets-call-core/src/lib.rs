//! FETS Point call orchestration
//!
//! Mesh audio/video calling for the FETS Point staff portal. Participants
//! exchange offers, answers and ICE candidates over one shared broadcast
//! channel; every pair of participants in a call holds its own peer
//! connection. It features:
//!
//! - **Broadcast Signaling**: JSON envelopes on a named channel, filtered by recipient
//! - **Mesh Calls**: one pairwise session per remote participant, sharing one local stream
//! - **Explicit State Machine**: `Idle`, `Calling`, `Receiving` and `InCall`
//! - **Pluggable Backends**: capture devices and peer connections sit behind traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use fets_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Shared realtime channel
//! let hub = BroadcastHub::default();
//! let transport = Arc::new(hub.subscribe::<StaffId>());
//! let signaling = SignalingHandler::new(transport, StaffId::new("u1"));
//!
//! let manager = CallManager::new(
//!     signaling,
//!     Arc::new(SyntheticDevices::new("front-desk")),
//!     Arc::new(LoopbackPeerFactory::new()),
//!     CallManagerConfig::default(),
//! )
//! .await;
//! manager.start().await?;
//!
//! // Ring two colleagues
//! let call_id = manager
//!     .start_call(vec![StaffId::new("u2"), StaffId::new("u3")], CallType::Video)
//!     .await?;
//! println!("calling as {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Participant identity abstraction
pub mod identity;

/// Signaling protocol and handlers
pub mod signaling;

/// In-process broadcast channel transport
pub mod transport;

/// Local media capture
pub mod media;

/// Peer connection seam and registry
pub mod peer;

/// In-memory peer connections
pub mod loopback;

/// Call state machine
pub mod session;

/// Call management
pub mod call;

/// Peer connections over the webrtc crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_peer;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerConfig};
pub use identity::{PeerIdentity, StaffId};
pub use loopback::{LoopbackPeer, LoopbackPeerFactory};
pub use media::{
    MediaDevices, MediaError, MediaStream, MediaTrack, SyntheticDevices, TrackKind,
};
pub use peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSink, PeerNotification, PeerRegistry,
};
pub use session::{CallSession, Effect};
pub use signaling::{
    SignalEnvelope, SignalPayload, SignalingError, SignalingHandler, SignalingTransport,
};
pub use transport::{BroadcastHub, ChannelTransport, TransportConfig, TransportError};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_peer::{WebRtcPeer, WebRtcPeerConfig, WebRtcPeerFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig};
    pub use crate::identity::{PeerIdentity, StaffId};
    pub use crate::loopback::LoopbackPeerFactory;
    pub use crate::media::{MediaDevices, MediaStream, SyntheticDevices};
    pub use crate::peer::{PeerConnection, PeerConnectionFactory};
    pub use crate::signaling::{SignalEnvelope, SignalPayload, SignalingHandler, SignalingTransport};
    pub use crate::transport::{BroadcastHub, ChannelTransport, TransportConfig};
    pub use crate::types::{
        CallEvent, CallId, CallPhase, CallState, CallType, EndReason, MediaConstraints,
        RejectReason,
    };
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_peer::{WebRtcPeerConfig, WebRtcPeerFactory};
}
