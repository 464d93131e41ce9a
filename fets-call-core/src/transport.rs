//! Realtime broadcast transport
//!
//! `BroadcastHub` is an in-process stand-in for the hosted realtime service:
//! named channels, every subscriber sees every frame, no acknowledgements.
//! Frames are JSON text in the realtime broadcast shape
//! `{"type":"broadcast","event":"video-signal","payload":{...}}`.

use crate::identity::PeerIdentity;
use crate::signaling::{SignalEnvelope, SignalingTransport, DEFAULT_CHANNEL, SIGNAL_EVENT};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Maximum frame size (64KB)
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame type tag used by the realtime service for broadcast messages
const BROADCAST_FRAME_TYPE: &str = "broadcast";

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Channel name shared by all clients
    pub channel: String,
    /// Frames buffered per subscriber before it starts lagging
    pub capacity: usize,
    /// Largest accepted frame in bytes
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            capacity: 256,
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Frame exceeds the configured size limit
    #[error("Message too large: {size} bytes exceeds {limit}")]
    MessageTooLarge {
        /// Actual size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Serialization failure
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Channel closed
    #[error("Channel closed")]
    Closed,
}

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastFrame {
    #[serde(rename = "type")]
    kind: String,
    event: String,
    payload: serde_json::Value,
}

/// In-process realtime broadcast service
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    config: TransportConfig,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Arc<str>>>>>,
}

impl BroadcastHub {
    /// Create a hub
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Hub configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Subscribe to the configured channel
    #[must_use]
    pub fn subscribe<I: PeerIdentity>(&self) -> ChannelTransport<I> {
        let channel = self.config.channel.clone();
        self.subscribe_to(&channel)
    }

    /// Subscribe to a named channel, creating it on first use
    #[must_use]
    pub fn subscribe_to<I: PeerIdentity>(&self, channel: &str) -> ChannelTransport<I> {
        let sender = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.config.capacity).0)
            .clone();
        let receiver = sender.subscribe();
        tracing::debug!(channel = %channel, subscribers = sender.receiver_count(), "Subscribed to channel");

        ChannelTransport {
            channel: channel.to_string(),
            max_message_size: self.config.max_message_size,
            hub: self.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
            closed: AtomicBool::new(false),
            _identity: PhantomData,
        }
    }

    /// Publish a raw frame on a channel, bypassing envelope encoding
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish_raw(&self, channel: &str, frame: &str) -> usize {
        self.sender(channel)
            .map_or(0, |s| s.send(Arc::from(frame)).unwrap_or(0))
    }

    fn sender(&self, channel: &str) -> Option<broadcast::Sender<Arc<str>>> {
        self.channels.lock().get(channel).cloned()
    }

    /// Shut a channel down; subscribers see it closed once they drain it
    pub fn close_channel(&self, channel: &str) -> bool {
        self.channels.lock().remove(channel).is_some()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

/// One client's subscription to a broadcast channel
pub struct ChannelTransport<I: PeerIdentity> {
    channel: String,
    max_message_size: usize,
    hub: BroadcastHub,
    receiver: tokio::sync::Mutex<broadcast::Receiver<Arc<str>>>,
    closed: AtomicBool,
    _identity: PhantomData<fn() -> I>,
}

impl<I: PeerIdentity> ChannelTransport<I> {
    /// Channel name
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn encode(&self, envelope: &SignalEnvelope<I>) -> Result<String, TransportError> {
        let frame = BroadcastFrame {
            kind: BROADCAST_FRAME_TYPE.to_string(),
            event: SIGNAL_EVENT.to_string(),
            payload: serde_json::to_value(envelope)?,
        };
        let text = serde_json::to_string(&frame)?;
        if text.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                limit: self.max_message_size,
            });
        }
        Ok(text)
    }

    fn decode(&self, text: &str) -> Option<SignalEnvelope<I>> {
        if text.len() > self.max_message_size {
            tracing::warn!(size = text.len(), "Dropping oversized frame");
            return None;
        }
        let frame: BroadcastFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                return None;
            }
        };
        if frame.kind != BROADCAST_FRAME_TYPE || frame.event != SIGNAL_EVENT {
            tracing::trace!(event = %frame.event, "Ignoring frame for another event");
            return None;
        }
        match serde_json::from_value(frame.payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable signaling payload");
                None
            }
        }
    }
}

#[async_trait]
impl<I: PeerIdentity> SignalingTransport for ChannelTransport<I> {
    type PeerId = I;
    type Error = TransportError;

    async fn publish(&self, envelope: SignalEnvelope<I>) -> Result<(), TransportError> {
        let text = self.encode(&envelope)?;
        let sender = self.hub.sender(&self.channel).ok_or_else(|| {
            self.closed.store(true, Ordering::Release);
            TransportError::Closed
        })?;
        match sender.send(Arc::from(text)) {
            Ok(subscribers) => {
                tracing::trace!(channel = %self.channel, subscribers, "Frame published");
            }
            Err(_) => {
                tracing::trace!(channel = %self.channel, "Frame published with no subscribers");
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<SignalEnvelope<I>, TransportError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(text) => {
                    if let Some(envelope) = self.decode(&text) {
                        return Ok(envelope);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "Subscriber lagged, frames lost");
                }
                Err(RecvError::Closed) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
