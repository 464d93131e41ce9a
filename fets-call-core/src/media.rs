//! Local and remote media handles
//!
//! A `MediaStream` is a cheap, cloneable handle: clones share the `live` and
//! `enabled` flags of every track, so stopping any clone releases the device
//! for all holders. Capture itself sits behind the `MediaDevices` trait.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform denied access to the device
    #[error("Permission denied for {0}")]
    PermissionDenied(TrackKind),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(TrackKind),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A single audio or video track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    live: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            live: Arc::new(AtomicBool::new(true)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Human readable device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the underlying device is still held
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Whether the track currently produces media (mute state)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Mute or unmute the track without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Release the device. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::AcqRel);
        if was_live {
            self.enabled.store(false, Ordering::Release);
            tracing::trace!(track_id = %self.id, kind = %self.kind, "Track stopped");
        }
        was_live
    }
}

/// A group of tracks captured or received together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Create a stream from existing tracks
    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Add a track unless one with the same id is already present
    pub fn add_track(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Iterate over tracks of the given kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    /// Stop every track. Returns the number of tracks this call released.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether every track has been released
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_live())
    }

    /// Flip the enabled flag of all tracks of `kind`, returning the new value
    ///
    /// Returns `None` when the stream has no track of that kind.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let mut result = None;
        for track in self.tracks_of(kind) {
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            result = Some(enabled);
        }
        result
    }
}

/// Access to local capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a local stream satisfying the constraints
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Software capture devices with configurable availability
///
/// Used by the CLI demo and the test-suite. Every stream handed out is kept so
/// callers can verify that it was released.
#[derive(Debug)]
pub struct SyntheticDevices {
    label: String,
    has_camera: AtomicBool,
    has_microphone: AtomicBool,
    denied: AtomicBool,
    counter: AtomicU64,
    issued: Mutex<Vec<MediaStream>>,
}

impl SyntheticDevices {
    /// Devices with a working camera and microphone
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            has_camera: AtomicBool::new(true),
            has_microphone: AtomicBool::new(true),
            denied: AtomicBool::new(false),
            counter: AtomicU64::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Devices without a camera
    #[must_use]
    pub fn without_camera(self) -> Self {
        self.has_camera.store(false, Ordering::Release);
        self
    }

    /// Make every acquisition fail with a permission error (or succeed again)
    pub fn set_permission_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::Release);
    }

    /// All streams issued so far
    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }

    /// Whether every issued stream has been released
    pub fn all_released(&self) -> bool {
        self.issued.lock().iter().all(MediaStream::is_stopped)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if self.denied.load(Ordering::Acquire) {
            let kind = if constraints.video {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            return Err(MediaError::PermissionDenied(kind));
        }
        if constraints.audio && !self.has_microphone.load(Ordering::Acquire) {
            return Err(MediaError::DeviceNotFound(TrackKind::Audio));
        }
        if constraints.video && !self.has_camera.load(Ordering::Acquire) {
            return Err(MediaError::DeviceNotFound(TrackKind::Video));
        }

        let n = self.counter.fetch_add(1, Ordering::AcqRel);
        let mut stream = MediaStream::new(format!("{}-local-{n}", self.label));
        if constraints.audio {
            stream.add_track(MediaTrack::new(
                format!("{}-audio-{n}", self.label),
                TrackKind::Audio,
                "Synthetic Microphone",
            ));
        }
        if constraints.video {
            stream.add_track(MediaTrack::new(
                format!("{}-video-{n}", self.label),
                TrackKind::Video,
                "Synthetic Camera",
            ));
        }

        tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local stream acquired");
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}
