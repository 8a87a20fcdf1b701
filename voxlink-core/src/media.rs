//! Media capture adapter
//!
//! Tracks are shared handles (`Arc<dyn MediaTrack>`): the capture adapter
//! owns the local ones, the peer connection hands out remote ones, and a
//! [`MediaStream`] is a cheap, clonable view over a set of them.
//!
//! Muting toggles `enabled` on a track without stopping it, so liveness
//! checks keep seeing a muted track as live. [`release`] stops every track
//! and the stream must not be used afterwards.

use crate::types::ErrorCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Media capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or platform refused microphone access
    #[error("Permission denied")]
    PermissionDenied,

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device is held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// The device cannot satisfy the requested constraints
    #[error("Constraints not satisfiable: {0}")]
    ConstraintsUnsatisfiable(String),
}

impl CaptureError {
    /// User-facing category of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PermissionDenied => ErrorCategory::PermissionDenied,
            Self::DeviceNotFound(_) => ErrorCategory::DeviceNotFound,
            Self::DeviceBusy(_) => ErrorCategory::DeviceBusy,
            Self::ConstraintsUnsatisfiable(_) => ErrorCategory::ConstraintsUnsupported,
        }
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Producing (or able to produce) media
    Live,
    /// Permanently finished
    Ended,
}

/// A local or remote media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Media kind
    fn kind(&self) -> TrackKind;

    /// Current lifecycle state
    fn state(&self) -> TrackState;

    /// Whether the track is enabled (not muted)
    fn is_enabled(&self) -> bool;

    /// Enable or disable the track without ending it
    fn set_enabled(&self, enabled: bool);

    /// Permanently stop the track
    fn stop(&self);

    /// Downcast hook for backends that need their concrete track type
    fn as_any(&self) -> &dyn Any;

    /// Shorthand for `state() == Live`
    fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }
}

/// An ordered set of tracks
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.track_ids())
            .finish()
    }
}

impl MediaStream {
    /// Create a stream over the given tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Tracks of the given kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Live tracks only
    pub fn live_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.is_live())
    }

    /// A stream is active while at least one of its tracks is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// Whether the stream contains a track with this id
    #[must_use]
    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    /// Track identifiers in order
    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }
}

/// Device class used to pick capture hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Laptop/desktop
    Desktop,
    /// Phone or tablet
    Mobile,
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
    /// Preferred sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Preferred channel count
    pub channel_count: Option<u16>,
    /// Specific input device
    pub device_id: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self::for_device(DeviceClass::Desktop)
    }
}

impl AudioConstraints {
    /// Processing-enabled constraints tuned for a device class
    #[must_use]
    pub fn for_device(class: DeviceClass) -> Self {
        let (sample_rate, channel_count) = match class {
            DeviceClass::Desktop => (None, None),
            DeviceClass::Mobile => (Some(16_000), Some(1)),
        };
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate,
            channel_count,
            device_id: None,
        }
    }

    /// Bare "any microphone" constraints used as the last resort
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            sample_rate: None,
            channel_count: None,
            device_id: None,
        }
    }

    /// Whether these are already the minimal constraints
    #[must_use]
    pub fn is_minimal(&self) -> bool {
        *self == Self::minimal()
    }
}

/// Source of local audio streams
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire an audio-only stream
    ///
    /// # Errors
    ///
    /// Returns the capture failure category
    async fn capture(&self, constraints: &AudioConstraints) -> Result<MediaStream, CaptureError>;
}

/// Acquire local audio, falling back once to minimal constraints
///
/// A permission refusal is final. Every other failure is retried once with
/// [`AudioConstraints::minimal`] and the second error is returned if that
/// fails too.
///
/// # Errors
///
/// Returns the capture error that ended the attempt
#[tracing::instrument(skip(capture, constraints))]
pub async fn acquire_audio(
    capture: &dyn MediaCapture,
    constraints: &AudioConstraints,
) -> Result<MediaStream, CaptureError> {
    match capture.capture(constraints).await {
        Ok(stream) => {
            tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local audio acquired");
            Ok(stream)
        }
        Err(CaptureError::PermissionDenied) => {
            tracing::warn!("Microphone permission denied");
            Err(CaptureError::PermissionDenied)
        }
        Err(e) if constraints.is_minimal() => {
            tracing::warn!(error = %e, "Audio capture failed with minimal constraints");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Audio capture failed, retrying with minimal constraints");
            capture.capture(&AudioConstraints::minimal()).await
        }
    }
}

/// Set `enabled` on every audio track of a stream
pub fn set_audio_enabled(stream: &MediaStream, enabled: bool) {
    for track in stream.audio_tracks() {
        track.set_enabled(enabled);
    }
}

/// Stop every track of a stream
pub fn release(stream: &MediaStream) {
    for track in stream.tracks() {
        track.stop();
    }
    tracing::debug!(stream_id = %stream.id(), "Stream released");
}
