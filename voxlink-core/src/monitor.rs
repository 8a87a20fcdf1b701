//! Track liveness monitoring
//!
//! One [`HealthMonitor`] per session replaces per-track polling intervals.
//! The session's health tick hands it the current local and remote streams
//! and it reports what changed since the previous check.

use crate::media::{MediaStream, MediaTrack, TrackKind, TrackState};
use std::sync::Arc;

/// Liveness watch on a single track
#[derive(Debug)]
pub struct TrackMonitor {
    track: Arc<dyn MediaTrack>,
    last_state: TrackState,
}

impl TrackMonitor {
    /// Start watching a track from its current state
    #[must_use]
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        let last_state = track.state();
        Self { track, last_state }
    }

    /// Watched track id
    #[must_use]
    pub fn track_id(&self) -> &str {
        self.track.id()
    }

    /// Returns `true` exactly once, when the track goes from live to ended
    pub fn poll_ended(&mut self) -> bool {
        let state = self.track.state();
        let ended = self.last_state == TrackState::Live && state == TrackState::Ended;
        self.last_state = state;
        ended
    }
}

/// Recovery a health check asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    /// A remote track ended but live siblings remain; drop it from the stream
    PruneRemoteStream {
        /// Tracks that ended
        ended: Vec<String>,
    },
    /// A remote audio track ended and nothing live remains
    RecoverTrack {
        /// Tracks that ended
        ended: Vec<String>,
    },
    /// The remote stream went inactive without a track ending under watch
    RecoverStream,
    /// A local track ended unexpectedly
    RecaptureLocalAudio {
        /// Tracks that ended
        ended: Vec<String>,
    },
}

/// Per-session liveness bookkeeping
#[derive(Debug, Default)]
pub struct HealthMonitor {
    local: Vec<TrackMonitor>,
    remote: Vec<TrackMonitor>,
    remote_stream_id: Option<String>,
    remote_was_active: bool,
}

impl HealthMonitor {
    /// Empty monitor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the audio tracks of the local stream, replacing previous watches
    pub fn watch_local(&mut self, stream: &MediaStream) {
        self.local = stream
            .tracks_of(TrackKind::Audio)
            .cloned()
            .map(TrackMonitor::new)
            .collect();
    }

    /// Watch the audio tracks of the remote stream, replacing previous watches
    pub fn watch_remote(&mut self, stream: &MediaStream) {
        self.remote = stream
            .tracks_of(TrackKind::Audio)
            .cloned()
            .map(TrackMonitor::new)
            .collect();
        self.remote_stream_id = Some(stream.id().to_string());
        self.remote_was_active = true;
    }

    /// Stop watching everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of tracks under watch
    #[must_use]
    pub fn watched(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    /// Evaluate the current streams against the previous check
    pub fn check(&mut self, remote: Option<&MediaStream>) -> Vec<HealthAction> {
        let mut actions = Vec::new();

        let local_ended: Vec<String> = self
            .local
            .iter_mut()
            .filter_map(|m| m.poll_ended().then(|| m.track_id().to_string()))
            .collect();
        if !local_ended.is_empty() {
            actions.push(HealthAction::RecaptureLocalAudio { ended: local_ended });
        }

        let Some(stream) = remote else {
            return actions;
        };
        if self.remote_stream_id.as_deref() != Some(stream.id()) {
            self.watch_remote(stream);
        }

        let remote_ended: Vec<String> = self
            .remote
            .iter_mut()
            .filter_map(|m| m.poll_ended().then(|| m.track_id().to_string()))
            .collect();
        let active = stream.is_active();

        if !remote_ended.is_empty() {
            if active {
                actions.push(HealthAction::PruneRemoteStream {
                    ended: remote_ended,
                });
            } else {
                actions.push(HealthAction::RecoverTrack {
                    ended: remote_ended,
                });
            }
        } else if self.remote_was_active && !active {
            actions.push(HealthAction::RecoverStream);
        }
        self.remote_was_active = active;

        actions
    }
}
