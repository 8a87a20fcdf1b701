//! Peer connection manager
//!
//! [`RtcPeer`] is the seam over the native offer/answer connection. The
//! [`PeerConnectionHandle`] wraps one peer for the lifetime of a call: it
//! wires the local tracks in, buffers remote candidates until a remote
//! description is applied, and keeps the canonical remote stream built
//! from live inbound tracks only.

use crate::config::IceConfig;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::types::{
    CallId, IceCandidateInit, IceConnectionState, NetworkPath, PeerConnectionState, SdpKind,
    SessionDescription, SignalingState,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Operation not valid in the current signaling state
    #[error("Cannot {operation} in signaling state {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Signaling state at the time
        state: SignalingState,
    },

    /// SDP could not be produced or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The backend does not provide this primitive
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,

    /// Native backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Callback surface of a native peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was discovered, `None` once gathering is complete
    IceCandidate(Option<IceCandidateInit>),
    /// ICE connectivity changed
    IceConnectionStateChange(IceConnectionState),
    /// Aggregate transport state changed
    ConnectionStateChange(PeerConnectionState),
    /// Offer/answer state changed
    SignalingStateChange(SignalingState),
    /// A remote track arrived
    Track(Arc<dyn MediaTrack>),
    /// The connection wants a new offer (ICE restart, track changes)
    NegotiationNeeded,
}

/// Sink for [`PeerEvent`]s handed to a backend at creation time
#[derive(Clone)]
pub struct PeerEventSender {
    sink: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl std::fmt::Debug for PeerEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEventSender").finish_non_exhaustive()
    }
}

impl PeerEventSender {
    /// Forward events into a closure
    pub fn new(sink: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Sender paired with a plain receiver
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sender, rx)
    }

    /// Deliver an event
    pub fn send(&self, event: PeerEvent) {
        (self.sink)(event);
    }
}

/// Native peer-to-peer connection
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Attach an outbound track
    async fn add_track(&self, track: Arc<dyn MediaTrack>, stream_id: &str)
        -> Result<(), PeerError>;

    /// Swap the track of the sender currently carrying `old_track_id`
    ///
    /// Returns `false` when no sender carries that track.
    async fn replace_track(
        &self,
        old_track_id: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<bool, PeerError>;

    /// Generate an offer
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Add a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError>;

    /// Whether [`RtcPeer::restart_ice`] is available
    fn supports_ice_restart(&self) -> bool {
        false
    }

    /// Restart ICE in place; the backend follows up with `NegotiationNeeded`
    async fn restart_ice(&self) -> Result<(), PeerError> {
        Err(PeerError::Unsupported("restart_ice"))
    }

    /// Tracks of every active receiver
    async fn receivers(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// Classification of the nominated candidate pair, if one exists
    async fn selected_path(&self) -> Option<NetworkPath>;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Current ICE connectivity state
    fn ice_connection_state(&self) -> IceConnectionState;

    /// Current aggregate transport state
    fn connection_state(&self) -> PeerConnectionState;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates native peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection configured with the given traversal servers
    async fn create(
        &self,
        ice: &IceConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcPeer>, PeerError>;
}

/// What the state machine should do about a connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityAction {
    /// Connected; read the negotiated path once
    InspectPath,
    /// Connectivity lost; run reconnection, retry later if it errors
    Reconnect,
    /// Connectivity failed; run reconnection, give up if it errors
    Restart,
    /// Nothing to do
    None,
}

impl ConnectivityAction {
    /// Classify an ICE connectivity state
    #[must_use]
    pub fn classify(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => Self::InspectPath,
            IceConnectionState::Disconnected => Self::Reconnect,
            IceConnectionState::Failed => Self::Restart,
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {
                Self::None
            }
        }
    }
}

/// One negotiated connection for the lifetime of a call
pub struct PeerConnectionHandle {
    call_id: CallId,
    peer: Arc<dyn RtcPeer>,
    remote_stream: Option<MediaStream>,
    remote_generation: u64,
    pending_candidates: Vec<IceCandidateInit>,
    remote_description_set: bool,
    closed: bool,
}

impl std::fmt::Debug for PeerConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionHandle")
            .field("call_id", &self.call_id)
            .field("remote_stream", &self.remote_stream)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl PeerConnectionHandle {
    /// Create a connection and attach every track of the local stream
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot create the connection or
    /// refuses a track
    #[tracing::instrument(skip_all, fields(call_id = %call_id))]
    pub async fn open(
        factory: &dyn PeerConnectionFactory,
        ice: &IceConfig,
        call_id: CallId,
        local_stream: Option<&MediaStream>,
        events: PeerEventSender,
    ) -> Result<Self, PeerError> {
        let peer = factory.create(ice, events).await?;
        let handle = Self {
            call_id,
            peer,
            remote_stream: None,
            remote_generation: 0,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            closed: false,
        };

        match local_stream {
            Some(stream) => {
                for track in stream.tracks() {
                    handle.peer.add_track(track.clone(), stream.id()).await?;
                }
                tracing::debug!(tracks = stream.tracks().len(), "Local tracks attached");
            }
            None => {
                tracing::warn!("Peer connection created without a local stream");
            }
        }

        Ok(handle)
    }

    /// Call this connection belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// The native connection
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn RtcPeer> {
        &self.peer
    }

    /// Whether [`PeerConnectionHandle::close`] ran
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current offer/answer state
    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        if self.closed {
            return SignalingState::Closed;
        }
        self.peer.signaling_state()
    }

    /// Current ICE state
    #[must_use]
    pub fn ice_connection_state(&self) -> IceConnectionState {
        if self.closed {
            return IceConnectionState::Closed;
        }
        self.peer.ice_connection_state()
    }

    /// Current aggregate transport state
    #[must_use]
    pub fn connection_state(&self) -> PeerConnectionState {
        if self.closed {
            return PeerConnectionState::Closed;
        }
        self.peer.connection_state()
    }

    /// Canonical remote stream, once a remote track arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Candidates waiting for a remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Create an offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects either step
    pub async fn local_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.peer.create_offer(ice_restart).await?;
        self.peer.set_local_description(offer.clone()).await?;
        tracing::debug!(call_id = %self.call_id, ice_restart, "Local offer applied");
        Ok(offer)
    }

    /// Apply a remote offer and produce the local answer
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be applied or answered
    pub async fn answer_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.apply_remote(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        tracing::debug!(call_id = %self.call_id, "Local answer applied");
        Ok(answer)
    }

    /// Apply the remote answer to our outstanding offer
    ///
    /// # Errors
    ///
    /// Returns error if no offer is outstanding or the answer is rejected
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        let state = self.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(PeerError::InvalidState {
                operation: "apply answer",
                state,
            });
        }
        self.apply_remote(answer).await
    }

    /// Withdraw our outstanding offer
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot roll back
    pub async fn rollback(&self) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.peer
            .set_local_description(SessionDescription {
                kind: SdpKind::Rollback,
                sdp: String::new(),
            })
            .await
    }

    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.peer.set_remote_description(desc).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        tracing::debug!(call_id = %self.call_id, count = pending.len(), "Flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                tracing::warn!(call_id = %self.call_id, error = %e, "Dropping buffered candidate");
            }
        }
    }

    /// Add a remote candidate, buffering it until a remote description exists
    ///
    /// Candidates are silently discarded once the connection is closed.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if self.closed {
            tracing::trace!(call_id = %self.call_id, "Discarding candidate for closed connection");
            return;
        }
        if !self.remote_description_set {
            tracing::trace!(call_id = %self.call_id, "Buffering candidate until remote description");
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Failed to add remote candidate");
        }
    }

    /// Take a newly arrived remote track into the canonical remote stream
    ///
    /// Returns the rebuilt stream.
    pub fn on_remote_track(&mut self, track: Arc<dyn MediaTrack>) -> MediaStream {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = self
            .remote_stream
            .as_ref()
            .map(|s| {
                s.tracks()
                    .iter()
                    .filter(|t| t.id() != track.id())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tracks.push(track);
        self.rebuild_remote_stream(tracks)
    }

    /// Replace the remote stream with one holding the live subset of `tracks`
    pub fn rebuild_remote_stream(&mut self, tracks: Vec<Arc<dyn MediaTrack>>) -> MediaStream {
        self.remote_generation += 1;
        let live: Vec<Arc<dyn MediaTrack>> = tracks.into_iter().filter(|t| t.is_live()).collect();
        let stream = MediaStream::new(
            format!("remote-{}-{}", self.call_id, self.remote_generation),
            live,
        );
        tracing::debug!(
            call_id = %self.call_id,
            stream_id = %stream.id(),
            tracks = ?stream.track_ids(),
            "Remote stream rebuilt"
        );
        self.remote_stream = Some(stream.clone());
        stream
    }

    /// Rebuild the remote stream from the still-live tracks it holds
    pub fn prune_remote_stream(&mut self) -> Option<MediaStream> {
        let tracks = self.remote_stream.as_ref()?.tracks().to_vec();
        Some(self.rebuild_remote_stream(tracks))
    }

    /// Live audio tracks currently held by the connection's receivers
    pub async fn live_receiver_audio(&self) -> Vec<Arc<dyn MediaTrack>> {
        if self.closed {
            return Vec::new();
        }
        self.peer
            .receivers()
            .await
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Audio && t.is_live())
            .collect()
    }

    /// Point every sender carrying an `old` audio track at the matching `new` one
    ///
    /// Returns how many senders were switched.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails a replacement
    pub async fn replace_local_audio(
        &self,
        old: &MediaStream,
        new: &MediaStream,
    ) -> Result<usize, PeerError> {
        self.ensure_open()?;
        let mut replaced = 0;
        for (old_track, new_track) in old.audio_tracks().zip(new.audio_tracks()) {
            if self
                .peer
                .replace_track(old_track.id(), new_track.clone())
                .await?
            {
                replaced += 1;
            } else {
                tracing::warn!(
                    call_id = %self.call_id,
                    track = old_track.id(),
                    "No sender carries track, adding replacement"
                );
                self.peer.add_track(new_track.clone(), new.id()).await?;
            }
        }
        Ok(replaced)
    }

    /// Classification of the nominated candidate pair
    pub async fn selected_path(&self) -> Option<NetworkPath> {
        if self.closed {
            return None;
        }
        self.peer.selected_path().await
    }

    /// Close the connection and end every remote track
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();
        if let Some(stream) = self.remote_stream.take() {
            for track in stream.tracks() {
                track.stop();
            }
        }
        if let Err(e) = self.peer.close().await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Error closing peer connection");
        }
        tracing::debug!(call_id = %self.call_id, "Peer connection closed");
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}
