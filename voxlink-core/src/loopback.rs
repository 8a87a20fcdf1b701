//! In-process implementations of every external seam
//!
//! - [`MemoryRelay`] routes signaling between transports in the same
//!   process and delivers only to connected peers.
//! - [`LoopbackPeerFactory`] hands out [`LoopbackPeer`]s that follow the
//!   offer/answer state machine, describe their senders in SDP and
//!   simulate connectivity once negotiation completes.
//! - [`SyntheticCapture`] produces [`SyntheticTrack`]s with no device
//!   behind them.
//!
//! Every piece supports fault injection so recovery paths can be driven
//! deterministically.

use crate::config::IceConfig;
use crate::identity::PeerIdentityString;
use crate::media::{
    AudioConstraints, CaptureError, MediaCapture, MediaStream, MediaTrack, TrackKind, TrackState,
};
use crate::peer::{PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, RtcPeer};
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::types::{
    IceCandidateInit, IceConnectionState, NetworkPath, PeerConnectionState, SdpKind,
    SessionDescription, SignalingState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A track with no device behind it
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
    state: Mutex<TrackState>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SyntheticTrack {
    /// Live, enabled audio track
    pub fn audio(id: impl Into<String>) -> Self {
        Self::with_kind(id, TrackKind::Audio)
    }

    /// Live, enabled video track
    pub fn video(id: impl Into<String>) -> Self {
        Self::with_kind(id, TrackKind::Video)
    }

    fn with_kind(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: Mutex::new(TrackState::Live),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// End the track as if its source went away
    pub fn end(&self) {
        *self.state.lock() = TrackState::Ended;
    }

    /// Whether [`MediaTrack::stop`] was called
    #[must_use]
    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn state(&self) -> TrackState {
        *self.state.lock()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.end();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture adapter producing one synthetic audio track per capture
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    failures: Mutex<VecDeque<CaptureError>>,
    captures: AtomicUsize,
    last_constraints: Mutex<Option<AudioConstraints>>,
    streams: Mutex<Vec<(MediaStream, Vec<Arc<SyntheticTrack>>)>>,
}

impl SyntheticCapture {
    /// Capture adapter that always succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next capture with `error`; calls queue up
    pub fn fail_next(&self, error: CaptureError) {
        self.failures.lock().push_back(error);
    }

    /// Number of capture attempts so far
    #[must_use]
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Constraints of the most recent attempt
    #[must_use]
    pub fn last_constraints(&self) -> Option<AudioConstraints> {
        self.last_constraints.lock().clone()
    }

    /// Most recently captured stream
    #[must_use]
    pub fn last_stream(&self) -> Option<MediaStream> {
        self.streams.lock().last().map(|(s, _)| s.clone())
    }

    /// Tracks of the most recently captured stream
    #[must_use]
    pub fn last_tracks(&self) -> Vec<Arc<SyntheticTrack>> {
        self.streams
            .lock()
            .last()
            .map(|(_, t)| t.clone())
            .unwrap_or_default()
    }

    /// Every track ever captured
    #[must_use]
    pub fn all_tracks(&self) -> Vec<Arc<SyntheticTrack>> {
        self.streams
            .lock()
            .iter()
            .flat_map(|(_, t)| t.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn capture(&self, constraints: &AudioConstraints) -> Result<MediaStream, CaptureError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_constraints.lock() = Some(constraints.clone());

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let track = Arc::new(SyntheticTrack::audio(format!("mic-{n}")));
        let stream = MediaStream::new(
            format!("local-{n}"),
            vec![track.clone() as Arc<dyn MediaTrack>],
        );
        self.streams.lock().push((stream.clone(), vec![track]));
        Ok(stream)
    }
}

/// In-process relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// This transport was disconnected from the relay
    #[error("Not connected to relay")]
    NotConnected,

    /// The inbound queue closed
    #[error("Relay connection closed")]
    Closed,
}

type Envelope = (PeerIdentityString, SignalingMessage);

/// A message that went through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    /// Sender
    pub from: PeerIdentityString,
    /// Addressee
    pub to: PeerIdentityString,
    /// Whether the addressee was connected
    pub delivered: bool,
    /// Payload
    pub message: SignalingMessage,
}

#[derive(Debug, Default)]
struct RelayInner {
    peers: Mutex<HashMap<String, (u64, mpsc::UnboundedSender<Envelope>)>>,
    generation: AtomicU64,
    log: Mutex<Vec<RelayedMessage>>,
}

/// In-process signaling hub
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    /// Empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a peer over a secure channel, replacing any previous connection
    pub fn connect(&self, id: impl Into<PeerIdentityString>) -> MemorySignalingTransport {
        self.attach(id.into(), true)
    }

    /// Connect a peer over a channel that reports itself as not secure
    pub fn connect_insecure(&self, id: impl Into<PeerIdentityString>) -> MemorySignalingTransport {
        self.attach(id.into(), false)
    }

    fn attach(&self, id: PeerIdentityString, secure: bool) -> MemorySignalingTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner
            .peers
            .lock()
            .insert(id.as_str().to_string(), (generation, tx));
        tracing::debug!(peer = %id, "Relay connection opened");
        MemorySignalingTransport {
            id,
            relay: self.clone(),
            generation,
            secure,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drop a peer's connection
    pub fn disconnect(&self, id: &PeerIdentityString) {
        if self.inner.peers.lock().remove(id.as_str()).is_some() {
            tracing::debug!(peer = %id, "Relay connection closed");
        }
    }

    /// Whether a peer is connected
    #[must_use]
    pub fn is_connected(&self, id: &PeerIdentityString) -> bool {
        self.inner.peers.lock().contains_key(id.as_str())
    }

    /// Every message routed so far
    #[must_use]
    pub fn log(&self) -> Vec<RelayedMessage> {
        self.inner.log.lock().clone()
    }

    /// Messages of one event type routed so far
    #[must_use]
    pub fn count_events(&self, event_name: &str) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|m| m.message.event_name() == event_name)
            .count()
    }

    fn route(&self, from: &PeerIdentityString, to: &PeerIdentityString, message: SignalingMessage) {
        let delivered = match self.inner.peers.lock().get(to.as_str()) {
            Some((_, tx)) => tx.send((from.clone(), message.clone())).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::trace!(from = %from, to = %to, event = message.event_name(), "Addressee offline, dropping");
        }
        self.inner.log.lock().push(RelayedMessage {
            from: from.clone(),
            to: to.clone(),
            delivered,
            message,
        });
    }

    fn owns(&self, id: &PeerIdentityString, generation: u64) -> bool {
        self.inner
            .peers
            .lock()
            .get(id.as_str())
            .is_some_and(|(g, _)| *g == generation)
    }
}

/// One peer's connection to a [`MemoryRelay`]
#[derive(Debug)]
pub struct MemorySignalingTransport {
    id: PeerIdentityString,
    relay: MemoryRelay,
    generation: u64,
    secure: bool,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl MemorySignalingTransport {
    /// Identity this transport is connected as
    #[must_use]
    pub fn local_id(&self) -> &PeerIdentityString {
        &self.id
    }
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    type PeerId = PeerIdentityString;
    type Error = RelayError;

    async fn send_message(
        &self,
        peer: &PeerIdentityString,
        message: SignalingMessage,
    ) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.relay.route(&self.id, peer, message);
        Ok(())
    }

    async fn receive_message(&self) -> Result<(PeerIdentityString, SignalingMessage), RelayError> {
        self.rx.lock().await.recv().await.ok_or(RelayError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.relay.owns(&self.id, self.generation)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

/// Loopback operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackOp {
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocal,
    /// `set_remote_description`
    SetRemote,
    /// `add_ice_candidate`
    AddCandidate,
    /// `restart_ice`
    RestartIce,
    /// `replace_track`
    ReplaceTrack,
}

#[derive(Debug)]
struct LoopbackState {
    signaling: SignalingState,
    ice: IceConnectionState,
    connection: PeerConnectionState,
    senders: Vec<(Arc<dyn MediaTrack>, String)>,
    remote_tracks: Vec<Arc<SyntheticTrack>>,
    local_ufrag: String,
    applied_local_ufrag: Option<String>,
    remote_ufrag: Option<String>,
    ufrag_seq: u32,
    sdp_version: u32,
    has_remote_description: bool,
    restart_requested: bool,
    restart_in_flight: bool,
    remote_candidates: usize,
    ice_restart_offers: usize,
    offers_created: usize,
    failures: Vec<LoopbackOp>,
    closed: bool,
}

/// Simulated peer connection
#[derive(Debug)]
pub struct LoopbackPeer {
    id: u64,
    supports_restart: bool,
    path: NetworkPath,
    events: PeerEventSender,
    state: Mutex<LoopbackState>,
}

impl LoopbackPeer {
    fn new(id: u64, supports_restart: bool, path: NetworkPath, events: PeerEventSender) -> Self {
        Self {
            id,
            supports_restart,
            path,
            events,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                connection: PeerConnectionState::New,
                senders: Vec::new(),
                remote_tracks: Vec::new(),
                local_ufrag: format!("lb{id:x}u0"),
                applied_local_ufrag: None,
                remote_ufrag: None,
                ufrag_seq: 0,
                sdp_version: 0,
                has_remote_description: false,
                restart_requested: false,
                restart_in_flight: false,
                remote_candidates: 0,
                ice_restart_offers: 0,
                offers_created: 0,
                failures: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Fail the next call of `op`
    pub fn fail_next(&self, op: LoopbackOp) {
        self.state.lock().failures.push(op);
    }

    /// Force the ICE state and report it
    pub fn simulate_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.events.send(PeerEvent::IceConnectionStateChange(ice));
    }

    /// Force the aggregate transport state and report it
    pub fn simulate_connection_state(&self, connection: PeerConnectionState) {
        self.state.lock().connection = connection;
        self.events
            .send(PeerEvent::ConnectionStateChange(connection));
    }

    /// Deliver an extra inbound audio track
    pub fn add_remote_track(&self, id: impl Into<String>) -> Arc<SyntheticTrack> {
        let track = Arc::new(SyntheticTrack::audio(id));
        self.state.lock().remote_tracks.push(track.clone());
        self.events.send(PeerEvent::Track(track.clone()));
        track
    }

    /// Inbound track by id
    #[must_use]
    pub fn remote_track(&self, id: &str) -> Option<Arc<SyntheticTrack>> {
        self.state
            .lock()
            .remote_tracks
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Every inbound track received so far
    #[must_use]
    pub fn remote_tracks(&self) -> Vec<Arc<SyntheticTrack>> {
        self.state.lock().remote_tracks.clone()
    }

    /// End an inbound track; returns `false` if unknown
    pub fn end_remote_track(&self, id: &str) -> bool {
        match self.remote_track(id) {
            Some(track) => {
                track.end();
                true
            }
            None => false,
        }
    }

    /// Drop inbound tracks from the receiver list
    pub fn clear_receivers(&self) {
        self.state.lock().remote_tracks.clear();
    }

    /// Ids of the tracks currently being sent
    #[must_use]
    pub fn sender_track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(t, _)| t.id().to_string())
            .collect()
    }

    /// Remote candidates added
    #[must_use]
    pub fn remote_candidate_count(&self) -> usize {
        self.state.lock().remote_candidates
    }

    /// Offers created with fresh ICE credentials
    #[must_use]
    pub fn ice_restart_offers(&self) -> usize {
        self.state.lock().ice_restart_offers
    }

    /// Offers created in total
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Whether the connection was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check(&self, state: &mut LoopbackState, op: LoopbackOp) -> Result<(), PeerError> {
        if state.closed {
            return Err(PeerError::Closed);
        }
        if let Some(pos) = state.failures.iter().position(|f| *f == op) {
            state.failures.remove(pos);
            return Err(PeerError::Backend(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn next_ufrag(&self, state: &mut LoopbackState) -> String {
        state.ufrag_seq += 1;
        format!("lb{:x}u{}", self.id, state.ufrag_seq)
    }

    fn render_sdp(&self, state: &mut LoopbackState) -> String {
        state.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\na=ice-pwd:{}pwd\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\n",
            self.id, state.sdp_version, state.local_ufrag, state.local_ufrag
        );
        for (track, stream_id) in &state.senders {
            sdp.push_str(&format!("a=msid:{} {}\r\n", stream_id, track.id()));
        }
        sdp
    }

    fn apply_remote_tracks(&self, state: &mut LoopbackState, sdp: &str, out: &mut Vec<PeerEvent>) {
        let announced: Vec<&str> = sdp
            .lines()
            .filter_map(|l| l.trim_end().strip_prefix("a=msid:"))
            .filter_map(|rest| rest.split_whitespace().nth(1))
            .collect();

        for track in &state.remote_tracks {
            if track.is_live() && !announced.contains(&track.id()) {
                track.end();
            }
        }
        for id in announced {
            let known = state
                .remote_tracks
                .iter()
                .any(|t| t.id() == id && t.is_live());
            if !known {
                let track = Arc::new(SyntheticTrack::audio(id));
                state.remote_tracks.push(track.clone());
                out.push(PeerEvent::Track(track));
            }
        }
    }

    /// Reached stable after an answer: bring connectivity up if needed
    fn on_negotiated(&self, state: &mut LoopbackState, out: &mut Vec<PeerEvent>) {
        let connected = matches!(
            state.ice,
            IceConnectionState::Connected | IceConnectionState::Completed
        );
        if connected && !state.restart_in_flight {
            return;
        }
        state.restart_in_flight = false;
        out.push(PeerEvent::IceCandidate(Some(IceCandidateInit {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(state.local_ufrag.clone()),
        })));
        out.push(PeerEvent::IceCandidate(None));

        state.ice = IceConnectionState::Checking;
        out.push(PeerEvent::IceConnectionStateChange(IceConnectionState::Checking));
        if state.connection != PeerConnectionState::Connected {
            state.connection = PeerConnectionState::Connecting;
            out.push(PeerEvent::ConnectionStateChange(
                PeerConnectionState::Connecting,
            ));
        }
        state.ice = IceConnectionState::Connected;
        out.push(PeerEvent::IceConnectionStateChange(IceConnectionState::Connected));
        if state.connection != PeerConnectionState::Connected {
            state.connection = PeerConnectionState::Connected;
            out.push(PeerEvent::ConnectionStateChange(
                PeerConnectionState::Connected,
            ));
        }
    }

    fn note_local_ufrag(state: &mut LoopbackState, sdp: &str) {
        let ufrag = sdp
            .lines()
            .find_map(|l| l.trim_end().strip_prefix("a=ice-ufrag:"))
            .map(str::to_string);
        if state.applied_local_ufrag.is_some() && state.applied_local_ufrag != ufrag {
            state.restart_in_flight = true;
        }
        state.applied_local_ufrag = ufrag;
    }

    fn set_signaling(state: &mut LoopbackState, next: SignalingState, out: &mut Vec<PeerEvent>) {
        if state.signaling != next {
            state.signaling = next;
            out.push(PeerEvent::SignalingStateChange(next));
        }
    }

    fn emit(&self, events: Vec<PeerEvent>) {
        for event in events {
            self.events.send(event);
        }
    }
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream_id: &str,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.senders.push((track, stream_id.to_string()));
        Ok(())
    }

    async fn replace_track(
        &self,
        old_track_id: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<bool, PeerError> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::ReplaceTrack)?;
        match state.senders.iter_mut().find(|(t, _)| t.id() == old_track_id) {
            Some(sender) => {
                sender.0 = track;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::CreateOffer)?;
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(PeerError::InvalidState {
                operation: "create offer",
                state: state.signaling,
            });
        }
        if ice_restart || state.restart_requested {
            state.restart_requested = false;
            let ufrag = self.next_ufrag(&mut state);
            state.local_ufrag = ufrag;
            state.ice_restart_offers += 1;
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.render_sdp(&mut state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::CreateAnswer)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState {
                operation: "create answer",
                state: state.signaling,
            });
        }
        if state.restart_in_flight {
            let ufrag = self.next_ufrag(&mut state);
            state.local_ufrag = ufrag;
        }
        Ok(SessionDescription::answer(self.render_sdp(&mut state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::SetLocal)?;
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    Self::note_local_ufrag(&mut state, &desc.sdp);
                    Self::set_signaling(&mut state, SignalingState::HaveLocalOffer, &mut events);
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    Self::note_local_ufrag(&mut state, &desc.sdp);
                    Self::set_signaling(&mut state, SignalingState::Stable, &mut events);
                    self.on_negotiated(&mut state, &mut events);
                }
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.restart_in_flight = false;
                    Self::set_signaling(&mut state, SignalingState::Stable, &mut events);
                }
                (kind, current) => {
                    tracing::debug!(peer = self.id, ?kind, ?current, "Rejected local description");
                    return Err(PeerError::InvalidState {
                        operation: "set local description",
                        state: current,
                    });
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::SetRemote)?;
            let ufrag = desc
                .sdp
                .lines()
                .find_map(|l| l.trim_end().strip_prefix("a=ice-ufrag:"))
                .map(str::to_string);
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    if ufrag.is_none() {
                        return Err(PeerError::Negotiation("offer has no ICE credentials".into()));
                    }
                    if state.remote_ufrag.is_some() && state.remote_ufrag != ufrag {
                        state.restart_in_flight = true;
                    }
                    state.remote_ufrag = ufrag;
                    state.has_remote_description = true;
                    self.apply_remote_tracks(&mut state, &desc.sdp, &mut events);
                    Self::set_signaling(&mut state, SignalingState::HaveRemoteOffer, &mut events);
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    if ufrag.is_none() {
                        return Err(PeerError::Negotiation("answer has no ICE credentials".into()));
                    }
                    state.remote_ufrag = ufrag;
                    state.has_remote_description = true;
                    self.apply_remote_tracks(&mut state, &desc.sdp, &mut events);
                    Self::set_signaling(&mut state, SignalingState::Stable, &mut events);
                    self.on_negotiated(&mut state, &mut events);
                }
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    Self::set_signaling(&mut state, SignalingState::Stable, &mut events);
                }
                (_, current) => {
                    return Err(PeerError::InvalidState {
                        operation: "set remote description",
                        state: current,
                    });
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::AddCandidate)?;
        if !state.has_remote_description {
            return Err(PeerError::InvalidState {
                operation: "add candidate",
                state: state.signaling,
            });
        }
        state.remote_candidates += 1;
        Ok(())
    }

    fn supports_ice_restart(&self) -> bool {
        self.supports_restart
    }

    async fn restart_ice(&self) -> Result<(), PeerError> {
        if !self.supports_restart {
            return Err(PeerError::Unsupported("restart_ice"));
        }
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::RestartIce)?;
            state.restart_requested = true;
        }
        self.events.send(PeerEvent::NegotiationNeeded);
        Ok(())
    }

    async fn receivers(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.state
            .lock()
            .remote_tracks
            .iter()
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    async fn selected_path(&self) -> Option<NetworkPath> {
        let state = self.state.lock();
        match state.ice {
            IceConnectionState::Connected | IceConnectionState::Completed => Some(self.path),
            _ => None,
        }
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        state.connection = PeerConnectionState::Closed;
        for track in &state.remote_tracks {
            track.end();
        }
        Ok(())
    }
}

/// Factory for [`LoopbackPeer`]s
#[derive(Debug)]
pub struct LoopbackPeerFactory {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    next_id: AtomicU64,
    ice_restart: bool,
    path: NetworkPath,
    fail_create: AtomicBool,
}

impl Default for LoopbackPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPeerFactory {
    /// Factory whose peers lack an in-place ICE restart
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ice_restart: false,
            path: NetworkPath::Direct,
            fail_create: AtomicBool::new(false),
        }
    }

    /// Give created peers an in-place ICE restart primitive
    #[must_use]
    pub fn with_ice_restart(mut self, supported: bool) -> Self {
        self.ice_restart = supported;
        self
    }

    /// Network path reported once connected
    #[must_use]
    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.path = path;
        self
    }

    /// Fail the next `create` call
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Most recently created peer
    #[must_use]
    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().last().cloned()
    }

    /// Every peer created so far
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Backend("injected create failure".to_string()));
        }
        ice.validate()
            .map_err(|e| PeerError::Backend(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(LoopbackPeer::new(id, self.ice_restart, self.path, events));
        self.peers.lock().push(peer.clone());
        tracing::debug!(peer = id, servers = ice.servers.len(), "Loopback peer created");
        Ok(peer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::CallId;

    async fn pair() -> (
        Arc<LoopbackPeer>,
        mpsc::UnboundedReceiver<PeerEvent>,
        Arc<LoopbackPeer>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let factory = LoopbackPeerFactory::new();
        let (tx_a, rx_a) = PeerEventSender::channel();
        let (tx_b, rx_b) = PeerEventSender::channel();
        factory.create(&IceConfig::default(), tx_a).await.unwrap();
        let a = factory.last_peer().unwrap();
        factory.create(&IceConfig::default(), tx_b).await.unwrap();
        let b = factory.last_peer().unwrap();
        (a, rx_a, b, rx_b)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_offer_answer_connects_and_delivers_tracks() {
        let (a, mut rx_a, b, mut rx_b) = pair().await;
        a.add_track(Arc::new(SyntheticTrack::audio("mic-a")), "local-a")
            .await
            .unwrap();

        let offer = a.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("a=msid:local-a mic-a"));
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(a.ice_connection_state(), IceConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        let b_events = drain(&mut rx_b);
        assert!(b_events
            .iter()
            .any(|e| matches!(e, PeerEvent::Track(t) if t.id() == "mic-a")));
        let a_events = drain(&mut rx_a);
        assert!(a_events
            .iter()
            .any(|e| matches!(e, PeerEvent::IceCandidate(Some(_)))));
        assert_eq!(a.selected_path().await, Some(NetworkPath::Direct));
    }

    #[tokio::test]
    async fn test_answer_rejected_without_local_offer() {
        let (a, _rx_a, _b, _rx_b) = pair().await;
        let result = a
            .set_remote_description(SessionDescription::answer("v=0\r\na=ice-ufrag:x\r\n"))
            .await;
        assert!(matches!(result, Err(PeerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_ice_restart_offer_uses_fresh_credentials() {
        let (a, _rx_a, _b, _rx_b) = pair().await;
        let first = a.create_offer(false).await.unwrap();
        let second = a.create_offer(true).await.unwrap();
        assert!(second.restarts_ice_from(&first));
        assert_eq!(a.ice_restart_offers(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let (a, _rx_a, _b, _rx_b) = pair().await;
        a.fail_next(LoopbackOp::CreateOffer);
        assert!(a.create_offer(false).await.is_err());
        assert!(a.create_offer(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollback_returns_to_stable() {
        let (a, _rx_a, _b, _rx_b) = pair().await;
        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer).await.unwrap();
        a.set_local_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .await
        .unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_relay_delivers_only_to_connected_peers() {
        let relay = MemoryRelay::new();
        let alice = relay.connect("alice");
        let bob = relay.connect("bob");
        let call_id = CallId::new();

        alice
            .send_message(&"bob".into(), SignalingMessage::End { call_id })
            .await
            .unwrap();
        let (from, message) = bob.receive_message().await.unwrap();
        assert_eq!(from.as_str(), "alice");
        assert_eq!(message, SignalingMessage::End { call_id });

        relay.disconnect(&"bob".into());
        assert!(!bob.is_connected());
        alice
            .send_message(&"bob".into(), SignalingMessage::End { call_id })
            .await
            .unwrap();
        let log = relay.log();
        assert_eq!(log.len(), 2);
        assert!(log[0].delivered);
        assert!(!log[1].delivered);

        assert_eq!(
            bob.send_message(&"alice".into(), SignalingMessage::End { call_id })
                .await,
            Err(RelayError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_transport() {
        let relay = MemoryRelay::new();
        let old = relay.connect("carol");
        let new = relay.connect("carol");
        assert!(!old.is_connected());
        assert!(new.is_connected());
        assert!(relay.connect_insecure("dave").is_connected());
        assert!(!relay.connect_insecure("erin").is_secure());
    }

    #[tokio::test]
    async fn test_capture_produces_fresh_tracks() {
        let capture = SyntheticCapture::new();
        let first = capture.capture(&AudioConstraints::default()).await.unwrap();
        let second = capture.capture(&AudioConstraints::default()).await.unwrap();
        assert_ne!(first.track_ids(), second.track_ids());
        assert_eq!(capture.all_tracks().len(), 2);
        assert_eq!(capture.last_tracks()[0].id(), "mic-2");
    }
}
