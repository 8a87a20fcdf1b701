//! Call state machine
//!
//! A single task owns the current [`CallSession`] and consumes one queue of
//! internal events: API commands, inbound signaling, peer connection
//! callbacks, timers and the session health tick. Every state change goes
//! through [`Engine::handle_event`], so no two handlers ever interleave.
//!
//! [`CallManager`] is the cloneable handle the application holds. Each
//! public operation posts a command and waits for the engine's reply.

use crate::config::{CallManagerConfig, ConfigError};
use crate::identity::{PeerIdentity, PeerProfile};
use crate::media::{
    acquire_audio, release, set_audio_enabled, CaptureError, MediaCapture, MediaStream, TrackKind,
};
use crate::monitor::HealthMonitor;
use crate::peer::{
    ConnectivityAction, PeerConnectionFactory, PeerConnectionHandle, PeerError, PeerEvent,
    PeerEventSender,
};
use crate::presenter::{Presenter, PresenterBridge};
use crate::recovery::{ReconnectTrigger, ReconnectionBudget};
use crate::signaling::{RejectReason, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    CallDirection, CallEvent, CallId, CallSnapshot, CallState, EndReason, ErrorCategory,
    IceCandidateInit, NetworkPath, SessionDescription, SignalingState,
};
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Capacity of the call event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A session already exists
    #[error("A call is already in progress")]
    CallInProgress,

    /// Operation not valid in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(CallState),

    /// Signaling relay not connected
    #[error("Signaling transport unavailable")]
    SignalingUnavailable,

    /// Signaling relay connection is not secure
    #[error("Signaling transport is not secure")]
    InsecureTransport,

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(#[from] CaptureError),

    /// Peer connection failure
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// Signaling send failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The call manager is no longer running
    #[error("Call manager shut down")]
    Shutdown,
}

impl CallError {
    /// User-facing category, if this error is shown to the user
    #[must_use]
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::CallInProgress => Some(ErrorCategory::CallInProgress),
            Self::SignalingUnavailable | Self::Signaling(_) => {
                Some(ErrorCategory::SignalingUnavailable)
            }
            Self::InsecureTransport => Some(ErrorCategory::InsecureContext),
            Self::Media(e) => Some(e.category()),
            Self::Peer(_) => Some(ErrorCategory::Negotiation),
            Self::InvalidState(_) | Self::Config(_) | Self::Shutdown => None,
        }
    }

    fn end_reason(&self) -> EndReason {
        match self {
            Self::Media(_) => EndReason::MediaFailure,
            Self::Signaling(_) | Self::SignalingUnavailable => EndReason::SignalingLost,
            other => EndReason::SetupFailed(other.to_string()),
        }
    }
}

/// Timers armed by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    AnswerTimeout,
    RingTimeout,
    ReconnectBackoff,
    TrackGrace,
    TrackSecondLook,
}

pub(crate) enum Command<I: PeerIdentity> {
    Initiate {
        peer: I,
        profile: PeerProfile,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<CallSnapshot<I>>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub(crate) enum EngineEvent<I: PeerIdentity> {
    Command(Command<I>),
    Signal { from: I, message: SignalingMessage },
    Peer { call_id: CallId, event: PeerEvent },
    Timer { call_id: CallId, kind: TimerKind },
    HealthTick { call_id: CallId },
}

/// Scheduled work owned by a session; aborted on teardown
#[derive(Debug, Default)]
pub(crate) struct SessionTimers {
    pub(crate) call_timeout: Option<AbortHandle>,
    pub(crate) reconnect_backoff: Option<AbortHandle>,
    pub(crate) track_recovery: Option<AbortHandle>,
    pub(crate) health: Option<AbortHandle>,
}

impl SessionTimers {
    pub(crate) fn cancel(slot: &mut Option<AbortHandle>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for slot in [
            &mut self.call_timeout,
            &mut self.reconnect_backoff,
            &mut self.track_recovery,
            &mut self.health,
        ] {
            Self::cancel(slot);
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// The single call in progress
pub(crate) struct CallSession<I: PeerIdentity> {
    pub(crate) call_id: CallId,
    pub(crate) peer: I,
    pub(crate) profile: PeerProfile,
    pub(crate) direction: CallDirection,
    pub(crate) state: CallState,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) active_since: Option<Instant>,
    pub(crate) pending_offer: Option<SessionDescription>,
    pub(crate) pending_candidates: Vec<IceCandidateInit>,
    pub(crate) connection: Option<PeerConnectionHandle>,
    pub(crate) local_stream: Option<MediaStream>,
    pub(crate) muted: bool,
    pub(crate) video_enabled: bool,
    pub(crate) budget: ReconnectionBudget,
    pub(crate) monitor: HealthMonitor,
    pub(crate) timers: SessionTimers,
    pub(crate) restart_pending: bool,
    pub(crate) track_recovery_pending: bool,
    pub(crate) signaling_loss_logged: bool,
    pub(crate) network_path: Option<NetworkPath>,
    pub(crate) ticks: u64,
}

impl<I: PeerIdentity> CallSession<I> {
    fn new(
        call_id: CallId,
        peer: I,
        profile: PeerProfile,
        direction: CallDirection,
        state: CallState,
        max_attempts: u32,
    ) -> Self {
        Self {
            call_id,
            peer,
            profile,
            direction,
            state,
            started_at: None,
            active_since: None,
            pending_offer: None,
            pending_candidates: Vec::new(),
            connection: None,
            local_stream: None,
            muted: false,
            video_enabled: true,
            budget: ReconnectionBudget::new(max_attempts),
            monitor: HealthMonitor::new(),
            timers: SessionTimers::default(),
            restart_pending: false,
            track_recovery_pending: false,
            signaling_loss_logged: false,
            network_path: None,
            ticks: 0,
        }
    }

    pub(crate) fn duration_secs(&self) -> u64 {
        self.active_since
            .map(|since| since.elapsed().as_secs())
            .unwrap_or(0)
    }

    fn snapshot(&self) -> CallSnapshot<I> {
        CallSnapshot {
            call_id: self.call_id,
            peer: self.peer.clone(),
            profile: self.profile.clone(),
            direction: self.direction,
            state: self.state,
            started_at: self.started_at,
            muted: self.muted,
            reconnect_attempts: self.budget.attempts_made(),
            network_path: self.network_path,
        }
    }
}

/// Collaborators the engine is built from
pub(crate) struct EngineParts<T: SignalingTransport> {
    pub(crate) config: CallManagerConfig,
    pub(crate) signaling: Arc<SignalingHandler<T>>,
    pub(crate) factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) capture: Arc<dyn MediaCapture>,
    pub(crate) presenter: Arc<dyn Presenter>,
    pub(crate) local_profile: PeerProfile,
}

/// State machine task
pub(crate) struct Engine<T: SignalingTransport> {
    pub(crate) config: CallManagerConfig,
    pub(crate) signaling: Arc<SignalingHandler<T>>,
    pub(crate) factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) capture: Arc<dyn MediaCapture>,
    pub(crate) presenter: PresenterBridge,
    pub(crate) local_profile: PeerProfile,
    pub(crate) events: broadcast::Sender<CallEvent<T::PeerId>>,
    pub(crate) tx: mpsc::UnboundedSender<EngineEvent<T::PeerId>>,
    pub(crate) session: Option<CallSession<T::PeerId>>,
}

impl<T: SignalingTransport> Engine<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent<T::PeerId>>) {
        tracing::debug!("Call engine started");
        while let Some(event) = rx.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }
        tracing::debug!("Call engine stopped");
    }

    /// The transition function
    pub(crate) async fn handle_event(&mut self, event: EngineEvent<T::PeerId>) -> ControlFlow<()> {
        match event {
            EngineEvent::Command(command) => return self.handle_command(command).await,
            EngineEvent::Signal { from, message } => self.handle_signal(from, message).await,
            EngineEvent::Peer { call_id, event } => {
                if self.is_current(call_id) {
                    self.handle_peer_event(call_id, event).await;
                } else {
                    tracing::trace!(call_id = %call_id, "Dropping peer event for stale call");
                }
            }
            EngineEvent::Timer { call_id, kind } => {
                if self.is_current(call_id) {
                    self.handle_timer(call_id, kind).await;
                } else {
                    tracing::debug!(call_id = %call_id, ?kind, "Dropping timer for stale call");
                }
            }
            EngineEvent::HealthTick { call_id } => {
                if self.is_current(call_id) {
                    self.health_tick(call_id).await;
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: Command<T::PeerId>) -> ControlFlow<()> {
        match command {
            Command::Initiate {
                peer,
                profile,
                reply,
            } => {
                let result = self.initiate_call(peer, profile).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept_call().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                let result = self.reject_call().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                let result = self.end_call().await;
                let _ = reply.send(result);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.as_ref().map(CallSession::snapshot));
            }
            Command::Shutdown { reply } => {
                tracing::info!("Call manager shutting down");
                self.teardown(EndReason::Shutdown, true).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ---- helpers --------------------------------------------------------

    pub(crate) fn is_current(&self, call_id: CallId) -> bool {
        self.session.as_ref().is_some_and(|s| s.call_id == call_id)
    }

    pub(crate) fn emit(&self, event: CallEvent<T::PeerId>) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn notify_error(&self, call_id: Option<CallId>, category: ErrorCategory) {
        self.presenter.error(category);
        self.emit(CallEvent::Error {
            call_id,
            category,
            message: category.user_message().to_string(),
        });
    }

    pub(crate) async fn send(
        &self,
        to: &T::PeerId,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        self.signaling
            .send_message(to, message)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))
    }

    pub(crate) fn schedule(
        &self,
        call_id: CallId,
        kind: TimerKind,
        delay: Duration,
    ) -> AbortHandle {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::Timer { call_id, kind });
        })
        .abort_handle()
    }

    fn start_health_tick(&self, call_id: CallId) -> AbortHandle {
        let tx = self.tx.clone();
        let period = self.config.recovery.health_tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(EngineEvent::HealthTick { call_id }).is_err() {
                    break;
                }
            }
        })
        .abort_handle()
    }

    fn peer_events(&self, call_id: CallId) -> PeerEventSender {
        let tx = self.tx.clone();
        PeerEventSender::new(move |event| {
            let _ = tx.send(EngineEvent::Peer { call_id, event });
        })
    }

    fn announce_state(&mut self, state: CallState) {
        let (call_id, duration) = match self.session.as_mut() {
            Some(session) => {
                session.state = state;
                (Some(session.call_id), session.duration_secs())
            }
            None => (None, 0),
        };
        tracing::info!(call_id = ?call_id, state = %state, "Call state changed");
        self.presenter.status(state, duration);
        self.emit(CallEvent::StateChanged { call_id, state });
    }

    fn mark_active(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.started_at = Some(Utc::now());
            session.active_since = Some(Instant::now());
            SessionTimers::cancel(&mut session.timers.call_timeout);
        }
        self.announce_state(CallState::Active);
    }

    pub(crate) fn publish_local(&self, call_id: CallId, stream: &MediaStream) {
        if self.presenter.attach_local(stream) {
            self.emit(CallEvent::LocalStreamAttached {
                call_id,
                stream_id: stream.id().to_string(),
            });
        }
    }

    pub(crate) fn publish_remote(&self, call_id: CallId, stream: &MediaStream) {
        if self.presenter.attach_remote(stream) {
            self.emit(CallEvent::RemoteStreamAttached {
                call_id,
                stream_id: stream.id().to_string(),
                live_tracks: stream.live_tracks().count(),
            });
        }
    }

    async fn acquire_local(&mut self, call_id: CallId) -> Result<MediaStream, CallError> {
        let stream = acquire_audio(self.capture.as_ref(), &self.config.audio).await?;
        if let Some(session) = self.session.as_mut() {
            set_audio_enabled(&stream, !session.muted);
            session.local_stream = Some(stream.clone());
            session.monitor.watch_local(&stream);
        }
        self.publish_local(call_id, &stream);
        Ok(stream)
    }

    async fn open_connection(
        &self,
        call_id: CallId,
        local: &MediaStream,
    ) -> Result<PeerConnectionHandle, CallError> {
        let handle = PeerConnectionHandle::open(
            self.factory.as_ref(),
            &self.config.ice,
            call_id,
            Some(local),
            self.peer_events(call_id),
        )
        .await?;
        Ok(handle)
    }

    /// Release everything the session holds and return to idle
    pub(crate) async fn teardown(&mut self, reason: EndReason, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let call_id = session.call_id;
        session.timers.cancel_all();
        tracing::info!(call_id = %call_id, peer = %session.peer, reason = ?reason, "Ending call");

        if notify_peer {
            if let Err(e) = self.send(&session.peer, SignalingMessage::End { call_id }).await {
                tracing::warn!(call_id = %call_id, error = %e, "Could not notify peer of call end");
            }
        }
        if let Some(mut connection) = session.connection.take() {
            connection.close().await;
        }
        if let Some(local) = session.local_stream.take() {
            release(&local);
        }
        session.monitor.clear();
        self.presenter.detach();

        self.presenter.status(CallState::Ended, session.duration_secs());
        self.emit(CallEvent::StateChanged {
            call_id: Some(call_id),
            state: CallState::Ended,
        });
        self.emit(CallEvent::CallEnded { call_id, reason });
        self.presenter.status(CallState::Idle, 0);
        self.emit(CallEvent::StateChanged {
            call_id: None,
            state: CallState::Idle,
        });
    }

    // ---- public operations ----------------------------------------------

    async fn initiate_call(
        &mut self,
        peer: T::PeerId,
        profile: PeerProfile,
    ) -> Result<CallId, CallError> {
        if let Some(session) = &self.session {
            tracing::warn!(call_id = %session.call_id, "Call already in progress");
            self.notify_error(Some(session.call_id), ErrorCategory::CallInProgress);
            return Err(CallError::CallInProgress);
        }
        if !self.signaling.is_connected() {
            tracing::warn!(peer = %peer, "Signaling unavailable, refusing to call");
            self.notify_error(None, ErrorCategory::SignalingUnavailable);
            return Err(CallError::SignalingUnavailable);
        }
        if self.config.require_secure_transport && !self.signaling.is_secure() {
            tracing::warn!(peer = %peer, "Signaling transport not secure, refusing to call");
            self.notify_error(None, ErrorCategory::InsecureContext);
            return Err(CallError::InsecureTransport);
        }

        let call_id = CallId::new();
        tracing::info!(call_id = %call_id, peer = %peer, "Initiating call");
        let mut session = CallSession::new(
            call_id,
            peer.clone(),
            profile,
            CallDirection::Outgoing,
            CallState::Calling,
            self.config.recovery.max_reconnect_attempts,
        );
        session.timers.health = Some(self.start_health_tick(call_id));
        self.session = Some(session);
        self.announce_state(CallState::Calling);

        if let Err(e) = self.setup_outgoing(call_id, &peer).await {
            tracing::error!(call_id = %call_id, error = %e, "Call setup failed");
            if let Some(category) = e.category() {
                self.notify_error(Some(call_id), category);
            }
            self.teardown(e.end_reason(), false).await;
            return Err(e);
        }

        let timer = self.schedule(call_id, TimerKind::AnswerTimeout, self.config.answer_timeout);
        if let Some(session) = self.session.as_mut() {
            session.timers.call_timeout = Some(timer);
        }
        Ok(call_id)
    }

    async fn setup_outgoing(&mut self, call_id: CallId, peer: &T::PeerId) -> Result<(), CallError> {
        let local = self.acquire_local(call_id).await?;
        let handle = self.open_connection(call_id, &local).await?;
        let offer = handle.local_offer(false).await;
        if let Some(session) = self.session.as_mut() {
            session.connection = Some(handle);
        }
        let offer = offer?;
        self.send(
            peer,
            SignalingMessage::Invite {
                call_id,
                offer,
                caller: Some(self.local_profile.clone()),
            },
        )
        .await
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        let (call_id, peer) = match &self.session {
            Some(s) if s.state == CallState::Ringing => (s.call_id, s.peer.clone()),
            Some(s) => return Err(CallError::InvalidState(s.state)),
            None => return Err(CallError::InvalidState(CallState::Idle)),
        };
        tracing::info!(call_id = %call_id, peer = %peer, "Accepting call");

        if let Err(e) = self.setup_incoming(call_id, &peer).await {
            tracing::error!(call_id = %call_id, error = %e, "Accepting call failed");
            if let Some(category) = e.category() {
                self.notify_error(Some(call_id), category);
            }
            self.teardown(e.end_reason(), true).await;
            return Err(e);
        }

        if let Some(session) = self.session.as_mut() {
            session.budget.reset();
        }
        self.mark_active();
        Ok(())
    }

    async fn setup_incoming(&mut self, call_id: CallId, peer: &T::PeerId) -> Result<(), CallError> {
        let (offer, buffered) = match self.session.as_mut() {
            Some(session) => (
                session.pending_offer.take(),
                std::mem::take(&mut session.pending_candidates),
            ),
            None => (None, Vec::new()),
        };
        let offer = offer.ok_or(CallError::InvalidState(CallState::Ringing))?;

        let local = self.acquire_local(call_id).await?;
        let mut handle = self.open_connection(call_id, &local).await?;
        for candidate in buffered {
            handle.add_remote_candidate(candidate).await;
        }
        let answer = handle.answer_offer(offer).await;
        if let Some(session) = self.session.as_mut() {
            session.connection = Some(handle);
        }
        let answer = answer?;
        self.send(peer, SignalingMessage::AcceptAnswer { call_id, answer })
            .await
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        let (call_id, peer) = match &self.session {
            Some(s) if s.state == CallState::Ringing => (s.call_id, s.peer.clone()),
            Some(s) => return Err(CallError::InvalidState(s.state)),
            None => return Err(CallError::InvalidState(CallState::Idle)),
        };
        tracing::info!(call_id = %call_id, peer = %peer, "Rejecting call");
        let reject = SignalingMessage::Reject {
            call_id,
            reason: RejectReason::Declined,
        };
        if let Err(e) = self.send(&peer, reject).await {
            tracing::warn!(call_id = %call_id, error = %e, "Could not deliver rejection");
        }
        self.teardown(EndReason::Rejected, false).await;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        if self.session.is_none() {
            tracing::debug!("End requested with no call in progress");
            return Ok(());
        }
        self.teardown(EndReason::LocalHangup, true).await;
        Ok(())
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CallError::InvalidState(CallState::Idle))?;
        session.muted = !session.muted;
        if let Some(stream) = &session.local_stream {
            set_audio_enabled(stream, !session.muted);
        }
        tracing::info!(call_id = %session.call_id, muted = session.muted, "Mute toggled");
        Ok(session.muted)
    }

    fn toggle_video(&mut self) -> Result<bool, CallError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CallError::InvalidState(CallState::Idle))?;
        session.video_enabled = !session.video_enabled;
        if let Some(stream) = &session.local_stream {
            for track in stream.tracks_of(TrackKind::Video) {
                track.set_enabled(session.video_enabled);
            }
        }
        tracing::debug!(call_id = %session.call_id, enabled = session.video_enabled, "Video toggled");
        Ok(session.video_enabled)
    }

    // ---- inbound signaling ----------------------------------------------

    async fn handle_signal(&mut self, from: T::PeerId, message: SignalingMessage) {
        if let Err(e) = message.validate() {
            tracing::warn!(peer = %from, event = message.event_name(), error = %e, "Dropping malformed signaling message");
            return;
        }
        let message = match message {
            SignalingMessage::Invite {
                call_id,
                offer,
                caller,
            } => {
                self.on_invite(from, call_id, offer, caller).await;
                return;
            }
            other => other,
        };

        let call_id = message.call_id();
        match &self.session {
            None => {
                tracing::debug!(call_id = %call_id, event = message.event_name(), "No call in progress, ignoring");
                return;
            }
            Some(s) if s.call_id != call_id || s.peer != from => {
                tracing::debug!(call_id = %call_id, event = message.event_name(), "Stale signaling message, ignoring");
                return;
            }
            Some(_) => {}
        }

        match message {
            SignalingMessage::AcceptAnswer { answer, .. } => self.on_answer(call_id, answer).await,
            SignalingMessage::Reject { reason, .. } => self.on_reject(call_id, reason).await,
            SignalingMessage::End { .. } => {
                tracing::info!(call_id = %call_id, "Peer ended the call");
                self.teardown(EndReason::RemoteHangup, false).await;
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            SignalingMessage::RestartOffer { sdp, .. } => {
                self.on_remote_offer(call_id, sdp, true).await;
            }
            SignalingMessage::RenegotiateOffer { offer, .. } => {
                self.on_remote_offer(call_id, offer, false).await;
            }
            SignalingMessage::RestartAnswer { sdp, .. } => {
                self.on_remote_answer(call_id, sdp, true).await;
            }
            SignalingMessage::RenegotiateAnswer { answer, .. } => {
                self.on_remote_answer(call_id, answer, false).await;
            }
            SignalingMessage::Invite { .. } => {}
        }
    }

    async fn on_invite(
        &mut self,
        from: T::PeerId,
        call_id: CallId,
        offer: SessionDescription,
        caller: Option<PeerProfile>,
    ) {
        match &self.session {
            Some(s) if s.call_id == call_id => {
                tracing::debug!(call_id = %call_id, "Duplicate invitation, ignoring");
                return;
            }
            Some(s) => {
                tracing::info!(
                    call_id = %call_id,
                    peer = %from,
                    current = %s.call_id,
                    "Invitation while in a call, answering busy"
                );
                let busy = SignalingMessage::Reject {
                    call_id,
                    reason: RejectReason::Busy,
                };
                if let Err(e) = self.send(&from, busy).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Could not send busy rejection");
                }
                return;
            }
            None => {}
        }

        tracing::info!(call_id = %call_id, peer = %from, "Incoming call");
        let mut session = CallSession::new(
            call_id,
            from.clone(),
            caller.clone().unwrap_or_default(),
            CallDirection::Incoming,
            CallState::Ringing,
            self.config.recovery.max_reconnect_attempts,
        );
        session.pending_offer = Some(offer);
        session.timers.call_timeout =
            Some(self.schedule(call_id, TimerKind::RingTimeout, self.config.ring_timeout));
        session.timers.health = Some(self.start_health_tick(call_id));
        self.session = Some(session);

        self.presenter.incoming(&from.to_string(), caller.as_ref());
        self.emit(CallEvent::IncomingCall {
            call_id,
            caller: from,
            profile: caller,
        });
        self.announce_state(CallState::Ringing);
    }

    async fn on_answer(&mut self, call_id: CallId, answer: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != CallState::Calling {
            tracing::debug!(call_id = %call_id, state = %session.state, "Answer outside calling state, ignoring");
            return;
        }
        let Some(connection) = session.connection.as_mut() else {
            tracing::debug!(call_id = %call_id, "Answer without peer connection, ignoring");
            return;
        };
        if let Err(e) = connection.apply_answer(answer).await {
            tracing::warn!(call_id = %call_id, error = %e, "Dropping answer");
            return;
        }
        session.budget.reset();
        tracing::debug!(call_id = %call_id, "Answer applied");
        self.mark_active();
    }

    async fn on_reject(&mut self, call_id: CallId, reason: RejectReason) {
        let state = self.session.as_ref().map(|s| s.state);
        if state != Some(CallState::Calling) {
            tracing::debug!(call_id = %call_id, ?state, "Rejection outside calling state, ignoring");
            return;
        }
        let (category, end) = match reason {
            RejectReason::Declined => (ErrorCategory::Declined, EndReason::Declined),
            RejectReason::Busy => (ErrorCategory::Busy, EndReason::Busy),
        };
        tracing::info!(call_id = %call_id, ?reason, "Call rejected by peer");
        self.notify_error(Some(call_id), category);
        self.teardown(end, false).await;
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.connection.as_mut() {
            Some(connection) => connection.add_remote_candidate(candidate).await,
            None if session.state == CallState::Ringing => {
                tracing::trace!(call_id = %session.call_id, "Buffering candidate while ringing");
                session.pending_candidates.push(candidate);
            }
            None => {
                tracing::debug!(call_id = %session.call_id, "Candidate without peer connection, ignoring");
            }
        }
    }

    async fn on_remote_offer(&mut self, call_id: CallId, offer: SessionDescription, restart: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let polite = session.direction == CallDirection::Incoming;
        let Some(connection) = session.connection.as_mut() else {
            tracing::debug!(call_id = %call_id, restart, "Offer without peer connection, ignoring");
            return;
        };

        if connection.signaling_state() == SignalingState::HaveLocalOffer {
            if !polite {
                tracing::warn!(call_id = %call_id, restart, "Offer collision, keeping our offer");
                return;
            }
            tracing::debug!(call_id = %call_id, restart, "Offer collision, rolling back our offer");
            if let Err(e) = connection.rollback().await {
                tracing::warn!(call_id = %call_id, error = %e, "Rollback failed, dropping offer");
                return;
            }
            session.restart_pending = false;
        }

        let answer = match connection.answer_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(call_id = %call_id, restart, error = %e, "Dropping remote offer");
                return;
            }
        };
        let peer = session.peer.clone();
        let reply = if restart {
            SignalingMessage::RestartAnswer {
                call_id,
                sdp: answer,
            }
        } else {
            SignalingMessage::RenegotiateAnswer { call_id, answer }
        };
        if let Err(e) = self.send(&peer, reply).await {
            tracing::warn!(call_id = %call_id, error = %e, "Could not send answer");
        }
    }

    async fn on_remote_answer(
        &mut self,
        call_id: CallId,
        answer: SessionDescription,
        restart: bool,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(connection) = session.connection.as_mut() else {
            tracing::debug!(call_id = %call_id, restart, "Answer without peer connection, ignoring");
            return;
        };
        if let Err(e) = connection.apply_answer(answer).await {
            tracing::warn!(call_id = %call_id, restart, error = %e, "Dropping answer");
            return;
        }
        if restart {
            session.restart_pending = false;
        }
        tracing::debug!(call_id = %call_id, restart, "Renegotiation complete");
    }

    // ---- peer connection callbacks --------------------------------------

    async fn handle_peer_event(&mut self, call_id: CallId, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(Some(candidate)) => {
                let Some(peer) = self.session.as_ref().map(|s| s.peer.clone()) else {
                    return;
                };
                tracing::trace!(call_id = %call_id, "Forwarding local candidate");
                let message = SignalingMessage::IceCandidate { call_id, candidate };
                if let Err(e) = self.send(&peer, message).await {
                    tracing::debug!(call_id = %call_id, error = %e, "Could not forward candidate");
                }
            }
            PeerEvent::IceCandidate(None) => {
                tracing::debug!(call_id = %call_id, "Candidate gathering complete");
            }
            PeerEvent::IceConnectionStateChange(state) => {
                tracing::debug!(call_id = %call_id, ?state, "ICE connection state changed");
                self.on_connectivity(call_id, ConnectivityAction::classify(state))
                    .await;
            }
            PeerEvent::ConnectionStateChange(state) => {
                tracing::debug!(call_id = %call_id, ?state, "Connection state changed");
            }
            PeerEvent::SignalingStateChange(state) => {
                tracing::debug!(call_id = %call_id, ?state, "Signaling state changed");
                let deferred = self.session.as_ref().is_some_and(|s| s.restart_pending);
                if state == SignalingState::Stable && deferred {
                    tracing::debug!(call_id = %call_id, "Signaling stable, sending deferred restart offer");
                    self.on_negotiation_needed(call_id).await;
                }
            }
            PeerEvent::Track(track) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let Some(connection) = session.connection.as_mut() else {
                    return;
                };
                tracing::debug!(call_id = %call_id, track = track.id(), "Remote track received");
                let stream = connection.on_remote_track(track);
                session.monitor.watch_remote(&stream);
                self.publish_remote(call_id, &stream);
            }
            PeerEvent::NegotiationNeeded => self.on_negotiation_needed(call_id).await,
        }
    }

    async fn on_connectivity(&mut self, call_id: CallId, action: ConnectivityAction) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match action {
            ConnectivityAction::InspectPath => {
                SessionTimers::cancel(&mut session.timers.reconnect_backoff);
                if session.network_path.is_some() {
                    return;
                }
                let Some(connection) = session.connection.as_ref() else {
                    return;
                };
                if let Some(path) = connection.selected_path().await {
                    session.network_path = Some(path);
                    tracing::info!(call_id = %call_id, path = %path, "Network path detected");
                    self.emit(CallEvent::NetworkPathDetected { call_id, path });
                }
            }
            ConnectivityAction::Reconnect | ConnectivityAction::Restart => {
                if session.state != CallState::Active {
                    tracing::debug!(call_id = %call_id, state = %session.state, "Connectivity loss before call is active, ignoring");
                    return;
                }
                let trigger = if action == ConnectivityAction::Restart {
                    ReconnectTrigger::Failed
                } else {
                    ReconnectTrigger::Disconnected
                };
                self.attempt_reconnection(call_id, trigger).await;
            }
            ConnectivityAction::None => {}
        }
    }

    // ---- timers ---------------------------------------------------------

    async fn handle_timer(&mut self, call_id: CallId, kind: TimerKind) {
        let state = self.session.as_ref().map(|s| s.state);
        match kind {
            TimerKind::AnswerTimeout => {
                if state == Some(CallState::Calling) {
                    tracing::info!(call_id = %call_id, "No answer");
                    self.notify_error(Some(call_id), ErrorCategory::NoAnswer);
                    self.teardown(EndReason::NoAnswer, true).await;
                }
            }
            TimerKind::RingTimeout => {
                if state == Some(CallState::Ringing) {
                    tracing::info!(call_id = %call_id, "Missed call");
                    self.teardown(EndReason::Missed, false).await;
                }
            }
            TimerKind::ReconnectBackoff => self.on_reconnect_backoff(call_id).await,
            TimerKind::TrackGrace => self.on_track_grace(call_id).await,
            TimerKind::TrackSecondLook => self.on_track_second_look(call_id).await,
        }
    }

    async fn health_tick(&mut self, call_id: CallId) {
        let signaling_up = self.signaling.is_connected();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.ticks += 1;

        match session.state {
            CallState::Calling | CallState::Ringing => {
                if !signaling_up {
                    tracing::warn!(call_id = %call_id, "Signaling lost before call was established");
                    self.notify_error(Some(call_id), ErrorCategory::SignalingUnavailable);
                    self.teardown(EndReason::SignalingLost, false).await;
                }
            }
            CallState::Active => {
                if !signaling_up && !session.signaling_loss_logged {
                    tracing::warn!(call_id = %call_id, "Signaling lost during call, relying on connection recovery");
                    session.signaling_loss_logged = true;
                } else if signaling_up && session.signaling_loss_logged {
                    tracing::info!(call_id = %call_id, "Signaling restored");
                    session.signaling_loss_logged = false;
                }

                let seconds = session.duration_secs();
                let remote_live = session
                    .connection
                    .as_ref()
                    .and_then(PeerConnectionHandle::remote_stream)
                    .is_some_and(MediaStream::is_active);
                let track_check = session.ticks % self.config.recovery.ticks_per_track_check() == 0;

                self.presenter.status(CallState::Active, seconds);
                self.emit(CallEvent::Duration { call_id, seconds });
                if remote_live && self.presenter.playback_paused() {
                    tracing::debug!(call_id = %call_id, "Remote playback paused, resuming");
                    self.presenter.resume_playback();
                }
                if track_check {
                    self.run_track_check(call_id).await;
                }
            }
            CallState::Idle | CallState::Ended => {}
        }
    }
}

/// Feeds inbound signaling into a running engine
pub(crate) struct SignalSink<I: PeerIdentity> {
    tx: mpsc::UnboundedSender<EngineEvent<I>>,
}

impl<I: PeerIdentity> SignalSink<I> {
    /// Returns `false` once the engine has stopped
    pub(crate) fn deliver(&self, from: I, message: SignalingMessage) -> bool {
        self.tx.send(EngineEvent::Signal { from, message }).is_ok()
    }
}

struct ManagerInner<I: PeerIdentity> {
    tx: mpsc::UnboundedSender<EngineEvent<I>>,
    events: broadcast::Sender<CallEvent<I>>,
    pump: parking_lot::Mutex<Option<AbortHandle>>,
}

impl<I: PeerIdentity> Drop for ManagerInner<I> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let _ = self
            .tx
            .send(EngineEvent::Command(Command::Shutdown { reply: None }));
    }
}

/// Handle to the call state machine
pub struct CallManager<I: PeerIdentity> {
    inner: Arc<ManagerInner<I>>,
}

impl<I: PeerIdentity> Clone for CallManager<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: PeerIdentity> CallManager<I> {
    /// Spawn the engine task; must run inside a tokio runtime
    pub(crate) fn spawn<T>(parts: EngineParts<T>) -> (Self, SignalSink<I>)
    where
        T: SignalingTransport<PeerId = I>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Engine {
            config: parts.config,
            signaling: parts.signaling,
            factory: parts.factory,
            capture: parts.capture,
            presenter: PresenterBridge::new(parts.presenter),
            local_profile: parts.local_profile,
            events: events.clone(),
            tx: tx.clone(),
            session: None,
        };
        tokio::spawn(engine.run(rx));

        let sink = SignalSink { tx: tx.clone() };
        let manager = Self {
            inner: Arc::new(ManagerInner {
                tx,
                events,
                pump: parking_lot::Mutex::new(None),
            }),
        };
        (manager, sink)
    }

    pub(crate) fn set_pump(&self, pump: AbortHandle) {
        *self.inner.pump.lock() = Some(pump);
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command<I>,
    ) -> Result<R, CallError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(EngineEvent::Command(make(reply)))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }

    /// Place a call
    ///
    /// Failures are also reported to the presenter and leave the manager idle.
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, signaling is unavailable or
    /// insecure, or setup fails
    #[tracing::instrument(skip_all, fields(peer = %peer))]
    pub async fn initiate_call(&self, peer: I, profile: PeerProfile) -> Result<CallId, CallError> {
        self.request(|reply| Command::Initiate {
            peer,
            profile,
            reply,
        })
        .await?
    }

    /// Accept the ringing invitation
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when nothing is ringing, or the setup failure
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    /// Decline the ringing invitation
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when nothing is ringing
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// End the current call; a no-op when idle
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` if the manager is no longer running
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Flip local audio mute, returning the new muted flag
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when idle
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    /// Flip local video, returning the new enabled flag
    ///
    /// Calls are audio-only, so this has no negotiation effect.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when idle
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    /// Current call, if any
    pub async fn current_call(&self) -> Option<CallSnapshot<I>> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .ok()
            .flatten()
    }

    /// Current call state
    pub async fn state(&self) -> CallState {
        self.current_call()
            .await
            .map_or(CallState::Idle, |s| s.state)
    }

    /// Feed an inbound signaling message, for applications running their own receive loop
    pub fn deliver_signal(&self, from: I, message: SignalingMessage) {
        let _ = self.inner.tx.send(EngineEvent::Signal { from, message });
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.inner.events.subscribe()
    }

    /// End any call, notify the peer and stop the engine
    pub async fn shutdown(&self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        let _ = self
            .request(|reply| Command::Shutdown { reply: Some(reply) })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            CallError::Media(CaptureError::PermissionDenied).category(),
            Some(ErrorCategory::PermissionDenied)
        );
        assert_eq!(
            CallError::InsecureTransport.category(),
            Some(ErrorCategory::InsecureContext)
        );
        assert_eq!(
            CallError::Peer(PeerError::Closed).category(),
            Some(ErrorCategory::Negotiation)
        );
        assert_eq!(CallError::InvalidState(CallState::Idle).category(), None);
    }

    #[test]
    fn test_setup_failures_map_to_end_reasons() {
        assert_eq!(
            CallError::Media(CaptureError::DeviceBusy("x".into())).end_reason(),
            EndReason::MediaFailure
        );
        assert_eq!(
            CallError::Signaling("down".into()).end_reason(),
            EndReason::SignalingLost
        );
        assert!(matches!(
            CallError::Peer(PeerError::Closed).end_reason(),
            EndReason::SetupFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_session_timers_abort_on_drop() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let mut timers = SessionTimers::default();
        timers.call_timeout = Some(task.abort_handle());
        drop(timers);
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
