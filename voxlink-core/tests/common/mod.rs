//! Shared harness for the call integration tests
//!
//! Every participant gets its own loopback peer factory, synthetic microphone
//! and recording presenter, all meeting on one in-process relay.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use voxlink_core::loopback::{LoopbackPeer, LoopbackPeerFactory, MemoryRelay, SyntheticCapture};
use voxlink_core::{
    CallEvent, CallId, CallManager, CallManagerConfig, CallServiceBuilder, CallState,
    ErrorCategory, MediaStream, PeerIdentityString, PeerProfile, Presenter,
};

pub type Events = broadcast::Receiver<CallEvent<PeerIdentityString>>;

/// Presenter that remembers every call it receives
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    statuses: Mutex<Vec<(CallState, u64)>>,
    errors: Mutex<Vec<ErrorCategory>>,
    local_attaches: Mutex<Vec<String>>,
    remote_attaches: Mutex<Vec<(String, usize)>>,
    incoming: Mutex<Vec<(String, Option<PeerProfile>)>>,
    playback_paused: AtomicBool,
    resumes: AtomicUsize,
    detaches: AtomicUsize,
}

impl RecordingPresenter {
    pub fn statuses(&self) -> Vec<(CallState, u64)> {
        self.statuses.lock().clone()
    }

    pub fn errors(&self) -> Vec<ErrorCategory> {
        self.errors.lock().clone()
    }

    pub fn error_count(&self, category: ErrorCategory) -> usize {
        self.errors.lock().iter().filter(|c| **c == category).count()
    }

    pub fn local_attaches(&self) -> Vec<String> {
        self.local_attaches.lock().clone()
    }

    pub fn remote_attaches(&self) -> Vec<(String, usize)> {
        self.remote_attaches.lock().clone()
    }

    pub fn incoming(&self) -> Vec<(String, Option<PeerProfile>)> {
        self.incoming.lock().clone()
    }

    pub fn pause_playback(&self) {
        self.playback_paused.store(true, Ordering::SeqCst);
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl Presenter for RecordingPresenter {
    fn attach_local_stream(&self, stream: &MediaStream) {
        self.local_attaches.lock().push(stream.id().to_string());
    }

    fn attach_remote_stream(&self, stream: &MediaStream) {
        self.remote_attaches
            .lock()
            .push((stream.id().to_string(), stream.live_tracks().count()));
    }

    fn on_call_status_changed(&self, state: CallState, duration_secs: u64) {
        self.statuses.lock().push((state, duration_secs));
    }

    fn on_error(&self, category: ErrorCategory, _message: &str) {
        self.errors.lock().push(category);
    }

    fn on_incoming_call(&self, caller: &str, profile: Option<&PeerProfile>) {
        self.incoming
            .lock()
            .push((caller.to_string(), profile.cloned()));
    }

    fn is_playback_paused(&self) -> bool {
        self.playback_paused.load(Ordering::SeqCst)
    }

    fn resume_playback(&self) {
        self.playback_paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn detach_streams(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

/// One side of a call
pub struct Participant {
    pub id: PeerIdentityString,
    pub manager: CallManager<PeerIdentityString>,
    pub factory: Arc<LoopbackPeerFactory>,
    pub capture: Arc<SyntheticCapture>,
    pub presenter: Arc<RecordingPresenter>,
    pub events: Events,
}

impl Participant {
    pub async fn join(relay: &MemoryRelay, name: &str) -> Self {
        Self::join_with(relay, name, CallManagerConfig::default(), LoopbackPeerFactory::new())
            .await
    }

    pub async fn join_with(
        relay: &MemoryRelay,
        name: &str,
        config: CallManagerConfig,
        factory: LoopbackPeerFactory,
    ) -> Self {
        let id = PeerIdentityString::new(name);
        let factory = Arc::new(factory);
        let capture = Arc::new(SyntheticCapture::new());
        let presenter = Arc::new(RecordingPresenter::default());
        let manager = CallServiceBuilder::new(Arc::new(relay.connect(id.clone())))
            .with_config(config)
            .with_peer_factory(factory.clone())
            .with_capture(capture.clone())
            .with_presenter(presenter.clone())
            .with_local_profile(PeerProfile::named(capitalize(name)))
            .build()
            .await
            .unwrap();
        let events = manager.subscribe_events();
        Self {
            id,
            manager,
            factory,
            capture,
            presenter,
            events,
        }
    }

    /// Loopback peer of the current (or last) call
    pub fn peer(&self) -> Arc<LoopbackPeer> {
        self.factory.last_peer().expect("no peer connection was created")
    }

    pub async fn call(&self, callee: &Participant) -> CallId {
        self.manager
            .initiate_call(callee.id.clone(), PeerProfile::named(capitalize(callee.id.as_str())))
            .await
            .unwrap()
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Wait for the first event matching `pred`, skipping everything before it
pub async fn wait_for<F>(events: &mut Events, mut pred: F) -> CallEvent<PeerIdentityString>
where
    F: FnMut(&CallEvent<PeerIdentityString>) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

pub async fn wait_for_state(events: &mut Events, state: CallState) {
    wait_for(events, |e| {
        matches!(e, CallEvent::StateChanged { state: s, .. } if *s == state)
    })
    .await;
}

/// Events received so far without waiting
pub fn drain(events: &mut Events) -> Vec<CallEvent<PeerIdentityString>> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Let queued signaling and peer events run to completion
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Caller invites, callee accepts, both sides reach active
pub async fn establish(caller: &mut Participant, callee: &mut Participant) -> CallId {
    let call_id = caller.call(callee).await;
    wait_for(&mut callee.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    callee.manager.accept_call().await.unwrap();
    wait_for_state(&mut caller.events, CallState::Active).await;
    wait_for_state(&mut callee.events, CallState::Active).await;
    settle().await;
    call_id
}
