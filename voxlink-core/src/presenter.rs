//! Presentation adapter contract
//!
//! The UI renders call state and plays audio. The state machine calls into
//! it synchronously from its own task, so implementations must not block.

use crate::identity::PeerProfile;
use crate::media::MediaStream;
use crate::types::{CallState, ErrorCategory};
use parking_lot::Mutex;
use std::sync::Arc;

/// UI surface driven by the call state machine
pub trait Presenter: Send + Sync {
    /// Play back / preview the local stream
    fn attach_local_stream(&self, stream: &MediaStream);

    /// Route the remote stream to an audio sink
    fn attach_remote_stream(&self, stream: &MediaStream);

    /// Call state or elapsed duration changed
    fn on_call_status_changed(&self, state: CallState, duration_secs: u64);

    /// Show a user-facing error
    fn on_error(&self, category: ErrorCategory, message: &str);

    /// An invitation is ringing
    fn on_incoming_call(&self, _caller: &str, _profile: Option<&PeerProfile>) {}

    /// Whether remote playback is paused even though audio is live
    fn is_playback_paused(&self) -> bool {
        false
    }

    /// Resume remote playback
    fn resume_playback(&self) {}

    /// Both streams were detached at the end of a call
    fn detach_streams(&self) {}
}

/// Presenter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn attach_local_stream(&self, _stream: &MediaStream) {}

    fn attach_remote_stream(&self, _stream: &MediaStream) {}

    fn on_call_status_changed(&self, _state: CallState, _duration_secs: u64) {}

    fn on_error(&self, _category: ErrorCategory, _message: &str) {}
}

#[derive(Debug, Default)]
struct Attached {
    local: Option<String>,
    remote: Option<String>,
}

/// Wraps a [`Presenter`] and makes stream attachment idempotent
pub(crate) struct PresenterBridge {
    inner: Arc<dyn Presenter>,
    attached: Mutex<Attached>,
}

impl PresenterBridge {
    pub(crate) fn new(inner: Arc<dyn Presenter>) -> Self {
        Self {
            inner,
            attached: Mutex::new(Attached::default()),
        }
    }

    /// Returns `false` when the same stream was already attached
    pub(crate) fn attach_local(&self, stream: &MediaStream) -> bool {
        let mut attached = self.attached.lock();
        if attached.local.as_deref() == Some(stream.id()) {
            return false;
        }
        attached.local = Some(stream.id().to_string());
        drop(attached);
        self.inner.attach_local_stream(stream);
        true
    }

    /// Returns `false` when the same stream was already attached
    pub(crate) fn attach_remote(&self, stream: &MediaStream) -> bool {
        let mut attached = self.attached.lock();
        if attached.remote.as_deref() == Some(stream.id()) {
            return false;
        }
        attached.remote = Some(stream.id().to_string());
        drop(attached);
        self.inner.attach_remote_stream(stream);
        true
    }

    pub(crate) fn detach(&self) {
        let mut attached = self.attached.lock();
        if attached.local.is_some() || attached.remote.is_some() {
            *attached = Attached::default();
            drop(attached);
            self.inner.detach_streams();
        }
    }

    pub(crate) fn status(&self, state: CallState, duration_secs: u64) {
        self.inner.on_call_status_changed(state, duration_secs);
    }

    pub(crate) fn error(&self, category: ErrorCategory) {
        self.inner.on_error(category, category.user_message());
    }

    pub(crate) fn incoming(&self, caller: &str, profile: Option<&PeerProfile>) {
        self.inner.on_incoming_call(caller, profile);
    }

    pub(crate) fn playback_paused(&self) -> bool {
        self.inner.is_playback_paused()
    }

    pub(crate) fn resume_playback(&self) {
        self.inner.resume_playback();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::SyntheticTrack;
    use crate::media::MediaTrack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPresenter {
        remote_attaches: AtomicUsize,
        detaches: AtomicUsize,
    }

    impl Presenter for CountingPresenter {
        fn attach_local_stream(&self, _stream: &MediaStream) {}

        fn attach_remote_stream(&self, _stream: &MediaStream) {
            self.remote_attaches.fetch_add(1, Ordering::SeqCst);
        }

        fn on_call_status_changed(&self, _state: CallState, _duration_secs: u64) {}

        fn on_error(&self, _category: ErrorCategory, _message: &str) {}

        fn detach_streams(&self) {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_reattaching_same_stream_is_noop() {
        let presenter = Arc::new(CountingPresenter::default());
        let bridge = PresenterBridge::new(presenter.clone());
        let stream = MediaStream::new(
            "remote-1",
            vec![Arc::new(SyntheticTrack::audio("a")) as Arc<dyn MediaTrack>],
        );

        assert!(bridge.attach_remote(&stream));
        assert!(!bridge.attach_remote(&stream));
        assert_eq!(presenter.remote_attaches.load(Ordering::SeqCst), 1);

        let rebuilt = MediaStream::new("remote-2", stream.tracks().to_vec());
        assert!(bridge.attach_remote(&rebuilt));
        assert_eq!(presenter.remote_attaches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detach_resets_attachment() {
        let presenter = Arc::new(CountingPresenter::default());
        let bridge = PresenterBridge::new(presenter.clone());
        let stream = MediaStream::new("remote-1", Vec::new());

        bridge.detach();
        assert_eq!(presenter.detaches.load(Ordering::SeqCst), 0);

        bridge.attach_remote(&stream);
        bridge.detach();
        assert!(bridge.attach_remote(&stream));
        assert_eq!(presenter.detaches.load(Ordering::SeqCst), 1);
    }
}
