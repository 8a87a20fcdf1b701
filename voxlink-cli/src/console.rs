//! Console rendering of call state

use std::sync::atomic::{AtomicU64, Ordering};
use voxlink_core::{CallState, ErrorCategory, MediaStream, PeerProfile, Presenter};

/// Prints call progress for one participant
pub struct ConsolePresenter {
    label: String,
    last_second: AtomicU64,
}

impl ConsolePresenter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_second: AtomicU64::new(u64::MAX),
        }
    }

    fn line(&self, text: &str) {
        println!("[{}] {}", self.label, text);
    }
}

impl Presenter for ConsolePresenter {
    fn attach_local_stream(&self, stream: &MediaStream) {
        self.line(&format!(
            "🎙️  Microphone ready ({} track(s), stream {})",
            stream.tracks().len(),
            stream.id()
        ));
    }

    fn attach_remote_stream(&self, stream: &MediaStream) {
        self.line(&format!(
            "🔊 Playing remote audio ({} live track(s))",
            stream.live_tracks().count()
        ));
    }

    fn on_call_status_changed(&self, state: CallState, duration_secs: u64) {
        if state == CallState::Active {
            // the health tick reports every second; print each second once
            if self.last_second.swap(duration_secs, Ordering::Relaxed) == duration_secs {
                return;
            }
            self.line(&format!("📞 In call {}", format_duration(duration_secs)));
            return;
        }
        self.last_second.store(u64::MAX, Ordering::Relaxed);
        match state {
            CallState::Ended => self.line(&format!(
                "📴 Call ended after {}",
                format_duration(duration_secs)
            )),
            other => self.line(&format!("State: {other}")),
        }
    }

    fn on_error(&self, category: ErrorCategory, message: &str) {
        self.line(&format!("⚠️  {message} ({})", category_label(category)));
    }

    fn on_incoming_call(&self, caller: &str, profile: Option<&PeerProfile>) {
        match profile {
            Some(profile) if !profile.display_name.is_empty() => {
                self.line(&format!("📲 Incoming call from {} ({caller})", profile.display_name));
            }
            _ => self.line(&format!("📲 Incoming call from {caller}")),
        }
    }

    fn detach_streams(&self) {
        self.line("Audio detached");
    }
}

/// `m:ss`, or `h:mm:ss` from one hour on
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn category_label(category: ErrorCategory) -> String {
    serde_json::to_value(category)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{category:?}"))
}
