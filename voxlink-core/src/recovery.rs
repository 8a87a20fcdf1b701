//! Connection and track recovery
//!
//! Recovery runs inside the call engine. ICE disconnects and failures spend
//! from a per-session [`ReconnectionBudget`]; ended tracks are handled by
//! pruning, receiver inspection or local re-capture depending on which side
//! lost audio.

use crate::call::{CallError, Engine, SessionTimers, TimerKind};
use crate::media::{acquire_audio, release, set_audio_enabled};
use crate::monitor::HealthAction;
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallState, EndReason, ErrorCategory, IceConnectionState, SignalingState,
};

/// Reconnection attempts left in a call session
///
/// Reset when the session is established; never reset by a successful
/// reconnection, so a flapping link cannot retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionBudget {
    attempts_made: u32,
    max_attempts: u32,
}

impl ReconnectionBudget {
    /// Fresh budget allowing `max_attempts` attempts
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts_made: 0,
            max_attempts,
        }
    }

    /// Spend one attempt; `false` when the budget is exhausted
    pub fn try_consume(&mut self) -> bool {
        if self.attempts_made >= self.max_attempts {
            return false;
        }
        self.attempts_made += 1;
        true
    }

    /// Restore the full budget
    pub fn reset(&mut self) {
        self.attempts_made = 0;
    }

    /// Attempts spent so far
    #[must_use]
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Attempt ceiling
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts still available
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }
}

/// What started a reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectTrigger {
    /// ICE reported disconnected
    Disconnected,
    /// ICE reported failed
    Failed,
    /// Backoff timer after an attempt errored
    Retry,
    /// Remote stream went inactive
    StreamInactive,
    /// Remote audio could not be recovered from receivers
    TrackLost,
}

impl ReconnectTrigger {
    /// An attempt that errors ends the call instead of retrying
    fn fatal_on_error(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl<T: SignalingTransport> Engine<T> {
    /// Spend one attempt and restart ICE, or end the call when the budget is gone
    pub(crate) async fn attempt_reconnection(
        &mut self,
        call_id: CallId,
        trigger: ReconnectTrigger,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != CallState::Active || session.connection.is_none() {
            tracing::debug!(call_id = %call_id, ?trigger, "No active connection to recover");
            return;
        }
        SessionTimers::cancel(&mut session.timers.reconnect_backoff);

        if !session.budget.try_consume() {
            tracing::error!(
                call_id = %call_id,
                attempts = session.budget.attempts_made(),
                ?trigger,
                "Reconnection attempts exhausted"
            );
            self.notify_error(Some(call_id), ErrorCategory::ReconnectFailed);
            self.teardown(EndReason::ReconnectExhausted, true).await;
            return;
        }
        let attempt = session.budget.attempts_made();
        let max_attempts = session.budget.max_attempts();
        tracing::warn!(call_id = %call_id, attempt, max_attempts, ?trigger, "Attempting reconnection");
        self.emit(CallEvent::Reconnecting {
            call_id,
            attempt,
            max_attempts,
        });

        if let Err(e) = self.restart_connection(call_id).await {
            if trigger.fatal_on_error() {
                tracing::error!(call_id = %call_id, error = %e, "Connection restart failed");
                self.notify_error(Some(call_id), ErrorCategory::NetworkFailure);
                self.teardown(EndReason::NetworkFailure, true).await;
            } else {
                let backoff = self.config.recovery.reconnect_backoff;
                tracing::warn!(
                    call_id = %call_id,
                    error = %e,
                    backoff_ms = backoff.as_millis(),
                    "Reconnection attempt failed, retrying"
                );
                let timer = self.schedule(call_id, TimerKind::ReconnectBackoff, backoff);
                if let Some(session) = self.session.as_mut() {
                    session.timers.reconnect_backoff = Some(timer);
                }
            }
        }
    }

    /// In-place ICE restart where the backend has one, else a manual restart offer
    async fn restart_connection(&mut self, call_id: CallId) -> Result<(), CallError> {
        let session = self
            .session
            .as_mut()
            .ok_or(CallError::InvalidState(CallState::Idle))?;
        let connection = session
            .connection
            .as_ref()
            .ok_or(CallError::InvalidState(session.state))?;

        if connection.peer().supports_ice_restart() {
            connection.peer().restart_ice().await?;
            session.restart_pending = true;
            tracing::debug!(call_id = %call_id, "ICE restart requested");
            return Ok(());
        }

        let offer = connection.local_offer(true).await?;
        let peer = session.peer.clone();
        tracing::debug!(call_id = %call_id, "Sending manual restart offer");
        let sent = self
            .send(&peer, SignalingMessage::RestartOffer { call_id, sdp: offer })
            .await;
        if sent.is_err() {
            self.withdraw_offer(call_id).await;
        }
        sent
    }

    /// Roll back a local offer the peer never received
    async fn withdraw_offer(&mut self, call_id: CallId) {
        let Some(connection) = self.session.as_ref().and_then(|s| s.connection.as_ref()) else {
            return;
        };
        if connection.signaling_state() != SignalingState::HaveLocalOffer {
            return;
        }
        match connection.rollback().await {
            Ok(()) => tracing::debug!(call_id = %call_id, "Unsent offer rolled back"),
            Err(e) => tracing::warn!(call_id = %call_id, error = %e, "Could not roll back unsent offer"),
        }
    }

    pub(crate) async fn on_reconnect_backoff(&mut self, call_id: CallId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.timers.reconnect_backoff = None;
        let ice = session
            .connection
            .as_ref()
            .map(|c| c.ice_connection_state());
        if matches!(
            ice,
            Some(IceConnectionState::Connected | IceConnectionState::Completed)
        ) {
            tracing::debug!(call_id = %call_id, "Connection recovered before retry");
            return;
        }
        self.attempt_reconnection(call_id, ReconnectTrigger::Retry)
            .await;
    }

    /// Send the restart offer the backend asked for after `restart_ice`
    pub(crate) async fn on_negotiation_needed(&mut self, call_id: CallId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.restart_pending {
            tracing::debug!(call_id = %call_id, "Negotiation needed without pending restart, ignoring");
            return;
        }
        let Some(connection) = session.connection.as_ref() else {
            return;
        };
        if connection.signaling_state() != SignalingState::Stable {
            tracing::debug!(call_id = %call_id, "Signaling not stable, deferring restart offer");
            return;
        }

        let offer = connection.local_offer(true).await;
        let peer = session.peer.clone();
        let sent = match offer {
            Ok(sdp) => self
                .send(&peer, SignalingMessage::RestartOffer { call_id, sdp })
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            tracing::warn!(call_id = %call_id, error = %e, "Restart offer failed, retrying");
            self.withdraw_offer(call_id).await;
            if let Some(session) = self.session.as_mut() {
                session.restart_pending = false;
            }
            let timer = self.schedule(
                call_id,
                TimerKind::ReconnectBackoff,
                self.config.recovery.reconnect_backoff,
            );
            if let Some(session) = self.session.as_mut() {
                session.timers.reconnect_backoff = Some(timer);
            }
        }
    }

    /// Act on what the track monitor found
    pub(crate) async fn run_track_check(&mut self, call_id: CallId) {
        let actions = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let remote = session
                .connection
                .as_ref()
                .and_then(|c| c.remote_stream())
                .cloned();
            session.monitor.check(remote.as_ref())
        };

        for action in actions {
            if !self.is_current(call_id) {
                break;
            }
            match action {
                HealthAction::PruneRemoteStream { ended } => {
                    tracing::info!(call_id = %call_id, ?ended, "Remote track ended, keeping live tracks");
                    self.prune_remote(call_id);
                }
                HealthAction::RecoverTrack { ended } => {
                    tracing::warn!(call_id = %call_id, ?ended, "Remote audio ended");
                    self.recover_track(call_id);
                }
                HealthAction::RecoverStream => {
                    tracing::warn!(call_id = %call_id, "Remote stream inactive");
                    self.attempt_reconnection(call_id, ReconnectTrigger::StreamInactive)
                        .await;
                }
                HealthAction::RecaptureLocalAudio { ended } => {
                    tracing::warn!(call_id = %call_id, ?ended, "Local audio ended");
                    self.recapture_local_audio(call_id).await;
                }
            }
        }
    }

    fn prune_remote(&mut self, call_id: CallId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(stream) = session
            .connection
            .as_mut()
            .and_then(|c| c.prune_remote_stream())
        else {
            return;
        };
        session.monitor.watch_remote(&stream);
        self.publish_remote(call_id, &stream);
    }

    /// Give the connection a grace period to surface a replacement track
    fn recover_track(&mut self, call_id: CallId) {
        match self.session.as_ref() {
            Some(session) if !session.track_recovery_pending => {}
            Some(_) => {
                tracing::debug!(call_id = %call_id, "Track recovery already running");
                return;
            }
            None => return,
        }
        let timer = self.schedule(
            call_id,
            TimerKind::TrackGrace,
            self.config.recovery.track_grace,
        );
        if let Some(session) = self.session.as_mut() {
            session.track_recovery_pending = true;
            session.timers.track_recovery = Some(timer);
        }
    }

    /// Rebuild the remote stream from live receivers; `false` if there are none
    async fn recover_from_receivers(&mut self, call_id: CallId) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(connection) = session.connection.as_mut() else {
            return false;
        };
        let live = connection.live_receiver_audio().await;
        if live.is_empty() {
            return false;
        }
        let stream = connection.rebuild_remote_stream(live);
        session.monitor.watch_remote(&stream);
        session.track_recovery_pending = false;
        session.timers.track_recovery = None;
        tracing::info!(call_id = %call_id, stream_id = %stream.id(), "Remote audio recovered from receivers");
        self.publish_remote(call_id, &stream);
        self.emit(CallEvent::TrackRecovered { call_id });
        true
    }

    pub(crate) async fn on_track_grace(&mut self, call_id: CallId) {
        if self.recover_from_receivers(call_id).await {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let state = session
            .connection
            .as_ref()
            .map(|c| c.connection_state());

        match state {
            Some(state) if state.is_healthy() => {
                tracing::debug!(call_id = %call_id, "No live receiver yet, taking a second look");
                let timer = self.schedule(
                    call_id,
                    TimerKind::TrackSecondLook,
                    self.config.recovery.track_second_look,
                );
                if let Some(session) = self.session.as_mut() {
                    session.timers.track_recovery = Some(timer);
                }
            }
            Some(state) if state.is_degraded() => {
                session.track_recovery_pending = false;
                session.timers.track_recovery = None;
                self.attempt_reconnection(call_id, ReconnectTrigger::TrackLost)
                    .await;
            }
            _ => {
                session.track_recovery_pending = false;
                session.timers.track_recovery = None;
                tracing::warn!(call_id = %call_id, ?state, "Giving up on remote audio recovery");
            }
        }
    }

    pub(crate) async fn on_track_second_look(&mut self, call_id: CallId) {
        if self.recover_from_receivers(call_id).await {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.track_recovery_pending = false;
        session.timers.track_recovery = None;
        let state = session
            .connection
            .as_ref()
            .map(|c| c.connection_state());

        if state.is_some_and(|s| s.is_degraded()) {
            self.attempt_reconnection(call_id, ReconnectTrigger::TrackLost)
                .await;
        } else {
            tracing::warn!(
                call_id = %call_id,
                ?state,
                "Remote audio lost while the connection reports healthy"
            );
        }
    }

    /// Replace a local audio track that ended underneath the call
    pub(crate) async fn recapture_local_audio(&mut self, call_id: CallId) {
        let muted = match self.session.as_ref() {
            Some(session) => session.muted,
            None => return,
        };
        let fresh = match acquire_audio(self.capture.as_ref(), &self.config.audio).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Could not re-capture local audio");
                self.notify_error(Some(call_id), e.category());
                self.teardown(EndReason::MediaFailure, true).await;
                return;
            }
        };
        set_audio_enabled(&fresh, !muted);

        let Some(session) = self.session.as_mut() else {
            release(&fresh);
            return;
        };
        let old = session.local_stream.replace(fresh.clone());
        let mut offer = None;
        if let Some(connection) = session.connection.as_ref() {
            if let Some(old) = &old {
                match connection.replace_local_audio(old, &fresh).await {
                    Ok(replaced) => {
                        tracing::debug!(call_id = %call_id, replaced, "Local audio senders switched");
                    }
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "Could not switch local audio senders");
                    }
                }
            }
            if connection.signaling_state() == SignalingState::Stable {
                match connection.local_offer(false).await {
                    Ok(sdp) => offer = Some(sdp),
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, error = %e, "Could not create renegotiation offer");
                    }
                }
            } else {
                tracing::debug!(call_id = %call_id, "Signaling not stable, skipping renegotiation");
            }
        }
        if let Some(old) = old {
            release(&old);
        }
        session.monitor.watch_local(&fresh);
        let peer = session.peer.clone();

        self.publish_local(call_id, &fresh);
        let renegotiated = match offer {
            Some(offer) => match self
                .send(&peer, SignalingMessage::RenegotiateOffer { call_id, offer })
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Could not send renegotiation offer");
                    self.withdraw_offer(call_id).await;
                    false
                }
            },
            None => false,
        };
        tracing::info!(call_id = %call_id, renegotiated, "Local audio re-captured");
        self.emit(CallEvent::LocalAudioRecaptured {
            call_id,
            renegotiated,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_budget_exhausts_after_max_attempts() {
        let mut budget = ReconnectionBudget::new(3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.attempts_made(), 3);
        assert_eq!(budget.remaining(), 0);

        budget.reset();
        assert_eq!(budget.remaining(), 3);
    }

    #[test]
    fn test_zero_budget_never_allows_attempts() {
        let mut budget = ReconnectionBudget::new(0);
        assert!(!budget.try_consume());
        assert_eq!(budget.attempts_made(), 0);
    }

    #[test]
    fn test_only_failed_trigger_is_fatal() {
        assert!(ReconnectTrigger::Failed.fatal_on_error());
        assert!(!ReconnectTrigger::Disconnected.fatal_on_error());
        assert!(!ReconnectTrigger::Retry.fatal_on_error());
        assert!(!ReconnectTrigger::TrackLost.fatal_on_error());
    }

    proptest! {
        #[test]
        fn prop_budget_never_exceeds_max(max in 0u32..10, tries in 0usize..40) {
            let mut budget = ReconnectionBudget::new(max);
            let granted = (0..tries).filter(|_| budget.try_consume()).count();
            prop_assert!(granted <= max as usize);
            prop_assert_eq!(budget.attempts_made() as usize, granted);
            prop_assert_eq!(budget.remaining() + budget.attempts_made(), max);
        }
    }
}
