//! Call state machine tests
//!
//! Two (or three) call managers talk over an in-process relay with loopback
//! peer connections. Time is paused so timeouts run instantly.

mod common;

use common::{drain, establish, settle, wait_for, wait_for_state, Participant};
use pretty_assertions::assert_eq;
use std::time::Duration;
use voxlink_core::loopback::{LoopbackPeerFactory, MemoryRelay};
use voxlink_core::{
    CallDirection, CallError, CallEvent, CallManagerConfig, CallState, EndReason, ErrorCategory,
    MediaTrack, PeerIdentityString,
};

#[tokio::test(start_paused = true)]
async fn test_outgoing_call_reaches_active_on_both_sides() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;

    let call_id = alice.call(&bob).await;
    let incoming = wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    match incoming {
        CallEvent::IncomingCall {
            call_id: id,
            caller,
            profile,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(caller, alice.id);
            assert_eq!(profile.unwrap().display_name, "Alice");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(bob.manager.state().await, CallState::Ringing);
    assert_eq!(alice.manager.state().await, CallState::Calling);

    bob.manager.accept_call().await.unwrap();
    wait_for_state(&mut alice.events, CallState::Active).await;
    settle().await;

    let caller_view = alice.manager.current_call().await.unwrap();
    assert_eq!(caller_view.call_id, call_id);
    assert_eq!(caller_view.direction, CallDirection::Outgoing);
    assert_eq!(caller_view.state, CallState::Active);
    assert_eq!(caller_view.profile.display_name, "Bob");
    assert!(caller_view.started_at.is_some());

    let callee_view = bob.manager.current_call().await.unwrap();
    assert_eq!(callee_view.call_id, call_id);
    assert_eq!(callee_view.direction, CallDirection::Incoming);
    assert_eq!(callee_view.state, CallState::Active);
    assert_eq!(callee_view.peer, alice.id);
    assert_eq!(callee_view.profile.display_name, "Alice");

    assert_eq!(relay.count_events("invite"), 1);
    assert_eq!(relay.count_events("accept-answer"), 1);
    assert_eq!(alice.presenter.local_attaches().len(), 1);
    assert_eq!(bob.presenter.local_attaches().len(), 1);
    assert_eq!(alice.presenter.remote_attaches().last().map(|(_, n)| *n), Some(1));
    assert_eq!(bob.presenter.remote_attaches().last().map(|(_, n)| *n), Some(1));
    assert_eq!(bob.presenter.incoming().len(), 1);
    assert!(alice.peer().remote_candidate_count() >= 1);
    assert!(bob.peer().remote_candidate_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_initiate_fails_with_call_in_progress() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let bob = Participant::join(&relay, "bob").await;
    let carol = Participant::join(&relay, "carol").await;

    let first = alice.call(&bob).await;
    let second = alice
        .manager
        .initiate_call(carol.id.clone(), Default::default())
        .await;

    assert!(matches!(second, Err(CallError::CallInProgress)));
    assert_eq!(alice.presenter.errors(), vec![ErrorCategory::CallInProgress]);
    let current = alice.manager.current_call().await.unwrap();
    assert_eq!(current.call_id, first);
    assert_eq!(current.state, CallState::Calling);
    assert_eq!(relay.count_events("invite"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invite_during_call_is_answered_busy() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let mut carol = Participant::join(&relay, "carol").await;
    let call_id = establish(&mut alice, &mut bob).await;

    let carol_call = carol.call(&bob).await;
    let ended = wait_for(&mut carol.events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    match ended {
        CallEvent::CallEnded { call_id, reason } => {
            assert_eq!(call_id, carol_call);
            assert_eq!(reason, EndReason::Busy);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(carol.presenter.errors(), vec![ErrorCategory::Busy]);
    assert_eq!(carol.manager.state().await, CallState::Idle);

    let bob_view = bob.manager.current_call().await.unwrap();
    assert_eq!(bob_view.call_id, call_id);
    assert_eq!(bob_view.state, CallState::Active);
    assert_eq!(bob.presenter.incoming().len(), 1);
    assert!(!drain(&mut bob.events)
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_invites_both_end_busy() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let started = tokio::time::Instant::now();

    // both commands are queued before either engine sees the other invite
    let (alice_call, bob_call) = tokio::join!(alice.call(&bob), bob.call(&alice));

    for (participant, own_call) in [(&mut alice, alice_call), (&mut bob, bob_call)] {
        match wait_for(&mut participant.events, |e| {
            matches!(e, CallEvent::CallEnded { .. })
        })
        .await
        {
            CallEvent::CallEnded { call_id, reason } => {
                assert_eq!(call_id, own_call);
                assert_eq!(reason, EndReason::Busy);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(participant.presenter.errors(), vec![ErrorCategory::Busy]);
        assert!(participant.presenter.incoming().is_empty());
        assert_eq!(participant.manager.state().await, CallState::Idle);
    }

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(relay.count_events("reject"), 2);
    assert_eq!(relay.count_events("end"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reject_declines_without_touching_the_microphone() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;

    alice.call(&bob).await;
    wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.manager.reject_call().await.unwrap();

    wait_for(&mut alice.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::Declined, .. })
    })
    .await;
    assert_eq!(alice.presenter.errors(), vec![ErrorCategory::Declined]);
    assert_eq!(alice.manager.state().await, CallState::Idle);
    assert_eq!(bob.manager.state().await, CallState::Idle);
    assert_eq!(bob.capture.capture_count(), 0);
    assert!(bob.factory.peers().is_empty());
    assert!(alice.capture.last_tracks()[0].was_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_remote_hangup_returns_both_sides_to_idle() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let call_id = establish(&mut alice, &mut bob).await;

    alice.manager.end_call().await.unwrap();
    let ended = wait_for(&mut bob.events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    match ended {
        CallEvent::CallEnded { call_id: id, reason } => {
            assert_eq!(id, call_id);
            assert_eq!(reason, EndReason::RemoteHangup);
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_state(&mut bob.events, CallState::Idle).await;

    assert_eq!(alice.manager.state().await, CallState::Idle);
    assert!(alice.manager.current_call().await.is_none());
    assert!(alice.peer().is_closed());
    assert!(bob.peer().is_closed());
    assert!(alice.capture.last_tracks()[0].was_stopped());
    assert!(bob.capture.last_tracks()[0].was_stopped());
    assert_eq!(alice.presenter.detaches(), 1);
    assert_eq!(bob.presenter.detaches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_is_idempotent() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    establish(&mut alice, &mut bob).await;

    alice.manager.end_call().await.unwrap();
    alice.manager.end_call().await.unwrap();
    settle().await;

    assert_eq!(relay.count_events("end"), 1);
    let endings = drain(&mut alice.events)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::CallEnded { .. }))
        .count();
    assert_eq!(endings, 1);
    assert_eq!(bob.manager.state().await, CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancel_stops_the_ringing() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;

    alice.call(&bob).await;
    wait_for(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    alice.manager.end_call().await.unwrap();

    wait_for(&mut bob.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::RemoteHangup, .. })
    })
    .await;
    assert_eq!(bob.manager.state().await, CallState::Idle);
    assert_eq!(bob.capture.capture_count(), 0);
    assert!(matches!(
        bob.manager.accept_call().await,
        Err(CallError::InvalidState(CallState::Idle))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_operations_outside_their_state_are_refused() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let bob = Participant::join(&relay, "bob").await;

    assert!(matches!(
        alice.manager.accept_call().await,
        Err(CallError::InvalidState(CallState::Idle))
    ));
    assert!(matches!(
        alice.manager.reject_call().await,
        Err(CallError::InvalidState(CallState::Idle))
    ));
    assert!(matches!(
        alice.manager.toggle_mute().await,
        Err(CallError::InvalidState(CallState::Idle))
    ));

    alice.call(&bob).await;
    assert!(matches!(
        alice.manager.accept_call().await,
        Err(CallError::InvalidState(CallState::Calling))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_mute_disables_the_local_track() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    establish(&mut alice, &mut bob).await;

    let mic = alice.capture.last_tracks()[0].clone();
    assert!(mic.is_enabled());

    assert!(alice.manager.toggle_mute().await.unwrap());
    assert!(!mic.is_enabled());
    assert!(mic.is_live());
    assert!(alice.manager.current_call().await.unwrap().muted);

    assert!(!alice.manager.toggle_mute().await.unwrap());
    assert!(mic.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_missed_then_times_out() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let config = CallManagerConfig {
        ring_timeout: Duration::from_secs(10),
        ..CallManagerConfig::default()
    };
    let mut bob =
        Participant::join_with(&relay, "bob", config, LoopbackPeerFactory::new()).await;

    let call_id = alice.call(&bob).await;
    wait_for_state(&mut bob.events, CallState::Ringing).await;

    wait_for(&mut bob.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::Missed, .. })
    })
    .await;
    assert_eq!(bob.manager.state().await, CallState::Idle);
    assert_eq!(alice.manager.state().await, CallState::Calling);
    assert_eq!(relay.count_events("end"), 0);

    let ended = wait_for(&mut alice.events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    match ended {
        CallEvent::CallEnded { call_id: id, reason } => {
            assert_eq!(id, call_id);
            assert_eq!(reason, EndReason::NoAnswer);
        }
        other => panic!("unexpected event {other:?}"),
    }
    settle().await;
    assert_eq!(alice.presenter.error_count(ErrorCategory::NoAnswer), 1);
    assert_eq!(relay.count_events("end"), 1);
    assert!(alice.peer().is_closed());
    assert_eq!(bob.manager.state().await, CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_answer_timeout_hangs_up_the_ringing_callee() {
    let relay = MemoryRelay::new();
    let config = CallManagerConfig {
        answer_timeout: Duration::from_secs(5),
        ..CallManagerConfig::default()
    };
    let mut alice =
        Participant::join_with(&relay, "alice", config, LoopbackPeerFactory::new()).await;
    let mut bob = Participant::join(&relay, "bob").await;

    alice.call(&bob).await;
    wait_for_state(&mut bob.events, CallState::Ringing).await;

    wait_for(&mut alice.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::NoAnswer, .. })
    })
    .await;
    wait_for(&mut bob.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::RemoteHangup, .. })
    })
    .await;
    assert_eq!(alice.presenter.errors(), vec![ErrorCategory::NoAnswer]);
    assert!(bob.presenter.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_signaling_loss_while_calling_ends_the_attempt() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let bob = Participant::join(&relay, "bob").await;

    alice.call(&bob).await;
    relay.disconnect(&alice.id);

    wait_for(&mut alice.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::SignalingLost, .. })
    })
    .await;
    assert_eq!(
        alice.presenter.errors(),
        vec![ErrorCategory::SignalingUnavailable]
    );
    assert_eq!(alice.manager.state().await, CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_signaling_loss_during_active_call_keeps_the_call() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    establish(&mut alice, &mut bob).await;

    relay.disconnect(&alice.id);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(alice.manager.state().await, CallState::Active);
    assert!(alice.presenter.errors().is_empty());
    assert!(!drain(&mut alice.events)
        .iter()
        .any(|e| matches!(e, CallEvent::CallEnded { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_active_call_reports_duration_and_resumes_playback() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    establish(&mut alice, &mut bob).await;

    bob.presenter.pause_playback();
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let durations: Vec<u64> = drain(&mut alice.events)
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::Duration { seconds, .. } => Some(seconds),
            _ => None,
        })
        .collect();
    assert_eq!(durations.len(), 3);
    assert!(durations.windows(2).all(|w| w[0] <= w[1]));
    assert!(alice
        .presenter
        .statuses()
        .iter()
        .any(|(state, secs)| *state == CallState::Active && *secs >= 2));
    assert_eq!(bob.presenter.resumes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_hangs_up_the_current_call() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    establish(&mut alice, &mut bob).await;

    alice.manager.shutdown().await;
    wait_for(&mut bob.events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::RemoteHangup, .. })
    })
    .await;
    assert!(matches!(
        alice.manager.initiate_call(PeerIdentityString::new("bob"), Default::default()).await,
        Err(CallError::Shutdown)
    ));
}
