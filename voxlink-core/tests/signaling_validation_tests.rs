//! Inbound signaling validation
//!
//! Malformed, stale and out-of-state messages must leave the call untouched.

mod common;

use common::{drain, establish, settle, wait_for, wait_for_state, Participant};
use pretty_assertions::assert_eq;
use voxlink_core::loopback::MemoryRelay;
use voxlink_core::{
    CallEvent, CallId, CallState, EndReason, IceCandidateInit, PeerIdentityString, RejectReason,
    SessionDescription, SignalingMessage,
};

const ANSWER_SDP: &str = "v=0\r\na=ice-ufrag:forged\r\na=ice-pwd:forgedpwd\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

fn candidate(n: u16) -> IceCandidateInit {
    IceCandidateInit {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_malformed_answers_are_dropped() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let bob = Participant::join(&relay, "bob").await;
    let call_id = alice.call(&bob).await;

    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::AcceptAnswer {
            call_id,
            answer: SessionDescription::answer("   "),
        },
    );
    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::AcceptAnswer {
            call_id,
            answer: SessionDescription::offer(ANSWER_SDP),
        },
    );
    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::IceCandidate {
            call_id,
            candidate: IceCandidateInit::new("x".repeat(4096)),
        },
    );
    settle().await;

    assert_eq!(alice.manager.state().await, CallState::Calling);
    assert_eq!(alice.peer().remote_candidate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_and_foreign_messages_are_ignored() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let bob = Participant::join(&relay, "bob").await;
    let call_id = alice.call(&bob).await;

    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::End {
            call_id: CallId::new(),
        },
    );
    alice.manager.deliver_signal(
        PeerIdentityString::new("mallory"),
        SignalingMessage::End { call_id },
    );
    alice.manager.deliver_signal(
        PeerIdentityString::new("mallory"),
        SignalingMessage::Reject {
            call_id,
            reason: RejectReason::Busy,
        },
    );
    settle().await;
    assert_eq!(alice.manager.state().await, CallState::Calling);

    alice
        .manager
        .deliver_signal(bob.id.clone(), SignalingMessage::End { call_id });
    let ended = wait_for(&mut alice.events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    match ended {
        CallEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::RemoteHangup),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(alice.presenter.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_candidates_are_buffered_while_ringing() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let call_id = alice.call(&bob).await;
    wait_for_state(&mut bob.events, CallState::Ringing).await;

    for n in 1..=2 {
        bob.manager.deliver_signal(
            alice.id.clone(),
            SignalingMessage::IceCandidate {
                call_id,
                candidate: candidate(n),
            },
        );
    }
    settle().await;
    assert!(bob.factory.peers().is_empty());

    bob.manager.accept_call().await.unwrap();
    wait_for_state(&mut alice.events, CallState::Active).await;
    settle().await;

    // two buffered plus the one the caller gathered after negotiating
    assert_eq!(bob.peer().remote_candidate_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_invite_rings_once() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    alice.call(&bob).await;
    wait_for_state(&mut bob.events, CallState::Ringing).await;

    let invite = relay
        .log()
        .into_iter()
        .find(|m| m.message.event_name() == "invite")
        .unwrap()
        .message;
    bob.manager.deliver_signal(alice.id.clone(), invite);
    settle().await;

    assert_eq!(bob.presenter.incoming().len(), 1);
    assert_eq!(relay.count_events("reject"), 0);
    assert_eq!(bob.manager.state().await, CallState::Ringing);
    assert!(!drain(&mut bob.events)
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_invite_without_sdp_never_rings() {
    let relay = MemoryRelay::new();
    let bob = Participant::join(&relay, "bob").await;

    bob.manager.deliver_signal(
        PeerIdentityString::new("alice"),
        SignalingMessage::Invite {
            call_id: CallId::new(),
            offer: SessionDescription::offer(""),
            caller: None,
        },
    );
    settle().await;

    assert_eq!(bob.manager.state().await, CallState::Idle);
    assert!(bob.presenter.incoming().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_out_of_state_messages_leave_active_call_alone() {
    let relay = MemoryRelay::new();
    let mut alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let call_id = establish(&mut alice, &mut bob).await;

    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::Reject {
            call_id,
            reason: RejectReason::Declined,
        },
    );
    alice.manager.deliver_signal(
        bob.id.clone(),
        SignalingMessage::AcceptAnswer {
            call_id,
            answer: SessionDescription::answer(ANSWER_SDP),
        },
    );
    settle().await;

    let view = alice.manager.current_call().await.unwrap();
    assert_eq!(view.state, CallState::Active);
    assert!(alice.presenter.errors().is_empty());
    assert_eq!(bob.manager.state().await, CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_answer_while_ringing_is_ignored() {
    let relay = MemoryRelay::new();
    let alice = Participant::join(&relay, "alice").await;
    let mut bob = Participant::join(&relay, "bob").await;
    let call_id = alice.call(&bob).await;
    wait_for_state(&mut bob.events, CallState::Ringing).await;

    bob.manager.deliver_signal(
        alice.id.clone(),
        SignalingMessage::AcceptAnswer {
            call_id,
            answer: SessionDescription::answer(ANSWER_SDP),
        },
    );
    settle().await;

    assert_eq!(bob.manager.state().await, CallState::Ringing);
    assert_eq!(bob.capture.capture_count(), 0);
}
