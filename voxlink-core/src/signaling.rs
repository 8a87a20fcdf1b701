//! Call signaling protocol
//!
//! The relay is an external bidirectional message bus addressed by peer
//! identifier. It delivers an event to a peer if and only if that peer is
//! currently connected. This module defines the events carried over it and
//! a handler that adds tracing, rate limiting and error backoff.

use crate::identity::{PeerIdentity, PeerProfile};
use crate::types::{CallId, IceCandidateInit, SdpKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Maximum SDP body length accepted from the relay
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate line length accepted from the relay
const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Invalid SDP
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Invalid ICE candidate
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Relay not connected
    #[error("Signaling transport unavailable")]
    Unavailable,

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling transport trait
///
/// Implement this for the relay in use (websocket hub, message broker, ...).
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Peer identifier type
    type PeerId: PeerIdentity;

    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message to a peer
    async fn send_message(
        &self,
        peer: &Self::PeerId,
        message: SignalingMessage,
    ) -> Result<(), Self::Error>;

    /// Receive the next signaling message addressed to us
    async fn receive_message(&self) -> Result<(Self::PeerId, SignalingMessage), Self::Error>;

    /// Whether the relay connection is currently up
    fn is_connected(&self) -> bool;

    /// Whether the relay connection is authenticated and encrypted
    fn is_secure(&self) -> bool {
        true
    }
}

/// Why an invitation was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    /// The user declined
    #[default]
    Declined,
    /// The callee is already in a call
    Busy,
}

/// Signaling events exchanged between the two peers of a call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Start a call
    Invite {
        /// Call identifier minted by the caller
        call_id: CallId,
        /// Caller's offer
        offer: SessionDescription,
        /// Caller presentation metadata
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<PeerProfile>,
    },

    /// Complete the initial negotiation
    AcceptAnswer {
        /// Call identifier
        call_id: CallId,
        /// Callee's answer
        answer: SessionDescription,
    },

    /// Decline an invitation
    Reject {
        /// Call identifier
        call_id: CallId,
        /// Why
        #[serde(default)]
        reason: RejectReason,
    },

    /// Terminate an active or pending call
    End {
        /// Call identifier
        call_id: CallId,
    },

    /// Trickled network path
    IceCandidate {
        /// Call identifier
        call_id: CallId,
        /// Candidate
        candidate: IceCandidateInit,
    },

    /// Request an ICE restart
    RestartOffer {
        /// Call identifier
        call_id: CallId,
        /// Offer with fresh ICE credentials
        sdp: SessionDescription,
    },

    /// Complete an ICE restart
    RestartAnswer {
        /// Call identifier
        call_id: CallId,
        /// Answer to the restart offer
        sdp: SessionDescription,
    },

    /// Renegotiate after a local track was replaced
    RenegotiateOffer {
        /// Call identifier
        call_id: CallId,
        /// Updated offer
        offer: SessionDescription,
    },

    /// Complete a renegotiation
    RenegotiateAnswer {
        /// Call identifier
        call_id: CallId,
        /// Answer to the renegotiation offer
        answer: SessionDescription,
    },
}

impl SignalingMessage {
    /// Call the message belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Invite { call_id, .. }
            | Self::AcceptAnswer { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::End { call_id }
            | Self::IceCandidate { call_id, .. }
            | Self::RestartOffer { call_id, .. }
            | Self::RestartAnswer { call_id, .. }
            | Self::RenegotiateOffer { call_id, .. }
            | Self::RenegotiateAnswer { call_id, .. } => *call_id,
        }
    }

    /// Logical event name as used on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::AcceptAnswer { .. } => "accept-answer",
            Self::Reject { .. } => "reject",
            Self::End { .. } => "end",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RestartOffer { .. } => "restart-offer",
            Self::RestartAnswer { .. } => "restart-answer",
            Self::RenegotiateOffer { .. } => "renegotiate-offer",
            Self::RenegotiateAnswer { .. } => "renegotiate-answer",
        }
    }

    /// Check the payload is well-formed before it reaches the state machine
    ///
    /// # Errors
    ///
    /// Returns error describing the malformed field
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::Invite { offer, .. } => check_description(offer, SdpKind::Offer),
            Self::RestartOffer { sdp, .. } => check_description(sdp, SdpKind::Offer),
            Self::RenegotiateOffer { offer, .. } => check_description(offer, SdpKind::Offer),
            Self::AcceptAnswer { answer, .. } | Self::RenegotiateAnswer { answer, .. } => {
                check_description(answer, SdpKind::Answer)
            }
            Self::RestartAnswer { sdp, .. } => check_description(sdp, SdpKind::Answer),
            Self::IceCandidate { candidate, .. } => {
                if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::InvalidCandidate(format!(
                        "candidate line of {} bytes exceeds {}",
                        candidate.candidate.len(),
                        MAX_CANDIDATE_LENGTH
                    )));
                }
                Ok(())
            }
            Self::Reject { .. } | Self::End { .. } => Ok(()),
        }
    }
}

fn check_description(desc: &SessionDescription, expected: SdpKind) -> Result<(), SignalingError> {
    if desc.kind != expected {
        return Err(SignalingError::InvalidSdp(format!(
            "expected {:?}, got {:?}",
            expected, desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(SignalingError::InvalidSdp("SDP cannot be empty".to_string()));
    }
    if desc.sdp.len() > MAX_SDP_LENGTH {
        return Err(SignalingError::InvalidSdp(format!(
            "SDP of {} bytes exceeds {}",
            desc.sdp.len(),
            MAX_SDP_LENGTH
        )));
    }
    Ok(())
}

/// Minimum time between messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with rate limiting
pub struct SignalingHandler<T: SignalingTransport> {
    transport: std::sync::Arc<T>,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        Self {
            transport,
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %peer, event = message.event_name(), call_id = %message.call_id()))]
    pub async fn send_message(
        &self,
        peer: &T::PeerId,
        message: SignalingMessage,
    ) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(peer, message).await
    }

    /// Receive a signaling message with rate limiting and backpressure
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(T::PeerId, SignalingMessage), T::Error> {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = Instant::now().duration_since(*last_time);

        if elapsed < MIN_MESSAGE_INTERVAL {
            let sleep_duration = MIN_MESSAGE_INTERVAL - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis(),
                "Rate limiting applied"
            );
            drop(last_time);
            sleep(sleep_duration).await;
            last_time = self.last_receive_time.lock().await;
        }

        *last_time = Instant::now();
        drop(last_time);

        match self.transport.receive_message().await {
            Ok(result) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(peer = %result.0, event = result.1.event_name(), "Received signaling message");
                Ok(result)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Whether the relay connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether the relay connection is secure
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &std::sync::Arc<T> {
        &self.transport
    }
}
