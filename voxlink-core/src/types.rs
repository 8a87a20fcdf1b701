//! Call types and data structures

use crate::identity::{PeerIdentity, PeerProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
///
/// Minted by the caller and carried on every signaling event so that
/// stale events from an earlier call can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call state enumeration
///
/// ```text
///   Idle ──initiate──▶ Calling ──answer──▶ Active ──end──▶ Ended ─▶ Idle
///   Idle ──invite───▶ Ringing ──accept──▶ Active
///                     Ringing ──reject/cancel──▶ Ended ─▶ Idle
/// ```
///
/// `Ended` is only ever reported transiently while a session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call
    Idle,
    /// Outgoing invitation sent, waiting for an answer
    Calling,
    /// Incoming invitation waiting for the user
    Ringing,
    /// Media negotiated, call in progress
    Active,
    /// Session is being torn down
    Ended,
}

impl CallState {
    /// Whether a session exists in this state
    #[must_use]
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing | Self::Active)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We placed the call
    Outgoing,
    /// The peer placed the call
    Incoming,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Final answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Roll back a pending local or remote offer
    Rollback,
}

/// Session description exchanged during offer/answer negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Whether the SDP body carries an ICE restart relative to `previous`
    ///
    /// Compares the `a=ice-ufrag` attributes of both descriptions.
    #[must_use]
    pub fn restarts_ice_from(&self, previous: &SessionDescription) -> bool {
        match (ice_ufrag(&self.sdp), ice_ufrag(&previous.sdp)) {
            (Some(new), Some(old)) => new != old,
            _ => false,
        }
    }
}

fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix("a=ice-ufrag:"))
}

/// ICE candidate as carried over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment the candidate belongs to
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Offer/answer negotiation state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No negotiation in progress
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, local answer pending
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Connection closed
    Closed,
}

/// ICE connectivity state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceConnectionState {
    /// Gathering not started
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable pair was found
    Connected,
    /// Checking finished with a usable pair
    Completed,
    /// Connectivity lost, may come back on its own
    Disconnected,
    /// All candidate pairs failed
    Failed,
    /// Agent shut down
    Closed,
}

/// Aggregate transport state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Freshly created
    New,
    /// Transports are connecting
    Connecting,
    /// Transports are connected
    Connected,
    /// At least one transport lost connectivity
    Disconnected,
    /// At least one transport failed
    Failed,
    /// Connection closed
    Closed,
}

impl PeerConnectionState {
    /// Connected or still on the way there
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::New | Self::Connecting | Self::Connected)
    }

    /// Transport layer reports loss of connectivity
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Network path of the nominated candidate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPath {
    /// Host candidates on both ends
    Direct,
    /// Address translated through a NAT (server or peer reflexive)
    Translated,
    /// Media relayed through a TURN server
    Relayed,
}

impl std::fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Translated => "nat-translated",
            Self::Relayed => "relayed",
        };
        f.write_str(s)
    }
}

/// User-facing error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Microphone permission was denied
    PermissionDenied,
    /// No microphone present
    DeviceNotFound,
    /// Microphone in use by someone else
    DeviceBusy,
    /// Audio constraints cannot be satisfied
    ConstraintsUnsupported,
    /// Offer/answer exchange failed
    Negotiation,
    /// Connection failed and could not be restarted
    NetworkFailure,
    /// Reconnection budget exhausted
    ReconnectFailed,
    /// The peer did not answer in time
    NoAnswer,
    /// The peer declined the call
    Declined,
    /// The peer is already in a call
    Busy,
    /// Signaling relay is not reachable
    SignalingUnavailable,
    /// Transport is not secure enough for media capture
    InsecureContext,
    /// A call is already in progress
    CallInProgress,
}

impl ErrorCategory {
    /// Message shown to the user for this category
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access was denied. Allow microphone access to make calls."
            }
            Self::DeviceNotFound => "No microphone was found. Connect a microphone and try again.",
            Self::DeviceBusy => "Your microphone is being used by another application.",
            Self::ConstraintsUnsupported => {
                "Your microphone does not support the required settings."
            }
            Self::Negotiation => "The call could not be set up.",
            Self::NetworkFailure => "The call was lost due to a network failure.",
            Self::ReconnectFailed => "Could not reconnect the call.",
            Self::NoAnswer => "No answer.",
            Self::Declined => "The call was declined.",
            Self::Busy => "The person you are calling is busy.",
            Self::SignalingUnavailable => "Not connected to the server. Check your connection.",
            Self::InsecureContext => "Calls require a secure connection.",
            Self::CallInProgress => "A call is already in progress.",
        }
    }
}

/// Why a call session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// We hung up
    LocalHangup,
    /// The peer hung up or cancelled
    RemoteHangup,
    /// We declined an invitation
    Rejected,
    /// The peer declined our invitation
    Declined,
    /// The peer was busy
    Busy,
    /// Nobody answered our invitation
    NoAnswer,
    /// An incoming invitation expired unanswered
    Missed,
    /// Reconnection budget exhausted
    ReconnectExhausted,
    /// Unrecoverable connection failure
    NetworkFailure,
    /// Local media could not be acquired
    MediaFailure,
    /// Signaling relay went away before negotiation completed
    SignalingLost,
    /// Setup failed for another reason
    SetupFailed(String),
    /// The call manager shut down
    Shutdown,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// Incoming invitation received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: I,
        /// Caller presentation metadata, if sent
        profile: Option<PeerProfile>,
    },
    /// Call state changed
    StateChanged {
        /// Call identifier, `None` once idle
        call_id: Option<CallId>,
        /// New state
        state: CallState,
    },
    /// Elapsed time of an active call
    Duration {
        /// Call identifier
        call_id: CallId,
        /// Seconds since the call became active
        seconds: u64,
    },
    /// Local stream handed to the presentation layer
    LocalStreamAttached {
        /// Call identifier
        call_id: CallId,
        /// Stream identifier
        stream_id: String,
    },
    /// Remote stream (re)built and handed to the presentation layer
    RemoteStreamAttached {
        /// Call identifier
        call_id: CallId,
        /// Stream identifier
        stream_id: String,
        /// Number of live tracks in the stream
        live_tracks: usize,
    },
    /// Negotiated network path detected
    NetworkPathDetected {
        /// Call identifier
        call_id: CallId,
        /// Path classification
        path: NetworkPath,
    },
    /// A reconnection attempt started
    Reconnecting {
        /// Call identifier
        call_id: CallId,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Attempt ceiling
        max_attempts: u32,
    },
    /// Remote audio recovered from the connection's receivers
    TrackRecovered {
        /// Call identifier
        call_id: CallId,
    },
    /// Local audio re-captured after the device went away
    LocalAudioRecaptured {
        /// Call identifier
        call_id: CallId,
        /// Whether a renegotiation offer was sent
        renegotiated: bool,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
    /// User-facing error
    Error {
        /// Call identifier, if a session existed
        call_id: Option<CallId>,
        /// Error category
        category: ErrorCategory,
        /// User-facing message
        message: String,
    },
}

/// Point-in-time view of the current call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct CallSnapshot<I: PeerIdentity> {
    /// Call identifier
    pub call_id: CallId,
    /// The other participant
    pub peer: I,
    /// Presentation metadata of the other participant
    pub profile: PeerProfile,
    /// Who placed the call
    pub direction: CallDirection,
    /// Current state
    pub state: CallState,
    /// When the call became active
    pub started_at: Option<DateTime<Utc>>,
    /// Whether local audio is muted
    pub muted: bool,
    /// Reconnection attempts spent this session
    pub reconnect_attempts: u32,
    /// Negotiated network path, once known
    pub network_path: Option<NetworkPath>,
}

impl<I: PeerIdentity> CallSnapshot<I> {
    /// Elapsed call duration, zero until active
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.started_at
            .map(|start| Utc::now() - start)
            .unwrap_or_else(chrono::Duration::zero)
    }
}
