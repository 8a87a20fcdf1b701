//! Voxlink - call signaling and peer connection lifecycle for 1:1 voice calls
//!
//! This library drives a single audio call between two peers that meet over
//! a signaling relay and exchange media peer-to-peer. It features:
//!
//! - **Call State Machine**: idle, calling, ringing, active and ended, with
//!   answer and ring timeouts and automatic busy rejection
//! - **Peer Connection Manager**: offer/answer, candidate buffering and a
//!   canonical remote stream built from live tracks only
//! - **Recovery**: bounded ICE restarts, remote track recovery and local
//!   microphone re-capture
//! - **Pluggable seams**: signaling transport, peer connection backend,
//!   microphone source and presentation layer are all traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use voxlink_core::loopback::{LoopbackPeerFactory, MemoryRelay, SyntheticCapture};
//! use voxlink_core::{CallServiceBuilder, PeerIdentityString, PeerProfile};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let alice = CallServiceBuilder::new(Arc::new(relay.connect("alice")))
//!     .with_peer_factory(Arc::new(LoopbackPeerFactory::new()))
//!     .with_capture(Arc::new(SyntheticCapture::new()))
//!     .with_local_profile(PeerProfile::named("Alice"))
//!     .build()
//!     .await?;
//!
//! let call_id = alice
//!     .initiate_call(PeerIdentityString::new("bob"), PeerProfile::named("Bob"))
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Call manager configuration
pub mod config;

/// Media capture adapter
pub mod media;

/// Signaling protocol and handlers
pub mod signaling;

/// Peer connection manager
pub mod peer;

/// Track liveness monitoring
pub mod monitor;

/// Presentation adapter
pub mod presenter;

/// Connection and track recovery
pub mod recovery;

/// Call state machine
pub mod call;

/// Call service builder
pub mod service;

/// In-process signaling relay, peer connection and capture backends
pub mod loopback;

/// Peer connection backend on the `webrtc` crate
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use call::{CallError, CallManager};
pub use config::{CallManagerConfig, ConfigError, IceConfig, IceServer, RecoveryConfig};
pub use identity::{PeerIdentity, PeerIdentityString, PeerProfile};
pub use media::{
    AudioConstraints, CaptureError, DeviceClass, MediaCapture, MediaStream, MediaTrack, TrackKind,
    TrackState,
};
pub use peer::{PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, RtcPeer};
pub use presenter::{NullPresenter, Presenter};
pub use recovery::ReconnectionBudget;
#[cfg(feature = "webrtc-backend")]
pub use rtc::{SampleAudioCapture, SampleAudioTrack, WebRtcPeerFactory};
pub use service::CallServiceBuilder;
pub use signaling::{
    RejectReason, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager};
    pub use crate::config::CallManagerConfig;
    pub use crate::identity::{PeerIdentity, PeerIdentityString, PeerProfile};
    pub use crate::media::{MediaCapture, MediaStream};
    pub use crate::peer::PeerConnectionFactory;
    pub use crate::presenter::Presenter;
    pub use crate::service::CallServiceBuilder;
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::types::{CallEvent, CallId, CallState, EndReason, ErrorCategory};
}
