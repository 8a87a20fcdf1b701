//! Call service orchestration
//!
//! [`CallServiceBuilder`] wires a signaling transport, a peer connection
//! backend, a microphone source and a presenter into a running
//! [`CallManager`], and starts the loop that feeds inbound signaling into it.

use crate::call::{CallError, CallManager, EngineParts, SignalSink};
use crate::config::CallManagerConfig;
use crate::identity::PeerProfile;
use crate::media::MediaCapture;
use crate::peer::PeerConnectionFactory;
use crate::presenter::{NullPresenter, Presenter};
use crate::signaling::{SignalingHandler, SignalingTransport};
use std::sync::Arc;

/// Builder for a running [`CallManager`]
pub struct CallServiceBuilder<T: SignalingTransport> {
    transport: Arc<T>,
    config: CallManagerConfig,
    factory: Option<Arc<dyn PeerConnectionFactory>>,
    capture: Option<Arc<dyn MediaCapture>>,
    presenter: Arc<dyn Presenter>,
    local_profile: PeerProfile,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Create new builder over a signaling transport
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            config: CallManagerConfig::default(),
            factory: None,
            capture: None,
            presenter: Arc::new(NullPresenter),
            local_profile: PeerProfile::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the peer connection backend
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the microphone source
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Set the presentation layer
    #[must_use]
    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Profile sent to callees with every invitation
    #[must_use]
    pub fn with_local_profile(mut self, profile: PeerProfile) -> Self {
        self.local_profile = profile;
        self
    }

    /// Validate the configuration and start the call manager
    ///
    /// Must be called from within a tokio runtime. Without the
    /// `webrtc-backend` feature a peer factory and a capture source must be
    /// supplied.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a collaborator is missing
    pub async fn build(self) -> Result<CallManager<T::PeerId>, CallError> {
        self.config.validate()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_peer_factory()?,
        };
        let capture = match self.capture {
            Some(capture) => capture,
            None => default_capture()?,
        };

        let signaling = Arc::new(SignalingHandler::new(self.transport));
        let (manager, sink) = CallManager::spawn(EngineParts {
            config: self.config,
            signaling: signaling.clone(),
            factory,
            capture,
            presenter: self.presenter,
            local_profile: self.local_profile,
        });
        let pump = tokio::spawn(pump_signaling(signaling, sink));
        manager.set_pump(pump.abort_handle());

        tracing::info!("Call service started");
        Ok(manager)
    }
}

/// Deliver inbound signaling to the engine until it stops
async fn pump_signaling<T: SignalingTransport>(
    signaling: Arc<SignalingHandler<T>>,
    sink: SignalSink<T::PeerId>,
) {
    loop {
        match signaling.receive_message().await {
            Ok((from, message)) => {
                if !sink.deliver(from, message) {
                    break;
                }
            }
            Err(e) => {
                // the handler already backed off
                tracing::debug!(error = %e, "Signaling receive failed");
            }
        }
    }
    tracing::debug!("Signaling pump stopped");
}

#[cfg(feature = "webrtc-backend")]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, CallError> {
    Ok(Arc::new(crate::rtc::WebRtcPeerFactory::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, CallError> {
    Err(crate::config::ConfigError::MissingComponent("peer connection factory").into())
}

#[cfg(feature = "webrtc-backend")]
fn default_capture() -> Result<Arc<dyn MediaCapture>, CallError> {
    Ok(Arc::new(crate::rtc::SampleAudioCapture::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_capture() -> Result<Arc<dyn MediaCapture>, CallError> {
    Err(crate::config::ConfigError::MissingComponent("audio capture").into())
}
