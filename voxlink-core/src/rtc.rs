//! Peer connection backend on the `webrtc` crate
//!
//! Local audio is an Opus [`TrackLocalStaticSample`] the application feeds
//! with encoded frames; remote audio is read off the RTP receiver and
//! republished as payload bytes.

use crate::config::{IceConfig, IceServer};
use crate::media::{
    AudioConstraints, CaptureError, MediaCapture, MediaStream, MediaTrack, TrackKind, TrackState,
};
use crate::peer::{PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, RtcPeer};
use crate::types::{
    IceCandidateInit, IceConnectionState, NetworkPath, PeerConnectionState, SdpKind,
    SessionDescription, SignalingState,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Sample rates Opus encodes natively
const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// RTP clock rate of Opus, independent of the capture rate
const OPUS_CLOCK_RATE: u32 = 48_000;

/// Payloads buffered per remote track subscriber
const REMOTE_PAYLOAD_CAPACITY: usize = 256;

fn backend(e: impl std::fmt::Display) -> PeerError {
    PeerError::Backend(e.to_string())
}

/// Outbound Opus track fed by the application
pub struct SampleAudioTrack {
    id: String,
    inner: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl std::fmt::Debug for SampleAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.enabled.load(Ordering::SeqCst))
            .field("ended", &self.ended.load(Ordering::SeqCst))
            .finish()
    }
}

impl SampleAudioTrack {
    fn new(id: String, stream_id: String, channels: u16) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: OPUS_CLOCK_RATE,
            channels,
            ..Default::default()
        };
        Self {
            inner: Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id)),
            id,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    /// Write one encoded Opus frame
    ///
    /// Returns `false` when the frame was dropped because the track is
    /// muted or stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the RTP writer fails
    pub async fn write_sample(
        &self,
        payload: Bytes,
        duration: Duration,
    ) -> Result<bool, PeerError> {
        if self.ended.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let sample = Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        self.inner.write_sample(&sample).await.map_err(backend)?;
        Ok(true)
    }

    fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl MediaTrack for SampleAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Microphone source producing [`SampleAudioTrack`]s
///
/// The application encodes audio itself and writes frames into the track;
/// this only checks that the constraints describe an Opus-compatible input.
#[derive(Debug, Default)]
pub struct SampleAudioCapture;

impl SampleAudioCapture {
    /// Create new capture source
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for SampleAudioCapture {
    async fn capture(&self, constraints: &AudioConstraints) -> Result<MediaStream, CaptureError> {
        if let Some(rate) = constraints.sample_rate {
            if !OPUS_SAMPLE_RATES.contains(&rate) {
                return Err(CaptureError::ConstraintsUnsatisfiable(format!(
                    "sample rate {rate} Hz"
                )));
            }
        }
        let channels = constraints.channel_count.unwrap_or(1);
        if !(1..=2).contains(&channels) {
            return Err(CaptureError::ConstraintsUnsatisfiable(format!(
                "{channels} channels"
            )));
        }

        let stream_id = format!("voxlink-{}", uuid::Uuid::new_v4());
        let track = SampleAudioTrack::new(
            format!("audio-{}", uuid::Uuid::new_v4()),
            stream_id.clone(),
            channels,
        );
        tracing::debug!(stream_id = %stream_id, track = %track.id, channels, "Opus track created");
        Ok(MediaStream::new(
            stream_id,
            vec![Arc::new(track) as Arc<dyn MediaTrack>],
        ))
    }
}

struct RemoteState {
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// Inbound track read off an RTP receiver
pub struct RemoteAudioTrack {
    id: String,
    kind: TrackKind,
    state: Arc<RemoteState>,
    payloads: broadcast::Sender<Bytes>,
    reader: AbortHandle,
}

impl std::fmt::Debug for RemoteAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAudioTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ended", &self.state.ended.load(Ordering::SeqCst))
            .finish()
    }
}

impl RemoteAudioTrack {
    fn spawn(track: Arc<TrackRemote>) -> Self {
        let id = track.id();
        let kind = if track.kind() == RTPCodecType::Video {
            TrackKind::Video
        } else {
            TrackKind::Audio
        };
        let state = Arc::new(RemoteState {
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        });
        let (payloads, _) = broadcast::channel(REMOTE_PAYLOAD_CAPACITY);

        let reader_state = state.clone();
        let reader_tx = payloads.clone();
        let track_id = id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        if reader_state.enabled.load(Ordering::SeqCst) {
                            let _ = reader_tx.send(packet.payload);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(track = %track_id, error = %e, "Remote track ended");
                        break;
                    }
                }
            }
            reader_state.ended.store(true, Ordering::SeqCst);
        })
        .abort_handle();

        Self {
            id,
            kind,
            state,
            payloads,
            reader,
        }
    }

    /// Stream of RTP payloads received on this track
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.payloads.subscribe()
    }
}

impl MediaTrack for RemoteAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn state(&self) -> TrackState {
        if self.state.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.reader.abort();
        self.state.ended.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates `webrtc` peer connections with the default codecs and interceptors
#[derive(Debug, Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create new factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice.servers.iter().map(rtc_ice_server).collect(),
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);
        tracing::debug!(servers = ice.servers.len(), "Peer connection created");
        Ok(Arc::new(WebRtcPeer::new(pc, events)))
    }
}

/// [`RtcPeer`] over an `RTCPeerConnection`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(String, Arc<RTCRtpSender>)>>,
    remote: Arc<Mutex<Vec<Arc<RemoteAudioTrack>>>>,
}

impl WebRtcPeer {
    fn new(pc: Arc<RTCPeerConnection>, events: PeerEventSender) -> Self {
        let remote = Arc::new(Mutex::new(Vec::new()));
        install_handlers(&pc, &events, &remote);
        Self {
            pc,
            senders: Mutex::new(Vec::new()),
            remote,
        }
    }

    fn sample_track(
        track: &Arc<dyn MediaTrack>,
    ) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
        track
            .as_any()
            .downcast_ref::<SampleAudioTrack>()
            .map(SampleAudioTrack::local)
            .ok_or(PeerError::Unsupported("tracks not created by SampleAudioCapture"))
    }
}

fn install_handlers(
    pc: &RTCPeerConnection,
    events: &PeerEventSender,
    remote: &Arc<Mutex<Vec<Arc<RemoteAudioTrack>>>>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate.map(|c| c.to_json()).transpose() {
            Ok(init) => tx.send(PeerEvent::IceCandidate(init.map(from_rtc_candidate))),
            Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        tx.send(PeerEvent::IceConnectionStateChange(ice_state(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tx.send(PeerEvent::ConnectionStateChange(connection_state(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        tx.send(PeerEvent::SignalingStateChange(signaling_state(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        tx.send(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    let registry = remote.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let remote = Arc::new(RemoteAudioTrack::spawn(track));
            tracing::debug!(track = %remote.id, kind = ?remote.kind, "Remote track started");
            registry.lock().push(remote.clone());
            tx.send(PeerEvent::Track(remote));
            Box::pin(async {})
        },
    ));
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(backend)
        }
    };
    rtc.map_err(|e| PeerError::Negotiation(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Negotiation("unspecified description type".into()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

/// Classify a nominated pair by its candidate types
fn classify_path(local: RTCIceCandidateType, remote: RTCIceCandidateType) -> NetworkPath {
    match (local, remote) {
        (RTCIceCandidateType::Relay, _) | (_, RTCIceCandidateType::Relay) => NetworkPath::Relayed,
        (RTCIceCandidateType::Host, RTCIceCandidateType::Host) => NetworkPath::Direct,
        _ => NetworkPath::Translated,
    }
}

/// Path of the nominated candidate pair in a stats report
fn nominated_path(report: &StatsReport) -> Option<NetworkPath> {
    let mut local = HashMap::new();
    let mut remote = HashMap::new();
    let mut nominated = None;
    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                nominated = Some((
                    pair.local_candidate_id.clone(),
                    pair.remote_candidate_id.clone(),
                ));
            }
            StatsReportType::LocalCandidate(c) => {
                local.insert(c.id.clone(), RTCIceCandidateType::from(c.candidate_type));
            }
            StatsReportType::RemoteCandidate(c) => {
                remote.insert(c.id.clone(), RTCIceCandidateType::from(c.candidate_type));
            }
            _ => {}
        }
    }
    let (local_id, remote_id) = nominated?;
    Some(classify_path(*local.get(&local_id)?, *remote.get(&remote_id)?))
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream_id: &str,
    ) -> Result<(), PeerError> {
        let local = Self::sample_track(&track)?;
        let sender = self.pc.add_track(local).await.map_err(backend)?;
        tracing::debug!(track = track.id(), stream_id, "Local track added");
        self.senders.lock().push((track.id().to_string(), sender));
        Ok(())
    }

    async fn replace_track(
        &self,
        old_track_id: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<bool, PeerError> {
        let sender = self
            .senders
            .lock()
            .iter()
            .find(|(id, _)| id == old_track_id)
            .map(|(_, sender)| sender.clone());
        let Some(sender) = sender else {
            return Ok(false);
        };
        let local = Self::sample_track(&track)?;
        sender.replace_track(Some(local)).await.map_err(backend)?;
        for entry in self.senders.lock().iter_mut() {
            if entry.0 == old_track_id {
                entry.0 = track.id().to_string();
            }
        }
        Ok(true)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn receivers(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.remote
            .lock()
            .iter()
            .filter(|t| t.is_live())
            .map(|t| t.clone() as Arc<dyn MediaTrack>)
            .collect()
    }

    async fn selected_path(&self) -> Option<NetworkPath> {
        nominated_path(&self.pc.get_stats().await)
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_state(self.pc.ice_connection_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), PeerError> {
        for track in self.remote.lock().drain(..) {
            track.stop();
        }
        self.senders.lock().clear();
        self.pc.close().await.map_err(backend)
    }
}
