//! Media-Transport - Peer Connection hinter einem Trait
//!
//! Der Kern konfiguriert die Verbindung und beobachtet ihre Events;
//! die Implementierung für webrtc-rs steckt in `WebRtcTransport`.

use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection failed")]
    ConnectionFailed,

    #[error("Another call is still holding media resources")]
    HandleBusy,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::WebRTC(e.to_string())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungszustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

/// Events vom Transport (kommen auf dessen eigenem Scheduling-Kontext an)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lokal entdeckter Kandidat, sofort an den Partner weiterzuleiten
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack { kind: String },
}

/// Callback für Transport-Events
pub type TransportEvents = Arc<dyn Fn(TransportEvent) + Send + Sync>;

// ============================================================================
// TRAITS
// ============================================================================

/// Eine einzelne Peer Connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hängt einen lokalen Audio-Track an
    async fn attach_audio(&self, label: &str) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Kehrt zurück sobald ICE Gathering abgeschlossen ist
    async fn gathering_complete(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erstellt frische Peer Connections
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Erstellt `WebRtcTransport`s mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: TransportEvents) {
    let on_state = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        on_state(TransportEvent::StateChanged(s.into()));
        Box::pin(async {})
    }));

    // Trickle ICE: jeder Kandidat einzeln
    let on_candidate = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => on_candidate(TransportEvent::LocalCandidate(init.into())),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // TODO: eingehendes Opus dekodieren und abspielen sobald ein Decoder eingebunden ist
    let on_track = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = track.kind().to_string();
        tracing::info!("Received remote track: {:?}", track.codec());
        on_track(TransportEvent::RemoteTrack { kind });
        Box::pin(async {})
    }));
}

/// Peer Connection über webrtc-rs
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| TransportError::InvalidSdp(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidSdp(format!(
            "unexpected description type {other}"
        ))),
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_audio(&self, label: &str) -> Result<(), TransportError> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            label.to_string(),
            "callmatch".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn gathering_complete(&self) {
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Failed),
            PeerState::Failed
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Unspecified),
            PeerState::New
        );
    }

    #[test]
    fn test_invalid_sdp_is_rejected() {
        let err = to_rtc(SessionDescription::offer("not sdp")).unwrap_err();
        assert!(matches!(err, TransportError::InvalidSdp(_)));
    }

    #[tokio::test]
    async fn test_webrtc_offer_contains_audio() {
        let factory = WebRtcTransportFactory::new(Vec::new());
        let transport = factory.create(Arc::new(|_| {})).await.unwrap();
        transport.attach_audio("microphone").await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        transport.close().await.unwrap();
    }
}
