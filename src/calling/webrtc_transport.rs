//! [`MediaBackend`] backed by the pure-Rust `webrtc` stack.
//!
//! Capture is left to the embedding application: it feeds encoded samples
//! into the tracks exposed by [`WebRtcTracks`], and every peer connection
//! attached to the same [`LocalMedia`] forwards them.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::calling::media::{
    LinkId, LocalMedia, LocalTracks, MediaBackend, MediaRequest, PeerEvent, PeerEventSender, PeerTransport,
    RemoteTrack, TrackKind, TransportEvent, TransportState,
};
use crate::calling::types::{IceCandidate, SdpKind, SessionDescription, UserId};
use crate::config::{CallConfig, IceServer};
use crate::errors::TransportError;

const STREAM_ID: &str = "huddle";

/// Outgoing tracks shared by every peer connection of one call.
pub struct WebRtcTracks {
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcTracks {
    fn new(with_video: bool) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability { mime_type: MIME_TYPE_OPUS.to_owned(), ..Default::default() },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let video = with_video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability { mime_type: MIME_TYPE_VP8.to_owned(), ..Default::default() },
                "video".to_owned(),
                STREAM_ID.to_owned(),
            ))
        });
        WebRtcTracks {
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(with_video),
            stopped: AtomicBool::new(false),
        }
    }

    /// Track the application writes Opus samples into.
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    /// Track the application writes VP8 samples into, for video calls.
    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    /// Whether the capture loop should currently forward microphone samples.
    pub fn audio_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_live(&self) -> bool {
        self.video.is_some() && !self.stopped.load(Ordering::SeqCst) && self.video_enabled.load(Ordering::SeqCst)
    }
}

impl LocalTracks for WebRtcTracks {
    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn has_video(&self) -> bool {
        self.video.is_some()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates one `RTCPeerConnection` per remote participant.
#[derive(Clone, Debug)]
pub struct WebRtcBackend {
    ice_servers: Vec<IceServer>,
}

impl WebRtcBackend {
    pub fn new(config: &CallConfig) -> Self {
        WebRtcBackend { ice_servers: config.ice_servers.clone() }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration { ice_servers, ..Default::default() }
    }

    async fn build_peer(
        &self,
        link: LinkId,
        remote: &UserId,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<WebRtcPeer> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .context("Failed to create WebRTC peer connection")?,
        );

        let tracks = local
            .tracks()
            .as_any()
            .downcast_ref::<WebRtcTracks>()
            .context("Local media was not captured by the WebRTC backend")?;
        pc.add_track(tracks.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to attach audio track")?;
        if let Some(video) = tracks.video_track() {
            pc.add_track(video as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("Failed to attach video track")?;
        }

        register_handlers(&pc, link, remote, events);
        debug!("created peer connection {} to {}", link, remote);

        Ok(WebRtcPeer { pc, _local: local.clone() })
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, link: LinkId, remote: &UserId, events: PeerEventSender) {
    let emit = {
        let peer = remote.clone();
        move |tx: &PeerEventSender, event: TransportEvent| {
            let _ = tx.send(PeerEvent { link, peer: peer.clone(), event });
        }
    };

    let tx = events.clone();
    let on_state = emit.clone();
    let peer = remote.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        info!("peer connection to {} changed state: {}", peer, state);
        on_state(&tx, TransportEvent::ConnectionState(transport_state(state)));
        async {}.boxed()
    }));

    let tx = events.clone();
    let on_candidate = emit.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => on_candidate(&tx, TransportEvent::LocalCandidate(from_candidate_init(init))),
                Err(e) => warn!("dropping unserializable local candidate: {}", e),
            }
        }
        async {}.boxed()
    }));

    let tx = events;
    let on_track = emit;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        on_track(&tx, TransportEvent::RemoteTrack(RemoteTrack { id: track.id(), kind }));
        async {}.boxed()
    }));
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.context("Malformed session description")
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => anyhow::bail!("Unsupported session description type: {}", other),
    }
}

fn negotiation(e: anyhow::Error) -> TransportError {
    TransportError::Negotiation(format!("{:#}", e))
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire_local_media(&self, request: &MediaRequest) -> Result<LocalMedia, TransportError> {
        debug!("acquiring local media, video: {:?}", request.video);
        Ok(LocalMedia::new(WebRtcTracks::new(request.video.is_some())))
    }

    async fn create_peer(
        &self,
        link: LinkId,
        remote: &UserId,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let peer = self
            .build_peer(link, remote, local, events)
            .await
            .map_err(|e| TransportError::PeerConnection(format!("{:#}", e)))?;
        Ok(Box::new(peer))
    }
}

/// One `RTCPeerConnection`. Holds a handle on the local media so capture
/// outlives every connection still sending it.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    _local: LocalMedia,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.context("Failed to create SDP offer").map_err(negotiation)?;
        from_rtc_description(offer).map_err(negotiation)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.context("Failed to create SDP answer").map_err(negotiation)?;
        from_rtc_description(answer).map_err(negotiation)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = to_rtc_description(description).map_err(negotiation)?;
        self.pc
            .set_local_description(description)
            .await
            .context("Failed to set local description")
            .map_err(negotiation)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = to_rtc_description(description).map_err(negotiation)?;
        self.pc
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .context("Failed to add ICE candidate")
            .map_err(negotiation)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
            .map_err(|e| TransportError::PeerConnection(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn offline_backend() -> WebRtcBackend {
        WebRtcBackend { ice_servers: Vec::new() }
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(transport_state(RTCPeerConnectionState::Unspecified), TransportState::New);
        assert_eq!(transport_state(RTCPeerConnectionState::Connected), TransportState::Connected);
        assert_eq!(transport_state(RTCPeerConnectionState::Disconnected), TransportState::Disconnected);
        assert_eq!(transport_state(RTCPeerConnectionState::Failed), TransportState::Failed);
    }

    #[test]
    fn test_tracks_follow_toggles() {
        let media = LocalMedia::new(WebRtcTracks::new(true));
        let tracks = media.tracks().as_any().downcast_ref::<WebRtcTracks>().expect("webrtc tracks");
        assert!(tracks.audio_live());
        assert!(tracks.video_live());

        media.toggle_video();
        assert!(!tracks.video_live());
        media.stop();
        assert!(!tracks.audio_live());
    }

    #[tokio::test]
    async fn test_offer_carries_local_tracks() {
        let backend = offline_backend();
        let request = MediaRequest { video: Some(CallConfig::default().direct_video) };
        let local = backend.acquire_local_media(&request).await.expect("media");
        let (tx, _rx) = mpsc::unbounded_channel();

        let peer = backend
            .create_peer(LinkId::next(), &UserId::new("bob"), &local, tx)
            .await
            .expect("peer");
        let offer = peer.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        peer.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_foreign_media_is_rejected() {
        struct Foreign;
        impl LocalTracks for Foreign {
            fn set_audio_enabled(&self, _enabled: bool) {}
            fn set_video_enabled(&self, _enabled: bool) {}
            fn has_video(&self) -> bool {
                false
            }
            fn stop(&self) {}
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = offline_backend()
            .create_peer(LinkId::next(), &UserId::new("bob"), &LocalMedia::new(Foreign), tx)
            .await;
        assert!(matches!(result, Err(TransportError::PeerConnection(_))));
    }
}
