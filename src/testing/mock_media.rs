use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::calling::media::{
    LinkId, LocalMedia, LocalTracks, MediaBackend, MediaRequest, PeerEvent, PeerEventSender,
    PeerTransport, RemoteTrack, TrackKind, TransportEvent, TransportState,
};
use crate::calling::peer_link::SignalPublisher;
use crate::calling::types::{IceCandidate, SdpKind, SessionDescription, UserId};
use crate::errors::TransportError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockTracks {
    video: bool,
    stops: Arc<AtomicUsize>,
}

impl LocalTracks for MockTracks {
    fn set_audio_enabled(&self, _enabled: bool) {}

    fn set_video_enabled(&self, _enabled: bool) {}

    fn has_video(&self) -> bool {
        self.video
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct BackendInner {
    owner: UserId,
    auto_connect: AtomicBool,
    fail_media: AtomicBool,
    fail_negotiation: Arc<AtomicBool>,
    acquisitions: AtomicUsize,
    stops: Arc<AtomicUsize>,
    peers: Mutex<Vec<(UserId, MockPeer)>>,
}

/// Media backend that fabricates SDP and candidates. With auto-connect on,
/// a peer reports `Connected` and its remote tracks as soon as both
/// descriptions are set.
#[derive(Clone)]
pub struct MockMediaBackend {
    inner: Arc<BackendInner>,
}

impl MockMediaBackend {
    pub fn new(owner: &str) -> Self {
        MockMediaBackend {
            inner: Arc::new(BackendInner {
                owner: UserId::from(owner),
                auto_connect: AtomicBool::new(false),
                fail_media: AtomicBool::new(false),
                fail_negotiation: Arc::new(AtomicBool::new(false)),
                acquisitions: AtomicUsize::new(0),
                stops: Arc::new(AtomicUsize::new(0)),
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_auto_connect(self) -> Self {
        self.set_auto_connect(true);
        self
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.auto_connect.store(enabled, Ordering::SeqCst);
    }

    /// Refuse capture, as when permission is denied.
    pub fn fail_media(&self, fail: bool) {
        self.inner.fail_media.store(fail, Ordering::SeqCst);
    }

    /// Make offer and answer creation fail on every peer.
    pub fn fail_negotiation(&self, fail: bool) {
        self.inner.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<(UserId, MockPeer)> {
        lock(&self.inner.peers).clone()
    }

    /// Most recent peer created towards `remote`.
    pub fn peer_for(&self, remote: &UserId) -> Option<MockPeer> {
        lock(&self.inner.peers)
            .iter()
            .rev()
            .find(|(user, _)| user == remote)
            .map(|(_, peer)| peer.clone())
    }

    pub fn media_acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    /// How many times capture hardware was released.
    pub fn media_stop_count(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for MockMediaBackend {
    async fn acquire_local_media(&self, request: &MediaRequest) -> Result<LocalMedia, TransportError> {
        if self.inner.fail_media.load(Ordering::SeqCst) {
            return Err(TransportError::MediaAcquisition("permission denied".to_string()));
        }
        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::new(MockTracks {
            video: request.video.is_some(),
            stops: self.inner.stops.clone(),
        }))
    }

    async fn create_peer(
        &self,
        link: LinkId,
        remote: &UserId,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let peer = MockPeer::build(
            self.inner.owner.clone(),
            link,
            remote.clone(),
            local.has_video(),
            Some(events),
            self.inner.auto_connect.load(Ordering::SeqCst),
            self.inner.fail_negotiation.clone(),
        );
        lock(&self.inner.peers).push((remote.clone(), peer.clone()));
        Ok(Box::new(peer))
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    violations: usize,
    closes: usize,
    emitted_candidates: usize,
    connected: bool,
}

struct PeerInner {
    owner: UserId,
    link: LinkId,
    remote: UserId,
    video: bool,
    events: Option<PeerEventSender>,
    auto_connect: bool,
    fail_negotiation: Arc<AtomicBool>,
    state: Mutex<PeerState>,
}

/// Scripted peer connection. Records every candidate applied and counts
/// candidates that arrive before a remote description.
#[derive(Clone)]
pub struct MockPeer {
    inner: Arc<PeerInner>,
}

impl MockPeer {
    fn build(
        owner: UserId,
        link: LinkId,
        remote: UserId,
        video: bool,
        events: Option<PeerEventSender>,
        auto_connect: bool,
        fail_negotiation: Arc<AtomicBool>,
    ) -> Self {
        MockPeer {
            inner: Arc::new(PeerInner {
                owner,
                link,
                remote,
                video,
                events,
                auto_connect,
                fail_negotiation,
                state: Mutex::new(PeerState::default()),
            }),
        }
    }

    /// A peer with no event channel, for exercising a transport directly.
    pub fn detached() -> Self {
        MockPeer::build(
            UserId::from("local"),
            LinkId::next(),
            UserId::from("remote"),
            false,
            None,
            false,
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn link(&self) -> LinkId {
        self.inner.link
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner.state).applied.clone()
    }

    /// Candidates offered before any remote description was set.
    pub fn violations(&self) -> usize {
        lock(&self.inner.state).violations
    }

    pub fn close_count(&self) -> usize {
        lock(&self.inner.state).closes
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner.state).remote.clone()
    }

    /// Inject a transport event as if the network produced it.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(PeerEvent {
                link: self.inner.link,
                peer: self.inner.remote.clone(),
                event,
            });
        }
    }

    fn sdp(&self, kind: &str) -> String {
        let mut sdp = format!("v=0 {kind} o={} m=audio", self.inner.owner);
        if self.inner.video {
            sdp.push_str(" m=video");
        }
        sdp
    }

    fn check_negotiation(&self) -> Result<(), TransportError> {
        if self.inner.fail_negotiation.load(Ordering::SeqCst) {
            Err(TransportError::Negotiation("scripted negotiation failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&self, state: &mut PeerState) -> Vec<TransportEvent> {
        if !self.inner.auto_connect || state.connected || state.closes > 0 {
            return Vec::new();
        }
        let Some(remote) = &state.remote else { return Vec::new() };
        if state.local.is_none() {
            return Vec::new();
        }
        state.connected = true;

        let mut events = vec![
            TransportEvent::ConnectionState(TransportState::Connecting),
            TransportEvent::ConnectionState(TransportState::Connected),
            TransportEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-audio", self.inner.remote),
                kind: TrackKind::Audio,
            }),
        ];
        if remote.sdp.contains("m=video") {
            events.push(TransportEvent::RemoteTrack(RemoteTrack {
                id: format!("{}-video", self.inner.remote),
                kind: TrackKind::Video,
            }));
        }
        events
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_negotiation()?;
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check_negotiation()?;
        let state = lock(&self.inner.state);
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(self.sdp("answer"))),
            _ => Err(TransportError::Negotiation("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let events = {
            let mut state = lock(&self.inner.state);
            state.local = Some(description);
            state.emitted_candidates += 1;
            let mut events = vec![TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{}-{} 1 udp 2122260223 10.0.0.1 5000 typ host",
                self.inner.owner, state.emitted_candidates
            )))];
            events.extend(self.maybe_connect(&mut state));
            events
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let events = {
            let mut state = lock(&self.inner.state);
            state.remote = Some(description);
            self.maybe_connect(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = lock(&self.inner.state);
        if state.remote.is_none() {
            state.violations += 1;
            return Err(TransportError::Negotiation("remote description not set".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.inner.state).closes += 1;
        Ok(())
    }
}

/// What a [`RecordingPublisher`] was asked to send.
#[derive(Clone, Debug, PartialEq)]
pub enum Published {
    Offer(UserId, SessionDescription),
    Answer(UserId, SessionDescription),
    Candidate(UserId, IceCandidate),
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    log: Arc<Mutex<Vec<Published>>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Published> {
        lock(&self.log)
            .iter()
            .filter(|p| !matches!(p, Published::Candidate(..)))
            .cloned()
            .collect()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        lock(&self.log)
            .iter()
            .filter_map(|p| match p {
                Published::Candidate(_, c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalPublisher for RecordingPublisher {
    async fn publish_offer(&self, peer: &UserId, offer: &SessionDescription) {
        lock(&self.log).push(Published::Offer(peer.clone(), offer.clone()));
    }

    async fn publish_answer(&self, peer: &UserId, answer: &SessionDescription) {
        lock(&self.log).push(Published::Answer(peer.clone(), answer.clone()));
    }

    async fn publish_candidate(&self, peer: &UserId, candidate: &IceCandidate) {
        lock(&self.log).push(Published::Candidate(peer.clone(), candidate.clone()));
    }
}
