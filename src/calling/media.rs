use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::calling::types::{IceCandidate, MediaKind, SessionDescription, UserId};
use crate::config::VideoConstraints;
use crate::errors::TransportError;

/// Connection state reported by the underlying transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one incoming media track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(TransportState),
    RemoteTrack(RemoteTrack),
}

/// Distinguishes successive peer connections to the same participant so
/// late events from a closed one can be discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LinkId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Transport event tagged with the peer connection that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerEvent {
    pub link: LinkId,
    pub peer: UserId,
    pub event: TransportEvent,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// What to capture. Audio is always captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaRequest {
    pub video: Option<VideoConstraints>,
}

impl MediaRequest {
    pub fn for_call(media: MediaKind, video: VideoConstraints) -> Self {
        MediaRequest { video: media.is_video().then_some(video) }
    }
}

/// Capture hardware behind a [`LocalMedia`] handle.
pub trait LocalTracks: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn has_video(&self) -> bool;
    /// Release the capture hardware.
    fn stop(&self);
    /// Lets a backend recover its own track type when attaching to a peer.
    fn as_any(&self) -> &dyn Any;
}

struct LocalMediaInner {
    tracks: Box<dyn LocalTracks>,
    stopped: AtomicBool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl LocalMediaInner {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.tracks.stop();
        }
    }
}

impl Drop for LocalMediaInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reference-counted local stream. Every peer connection attached to it holds
/// a clone; hardware is released when the owner calls [`LocalMedia::stop`] or
/// when the last clone is dropped, never by a single peer leaving.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    pub fn new(tracks: impl LocalTracks + 'static) -> Self {
        let video = tracks.has_video();
        LocalMedia {
            inner: Arc::new(LocalMediaInner {
                tracks: Box::new(tracks),
                stopped: AtomicBool::new(false),
                audio_enabled: AtomicBool::new(true),
                video_enabled: AtomicBool::new(video),
            }),
        }
    }

    pub fn tracks(&self) -> &dyn LocalTracks {
        self.inner.tracks.as_ref()
    }

    pub fn has_video(&self) -> bool {
        self.inner.tracks.has_video()
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.inner.video_enabled.load(Ordering::SeqCst)
    }

    /// Flip the microphone. Returns the new state.
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.inner.audio_enabled.fetch_xor(true, Ordering::SeqCst);
        self.inner.tracks.set_audio_enabled(enabled);
        enabled
    }

    /// Flip the camera. Returns the new state; always `false` without video.
    pub fn toggle_video(&self) -> bool {
        if !self.has_video() {
            return false;
        }
        let enabled = !self.inner.video_enabled.fetch_xor(true, Ordering::SeqCst);
        self.inner.tracks.set_video_enabled(enabled);
        enabled
    }

    /// Idempotent.
    pub fn stop(&self) {
        debug!("stopping local media tracks");
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of live handles, the owner's included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("video", &self.has_video())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Factory for local media and peer connections.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire_local_media(&self, request: &MediaRequest) -> Result<LocalMedia, TransportError>;

    /// Create a peer connection to `remote` carrying `local`'s tracks. The
    /// transport reports candidates, state changes and remote tracks on
    /// `events`, tagged with `link`.
    async fn create_peer(
        &self,
        link: LinkId,
        remote: &UserId,
        local: &LocalMedia,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

/// One negotiated media session, with the standard offer/answer contract.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
