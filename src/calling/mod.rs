//! Call signaling, peer negotiation and session lifecycles.

pub mod types;
pub mod signaling;
pub mod media;
pub mod ice_buffer;
pub mod peer_link;
pub mod history;
pub mod events;
pub mod hangup;
pub mod context;
pub mod direct_call;
pub mod group_call;
pub mod incoming;

#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

pub use context::CallContext;
pub use direct_call::{start_direct_call, CallRole, DirectCall, DirectCallSession};
pub use events::{CallEvent, CallHandle, CallSummary, EndReason, SessionCommand, SessionState};
pub use group_call::{initiate_group_call, join_group_call, GroupCall, GroupCallSession};
pub use hangup::{HangupCoordinator, LeaveOutcome, Termination};
pub use history::{CallHistoryEntry, CallHistorySink};
pub use incoming::{decline_incoming_call, IncomingCall, IncomingCallDetector, IncomingEvent, ProcessedCalls};
pub use media::{LocalMedia, MediaBackend, PeerTransport};
pub use signaling::SignalingChannel;
pub use types::{CallId, CallKind, CallRecord, MediaKind, RoomId, UserId};

#[cfg(feature = "webrtc-transport")]
pub use webrtc_transport::WebRtcBackend;
