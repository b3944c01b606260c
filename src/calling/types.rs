use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SignalingError;

/// Identity of a user taking part in calls.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// A 1:1 chat or group room. Call markers live on the room document.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Identifier of one call attempt, unique across rooms and time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }
    };
}

string_id!(UserId);
string_id!(RoomId);
string_id!(CallId);

impl CallId {
    /// Derive a call id from its room and creation instant.
    pub fn derive(room: &RoomId, created_at: DateTime<Utc>) -> Self {
        CallId(format!("{}_{}", room, created_at.timestamp_millis()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Direct,
    Group,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side of the offer/answer handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate information used during negotiation. Field layout follows
/// the candidate-init dictionary peers exchange out of band.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The raw candidate line.
    pub candidate: String,
    /// Media identification string as used in SDP.
    pub sdp_mid: Option<String>,
    /// Media line index within the SDP description.
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// The shared signaling document for one call attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub room_id: RoomId,
    pub kind: CallKind,
    pub media: MediaKind,
    pub creator: UserId,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    /// Set by a callee that declined a direct call.
    #[serde(default)]
    pub rejected: bool,
    /// Direct calls only.
    pub offer: Option<SessionDescription>,
    /// Direct calls only.
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub video_enabled: BTreeMap<UserId, bool>,
    /// Group calls only.
    #[serde(default)]
    pub active_participants: BTreeSet<UserId>,
}

impl CallRecord {
    /// Seed a record for a store that has never seen `id`. Used when a
    /// merge patch arrives before anything else created the document.
    pub fn empty(id: CallId, room_id: RoomId, created_at: DateTime<Utc>) -> Self {
        CallRecord {
            id,
            room_id,
            kind: CallKind::Direct,
            media: MediaKind::Audio,
            creator: UserId::new(""),
            created_at,
            active: false,
            rejected: false,
            offer: None,
            answer: None,
            video_enabled: BTreeMap::new(),
            active_participants: BTreeSet::new(),
        }
    }

    /// Remote video defaults to on when a participant has not published a flag.
    pub fn video_enabled_for(&self, user: &UserId) -> bool {
        self.video_enabled.get(user).copied().unwrap_or(true)
    }

    /// Apply a field-level merge. Fields absent from the patch are untouched.
    pub fn apply(&mut self, patch: &CallRecordPatch) {
        if let Some(room_id) = &patch.room_id {
            self.room_id = room_id.clone();
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(media) = patch.media {
            self.media = media;
        }
        if let Some(creator) = &patch.creator {
            self.creator = creator.clone();
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
        if let Some(rejected) = patch.rejected {
            self.rejected = rejected;
        }
        if let Some(offer) = &patch.offer {
            self.offer = Some(offer.clone());
        }
        if let Some(answer) = &patch.answer {
            self.answer = Some(answer.clone());
        }
        for (user, enabled) in &patch.video_enabled {
            self.video_enabled.insert(user.clone(), *enabled);
        }
        match &patch.participants {
            Some(ParticipantUpdate::Replace(set)) => self.active_participants = set.clone(),
            Some(ParticipantUpdate::Add(user)) => {
                self.active_participants.insert(user.clone());
            }
            Some(ParticipantUpdate::Remove(user)) => {
                self.active_participants.remove(user);
            }
            None => {}
        }
    }
}

/// Change to the active-participant set carried by a patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Replace(BTreeSet<UserId>),
    /// Set union with a single member.
    Add(UserId),
    Remove(UserId),
}

/// Partial update to a [`CallRecord`]. Only populated fields are written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallRecordPatch {
    pub room_id: Option<RoomId>,
    pub kind: Option<CallKind>,
    pub media: Option<MediaKind>,
    pub creator: Option<UserId>,
    pub created_at: Option<DateTime<Utc>>,
    pub active: Option<bool>,
    pub rejected: Option<bool>,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub video_enabled: BTreeMap<UserId, bool>,
    pub participants: Option<ParticipantUpdate>,
}

impl CallRecordPatch {
    pub fn terminate() -> Self {
        CallRecordPatch { active: Some(false), ..Default::default() }
    }

    pub fn video_flag(user: &UserId, enabled: bool) -> Self {
        let mut patch = CallRecordPatch::default();
        patch.video_enabled.insert(user.clone(), enabled);
        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == CallRecordPatch::default()
    }
}

/// What a subscriber of a call record observes.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordUpdate {
    Snapshot(CallRecord),
    /// The record does not exist (never created, or deleted).
    Missing,
}

impl RecordUpdate {
    pub fn record(&self) -> Option<&CallRecord> {
        match self {
            RecordUpdate::Snapshot(record) => Some(record),
            RecordUpdate::Missing => None,
        }
    }

    /// Terminal notification: the record is gone or marked inactive.
    pub fn is_terminal(&self) -> bool {
        self.record().map_or(true, |record| !record.active)
    }
}

/// Which append-only candidate log a direct-call candidate belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateDirection {
    CallerToCallee,
    CalleeToCaller,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Point-to-point envelope used by group calls. Never mutated once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub sender: UserId,
    pub target: UserId,
    pub kind: SignalKind,
    /// Opaque to the store; bincode-encoded description or candidate.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Decoded contents of a [`SignalMessage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalBody {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    pub fn description(
        sender: UserId,
        target: UserId,
        description: &SessionDescription,
    ) -> Result<Self, SignalingError> {
        let kind = match description.kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
        };
        Ok(SignalMessage {
            sender,
            target,
            kind,
            payload: bincode::serialize(description)?,
            created_at: Utc::now(),
        })
    }

    pub fn candidate(
        sender: UserId,
        target: UserId,
        candidate: &IceCandidate,
    ) -> Result<Self, SignalingError> {
        Ok(SignalMessage {
            sender,
            target,
            kind: SignalKind::Candidate,
            payload: bincode::serialize(candidate)?,
            created_at: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<SignalBody, SignalingError> {
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let description: SessionDescription = bincode::deserialize(&self.payload)?;
                let expected = if self.kind == SignalKind::Offer { SdpKind::Offer } else { SdpKind::Answer };
                if description.kind != expected {
                    return Err(SignalingError::Codec(format!(
                        "{:?} envelope carries a {:?} description",
                        self.kind, description.kind
                    )));
                }
                Ok(SignalBody::Description(description))
            }
            SignalKind::Candidate => Ok(SignalBody::Candidate(bincode::deserialize(&self.payload)?)),
        }
    }
}

/// Call marker carried by a room document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCallMarker {
    pub call_active: bool,
    pub call_id: Option<CallId>,
    pub media: Option<MediaKind>,
    pub caller_id: Option<UserId>,
    pub caller_name: Option<String>,
}

impl RoomCallMarker {
    pub fn started(call_id: CallId, media: MediaKind, caller: &UserId, caller_name: &str) -> Self {
        RoomCallMarker {
            call_active: true,
            call_id: Some(call_id),
            media: Some(media),
            caller_id: Some(caller.clone()),
            caller_name: Some(caller_name.to_string()),
        }
    }

    pub fn cleared() -> Self {
        RoomCallMarker {
            call_active: false,
            call_id: None,
            media: None,
            caller_id: None,
            caller_name: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKind {
    Direct,
    Group,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A room-level change delivered to the incoming-call detector.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomChange {
    pub room_id: RoomId,
    pub room_kind: RoomKind,
    pub change: ChangeKind,
    pub marker: RoomCallMarker,
    /// Group name, used when the marker carries no caller name.
    pub display_name: Option<String>,
    /// The call id the marker held before this change, if any.
    pub previous_call_id: Option<CallId>,
}
