use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calling::types::{CallId, MediaKind, RoomId, UserId};
use crate::errors::SignalingError;

/// System message left in a room when a call ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryEntry {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub media: MediaKind,
    pub duration_secs: u64,
    pub author: UserId,
    pub is_group: bool,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl CallHistoryEntry {
    pub fn new(
        room_id: RoomId,
        call_id: CallId,
        media: MediaKind,
        duration: Duration,
        author: UserId,
        is_group: bool,
    ) -> Self {
        let duration_secs = duration.as_secs();
        CallHistoryEntry {
            text: format!("{} • {}", call_label(media), format_duration(duration_secs)),
            room_id,
            call_id,
            media,
            duration_secs,
            author,
            is_group,
            created_at: Utc::now(),
        }
    }

    /// A call that never connected is recorded with zero duration.
    pub fn is_missed(&self) -> bool {
        self.duration_secs == 0
    }

    /// Second line shown under the call title.
    pub fn summary(&self) -> String {
        if self.is_missed() {
            "Missed Call".to_string()
        } else {
            format_duration(self.duration_secs)
        }
    }
}

pub fn call_label(media: MediaKind) -> &'static str {
    match media {
        MediaKind::Video => "Video Call",
        MediaKind::Audio => "Voice Call",
    }
}

/// `m:ss`, minutes unbounded.
pub fn format_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Destination for call-history entries, separate from call records.
#[async_trait]
pub trait CallHistorySink: Send + Sync {
    async fn record_call(&self, entry: CallHistoryEntry) -> Result<(), SignalingError>;
}
