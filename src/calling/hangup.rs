use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::calling::history::{CallHistoryEntry, CallHistorySink};
use crate::calling::signaling::{best_effort, SignalingChannel};
use crate::calling::types::{
    CallId, CallRecord, CallRecordPatch, MediaKind, ParticipantUpdate, RoomCallMarker, RoomId,
    UserId,
};
use crate::errors::Result;

/// What leaving a group call means, decided from one consistent read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeavePlan {
    /// Nobody else remains: close the call and record history.
    LastOut { duration: Duration },
    /// Others remain: write back the reduced set only.
    Leave { remaining: BTreeSet<UserId> },
    /// Someone already closed the call; write nothing.
    AlreadyEnded,
}

/// Decide how `me` leaves, given the record as read inside the transaction.
pub fn plan_leave(record: &CallRecord, me: &UserId, now: DateTime<Utc>) -> LeavePlan {
    if !record.active {
        return LeavePlan::AlreadyEnded;
    }
    let remaining: BTreeSet<UserId> =
        record.active_participants.iter().filter(|user| *user != me).cloned().collect();
    if remaining.is_empty() {
        let elapsed = (now - record.created_at).to_std().unwrap_or_default();
        LeavePlan::LastOut { duration: Duration::from_secs(elapsed.as_secs()) }
    } else {
        LeavePlan::Leave { remaining }
    }
}

pub fn leave_patch(plan: &LeavePlan) -> CallRecordPatch {
    match plan {
        LeavePlan::LastOut { .. } => CallRecordPatch {
            active: Some(false),
            participants: Some(ParticipantUpdate::Replace(BTreeSet::new())),
            ..Default::default()
        },
        LeavePlan::Leave { remaining } => CallRecordPatch {
            participants: Some(ParticipantUpdate::Replace(remaining.clone())),
            ..Default::default()
        },
        LeavePlan::AlreadyEnded => CallRecordPatch::default(),
    }
}

/// How a direct call's terminating transaction went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// This side's write ended the call.
    Committed,
    /// The record was already inactive; nothing was written.
    AlreadyEnded,
    RecordMissing,
    Failed,
}

impl Termination {
    pub fn committed(self) -> bool {
        self == Termination::Committed
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// This participant closed the call.
    LastOut { duration: Duration, history_recorded: bool },
    Left { remaining: BTreeSet<UserId> },
    AlreadyEnded,
    RecordMissing,
}

/// Exit bookkeeping: exactly one terminating write and one history entry
/// per call, however participants race to leave.
#[derive(Clone)]
pub struct HangupCoordinator {
    channel: Arc<dyn SignalingChannel>,
    history: Arc<dyn CallHistorySink>,
}

impl HangupCoordinator {
    pub fn new(channel: Arc<dyn SignalingChannel>, history: Arc<dyn CallHistorySink>) -> Self {
        HangupCoordinator { channel, history }
    }

    /// Leave a group call inside one store transaction. The history entry is
    /// written afterwards, only by the participant that closed the call.
    pub async fn leave_group_call(&self, call_id: &CallId, me: &UserId) -> Result<LeaveOutcome> {
        let now = Utc::now();
        let leaver = me.clone();
        let update = move |record: &CallRecord| leave_patch(&plan_leave(record, &leaver, now));

        let Some(record) = self.channel.transact_call_record(call_id, &update).await? else {
            return Ok(LeaveOutcome::RecordMissing);
        };

        match plan_leave(&record, me, now) {
            LeavePlan::LastOut { duration } => {
                info!(%call_id, participant = %me, secs = duration.as_secs(), "last participant left, call closed");
                let entry = CallHistoryEntry::new(
                    record.room_id.clone(),
                    call_id.clone(),
                    record.media,
                    duration,
                    me.clone(),
                    true,
                );
                let history_recorded =
                    best_effort(self.history.record_call(entry).await, call_id, "call history");
                best_effort(
                    self.channel.update_room_marker(&record.room_id, RoomCallMarker::cleared()).await,
                    call_id,
                    "clear room marker",
                );
                Ok(LeaveOutcome::LastOut { duration, history_recorded })
            }
            LeavePlan::Leave { remaining } => {
                info!(%call_id, participant = %me, remaining = remaining.len(), "left group call");
                Ok(LeaveOutcome::Left { remaining })
            }
            LeavePlan::AlreadyEnded => Ok(LeaveOutcome::AlreadyEnded),
        }
    }

    /// Terminating write for a direct call. The record is marked inactive
    /// inside a transaction, so when both sides end the call at once only one
    /// write commits. The room marker is cleared unless the other side
    /// already ended the call.
    pub async fn terminate_direct_call(&self, call_id: &CallId, room_id: &RoomId) -> Termination {
        let update = |record: &CallRecord| {
            if record.active {
                CallRecordPatch::terminate()
            } else {
                CallRecordPatch::default()
            }
        };

        let termination = match self.channel.transact_call_record(call_id, &update).await {
            Ok(Some(before)) if before.active => Termination::Committed,
            Ok(Some(_)) => Termination::AlreadyEnded,
            Ok(None) => Termination::RecordMissing,
            Err(e) => {
                warn!(%call_id, error = %e, "signaling write failed: terminate call");
                Termination::Failed
            }
        };

        match termination {
            Termination::AlreadyEnded => {
                debug!(%call_id, "call already ended by the other side");
            }
            _ => {
                best_effort(
                    self.channel.update_room_marker(room_id, RoomCallMarker::cleared()).await,
                    call_id,
                    "clear room marker",
                );
            }
        }
        termination
    }

    pub async fn record_direct_history(
        &self,
        room_id: &RoomId,
        call_id: &CallId,
        media: MediaKind,
        duration: Duration,
        author: &UserId,
    ) -> bool {
        let entry =
            CallHistoryEntry::new(room_id.clone(), call_id.clone(), media, duration, author.clone(), false);
        best_effort(self.history.record_call(entry).await, call_id, "call history")
    }
}
