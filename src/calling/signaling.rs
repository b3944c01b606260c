use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::calling::types::{
    CallId, CallRecord, CallRecordPatch, CandidateDirection, IceCandidate, RecordUpdate,
    RoomCallMarker, RoomChange, RoomId, SignalMessage, UserId,
};
use crate::errors::SignalingError;

/// Ordered stream of observations from one subscription.
pub type Subscription<T> = mpsc::UnboundedReceiver<T>;

/// Read-modify-write step run inside a store transaction. The store may run
/// it more than once if the record changes underneath it.
pub type RecordTransaction<'a> = &'a (dyn Fn(&CallRecord) -> CallRecordPatch + Send + Sync);

/// Access to call documents in the shared, eventually-consistent store.
///
/// Writes may fail transiently. Callers treat failures as non-fatal and do
/// not retry. Each subscription delivers in a consistent order, but nothing
/// orders deliveries across independent writers.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Field-level merge into the call record, creating it if absent.
    async fn create_or_update_call_record(
        &self,
        call_id: &CallId,
        patch: CallRecordPatch,
    ) -> Result<(), SignalingError>;

    async fn get_call_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, SignalingError>;

    /// Delivers the current state first, then every observed change.
    async fn subscribe_call_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordUpdate>, SignalingError>;

    /// Atomically read the record, compute a patch and write it. Returns the
    /// snapshot the committed patch was computed from, or `None` when the
    /// record does not exist (nothing is written then). No other transaction
    /// on the same record interleaves between the read and the write.
    async fn transact_call_record(
        &self,
        call_id: &CallId,
        update: RecordTransaction<'_>,
    ) -> Result<Option<CallRecord>, SignalingError>;

    async fn append_ice_candidate(
        &self,
        call_id: &CallId,
        direction: CandidateDirection,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// Delivers existing entries first, then each appended one.
    async fn subscribe_ice_candidates(
        &self,
        call_id: &CallId,
        direction: CandidateDirection,
    ) -> Result<Subscription<IceCandidate>, SignalingError>;

    async fn send_signal(&self, call_id: &CallId, message: SignalMessage) -> Result<(), SignalingError>;

    /// Only messages whose target is `self_id` are delivered.
    async fn subscribe_signals(
        &self,
        call_id: &CallId,
        self_id: &UserId,
    ) -> Result<Subscription<SignalMessage>, SignalingError>;

    async fn update_room_marker(
        &self,
        room_id: &RoomId,
        marker: RoomCallMarker,
    ) -> Result<(), SignalingError>;

    /// Changes to every room `user` belongs to.
    async fn subscribe_rooms(&self, user: &UserId) -> Result<Subscription<RoomChange>, SignalingError>;
}

/// Log a failed best-effort write. Returns whether the write succeeded.
pub(crate) fn best_effort(result: Result<(), SignalingError>, call_id: &CallId, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(%call_id, error = %e, "signaling write failed: {what}");
            false
        }
    }
}
