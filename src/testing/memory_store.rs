use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::calling::history::{CallHistoryEntry, CallHistorySink};
use crate::calling::signaling::{RecordTransaction, SignalingChannel, Subscription};
use crate::calling::types::{
    CallId, CallRecord, CallRecordPatch, CandidateDirection, ChangeKind, IceCandidate,
    RecordUpdate, RoomCallMarker, RoomChange, RoomId, RoomKind, SignalMessage, UserId,
};
use crate::errors::SignalingError;

struct RoomDoc {
    kind: RoomKind,
    members: BTreeSet<UserId>,
    display_name: Option<String>,
    marker: RoomCallMarker,
}

impl RoomDoc {
    fn change(&self, room_id: &RoomId, change: ChangeKind, previous: Option<CallId>) -> RoomChange {
        RoomChange {
            room_id: room_id.clone(),
            room_kind: self.kind,
            change,
            marker: self.marker.clone(),
            display_name: self.display_name.clone(),
            previous_call_id: previous,
        }
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<CallId, CallRecord>,
    record_subs: HashMap<CallId, Vec<mpsc::UnboundedSender<RecordUpdate>>>,
    record_writes: HashMap<CallId, Vec<CallRecordPatch>>,
    candidates: HashMap<(CallId, CandidateDirection), Vec<IceCandidate>>,
    candidate_subs: HashMap<(CallId, CandidateDirection), Vec<mpsc::UnboundedSender<IceCandidate>>>,
    signals: HashMap<CallId, Vec<SignalMessage>>,
    signal_subs: HashMap<CallId, Vec<(UserId, mpsc::UnboundedSender<SignalMessage>)>>,
    rooms: HashMap<RoomId, RoomDoc>,
    room_subs: Vec<(UserId, mpsc::UnboundedSender<RoomChange>)>,
    history: Vec<CallHistoryEntry>,
    fail_writes: bool,
}

impl StoreState {
    fn check_writable(&self) -> Result<(), SignalingError> {
        if self.fail_writes {
            Err(SignalingError::Unavailable("store rejected write".to_string()))
        } else {
            Ok(())
        }
    }

    fn current(&self, call_id: &CallId) -> RecordUpdate {
        match self.records.get(call_id) {
            Some(record) => RecordUpdate::Snapshot(record.clone()),
            None => RecordUpdate::Missing,
        }
    }

    fn notify_record(&mut self, call_id: &CallId) {
        let update = self.current(call_id);
        if let Some(subs) = self.record_subs.get_mut(call_id) {
            subs.retain(|tx| tx.send(update.clone()).is_ok());
        }
    }

    fn merge(&mut self, call_id: &CallId, patch: CallRecordPatch) {
        let record = self.records.entry(call_id.clone()).or_insert_with(|| {
            let room = patch.room_id.clone().unwrap_or_else(|| RoomId::new(""));
            CallRecord::empty(call_id.clone(), room, Utc::now())
        });
        record.apply(&patch);
        self.record_writes.entry(call_id.clone()).or_default().push(patch);
        self.notify_record(call_id);
    }

    fn notify_room(&mut self, room_id: &RoomId, change: ChangeKind, previous: Option<CallId>) {
        let Some(room) = self.rooms.get(room_id) else { return };
        let event = room.change(room_id, change, previous);
        self.room_subs.retain(|(user, tx)| {
            if room.members.contains(user) {
                tx.send(event.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

/// In-memory signaling store with the same observable contract as the
/// shared document store: field merges, ordered per-subscription delivery,
/// serialized transactions, and switchable write failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent write fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn create_room(&self, room_id: &RoomId, kind: RoomKind, members: &[&str], display_name: Option<&str>) {
        let mut state = self.state();
        state.rooms.insert(
            room_id.clone(),
            RoomDoc {
                kind,
                members: members.iter().map(|m| UserId::from(*m)).collect(),
                display_name: display_name.map(str::to_string),
                marker: RoomCallMarker::cleared(),
            },
        );
        state.notify_room(room_id, ChangeKind::Added, None);
    }

    /// Set a room marker without going through the fallible write path.
    pub fn update_marker_now(&self, room_id: &RoomId, marker: RoomCallMarker) {
        let mut state = self.state();
        let Some(room) = state.rooms.get_mut(room_id) else { return };
        let previous = std::mem::replace(&mut room.marker, marker).call_id;
        state.notify_room(room_id, ChangeKind::Modified, previous);
    }

    pub fn remove_room(&self, room_id: &RoomId) {
        let mut state = self.state();
        state.notify_room(room_id, ChangeKind::Removed, None);
        state.rooms.remove(room_id);
    }

    pub fn room_marker(&self, room_id: &RoomId) -> Option<RoomCallMarker> {
        self.state().rooms.get(room_id).map(|room| room.marker.clone())
    }

    pub fn insert_record(&self, record: CallRecord) {
        let mut state = self.state();
        let id = record.id.clone();
        state.records.insert(id.clone(), record);
        state.notify_record(&id);
    }

    pub fn delete_record(&self, call_id: &CallId) {
        let mut state = self.state();
        state.records.remove(call_id);
        state.notify_record(call_id);
    }

    pub fn record(&self, call_id: &CallId) -> Option<CallRecord> {
        self.state().records.get(call_id).cloned()
    }

    /// Every patch committed against `call_id`, in order.
    pub fn record_writes(&self, call_id: &CallId) -> Vec<CallRecordPatch> {
        self.state().record_writes.get(call_id).cloned().unwrap_or_default()
    }

    /// Committed patches that marked the call inactive.
    pub fn termination_writes(&self, call_id: &CallId) -> usize {
        self.record_writes(call_id)
            .iter()
            .filter(|patch| patch.active == Some(false))
            .count()
    }

    pub fn candidates(&self, call_id: &CallId, direction: CandidateDirection) -> Vec<IceCandidate> {
        self.state()
            .candidates
            .get(&(call_id.clone(), direction))
            .cloned()
            .unwrap_or_default()
    }

    pub fn signals(&self, call_id: &CallId) -> Vec<SignalMessage> {
        self.state().signals.get(call_id).cloned().unwrap_or_default()
    }

    pub fn history(&self) -> Vec<CallHistoryEntry> {
        self.state().history.clone()
    }
}

#[async_trait]
impl SignalingChannel for MemoryStore {
    async fn create_or_update_call_record(
        &self,
        call_id: &CallId,
        patch: CallRecordPatch,
    ) -> Result<(), SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        trace!(%call_id, ?patch, "merge call record");
        state.merge(call_id, patch);
        Ok(())
    }

    async fn get_call_record(&self, call_id: &CallId) -> Result<Option<CallRecord>, SignalingError> {
        Ok(self.record(call_id))
    }

    async fn subscribe_call_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordUpdate>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        // Receiver is alive, the initial send cannot fail.
        let _ = tx.send(state.current(call_id));
        state.record_subs.entry(call_id.clone()).or_default().push(tx);
        Ok(rx)
    }

    async fn transact_call_record(
        &self,
        call_id: &CallId,
        update: RecordTransaction<'_>,
    ) -> Result<Option<CallRecord>, SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        let Some(snapshot) = state.records.get(call_id).cloned() else {
            return Ok(None);
        };
        let patch = update(&snapshot);
        if !patch.is_empty() {
            state.merge(call_id, patch);
        }
        Ok(Some(snapshot))
    }

    async fn append_ice_candidate(
        &self,
        call_id: &CallId,
        direction: CandidateDirection,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        let key = (call_id.clone(), direction);
        if let Some(subs) = state.candidate_subs.get_mut(&key) {
            subs.retain(|tx| tx.send(candidate.clone()).is_ok());
        }
        state.candidates.entry(key).or_default().push(candidate);
        Ok(())
    }

    async fn subscribe_ice_candidates(
        &self,
        call_id: &CallId,
        direction: CandidateDirection,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let key = (call_id.clone(), direction);
        for candidate in state.candidates.get(&key).into_iter().flatten() {
            let _ = tx.send(candidate.clone());
        }
        state.candidate_subs.entry(key).or_default().push(tx);
        Ok(rx)
    }

    async fn send_signal(&self, call_id: &CallId, message: SignalMessage) -> Result<(), SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        if let Some(subs) = state.signal_subs.get_mut(call_id) {
            subs.retain(|(target, tx)| {
                if *target == message.target {
                    tx.send(message.clone()).is_ok()
                } else {
                    !tx.is_closed()
                }
            });
        }
        state.signals.entry(call_id.clone()).or_default().push(message);
        Ok(())
    }

    async fn subscribe_signals(
        &self,
        call_id: &CallId,
        self_id: &UserId,
    ) -> Result<Subscription<SignalMessage>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for message in state.signals.get(call_id).into_iter().flatten() {
            if message.target == *self_id {
                let _ = tx.send(message.clone());
            }
        }
        state.signal_subs.entry(call_id.clone()).or_default().push((self_id.clone(), tx));
        Ok(rx)
    }

    async fn update_room_marker(
        &self,
        room_id: &RoomId,
        marker: RoomCallMarker,
    ) -> Result<(), SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        let Some(room) = state.rooms.get_mut(room_id) else {
            return Err(SignalingError::Unavailable(format!("room {room_id} not found")));
        };
        let previous = std::mem::replace(&mut room.marker, marker).call_id;
        state.notify_room(room_id, ChangeKind::Modified, previous);
        Ok(())
    }

    async fn subscribe_rooms(&self, user: &UserId) -> Result<Subscription<RoomChange>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for (room_id, room) in &state.rooms {
            if room.members.contains(user) {
                let _ = tx.send(room.change(room_id, ChangeKind::Added, None));
            }
        }
        state.room_subs.push((user.clone(), tx));
        Ok(rx)
    }
}

#[async_trait]
impl CallHistorySink for MemoryStore {
    async fn record_call(&self, entry: CallHistoryEntry) -> Result<(), SignalingError> {
        let mut state = self.state();
        state.check_writable()?;
        state.history.push(entry);
        Ok(())
    }
}
