use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::calling::direct_call::{CallRole, DirectCall};
use crate::calling::group_call::GroupCall;
use crate::calling::signaling::{SignalingChannel, Subscription};
use crate::calling::types::{
    CallId, CallKind, CallRecordPatch, ChangeKind, MediaKind, RoomCallMarker, RoomChange, RoomId,
    RoomKind, UserId,
};
use crate::errors::Result;

/// Call ids already surfaced to the user. Bounded; the oldest id is
/// forgotten first, and an id is dropped as soon as its call ends.
#[derive(Debug, Clone)]
pub struct ProcessedCalls {
    capacity: usize,
    order: VecDeque<CallId>,
    ids: HashSet<CallId>,
}

impl ProcessedCalls {
    pub fn new(capacity: usize) -> Self {
        ProcessedCalls {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, call_id: &CallId) -> bool {
        if self.ids.contains(call_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(call_id.clone());
        self.ids.insert(call_id.clone());
        true
    }

    pub fn remove(&mut self, call_id: &CallId) -> bool {
        if self.ids.remove(call_id) {
            self.order.retain(|id| id != call_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.ids.contains(call_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A call someone else started in one of our rooms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingCall {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub kind: CallKind,
    pub media: MediaKind,
    pub caller_id: UserId,
    pub caller_name: String,
}

impl IncomingCall {
    /// Session parameters for answering a direct call.
    pub fn answer_as(&self, me: &UserId) -> DirectCall {
        DirectCall {
            call_id: self.call_id.clone(),
            room_id: self.room_id.clone(),
            local_user: me.clone(),
            remote_user: self.caller_id.clone(),
            role: CallRole::Callee,
            media: self.media,
        }
    }

    /// Session parameters for joining a group call.
    pub fn join_as(&self, me: &UserId) -> GroupCall {
        GroupCall {
            call_id: self.call_id.clone(),
            room_id: self.room_id.clone(),
            local_user: me.clone(),
            media: self.media,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingEvent {
    /// Show the incoming-call prompt.
    Ringing(IncomingCall),
    /// The call behind an earlier prompt has ended.
    Cancelled { room_id: RoomId, call_id: CallId },
}

/// Watches room markers and raises each incoming call once.
#[derive(Debug)]
pub struct IncomingCallDetector {
    user: UserId,
    processed: ProcessedCalls,
}

impl IncomingCallDetector {
    pub fn new(user: UserId, processed: ProcessedCalls) -> Self {
        IncomingCallDetector { user, processed }
    }

    pub fn processed(&self) -> &ProcessedCalls {
        &self.processed
    }

    /// Forget a call so the cache stays small. Returns whether it was known.
    pub fn on_call_ended(&mut self, call_id: &CallId) -> bool {
        self.processed.remove(call_id)
    }

    pub fn classify(&mut self, change: &RoomChange) -> Option<IncomingEvent> {
        match change.change {
            ChangeKind::Added => None,
            ChangeKind::Removed => {
                let call_id = change.marker.call_id.as_ref().or(change.previous_call_id.as_ref())?;
                self.cancelled(&change.room_id, call_id)
            }
            ChangeKind::Modified if !change.marker.call_active => {
                let call_id = change.previous_call_id.as_ref()?;
                self.cancelled(&change.room_id, call_id)
            }
            ChangeKind::Modified => self.ringing(change),
        }
    }

    fn cancelled(&mut self, room_id: &RoomId, call_id: &CallId) -> Option<IncomingEvent> {
        if !self.on_call_ended(call_id) {
            return None;
        }
        debug!(%call_id, %room_id, "incoming call cancelled");
        Some(IncomingEvent::Cancelled { room_id: room_id.clone(), call_id: call_id.clone() })
    }

    fn ringing(&mut self, change: &RoomChange) -> Option<IncomingEvent> {
        let RoomCallMarker { call_id, media, caller_id, caller_name, .. } = &change.marker;
        let (call_id, caller_id) = (call_id.as_ref()?, caller_id.as_ref()?);
        if *caller_id == self.user {
            return None;
        }
        if !self.processed.insert(call_id) {
            debug!(%call_id, "incoming call already surfaced");
            return None;
        }

        let kind = match change.room_kind {
            RoomKind::Direct => CallKind::Direct,
            RoomKind::Group => CallKind::Group,
        };
        let caller_name = match kind {
            CallKind::Group => change.display_name.clone().or_else(|| caller_name.clone()),
            CallKind::Direct => caller_name.clone(),
        }
        .unwrap_or_else(|| "Unknown".to_string());

        info!(%call_id, room_id = %change.room_id, %caller_id, ?kind, "incoming call");
        Some(IncomingEvent::Ringing(IncomingCall {
            room_id: change.room_id.clone(),
            call_id: call_id.clone(),
            kind,
            media: media.unwrap_or(MediaKind::Audio),
            caller_id: caller_id.clone(),
            caller_name,
        }))
    }

    /// Classify room changes until the subscription or the listener goes away.
    pub async fn run(mut self, mut rooms: Subscription<RoomChange>, events: mpsc::UnboundedSender<IncomingEvent>) {
        while let Some(change) = rooms.recv().await {
            if let Some(event) = self.classify(&change) {
                if events.send(event).is_err() {
                    debug!(user = %self.user, "incoming call listener dropped");
                    break;
                }
            }
        }
    }

    /// Subscribe to this user's rooms, then classify changes on a task.
    pub async fn spawn(
        self,
        channel: &dyn SignalingChannel,
    ) -> Result<(mpsc::UnboundedReceiver<IncomingEvent>, JoinHandle<()>)> {
        let rooms = channel.subscribe_rooms(&self.user).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((rx, tokio::spawn(self.run(rooms, tx))))
    }
}

/// Refuse an incoming call. A direct call is marked inactive and rejected
/// and its room marker cleared; declining a group call writes nothing.
pub async fn decline_incoming_call(channel: &dyn SignalingChannel, call: &IncomingCall) -> Result<()> {
    if call.kind == CallKind::Group {
        debug!(call_id = %call.call_id, "group call declined locally");
        return Ok(());
    }
    let patch = CallRecordPatch {
        active: Some(false),
        rejected: Some(true),
        ..Default::default()
    };
    channel.create_or_update_call_record(&call.call_id, patch).await?;
    channel.update_room_marker(&call.room_id, RoomCallMarker::cleared()).await?;
    info!(call_id = %call.call_id, "direct call declined");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::direct_call::start_direct_call;
    use crate::testing::MemoryStore;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn change(kind: RoomKind, change: ChangeKind, marker: RoomCallMarker, previous: Option<&str>) -> RoomChange {
        RoomChange {
            room_id: RoomId::from("room42"),
            room_kind: kind,
            change,
            marker,
            display_name: Some("Weekend".to_string()),
            previous_call_id: previous.map(CallId::from),
        }
    }

    fn started(call: &str, caller: &str) -> RoomCallMarker {
        RoomCallMarker::started(CallId::from(call), MediaKind::Video, &UserId::from(caller), "Alice")
    }

    fn detector() -> IncomingCallDetector {
        IncomingCallDetector::new(UserId::from("B"), ProcessedCalls::new(8))
    }

    #[test]
    fn test_rings_once_per_call() {
        let mut detector = detector();
        let raised = change(RoomKind::Direct, ChangeKind::Modified, started("room42_1", "A"), None);

        let event = detector.classify(&raised).expect("Should ring");
        assert_eq!(
            event,
            IncomingEvent::Ringing(IncomingCall {
                room_id: RoomId::from("room42"),
                call_id: CallId::from("room42_1"),
                kind: CallKind::Direct,
                media: MediaKind::Video,
                caller_id: UserId::from("A"),
                caller_name: "Alice".to_string(),
            })
        );
        assert_eq!(detector.classify(&raised), None);

        let cleared = change(RoomKind::Direct, ChangeKind::Modified, RoomCallMarker::cleared(), Some("room42_1"));
        assert_eq!(
            detector.classify(&cleared),
            Some(IncomingEvent::Cancelled { room_id: RoomId::from("room42"), call_id: CallId::from("room42_1") })
        );
        assert!(detector.processed().is_empty());
    }

    #[rstest]
    #[case::own_call(change(RoomKind::Direct, ChangeKind::Modified, started("room42_1", "B"), None))]
    #[case::initial_snapshot(change(RoomKind::Direct, ChangeKind::Added, started("room42_1", "A"), None))]
    #[case::unknown_clear(change(RoomKind::Direct, ChangeKind::Modified, RoomCallMarker::cleared(), Some("room42_0")))]
    #[case::no_call(change(RoomKind::Group, ChangeKind::Modified, RoomCallMarker::cleared(), None))]
    fn test_ignored_changes(#[case] room_change: RoomChange) {
        let mut detector = detector();
        assert_eq!(detector.classify(&room_change), None);
        assert!(detector.processed().is_empty());
    }

    #[test]
    fn test_group_call_uses_room_name() {
        let mut detector = detector();
        let raised = change(RoomKind::Group, ChangeKind::Modified, started("group1_1", "A"), None);
        let Some(IncomingEvent::Ringing(call)) = detector.classify(&raised) else {
            panic!("expected ringing");
        };
        assert_eq!(call.kind, CallKind::Group);
        assert_eq!(call.caller_name, "Weekend");
        assert_eq!(call.join_as(&UserId::from("B")).local_user, UserId::from("B"));
    }

    #[test]
    fn test_cache_is_bounded() {
        let mut processed = ProcessedCalls::new(2);
        assert!(processed.insert(&CallId::from("c1")));
        assert!(processed.insert(&CallId::from("c2")));
        assert!(!processed.insert(&CallId::from("c2")));
        assert!(processed.insert(&CallId::from("c3")));
        assert_eq!(processed.len(), 2);
        assert!(!processed.contains(&CallId::from("c1")));
        assert!(processed.remove(&CallId::from("c3")));
        assert!(!processed.remove(&CallId::from("c3")));
    }

    #[tokio::test]
    async fn test_detector_sees_started_call() {
        let store = MemoryStore::new();
        let room = RoomId::from("room42");
        store.create_room(&room, RoomKind::Direct, &["A", "B"], None);

        let (mut events, task) = detector().spawn(&store).await.expect("Should subscribe");
        let call_id = start_direct_call(&store, &room, &UserId::from("A"), "Alice", MediaKind::Audio)
            .await
            .expect("Should start call");

        let Some(IncomingEvent::Ringing(call)) = events.recv().await else {
            panic!("expected ringing");
        };
        assert_eq!(call.call_id, call_id);
        let answer = call.answer_as(&UserId::from("B"));
        assert_eq!(answer.role, CallRole::Callee);
        assert_eq!(answer.remote_user, UserId::from("A"));

        decline_incoming_call(&store, &call).await.expect("Should decline");
        assert_eq!(
            events.recv().await,
            Some(IncomingEvent::Cancelled { room_id: room.clone(), call_id: call_id.clone() })
        );
        let record = store.record(&call_id).expect("Should write record");
        assert!(!record.active);
        assert!(record.rejected);
        assert_eq!(store.room_marker(&room), Some(RoomCallMarker::cleared()));

        drop(events);
        store.update_marker_now(&room, started("room42_9", "A"));
        task.await.expect("Detector should stop cleanly");
    }

    #[tokio::test]
    async fn test_declining_group_call_writes_nothing() {
        let store = MemoryStore::new();
        let call = IncomingCall {
            room_id: RoomId::from("group1"),
            call_id: CallId::from("call7"),
            kind: CallKind::Group,
            media: MediaKind::Audio,
            caller_id: UserId::from("A"),
            caller_name: "Weekend".into(),
        };
        decline_incoming_call(&store, &call).await.expect("Should decline");
        assert!(store.record(&call.call_id).is_none());
        assert!(store.record_writes(&call.call_id).is_empty());
    }
}
