use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::calling::context::CallContext;
use crate::calling::events::{
    CallEvent, CallHandle, CallSummary, EndReason, EventSink, SessionCommand, SessionState,
};
use crate::calling::hangup::LeaveOutcome;
use crate::calling::media::{LocalMedia, MediaRequest, PeerEvent, PeerEventSender};
use crate::calling::peer_link::{LinkNotice, LinkPhase, MediaOwnership, PeerLink, SignalPublisher};
use crate::calling::signaling::{best_effort, SignalingChannel, Subscription};
use crate::calling::types::{
    CallId, CallKind, CallRecord, CallRecordPatch, IceCandidate, MediaKind, ParticipantUpdate,
    RecordUpdate, RoomCallMarker, RoomId, SdpKind, SessionDescription, SignalBody, SignalMessage,
    UserId,
};
use crate::errors::{CallError, Result, SignalingError};

const EVERYONE_LEFT_TITLE: &str = "Call Ended";
const EVERYONE_LEFT_MESSAGE: &str = "Everyone left the call.";

/// Open a group call in `room_id` with the caller as its only participant
/// and raise the room's call marker.
pub async fn initiate_group_call(
    channel: &dyn SignalingChannel,
    room_id: &RoomId,
    caller: &UserId,
    caller_name: &str,
    media: MediaKind,
) -> Result<CallId> {
    let created_at = Utc::now();
    let call_id = CallId::derive(room_id, created_at);
    let patch = CallRecordPatch {
        room_id: Some(room_id.clone()),
        kind: Some(CallKind::Group),
        media: Some(media),
        creator: Some(caller.clone()),
        created_at: Some(created_at),
        active: Some(true),
        participants: Some(ParticipantUpdate::Replace([caller.clone()].into_iter().collect())),
        ..Default::default()
    };
    channel.create_or_update_call_record(&call_id, patch).await?;
    channel
        .update_room_marker(room_id, RoomCallMarker::started(call_id.clone(), media, caller, caller_name))
        .await?;
    info!(%call_id, %room_id, %caller, ?media, "group call started");
    Ok(call_id)
}

/// Add `user` to the active participants (set union) and publish its
/// initial video flag.
pub async fn join_group_call(
    channel: &dyn SignalingChannel,
    call_id: &CallId,
    user: &UserId,
    video_enabled: bool,
) -> std::result::Result<(), SignalingError> {
    let patch = CallRecordPatch {
        participants: Some(ParticipantUpdate::Add(user.clone())),
        ..CallRecordPatch::video_flag(user, video_enabled)
    };
    channel.create_or_update_call_record(call_id, patch).await
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCall {
    pub call_id: CallId,
    pub room_id: RoomId,
    pub local_user: UserId,
    pub media: MediaKind,
}

/// Sends offers, answers and candidates as point-to-point signals.
struct GroupPublisher {
    channel: Arc<dyn SignalingChannel>,
    call_id: CallId,
    local_user: UserId,
}

impl GroupPublisher {
    async fn send(&self, message: std::result::Result<SignalMessage, SignalingError>, what: &str) {
        match message {
            Ok(message) => {
                best_effort(self.channel.send_signal(&self.call_id, message).await, &self.call_id, what);
            }
            Err(e) => warn!(call_id = %self.call_id, error = %e, "could not encode {what}"),
        }
    }
}

#[async_trait]
impl SignalPublisher for GroupPublisher {
    async fn publish_offer(&self, peer: &UserId, offer: &SessionDescription) {
        self.send(SignalMessage::description(self.local_user.clone(), peer.clone(), offer), "offer")
            .await;
    }

    async fn publish_answer(&self, peer: &UserId, answer: &SessionDescription) {
        self.send(SignalMessage::description(self.local_user.clone(), peer.clone(), answer), "answer")
            .await;
    }

    async fn publish_candidate(&self, peer: &UserId, candidate: &IceCandidate) {
        self.send(SignalMessage::candidate(self.local_user.clone(), peer.clone(), candidate), "candidate")
            .await;
    }
}

#[derive(Clone, Copy, Debug)]
struct Exit {
    reason: EndReason,
    /// Leave through the coordinator rather than just tearing down.
    leave: bool,
}

/// This participant's side of a mesh call: one [`PeerLink`] per remote
/// participant, all sharing a single local stream.
pub struct GroupCallSession {
    ctx: CallContext,
    call: GroupCall,
}

impl GroupCallSession {
    pub fn new(ctx: CallContext, call: GroupCall) -> Self {
        GroupCallSession { ctx, call }
    }

    pub fn spawn(self) -> CallHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let call_id = self.call.call_id.clone();
        let task = tokio::spawn(self.run(command_rx, EventSink::new(event_tx)));
        CallHandle::new(call_id, command_tx, event_rx, task)
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: EventSink,
    ) -> CallSummary {
        let GroupCallSession { ctx, call } = self;
        events.emit(CallEvent::StateChanged { call_id: call.call_id.clone(), state: SessionState::Initializing });

        let mut mesh = match Mesh::start(ctx, call.clone(), events.clone()).await {
            Ok(mesh) => mesh,
            Err(e) => {
                error!(call_id = %call.call_id, error = %e, "group call could not start");
                events.emit(CallEvent::Failed { call_id: call.call_id.clone(), reason: e.to_string() });
                events.emit(CallEvent::StateChanged { call_id: call.call_id.clone(), state: SessionState::Ended });
                events.emit(CallEvent::Ended {
                    call_id: call.call_id.clone(),
                    reason: EndReason::Failed,
                    duration: Duration::ZERO,
                });
                return CallSummary::new(call.call_id, EndReason::Failed, Duration::ZERO, false, Vec::new());
            }
        };

        let exit = mesh.drive(&mut commands).await;
        mesh.finish(exit).await
    }
}

struct Mesh {
    ctx: CallContext,
    call: GroupCall,
    events: EventSink,
    local: LocalMedia,
    publisher: Arc<GroupPublisher>,
    links: HashMap<UserId, PeerLink>,
    transport_tx: PeerEventSender,
    transport_rx: mpsc::UnboundedReceiver<PeerEvent>,
    record_rx: Subscription<RecordUpdate>,
    signal_rx: Subscription<SignalMessage>,
    /// Participant set from the last snapshot.
    participants: BTreeSet<UserId>,
    /// Offers to the members listed at join time have been sent.
    resolved: bool,
    /// More than one participant was active at some point.
    has_someone_joined: bool,
    /// Signals written before this session joined belong to an earlier
    /// session of the same user and are dropped.
    signal_cutoff: DateTime<Utc>,
    /// Send time of the last offer answered per peer.
    answered_offers: HashMap<UserId, DateTime<Utc>>,
    connected_at: Option<Instant>,
    remote_video: HashMap<UserId, bool>,
}

impl Mesh {
    async fn start(ctx: CallContext, call: GroupCall, events: EventSink) -> Result<Self> {
        let signal_cutoff = match ctx.channel.get_call_record(&call.call_id).await? {
            // Listed before joining: the initiator, whose peers may already
            // be signalling.
            Some(record) if record.active && record.active_participants.contains(&call.local_user) => {
                record.created_at
            }
            Some(record) if record.active => Utc::now(),
            Some(_) => {
                return Err(CallError::General(format!("group call {} is no longer active", call.call_id)))
            }
            None => return Err(SignalingError::RecordNotFound(call.call_id.clone()).into()),
        };

        let request = MediaRequest::for_call(call.media, ctx.config.group_video);
        let local = ctx.backend.acquire_local_media(&request).await?;

        best_effort(
            join_group_call(ctx.channel.as_ref(), &call.call_id, &call.local_user, local.video_enabled()).await,
            &call.call_id,
            "join group call",
        );

        let record_rx = ctx.channel.subscribe_call_record(&call.call_id).await?;
        let signal_rx = ctx.channel.subscribe_signals(&call.call_id, &call.local_user).await?;
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(GroupPublisher {
            channel: ctx.channel.clone(),
            call_id: call.call_id.clone(),
            local_user: call.local_user.clone(),
        });

        info!(call_id = %call.call_id, user = %call.local_user, "joined group call");
        Ok(Mesh {
            ctx,
            call,
            events,
            local,
            publisher,
            links: HashMap::new(),
            transport_tx,
            transport_rx,
            record_rx,
            signal_rx,
            participants: BTreeSet::new(),
            resolved: false,
            has_someone_joined: false,
            signal_cutoff,
            answered_offers: HashMap::new(),
            connected_at: None,
            remote_video: HashMap::new(),
        })
    }

    fn me(&self) -> &UserId {
        &self.call.local_user
    }

    fn set_state(&self, state: SessionState) {
        debug!(call_id = %self.call.call_id, ?state, "group call state");
        self.events.emit(CallEvent::StateChanged { call_id: self.call.call_id.clone(), state });
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Exit {
        self.set_state(SessionState::Connecting);
        loop {
            // Snapshots go before signals so departures are seen first.
            let exit = tokio::select! {
                biased;
                command = commands.recv() => self.on_command(command).await,
                Some(update) = self.record_rx.recv() => self.on_record(update).await,
                Some(message) = self.signal_rx.recv() => {
                    self.on_signal(message).await;
                    None
                }
                Some(event) = self.transport_rx.recv() => {
                    self.on_peer_event(event).await;
                    None
                }
            };
            if let Some(exit) = exit {
                return exit;
            }
        }
    }

    async fn on_command(&mut self, command: Option<SessionCommand>) -> Option<Exit> {
        match command {
            None => Some(Exit { reason: EndReason::Abandoned, leave: false }),
            Some(SessionCommand::Hangup) => Some(Exit { reason: EndReason::LocalHangup, leave: true }),
            Some(SessionCommand::ToggleMicrophone) => {
                let enabled = self.local.toggle_audio();
                debug!(call_id = %self.call.call_id, enabled, "microphone toggled");
                None
            }
            Some(SessionCommand::ToggleCamera) => {
                if self.local.has_video() {
                    let enabled = self.local.toggle_video();
                    best_effort(
                        self.ctx
                            .channel
                            .create_or_update_call_record(
                                &self.call.call_id,
                                CallRecordPatch::video_flag(&self.call.local_user, enabled),
                            )
                            .await,
                        &self.call.call_id,
                        "video flag",
                    );
                }
                None
            }
        }
    }

    async fn on_record(&mut self, update: RecordUpdate) -> Option<Exit> {
        let Some(record) = update.record() else {
            info!(call_id = %self.call.call_id, "group call record removed");
            return Some(Exit { reason: EndReason::RemoteHangup, leave: false });
        };
        if !record.active {
            info!(call_id = %self.call.call_id, "group call closed");
            return Some(Exit { reason: EndReason::RemoteHangup, leave: false });
        }

        let current = record.active_participants.clone();
        let left: Vec<UserId> = self
            .participants
            .difference(&current)
            .filter(|user| *user != self.me())
            .cloned()
            .collect();
        for peer in left {
            info!(call_id = %self.call.call_id, %peer, "participant left");
            self.drop_peer(&peer).await;
        }

        if !self.resolved {
            self.resolved = true;
            // A link still in New only holds early candidates; offer on it.
            let existing: Vec<UserId> = current
                .iter()
                .filter(|user| *user != self.me())
                .filter(|user| self.links.get(*user).map_or(true, |link| link.phase() == LinkPhase::New))
                .cloned()
                .collect();
            for peer in existing {
                self.offer_to(peer).await;
            }
        }

        self.participants = current;
        self.observe_remote_video(record);

        if self.participants.len() > 1 {
            self.has_someone_joined = true;
        }
        if self.has_someone_joined && self.participants.len() == 1 && self.participants.contains(self.me()) {
            info!(call_id = %self.call.call_id, "everyone else left");
            self.events.emit(CallEvent::Alert {
                title: EVERYONE_LEFT_TITLE.to_string(),
                message: EVERYONE_LEFT_MESSAGE.to_string(),
            });
            return Some(Exit { reason: EndReason::EveryoneLeft, leave: true });
        }
        None
    }

    fn observe_remote_video(&mut self, record: &CallRecord) {
        if !self.call.media.is_video() {
            return;
        }
        let me = self.call.local_user.clone();
        for user in record.active_participants.iter().filter(|user| **user != me) {
            let enabled = record.video_enabled_for(user);
            if self.remote_video.get(user) != Some(&enabled) {
                self.remote_video.insert(user.clone(), enabled);
                self.events.emit(CallEvent::RemoteVideoChanged {
                    call_id: self.call.call_id.clone(),
                    participant: user.clone(),
                    enabled,
                });
            }
        }
    }

    async fn open_link(&mut self, peer: &UserId) -> bool {
        match PeerLink::open(
            self.ctx.backend.as_ref(),
            peer.clone(),
            self.local.clone(),
            MediaOwnership::Shared,
            self.publisher.clone(),
            self.transport_tx.clone(),
        )
        .await
        {
            Ok(link) => {
                self.links.insert(peer.clone(), link);
                true
            }
            Err(e) => {
                warn!(call_id = %self.call.call_id, %peer, error = %e, "could not open peer link");
                false
            }
        }
    }

    async fn offer_to(&mut self, peer: UserId) {
        if !self.links.contains_key(&peer) && !self.open_link(&peer).await {
            return;
        }
        let notices = match self.links.get_mut(&peer) {
            Some(link) => link.initiate().await,
            None => return,
        };
        self.on_link_result(&peer, notices).await;
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        let peer = message.sender.clone();
        if peer == *self.me() {
            return;
        }
        if message.created_at < self.signal_cutoff {
            debug!(call_id = %self.call.call_id, %peer, kind = ?message.kind, "signal from before joining dropped");
            return;
        }
        match message.decode() {
            Ok(SignalBody::Description(description)) if description.kind == SdpKind::Offer => {
                self.on_remote_offer(peer, description, message.created_at).await
            }
            Ok(SignalBody::Description(answer)) => {
                let result = match self.links.get_mut(&peer) {
                    Some(link) if link.phase() == LinkPhase::Offering => link.accept_answer(answer).await,
                    _ => {
                        debug!(call_id = %self.call.call_id, %peer, "answer without pending offer");
                        return;
                    }
                };
                self.on_link_result(&peer, result).await;
            }
            Ok(SignalBody::Candidate(candidate)) => {
                // Candidates can outrun the offer; park them on a responder link.
                if !self.links.contains_key(&peer) && !self.open_link(&peer).await {
                    return;
                }
                let result = match self.links.get_mut(&peer) {
                    Some(link) => link.add_remote_candidate(candidate).await,
                    None => return,
                };
                self.on_link_result(&peer, result).await;
            }
            Err(e) => warn!(call_id = %self.call.call_id, %peer, error = %e, "undecodable signal"),
        }
    }

    async fn on_remote_offer(&mut self, peer: UserId, offer: SessionDescription, sent_at: DateTime<Utc>) {
        let mut carried = Vec::new();
        match self.links.get(&peer).map(PeerLink::phase) {
            None | Some(LinkPhase::New) => {}
            Some(LinkPhase::Offering) => {
                // Crossed offers: the smaller id yields and answers.
                if *self.me() > peer {
                    debug!(call_id = %self.call.call_id, %peer, "crossed offer, keeping ours");
                    return;
                }
                info!(call_id = %self.call.call_id, %peer, "crossed offer, answering theirs");
                if let Some(mut stale) = self.links.remove(&peer) {
                    carried = stale.take_buffered_candidates();
                    stale.close().await;
                }
            }
            Some(LinkPhase::Closed | LinkPhase::Failed) => {
                if let Some(mut stale) = self.links.remove(&peer) {
                    stale.close().await;
                }
            }
            Some(phase) => {
                if self.answered_offers.get(&peer).is_some_and(|answered| *answered >= sent_at) {
                    debug!(call_id = %self.call.call_id, %peer, ?phase, "duplicate offer ignored");
                    return;
                }
                // A newer offer means the peer rejoined before its departure
                // showed up in a snapshot.
                info!(call_id = %self.call.call_id, %peer, ?phase, "peer restarted, replacing link");
                self.drop_peer(&peer).await;
            }
        }
        self.answered_offers.insert(peer.clone(), sent_at);

        if !self.links.contains_key(&peer) && !self.open_link(&peer).await {
            return;
        }
        let Some(link) = self.links.get_mut(&peer) else { return };
        let mut result = link.accept_offer(offer).await;
        for candidate in carried {
            match link.add_remote_candidate(candidate).await {
                Ok(more) => {
                    if let Ok(notices) = result.as_mut() {
                        notices.extend(more);
                    }
                }
                Err(e) => debug!(%peer, error = %e, "carried candidate dropped"),
            }
        }
        self.on_link_result(&peer, result).await;
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let peer = event.peer.clone();
        let result = match self.links.get_mut(&peer) {
            Some(link) if link.id() == event.link => link.on_transport_event(event.event).await,
            _ => {
                debug!(call_id = %self.call.call_id, %peer, link = %event.link, "event from stale link");
                return;
            }
        };
        self.on_link_result(&peer, result).await;
    }

    async fn on_link_result(
        &mut self,
        peer: &UserId,
        result: std::result::Result<Vec<LinkNotice>, crate::calling::peer_link::InvalidTransition>,
    ) {
        let notices = match result {
            Ok(notices) => notices,
            Err(e) => {
                debug!(call_id = %self.call.call_id, %peer, error = %e, "signal ignored");
                return;
            }
        };
        for notice in notices {
            match notice {
                LinkNotice::Connected => {
                    info!(call_id = %self.call.call_id, %peer, "peer connected");
                    if self.connected_at.is_none() {
                        self.connected_at = Some(Instant::now());
                        self.set_state(SessionState::Connected);
                        self.events.emit(CallEvent::Connected { call_id: self.call.call_id.clone() });
                    }
                }
                LinkNotice::RemoteTrack(_) => {
                    if let Some(link) = self.links.get(peer) {
                        self.events.emit(CallEvent::ParticipantStreamAdded {
                            call_id: self.call.call_id.clone(),
                            participant: peer.clone(),
                            tracks: link.remote_tracks().to_vec(),
                        });
                    }
                }
                LinkNotice::Failed(reason) => {
                    warn!(call_id = %self.call.call_id, %peer, %reason, "peer link failed, dropping peer");
                    self.drop_peer(peer).await;
                    return;
                }
            }
        }
    }

    async fn drop_peer(&mut self, peer: &UserId) {
        if let Some(mut link) = self.links.remove(peer) {
            link.close().await;
            self.events.emit(CallEvent::ParticipantStreamRemoved {
                call_id: self.call.call_id.clone(),
                participant: peer.clone(),
            });
        }
        self.remote_video.remove(peer);
    }

    async fn finish(mut self, exit: Exit) -> CallSummary {
        let peers: Vec<UserId> = self.links.keys().cloned().collect();
        for peer in &peers {
            self.drop_peer(peer).await;
        }
        self.local.stop();

        let duration = self.connected_at.map(|at| at.elapsed()).unwrap_or_default();
        let mut pending = Vec::new();
        if exit.leave {
            let coordinator = self.ctx.coordinator();
            let call_id = self.call.call_id.clone();
            let me = self.call.local_user.clone();
            pending.push(tokio::spawn(async move {
                match coordinator.leave_group_call(&call_id, &me).await {
                    Ok(LeaveOutcome::LastOut { duration, .. }) => {
                        info!(%call_id, secs = duration.as_secs(), "closed group call");
                        true
                    }
                    Ok(outcome) => {
                        debug!(%call_id, ?outcome, "left group call");
                        false
                    }
                    Err(e) => {
                        warn!(%call_id, error = %e, "leave transaction failed");
                        false
                    }
                }
            }));
        }

        info!(
            call_id = %self.call.call_id,
            reason = ?exit.reason,
            secs = duration.as_secs(),
            "group session ended"
        );
        self.set_state(SessionState::Ended);
        self.events.emit(CallEvent::Ended {
            call_id: self.call.call_id.clone(),
            reason: exit.reason,
            duration,
        });
        CallSummary::new(self.call.call_id.clone(), exit.reason, duration, false, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media::{TransportEvent, TransportState};
    use crate::calling::types::RoomKind;
    use crate::config::CallConfig;
    use crate::testing::{MemoryStore, MockMediaBackend};
    use pretty_assertions::assert_eq;
    use tokio::time;

    fn context(store: &MemoryStore, backend: &MockMediaBackend) -> CallContext {
        CallContext::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(backend.clone()),
            CallConfig::default(),
        )
    }

    fn group(call_id: &CallId, user: &str) -> GroupCall {
        GroupCall {
            call_id: call_id.clone(),
            room_id: RoomId::from("group1"),
            local_user: UserId::from(user),
            media: MediaKind::Video,
        }
    }

    fn join(store: &MemoryStore, call_id: &CallId, user: &str) -> (CallHandle, MockMediaBackend) {
        let backend = MockMediaBackend::new(user).with_auto_connect();
        let handle = GroupCallSession::new(context(store, &backend), group(call_id, user)).spawn();
        (handle, backend)
    }

    async fn wait_for(handle: &mut CallHandle, wanted: impl Fn(&CallEvent) -> bool) -> CallEvent {
        time::timeout(Duration::from_secs(5), async {
            loop {
                match handle.next_event().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("Should observe event in time")
    }

    fn stream_added(from: &'static str) -> impl Fn(&CallEvent) -> bool {
        move |event| {
            matches!(event, CallEvent::ParticipantStreamAdded { participant, .. } if participant.as_str() == from)
        }
    }

    fn stream_removed(from: &'static str) -> impl Fn(&CallEvent) -> bool {
        move |event| {
            matches!(event, CallEvent::ParticipantStreamRemoved { participant, .. } if participant.as_str() == from)
        }
    }

    async fn group_room(store: &MemoryStore) -> (RoomId, CallId) {
        let room = RoomId::from("group1");
        store.create_room(&room, RoomKind::Group, &["A", "B", "C"], Some("Weekend"));
        let call_id = initiate_group_call(store, &room, &UserId::from("A"), "Alice", MediaKind::Video)
            .await
            .expect("Should initiate group call");
        (room, call_id)
    }

    #[tokio::test]
    async fn test_everyone_left_auto_ends_and_records_once() {
        let store = MemoryStore::new();
        let (room, call_id) = group_room(&store).await;

        let (mut a, _backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        let (mut b, _backend_b) = join(&store, &call_id, "B");

        wait_for(&mut a, |e| matches!(e, CallEvent::Connected { .. })).await;
        wait_for(&mut b, |e| matches!(e, CallEvent::Connected { .. })).await;
        assert_eq!(
            store.record(&call_id).expect("Should have record").active_participants,
            [UserId::from("A"), UserId::from("B")].into_iter().collect()
        );

        b.hangup();
        let mut b_summary = b.wait().await.expect("Should finish");
        b_summary.flush().await;
        assert_eq!(b_summary.reason, EndReason::LocalHangup);

        let alert = wait_for(&mut a, |e| matches!(e, CallEvent::Alert { .. })).await;
        assert_eq!(
            alert,
            CallEvent::Alert { title: "Call Ended".into(), message: "Everyone left the call.".into() }
        );
        let mut a_summary = a.wait().await.expect("Should finish");
        a_summary.flush().await;
        assert_eq!(a_summary.reason, EndReason::EveryoneLeft);

        let record = store.record(&call_id).expect("Should have record");
        assert!(!record.active);
        assert!(record.active_participants.is_empty());
        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, UserId::from("A"));
        assert!(history[0].is_group);
        assert_eq!(store.room_marker(&room), Some(RoomCallMarker::cleared()));
    }

    #[tokio::test]
    async fn test_lonely_caller_is_not_auto_ended() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;

        let (mut a, backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        time::sleep(Duration::from_millis(50)).await;
        assert!(backend_a.peers().is_empty());

        a.hangup();
        let mut summary = a.wait().await.expect("Should finish");
        summary.flush().await;
        assert_eq!(summary.reason, EndReason::LocalHangup);
        assert_eq!(store.history().len(), 1);
        assert!(store.history()[0].is_missed());
    }

    #[tokio::test]
    async fn test_three_way_mesh_drops_departed_peer() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;

        let (mut a, backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        let (mut b, _backend_b) = join(&store, &call_id, "B");
        wait_for(&mut a, stream_added("B")).await;
        let (mut c, backend_c) = join(&store, &call_id, "C");

        wait_for(&mut a, stream_added("C")).await;
        wait_for(&mut b, stream_added("C")).await;
        assert_eq!(backend_c.peers().len(), 2);

        c.hangup();
        c.wait().await.expect("Should finish").flush().await;

        wait_for(&mut a, stream_removed("C")).await;
        wait_for(&mut b, stream_removed("C")).await;
        let a_to_c = backend_a.peer_for(&UserId::from("C")).expect("Should have peer");
        assert_eq!(a_to_c.close_count(), 1);
        // The shared local stream survives a peer leaving.
        assert_eq!(backend_a.media_stop_count(), 0);

        let record = store.record(&call_id).expect("Should have record");
        assert!(record.active);
        assert_eq!(record.active_participants.len(), 2);
        assert!(store.history().is_empty());

        a.hangup();
        a.wait().await.expect("Should finish").flush().await;
        let mut b_summary = b.wait().await.expect("Should finish");
        b_summary.flush().await;
        assert_eq!(b_summary.reason, EndReason::EveryoneLeft);
        assert_eq!(store.history().len(), 1);
        assert_eq!(backend_a.media_stop_count(), 1);
    }

    #[tokio::test]
    async fn test_crossed_offers_converge() {
        let store = MemoryStore::new();
        let call_id = CallId::from("call7");
        let mut record = CallRecord::empty(call_id.clone(), RoomId::from("group1"), Utc::now());
        record.kind = CallKind::Group;
        record.media = MediaKind::Video;
        record.active = true;
        record.active_participants = [UserId::from("A"), UserId::from("B")].into_iter().collect();
        store.insert_record(record);

        let (mut a, backend_a) = join(&store, &call_id, "A");
        let (mut b, backend_b) = join(&store, &call_id, "B");
        wait_for(&mut a, |e| matches!(e, CallEvent::Connected { .. })).await;
        wait_for(&mut b, |e| matches!(e, CallEvent::Connected { .. })).await;

        // B never yields; A may have replaced its offering link.
        assert_eq!(backend_b.peers().len(), 1);
        for (_, peer) in backend_a.peers() {
            assert_eq!(peer.violations(), 0);
        }

        a.hangup();
        b.hangup();
        a.wait().await.expect("Should finish").flush().await;
        b.wait().await.expect("Should finish").flush().await;
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_failure_keeps_call_alive() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;

        let (mut a, backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        let (mut b, _backend_b) = join(&store, &call_id, "B");
        wait_for(&mut a, stream_added("B")).await;

        let a_to_b = backend_a.peer_for(&UserId::from("B")).expect("Should have peer");
        a_to_b.emit(TransportEvent::ConnectionState(TransportState::Failed));
        wait_for(&mut a, stream_removed("B")).await;

        a.toggle_camera();
        wait_for(&mut b, |e| matches!(e, CallEvent::RemoteVideoChanged { enabled: false, .. })).await;

        a.hangup();
        let summary = a.wait().await.expect("Should finish");
        assert_eq!(summary.reason, EndReason::LocalHangup);
        b.hangup();
        b.wait().await.expect("Should finish").flush().await;
    }

    #[tokio::test]
    async fn test_rejoining_reconnects_every_time() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;

        let (mut a, _backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        let (mut c, _backend_c) = join(&store, &call_id, "C");
        wait_for(&mut a, stream_added("C")).await;

        for _ in 0..3 {
            let (mut b, backend_b) = join(&store, &call_id, "B");
            wait_for(&mut b, stream_added("A")).await;
            wait_for(&mut b, stream_added("C")).await;
            for (_, peer) in backend_b.peers() {
                assert_eq!(peer.violations(), 0);
            }

            b.hangup();
            let mut summary = b.wait().await.expect("B should finish");
            summary.flush().await;
            assert_eq!(summary.reason, EndReason::LocalHangup);
            assert!(!summary.wrote_termination);
            wait_for(&mut a, stream_removed("B")).await;
            wait_for(&mut c, stream_removed("B")).await;
        }

        a.hangup();
        let mut a_summary = a.wait().await.expect("A should finish");
        a_summary.flush().await;
        let mut c_summary = c.wait().await.expect("C should finish");
        c_summary.flush().await;
        assert_eq!(c_summary.reason, EndReason::EveryoneLeft);
        assert!(c_summary.wrote_termination);
        assert!(!a_summary.wrote_termination);
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_signals_from_before_joining_are_ignored() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;

        let sent_earlier = Utc::now() - chrono::Duration::minutes(5);
        let stale_candidate = IceCandidate::new("candidate:stale 1 udp 1 10.0.0.7 7 typ host");
        let stale = [
            SignalMessage::description(
                UserId::from("A"),
                UserId::from("B"),
                &SessionDescription::answer("v=0 answer o=A stale"),
            ),
            SignalMessage::candidate(UserId::from("A"), UserId::from("B"), &stale_candidate),
        ];
        for message in stale {
            let mut message = message.expect("Should encode signal");
            message.created_at = sent_earlier;
            store.send_signal(&call_id, message).await.expect("Should store signal");
        }

        let (mut a, _backend_a) = join(&store, &call_id, "A");
        wait_for(&mut a, |e| matches!(e, CallEvent::StateChanged { state: SessionState::Connecting, .. })).await;
        let (mut b, backend_b) = join(&store, &call_id, "B");
        wait_for(&mut b, stream_added("A")).await;

        let b_to_a = backend_b.peer_for(&UserId::from("A")).expect("Should have peer");
        assert_eq!(b_to_a.violations(), 0);
        assert!(!b_to_a.applied_candidates().contains(&stale_candidate));
        let remote = b_to_a.remote_description().expect("Should have remote answer");
        assert_ne!(remote.sdp, "v=0 answer o=A stale");

        b.hangup();
        b.wait().await.expect("B should finish").flush().await;
        a.wait().await.expect("A should finish").flush().await;
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_joining_closed_call_fails_without_writes() {
        let store = MemoryStore::new();
        let (_room, call_id) = group_room(&store).await;
        store.create_or_update_call_record(&call_id, CallRecordPatch::terminate()).await.expect("Should write record");
        let writes = store.record_writes(&call_id).len();

        let (b, backend_b) = join(&store, &call_id, "B");
        let summary = b.wait().await.expect("Should finish");
        assert_eq!(summary.reason, EndReason::Failed);
        assert_eq!(backend_b.media_acquisitions(), 0);
        assert_eq!(store.record_writes(&call_id).len(), writes);
    }
}
