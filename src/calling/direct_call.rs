use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::calling::context::CallContext;
use crate::calling::events::{
    CallEvent, CallHandle, CallSummary, EndReason, EventSink, SessionCommand, SessionState,
};
use crate::calling::media::{LocalMedia, MediaRequest, PeerEvent};
use crate::calling::peer_link::{LinkNotice, LinkPhase, MediaOwnership, PeerLink, SignalPublisher};
use crate::calling::signaling::{best_effort, SignalingChannel, Subscription};
use crate::calling::types::{
    CallId, CallKind, CallRecord, CallRecordPatch, CandidateDirection, IceCandidate, MediaKind,
    RecordUpdate, RoomCallMarker, RoomId, SessionDescription, UserId,
};
use crate::errors::{CallError, Result};

/// Begin a 1:1 call from `room`: derive the call id and raise the room's
/// call marker so the other member is notified. The session itself is
/// started separately with [`DirectCallSession::spawn`].
pub async fn start_direct_call(
    channel: &dyn SignalingChannel,
    room_id: &RoomId,
    caller: &UserId,
    caller_name: &str,
    media: MediaKind,
) -> Result<CallId> {
    let call_id = CallId::derive(room_id, Utc::now());
    channel
        .update_room_marker(room_id, RoomCallMarker::started(call_id.clone(), media, caller, caller_name))
        .await?;
    info!(%call_id, %room_id, %caller, ?media, "direct call started");
    Ok(call_id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    /// Log this side appends its own candidates to.
    pub fn outgoing(self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::CallerToCallee,
            CallRole::Callee => CandidateDirection::CalleeToCaller,
        }
    }

    pub fn incoming(self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::CalleeToCaller,
            CallRole::Callee => CandidateDirection::CallerToCallee,
        }
    }
}

/// Who is talking to whom, and in which call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectCall {
    pub call_id: CallId,
    pub room_id: RoomId,
    pub local_user: UserId,
    pub remote_user: UserId,
    pub role: CallRole,
    pub media: MediaKind,
}

/// Writes this side's half of the handshake into the shared call record
/// and candidate log.
struct DirectPublisher {
    channel: Arc<dyn SignalingChannel>,
    call: DirectCall,
    video: bool,
}

#[async_trait]
impl SignalPublisher for DirectPublisher {
    async fn publish_offer(&self, _peer: &UserId, offer: &SessionDescription) {
        let patch = CallRecordPatch {
            room_id: Some(self.call.room_id.clone()),
            kind: Some(CallKind::Direct),
            media: Some(self.call.media),
            creator: Some(self.call.local_user.clone()),
            created_at: Some(Utc::now()),
            active: Some(true),
            offer: Some(offer.clone()),
            ..CallRecordPatch::video_flag(&self.call.local_user, self.video)
        };
        // A declined or already ended call stays ended.
        let update = |record: &CallRecord| {
            if may_publish_offer(record) {
                patch.clone()
            } else {
                CallRecordPatch::default()
            }
        };

        let call_id = &self.call.call_id;
        let published = self.channel.transact_call_record(call_id, &update).await;
        match published {
            Ok(Some(before)) if !may_publish_offer(&before) => {
                info!(%call_id, rejected = before.rejected, "call ended before the offer, not published");
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                best_effort(
                    self.channel.create_or_update_call_record(call_id, patch).await,
                    call_id,
                    "publish offer",
                );
            }
            Err(e) => warn!(%call_id, error = %e, "signaling write failed: publish offer"),
        }
    }

    async fn publish_answer(&self, _peer: &UserId, answer: &SessionDescription) {
        let patch = CallRecordPatch {
            answer: Some(answer.clone()),
            ..CallRecordPatch::video_flag(&self.call.local_user, self.video)
        };
        best_effort(
            self.channel.create_or_update_call_record(&self.call.call_id, patch).await,
            &self.call.call_id,
            "publish answer",
        );
    }

    async fn publish_candidate(&self, _peer: &UserId, candidate: &IceCandidate) {
        best_effort(
            self.channel
                .append_ice_candidate(&self.call.call_id, self.call.role.outgoing(), candidate.clone())
                .await,
            &self.call.call_id,
            "publish candidate",
        );
    }
}

/// Records touched only by early writes carry no offer yet and may still be
/// activated.
fn may_publish_offer(record: &CallRecord) -> bool {
    !record.rejected && (record.active || record.offer.is_none())
}

/// How a session stops: the reason, and whether this side performs the
/// terminating write.
#[derive(Clone, Copy, Debug)]
struct Exit {
    reason: EndReason,
    write: bool,
}

impl Exit {
    fn writing(reason: EndReason) -> Self {
        Exit { reason, write: true }
    }

    fn local(reason: EndReason) -> Self {
        Exit { reason, write: false }
    }
}

/// One side of a 1:1 call, run as its own task.
pub struct DirectCallSession {
    ctx: CallContext,
    call: DirectCall,
}

impl DirectCallSession {
    pub fn new(ctx: CallContext, call: DirectCall) -> Self {
        DirectCallSession { ctx, call }
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
        let DirectCallSession { ctx, call } = self;
        events.emit(CallEvent::StateChanged { call_id: call.call_id.clone(), state: SessionState::Initializing });

        let mut driver = match DirectDriver::start(ctx, call.clone(), events.clone()).await {
            Ok(driver) => driver,
            Err(e) => {
                error!(call_id = %call.call_id, error = %e, "direct call could not start");
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

        let exit = driver.drive(&mut commands).await;
        driver.finish(exit).await
    }
}

struct DirectDriver {
    ctx: CallContext,
    call: DirectCall,
    events: EventSink,
    local: LocalMedia,
    link: PeerLink,
    transport_rx: mpsc::UnboundedReceiver<PeerEvent>,
    record_rx: Subscription<RecordUpdate>,
    candidate_rx: Subscription<IceCandidate>,
    /// Set once the record has been observed active.
    record_seen: bool,
    connected_at: Option<Instant>,
    remote_video: Option<bool>,
}

impl DirectDriver {
    async fn start(ctx: CallContext, call: DirectCall, events: EventSink) -> Result<Self> {
        let request = MediaRequest::for_call(call.media, ctx.config.direct_video);
        let local = ctx.backend.acquire_local_media(&request).await?;

        let publisher = Arc::new(DirectPublisher {
            channel: ctx.channel.clone(),
            call: call.clone(),
            video: local.video_enabled(),
        });
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let link = PeerLink::open(
            ctx.backend.as_ref(),
            call.remote_user.clone(),
            local.clone(),
            MediaOwnership::Owned,
            publisher,
            transport_tx,
        )
        .await
        .map_err(|e| {
            local.stop();
            CallError::from(e)
        })?;

        let record_rx = ctx.channel.subscribe_call_record(&call.call_id).await?;
        let candidate_rx = ctx
            .channel
            .subscribe_ice_candidates(&call.call_id, call.role.incoming())
            .await?;

        Ok(DirectDriver {
            ctx,
            call,
            events,
            local,
            link,
            transport_rx,
            record_rx,
            candidate_rx,
            record_seen: false,
            connected_at: None,
            remote_video: None,
        })
    }

    fn set_state(&self, state: SessionState) {
        debug!(call_id = %self.call.call_id, ?state, "direct call state");
        self.events.emit(CallEvent::StateChanged { call_id: self.call.call_id.clone(), state });
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Exit {
        match self.call.role {
            CallRole::Caller => {
                let notices = match self.link.initiate().await {
                    Ok(notices) => notices,
                    Err(e) => {
                        warn!(call_id = %self.call.call_id, error = %e, "offer not created");
                        Vec::new()
                    }
                };
                if let Some(exit) = self.on_notices(notices) {
                    return exit;
                }
                self.set_state(SessionState::Ringing);
            }
            CallRole::Callee => self.set_state(SessionState::Connecting),
        }

        let ring = time::sleep(self.ctx.config.ring_timeout());
        tokio::pin!(ring);

        loop {
            let ringing = self.call.role == CallRole::Caller && self.connected_at.is_none();
            let exit = tokio::select! {
                command = commands.recv() => self.on_command(command).await,
                Some(update) = self.record_rx.recv() => self.on_record(update).await,
                Some(candidate) = self.candidate_rx.recv() => self.on_candidate(candidate).await,
                Some(event) = self.transport_rx.recv() => self.on_peer_event(event).await,
                _ = &mut ring, if ringing => {
                    info!(call_id = %self.call.call_id, "no answer before ringing timeout");
                    Some(Exit::writing(EndReason::TimedOut))
                }
            };
            if let Some(exit) = exit {
                return exit;
            }
        }
    }

    async fn on_command(&mut self, command: Option<SessionCommand>) -> Option<Exit> {
        match command {
            None => Some(Exit::local(EndReason::Abandoned)),
            Some(SessionCommand::Hangup) => Some(Exit::writing(EndReason::LocalHangup)),
            Some(SessionCommand::ToggleMicrophone) => {
                let enabled = self.local.toggle_audio();
                debug!(call_id = %self.call.call_id, enabled, "microphone toggled");
                None
            }
            Some(SessionCommand::ToggleCamera) => {
                self.toggle_camera().await;
                None
            }
        }
    }

    async fn toggle_camera(&mut self) {
        if !self.local.has_video() {
            debug!(call_id = %self.call.call_id, "camera toggle ignored, no video track");
            return;
        }
        let enabled = self.local.toggle_video();
        if self.record_seen {
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
    }

    async fn on_record(&mut self, update: RecordUpdate) -> Option<Exit> {
        let Some(record) = update.record() else {
            if self.record_seen {
                info!(call_id = %self.call.call_id, "call record removed");
                return Some(Exit::local(EndReason::RemoteHangup));
            }
            return None;
        };

        if record.rejected {
            info!(call_id = %self.call.call_id, "call declined by the other side");
            // Normally a no-op; repairs a record reactivated by a racing offer.
            return Some(Exit::writing(EndReason::Declined));
        }
        if !record.active {
            // A record without an offer was only touched by early writes.
            if self.record_seen || record.offer.is_some() {
                info!(call_id = %self.call.call_id, "call ended by the other side");
                return Some(Exit::local(EndReason::RemoteHangup));
            }
            return None;
        }
        self.record_seen = true;

        let notices = match self.call.role {
            CallRole::Callee => match &record.offer {
                Some(offer) if !self.link.has_remote_description() && self.link.phase() == LinkPhase::New => {
                    self.link.accept_offer(offer.clone()).await
                }
                _ => Ok(Vec::new()),
            },
            CallRole::Caller => match &record.answer {
                Some(answer) if self.link.phase() == LinkPhase::Offering => {
                    self.link.accept_answer(answer.clone()).await
                }
                _ => Ok(Vec::new()),
            },
        };
        self.observe_remote_video(record);

        match notices {
            Ok(notices) => self.on_notices(notices),
            Err(e) => {
                debug!(call_id = %self.call.call_id, error = %e, "description ignored");
                None
            }
        }
    }

    fn observe_remote_video(&mut self, record: &CallRecord) {
        if !self.call.media.is_video() {
            return;
        }
        let enabled = record.video_enabled_for(&self.call.remote_user);
        if self.remote_video != Some(enabled) {
            self.remote_video = Some(enabled);
            self.events.emit(CallEvent::RemoteVideoChanged {
                call_id: self.call.call_id.clone(),
                participant: self.call.remote_user.clone(),
                enabled,
            });
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Option<Exit> {
        match self.link.add_remote_candidate(candidate).await {
            Ok(notices) => self.on_notices(notices),
            Err(e) => {
                debug!(call_id = %self.call.call_id, error = %e, "remote candidate ignored");
                None
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Option<Exit> {
        if event.link != self.link.id() {
            debug!(call_id = %self.call.call_id, link = %event.link, "event from stale link");
            return None;
        }
        match self.link.on_transport_event(event.event).await {
            Ok(notices) => self.on_notices(notices),
            Err(e) => {
                debug!(call_id = %self.call.call_id, error = %e, "transport event ignored");
                None
            }
        }
    }

    fn on_notices(&mut self, notices: Vec<LinkNotice>) -> Option<Exit> {
        for notice in notices {
            match notice {
                LinkNotice::Connected => {
                    if self.connected_at.is_none() {
                        self.connected_at = Some(Instant::now());
                        info!(call_id = %self.call.call_id, peer = %self.call.remote_user, "direct call connected");
                        self.set_state(SessionState::Connected);
                        self.events.emit(CallEvent::Connected { call_id: self.call.call_id.clone() });
                    }
                }
                LinkNotice::RemoteTrack(_) => {
                    self.events.emit(CallEvent::ParticipantStreamAdded {
                        call_id: self.call.call_id.clone(),
                        participant: self.call.remote_user.clone(),
                        tracks: self.link.remote_tracks().to_vec(),
                    });
                }
                LinkNotice::Failed(reason) => {
                    error!(call_id = %self.call.call_id, %reason, "direct call transport failed");
                    self.events.emit(CallEvent::Failed { call_id: self.call.call_id.clone(), reason });
                    return Some(Exit::writing(EndReason::Failed));
                }
            }
        }
        None
    }

    /// Stop media and the link now; the terminating write and the history
    /// entry run in the background.
    async fn finish(mut self, exit: Exit) -> CallSummary {
        let had_stream = !self.link.remote_tracks().is_empty();
        self.link.close().await;
        self.local.stop();
        if had_stream {
            self.events.emit(CallEvent::ParticipantStreamRemoved {
                call_id: self.call.call_id.clone(),
                participant: self.call.remote_user.clone(),
            });
        }

        let duration = self.connected_at.map(|at| at.elapsed()).unwrap_or_default();
        // Only the caller keeps history for direct calls.
        let record_history = self.call.role == CallRole::Caller && exit.reason != EndReason::Abandoned;

        let mut pending = Vec::new();
        if exit.write || record_history {
            let coordinator = self.ctx.coordinator();
            let call = self.call.clone();
            let write = exit.write;
            pending.push(tokio::spawn(async move {
                let ended_call =
                    write && coordinator.terminate_direct_call(&call.call_id, &call.room_id).await.committed();
                if record_history {
                    coordinator
                        .record_direct_history(&call.room_id, &call.call_id, call.media, duration, &call.local_user)
                        .await;
                }
                ended_call
            }));
        }

        info!(
            call_id = %self.call.call_id,
            reason = ?exit.reason,
            secs = duration.as_secs(),
            terminating_write = exit.write,
            "direct call ended"
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
