use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::calling::ice_buffer::IceCandidateBuffer;
use crate::calling::media::{
    LinkId, LocalMedia, MediaBackend, PeerEventSender, PeerTransport, RemoteTrack, TransportEvent,
    TransportState,
};
use crate::calling::types::{IceCandidate, SdpKind, SessionDescription, UserId};
use crate::errors::{CallError, TransportError};

/// Negotiation phase of one peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPhase {
    /// Nothing exchanged yet.
    New,
    /// Local offer created and published, waiting for the answer.
    Offering,
    /// Remote offer applied, answer not yet published.
    Answering,
    /// Both descriptions in place, waiting for the transport.
    Negotiating,
    Connected,
    Closed,
    /// Transport or negotiation failure.
    Failed,
}

/// Whether closing a link also releases the local capture hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaOwnership {
    /// Direct calls: the single link owns the local stream.
    Owned,
    /// Group calls: many links share the stream; the session releases it.
    Shared,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    Initiate,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// A description produced by `CreateOffer`/`CreateAnswer` is set locally.
    LocalDescriptionReady(SessionDescription),
    LocalCandidate(IceCandidate),
    Transport(TransportState),
    /// A side effect failed; the reason is carried for reporting.
    EffectFailed(String),
    Close,
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            LinkEvent::Initiate => "initiate",
            LinkEvent::RemoteOffer(_) => "remote-offer",
            LinkEvent::RemoteAnswer(_) => "remote-answer",
            LinkEvent::RemoteCandidate(_) => "remote-candidate",
            LinkEvent::LocalDescriptionReady(_) => "local-description",
            LinkEvent::LocalCandidate(_) => "local-candidate",
            LinkEvent::Transport(_) => "transport-state",
            LinkEvent::EffectFailed(_) => "effect-failed",
            LinkEvent::Close => "close",
        }
    }
}

/// Side effects requested by a transition, executed in order.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEffect {
    /// Create an offer and set it as the local description.
    CreateOffer,
    /// Create an answer and set it as the local description.
    CreateAnswer,
    PublishOffer(SessionDescription),
    PublishAnswer(SessionDescription),
    PublishCandidate(IceCandidate),
    ApplyRemoteDescription(SessionDescription),
    ApplyCandidate(IceCandidate),
    BufferCandidate(IceCandidate),
    DrainCandidates,
    CloseTransport,
    ReleaseLocalMedia,
    Notify(LinkNotice),
}

/// Outcomes the owning session cares about.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkNotice {
    Connected,
    Failed(String),
    RemoteTrack(RemoteTrack),
}

/// An event that the current phase does not accept. Duplicate or late
/// signaling lands here and is dropped by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub phase: LinkPhase,
    pub event: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not accepted in phase {:?}", self.event, self.phase)
    }
}

impl std::error::Error for InvalidTransition {}

impl From<InvalidTransition> for CallError {
    fn from(err: InvalidTransition) -> Self {
        CallError::InvalidTransition(err.to_string())
    }
}

/// Pure negotiation state machine: (phase, event) -> (phase, effects).
#[derive(Clone, Debug)]
pub struct LinkMachine {
    phase: LinkPhase,
    ownership: MediaOwnership,
    remote_description_set: bool,
    torn_down: bool,
}

impl LinkMachine {
    pub fn new(ownership: MediaOwnership) -> Self {
        LinkMachine {
            phase: LinkPhase::New,
            ownership,
            remote_description_set: false,
            torn_down: false,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, LinkPhase::Closed | LinkPhase::Failed)
    }

    fn reject(&self, event: &LinkEvent) -> Result<Vec<LinkEffect>, InvalidTransition> {
        Err(InvalidTransition { phase: self.phase, event: event.name() })
    }

    fn apply_remote(&mut self, description: SessionDescription) -> Vec<LinkEffect> {
        self.remote_description_set = true;
        vec![LinkEffect::ApplyRemoteDescription(description), LinkEffect::DrainCandidates]
    }

    fn teardown(&mut self) -> Vec<LinkEffect> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;
        let mut effects = vec![LinkEffect::CloseTransport];
        if self.ownership == MediaOwnership::Owned {
            effects.push(LinkEffect::ReleaseLocalMedia);
        }
        effects
    }

    fn fail(&mut self, reason: String) -> Vec<LinkEffect> {
        self.phase = LinkPhase::Failed;
        vec![LinkEffect::Notify(LinkNotice::Failed(reason))]
    }

    pub fn step(&mut self, event: LinkEvent) -> Result<Vec<LinkEffect>, InvalidTransition> {
        use LinkPhase::*;

        match (self.phase, event) {
            (_, LinkEvent::Close) => {
                if self.phase != Failed {
                    self.phase = Closed;
                }
                Ok(self.teardown())
            }

            (New, LinkEvent::Initiate) => {
                self.phase = Offering;
                Ok(vec![LinkEffect::CreateOffer])
            }

            (New, LinkEvent::RemoteOffer(offer)) if offer.kind == SdpKind::Offer => {
                self.phase = Answering;
                let mut effects = self.apply_remote(offer);
                effects.push(LinkEffect::CreateAnswer);
                Ok(effects)
            }

            (Offering, LinkEvent::RemoteAnswer(answer)) if answer.kind == SdpKind::Answer => {
                self.phase = Negotiating;
                Ok(self.apply_remote(answer))
            }

            (Offering, LinkEvent::LocalDescriptionReady(offer)) if offer.kind == SdpKind::Offer => {
                Ok(vec![LinkEffect::PublishOffer(offer)])
            }

            (Answering, LinkEvent::LocalDescriptionReady(answer)) if answer.kind == SdpKind::Answer => {
                self.phase = Negotiating;
                Ok(vec![LinkEffect::PublishAnswer(answer)])
            }

            (_, LinkEvent::RemoteCandidate(candidate)) if !self.is_terminal() => {
                if self.remote_description_set {
                    Ok(vec![LinkEffect::ApplyCandidate(candidate)])
                } else {
                    Ok(vec![LinkEffect::BufferCandidate(candidate)])
                }
            }

            (_, LinkEvent::LocalCandidate(candidate)) if !self.is_terminal() => {
                Ok(vec![LinkEffect::PublishCandidate(candidate)])
            }

            (Negotiating | Answering, LinkEvent::Transport(TransportState::Connected))
                if self.remote_description_set =>
            {
                self.phase = Connected;
                Ok(vec![LinkEffect::Notify(LinkNotice::Connected)])
            }

            (Connected, LinkEvent::Transport(TransportState::Connected)) => Ok(Vec::new()),

            (_, LinkEvent::Transport(TransportState::Failed | TransportState::Closed))
                if !self.is_terminal() =>
            {
                Ok(self.fail("transport lost".to_string()))
            }

            (
                _,
                LinkEvent::Transport(
                    TransportState::New | TransportState::Connecting | TransportState::Disconnected,
                ),
            ) => Ok(Vec::new()),

            (_, LinkEvent::EffectFailed(reason)) if !self.is_terminal() => {
                Ok(self.fail(reason))
            }

            (_, event) => self.reject(&event),
        }
    }
}

/// Where a link sends its half of the handshake. Direct calls write the
/// call record and candidate logs; group calls send point-to-point signals.
/// Implementations swallow and log write failures.
#[async_trait]
pub trait SignalPublisher: Send + Sync {
    async fn publish_offer(&self, peer: &UserId, offer: &SessionDescription);

    async fn publish_answer(&self, peer: &UserId, answer: &SessionDescription);

    async fn publish_candidate(&self, peer: &UserId, candidate: &IceCandidate);
}

/// One peer connection and its negotiation state.
pub struct PeerLink {
    id: LinkId,
    peer: UserId,
    machine: LinkMachine,
    transport: Box<dyn PeerTransport>,
    buffer: IceCandidateBuffer,
    local: LocalMedia,
    remote_tracks: Vec<RemoteTrack>,
    publisher: Arc<dyn SignalPublisher>,
}

impl PeerLink {
    /// Create the underlying peer connection. Transport events arrive on
    /// `events` tagged with this link's id.
    pub async fn open(
        backend: &dyn MediaBackend,
        peer: UserId,
        local: LocalMedia,
        ownership: MediaOwnership,
        publisher: Arc<dyn SignalPublisher>,
        events: PeerEventSender,
    ) -> Result<Self, TransportError> {
        let id = LinkId::next();
        let transport = backend.create_peer(id, &peer, &local, events).await?;
        debug!(%peer, link = %id, "peer link opened");
        Ok(PeerLink::with_transport(id, peer, transport, local, ownership, publisher))
    }

    pub fn with_transport(
        id: LinkId,
        peer: UserId,
        transport: Box<dyn PeerTransport>,
        local: LocalMedia,
        ownership: MediaOwnership,
        publisher: Arc<dyn SignalPublisher>,
    ) -> Self {
        PeerLink {
            id,
            peer,
            machine: LinkMachine::new(ownership),
            transport,
            buffer: IceCandidateBuffer::new(),
            local,
            remote_tracks: Vec::new(),
            publisher,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn phase(&self) -> LinkPhase {
        self.machine.phase()
    }

    pub fn has_remote_description(&self) -> bool {
        self.machine.has_remote_description()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn buffered_candidates(&self) -> usize {
        self.buffer.len()
    }

    /// Hand over candidates still waiting for a remote description. Used
    /// when this link is replaced before it negotiated.
    pub fn take_buffered_candidates(&mut self) -> Vec<IceCandidate> {
        self.buffer.drain()
    }

    /// Create, set and publish an offer. Valid only from `New`.
    pub async fn initiate(&mut self) -> Result<Vec<LinkNotice>, InvalidTransition> {
        self.dispatch(LinkEvent::Initiate).await
    }

    /// Apply a remote offer, then answer it. Valid only from `New`.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Vec<LinkNotice>, InvalidTransition> {
        self.dispatch(LinkEvent::RemoteOffer(offer)).await
    }

    /// Apply the remote answer. Valid only from `Offering`.
    pub async fn accept_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<Vec<LinkNotice>, InvalidTransition> {
        self.dispatch(LinkEvent::RemoteAnswer(answer)).await
    }

    /// Apply now if the remote description is set, otherwise buffer.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<Vec<LinkNotice>, InvalidTransition> {
        self.dispatch(LinkEvent::RemoteCandidate(candidate)).await
    }

    pub async fn on_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<Vec<LinkNotice>, InvalidTransition> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.dispatch(LinkEvent::LocalCandidate(candidate)).await
            }
            TransportEvent::ConnectionState(state) => self.dispatch(LinkEvent::Transport(state)).await,
            TransportEvent::RemoteTrack(track) => {
                if matches!(self.phase(), LinkPhase::Closed | LinkPhase::Failed) {
                    return Err(InvalidTransition { phase: self.phase(), event: "remote-track" });
                }
                self.remote_tracks.retain(|t| t.id != track.id);
                self.remote_tracks.push(track.clone());
                Ok(vec![LinkNotice::RemoteTrack(track)])
            }
        }
    }

    /// Idempotent. Releases local tracks only under [`MediaOwnership::Owned`].
    pub async fn close(&mut self) {
        if let Err(e) = self.dispatch(LinkEvent::Close).await {
            debug!(peer = %self.peer, error = %e, "close ignored");
        }
    }

    async fn dispatch(&mut self, event: LinkEvent) -> Result<Vec<LinkNotice>, InvalidTransition> {
        let mut notices = Vec::new();
        let mut queue = VecDeque::new();

        let effects = self.machine.step(event)?;
        self.execute(effects, &mut queue, &mut notices).await;

        while let Some(follow_up) = queue.pop_front() {
            match self.machine.step(follow_up) {
                Ok(effects) => self.execute(effects, &mut queue, &mut notices).await,
                Err(e) => debug!(peer = %self.peer, error = %e, "follow-up dropped"),
            }
        }
        Ok(notices)
    }

    async fn execute(
        &mut self,
        effects: Vec<LinkEffect>,
        queue: &mut VecDeque<LinkEvent>,
        notices: &mut Vec<LinkNotice>,
    ) {
        for effect in effects {
            if let Some(follow_up) = self.run(effect, notices).await {
                let failed = matches!(follow_up, LinkEvent::EffectFailed(_));
                queue.push_back(follow_up);
                if failed {
                    break;
                }
            }
        }
    }

    async fn run(&mut self, effect: LinkEffect, notices: &mut Vec<LinkNotice>) -> Option<LinkEvent> {
        match effect {
            LinkEffect::CreateOffer => {
                let offer = match self.transport.create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => return Some(LinkEvent::EffectFailed(e.to_string())),
                };
                match self.transport.set_local_description(offer.clone()).await {
                    Ok(()) => Some(LinkEvent::LocalDescriptionReady(offer)),
                    Err(e) => Some(LinkEvent::EffectFailed(e.to_string())),
                }
            }
            LinkEffect::CreateAnswer => {
                let answer = match self.transport.create_answer().await {
                    Ok(answer) => answer,
                    Err(e) => return Some(LinkEvent::EffectFailed(e.to_string())),
                };
                match self.transport.set_local_description(answer.clone()).await {
                    Ok(()) => Some(LinkEvent::LocalDescriptionReady(answer)),
                    Err(e) => Some(LinkEvent::EffectFailed(e.to_string())),
                }
            }
            LinkEffect::PublishOffer(offer) => {
                self.publisher.publish_offer(&self.peer, &offer).await;
                None
            }
            LinkEffect::PublishAnswer(answer) => {
                self.publisher.publish_answer(&self.peer, &answer).await;
                None
            }
            LinkEffect::PublishCandidate(candidate) => {
                self.publisher.publish_candidate(&self.peer, &candidate).await;
                None
            }
            LinkEffect::ApplyRemoteDescription(description) => {
                match self.transport.set_remote_description(description).await {
                    Ok(()) => None,
                    Err(e) => Some(LinkEvent::EffectFailed(e.to_string())),
                }
            }
            LinkEffect::ApplyCandidate(candidate) => {
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    debug!(peer = %self.peer, error = %e, "remote candidate rejected");
                }
                None
            }
            LinkEffect::BufferCandidate(candidate) => {
                if let Err(candidate) = self.buffer.push(candidate) {
                    if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                        debug!(peer = %self.peer, error = %e, "remote candidate rejected");
                    }
                }
                None
            }
            LinkEffect::DrainCandidates => {
                let applied = self.buffer.drain_into(self.transport.as_ref()).await;
                debug!(peer = %self.peer, applied, "candidate buffer drained");
                None
            }
            LinkEffect::CloseTransport => {
                if let Err(e) = self.transport.close().await {
                    warn!(peer = %self.peer, error = %e, "peer transport close failed");
                }
                self.remote_tracks.clear();
                None
            }
            LinkEffect::ReleaseLocalMedia => {
                self.local.stop();
                None
            }
            LinkEffect::Notify(notice) => {
                notices.push(notice);
                None
            }
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockMediaBackend, RecordingPublisher, Published};
    use crate::calling::media::{MediaRequest, TrackKind};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use tokio::sync::mpsc;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n}"))
    }

    #[rstest]
    #[case(LinkPhase::Offering, LinkEvent::Initiate)]
    #[case(LinkPhase::Offering, LinkEvent::RemoteOffer(SessionDescription::offer("o")))]
    #[case(LinkPhase::Negotiating, LinkEvent::RemoteAnswer(SessionDescription::answer("a")))]
    #[case(LinkPhase::Connected, LinkEvent::RemoteOffer(SessionDescription::offer("o")))]
    #[case(LinkPhase::Closed, LinkEvent::RemoteCandidate(IceCandidate::new("c")))]
    #[case(LinkPhase::Failed, LinkEvent::Initiate)]
    fn test_rejected_transitions(#[case] phase: LinkPhase, #[case] event: LinkEvent) {
        let mut machine = machine_in(phase);
        let before = machine.phase();
        assert!(machine.step(event).is_err());
        assert_eq!(machine.phase(), before);
    }

    fn machine_in(phase: LinkPhase) -> LinkMachine {
        let mut machine = LinkMachine::new(MediaOwnership::Owned);
        let steps: Vec<LinkEvent> = match phase {
            LinkPhase::New => vec![],
            LinkPhase::Offering => vec![LinkEvent::Initiate],
            LinkPhase::Answering => vec![LinkEvent::RemoteOffer(SessionDescription::offer("o"))],
            LinkPhase::Negotiating => vec![
                LinkEvent::Initiate,
                LinkEvent::RemoteAnswer(SessionDescription::answer("a")),
            ],
            LinkPhase::Connected => vec![
                LinkEvent::Initiate,
                LinkEvent::RemoteAnswer(SessionDescription::answer("a")),
                LinkEvent::Transport(TransportState::Connected),
            ],
            LinkPhase::Closed => vec![LinkEvent::Close],
            LinkPhase::Failed => vec![LinkEvent::Initiate, LinkEvent::EffectFailed("boom".into())],
        };
        for event in steps {
            machine.step(event).expect("Should reach requested phase");
        }
        assert_eq!(machine.phase(), phase);
        machine
    }

    #[test]
    fn test_offer_path() {
        let mut machine = LinkMachine::new(MediaOwnership::Owned);
        assert_eq!(machine.step(LinkEvent::Initiate).expect("Should accept transition"), vec![LinkEffect::CreateOffer]);
        let offer = SessionDescription::offer("o");
        assert_eq!(
            machine.step(LinkEvent::LocalDescriptionReady(offer.clone())).expect("Should accept transition"),
            vec![LinkEffect::PublishOffer(offer)]
        );
        assert_eq!(
            machine.step(LinkEvent::RemoteCandidate(candidate(1))).expect("Should accept transition"),
            vec![LinkEffect::BufferCandidate(candidate(1))]
        );

        let answer = SessionDescription::answer("a");
        assert_eq!(
            machine.step(LinkEvent::RemoteAnswer(answer.clone())).expect("Should accept transition"),
            vec![LinkEffect::ApplyRemoteDescription(answer), LinkEffect::DrainCandidates]
        );
        assert_eq!(machine.phase(), LinkPhase::Negotiating);
        assert_eq!(
            machine.step(LinkEvent::RemoteCandidate(candidate(2))).expect("Should accept transition"),
            vec![LinkEffect::ApplyCandidate(candidate(2))]
        );
        assert_eq!(
            machine.step(LinkEvent::Transport(TransportState::Connected)).expect("Should accept transition"),
            vec![LinkEffect::Notify(LinkNotice::Connected)]
        );
        assert_eq!(machine.phase(), LinkPhase::Connected);
    }

    #[test]
    fn test_answer_path() {
        let mut machine = LinkMachine::new(MediaOwnership::Shared);
        let offer = SessionDescription::offer("o");
        assert_eq!(
            machine.step(LinkEvent::RemoteOffer(offer.clone())).expect("Should accept transition"),
            vec![
                LinkEffect::ApplyRemoteDescription(offer),
                LinkEffect::DrainCandidates,
                LinkEffect::CreateAnswer,
            ]
        );
        let answer = SessionDescription::answer("a");
        assert_eq!(
            machine.step(LinkEvent::LocalDescriptionReady(answer.clone())).expect("Should accept transition"),
            vec![LinkEffect::PublishAnswer(answer)]
        );
        assert_eq!(machine.phase(), LinkPhase::Negotiating);
        assert!(machine.step(LinkEvent::RemoteOffer(SessionDescription::offer("again"))).is_err());
    }

    #[rstest]
    #[case(MediaOwnership::Owned, vec![LinkEffect::CloseTransport, LinkEffect::ReleaseLocalMedia])]
    #[case(MediaOwnership::Shared, vec![LinkEffect::CloseTransport])]
    fn test_close_is_idempotent(#[case] ownership: MediaOwnership, #[case] expected: Vec<LinkEffect>) {
        let mut machine = LinkMachine::new(ownership);
        machine.step(LinkEvent::Initiate).expect("Should accept transition");
        assert_eq!(machine.step(LinkEvent::Close).expect("Should accept transition"), expected);
        assert_eq!(machine.step(LinkEvent::Close).expect("Should accept transition"), Vec::new());
        assert_eq!(machine.phase(), LinkPhase::Closed);
    }

    #[test]
    fn test_transport_loss_fails_connected_link() {
        let mut machine = machine_in(LinkPhase::Connected);
        let effects = machine.step(LinkEvent::Transport(TransportState::Failed)).expect("Should accept transition");
        assert_eq!(effects, vec![LinkEffect::Notify(LinkNotice::Failed("transport lost".into()))]);
        assert_eq!(machine.phase(), LinkPhase::Failed);

        // Failed is absorbing, but still releases resources once.
        assert_eq!(
            machine.step(LinkEvent::Close).expect("Should accept transition"),
            vec![LinkEffect::CloseTransport, LinkEffect::ReleaseLocalMedia]
        );
        assert_eq!(machine.phase(), LinkPhase::Failed);
    }

    #[test]
    fn test_disconnected_is_not_fatal() {
        let mut machine = machine_in(LinkPhase::Connected);
        assert!(machine.step(LinkEvent::Transport(TransportState::Disconnected)).expect("Should accept transition").is_empty());
        assert_eq!(machine.phase(), LinkPhase::Connected);
    }

    #[derive(Clone, Debug)]
    enum Arrival {
        Candidate(usize),
        Description,
    }

    /// Run the machine against a model transport that panics on a candidate
    /// applied without a remote description.
    fn simulate(initiator: bool, arrivals: &[Arrival]) -> Vec<usize> {
        let mut machine = LinkMachine::new(MediaOwnership::Owned);
        let mut remote_set = false;
        let mut buffered: Vec<usize> = Vec::new();
        let mut applied: Vec<usize> = Vec::new();

        if initiator {
            machine.step(LinkEvent::Initiate).expect("Should accept transition");
            machine.step(LinkEvent::LocalDescriptionReady(SessionDescription::offer("o"))).expect("Should accept transition");
        }

        for arrival in arrivals {
            let event = match arrival {
                Arrival::Candidate(n) => LinkEvent::RemoteCandidate(candidate(*n)),
                Arrival::Description if initiator => LinkEvent::RemoteAnswer(SessionDescription::answer("a")),
                Arrival::Description => LinkEvent::RemoteOffer(SessionDescription::offer("o")),
            };
            let Ok(effects) = machine.step(event) else { continue };
            for effect in effects {
                match effect {
                    LinkEffect::ApplyRemoteDescription(_) => remote_set = true,
                    LinkEffect::ApplyCandidate(c) => {
                        assert!(remote_set, "candidate applied before remote description");
                        applied.push(c.candidate.trim_start_matches("candidate:").parse().expect("Should parse candidate index"));
                    }
                    LinkEffect::BufferCandidate(c) => {
                        assert!(!remote_set, "candidate buffered after remote description");
                        buffered.push(c.candidate.trim_start_matches("candidate:").parse().expect("Should parse candidate index"));
                    }
                    LinkEffect::DrainCandidates => {
                        assert!(remote_set);
                        applied.append(&mut buffered);
                    }
                    _ => {}
                }
            }
        }
        assert!(buffered.is_empty() || !remote_set);
        applied
    }

    fn arrivals() -> impl Strategy<Value = Vec<Arrival>> {
        (0usize..12, 0usize..12, 1usize..3).prop_map(|(candidates, position, descriptions)| {
            let mut arrivals: Vec<Arrival> = (0..candidates).map(Arrival::Candidate).collect();
            for _ in 0..descriptions {
                arrivals.insert(position.min(arrivals.len()), Arrival::Description);
            }
            arrivals
        })
    }

    proptest! {
        #[test]
        fn prop_every_candidate_applied_exactly_once(initiator in any::<bool>(), arrivals in arrivals()) {
            let total = arrivals.iter().filter(|a| matches!(a, Arrival::Candidate(_))).count();
            let mut applied = simulate(initiator, &arrivals);
            applied.sort_unstable();
            prop_assert_eq!(applied, (0..total).collect::<Vec<_>>());
        }
    }

    async fn open_link(
        backend: &MockMediaBackend,
        ownership: MediaOwnership,
    ) -> (PeerLink, RecordingPublisher, mpsc::UnboundedReceiver<crate::calling::media::PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let media = backend
            .acquire_local_media(&MediaRequest { video: None })
            .await
            .expect("Should acquire media");
        let publisher = RecordingPublisher::default();
        let link = PeerLink::open(
            backend,
            UserId::from("B"),
            media,
            ownership,
            Arc::new(publisher.clone()),
            tx,
        )
        .await
        .expect("Should open link");
        (link, publisher, rx)
    }

    #[tokio::test]
    async fn test_driver_buffers_until_answer() {
        let backend = MockMediaBackend::new("A");
        let (mut link, publisher, _rx) = open_link(&backend, MediaOwnership::Owned).await;

        link.initiate().await.expect("Should initiate");
        assert_eq!(link.phase(), LinkPhase::Offering);
        assert!(matches!(publisher.published().as_slice(), [Published::Offer(_, _)]));

        link.add_remote_candidate(candidate(1)).await.expect("Should buffer");
        assert_eq!(link.buffered_candidates(), 1);

        let peer = backend.peer_for(&UserId::from("B")).expect("Should create mock peer");
        assert!(peer.applied_candidates().is_empty());

        link.accept_answer(SessionDescription::answer("a")).await.expect("Should accept answer");
        assert_eq!(link.buffered_candidates(), 0);
        link.add_remote_candidate(candidate(2)).await.expect("Should apply");
        assert_eq!(peer.applied_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(peer.violations(), 0);

        assert!(link.accept_answer(SessionDescription::answer("dup")).await.is_err());
    }

    #[tokio::test]
    async fn test_driver_answers_and_reports_tracks() {
        let backend = MockMediaBackend::new("A");
        let (mut link, publisher, _rx) = open_link(&backend, MediaOwnership::Shared).await;

        link.accept_offer(SessionDescription::offer("o")).await.expect("Should accept offer");
        assert_eq!(link.phase(), LinkPhase::Negotiating);
        assert!(matches!(publisher.published().as_slice(), [Published::Answer(_, _)]));

        let notices = link
            .on_transport_event(TransportEvent::ConnectionState(TransportState::Connected))
            .await
            .expect("Should connect");
        assert_eq!(notices, vec![LinkNotice::Connected]);

        let track = RemoteTrack { id: "B-audio".into(), kind: TrackKind::Audio };
        link.on_transport_event(TransportEvent::RemoteTrack(track.clone())).await.expect("Should accept transport event");
        link.on_transport_event(TransportEvent::RemoteTrack(track.clone())).await.expect("Should accept transport event");
        assert_eq!(link.remote_tracks(), &[track]);

        link.close().await;
        link.close().await;
        assert!(link.remote_tracks().is_empty());
        let peer = backend.peer_for(&UserId::from("B")).expect("Should have peer");
        assert_eq!(peer.close_count(), 1);
        assert_eq!(backend.media_stop_count(), 0);
    }

    #[tokio::test]
    async fn test_owned_link_releases_media_on_close() {
        let backend = MockMediaBackend::new("A");
        let (mut link, _publisher, _rx) = open_link(&backend, MediaOwnership::Owned).await;
        link.initiate().await.expect("Should initiate");
        link.close().await;
        assert_eq!(backend.media_stop_count(), 1);
        assert_eq!(link.phase(), LinkPhase::Closed);
    }

    #[tokio::test]
    async fn test_failed_offer_creation_fails_link() {
        let backend = MockMediaBackend::new("A");
        backend.fail_negotiation(true);
        let (mut link, publisher, _rx) = open_link(&backend, MediaOwnership::Owned).await;

        let notices = link.initiate().await.expect("Initiate is accepted");
        assert!(matches!(notices.as_slice(), [LinkNotice::Failed(_)]));
        assert_eq!(link.phase(), LinkPhase::Failed);
        assert!(publisher.published().is_empty());
    }
}
