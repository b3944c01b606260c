use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::calling::media::RemoteTrack;
use crate::calling::types::{CallId, UserId};
use crate::errors::{CallError, Result};

/// Session lifecycle as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    /// Caller waiting for the callee to pick up.
    Ringing,
    /// Callee or group member negotiating.
    Connecting,
    Connected,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// This participant hung up.
    LocalHangup,
    /// The other side marked the call inactive.
    RemoteHangup,
    /// The callee declined a direct call.
    Declined,
    /// Nobody answered before the ringing timeout.
    TimedOut,
    /// Everyone else left a group call.
    EveryoneLeft,
    /// Media or transport failure.
    Failed,
    /// The session handle was dropped.
    Abandoned,
}

/// Events produced for the UI layer.
#[derive(Clone, Debug, PartialEq)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        state: SessionState,
    },
    Connected {
        call_id: CallId,
    },
    RemoteVideoChanged {
        call_id: CallId,
        participant: UserId,
        enabled: bool,
    },
    /// A participant's tile appeared or its tracks changed.
    ParticipantStreamAdded {
        call_id: CallId,
        participant: UserId,
        tracks: Vec<RemoteTrack>,
    },
    /// A participant's tile must go away (clears a frozen frame).
    ParticipantStreamRemoved {
        call_id: CallId,
        participant: UserId,
    },
    /// Something to prompt the user with.
    Alert {
        title: String,
        message: String,
    },
    Failed {
        call_id: CallId,
        reason: String,
    },
    Ended {
        call_id: CallId,
        reason: EndReason,
        duration: Duration,
    },
}

/// User actions delivered to a running session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    Hangup,
    ToggleMicrophone,
    ToggleCamera,
}

/// Best-effort event emitter; a UI that stopped listening is not an error.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        EventSink { tx }
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        if self.tx.send(event).is_err() {
            debug!("call event dropped, no listener");
        }
    }
}

/// Result of a finished session.
#[derive(Debug)]
pub struct CallSummary {
    pub call_id: CallId,
    pub reason: EndReason,
    /// Measured locally from the moment the transport first connected.
    pub duration: Duration,
    /// Whether this participant's write ended the call record. Settled by
    /// [`CallSummary::flush`], since teardown writes run in the background.
    pub wrote_termination: bool,
    pending: Vec<JoinHandle<bool>>,
}

impl CallSummary {
    pub(crate) fn new(
        call_id: CallId,
        reason: EndReason,
        duration: Duration,
        wrote_termination: bool,
        pending: Vec<JoinHandle<bool>>,
    ) -> Self {
        CallSummary { call_id, reason, duration, wrote_termination, pending }
    }

    /// Wait for the fire-and-forget writes issued during teardown. Each task
    /// reports whether it committed the write that ended the call.
    pub async fn flush(&mut self) {
        for handle in self.pending.drain(..) {
            match handle.await {
                Ok(ended_call) => self.wrote_termination |= ended_call,
                Err(e) => warn!(call_id = %self.call_id, error = %e, "teardown write task failed"),
            }
        }
    }
}

/// Control surface of a spawned session.
pub struct CallHandle {
    call_id: CallId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    task: JoinHandle<CallSummary>,
}

impl CallHandle {
    pub(crate) fn new(
        call_id: CallId,
        commands: mpsc::UnboundedSender<SessionCommand>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        task: JoinHandle<CallSummary>,
    ) -> Self {
        CallHandle { call_id, commands, events, task }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!(call_id = %self.call_id, ?command, "session already finished");
        }
    }

    pub fn hangup(&self) {
        self.send(SessionCommand::Hangup);
    }

    pub fn toggle_microphone(&self) {
        self.send(SessionCommand::ToggleMicrophone);
    }

    pub fn toggle_camera(&self) {
        self.send(SessionCommand::ToggleCamera);
    }

    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Wait for the session to finish. Events not yet read are discarded.
    /// The command channel stays open meanwhile, so waiting is not mistaken
    /// for abandoning the call.
    pub async fn wait(self) -> Result<CallSummary> {
        let CallHandle { commands, task, .. } = self;
        let summary = task
            .await
            .map_err(|e| CallError::General(format!("session task failed: {e}")));
        drop(commands);
        summary
    }

    /// Split into the event stream and a completion future, for callers that
    /// keep reading events after asking the session to stop.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<SessionCommand>,
        mpsc::UnboundedReceiver<CallEvent>,
        JoinHandle<CallSummary>,
    ) {
        (self.commands, self.events, self.task)
    }
}
