use std::sync::Arc;

use crate::calling::hangup::HangupCoordinator;
use crate::calling::history::CallHistorySink;
use crate::calling::media::MediaBackend;
use crate::calling::signaling::SignalingChannel;
use crate::config::CallConfig;

/// Collaborators shared by every session of one participant.
#[derive(Clone)]
pub struct CallContext {
    pub channel: Arc<dyn SignalingChannel>,
    pub history: Arc<dyn CallHistorySink>,
    pub backend: Arc<dyn MediaBackend>,
    pub config: Arc<CallConfig>,
}

impl CallContext {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        history: Arc<dyn CallHistorySink>,
        backend: Arc<dyn MediaBackend>,
        config: CallConfig,
    ) -> Self {
        CallContext { channel, history, backend, config: Arc::new(config) }
    }

    pub fn coordinator(&self) -> HangupCoordinator {
        HangupCoordinator::new(self.channel.clone(), self.history.clone())
    }
}
