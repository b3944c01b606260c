use tracing::debug;

use crate::calling::media::PeerTransport;
use crate::calling::types::IceCandidate;

/// Holds remote ICE candidates that arrive before the remote description.
///
/// The buffer is single-use: once drained it refuses further candidates,
/// handing them back so the caller applies them directly.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: Vec<IceCandidate>,
    drained: bool,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `candidate`, or give it back if the buffer was already drained.
    pub fn push(&mut self, candidate: IceCandidate) -> Result<(), IceCandidate> {
        if self.drained {
            return Err(candidate);
        }
        self.pending.push(candidate);
        Ok(())
    }

    /// Take every queued candidate in arrival order and close the buffer.
    /// Later calls return nothing.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.drained = true;
        std::mem::take(&mut self.pending)
    }

    /// Apply queued candidates to `transport` in arrival order, then close
    /// the buffer. A candidate the transport rejects is logged and skipped.
    /// Returns how many were accepted.
    pub async fn drain_into(&mut self, transport: &dyn PeerTransport) -> usize {
        let mut applied = 0;
        for candidate in self.drain() {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => debug!(error = %e, "buffered candidate rejected"),
            }
        }
        applied
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPeer;
    use pretty_assertions::assert_eq;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn test_push_then_drain_keeps_order() {
        let mut buffer = IceCandidateBuffer::new();
        for n in 0..3 {
            buffer.push(candidate(n)).expect("Should buffer before drain");
        }
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        assert_eq!(drained, vec![candidate(0), candidate(1), candidate(2)]);
        assert!(buffer.is_empty());
        assert!(buffer.is_drained());
    }

    #[test]
    fn test_push_after_drain_is_refused() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.drain();
        assert_eq!(buffer.push(candidate(7)), Err(candidate(7)));
        assert!(buffer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_drain_into_applies_once() {
        let peer = MockPeer::detached();
        peer.set_remote_description(crate::calling::types::SessionDescription::offer("o"))
            .await
            .expect("Should set remote");

        let mut buffer = IceCandidateBuffer::new();
        buffer.push(candidate(1)).expect("Should buffer");
        buffer.push(candidate(2)).expect("Should buffer");

        assert_eq!(buffer.drain_into(&peer).await, 2);
        assert_eq!(buffer.drain_into(&peer).await, 0);
        assert_eq!(peer.applied_candidates(), vec![candidate(1), candidate(2)]);
    }
}
