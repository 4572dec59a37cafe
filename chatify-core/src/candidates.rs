//! Buffer for remote ICE candidates that arrive before the remote description.
//!
//! The relay orders messages per sender only, so a peer's candidates can be
//! delivered ahead of the offer or answer they belong to. They wait here and
//! are released exactly once, in arrival order, when the description lands.

use std::collections::VecDeque;

use crate::signaling::IceCandidate;

#[derive(Debug)]
enum QueueState {
    /// Remote description not applied yet.
    Buffering(VecDeque<IceCandidate>),
    /// Drained; candidates pass straight through.
    Flushed,
    /// Session closed; candidates are dropped.
    Closed,
}

/// Where a pushed candidate went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Apply now; the remote description is already set.
    Apply(IceCandidate),
    /// Held until [`CandidateQueue::drain`].
    Queued,
    /// Session already closed.
    Discarded,
}

#[derive(Debug)]
pub struct CandidateQueue {
    state: QueueState,
    discarded: usize,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            state: QueueState::Buffering(VecDeque::new()),
            discarded: 0,
        }
    }

    /// Route an incoming candidate. Never fails.
    pub fn push(&mut self, candidate: IceCandidate) -> Routed {
        match &mut self.state {
            QueueState::Buffering(pending) => {
                pending.push_back(candidate);
                Routed::Queued
            }
            QueueState::Flushed => Routed::Apply(candidate),
            QueueState::Closed => {
                self.discarded += 1;
                Routed::Discarded
            }
        }
    }

    /// Release everything buffered so far, oldest first.
    ///
    /// Only the first call returns candidates; after it every push is
    /// routed straight to [`Routed::Apply`].
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        match std::mem::replace(&mut self.state, QueueState::Flushed) {
            QueueState::Buffering(pending) => pending.into(),
            QueueState::Flushed => Vec::new(),
            QueueState::Closed => {
                self.state = QueueState::Closed;
                Vec::new()
            }
        }
    }

    /// Drop anything buffered and refuse later candidates.
    pub fn close(&mut self) {
        if let QueueState::Buffering(pending) = &self.state {
            self.discarded += pending.len();
        }
        self.state = QueueState::Closed;
    }

    pub fn len(&self) -> usize {
        match &self.state {
            QueueState::Buffering(pending) => pending.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self.state, QueueState::Flushed)
    }

    /// Candidates dropped because the session closed.
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn buffers_until_drained_then_passes_through() {
        let mut q = CandidateQueue::new();
        assert_eq!(q.push(c(1)), Routed::Queued);
        assert_eq!(q.push(c(2)), Routed::Queued);
        assert_eq!(q.len(), 2);

        assert_eq!(q.drain(), vec![c(1), c(2)]);
        assert!(q.is_flushed());
        assert_eq!(q.push(c(3)), Routed::Apply(c(3)));
    }

    #[test]
    fn drain_is_single_shot() {
        let mut q = CandidateQueue::new();
        q.push(c(1));
        assert_eq!(q.drain().len(), 1);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn closed_queue_discards_silently() {
        let mut q = CandidateQueue::new();
        q.push(c(1));
        q.close();

        assert_eq!(q.push(c(2)), Routed::Discarded);
        assert!(q.drain().is_empty());
        assert_eq!(q.push(c(3)), Routed::Discarded);
        assert_eq!(q.discarded(), 3);
    }

    /// Every interleaving of "description arrives" among N candidates yields
    /// all N applied once, in order.
    #[test]
    fn any_interleaving_preserves_order() {
        const N: u32 = 6;
        for split in 0..=N {
            let mut q = CandidateQueue::new();
            let mut applied = Vec::new();

            for n in 0..N {
                if n == split {
                    applied.extend(q.drain());
                }
                if let Routed::Apply(cand) = q.push(c(n)) {
                    applied.push(cand);
                }
            }
            if split == N {
                applied.extend(q.drain());
            }

            let expected: Vec<_> = (0..N).map(c).collect();
            assert_eq!(applied, expected, "split at {split}");
        }
    }
}
