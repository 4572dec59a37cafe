//! Offer/answer/candidate exchange for a single session.
//!
//! The [`Negotiator`] owns the session's transport, its candidate queue and
//! its phase machine. Every handler starts with a phase check; messages that
//! make no sense in the current phase are dropped at debug level.

use chatify_core::candidates::{CandidateQueue, Routed};
use chatify_core::phase::{NegotiationPhase, PhaseMachine, PhaseTransition};
use chatify_core::signaling::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use chatify_core::types::{CallIntent, CallRole};
use log::{debug, info, warn};
use std::sync::Arc;

use super::error::CallError;
use super::media::LocalStream;
use super::peer::{PeerTransport, TransportState};
use super::relay::SignalRelay;

/// What the session should do after a signaling message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Continue,
    /// The peer hung up.
    RemoteEnded,
}

pub struct Negotiator {
    intent: CallIntent,
    machine: PhaseMachine,
    transport: Arc<dyn PeerTransport>,
    relay: Arc<dyn SignalRelay>,
    queue: CandidateQueue,
}

impl Negotiator {
    pub fn new(
        intent: CallIntent,
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn SignalRelay>,
    ) -> Self {
        Self {
            intent,
            machine: PhaseMachine::new(),
            transport,
            relay,
            queue: CandidateQueue::new(),
        }
    }

    pub fn intent(&self) -> &CallIntent {
        &self.intent
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.machine.phase()
    }

    pub fn reached_connected(&self) -> bool {
        self.machine.reached_connected()
    }

    /// Remote candidates currently held back.
    pub fn queued_candidates(&self) -> usize {
        self.queue.len()
    }

    /// Candidates received before the session existed, in arrival order.
    pub fn seed_candidates(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        for c in candidates {
            self.queue.push(c);
        }
    }

    /// Attach local media and move past `AcquiringMedia`.
    pub async fn media_ready(&mut self, stream: &LocalStream) -> Result<(), CallError> {
        self.transport
            .add_local_stream(stream)
            .await
            .map_err(CallError::Transport)?;
        let t = match self.intent.role {
            CallRole::Initiator => PhaseTransition::BeginOffer,
            CallRole::Responder => PhaseTransition::AwaitOffer,
        };
        self.machine.apply(t)?;
        Ok(())
    }

    /// Initiator: create, set and publish the offer.
    pub async fn start_offer(&mut self) -> Result<(), CallError> {
        if self.phase() != NegotiationPhase::CreatingOffer {
            debug!("start_offer ignored in phase {}", self.phase());
            return Ok(());
        }
        let offer = self
            .transport
            .create_offer(self.intent.mode)
            .await
            .map_err(CallError::Transport)?;
        self.transport
            .set_local_description(&offer)
            .await
            .map_err(CallError::Transport)?;

        let msg = SignalingMessage::offer(
            self.intent.local_id.clone(),
            self.intent.remote_id.clone(),
            self.intent.mode,
            offer,
        );
        self.publish(&msg).await;
        self.machine.apply(PhaseTransition::OfferSent)?;
        info!(
            "Offer sent to {} ({})",
            self.intent.remote_id, self.intent.mode
        );
        Ok(())
    }

    /// Responder: apply the offer, flush early candidates, publish the answer.
    pub async fn accept_offer(&mut self, offer: &SessionDescription) -> Result<(), CallError> {
        if self.intent.role != CallRole::Responder
            || self.phase() != NegotiationPhase::AwaitingOffer
        {
            debug!(
                "Ignoring offer from {} in phase {}",
                self.intent.remote_id,
                self.phase()
            );
            return Ok(());
        }

        self.apply_remote(offer).await?;

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(CallError::Transport)?;
        self.transport
            .set_local_description(&answer)
            .await
            .map_err(CallError::Transport)?;
        let msg = SignalingMessage::answer(
            self.intent.local_id.clone(),
            self.intent.remote_id.clone(),
            self.intent.mode,
            answer,
        );
        self.publish(&msg).await;
        self.start_checks()?;
        info!("Answer sent to {}", self.intent.remote_id);
        Ok(())
    }

    /// Initiator: apply the answer. Only the first one counts.
    pub async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), CallError> {
        if self.intent.role != CallRole::Initiator
            || self.phase() != NegotiationPhase::AwaitingAnswer
        {
            debug!(
                "Ignoring answer from {} in phase {}",
                self.intent.remote_id,
                self.phase()
            );
            return Ok(());
        }
        self.apply_remote(answer).await?;
        self.start_checks()
    }

    async fn apply_remote(&mut self, desc: &SessionDescription) -> Result<(), CallError> {
        self.transport
            .set_remote_description(desc)
            .await
            .map_err(CallError::Transport)?;
        self.machine.apply(PhaseTransition::RemoteDescriptionApplied)?;

        let pending = self.queue.drain();
        if !pending.is_empty() {
            debug!("Applying {} queued candidates", pending.len());
        }
        for c in pending {
            self.add_candidate(&c).await;
        }
        Ok(())
    }

    fn start_checks(&mut self) -> Result<(), CallError> {
        // The transport may already have reported a usable path.
        if self.phase() == NegotiationPhase::DescriptionsExchanged {
            self.machine.apply(PhaseTransition::ChecksStarted)?;
        }
        Ok(())
    }

    async fn add_candidate(&self, c: &IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(c).await {
            warn!("Failed to add ICE candidate: {:?}", e);
        }
    }

    /// Handle one message from the peer.
    pub async fn handle_signal(&mut self, msg: SignalingMessage) -> Result<SignalOutcome, CallError> {
        if self.phase().is_terminal() {
            debug!("Dropping {} for finished session", msg.kind);
            return Ok(SignalOutcome::Continue);
        }

        match msg.kind {
            SignalKind::Offer => {
                if let Some(desc) = msg.description() {
                    self.accept_offer(desc).await?;
                }
            }
            SignalKind::Answer => {
                if let Some(desc) = msg.description() {
                    self.apply_answer(desc).await?;
                }
            }
            SignalKind::Candidate => {
                if let Some(c) = msg.ice_candidate() {
                    match self.queue.push(c.clone()) {
                        Routed::Apply(c) => self.add_candidate(&c).await,
                        Routed::Queued => {
                            debug!("Queued early candidate ({} waiting)", self.queue.len())
                        }
                        Routed::Discarded => {}
                    }
                }
            }
            SignalKind::End => {
                info!("{} ended the call", self.intent.remote_id);
                return Ok(SignalOutcome::RemoteEnded);
            }
        }
        Ok(SignalOutcome::Continue)
    }

    /// Publish a locally gathered candidate right away.
    pub async fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.phase().is_terminal() {
            return;
        }
        let msg = SignalingMessage::candidate(
            self.intent.local_id.clone(),
            self.intent.remote_id.clone(),
            self.intent.mode,
            candidate,
        );
        self.publish(&msg).await;
    }

    /// Fold a transport state report into the phase. Returns the new phase if
    /// it changed.
    pub fn on_transport_state(
        &mut self,
        state: TransportState,
    ) -> Result<Option<NegotiationPhase>, CallError> {
        let phase = self.phase();
        let transition = match state {
            TransportState::Checking if phase == NegotiationPhase::DescriptionsExchanged => {
                PhaseTransition::ChecksStarted
            }
            TransportState::Connected if phase != NegotiationPhase::Connected => {
                PhaseTransition::TransportConnected
            }
            TransportState::Disconnected if phase == NegotiationPhase::Connected => {
                PhaseTransition::TransportLost
            }
            TransportState::Failed => PhaseTransition::TransportFailed,
            _ => return Ok(None),
        };

        match self.machine.apply(transition) {
            Ok(next) => Ok(Some(next)),
            Err(e) if transition == PhaseTransition::TransportFailed => Err(e.into()),
            Err(e) => {
                debug!("Ignoring transport state {:?}: {}", state, e);
                Ok(None)
            }
        }
    }

    /// Mark the session failed after a transport error or timeout.
    pub fn fail(&mut self, transition: PhaseTransition) {
        if let Err(e) = self.machine.apply(transition) {
            debug!("{}", e);
        }
    }

    /// Tell the peer we are leaving. Failures are only logged.
    pub async fn publish_end(&self) {
        let msg = SignalingMessage::end(self.intent.local_id.clone(), self.intent.remote_id.clone());
        self.publish(&msg).await;
    }

    /// Tear down: drop queued candidates, close the transport, enter `Closed`.
    pub async fn close(&mut self) {
        self.queue.close();
        if !self.phase().is_closed() {
            // Close is valid from every other phase.
            let _ = self.machine.apply(PhaseTransition::Close);
        }
        self.transport.close().await;
    }

    async fn publish(&self, msg: &SignalingMessage) {
        if let Err(e) = self.relay.publish(msg).await {
            warn!("Failed to publish {} to {}: {}", msg.kind, msg.to_id, e);
        }
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("intent", &self.intent)
            .field("phase", &self.phase())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::{LoopbackDevices, LoopbackPeerFactory};
    use crate::calls::media::{MediaConstraints, MediaDevices};
    use crate::calls::peer::{PeerConfig, PeerTransportFactory};
    use crate::calls::relay::InMemoryRelay;
    use chatify_core::types::{CallMode, UserId};

    async fn responder() -> (Negotiator, crate::calls::loopback::LoopbackPeerHandle, InMemoryRelay) {
        let relay = InMemoryRelay::new();
        let factory = LoopbackPeerFactory::new();
        let (transport, _events) = factory.create(&PeerConfig::default()).await.unwrap();
        let handle = factory.last_peer().unwrap();
        let intent = CallIntent::incoming("bob".into(), "alice".into(), CallMode::Audio);
        let mut n = Negotiator::new(intent, transport, Arc::new(relay.clone()));

        let stream = LoopbackDevices::new()
            .get_user_media(&MediaConstraints::for_mode(CallMode::Audio))
            .await
            .unwrap();
        n.media_ready(&stream).await.unwrap();
        (n, handle, relay)
    }

    fn from_alice(kind_msg: impl FnOnce(UserId, UserId) -> SignalingMessage) -> SignalingMessage {
        kind_msg("alice".into(), "bob".into())
    }

    #[tokio::test]
    async fn candidates_before_offer_are_applied_after_it_in_order() {
        let (mut n, peer, relay) = responder().await;
        assert_eq!(n.phase(), NegotiationPhase::AwaitingOffer);

        for i in 0..3 {
            let c = IceCandidate::new(format!("candidate:{i}"));
            let msg = from_alice(|f, t| SignalingMessage::candidate(f, t, CallMode::Audio, c));
            n.handle_signal(msg).await.unwrap();
        }
        assert!(peer.applied_candidates().is_empty());
        assert_eq!(n.queued_candidates(), 3);

        let offer = from_alice(|f, t| {
            SignalingMessage::offer(f, t, CallMode::Audio, SessionDescription::offer("v=0"))
        });
        n.handle_signal(offer).await.unwrap();

        assert_eq!(
            peer.applied_candidates(),
            vec!["candidate:0", "candidate:1", "candidate:2"]
        );
        assert_eq!(n.phase(), NegotiationPhase::IceChecking);
        assert!(
            relay
                .published()
                .iter()
                .any(|r| r.kind == SignalKind::Answer.tag_name())
        );
    }

    #[tokio::test]
    async fn second_offer_is_not_merged() {
        let (mut n, peer, relay) = responder().await;
        let offer = || {
            from_alice(|f, t| {
                SignalingMessage::offer(f, t, CallMode::Audio, SessionDescription::offer("v=0"))
            })
        };
        n.handle_signal(offer()).await.unwrap();
        n.handle_signal(offer()).await.unwrap();

        assert_eq!(peer.remote_descriptions(), 1);
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test]
    async fn end_is_reported() {
        let (mut n, _, _) = responder().await;
        let end = from_alice(SignalingMessage::end);
        assert_eq!(n.handle_signal(end).await.unwrap(), SignalOutcome::RemoteEnded);
    }

    #[tokio::test]
    async fn closed_session_drops_everything() {
        let (mut n, peer, _) = responder().await;
        n.close().await;
        assert!(peer.is_closed());

        let c = from_alice(|f, t| {
            SignalingMessage::candidate(f, t, CallMode::Audio, IceCandidate::new("candidate:9"))
        });
        assert_eq!(n.handle_signal(c).await.unwrap(), SignalOutcome::Continue);
        assert!(peer.applied_candidates().is_empty());
        assert_eq!(n.phase(), NegotiationPhase::Closed);
    }
}
