//! Negotiation phase state machine.
//!
//! Every guard in the negotiator is a phase check against this table; there
//! are no side flags such as "has answered" or "remote description set".

use serde::Serialize;
use std::fmt;

/// Where a session is in the offer/answer/ICE negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum NegotiationPhase {
    /// Waiting for local capture devices.
    #[default]
    AcquiringMedia,
    /// Initiator: building and publishing the offer.
    CreatingOffer,
    /// Initiator: offer published, waiting for the answer.
    AwaitingAnswer,
    /// Responder: media ready, waiting for the offer.
    AwaitingOffer,
    /// Both descriptions applied.
    DescriptionsExchanged,
    /// ICE connectivity checks running.
    IceChecking,
    /// A usable path exists; media flows.
    Connected,
    /// Path lost; the transport is trying to recover.
    Disconnected,
    /// Transport gave up. Terminal.
    Failed,
    /// Torn down. Terminal.
    Closed,
}

impl NegotiationPhase {
    /// Phases that can no longer progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the remote session description has been applied.
    pub fn has_remote_description(&self) -> bool {
        matches!(
            self,
            Self::DescriptionsExchanged | Self::IceChecking | Self::Connected | Self::Disconnected
        )
    }

    /// Phases in which the call is considered live (media path established at least once
    /// or being recovered).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Disconnected)
    }

    /// Short status line shown next to the call.
    pub const fn status_label(&self) -> &'static str {
        match self {
            Self::AcquiringMedia => "Requesting media access...",
            Self::CreatingOffer => "Creating offer...",
            Self::AwaitingAnswer => "Waiting for answer...",
            Self::AwaitingOffer => "Processing incoming call...",
            Self::DescriptionsExchanged | Self::IceChecking => "Connecting...",
            Self::Connected => "Connected",
            Self::Disconnected => "Reconnecting...",
            Self::Failed => "Connection Failed",
            Self::Closed => "Call Ended",
        }
    }

    /// Position in the forward ordering; `Connected` and `Disconnected` share a rank.
    pub const fn rank(&self) -> u8 {
        match self {
            Self::AcquiringMedia => 0,
            Self::CreatingOffer | Self::AwaitingOffer => 1,
            Self::AwaitingAnswer => 2,
            Self::DescriptionsExchanged => 3,
            Self::IceChecking => 4,
            Self::Connected | Self::Disconnected => 5,
            Self::Failed => 6,
            Self::Closed => 7,
        }
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events that move a session between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// Initiator has local media and starts building the offer.
    BeginOffer,
    /// Responder has local media and waits for the offer.
    AwaitOffer,
    /// Offer set locally and published.
    OfferSent,
    /// Remote offer or answer applied.
    RemoteDescriptionApplied,
    /// Local side is done with descriptions; ICE checks run.
    ChecksStarted,
    /// Transport reports a usable path.
    TransportConnected,
    /// Transport reports the path was lost.
    TransportLost,
    /// Transport gave up, or a negotiation step failed.
    TransportFailed,
    /// Ring timeout elapsed without an answer.
    AnswerTimedOut,
    /// Session torn down.
    Close,
}

/// A transition that is not allowed from the current phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: NegotiationPhase,
    pub attempted: PhaseTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in phase {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl NegotiationPhase {
    /// Compute the phase reached by applying `transition`.
    pub fn next(self, transition: PhaseTransition) -> Result<Self, InvalidTransition> {
        use NegotiationPhase as P;
        use PhaseTransition as T;

        let next = match (self, transition) {
            (P::AcquiringMedia, T::BeginOffer) => P::CreatingOffer,
            (P::AcquiringMedia, T::AwaitOffer) => P::AwaitingOffer,
            (P::CreatingOffer, T::OfferSent) => P::AwaitingAnswer,
            (P::AwaitingAnswer | P::AwaitingOffer, T::RemoteDescriptionApplied) => {
                P::DescriptionsExchanged
            }
            (P::DescriptionsExchanged, T::ChecksStarted) => P::IceChecking,
            (
                P::DescriptionsExchanged | P::IceChecking | P::Disconnected,
                T::TransportConnected,
            ) => P::Connected,
            (P::Connected, T::TransportLost) => P::Disconnected,
            (
                P::CreatingOffer
                | P::AwaitingAnswer
                | P::AwaitingOffer
                | P::DescriptionsExchanged
                | P::IceChecking
                | P::Connected
                | P::Disconnected,
                T::TransportFailed,
            ) => P::Failed,
            (P::AwaitingAnswer, T::AnswerTimedOut) => P::Failed,
            (current, T::Close) if !current.is_closed() => P::Closed,
            (current, attempted) => {
                return Err(InvalidTransition { current, attempted });
            }
        };
        Ok(next)
    }
}

/// Phase of one session, plus whether it was ever connected.
#[derive(Debug, Clone, Default)]
pub struct PhaseMachine {
    phase: NegotiationPhase,
    reached_connected: bool,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Whether `Connected` has been reached at least once.
    pub fn reached_connected(&self) -> bool {
        self.reached_connected
    }

    /// Apply a transition, returning the new phase.
    pub fn apply(&mut self, transition: PhaseTransition) -> Result<NegotiationPhase, InvalidTransition> {
        let next = self.phase.next(transition)?;
        log::trace!("phase {} -> {} ({:?})", self.phase, next, transition);
        self.phase = next;
        if next == NegotiationPhase::Connected {
            self.reached_connected = true;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationPhase as P;
    use PhaseTransition as T;

    fn run(transitions: &[PhaseTransition]) -> Result<PhaseMachine, InvalidTransition> {
        let mut m = PhaseMachine::new();
        for t in transitions {
            m.apply(*t)?;
        }
        Ok(m)
    }

    /// Flow: AcquiringMedia → CreatingOffer → AwaitingAnswer → DescriptionsExchanged
    /// → IceChecking → Connected → Closed
    #[test]
    fn initiator_flow() {
        let m = run(&[
            T::BeginOffer,
            T::OfferSent,
            T::RemoteDescriptionApplied,
            T::ChecksStarted,
            T::TransportConnected,
            T::Close,
        ])
        .unwrap();
        assert_eq!(m.phase(), P::Closed);
        assert!(m.reached_connected());
    }

    /// Flow: AcquiringMedia → AwaitingOffer → DescriptionsExchanged → IceChecking → Connected
    #[test]
    fn responder_flow() {
        let m = run(&[
            T::AwaitOffer,
            T::RemoteDescriptionApplied,
            T::ChecksStarted,
            T::TransportConnected,
        ])
        .unwrap();
        assert_eq!(m.phase(), P::Connected);
    }

    #[test]
    fn connected_and_disconnected_oscillate() {
        let mut m = run(&[
            T::AwaitOffer,
            T::RemoteDescriptionApplied,
            T::ChecksStarted,
            T::TransportConnected,
        ])
        .unwrap();

        for _ in 0..3 {
            assert_eq!(m.apply(T::TransportLost).unwrap(), P::Disconnected);
            assert_eq!(m.apply(T::TransportConnected).unwrap(), P::Connected);
        }
        m.apply(T::TransportLost).unwrap();
        assert_eq!(m.apply(T::TransportFailed).unwrap(), P::Failed);
        assert_eq!(m.apply(T::Close).unwrap(), P::Closed);
    }

    #[test]
    fn second_remote_description_is_rejected() {
        let mut m = run(&[T::BeginOffer, T::OfferSent, T::RemoteDescriptionApplied]).unwrap();
        let err = m.apply(T::RemoteDescriptionApplied).unwrap_err();
        assert_eq!(err.current, P::DescriptionsExchanged);
        assert_eq!(m.phase(), P::DescriptionsExchanged);
    }

    #[test]
    fn closed_accepts_nothing() {
        let mut m = run(&[T::Close]).unwrap();
        for t in [
            T::BeginOffer,
            T::RemoteDescriptionApplied,
            T::TransportConnected,
            T::TransportFailed,
            T::Close,
        ] {
            assert!(m.apply(t).is_err(), "{:?} accepted after close", t);
        }
    }

    #[test]
    fn failure_only_after_media() {
        assert!(P::AcquiringMedia.next(T::TransportFailed).is_err());
        assert_eq!(P::AwaitingAnswer.next(T::AnswerTimedOut).unwrap(), P::Failed);
        assert!(P::IceChecking.next(T::AnswerTimedOut).is_err());
    }

    #[test]
    fn forward_transitions_never_lower_rank() {
        let all = [
            P::AcquiringMedia,
            P::CreatingOffer,
            P::AwaitingAnswer,
            P::AwaitingOffer,
            P::DescriptionsExchanged,
            P::IceChecking,
            P::Connected,
            P::Disconnected,
            P::Failed,
            P::Closed,
        ];
        let transitions = [
            T::BeginOffer,
            T::AwaitOffer,
            T::OfferSent,
            T::RemoteDescriptionApplied,
            T::ChecksStarted,
            T::TransportConnected,
            T::TransportLost,
            T::TransportFailed,
            T::AnswerTimedOut,
            T::Close,
        ];
        for from in all {
            for t in transitions {
                if let Ok(to) = from.next(t) {
                    assert!(to.rank() >= from.rank(), "{from} -> {to} via {t:?}");
                }
            }
        }
    }

    #[test]
    fn labels_distinguish_reconnecting_from_failed() {
        assert_eq!(P::Disconnected.status_label(), "Reconnecting...");
        assert_eq!(P::Failed.status_label(), "Connection Failed");
        assert_ne!(P::Failed.status_label(), P::Closed.status_label());
    }
}
