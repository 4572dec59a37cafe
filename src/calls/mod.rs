//! Peer-to-peer call signaling and session negotiation.
//!
//! Calls are negotiated with an offer/answer/candidate exchange relayed
//! through the backend's realtime channel, then media flows directly between
//! the two peers.
//!
//! # Architecture
//!
//! - [`SignalRelay`]: publish/subscribe boundary to the realtime backend
//! - [`Negotiator`]: offer/answer state machine over one peer transport
//! - [`MediaController`]: local capture and remote playback of one call
//! - [`CallSession`]: per-call task that ties the above together
//! - [`CallManager`]: incoming-call listener, accept/decline, session registry
//!
//! # Signaling Overview
//!
//! The initiator publishes an `offer`, the responder answers with an
//! `answer`, and both sides trickle `candidate` messages as they are
//! gathered. Either side may publish `end` at any time. Messages from one
//! sender arrive in order; nothing is guaranteed across senders, so
//! candidates that beat their description are queued until it lands.

mod error;
mod events;
pub mod loopback;
mod manager;
mod media;
mod negotiation;
mod peer;
mod relay;
mod session;
#[cfg(feature = "webrtc")]
mod webrtc;

pub use error::{CallError, MediaError, RelayError};
pub use events::{EventSource, Subscription};
pub use manager::{CallManager, CallManagerConfig, IncomingCall, ManagerEvent, RejectReason};
pub use media::{
    Acquisition, AudioConstraints, FacingMode, LocalStream, MediaConstraints, MediaController,
    MediaDevices, MediaSessionState, MediaTrack, PlaybackSink, RemoteStream, TrackKind,
    VideoConstraints,
};
pub use negotiation::{Negotiator, SignalOutcome};
pub use peer::{
    IceServer, PeerConfig, PeerEvent, PeerTransport, PeerTransportFactory, TransportState,
};
pub use relay::{InMemoryRelay, SignalFilter, SignalRelay, SignalStream};
pub use session::{
    CallEvent, CallOutcome, CallSession, CallSnapshot, DeviceLease, DeviceLock, EndReason,
    SessionDeps, SessionStart,
};
#[cfg(feature = "webrtc")]
pub use webrtc::{WebRtcPeer, WebRtcPeerFactory};
