//! Call-related error types.

use chatify_core::phase::InvalidTransition;
use chatify_core::types::{ChannelKey, UserId};
use thiserror::Error;

/// Local capture could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to use camera or microphone was denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// The signal relay could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("signal relay unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot start call: {0}")]
    CannotStart(#[from] MediaError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("a call on {0} is already in progress")]
    SessionBusy(ChannelKey),

    #[error("too many concurrent calls (limit {0})")]
    TooManyCalls(usize),

    #[error("no pending call from {0}")]
    NoPendingCall(UserId),

    #[error("call session closed")]
    Closed,
}
