//! Peer transport boundary: the component that actually moves media.
//!
//! A transport is created per session from a [`PeerTransportFactory`] and
//! reports what it discovers through an event channel, mirroring how the
//! socket transports hand back `(transport, events)` pairs.

use async_trait::async_trait;
use chatify_core::signaling::{IceCandidate, SessionDescription};
use chatify_core::types::CallMode;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::media::{LocalStream, RemoteStream};

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An event produced by a peer transport.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer.
    CandidateDiscovered(IceCandidate),
    /// Connectivity changed.
    StateChanged(TransportState),
    /// The peer's media arrived.
    TrackReceived(RemoteStream),
}

/// One peer-to-peer media session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach local capture so it is negotiated into the next description.
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), anyhow::Error>;

    async fn create_offer(&self, mode: CallMode) -> Result<SessionDescription, anyhow::Error>;

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), anyhow::Error>;

    async fn set_remote_description(&self, desc: &SessionDescription)
    -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), anyhow::Error>;

    /// Shut the session down. Safe to call more than once.
    async fn close(&self);
}

/// Creates transports for new sessions.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}

/// A STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServer>> = Lazy::new(|| {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::stun("stun:stun2.l.google.com:19302"),
        IceServer::stun("stun:stun3.l.google.com:19302"),
        IceServer::stun("stun:stun4.l.google.com:19302"),
        IceServer::turn(
            "turn:openrelay.metered.ca:80",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443",
            "openrelayproject",
            "openrelayproject",
        ),
    ]
});

/// Settings handed to the transport factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

impl PeerConfig {
    pub fn default_ice_servers() -> &'static [IceServer] {
        &DEFAULT_ICE_SERVERS
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_servers_include_stun_and_turn() {
        let cfg = PeerConfig::default();
        let stun = cfg
            .ice_servers
            .iter()
            .filter(|s| s.urls[0].starts_with("stun:"))
            .count();
        let turn: Vec<_> = cfg
            .ice_servers
            .iter()
            .filter(|s| s.urls[0].starts_with("turn:"))
            .collect();

        assert_eq!(stun, 5);
        assert_eq!(turn.len(), 2);
        assert!(turn.iter().all(|s| s.username.is_some() && s.credential.is_some()));
    }

    #[test]
    fn ice_server_from_json() {
        let s: IceServer =
            serde_json::from_str(r#"{"urls":["stun:stun.example.org:3478"]}"#).unwrap();
        assert_eq!(s, IceServer::stun("stun:stun.example.org:3478"));
    }
}
