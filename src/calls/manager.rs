//! Call manager for orchestrating call lifecycle.
//!
//! While listening, the manager holds the only relay subscription for the
//! local user and routes every message itself: offers from unknown callers
//! become pending incoming calls, everything from a peer with a running
//! session is forwarded to that session in arrival order.

use chatify_core::signaling::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use chatify_core::types::{CallIntent, CallMode, ChannelKey, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::CallError;
use super::events::EventSource;
use super::media::{MediaDevices, PlaybackSink};
use super::peer::{IceServer, PeerConfig, PeerTransportFactory};
use super::relay::{SignalFilter, SignalRelay, SignalStream};
use super::session::{CallSession, DeviceLock, SessionDeps, SessionStart};

/// Configuration for the call manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls allowed.
    pub max_concurrent_calls: usize,
    /// Ring timeout in seconds before giving up on an unanswered call. 0 disables it.
    pub ring_timeout_secs: u64,
    /// How long an unanswered incoming call is kept when the caller's `End`
    /// never arrives. 0 keeps it until accepted or declined.
    pub pending_timeout_secs: u64,
    /// STUN/TURN servers; empty means the built-in defaults.
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            ring_timeout_secs: 45,
            pending_timeout_secs: 60,
            ice_servers: Vec::new(),
        }
    }
}

impl CallManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    pub fn pending_timeout(&self) -> Option<Duration> {
        (self.pending_timeout_secs > 0).then(|| Duration::from_secs(self.pending_timeout_secs))
    }

    pub fn peer_config(&self) -> PeerConfig {
        if self.ice_servers.is_empty() {
            PeerConfig::default()
        } else {
            PeerConfig {
                ice_servers: self.ice_servers.clone(),
            }
        }
    }
}

/// An offer waiting for the user to accept or decline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from: UserId,
    pub mode: CallMode,
    pub received_at: DateTime<Utc>,
    offer: SessionDescription,
    candidates: Vec<IceCandidate>,
}

impl IncomingCall {
    /// Whether the offer is older than `timeout`. Offers stamped in the
    /// future never count as stale.
    fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        older_than(self.received_at, timeout, now)
    }

    /// Candidates that arrived after the offer, still waiting for accept.
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }
}

fn older_than(at: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> bool {
    (now - at).to_std().is_ok_and(|age| age > timeout)
}

/// Why an incoming offer was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A session with this peer is already running.
    PairBusy,
    /// The concurrent call limit is reached.
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    IncomingCall(IncomingCall),
    /// The caller hung up before the call was accepted.
    IncomingCancelled { from: UserId },
    /// The call rang past the pending timeout without an answer or an `End`.
    IncomingExpired { from: UserId },
    OfferRejected {
        from: UserId,
        mode: Option<CallMode>,
        reason: RejectReason,
    },
}

/// What the router knows about one remote peer.
enum PeerSlot {
    Pending(IncomingCall),
    Routed {
        route_id: u64,
        tx: mpsc::UnboundedSender<SignalingMessage>,
    },
}

struct ManagerShared {
    local_id: UserId,
    config: CallManagerConfig,
    deps: SessionDeps,
    sessions: DashMap<ChannelKey, Arc<CallSession>>,
    peers: Arc<DashMap<UserId, PeerSlot>>,
    next_route: AtomicU64,
    events: EventSource<ManagerEvent>,
}

/// Manages active calls and pending incoming calls for one user.
pub struct CallManager {
    shared: Arc<ManagerShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    pub fn new(
        local_id: UserId,
        config: CallManagerConfig,
        relay: Arc<dyn SignalRelay>,
        devices: Arc<dyn MediaDevices>,
        sink: Arc<dyn PlaybackSink>,
        transports: Arc<dyn PeerTransportFactory>,
    ) -> Arc<Self> {
        let deps = SessionDeps {
            relay,
            devices,
            sink,
            transports,
            peer_config: config.peer_config(),
            device_lock: DeviceLock::new(),
            ring_timeout: config.ring_timeout(),
        };
        Arc::new(Self {
            shared: Arc::new(ManagerShared {
                local_id,
                config,
                deps,
                sessions: DashMap::new(),
                peers: Arc::new(DashMap::new()),
                next_route: AtomicU64::new(0),
                events: EventSource::new(),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn local_id(&self) -> &UserId {
        &self.shared.local_id
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventSource<ManagerEvent> {
        &self.shared.events
    }

    /// Shared capture lock used by every session of this manager.
    pub fn device_lock(&self) -> &DeviceLock {
        &self.shared.deps.device_lock
    }

    /// Subscribe to everything addressed to the local user. Idempotent.
    pub async fn start_listening(&self) -> Result<(), CallError> {
        if self.is_listening() {
            return Ok(());
        }
        let inbox = self
            .shared
            .deps
            .relay
            .subscribe(SignalFilter::addressed_to(self.shared.local_id.clone()))
            .await?;
        let shared = self.shared.clone();
        let task = tokio::spawn(listen(shared, inbox));

        let mut slot = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        info!("Listening for calls to {}", self.shared.local_id);
        Ok(())
    }

    pub fn stop_listening(&self) {
        let task = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        drop_routes(&self.shared);
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Start an outgoing call.
    pub async fn start_call(
        &self,
        remote_id: UserId,
        mode: CallMode,
    ) -> Result<Arc<CallSession>, CallError> {
        // Clean up ended calls before checking limits
        self.cleanup_ended_sessions();
        expire_pending(&self.shared);

        let intent = CallIntent::outgoing(self.shared.local_id.clone(), remote_id, mode);
        self.check_capacity(&intent.channel_key())?;
        if matches!(
            self.shared.peers.get(&intent.remote_id).as_deref(),
            Some(PeerSlot::Pending(_))
        ) {
            // They are already calling us; the user should accept instead.
            return Err(CallError::SessionBusy(intent.channel_key()));
        }

        let mut start = SessionStart::new(intent.clone());
        if self.is_listening() {
            start = start.with_signals(self.open_route(&intent.remote_id)?);
        }
        self.spawn_session(start).await
    }

    /// Accept a pending incoming call.
    pub async fn accept(&self, remote_id: &UserId) -> Result<Arc<CallSession>, CallError> {
        self.cleanup_ended_sessions();
        expire_pending(&self.shared);
        if !matches!(
            self.shared.peers.get(remote_id).as_deref(),
            Some(PeerSlot::Pending(_))
        ) {
            return Err(CallError::NoPendingCall(remote_id.clone()));
        }
        self.check_capacity(&ChannelKey::new(&self.shared.local_id, remote_id))?;

        let (call, signals) = self.claim_pending(remote_id)?;
        let intent = CallIntent::incoming(self.shared.local_id.clone(), call.from.clone(), call.mode);
        info!(
            "Accepting {} call from {} ({} early candidates)",
            call.mode,
            call.from,
            call.candidates.len()
        );
        let mut start = SessionStart::new(intent).with_offer(call.offer, call.candidates);
        if let Some(signals) = signals {
            start = start.with_signals(signals);
        }
        self.spawn_session(start).await
    }

    /// Drop a pending incoming call and tell the caller.
    pub async fn decline(&self, remote_id: &UserId) -> Result<(), CallError> {
        let removed = self
            .shared
            .peers
            .remove_if(remote_id, |_, slot| matches!(slot, PeerSlot::Pending(_)));
        if removed.is_none() {
            return Err(CallError::NoPendingCall(remote_id.clone()));
        }
        info!("Declined call from {}", remote_id);

        let end = SignalingMessage::end(self.shared.local_id.clone(), remote_id.clone());
        if let Err(e) = self.shared.deps.relay.publish(&end).await {
            warn!("Failed to notify {} of decline: {}", remote_id, e);
        }
        Ok(())
    }

    pub fn pending_incoming(&self) -> Vec<IncomingCall> {
        expire_pending(&self.shared);
        self.shared
            .peers
            .iter()
            .filter_map(|entry| match entry.value() {
                PeerSlot::Pending(call) => Some(call.clone()),
                PeerSlot::Routed { .. } => None,
            })
            .collect()
    }

    /// The session with `remote_id`, if one is registered.
    pub fn session(&self, remote_id: &UserId) -> Option<Arc<CallSession>> {
        let key = ChannelKey::new(&self.shared.local_id, remote_id);
        self.shared.sessions.get(&key).map(|s| s.clone())
    }

    pub fn active_sessions(&self) -> usize {
        active_count(&self.shared)
    }

    /// Remove ended sessions from the registry.
    pub fn cleanup_ended_sessions(&self) -> usize {
        let before = self.shared.sessions.len();
        self.shared.sessions.retain(|_, s| !s.is_ended());
        let removed = before - self.shared.sessions.len();
        if removed > 0 {
            debug!("Cleaned up {} ended sessions", removed);
        }
        removed
    }

    fn check_capacity(&self, key: &ChannelKey) -> Result<(), CallError> {
        if self
            .shared
            .sessions
            .get(key)
            .is_some_and(|s| !s.is_ended())
        {
            return Err(CallError::SessionBusy(key.clone()));
        }
        let limit = self.shared.config.max_concurrent_calls;
        if active_count(&self.shared) >= limit {
            return Err(CallError::TooManyCalls(limit));
        }
        Ok(())
    }

    /// Turn a pending slot into a live route in one step, so nothing the
    /// caller sends in between is lost or delivered twice.
    fn claim_pending(
        &self,
        remote_id: &UserId,
    ) -> Result<(IncomingCall, Option<SignalStream>), CallError> {
        let no_pending = || CallError::NoPendingCall(remote_id.clone());

        if !self.is_listening() {
            return match self
                .shared
                .peers
                .remove_if(remote_id, |_, s| matches!(s, PeerSlot::Pending(_)))
            {
                Some((_, PeerSlot::Pending(call))) => Ok((call, None)),
                _ => Err(no_pending()),
            };
        }

        let (route_id, tx, stream) = self.new_route(remote_id);
        let claimed = match self.shared.peers.get_mut(remote_id) {
            Some(mut slot) if matches!(slot.value(), PeerSlot::Pending(_)) => Some(
                std::mem::replace(slot.value_mut(), PeerSlot::Routed { route_id, tx }),
            ),
            _ => None,
        };
        match claimed {
            Some(PeerSlot::Pending(call)) => Ok((call, Some(stream))),
            _ => Err(no_pending()),
        }
    }

    fn open_route(&self, remote_id: &UserId) -> Result<SignalStream, CallError> {
        let (route_id, tx, stream) = self.new_route(remote_id);
        let inserted = match self.shared.peers.entry(remote_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(PeerSlot::Routed { route_id, tx });
                true
            }
        };
        if inserted {
            Ok(stream)
        } else {
            Err(CallError::SessionBusy(ChannelKey::new(
                &self.shared.local_id,
                remote_id,
            )))
        }
    }

    fn new_route(
        &self,
        remote_id: &UserId,
    ) -> (u64, mpsc::UnboundedSender<SignalingMessage>, SignalStream) {
        let route_id = self.shared.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let peers: Weak<DashMap<UserId, PeerSlot>> = Arc::downgrade(&self.shared.peers);
        let remote = remote_id.clone();
        let stream = SignalStream::new(rx, move || {
            if let Some(peers) = peers.upgrade() {
                peers.remove_if(&remote, |_, slot| {
                    matches!(slot, PeerSlot::Routed { route_id: id, .. } if *id == route_id)
                });
            }
        });
        (route_id, tx, stream)
    }

    async fn spawn_session(&self, start: SessionStart) -> Result<Arc<CallSession>, CallError> {
        let session = Arc::new(CallSession::start(&self.shared.deps, start).await?);
        self.shared
            .sessions
            .insert(session.channel_key(), session.clone());
        Ok(session)
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

fn active_count(shared: &ManagerShared) -> usize {
    shared.sessions.iter().filter(|s| !s.is_ended()).count()
}

/// Close every live route. Sessions fed by the router lose their signaling
/// and end; pending incoming calls stay so they can still be declined.
fn drop_routes(shared: &ManagerShared) {
    let before = shared.peers.len();
    shared
        .peers
        .retain(|_, slot| matches!(slot, PeerSlot::Pending(_)));
    let dropped = before.saturating_sub(shared.peers.len());
    if dropped > 0 {
        info!("Closed {} call routes for {}", dropped, shared.local_id);
    }
}

/// Forget incoming calls that rang past the pending timeout.
fn expire_pending(shared: &ManagerShared) {
    let Some(timeout) = shared.config.pending_timeout() else {
        return;
    };
    let now = Utc::now();
    let mut expired = Vec::new();
    shared.peers.retain(|from, slot| match slot {
        PeerSlot::Pending(call) if call.is_stale(timeout, now) => {
            expired.push(from.clone());
            false
        }
        _ => true,
    });
    for from in expired {
        info!("Incoming call from {} expired unanswered", from);
        shared.events.emit(ManagerEvent::IncomingExpired { from });
    }
}

/// Incoming-call listener and router.
async fn listen(shared: Arc<ManagerShared>, mut inbox: SignalStream) {
    let _guard = scopeguard::guard(shared.local_id.clone(), |id| {
        debug!("Stopped listening for calls to {}", id);
    });

    while let Some(msg) = inbox.next().await {
        route(&shared, msg);
    }
    // The relay closed the inbox. An abort goes through `stop_listening`,
    // which drops the routes itself.
    warn!("Relay closed the inbox of {}", shared.local_id);
    drop_routes(&shared);
}

fn route(shared: &ManagerShared, msg: SignalingMessage) {
    let from = msg.from_id.clone();
    expire_pending(shared);

    // Offers from a peer we are already in a call with are never merged.
    if let Some(slot) = shared.peers.get(&from)
        && let PeerSlot::Routed { tx, .. } = slot.value()
    {
        if msg.kind == SignalKind::Offer {
            drop(slot);
            info!("Rejecting second offer from {}: call in progress", from);
            shared.events.emit(ManagerEvent::OfferRejected {
                from,
                mode: msg.mode,
                reason: RejectReason::PairBusy,
            });
            return;
        }
        if tx.send(msg).is_err() {
            debug!("Session with {} is gone, dropping its route", from);
            drop(slot);
            shared
                .peers
                .remove_if(&from, |_, s| matches!(s, PeerSlot::Routed { .. }));
        }
        return;
    }

    match msg.kind {
        SignalKind::Offer => on_offer(shared, msg),
        SignalKind::Candidate => {
            if let Some(mut slot) = shared.peers.get_mut(&from)
                && let PeerSlot::Pending(call) = slot.value_mut()
                && let Some(c) = msg.ice_candidate()
            {
                call.candidates.push(c.clone());
                return;
            }
            debug!("Dropping stray candidate from {}", from);
        }
        SignalKind::End => {
            let removed = shared
                .peers
                .remove_if(&from, |_, s| matches!(s, PeerSlot::Pending(_)));
            if removed.is_some() {
                info!("{} cancelled the call", from);
                shared.events.emit(ManagerEvent::IncomingCancelled { from });
            } else {
                debug!("Dropping stray end from {}", from);
            }
        }
        SignalKind::Answer => debug!("Dropping stray answer from {}", from),
    }
}

fn on_offer(shared: &ManagerShared, msg: SignalingMessage) {
    let from = msg.from_id.clone();
    let Some(offer) = msg.description().cloned() else {
        return;
    };
    let mode = msg.mode.unwrap_or_default();

    if let Some(timeout) = shared.config.pending_timeout()
        && older_than(msg.created_at, timeout, Utc::now())
    {
        debug!("Ignoring stale offer from {} sent at {}", from, msg.created_at);
        return;
    }
    if shared.peers.contains_key(&from) {
        debug!("Duplicate offer from {} ignored", from);
        return;
    }
    let key = ChannelKey::new(&shared.local_id, &from);
    let pair_busy = shared.sessions.get(&key).is_some_and(|s| !s.is_ended());
    let limit_reached = active_count(shared) >= shared.config.max_concurrent_calls;
    if pair_busy || limit_reached {
        info!("Rejecting offer from {}: busy", from);
        shared.events.emit(ManagerEvent::OfferRejected {
            from,
            mode: msg.mode,
            reason: if pair_busy {
                RejectReason::PairBusy
            } else {
                RejectReason::LimitReached
            },
        });
        return;
    }

    let call = IncomingCall {
        from: from.clone(),
        mode,
        received_at: msg.created_at,
        offer,
        candidates: Vec::new(),
    };
    info!("Incoming {} call from {}", mode, from);
    shared.peers.insert(from, PeerSlot::Pending(call.clone()));
    shared.events.emit(ManagerEvent::IncomingCall(call));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_json() {
        let cfg = CallManagerConfig::default();
        assert_eq!(cfg.max_concurrent_calls, 1);
        assert_eq!(cfg.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(cfg.peer_config(), PeerConfig::default());
        assert_eq!(cfg.pending_timeout(), Some(Duration::from_secs(60)));

        let cfg = CallManagerConfig::from_json(
            r#"{"ring_timeout_secs": 0, "pending_timeout_secs": 0}"#,
        )
        .unwrap();
        assert_eq!(cfg.ring_timeout(), None);
        assert_eq!(cfg.pending_timeout(), None);
        assert_eq!(cfg.max_concurrent_calls, 1);

        let cfg = CallManagerConfig::from_json(
            r#"{"ice_servers": [{"urls": ["stun:stun.example.org:3478"]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.peer_config().ice_servers.len(), 1);
    }

    fn incoming(received_at: DateTime<Utc>) -> IncomingCall {
        IncomingCall {
            from: UserId::new("alice"),
            mode: CallMode::Audio,
            received_at,
            offer: SessionDescription::offer("v=0\r\n"),
            candidates: Vec::new(),
        }
    }

    #[test]
    fn pending_call_staleness() {
        let now = Utc::now();
        let timeout = Duration::from_secs(60);
        assert!(!incoming(now - chrono::Duration::seconds(30)).is_stale(timeout, now));
        assert!(incoming(now - chrono::Duration::seconds(61)).is_stale(timeout, now));
        // Clock skew on the sender side does not expire a fresh call.
        assert!(!incoming(now + chrono::Duration::seconds(30)).is_stale(timeout, now));
    }
}
