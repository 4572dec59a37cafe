//! In-process stand-ins for capture devices, peer transports and playback.
//!
//! They follow the same contracts as the real collaborators (a remote
//! candidate before the remote description is an error, tracks stay live
//! until stopped) and expose knobs to inject the failures a real network and
//! real hardware produce.

use async_trait::async_trait;
use chatify_core::signaling::{IceCandidate, SessionDescription};
use chatify_core::types::CallMode;
use log::trace;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::MediaError;
use super::media::{
    LocalStream, MediaConstraints, MediaDevices, MediaTrack, PlaybackSink, RemoteStream, TrackKind,
};
use super::peer::{PeerConfig, PeerEvent, PeerTransport, PeerTransportFactory, TransportState};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn random_id(prefix: &str) -> String {
    format!("{}-{:08x}", prefix, rand::rng().random::<u32>())
}

#[derive(Debug)]
struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack for LoopbackTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            trace!("track {} stopped", self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct DevicesInner {
    deny: AtomicBool,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    requests: AtomicUsize,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
}

/// Fake microphone and camera.
#[derive(Clone, Default)]
pub struct LoopbackDevices {
    inner: Arc<DevicesInner>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every later request with `PermissionDenied`.
    pub fn deny_permission(&self) {
        self.inner.deny.store(true, Ordering::SeqCst);
    }

    /// Refuse every later request with `DeviceUnavailable`.
    pub fn unplug(&self) {
        self.inner.unavailable.store(true, Ordering::SeqCst);
    }

    /// Make each request take `delay` before it resolves.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.inner.delay) = Some(delay);
    }

    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        lock(&self.inner.tracks).iter().filter(|t| t.is_live()).count()
    }

    fn new_track(&self, kind: TrackKind) -> Arc<dyn MediaTrack> {
        let track = Arc::new(LoopbackTrack {
            id: random_id(match kind {
                TrackKind::Audio => "mic",
                TrackKind::Video => "cam",
            }),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        });
        lock(&self.inner.tracks).push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.inner.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            let what = if constraints.video.is_some() {
                "camera"
            } else {
                "microphone"
            };
            return Err(MediaError::DeviceUnavailable(format!("no {what} found")));
        }

        let mut tracks = vec![self.new_track(TrackKind::Audio)];
        if constraints.video.is_some() {
            tracks.push(self.new_track(TrackKind::Video));
        }
        Ok(LocalStream::new(random_id("stream"), tracks))
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_descriptions: usize,
    offers: usize,
    answers: usize,
    applied: Vec<String>,
    local_tracks: usize,
    connected: bool,
    closed: bool,
}

struct PeerShared {
    id: String,
    events: mpsc::Sender<PeerEvent>,
    state: Mutex<PeerState>,
    broken: AtomicBool,
    next_candidate: AtomicUsize,
}

impl PeerShared {
    fn emit(&self, event: PeerEvent) {
        if lock(&self.state).closed {
            return;
        }
        if self.events.try_send(event).is_err() {
            trace!("peer {} has no event listener", self.id);
        }
    }

    fn gather_one(&self) {
        let n = self.next_candidate.fetch_add(1, Ordering::SeqCst);
        let candidate = IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            n,
            50000 + n
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0);
        self.emit(PeerEvent::CandidateDiscovered(candidate));
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut st = lock(&self.state);
            let ready = !st.connected
                && !st.closed
                && st.local.is_some()
                && st.remote.is_some()
                && !st.applied.is_empty();
            if ready {
                st.connected = true;
            }
            ready
        };
        if ready {
            self.emit(PeerEvent::StateChanged(TransportState::Checking));
            self.emit(PeerEvent::StateChanged(TransportState::Connected));
        }
    }

    fn check_usable(&self) -> Result<(), anyhow::Error> {
        if lock(&self.state).closed {
            return Err(anyhow::anyhow!("peer {} is closed", self.id));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("peer {} failed to negotiate", self.id));
        }
        Ok(())
    }

    fn fake_sdp(&self, kind: &str, video: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.id, kind
        );
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }
}

/// In-process peer connection. Connects once both descriptions are set and
/// at least one remote candidate has been applied.
pub struct LoopbackPeer {
    shared: Arc<PeerShared>,
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), anyhow::Error> {
        self.shared.check_usable()?;
        lock(&self.shared.state).local_tracks = stream.tracks().len();
        Ok(())
    }

    async fn create_offer(&self, mode: CallMode) -> Result<SessionDescription, anyhow::Error> {
        self.shared.check_usable()?;
        lock(&self.shared.state).offers += 1;
        Ok(SessionDescription::offer(
            self.shared.fake_sdp("offer", mode.has_video()),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        self.shared.check_usable()?;
        let mut st = lock(&self.shared.state);
        let video = match &st.remote {
            Some(remote) => remote.sdp.contains("m=video"),
            None => return Err(anyhow::anyhow!("cannot answer without a remote offer")),
        };
        st.answers += 1;
        drop(st);
        Ok(SessionDescription::answer(self.shared.fake_sdp("answer", video)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), anyhow::Error> {
        self.shared.check_usable()?;
        lock(&self.shared.state).local = Some(desc.clone());

        // Gathering starts once the local description is in place.
        for _ in 0..2 {
            self.shared.gather_one();
        }
        self.shared.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.shared.check_usable()?;
        {
            let mut st = lock(&self.shared.state);
            st.remote = Some(desc.clone());
            st.remote_descriptions += 1;
        }
        self.shared.emit(PeerEvent::TrackReceived(RemoteStream::new(format!(
            "remote-{}",
            self.shared.id
        ))));
        self.shared.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), anyhow::Error> {
        self.shared.check_usable()?;
        {
            let mut st = lock(&self.shared.state);
            if st.remote.is_none() {
                return Err(anyhow::anyhow!(
                    "remote description not set, cannot add candidate"
                ));
            }
            st.applied.push(candidate.candidate.clone());
        }
        self.shared.maybe_connect();
        Ok(())
    }

    async fn close(&self) {
        lock(&self.shared.state).closed = true;
    }
}

/// Test and demo controls for a [`LoopbackPeer`].
#[derive(Clone)]
pub struct LoopbackPeerHandle {
    shared: Arc<PeerShared>,
}

impl LoopbackPeerHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Candidate lines applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.shared.state).applied.clone()
    }

    pub fn remote_descriptions(&self) -> usize {
        lock(&self.shared.state).remote_descriptions
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.shared.state).offers
    }

    pub fn answers_created(&self) -> usize {
        lock(&self.shared.state).answers
    }

    pub fn local_tracks(&self) -> usize {
        lock(&self.shared.state).local_tracks
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.state).connected
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Make every later description or candidate operation fail.
    pub fn break_negotiation(&self) {
        self.shared.broken.store(true, Ordering::SeqCst);
    }

    /// Gather one more local candidate, as a late network change would.
    pub fn discover_candidate(&self) {
        self.shared.gather_one();
    }

    /// Report a transient loss of the media path.
    pub fn drop_connection(&self) {
        self.shared
            .emit(PeerEvent::StateChanged(TransportState::Disconnected));
    }

    /// Report that the path recovered.
    pub fn restore_connection(&self) {
        self.shared
            .emit(PeerEvent::StateChanged(TransportState::Connected));
    }

    /// Report that ICE gave up.
    pub fn fail_connection(&self) {
        self.shared.emit(PeerEvent::StateChanged(TransportState::Failed));
    }
}

/// Creates [`LoopbackPeer`]s and keeps a handle to each.
#[derive(Clone, Default)]
pub struct LoopbackPeerFactory {
    peers: Arc<Mutex<Vec<LoopbackPeerHandle>>>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> Vec<LoopbackPeerHandle> {
        lock(&self.peers).clone()
    }

    pub fn last_peer(&self) -> Option<LoopbackPeerHandle> {
        lock(&self.peers).last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::new(PeerShared {
            id: random_id("peer"),
            events: tx,
            state: Mutex::new(PeerState::default()),
            broken: AtomicBool::new(false),
            next_candidate: AtomicUsize::new(0),
        });
        trace!(
            "created loopback peer {} with {} ICE servers",
            shared.id,
            config.ice_servers.len()
        );
        lock(&self.peers).push(LoopbackPeerHandle {
            shared: shared.clone(),
        });
        Ok((Arc::new(LoopbackPeer { shared }), rx))
    }
}

#[derive(Default)]
struct SinkState {
    attached: Vec<String>,
    current: Option<String>,
    detaches: usize,
    muted: bool,
}

/// Playback surface that records what it was asked to do.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stream ever attached, in order.
    pub fn attached(&self) -> Vec<String> {
        lock(&self.state).attached.clone()
    }

    pub fn current(&self) -> Option<String> {
        lock(&self.state).current.clone()
    }

    pub fn detach_count(&self) -> usize {
        lock(&self.state).detaches
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.state).muted
    }
}

impl PlaybackSink for RecordingSink {
    fn attach(&self, stream: &RemoteStream) {
        let mut st = lock(&self.state);
        st.attached.push(stream.id.clone());
        st.current = Some(stream.id.clone());
    }

    fn detach(&self) {
        let mut st = lock(&self.state);
        st.current = None;
        st.detaches += 1;
    }

    fn set_muted(&self, muted: bool) {
        lock(&self.state).muted = muted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn candidate_before_remote_description_is_an_error() {
        let factory = LoopbackPeerFactory::new();
        let (peer, _rx) = factory.create(&PeerConfig::default()).await.unwrap();
        assert!(
            peer.add_ice_candidate(&IceCandidate::new("candidate:0"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn connects_after_descriptions_and_candidate() {
        let factory = LoopbackPeerFactory::new();
        let (peer, mut rx) = factory.create(&PeerConfig::default()).await.unwrap();

        let offer = peer.create_offer(CallMode::Video).await.unwrap();
        peer.set_local_description(&offer).await.unwrap();
        peer.set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        peer.add_ice_candidate(&IceCandidate::new("candidate:x"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        let candidates = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::CandidateDiscovered(_)))
            .count();
        assert_eq!(candidates, 2);
        assert!(events.iter().any(|e| matches!(e, PeerEvent::TrackReceived(_))));
        assert!(matches!(
            events.last(),
            Some(PeerEvent::StateChanged(TransportState::Connected))
        ));
        assert!(factory.last_peer().unwrap().is_connected());
    }

    #[tokio::test]
    async fn denied_devices_hand_out_nothing() {
        let devices = LoopbackDevices::new();
        devices.deny_permission();
        let err = devices
            .get_user_media(&MediaConstraints::for_mode(CallMode::Video))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
        assert_eq!(devices.live_tracks(), 0);
    }
}
