//! Call session supervisor.
//!
//! Each session runs as one task that owns the negotiator, the media
//! controller and the relay subscription, and processes commands, relay
//! messages, transport events and the ring timer one at a time. The
//! [`CallSession`] handle talks to it over a command channel and observes it
//! through a watch channel and an event source.

use chatify_core::clock::{CallClock, Presentation, format_duration};
use chatify_core::phase::{NegotiationPhase, PhaseTransition};
use chatify_core::signaling::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use chatify_core::types::{CallIntent, ChannelKey};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot, watch};

use super::error::{CallError, MediaError};
use super::events::EventSource;
use super::media::{
    Acquisition, LocalStream, MediaController, MediaDevices, MediaSessionState, PlaybackSink,
};
use super::negotiation::{Negotiator, SignalOutcome};
use super::peer::{PeerConfig, PeerEvent, PeerTransportFactory, TransportState};
use super::relay::{SignalFilter, SignalRelay, SignalStream};

/// Exclusive access to the local capture devices.
///
/// Sessions sharing one lock never hold capture at the same time; a new call
/// waits until the previous one has released its stream.
#[derive(Debug, Clone, Default)]
pub struct DeviceLock {
    inner: Arc<Mutex<()>>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lease(&self) -> DeviceLease {
        DeviceLease {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn is_leased(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Held from acquisition until the session releases its media.
#[derive(Debug)]
pub struct DeviceLease {
    _guard: OwnedMutexGuard<()>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// The ring timeout elapsed while waiting for an answer.
    NoAnswer,
    TransportFailed(String),
    CannotStart(MediaError),
    /// The signaling stream closed, so a remote hangup could no longer arrive.
    SignalingLost,
}

impl EndReason {
    /// Short notice shown to the user.
    pub fn notice(&self) -> &'static str {
        match self {
            Self::LocalHangup => "Call ended",
            Self::RemoteHangup => "Call ended by remote user",
            Self::NoAnswer => "No answer",
            Self::TransportFailed(_) => "Connection failed",
            Self::SignalingLost => "Call ended: signaling lost",
            Self::CannotStart(MediaError::PermissionDenied) => {
                "Could not access camera or microphone"
            }
            Self::CannotStart(MediaError::DeviceUnavailable(_)) => "No camera or microphone found",
        }
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub reason: EndReason,
    /// Time spent since the first `Connected`; zero if it never connected.
    pub duration: Duration,
    pub was_connected: bool,
}

/// Everything the UI needs to draw the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub phase: NegotiationPhase,
    pub presentation: Presentation,
    pub media: MediaSessionState,
    pub clock: CallClock,
}

impl CallSnapshot {
    fn initial(media: MediaSessionState) -> Self {
        Self {
            phase: NegotiationPhase::AcquiringMedia,
            presentation: Presentation::default(),
            media,
            clock: CallClock::new(),
        }
    }

    pub fn status_label(&self) -> &'static str {
        self.phase.status_label()
    }

    /// Running call duration as `m:ss`.
    pub fn duration_label(&self) -> String {
        format_duration(self.clock.elapsed(now()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    PhaseChanged(NegotiationPhase),
    MediaChanged(MediaSessionState),
    PresentationChanged(Presentation),
    RemoteStreamBound(String),
    Ended(CallOutcome),
}

#[derive(Debug)]
enum SessionCommand {
    End,
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<Option<bool>>),
    ToggleSpeaker(oneshot::Sender<bool>),
    SetPresentation(Presentation),
    TogglePresentation,
}

/// Collaborators shared by every session of one user.
#[derive(Clone)]
pub struct SessionDeps {
    pub relay: Arc<dyn SignalRelay>,
    pub devices: Arc<dyn MediaDevices>,
    pub sink: Arc<dyn PlaybackSink>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub peer_config: PeerConfig,
    pub device_lock: DeviceLock,
    /// `None` disables the ring timeout.
    pub ring_timeout: Option<Duration>,
}

/// Per-call inputs.
#[derive(Debug)]
pub struct SessionStart {
    pub intent: CallIntent,
    /// Offer already received by the incoming-call listener (responder only).
    pub offer: Option<SessionDescription>,
    /// Candidates received alongside that offer, in arrival order.
    pub early_candidates: Vec<IceCandidate>,
    /// Pre-routed signaling; when absent the session subscribes itself.
    pub signals: Option<SignalStream>,
}

impl SessionStart {
    pub fn new(intent: CallIntent) -> Self {
        Self {
            intent,
            offer: None,
            early_candidates: Vec::new(),
            signals: None,
        }
    }

    pub fn with_offer(mut self, offer: SessionDescription, candidates: Vec<IceCandidate>) -> Self {
        self.offer = Some(offer);
        self.early_candidates = candidates;
        self
    }

    pub fn with_signals(mut self, signals: SignalStream) -> Self {
        self.signals = Some(signals);
        self
    }
}

/// Handle to a running call.
pub struct CallSession {
    intent: CallIntent,
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    outcome: watch::Receiver<Option<CallOutcome>>,
    events: EventSource<CallEvent>,
}

impl CallSession {
    /// Subscribe to signaling, create the transport and spawn the session.
    ///
    /// The subscription exists before anything is published, so an early
    /// answer cannot be missed.
    pub async fn start(deps: &SessionDeps, start: SessionStart) -> Result<Self, CallError> {
        let SessionStart {
            intent,
            offer,
            early_candidates,
            signals,
        } = start;

        let signals = match signals {
            Some(s) => s,
            None => deps.relay.subscribe(SignalFilter::for_call(&intent)).await?,
        };
        let (transport, peer_events) = deps
            .transports
            .create(&deps.peer_config)
            .await
            .map_err(CallError::Transport)?;

        let mut negotiator = Negotiator::new(intent.clone(), transport, deps.relay.clone());
        negotiator.seed_candidates(early_candidates);

        let media = MediaController::new(intent.mode, deps.devices.clone(), deps.sink.clone());
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::initial(media.state()));
        let (outcome_tx, outcome) = watch::channel(None);
        let (commands, command_rx) = mpsc::channel(32);
        let events = EventSource::new();

        info!(
            "Starting {} {} call with {} on {}",
            intent.mode,
            if intent.is_initiator() { "outgoing" } else { "incoming" },
            intent.remote_id,
            intent.channel_key()
        );

        let actor = SessionActor {
            negotiator,
            media,
            clock: CallClock::new(),
            presentation: Presentation::default(),
            signals,
            peer_events,
            commands: command_rx,
            snapshot_tx,
            outcome_tx,
            events: events.clone(),
            last_phase: NegotiationPhase::AcquiringMedia,
            ring_timeout: deps.ring_timeout,
            device_lock: deps.device_lock.clone(),
            lease: None,
            pending_offer: offer,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            intent,
            commands,
            snapshot,
            outcome,
            events,
        })
    }

    pub fn intent(&self) -> &CallIntent {
        &self.intent
    }

    pub fn channel_key(&self) -> ChannelKey {
        self.intent.channel_key()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.snapshot.borrow().phase
    }

    /// Receiver that is notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> &EventSource<CallEvent> {
        &self.events
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Hang up: notify the peer (best effort) and tear down locally.
    pub async fn end(&self) -> CallOutcome {
        if self.commands.send(SessionCommand::End).await.is_err() {
            debug!("End requested for finished session");
        }
        self.wait_ended().await
    }

    pub async fn wait_ended(&self) -> CallOutcome {
        let mut rx = self.outcome.clone();
        if let Ok(outcome) = rx.wait_for(Option::is_some).await
            && let Some(outcome) = outcome.clone()
        {
            return outcome;
        }
        let last = rx.borrow().clone();
        last.unwrap_or_else(aborted)
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleAudio).await
    }

    /// Returns whether the camera is now enabled; `None` on audio calls.
    pub async fn toggle_video(&self) -> Result<Option<bool>, CallError> {
        self.request(SessionCommand::ToggleVideo).await
    }

    /// Returns whether remote audio is now audible.
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleSpeaker).await
    }

    pub async fn minimize(&self) -> Result<(), CallError> {
        self.send(SessionCommand::SetPresentation(Presentation::Minimized))
            .await
    }

    pub async fn expand(&self) -> Result<(), CallError> {
        self.send(SessionCommand::SetPresentation(Presentation::Expanded))
            .await
    }

    pub async fn toggle_presentation(&self) -> Result<(), CallError> {
        self.send(SessionCommand::TogglePresentation).await
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), CallError> {
        self.commands.send(cmd).await.map_err(|_| CallError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| CallError::Closed)
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("intent", &self.intent)
            .field("phase", &self.phase())
            .field("ended", &self.is_ended())
            .finish()
    }
}

fn aborted() -> CallOutcome {
    CallOutcome {
        reason: EndReason::TransportFailed("session task aborted".to_string()),
        duration: Duration::ZERO,
        was_connected: false,
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct SessionActor {
    negotiator: Negotiator,
    media: MediaController,
    clock: CallClock,
    presentation: Presentation,
    signals: SignalStream,
    peer_events: mpsc::Receiver<PeerEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    outcome_tx: watch::Sender<Option<CallOutcome>>,
    events: EventSource<CallEvent>,
    last_phase: NegotiationPhase,
    ring_timeout: Option<Duration>,
    device_lock: DeviceLock,
    lease: Option<DeviceLease>,
    pending_offer: Option<SessionDescription>,
}

type PendingMedia =
    Pin<Box<dyn Future<Output = (DeviceLease, Result<LocalStream, MediaError>)> + Send>>;

/// How the acquisition stage ended.
enum Acquired {
    /// Media is ready; messages received meanwhile, in arrival order.
    Ready(LocalStream, Vec<SignalingMessage>),
    Ended(EndReason),
}

impl SessionActor {
    async fn run(mut self) {
        self.publish_snapshot();
        let reason = match self.acquire().await {
            Acquired::Ready(stream, backlog) => match self.begin(stream).await {
                Ok(()) => self.drive(backlog).await,
                Err(e) => self.failure(e),
            },
            Acquired::Ended(reason) => reason,
        };
        self.teardown(reason).await;
    }

    /// Wait for the device lease, then for the local stream. A hangup while
    /// the lease is still queued ends the attempt without touching the
    /// devices; a hangup during capture hands the capture to [`reap`].
    async fn acquire(&mut self) -> Acquired {
        let lock = self.device_lock.clone();
        let mut backlog = Vec::new();

        let waiting = lock.lease();
        tokio::pin!(waiting);
        let lease = match self.until_ready(waiting.as_mut(), &mut backlog).await {
            Ok(lease) => lease,
            Err(reason) => {
                debug!("Call ended while waiting for capture devices");
                return Acquired::Ended(reason);
            }
        };

        let acquisition: Acquisition = self.media.acquisition();
        let mut pending: PendingMedia = Box::pin(async move { (lease, acquisition.await) });
        match self.until_ready(pending.as_mut(), &mut backlog).await {
            Ok((lease, Ok(stream))) => {
                self.lease = Some(lease);
                Acquired::Ready(stream, backlog)
            }
            Ok((_, Err(e))) => {
                warn!("Media acquisition failed: {}", e);
                Acquired::Ended(EndReason::CannotStart(e))
            }
            Err(reason) => {
                reap(pending);
                Acquired::Ended(reason)
            }
        }
    }

    /// Drive `fut` while still honouring hangups. Signaling other than `End`
    /// is kept in `backlog` for later.
    async fn until_ready<F>(
        &mut self,
        mut fut: Pin<&mut F>,
        backlog: &mut Vec<SignalingMessage>,
    ) -> Result<F::Output, EndReason>
    where
        F: Future + ?Sized,
    {
        loop {
            tokio::select! {
                out = fut.as_mut() => return Ok(out),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.on_command(cmd) {
                            return Err(EndReason::LocalHangup);
                        }
                    }
                    None => return Err(EndReason::LocalHangup),
                },
                msg = self.signals.next() => match msg {
                    Some(msg) if msg.kind == SignalKind::End => {
                        info!("{} ended the call before media was ready", msg.from_id);
                        return Err(EndReason::RemoteHangup);
                    }
                    Some(msg) => backlog.push(msg),
                    None => return Err(self.signaling_lost()),
                },
            }
        }
    }

    /// Hand local media to the transport and make the first move.
    async fn begin(&mut self, stream: LocalStream) -> Result<(), CallError> {
        let Some(stream) = self.media.install(stream) else {
            return Err(CallError::Closed);
        };
        self.negotiator.media_ready(stream).await?;
        self.publish_media();
        self.sync_phase();

        if self.negotiator.intent().is_initiator() {
            self.negotiator.start_offer().await?;
        } else if let Some(offer) = self.pending_offer.take() {
            self.negotiator.accept_offer(&offer).await?;
        }
        self.sync_phase();
        Ok(())
    }

    async fn drive(&mut self, backlog: Vec<SignalingMessage>) -> EndReason {
        for msg in backlog {
            if let Some(reason) = self.on_signal(msg).await {
                return reason;
            }
        }

        let ring_armed = self.ring_timeout.is_some() && self.negotiator.intent().is_initiator();
        let ring = tokio::time::sleep(self.ring_timeout.unwrap_or_default());
        tokio::pin!(ring);

        loop {
            let ringing = ring_armed && self.negotiator.phase() == NegotiationPhase::AwaitingAnswer;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.on_command(cmd) {
                            return EndReason::LocalHangup;
                        }
                    }
                    None => return EndReason::LocalHangup,
                },
                msg = self.signals.next() => match msg {
                    Some(msg) => {
                        if let Some(reason) = self.on_signal(msg).await {
                            return reason;
                        }
                    }
                    None => return self.signaling_lost(),
                },
                Some(event) = self.peer_events.recv() => {
                    if let Some(reason) = self.on_peer_event(event).await {
                        return reason;
                    }
                }
                _ = &mut ring, if ringing => {
                    info!("No answer from {}", self.negotiator.intent().remote_id);
                    self.negotiator.fail(PhaseTransition::AnswerTimedOut);
                    return EndReason::NoAnswer;
                }
            }
        }
    }

    async fn on_signal(&mut self, msg: SignalingMessage) -> Option<EndReason> {
        match self.negotiator.handle_signal(msg).await {
            Ok(SignalOutcome::Continue) => {
                self.sync_phase();
                None
            }
            Ok(SignalOutcome::RemoteEnded) => Some(EndReason::RemoteHangup),
            Err(e) => Some(self.failure(e)),
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Option<EndReason> {
        match event {
            PeerEvent::CandidateDiscovered(c) => {
                self.negotiator.on_local_candidate(c).await;
                None
            }
            PeerEvent::StateChanged(state) => match self.negotiator.on_transport_state(state) {
                Ok(Some(NegotiationPhase::Connected)) => {
                    self.clock.mark_connected(now());
                    info!("Connected to {}", self.negotiator.intent().remote_id);
                    self.sync_phase();
                    None
                }
                Ok(Some(NegotiationPhase::Disconnected)) => {
                    warn!("Connection to {} lost, reconnecting", self.negotiator.intent().remote_id);
                    self.sync_phase();
                    None
                }
                Ok(Some(NegotiationPhase::Failed)) => {
                    self.sync_phase();
                    Some(EndReason::TransportFailed(format!(
                        "transport reported {:?}",
                        TransportState::Failed
                    )))
                }
                Ok(_) => {
                    self.sync_phase();
                    None
                }
                Err(e) => Some(self.failure(e)),
            },
            PeerEvent::TrackReceived(remote) => {
                let id = remote.id.clone();
                if self.media.bind_remote(remote) {
                    debug!("Remote stream {} bound", id);
                    self.events.emit(CallEvent::RemoteStreamBound(id));
                    self.publish_media();
                }
                None
            }
        }
    }

    /// Apply a UI command. Returns `true` for a hangup.
    fn on_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::End => return true,
            SessionCommand::ToggleAudio(reply) => {
                let on = self.media.toggle_audio();
                info!("{}", if on { "Unmuted" } else { "Muted" });
                let _ = reply.send(on);
                self.publish_media();
            }
            SessionCommand::ToggleVideo(reply) => {
                let on = self.media.toggle_video();
                if let Some(on) = on {
                    info!("{}", if on { "Camera on" } else { "Camera off" });
                }
                let _ = reply.send(on);
                self.publish_media();
            }
            SessionCommand::ToggleSpeaker(reply) => {
                let on = self.media.toggle_speaker();
                info!("{}", if on { "Speaker on" } else { "Speaker off" });
                let _ = reply.send(on);
                self.publish_media();
            }
            SessionCommand::SetPresentation(p) => self.set_presentation(p),
            SessionCommand::TogglePresentation => self.set_presentation(self.presentation.toggled()),
        }
        false
    }

    fn set_presentation(&mut self, presentation: Presentation) {
        if presentation != self.presentation {
            self.presentation = presentation;
            self.events.emit(CallEvent::PresentationChanged(presentation));
            self.publish_snapshot();
        }
    }

    fn failure(&mut self, e: CallError) -> EndReason {
        warn!(
            "Call with {} failed: {}",
            self.negotiator.intent().remote_id,
            e
        );
        self.negotiator.fail(PhaseTransition::TransportFailed);
        self.sync_phase();
        EndReason::TransportFailed(e.to_string())
    }

    fn signaling_lost(&self) -> EndReason {
        warn!(
            "Signaling with {} closed, ending the call",
            self.negotiator.intent().remote_id
        );
        EndReason::SignalingLost
    }

    /// Whether the peer has heard about this call and should get an `End`.
    fn peer_notified(&self) -> bool {
        !self.negotiator.intent().is_initiator()
            || self.negotiator.phase().rank() >= NegotiationPhase::AwaitingAnswer.rank()
    }

    async fn teardown(&mut self, reason: EndReason) {
        let announce = matches!(
            reason,
            EndReason::LocalHangup | EndReason::NoAnswer | EndReason::SignalingLost
        );
        if announce && self.peer_notified() {
            self.negotiator.publish_end().await;
        }

        self.signals.cancel();
        self.negotiator.close().await;
        self.clock.stop(now());
        self.media.release();
        self.lease = None;
        self.sync_phase();

        let outcome = CallOutcome {
            duration: self.clock.elapsed(now()),
            was_connected: self.negotiator.reached_connected(),
            reason,
        };
        info!(
            "Call with {} ended ({}) after {}",
            self.negotiator.intent().remote_id,
            outcome.reason.notice(),
            format_duration(outcome.duration)
        );
        self.events.emit(CallEvent::Ended(outcome.clone()));
        self.outcome_tx.send_replace(Some(outcome));
    }

    fn sync_phase(&mut self) {
        let phase = self.negotiator.phase();
        if phase != self.last_phase {
            self.last_phase = phase;
            self.events.emit(CallEvent::PhaseChanged(phase));
        }
        self.publish_snapshot();
    }

    fn publish_media(&mut self) {
        self.events.emit(CallEvent::MediaChanged(self.media.state()));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(CallSnapshot {
            phase: self.negotiator.phase(),
            presentation: self.presentation,
            media: self.media.state(),
            clock: self.clock,
        });
    }
}

/// Let an abandoned acquisition finish in the background and stop whatever
/// it produced.
fn reap(pending: PendingMedia) {
    tokio::spawn(async move {
        let (lease, result) = pending.await;
        let lease = scopeguard::guard(lease, |_| debug!("Device lease returned after hangup"));
        if let Ok(stream) = result {
            debug!("Stopping stream {} acquired after hangup", stream.id());
            stream.stop_all();
        }
        drop(lease);
    });
}
