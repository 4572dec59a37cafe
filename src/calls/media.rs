//! Local capture and remote playback for one call.
//!
//! Devices, tracks and the playback surface are external collaborators; the
//! [`MediaController`] owns what it acquired and guarantees it is released.

use async_trait::async_trait;
use chatify_core::types::CallMode;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single capture track (microphone or camera).
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn kind(&self) -> TrackKind;
    fn id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Release the underlying device. Irreversible.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// Tracks captured for one call. Stops every track when dropped.
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            if track.is_live() {
                track.stop();
            }
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Media received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub facing_mode: FacingMode,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            max_width: 1920,
            max_height: 1080,
            facing_mode: FacingMode::User,
            frame_rate: 30,
        }
    }
}

/// What to ask the capture devices for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    /// `None` for audio-only calls.
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_mode(mode: CallMode) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: mode.has_video().then(VideoConstraints::default),
        }
    }
}

/// Access to capture hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints)
    -> Result<LocalStream, MediaError>;
}

/// Where remote media is played.
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, stream: &RemoteStream);
    fn detach(&self);
    fn set_muted(&self, muted: bool);
}

/// Media flags exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaSessionState {
    pub local_stream_live: bool,
    pub remote_bound: bool,
    pub audio_enabled: bool,
    /// `None` on audio-only calls.
    pub video_enabled: Option<bool>,
    pub speaker_enabled: bool,
}

impl Default for MediaSessionState {
    fn default() -> Self {
        Self {
            local_stream_live: false,
            remote_bound: false,
            audio_enabled: true,
            video_enabled: None,
            speaker_enabled: true,
        }
    }
}

pub type Acquisition = Pin<Box<dyn Future<Output = Result<LocalStream, MediaError>> + Send>>;

/// Owns the local stream and the remote binding of one session.
pub struct MediaController {
    mode: CallMode,
    devices: Arc<dyn MediaDevices>,
    sink: Arc<dyn PlaybackSink>,
    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
    audio_enabled: bool,
    video_enabled: bool,
    speaker_enabled: bool,
    released: bool,
}

impl MediaController {
    pub fn new(mode: CallMode, devices: Arc<dyn MediaDevices>, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            mode,
            devices,
            sink,
            local: None,
            remote: None,
            audio_enabled: true,
            video_enabled: true,
            speaker_enabled: true,
            released: false,
        }
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// A detached device request. The caller can drop or hand it off without
    /// holding the controller.
    pub fn acquisition(&self) -> Acquisition {
        let devices = self.devices.clone();
        let constraints = MediaConstraints::for_mode(self.mode);
        Box::pin(async move { devices.get_user_media(&constraints).await })
    }

    /// Take ownership of a stream produced by [`Self::acquisition`].
    ///
    /// After [`Self::release`] the stream is stopped immediately instead.
    pub fn install(&mut self, stream: LocalStream) -> Option<&LocalStream> {
        if self.released {
            debug!("Stream {} arrived after release, stopping it", stream.id());
            return None;
        }
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(self.audio_enabled);
        }
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(self.video_enabled);
        }
        // A second install replaces (and stops) the first stream.
        self.local = Some(stream);
        self.local.as_ref()
    }

    /// Request devices and keep the resulting stream.
    pub async fn acquire(&mut self) -> Result<&LocalStream, MediaError> {
        if self.local.is_none() {
            let stream = self.acquisition().await?;
            if self.install(stream).is_none() {
                return Err(MediaError::DeviceUnavailable(
                    "media session already released".to_string(),
                ));
            }
        }
        self.local
            .as_ref()
            .ok_or_else(|| MediaError::DeviceUnavailable("no local stream".to_string()))
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote.as_ref()
    }

    /// Flip microphone enablement. Returns the new state.
    pub fn toggle_audio(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        if let Some(stream) = &self.local {
            for track in stream.tracks_of(TrackKind::Audio) {
                track.set_enabled(self.audio_enabled);
            }
        }
        self.audio_enabled
    }

    /// Flip camera enablement. `None` on audio-only calls.
    pub fn toggle_video(&mut self) -> Option<bool> {
        if !self.mode.has_video() {
            return None;
        }
        self.video_enabled = !self.video_enabled;
        if let Some(stream) = &self.local {
            for track in stream.tracks_of(TrackKind::Video) {
                track.set_enabled(self.video_enabled);
            }
        }
        Some(self.video_enabled)
    }

    /// Mute or unmute remote playback. Returns whether the speaker is on.
    pub fn toggle_speaker(&mut self) -> bool {
        self.speaker_enabled = !self.speaker_enabled;
        if self.remote.is_some() {
            self.sink.set_muted(!self.speaker_enabled);
        }
        self.speaker_enabled
    }

    /// Attach remote media to playback. Returns `false` when nothing changed.
    pub fn bind_remote(&mut self, stream: RemoteStream) -> bool {
        if self.released {
            return false;
        }
        if self.remote.as_ref() == Some(&stream) {
            return false;
        }
        if self.remote.is_some() {
            self.sink.detach();
        }
        self.sink.attach(&stream);
        self.sink.set_muted(!self.speaker_enabled);
        self.remote = Some(stream);
        true
    }

    /// Stop capture and detach playback. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(stream) = self.local.take() {
            debug!("Releasing local stream {}", stream.id());
            stream.stop_all();
        }
        if self.remote.take().is_some() {
            self.sink.detach();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn state(&self) -> MediaSessionState {
        MediaSessionState {
            local_stream_live: self
                .local
                .as_ref()
                .is_some_and(|s| s.live_track_count() > 0),
            remote_bound: self.remote.is_some(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.mode.has_video().then_some(self.video_enabled),
            speaker_enabled: self.speaker_enabled,
        }
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MediaController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaController")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::{LoopbackDevices, RecordingSink};

    fn controller(mode: CallMode) -> (MediaController, LoopbackDevices, Arc<RecordingSink>) {
        let devices = LoopbackDevices::new();
        let sink = Arc::new(RecordingSink::default());
        let ctl = MediaController::new(mode, Arc::new(devices.clone()), sink.clone());
        (ctl, devices, sink)
    }

    #[tokio::test]
    async fn toggles_flip_existing_tracks() {
        let (mut ctl, devices, _) = controller(CallMode::Video);
        ctl.acquire().await.unwrap();
        assert_eq!(devices.requests(), 1);

        assert!(!ctl.toggle_audio());
        assert_eq!(ctl.toggle_video(), Some(false));
        let stream = ctl.local_stream().unwrap();
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));

        assert!(ctl.toggle_audio());
        // Still the same acquisition.
        assert_eq!(devices.requests(), 1);
    }

    #[tokio::test]
    async fn audio_call_has_no_video_toggle() {
        let (mut ctl, _, _) = controller(CallMode::Audio);
        ctl.acquire().await.unwrap();
        assert_eq!(ctl.toggle_video(), None);
        assert_eq!(ctl.state().video_enabled, None);
        assert_eq!(ctl.local_stream().unwrap().tracks_of(TrackKind::Video).count(), 0);
    }

    #[tokio::test]
    async fn bind_remote_is_idempotent() {
        let (mut ctl, _, sink) = controller(CallMode::Audio);
        assert!(ctl.bind_remote(RemoteStream::new("r1")));
        assert!(!ctl.bind_remote(RemoteStream::new("r1")));
        assert_eq!(sink.attached(), vec!["r1".to_string()]);

        assert!(ctl.bind_remote(RemoteStream::new("r2")));
        assert_eq!(sink.detach_count(), 1);
        assert_eq!(sink.current().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn speaker_toggle_mutes_playback() {
        let (mut ctl, _, sink) = controller(CallMode::Audio);
        ctl.bind_remote(RemoteStream::new("r1"));
        assert!(!ctl.toggle_speaker());
        assert!(sink.is_muted());
        assert!(ctl.toggle_speaker());
        assert!(!sink.is_muted());
    }

    #[tokio::test]
    async fn release_stops_everything_once() {
        let (mut ctl, devices, sink) = controller(CallMode::Video);
        ctl.acquire().await.unwrap();
        ctl.bind_remote(RemoteStream::new("r1"));
        assert_eq!(devices.live_tracks(), 2);

        ctl.release();
        ctl.release();
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(sink.detach_count(), 1);
        assert!(!ctl.state().local_stream_live);
        assert!(!ctl.bind_remote(RemoteStream::new("r2")));
    }

    #[tokio::test]
    async fn drop_releases_tracks() {
        let (mut ctl, devices, _) = controller(CallMode::Video);
        ctl.acquire().await.unwrap();
        drop(ctl);
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn late_stream_is_stopped() {
        let (mut ctl, devices, _) = controller(CallMode::Audio);
        let pending = ctl.acquisition();
        ctl.release();
        let stream = pending.await.unwrap();
        assert!(ctl.install(stream).is_none());
        assert_eq!(devices.live_tracks(), 0);
    }

    #[test]
    fn constraints_follow_mode() {
        let audio = MediaConstraints::for_mode(CallMode::Audio);
        assert!(audio.video.is_none());
        assert!(audio.audio.echo_cancellation);

        let video = MediaConstraints::for_mode(CallMode::Video).video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
        assert_eq!(video.frame_rate, 30);
        assert_eq!(video.facing_mode, FacingMode::User);
    }
}
