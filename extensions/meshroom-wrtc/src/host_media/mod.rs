//! Local capture.
//!
//! [`LocalMediaManager`] is the only writer of [`LocalMediaState`]. Everyone else reads
//! snapshots, flips `enabled` through the manager, or waits for readiness. Peer
//! connections are never touched from here; swapping the outgoing video on existing
//! connections is the registry's job.

use std::sync::Arc;

use meshroom::{
    config::RetryPolicy,
    error::Error,
    media::{MediaKind, VideoSource},
    sync::{Mutex, RwLock},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

mod devices;
mod track;

pub use devices::{CaptureStream, MediaDevices, StaticMediaDevices};
pub use track::{opus_codec, vp8_codec, LocalTrack};

#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub stream_id: Option<String>,
    pub is_ready: bool,
    pub audio_track: Option<Arc<LocalTrack>>,
    pub video_track: Option<Arc<LocalTrack>>,
    pub screen_track: Option<Arc<LocalTrack>>,
    pub outgoing_video_source: VideoSource,
}

impl LocalMediaState {
    /// the track peers should currently receive as video
    pub fn outgoing_video(&self) -> Option<&Arc<LocalTrack>> {
        match self.outgoing_video_source {
            VideoSource::Screen => self.screen_track.as_ref().or(self.video_track.as_ref()),
            VideoSource::Camera => self.video_track.as_ref(),
        }
    }

    fn has_live_stream(&self) -> bool {
        self.stream_id.is_some()
            && [&self.audio_track, &self.video_track]
                .into_iter()
                .flatten()
                .any(|t| t.is_live())
    }
}

#[derive(Debug, Clone, derive_more::Display)]
pub enum MediaEvent {
    /// the display capture was stopped from outside the application
    #[display(fmt = "ScreenShareEnded")]
    ScreenShareEnded { track_id: String },
}

pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    state: RwLock<LocalMediaState>,
    // serializes acquire() so concurrent callers share one capture
    acquire_lock: tokio::sync::Mutex<()>,
    ready_tx: watch::Sender<bool>,
    event_ch: broadcast::Sender<MediaEvent>,
    screen_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for LocalMediaManager {
    fn drop(&mut self) {
        if let Some(handle) = self.screen_watcher.lock().take() {
            handle.abort();
        }
    }
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (ready_tx, _rx) = watch::channel(false);
        let (event_ch, _rx) = broadcast::channel(64);
        Self {
            devices,
            state: RwLock::new(LocalMediaState::default()),
            acquire_lock: tokio::sync::Mutex::new(()),
            ready_tx,
            event_ch,
            screen_watcher: Mutex::new(None),
        }
    }

    /// Requests camera and microphone. While a live stream is held the existing one is
    /// returned without prompting again.
    pub async fn acquire(&self) -> Result<LocalMediaState, Error> {
        let _lock = self.acquire_lock.lock().await;
        {
            let state = self.state.read();
            if state.has_live_stream() {
                log::debug!("local media already acquired");
                return Ok(state.clone());
            }
        }

        let stream = self.devices.get_user_media().await?;
        if stream.audio.is_none() && stream.video.is_none() {
            return Err(Error::MediaAcquisition("no capture device available".into()));
        }
        log::info!(
            "acquired local media {} (audio: {}, video: {})",
            stream.id,
            stream.audio.is_some(),
            stream.video.is_some()
        );

        let snapshot = {
            let mut state = self.state.write();
            *state = LocalMediaState {
                stream_id: Some(stream.id),
                is_ready: true,
                audio_track: stream.audio,
                video_track: stream.video,
                screen_track: None,
                outgoing_video_source: VideoSource::Camera,
            };
            state.clone()
        };
        self.ready_tx.send_replace(true);
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> LocalMediaState {
        self.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().is_ready
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_ch.subscribe()
    }

    /// Polls readiness with the given policy
    pub async fn wait_until_ready(&self, policy: RetryPolicy) -> Result<LocalMediaState, Error> {
        policy
            .poll(|| {
                let state = self.state.read();
                state.is_ready.then(|| state.clone())
            })
            .await
            .map_err(|attempts| Error::MediaNotReady { attempts })
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<bool, Error> {
        let state = self.state.read();
        let track = state
            .audio_track
            .as_ref()
            .ok_or(Error::NoLocalTrack(MediaKind::Audio))?;
        Ok(track.set_enabled(enabled))
    }

    /// Toggles the camera. Has no effect on an active screen capture.
    pub fn set_video_enabled(&self, enabled: bool) -> Result<bool, Error> {
        let state = self.state.read();
        let track = state
            .video_track
            .as_ref()
            .ok_or(Error::NoLocalTrack(MediaKind::Video))?;
        Ok(track.set_enabled(enabled))
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.state.read().outgoing_video_source == VideoSource::Screen
    }

    /// Starts a display capture and marks it as the outgoing video source. Subscribers
    /// get [`MediaEvent::ScreenShareEnded`] if the capture is stopped externally.
    pub async fn start_screen_share(&self) -> Result<Arc<LocalTrack>, Error> {
        let current = self.state.read().screen_track.clone();
        if let Some(track) = current.filter(|t| t.is_live()) {
            return Ok(track);
        }

        let track = self.devices.get_display_media().await?;
        {
            let mut state = self.state.write();
            if let Some(previous) = state.screen_track.replace(track.clone()) {
                previous.stop();
            }
            state.outgoing_video_source = VideoSource::Screen;
        }

        let watched = track.clone();
        let event_ch = self.event_ch.clone();
        let handle = tokio::spawn(async move {
            watched.ended().await;
            log::info!("screen capture {} ended externally", watched.id());
            let _ = event_ch.send(MediaEvent::ScreenShareEnded {
                track_id: watched.id().to_string(),
            });
        });
        if let Some(previous) = self.screen_watcher.lock().replace(handle) {
            previous.abort();
        }

        log::info!("screen share started: {}", track.id());
        Ok(track)
    }

    /// Stops the display capture and goes back to the camera. Returns false when no
    /// screen was being shared.
    pub fn stop_screen_share(&self) -> bool {
        if let Some(handle) = self.screen_watcher.lock().take() {
            handle.abort();
        }
        let mut state = self.state.write();
        let was_sharing = state.outgoing_video_source == VideoSource::Screen;
        if let Some(track) = state.screen_track.take() {
            track.stop();
        }
        state.outgoing_video_source = VideoSource::Camera;
        if was_sharing {
            log::info!("screen share stopped");
        }
        was_sharing
    }

    /// Stops every track and forgets the stream. Returns how many tracks this call
    /// ended; calling it again is harmless.
    pub fn release(&self) -> usize {
        if let Some(handle) = self.screen_watcher.lock().take() {
            handle.abort();
        }
        let previous = std::mem::take(&mut *self.state.write());
        self.ready_tx.send_replace(false);

        let stopped = [previous.audio_track, previous.video_track, previous.screen_track]
            .into_iter()
            .flatten()
            .filter(|track| track.stop())
            .count();
        if stopped > 0 {
            log::info!("released local media: {stopped} tracks stopped");
        }
        stopped
    }
}
