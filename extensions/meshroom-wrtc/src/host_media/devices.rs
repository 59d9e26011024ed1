use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use meshroom::{error::Error, sync::Mutex};
use uuid::Uuid;

use super::LocalTrack;

/// A camera+microphone capture
#[derive(Debug, Clone)]
pub struct CaptureStream {
    pub id: String,
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

/// Access to capture hardware. Both calls may prompt the user and may be refused.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self) -> Result<CaptureStream, Error>;

    /// The returned track ends on its own when the capture is stopped from outside the
    /// application.
    async fn get_display_media(&self) -> Result<Arc<LocalTrack>, Error>;
}

/// Devices that hand out synthetic tracks. Used headless and in tests; whoever owns
/// the tracks feeds samples into them.
#[derive(Default)]
pub struct StaticMediaDevices {
    no_camera: bool,
    acquire_delay: Option<Duration>,
    deny: AtomicBool,
    user_media_requests: AtomicUsize,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
    display: Mutex<Option<Arc<LocalTrack>>>,
}

impl StaticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// microphone only
    pub fn audio_only() -> Self {
        Self {
            no_camera: true,
            ..Default::default()
        }
    }

    /// simulate a slow permission prompt
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn deny_access(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    /// every track handed out so far, screen captures included
    pub fn issued_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().clone()
    }

    /// Ends the current display capture as if the user pressed the system's
    /// "stop sharing" control. Returns false when nothing was being captured.
    pub fn end_display_capture(&self) -> bool {
        match self.display.lock().take() {
            Some(track) => track.stop(),
            None => false,
        }
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn get_user_media(&self) -> Result<CaptureStream, Error> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("permission denied".into()));
        }

        let id = Uuid::new_v4().to_string();
        let audio = Arc::new(LocalTrack::microphone(&id));
        let video = (!self.no_camera).then(|| Arc::new(LocalTrack::camera(&id)));

        let mut issued = self.issued.lock();
        issued.push(audio.clone());
        issued.extend(video.clone());

        Ok(CaptureStream {
            id,
            audio: Some(audio),
            video,
        })
    }

    async fn get_display_media(&self) -> Result<Arc<LocalTrack>, Error> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("screen capture denied".into()));
        }
        let track = Arc::new(LocalTrack::screen(&Uuid::new_v4().to_string()));
        self.issued.lock().push(track.clone());
        self.display.lock().replace(track.clone());
        Ok(track)
    }
}
