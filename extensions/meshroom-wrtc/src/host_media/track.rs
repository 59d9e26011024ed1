use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use meshroom::media::{MediaKind, TrackReadyState};
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

/// An outgoing capture track.
///
/// Muting and turning the camera off only flip `enabled`: the track stays attached to
/// every peer connection and [`LocalTrack::write_sample`] drops samples while disabled.
/// A stopped track is `Ended` for good.
pub struct LocalTrack {
    kind: MediaKind,
    label: String,
    rtc_track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ready_state: watch::Sender<TrackReadyState>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>, codec: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            Uuid::new_v4().to_string(),
            stream_id.to_string(),
        ));
        let (ready_state, _rx) = watch::channel(TrackReadyState::Live);
        Self {
            kind,
            label: label.into(),
            rtc_track,
            enabled: AtomicBool::new(true),
            ready_state,
        }
    }

    pub fn microphone(stream_id: &str) -> Self {
        Self::new(MediaKind::Audio, "microphone", opus_codec(), stream_id)
    }

    pub fn camera(stream_id: &str) -> Self {
        Self::new(MediaKind::Video, "camera", vp8_codec(), stream_id)
    }

    pub fn screen(stream_id: &str) -> Self {
        Self::new(MediaKind::Video, "screen", vp8_codec(), stream_id)
    }

    pub fn id(&self) -> &str {
        self.rtc_track.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns the effective state. An ended track stays disabled.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let effective = enabled && self.is_live();
        self.enabled.store(effective, Ordering::Release);
        effective
    }

    pub fn ready_state(&self) -> TrackReadyState {
        *self.ready_state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.ready_state() == TrackReadyState::Live
    }

    /// Ends and disables the track. Returns true only for the call that ended it.
    pub fn stop(&self) -> bool {
        self.enabled.store(false, Ordering::Release);
        self.ready_state.send_if_modified(|state| {
            if *state == TrackReadyState::Live {
                *state = TrackReadyState::Ended;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the track has ended, whoever ended it
    pub async fn ended(&self) {
        let mut rx = self.ready_state.subscribe();
        loop {
            if *rx.borrow_and_update() == TrackReadyState::Ended {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc_track.clone()
    }

    /// Forwards a captured sample to every connection carrying this track. Returns
    /// false when the sample was dropped because the track is disabled or ended.
    pub async fn write_sample(&self, sample: &Sample) -> anyhow::Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtc_track.write_sample(sample).await?;
        Ok(true)
    }
}

pub fn opus_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

pub fn vp8_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_owned(),
        rtcp_feedback: vec![],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_is_terminal_and_reported_once() {
        let track = LocalTrack::microphone("stream");
        assert!(track.is_live());
        assert!(track.is_enabled());

        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
        assert!(!track.set_enabled(true));
        assert!(!track.is_enabled());
    }

    #[test]
    fn toggling_keeps_the_track_live() {
        let track = LocalTrack::camera("stream");
        assert!(!track.set_enabled(false));
        assert!(track.is_live());
        assert!(track.set_enabled(true));
    }

    #[tokio::test]
    async fn ended_wakes_waiters() {
        let track = Arc::new(LocalTrack::screen("stream"));
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        tokio::task::yield_now().await;
        track.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("waiter did not panic");
    }
}
