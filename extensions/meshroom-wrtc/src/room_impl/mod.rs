mod event_handler;
mod registry;
mod router;
mod signal_sender;
mod teardown;

use std::sync::Arc;

use derive_more::Display;
use meshroom::{
    config::MeshConfig,
    directory::RoomDirectory,
    error::Error,
    room::{
        validate_display_name, ConnectionId, Participant, RoomEvent, RoomEventStream, RoomSessionState,
        SessionInfo, SessionPhase,
    },
    signaling::{SignalCommand, SignalingChannel},
    sync::RwLock,
};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    host_media::{LocalMediaManager, MediaDevices},
    simple_webrtc::{events::RemoteTrack, PeerFactory, WrtcPeerFactory},
};

use self::{event_handler::EventHandler, teardown::TeardownGuard};

/// What caused a room session to end
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum LeaveTrigger {
    #[display(fmt = "user")]
    User,
    #[display(fmt = "navigated away")]
    NavigatedAway,
    #[display(fmt = "dropped")]
    Dropped,
    #[display(fmt = "start failed")]
    StartFailed,
}

/// One client's membership in a room: local capture, the signaling channel and a
/// negotiation session per remote participant.
///
/// Cloning is cheap and every clone controls the same session. When the last clone is
/// dropped the session is torn down.
#[derive(Clone)]
pub struct RoomSession {
    config: Arc<MeshConfig>,
    media: Arc<LocalMediaManager>,
    channel: Arc<dyn SignalingChannel>,
    directory: Option<Arc<dyn RoomDirectory>>,
    phase: Arc<RwLock<SessionPhase>>,
    teardown: Arc<TeardownGuard>,
    ui_event_ch: broadcast::Sender<RoomEvent>,
    event_handler: EventHandler,

    drop_handler: Arc<DropHandler>,
}

struct DropHandler {
    event_handler: EventHandler,
    teardown: Arc<TeardownGuard>,
}

impl Drop for DropHandler {
    fn drop(&mut self) {
        if !self.teardown.begin() {
            return;
        }
        log::info!("leaving room ({})", LeaveTrigger::Dropped);
        if !self.event_handler.teardown_detached() {
            log::debug!("room event handler already stopped");
        }
    }
}

impl RoomSession {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: MeshConfig,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let media = Arc::new(LocalMediaManager::new(devices));
        let (ui_event_ch, _rx) = broadcast::channel(1024);
        let teardown = Arc::new(TeardownGuard::default());
        let event_handler = EventHandler::new(
            config.clone(),
            media.clone(),
            channel.clone(),
            factory,
            ui_event_ch.clone(),
        );
        Self {
            config,
            media,
            channel,
            directory: None,
            phase: Arc::new(RwLock::new(SessionPhase::Idle)),
            teardown: teardown.clone(),
            ui_event_ch,
            event_handler: event_handler.clone(),
            drop_handler: Arc::new(DropHandler {
                event_handler,
                teardown,
            }),
        }
    }

    /// A session whose peer connections are real webrtc-rs connections
    pub fn with_webrtc(
        config: MeshConfig,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, Error> {
        let factory = WrtcPeerFactory::new(&config).map_err(|e| Error::WebRtc(e.to_string()))?;
        Ok(Self::new(config, channel, devices, Arc::new(factory)))
    }

    /// Checks the room with `directory` before joining
    pub fn with_directory(mut self, directory: Arc<dyn RoomDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn media(&self) -> &Arc<LocalMediaManager> {
        &self.media
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn get_event_stream(&self) -> RoomEventStream {
        let mut rx = self.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => log::warn!("room event stream lagged by {n} events"),
                };
            }
        };
        RoomEventStream(Box::pin(stream))
    }

    /// Acquires media, connects the channel and joins `room_id`. Any failure ends the
    /// session; there is no retry.
    pub async fn join(&self, room_id: &str, display_name: &str) -> Result<(), Error> {
        let display_name = validate_display_name(display_name)?;
        if self.phase() != SessionPhase::Idle {
            return Err(Error::InvalidState(format!("cannot join while {}", self.phase())));
        }

        if let Some(directory) = &self.directory {
            let check = directory.join_room(room_id, &display_name).await?;
            if let Some(room) = check.into_result(room_id)? {
                log::info!("joining room {} ({})", room.name, room.id);
            }
        }

        self.advance(SessionPhase::Idle, SessionPhase::AcquiringMedia)?;
        match self.start(room_id, &display_name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_start(&e).await;
                Err(e)
            }
        }
    }

    async fn start(&self, room_id: &str, display_name: &str) -> Result<(), Error> {
        self.media.acquire().await?;

        self.advance(SessionPhase::AcquiringMedia, SessionPhase::ConnectingChannel)?;
        self.channel.connect().await.map_err(|e| match e {
            Error::ChannelConnect(_) => e,
            other => Error::ChannelConnect(other.to_string()),
        })?;
        let self_id = self
            .channel
            .connection_id()
            .ok_or_else(|| Error::ChannelConnect("no connection id was assigned".into()))?;
        let signals = self.channel.subscribe()?;

        self.advance(SessionPhase::ConnectingChannel, SessionPhase::JoiningRoom)?;
        let state = RoomSessionState::new(room_id, display_name, self_id);
        self.event_handler.enter_room(signals, state).await?;
        self.channel
            .invoke(SignalCommand::JoinRoom {
                room_id: room_id.to_string(),
                user_name: display_name.to_string(),
            })
            .await
            .map_err(|e| Error::JoinRejected(e.to_string()))?;

        self.advance(SessionPhase::JoiningRoom, SessionPhase::Active)?;
        Ok(())
    }

    async fn fail_start(&self, error: &Error) {
        log::error!("failed to join room: {error}");
        let _ = self.ui_event_ch.send(RoomEvent::Error {
            message: error.to_string(),
        });
        if self.teardown.is_started() {
            // a concurrent leave already ran; release what was acquired after it
            self.media.release();
            teardown::leave_channel(self.channel.as_ref()).await;
            return;
        }
        self.leave_with(LeaveTrigger::StartFailed).await;
    }

    fn advance(&self, from: SessionPhase, to: SessionPhase) -> Result<(), Error> {
        {
            let mut phase = self.phase.write();
            if *phase != from {
                if phase.is_finished() {
                    return Err(Error::SessionClosed);
                }
                return Err(Error::InvalidState(format!("expected {from}, found {}", *phase)));
            }
            *phase = to;
        }
        self.publish_phase(to);
        Ok(())
    }

    fn set_phase(&self, to: SessionPhase) {
        *self.phase.write() = to;
        self.publish_phase(to);
    }

    fn publish_phase(&self, phase: SessionPhase) {
        log::info!("room session is {phase}");
        self.event_handler.set_phase(phase);
        let _ = self.ui_event_ch.send(RoomEvent::PhaseChanged { phase });
    }

    /// Leaves the room at the user's request
    pub async fn leave(&self) {
        self.leave_with(LeaveTrigger::User).await
    }

    /// Tears the session down. Only the first call does anything; later and concurrent
    /// calls return immediately.
    pub async fn leave_with(&self, trigger: LeaveTrigger) {
        if !self.teardown.begin() {
            log::debug!("leave ({trigger}) ignored, teardown already started");
            return;
        }
        log::info!("leaving room ({trigger})");
        self.set_phase(SessionPhase::Leaving);
        match self.event_handler.teardown().await {
            Ok(report) => log::debug!("{report:?}"),
            Err(e) => {
                log::warn!("room event handler unavailable ({e}), releasing directly");
                teardown::run_detached(&self.media, self.channel.as_ref()).await;
            }
        }
        self.set_phase(SessionPhase::Closed);
        let _ = self.ui_event_ch.send(RoomEvent::Closed);
    }

    /// Flips the microphone. Returns whether the local participant is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, Error> {
        self.event_handler.toggle_mute().await
    }

    /// Returns the camera's effective state
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, Error> {
        self.event_handler.set_video_enabled(enabled).await
    }

    pub async fn toggle_video(&self) -> Result<bool, Error> {
        let enabled = self
            .media
            .snapshot()
            .video_track
            .map(|t| t.is_enabled())
            .ok_or(Error::NoLocalTrack(meshroom::media::MediaKind::Video))?;
        self.set_video_enabled(!enabled).await
    }

    /// Starts or stops sharing the screen. Returns whether the screen is now shared.
    pub async fn toggle_screen_share(&self) -> Result<bool, Error> {
        self.event_handler.toggle_screen_share().await
    }

    pub async fn participants(&self) -> Result<Vec<Participant>, Error> {
        self.event_handler.get_participants().await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, Error> {
        self.event_handler.get_sessions().await
    }

    /// Tracks received from `connection_id` so far
    pub async fn remote_media(&self, connection_id: &ConnectionId) -> Result<Vec<RemoteTrack>, Error> {
        self.event_handler
            .get_remote_tracks(connection_id.clone())
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        host_media::StaticMediaDevices,
        loopback::{LoopbackHub, LoopbackPeerFactory},
    };
    use async_trait::async_trait;
    use meshroom::directory::RoomCheck;

    struct ClosedRooms;

    #[async_trait]
    impl RoomDirectory for ClosedRooms {
        async fn join_room(&self, _room_id: &str, _display_name: &str) -> Result<RoomCheck, Error> {
            Ok(RoomCheck {
                success: false,
                room: None,
                error: Some("Room not found".into()),
            })
        }
    }

    fn session(hub: &LoopbackHub, devices: Arc<StaticMediaDevices>) -> RoomSession {
        RoomSession::new(
            MeshConfig::development(),
            Arc::new(hub.channel()),
            devices,
            Arc::new(LoopbackPeerFactory::new()),
        )
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_up_front() {
        let hub = LoopbackHub::new();
        let devices = Arc::new(StaticMediaDevices::new());
        let session = session(&hub, devices.clone());
        let err = session.join("R1", " a ").await.unwrap_err();
        assert!(matches!(err, Error::InvalidDisplayName(_)));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(devices.user_media_requests(), 0);
    }

    #[tokio::test]
    async fn unknown_room_halts_before_media() {
        let hub = LoopbackHub::new();
        let devices = Arc::new(StaticMediaDevices::new());
        let session = session(&hub, devices.clone()).with_directory(Arc::new(ClosedRooms));
        let err = session.join("R9", "ana").await.unwrap_err();
        assert!(matches!(err, Error::RoomNotFound(id) if id == "R9"));
        assert_eq!(devices.user_media_requests(), 0);
        assert!(hub.sent().is_empty());
    }

    #[tokio::test]
    async fn leave_before_join_is_harmless() {
        let hub = LoopbackHub::new();
        let session = session(&hub, Arc::new(StaticMediaDevices::new()));
        session.leave().await;
        session.leave().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(hub.sent().is_empty());
        assert!(matches!(
            session.join("R1", "ana").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn toggles_need_a_room() {
        let hub = LoopbackHub::new();
        let session = session(&hub, Arc::new(StaticMediaDevices::new()));
        assert!(matches!(session.toggle_mute().await, Err(Error::InvalidState(_))));
        assert!(session.participants().await.unwrap_or_default().is_empty());
    }
}
