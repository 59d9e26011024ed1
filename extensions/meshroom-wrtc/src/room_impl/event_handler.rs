use futures::channel::oneshot;
use futures::StreamExt;

use std::sync::Arc;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use meshroom::{
    config::MeshConfig,
    error::Error,
    media::MediaKind,
    room::{ConnectionId, IceState, Participant, RoomEvent, RoomSessionState, SessionInfo, SessionPhase},
    signaling::{SignalCommand, SignalEvent, SignalEventStream, SignalingChannel},
};

use crate::{
    host_media::{LocalMediaManager, MediaEvent},
    simple_webrtc::{
        events::{PeerEvent, RemoteTrack},
        PeerFactory,
    },
};

use super::{
    registry::PeerRegistry,
    router::{report, Deferred, RoomContext, SignalRouter},
    signal_sender::{self, SignalSender},
    teardown::{self, TeardownReport},
};

enum EventHandlerCmd {
    EnterRoom {
        signals: SignalEventStream,
        room: RoomSessionState,
        rsp: oneshot::Sender<()>,
    },
    SetPhase {
        phase: SessionPhase,
    },
    ToggleMute {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    SetVideoEnabled {
        enabled: bool,
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    ToggleScreenShare {
        rsp: oneshot::Sender<Result<bool, Error>>,
    },
    GetParticipants {
        rsp: oneshot::Sender<Vec<Participant>>,
    },
    GetSessions {
        rsp: oneshot::Sender<Vec<SessionInfo>>,
    },
    GetRemoteTracks {
        connection_id: ConnectionId,
        rsp: oneshot::Sender<Vec<RemoteTrack>>,
    },
    Teardown {
        rsp: Option<oneshot::Sender<TeardownReport>>,
    },
}

/// Handle to the task that owns the registry, the router and the room state
#[derive(Clone)]
pub struct EventHandler {
    ch: UnboundedSender<EventHandlerCmd>,
}

impl EventHandler {
    pub fn new(
        config: Arc<MeshConfig>,
        media: Arc<LocalMediaManager>,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
        ui_event_ch: broadcast::Sender<RoomEvent>,
    ) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            run(config, media, channel, factory, cmd_rx, ui_event_ch).await;
        });
        Self { ch: tx }
    }

    pub async fn enter_room(&self, signals: SignalEventStream, room: RoomSessionState) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::EnterRoom {
                signals,
                room,
                rsp: tx,
            })
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        let _ = self.ch.send(EventHandlerCmd::SetPhase { phase });
    }

    pub async fn toggle_mute(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::ToggleMute { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::SetVideoEnabled { enabled, rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::ToggleScreenShare { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn get_participants(&self) -> Result<Vec<Participant>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetParticipants { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|x| Error::OtherWithContext(x.to_string()))
    }

    pub async fn get_sessions(&self) -> Result<Vec<SessionInfo>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetSessions { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|x| Error::OtherWithContext(x.to_string()))
    }

    pub async fn get_remote_tracks(&self, connection_id: ConnectionId) -> Result<Vec<RemoteTrack>, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::GetRemoteTracks { connection_id, rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|x| Error::OtherWithContext(x.to_string()))
    }

    /// Runs the teardown on the event loop and stops it
    pub async fn teardown(&self) -> Result<TeardownReport, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(EventHandlerCmd::Teardown { rsp: Some(tx) })
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Fire-and-forget variant of [`EventHandler::teardown`], usable from `Drop`
    pub fn teardown_detached(&self) -> bool {
        self.ch.send(EventHandlerCmd::Teardown { rsp: None }).is_ok()
    }
}

async fn next_signal(signals: &mut Option<SignalEventStream>) -> Option<SignalEvent> {
    match signals {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

async fn run(
    config: Arc<MeshConfig>,
    media: Arc<LocalMediaManager>,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    mut cmd_rx: UnboundedReceiver<EventHandlerCmd>,
    ui_event_ch: broadcast::Sender<RoomEvent>,
) {
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel();
    let sender = signal_sender::init(channel.clone());
    let mut registry = PeerRegistry::new(factory, peer_tx, ui_event_ch.clone());
    let mut router = SignalRouter::new(deferred_tx);
    let mut room: Option<RoomSessionState> = None;
    let mut signals: Option<SignalEventStream> = None;
    let mut ready_rx = media.subscribe_ready();
    let mut media_rx = media.subscribe();
    let mut media_events_open = true;

    // prevent accidental moves
    let config = config.as_ref();

    loop {
        tokio::select! {
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("room handler cmd_rx channel is closed. quitting");
                        break;
                    }
                };
                match cmd {
                    EventHandlerCmd::EnterRoom { signals: stream, room: state, rsp } => {
                        log::info!("entered room {} as {}", state.room_id, state.self_id());
                        room.replace(state);
                        signals.replace(stream);
                        let _ = rsp.send(());
                    }
                    EventHandlerCmd::SetPhase { phase } => {
                        if let Some(room) = room.as_mut() {
                            room.apply_phase(phase);
                        }
                    }
                    EventHandlerCmd::ToggleMute { rsp } => {
                        let Some(room) = room.as_mut() else {
                            let _ = rsp.send(Err(Error::InvalidState("not in a room".into())));
                            continue;
                        };
                        let is_muted = room.local().map(|p| p.is_muted).unwrap_or_default();
                        let r = media.set_audio_enabled(is_muted).map(|enabled| {
                            let is_muted = !enabled;
                            update_local(room, &ui_event_ch, |p| p.is_muted = is_muted);
                            if let Err(e) = sender.send(SignalCommand::ToggleMute { is_muted }) {
                                log::error!("failed to send signal: {e}");
                            } else {
                                log::debug!("sent signal to {} self", if is_muted { "mute" } else { "unmute" });
                            }
                            is_muted
                        });
                        let _ = rsp.send(r);
                    }
                    EventHandlerCmd::SetVideoEnabled { enabled, rsp } => {
                        let Some(room) = room.as_mut() else {
                            let _ = rsp.send(Err(Error::InvalidState("not in a room".into())));
                            continue;
                        };
                        let r = media.set_video_enabled(enabled).map(|enabled| {
                            update_local(room, &ui_event_ch, |p| p.is_video_enabled = enabled);
                            if config.broadcast_video_state {
                                if let Err(e) = sender.send(SignalCommand::ToggleVideo { is_enabled: enabled }) {
                                    log::error!("failed to send signal: {e}");
                                }
                            }
                            enabled
                        });
                        let _ = rsp.send(r);
                    }
                    EventHandlerCmd::ToggleScreenShare { rsp } => {
                        let Some(room) = room.as_mut() else {
                            let _ = rsp.send(Err(Error::InvalidState("not in a room".into())));
                            continue;
                        };
                        if media.is_screen_sharing() {
                            stop_screen_share(&media, &mut registry, room, &sender, &ui_event_ch).await;
                            let _ = rsp.send(Ok(false));
                            continue;
                        }
                        let r = match media.start_screen_share().await {
                            Ok(track) => {
                                let replaced = registry.replace_outgoing_video_source(&track).await;
                                log::debug!("screen capture sent to {replaced} sessions");
                                update_local(room, &ui_event_ch, |p| p.is_screen_sharing = true);
                                if let Err(e) = sender.send(SignalCommand::ShareScreen { is_sharing: true }) {
                                    log::error!("failed to send signal: {e}");
                                }
                                Ok(true)
                            }
                            Err(e) => Err(e),
                        };
                        let _ = rsp.send(r);
                    }
                    EventHandlerCmd::GetParticipants { rsp } => {
                        let _ = rsp.send(room.as_ref().map(|r| r.participants()).unwrap_or_default());
                    }
                    EventHandlerCmd::GetSessions { rsp } => {
                        let _ = rsp.send(registry.sessions());
                    }
                    EventHandlerCmd::GetRemoteTracks { connection_id, rsp } => {
                        let _ = rsp.send(registry.remote_tracks(&connection_id));
                    }
                    EventHandlerCmd::Teardown { rsp } => {
                        let detached = rsp.is_none();
                        signals.take();
                        let report = teardown::run(&mut registry, &mut router, &sender, &media, channel.as_ref()).await;
                        room.take();
                        match rsp {
                            Some(rsp) => {
                                let _ = rsp.send(report);
                            }
                            None => {
                                log::debug!("room session dropped");
                            }
                        }
                        if detached {
                            let _ = ui_event_ch.send(RoomEvent::Closed);
                        }
                        break;
                    }
                }
            }
            opt = next_signal(&mut signals) => {
                let event = match opt {
                    Some(r) => r,
                    None => {
                        log::warn!("signaling stream ended");
                        signals.take();
                        continue;
                    }
                };
                let Some(room) = room.as_mut() else {
                    continue;
                };
                let mut ctx = RoomContext {
                    config,
                    registry: &mut registry,
                    room,
                    media: &media,
                    sender: &sender,
                    ui_event_ch: &ui_event_ch,
                };
                router.route(event, &mut ctx).await;
            }
            opt = peer_rx.recv() => {
                let Some(event) = opt else {
                    continue;
                };
                match event {
                    PeerEvent::IceCandidate { remote, epoch, candidate } => {
                        if !registry.is_current(&remote, epoch) {
                            log::debug!("discarding ice candidate of a closed session with {remote}");
                            continue;
                        }
                        if let Err(e) = sender.send(SignalCommand::SendIceCandidate { target: remote, candidate }) {
                            log::error!("failed to send signal: {e}");
                        }
                    }
                    PeerEvent::TrackAdded { remote, epoch, track } => {
                        let kind = track.kind;
                        if !registry.on_remote_track(&remote, epoch, track) {
                            continue;
                        }
                        let _ = ui_event_ch.send(RoomEvent::RemoteTrack { connection_id: remote.clone(), kind });
                        if let Some(participant) = room
                            .as_mut()
                            .and_then(|r| r.get_mut(&remote))
                            .filter(|p| kind == MediaKind::Video && !p.is_video_enabled)
                        {
                            participant.is_video_enabled = true;
                            let participant = participant.clone();
                            let _ = ui_event_ch.send(RoomEvent::ParticipantUpdated { participant });
                        }
                    }
                    PeerEvent::IceStateChanged { remote, epoch, state } => {
                        if !registry.on_ice_state(&remote, epoch, state) {
                            continue;
                        }
                        if state == IceState::Failed && config.ice_restart_on_failure {
                            match registry.restart_ice(&remote, &sender).await {
                                Ok(true) => {}
                                Ok(false) => log::debug!("not restarting ice with {remote}"),
                                Err(e) => report(e, &ui_event_ch),
                            }
                        }
                    }
                }
            }
            r = ready_rx.changed() => {
                if r.is_err() {
                    continue;
                }
                let ready = *ready_rx.borrow_and_update();
                let Some(room) = room.as_mut().filter(|_| ready) else {
                    continue;
                };
                log::debug!("local media is ready");
                let mut ctx = RoomContext {
                    config,
                    registry: &mut registry,
                    room,
                    media: &media,
                    sender: &sender,
                    ui_event_ch: &ui_event_ch,
                };
                router.on_media_ready(&mut ctx).await;
            }
            r = media_rx.recv(), if media_events_open => {
                match r {
                    Ok(MediaEvent::ScreenShareEnded { track_id }) => {
                        let Some(room) = room.as_mut() else {
                            continue;
                        };
                        if !media.is_screen_sharing() {
                            continue;
                        }
                        log::info!("screen capture {track_id} ended, falling back to camera");
                        stop_screen_share(&media, &mut registry, room, &sender, &ui_event_ch).await;
                        let _ = ui_event_ch.send(RoomEvent::ScreenShareEnded);
                    }
                    Err(RecvError::Lagged(n)) => log::warn!("missed {n} media events"),
                    Err(RecvError::Closed) => media_events_open = false,
                }
            }
            opt = deferred_rx.recv() => {
                let Some(deferred) = opt else {
                    continue;
                };
                let Some(room) = room.as_mut() else {
                    continue;
                };
                let mut ctx = RoomContext {
                    config,
                    registry: &mut registry,
                    room,
                    media: &media,
                    sender: &sender,
                    ui_event_ch: &ui_event_ch,
                };
                router.on_deferred(deferred, &mut ctx).await;
            }
        }
    }
    log::debug!("room event handler terminated");
}

fn update_local<F>(room: &mut RoomSessionState, ui_event_ch: &broadcast::Sender<RoomEvent>, f: F)
where
    F: FnOnce(&mut Participant),
{
    if let Some(participant) = room.local_mut() {
        f(participant);
        let participant = participant.clone();
        let _ = ui_event_ch.send(RoomEvent::ParticipantUpdated { participant });
    }
}

/// Ends the display capture and puts the camera back on every session
async fn stop_screen_share(
    media: &LocalMediaManager,
    registry: &mut PeerRegistry,
    room: &mut RoomSessionState,
    sender: &SignalSender,
    ui_event_ch: &broadcast::Sender<RoomEvent>,
) {
    media.stop_screen_share();
    if let Some(camera) = media.snapshot().video_track {
        let replaced = registry.replace_outgoing_video_source(&camera).await;
        log::debug!("camera restored on {replaced} sessions");
    }
    update_local(room, ui_event_ch, |p| p.is_screen_sharing = false);
    if let Err(e) = sender.send(SignalCommand::ShareScreen { is_sharing: false }) {
        log::error!("failed to send signal: {e}");
    }
}
