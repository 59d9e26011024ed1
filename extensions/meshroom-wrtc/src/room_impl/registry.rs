use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use meshroom::{
    error::Error,
    media::MediaKind,
    room::{ConnectionId, IceState, NegotiationState, Role, RoomEvent, SessionInfo},
    signaling::{IceCandidate, SessionDescription, SignalCommand},
};
use tokio::sync::{broadcast, mpsc::UnboundedSender};

use crate::{
    host_media::{LocalMediaState, LocalTrack},
    simple_webrtc::{
        events::{PeerContext, PeerEvent, RemoteTrack},
        PeerFactory, RtcPeer,
    },
};

use super::signal_sender::SignalSender;

/// State of the connection to one remote participant
pub struct NegotiationSession {
    remote_name: String,
    role: Role,
    state: NegotiationState,
    ice_state: IceState,
    epoch: u64,
    peer: Arc<dyn RtcPeer>,
    // kind -> id of the local track being sent
    outgoing: HashMap<MediaKind, String>,
    remote_tracks: IndexMap<MediaKind, RemoteTrack>,
    ice_candidates_added: usize,
    // candidates that arrived before the remote description
    early_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    ice_restarted: bool,
}

impl NegotiationSession {
    async fn attach(&mut self, track: &Arc<LocalTrack>) -> Result<(), Error> {
        if self.outgoing.contains_key(&track.kind()) {
            return Ok(());
        }
        self.peer
            .add_track(track.clone())
            .await
            .map_err(|e| Error::WebRtc(e.to_string()))?;
        self.outgoing.insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        remote: &ConnectionId,
        sdp: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.peer.set_remote_description(sdp).await?;
        self.has_remote_description = true;
        let early = std::mem::take(&mut self.early_candidates);
        if !early.is_empty() {
            log::debug!("applying {} early ice candidates from {remote}", early.len());
        }
        for candidate in early {
            match self.peer.add_ice_candidate(&candidate).await {
                Ok(()) => self.ice_candidates_added += 1,
                Err(e) => log::warn!("failed to add early ice candidate from {remote}: {e:#}"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered,
    /// the session is mid-negotiation; the offer may be retried
    NotNeutral,
}

/// Owns every negotiation session. At most one session exists per remote id.
pub struct PeerRegistry {
    sessions: IndexMap<ConnectionId, NegotiationSession>,
    factory: Arc<dyn PeerFactory>,
    peer_tx: UnboundedSender<PeerEvent>,
    next_epoch: u64,
    ui_event_ch: broadcast::Sender<RoomEvent>,
}

fn transition(
    ui_event_ch: &broadcast::Sender<RoomEvent>,
    remote: &ConnectionId,
    session: &mut NegotiationSession,
    state: NegotiationState,
) {
    if session.state == state {
        return;
    }
    log::debug!("session {remote}: {} -> {state}", session.state);
    session.state = state;
    let _ = ui_event_ch.send(RoomEvent::SessionStateChanged {
        connection_id: remote.clone(),
        state,
    });
}

fn webrtc_err(e: anyhow::Error) -> Error {
    Error::WebRtc(format!("{e:#}"))
}

impl PeerRegistry {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        peer_tx: UnboundedSender<PeerEvent>,
        ui_event_ch: broadcast::Sender<RoomEvent>,
    ) -> Self {
        Self {
            sessions: IndexMap::new(),
            factory,
            peer_tx,
            next_epoch: 0,
            ui_event_ch,
        }
    }

    pub fn contains(&self, remote: &ConnectionId) -> bool {
        self.sessions.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn role_of(&self, remote: &ConnectionId) -> Option<Role> {
        self.sessions.get(remote).map(|s| s.role)
    }

    pub fn state_of(&self, remote: &ConnectionId) -> Option<NegotiationState> {
        self.sessions.get(remote).map(|s| s.state)
    }

    /// true if `epoch` belongs to the live session for `remote`
    pub fn is_current(&self, remote: &ConnectionId, epoch: u64) -> bool {
        self.sessions
            .get(remote)
            .map(|s| s.epoch == epoch)
            .unwrap_or_default()
    }

    /// Creates the session for `remote` unless one exists. Returns whether a session was
    /// created. The offerer immediately sends its offer.
    pub async fn ensure_session(
        &mut self,
        remote: &ConnectionId,
        remote_name: &str,
        role: Role,
        media: &LocalMediaState,
        sender: &SignalSender,
    ) -> Result<bool, Error> {
        if self.sessions.contains_key(remote) {
            log::debug!("session for {remote} already exists");
            return Ok(false);
        }
        if !media.is_ready {
            return Err(Error::InvalidState(format!(
                "local media is not ready for a session with {remote}"
            )));
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let ctx = PeerContext::new(remote.clone(), epoch, self.peer_tx.clone());
        let peer = self.factory.create_peer(ctx).await.map_err(webrtc_err)?;

        let mut session = NegotiationSession {
            remote_name: remote_name.to_string(),
            role,
            state: NegotiationState::New,
            ice_state: IceState::New,
            epoch,
            peer: peer.clone(),
            outgoing: HashMap::new(),
            remote_tracks: IndexMap::new(),
            ice_candidates_added: 0,
            early_candidates: vec![],
            has_remote_description: false,
            ice_restarted: false,
        };

        let tracks = [
            media.audio_track.as_ref().filter(|t| t.is_live()),
            media.outgoing_video().filter(|t| t.is_live()),
        ];
        for track in tracks.into_iter().flatten() {
            if let Err(e) = session.attach(track).await {
                let _ = peer.close().await;
                return Err(e);
            }
        }

        log::info!("created {role} session with {remote} ({remote_name})");
        self.sessions.insert(remote.clone(), session);
        let _ = self.ui_event_ch.send(RoomEvent::SessionCreated {
            connection_id: remote.clone(),
            role,
        });

        if role == Role::Offerer {
            if let Err(e) = self.send_offer(remote, false, sender).await {
                self.close_session(remote).await;
                return Err(e);
            }
        }
        Ok(true)
    }

    async fn send_offer(
        &mut self,
        remote: &ConnectionId,
        ice_restart: bool,
        sender: &SignalSender,
    ) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| Error::PeerLookupMiss(remote.clone()))?;
        let offer = session
            .peer
            .create_offer(ice_restart)
            .await
            .map_err(webrtc_err)?;
        session
            .peer
            .set_local_description(&offer)
            .await
            .map_err(webrtc_err)?;
        transition(&self.ui_event_ch, remote, session, NegotiationState::OfferSent);

        if let Err(e) = sender.send(SignalCommand::SendOffer {
            target: remote.clone(),
            offer,
        }) {
            log::error!("failed to send signal: {e}");
        }
        Ok(())
    }

    /// Answers an inbound offer, creating an answering session first if needed.
    pub async fn accept_offer(
        &mut self,
        remote: &ConnectionId,
        remote_name: &str,
        offer: &SessionDescription,
        media: &LocalMediaState,
        sender: &SignalSender,
    ) -> Result<OfferOutcome, Error> {
        if !self.sessions.contains_key(remote) {
            self.ensure_session(remote, remote_name, Role::Answerer, media, sender)
                .await?;
        }
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| Error::PeerLookupMiss(remote.clone()))?;

        if !session.state.accepts_offer() || !session.peer.signaling_state().is_neutral() {
            log::debug!(
                "offer from {remote} arrived in state {} ({})",
                session.state,
                session.peer.signaling_state()
            );
            return Ok(OfferOutcome::NotNeutral);
        }

        let previous = session.state;
        transition(&self.ui_event_ch, remote, session, NegotiationState::OfferReceived);

        let answer = async {
            session.set_remote_description(remote, offer).await?;
            let answer = session.peer.create_answer().await?;
            session.peer.set_local_description(&answer).await?;
            Ok::<_, anyhow::Error>(answer)
        }
        .await;

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                transition(&self.ui_event_ch, remote, session, previous);
                return Err(webrtc_err(e));
            }
        };

        transition(&self.ui_event_ch, remote, session, NegotiationState::AnswerSent);
        if let Err(e) = sender.send(SignalCommand::SendAnswer {
            target: remote.clone(),
            answer,
        }) {
            log::error!("failed to send signal: {e}");
        }
        transition(&self.ui_event_ch, remote, session, NegotiationState::Stable);
        Ok(OfferOutcome::Answered)
    }

    pub async fn accept_answer(
        &mut self,
        remote: &ConnectionId,
        answer: &SessionDescription,
    ) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| Error::PeerLookupMiss(remote.clone()))?;
        if !session.state.accepts_answer() {
            return Err(Error::NegotiationRace {
                connection_id: remote.clone(),
                state: session.state.to_string(),
                message: "answer".into(),
            });
        }
        session
            .set_remote_description(remote, answer)
            .await
            .map_err(webrtc_err)?;
        transition(&self.ui_event_ch, remote, session, NegotiationState::Stable);
        Ok(())
    }

    pub async fn add_remote_ice_candidate(
        &mut self,
        remote: &ConnectionId,
        candidate: &IceCandidate,
    ) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(remote)
            .ok_or_else(|| Error::PeerLookupMiss(remote.clone()))?;
        if !session.has_remote_description {
            log::debug!("holding ice candidate from {remote} until its description arrives");
            session.early_candidates.push(candidate.clone());
            return Ok(());
        }
        session
            .peer
            .add_ice_candidate(candidate)
            .await
            .map_err(webrtc_err)?;
        session.ice_candidates_added += 1;
        log::trace!("added ice candidate from {remote}");
        Ok(())
    }

    /// Swaps the outgoing video of every session in place. Returns how many sessions
    /// now send `track`.
    pub async fn replace_outgoing_video_source(&mut self, track: &Arc<LocalTrack>) -> usize {
        let mut replaced = 0;
        for (remote, session) in self.sessions.iter_mut() {
            match session.outgoing.get(&MediaKind::Video) {
                Some(current) if current == track.id() => {
                    replaced += 1;
                    continue;
                }
                Some(_) => {}
                None => {
                    log::debug!("session {remote} has no video sender");
                    continue;
                }
            }
            match session.peer.replace_track(MediaKind::Video, track.clone()).await {
                Ok(()) => {
                    session
                        .outgoing
                        .insert(MediaKind::Video, track.id().to_string());
                    replaced += 1;
                }
                Err(e) => log::error!("failed to replace video track for {remote}: {e}"),
            }
        }
        replaced
    }

    /// Records the ICE state. Returns false for events of a closed session.
    pub fn on_ice_state(&mut self, remote: &ConnectionId, epoch: u64, state: IceState) -> bool {
        let Some(session) = self.sessions.get_mut(remote).filter(|s| s.epoch == epoch) else {
            return false;
        };
        if session.ice_state == state {
            return true;
        }
        log::debug!("ice state for {remote}: {} -> {state}", session.ice_state);
        session.ice_state = state;
        let _ = self.ui_event_ch.send(RoomEvent::IceStateChanged {
            connection_id: remote.clone(),
            state,
        });
        true
    }

    /// Stores a remote track. Returns false for events of a closed session.
    pub fn on_remote_track(&mut self, remote: &ConnectionId, epoch: u64, track: RemoteTrack) -> bool {
        let Some(session) = self.sessions.get_mut(remote).filter(|s| s.epoch == epoch) else {
            return false;
        };
        log::info!("received {} track from {remote}", track.kind);
        session.remote_tracks.insert(track.kind, track);
        true
    }

    /// Renegotiates with an ICE restart. Only the offering side restarts, and only once
    /// per session.
    pub async fn restart_ice(&mut self, remote: &ConnectionId, sender: &SignalSender) -> Result<bool, Error> {
        let Some(session) = self.sessions.get_mut(remote) else {
            return Ok(false);
        };
        if session.role != Role::Offerer
            || session.state != NegotiationState::Stable
            || session.ice_restarted
        {
            return Ok(false);
        }
        session.ice_restarted = true;
        log::info!("restarting ice with {remote}");
        self.send_offer(remote, true, sender).await?;
        Ok(true)
    }

    /// Closes the session for `remote`. Returns false if there was none.
    pub async fn close_session(&mut self, remote: &ConnectionId) -> bool {
        let Some(mut session) = self.sessions.shift_remove(remote) else {
            return false;
        };
        transition(&self.ui_event_ch, remote, &mut session, NegotiationState::Closed);
        if let Err(e) = session.peer.close().await {
            log::error!("failed to close connection to {remote}: {e}");
        }
        log::info!("closed session with {remote}");
        let _ = self.ui_event_ch.send(RoomEvent::SessionClosed {
            connection_id: remote.clone(),
        });
        true
    }

    pub async fn close_all(&mut self) -> usize {
        let remotes: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        let mut closed = 0;
        for remote in remotes {
            if self.close_session(&remote).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(id, s)| {
                let mut outgoing: Vec<MediaKind> = s.outgoing.keys().copied().collect();
                outgoing.sort_by_key(|kind| *kind == MediaKind::Video);
                SessionInfo {
                    connection_id: id.clone(),
                    display_name: s.remote_name.clone(),
                    role: s.role,
                    state: s.state,
                    ice_state: s.ice_state,
                    outgoing,
                    remote_tracks: s.remote_tracks.keys().copied().collect(),
                    ice_candidates_added: s.ice_candidates_added,
                }
            })
            .collect()
    }

    pub fn remote_tracks(&self, remote: &ConnectionId) -> Vec<RemoteTrack> {
        self.sessions
            .get(remote)
            .map(|s| s.remote_tracks.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        host_media::{LocalMediaManager, StaticMediaDevices},
        loopback::{LoopbackHub, LoopbackPeerFactory},
        simple_webrtc::SignalingState,
    };
    use tokio::sync::mpsc;

    struct Fixture {
        registry: PeerRegistry,
        factory: Arc<LoopbackPeerFactory>,
        media: LocalMediaState,
        sender: SignalSender,
        _manager: LocalMediaManager,
        _peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let factory = Arc::new(LoopbackPeerFactory::new());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (ui_event_ch, _) = broadcast::channel(64);
        let manager = LocalMediaManager::new(Arc::new(StaticMediaDevices::new()));
        let media = manager.acquire().await?;
        let hub = LoopbackHub::new();
        let channel = Arc::new(hub.channel());
        Ok(Fixture {
            registry: PeerRegistry::new(factory.clone(), peer_tx, ui_event_ch),
            factory,
            media,
            sender: crate::room_impl::signal_sender::init(channel),
            _manager: manager,
            _peer_rx: peer_rx,
        })
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        assert!(f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?);
        assert!(!f.registry.ensure_session(&b, "bob", Role::Offerer, &f.media, &f.sender).await?);

        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.role_of(&b), Some(Role::Answerer));
        let peer = f.factory.latest(&b).expect("peer");
        assert_eq!(peer.add_track_calls(MediaKind::Audio), 1);
        assert_eq!(peer.add_track_calls(MediaKind::Video), 1);
        assert_eq!(f.factory.peers().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn offerer_sends_offer_right_away() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let c = ConnectionId::from("c");
        f.registry.ensure_session(&c, "cat", Role::Offerer, &f.media, &f.sender).await?;
        assert_eq!(f.registry.state_of(&c), Some(NegotiationState::OfferSent));
        assert_eq!(f.factory.latest(&c).expect("peer").offers_created(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn answers_are_only_taken_after_an_offer() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        let answer = SessionDescription::answer("v=0\r\n");

        let err = f.registry.accept_answer(&b, &answer).await.unwrap_err();
        assert!(matches!(err, Error::PeerLookupMiss(_)));

        f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?;
        let err = f.registry.accept_answer(&b, &answer).await.unwrap_err();
        assert!(matches!(err, Error::NegotiationRace { .. }));
        assert!(err.is_recoverable());
        assert_eq!(f.registry.state_of(&b), Some(NegotiationState::New));
        Ok(())
    }

    #[tokio::test]
    async fn offer_creates_answering_session() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        let offer = SessionDescription::offer("v=0\r\nm=audio 9 X 96\r\na=sendrecv\r\n");
        let outcome = f
            .registry
            .accept_offer(&b, "bob", &offer, &f.media, &f.sender)
            .await?;
        assert_eq!(outcome, OfferOutcome::Answered);
        assert_eq!(f.registry.role_of(&b), Some(Role::Answerer));
        assert_eq!(f.registry.state_of(&b), Some(NegotiationState::Stable));
        Ok(())
    }

    #[tokio::test]
    async fn offer_mid_negotiation_is_not_neutral() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?;
        f.factory
            .latest(&b)
            .expect("peer")
            .force_signaling_state(SignalingState::HaveLocalOffer);

        let offer = SessionDescription::offer("v=0\r\n");
        let outcome = f
            .registry
            .accept_offer(&b, "bob", &offer, &f.media, &f.sender)
            .await?;
        assert_eq!(outcome, OfferOutcome::NotNeutral);
        assert_eq!(f.registry.state_of(&b), Some(NegotiationState::New));
        Ok(())
    }

    #[tokio::test]
    async fn candidates_need_a_session() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let err = f
            .registry
            .add_remote_ice_candidate(&ConnectionId::from("x"), &IceCandidate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerLookupMiss(_)));
        Ok(())
    }

    #[tokio::test]
    async fn early_candidates_wait_for_the_offer() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?;
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        f.registry.add_remote_ice_candidate(&b, &candidate).await?;
        f.registry.add_remote_ice_candidate(&b, &candidate).await?;
        let peer = f.factory.latest(&b).expect("peer");
        assert!(peer.remote_candidates().is_empty());
        assert_eq!(f.registry.sessions()[0].ice_candidates_added, 0);

        let offer = SessionDescription::offer("v=0\r\nm=audio 9 X 96\r\na=sendrecv\r\n");
        f.registry.accept_offer(&b, "bob", &offer, &f.media, &f.sender).await?;
        assert_eq!(peer.remote_candidates(), vec![candidate.clone(), candidate.clone()]);
        assert_eq!(f.registry.sessions()[0].ice_candidates_added, 2);

        // later candidates go straight to the peer
        f.registry.add_remote_ice_candidate(&b, &candidate).await?;
        assert_eq!(peer.remote_candidates().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn closing_drops_late_events() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        let b = ConnectionId::from("b");
        f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?;
        assert!(f.registry.is_current(&b, 1));

        assert!(f.registry.close_session(&b).await);
        assert!(!f.registry.close_session(&b).await);
        assert!(!f.registry.is_current(&b, 1));
        assert!(!f.registry.on_ice_state(&b, 1, IceState::Connected));
        assert!(f.factory.latest(&b).expect("peer").is_closed());

        // a new session for the same remote gets a new epoch
        f.registry.ensure_session(&b, "bob", Role::Answerer, &f.media, &f.sender).await?;
        assert!(f.registry.is_current(&b, 2));
        assert_eq!(f.registry.close_all().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn video_source_is_replaced_everywhere() -> anyhow::Result<()> {
        let mut f = fixture().await?;
        for id in ["b", "c"] {
            f.registry
                .ensure_session(&id.into(), id, Role::Answerer, &f.media, &f.sender)
                .await?;
        }
        let screen = Arc::new(LocalTrack::screen("s"));
        assert_eq!(f.registry.replace_outgoing_video_source(&screen).await, 2);
        for peer in f.factory.peers() {
            assert_eq!(peer.outgoing(MediaKind::Video).as_deref(), Some(screen.id()));
            assert_eq!(peer.add_track_calls(MediaKind::Video), 1);
        }
        Ok(())
    }
}
