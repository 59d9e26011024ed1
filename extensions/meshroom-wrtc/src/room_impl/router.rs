use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use meshroom::{
    config::MeshConfig,
    error::Error,
    room::{ConnectionId, Role, RoomEvent, RoomSessionState},
    signaling::{MemberInfo, SignalClass, SignalEvent},
};
use tokio::{
    sync::{broadcast, mpsc::UnboundedSender},
    task::JoinHandle,
    time::Instant,
};

use crate::host_media::LocalMediaManager;

use super::{
    registry::{OfferOutcome, PeerRegistry},
    signal_sender::SignalSender,
};

/// A membership event waiting for local media
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: SignalEvent,
    pub enqueued_at: Instant,
}

/// Work the router scheduled for later. Delivered back through the event loop.
#[derive(Debug)]
pub enum Deferred {
    /// an offer that found its session mid-negotiation
    Retry { event: SignalEvent, attempt: u32 },
    /// outcome of the bounded wait for local media
    MediaWait(Result<(), Error>),
}

/// What the router needs to act on an event. Lent by the event loop for one call.
pub struct RoomContext<'a> {
    pub config: &'a MeshConfig,
    pub registry: &'a mut PeerRegistry,
    pub room: &'a mut RoomSessionState,
    pub media: &'a Arc<LocalMediaManager>,
    pub sender: &'a SignalSender,
    pub ui_event_ch: &'a broadcast::Sender<RoomEvent>,
}

/// Orders inbound signaling against local media readiness.
///
/// Membership events are queued until media is ready and then processed strictly in
/// arrival order. Negotiation messages that arrive early wait behind a single bounded
/// readiness waiter. Departures are handled on arrival.
pub struct SignalRouter {
    pending: VecDeque<PendingEvent>,
    deferred: VecDeque<SignalEvent>,
    departed: HashSet<ConnectionId>,
    media_waiter: Option<JoinHandle<()>>,
    retries: Vec<JoinHandle<()>>,
    deferred_tx: UnboundedSender<Deferred>,
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.abort_timers();
    }
}

/// Logs `error`. Anything that is not a recoverable race also goes to the UI.
pub fn report(error: Error, ui_event_ch: &broadcast::Sender<RoomEvent>) {
    if error.is_recoverable() {
        log::warn!("{error}");
        return;
    }
    log::error!("{error}");
    let _ = ui_event_ch.send(RoomEvent::Error {
        message: error.to_string(),
    });
}

impl SignalRouter {
    pub fn new(deferred_tx: UnboundedSender<Deferred>) -> Self {
        Self {
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            departed: HashSet::new(),
            media_waiter: None,
            retries: vec![],
            deferred_tx,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    #[cfg(test)]
    pub fn push_pending(&mut self, event: SignalEvent) {
        self.pending.push_back(PendingEvent {
            event,
            enqueued_at: Instant::now(),
        });
    }

    pub async fn route(&mut self, event: SignalEvent, ctx: &mut RoomContext<'_>) {
        log::debug!("received {event}");
        match event.class() {
            SignalClass::Membership => {
                self.pending.push_back(PendingEvent {
                    event,
                    enqueued_at: Instant::now(),
                });
                if ctx.media.is_ready() {
                    self.drain_membership(ctx).await;
                } else {
                    log::debug!(
                        "local media not ready, {} membership events queued",
                        self.pending.len()
                    );
                }
            }
            SignalClass::Departure => self.handle_departure(event, ctx).await,
            SignalClass::Negotiation => {
                if let Some(from) = event.sender() {
                    if self.departed.contains(from) {
                        log::debug!("discarding {event} from departed peer {from}");
                        return;
                    }
                }
                if !ctx.media.is_ready() || !self.deferred.is_empty() {
                    self.defer(event, ctx);
                    return;
                }
                self.dispatch_negotiation(event, 0, ctx).await;
            }
            SignalClass::Status => self.handle_status(event, ctx),
        }
    }

    /// Replays everything that was waiting for local media: membership first, then
    /// negotiation messages, each in arrival order.
    pub async fn on_media_ready(&mut self, ctx: &mut RoomContext<'_>) {
        if let Some(handle) = self.media_waiter.take() {
            handle.abort();
        }
        self.drain_membership(ctx).await;
        while let Some(event) = self.deferred.pop_front() {
            if event.sender().map(|id| self.departed.contains(id)).unwrap_or_default() {
                log::debug!("discarding deferred {event} from departed peer");
                continue;
            }
            self.dispatch_negotiation(event, 0, ctx).await;
        }
    }

    pub async fn on_deferred(&mut self, deferred: Deferred, ctx: &mut RoomContext<'_>) {
        match deferred {
            Deferred::Retry { event, attempt } => {
                if event.sender().map(|id| self.departed.contains(id)).unwrap_or_default() {
                    log::debug!("dropping retry of {event}: peer departed");
                    return;
                }
                log::debug!("retrying {event} (attempt {attempt})");
                self.dispatch_negotiation(event, attempt, ctx).await;
            }
            Deferred::MediaWait(Ok(())) => {
                self.media_waiter = None;
                self.on_media_ready(ctx).await;
            }
            Deferred::MediaWait(Err(e)) => {
                self.media_waiter = None;
                if ctx.media.is_ready() {
                    self.on_media_ready(ctx).await;
                    return;
                }
                log::warn!("dropping {} negotiation messages", self.deferred.len());
                self.deferred.clear();
                report(e, ctx.ui_event_ch);
            }
        }
    }

    /// Discards everything queued. Returns how many events were dropped.
    pub fn clear(&mut self) -> usize {
        self.abort_timers();
        let discarded = self.pending.len() + self.deferred.len();
        self.pending.clear();
        self.deferred.clear();
        if discarded > 0 {
            log::debug!("discarded {discarded} queued signaling events");
        }
        discarded
    }

    fn abort_timers(&mut self) {
        if let Some(handle) = self.media_waiter.take() {
            handle.abort();
        }
        for handle in self.retries.drain(..) {
            handle.abort();
        }
    }

    fn defer(&mut self, event: SignalEvent, ctx: &RoomContext<'_>) {
        log::debug!("deferring {event} until local media is ready");
        self.deferred.push_back(event);
        if self.media_waiter.is_some() {
            return;
        }
        let media = ctx.media.clone();
        let policy = ctx.config.media_wait;
        let tx = self.deferred_tx.clone();
        self.media_waiter = Some(tokio::spawn(async move {
            let result = media.wait_until_ready(policy).await.map(|_| ());
            let _ = tx.send(Deferred::MediaWait(result));
        }));
    }

    fn schedule_retry(&mut self, event: SignalEvent, attempt: u32, ctx: &RoomContext<'_>) {
        let interval = ctx.config.negotiation_retry.interval();
        let tx = self.deferred_tx.clone();
        self.retries.retain(|h| !h.is_finished());
        self.retries.push(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(Deferred::Retry { event, attempt });
        }));
    }

    async fn drain_membership(&mut self, ctx: &mut RoomContext<'_>) {
        while let Some(PendingEvent { event, enqueued_at }) = self.pending.pop_front() {
            log::debug!("processing {event} queued {:?} ago", enqueued_at.elapsed());
            self.handle_membership(event, ctx).await;
        }
    }

    async fn handle_membership(&mut self, event: SignalEvent, ctx: &mut RoomContext<'_>) {
        match event {
            SignalEvent::RoomInfo { all_users } => {
                let self_id = ctx.room.self_id().clone();
                let members: Vec<MemberInfo> = all_users
                    .into_iter()
                    .filter(|m| !m.is_self && m.connection_id != self_id)
                    .collect();
                let stagger = ctx.config.room_info_stagger();
                for (i, member) in members.iter().enumerate() {
                    if i > 0 && !stagger.is_zero() {
                        tokio::time::sleep(stagger).await;
                    }
                    self.join_member(member, Role::Answerer, ctx).await;
                }
            }
            SignalEvent::ExistingUser(member) => {
                self.join_member(&member, Role::Answerer, ctx).await
            }
            SignalEvent::NewUserJoined(member) => {
                self.join_member(&member, Role::Offerer, ctx).await
            }
            other => log::warn!("{other} is not a membership event"),
        }
    }

    async fn join_member(&mut self, member: &MemberInfo, role: Role, ctx: &mut RoomContext<'_>) {
        let id = &member.connection_id;
        if member.is_self || id == ctx.room.self_id() {
            return;
        }
        if self.departed.contains(id) {
            log::debug!("ignoring membership of departed peer {id}");
            return;
        }
        if let Some(participant) = ctx.room.upsert(member) {
            log::info!("participant joined: {} ({id})", participant.display_name);
            let _ = ctx.ui_event_ch.send(RoomEvent::ParticipantJoined { participant });
        }
        let media = ctx.media.snapshot();
        if let Err(e) = ctx
            .registry
            .ensure_session(id, &member.user_name, role, &media, ctx.sender)
            .await
        {
            report(e, ctx.ui_event_ch);
        }
    }

    async fn handle_departure(&mut self, event: SignalEvent, ctx: &mut RoomContext<'_>) {
        let SignalEvent::UserLeft {
            connection_id,
            user_name,
        } = event
        else {
            return;
        };
        self.departed.insert(connection_id.clone());
        self.deferred.retain(|e| e.sender() != Some(&connection_id));
        self.pending.retain(|p| match &p.event {
            SignalEvent::ExistingUser(m) | SignalEvent::NewUserJoined(m) => {
                m.connection_id != connection_id
            }
            _ => true,
        });

        ctx.registry.close_session(&connection_id).await;
        match ctx.room.remove(&connection_id) {
            Some(participant) => {
                log::info!("participant left: {} ({connection_id})", participant.display_name);
                let _ = ctx.ui_event_ch.send(RoomEvent::ParticipantLeft {
                    connection_id,
                    display_name: participant.display_name,
                });
            }
            None => log::debug!("unknown participant {user_name} ({connection_id}) left"),
        }
    }

    async fn dispatch_negotiation(&mut self, event: SignalEvent, attempt: u32, ctx: &mut RoomContext<'_>) {
        let result = match event {
            SignalEvent::ReceiveOffer {
                from_connection_id,
                offer,
            } => {
                let name = ctx.room.display_name_of(&from_connection_id);
                let media = ctx.media.snapshot();
                match ctx
                    .registry
                    .accept_offer(&from_connection_id, &name, &offer, &media, ctx.sender)
                    .await
                {
                    Ok(OfferOutcome::Answered) => Ok(()),
                    Ok(OfferOutcome::NotNeutral)
                        if attempt < ctx.config.negotiation_retry.max_attempts =>
                    {
                        let event = SignalEvent::ReceiveOffer {
                            from_connection_id,
                            offer,
                        };
                        self.schedule_retry(event, attempt + 1, ctx);
                        Ok(())
                    }
                    Ok(OfferOutcome::NotNeutral) => Err(Error::NegotiationRace {
                        state: ctx
                            .registry
                            .state_of(&from_connection_id)
                            .map(|s| s.to_string())
                            .unwrap_or_default(),
                        connection_id: from_connection_id,
                        message: "offer".into(),
                    }),
                    Err(e) => Err(e),
                }
            }
            SignalEvent::ReceiveAnswer {
                from_connection_id,
                answer,
            } => ctx.registry.accept_answer(&from_connection_id, &answer).await,
            SignalEvent::ReceiveIceCandidate {
                from_connection_id,
                candidate,
            } => {
                ctx.registry
                    .add_remote_ice_candidate(&from_connection_id, &candidate)
                    .await
            }
            other => {
                log::warn!("{other} is not a negotiation message");
                Ok(())
            }
        };
        if let Err(e) = result {
            report(e, ctx.ui_event_ch);
        }
    }

    fn handle_status(&mut self, event: SignalEvent, ctx: &mut RoomContext<'_>) {
        match event {
            SignalEvent::UserMuteChanged { user_name, is_muted } => {
                for participant in ctx.room.set_muted_by_name(&user_name, is_muted) {
                    let _ = ctx.ui_event_ch.send(RoomEvent::ParticipantUpdated { participant });
                }
            }
            SignalEvent::UserScreenSharing {
                connection_id,
                is_sharing,
            } => {
                if let Some(participant) = ctx
                    .room
                    .get_mut(&connection_id)
                    .filter(|p| !p.is_self && p.is_screen_sharing != is_sharing)
                {
                    participant.is_screen_sharing = is_sharing;
                    let participant = participant.clone();
                    let _ = ctx.ui_event_ch.send(RoomEvent::ParticipantUpdated { participant });
                }
            }
            SignalEvent::UserVideoChanged {
                connection_id,
                is_enabled,
            } => {
                if !ctx.config.broadcast_video_state {
                    log::debug!("ignoring video state of {connection_id}");
                    return;
                }
                if let Some(participant) = ctx
                    .room
                    .get_mut(&connection_id)
                    .filter(|p| !p.is_self && p.is_video_enabled != is_enabled)
                {
                    participant.is_video_enabled = is_enabled;
                    let participant = participant.clone();
                    let _ = ctx.ui_event_ch.send(RoomEvent::ParticipantUpdated { participant });
                }
            }
            SignalEvent::Error { message } => {
                log::warn!("signaling error: {message}");
                let _ = ctx.ui_event_ch.send(RoomEvent::ChannelError { message });
            }
            other => log::warn!("{other} is not a status event"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        host_media::StaticMediaDevices,
        loopback::{LoopbackHub, LoopbackPeerFactory},
        room_impl::signal_sender,
        simple_webrtc::{events::PeerEvent, SignalingState},
    };
    use meshroom::{
        room::NegotiationState,
        signaling::{SessionDescription, SignalingChannel},
    };
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        config: MeshConfig,
        registry: PeerRegistry,
        room: RoomSessionState,
        media: Arc<LocalMediaManager>,
        sender: SignalSender,
        ui_event_ch: broadcast::Sender<RoomEvent>,
        router: SignalRouter,
        deferred_rx: UnboundedReceiver<Deferred>,
        factory: Arc<LoopbackPeerFactory>,
        self_id: ConnectionId,
        _peer_rx: UnboundedReceiver<PeerEvent>,
    }

    impl Harness {
        async fn new(devices: StaticMediaDevices) -> anyhow::Result<Self> {
            let hub = LoopbackHub::new();
            let channel = Arc::new(hub.channel());
            channel.connect().await?;
            let self_id = channel.id().clone();
            let factory = Arc::new(LoopbackPeerFactory::new());
            let (peer_tx, peer_rx) = mpsc::unbounded_channel();
            let (ui_event_ch, _) = broadcast::channel(256);
            let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
            Ok(Self {
                config: MeshConfig::development(),
                registry: PeerRegistry::new(factory.clone(), peer_tx, ui_event_ch.clone()),
                room: RoomSessionState::new("R1", "ana", self_id.clone()),
                media: Arc::new(LocalMediaManager::new(Arc::new(devices))),
                sender: signal_sender::init(channel),
                ui_event_ch,
                router: SignalRouter::new(deferred_tx),
                deferred_rx,
                factory,
                self_id,
                _peer_rx: peer_rx,
            })
        }

        async fn route(&mut self, event: SignalEvent) {
            let mut ctx = RoomContext {
                config: &self.config,
                registry: &mut self.registry,
                room: &mut self.room,
                media: &self.media,
                sender: &self.sender,
                ui_event_ch: &self.ui_event_ch,
            };
            self.router.route(event, &mut ctx).await;
        }

        async fn media_ready(&mut self) {
            let mut ctx = RoomContext {
                config: &self.config,
                registry: &mut self.registry,
                room: &mut self.room,
                media: &self.media,
                sender: &self.sender,
                ui_event_ch: &self.ui_event_ch,
            };
            self.router.on_media_ready(&mut ctx).await;
        }

        async fn next_deferred(&mut self) -> anyhow::Result<()> {
            let deferred = self
                .deferred_rx
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("deferred channel closed"))?;
            let mut ctx = RoomContext {
                config: &self.config,
                registry: &mut self.registry,
                room: &mut self.room,
                media: &self.media,
                sender: &self.sender,
                ui_event_ch: &self.ui_event_ch,
            };
            self.router.on_deferred(deferred, &mut ctx).await;
            Ok(())
        }
    }

    fn joined(id: &str, name: &str) -> SignalEvent {
        SignalEvent::NewUserJoined(MemberInfo::new(id, name))
    }

    #[tokio::test]
    async fn membership_waits_for_media_and_keeps_order() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.route(joined("c", "cat")).await;
        h.route(SignalEvent::ExistingUser(MemberInfo::new("d", "dan"))).await;
        h.route(joined("e", "eve")).await;
        assert_eq!(h.router.pending_len(), 3);
        assert_eq!(h.registry.len(), 0);

        h.media.acquire().await?;
        h.media_ready().await;

        assert_eq!(h.router.pending_len(), 0);
        assert_eq!(
            h.factory.creation_order(),
            vec![ConnectionId::from("c"), "d".into(), "e".into()]
        );
        assert_eq!(h.registry.role_of(&"c".into()), Some(Role::Offerer));
        assert_eq!(h.registry.role_of(&"d".into()), Some(Role::Answerer));
        assert_eq!(h.room.remote_count(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn queued_newcomer_becomes_offerer_once_media_arrives() -> anyhow::Result<()> {
        let devices = StaticMediaDevices::new().with_acquire_delay(Duration::from_millis(300));
        let mut h = Harness::new(devices).await?;
        let acquiring = {
            let media = h.media.clone();
            tokio::spawn(async move { media.acquire().await })
        };

        h.route(joined("c", "cat")).await;
        assert_eq!(h.router.pending_len(), 1);

        // three polling intervals later the capture is live
        let ready = h.media.wait_until_ready(h.config.media_wait).await?;
        assert!(ready.is_ready);
        acquiring.await??;
        h.media_ready().await;

        assert_eq!(h.registry.role_of(&"c".into()), Some(Role::Offerer));
        assert_eq!(h.registry.state_of(&"c".into()), Some(NegotiationState::OfferSent));
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_skips_self_and_answers_everyone() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.media.acquire().await?;
        let self_member = MemberInfo {
            connection_id: h.self_id.clone(),
            user_name: "ana".into(),
            is_self: true,
        };
        h.route(SignalEvent::RoomInfo {
            all_users: vec![self_member, MemberInfo::new("b", "bob"), MemberInfo::new("c", "cat")],
        })
        .await;

        assert_eq!(h.registry.len(), 2);
        for id in ["b", "c"] {
            assert_eq!(h.registry.role_of(&id.into()), Some(Role::Answerer));
        }
        assert!(!h.registry.contains(&h.self_id));
        assert_eq!(h.room.participants().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn departure_closes_session_and_discards_stale_answer() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.media.acquire().await?;
        let mut events = h.ui_event_ch.subscribe();

        h.route(joined("b", "bob")).await;
        assert_eq!(h.registry.state_of(&"b".into()), Some(NegotiationState::OfferSent));

        h.route(SignalEvent::UserLeft {
            connection_id: "b".into(),
            user_name: "bob".into(),
        })
        .await;
        assert!(!h.registry.contains(&"b".into()));
        assert!(h.factory.latest(&"b".into()).expect("peer").is_closed());
        assert!(h.room.get(&"b".into()).is_none());

        h.route(SignalEvent::ReceiveAnswer {
            from_connection_id: "b".into(),
            answer: SessionDescription::answer("v=0\r\n"),
        })
        .await;
        // a late offer must not resurrect the session either
        h.route(SignalEvent::ReceiveOffer {
            from_connection_id: "b".into(),
            offer: SessionDescription::offer("v=0\r\n"),
        })
        .await;
        assert_eq!(h.registry.len(), 0);
        assert_eq!(h.factory.peers().len(), 1);

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, RoomEvent::Error { .. }), "{event}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn candidates_before_media_are_replayed_after_the_offer() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        let offer = SessionDescription::offer("v=0\r\nm=audio 9 X 96\r\na=sendrecv\r\n");
        h.route(SignalEvent::ReceiveOffer {
            from_connection_id: "b".into(),
            offer,
        })
        .await;
        h.route(SignalEvent::ReceiveIceCandidate {
            from_connection_id: "b".into(),
            candidate: Default::default(),
        })
        .await;
        assert_eq!(h.router.deferred_len(), 2);

        h.media.acquire().await?;
        h.next_deferred().await?;

        assert_eq!(h.router.deferred_len(), 0);
        assert_eq!(h.registry.state_of(&"b".into()), Some(NegotiationState::Stable));
        assert_eq!(h.factory.latest(&"b".into()).expect("peer").remote_candidates().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn candidate_ahead_of_offer_is_kept_quietly() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.media.acquire().await?;
        let mut events = h.ui_event_ch.subscribe();
        h.route(SignalEvent::ExistingUser(MemberInfo::new("b", "bob"))).await;
        h.route(SignalEvent::ReceiveIceCandidate {
            from_connection_id: "b".into(),
            candidate: Default::default(),
        })
        .await;
        let peer = h.factory.latest(&"b".into()).expect("peer");
        assert!(peer.remote_candidates().is_empty());

        h.route(SignalEvent::ReceiveOffer {
            from_connection_id: "b".into(),
            offer: SessionDescription::offer("v=0\r\nm=audio 9 X 96\r\na=sendrecv\r\n"),
        })
        .await;
        assert_eq!(h.registry.state_of(&"b".into()), Some(NegotiationState::Stable));
        assert_eq!(peer.remote_candidates().len(), 1);

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, RoomEvent::Error { .. }), "{event}");
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_messages_are_dropped_when_media_never_arrives() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        let mut events = h.ui_event_ch.subscribe();
        h.route(SignalEvent::ReceiveOffer {
            from_connection_id: "b".into(),
            offer: SessionDescription::offer("v=0\r\n"),
        })
        .await;

        h.next_deferred().await?;
        assert_eq!(h.router.deferred_len(), 0);
        assert!(matches!(events.try_recv(), Ok(RoomEvent::Error { .. })));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn offer_mid_negotiation_is_retried_once() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.media.acquire().await?;
        h.route(SignalEvent::ExistingUser(MemberInfo::new("b", "bob"))).await;
        let peer = h.factory.latest(&"b".into()).expect("peer");
        peer.force_signaling_state(SignalingState::HaveLocalOffer);

        h.route(SignalEvent::ReceiveOffer {
            from_connection_id: "b".into(),
            offer: SessionDescription::offer("v=0\r\n"),
        })
        .await;
        assert_eq!(h.registry.state_of(&"b".into()), Some(NegotiationState::New));

        peer.force_signaling_state(SignalingState::Stable);
        h.next_deferred().await?;
        assert_eq!(h.registry.state_of(&"b".into()), Some(NegotiationState::Stable));
        Ok(())
    }

    #[tokio::test]
    async fn status_events_update_participants() -> anyhow::Result<()> {
        let mut h = Harness::new(StaticMediaDevices::new()).await?;
        h.media.acquire().await?;
        let mut events = h.ui_event_ch.subscribe();
        h.route(SignalEvent::ExistingUser(MemberInfo::new("b", "bob"))).await;

        h.route(SignalEvent::UserMuteChanged {
            user_name: "bob".into(),
            is_muted: true,
        })
        .await;
        h.route(SignalEvent::UserScreenSharing {
            connection_id: "b".into(),
            is_sharing: true,
        })
        .await;
        h.route(SignalEvent::UserVideoChanged {
            connection_id: "b".into(),
            is_enabled: false,
        })
        .await;
        h.route(SignalEvent::Error {
            message: "room is full".into(),
        })
        .await;

        let bob = h.room.get(&"b".into()).expect("bob").clone();
        assert!(bob.is_muted);
        assert!(bob.is_screen_sharing);
        // video state is only tracked when broadcasting is enabled
        assert!(bob.is_video_enabled);

        let mut channel_errors = 0;
        while let Ok(event) = events.try_recv() {
            if let RoomEvent::ChannelError { message } = event {
                assert_eq!(message, "room is full");
                channel_errors += 1;
            }
        }
        assert_eq!(channel_errors, 1);
        Ok(())
    }
}
