use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use meshroom::{
    media::MediaKind,
    room::{ConnectionId, IceState},
    signaling::{IceCandidate, SdpType, SessionDescription},
    sync::Mutex,
};

use crate::{
    host_media::LocalTrack,
    simple_webrtc::{
        events::{PeerContext, RemoteTrack},
        PeerFactory, RtcPeer, SignalingState,
    },
};

/// local candidates emitted for every committed local description
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

#[derive(Default)]
struct PeerState {
    signaling: Option<SignalingState>,
    outgoing: HashMap<MediaKind, String>,
    add_track_calls: HashMap<MediaKind, usize>,
    replaced: Vec<(MediaKind, String)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_kinds: Vec<MediaKind>,
    candidates: Vec<IceCandidate>,
    offers_created: usize,
    version: u64,
}

/// A peer that negotiates with synthetic SDP and reports two host candidates per local
/// description. Remote tracks are announced for every kind the remote description sends.
pub struct LoopbackPeer {
    ctx: PeerContext,
    state: Mutex<PeerState>,
    closed: AtomicBool,
}

impl LoopbackPeer {
    fn new(ctx: PeerContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(PeerState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.ctx.remote
    }

    pub fn epoch(&self) -> u64 {
        self.ctx.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn add_track_calls(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .add_track_calls
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// id of the track currently sent for `kind`
    pub fn outgoing(&self, kind: MediaKind) -> Option<String> {
        self.state.lock().outgoing.get(&kind).cloned()
    }

    pub fn replaced(&self) -> Vec<(MediaKind, String)> {
        self.state.lock().replaced.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Pins the connection's signaling state, e.g. to simulate a negotiation in flight
    pub fn force_signaling_state(&self, state: SignalingState) {
        self.state.lock().signaling = Some(state);
    }

    /// Reports an ICE transport failure
    pub fn fail_transport(&self) {
        self.ctx.ice_state(IceState::Failed);
    }

    fn current_signaling(state: &PeerState) -> SignalingState {
        state.signaling.unwrap_or(SignalingState::Stable)
    }

    fn describe(&self, state: &mut PeerState, sdp_type: SdpType, ice_restart: bool) -> SessionDescription {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=loopback {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.ctx.epoch, state.version
        );
        if ice_restart {
            sdp.push_str("a=ice-options:restart\r\n");
        }
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let direction = if state.outgoing.contains_key(&kind) {
                "sendrecv"
            } else {
                "recvonly"
            };
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na={direction}\r\n"));
        }
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            bail!("peer connection to {} is closed", self.ctx.remote);
        }
        Ok(())
    }
}

/// kinds the remote side sends according to its description
fn sending_kinds(sdp: &str) -> Vec<MediaKind> {
    let mut kinds = vec![];
    let mut current = None;
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            current = match media.split_whitespace().next() {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            };
        } else if matches!(line, "a=sendrecv" | "a=sendonly") {
            kinds.extend(current.take());
        }
    }
    kinds
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        *state.add_track_calls.entry(track.kind()).or_default() += 1;
        if state.outgoing.contains_key(&track.kind()) {
            bail!("duplicate {} track", track.kind());
        }
        state.outgoing.insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: Arc<LocalTrack>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.outgoing.get_mut(&kind) {
            Some(current) => *current = track.id().to_string(),
            None => bail!("no {kind} sender to replace"),
        }
        state.replaced.push((kind, track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.offers_created += 1;
        Ok(self.describe(&mut state, SdpType::Offer, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if Self::current_signaling(&state) != SignalingState::HaveRemoteOffer {
            bail!("cannot create an answer without a remote offer");
        }
        Ok(self.describe(&mut state, SdpType::Answer, false))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            let current = Self::current_signaling(&state);
            let next = match (desc.sdp_type, current) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, current) => bail!("cannot apply local {sdp_type} in state {current}"),
            };
            state.signaling = Some(next);
            state.local = Some(desc.clone());
        }

        for n in 0..CANDIDATES_PER_DESCRIPTION {
            self.ctx.ice_candidate(IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                    50000 + self.ctx.epoch * 10 + u64::from(n)
                ),
                sdp_mid: Some(n.to_string()),
                sdp_mline_index: Some(n),
                username_fragment: None,
            });
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let announce = {
            let mut state = self.state.lock();
            let current = Self::current_signaling(&state);
            let next = match (desc.sdp_type, current) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => bail!("cannot apply remote {sdp_type} in state {current}"),
            };
            state.signaling = Some(next);
            let first = state.remote.is_none();
            state.remote = Some(desc.clone());

            let fresh: Vec<MediaKind> = sending_kinds(&desc.sdp)
                .into_iter()
                .filter(|kind| !state.remote_kinds.contains(kind))
                .collect();
            state.remote_kinds.extend(fresh.iter().copied());
            (first, fresh)
        };

        let (first, fresh) = announce;
        if first {
            self.ctx.ice_state(IceState::Checking);
        }
        for kind in fresh {
            self.ctx.track_added(RemoteTrack { kind, track: None });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let first = {
            let mut state = self.state.lock();
            if state.remote.is_none() {
                bail!("remote description is not set");
            }
            state.candidates.push(candidate.clone());
            state.candidates.len() == 1
        };
        if first {
            self.ctx.ice_state(IceState::Connected);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        if self.is_closed() {
            return SignalingState::Closed;
        }
        Self::current_signaling(&self.state.lock())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ctx.ice_state(IceState::Closed);
        }
        Ok(())
    }
}

/// Hands out [`LoopbackPeer`]s and keeps them for inspection
#[derive(Default)]
pub struct LoopbackPeerFactory {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    fail: AtomicBool,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// every peer created so far, in creation order
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().clone()
    }

    /// remote ids in the order their connections were created
    pub fn creation_order(&self) -> Vec<ConnectionId> {
        self.peers.lock().iter().map(|p| p.remote().clone()).collect()
    }

    /// the most recent connection to `remote`
    pub fn latest(&self, remote: &ConnectionId) -> Option<Arc<LoopbackPeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|p| p.remote() == remote)
            .cloned()
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for LoopbackPeerFactory {
    async fn create_peer(&self, ctx: PeerContext) -> Result<Arc<dyn RtcPeer>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("peer creation disabled for {}", ctx.remote);
        }
        let peer = Arc::new(LoopbackPeer::new(ctx));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
