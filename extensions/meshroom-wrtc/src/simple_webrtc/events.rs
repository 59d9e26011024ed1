use std::sync::Arc;

use meshroom::{
    media::MediaKind,
    room::{ConnectionId, IceState},
    signaling::IceCandidate,
};
use tokio::sync::mpsc::UnboundedSender;
use webrtc::track::track_remote::TrackRemote;

/// A track received from a remote participant. `track` is absent for peers that do not
/// carry real RTP (loopback).
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("rtp", &self.track.is_some())
            .finish()
    }
}

/// Emitted from connection callbacks. `epoch` identifies the session instance that
/// produced the event so results arriving after it was closed can be dropped.
#[derive(Clone, derive_more::Display)]
pub enum PeerEvent {
    #[display(fmt = "IceCandidate")]
    IceCandidate {
        remote: ConnectionId,
        epoch: u64,
        candidate: IceCandidate,
    },
    #[display(fmt = "TrackAdded")]
    TrackAdded {
        remote: ConnectionId,
        epoch: u64,
        track: RemoteTrack,
    },
    #[display(fmt = "IceStateChanged")]
    IceStateChanged {
        remote: ConnectionId,
        epoch: u64,
        state: IceState,
    },
}

// TrackRemote doesn't implement Debug
impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Handed to a [`PeerFactory`](super::PeerFactory) so the connection it builds can
/// report back to the session that owns it.
#[derive(Clone)]
pub struct PeerContext {
    pub remote: ConnectionId,
    pub epoch: u64,
    events: UnboundedSender<PeerEvent>,
}

impl PeerContext {
    pub fn new(remote: ConnectionId, epoch: u64, events: UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            epoch,
            events,
        }
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEvent::IceCandidate {
            remote: self.remote.clone(),
            epoch: self.epoch,
            candidate,
        });
    }

    pub fn track_added(&self, track: RemoteTrack) {
        self.emit(PeerEvent::TrackAdded {
            remote: self.remote.clone(),
            epoch: self.epoch,
            track,
        });
    }

    pub fn ice_state(&self, state: IceState) {
        self.emit(PeerEvent::IceStateChanged {
            remote: self.remote.clone(),
            epoch: self.epoch,
            state,
        });
    }

    fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("event loop closed, dropping {} for peer {}", e.0, self.remote);
        }
    }
}
