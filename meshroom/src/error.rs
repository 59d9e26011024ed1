/// Errors raised while orchestrating a room session
use thiserror::Error;

use crate::{media::MediaKind, room::ConnectionId};

#[derive(Error, Debug)]
pub enum Error {
    // Local media
    #[error("Unable to acquire local media: {0}")]
    MediaAcquisition(String),
    #[error("Local media was not ready after {attempts} attempts")]
    MediaNotReady { attempts: u32 },
    #[error("No local {0} track is available")]
    NoLocalTrack(MediaKind),

    // Signaling channel
    #[error("Unable to connect the signaling channel: {0}")]
    ChannelConnect(String),
    #[error("Signaling channel is not connected")]
    ChannelClosed,
    #[error("Join request was rejected: {0}")]
    JoinRejected(String),
    #[error("Failed to send signal: {0}")]
    FailedToSendSignal(String),

    // Negotiation
    #[error("Discarded {message} from {connection_id} while in state {state}")]
    NegotiationRace {
        connection_id: ConnectionId,
        state: String,
        message: String,
    },
    #[error("No negotiation session exists for {0}")]
    PeerLookupMiss(ConnectionId),
    #[error("WebRTC failure: {0}")]
    WebRtc(String),

    // Room session
    #[error("Room \"{0}\" could not be joined")]
    RoomNotFound(String),
    #[error("Display name \"{0}\" must be between 2 and 20 characters")]
    InvalidDisplayName(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Room session is closed")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    OtherWithContext(String),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("An unknown error has occurred")]
    Other,
}

impl Error {
    /// Errors that are absorbed by discarding the offending message. They are
    /// logged and never surfaced to the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NegotiationRace { .. } | Error::PeerLookupMiss(_)
        )
    }
}
