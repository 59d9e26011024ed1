use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::ConnectionId;
use crate::media::MediaKind;

/// Offer/answer role of the local side. Fixed when the session is created.
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    #[display(fmt = "Offerer")]
    Offerer,
    #[display(fmt = "Answerer")]
    Answerer,
}

/// Per-session offer/answer progress.
///
/// Offerer: `New -> OfferSent -> Stable`.
/// Answerer: `New -> OfferReceived -> AnswerSent -> Stable`.
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    #[display(fmt = "New")]
    New,
    #[display(fmt = "OfferSent")]
    OfferSent,
    #[display(fmt = "OfferReceived")]
    OfferReceived,
    #[display(fmt = "AnswerSent")]
    AnswerSent,
    #[display(fmt = "Stable")]
    Stable,
    #[display(fmt = "Closed")]
    Closed,
}

impl NegotiationState {
    /// Offers are taken only from a neutral state, which also allows renegotiation
    /// once a session is stable.
    pub fn accepts_offer(&self) -> bool {
        matches!(self, NegotiationState::New | NegotiationState::Stable)
    }

    pub fn accepts_answer(&self) -> bool {
        matches!(self, NegotiationState::OfferSent)
    }
}

/// Informational transport state of a session
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
pub enum IceState {
    #[default]
    #[display(fmt = "New")]
    New,
    #[display(fmt = "Checking")]
    Checking,
    #[display(fmt = "Connected")]
    Connected,
    #[display(fmt = "Disconnected")]
    Disconnected,
    #[display(fmt = "Failed")]
    Failed,
    #[display(fmt = "Closed")]
    Closed,
}

/// Read-only snapshot of one negotiation session
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub role: Role,
    pub state: NegotiationState,
    pub ice_state: IceState,
    pub outgoing: Vec<MediaKind>,
    pub remote_tracks: Vec<MediaKind>,
    pub ice_candidates_added: usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negotiation_windows() {
        use NegotiationState::*;
        for state in [New, Stable] {
            assert!(state.accepts_offer(), "{state}");
        }
        for state in [OfferSent, OfferReceived, AnswerSent, Closed] {
            assert!(!state.accepts_offer(), "{state}");
        }
        assert!(OfferSent.accepts_answer());
        for state in [New, OfferReceived, AnswerSent, Stable, Closed] {
            assert!(!state.accepts_answer(), "{state}");
        }
    }
}
