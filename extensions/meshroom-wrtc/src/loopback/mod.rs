//! In-process stand-ins for the network: a room hub that routes signaling between
//! channels the way the room service does, and peers that negotiate with synthetic SDP.
//! Useful for running several [`RoomSession`](crate::RoomSession)s in one process.

mod peer;
mod signaling;

pub use peer::{LoopbackPeer, LoopbackPeerFactory};
pub use signaling::{LoopbackChannel, LoopbackHub};
