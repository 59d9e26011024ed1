//! Full-mesh audio/video rooms on top of [webrtc-rs](https://github.com/webrtc-rs/webrtc).
//!
//! [`RoomSession`] joins a room through a [`SignalingChannel`](meshroom::signaling::SignalingChannel)
//! and keeps one negotiation session per remote participant. Participants already in the
//! room always offer to newcomers and newcomers always answer, so two peers never offer
//! to each other at the same time.
//!
//! Local capture is owned by [`host_media::LocalMediaManager`]. Peer connections are
//! created through the [`simple_webrtc::PeerFactory`] seam, which is backed by webrtc-rs
//! in production and by [`loopback`] in tests.

pub mod host_media;
pub mod loopback;
pub mod simple_webrtc;

mod room_impl;

pub use room_impl::{LeaveTrigger, RoomSession};
