//! Shared contracts for full-mesh audio/video rooms.
//!
//! This crate carries no WebRTC machinery. It describes who is in a room ([`room`]),
//! what travels over the signaling channel ([`signaling`]), how the orchestrator is
//! tuned ([`config`]) and what can go wrong ([`error`]). Implementations live in the
//! extension crates.

pub mod sync {
    pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
    pub use std::sync::Arc;
}

pub mod config;
pub mod directory;
pub mod error;
pub mod media;
pub mod room;
pub mod signaling;
