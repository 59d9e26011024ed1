use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The two kinds of outgoing track every session carries
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// Where the outgoing video currently comes from
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
pub enum VideoSource {
    #[default]
    #[display(fmt = "Camera")]
    Camera,
    #[display(fmt = "Screen")]
    Screen,
}

/// Mirrors a capture track's `readyState`
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub enum TrackReadyState {
    #[display(fmt = "live")]
    Live,
    #[display(fmt = "ended")]
    Ended,
}
