use std::sync::atomic::{AtomicBool, Ordering};

use meshroom::signaling::{SignalCommand, SignalingChannel};

use crate::host_media::LocalMediaManager;

use super::{registry::PeerRegistry, router::SignalRouter, signal_sender::SignalSender};

/// Lets exactly one caller run the teardown
#[derive(Debug, Default)]
pub struct TeardownGuard {
    started: AtomicBool,
}

impl TeardownGuard {
    /// true for the first caller only
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub sessions_closed: usize,
    pub tracks_stopped: usize,
    pub events_discarded: usize,
    pub left_channel: bool,
}

/// Runs every step in order. A failing step is logged and the next one still runs.
pub async fn run(
    registry: &mut PeerRegistry,
    router: &mut SignalRouter,
    sender: &SignalSender,
    media: &LocalMediaManager,
    channel: &dyn SignalingChannel,
) -> TeardownReport {
    let sessions_closed = registry.close_all().await;
    let tracks_stopped = media.release();
    sender.close();
    let events_discarded = router.clear();
    let left_channel = leave_channel(channel).await;

    let report = TeardownReport {
        sessions_closed,
        tracks_stopped,
        events_discarded,
        left_channel,
    };
    log::info!("teardown complete: {report:?}");
    report
}

/// Teardown when the event loop is gone and only media and the channel remain
pub async fn run_detached(media: &LocalMediaManager, channel: &dyn SignalingChannel) -> TeardownReport {
    let report = TeardownReport {
        tracks_stopped: media.release(),
        left_channel: leave_channel(channel).await,
        ..Default::default()
    };
    log::info!("teardown complete: {report:?}");
    report
}

/// Says goodbye to the room and closes the channel. Skipped if it never connected.
pub async fn leave_channel(channel: &dyn SignalingChannel) -> bool {
    if !channel.is_connected() {
        log::debug!("signaling channel not connected, nothing to leave");
        return false;
    }
    if let Err(e) = channel.invoke(SignalCommand::LeaveRoom).await {
        log::error!("failed to send signal: {e}");
    }
    if let Err(e) = channel.disconnect().await {
        log::error!("failed to disconnect signaling channel: {e}");
    }
    true
}
