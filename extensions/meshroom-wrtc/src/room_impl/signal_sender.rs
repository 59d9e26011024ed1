use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use meshroom::signaling::{SignalCommand, SignalingChannel};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Outbound signaling queue. Commands are handed to the channel by a background task
/// in the order they were queued, so the event loop never waits on a round trip.
pub struct SignalSender {
    ch: UnboundedSender<SignalCommand>,
    closed: Arc<AtomicBool>,
}

pub fn init(channel: Arc<dyn SignalingChannel>) -> SignalSender {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let closed2 = closed.clone();
    tokio::spawn(async move {
        run(channel, rx, closed2).await;
    });
    SignalSender { ch: tx, closed }
}

impl Drop for SignalSender {
    fn drop(&mut self) {
        self.close();
    }
}

impl SignalSender {
    pub fn send(&self, command: SignalCommand) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("signal sender is closed, dropping {command}");
        }
        self.ch.send(command)?;
        Ok(())
    }

    /// Stops sending. Commands still queued are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run(
    channel: Arc<dyn SignalingChannel>,
    mut rx: UnboundedReceiver<SignalCommand>,
    closed: Arc<AtomicBool>,
) {
    while let Some(command) = rx.recv().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match &command {
            SignalCommand::SendIceCandidate { target, .. } => {
                log::trace!("sending ice candidate to {target}")
            }
            other => log::debug!("sending {other}"),
        }
        if let Err(e) = channel.invoke(command).await {
            log::error!("failed to send signal: {e}");
        }
    }
    log::debug!("signal sender terminated");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::LoopbackHub;
    use std::time::Duration;

    #[tokio::test]
    async fn commands_keep_their_order() -> anyhow::Result<()> {
        let hub = LoopbackHub::new();
        let channel = Arc::new(hub.channel());
        channel.connect().await?;
        let id = channel.id().clone();
        let sender = init(channel);

        sender.send(SignalCommand::ToggleMute { is_muted: true })?;
        sender.send(SignalCommand::ShareScreen { is_sharing: true })?;
        sender.send(SignalCommand::ToggleMute { is_muted: false })?;

        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.sent_by(&id).len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        assert_eq!(
            hub.sent_by(&id),
            vec![
                SignalCommand::ToggleMute { is_muted: true },
                SignalCommand::ShareScreen { is_sharing: true },
                SignalCommand::ToggleMute { is_muted: false },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn closed_sender_rejects_commands() {
        let hub = LoopbackHub::new();
        let sender = init(Arc::new(hub.channel()));
        sender.close();
        assert!(sender.send(SignalCommand::LeaveRoom).is_err());
    }
}
