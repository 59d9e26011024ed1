use std::{future::Future, sync::Arc, time::Duration};

use meshroom::{
    config::MeshConfig,
    room::{ConnectionId, NegotiationState, Participant},
    signaling::SignalCommand,
};
use meshroom_wrtc::{
    host_media::StaticMediaDevices,
    loopback::{LoopbackChannel, LoopbackHub, LoopbackPeerFactory},
    RoomSession,
};

#[allow(dead_code)]
pub struct Client {
    pub session: RoomSession,
    pub channel: Arc<LoopbackChannel>,
    pub devices: Arc<StaticMediaDevices>,
    pub peers: Arc<LoopbackPeerFactory>,
}

impl Client {
    pub fn id(&self) -> &ConnectionId {
        self.channel.id()
    }
}

pub fn client(hub: &LoopbackHub) -> Client {
    client_with(hub, MeshConfig::development(), StaticMediaDevices::new())
}

#[allow(dead_code)]
pub fn client_with(hub: &LoopbackHub, config: MeshConfig, devices: StaticMediaDevices) -> Client {
    let channel = Arc::new(hub.channel());
    let devices = Arc::new(devices);
    let peers = Arc::new(LoopbackPeerFactory::new());
    let session = RoomSession::new(config, channel.clone(), devices.clone(), peers.clone());
    Client {
        session,
        channel,
        devices,
        peers,
    }
}

/// Joins everyone to `room_id` in order
#[allow(dead_code)]
pub async fn join_all(clients: &[&Client], room_id: &str) -> anyhow::Result<()> {
    for (i, client) in clients.iter().enumerate() {
        client.session.join(room_id, &format!("user-{i}")).await?;
    }
    Ok(())
}

/// Waits until `check` holds
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for {what}"))
}

pub async fn stable_sessions(session: &RoomSession) -> usize {
    session
        .sessions()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|s| s.state == NegotiationState::Stable)
        .count()
}

#[allow(dead_code)]
pub async fn participant(session: &RoomSession, id: &ConnectionId) -> Option<Participant> {
    session
        .participants()
        .await
        .unwrap_or_default()
        .into_iter()
        .find(|p| &p.connection_id == id)
}

#[allow(dead_code)]
pub fn sent<F>(hub: &LoopbackHub, id: &ConnectionId, pred: F) -> usize
where
    F: Fn(&SignalCommand) -> bool,
{
    hub.count_sent(id, pred)
}
