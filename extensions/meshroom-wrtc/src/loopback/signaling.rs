use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use meshroom::{
    error::Error,
    room::ConnectionId,
    signaling::{MemberInfo, SignalCommand, SignalEvent, SignalEventStream, SignalingChannel},
    sync::Mutex,
};
use tokio::sync::broadcast;

struct Client {
    events: broadcast::Sender<SignalEvent>,
    user_name: String,
    room: Option<String>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    clients: IndexMap<ConnectionId, Client>,
    sent: Vec<(ConnectionId, SignalCommand)>,
}

impl HubState {
    fn roommates(&self, room: &str, except: &ConnectionId) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|(id, c)| *id != except && c.room.as_deref() == Some(room))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn deliver(&self, to: &ConnectionId, event: SignalEvent) -> bool {
        match self.clients.get(to) {
            Some(client) => client.events.send(event).is_ok(),
            None => false,
        }
    }

    fn leave(&mut self, from: &ConnectionId) {
        let Some(client) = self.clients.get_mut(from) else {
            return;
        };
        let Some(room) = client.room.take() else {
            return;
        };
        let user_name = client.user_name.clone();
        for id in self.roommates(&room, from) {
            self.deliver(
                &id,
                SignalEvent::UserLeft {
                    connection_id: from.clone(),
                    user_name: user_name.clone(),
                },
            );
        }
    }

    fn broadcast_to_room(&self, from: &ConnectionId, event: SignalEvent) {
        let room = match self.clients.get(from).and_then(|c| c.room.clone()) {
            Some(room) => room,
            None => return,
        };
        for id in self.roommates(&room, from) {
            self.deliver(&id, event.clone());
        }
    }

    fn route(&mut self, from: &ConnectionId, command: SignalCommand) {
        self.sent.push((from.clone(), command.clone()));
        match command {
            SignalCommand::JoinRoom { room_id, user_name } => {
                if let Some(client) = self.clients.get_mut(from) {
                    client.room = Some(room_id.clone());
                    client.user_name = user_name.clone();
                }
                let all_users = self
                    .clients
                    .iter()
                    .filter(|(_, c)| c.room.as_deref() == Some(room_id.as_str()))
                    .map(|(id, c)| MemberInfo {
                        connection_id: id.clone(),
                        user_name: c.user_name.clone(),
                        is_self: id == from,
                    })
                    .collect();
                self.deliver(from, SignalEvent::RoomInfo { all_users });
                self.broadcast_to_room(
                    from,
                    SignalEvent::NewUserJoined(MemberInfo::new(from.clone(), user_name)),
                );
            }
            SignalCommand::LeaveRoom => self.leave(from),
            SignalCommand::SendOffer { target, offer } => {
                self.deliver(
                    &target,
                    SignalEvent::ReceiveOffer {
                        from_connection_id: from.clone(),
                        offer,
                    },
                );
            }
            SignalCommand::SendAnswer { target, answer } => {
                self.deliver(
                    &target,
                    SignalEvent::ReceiveAnswer {
                        from_connection_id: from.clone(),
                        answer,
                    },
                );
            }
            SignalCommand::SendIceCandidate { target, candidate } => {
                self.deliver(
                    &target,
                    SignalEvent::ReceiveIceCandidate {
                        from_connection_id: from.clone(),
                        candidate,
                    },
                );
            }
            SignalCommand::ToggleMute { is_muted } => {
                let user_name = self
                    .clients
                    .get(from)
                    .map(|c| c.user_name.clone())
                    .unwrap_or_default();
                self.broadcast_to_room(from, SignalEvent::UserMuteChanged { user_name, is_muted });
            }
            SignalCommand::ShareScreen { is_sharing } => {
                self.broadcast_to_room(
                    from,
                    SignalEvent::UserScreenSharing {
                        connection_id: from.clone(),
                        is_sharing,
                    },
                );
            }
            SignalCommand::ToggleVideo { is_enabled } => {
                self.broadcast_to_room(
                    from,
                    SignalEvent::UserVideoChanged {
                        connection_id: from.clone(),
                        is_enabled,
                    },
                );
            }
        }
    }
}

/// Routes commands between [`LoopbackChannel`]s and remembers every command it saw
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client. Its connection id is assigned immediately.
    pub fn channel(&self) -> LoopbackChannel {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = ConnectionId::new(format!("conn-{}", state.next_id));
        let (events, _rx) = broadcast::channel(1024);
        state.clients.insert(
            id.clone(),
            Client {
                events,
                user_name: String::new(),
                room: None,
            },
        );
        LoopbackChannel {
            hub: self.clone(),
            id,
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
        }
    }

    /// Pushes an event to one client as if the service had sent it
    pub fn deliver(&self, to: &ConnectionId, event: SignalEvent) -> bool {
        self.inner.lock().deliver(to, event)
    }

    pub fn sent(&self) -> Vec<(ConnectionId, SignalCommand)> {
        self.inner.lock().sent.clone()
    }

    pub fn sent_by(&self, id: &ConnectionId) -> Vec<SignalCommand> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn count_sent<F>(&self, id: &ConnectionId, pred: F) -> usize
    where
        F: Fn(&SignalCommand) -> bool,
    {
        self.sent_by(id).iter().filter(|cmd| pred(cmd)).count()
    }

    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .clients
            .iter()
            .filter(|(_, c)| c.room.as_deref() == Some(room_id))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub struct LoopbackChannel {
    hub: LoopbackHub,
    id: ConnectionId,
    connected: AtomicBool,
    refuse: AtomicBool,
}

impl LoopbackChannel {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// make `connect` fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ChannelConnect("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        Some(self.id.clone())
    }

    fn subscribe(&self) -> Result<SignalEventStream, Error> {
        let mut rx = match self.hub.inner.lock().clients.get(&self.id) {
            Some(client) => client.events.subscribe(),
            None => return Err(Error::ChannelClosed),
        };
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(SignalEventStream(Box::pin(stream)))
    }

    async fn invoke(&self, command: SignalCommand) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }
        log::trace!("{} -> {}", self.id, command);
        self.hub.inner.lock().route(&self.id, command);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.inner.lock().leave(&self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn join_announces_both_ways() -> anyhow::Result<()> {
        let hub = LoopbackHub::new();
        let a = hub.channel();
        let b = hub.channel();
        let mut a_events = a.subscribe()?;
        let mut b_events = b.subscribe()?;
        a.connect().await?;
        b.connect().await?;

        a.invoke(SignalCommand::JoinRoom {
            room_id: "R1".into(),
            user_name: "ana".into(),
        })
        .await?;
        b.invoke(SignalCommand::JoinRoom {
            room_id: "R1".into(),
            user_name: "bob".into(),
        })
        .await?;

        // a sees its own snapshot, then the newcomer
        assert!(matches!(a_events.next().await, Some(SignalEvent::RoomInfo { all_users }) if all_users.len() == 1));
        match a_events.next().await {
            Some(SignalEvent::NewUserJoined(member)) => assert_eq!(&member.connection_id, b.id()),
            other => anyhow::bail!("unexpected {other:?}"),
        }
        match b_events.next().await {
            Some(SignalEvent::RoomInfo { all_users }) => {
                assert_eq!(all_users.len(), 2);
                assert_eq!(all_users.iter().filter(|m| m.is_self).count(), 1);
            }
            other => anyhow::bail!("unexpected {other:?}"),
        }

        b.disconnect().await?;
        assert!(matches!(a_events.next().await, Some(SignalEvent::UserLeft { connection_id, .. }) if &connection_id == b.id()));
        assert_eq!(hub.members("R1"), vec![a.id().clone()]);
        Ok(())
    }

    #[tokio::test]
    async fn invoke_requires_connection() {
        let hub = LoopbackHub::new();
        let a = hub.channel();
        let err = a.invoke(SignalCommand::LeaveRoom).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));

        a.refuse_connections(true);
        assert!(matches!(a.connect().await, Err(Error::ChannelConnect(_))));
    }
}
