//! JSON-over-WebSocket signaling client.
//!
//! Commands go out as `{"method": .., "params": ..}` text frames and events come back as
//! `{"event": .., "data": ..}`. The first frame after connecting is a `Welcome` that
//! carries the connection id the service assigned.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use meshroom::{
    error::Error,
    room::ConnectionId,
    signaling::{SignalCommand, SignalEvent, SignalEventStream, SignalingChannel},
    sync::{Mutex, RwLock},
};
use serde::Deserialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(tag = "event", content = "data")]
enum Control {
    #[serde(rename_all = "camelCase")]
    Welcome { connection_id: ConnectionId },
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct WsChannel {
    url: String,
    connection: Mutex<Option<Connection>>,
    connection_id: RwLock<Option<ConnectionId>>,
    events: broadcast::Sender<SignalEvent>,
}

impl WsChannel {
    pub fn new(url: impl Into<String>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            url: url.into(),
            connection: Mutex::new(None),
            connection_id: RwLock::new(None),
            events,
        }
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        log::info!("connecting to {}", self.url);
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::ChannelConnect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Control>(&text) {
                        Ok(Control::Welcome { connection_id }) => return Ok(connection_id),
                        Err(_) => log::debug!("ignoring frame before welcome: {text}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(Error::ChannelConnect(e.to_string())),
                }
            }
            Err(Error::ChannelConnect("closed before welcome".into()))
        })
        .await
        .map_err(|_| Error::ChannelConnect("no welcome from signaling service".into()))??;
        log::info!("connected as {welcome}");
        self.connection_id.write().replace(welcome);

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    log::error!("failed to write frame: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(e) => log::warn!("unrecognized frame ({e}): {text}"),
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("signaling service closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("signaling connection failed: {e}");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.connection.lock().replace(Connection { tx, reader, writer }) {
            previous.reader.abort();
            previous.writer.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|c| !c.reader.is_finished())
            .unwrap_or_default()
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.read().clone()
    }

    fn subscribe(&self) -> Result<SignalEventStream, Error> {
        let mut rx = self.events.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => log::warn!("signal stream lagged by {n} events"),
                };
            }
        };
        Ok(SignalEventStream(Box::pin(stream)))
    }

    async fn invoke(&self, command: SignalCommand) -> Result<(), Error> {
        let frame = serde_json::to_string(&command)?;
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(Error::ChannelClosed)?;
        connection
            .tx
            .send(Message::Text(frame))
            .map_err(|e| Error::FailedToSendSignal(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let connection = self.connection.lock().take();
        let Some(connection) = connection else {
            return Ok(());
        };
        let _ = connection.tx.send(Message::Close(None));
        drop(connection.tx);
        connection.reader.abort();
        if tokio::time::timeout(Duration::from_secs(2), connection.writer).await.is_err() {
            log::warn!("signaling connection did not close cleanly");
        }
        self.connection_id.write().take();
        log::info!("disconnected from {}", self.url);
        Ok(())
    }
}
