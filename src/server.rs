use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::directory::{LeaveOutcome, RoomDirectory};
use crate::error::{RelayError, RoomError, StoreError};
use crate::messages::{ClientMessage, CloseReason, ServerMessage};
use crate::polling::PollingService;
use crate::relay::{JoinRequest, Relay};
use crate::session::{Binding, MemorySessionRegistry, PeerSink, SessionRegistry};
use crate::store::{MemoryRoomStore, RoomStore};
use crate::sweeper::Sweeper;

enum Outgoing {
    Frame(Message),
    Close,
}

/// `PeerSink` for one WebSocket; frames go to the connection's writer task.
struct SocketSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl PeerSink for SocketSink {
    fn deliver(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.tx.send(Outgoing::Frame(Message::text(text))).is_ok(),
            Err(e) => {
                warn!("Failed to encode {:?}: {}", message, e);
                false
            }
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    clock: Arc<dyn Clock>,
    directory: Arc<RoomDirectory>,
    relay: Arc<Relay>,
    polling: Arc<PollingService>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RoomStore>,
        registry: Arc<dyn SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let directory = Arc::new(RoomDirectory::new(store, clock.clone(), config.room_ttl));
        let relay = Arc::new(Relay::new(directory.clone(), registry));
        let polling = Arc::new(PollingService::new(relay.clone(), directory.clone()));
        Server {
            config: Arc::new(config),
            clock,
            directory,
            relay,
            polling,
        }
    }

    /// Memory-backed store and registry on the system clock.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryRoomStore::new()),
            Arc::new(MemorySessionRegistry::new()),
            Arc::new(SystemClock),
        )
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.directory.init().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn polling(&self) -> &Arc<PollingService> {
        &self.polling
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.directory.clone(),
            self.relay.clone(),
            self.polling.clone(),
            self.clock.clone(),
            self.config.client_timeout,
            self.config.room_retention,
        )
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        Arc::new(self.sweeper()).spawn(self.config.sweep_interval)
    }

    /// Directory leave: the store is marked closed first, then anyone still
    /// connected is told the room is gone.
    pub async fn leave_room(
        &self,
        room_id: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<LeaveOutcome, RoomError> {
        let outcome = self.directory.leave_room(room_id, player_name).await?;
        if outcome.was_member {
            self.relay
                .teardown(&outcome.room.room_id, CloseReason::Left)
                .await;
        }
        Ok(outcome)
    }

    pub async fn session_count(&self) -> usize {
        self.relay.registry().session_count().await
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let connection_id = Uuid::new_v4();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn PeerSink> = Arc::new(SocketSink { tx });
        debug!("WebSocket {} opened", connection_id);

        let writer = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Frame(message) => {
                        if let Err(e) = ws_tx.send(message).await {
                            debug!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_tx.send(Message::close()).await;
                        break;
                    }
                }
            }
            let _ = ws_tx.close().await;
        });

        let mut binding: Option<Binding> = None;
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("WebSocket {} error: {}", connection_id, e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };

            let message = match serde_json::from_str::<ClientMessage>(text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Malformed frame on {}: {}", connection_id, e);
                    sink.deliver(&ServerMessage::error(RelayError::Malformed(e)));
                    continue;
                }
            };

            let leaving = matches!(message, ClientMessage::LeaveRoom);
            match (&binding, message) {
                (
                    None,
                    ClientMessage::JoinRoom {
                        room_id,
                        player_name,
                        ship_type,
                    },
                ) => {
                    let request = JoinRequest {
                        room_id,
                        player_name,
                        ship_type,
                    };
                    match self.relay.join(connection_id, request, sink.clone()).await {
                        Ok((bound, joined)) => {
                            sink.deliver(&joined.into());
                            binding = Some(bound);
                        }
                        Err(e) => {
                            sink.deliver(&ServerMessage::error(e));
                        }
                    }
                }
                (None, other) => {
                    sink.deliver(&ServerMessage::error(RelayError::NotJoined(other.kind())));
                }
                (Some(bound), message) => {
                    if let Err(e) = self.relay.handle(bound, message).await {
                        sink.deliver(&ServerMessage::error(e));
                    }
                }
            }

            if leaving && binding.is_some() {
                break;
            }
        }

        if let Some(bound) = &binding {
            self.relay.disconnect(bound).await;
        }
        sink.close();
        drop(sink);
        let _ = writer.await;
        info!("WebSocket {} closed", connection_id);
    }
}
