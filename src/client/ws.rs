use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::handlers::{EventKind, Handler, HandlerTable, PeerEvent};
use super::{JoinParams, JoinResult, Netplay};
use crate::config::NetplayConfig;
use crate::error::ClientError;
use crate::messages::{ClientMessage, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Link {
    tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Netplay over one WebSocket to the relay's `/ws` endpoint.
pub struct WsNetplay {
    config: NetplayConfig,
    handlers: Arc<HandlerTable>,
    link: Mutex<Option<Link>>,
}

impl WsNetplay {
    pub fn new(config: NetplayConfig) -> Self {
        WsNetplay {
            config,
            handlers: Arc::new(HandlerTable::new()),
            link: Mutex::new(None),
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn send(&self, message: &ClientMessage) {
        let link = self.link();
        let Some(link) = link.as_ref().filter(|l| l.connected.load(Ordering::Acquire)) else {
            return;
        };
        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = link.tx.send(Message::text(text));
            }
            Err(e) => warn!("Failed to encode {}: {}", message.kind(), e),
        }
    }
}

#[async_trait]
impl Netplay for WsNetplay {
    async fn connect(&self, params: JoinParams) -> Result<JoinResult, ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        let url = self.config.websocket_url();
        debug!("Connecting to {}", url);

        let Handshake {
            mut sink,
            mut stream,
            joined,
            early,
        } = timeout(self.config.connect_timeout, handshake(&url, &params))
            .await
            .map_err(|_| ClientError::Timeout)??;
        info!(
            "Joined room {} as {} over WebSocket",
            joined.room_id, joined.role
        );

        self.handlers.rearm();
        for event in &early {
            self.handlers.dispatch(event);
        }
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("WebSocket send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let heartbeat = {
            let tx = tx.clone();
            let every = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Ok(text) = serde_json::to_string(&ClientMessage::Heartbeat) else {
                        break;
                    };
                    if tx.send(Message::text(text)).is_err() {
                        break;
                    }
                }
            })
        };

        let reader = {
            let handlers = self.handlers.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                let reason = read_events(&mut stream, &handlers).await;
                // `disconnect()` clears the flag first, which keeps this quiet.
                if connected.swap(false, Ordering::AcqRel) {
                    info!("WebSocket session ended: {}", reason);
                    handlers.fire_closed(reason);
                }
            })
        };

        let previous = self.link().replace(Link {
            tx,
            connected,
            writer,
            reader,
            heartbeat,
        });
        if let Some(previous) = previous {
            previous.writer.abort();
            previous.reader.abort();
            previous.heartbeat.abort();
        }
        Ok(joined)
    }

    fn on(&self, kind: EventKind, handler: Handler) {
        self.handlers.set(kind, handler);
    }

    fn emit(&self, message: ClientMessage) {
        self.send(&message);
    }

    async fn disconnect(&self) {
        let link = self.link().take();
        let Some(link) = link else {
            return;
        };
        let was_connected = link.connected.swap(false, Ordering::AcqRel);
        self.handlers.suppress_closed();
        link.heartbeat.abort();
        link.reader.abort();

        if was_connected {
            if let Ok(text) = serde_json::to_string(&ClientMessage::LeaveRoom) {
                let _ = link.tx.send(Message::text(text));
            }
            let _ = link.tx.send(Message::Close(None));
        }
        drop(link.tx);
        let mut writer = link.writer;
        if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        debug!("WebSocket adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        self.link()
            .as_ref()
            .is_some_and(|link| link.connected.load(Ordering::Acquire))
    }
}

struct Handshake {
    sink: SplitSink<Socket, Message>,
    stream: SplitStream<Socket>,
    joined: JoinResult,
    /// Peer traffic that overtook `joined_room`.
    early: Vec<PeerEvent>,
}

/// Opens the socket, sends `join_room`, and waits for the seat confirmation.
async fn handshake(url: &str, params: &JoinParams) -> Result<Handshake, ClientError> {
    let (socket, _) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();
    sink.send(Message::text(serde_json::to_string(&params.join_message())?))
        .await?;

    let mut early = Vec::new();
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ServerMessage>(text.as_str())? {
            ServerMessage::Error { error } => return Err(ClientError::Rejected(error)),
            message @ ServerMessage::JoinedRoom { .. } => {
                if let Some(joined) = JoinResult::from_server(message) {
                    return Ok(Handshake {
                        sink,
                        stream,
                        joined,
                        early,
                    });
                }
            }
            message => early.extend(PeerEvent::from_server(message)),
        }
    }
    Err(ClientError::Closed)
}

/// Dispatches server messages until the socket ends; returns why it ended.
async fn read_events(stream: &mut SplitStream<Socket>, handlers: &HandlerTable) -> String {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return "connection closed by server".to_string(),
            Ok(_) => continue,
            Err(e) => return format!("connection lost: {e}"),
        };
        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::Error { error }) => warn!("Relay reported: {}", error),
            Ok(message) => {
                if let Some(event) = PeerEvent::from_server(message) {
                    handlers.dispatch(&event);
                }
            }
            Err(e) => warn!("Unreadable server message: {}", e),
        }
    }
    "connection closed".to_string()
}
