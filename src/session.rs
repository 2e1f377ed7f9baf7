// Live sessions: which connection holds each seat of a room, and the last
// snapshot each seat broadcast. A cache of who is connected, not of what exists.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Millis;
use crate::messages::{PlayerRecord, Players, Role, ServerMessage};

/// Where the relay drops messages for one connected client. The WebSocket
/// transport forwards them to a socket; the polling transport queues them
/// until the next sync.
pub trait PeerSink: Send + Sync {
    /// Returns `false` when the endpoint is gone.
    fn deliver(&self, message: &ServerMessage) -> bool;
    fn close(&self);
}

/// A connection's claim on a seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub role: Role,
    pub player_name: String,
    pub connection_id: Uuid,
}

pub struct ClientSlot {
    pub connection_id: Uuid,
    pub player_name: String,
    pub ship_type: Option<String>,
    pub last_seen: Millis,
    pub sink: Arc<dyn PeerSink>,
}

pub struct LiveSession {
    pub room_id: String,
    pub clients: BTreeMap<Role, ClientSlot>,
    pub players: Players,
}

impl LiveSession {
    fn new(room_id: String) -> Self {
        LiveSession {
            room_id,
            clients: BTreeMap::new(),
            players: Players::new(),
        }
    }

    fn owns(&self, binding: &Binding) -> bool {
        self.clients
            .get(&binding.role)
            .is_some_and(|slot| slot.connection_id == binding.connection_id)
    }

    fn is_stale(&self, now: Millis, timeout: Millis) -> bool {
        self.clients
            .values()
            .any(|slot| now.saturating_sub(slot.last_seen) > timeout)
    }
}

pub struct AttachOutcome {
    /// Snapshots already recorded for the room.
    pub players: Players,
    /// The other seat's connection, if someone sits there.
    pub peer: Option<Arc<dyn PeerSink>>,
    /// A previous connection for the same seat that was pushed out.
    pub replaced: Option<Arc<dyn PeerSink>>,
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Seats a connection, creating the session on first attach.
    async fn attach(&self, room_id: &str, role: Role, slot: ClientSlot) -> AttachOutcome;

    /// Refreshes the seat's last-seen stamp. `false` when the binding is stale.
    async fn touch(&self, binding: &Binding, now: Millis) -> bool;

    /// Stores the seat's latest snapshot. `false` when the binding is stale.
    async fn record_state(&self, binding: &Binding, record: PlayerRecord) -> bool;

    /// The other seat's connection, if the binding is current and it is occupied.
    async fn peer(&self, binding: &Binding) -> Option<Arc<dyn PeerSink>>;

    async fn is_current(&self, binding: &Binding) -> bool;

    async fn members(&self, room_id: &str) -> Vec<Arc<dyn PeerSink>>;

    async fn players(&self, room_id: &str) -> Option<Players>;

    async fn remove(&self, room_id: &str) -> Option<LiveSession>;

    /// Rooms where some seat has been silent for longer than `timeout`.
    async fn stale_rooms(&self, now: Millis, timeout: Millis) -> Vec<String>;

    async fn session_count(&self) -> usize;
}

#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: RwLock<HashMap<String, LiveSession>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn attach(&self, room_id: &str, role: Role, slot: ClientSlot) -> AttachOutcome {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(room_id.to_string())
            .or_insert_with(|| LiveSession::new(room_id.to_string()));

        let replaced = session
            .clients
            .insert(role, slot)
            .map(|previous| previous.sink);
        AttachOutcome {
            players: session.players.clone(),
            peer: session
                .clients
                .get(&role.peer())
                .map(|peer| Arc::clone(&peer.sink)),
            replaced,
        }
    }

    async fn touch(&self, binding: &Binding, now: Millis) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions
            .get_mut(&binding.room_id)
            .and_then(|session| session.clients.get_mut(&binding.role))
        {
            Some(slot) if slot.connection_id == binding.connection_id => {
                slot.last_seen = now;
                true
            }
            _ => false,
        }
    }

    async fn record_state(&self, binding: &Binding, record: PlayerRecord) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&binding.room_id) {
            Some(session) if session.owns(binding) => {
                session.players.insert(binding.role, record);
                true
            }
            _ => false,
        }
    }

    async fn peer(&self, binding: &Binding) -> Option<Arc<dyn PeerSink>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&binding.room_id).filter(|s| s.owns(binding))?;
        session
            .clients
            .get(&binding.role.peer())
            .map(|slot| Arc::clone(&slot.sink))
    }

    async fn is_current(&self, binding: &Binding) -> bool {
        self.sessions
            .read()
            .await
            .get(&binding.room_id)
            .is_some_and(|session| session.owns(binding))
    }

    async fn members(&self, room_id: &str) -> Vec<Arc<dyn PeerSink>> {
        self.sessions
            .read()
            .await
            .get(room_id)
            .map(|session| {
                session
                    .clients
                    .values()
                    .map(|slot| Arc::clone(&slot.sink))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn players(&self, room_id: &str) -> Option<Players> {
        self.sessions
            .read()
            .await
            .get(room_id)
            .map(|session| session.players.clone())
    }

    async fn remove(&self, room_id: &str) -> Option<LiveSession> {
        self.sessions.write().await.remove(room_id)
    }

    async fn stale_rooms(&self, now: Millis, timeout: Millis) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.is_stale(now, timeout))
            .map(|session| session.room_id.clone())
            .collect()
    }

    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
