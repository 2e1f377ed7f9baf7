use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::messages::{CloseReason, InputFlags, PlayerRecord, Role, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerState,
    PeerInput,
    PeerJoined,
    ForceGameOver,
    RoomClosed,
    Closed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PeerState => "peer_state",
            EventKind::PeerInput => "peer_input",
            EventKind::PeerJoined => "peer_joined",
            EventKind::ForceGameOver => "force_game_over",
            EventKind::RoomClosed => "room_closed",
            EventKind::Closed => "closed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    PeerState {
        from: Role,
        state: PlayerRecord,
    },
    PeerInput {
        from: Role,
        input: InputFlags,
    },
    PeerJoined {
        role: Role,
        player_name: String,
        ship_type: Option<String>,
    },
    ForceGameOver {
        reason: String,
    },
    RoomClosed {
        room_id: String,
        reason: CloseReason,
    },
    /// The transport ended without `disconnect()` being called.
    Closed {
        reason: String,
    },
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::PeerState { .. } => EventKind::PeerState,
            PeerEvent::PeerInput { .. } => EventKind::PeerInput,
            PeerEvent::PeerJoined { .. } => EventKind::PeerJoined,
            PeerEvent::ForceGameOver { .. } => EventKind::ForceGameOver,
            PeerEvent::RoomClosed { .. } => EventKind::RoomClosed,
            PeerEvent::Closed { .. } => EventKind::Closed,
        }
    }

    /// `joined_room` and `error` are answers to the adapter itself and have
    /// no event.
    pub fn from_server(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::PeerState { from, state } => Some(PeerEvent::PeerState { from, state }),
            ServerMessage::PeerInput { from, input } => Some(PeerEvent::PeerInput { from, input }),
            ServerMessage::PeerJoined {
                role,
                player_name,
                ship_type,
            } => Some(PeerEvent::PeerJoined {
                role,
                player_name,
                ship_type,
            }),
            ServerMessage::ForceGameOver { reason } => Some(PeerEvent::ForceGameOver { reason }),
            ServerMessage::RoomClosed { room_id, reason } => {
                Some(PeerEvent::RoomClosed { room_id, reason })
            }
            ServerMessage::JoinedRoom { .. } | ServerMessage::Error { .. } => None,
        }
    }
}

pub type Handler = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// One handler slot per event kind, plus the once-only latch for `closed`.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<EventKind, Handler>>,
    closed_latch: AtomicBool,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: EventKind, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn dispatch(&self, event: &PeerEvent) {
        // Clone out so a handler may call `set` without deadlocking.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&event.kind())
            .cloned();
        match handler {
            Some(handler) => handler(event),
            None => debug!("No handler for {}", event.kind()),
        }
    }

    /// Fires `closed` unless it already fired or was suppressed. Returns
    /// whether it fired.
    pub fn fire_closed(&self, reason: impl Into<String>) -> bool {
        if self.closed_latch.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.dispatch(&PeerEvent::Closed {
            reason: reason.into(),
        });
        true
    }

    /// Used by `disconnect()`: the caller already knows the session is over.
    pub fn suppress_closed(&self) {
        self.closed_latch.store(true, Ordering::Release);
    }

    /// Re-arms `closed` for a new connection.
    pub fn rearm(&self) {
        self.closed_latch.store(false, Ordering::Release);
    }
}
