//! Client side of the relay: one netplay interface over either transport.
//!
//! A game loop holds a [`Netplay`] and never cares which transport backs it.
//! [`WsNetplay`] keeps a WebSocket open; [`PollingNetplay`] falls back to the
//! HTTP sync/poll endpoints when sockets are unavailable.
//!
//! Handler contract: one handler per [`EventKind`]. Registering a second one
//! for the same kind replaces the first. `closed` fires at most once per
//! connection, and only when the transport ended without `disconnect()`.

pub mod handlers;
pub mod mirror;
pub mod polling;
pub mod ws;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::messages::{ClientMessage, PlayerRecord, Players, Role, ServerMessage};

pub use handlers::{EventKind, Handler, HandlerTable, PeerEvent};
pub use mirror::PeerMirror;
pub use polling::{HttpPollingApi, LocalPollingApi, PollingApi, PollingNetplay};
pub use ws::WsNetplay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub room_id: String,
    pub player_name: String,
    pub ship_type: Option<String>,
}

impl JoinParams {
    pub fn new(room_id: impl Into<String>, player_name: impl Into<String>) -> Self {
        JoinParams {
            room_id: room_id.into(),
            player_name: player_name.into(),
            ship_type: None,
        }
    }

    #[must_use]
    pub fn with_ship_type(mut self, ship_type: impl Into<String>) -> Self {
        self.ship_type = Some(ship_type.into());
        self
    }

    fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            player_name: self.player_name.clone(),
            ship_type: self.ship_type.clone(),
        }
    }
}

/// The server's confirmation that this client holds a seat.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResult {
    pub role: Role,
    pub room_id: String,
    pub host_name: String,
    pub guest_name: Option<String>,
    pub players: Players,
}

impl JoinResult {
    /// The other seat's last snapshot, if it has sent one.
    pub fn peer_state(&self) -> Option<&PlayerRecord> {
        self.players.get(&self.role.peer())
    }

    fn from_server(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::JoinedRoom {
                role,
                room_id,
                host_name,
                guest_name,
                players,
            } => Some(JoinResult {
                role,
                room_id,
                host_name,
                guest_name,
                players,
            }),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Netplay: Send + Sync {
    /// Resolves once the server confirms the seat. Fails on a protocol error,
    /// a transport failure, or when no confirmation arrives in time.
    async fn connect(&self, params: JoinParams) -> Result<JoinResult, ClientError>;

    /// Sets the handler for `kind`, replacing any earlier one.
    fn on(&self, kind: EventKind, handler: Handler);

    /// Queues a message for the server. Does nothing while disconnected.
    fn emit(&self, message: ClientMessage);

    /// Sends `leave_room` and closes the transport. Safe to call repeatedly,
    /// and before `connect`.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}
