use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Millis;
use crate::room::Room;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tick of a player's state, exactly as the game loop sent it.
///
/// The relay never reshapes a snapshot: unknown keys and odd-typed values are
/// stored and forwarded untouched. The accessors read the fields the relay and
/// the mirror care about and return `None` when a key is missing or is not the
/// expected JSON type. Score, level and game-over only count from the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerSnapshot(Map<String, Value>);

impl PlayerSnapshot {
    pub fn at(x: f64, y: f64) -> Self {
        let mut snapshot = PlayerSnapshot::default();
        snapshot.set("x", x);
        snapshot.set("y", y);
        snapshot
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn x(&self) -> Option<f64> {
        self.number("x")
    }

    pub fn y(&self) -> Option<f64> {
        self.number("y")
    }

    pub fn angle(&self) -> Option<f64> {
        self.number("angle")
    }

    pub fn health(&self) -> Option<f64> {
        self.number("health")
    }

    pub fn score(&self) -> Option<f64> {
        self.number("score")
    }

    pub fn level(&self) -> Option<f64> {
        self.number("level")
    }

    pub fn game_over(&self) -> Option<bool> {
        self.0.get("gameOver").and_then(Value::as_bool)
    }

    pub fn ship_type(&self) -> Option<&str> {
        self.0.get("shipType").and_then(Value::as_str)
    }

    /// Writes the shared match progress into the snapshot.
    pub fn set_progress(&mut self, score: f64, level: f64, game_over: bool) {
        self.set("score", score);
        self.set("level", level);
        self.set("gameOver", game_over);
    }

    pub fn clear_progress(&mut self) {
        for key in ["score", "level", "gameOver"] {
            self.0.remove(key);
        }
    }
}

impl From<Map<String, Value>> for PlayerSnapshot {
    fn from(fields: Map<String, Value>) -> Self {
        PlayerSnapshot(fields)
    }
}

/// The last snapshot a role broadcast, stamped by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    #[serde(flatten)]
    pub state: PlayerSnapshot,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub updated_at: Millis,
}

pub type Players = BTreeMap<Role, PlayerRecord>;

/// The controls a player is holding, relayed verbatim. Clients send booleans
/// (`up`, `fire`, `dash`, ...) but any JSON is carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputFlags(Value);

impl InputFlags {
    /// `true` for a held control: JSON `true` or a non-zero number.
    pub fn is_pressed(&self, control: &str) -> bool {
        match self.0.get(control) {
            Some(Value::Bool(pressed)) => *pressed,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for InputFlags {
    fn from(value: Value) -> Self {
        InputFlags(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Left,
    Disconnected,
    Expired,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        player_name: String,
        #[serde(default)]
        ship_type: Option<String>,
    },
    Heartbeat,
    StateUpdate {
        state: PlayerSnapshot,
    },
    InputUpdate {
        #[serde(default)]
        input: InputFlags,
    },
    PlayerDied {
        #[serde(default)]
        reason: Option<String>,
    },
    LeaveRoom,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::StateUpdate { .. } => "state_update",
            ClientMessage::InputUpdate { .. } => "input_update",
            ClientMessage::PlayerDied { .. } => "player_died",
            ClientMessage::LeaveRoom => "leave_room",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    JoinedRoom {
        role: Role,
        room_id: String,
        host_name: String,
        guest_name: Option<String>,
        players: Players,
    },
    PeerJoined {
        role: Role,
        player_name: String,
        ship_type: Option<String>,
    },
    PeerState {
        from: Role,
        state: PlayerRecord,
    },
    PeerInput {
        from: Role,
        input: InputFlags,
    },
    ForceGameOver {
        reason: String,
    },
    RoomClosed {
        room_id: String,
        reason: CloseReason,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn error(error: impl fmt::Display) -> Self {
        ServerMessage::Error {
            error: error.to_string(),
        }
    }
}

// HTTP bodies. Every field is optional so that a missing one is reported as a
// 400 with a readable message instead of a body-parse rejection.

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub host_name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomMemberRequest {
    pub room_id: Option<String>,
    pub player_name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollJoinRequest {
    pub room_id: Option<String>,
    pub player_name: Option<String>,
    pub ship_type: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncRequest {
    pub room_id: Option<String>,
    pub player_name: Option<String>,
    pub messages: Vec<ClientMessage>,
}

/// Query string of `GET /poll/state`.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerStateQuery {
    pub room_id: Option<String>,
    pub player_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub success: bool,
    pub room_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    pub success: bool,
    pub room: Room,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomResponse {
    pub success: bool,
    pub status: crate::room::RoomStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollJoinResponse {
    pub success: bool,
    pub role: Role,
    pub room_id: String,
    pub host_name: String,
    pub guest_name: Option<String>,
    pub players: Players,
    pub peer_state: Option<PlayerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub peer_messages: Vec<ServerMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerStateResponse {
    pub success: bool,
    pub peer_state: Option<PlayerRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub success: bool,
    pub rooms: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl fmt::Display) -> Self {
        ErrorResponse {
            success: false,
            error: error.to_string(),
        }
    }
}
