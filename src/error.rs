use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate room id {0}")]
    DuplicateKey(String),
    #[error("Room store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Room store data is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("Room not found")]
    NotFound,
    #[error("Room has expired")]
    Expired,
    #[error("Room is closed")]
    Closed,
    #[error("Room is full")]
    Full,
    #[error("Host cannot join their own room as guest")]
    HostAsGuest,
    #[error("Player is not part of this room")]
    NotMember,
    #[error("Could not allocate a room code after {0} attempts")]
    CodeSpaceExhausted(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RoomError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::Validation(_) => StatusCode::BAD_REQUEST,
            RoomError::NotFound => StatusCode::NOT_FOUND,
            RoomError::Expired | RoomError::Closed => StatusCode::GONE,
            RoomError::Full | RoomError::HostAsGuest => StatusCode::CONFLICT,
            RoomError::NotMember => StatusCode::FORBIDDEN,
            RoomError::CodeSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoomError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Join a room before sending {0}")]
    NotJoined(&'static str),
    #[error("Connection already joined room {0}")]
    AlreadyJoined(String),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Room(#[from] RoomError),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NotJoined(_) | RelayError::AlreadyJoined(_) => StatusCode::CONFLICT,
            RelayError::Malformed(_) => StatusCode::BAD_REQUEST,
            RelayError::Room(err) => err.status_code(),
        }
    }
}

/// Why a client adapter failed to connect, or why it stopped.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Timed out waiting for the server to confirm the room")]
    Timeout,
    #[error("Server rejected the join: {0}")]
    Rejected(String),
    #[error("Adapter is already connected")]
    AlreadyConnected,
    #[error("Server answered {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Connection closed before the room was joined")]
    Closed,
    #[error("WebSocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("HTTP failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unreadable server message: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl ClientError {
    /// Errors after which retrying the same room is pointless. A 409 means the
    /// seat was taken over by another connection.
    pub fn is_terminal(&self) -> bool {
        match self {
            ClientError::Api { status, .. } => matches!(status, 403 | 404 | 409 | 410),
            ClientError::Rejected(_) | ClientError::Closed => true,
            _ => false,
        }
    }
}
