//! Room relay for two-player co-op matches.
//!
//! A host creates a room and gets a short code; a guest joins with the code.
//! Both then attach to a live session, over a WebSocket or the HTTP polling
//! fallback, and the relay forwards state snapshots, inputs, and match-ending
//! events between them until either leaves or goes silent.
//!
//! The [`client`] module holds the matching netplay adapters.

pub mod client;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod messages;
pub mod polling;
pub mod relay;
pub mod room;
pub mod routes;
pub mod server;
pub mod session;
pub mod store;
pub mod sweeper;

pub use config::{NetplayConfig, ServerConfig};
pub use error::{ClientError, RelayError, RoomError, StoreError};
pub use server::Server;
