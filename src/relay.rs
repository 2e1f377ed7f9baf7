// Protocol semantics shared by both transports. A transport calls `join`, then
// `handle` per message, then `disconnect`; replies leave through its `PeerSink`.

use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Millis;
use crate::directory::RoomDirectory;
use crate::error::{RelayError, RoomError};
use crate::messages::{
    ClientMessage, CloseReason, PlayerRecord, PlayerSnapshot, Players, Role,
    ServerMessage,
};
use crate::room::{clean_name, RoomStatus};
use crate::session::{Binding, ClientSlot, PeerSink, SessionRegistry};

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: String,
    pub player_name: String,
    pub ship_type: Option<String>,
}

/// What a seated connection learns about its room.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    pub role: Role,
    pub room_id: String,
    pub host_name: String,
    pub guest_name: Option<String>,
    pub players: Players,
}

impl From<JoinedRoom> for ServerMessage {
    fn from(joined: JoinedRoom) -> Self {
        ServerMessage::JoinedRoom {
            role: joined.role,
            room_id: joined.room_id,
            host_name: joined.host_name,
            guest_name: joined.guest_name,
            players: joined.players,
        }
    }
}

pub struct Relay {
    directory: Arc<RoomDirectory>,
    registry: Arc<dyn SessionRegistry>,
}

impl Relay {
    pub fn new(directory: Arc<RoomDirectory>, registry: Arc<dyn SessionRegistry>) -> Self {
        Relay {
            directory,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    /// Seats a connection in its room. Returns the binding to use for later
    /// messages and the room details for the `joined_room` reply, which the
    /// caller delivers.
    pub async fn join(
        &self,
        connection_id: Uuid,
        request: JoinRequest,
        sink: Arc<dyn PeerSink>,
    ) -> Result<(Binding, JoinedRoom), RelayError> {
        let player_name = clean_name(Some(&request.player_name))
            .ok_or(RoomError::Validation("playerName is required"))?;
        if request.room_id.trim().is_empty() {
            return Err(RoomError::Validation("roomId is required").into());
        }

        let room = self.directory.get_open_room(&request.room_id).await?;
        let role = room.role_of(&player_name).ok_or(RoomError::NotMember)?;
        let seated_name = room.name_of(role).unwrap_or(&player_name).to_string();

        let binding = Binding {
            room_id: room.room_id.clone(),
            role,
            player_name: seated_name.clone(),
            connection_id,
        };
        let slot = ClientSlot {
            connection_id,
            player_name: seated_name.clone(),
            ship_type: request.ship_type.clone(),
            last_seen: self.directory.now(),
            sink,
        };
        let outcome = self.registry.attach(&room.room_id, role, slot).await;

        if let Some(previous) = outcome.replaced {
            info!(
                "Replacing earlier {} connection in room {}",
                role, room.room_id
            );
            previous.deliver(&ServerMessage::error("Replaced by a newer connection"));
            previous.close();
        }

        // The room may have closed while we were seating the connection.
        let room = match self.directory.touch(&room.room_id, role).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                let error = self
                    .directory
                    .get_open_room(&room.room_id)
                    .await
                    .err()
                    .unwrap_or(RoomError::Closed);
                self.teardown(&room.room_id, CloseReason::Left).await;
                return Err(error.into());
            }
            Err(e) => {
                warn!("Could not refresh room {}: {}", room.room_id, e);
                room
            }
        };

        if let Some(peer) = outcome.peer {
            peer.deliver(&ServerMessage::PeerJoined {
                role,
                player_name: seated_name.clone(),
                ship_type: request.ship_type,
            });
        }

        info!("{} connected to room {} as {}", seated_name, room.room_id, role);
        let joined = JoinedRoom {
            role,
            room_id: room.room_id.clone(),
            host_name: room.host_name.clone(),
            guest_name: room.guest_name.clone(),
            players: outcome.players,
        };
        Ok((binding, joined))
    }

    /// Applies one message from an already-seated connection.
    pub async fn handle(&self, binding: &Binding, message: ClientMessage) -> Result<(), RelayError> {
        let kind = message.kind();
        let now = self.directory.now();
        if !self.registry.touch(binding, now).await {
            return Err(RelayError::NotJoined(kind));
        }
        debug!("{} from {} in room {}", kind, binding.role, binding.room_id);

        match message {
            ClientMessage::JoinRoom { .. } => {
                return Err(RelayError::AlreadyJoined(binding.room_id.clone()));
            }
            ClientMessage::Heartbeat => {
                if let Err(e) = self.directory.touch(&binding.room_id, binding.role).await {
                    warn!("Heartbeat refresh failed for room {}: {}", binding.room_id, e);
                }
            }
            ClientMessage::StateUpdate { state } => {
                let record = stamp(state, &binding.player_name, now);
                if !self.registry.record_state(binding, record.clone()).await {
                    return Err(RelayError::NotJoined(kind));
                }
                self.send_to_peer(
                    binding,
                    &ServerMessage::PeerState {
                        from: binding.role,
                        state: record,
                    },
                )
                .await;
            }
            ClientMessage::InputUpdate { input } => {
                self.send_to_peer(
                    binding,
                    &ServerMessage::PeerInput {
                        from: binding.role,
                        input,
                    },
                )
                .await;
            }
            ClientMessage::PlayerDied { reason } => {
                let reason = reason.unwrap_or_else(|| format!("{} was destroyed", binding.player_name));
                info!(
                    "{} died in room {}, ending the match",
                    binding.role, binding.room_id
                );
                let message = ServerMessage::ForceGameOver { reason };
                for member in self.registry.members(&binding.room_id).await {
                    member.deliver(&message);
                }
            }
            ClientMessage::LeaveRoom => {
                self.close_room(&binding.room_id, CloseReason::Left).await;
            }
        }
        Ok(())
    }

    /// Refreshes liveness for a seat without any other effect.
    pub async fn touch(&self, binding: &Binding) -> bool {
        self.registry.touch(binding, self.directory.now()).await
    }

    pub async fn players(&self, binding: &Binding) -> Option<Players> {
        if !self.registry.is_current(binding).await {
            return None;
        }
        self.registry.players(&binding.room_id).await
    }

    /// The connection behind `binding` went away. Only the connection that
    /// currently owns the seat can end the room.
    pub async fn disconnect(&self, binding: &Binding) {
        if self.registry.is_current(binding).await {
            info!(
                "{} disconnected from room {}",
                binding.player_name, binding.room_id
            );
            self.close_room(&binding.room_id, CloseReason::Disconnected)
                .await;
        }
    }

    /// Marks the room terminal in the store, then tears the session down.
    pub async fn close_room(&self, room_id: &str, reason: CloseReason) {
        let status = match reason {
            CloseReason::Expired => RoomStatus::Expired,
            CloseReason::Left | CloseReason::Disconnected => RoomStatus::Closed,
        };
        if let Err(e) = self.directory.close(room_id, status).await {
            warn!("Could not mark room {} {:?}: {}", room_id, status, e);
        }
        self.teardown(room_id, reason).await;
    }

    /// Removes the live session and notifies whoever is still connected.
    /// Returns `false` when there was no session.
    pub async fn teardown(&self, room_id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.registry.remove(room_id).await else {
            return false;
        };
        info!("Closing session for room {} ({:?})", room_id, reason);
        let message = ServerMessage::RoomClosed {
            room_id: room_id.to_string(),
            reason,
        };
        for slot in session.clients.values() {
            slot.sink.deliver(&message);
            slot.sink.close();
        }
        true
    }

    async fn send_to_peer(&self, binding: &Binding, message: &ServerMessage) {
        if let Some(peer) = self.registry.peer(binding).await {
            if !peer.deliver(message) {
                debug!(
                    "Peer of {} in room {} is gone",
                    binding.role, binding.room_id
                );
            }
        }
    }
}

fn stamp(mut state: PlayerSnapshot, player_name: &str, now: Millis) -> PlayerRecord {
    // The server owns these two fields.
    state.remove("playerName");
    state.remove("updatedAt");
    PlayerRecord {
        state,
        player_name: player_name.to_string(),
        updated_at: now,
    }
}
