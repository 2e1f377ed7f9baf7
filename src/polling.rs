// Server side of the polling transport: each seat's `Mailbox` is its
// `PeerSink`, drained by the next sync.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{to_millis, Millis};
use crate::config::HEARTBEAT_INTERVAL;
use crate::directory::RoomDirectory;
use crate::error::{RelayError, RoomError};
use crate::messages::{
    PeerStateResponse, PlayerRecord, PollJoinRequest, PollJoinResponse, Role,
    ServerMessage, SyncRequest, SyncResponse,
};
use crate::relay::{JoinRequest, Relay};
use crate::room::{clean_name, normalize_room_code, RoomStatus};
use crate::session::{Binding, PeerSink};

pub const MAILBOX_CAPACITY: usize = 512;

type Digest32 = [u8; 32];

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<ServerMessage>,
    closed: bool,
    last_peer_digest: Option<Digest32>,
    last_store_touch: Millis,
    last_access: Millis,
}

pub struct Mailbox {
    binding: Binding,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    fn new(binding: Binding, now: Millis) -> Self {
        Mailbox {
            binding,
            state: Mutex::new(MailboxState {
                last_store_touch: now,
                last_access: now,
                ..MailboxState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        // A poisoned queue is still a valid queue.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn drain(&self, now: Millis) -> (Vec<ServerMessage>, bool) {
        let mut state = self.lock();
        state.last_access = now;
        (state.queue.drain(..).collect(), state.closed)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Records `record` as seen; `true` when it differs from the last one.
    fn observe_peer(&self, record: Option<&PlayerRecord>) -> bool {
        let digest = record.map(digest_record);
        let mut state = self.lock();
        if state.last_peer_digest == digest {
            return false;
        }
        state.last_peer_digest = digest;
        true
    }

    fn should_touch_store(&self, now: Millis, every: Millis) -> bool {
        let mut state = self.lock();
        state.last_access = now;
        if now.saturating_sub(state.last_store_touch) >= every {
            state.last_store_touch = now;
            true
        } else {
            false
        }
    }
}

impl PeerSink for Mailbox {
    fn deliver(&self, message: &ServerMessage) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        match message {
            ServerMessage::PeerState { .. } => state
                .queue
                .retain(|queued| !matches!(queued, ServerMessage::PeerState { .. })),
            ServerMessage::PeerInput { .. } => state
                .queue
                .retain(|queued| !matches!(queued, ServerMessage::PeerInput { .. })),
            _ => {}
        }
        if state.queue.len() >= MAILBOX_CAPACITY {
            state.queue.pop_front();
        }
        state.queue.push_back(message.clone());
        true
    }

    fn close(&self) {
        self.lock().closed = true;
    }
}

fn digest_record(record: &PlayerRecord) -> Digest32 {
    let mut hasher = Sha256::new();
    // The server stamp changes on every resend; only the content counts.
    if let Ok(bytes) = serde_json::to_vec(&record.state) {
        hasher.update(bytes);
    }
    hasher.update(record.player_name.as_bytes());
    hasher.finalize().into()
}

pub struct PollingService {
    relay: Arc<Relay>,
    directory: Arc<RoomDirectory>,
    mailboxes: RwLock<HashMap<(String, Role), Arc<Mailbox>>>,
    store_touch_every: Millis,
}

impl PollingService {
    pub fn new(relay: Arc<Relay>, directory: Arc<RoomDirectory>) -> Self {
        PollingService {
            relay,
            directory,
            mailboxes: RwLock::new(HashMap::new()),
            store_touch_every: to_millis(HEARTBEAT_INTERVAL),
        }
    }

    pub async fn join(&self, request: PollJoinRequest) -> Result<PollJoinResponse, RelayError> {
        let room_id = request
            .room_id
            .as_deref()
            .map(normalize_room_code)
            .filter(|id| !id.is_empty())
            .ok_or(RoomError::Validation("roomId is required"))?;
        let player_name = clean_name(request.player_name.as_deref())
            .ok_or(RoomError::Validation("playerName is required"))?;

        let connection_id = Uuid::new_v4();
        let room = self.directory.get_open_room(&room_id).await?;
        let role = room.role_of(&player_name).ok_or(RoomError::NotMember)?;
        let mailbox = Arc::new(Mailbox::new(
            Binding {
                room_id: room.room_id.clone(),
                role,
                player_name: room.name_of(role).unwrap_or(&player_name).to_string(),
                connection_id,
            },
            self.directory.now(),
        ));

        let (binding, joined) = self
            .relay
            .join(
                connection_id,
                JoinRequest {
                    room_id,
                    player_name,
                    ship_type: request.ship_type,
                },
                mailbox.clone(),
            )
            .await?;

        let peer_state = joined.players.get(&joined.role.peer()).cloned();
        mailbox.observe_peer(peer_state.as_ref());

        self.mailboxes
            .write()
            .await
            .insert((binding.room_id.clone(), binding.role), mailbox);
        info!(
            "{} joined room {} over polling",
            binding.player_name, joined.room_id
        );

        Ok(PollJoinResponse {
            success: true,
            role: joined.role,
            room_id: joined.room_id,
            host_name: joined.host_name,
            guest_name: joined.guest_name,
            players: joined.players,
            peer_state,
        })
    }

    /// Folds the client's outgoing batch into the session and returns what
    /// queued for it since the last sync.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, RelayError> {
        let mailbox = self
            .resolve(request.room_id.as_deref(), request.player_name.as_deref())
            .await?;
        let binding = &mailbox.binding;
        let now = self.directory.now();

        if !mailbox.is_closed() {
            self.refresh(&mailbox, now).await;
            for message in request.messages {
                if mailbox.is_closed() {
                    debug!("Dropping {} after room {} closed", message.kind(), binding.room_id);
                    continue;
                }
                match self.relay.handle(binding, message).await {
                    Ok(()) => {}
                    Err(RelayError::NotJoined(_)) => {
                        // Pushed out by a newer join for the same seat.
                        mailbox.deliver(&ServerMessage::error("Replaced by a newer connection"));
                        mailbox.close();
                    }
                    Err(e) => {
                        mailbox.deliver(&ServerMessage::error(&e));
                    }
                }
            }
        }

        let (peer_messages, closed) = mailbox.drain(now);
        if closed {
            self.forget(&mailbox).await;
        }
        Ok(SyncResponse {
            success: true,
            peer_messages,
        })
    }

    /// The peer's last snapshot, or `None` when it has not changed since this
    /// client last saw it.
    pub async fn peer_state(
        &self,
        room_id: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<PeerStateResponse, RelayError> {
        let mailbox = self.resolve(room_id, player_name).await?;
        let now = self.directory.now();
        if mailbox.is_closed() {
            return Ok(PeerStateResponse {
                success: true,
                peer_state: None,
            });
        }
        self.refresh(&mailbox, now).await;

        let binding = &mailbox.binding;
        let record = self
            .relay
            .players(binding)
            .await
            .and_then(|mut players| players.remove(&binding.role.peer()));
        let peer_state = if mailbox.observe_peer(record.as_ref()) {
            record
        } else {
            None
        };
        Ok(PeerStateResponse {
            success: true,
            peer_state,
        })
    }

    /// Drops mailboxes that were closed and never drained.
    pub async fn prune(&self, now: Millis, idle: Millis) -> usize {
        let mut mailboxes = self.mailboxes.write().await;
        let before = mailboxes.len();
        mailboxes.retain(|_, mailbox| {
            let state = mailbox.lock();
            !(state.closed && now.saturating_sub(state.last_access) > idle)
        });
        before - mailboxes.len()
    }

    pub async fn mailbox_count(&self) -> usize {
        self.mailboxes.read().await.len()
    }

    async fn resolve(
        &self,
        room_id: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<Arc<Mailbox>, RelayError> {
        let room = self.directory.get_room(room_id).await?;
        let player_name = clean_name(player_name)
            .ok_or(RoomError::Validation("playerName is required"))?;
        let role = room.role_of(&player_name).ok_or(RoomError::NotMember)?;

        let mailbox = self
            .mailboxes
            .read()
            .await
            .get(&(room.room_id.clone(), role))
            .cloned();
        match (mailbox, room.status) {
            (Some(mailbox), _) => Ok(mailbox),
            (None, RoomStatus::Expired) => Err(RoomError::Expired.into()),
            (None, RoomStatus::Closed) => Err(RoomError::Closed.into()),
            (None, RoomStatus::Waiting | RoomStatus::Full) => Err(RelayError::NotJoined("sync")),
        }
    }

    async fn refresh(&self, mailbox: &Mailbox, now: Millis) {
        let binding = &mailbox.binding;
        if !self.relay.touch(binding).await {
            return;
        }
        if mailbox.should_touch_store(now, self.store_touch_every) {
            if let Err(e) = self.directory.touch(&binding.room_id, binding.role).await {
                warn!("Could not refresh room {}: {}", binding.room_id, e);
            }
        }
    }

    async fn forget(&self, mailbox: &Arc<Mailbox>) {
        let key = (mailbox.binding.room_id.clone(), mailbox.binding.role);
        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, mailbox))
        {
            mailboxes.remove(&key);
        }
    }
}
