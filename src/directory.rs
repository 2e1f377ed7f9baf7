// Room lifecycle over a `RoomStore`. Overdue rooms expire lazily on read;
// every transition is a status-filtered update.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::clock::{to_millis, Clock, Millis};
use crate::error::{RoomError, StoreError};
use crate::messages::Role;
use crate::room::{
    clean_name, generate_room_code, names_match, normalize_room_code, Room, RoomStatus,
};
use crate::store::{RoomFilter, RoomStore, RoomUpdate};

pub const MAX_CODE_ATTEMPTS: usize = 32;

pub struct RoomDirectory {
    store: Arc<dyn RoomStore>,
    clock: Arc<dyn Clock>,
    ttl: Millis,
}

/// Result of a leave request.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room: Room,
    /// The player held a seat, so the live session has to be torn down.
    pub was_member: bool,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn RoomStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        RoomDirectory {
            store,
            clock,
            ttl: to_millis(ttl),
        }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.store.create_index().await
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    pub async fn create_room(&self, host_name: Option<&str>) -> Result<String, RoomError> {
        let host_name = clean_name(host_name).ok_or(RoomError::Validation("hostName is required"))?;

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_room_code(&mut rand::thread_rng());
            let room = Room::new(code.clone(), host_name.clone(), self.now(), self.ttl);
            match self.store.insert_one(room).await {
                Ok(()) => {
                    info!("Room {} created by {}", code, host_name);
                    return Ok(code);
                }
                Err(StoreError::DuplicateKey(_)) => {
                    debug!("Room code {} collided, regenerating", code);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RoomError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    pub async fn join_room(
        &self,
        room_id: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<Room, RoomError> {
        let room_id = require_room_id(room_id)?;
        let player_name =
            clean_name(player_name).ok_or(RoomError::Validation("playerName is required"))?;

        let room = self.read(&room_id).await?;
        check_open(&room)?;

        if names_match(&room.host_name, &player_name) {
            return Err(RoomError::HostAsGuest);
        }
        if room.status == RoomStatus::Full {
            // A retried join from the seated guest succeeds again.
            if room.role_of(&player_name) == Some(Role::Guest) {
                return Ok(room);
            }
            return Err(RoomError::Full);
        }

        let now = self.now();
        let update = RoomUpdate {
            status: Some(RoomStatus::Full),
            guest_name: Some(player_name.clone()),
            expires_at: Some(now.saturating_add(self.ttl)),
            guest_last_seen_at: Some(now),
            updated_at: Some(now),
            ..RoomUpdate::default()
        };
        let filter = RoomFilter::id(&room_id).with_statuses(&[RoomStatus::Waiting]);
        if let Some(room) = self.store.update_one(&filter, &update).await? {
            info!("{} joined room {} as guest", player_name, room_id);
            return Ok(room);
        }

        // Lost a race with another join or a close; report what won.
        let current = self.read(&room_id).await?;
        check_open(&current)?;
        if current.role_of(&player_name) == Some(Role::Guest) {
            Ok(current)
        } else {
            Err(RoomError::Full)
        }
    }

    /// Fetches a room in any status, flipping an overdue one to `expired`.
    pub async fn get_room(&self, room_id: Option<&str>) -> Result<Room, RoomError> {
        let room_id = require_room_id(room_id)?;
        self.read(&room_id).await
    }

    /// Fetches a room that can still be played in.
    pub async fn get_open_room(&self, room_id: &str) -> Result<Room, RoomError> {
        let room = self.read(&normalize_room_code(room_id)).await?;
        check_open(&room)?;
        Ok(room)
    }

    pub async fn leave_room(
        &self,
        room_id: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<LeaveOutcome, RoomError> {
        let room_id = require_room_id(room_id)?;
        let player_name =
            clean_name(player_name).ok_or(RoomError::Validation("playerName is required"))?;

        let room = self.read(&room_id).await?;
        if room.role_of(&player_name).is_none() {
            return Ok(LeaveOutcome {
                room,
                was_member: false,
            });
        }

        let room = self
            .close(&room_id, RoomStatus::Closed)
            .await?
            .unwrap_or(room);
        info!("{} left room {}", player_name, room_id);
        Ok(LeaveOutcome {
            room,
            was_member: true,
        })
    }

    /// Refreshes `expiresAt` and the role's last-seen stamp on an open room.
    pub async fn touch(&self, room_id: &str, role: Role) -> Result<Option<Room>, RoomError> {
        let now = self.now();
        let mut update = RoomUpdate {
            expires_at: Some(now.saturating_add(self.ttl)),
            updated_at: Some(now),
            ..RoomUpdate::default()
        };
        match role {
            Role::Host => update.host_last_seen_at = Some(now),
            Role::Guest => update.guest_last_seen_at = Some(now),
        }
        Ok(self
            .store
            .update_one(&RoomFilter::open(room_id), &update)
            .await?)
    }

    /// Moves an open room to a terminal status. Returns `None` when the room
    /// was already terminal (or missing).
    pub async fn close(
        &self,
        room_id: &str,
        status: RoomStatus,
    ) -> Result<Option<Room>, RoomError> {
        debug_assert!(status.is_terminal());
        let now = self.now();
        let update = RoomUpdate {
            status: Some(status),
            expires_at: (status == RoomStatus::Closed).then_some(now),
            updated_at: Some(now),
            ..RoomUpdate::default()
        };
        Ok(self
            .store
            .update_one(&RoomFilter::open(room_id), &update)
            .await?)
    }

    /// Marks every overdue open room as expired and returns their ids.
    pub async fn expire_due(&self) -> Result<Vec<String>, RoomError> {
        let due = self.store.find_due(self.now()).await?;
        let mut expired = Vec::with_capacity(due.len());
        for room in due {
            if self
                .close(&room.room_id, RoomStatus::Expired)
                .await?
                .is_some()
            {
                expired.push(room.room_id);
            }
        }
        Ok(expired)
    }

    /// Drops closed and expired rooms that have not changed for `retention`.
    pub async fn purge_finished(&self, retention: Duration) -> Result<Vec<String>, RoomError> {
        let cutoff = self.now().saturating_sub(to_millis(retention));
        Ok(self.store.delete_terminal_before(cutoff).await?)
    }

    pub async fn open_room_count(&self) -> Result<usize, RoomError> {
        Ok(self.store.count_open().await?)
    }

    async fn read(&self, room_id: &str) -> Result<Room, RoomError> {
        let room = self
            .store
            .find_one(room_id)
            .await?
            .ok_or(RoomError::NotFound)?;
        if !room.is_overdue(self.now()) {
            return Ok(room);
        }

        info!("Room {} expired on access", room_id);
        match self.close(room_id, RoomStatus::Expired).await? {
            Some(expired) => Ok(expired),
            None => self
                .store
                .find_one(room_id)
                .await?
                .ok_or(RoomError::NotFound),
        }
    }
}

fn require_room_id(room_id: Option<&str>) -> Result<String, RoomError> {
    let room_id = normalize_room_code(room_id.unwrap_or_default());
    if room_id.is_empty() {
        Err(RoomError::Validation("roomId is required"))
    } else {
        Ok(room_id)
    }
}

fn check_open(room: &Room) -> Result<(), RoomError> {
    match room.status {
        RoomStatus::Expired => Err(RoomError::Expired),
        RoomStatus::Closed => Err(RoomError::Closed),
        RoomStatus::Waiting | RoomStatus::Full => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::room::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
    use crate::store::MemoryRoomStore;
    use async_trait::async_trait;

    const TTL: Duration = Duration::from_secs(15 * 60);

    fn directory() -> (RoomDirectory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let directory = RoomDirectory::new(Arc::new(MemoryRoomStore::new()), clock.clone(), TTL);
        (directory, clock)
    }

    #[tokio::test]
    async fn create_room_mints_a_waiting_room() {
        let (directory, _clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();
        assert_eq!(room_id.len(), ROOM_CODE_LEN);
        assert!(room_id.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));

        let room = directory.get_room(Some(room_id.as_str())).await.unwrap();
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.guest_name, None);
        assert_eq!(room.host_name, "Ace");
    }

    #[tokio::test]
    async fn create_room_requires_a_name() {
        let (directory, _clock) = directory();
        for name in [None, Some(""), Some("   ")] {
            let err = directory.create_room(name).await.unwrap_err();
            assert!(matches!(err, RoomError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn join_fills_the_room_exactly_once() {
        let (directory, _clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();

        let err = directory
            .join_room(Some(room_id.as_str()), Some("Ace"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::HostAsGuest));
        let unchanged = directory.get_room(Some(room_id.as_str())).await.unwrap();
        assert_eq!(unchanged.status, RoomStatus::Waiting);

        let room = directory
            .join_room(Some(room_id.as_str()), Some("Rookie"))
            .await
            .unwrap();
        assert_eq!(room.status, RoomStatus::Full);
        assert_eq!(room.guest_name.as_deref(), Some("Rookie"));

        let err = directory
            .join_room(Some(room_id.as_str()), Some("Wingman"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Full));

        // Retrying the same join is harmless.
        let again = directory
            .join_room(Some(room_id.to_lowercase().as_str()), Some("rookie"))
            .await
            .unwrap();
        assert_eq!(again.guest_name.as_deref(), Some("Rookie"));
    }

    #[tokio::test]
    async fn join_bumps_expiry() {
        let (directory, clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();
        let created = directory.get_room(Some(room_id.as_str())).await.unwrap();

        clock.advance(Duration::from_secs(60));
        let joined = directory
            .join_room(Some(room_id.as_str()), Some("Rookie"))
            .await
            .unwrap();
        assert_eq!(joined.expires_at, created.expires_at + 60_000);
        assert_eq!(joined.guest_last_seen_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn touch_keeps_a_room_alive_past_its_first_deadline() {
        let (directory, clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();
        directory
            .join_room(Some(room_id.as_str()), Some("Rookie"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10 * 60));
        let host = directory.touch(&room_id, Role::Host).await.unwrap().unwrap();
        assert_eq!(host.expires_at, clock.now() + to_millis(TTL));
        assert_eq!(host.host_last_seen_at, Some(clock.now()));

        clock.advance(Duration::from_secs(60));
        let guest = directory.touch(&room_id, Role::Guest).await.unwrap().unwrap();
        assert_eq!(guest.guest_last_seen_at, Some(clock.now()));
        assert_eq!(guest.host_last_seen_at, host.host_last_seen_at);

        // Twenty minutes after creation, well past the first deadline.
        clock.advance(Duration::from_secs(9 * 60));
        let room = directory.get_room(Some(room_id.as_str())).await.unwrap();
        assert_eq!(room.status, RoomStatus::Full);
    }

    #[tokio::test]
    async fn touch_ignores_terminal_rooms() {
        let (directory, _clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();
        directory
            .leave_room(Some(room_id.as_str()), Some("Ace"))
            .await
            .unwrap();
        assert!(directory.touch(&room_id, Role::Host).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_drops_finished_rooms_after_retention() {
        let (directory, clock) = directory();
        let closed = directory.create_room(Some("Ace")).await.unwrap();
        let open = directory.create_room(Some("Bolt")).await.unwrap();
        directory
            .leave_room(Some(closed.as_str()), Some("Ace"))
            .await
            .unwrap();

        let retention = Duration::from_secs(3600);
        clock.advance(retention);
        assert!(directory.purge_finished(retention).await.unwrap().is_empty());

        clock.advance(Duration::from_millis(1));
        assert_eq!(directory.purge_finished(retention).await.unwrap(), vec![closed.clone()]);
        let err = directory.get_room(Some(closed.as_str())).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound));
        assert!(directory.get_room(Some(open.as_str())).await.is_ok());
    }

    #[tokio::test]
    async fn overdue_room_expires_on_read() {
        let (directory, clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();

        clock.advance(TTL + Duration::from_millis(1));
        let room = directory.get_room(Some(room_id.as_str())).await.unwrap();
        assert_eq!(room.status, RoomStatus::Expired);

        let err = directory
            .join_room(Some(room_id.as_str()), Some("Rookie"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Expired));
    }

    #[tokio::test]
    async fn leave_closes_for_members_only() {
        let (directory, _clock) = directory();
        let room_id = directory.create_room(Some("Ace")).await.unwrap();

        let outcome = directory
            .leave_room(Some(room_id.as_str()), Some("Stranger"))
            .await
            .unwrap();
        assert!(!outcome.was_member);
        assert_eq!(outcome.room.status, RoomStatus::Waiting);

        let outcome = directory
            .leave_room(Some(room_id.as_str()), Some("Ace"))
            .await
            .unwrap();
        assert!(outcome.was_member);
        assert_eq!(outcome.room.status, RoomStatus::Closed);
        assert_eq!(outcome.room.expires_at, directory.now());

        // Closed rooms never come back.
        let err = directory
            .join_room(Some(room_id.as_str()), Some("Rookie"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Closed));
        let again = directory
            .leave_room(Some(room_id.as_str()), Some("Ace"))
            .await
            .unwrap();
        assert_eq!(again.room.status, RoomStatus::Closed);
    }

    #[tokio::test]
    async fn leave_of_unknown_room_is_not_found() {
        let (directory, _clock) = directory();
        let err = directory
            .leave_room(Some("ZZZZ9999"), Some("Ace"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NotFound));
    }

    #[tokio::test]
    async fn expire_due_only_reports_fresh_transitions() {
        let (directory, clock) = directory();
        let stale = directory.create_room(Some("Ace")).await.unwrap();
        clock.advance(TTL / 2);
        let fresh = directory.create_room(Some("Bolt")).await.unwrap();
        clock.advance(TTL / 2 + Duration::from_millis(1));

        assert_eq!(directory.expire_due().await.unwrap(), vec![stale.clone()]);
        assert!(directory.expire_due().await.unwrap().is_empty());
        let fresh_room = directory.get_room(Some(fresh.as_str())).await.unwrap();
        assert_eq!(fresh_room.status, RoomStatus::Waiting);
    }

    /// A store whose ids are always taken.
    struct SaturatedStore;

    #[async_trait]
    impl RoomStore for SaturatedStore {
        async fn create_index(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_one(&self, _room_id: &str) -> Result<Option<Room>, StoreError> {
            Ok(None)
        }
        async fn insert_one(&self, room: Room) -> Result<(), StoreError> {
            Err(StoreError::DuplicateKey(room.room_id))
        }
        async fn update_one(
            &self,
            _filter: &RoomFilter,
            _update: &RoomUpdate,
        ) -> Result<Option<Room>, StoreError> {
            Ok(None)
        }
        async fn find_due(&self, _now: Millis) -> Result<Vec<Room>, StoreError> {
            Ok(Vec::new())
        }
        async fn count_open(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
        async fn delete_terminal_before(
            &self,
            _cutoff: Millis,
        ) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn code_allocation_gives_up_after_bounded_attempts() {
        let directory = RoomDirectory::new(
            Arc::new(SaturatedStore),
            Arc::new(ManualClock::new(0)),
            TTL,
        );
        let err = directory.create_room(Some("Ace")).await.unwrap_err();
        assert!(matches!(err, RoomError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS)));
    }
}
