use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Millis;
use crate::error::StoreError;
use crate::room::{Room, RoomStatus};

/// Which document an update applies to. An update only lands when the room's
/// current status is one of `statuses` (any status when empty).
#[derive(Debug, Clone)]
pub struct RoomFilter {
    pub room_id: String,
    pub statuses: Vec<RoomStatus>,
}

impl RoomFilter {
    pub fn id(room_id: impl Into<String>) -> Self {
        RoomFilter {
            room_id: room_id.into(),
            statuses: Vec::new(),
        }
    }

    pub fn open(room_id: impl Into<String>) -> Self {
        Self::id(room_id).with_statuses(&RoomStatus::OPEN)
    }

    #[must_use]
    pub fn with_statuses(mut self, statuses: &[RoomStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    fn matches(&self, room: &Room) -> bool {
        room.room_id == self.room_id
            && (self.statuses.is_empty() || self.statuses.contains(&room.status))
    }
}

/// `$set`-style partial update; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct RoomUpdate {
    pub status: Option<RoomStatus>,
    pub guest_name: Option<String>,
    pub expires_at: Option<Millis>,
    pub host_last_seen_at: Option<Millis>,
    pub guest_last_seen_at: Option<Millis>,
    pub updated_at: Option<Millis>,
}

impl RoomUpdate {
    fn apply(&self, room: &mut Room) {
        if let Some(status) = self.status {
            room.status = status;
        }
        if let Some(guest_name) = &self.guest_name {
            room.guest_name = Some(guest_name.clone());
        }
        if let Some(expires_at) = self.expires_at {
            room.expires_at = expires_at;
        }
        if let Some(at) = self.host_last_seen_at {
            room.host_last_seen_at = Some(at);
        }
        if let Some(at) = self.guest_last_seen_at {
            room.guest_last_seen_at = Some(at);
        }
        if let Some(at) = self.updated_at {
            room.updated_at = at;
        }
    }
}

/// Document-store port behind the room directory.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Declares the unique index on `roomId`. Stores that enforce uniqueness
    /// natively may treat this as a no-op.
    async fn create_index(&self) -> Result<(), StoreError>;

    async fn find_one(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Fails with `DuplicateKey` when the room id is taken.
    async fn insert_one(&self, room: Room) -> Result<(), StoreError>;

    /// Applies `update` to the matching room and returns it as updated, or
    /// `None` when nothing matched.
    async fn update_one(
        &self,
        filter: &RoomFilter,
        update: &RoomUpdate,
    ) -> Result<Option<Room>, StoreError>;

    /// Open rooms whose `expiresAt` is before `now`.
    async fn find_due(&self, now: Millis) -> Result<Vec<Room>, StoreError>;

    async fn count_open(&self) -> Result<usize, StoreError>;

    /// Removes closed or expired rooms last updated before `cutoff` and
    /// returns their ids.
    async fn delete_terminal_before(&self, cutoff: Millis) -> Result<Vec<String>, StoreError>;
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    rooms: Rooms,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_rooms(rooms: HashMap<String, Room>) -> Self {
        MemoryRoomStore {
            rooms: Arc::new(RwLock::new(rooms)),
        }
    }

    async fn snapshot(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn create_index(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_one(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn insert_one(&self, room: Room) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.room_id) {
            return Err(StoreError::DuplicateKey(room.room_id));
        }
        rooms.insert(room.room_id.clone(), room);
        Ok(())
    }

    async fn update_one(
        &self,
        filter: &RoomFilter,
        update: &RoomUpdate,
    ) -> Result<Option<Room>, StoreError> {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(&filter.room_id) {
            Some(room) if filter.matches(room) => {
                update.apply(room);
                Ok(Some(room.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_due(&self, now: Millis) -> Result<Vec<Room>, StoreError> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .filter(|room| room.is_overdue(now))
            .cloned()
            .collect())
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .filter(|room| !room.status.is_terminal())
            .count())
    }

    async fn delete_terminal_before(&self, cutoff: Millis) -> Result<Vec<String>, StoreError> {
        let mut removed = Vec::new();
        self.rooms.write().await.retain(|room_id, room| {
            let stale = room.status.is_terminal() && room.updated_at < cutoff;
            if stale {
                removed.push(room_id.clone());
            }
            !stale
        });
        removed.sort();
        Ok(removed)
    }
}

/// Room table kept in memory and written through to a JSON file after every
/// mutation, so rooms survive a relay restart.
pub struct JsonFileRoomStore {
    inner: MemoryRoomStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRoomStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let rooms = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => {
                let rooms: Vec<Room> = serde_json::from_slice(&bytes)?;
                rooms
                    .into_iter()
                    .map(|room| (room.room_id.clone(), room))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} rooms from {}", rooms.len(), path.display());

        Ok(JsonFileRoomStore {
            inner: MemoryRoomStore::from_rooms(rooms),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let rooms = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&rooms)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RoomStore for JsonFileRoomStore {
    async fn create_index(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_one(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.inner.find_one(room_id).await
    }

    async fn insert_one(&self, room: Room) -> Result<(), StoreError> {
        self.inner.insert_one(room).await?;
        self.persist().await
    }

    async fn update_one(
        &self,
        filter: &RoomFilter,
        update: &RoomUpdate,
    ) -> Result<Option<Room>, StoreError> {
        let updated = self.inner.update_one(filter, update).await?;
        if updated.is_some() {
            if let Err(e) = self.persist().await {
                warn!("Failed to persist room {}: {}", filter.room_id, e);
                return Err(e);
            }
        }
        Ok(updated)
    }

    async fn find_due(&self, now: Millis) -> Result<Vec<Room>, StoreError> {
        self.inner.find_due(now).await
    }

    async fn count_open(&self) -> Result<usize, StoreError> {
        self.inner.count_open().await
    }

    async fn delete_terminal_before(&self, cutoff: Millis) -> Result<Vec<String>, StoreError> {
        let removed = self.inner.delete_terminal_before(cutoff).await?;
        if !removed.is_empty() {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> Room {
        Room::new(id.into(), "Ace".into(), 1_000, 500)
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = MemoryRoomStore::new();
        store.insert_one(room("AAAA2222")).await.unwrap();
        let err = store.insert_one(room("AAAA2222")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(id) if id == "AAAA2222"));
    }

    #[tokio::test]
    async fn update_respects_status_filter() {
        let store = MemoryRoomStore::new();
        store.insert_one(room("AAAA2222")).await.unwrap();

        let close = RoomUpdate {
            status: Some(RoomStatus::Closed),
            ..RoomUpdate::default()
        };
        let closed = store
            .update_one(&RoomFilter::open("AAAA2222"), &close)
            .await
            .unwrap();
        assert_eq!(closed.map(|r| r.status), Some(RoomStatus::Closed));

        let reopen = RoomUpdate {
            status: Some(RoomStatus::Full),
            ..RoomUpdate::default()
        };
        let missed = store
            .update_one(
                &RoomFilter::id("AAAA2222").with_statuses(&[RoomStatus::Waiting]),
                &reopen,
            )
            .await
            .unwrap();
        assert!(missed.is_none());
        let stored = store.find_one("AAAA2222").await.unwrap().unwrap();
        assert_eq!(stored.status, RoomStatus::Closed);
    }

    #[tokio::test]
    async fn find_due_skips_terminal_and_fresh_rooms() {
        let store = MemoryRoomStore::new();
        store.insert_one(room("AAAA2222")).await.unwrap();
        store.insert_one(room("BBBB3333")).await.unwrap();
        store
            .update_one(
                &RoomFilter::id("BBBB3333"),
                &RoomUpdate {
                    status: Some(RoomStatus::Closed),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();

        assert!(store.find_due(1_500).await.unwrap().is_empty());
        let due = store.find_due(1_501).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].room_id, "AAAA2222");
        assert_eq!(store.count_open().await.unwrap(), 1);
    }

    async fn finish(store: &impl RoomStore, room_id: &str, status: RoomStatus, at: Millis) {
        store
            .update_one(
                &RoomFilter::id(room_id),
                &RoomUpdate {
                    status: Some(status),
                    updated_at: Some(at),
                    ..RoomUpdate::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_terminal_before_keeps_open_and_recent_rooms() {
        let store = MemoryRoomStore::new();
        for id in ["AAAA2222", "BBBB3333", "CCCC4444", "DDDD5555"] {
            store.insert_one(room(id)).await.unwrap();
        }
        finish(&store, "AAAA2222", RoomStatus::Closed, 2_000).await;
        finish(&store, "BBBB3333", RoomStatus::Expired, 2_500).await;
        finish(&store, "CCCC4444", RoomStatus::Closed, 9_000).await;

        let removed = store.delete_terminal_before(5_000).await.unwrap();
        assert_eq!(removed, vec!["AAAA2222".to_string(), "BBBB3333".to_string()]);
        assert!(store.find_one("AAAA2222").await.unwrap().is_none());
        assert!(store.find_one("CCCC4444").await.unwrap().is_some());
        // Open rooms stay no matter how old they are.
        assert!(store.find_one("DDDD5555").await.unwrap().is_some());
        assert!(store.delete_terminal_before(5_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn json_store_persists_deletions() {
        let path = std::env::temp_dir()
            .join(format!("midnight-rooms-{}", uuid::Uuid::new_v4()))
            .join("rooms.json");

        {
            let store = JsonFileRoomStore::open(&path).await.unwrap();
            store.insert_one(room("AAAA2222")).await.unwrap();
            store.insert_one(room("BBBB3333")).await.unwrap();
            finish(&store, "AAAA2222", RoomStatus::Closed, 2_000).await;
            let removed = store.delete_terminal_before(3_000).await.unwrap();
            assert_eq!(removed, vec!["AAAA2222".to_string()]);
        }

        let reopened = JsonFileRoomStore::open(&path).await.unwrap();
        assert!(reopened.find_one("AAAA2222").await.unwrap().is_none());
        assert!(reopened.find_one("BBBB3333").await.unwrap().is_some());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("midnight-rooms-{}", uuid::Uuid::new_v4()))
            .join("rooms.json");

        {
            let store = JsonFileRoomStore::open(&path).await.unwrap();
            store.insert_one(room("AAAA2222")).await.unwrap();
            store
                .update_one(
                    &RoomFilter::open("AAAA2222"),
                    &RoomUpdate {
                        guest_name: Some("Rookie".into()),
                        status: Some(RoomStatus::Full),
                        ..RoomUpdate::default()
                    },
                )
                .await
                .unwrap();
        }

        let reopened = JsonFileRoomStore::open(&path).await.unwrap();
        let stored = reopened.find_one("AAAA2222").await.unwrap().unwrap();
        assert_eq!(stored.status, RoomStatus::Full);
        assert_eq!(stored.guest_name.as_deref(), Some("Rookie"));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
