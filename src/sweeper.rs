// Periodic liveness pass: overdue rooms, silent sessions, abandoned
// mailboxes, and finished rooms past their retention.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::clock::{to_millis, Clock};
use crate::directory::RoomDirectory;
use crate::messages::CloseReason;
use crate::polling::PollingService;
use crate::relay::Relay;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Store rooms that moved to `expired` on this pass.
    pub expired_rooms: Vec<String>,
    /// Live sessions ended because a client went silent.
    pub stale_sessions: Vec<String>,
    pub pruned_mailboxes: usize,
    /// Finished rooms deleted from the store.
    pub purged_rooms: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_rooms.is_empty()
            && self.stale_sessions.is_empty()
            && self.pruned_mailboxes == 0
            && self.purged_rooms.is_empty()
    }
}

pub struct Sweeper {
    directory: Arc<RoomDirectory>,
    relay: Arc<Relay>,
    polling: Arc<PollingService>,
    clock: Arc<dyn Clock>,
    client_timeout: Duration,
    room_retention: Duration,
}

impl Sweeper {
    pub fn new(
        directory: Arc<RoomDirectory>,
        relay: Arc<Relay>,
        polling: Arc<PollingService>,
        clock: Arc<dyn Clock>,
        client_timeout: Duration,
        room_retention: Duration,
    ) -> Self {
        Sweeper {
            directory,
            relay,
            polling,
            clock,
            client_timeout,
            room_retention,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.directory.expire_due().await {
            Ok(expired) => {
                for room_id in &expired {
                    self.relay.teardown(room_id, CloseReason::Expired).await;
                }
                report.expired_rooms = expired;
            }
            Err(e) => warn!("Expiry sweep failed: {}", e),
        }

        let now = self.clock.now();
        let timeout = to_millis(self.client_timeout);
        for room_id in self.relay.registry().stale_rooms(now, timeout).await {
            info!("Room {} went silent, expiring it", room_id);
            self.relay.close_room(&room_id, CloseReason::Expired).await;
            report.stale_sessions.push(room_id);
        }

        report.pruned_mailboxes = self.polling.prune(now, timeout).await;

        match self.directory.purge_finished(self.room_retention).await {
            Ok(purged) => report.purged_rooms = purged,
            Err(e) => warn!("Room purge failed: {}", e),
        }

        if report.is_empty() {
            debug!("Sweep found nothing to do");
        } else {
            info!(
                "Sweep expired {} rooms, ended {} silent sessions, pruned {} mailboxes, purged {} finished rooms",
                report.expired_rooms.len(),
                report.stale_sessions.len(),
                report.pruned_mailboxes,
                report.purged_rooms.len()
            );
        }
        report
    }

    /// Runs `sweep_once` every `every` until the task is aborted.
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::messages::ServerMessage;
    use crate::relay::JoinRequest;
    use crate::room::RoomStatus;
    use crate::session::{MemorySessionRegistry, PeerSink};
    use crate::store::MemoryRoomStore;
    use std::sync::Mutex;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(15 * 60);
    const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);
    const RETENTION: Duration = Duration::from_secs(60 * 60);

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<ServerMessage>>,
    }

    impl PeerSink for RecordingSink {
        fn deliver(&self, message: &ServerMessage) -> bool {
            self.delivered.lock().unwrap().push(message.clone());
            true
        }

        fn close(&self) {}
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        directory: Arc<RoomDirectory>,
        relay: Arc<Relay>,
        sweeper: Sweeper,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let directory = Arc::new(RoomDirectory::new(
            Arc::new(MemoryRoomStore::new()),
            clock.clone(),
            TTL,
        ));
        let relay = Arc::new(Relay::new(
            directory.clone(),
            Arc::new(MemorySessionRegistry::new()),
        ));
        let polling = Arc::new(PollingService::new(relay.clone(), directory.clone()));
        let sweeper = Sweeper::new(
            directory.clone(),
            relay.clone(),
            polling,
            clock.clone(),
            CLIENT_TIMEOUT,
            RETENTION,
        );
        Fixture {
            clock,
            directory,
            relay,
            sweeper,
        }
    }

    async fn seat_host(f: &Fixture, room_id: &str) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        f.relay
            .join(
                Uuid::new_v4(),
                JoinRequest {
                    room_id: room_id.into(),
                    player_name: "Ace".into(),
                    ship_type: None,
                },
                sink.clone(),
            )
            .await
            .unwrap();
        sink
    }

    #[tokio::test]
    async fn silent_sessions_are_expired() {
        let f = fixture();
        let room_id = f.directory.create_room(Some("Ace")).await.unwrap();
        let sink = seat_host(&f, &room_id).await;

        f.clock.advance(CLIENT_TIMEOUT);
        assert!(f.sweeper.sweep_once().await.is_empty());

        f.clock.advance(Duration::from_secs(1));
        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.stale_sessions, vec![room_id.clone()]);

        let room = f.directory.get_room(Some(room_id.as_str())).await.unwrap();
        assert_eq!(room.status, RoomStatus::Expired);
        let delivered = sink.delivered.lock().unwrap();
        match delivered.last() {
            Some(ServerMessage::RoomClosed { reason, .. }) => {
                assert_eq!(*reason, CloseReason::Expired);
            }
            other => panic!("expected room_closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overdue_rooms_expire_without_sessions() {
        let f = fixture();
        let room_id = f.directory.create_room(Some("Ace")).await.unwrap();

        f.clock.advance(TTL + Duration::from_millis(1));
        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.expired_rooms, vec![room_id]);
        assert!(report.stale_sessions.is_empty());
        assert!(f.sweeper.sweep_once().await.is_empty());
    }

    #[tokio::test]
    async fn finished_rooms_are_purged_after_retention() {
        let f = fixture();
        let old = f.directory.create_room(Some("Ace")).await.unwrap();
        f.directory.close(&old, RoomStatus::Closed).await.unwrap();

        f.clock.advance(RETENTION / 2);
        let recent = f.directory.create_room(Some("Bolt")).await.unwrap();
        f.directory.close(&recent, RoomStatus::Closed).await.unwrap();

        f.clock.advance(RETENTION / 2 + Duration::from_millis(1));
        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.purged_rooms, vec![old.clone()]);

        let err = f.directory.get_room(Some(old.as_str())).await.unwrap_err();
        assert!(matches!(err, crate::error::RoomError::NotFound));
        let kept = f.directory.get_room(Some(recent.as_str())).await.unwrap();
        assert_eq!(kept.status, RoomStatus::Closed);
    }
}
