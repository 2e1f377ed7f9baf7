// Netplay over the HTTP polling endpoints.
//
// Two independent loops run while connected: `sync` pushes the outbox and
// collects queued peer messages, `poll` fetches the peer snapshot when it has
// changed. A failed sync puts its batch back at the front of the outbox, so
// outgoing messages are delivered at least once. Neither loop backs off;
// they keep ticking until a terminal error, too many consecutive failures,
// `room_closed`, or `disconnect()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::handlers::{EventKind, Handler, HandlerTable, PeerEvent};
use super::{JoinParams, JoinResult, Netplay};
use crate::config::NetplayConfig;
use crate::error::{ClientError, RelayError};
use crate::messages::{
    ClientMessage, ErrorResponse, PeerStateQuery, PeerStateResponse, PollJoinRequest,
    PollJoinResponse, Role, ServerMessage, SyncRequest, SyncResponse,
};
use crate::polling::PollingService;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// The three polling endpoints.
#[async_trait]
pub trait PollingApi: Send + Sync {
    async fn join(&self, request: PollJoinRequest) -> Result<PollJoinResponse, ClientError>;
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ClientError>;
    async fn peer_state(&self, query: PeerStateQuery) -> Result<PeerStateResponse, ClientError>;
}

pub struct HttpPollingApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPollingApi {
    pub fn new(config: &NetplayConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .build()?;
        Ok(HttpPollingApi {
            client,
            base_url: config.base_url.clone(),
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PollingApi for HttpPollingApi {
    async fn join(&self, request: PollJoinRequest) -> Result<PollJoinResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}/poll/join", self.base_url))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}/poll/sync", self.base_url))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn peer_state(&self, query: PeerStateQuery) -> Result<PeerStateResponse, ClientError> {
        let response = self
            .client
            .get(format!("{}/poll/state", self.base_url))
            .query(&query)
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Calls a `PollingService` in the same process, skipping HTTP.
pub struct LocalPollingApi {
    service: Arc<PollingService>,
}

impl LocalPollingApi {
    pub fn new(service: Arc<PollingService>) -> Self {
        LocalPollingApi { service }
    }
}

fn api_error(err: &RelayError) -> ClientError {
    ClientError::Api {
        status: err.status_code().as_u16(),
        message: err.to_string(),
    }
}

#[async_trait]
impl PollingApi for LocalPollingApi {
    async fn join(&self, request: PollJoinRequest) -> Result<PollJoinResponse, ClientError> {
        self.service.join(request).await.map_err(|e| api_error(&e))
    }

    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ClientError> {
        self.service.sync(request).await.map_err(|e| api_error(&e))
    }

    async fn peer_state(&self, query: PeerStateQuery) -> Result<PeerStateResponse, ClientError> {
        self.service
            .peer_state(query.room_id.as_deref(), query.player_name.as_deref())
            .await
            .map_err(|e| api_error(&e))
    }
}

/// State shared by the two loops of one connection.
struct Link {
    room_id: String,
    player_name: String,
    peer_role: Role,
    outbox: Mutex<VecDeque<ClientMessage>>,
    outbox_capacity: usize,
    connected: AtomicBool,
    failures: AtomicU32,
    max_failures: u32,
    shutdown: watch::Sender<bool>,
}

impl Link {
    fn outbox(&self) -> MutexGuard<'_, VecDeque<ClientMessage>> {
        self.outbox.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(&self, message: ClientMessage) {
        let mut outbox = self.outbox();
        // Only the newest snapshot of each kind matters.
        match &message {
            ClientMessage::StateUpdate { .. } => {
                outbox.retain(|queued| !matches!(queued, ClientMessage::StateUpdate { .. }));
            }
            ClientMessage::InputUpdate { .. } => {
                outbox.retain(|queued| !matches!(queued, ClientMessage::InputUpdate { .. }));
            }
            _ => {}
        }
        if outbox.len() >= self.outbox_capacity {
            outbox.pop_front();
        }
        outbox.push_back(message);
    }

    fn take_batch(&self) -> Vec<ClientMessage> {
        self.outbox().drain(..).collect()
    }

    /// Puts a failed batch back ahead of anything queued since.
    fn requeue(&self, batch: Vec<ClientMessage>) {
        let mut outbox = self.outbox();
        let newer: Vec<ClientMessage> = outbox.drain(..).collect();
        for message in batch.into_iter().chain(newer) {
            match &message {
                ClientMessage::StateUpdate { .. } => {
                    outbox.retain(|q| !matches!(q, ClientMessage::StateUpdate { .. }));
                }
                ClientMessage::InputUpdate { .. } => {
                    outbox.retain(|q| !matches!(q, ClientMessage::InputUpdate { .. }));
                }
                _ => {}
            }
            outbox.push_back(message);
        }
        while outbox.len() > self.outbox_capacity {
            outbox.pop_front();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn succeeded(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Returns `true` when the session should end because of `err`.
    fn failed(&self, err: &ClientError) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Polling request failed ({} in a row): {}", failures, err);
        err.is_terminal() || failures >= self.max_failures
    }

    /// Ends the session from inside a loop. Fires `closed` unless
    /// `disconnect()` got there first.
    fn end(&self, handlers: &HandlerTable, reason: impl Into<String>) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let reason = reason.into();
            info!("Polling session for room {} ended: {}", self.room_id, reason);
            let _ = self.shutdown.send(true);
            handlers.fire_closed(reason);
        }
    }

    fn sync_request(&self, messages: Vec<ClientMessage>) -> SyncRequest {
        SyncRequest {
            room_id: Some(self.room_id.clone()),
            player_name: Some(self.player_name.clone()),
            messages,
        }
    }
}

struct Session {
    link: Arc<Link>,
    tasks: Vec<JoinHandle<()>>,
}

/// Netplay over the polling endpoints of the relay.
pub struct PollingNetplay {
    api: Arc<dyn PollingApi>,
    config: NetplayConfig,
    handlers: Arc<HandlerTable>,
    session: Mutex<Option<Session>>,
}

impl PollingNetplay {
    pub fn new(api: Arc<dyn PollingApi>, config: NetplayConfig) -> Self {
        PollingNetplay {
            api,
            config,
            handlers: Arc::new(HandlerTable::new()),
            session: Mutex::new(None),
        }
    }

    /// Polling against the relay at `config.base_url`.
    pub fn http(config: NetplayConfig) -> Result<Self, ClientError> {
        let api = Arc::new(HttpPollingApi::new(&config)?);
        Ok(Self::new(api, config))
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.session().as_ref().map(|session| session.link.clone())
    }
}

#[async_trait]
impl Netplay for PollingNetplay {
    async fn connect(&self, params: JoinParams) -> Result<JoinResult, ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        let request = PollJoinRequest {
            room_id: Some(params.room_id.clone()),
            player_name: Some(params.player_name.clone()),
            ship_type: params.ship_type.clone(),
        };
        let response = timeout(self.config.connect_timeout, self.api.join(request))
            .await
            .map_err(|_| ClientError::Timeout)??;
        info!(
            "Joined room {} as {} over polling",
            response.room_id, response.role
        );

        let (shutdown, _) = watch::channel(false);
        let link = Arc::new(Link {
            room_id: response.room_id.clone(),
            player_name: params.player_name,
            peer_role: response.role.peer(),
            outbox: Mutex::new(VecDeque::new()),
            outbox_capacity: self.config.outbox_capacity.max(1),
            connected: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            max_failures: self.config.max_consecutive_failures.max(1),
            shutdown,
        });
        self.handlers.rearm();

        let tasks = vec![
            tokio::spawn(sync_loop(
                self.api.clone(),
                link.clone(),
                self.handlers.clone(),
                self.config.sync_interval,
            )),
            tokio::spawn(poll_loop(
                self.api.clone(),
                link.clone(),
                self.handlers.clone(),
                self.config.poll_interval,
            )),
        ];
        let previous = self.session().replace(Session { link, tasks });
        if let Some(previous) = previous {
            for task in previous.tasks {
                task.abort();
            }
        }

        Ok(JoinResult {
            role: response.role,
            room_id: response.room_id,
            host_name: response.host_name,
            guest_name: response.guest_name,
            players: response.players,
        })
    }

    fn on(&self, kind: EventKind, handler: Handler) {
        self.handlers.set(kind, handler);
    }

    fn emit(&self, message: ClientMessage) {
        if let Some(link) = self.current_link().filter(|link| link.is_connected()) {
            link.push(message);
        }
    }

    async fn disconnect(&self) {
        let session = self.session().take();
        let Some(Session { link, tasks }) = session else {
            return;
        };
        let was_connected = link.connected.swap(false, Ordering::AcqRel);
        self.handlers.suppress_closed();
        let _ = link.shutdown.send(true);
        for mut task in tasks {
            if timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        if was_connected {
            let mut batch = link.take_batch();
            batch.push(ClientMessage::LeaveRoom);
            if let Err(e) = self.api.sync(link.sync_request(batch)).await {
                debug!("Leave notification failed: {}", e);
            }
        }
        debug!("Polling adapter disconnected from room {}", link.room_id);
    }

    fn is_connected(&self) -> bool {
        self.current_link().is_some_and(|link| link.is_connected())
    }
}

/// Returns `false` when the session is over.
fn deliver(link: &Link, handlers: &HandlerTable, message: ServerMessage) -> bool {
    match message {
        ServerMessage::Error { error } => {
            warn!("Relay reported: {}", error);
            true
        }
        ServerMessage::RoomClosed { room_id, reason } => {
            handlers.dispatch(&PeerEvent::RoomClosed { room_id, reason });
            link.end(handlers, format!("room closed ({reason:?})"));
            false
        }
        other => {
            if let Some(event) = PeerEvent::from_server(other) {
                handlers.dispatch(&event);
            }
            true
        }
    }
}

async fn sync_loop(
    api: Arc<dyn PollingApi>,
    link: Arc<Link>,
    handlers: Arc<HandlerTable>,
    every: Duration,
) {
    let mut shutdown = link.shutdown.subscribe();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while link.is_connected() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let batch = link.take_batch();
        match api.sync(link.sync_request(batch.clone())).await {
            Ok(response) => {
                link.succeeded();
                for message in response.peer_messages {
                    if !link.is_connected() || !deliver(&link, &handlers, message) {
                        return;
                    }
                }
            }
            Err(e) => {
                link.requeue(batch);
                if link.failed(&e) {
                    link.end(&handlers, e.to_string());
                    return;
                }
            }
        }
    }
}

async fn poll_loop(
    api: Arc<dyn PollingApi>,
    link: Arc<Link>,
    handlers: Arc<HandlerTable>,
    every: Duration,
) {
    let mut shutdown = link.shutdown.subscribe();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let query = || PeerStateQuery {
        room_id: Some(link.room_id.clone()),
        player_name: Some(link.player_name.clone()),
    };

    while link.is_connected() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match api.peer_state(query()).await {
            Ok(response) => {
                link.succeeded();
                if let Some(state) = response.peer_state {
                    if link.is_connected() {
                        handlers.dispatch(&PeerEvent::PeerState {
                            from: link.peer_role,
                            state,
                        });
                    }
                }
            }
            Err(e) => {
                if link.failed(&e) {
                    link.end(&handlers, e.to_string());
                    return;
                }
            }
        }
    }
}
