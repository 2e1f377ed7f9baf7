#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::test::WsClient;
use warp::{Filter, Reply};

use midnight_coop::clock::ManualClock;
use midnight_coop::routes::routes;
use midnight_coop::session::MemorySessionRegistry;
use midnight_coop::store::MemoryRoomStore;
use midnight_coop::{Server, ServerConfig};

pub const START: u64 = 1_700_000_000_000;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub server: Server,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let server = Server::new(
            ServerConfig::default(),
            Arc::new(MemoryRoomStore::new()),
            Arc::new(MemorySessionRegistry::new()),
            clock.clone(),
        );
        Harness { server, clock }
    }

    pub fn api(&self) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        routes(self.server.clone())
    }

    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = warp::test::request()
            .method("POST")
            .path(path)
            .json(&body)
            .reply(&self.api())
            .await;
        (res.status(), parse(res.body()))
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let res = warp::test::request()
            .method("GET")
            .path(path)
            .reply(&self.api())
            .await;
        (res.status(), parse(res.body()))
    }

    pub async fn create_room(&self, host: &str) -> String {
        let (status, body) = self.post("/rooms/create", json!({ "hostName": host })).await;
        assert_eq!(status, StatusCode::OK, "create failed: {body}");
        body["roomId"].as_str().unwrap().to_string()
    }

    /// Creates a room for `host` and seats `guest` in it.
    pub async fn full_room(&self, host: &str, guest: &str) -> String {
        let room_id = self.create_room(host).await;
        let (status, body) = self
            .post(
                "/rooms/join",
                json!({ "roomId": room_id, "playerName": guest }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "join failed: {body}");
        room_id
    }

    pub async fn socket(&self) -> WsClient {
        warp::test::ws()
            .path("/ws")
            .handshake(self.api())
            .await
            .expect("handshake")
    }

    /// Opens a socket and joins `room_id`, returning it with the `joined_room`
    /// frame.
    pub async fn join_socket(&self, room_id: &str, name: &str, ship: &str) -> (WsClient, Value) {
        let mut client = self.socket().await;
        send(
            &mut client,
            json!({
                "type": "join_room",
                "roomId": room_id,
                "playerName": name,
                "shipType": ship,
            }),
        )
        .await;
        let joined = recv(&mut client).await;
        assert_eq!(joined["type"], "joined_room", "unexpected reply: {joined}");
        (client, joined)
    }
}

pub fn parse(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

pub async fn send(client: &mut WsClient, message: Value) {
    client.send_text(message.to_string()).await;
}

pub async fn recv(client: &mut WsClient) -> Value {
    let message = tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed");
    let text = message.to_str().expect("text frame");
    serde_json::from_str(text).expect("json frame")
}

/// Receives frames until one has `type == kind`.
pub async fn recv_type(client: &mut WsClient, kind: &str) -> Value {
    loop {
        let message = recv(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

/// Asserts nothing arrives for a short while.
pub async fn assert_silent(client: &mut WsClient) {
    if let Ok(Ok(message)) =
        tokio::time::timeout(Duration::from_millis(150), client.recv()).await
    {
        panic!("expected silence, got {message:?}");
    }
}
