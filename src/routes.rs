// HTTP surface: Directory API, WebSocket upgrade, polling transport, health
// and static files. Every JSON error uses the `{success: false, error}`
// envelope, including rejections raised by warp itself.

use std::convert::Infallible;
use std::fmt::Display;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use crate::error::{RelayError, RoomError};
use crate::messages::{
    CreateRoomRequest, CreateRoomResponse, ErrorResponse, HealthResponse, LeaveRoomResponse,
    PeerStateQuery, PollJoinRequest, RoomMemberRequest, RoomResponse, SyncRequest,
};
use crate::room::RoomStatus;
use crate::server::Server;

const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Every route the relay serves, with CORS open to any origin.
pub fn routes(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let static_files = warp::fs::dir(server.config().static_dir.clone());

    directory_routes(server.clone())
        .or(websocket_route(server.clone()))
        .or(polling_routes(server.clone()))
        .or(health_route(server))
        .or(static_files)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "OPTIONS"])
                .allow_headers(vec!["content-type"]),
        )
        .recover(handle_rejection)
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

pub fn directory_routes(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let create = warp::post()
        .and(warp::path!("rooms" / "create"))
        .and(with_server(server.clone()))
        .and(json_body::<CreateRoomRequest>())
        .and_then(create_room);

    let join = warp::post()
        .and(warp::path!("rooms" / "join"))
        .and(with_server(server.clone()))
        .and(json_body::<RoomMemberRequest>())
        .and_then(join_room);

    let leave = warp::post()
        .and(warp::path!("rooms" / "leave"))
        .and(with_server(server.clone()))
        .and(json_body::<RoomMemberRequest>())
        .and_then(leave_room);

    let get = warp::get()
        .and(warp::path!("rooms" / String))
        .and(with_server(server))
        .and_then(get_room);

    create.or(join).or(leave).or(get)
}

pub fn websocket_route(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        })
}

pub fn polling_routes(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let join = warp::post()
        .and(warp::path!("poll" / "join"))
        .and(with_server(server.clone()))
        .and(json_body::<PollJoinRequest>())
        .and_then(poll_join);

    let sync = warp::post()
        .and(warp::path!("poll" / "sync"))
        .and(with_server(server.clone()))
        .and(json_body::<SyncRequest>())
        .and_then(poll_sync);

    let state = warp::get()
        .and(warp::path!("poll" / "state"))
        .and(with_server(server))
        .and(warp::query::<PeerStateQuery>())
        .and_then(poll_state);

    join.or(sync).or(state)
}

pub fn health_route(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path!("health"))
        .and(with_server(server))
        .and_then(health)
}

async fn create_room(server: Server, body: CreateRoomRequest) -> Result<Response, Infallible> {
    Ok(
        match server.directory().create_room(body.host_name.as_deref()).await {
            Ok(room_id) => json_reply(&CreateRoomResponse {
                success: true,
                room_id,
            }),
            Err(e) => room_error(&e),
        },
    )
}

async fn join_room(server: Server, body: RoomMemberRequest) -> Result<Response, Infallible> {
    Ok(
        match server
            .directory()
            .join_room(body.room_id.as_deref(), body.player_name.as_deref())
            .await
        {
            Ok(room) => json_reply(&RoomResponse {
                success: true,
                room,
            }),
            Err(e) => room_error(&e),
        },
    )
}

async fn get_room(room_id: String, server: Server) -> Result<Response, Infallible> {
    Ok(match server.directory().get_room(Some(room_id.as_str())).await {
        Ok(room) if room.status.is_terminal() => {
            let error = if room.status == RoomStatus::Expired {
                RoomError::Expired
            } else {
                RoomError::Closed
            };
            // Gone, but the record is still useful to a client showing why.
            reply::with_status(
                reply::json(&json!({
                    "success": false,
                    "error": error.to_string(),
                    "room": room,
                })),
                error.status_code(),
            )
            .into_response()
        }
        Ok(room) => json_reply(&RoomResponse {
            success: true,
            room,
        }),
        Err(e) => room_error(&e),
    })
}

async fn leave_room(server: Server, body: RoomMemberRequest) -> Result<Response, Infallible> {
    Ok(
        match server
            .leave_room(body.room_id.as_deref(), body.player_name.as_deref())
            .await
        {
            Ok(outcome) => json_reply(&LeaveRoomResponse {
                success: true,
                status: outcome.room.status,
            }),
            Err(e) => room_error(&e),
        },
    )
}

async fn poll_join(server: Server, body: PollJoinRequest) -> Result<Response, Infallible> {
    Ok(match server.polling().join(body).await {
        Ok(response) => json_reply(&response),
        Err(e) => relay_error(&e),
    })
}

async fn poll_sync(server: Server, body: SyncRequest) -> Result<Response, Infallible> {
    Ok(match server.polling().sync(body).await {
        Ok(response) => json_reply(&response),
        Err(e) => relay_error(&e),
    })
}

async fn poll_state(server: Server, query: PeerStateQuery) -> Result<Response, Infallible> {
    Ok(
        match server
            .polling()
            .peer_state(query.room_id.as_deref(), query.player_name.as_deref())
            .await
        {
            Ok(response) => json_reply(&response),
            Err(e) => relay_error(&e),
        },
    )
}

async fn health(server: Server) -> Result<Response, Infallible> {
    Ok(match server.directory().open_room_count().await {
        Ok(rooms) => json_reply(&HealthResponse {
            success: true,
            rooms,
            sessions: server.session_count().await,
        }),
        Err(e) => room_error(&e),
    })
}

fn json_reply<T: Serialize>(body: &T) -> Response {
    reply::json(body).into_response()
}

fn error_reply(status: StatusCode, error: impl Display) -> Response {
    if status.is_server_error() {
        warn!("Request failed with {}: {}", status, error);
    } else {
        debug!("Request rejected with {}: {}", status, error);
    }
    reply::with_status(reply::json(&ErrorResponse::new(error)), status).into_response()
}

fn room_error(err: &RoomError) -> Response {
    error_reply(err.status_code(), err)
}

fn relay_error(err: &RelayError) -> Response {
    error_reply(err.status_code(), err)
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {e}"))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected a JSON body".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        (StatusCode::BAD_REQUEST, format!("Bad request: {err:?}"))
    };
    Ok(error_reply(status, message))
}
