//! Cross-module scenario tests: full request handling plus live streams,
//! in-process. The webserver integration tests cover the same surface over
//! a real socket; these focus on the interplay between the HTTP handlers,
//! the bus, and the stream multiplexer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{Args, Config};
use crate::entity::QueueKind;
use crate::payloads::{EventMsg, RECORD_SEPARATOR};
use crate::rdb::RelationalDatabase;
use crate::server::{handle_request, AppState, ResponseBody};

async fn test_state() -> Arc<AppState> {
    let args = Args::parse_from([
        "webgames",
        "-t",
        "--jwt-secret",
        "scenario-secret",
        "--container-runtime",
        "echo",
    ]);
    let config = Config::from_args(&args).unwrap();
    Arc::new(AppState::new(config).await.unwrap())
}

fn peer() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn request(method: Method, path: &str, token: Option<&str>, body: Value) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer: {token}"));
    }
    let bytes = if body.is_null() {
        Bytes::new()
    } else {
        Bytes::from(serde_json::to_vec(&body).unwrap())
    };
    builder.body(Full::new(bytes)).unwrap()
}

async fn send(
    state: &Arc<AppState>,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: Value,
) -> (StatusCode, Value) {
    let response = handle_request(request(method, path, token, body), state.clone(), peer()).await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn register_and_login(state: &Arc<AppState>, name: &str) -> (Uuid, String) {
    let (status, body) = send(
        state,
        Method::POST,
        "/v1/auth/register",
        None,
        json!({"username": name, "email": format!("{name}@example.com"), "password": "hunter2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let userid: Uuid = body["userid"].as_str().unwrap().parse().unwrap();

    let (status, body) = send(
        state,
        Method::POST,
        "/v1/auth/",
        None,
        json!({"login": name, "password": "hunter2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (userid, body["token"].as_str().unwrap().to_string())
}

/// Open a streaming endpoint and hand back its body for frame reading.
async fn open_stream(state: &Arc<AppState>, path: &str, token: &str) -> ResponseBody {
    let response = handle_request(request(Method::GET, path, Some(token), Value::Null), state.clone(), peer()).await;
    assert_eq!(response.status(), StatusCode::OK);
    response.into_body()
}

/// Read the next framed event off a stream, with a deadline.
async fn next_event(body: &mut ResponseBody) -> Option<EventMsg> {
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("timely frame")?
        .ok()?;
    let data = frame.into_data().ok()?;
    assert_eq!(*data.last().unwrap(), RECORD_SEPARATOR);
    Some(serde_json::from_slice(&data[..data.len() - 1]).unwrap())
}

/// Invite delivery: the target's user stream receives the invitation event
/// with the inviter, group, and game spelled out.
#[tokio::test]
async fn test_invite_delivery_through_user_stream() {
    let state = test_state().await;
    let gameid = state
        .rdb
        .create_game("hexarena", Uuid::new_v4(), 4, "games/hexarena:1", &[7777])
        .await
        .unwrap();
    let (x_id, x_token) = register_and_login(&state, "x").await;
    let (_, foo_token) = register_and_login(&state, "foo").await;

    let (status, body) = send(
        &state,
        Method::POST,
        &format!("/v1/groups/create/{gameid}"),
        Some(&x_token),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let groupid: Uuid = body["groupid"].as_str().unwrap().parse().unwrap();

    let mut foo_stream = open_stream(&state, "/v1/msgqueues/user", &foo_token).await;
    let greeting = next_event(&mut foo_stream).await.unwrap();
    assert!(matches!(greeting, EventMsg::ServerNotice { .. }), "got {greeting:?}");

    let (status, _) = send(
        &state,
        Method::POST,
        "/v1/groups/invite/byname/foo",
        Some(&x_token),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let event = next_event(&mut foo_stream).await.unwrap();
    let EventMsg::InvitationReceived { from, to } = event else {
        panic!("expected invitation, got {event:?}");
    };
    assert_eq!(from.userid, x_id);
    assert_eq!(to.groupid, groupid);
    assert_eq!(to.gameid, gameid);
    assert_eq!(to.gamename, "hexarena");
}

/// Kick cleanup: two simultaneous user streams, one admin kick, both close
/// and nothing stays behind in the stop-signal index.
#[tokio::test]
async fn test_admin_kick_closes_both_user_streams() {
    let state = test_state().await;
    let (u_id, u_token) = register_and_login(&state, "u").await;
    register_and_login(&state, "root").await;
    let admin = state.rdb.get_user_by_login("root").await.unwrap();
    state.rdb.set_user_admin(admin.userid, true).await.unwrap();
    let (_, body) = send(
        &state,
        Method::POST,
        "/v1/auth/",
        None,
        json!({"login": "root", "password": "hunter2"}),
    )
    .await;
    let admin_token = body["token"].as_str().unwrap().to_string();

    let mut first = open_stream(&state, "/v1/msgqueues/user", &u_token).await;
    let mut second = open_stream(&state, "/v1/msgqueues/user", &u_token).await;
    assert!(next_event(&mut first).await.is_some());
    assert!(next_event(&mut second).await.is_some());
    assert_eq!(state.streams.active_streams(QueueKind::User, u_id), 2);

    let (status, _) = send(
        &state,
        Method::DELETE,
        &format!("/v1/msgqueues/kick/{u_id}/from/user"),
        Some(&admin_token),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Both streams drain to completion.
    while next_event(&mut first).await.is_some() {}
    while next_event(&mut second).await.is_some() {}
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.streams.active_streams(QueueKind::User, u_id), 0);

    // The user record is untouched by the kick.
    assert!(state.rdb.get_user_by_id(u_id).await.is_ok());
}

/// Queue reversal: clearing readiness while queued returns the group to
/// GROUP_CHECK and drops its emptied slot.
#[tokio::test]
async fn test_queue_reversal_over_http() {
    let state = test_state().await;
    let gameid = state
        .rdb
        .create_game("skirmish", Uuid::new_v4(), 4, "games/skirmish:1", &[7777])
        .await
        .unwrap();
    let (_, token) = register_and_login(&state, "ada").await;

    send(&state, Method::POST, &format!("/v1/groups/create/{gameid}"), Some(&token), Value::Null).await;
    send(&state, Method::POST, "/v1/groups/ready", Some(&token), Value::Null).await;
    let (status, _) = send(&state, Method::POST, "/v1/groups/start", Some(&token), Value::Null).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&state, Method::GET, "/v1/groups/", Some(&token), Value::Null).await;
    assert_eq!(body["state"], "IN_QUEUE");
    assert!(body["slotid"].is_string());

    let (status, _) = send(&state, Method::DELETE, "/v1/groups/ready", Some(&token), Value::Null).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&state, Method::GET, "/v1/groups/", Some(&token), Value::Null).await;
    assert_eq!(body["state"], "GROUP_CHECK");
    assert!(body.get("slotid").is_none() || body["slotid"].is_null());
    assert_eq!(body["members"][0]["ready"], false);
}

/// A group stream follows the group's life: join, ready, queue.
#[tokio::test]
async fn test_group_stream_sees_membership_events() {
    let state = test_state().await;
    let gameid = state
        .rdb
        .create_game("skirmish", Uuid::new_v4(), 4, "games/skirmish:1", &[7777])
        .await
        .unwrap();
    let (_, ada_token) = register_and_login(&state, "ada").await;
    let (bob_id, bob_token) = register_and_login(&state, "bob").await;

    let (_, body) = send(
        &state,
        Method::POST,
        &format!("/v1/groups/create/{gameid}"),
        Some(&ada_token),
        Value::Null,
    )
    .await;
    let groupid = body["groupid"].as_str().unwrap().to_string();

    let mut stream = open_stream(&state, "/v1/msgqueues/group", &ada_token).await;
    let greeting = next_event(&mut stream).await.unwrap();
    assert!(matches!(greeting, EventMsg::ServerNotice { .. }));

    send(&state, Method::POST, &format!("/v1/groups/join/{groupid}"), Some(&bob_token), Value::Null).await;
    let event = next_event(&mut stream).await.unwrap();
    let EventMsg::UserJoined { user } = event else {
        panic!("expected join, got {event:?}");
    };
    assert_eq!(user.userid, bob_id);

    send(&state, Method::POST, "/v1/groups/ready", Some(&bob_token), Value::Null).await;
    assert!(matches!(next_event(&mut stream).await.unwrap(), EventMsg::UserReady { .. }));

    send(&state, Method::DELETE, "/v1/groups/leave", Some(&bob_token), Value::Null).await;
    assert!(matches!(next_event(&mut stream).await.unwrap(), EventMsg::UserLeft { .. }));
}
