//! The HTTP surface: application state, route dispatch, and handlers.
//!
//! Routing is a single match over `(method, path)` the way the rest of the
//! server is written: no framework, just hyper. Handlers return
//! `Result<Response, ApiError>` and the dispatcher turns errors into
//! `{"error": <phrase>}` bodies with the taxonomy's status code.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use http::request::Parts;
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{self, Claims, TokenGate};
use crate::config::Config;
use crate::entity::{ClientType, QueueKind};
use crate::error::ApiError;
use crate::kvs::{GameHostConfig, InMemoryStore, SessionStore};
use crate::launcher::GameLauncher;
use crate::matchmaker::Matchmaker;
use crate::msg::{MessageBus, Topic};
use crate::payloads::{
    CreateGameMsg, CreateGameResponse, CreateGroupResponse, LoginMsg, RegisterMsg, RegisterResponse,
    TokenResponse,
};
use crate::rdb::{InMemoryRdb, RelationalDatabase, SqliteRdb};
use crate::streams::StreamHub;

/// Protect the server from massive bodies.
const MAX_BODY_BYTES: u64 = 1024 * 64;

const PLAYER_OR_ADMIN: &[ClientType] = &[ClientType::Player, ClientType::Admin];
const ADMIN_ONLY: &[ClientType] = &[ClientType::Admin];

pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Everything a request handler can reach. One per process, shared across
/// connections behind an `Arc`.
pub struct AppState {
    pub config: Config,
    pub rdb: Arc<dyn RelationalDatabase>,
    pub kvs: Arc<dyn SessionStore>,
    pub bus: Arc<MessageBus>,
    pub gate: TokenGate,
    pub matchmaker: Matchmaker,
    pub streams: StreamHub,
    pub shutdown: CancellationToken,
    http_client: reqwest::Client,
}

impl AppState {
    /// Wire the whole service together from its configuration.
    ///
    /// # Errors
    /// Fails when the durable identity store cannot be opened.
    pub async fn new(config: Config) -> Result<AppState, ApiError> {
        let rdb: Arc<dyn RelationalDatabase> = if config.in_memory {
            Arc::new(InMemoryRdb::new())
        } else {
            Arc::new(SqliteRdb::connect(&config.rdb_url).await?)
        };

        // In-memory runs have no durable accounts and no admin wizard, so seed
        // a well-known admin for the test harness.
        if config.in_memory {
            let admin = Uuid::new_v4();
            rdb
                .create_user(admin, "admin", "admin@localhost", &auth::hash_password("admin")?)
                .await?;
            rdb.set_user_admin(admin, true).await?;
            warn!("In-memory mode: seeded admin account \"admin\"/\"admin\"");
        }
        let kvs = Arc::new(InMemoryStore::new(GameHostConfig {
            host: config.game_host.clone(),
            port_range_start: config.game_port_range_start,
            port_range_stop: config.game_port_range_stop,
        }));
        let bus = Arc::new(MessageBus::new());
        let shutdown = CancellationToken::new();
        let gate = TokenGate::new(config.jwt_secret.clone(), config.jwt_expiration, kvs.clone());
        let matchmaker = Matchmaker::new(
            rdb.clone(),
            kvs.clone(),
            bus.clone(),
            GameLauncher::new(config.container_runtime.clone()),
            shutdown.clone(),
        );
        let streams = StreamHub::new(bus.clone());

        Ok(AppState {
            config,
            rdb,
            kvs,
            bus,
            gate,
            matchmaker,
            streams,
            shutdown,
            http_client: reqwest::Client::new(),
        })
    }

    /// Process shutdown: every stream stop signal fires and container waits
    /// are abandoned.
    pub fn shutdown(&self) {
        self.streams.shutdown_all();
        self.shutdown.cancel();
    }
}

fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).expect("Failed to serialize response");
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap()
}

fn empty_response() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .body(full(""))
        .unwrap()
}

fn error_response(err: &ApiError) -> Response<ResponseBody> {
    json_response(err.status(), &json!({ "error": err.to_string() }))
}

/// Read a body while also protecting the server from massive bodies.
async fn read_body<B>(body: B) -> Result<Bytes, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if body.size_hint().upper().unwrap_or(u64::MAX) > MAX_BODY_BYTES {
        return Err(ApiError::BadRequest("Body too big".to_string()));
    }
    Ok(
        body
            .collect()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Cannot read body: {e}")))?
            .to_bytes(),
    )
}

fn parse_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| {
        warn!("Invalid JSON ({e}): {bytes:?}");
        ApiError::BadRequest("Invalid JSON".to_string())
    })
}

/// Required-field guard on a JSON body, checked before deserializing into a
/// typed message: absent keys first, then keys that are null or blank
/// strings, every offender collected into one message.
fn require_fields(bytes: &Bytes, fields: &[&str]) -> Result<(), ApiError> {
    let body: Value = parse_json(bytes)?;
    let Value::Object(body) = body else {
        return Err(ApiError::BadRequest("JSON object required.".to_string()));
    };

    let missing_keys: Vec<&str> = fields.iter().copied().filter(|f| !body.contains_key(*f)).collect();
    if !missing_keys.is_empty() {
        return Err(missing_fields(&missing_keys));
    }

    let missing_values: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| match &body[*f] {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        })
        .collect();
    if !missing_values.is_empty() {
        return Err(missing_fields(&missing_values));
    }
    Ok(())
}

fn missing_fields(fields: &[&str]) -> ApiError {
    ApiError::BadRequest(format!("Fields {{{}}} are missing", fields.join(", ")))
}

/// Dispatch one request. Never fails: every error becomes a JSON response.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
    peer: IpAddr,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let client_ip = auth::client_ip(peer, &parts.headers, &state.config.reverse_proxy_ips);
    info!("Request: {} {} (IP: {client_ip})", parts.method, parts.uri.path());

    match route(parts, body, state, client_ip).await {
        Ok(response) => response,
        Err(err) => {
            warn!("Request failed: {err} (IP: {client_ip})");
            error_response(&err)
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn route<B>(
    parts: Parts,
    body: B,
    state: Arc<AppState>,
    ip: IpAddr,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    let path = parts.uri.path().to_string();
    let gate = &state.gate;

    match (&parts.method, path.as_str()) {
        (&Method::OPTIONS, _) => {
            let response = Response::builder()
                .header("Access-Control-Allow-Origin", "*")
                .header("Access-Control-Allow-Methods", "POST, GET, DELETE, OPTIONS")
                .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
                .body(full(""))
                .unwrap();
            Ok(response)
        }

        (&Method::GET, "/status") => Ok(
            Response::builder()
                .status(StatusCode::OK)
                .body(full("Server running\n"))
                .unwrap(),
        ),

        // -- auth ---------------------------------------------------------------
        (&Method::POST, "/v1/auth/register") => {
            let bytes = read_body(body).await?;
            require_fields(&bytes, &["username", "email", "password"])?;
            let msg: RegisterMsg = parse_json(&bytes)?;
            register(&state, msg).await
        }
        (&Method::POST, "/v1/auth/") => {
            let bytes = read_body(body).await?;
            require_fields(&bytes, &["login", "password"])?;
            let msg: LoginMsg = parse_json(&bytes)?;
            login(&state, msg, ip).await
        }
        (&Method::DELETE, "/v1/auth/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            logout(&state, &claims).await
        }

        // -- games --------------------------------------------------------------
        (&Method::POST, "/v1/games/create") => {
            let claims = gate.authenticate(&parts.headers, ADMIN_ONLY, ip).await?;
            let bytes = read_body(body).await?;
            require_fields(&bytes, &["name", "capacity", "image"])?;
            let msg: CreateGameMsg = parse_json(&bytes)?;
            let gameid = state
                .rdb
                .create_game(&msg.name, claims.uid, msg.capacity, &msg.image, &msg.ports)
                .await?;
            Ok(json_response(StatusCode::OK, &CreateGameResponse { gameid }))
        }
        (&Method::GET, "/v1/games/") => {
            let games = state.rdb.get_all_games().await?;
            Ok(json_response(StatusCode::OK, &games))
        }
        (&Method::GET, p) if p.starts_with("/v1/games/byid/") => {
            let gameid = parse_path_arg(p, "/v1/games/byid/")?;
            let game = state.rdb.get_game_by_id(gameid).await?;
            Ok(json_response(StatusCode::OK, &game))
        }
        (&Method::GET, p) if p.starts_with("/v1/games/byname/") => {
            let name = &p["/v1/games/byname/".len()..];
            let game = state.rdb.get_game_by_name(name).await?;
            Ok(json_response(StatusCode::OK, &game))
        }

        // -- groups -------------------------------------------------------------
        (&Method::POST, p) if p.starts_with("/v1/groups/create/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            let gameid = parse_path_arg(p, "/v1/groups/create/")?;
            let groupid = state.matchmaker.create_group(claims.uid, gameid).await?;
            Ok(json_response(StatusCode::OK, &CreateGroupResponse { groupid }))
        }
        (&Method::GET, "/v1/groups/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            match state.matchmaker.group_state(claims.uid).await {
                // On the read path an absent group is a missing resource.
                Err(ApiError::PlayerNotInGroup) => Err(ApiError::NotFound("Player not in group".to_string())),
                Err(other) => Err(other),
                Ok(view) => Ok(json_response(StatusCode::OK, &view)),
            }
        }
        (&Method::POST, p) if p.starts_with("/v1/groups/join/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            let groupid = parse_path_arg(p, "/v1/groups/join/")?;
            state.matchmaker.join_group(&claims, groupid).await?;
            Ok(empty_response())
        }
        (&Method::POST, p) if p.starts_with("/v1/groups/invite/byid/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            let target: Uuid = parse_path_arg(p, "/v1/groups/invite/byid/")?;
            state.matchmaker.invite(&claims, target).await?;
            Ok(empty_response())
        }
        (&Method::POST, p) if p.starts_with("/v1/groups/invite/byname/") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            let login = &p["/v1/groups/invite/byname/".len()..];
            state.matchmaker.invite_by_login(&claims, login).await?;
            Ok(empty_response())
        }
        (&Method::DELETE, "/v1/groups/leave") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            state.matchmaker.leave_group(&claims).await?;
            Ok(empty_response())
        }
        (&Method::DELETE, p) if p.starts_with("/v1/groups/kick/") => {
            gate.authenticate(&parts.headers, ADMIN_ONLY, ip).await?;
            let target: Uuid = parse_path_arg(p, "/v1/groups/kick/")?;
            state.matchmaker.kick_from_group(target).await?;
            Ok(empty_response())
        }
        (&Method::POST, "/v1/groups/ready") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            state.matchmaker.mark_ready(&claims).await?;
            Ok(empty_response())
        }
        (&Method::DELETE, "/v1/groups/ready") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            state.matchmaker.mark_not_ready(&claims).await?;
            Ok(empty_response())
        }
        (&Method::POST, "/v1/groups/start") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            state.matchmaker.join_queue(&claims).await?;
            Ok(empty_response())
        }

        // -- msgqueues ----------------------------------------------------------
        (&Method::GET, "/v1/msgqueues/user") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            open_stream(&state, QueueKind::User, &claims).await
        }
        (&Method::GET, "/v1/msgqueues/group") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            open_stream(&state, QueueKind::Group, &claims).await
        }
        (&Method::GET, "/v1/msgqueues/party") => {
            let claims = gate.authenticate(&parts.headers, PLAYER_OR_ADMIN, ip).await?;
            open_stream(&state, QueueKind::Party, &claims).await
        }
        (&Method::DELETE, p) if p.starts_with("/v1/msgqueues/kick/") => {
            gate.authenticate(&parts.headers, ADMIN_ONLY, ip).await?;
            let rest = &p["/v1/msgqueues/kick/".len()..];
            let (userid, kind) = rest
                .split_once("/from/")
                .ok_or_else(|| ApiError::BadRequest("Invalid kick path".to_string()))?;
            let userid: Uuid = userid
                .parse()
                .map_err(|_| ApiError::BadRequest("Invalid user id".to_string()))?;
            let kind = QueueKind::from_segment(kind)
                .ok_or_else(|| ApiError::BadRequest("Invalid queue kind".to_string()))?;
            state.streams.kick(kind, userid);
            Ok(empty_response())
        }

        _ => Err(ApiError::NotFound("Route".to_string())),
    }
}

fn parse_path_arg<T: std::str::FromStr>(path: &str, prefix: &str) -> Result<T, ApiError> {
    path[prefix.len()..]
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid path argument: {}", &path[prefix.len()..])))
}

async fn register(state: &AppState, msg: RegisterMsg) -> Result<Response<ResponseBody>, ApiError> {
    let userid = Uuid::new_v4();
    let password_hash = auth::hash_password(&msg.password)?;
    state
        .rdb
        .create_user(userid, &msg.username, &msg.email, &password_hash)
        .await?;
    info!("Account created: {userid}");
    Ok(json_response(StatusCode::OK, &RegisterResponse { userid }))
}

async fn login(state: &AppState, msg: LoginMsg, ip: IpAddr) -> Result<Response<ResponseBody>, ApiError> {
    let user = match state.rdb.get_user_by_login(&msg.login).await {
        Err(ApiError::NotFound(_)) => {
            warn!("User not found (IP: {ip})");
            return Err(ApiError::NotFound("User".to_string()));
        }
        other => other?,
    };

    if !auth::verify_password(&user.password_hash, &msg.password) {
        warn!("Wrong password for user {} (IP: {ip})", user.name);
        return Err(ApiError::Forbidden("Wrong password".to_string()));
    }

    let token = state.gate.mint_user_token(&user)?;
    info!("User connected: {}", user.userid);
    Ok(json_response(StatusCode::OK, &TokenResponse { token }))
}

async fn logout(state: &AppState, claims: &Claims) -> Result<Response<ResponseBody>, ApiError> {
    state.gate.revoke(claims).await?;

    // Self-calls so the stream kick and the group removal flow through the
    // same admin routes the rest of the world uses. 404 just means the user
    // held no stream or group.
    admin_self_call(
        state,
        &format!("{}/kick/{}/from/user", state.config.msgqueues_url, claims.uid),
    )
    .await;
    admin_self_call(state, &format!("{}/kick/{}", state.config.group_url, claims.uid)).await;

    info!("User disconnected: {}", claims.jti);
    Ok(empty_response())
}

/// DELETE `url` with a freshly minted admin token, tolerating 204 and 404.
async fn admin_self_call(state: &AppState, url: &str) {
    let token = match state.gate.mint_service_token(ClientType::Admin) {
        Ok(token) => token,
        Err(e) => {
            error!("Cannot mint service token: {e}");
            return;
        }
    };
    match state
        .http_client
        .delete(url)
        .header("Authorization", format!("Bearer: {token}"))
        .send()
        .await
    {
        Ok(res) if matches!(res.status().as_u16(), 204 | 404) => {}
        Ok(res) => error!("Error calling url {url}: {}", res.status()),
        Err(e) => error!("Error calling url {url}: {e}"),
    }
}

async fn open_stream(
    state: &Arc<AppState>,
    kind: QueueKind,
    claims: &Claims,
) -> Result<Response<ResponseBody>, ApiError> {
    let topic = match kind {
        QueueKind::User => Topic::User(claims.uid),
        QueueKind::Group => {
            let session = state.kvs.get_user(claims.uid).await?;
            Topic::Group(session.groupid)
        }
        QueueKind::Party => {
            let session = state.kvs.get_user(claims.uid).await?;
            Topic::Party(session.partyid.ok_or(ApiError::PlayerNotInParty)?)
        }
    };

    let body = state.streams.open_stream(kind, claims.uid, topic);
    Ok(
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json-seq")
            .header("Access-Control-Allow-Origin", "*")
            .body(body)
            .unwrap(),
    )
}
