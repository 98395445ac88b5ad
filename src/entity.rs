//! Core domain entities shared across the crate: identity records owned by
//! the relational store, and the transient matchmaking entities (sessions,
//! groups, slots, parties) owned by the session store.
//!
//! Cross-entity references are stored as plain identifiers, never as object
//! handles, so they can be copied freely between tasks.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

/// Stable identifier for a user account.
pub type UserId = Uuid;
/// Identifier of a transient group of players.
pub type GroupId = Uuid;
/// Identifier of a matchmaking slot (a bucket of groups filling up to capacity).
pub type SlotId = Uuid;
/// Identifier of a launched game instance.
pub type PartyId = Uuid;
/// Identifier of an issued token (the `jti` claim).
pub type TokenId = Uuid;
/// Games get small stable integer ids from the relational store.
pub type GameId = i64;

/// A registered user account. Owned by the relational store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub userid: UserId,
    pub name: String,
    pub email: String,
    /// PHC-format password hash. Never serialized out to clients.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_verified: bool,
    pub is_admin: bool,
}

/// A registered game. `capacity` is the number of players a single instance
/// hosts; `internal_ports` are the container-side ports the image listens on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub gameid: GameId,
    pub name: String,
    pub ownerid: UserId,
    pub capacity: u32,
    pub image: String,
    pub internal_ports: Vec<u16>,
}

/// Lifecycle of a group. Joining is only allowed in `GroupCheck`; a group in
/// queue is immutable except for leaving; a playing group cannot shed members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum GroupState {
    #[serde(rename = "GROUP_CHECK")]
    #[strum(serialize = "GROUP_CHECK")]
    GroupCheck,
    #[serde(rename = "IN_QUEUE")]
    #[strum(serialize = "IN_QUEUE")]
    InQueue,
    #[serde(rename = "PLAYING")]
    #[strum(serialize = "PLAYING")]
    Playing,
}

/// Per-user transient session. Exists exactly while the user is in a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSession {
    pub userid: UserId,
    pub groupid: GroupId,
    pub partyid: Option<PartyId>,
    pub ready: bool,
}

/// A voluntary grouping of up to `capacity` users for one game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub groupid: GroupId,
    pub state: GroupState,
    pub members: Vec<UserId>,
    pub gameid: GameId,
    pub slotid: Option<SlotId>,
    pub partyid: Option<PartyId>,
}

/// A matchmaker-owned bucket accumulating groups until the game capacity is
/// reached. `players` is always the union of the member lists of `groups`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub slotid: SlotId,
    pub gameid: GameId,
    pub players: Vec<UserId>,
    pub groups: Vec<GroupId>,
}

/// A launched game instance: the frozen slot contents plus the host and the
/// external ports bound for the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Party {
    pub partyid: PartyId,
    pub gameid: GameId,
    pub slotid: SlotId,
    pub host: String,
    pub external_ports: Vec<u16>,
}

/// Principal kinds carried in the token `typ` claim. Endpoints declare an
/// allow-set of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClientType {
    Player,
    Admin,
    Game,
    Webapi,
    Manager,
}

/// The three stream namespaces exposed by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueKind {
    User,
    Group,
    Party,
}

impl QueueKind {
    /// Parse a path segment (`user`, `group`, `party`).
    #[must_use]
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "user" => Some(QueueKind::User),
            "group" => Some(QueueKind::Group),
            "party" => Some(QueueKind::Party),
            _ => None,
        }
    }
}
