/**
 * All the payloads crossing the HTTP surface and the message bus. Some are
 * not terribly meaningful or complex, but putting them all here keeps the
 * wire contract in one place.
 */
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Debug;

use crate::entity::{GameId, GroupId, PartyId, SlotId, UserId};

/// Frame terminator on the streaming endpoints: one JSON object, then this
/// byte (ASCII record separator). No length prefix.
pub const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Serialize, Deserialize)]
pub struct RegisterMsg {
    pub username: String,
    pub email: String,
    pub password: String,
}

// Redact the password from any logged form.
impl Debug for RegisterMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RegisterMsg {{ username: {:?}, email: {:?}, password: [REDACTED] }}",
            self.username, self.email
        )
    }
}

#[derive(Serialize, Deserialize)]
pub struct LoginMsg {
    /// Username or email.
    pub login: String,
    pub password: String,
}

impl Debug for LoginMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoginMsg {{ login: {:?}, password: [REDACTED] }}", self.login)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreateGameMsg {
    pub name: String,
    pub capacity: u32,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RegisterResponse {
    pub userid: UserId,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CreateGameResponse {
    pub gameid: GameId,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CreateGroupResponse {
    pub groupid: GroupId,
}

/// One row of the member list in the group-state view.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MemberInfo {
    pub id: UserId,
    pub name: String,
    pub ready: bool,
}

/// Response body of `GET /v1/groups/`.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct GroupStateMsg {
    pub state: String,
    pub members: Vec<MemberInfo>,
    pub gameid: GameId,
    pub slotid: Option<SlotId>,
    pub partyid: Option<PartyId>,
}

/// A user reference inside an event payload.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserRef {
    pub userid: UserId,
    pub username: Option<String>,
}

/// Invitation target: the group to join and the game it is for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InviteTarget {
    pub groupid: GroupId,
    pub gameid: GameId,
    pub gamename: String,
}

/// Every payload published on the message bus. The `type` tag is the wire
/// contract consumed by clients; the misspelling in the invitation event is
/// historical and load-bearing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum EventMsg {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "server:notice")]
    ServerNotice { notice: String },
    #[serde(rename = "group:user joined")]
    UserJoined { user: UserRef },
    #[serde(rename = "group:user left")]
    UserLeft { user: UserRef },
    #[serde(rename = "group:user is ready")]
    UserReady { user: UserRef },
    #[serde(rename = "group:user is not ready")]
    UserNotReady { user: UserRef },
    #[serde(rename = "group:invitation recieved")]
    InvitationReceived { from: UserRef, to: InviteTarget },
    #[serde(rename = "group:queue joined")]
    QueueJoined,
    #[serde(rename = "game:starting")]
    GameStarting { partyid: PartyId },
    #[serde(rename = "game:started")]
    GameStarted { host: String, ports: Vec<u16> },
    #[serde(rename = "game:over")]
    GameOver,
}

impl EventMsg {
    /// JSON encoding as published on the bus.
    ///
    /// # Panics
    /// Panics if serde cannot encode the event, which would be a programming
    /// error in the enum itself.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Failed to serialize event")
    }
}
