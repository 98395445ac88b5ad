//! The error taxonomy for the whole service.
//!
//! Every fallible operation returns `Result<_, ApiError>`. Domain errors are
//! values, not control flow: the matchmaking preconditions surface as 400s
//! with a stable phrase, auth failures as 401/403, storage integrity
//! violations as 400 with the backend's native message, and transient
//! backend trouble as 503 after one retry at the storage boundary.

use hyper::StatusCode;
use thiserror::Error;

use crate::entity::GroupState;

#[derive(Debug, Error, PartialEq)]
pub enum ApiError {
    // Matchmaking domain preconditions (400).
    #[error("Player already in a group")]
    PlayerInGroupAlready,
    #[error("Player not in any group")]
    PlayerNotInGroup,
    #[error("Player not in any party")]
    PlayerNotInParty,
    #[error("Group doesn't exist")]
    GroupDoesntExist,
    #[error("Group is full")]
    GroupIsFull,
    #[error("Group not ready")]
    GroupNotReady,
    #[error("Wrong group state: {current} (allowed: {})", allowed_names(.allowed))]
    WrongGroupState {
        current: GroupState,
        allowed: Vec<GroupState>,
    },
    #[error("Game doesn't exist")]
    GameDoesntExist,
    #[error("Party doesn't exist")]
    PartyDoesntExist,

    // Lookups (404).
    #[error("{0} not found")]
    NotFound(String),

    // Token gate (401/403). The phrase is the contract.
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),

    // Identity-store integrity violations, surfaced with the native message (400).
    #[error("{0}")]
    Constraint(String),

    // Malformed input (400).
    #[error("{0}")]
    BadRequest(String),

    // Backend unavailability, after the single storage-boundary retry (503).
    #[error("{0}")]
    Unavailable(String),

    // Port sampling gave up after the bounded retry (503).
    #[error("No free port in the configured game port range")]
    PortsExhausted,
}

fn allowed_names(allowed: &[GroupState]) -> String {
    allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl ApiError {
    /// HTTP status this error surfaces as.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PlayerInGroupAlready
            | ApiError::PlayerNotInGroup
            | ApiError::PlayerNotInParty
            | ApiError::GroupDoesntExist
            | ApiError::GroupIsFull
            | ApiError::GroupNotReady
            | ApiError::WrongGroupState { .. }
            | ApiError::GameDoesntExist
            | ApiError::PartyDoesntExist
            | ApiError::Constraint(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unavailable(_) | ApiError::PortsExhausted => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Shorthand for the `WrongGroupState` precondition failure.
    #[must_use]
    pub fn wrong_state(current: GroupState, allowed: &[GroupState]) -> Self {
        ApiError::WrongGroupState {
            current,
            allowed: allowed.to_vec(),
        }
    }
}
