//! Error types for the game core.

use std::fmt;

use crate::actions::ActionKind;
use crate::grid::Coord;
use crate::types::{PlayerId, Round, UserId};

/// Errors returned by registration, resolution, and the snapshot codec.
///
/// Validation failures are values handed back to the caller; only
/// `Internal` signals an invariant violation that should stop the
/// owning session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    NotAPlayer {
        user_id: UserId,
    },
    PcDead {
        player_id: PlayerId,
    },
    TargetDead {
        target_id: PlayerId,
    },
    UnknownTarget {
        target_id: PlayerId,
    },
    TargetNotInSameHex {
        player_id: PlayerId,
        target_id: PlayerId,
    },
    MoveOffGrid {
        player_id: PlayerId,
        to: Coord,
    },
    InsufficientActionPoints {
        player_id: PlayerId,
        required: i64,
        available: i64,
    },
    AlreadyRegistered {
        player_id: PlayerId,
        kind: ActionKind,
    },
    RoundEnded {
        round: Round,
    },
    SessionConcluded,
    BadSchema {
        reason: String,
    },
    InvalidVersion {
        version: i64,
    },
    Internal {
        reason: String,
    },
    Serde(String),
}

impl GameError {
    /// Canonical machine-readable code, one per error-kind family.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::NotAPlayer { .. } => "not_found",
            GameError::UnknownTarget { .. } | GameError::MoveOffGrid { .. } => "invalid_input",
            GameError::PcDead { .. }
            | GameError::TargetDead { .. }
            | GameError::TargetNotInSameHex { .. }
            | GameError::InsufficientActionPoints { .. }
            | GameError::AlreadyRegistered { .. } => "forbidden",
            GameError::RoundEnded { .. } | GameError::SessionConcluded => "state_mismatch",
            GameError::BadSchema { .. } => "bad_schema",
            GameError::InvalidVersion { .. } => "invalid_version",
            GameError::Internal { .. } | GameError::Serde(_) => "internal",
        }
    }
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameError::NotAPlayer { user_id } => {
                write!(f, "user {} is not a player in this session", user_id)
            }
            GameError::PcDead { player_id } => {
                write!(f, "player {} character is dead", player_id)
            }
            GameError::TargetDead { target_id } => {
                write!(f, "target {} character is dead", target_id)
            }
            GameError::UnknownTarget { target_id } => {
                write!(f, "unknown target player {}", target_id)
            }
            GameError::TargetNotInSameHex {
                player_id,
                target_id,
            } => write!(
                f,
                "player {} cannot attack {}: not in the same hex",
                player_id, target_id
            ),
            GameError::MoveOffGrid { player_id, to } => {
                write!(f, "player {} move lands off-grid at {}", player_id, to)
            }
            GameError::InsufficientActionPoints {
                player_id,
                required,
                available,
            } => write!(
                f,
                "player {} has {} action points, {} required",
                player_id, available, required
            ),
            GameError::AlreadyRegistered { player_id, kind } => {
                write!(f, "player {} already registered a {} this round", player_id, kind)
            }
            GameError::RoundEnded { round } => write!(f, "round {} has already ended", round),
            GameError::SessionConcluded => write!(f, "session is concluded"),
            GameError::BadSchema { reason } => write!(f, "snapshot schema invalid: {}", reason),
            GameError::InvalidVersion { version } => {
                write!(f, "unknown snapshot schema version {}", version)
            }
            GameError::Internal { reason } => write!(f, "internal invariant violation: {}", reason),
            GameError::Serde(reason) => write!(f, "serialization failed: {}", reason),
        }
    }
}

impl std::error::Error for GameError {}

impl From<serde_json::Error> for GameError {
    fn from(error: serde_json::Error) -> Self {
        GameError::Serde(error.to_string())
    }
}
