//! Error types for the node runtime.

use std::fmt;

use hex_arena::GameError;
use uuid::Uuid;

/// Errors surfaced by node-level operations. Game-rule violations
/// arrive wrapped as `Game`; the rest are runtime concerns (placement,
/// replication, storage, timeouts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    Game(GameError),
    SessionNotAlive {
        session_id: Uuid,
    },
    JoinCodeNotFound {
        join_code: String,
    },
    DuplicateJoinCode {
        join_code: String,
    },
    DuplicateSession {
        session_id: Uuid,
    },
    InvalidJoinCode {
        join_code: String,
        reason: String,
    },
    InvalidInput {
        reason: String,
    },
    Timeout {
        operation: String,
    },
    Unavailable {
        reason: String,
    },
    Storage {
        reason: String,
    },
    Handoff {
        reason: String,
    },
    Gossip {
        reason: String,
    },
    InvalidConfig {
        reason: String,
    },
    ThreadSpawnFailed {
        reason: String,
    },
    Internal {
        reason: String,
    },
}

impl NodeError {
    /// Canonical machine-readable code, aligned with the core's codes.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Game(error) => error.code(),
            NodeError::SessionNotAlive { .. } | NodeError::JoinCodeNotFound { .. } => "not_found",
            NodeError::DuplicateJoinCode { .. } | NodeError::DuplicateSession { .. } => "conflict",
            NodeError::InvalidJoinCode { .. }
            | NodeError::InvalidInput { .. }
            | NodeError::InvalidConfig { .. } => "invalid_input",
            NodeError::Timeout { .. } => "timeout",
            NodeError::Unavailable { .. } | NodeError::Handoff { .. } => "unavailable",
            NodeError::Storage { .. }
            | NodeError::Gossip { .. }
            | NodeError::ThreadSpawnFailed { .. }
            | NodeError::Internal { .. } => "internal",
        }
    }

    /// Whether a caller retry can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout { .. } | NodeError::Unavailable { .. } | NodeError::Handoff { .. }
        )
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Game(error) => error.fmt(f),
            NodeError::SessionNotAlive { session_id } => {
                write!(f, "session {} is not alive", session_id)
            }
            NodeError::JoinCodeNotFound { join_code } => {
                write!(f, "no live session for join code {}", join_code)
            }
            NodeError::DuplicateJoinCode { join_code } => {
                write!(f, "join code {} is already in use", join_code)
            }
            NodeError::DuplicateSession { session_id } => {
                write!(f, "session {} is already placed", session_id)
            }
            NodeError::InvalidJoinCode { join_code, reason } => {
                write!(f, "invalid join code {:?}: {}", join_code, reason)
            }
            NodeError::InvalidInput { reason } => write!(f, "invalid input: {}", reason),
            NodeError::Timeout { operation } => {
                write!(f, "operation {} timed out", operation)
            }
            NodeError::Unavailable { reason } => write!(f, "temporarily unavailable: {}", reason),
            NodeError::Storage { reason } => write!(f, "durable store error: {}", reason),
            NodeError::Handoff { reason } => write!(f, "handoff store error: {}", reason),
            NodeError::Gossip { reason } => write!(f, "gossip error: {}", reason),
            NodeError::InvalidConfig { reason } => write!(f, "invalid node config: {}", reason),
            NodeError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn worker thread: {}", reason)
            }
            NodeError::Internal { reason } => write!(f, "internal error: {}", reason),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<GameError> for NodeError {
    fn from(error: GameError) -> Self {
        NodeError::Game(error)
    }
}
