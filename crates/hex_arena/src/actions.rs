//! Actions a player can register for the current round.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grid::HexVector;
use crate::types::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Move,
    Attack,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Move => f.write_str("move"),
            ActionKind::Attack => f.write_str("attack"),
        }
    }
}

/// A registered, not-yet-resolved action. At most one action of each
/// kind per player per round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegisteredAction {
    Move {
        player_id: PlayerId,
        vector: HexVector,
    },
    Attack {
        player_id: PlayerId,
        target_id: PlayerId,
    },
}

impl RegisteredAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RegisteredAction::Move { .. } => ActionKind::Move,
            RegisteredAction::Attack { .. } => ActionKind::Attack,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        match self {
            RegisteredAction::Move { player_id, .. }
            | RegisteredAction::Attack { player_id, .. } => *player_id,
        }
    }
}
