//! Commands accepted by a session runtime.
//!
//! Every command carries its own reply channel; the runtime processes
//! them one at a time, which is what makes it the single writer of its
//! session state.

use std::sync::mpsc::Sender;

use chrono::{DateTime, Utc};
use hex_arena::{HexVector, PlayerId, PlayerLifeStatus, Session, UserId};

use crate::error::NodeError;

pub(crate) enum SessionCommand {
    GetSession {
        reply: Sender<Result<Session, NodeError>>,
    },
    GetPlayerStatus {
        user_id: UserId,
        reply: Sender<Result<PlayerLifeStatus, NodeError>>,
    },
    RegisterMove {
        user_id: UserId,
        vector: HexVector,
        reply: Sender<Result<(), NodeError>>,
    },
    RegisterAttack {
        user_id: UserId,
        target_id: PlayerId,
        reply: Sender<Result<(), NodeError>>,
    },
    EndRound {
        now_override: Option<DateTime<Utc>>,
        reply: Sender<Result<Session, NodeError>>,
    },
    Stash {
        reply: Sender<Result<(), NodeError>>,
    },
}
