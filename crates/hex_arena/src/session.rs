//! The authoritative per-game session state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::actions::{ActionKind, RegisteredAction};
use crate::error::GameError;
use crate::events::EventLog;
use crate::grid::{apply_vector, Grid, HexVector};
use crate::rules::GameRules;
use crate::snapshot::CURRENT_SCHEMA_VERSION;
use crate::types::{PlayerId, Round, UserId};
use crate::world::{Player, PlayerStatus, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Concluded,
}

/// Player life status as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerLifeStatus {
    Alive,
    Dead,
    Unknown,
}

/// Creation input: one entry per joining user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: UserId,
    pub display_name: String,
}

/// Drop sub-second precision; deadlines and stored timestamps are
/// whole-second per the wire format.
pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.with_nanosecond(0).unwrap_or(instant)
}

/// One game: players, world, registered actions, event log, round
/// bookkeeping. Mutated only by its owning session runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub round: Round,
    pub round_end_time: Option<DateTime<Utc>>,
    pub players: BTreeMap<PlayerId, Player>,
    pub world: World,
    #[serde(default)]
    pub registered_actions: BTreeMap<PlayerId, Vec<RegisteredAction>>,
    #[serde(default)]
    pub events_log: EventLog,
    pub version: u32,
    #[serde(default)]
    pub rules: GameRules,
    /// Catch-all for fields written by a newer schema than this build.
    /// Populated and re-emitted by the snapshot codec, not by serde:
    /// flattening would break the integer-keyed sibling maps.
    #[serde(skip)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Session {
    pub fn new(
        id: Uuid,
        users: &[SessionUser],
        grid: Grid,
        rules: GameRules,
    ) -> Result<Self, GameError> {
        let mut players = BTreeMap::new();
        for (index, user) in users.iter().enumerate() {
            let player_id = index as PlayerId + 1;
            players.insert(
                player_id,
                Player {
                    id: player_id,
                    user_id: user.user_id,
                    display_name: user.display_name.clone(),
                    status: PlayerStatus::Alive,
                },
            );
        }
        let player_ids: Vec<PlayerId> = players.keys().copied().collect();
        let world = World::spawn(&player_ids, grid, &rules)?;
        Ok(Self {
            id,
            status: SessionStatus::Active,
            round: 1,
            round_end_time: None,
            players,
            world,
            registered_actions: BTreeMap::new(),
            events_log: EventLog::new(player_ids),
            version: CURRENT_SCHEMA_VERSION,
            rules,
            extra: BTreeMap::new(),
        })
    }

    pub fn player_by_user(&self, user_id: UserId) -> Option<&Player> {
        self.players.values().find(|player| player.user_id == user_id)
    }

    pub fn player_status(&self, user_id: UserId) -> PlayerLifeStatus {
        match self.player_by_user(user_id) {
            Some(player) if self.world.is_alive(player.id) => PlayerLifeStatus::Alive,
            Some(_) => PlayerLifeStatus::Dead,
            None => PlayerLifeStatus::Unknown,
        }
    }

    pub fn alive_count(&self) -> usize {
        self.world.alive_count()
    }

    pub fn has_registered(&self, player_id: PlayerId, kind: ActionKind) -> bool {
        self.registered_actions
            .get(&player_id)
            .map(|actions| actions.iter().any(|action| action.kind() == kind))
            .unwrap_or(false)
    }

    /// Shared registration gate. Returns the acting player id without
    /// mutating anything.
    fn registration_gate(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<PlayerId, GameError> {
        if self.status == SessionStatus::Concluded {
            return Err(GameError::SessionConcluded);
        }
        let player = self
            .player_by_user(user_id)
            .ok_or(GameError::NotAPlayer { user_id })?;
        if let Some(end) = self.round_end_time {
            if now > end {
                return Err(GameError::RoundEnded { round: self.round });
            }
        }
        if !self.world.is_alive(player.id) {
            return Err(GameError::PcDead { player_id: player.id });
        }
        Ok(player.id)
    }

    fn charge_action_points(&mut self, player_id: PlayerId, cost: i64) -> Result<(), GameError> {
        let pc = self
            .world
            .player_characters
            .get_mut(&player_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("living player {player_id} has no character"),
            })?;
        if pc.action_points < cost {
            return Err(GameError::InsufficientActionPoints {
                player_id,
                required: cost,
                available: pc.action_points,
            });
        }
        pc.action_points -= cost;
        Ok(())
    }

    /// Register a move for the current round. Nothing is mutated on
    /// failure.
    pub fn register_move(
        &mut self,
        user_id: UserId,
        vector: HexVector,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        let player_id = self.registration_gate(user_id, now)?;
        if self.has_registered(player_id, ActionKind::Move) {
            return Err(GameError::AlreadyRegistered {
                player_id,
                kind: ActionKind::Move,
            });
        }
        let from = self
            .world
            .player_characters
            .get(&player_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("living player {player_id} has no character"),
            })?
            .position;
        let to = apply_vector(from, vector);
        if !self.world.grid.contains(to) {
            return Err(GameError::MoveOffGrid { player_id, to });
        }
        self.charge_action_points(player_id, self.rules.move_cost)?;
        self.registered_actions
            .entry(player_id)
            .or_default()
            .push(RegisteredAction::Move { player_id, vector });
        Ok(())
    }

    /// Register an attack for the current round. Nothing is mutated on
    /// failure.
    pub fn register_attack(
        &mut self,
        user_id: UserId,
        target_id: PlayerId,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        let player_id = self.registration_gate(user_id, now)?;
        if self.has_registered(player_id, ActionKind::Attack) {
            return Err(GameError::AlreadyRegistered {
                player_id,
                kind: ActionKind::Attack,
            });
        }
        if !self.players.contains_key(&target_id) {
            return Err(GameError::UnknownTarget { target_id });
        }
        if !self.world.is_alive(target_id) {
            return Err(GameError::TargetDead { target_id });
        }
        let attacker_pos = self
            .world
            .player_characters
            .get(&player_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("living player {player_id} has no character"),
            })?
            .position;
        let target_pos = self
            .world
            .player_characters
            .get(&target_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("living target {target_id} has no character"),
            })?
            .position;
        if attacker_pos != target_pos {
            return Err(GameError::TargetNotInSameHex {
                player_id,
                target_id,
            });
        }
        self.charge_action_points(player_id, self.rules.attack_cost)?;
        self.registered_actions
            .entry(player_id)
            .or_default()
            .push(RegisteredAction::Attack {
                player_id,
                target_id,
            });
        Ok(())
    }
}
