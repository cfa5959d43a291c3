//! Deterministic end-of-round resolution.
//!
//! `resolve_round` is a pure function from the pre-round session (with
//! its registered actions) to the post-round session. Phase order is
//! attacks then moves; within a phase, actions apply in ascending
//! player id. Event visibility follows the positions the phase defines:
//! attacks use pre-move positions, move events compare the pre-move and
//! post-move worlds.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::actions::RegisteredAction;
use crate::error::GameError;
use crate::events::GameEvent;
use crate::grid::{apply_vector, Coord, HexVector};
use crate::session::{truncate_to_second, Session, SessionStatus};
use crate::types::PlayerId;
use crate::world::PlayerStatus;

struct AppliedMove {
    player_id: PlayerId,
    from: Coord,
    to: Coord,
}

/// Resolve the current round and advance to the next one.
///
/// `next_round_end` becomes the new deadline (scheduling itself is the
/// session runtime's job). Errors are invariant violations and fatal to
/// the session runtime; rule violations were already rejected at
/// registration time.
pub fn resolve_round(
    mut session: Session,
    next_round_end: Option<DateTime<Utc>>,
) -> Result<Session, GameError> {
    if session.status == SessionStatus::Concluded {
        return Err(GameError::Internal {
            reason: "resolve_round on a concluded session".to_string(),
        });
    }

    let registered = std::mem::take(&mut session.registered_actions);
    let mut attacks: Vec<(PlayerId, PlayerId)> = Vec::new();
    let mut moves: Vec<(PlayerId, HexVector)> = Vec::new();
    for (player_id, actions) in &registered {
        for action in actions {
            match action {
                RegisteredAction::Attack { target_id, .. } => {
                    attacks.push((*player_id, *target_id));
                }
                RegisteredAction::Move { vector, .. } => {
                    moves.push((*player_id, *vector));
                }
            }
        }
    }

    let round = session.round;

    // Attack phase. Positions do not change here, so visibility is the
    // set of characters sharing the attacker's hex.
    for (attacker, target) in attacks {
        let target_pc = session
            .world
            .player_characters
            .get_mut(&target)
            .ok_or_else(|| GameError::Internal {
                reason: format!("attack target {target} missing at resolution"),
            })?;
        target_pc.health -= session.rules.attack_damage;
        let attacker_pos = session
            .world
            .player_characters
            .get(&attacker)
            .ok_or_else(|| GameError::Internal {
                reason: format!("attacker {attacker} missing at resolution"),
            })?
            .position;
        let visible: BTreeSet<PlayerId> =
            session.world.players_at(attacker_pos).into_iter().collect();
        session.events_log.append(
            GameEvent::PcAttackedPc {
                id: 0,
                round,
                player_id: attacker,
                target_id: target,
            },
            &visible,
        );
    }

    // Move phase: all moves apply simultaneously against the pre-move
    // snapshot, then events are derived by comparing the two worlds.
    let pre_world = session.world.clone();
    let mut applied: Vec<AppliedMove> = Vec::new();
    for (player_id, vector) in moves {
        let from = pre_world
            .player_characters
            .get(&player_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("mover {player_id} missing at resolution"),
            })?
            .position;
        let to = apply_vector(from, vector);
        if !session.world.grid.contains(to) {
            return Err(GameError::Internal {
                reason: format!("registered move for {player_id} lands off-grid at {to}"),
            });
        }
        session.world.move_pc(player_id, to)?;
        applied.push(AppliedMove { player_id, from, to });
    }
    let post_world = session.world.clone();

    // All departure events precede all arrival events within the round.
    // A departure nobody witnessed is not recorded.
    for mv in &applied {
        let stayed_behind: BTreeSet<PlayerId> = pre_world
            .players_at(mv.from)
            .into_iter()
            .filter(|witness| {
                post_world
                    .player_characters
                    .get(witness)
                    .map(|pc| pc.position != mv.to)
                    .unwrap_or(true)
            })
            .collect();
        session.events_log.append(
            GameEvent::PcLeftHex {
                id: 0,
                round,
                player_id: mv.player_id,
                from: mv.from,
                to: mv.to,
            },
            &stayed_behind,
        );
    }
    for mv in &applied {
        let arrived_with: BTreeSet<PlayerId> = post_world.players_at(mv.to).into_iter().collect();
        session.events_log.append(
            GameEvent::PcEnteredHex {
                id: 0,
                round,
                player_id: mv.player_id,
                from: mv.from,
                to: mv.to,
            },
            &arrived_with,
        );
    }

    // Kill resolution: health at or below zero moves the character out.
    let fallen: Vec<PlayerId> = session
        .world
        .player_characters
        .iter()
        .filter(|(_, pc)| pc.health <= 0)
        .map(|(id, _)| *id)
        .collect();
    for player_id in fallen {
        if let Some(pc) = session.world.player_characters.remove(&player_id) {
            session.world.dead_characters.insert(player_id, pc);
        }
        if let Some(player) = session.players.get_mut(&player_id) {
            player.status = PlayerStatus::Dead;
        }
    }

    // Survivors regain action points, capped.
    for pc in session.world.player_characters.values_mut() {
        pc.action_points = (pc.action_points + session.rules.ap_regen_per_round)
            .min(session.rules.ap_cap);
    }

    session.round += 1;
    session.round_end_time = next_round_end.map(truncate_to_second);
    if session.world.alive_count() < 2 {
        session.status = SessionStatus::Concluded;
    }
    Ok(session)
}
