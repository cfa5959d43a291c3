//! Player characters and the session world.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::grid::{Coord, Grid};
use crate::rules::GameRules;
use crate::types::{PlayerId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Alive,
    Dead,
}

/// A session participant. `id` is session-local; `user_id` ties back to
/// the external account system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub user_id: UserId,
    pub display_name: String,
    pub status: PlayerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCharacter {
    pub player_id: PlayerId,
    pub position: Coord,
    pub health: i64,
    pub action_points: i64,
}

impl PlayerCharacter {
    pub fn is_alive(&self) -> bool {
        self.health > 0
    }
}

/// Grid plus characters. A player id appears in exactly one of
/// `player_characters` and `dead_characters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    pub grid: Grid,
    pub player_characters: BTreeMap<PlayerId, PlayerCharacter>,
    #[serde(default)]
    pub dead_characters: BTreeMap<PlayerId, PlayerCharacter>,
}

impl World {
    /// Place one character per player on the grid, deterministically:
    /// players in ascending id order take coordinates in ascending
    /// `(q, r)` order.
    pub fn spawn(player_ids: &[PlayerId], grid: Grid, rules: &GameRules) -> Result<Self, GameError> {
        if grid.len() < player_ids.len() {
            return Err(GameError::Internal {
                reason: format!(
                    "grid of {} hexes cannot seat {} players",
                    grid.len(),
                    player_ids.len()
                ),
            });
        }
        let mut sorted = player_ids.to_vec();
        sorted.sort_unstable();
        let mut player_characters = BTreeMap::new();
        for (player_id, position) in sorted.into_iter().zip(grid.coords()) {
            player_characters.insert(
                player_id,
                PlayerCharacter {
                    player_id,
                    position,
                    health: rules.starting_health,
                    action_points: rules.starting_action_points,
                },
            );
        }
        Ok(Self {
            grid,
            player_characters,
            dead_characters: BTreeMap::new(),
        })
    }

    /// Living characters on `coord`, ascending player id.
    pub fn pcs_at(&self, coord: Coord) -> Vec<&PlayerCharacter> {
        self.player_characters
            .values()
            .filter(|pc| pc.position == coord)
            .collect()
    }

    /// Ids of living characters on `coord`, ascending.
    pub fn players_at(&self, coord: Coord) -> Vec<PlayerId> {
        self.player_characters
            .values()
            .filter(|pc| pc.position == coord)
            .map(|pc| pc.player_id)
            .collect()
    }

    /// Reposition a living character. The caller guarantees the id is
    /// present; a miss is an invariant violation, not a game rule.
    pub fn move_pc(&mut self, player_id: PlayerId, new_coord: Coord) -> Result<(), GameError> {
        let pc = self
            .player_characters
            .get_mut(&player_id)
            .ok_or_else(|| GameError::Internal {
                reason: format!("move_pc on unknown player {player_id}"),
            })?;
        pc.position = new_coord;
        Ok(())
    }

    pub fn is_alive(&self, player_id: PlayerId) -> bool {
        self.player_characters
            .get(&player_id)
            .map(PlayerCharacter::is_alive)
            .unwrap_or(false)
    }

    pub fn alive_count(&self) -> usize {
        self.player_characters
            .values()
            .filter(|pc| pc.is_alive())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::HexVector;

    fn small_world(player_ids: &[PlayerId]) -> World {
        World::spawn(player_ids, Grid::hex_disc(2), &GameRules::default()).expect("spawn")
    }

    #[test]
    fn spawn_is_deterministic_and_on_grid() {
        let world_a = small_world(&[1, 2, 3]);
        let world_b = small_world(&[3, 1, 2]);
        assert_eq!(world_a, world_b);
        for pc in world_a.player_characters.values() {
            assert!(world_a.grid.contains(pc.position));
        }
    }

    #[test]
    fn spawn_rejects_overfull_grid() {
        let result = World::spawn(&[1, 2], Grid::hex_disc(0), &GameRules::default());
        assert!(matches!(result, Err(GameError::Internal { .. })));
    }

    #[test]
    fn pcs_at_orders_by_player_id() {
        let mut world = small_world(&[1, 2, 3]);
        let target = Coord::new(0, 0);
        for id in [3, 1] {
            world.move_pc(id, target).expect("move");
        }
        let ids: Vec<PlayerId> = world.pcs_at(target).iter().map(|pc| pc.player_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(world.players_at(target), vec![1, 3]);
    }

    #[test]
    fn move_pc_updates_position() {
        let mut world = small_world(&[1]);
        let from = world.player_characters[&1].position;
        let to = crate::grid::apply_vector(from, HexVector::new(1, 0));
        world.move_pc(1, to).expect("move");
        assert_eq!(world.player_characters[&1].position, to);
    }

    #[test]
    fn move_pc_on_unknown_player_is_internal() {
        let mut world = small_world(&[1]);
        let result = world.move_pc(9, Coord::new(0, 0));
        assert!(matches!(result, Err(GameError::Internal { .. })));
    }
}
