//! Game rule constants, carried as configuration.

use serde::{Deserialize, Serialize};

fn default_attack_damage() -> i64 {
    1
}

fn default_cost() -> i64 {
    1
}

fn default_ap_regen() -> i64 {
    1
}

fn default_ap_cap() -> i64 {
    3
}

fn default_starting_health() -> i64 {
    3
}

fn default_starting_action_points() -> i64 {
    1
}

fn default_grid_radius() -> i64 {
    4
}

/// Numeric rules the game designer tunes. Every field has a serde
/// default so snapshots written before a rule existed still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRules {
    #[serde(default = "default_attack_damage")]
    pub attack_damage: i64,
    #[serde(default = "default_cost")]
    pub move_cost: i64,
    #[serde(default = "default_cost")]
    pub attack_cost: i64,
    #[serde(default = "default_ap_regen")]
    pub ap_regen_per_round: i64,
    #[serde(default = "default_ap_cap")]
    pub ap_cap: i64,
    #[serde(default = "default_starting_health")]
    pub starting_health: i64,
    #[serde(default = "default_starting_action_points")]
    pub starting_action_points: i64,
    #[serde(default = "default_grid_radius")]
    pub grid_radius: i64,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            attack_damage: default_attack_damage(),
            move_cost: default_cost(),
            attack_cost: default_cost(),
            ap_regen_per_round: default_ap_regen(),
            ap_cap: default_ap_cap(),
            starting_health: default_starting_health(),
            starting_action_points: default_starting_action_points(),
            grid_radius: default_grid_radius(),
        }
    }
}
