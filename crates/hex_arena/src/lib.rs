//! Pure game core for hex-grid arena sessions.
//!
//! This crate holds everything that can be computed without I/O:
//! - Hex grid and coordinate math
//! - World model (players, characters)
//! - Append-only event log with per-player visibility
//! - Action registration and the round resolver
//! - Versioned snapshot codec and schema migrator
//!
//! The node runtime (`hex_arena_node`) owns scheduling, placement,
//! replication, and persistence on top of these types.

pub mod actions;
pub mod error;
pub mod events;
pub mod grid;
pub mod migrate;
pub mod resolver;
pub mod rules;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod world;

pub use actions::{ActionKind, RegisteredAction};
pub use error::GameError;
pub use events::{EventLog, GameEvent};
pub use grid::{apply_vector, Coord, Grid, Hex, HexVector};
pub use resolver::resolve_round;
pub use rules::GameRules;
pub use session::{
    truncate_to_second, PlayerLifeStatus, Session, SessionStatus, SessionUser,
};
pub use snapshot::{
    decode_session, encode_session, from_json_str, to_json_string, CURRENT_SCHEMA_VERSION,
};
pub use types::{EventId, PlayerId, Round, UserId};
pub use world::{Player, PlayerCharacter, PlayerStatus, World};
