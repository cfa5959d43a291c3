//! Append-only event log with per-player visibility.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::grid::Coord;
use crate::types::{EventId, PlayerId, Round};

/// Everything observable that happened during round resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameEvent {
    PcLeftHex {
        id: EventId,
        round: Round,
        player_id: PlayerId,
        from: Coord,
        to: Coord,
    },
    PcEnteredHex {
        id: EventId,
        round: Round,
        player_id: PlayerId,
        from: Coord,
        to: Coord,
    },
    PcAttackedPc {
        id: EventId,
        round: Round,
        player_id: PlayerId,
        target_id: PlayerId,
    },
}

impl GameEvent {
    pub fn id(&self) -> EventId {
        match self {
            GameEvent::PcLeftHex { id, .. }
            | GameEvent::PcEnteredHex { id, .. }
            | GameEvent::PcAttackedPc { id, .. } => *id,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            GameEvent::PcLeftHex { round, .. }
            | GameEvent::PcEnteredHex { round, .. }
            | GameEvent::PcAttackedPc { round, .. } => *round,
        }
    }

    fn set_id(&mut self, new_id: EventId) {
        match self {
            GameEvent::PcLeftHex { id, .. }
            | GameEvent::PcEnteredHex { id, .. }
            | GameEvent::PcAttackedPc { id, .. } => *id = new_id,
        }
    }
}

/// Event ids are dense `0..len`, assigned in insertion order. Each
/// player's visibility list is newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventLog {
    pub events: BTreeMap<EventId, GameEvent>,
    pub events_visible_by_player: BTreeMap<PlayerId, Vec<EventId>>,
}

impl EventLog {
    pub fn new(player_ids: impl IntoIterator<Item = PlayerId>) -> Self {
        Self {
            events: BTreeMap::new(),
            events_visible_by_player: player_ids.into_iter().map(|id| (id, Vec::new())).collect(),
        }
    }

    /// Append an event visible to `visible_to`. An event nobody can see
    /// is not recorded at all; `None` is returned in that case.
    pub fn append(&mut self, mut event: GameEvent, visible_to: &BTreeSet<PlayerId>) -> Option<EventId> {
        if visible_to.is_empty() {
            return None;
        }
        let id = self.events.len() as EventId;
        event.set_id(id);
        self.events.insert(id, event);
        for player_id in visible_to {
            self.events_visible_by_player
                .entry(*player_id)
                .or_default()
                .insert(0, id);
        }
        Some(id)
    }

    pub fn visible_for(&self, player_id: PlayerId) -> &[EventId] {
        self.events_visible_by_player
            .get(&player_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
