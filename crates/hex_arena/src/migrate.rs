//! Stepwise upgrade of on-disk session snapshots.
//!
//! Each step is a pure transform of the raw JSON document from one
//! schema version to the next; `upgrade` chains them until the value
//! reaches `CURRENT_SCHEMA_VERSION`. Steps never perform I/O.

use serde_json::{json, Map, Value as JsonValue};

use crate::error::GameError;
use crate::snapshot::CURRENT_SCHEMA_VERSION;

/// Bring a snapshot of any supported prior version up to the current
/// schema. Unknown or non-positive versions are rejected; the owning
/// session must not start from such a snapshot.
pub fn upgrade(mut value: JsonValue) -> Result<JsonValue, GameError> {
    loop {
        let version = value
            .get("version")
            .and_then(JsonValue::as_i64)
            .ok_or(GameError::InvalidVersion { version: 0 })?;
        if version == CURRENT_SCHEMA_VERSION as i64 {
            return Ok(value);
        }
        if version < 1 || version > CURRENT_SCHEMA_VERSION as i64 {
            return Err(GameError::InvalidVersion { version });
        }
        value = match version {
            1 => v1_to_v2(value)?,
            2 => v2_to_v3(value)?,
            3 => v3_to_v4(value)?,
            other => return Err(GameError::InvalidVersion { version: other }),
        };
    }
}

fn object_of(value: &mut JsonValue) -> Result<&mut Map<String, JsonValue>, GameError> {
    value.as_object_mut().ok_or_else(|| GameError::BadSchema {
        reason: "session snapshot is not a JSON object".to_string(),
    })
}

/// v1 sessions predate the event log entirely.
fn v1_to_v2(mut value: JsonValue) -> Result<JsonValue, GameError> {
    let obj = object_of(&mut value)?;
    obj.entry("events_log").or_insert_with(|| {
        json!({
            "events": {},
            "events_visible_by_player": {},
        })
    });
    obj.insert("version".to_string(), json!(2));
    Ok(value)
}

/// v2 logs lacked the per-player visibility index.
fn v2_to_v3(mut value: JsonValue) -> Result<JsonValue, GameError> {
    let player_keys: Vec<String> = value
        .get("players")
        .and_then(JsonValue::as_object)
        .map(|players| players.keys().cloned().collect())
        .unwrap_or_default();
    let obj = object_of(&mut value)?;
    let log = obj
        .entry("events_log")
        .or_insert_with(|| json!({"events": {}}));
    let log_obj = log.as_object_mut().ok_or_else(|| GameError::BadSchema {
        reason: "events_log is not a JSON object".to_string(),
    })?;
    let visible = log_obj
        .entry("events_visible_by_player")
        .or_insert_with(|| json!({}));
    let visible_obj = visible.as_object_mut().ok_or_else(|| GameError::BadSchema {
        reason: "events_visible_by_player is not a JSON object".to_string(),
    })?;
    for key in player_keys {
        visible_obj.entry(key).or_insert_with(|| json!([]));
    }
    obj.insert("version".to_string(), json!(3));
    Ok(value)
}

/// v3 move events carried no round number; historical ones belong to
/// the round before the snapshot's.
fn v3_to_v4(mut value: JsonValue) -> Result<JsonValue, GameError> {
    let backfill_round = value
        .get("round")
        .and_then(JsonValue::as_i64)
        .unwrap_or(1)
        .saturating_sub(1)
        .max(0);
    let obj = object_of(&mut value)?;
    if let Some(events) = obj
        .get_mut("events_log")
        .and_then(|log| log.get_mut("events"))
        .and_then(JsonValue::as_object_mut)
    {
        for event in events.values_mut() {
            let Some(event_obj) = event.as_object_mut() else {
                continue;
            };
            let is_move_event = matches!(
                event_obj.get("kind").and_then(JsonValue::as_str),
                Some("pc_left_hex") | Some("pc_entered_hex")
            );
            if is_move_event && !event_obj.contains_key("round") {
                event_obj.insert("round".to_string(), json!(backfill_round));
            }
        }
    }
    obj.insert("version".to_string(), json!(4));
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_snapshot() -> JsonValue {
        json!({
            "id": "5f6df2a1-74fd-4f35-9d0a-93cf24810d3f",
            "status": "active",
            "round": 3,
            "round_end_time": null,
            "players": {
                "1": {"id": 1, "user_id": 100, "display_name": "ada", "status": "alive"},
                "2": {"id": 2, "user_id": 101, "display_name": "grace", "status": "alive"},
            },
            "world": {
                "grid": {"0,0": {"kind": "plain"}, "1,0": {"kind": "plain"}},
                "player_characters": {
                    "1": {"player_id": 1, "position": "0,0", "health": 3, "action_points": 1},
                    "2": {"player_id": 2, "position": "1,0", "health": 3, "action_points": 1},
                },
                "dead_characters": {},
            },
            "version": 1,
        })
    }

    #[test]
    fn current_version_passes_through_unchanged() {
        let snapshot = json!({"version": CURRENT_SCHEMA_VERSION, "round": 1});
        let upgraded = upgrade(snapshot.clone()).expect("upgrade");
        assert_eq!(upgraded, snapshot);
    }

    #[test]
    fn v1_gains_event_log_and_visibility_lists() {
        let upgraded = upgrade(v1_snapshot()).expect("upgrade");
        assert_eq!(upgraded["version"], json!(CURRENT_SCHEMA_VERSION));
        assert_eq!(upgraded["events_log"]["events"], json!({}));
        assert_eq!(
            upgraded["events_log"]["events_visible_by_player"],
            json!({"1": [], "2": []})
        );
    }

    #[test]
    fn v3_backfills_round_on_move_events_only() {
        let snapshot = json!({
            "round": 5,
            "players": {"1": {}},
            "events_log": {
                "events": {
                    "0": {"kind": "pc_left_hex", "id": 0, "player_id": 1, "from": "0,0", "to": "1,0"},
                    "1": {"kind": "pc_attacked_pc", "id": 1, "round": 2, "player_id": 1, "target_id": 2},
                },
                "events_visible_by_player": {"1": [1, 0]},
            },
            "version": 3,
        });
        let upgraded = upgrade(snapshot).expect("upgrade");
        assert_eq!(upgraded["events_log"]["events"]["0"]["round"], json!(4));
        assert_eq!(upgraded["events_log"]["events"]["1"]["round"], json!(2));
    }

    #[test]
    fn every_supported_version_reaches_current() {
        for version in 1..=CURRENT_SCHEMA_VERSION {
            let mut snapshot = v1_snapshot();
            snapshot["version"] = json!(version);
            let upgraded = upgrade(snapshot).expect("upgrade");
            assert_eq!(upgraded["version"], json!(CURRENT_SCHEMA_VERSION));
        }
    }

    #[test]
    fn unknown_versions_are_rejected() {
        for version in [json!(0), json!(-2), json!(CURRENT_SCHEMA_VERSION + 1)] {
            let snapshot = json!({"version": version, "round": 1});
            let err = upgrade(snapshot).expect_err("reject");
            assert!(matches!(err, GameError::InvalidVersion { .. }));
        }
        let missing = json!({"round": 1});
        assert!(matches!(
            upgrade(missing),
            Err(GameError::InvalidVersion { version: 0 })
        ));
    }
}
