//! Versioned session snapshot codec.
//!
//! The wire format is JSON: structured map keys (coordinates, player
//! ids) are canonical strings, tagged unions carry a `kind`
//! discriminator, timestamps are ISO-8601 UTC at second precision.
//! Decoding upgrades older schema versions first, so any supported
//! snapshot yields a current `Session`.

use serde_json::Value as JsonValue;

use crate::error::GameError;
use crate::migrate;
use crate::session::Session;

/// Version written by this build. Bump together with a new
/// `migrate` step.
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// Top-level fields this schema version understands. Anything else on
/// a decoded snapshot is preserved in `Session::extra` and re-emitted
/// on encode, so a newer writer's fields survive a round trip through
/// an older node.
const KNOWN_FIELDS: &[&str] = &[
    "id",
    "status",
    "round",
    "round_end_time",
    "players",
    "world",
    "registered_actions",
    "events_log",
    "version",
    "rules",
];

pub fn encode_session(session: &Session) -> Result<JsonValue, GameError> {
    let mut value = serde_json::to_value(session)?;
    if let Some(obj) = value.as_object_mut() {
        for (key, unknown) in &session.extra {
            obj.entry(key.clone()).or_insert_with(|| unknown.clone());
        }
    }
    Ok(value)
}

pub fn decode_session(value: JsonValue) -> Result<Session, GameError> {
    let mut upgraded = migrate::upgrade(value)?;
    let extra = match upgraded.as_object_mut() {
        Some(obj) => {
            let unknown_keys: Vec<String> = obj
                .keys()
                .filter(|key| !KNOWN_FIELDS.contains(&key.as_str()))
                .cloned()
                .collect();
            unknown_keys
                .into_iter()
                .filter_map(|key| obj.remove(&key).map(|unknown| (key, unknown)))
                .collect()
        }
        None => {
            return Err(GameError::BadSchema {
                reason: "session snapshot is not a JSON object".to_string(),
            })
        }
    };
    let mut session: Session =
        serde_json::from_value(upgraded).map_err(|err| GameError::BadSchema {
            reason: err.to_string(),
        })?;
    session.extra = extra;
    Ok(session)
}

pub fn to_json_string(session: &Session) -> Result<String, GameError> {
    Ok(serde_json::to_string(&encode_session(session)?)?)
}

pub fn from_json_str(input: &str) -> Result<Session, GameError> {
    let value: JsonValue = serde_json::from_str(input).map_err(|err| GameError::BadSchema {
        reason: err.to_string(),
    })?;
    decode_session(value)
}
