//! Durable summary store: the authoritative on-disk record of every
//! session, written at creation and at each round boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hex_arena::{
    encode_session, PlayerLifeStatus, Round, Session, SessionStatus, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSessionRow {
    pub user_id: UserId,
    pub player_status: PlayerLifeStatus,
}

/// One row per session. The snapshot column is the opaque versioned
/// encoding; the rest are the queryable projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableSummary {
    pub session_id: Uuid,
    pub join_code: String,
    pub status: SessionStatus,
    pub latest_round: Round,
    pub snapshot: JsonValue,
    pub users: Vec<UserSessionRow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Project a live session into its summary row.
pub fn summary_from_session(
    session: &Session,
    join_code: &str,
    now: DateTime<Utc>,
) -> Result<DurableSummary, NodeError> {
    let snapshot = encode_session(session).map_err(NodeError::Game)?;
    let users = session
        .players
        .values()
        .map(|player| UserSessionRow {
            user_id: player.user_id,
            player_status: session.player_status(player.user_id),
        })
        .collect();
    Ok(DurableSummary {
        session_id: session.id,
        join_code: join_code.to_string(),
        status: session.status,
        latest_round: session.round,
        snapshot,
        users,
        created_at: now,
        updated_at: now,
    })
}

/// Storage seam. The summary row and its user rows commit together.
pub trait DurableSummaryStore: Send + Sync {
    fn upsert(&self, summary: DurableSummary) -> Result<(), NodeError>;
    fn by_id(&self, session_id: &Uuid) -> Result<Option<DurableSummary>, NodeError>;
    fn by_join_code(&self, join_code: &str) -> Result<Option<DurableSummary>, NodeError>;
    fn active_for_user(&self, user_id: UserId) -> Result<Vec<DurableSummary>, NodeError>;
    fn all_active(&self) -> Result<Vec<DurableSummary>, NodeError>;
}

/// In-memory implementation for tests and embedded use.
#[derive(Default)]
pub struct InMemorySummaryStore {
    rows: Mutex<BTreeMap<Uuid, DurableSummary>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableSummaryStore for InMemorySummaryStore {
    fn upsert(&self, mut summary: DurableSummary) -> Result<(), NodeError> {
        let mut rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let conflict = rows.values().any(|existing| {
            existing.join_code == summary.join_code && existing.session_id != summary.session_id
        });
        if conflict {
            return Err(NodeError::DuplicateJoinCode {
                join_code: summary.join_code,
            });
        }
        if let Some(existing) = rows.get(&summary.session_id) {
            summary.created_at = existing.created_at;
        }
        rows.insert(summary.session_id, summary);
        Ok(())
    }

    fn by_id(&self, session_id: &Uuid) -> Result<Option<DurableSummary>, NodeError> {
        let rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(rows.get(session_id).cloned())
    }

    fn by_join_code(&self, join_code: &str) -> Result<Option<DurableSummary>, NodeError> {
        let rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(rows
            .values()
            .find(|summary| summary.join_code == join_code)
            .cloned())
    }

    fn active_for_user(&self, user_id: UserId) -> Result<Vec<DurableSummary>, NodeError> {
        let rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(rows
            .values()
            .filter(|summary| {
                summary.status == SessionStatus::Active
                    && summary.users.iter().any(|row| row.user_id == user_id)
            })
            .cloned()
            .collect())
    }

    fn all_active(&self) -> Result<Vec<DurableSummary>, NodeError> {
        let rows = self
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(rows
            .values()
            .filter(|summary| summary.status == SessionStatus::Active)
            .cloned()
            .collect())
    }
}

/// File-backed implementation: one JSON document per session under the
/// durable root. Writes go through a temp file and rename so a torn
/// write never replaces a committed row. Reads scan the directory,
/// which keeps the store safe for multiple node processes sharing one
/// root.
pub struct FileSummaryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSummaryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, NodeError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| NodeError::Storage {
            reason: format!("create durable root {} failed: {}", root.display(), err),
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, session_id: &Uuid) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    fn read_summary(path: &Path) -> Result<Option<DurableSummary>, NodeError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(NodeError::Storage {
                    reason: format!("read {} failed: {}", path.display(), err),
                })
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(summary) => Ok(Some(summary)),
            Err(err) => Err(NodeError::Storage {
                reason: format!("parse {} failed: {}", path.display(), err),
            }),
        }
    }

    fn scan(&self) -> Result<Vec<DurableSummary>, NodeError> {
        let mut summaries = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|err| NodeError::Storage {
            reason: format!("read durable root {} failed: {}", self.root.display(), err),
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| NodeError::Storage {
                reason: format!("list durable root failed: {}", err),
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_summary(&path) {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(err) => log::warn!("skipping unreadable summary {}: {err}", path.display()),
            }
        }
        summaries.sort_by_key(|summary| summary.session_id);
        Ok(summaries)
    }
}

impl DurableSummaryStore for FileSummaryStore {
    fn upsert(&self, mut summary: DurableSummary) -> Result<(), NodeError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for existing in self.scan()? {
            if existing.join_code == summary.join_code && existing.session_id != summary.session_id
            {
                return Err(NodeError::DuplicateJoinCode {
                    join_code: summary.join_code,
                });
            }
        }
        if let Some(existing) = Self::read_summary(&self.path_for(&summary.session_id))? {
            summary.created_at = existing.created_at;
        }
        let bytes = serde_json::to_vec_pretty(&summary).map_err(|err| NodeError::Storage {
            reason: format!("serialize summary {} failed: {}", summary.session_id, err),
        })?;
        let path = self.path_for(&summary.session_id);
        let temp = self.root.join(format!("{}.json.tmp", summary.session_id));
        fs::write(&temp, bytes).map_err(|err| NodeError::Storage {
            reason: format!("write {} failed: {}", temp.display(), err),
        })?;
        fs::rename(&temp, &path).map_err(|err| NodeError::Storage {
            reason: format!("commit {} failed: {}", path.display(), err),
        })?;
        Ok(())
    }

    fn by_id(&self, session_id: &Uuid) -> Result<Option<DurableSummary>, NodeError> {
        Self::read_summary(&self.path_for(session_id))
    }

    fn by_join_code(&self, join_code: &str) -> Result<Option<DurableSummary>, NodeError> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|summary| summary.join_code == join_code))
    }

    fn active_for_user(&self, user_id: UserId) -> Result<Vec<DurableSummary>, NodeError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|summary| {
                summary.status == SessionStatus::Active
                    && summary.users.iter().any(|row| row.user_id == user_id)
            })
            .collect())
    }

    fn all_active(&self) -> Result<Vec<DurableSummary>, NodeError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|summary| summary.status == SessionStatus::Active)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_second;
    use hex_arena::{GameRules, Grid, SessionUser};

    fn sample_session(users: &[(UserId, &str)]) -> Session {
        let users: Vec<SessionUser> = users
            .iter()
            .map(|(user_id, name)| SessionUser {
                user_id: *user_id,
                display_name: name.to_string(),
            })
            .collect();
        Session::new(Uuid::new_v4(), &users, Grid::hex_disc(2), GameRules::default())
            .expect("session")
    }

    fn exercise_store(store: &dyn DurableSummaryStore) {
        let session_a = sample_session(&[(100, "ada"), (101, "grace")]);
        let session_b = sample_session(&[(101, "grace")]);
        let now = now_second();
        store
            .upsert(summary_from_session(&session_a, "AAAA", now).expect("summary a"))
            .expect("upsert a");
        store
            .upsert(summary_from_session(&session_b, "BBBB", now).expect("summary b"))
            .expect("upsert b");

        let loaded = store
            .by_id(&session_a.id)
            .expect("by_id")
            .expect("present");
        assert_eq!(loaded.join_code, "AAAA");
        assert_eq!(loaded.latest_round, 1);

        let by_code = store
            .by_join_code("BBBB")
            .expect("by_join_code")
            .expect("present");
        assert_eq!(by_code.session_id, session_b.id);

        let for_grace = store.active_for_user(101).expect("active_for_user");
        assert_eq!(for_grace.len(), 2);
        let for_ada = store.active_for_user(100).expect("active_for_user");
        assert_eq!(for_ada.len(), 1);

        // join_code is unique across sessions
        let clash = summary_from_session(&sample_session(&[(102, "kay")]), "AAAA", now)
            .expect("summary");
        assert!(matches!(
            store.upsert(clash),
            Err(NodeError::DuplicateJoinCode { .. })
        ));

        // conclusion drops the session from the active scans
        let mut concluded = summary_from_session(&session_b, "BBBB", now).expect("summary");
        concluded.status = SessionStatus::Concluded;
        store.upsert(concluded).expect("upsert concluded");
        assert_eq!(store.all_active().expect("all_active").len(), 1);
        assert_eq!(store.active_for_user(101).expect("active").len(), 1);
    }

    #[test]
    fn in_memory_store_contract() {
        exercise_store(&InMemorySummaryStore::new());
    }

    #[test]
    fn file_store_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise_store(&FileSummaryStore::open(dir.path()).expect("open"));
    }

    #[test]
    fn file_store_preserves_created_at_across_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSummaryStore::open(dir.path()).expect("open");
        let session = sample_session(&[(100, "ada"), (101, "grace")]);
        let first = now_second();
        store
            .upsert(summary_from_session(&session, "CODE", first).expect("summary"))
            .expect("upsert");
        let later = first + chrono::Duration::seconds(90);
        store
            .upsert(summary_from_session(&session, "CODE", later).expect("summary"))
            .expect("upsert again");
        let loaded = store.by_id(&session.id).expect("by_id").expect("present");
        assert_eq!(loaded.created_at, first);
        assert_eq!(loaded.updated_at, later);
    }

    #[test]
    fn file_store_round_trips_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSummaryStore::open(dir.path()).expect("open");
        let session = sample_session(&[(100, "ada"), (101, "grace")]);
        store
            .upsert(summary_from_session(&session, "CODE", now_second()).expect("summary"))
            .expect("upsert");
        let loaded = store.by_id(&session.id).expect("by_id").expect("present");
        let decoded = hex_arena::decode_session(loaded.snapshot).expect("decode");
        assert_eq!(decoded, session);
    }
}
