//! Replicated in-memory stash for in-flight session migration.
//!
//! Entries live here only between a graceful shutdown and the next
//! pickup; the durable summary store remains authoritative. Replication
//! is last-writer-wins over gossip, which is acceptable because a key
//! has one writer at a time (the single session runtime stashing it).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::NodeError;
use crate::gossip::{GossipEndpoint, GossipMessage};
use crate::util::now_unix_ms;

pub fn handoff_key(session_id: &Uuid) -> String {
    format!("session_{session_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub key: String,
    pub session: JsonValue,
    pub origin_node: String,
    pub seq: u64,
    pub stashed_at_ms: i64,
}

impl HandoffEntry {
    /// Last-writer-wins ordering key.
    fn version(&self) -> (i64, &str) {
        (self.stashed_at_ms, self.origin_node.as_str())
    }
}

pub struct HandoffStore {
    node_id: String,
    entries: Mutex<BTreeMap<String, HandoffEntry>>,
    tombstones: Mutex<BTreeMap<String, i64>>,
    next_seq: AtomicU64,
    acks: Mutex<BTreeMap<u64, usize>>,
    ack_signal: Condvar,
    gossip: Option<Arc<GossipEndpoint>>,
}

impl HandoffStore {
    pub(crate) fn new(node_id: impl Into<String>, gossip: Option<Arc<GossipEndpoint>>) -> Self {
        Self {
            node_id: node_id.into(),
            entries: Mutex::new(BTreeMap::new()),
            tombstones: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            acks: Mutex::new(BTreeMap::new()),
            ack_signal: Condvar::new(),
            gossip: gossip.clone(),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HandoffEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store locally and broadcast to peers. Returns the sequence used
    /// for ack tracking.
    pub fn put(&self, key: &str, session: JsonValue) -> Result<u64, NodeError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = HandoffEntry {
            key: key.to_string(),
            session,
            origin_node: self.node_id.clone(),
            seq,
            stashed_at_ms: now_unix_ms(),
        };
        {
            let mut tombstones = self
                .tombstones
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tombstones.remove(key);
        }
        self.lock_entries().insert(key.to_string(), entry.clone());
        if let Some(gossip) = &self.gossip {
            gossip.broadcast(&GossipMessage::HandoffPut { entry })?;
        }
        Ok(seq)
    }

    /// `put`, then block until at least one peer acknowledged or the
    /// grace window lapses. A lapse is logged and tolerated: the
    /// durable store still holds the last round boundary.
    pub fn put_replicated(
        &self,
        key: &str,
        session: JsonValue,
        grace: Duration,
    ) -> Result<(), NodeError> {
        let seq = self.put(key, session)?;
        if self.gossip.is_none() {
            return Ok(());
        }
        let deadline = Instant::now() + grace;
        let mut acks = self
            .acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if acks.get(&seq).copied().unwrap_or(0) >= 1 {
                acks.remove(&seq);
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "handoff stash {key} not acknowledged within {}ms; proceeding",
                    grace.as_millis()
                );
                acks.remove(&seq);
                return Ok(());
            }
            let (next_acks, _) = self
                .ack_signal
                .wait_timeout(acks, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            acks = next_acks;
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.lock_entries().get(key).map(|entry| entry.session.clone())
    }

    pub fn delete(&self, key: &str) {
        let deleted_at_ms = now_unix_ms();
        self.lock_entries().remove(key);
        {
            let mut tombstones = self
                .tombstones
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tombstones.insert(key.to_string(), deleted_at_ms);
        }
        if let Some(gossip) = &self.gossip {
            let message = GossipMessage::HandoffDelete {
                key: key.to_string(),
                origin_node: self.node_id.clone(),
                deleted_at_ms,
            };
            if let Err(err) = gossip.broadcast(&message) {
                log::warn!("handoff delete broadcast failed: {err}");
            }
        }
    }

    /// Consume the stash for a session if it becomes visible within the
    /// retry window. Tolerates replication lag after a rolling restart.
    pub fn pickup(&self, session_id: &Uuid, retry: Duration, total: Duration) -> Option<JsonValue> {
        let key = handoff_key(session_id);
        let deadline = Instant::now() + total;
        loop {
            if let Some(session) = self.get(&key) {
                self.delete(&key);
                return Some(session);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(retry.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// A single immediate check, for startups that do not expect a
    /// stash (fresh creation).
    pub fn pickup_immediate(&self, session_id: &Uuid) -> Option<JsonValue> {
        let key = handoff_key(session_id);
        let session = self.get(&key)?;
        self.delete(&key);
        Some(session)
    }

    pub(crate) fn apply_remote_put(&self, entry: HandoffEntry) {
        if entry.origin_node == self.node_id {
            return;
        }
        {
            let tombstones = self
                .tombstones
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(deleted_at_ms) = tombstones.get(&entry.key) {
                if *deleted_at_ms >= entry.stashed_at_ms {
                    return;
                }
            }
        }
        let mut entries = self.lock_entries();
        match entries.get(&entry.key) {
            Some(existing) if existing.version() >= entry.version() => {}
            _ => {
                entries.insert(entry.key.clone(), entry);
            }
        }
    }

    pub(crate) fn apply_remote_delete(&self, key: &str, deleted_at_ms: i64) {
        let mut entries = self.lock_entries();
        let stale = entries
            .get(key)
            .map(|existing| existing.stashed_at_ms <= deleted_at_ms)
            .unwrap_or(true);
        if stale {
            entries.remove(key);
            drop(entries);
            let mut tombstones = self
                .tombstones
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tombstones.insert(key.to_string(), deleted_at_ms);
        }
    }

    pub(crate) fn note_ack(&self, seq: u64) {
        let mut acks = self
            .acks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *acks.entry(seq).or_insert(0) += 1;
        self.ack_signal.notify_all();
    }

    /// Entries this node originated, for re-announcing to a joining
    /// peer.
    pub(crate) fn local_entries(&self) -> Vec<HandoffEntry> {
        self.lock_entries()
            .values()
            .filter(|entry| entry.origin_node == self.node_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> HandoffStore {
        HandoffStore::new("node-a", None)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let store = store();
        let session_id = Uuid::new_v4();
        let key = handoff_key(&session_id);
        store.put(&key, json!({"round": 7})).expect("put");
        assert_eq!(store.get(&key), Some(json!({"round": 7})));
        store.delete(&key);
        assert_eq!(store.get(&key), None);
    }

    #[test]
    fn pickup_consumes_the_entry() {
        let store = store();
        let session_id = Uuid::new_v4();
        store
            .put(&handoff_key(&session_id), json!({"round": 2}))
            .expect("put");
        let found = store.pickup(
            &session_id,
            Duration::from_millis(5),
            Duration::from_millis(50),
        );
        assert_eq!(found, Some(json!({"round": 2})));
        assert_eq!(store.get(&handoff_key(&session_id)), None);
    }

    #[test]
    fn pickup_gives_up_after_the_window() {
        let store = store();
        let started = Instant::now();
        let found = store.pickup(
            &Uuid::new_v4(),
            Duration::from_millis(5),
            Duration::from_millis(40),
        );
        assert_eq!(found, None);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn newer_remote_writes_win() {
        let store = store();
        let older = HandoffEntry {
            key: "session_x".to_string(),
            session: json!({"round": 1}),
            origin_node: "node-b".to_string(),
            seq: 1,
            stashed_at_ms: 100,
        };
        let newer = HandoffEntry {
            key: "session_x".to_string(),
            session: json!({"round": 2}),
            origin_node: "node-c".to_string(),
            seq: 1,
            stashed_at_ms: 200,
        };
        store.apply_remote_put(newer.clone());
        store.apply_remote_put(older);
        assert_eq!(store.get("session_x"), Some(json!({"round": 2})));
    }

    #[test]
    fn tombstone_blocks_stale_replication() {
        let store = store();
        store.apply_remote_delete("session_x", 300);
        store.apply_remote_put(HandoffEntry {
            key: "session_x".to_string(),
            session: json!({"round": 1}),
            origin_node: "node-b".to_string(),
            seq: 1,
            stashed_at_ms: 250,
        });
        assert_eq!(store.get("session_x"), None);
    }

    #[test]
    fn put_replicated_without_gossip_returns_immediately() {
        let store = store();
        store
            .put_replicated("session_x", json!({}), Duration::from_secs(5))
            .expect("replicated");
    }
}
