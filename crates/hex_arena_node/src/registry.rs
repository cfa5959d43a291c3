//! Cluster placement registry and supervisor.
//!
//! Tracks which session runs where, enforces join-code uniqueness,
//! restarts crashed runtimes from the durable store, and decides
//! ownership across live members by rendezvous hashing (a consistent
//! hashing scheme: each node scores `sha256(session_id:node_id)` and
//! the highest score owns the session, so every node reaches the same
//! answer from the same member list).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hex_arena::Session;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::bus::SessionBus;
use crate::config::NodeRuntimeConfig;
use crate::durable::DurableSummaryStore;
use crate::error::NodeError;
use crate::handoff::{handoff_key, HandoffStore};
use crate::runtime::{
    spawn_session_runtime, ExitReason, RuntimeShared, SessionExit, SessionHandle,
};
use crate::util::sha256_hex;

pub const JOIN_CODE_MAX_LEN: usize = 8;

/// Public view of a placement.
#[derive(Debug, Clone)]
pub struct PlacementRecord {
    pub session_id: Uuid,
    pub join_code: String,
    pub owner_node: String,
}

struct PlacementEntry {
    join_code: String,
    generation: u64,
    handle: SessionHandle,
    worker: Option<JoinHandle<()>>,
}

struct RegistryInner {
    placements: BTreeMap<Uuid, PlacementEntry>,
    join_codes: BTreeMap<String, Uuid>,
    members: BTreeSet<String>,
}

pub struct PlacementRegistry {
    node_id: String,
    config: NodeRuntimeConfig,
    durable: Arc<dyn DurableSummaryStore>,
    handoff: Arc<HandoffStore>,
    bus: Arc<dyn SessionBus>,
    inner: Mutex<RegistryInner>,
    exit_tx: Sender<SessionExit>,
    next_generation: AtomicU64,
    running: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PlacementRegistry {
    pub(crate) fn start(
        config: NodeRuntimeConfig,
        durable: Arc<dyn DurableSummaryStore>,
        handoff: Arc<HandoffStore>,
        bus: Arc<dyn SessionBus>,
    ) -> Result<Arc<Self>, NodeError> {
        let (exit_tx, exit_rx) = mpsc::channel();
        let node_id = config.node_id.clone();
        let mut members = BTreeSet::new();
        members.insert(node_id.clone());
        let registry = Arc::new(Self {
            node_id,
            config,
            durable,
            handoff,
            bus,
            inner: Mutex::new(RegistryInner {
                placements: BTreeMap::new(),
                join_codes: BTreeMap::new(),
                members,
            }),
            exit_tx,
            next_generation: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(true)),
            supervisor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&registry);
        let running = Arc::clone(&registry.running);
        let supervisor = thread::Builder::new()
            .name(format!("hex-arena-supervisor-{}", registry.node_id))
            .spawn(move || supervisor_loop(weak, exit_rx, running))
            .map_err(|err| NodeError::ThreadSpawnFailed {
                reason: err.to_string(),
            })?;
        *lock(&registry.supervisor) = Some(supervisor);
        Ok(registry)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn shared(&self) -> RuntimeShared {
        RuntimeShared {
            durable: Arc::clone(&self.durable),
            handoff: Arc::clone(&self.handoff),
            bus: Arc::clone(&self.bus),
            exit_tx: self.exit_tx.clone(),
        }
    }

    pub(crate) fn durable(&self) -> &Arc<dyn DurableSummaryStore> {
        &self.durable
    }

    pub fn validate_join_code(join_code: &str) -> Result<(), NodeError> {
        if join_code.is_empty() || join_code.len() > JOIN_CODE_MAX_LEN {
            return Err(NodeError::InvalidJoinCode {
                join_code: join_code.to_string(),
                reason: format!("length must be 1..={JOIN_CODE_MAX_LEN}"),
            });
        }
        if !join_code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NodeError::InvalidJoinCode {
                join_code: join_code.to_string(),
                reason: "only ASCII letters and digits are allowed".to_string(),
            });
        }
        Ok(())
    }

    /// Spawn a runtime and record the placement. Caller holds the lock
    /// and has already decided this node should run the session.
    fn place_locked(
        &self,
        inner: &mut RegistryInner,
        join_code: &str,
        initial: Session,
    ) -> Result<SessionHandle, NodeError> {
        let session_id = initial.id;
        if let Some(existing) = inner.join_codes.get(join_code) {
            if *existing != session_id {
                return Err(NodeError::DuplicateJoinCode {
                    join_code: join_code.to_string(),
                });
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (handle, worker) = spawn_session_runtime(
            &self.config,
            session_id,
            join_code,
            Some(initial),
            generation,
            self.shared(),
        )?;
        inner.join_codes.insert(join_code.to_string(), session_id);
        inner.placements.insert(
            session_id,
            PlacementEntry {
                join_code: join_code.to_string(),
                generation,
                handle: handle.clone(),
                worker: Some(worker),
            },
        );
        Ok(handle)
    }

    /// Start a runtime for a freshly created session on this node.
    pub fn start_session(
        &self,
        join_code: &str,
        initial: Session,
    ) -> Result<SessionHandle, NodeError> {
        Self::validate_join_code(join_code)?;
        let session_id = initial.id;
        let mut inner = lock(&self.inner);
        if inner.placements.contains_key(&session_id) {
            return Err(NodeError::DuplicateSession { session_id });
        }
        self.place_locked(&mut inner, join_code, initial)
    }

    /// Resume a session from a snapshot. Idempotent: an existing
    /// placement is returned as-is. When this node does not own the
    /// session under the current member list the call is refused with
    /// `Unavailable` and the owner is expected to pick it up.
    pub fn continue_session(
        &self,
        join_code: &str,
        snapshot: JsonValue,
    ) -> Result<SessionHandle, NodeError> {
        Self::validate_join_code(join_code)?;
        let session_id = snapshot
            .get("id")
            .and_then(JsonValue::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                NodeError::Game(hex_arena::GameError::BadSchema {
                    reason: "snapshot has no session id".to_string(),
                })
            })?;

        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.placements.get(&session_id) {
            return Ok(entry.handle.clone());
        }
        if let Some(owner) = rendezvous_owner(&inner.members, &session_id) {
            if owner != self.node_id {
                return Err(NodeError::Unavailable {
                    reason: format!("session {session_id} is placed on node {owner}"),
                });
            }
        }
        let initial = hex_arena::decode_session(snapshot).map_err(NodeError::Game)?;
        if initial.status == hex_arena::SessionStatus::Concluded {
            return Err(NodeError::Game(hex_arena::GameError::SessionConcluded));
        }
        self.place_locked(&mut inner, join_code, initial)
    }

    pub fn lookup_by_id(&self, session_id: &Uuid) -> Result<SessionHandle, NodeError> {
        let inner = lock(&self.inner);
        inner
            .placements
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .ok_or(NodeError::SessionNotAlive {
                session_id: *session_id,
            })
    }

    pub fn lookup_by_join_code(&self, join_code: &str) -> Result<SessionHandle, NodeError> {
        let inner = lock(&self.inner);
        inner
            .join_codes
            .get(join_code)
            .and_then(|session_id| inner.placements.get(session_id))
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| NodeError::JoinCodeNotFound {
                join_code: join_code.to_string(),
            })
    }

    /// Ask a session to stash its state and stop, without restart. The
    /// actual teardown is observed asynchronously by the supervisor.
    pub fn shutdown_session(&self, session_id: &Uuid) -> Result<(), NodeError> {
        let handle = self.lookup_by_id(session_id)?;
        handle.stash()
    }

    /// Stash every local session; used on graceful node shutdown.
    pub fn stash_all(&self) {
        let handles: Vec<SessionHandle> = {
            let inner = lock(&self.inner);
            inner
                .placements
                .values()
                .map(|entry| entry.handle.clone())
                .collect()
        };
        for handle in handles {
            if let Err(err) = handle.stash() {
                log::warn!("stash of session {} failed: {err}", handle.session_id);
            }
        }
    }

    pub fn records(&self) -> Vec<PlacementRecord> {
        let inner = lock(&self.inner);
        inner
            .placements
            .iter()
            .map(|(session_id, entry)| PlacementRecord {
                session_id: *session_id,
                join_code: entry.join_code.clone(),
                owner_node: self.node_id.clone(),
            })
            .collect()
    }

    pub fn placement_count(&self) -> usize {
        lock(&self.inner).placements.len()
    }

    pub fn members(&self) -> BTreeSet<String> {
        lock(&self.inner).members.clone()
    }

    /// Returns true when the member list changed.
    pub fn member_up(&self, node_id: &str) -> bool {
        let mut inner = lock(&self.inner);
        let changed = inner.members.insert(node_id.to_string());
        if changed {
            log::info!("cluster member up: {node_id}");
        }
        changed
    }

    /// Returns true when the member list changed.
    pub fn member_down(&self, node_id: &str) -> bool {
        let mut inner = lock(&self.inner);
        let changed = inner.members.remove(node_id);
        if changed {
            log::info!("cluster member down: {node_id}");
        }
        changed
    }

    pub fn owner_of(&self, session_id: &Uuid) -> Option<String> {
        let inner = lock(&self.inner);
        rendezvous_owner(&inner.members, session_id)
    }

    /// Stop the supervisor. Does not stop session workers; callers
    /// stash them first.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(supervisor) = lock(&self.supervisor).take() {
            if supervisor.thread().id() != thread::current().id() {
                let _ = supervisor.join();
            }
        }
    }

    fn handle_exit(&self, exit: SessionExit) {
        {
            let mut inner = lock(&self.inner);
            let stale = inner
                .placements
                .get(&exit.session_id)
                .map(|entry| entry.generation != exit.generation)
                .unwrap_or(true);
            if stale {
                return;
            }
            if let Some(mut entry) = inner.placements.remove(&exit.session_id) {
                inner.join_codes.remove(&entry.join_code);
                let worker = entry.worker.take();
                // Release the entry's command sender before joining, so
                // a worker that is still parked on its channel wakes up.
                drop(entry);
                if let Some(worker) = worker {
                    let _ = worker.join();
                }
            }
        }

        match exit.reason {
            ExitReason::Concluded => {
                // Concluded sessions are terminal: clear any stash and
                // never restart.
                self.handoff.delete(&handoff_key(&exit.session_id));
                log::info!("session {} concluded; placement removed", exit.session_id);
            }
            ExitReason::Stashed => {
                log::info!("session {} stashed; placement released", exit.session_id);
            }
            ExitReason::Crashed { reason } => {
                log::warn!(
                    "session {} crashed ({reason}); restarting from durable store",
                    exit.session_id
                );
                self.restart_from_durable(&exit.session_id, &exit.join_code);
            }
        }
    }

    /// Permanent restart policy: a crash re-reads the last committed
    /// round boundary and restarts in place, regardless of ring
    /// ownership (the session was already running here). A snapshot
    /// that can no longer be decoded leaves the session unplaced
    /// instead of looping.
    fn restart_from_durable(&self, session_id: &Uuid, join_code: &str) {
        let summary = match self.durable.by_id(session_id) {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                log::warn!("session {session_id} has no durable row; not restarting");
                return;
            }
            Err(err) => {
                log::warn!("durable read for {session_id} failed; not restarting: {err}");
                return;
            }
        };
        if summary.status != hex_arena::SessionStatus::Active {
            log::info!("session {session_id} is concluded on disk; not restarting");
            return;
        }
        let initial = match hex_arena::decode_session(summary.snapshot) {
            Ok(session) => session,
            Err(err) => {
                log::error!("session {session_id} snapshot no longer decodes; not restarting: {err}");
                return;
            }
        };
        let mut inner = lock(&self.inner);
        if inner.placements.contains_key(session_id) {
            return;
        }
        match self.place_locked(&mut inner, join_code, initial) {
            Ok(_) => log::info!("session {session_id} restarted"),
            Err(err) => log::error!("session {session_id} restart failed: {err}"),
        }
    }
}

impl Drop for PlacementRegistry {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(supervisor) = lock(&self.supervisor).take() {
            if supervisor.thread().id() != thread::current().id() {
                let _ = supervisor.join();
            }
        }
    }
}

fn supervisor_loop(
    registry: Weak<PlacementRegistry>,
    exit_rx: Receiver<SessionExit>,
    running: Arc<AtomicBool>,
) {
    loop {
        match exit_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(exit) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.handle_exit(exit);
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Deterministic owner choice over the member list.
pub(crate) fn rendezvous_owner(members: &BTreeSet<String>, session_id: &Uuid) -> Option<String> {
    members
        .iter()
        .max_by_key(|node_id| sha256_hex(format!("{session_id}:{node_id}").as_bytes()))
        .cloned()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::durable::InMemorySummaryStore;
    use hex_arena::{encode_session, GameRules, Grid, SessionUser};

    fn test_registry() -> Arc<PlacementRegistry> {
        let config = NodeRuntimeConfig::new("node-a", "/tmp/unused").expect("config");
        PlacementRegistry::start(
            config,
            Arc::new(InMemorySummaryStore::new()),
            Arc::new(HandoffStore::new("node-a", None)),
            Arc::new(InMemoryBus::new()),
        )
        .expect("registry")
    }

    fn sample_session(health: i64) -> Session {
        let users = vec![
            SessionUser {
                user_id: 100,
                display_name: "ada".to_string(),
            },
            SessionUser {
                user_id: 101,
                display_name: "grace".to_string(),
            },
        ];
        let mut session = Session::new(
            Uuid::new_v4(),
            &users,
            Grid::hex_disc(2),
            GameRules::default(),
        )
        .expect("session");
        let origin = hex_arena::Coord::new(0, 0);
        session.world.move_pc(1, origin).expect("place");
        session.world.move_pc(2, origin).expect("place");
        for pc in session.world.player_characters.values_mut() {
            pc.health = health;
        }
        session
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn join_code_rules() {
        assert!(PlacementRegistry::validate_join_code("AbC123").is_ok());
        assert!(PlacementRegistry::validate_join_code("").is_err());
        assert!(PlacementRegistry::validate_join_code("LONGCODE1").is_err());
        assert!(PlacementRegistry::validate_join_code("no-dash").is_err());
    }

    #[test]
    fn start_and_lookup_by_both_keys() {
        let registry = test_registry();
        let session = sample_session(3);
        let session_id = session.id;
        registry.start_session("GAME1", session).expect("start");

        let by_id = registry.lookup_by_id(&session_id).expect("by id");
        assert_eq!(by_id.session_id, session_id);
        let by_code = registry.lookup_by_join_code("GAME1").expect("by code");
        assert_eq!(by_code.session_id, session_id);

        assert!(matches!(
            registry.lookup_by_id(&Uuid::new_v4()),
            Err(NodeError::SessionNotAlive { .. })
        ));
        assert!(matches!(
            registry.lookup_by_join_code("NOPE"),
            Err(NodeError::JoinCodeNotFound { .. })
        ));
        registry.stash_all();
    }

    #[test]
    fn duplicate_join_code_is_a_conflict() {
        let registry = test_registry();
        registry
            .start_session("GAME1", sample_session(3))
            .expect("first");
        let err = registry
            .start_session("GAME1", sample_session(3))
            .expect_err("duplicate");
        assert!(matches!(err, NodeError::DuplicateJoinCode { .. }));
        registry.stash_all();
    }

    #[test]
    fn continue_session_is_idempotent() {
        let registry = test_registry();
        let session = sample_session(3);
        let snapshot = encode_session(&session).expect("encode");
        let first = registry
            .continue_session("GAME2", snapshot.clone())
            .expect("first");
        let second = registry
            .continue_session("GAME2", snapshot)
            .expect("second");
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(registry.placement_count(), 1);
        registry.stash_all();
    }

    #[test]
    fn concluded_session_is_not_restarted() {
        let registry = test_registry();
        let session = sample_session(1);
        let session_id = session.id;
        let handle = registry.start_session("GAME3", session).expect("start");
        handle.register_attack(100, 2).expect("attack");
        let after = handle.end_round(None).expect("end round");
        assert_eq!(after.status, hex_arena::SessionStatus::Concluded);

        assert!(wait_until(2_000, || registry.placement_count() == 0));
        assert!(matches!(
            registry.lookup_by_id(&session_id),
            Err(NodeError::SessionNotAlive { .. })
        ));
    }

    #[test]
    fn crashed_session_restarts_from_durable() {
        let registry = test_registry();
        let session = sample_session(3);
        let session_id = session.id;
        let handle = registry.start_session("GAME4", session).expect("start");
        handle.register_attack(100, 2).expect("attack");
        let committed = handle.end_round(None).expect("end round");
        assert_eq!(committed.round, 2);

        // Drive the supervisor's crash path directly: the first spawn
        // got generation 1, so the exit is treated as current.
        drop(handle);
        registry.handle_exit(SessionExit {
            session_id,
            join_code: "GAME4".to_string(),
            generation: 1,
            reason: ExitReason::Crashed {
                reason: "induced for test".to_string(),
            },
        });

        let restarted = registry.lookup_by_id(&session_id).expect("restarted");
        assert!(restarted.is_running());
        let resumed = restarted.get_session().expect("get_session");
        assert_eq!(resumed.round, committed.round);
        assert_eq!(resumed.events_log, committed.events_log);
        registry.stash_all();
    }

    #[test]
    fn rendezvous_owner_is_deterministic_and_total() {
        let mut members = BTreeSet::new();
        members.insert("node-a".to_string());
        members.insert("node-b".to_string());
        members.insert("node-c".to_string());
        let session_id = Uuid::new_v4();
        let owner = rendezvous_owner(&members, &session_id).expect("owner");
        assert_eq!(
            rendezvous_owner(&members, &session_id).expect("again"),
            owner
        );
        assert!(members.contains(&owner));

        // Removing the owner reassigns; removing another member does not.
        let mut without_owner = members.clone();
        without_owner.remove(&owner);
        let next = rendezvous_owner(&without_owner, &session_id).expect("next owner");
        assert_ne!(next, owner);

        let other = members
            .iter()
            .find(|member| **member != owner)
            .expect("other")
            .clone();
        let mut without_other = members.clone();
        without_other.remove(&other);
        assert_eq!(
            rendezvous_owner(&without_other, &session_id).expect("stable"),
            owner
        );
    }

    #[test]
    fn non_owner_refuses_continue() {
        let registry = test_registry();
        // Fabricate a second member that owns everything it can own.
        registry.member_up("node-b");
        let session = sample_session(3);
        let snapshot = encode_session(&session).expect("encode");
        let result = registry.continue_session("GAME5", snapshot);
        match registry.owner_of(&session.id).expect("owner").as_str() {
            "node-a" => assert!(result.is_ok()),
            _ => assert!(matches!(result, Err(NodeError::Unavailable { .. }))),
        }
        registry.stash_all();
    }
}
