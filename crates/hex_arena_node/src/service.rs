//! The node facade: composes stores, gossip, registry, and recovery
//! into the public session API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hex_arena::{
    Grid, HexVector, PlayerId, PlayerLifeStatus, Round, Session, SessionUser, UserId,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::bus::{InMemoryBus, SessionBus};
use crate::config::NodeRuntimeConfig;
use crate::durable::{summary_from_session, DurableSummaryStore, FileSummaryStore};
use crate::error::NodeError;
use crate::gossip::{GossipEndpoint, GossipMessage, MemberBook};
use crate::handoff::HandoffStore;
use crate::recovery::{resume_all_active_sessions, RecoveryReport};
use crate::registry::PlacementRegistry;
use crate::runtime::SessionHandle;
use crate::util::{now_second, now_unix_ms};

/// Row returned by `active_sessions_for_user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSessionRef {
    pub session_id: Uuid,
    pub join_code: String,
    pub latest_round: Round,
}

/// One game-session node. Startup order follows the lifecycle
/// contract: durable store, then registry, then gossip, then recovery.
pub struct ArenaNode {
    config: NodeRuntimeConfig,
    durable: Arc<dyn DurableSummaryStore>,
    handoff: Arc<HandoffStore>,
    registry: Arc<PlacementRegistry>,
    gossip: Option<Arc<GossipEndpoint>>,
    accepting: Arc<AtomicBool>,
    pump_stop: Mutex<Option<Sender<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ArenaNode {
    /// Start with the file-backed durable store under the configured
    /// root and an in-memory session bus.
    pub fn start(config: NodeRuntimeConfig) -> Result<Arc<Self>, NodeError> {
        let durable = Arc::new(FileSummaryStore::open(&config.durable_root)?);
        Self::start_with(config, durable, Arc::new(InMemoryBus::new()))
    }

    /// Start with explicit store and bus implementations.
    pub fn start_with(
        config: NodeRuntimeConfig,
        durable: Arc<dyn DurableSummaryStore>,
        bus: Arc<dyn SessionBus>,
    ) -> Result<Arc<Self>, NodeError> {
        let gossip = match &config.gossip {
            Some(gossip_config) => Some(Arc::new(GossipEndpoint::bind(gossip_config)?)),
            None => None,
        };
        let handoff = Arc::new(HandoffStore::new(config.node_id.clone(), gossip.clone()));
        let registry = PlacementRegistry::start(
            config.clone(),
            Arc::clone(&durable),
            Arc::clone(&handoff),
            bus,
        )?;

        let node = Arc::new(Self {
            config,
            durable,
            handoff,
            registry,
            gossip,
            accepting: Arc::new(AtomicBool::new(true)),
            pump_stop: Mutex::new(None),
            pump: Mutex::new(None),
        });

        if node.gossip.is_some() {
            // Clustered start: the pump discovers peers first and runs
            // the initial recovery after the membership settles, so two
            // cold-starting nodes do not both claim every session.
            node.start_pump()?;
        } else {
            let report = resume_all_active_sessions(&node.registry)?;
            log::info!(
                "node {} started standalone; {} sessions resumed",
                node.config.node_id,
                report.resumed
            );
        }
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn registry(&self) -> &Arc<PlacementRegistry> {
        &self.registry
    }

    pub fn durable(&self) -> &Arc<dyn DurableSummaryStore> {
        &self.durable
    }

    fn ensure_accepting(&self) -> Result<(), NodeError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::Unavailable {
                reason: "node is shutting down".to_string(),
            })
        }
    }

    /// Create a session for the given users and start its runtime on
    /// this node. The join code must be unique cluster-wide; the
    /// durable creation row commits before the runtime starts.
    pub fn create_session(
        &self,
        join_code: &str,
        users: &[SessionUser],
    ) -> Result<Session, NodeError> {
        self.ensure_accepting()?;
        PlacementRegistry::validate_join_code(join_code)?;
        if users.is_empty() {
            return Err(NodeError::InvalidInput {
                reason: "a session needs at least one player".to_string(),
            });
        }
        if let Some(existing) = self.durable.by_join_code(join_code)? {
            return Err(NodeError::DuplicateJoinCode {
                join_code: existing.join_code,
            });
        }
        let session = Session::new(
            Uuid::new_v4(),
            users,
            Grid::hex_disc(self.config.rules.grid_radius),
            self.config.rules.clone(),
        )
        .map_err(NodeError::Game)?;
        self.durable
            .upsert(summary_from_session(&session, join_code, now_second())?)?;
        let handle = self.registry.start_session(join_code, session)?;
        // Return the live state: the runtime has set the first deadline.
        handle.get_session()
    }

    /// Resume a session from an external snapshot (admin or migration
    /// path). The schema migrator runs automatically.
    pub fn continue_session(
        &self,
        join_code: &str,
        snapshot: JsonValue,
    ) -> Result<SessionHandle, NodeError> {
        self.ensure_accepting()?;
        self.registry.continue_session(join_code, snapshot)
    }

    pub fn get_session_by_id(&self, session_id: &Uuid) -> Result<Session, NodeError> {
        self.registry.lookup_by_id(session_id)?.get_session()
    }

    pub fn get_session_by_join_code(&self, join_code: &str) -> Result<Session, NodeError> {
        self.registry.lookup_by_join_code(join_code)?.get_session()
    }

    pub fn get_player_status(
        &self,
        session_id: &Uuid,
        user_id: UserId,
    ) -> Result<PlayerLifeStatus, NodeError> {
        self.registry
            .lookup_by_id(session_id)?
            .get_player_status(user_id)
    }

    pub fn register_move(
        &self,
        session_id: &Uuid,
        user_id: UserId,
        vector: HexVector,
    ) -> Result<(), NodeError> {
        self.ensure_accepting()?;
        self.registry
            .lookup_by_id(session_id)?
            .register_move(user_id, vector)
    }

    pub fn register_attack(
        &self,
        session_id: &Uuid,
        user_id: UserId,
        target_id: PlayerId,
    ) -> Result<(), NodeError> {
        self.ensure_accepting()?;
        self.registry
            .lookup_by_id(session_id)?
            .register_attack(user_id, target_id)
    }

    /// Resolve the current round now. `now_override` is a test hook;
    /// production passes `None` and the runtime reads the wall clock.
    pub fn end_round(
        &self,
        session_id: &Uuid,
        now_override: Option<DateTime<Utc>>,
    ) -> Result<Session, NodeError> {
        self.ensure_accepting()?;
        self.registry.lookup_by_id(session_id)?.end_round(now_override)
    }

    /// Ask a session to stash and stop without restart.
    pub fn shutdown_session(&self, session_id: &Uuid) -> Result<(), NodeError> {
        self.registry.shutdown_session(session_id)
    }

    /// Active sessions for a user, served from the durable store.
    pub fn active_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ActiveSessionRef>, NodeError> {
        Ok(self
            .durable
            .active_for_user(user_id)?
            .into_iter()
            .map(|summary| ActiveSessionRef {
                session_id: summary.session_id,
                join_code: summary.join_code,
                latest_round: summary.latest_round,
            })
            .collect())
    }

    /// Idempotent startup hook; also invoked by the pump when
    /// membership changes.
    pub fn resume_all_active_sessions(&self) -> Result<RecoveryReport, NodeError> {
        resume_all_active_sessions(&self.registry)
    }

    fn start_pump(self: &Arc<Self>) -> Result<(), NodeError> {
        let Some(gossip) = self.gossip.clone() else {
            return Ok(());
        };
        let gossip_config = self
            .config
            .gossip
            .clone()
            .ok_or_else(|| NodeError::Internal {
                reason: "gossip endpoint without gossip config".to_string(),
            })?;
        let (stop_tx, stop_rx) = mpsc::channel();
        let weak = Arc::downgrade(self);
        let pump = thread::Builder::new()
            .name(format!("hex-arena-pump-{}", self.config.node_id))
            .spawn(move || {
                pump_loop(
                    weak,
                    gossip,
                    stop_rx,
                    Duration::from_millis(gossip_config.heartbeat_interval_ms),
                    gossip_config.peer_ttl_ms as i64,
                );
            })
            .map_err(|err| NodeError::ThreadSpawnFailed {
                reason: err.to_string(),
            })?;
        *lock(&self.pump_stop) = Some(stop_tx);
        *lock(&self.pump) = Some(pump);
        Ok(())
    }

    /// Graceful shutdown: stop accepting commands, stash every local
    /// active session (waiting out replication), announce departure,
    /// then stop the background threads.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("node {} shutting down", self.config.node_id);
        self.registry.stash_all();
        if let Some(gossip) = &self.gossip {
            let leave = GossipMessage::Leave {
                node_id: self.config.node_id.clone(),
                sent_at_ms: now_unix_ms(),
            };
            if let Err(err) = gossip.broadcast(&leave) {
                log::warn!("leave broadcast failed: {err}");
            }
        }
        if let Some(stop_tx) = lock(&self.pump_stop).take() {
            let _ = stop_tx.send(());
        }
        if let Some(pump) = lock(&self.pump).take() {
            let _ = pump.join();
        }
        self.registry.stop();
    }
}

impl Drop for ArenaNode {
    fn drop(&mut self) {
        if let Some(stop_tx) = lock(&self.pump_stop).take() {
            let _ = stop_tx.send(());
        }
        if let Some(pump) = lock(&self.pump).take() {
            // The final reference can die inside the pump itself; a
            // thread must not join itself.
            if pump.thread().id() != thread::current().id() {
                let _ = pump.join();
            }
        }
    }
}

/// Gossip pump: heartbeats out, membership and handoff replication in.
/// Runs the deferred initial recovery once the first settle window has
/// passed, then again whenever membership changes.
fn pump_loop(
    node: Weak<ArenaNode>,
    gossip: Arc<GossipEndpoint>,
    stop_rx: Receiver<()>,
    heartbeat_interval: Duration,
    peer_ttl_ms: i64,
) {
    let mut members = MemberBook::new();
    let mut last_heartbeat: Option<Instant> = None;
    let settle_deadline = Instant::now() + heartbeat_interval * 2;
    let mut initial_recovery_done = false;

    loop {
        match stop_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(node) = node.upgrade() else {
            break;
        };
        let now_ms = now_unix_ms();
        let mut membership_changed = false;

        let due = last_heartbeat
            .map(|at| at.elapsed() >= heartbeat_interval)
            .unwrap_or(true);
        if due {
            let heartbeat = GossipMessage::Heartbeat {
                node_id: node.config.node_id.clone(),
                sent_at_ms: now_ms,
            };
            if let Err(err) = gossip.broadcast(&heartbeat) {
                log::debug!("heartbeat broadcast failed: {err}");
            }
            last_heartbeat = Some(Instant::now());
        }

        let received = match gossip.drain() {
            Ok(received) => received,
            Err(err) => {
                log::warn!("gossip drain failed: {err}");
                Vec::new()
            }
        };
        for incoming in received {
            match incoming.message {
                GossipMessage::Heartbeat {
                    node_id: peer,
                    sent_at_ms: _,
                } => {
                    if peer == node.config.node_id {
                        continue;
                    }
                    gossip.remember_peer(&peer, incoming.from);
                    if members.observe(&peer, now_ms) {
                        node.registry.member_up(&peer);
                        membership_changed = true;
                        // Bring the joiner up to date with our stash.
                        for entry in node.handoff.local_entries() {
                            let message = GossipMessage::HandoffPut { entry };
                            if let Err(err) = gossip.send_to(incoming.from, &message) {
                                log::debug!("handoff re-announce failed: {err}");
                            }
                        }
                    }
                }
                GossipMessage::Leave {
                    node_id: peer,
                    sent_at_ms: _,
                } => {
                    if members.remove(&peer) {
                        gossip.forget_peer(&peer);
                        node.registry.member_down(&peer);
                        membership_changed = true;
                    }
                }
                GossipMessage::HandoffPut { entry } => {
                    let ack = GossipMessage::HandoffAck {
                        key: entry.key.clone(),
                        seq: entry.seq,
                        node_id: node.config.node_id.clone(),
                    };
                    node.handoff.apply_remote_put(entry);
                    if let Err(err) = gossip.send_to(incoming.from, &ack) {
                        log::debug!("handoff ack failed: {err}");
                    }
                }
                GossipMessage::HandoffDelete {
                    key,
                    origin_node: _,
                    deleted_at_ms,
                } => {
                    node.handoff.apply_remote_delete(&key, deleted_at_ms);
                }
                GossipMessage::HandoffAck {
                    key: _,
                    seq,
                    node_id: _,
                } => {
                    node.handoff.note_ack(seq);
                }
            }
        }

        for expired in members.prune(now_ms, peer_ttl_ms) {
            log::warn!("peer {expired} heartbeat lapsed");
            gossip.forget_peer(&expired);
            node.registry.member_down(&expired);
            membership_changed = true;
        }

        let settled = Instant::now() >= settle_deadline;
        if settled && !initial_recovery_done {
            initial_recovery_done = true;
            membership_changed = true;
        }
        // A node that is mid-shutdown must not reclaim the sessions it
        // just stashed.
        let accepting = node.accepting.load(Ordering::SeqCst);
        if membership_changed && initial_recovery_done && accepting {
            if let Err(err) = node.resume_all_active_sessions() {
                log::warn!("recovery scan failed: {err}");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
