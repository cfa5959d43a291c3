//! The per-session runtime: one worker thread owning one session.
//!
//! The worker serializes commands from an mpsc channel and drives the
//! round deadline by waiting on that channel with a timeout. The
//! deadline is recomputed from live session state on every iteration,
//! so a spurious wakeup or a manually resolved round never double-fires
//! a timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hex_arena::{
    decode_session, encode_session, resolve_round, truncate_to_second, HexVector, PlayerId,
    PlayerLifeStatus, Session, SessionStatus, UserId,
};
use uuid::Uuid;

use crate::bus::{session_topic, SessionBus, SessionMessage};
use crate::command::SessionCommand;
use crate::config::NodeRuntimeConfig;
use crate::durable::{summary_from_session, DurableSummaryStore};
use crate::error::NodeError;
use crate::handoff::{handoff_key, HandoffStore};
use crate::util::now_second;

/// Why a session worker stopped. Reported to the supervisor through
/// the exit channel after the final command reply has been sent, so a
/// runtime never blocks on its own teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Concluded,
    Stashed,
    Crashed { reason: String },
}

#[derive(Debug)]
pub struct SessionExit {
    pub session_id: Uuid,
    pub join_code: String,
    pub generation: u64,
    pub reason: ExitReason,
}

/// Shared collaborators a runtime needs.
#[derive(Clone)]
pub(crate) struct RuntimeShared {
    pub durable: Arc<dyn DurableSummaryStore>,
    pub handoff: Arc<HandoffStore>,
    pub bus: Arc<dyn SessionBus>,
    pub exit_tx: Sender<SessionExit>,
}

/// Cheap, cloneable front for a running session worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub join_code: String,
    command_tx: Sender<SessionCommand>,
    running: Arc<AtomicBool>,
    command_timeout: Duration,
    stash_grace: Duration,
}

impl SessionHandle {
    fn call<T>(
        &self,
        operation: &str,
        timeout: Duration,
        build: impl FnOnce(Sender<Result<T, NodeError>>) -> SessionCommand,
    ) -> Result<T, NodeError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NodeError::SessionNotAlive {
                session_id: self.session_id,
            });
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(build(reply_tx))
            .map_err(|_| NodeError::SessionNotAlive {
                session_id: self.session_id,
            })?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_session(&self) -> Result<Session, NodeError> {
        self.call("get_session", self.command_timeout, |reply| {
            SessionCommand::GetSession { reply }
        })
    }

    pub fn get_player_status(&self, user_id: UserId) -> Result<PlayerLifeStatus, NodeError> {
        self.call("get_player_status", self.command_timeout, |reply| {
            SessionCommand::GetPlayerStatus { user_id, reply }
        })
    }

    pub fn register_move(&self, user_id: UserId, vector: HexVector) -> Result<(), NodeError> {
        self.call("register_move", self.command_timeout, |reply| {
            SessionCommand::RegisterMove {
                user_id,
                vector,
                reply,
            }
        })
    }

    pub fn register_attack(&self, user_id: UserId, target_id: PlayerId) -> Result<(), NodeError> {
        self.call("register_attack", self.command_timeout, |reply| {
            SessionCommand::RegisterAttack {
                user_id,
                target_id,
                reply,
            }
        })
    }

    pub fn end_round(&self, now_override: Option<DateTime<Utc>>) -> Result<Session, NodeError> {
        self.call("end_round", self.command_timeout, |reply| {
            SessionCommand::EndRound {
                now_override,
                reply,
            }
        })
    }

    /// Ask the worker to stash its state to the handoff store and stop.
    /// The reply waits out the replication grace window on top of the
    /// normal command timeout.
    pub fn stash(&self) -> Result<(), NodeError> {
        let timeout = self.command_timeout + self.stash_grace;
        self.call("stash", timeout, |reply| SessionCommand::Stash { reply })
    }
}

struct LoopContext {
    join_code: String,
    round_duration: Duration,
    stash_grace: Duration,
    shared: RuntimeShared,
}

/// Start a worker for the session. The starting state is resolved
/// handoff-first, then durable snapshot, then the provided initial
/// session; whichever source wins has already passed the migrator by
/// the time it is decoded.
pub(crate) fn spawn_session_runtime(
    config: &NodeRuntimeConfig,
    session_id: Uuid,
    join_code: &str,
    initial: Option<Session>,
    generation: u64,
    shared: RuntimeShared,
) -> Result<(SessionHandle, JoinHandle<()>), NodeError> {
    let session = resolve_initial_state(config, session_id, initial, &shared)?;
    if session.id != session_id {
        return Err(NodeError::Internal {
            reason: format!(
                "snapshot id {} does not match placement id {}",
                session.id, session_id
            ),
        });
    }

    let (command_tx, command_rx) = mpsc::channel();
    let running = Arc::new(AtomicBool::new(true));
    let handle = SessionHandle {
        session_id,
        join_code: join_code.to_string(),
        command_tx,
        running: Arc::clone(&running),
        command_timeout: config.command_timeout(),
        stash_grace: config.handoff_stash_grace(),
    };
    let context = LoopContext {
        join_code: join_code.to_string(),
        round_duration: config.round_duration(),
        stash_grace: config.handoff_stash_grace(),
        shared,
    };

    let thread_name = format!("hex-arena-session-{}", &session_id.to_string()[..8]);
    let worker_running = Arc::clone(&running);
    let worker = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let reason = run_session_loop(session, command_rx, &context);
            worker_running.store(false, Ordering::SeqCst);
            log::info!(
                "session {} worker exiting: {:?}",
                session_id,
                reason
            );
            let _ = context.shared.exit_tx.send(SessionExit {
                session_id,
                join_code: context.join_code.clone(),
                generation,
                reason,
            });
        })
        .map_err(|err| NodeError::ThreadSpawnFailed {
            reason: err.to_string(),
        })?;

    Ok((handle, worker))
}

fn resolve_initial_state(
    config: &NodeRuntimeConfig,
    session_id: Uuid,
    initial: Option<Session>,
    shared: &RuntimeShared,
) -> Result<Session, NodeError> {
    // A fresh creation does not wait out the pickup window; restarts
    // and migrations do, to tolerate replication lag.
    let stashed = if initial.is_some() {
        shared.handoff.pickup_immediate(&session_id)
    } else {
        shared.handoff.pickup(
            &session_id,
            config.handoff_pickup_retry(),
            config.handoff_pickup_total(),
        )
    };
    if let Some(value) = stashed {
        log::info!("session {session_id} starting from handoff stash");
        return decode_session(value).map_err(NodeError::Game);
    }
    if initial.is_none() {
        if let Some(summary) = shared.durable.by_id(&session_id)? {
            log::info!(
                "session {session_id} starting from durable snapshot at round {}",
                summary.latest_round
            );
            return decode_session(summary.snapshot).map_err(NodeError::Game);
        }
    }
    initial.ok_or(NodeError::SessionNotAlive { session_id })
}

fn run_session_loop(
    mut session: Session,
    command_rx: Receiver<SessionCommand>,
    context: &LoopContext,
) -> ExitReason {
    if session.status == SessionStatus::Active && session.round_end_time.is_none() {
        session.round_end_time = Some(next_deadline(Utc::now(), context.round_duration));
    }

    loop {
        let wait = match session.round_end_time {
            Some(end) if session.status == SessionStatus::Active => {
                let now = Utc::now();
                if end <= now {
                    Duration::ZERO
                } else {
                    (end - now).to_std().unwrap_or(Duration::ZERO)
                }
            }
            _ => context.round_duration,
        };

        match command_rx.recv_timeout(wait) {
            Ok(command) => {
                if let Some(reason) = handle_command(&mut session, command, context) {
                    return reason;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Utc::now();
                let due = session.status == SessionStatus::Active
                    && session
                        .round_end_time
                        .map(|end| end <= now)
                        .unwrap_or(false);
                if !due {
                    continue;
                }
                match advance_round(&mut session, now, context) {
                    Ok(()) => {
                        if session.status == SessionStatus::Concluded {
                            return ExitReason::Concluded;
                        }
                    }
                    Err(err) => {
                        return ExitReason::Crashed {
                            reason: err.to_string(),
                        };
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return ExitReason::Crashed {
                    reason: "command channel disconnected".to_string(),
                };
            }
        }
    }
}

/// Returns `Some(reason)` when the worker should stop.
fn handle_command(
    session: &mut Session,
    command: SessionCommand,
    context: &LoopContext,
) -> Option<ExitReason> {
    match command {
        SessionCommand::GetSession { reply } => {
            let _ = reply.send(Ok(session.clone()));
            None
        }
        SessionCommand::GetPlayerStatus { user_id, reply } => {
            let _ = reply.send(Ok(session.player_status(user_id)));
            None
        }
        SessionCommand::RegisterMove {
            user_id,
            vector,
            reply,
        } => {
            let result = session
                .register_move(user_id, vector, Utc::now())
                .map_err(NodeError::Game);
            let _ = reply.send(result);
            None
        }
        SessionCommand::RegisterAttack {
            user_id,
            target_id,
            reply,
        } => {
            let result = session
                .register_attack(user_id, target_id, Utc::now())
                .map_err(NodeError::Game);
            let _ = reply.send(result);
            None
        }
        SessionCommand::EndRound {
            now_override,
            reply,
        } => {
            if session.status == SessionStatus::Concluded {
                let _ = reply.send(Err(NodeError::Game(
                    hex_arena::GameError::SessionConcluded,
                )));
                return None;
            }
            let now = now_override.unwrap_or_else(Utc::now);
            match advance_round(session, now, context) {
                Ok(()) => {
                    let _ = reply.send(Ok(session.clone()));
                    if session.status == SessionStatus::Concluded {
                        Some(ExitReason::Concluded)
                    } else {
                        None
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    let _ = reply.send(Err(err));
                    Some(ExitReason::Crashed { reason })
                }
            }
        }
        SessionCommand::Stash { reply } => {
            if session.status == SessionStatus::Concluded {
                let _ = reply.send(Ok(()));
                return Some(ExitReason::Concluded);
            }
            let result = stash_session(session, context);
            let _ = reply.send(result);
            Some(ExitReason::Stashed)
        }
    }
}

/// Resolve the round, commit the durable summary, then broadcast. The
/// durable write precedes the caller's reply; a write failure is
/// logged and retried at the next boundary while the in-memory state
/// stays authoritative.
fn advance_round(
    session: &mut Session,
    now: DateTime<Utc>,
    context: &LoopContext,
) -> Result<(), NodeError> {
    let next_end = next_deadline(now, context.round_duration);
    let resolved = resolve_round(session.clone(), Some(next_end)).map_err(NodeError::Game)?;
    *session = resolved;

    match summary_from_session(session, &context.join_code, now_second())
        .and_then(|summary| context.shared.durable.upsert(summary))
    {
        Ok(()) => {}
        Err(err) => {
            log::warn!(
                "session {} round {} durable write failed, retrying at next boundary: {err}",
                session.id,
                session.round
            );
        }
    }

    publish(context, session.id, round_advanced_message(session));
    if session.status == SessionStatus::Concluded {
        log::info!("session {} concluded at round {}", session.id, session.round);
        publish(
            context,
            session.id,
            SessionMessage::SessionConcluded {
                session_id: session.id,
            },
        );
    }
    Ok(())
}

fn stash_session(session: &Session, context: &LoopContext) -> Result<(), NodeError> {
    let value = encode_session(session).map_err(NodeError::Game)?;
    context
        .shared
        .handoff
        .put_replicated(&handoff_key(&session.id), value, context.stash_grace)
}

fn round_advanced_message(session: &Session) -> SessionMessage {
    let snapshot = encode_session(session).unwrap_or(serde_json::Value::Null);
    SessionMessage::RoundAdvanced { session: snapshot }
}

fn publish(context: &LoopContext, session_id: Uuid, message: SessionMessage) {
    let topic = session_topic(&session_id);
    match serde_json::to_vec(&message) {
        Ok(payload) => {
            if let Err(err) = context.shared.bus.publish(&topic, &payload) {
                log::debug!("publish on {topic} failed: {err}");
            }
        }
        Err(err) => log::debug!("serialize message for {topic} failed: {err}"),
    }
}

fn next_deadline(now: DateTime<Utc>, round_duration: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(round_duration.as_millis()).unwrap_or(i64::MAX);
    truncate_to_second(now + chrono::Duration::milliseconds(millis))
}
