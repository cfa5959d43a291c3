//! Node runtime for hex arena sessions.
//!
//! Each session runs as a single-writer worker thread driven by a
//! command channel and a round deadline. Around the workers sit:
//! - a placement registry and supervisor (restart on crash, never on
//!   conclusion, rendezvous-hash ownership across members),
//! - a gossip endpoint for membership heartbeats and handoff
//!   replication,
//! - a replicated handoff stash for rolling restarts,
//! - the durable summary store written at every round boundary,
//! - cold-start recovery that resumes whatever the durable store holds.

mod bus;
mod command;
mod config;
mod durable;
mod error;
mod gossip;
mod handoff;
mod recovery;
mod registry;
mod runtime;
mod service;
mod util;

pub use bus::{session_topic, BusSubscription, InMemoryBus, SessionBus, SessionMessage};
pub use config::{GossipConfig, NodeRuntimeConfig};
pub use durable::{
    summary_from_session, DurableSummary, DurableSummaryStore, FileSummaryStore,
    InMemorySummaryStore, UserSessionRow,
};
pub use error::NodeError;
pub use handoff::{handoff_key, HandoffEntry, HandoffStore};
pub use recovery::{resume_all_active_sessions, RecoveryReport};
pub use registry::{PlacementRecord, PlacementRegistry, JOIN_CODE_MAX_LEN};
pub use runtime::{ExitReason, SessionExit, SessionHandle};
pub use service::{ActiveSessionRef, ArenaNode};
