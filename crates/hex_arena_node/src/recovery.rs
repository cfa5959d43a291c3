//! Cold-start recovery: resume every active session the durable store
//! knows about.

use crate::error::NodeError;
use crate::registry::PlacementRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub resumed: usize,
    pub owned_elsewhere: usize,
    pub failed: usize,
}

/// Scan the durable store and continue every active session through
/// the registry. Idempotent: sessions that are already placed are
/// returned as-is by the registry and counted as resumed. Sessions a
/// different member owns are skipped; sessions whose snapshots no
/// longer decode are logged for the operator and skipped without
/// aborting the scan.
pub fn resume_all_active_sessions(
    registry: &PlacementRegistry,
) -> Result<RecoveryReport, NodeError> {
    let mut report = RecoveryReport::default();
    for summary in registry.durable().all_active()? {
        report.scanned += 1;
        match registry.continue_session(&summary.join_code, summary.snapshot) {
            Ok(_) => report.resumed += 1,
            Err(NodeError::Unavailable { .. }) => report.owned_elsewhere += 1,
            Err(err) => {
                log::warn!(
                    "recovery of session {} ({}) failed: {err}",
                    summary.session_id,
                    summary.join_code
                );
                report.failed += 1;
            }
        }
    }
    if report.scanned > 0 {
        log::info!(
            "recovery scan: {} active, {} resumed, {} owned elsewhere, {} failed",
            report.scanned,
            report.resumed,
            report.owned_elsewhere,
            report.failed
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::config::NodeRuntimeConfig;
    use crate::durable::{summary_from_session, DurableSummaryStore, InMemorySummaryStore};
    use crate::handoff::HandoffStore;
    use crate::util::now_second;
    use hex_arena::{GameRules, Grid, Session, SessionUser};
    use std::sync::Arc;
    use uuid::Uuid;

    fn seeded_registry(sessions: usize) -> Arc<PlacementRegistry> {
        let durable = Arc::new(InMemorySummaryStore::new());
        for index in 0..sessions {
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
            let session = Session::new(
                Uuid::new_v4(),
                &users,
                Grid::hex_disc(2),
                GameRules::default(),
            )
            .expect("session");
            durable
                .upsert(
                    summary_from_session(&session, &format!("GAME{index}"), now_second())
                        .expect("summary"),
                )
                .expect("upsert");
        }
        let config = NodeRuntimeConfig::new("node-a", "/tmp/unused")
            .expect("config")
            .with_handoff_windows(0, 1, 5)
            .expect("windows");
        PlacementRegistry::start(
            config,
            durable,
            Arc::new(HandoffStore::new("node-a", None)),
            Arc::new(InMemoryBus::new()),
        )
        .expect("registry")
    }

    #[test]
    fn resumes_every_active_session() {
        let registry = seeded_registry(3);
        let report = resume_all_active_sessions(&registry).expect("recover");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.resumed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(registry.placement_count(), 3);
        registry.stash_all();
    }

    #[test]
    fn rerunning_recovery_creates_no_duplicates() {
        let registry = seeded_registry(2);
        resume_all_active_sessions(&registry).expect("first");
        let placed = registry.placement_count();
        let report = resume_all_active_sessions(&registry).expect("second");
        assert_eq!(report.resumed, 2);
        assert_eq!(registry.placement_count(), placed);
        registry.stash_all();
    }

    #[test]
    fn empty_store_recovers_nothing() {
        let registry = seeded_registry(0);
        let report = resume_all_active_sessions(&registry).expect("recover");
        assert_eq!(report, RecoveryReport::default());
    }
}
