//! End-to-end lifecycle tests on a single node: conclusion without
//! restart, durable recovery after a full stop, and recovery
//! idempotence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hex_arena::{
    encode_session, Coord, GameRules, Grid, HexVector, PlayerLifeStatus, Session, SessionStatus,
    SessionUser,
};
use hex_arena_node::{
    ArenaNode, DurableSummaryStore, InMemoryBus, InMemorySummaryStore, NodeError,
    NodeRuntimeConfig,
};
use uuid::Uuid;

fn users(count: usize) -> Vec<SessionUser> {
    (0..count)
        .map(|index| SessionUser {
            user_id: 100 + index as i64,
            display_name: format!("player-{}", index + 1),
        })
        .collect()
}

fn standalone_node(node_id: &str) -> Arc<ArenaNode> {
    let config = NodeRuntimeConfig::new(node_id, "/tmp/unused-durable-root").expect("config");
    ArenaNode::start_with(
        config,
        Arc::new(InMemorySummaryStore::new()),
        Arc::new(InMemoryBus::new()),
    )
    .expect("node")
}

fn wait_until(total_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(total_ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Two characters on one hex with one hit point each.
fn sudden_death_session() -> Session {
    let rules = GameRules {
        starting_health: 1,
        ..GameRules::default()
    };
    let mut session =
        Session::new(Uuid::new_v4(), &users(2), Grid::hex_disc(2), rules).expect("session");
    session.world.move_pc(1, Coord::new(0, 0)).expect("place 1");
    session.world.move_pc(2, Coord::new(0, 0)).expect("place 2");
    session
}

#[test]
fn concluded_session_terminates_without_restart() {
    let node = standalone_node("node-a");
    let session = sudden_death_session();
    let session_id = session.id;
    let snapshot = encode_session(&session).expect("encode");
    node.continue_session("FIN1", snapshot).expect("continue");

    node.register_attack(&session_id, 100, 2).expect("attack");
    let after = node.end_round(&session_id, None).expect("end round");
    assert_eq!(after.status, SessionStatus::Concluded);

    // The runtime exits and the supervisor removes the placement for
    // good; lookups now report the session as not alive.
    assert!(wait_until(2_000, || node.registry().placement_count() == 0));
    assert!(matches!(
        node.get_session_by_id(&session_id),
        Err(NodeError::SessionNotAlive { .. })
    ));

    let summary = node
        .durable()
        .by_id(&session_id)
        .expect("by_id")
        .expect("present");
    assert_eq!(summary.status, SessionStatus::Concluded);

    node.shutdown();
}

#[test]
fn full_game_over_the_public_api() {
    let node = standalone_node("node-b");
    let config_session = node
        .create_session("DUEL42", &users(2))
        .expect("create");
    let session_id = config_session.id;
    assert_eq!(config_session.round, 1);
    assert!(config_session.round_end_time.is_some());

    // Spawn puts the two characters on distinct hexes; walk player 2
    // onto player 1 across one round, then trade blows.
    let p1 = config_session.world.player_characters[&1].position;
    let p2 = config_session.world.player_characters[&2].position;
    let step = HexVector::new(p1.q - p2.q, p1.r - p2.r);
    node.register_move(&session_id, 101, step).expect("approach");
    let after_move = node.end_round(&session_id, None).expect("resolve move");
    assert_eq!(after_move.round, 2);
    assert_eq!(
        after_move.world.player_characters[&1].position,
        after_move.world.player_characters[&2].position
    );

    node.register_attack(&session_id, 100, 2).expect("attack");
    let after_attack = node.end_round(&session_id, None).expect("resolve attack");
    assert_eq!(
        after_attack.world.player_characters[&2].health,
        GameRules::default().starting_health - 1
    );
    assert_eq!(
        node.get_player_status(&session_id, 101).expect("status"),
        PlayerLifeStatus::Alive
    );

    let listed = node.active_sessions_for_user(101).expect("active list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, session_id);
    assert_eq!(listed[0].join_code, "DUEL42");
    assert_eq!(listed[0].latest_round, 3);

    node.shutdown();
}

#[test]
fn duplicate_join_code_is_rejected_at_creation() {
    let node = standalone_node("node-c");
    node.create_session("SAME", &users(2)).expect("first");
    let err = node
        .create_session("SAME", &users(2))
        .expect_err("duplicate");
    assert_eq!(err.code(), "conflict");
    node.shutdown();
}

#[test]
fn cold_start_recovers_active_sessions_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = NodeRuntimeConfig::new("node-a", dir.path()).expect("config");
    let first = ArenaNode::start(config).expect("first boot");
    let created = first.create_session("COLD1", &users(2)).expect("create");
    let committed = first.end_round(&created.id, None).expect("end round");
    assert_eq!(committed.round, 2);
    first.shutdown();
    drop(first);

    // A fresh process over the same durable root resumes the session
    // with at most the uncommitted registrations lost.
    let config = NodeRuntimeConfig::new("node-a", dir.path()).expect("config");
    let second = ArenaNode::start(config).expect("second boot");
    let resumed = second.get_session_by_id(&created.id).expect("resumed");
    assert_eq!(resumed.round, committed.round);
    assert_eq!(resumed.world, committed.world);
    assert_eq!(resumed.events_log, committed.events_log);

    let by_code = second
        .get_session_by_join_code("COLD1")
        .expect("by join code");
    assert_eq!(by_code.id, created.id);
    second.shutdown();
}

#[test]
fn recovery_is_idempotent_while_sessions_run() {
    let node = standalone_node("node-d");
    node.create_session("IDEM1", &users(2)).expect("one");
    node.create_session("IDEM2", &users(3)).expect("two");
    let placed = node.registry().placement_count();
    assert_eq!(placed, 2);

    let report = node.resume_all_active_sessions().expect("rescan");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.resumed, 2);
    assert_eq!(node.registry().placement_count(), placed);

    node.shutdown();
}

#[test]
fn registering_into_a_concluded_session_is_state_mismatch() {
    let node = standalone_node("node-e");
    let session = sudden_death_session();
    let session_id = session.id;
    node.continue_session("FIN2", encode_session(&session).expect("encode"))
        .expect("continue");
    node.register_attack(&session_id, 100, 2).expect("attack");
    node.end_round(&session_id, None).expect("end round");

    assert!(wait_until(2_000, || {
        node.get_session_by_id(&session_id).is_err()
    }));
    let err = node
        .register_move(&session_id, 100, HexVector::new(1, 0))
        .expect_err("gone");
    assert_eq!(err.code(), "not_found");
    node.shutdown();
}
