//! Node runtime configuration.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hex_arena::GameRules;

use crate::error::NodeError;

/// UDP gossip transport settings. When absent the node runs standalone
/// (a single-member cluster with no handoff replication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    pub bind_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub heartbeat_interval_ms: u64,
    pub peer_ttl_ms: u64,
}

impl GossipConfig {
    pub fn new(bind_addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self, NodeError> {
        if peers.is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "gossip peers cannot be empty".to_string(),
            });
        }
        let deduped: BTreeSet<SocketAddr> = peers
            .into_iter()
            .filter(|peer| *peer != bind_addr)
            .collect();
        if deduped.is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "gossip peers cannot consist solely of the bind address".to_string(),
            });
        }
        Ok(Self {
            bind_addr,
            peers: deduped.into_iter().collect(),
            heartbeat_interval_ms: 500,
            peer_ttl_ms: 2_000,
        })
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Result<Self, NodeError> {
        if interval_ms == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "heartbeat_interval_ms must be positive".to_string(),
            });
        }
        self.heartbeat_interval_ms = interval_ms;
        Ok(self)
    }

    pub fn with_peer_ttl_ms(mut self, ttl_ms: u64) -> Result<Self, NodeError> {
        if ttl_ms == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "peer_ttl_ms must be positive".to_string(),
            });
        }
        self.peer_ttl_ms = ttl_ms;
        Ok(self)
    }
}

/// Per-node runtime settings. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRuntimeConfig {
    pub node_id: String,
    pub durable_root: PathBuf,
    pub round_duration_ms: u64,
    pub command_timeout_ms: u64,
    pub handoff_stash_grace_ms: u64,
    pub handoff_pickup_retry_ms: u64,
    pub handoff_pickup_total_ms: u64,
    pub gossip: Option<GossipConfig>,
    pub rules: GameRules,
}

impl NodeRuntimeConfig {
    pub fn new(
        node_id: impl Into<String>,
        durable_root: impl Into<PathBuf>,
    ) -> Result<Self, NodeError> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "node_id cannot be empty".to_string(),
            });
        }
        let durable_root = durable_root.into();
        if durable_root.as_os_str().is_empty() {
            return Err(NodeError::InvalidConfig {
                reason: "durable_root cannot be empty".to_string(),
            });
        }
        Ok(Self {
            node_id,
            durable_root,
            round_duration_ms: 30_000,
            command_timeout_ms: 5_000,
            handoff_stash_grace_ms: 2_000,
            handoff_pickup_retry_ms: 25,
            handoff_pickup_total_ms: 250,
            gossip: None,
            rules: GameRules::default(),
        })
    }

    pub fn with_round_duration_ms(mut self, duration_ms: u64) -> Result<Self, NodeError> {
        // Deadlines are stored at second precision, so anything shorter
        // than a second would resolve rounds back to back.
        if duration_ms < 1_000 {
            return Err(NodeError::InvalidConfig {
                reason: "round_duration_ms must be at least 1000".to_string(),
            });
        }
        self.round_duration_ms = duration_ms;
        Ok(self)
    }

    pub fn with_command_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, NodeError> {
        if timeout_ms == 0 {
            return Err(NodeError::InvalidConfig {
                reason: "command_timeout_ms must be positive".to_string(),
            });
        }
        self.command_timeout_ms = timeout_ms;
        Ok(self)
    }

    pub fn with_handoff_windows(
        mut self,
        stash_grace_ms: u64,
        pickup_retry_ms: u64,
        pickup_total_ms: u64,
    ) -> Result<Self, NodeError> {
        if pickup_retry_ms == 0 || pickup_retry_ms > pickup_total_ms {
            return Err(NodeError::InvalidConfig {
                reason: "pickup retry must be positive and no longer than the total window"
                    .to_string(),
            });
        }
        self.handoff_stash_grace_ms = stash_grace_ms;
        self.handoff_pickup_retry_ms = pickup_retry_ms;
        self.handoff_pickup_total_ms = pickup_total_ms;
        Ok(self)
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = Some(gossip);
        self
    }

    pub fn with_rules(mut self, rules: GameRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_duration_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn handoff_stash_grace(&self) -> Duration {
        Duration::from_millis(self.handoff_stash_grace_ms)
    }

    pub fn handoff_pickup_retry(&self) -> Duration {
        Duration::from_millis(self.handoff_pickup_retry_ms)
    }

    pub fn handoff_pickup_total(&self) -> Duration {
        Duration::from_millis(self.handoff_pickup_total_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_empty_node_id() {
        let result = NodeRuntimeConfig::new("  ", "/tmp/arena");
        assert!(matches!(result, Err(NodeError::InvalidConfig { .. })));
    }

    #[test]
    fn config_rejects_sub_second_round_duration() {
        let result = NodeRuntimeConfig::new("node-a", "/tmp/arena")
            .expect("base")
            .with_round_duration_ms(500);
        assert!(matches!(result, Err(NodeError::InvalidConfig { .. })));
    }

    #[test]
    fn pickup_retry_cannot_exceed_total_window() {
        let result = NodeRuntimeConfig::new("node-a", "/tmp/arena")
            .expect("base")
            .with_handoff_windows(1_000, 500, 250);
        assert!(matches!(result, Err(NodeError::InvalidConfig { .. })));
    }

    #[test]
    fn gossip_peers_are_deduped_and_exclude_bind() {
        let bind: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let gossip = GossipConfig::new(bind, vec![peer, peer, bind]).expect("gossip");
        assert_eq!(gossip.peers, vec![peer]);
    }

    #[test]
    fn gossip_rejects_empty_peers() {
        let bind: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(matches!(
            GossipConfig::new(bind, vec![]),
            Err(NodeError::InvalidConfig { .. })
        ));
        assert!(matches!(
            GossipConfig::new(bind, vec![bind]),
            Err(NodeError::InvalidConfig { .. })
        ));
    }
}
