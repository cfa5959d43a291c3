//! UDP gossip transport: membership heartbeats and handoff replication.

use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::GossipConfig;
use crate::error::NodeError;
use crate::handoff::HandoffEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum GossipMessage {
    Heartbeat {
        node_id: String,
        sent_at_ms: i64,
    },
    Leave {
        node_id: String,
        sent_at_ms: i64,
    },
    HandoffPut {
        entry: HandoffEntry,
    },
    HandoffDelete {
        key: String,
        origin_node: String,
        deleted_at_ms: i64,
    },
    HandoffAck {
        key: String,
        seq: u64,
        node_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReceivedGossip {
    pub from: SocketAddr,
    pub message: GossipMessage,
}

/// Nonblocking UDP endpoint shared by the membership pump and the
/// handoff store. Peer addresses are the configured static list plus
/// whatever heartbeats reveal.
#[derive(Debug)]
pub(crate) struct GossipEndpoint {
    socket: UdpSocket,
    bind_addr: SocketAddr,
    static_peers: Vec<SocketAddr>,
    learned: Mutex<BTreeMap<String, SocketAddr>>,
}

impl GossipEndpoint {
    pub(crate) fn bind(config: &GossipConfig) -> Result<Self, NodeError> {
        let socket = UdpSocket::bind(config.bind_addr).map_err(|err| NodeError::Gossip {
            reason: format!("bind {} failed: {}", config.bind_addr, err),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| NodeError::Gossip {
                reason: format!("set_nonblocking failed: {}", err),
            })?;
        let bind_addr = socket.local_addr().unwrap_or(config.bind_addr);
        Ok(Self {
            socket,
            bind_addr,
            static_peers: config.peers.clone(),
            learned: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Record the address a peer's heartbeat arrived from.
    pub(crate) fn remember_peer(&self, node_id: &str, addr: SocketAddr) {
        if addr == self.bind_addr || addr.port() == 0 {
            return;
        }
        let mut learned = self
            .learned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        learned.insert(node_id.to_string(), addr);
    }

    pub(crate) fn forget_peer(&self, node_id: &str) {
        let mut learned = self
            .learned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        learned.remove(node_id);
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        let learned = self
            .learned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut addrs: Vec<SocketAddr> = self.static_peers.clone();
        for addr in learned.values() {
            if !addrs.contains(addr) {
                addrs.push(*addr);
            }
        }
        addrs
    }

    pub(crate) fn broadcast(&self, message: &GossipMessage) -> Result<(), NodeError> {
        let bytes = serde_json::to_vec(message).map_err(|err| NodeError::Gossip {
            reason: format!("serialize gossip message failed: {}", err),
        })?;
        for peer in self.peer_addrs() {
            self.socket
                .send_to(&bytes, peer)
                .map_err(|err| NodeError::Gossip {
                    reason: format!("send_to {} failed: {}", peer, err),
                })?;
        }
        Ok(())
    }

    pub(crate) fn send_to(&self, addr: SocketAddr, message: &GossipMessage) -> Result<(), NodeError> {
        let bytes = serde_json::to_vec(message).map_err(|err| NodeError::Gossip {
            reason: format!("serialize gossip message failed: {}", err),
        })?;
        self.socket
            .send_to(&bytes, addr)
            .map_err(|err| NodeError::Gossip {
                reason: format!("send_to {} failed: {}", addr, err),
            })?;
        Ok(())
    }

    /// Drain everything currently queued on the socket. Frames that do
    /// not parse are dropped.
    pub(crate) fn drain(&self) -> Result<Vec<ReceivedGossip>, NodeError> {
        let mut buf = [0u8; 65_536];
        let mut messages = Vec::new();
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((size, from)) => {
                    if let Ok(message) = serde_json::from_slice::<GossipMessage>(&buf[..size]) {
                        messages.push(ReceivedGossip { from, message });
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    return Err(NodeError::Gossip {
                        reason: format!("recv_from failed: {}", err),
                    });
                }
            }
        }
        Ok(messages)
    }
}

/// Membership derived from heartbeats: a peer is up while its last
/// heartbeat is younger than the TTL.
#[derive(Debug, Default)]
pub(crate) struct MemberBook {
    last_seen_ms: BTreeMap<String, i64>,
}

impl MemberBook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns true when the peer was not previously known.
    pub(crate) fn observe(&mut self, node_id: &str, now_ms: i64) -> bool {
        self.last_seen_ms.insert(node_id.to_string(), now_ms).is_none()
    }

    pub(crate) fn remove(&mut self, node_id: &str) -> bool {
        self.last_seen_ms.remove(node_id).is_some()
    }

    /// Drop peers whose heartbeats lapsed; returns the expired ids.
    pub(crate) fn prune(&mut self, now_ms: i64, ttl_ms: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .last_seen_ms
            .iter()
            .filter(|(_, last_seen)| now_ms.saturating_sub(**last_seen) > ttl_ms)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        for node_id in &expired {
            self.last_seen_ms.remove(node_id);
        }
        expired
    }

    pub(crate) fn contains(&self, node_id: &str) -> bool {
        self.last_seen_ms.contains_key(node_id)
    }
}
