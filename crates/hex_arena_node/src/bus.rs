//! Per-session publish topics.
//!
//! The core publishes two message kinds on `session:<id>`; everything a
//! subscriber-facing edge does with them (filtering, fan-out, view
//! formatting) is out of scope. Publishes are fire-and-forget: a slow
//! or absent subscriber never blocks round resolution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::NodeError;

pub fn session_topic(session_id: &Uuid) -> String {
    format!("session:{session_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionMessage {
    RoundAdvanced { session: JsonValue },
    SessionConcluded { session_id: Uuid },
}

pub trait SessionBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NodeError>;
    fn subscribe(&self, topic: &str) -> Result<BusSubscription, NodeError>;
}

#[derive(Debug, Clone)]
pub struct BusSubscription {
    topic: String,
    inbox: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl BusSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inbox.remove(&self.topic).unwrap_or_default()
    }

    /// Drain and decode, dropping payloads that do not parse.
    pub fn drain_messages(&self) -> Vec<SessionMessage> {
        self.drain()
            .into_iter()
            .filter_map(|payload| serde_json::from_slice(&payload).ok())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBus {
    inbox: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NodeError> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inbox
            .entry(topic.to_string())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<BusSubscription, NodeError> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inbox.entry(topic.to_string()).or_default();
        Ok(BusSubscription {
            topic: topic.to_string(),
            inbox: Arc::clone(&self.inbox),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_delivers_to_subscribers() {
        let bus = InMemoryBus::new();
        let session_id = Uuid::new_v4();
        let topic = session_topic(&session_id);
        let subscription = bus.subscribe(&topic).expect("subscribe");

        let message = SessionMessage::SessionConcluded { session_id };
        let payload = serde_json::to_vec(&message).expect("serialize");
        bus.publish(&topic, &payload).expect("publish");

        assert_eq!(subscription.drain_messages(), vec![message]);
        assert!(subscription.drain().is_empty());
    }

    #[test]
    fn message_kind_uses_kebab_case() {
        let message = SessionMessage::RoundAdvanced {
            session: json!({"round": 2}),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["kind"], "round-advanced");
    }
}
