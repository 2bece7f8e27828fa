//! Interfaces to the host automation platform.
//!
//! The message transport and the platform's entity storage are owned by the
//! host. The coordinator only talks to them through [`Publisher`] and
//! [`EntityStore`]; this module also provides channel-backed and in-memory
//! implementations for embedding and testing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Namespace the service mirrors its own state entities into.
pub const APP_NAMESPACE: &str = "mqtt";

/// An outbound message for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

/// Outbound message transport
pub trait Publisher: Send {
    fn publish(&mut self, topic: &str, payload: &str);
}

/// Entity state storage of the host platform
pub trait EntityStore: Send {
    fn exists(&self, namespace: &str, entity_id: &str) -> bool;
    fn get_state(&self, namespace: &str, entity_id: &str) -> Option<String>;
    fn set_state(&mut self, namespace: &str, entity_id: &str, state: &str, attributes: Value);
}

// =============================================================================
// Publishers
// =============================================================================

/// Forwards outbound messages to a tokio channel drained by the transport.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&mut self, topic: &str, payload: &str) {
        let message = Outbound {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        if self.tx.send(message).is_err() {
            log::warn!("Transport channel closed, dropped message for {}", topic);
        }
    }
}

/// Keeps every published message in a shared log.
///
/// Clones share the same log, so a clone kept outside the coordinator sees
/// everything the coordinator published.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<Outbound>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Outbound> {
        self.messages.lock().clone()
    }

    /// Remove and return everything published so far.
    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.payloads_for(topic).pop()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &str) {
        self.messages.lock().push(Outbound {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }
}

// =============================================================================
// Entity store
// =============================================================================

/// State and attributes of one host entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub state: String,
    pub attributes: Value,
}

/// Shared in-memory entity store, keyed by namespace and entity id.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntityStore {
    entities: Arc<Mutex<HashMap<(String, String), EntityState>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, entity_id: &str) -> Option<EntityState> {
        self.entities
            .lock()
            .get(&(namespace.to_string(), entity_id.to_string()))
            .cloned()
    }

    pub fn remove(&self, namespace: &str, entity_id: &str) -> Option<EntityState> {
        self.entities
            .lock()
            .remove(&(namespace.to_string(), entity_id.to_string()))
    }
}

impl EntityStore for MemoryEntityStore {
    fn exists(&self, namespace: &str, entity_id: &str) -> bool {
        self.entities
            .lock()
            .contains_key(&(namespace.to_string(), entity_id.to_string()))
    }

    fn get_state(&self, namespace: &str, entity_id: &str) -> Option<String> {
        self.get(namespace, entity_id).map(|e| e.state)
    }

    fn set_state(&mut self, namespace: &str, entity_id: &str, state: &str, attributes: Value) {
        self.entities.lock().insert(
            (namespace.to_string(), entity_id.to_string()),
            EntityState {
                state: state.to_string(),
                attributes,
            },
        );
    }
}
