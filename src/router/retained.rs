use std::collections::HashMap;

use bytes::Bytes;

use crate::protocol::{topic, QoS};

/// In-memory retained message store, one entry per concrete topic.
/// Entries live for the broker lifetime, there is no disk persistence.
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: HashMap<String, Retained>,
}

#[derive(Debug, Clone)]
pub struct Retained {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedStore {
    pub fn new() -> RetainedStore {
        RetainedStore::default()
    }

    /// Stores the payload as the new retained message for the topic. An
    /// empty payload deletes the entry instead (MQTT 3.1.1 §3.3.1.3)
    pub fn store(&mut self, topic: &str, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            self.messages.remove(topic);
            return;
        }

        self.messages.insert(
            topic.to_owned(),
            Retained {
                topic: topic.to_owned(),
                payload,
                qos,
            },
        );
    }

    /// Retained messages whose topic matches the filter, for delivery to
    /// a fresh subscription
    pub fn matching(&self, filter: &str) -> Vec<Retained> {
        self.messages
            .values()
            .filter(|retained| topic::matches(&retained.topic, filter))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.messages.len()
    }
}
