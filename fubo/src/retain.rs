// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Retained message store, topic to last retained payload.

use codec::{v5, QoS};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One retained message.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    properties: v5::Properties,
}

impl RetainedMessage {
    #[must_use]
    pub fn new(topic: &str, payload: &[u8], qos: QoS, properties: v5::Properties) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            properties,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn properties(&self) -> &v5::Properties {
        &self.properties
    }
}

#[derive(Debug)]
struct Record {
    message: RetainedMessage,

    /// Guards expiry timers against firing for a replaced record.
    generation: u64,
}

/// Retained message store.
///
/// A retained publish with a non-empty payload overwrites per topic, an
/// empty payload erases the entry [MQTT-3.3.1-6], and a fired message
/// expiry erases it too. Reads run under a shared lock.
#[derive(Debug, Default)]
pub struct RetainStore {
    map: HashMap<String, Record>,
    next_generation: u64,
}

impl RetainStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Store `message` under its topic, returning the generation to hand
    /// to [`spawn_expiry`] when the message carries an expiry interval.
    pub fn insert_or_assign(&mut self, message: RetainedMessage) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.map
            .insert(message.topic.clone(), Record { message, generation });
        generation
    }

    /// Remove the entry of `topic`. Returns whether one existed.
    pub fn erase(&mut self, topic: &str) -> bool {
        self.map.remove(topic).is_some()
    }

    /// Remove the entry of `topic` only if it still is `generation`.
    pub fn erase_generation(&mut self, topic: &str, generation: u64) -> bool {
        if self
            .map
            .get(topic)
            .is_some_and(|record| record.generation == generation)
        {
            self.map.remove(topic);
            return true;
        }
        false
    }

    /// Invoke `f` with the record of `topic` if present.
    pub fn find<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&RetainedMessage),
    {
        if let Some(record) = self.map.get(topic) {
            f(&record.message);
        }
    }

    /// Collect all retained messages matching a bare topic filter, for
    /// delivery to a new subscription.
    #[must_use]
    pub fn find_matches(&self, filter: &str) -> Vec<RetainedMessage> {
        self.map
            .values()
            .filter(|record| codec::topic::topic_match(filter, &record.message.topic))
            .map(|record| record.message.clone())
            .collect()
    }
}

/// Arm the expiry timer of a freshly stored retained message.
///
/// The generation check keeps a stale timer from erasing a newer message
/// stored under the same topic.
pub fn spawn_expiry(
    store: Arc<RwLock<RetainStore>>,
    topic: String,
    generation: u64,
    after: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let erased = match store.write() {
            Ok(mut store) => store.erase_generation(&topic, generation),
            Err(_poisoned) => false,
        };
        if erased {
            log::debug!("retain: Expired retained message on {topic}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, payload: &[u8]) -> RetainedMessage {
        RetainedMessage::new(topic, payload, QoS::AtMostOnce, v5::Properties::new())
    }

    #[test]
    fn test_insert_overwrites_per_topic() {
        let mut store = RetainStore::new();
        store.insert_or_assign(msg("r/1", b"v1"));
        store.insert_or_assign(msg("r/1", b"v2"));
        assert_eq!(store.len(), 1);

        let mut seen = None;
        store.find("r/1", |m| seen = Some(m.payload().to_vec()));
        assert_eq!(seen.as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_erase() {
        let mut store = RetainStore::new();
        store.insert_or_assign(msg("r/1", b"v1"));
        assert!(store.erase("r/1"));
        assert!(!store.erase("r/1"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_erase_generation_ignores_replaced() {
        let mut store = RetainStore::new();
        let old_generation = store.insert_or_assign(msg("r/1", b"v1"));
        let _new_generation = store.insert_or_assign(msg("r/1", b"v2"));
        assert!(!store.erase_generation("r/1", old_generation));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_find_matches() {
        let mut store = RetainStore::new();
        store.insert_or_assign(msg("r/1", b"a"));
        store.insert_or_assign(msg("r/2", b"b"));
        store.insert_or_assign(msg("other", b"c"));

        let mut topics: Vec<String> = store
            .find_matches("r/#")
            .iter()
            .map(|m| m.topic().to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["r/1".to_string(), "r/2".to_string()]);
    }
}
