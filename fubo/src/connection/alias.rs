// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;

/// Sending side topic alias map.
///
/// Sized from the peer's topic-alias-maximum property at handshake time.
/// Supports auto assignment with least-recently-used eviction once every
/// alias number is bound.
#[derive(Debug, Default)]
pub struct TopicAliasSend {
    max: u16,
    by_topic: HashMap<String, u16>,
    by_alias: HashMap<u16, String>,

    /// Alias numbers in least-recently-used-first order.
    lru: Vec<u16>,
}

impl TopicAliasSend {
    #[must_use]
    pub fn new(max: u16) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn max(&self) -> u16 {
        self.max
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.by_alias.len() >= usize::from(self.max)
    }

    /// Look up an existing alias for `topic`, marking it recently used.
    pub fn find(&mut self, topic: &str) -> Option<u16> {
        let alias = *self.by_topic.get(topic)?;
        self.touch(alias);
        Some(alias)
    }

    /// Bind `topic` to a free alias number, evicting the least recently
    /// used binding when the map is full. Returns `None` when `max` is 0.
    pub fn assign(&mut self, topic: &str) -> Option<u16> {
        if self.max == 0 {
            return None;
        }
        let alias = if self.is_full() {
            let victim = self.lru.first().copied()?;
            if let Some(old_topic) = self.by_alias.remove(&victim) {
                self.by_topic.remove(&old_topic);
            }
            victim
        } else {
            (1..=self.max).find(|alias| !self.by_alias.contains_key(alias))?
        };
        self.insert(alias, topic);
        Some(alias)
    }

    /// Look up the topic bound to `alias` without touching recency.
    #[must_use]
    pub fn topic_of(&self, alias: u16) -> Option<&str> {
        self.by_alias.get(&alias).map(String::as_str)
    }

    /// Bind `topic` to a caller-chosen alias number, replacing any binding
    /// of that number. Returns false when `alias` is out of range.
    pub fn bind(&mut self, alias: u16, topic: &str) -> bool {
        if alias == 0 || alias > self.max {
            return false;
        }
        if let Some(old_topic) = self.by_alias.remove(&alias) {
            self.by_topic.remove(&old_topic);
        }
        self.insert(alias, topic);
        true
    }

    pub fn clear(&mut self) {
        self.by_topic.clear();
        self.by_alias.clear();
        self.lru.clear();
    }

    fn insert(&mut self, alias: u16, topic: &str) {
        self.by_alias.insert(alias, topic.to_string());
        self.by_topic.insert(topic.to_string(), alias);
        self.touch(alias);
    }

    fn touch(&mut self, alias: u16) {
        self.lru.retain(|a| *a != alias);
        self.lru.push(alias);
    }
}

/// Receiving side topic alias map.
///
/// Strictly write-on-peer-declare, read-on-subsequent-reference.
#[derive(Debug, Default)]
pub struct TopicAliasRecv {
    max: u16,
    map: HashMap<u16, String>,
}

impl TopicAliasRecv {
    #[must_use]
    pub fn new(max: u16) -> Self {
        Self {
            max,
            map: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn max(&self) -> u16 {
        self.max
    }

    /// Record the binding declared by the peer. Returns false when `alias`
    /// is 0 or above the announced maximum, a protocol error.
    pub fn register(&mut self, alias: u16, topic: &str) -> bool {
        if alias == 0 || alias > self.max {
            return false;
        }
        self.map.insert(alias, topic.to_string());
        true
    }

    /// Resolve an alias-only publish back to its topic.
    #[must_use]
    pub fn resolve(&self, alias: u16) -> Option<&str> {
        self.map.get(&alias).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_assign_and_find() {
        let mut map = TopicAliasSend::new(2);
        assert_eq!(map.assign("a"), Some(1));
        assert_eq!(map.assign("b"), Some(2));
        assert_eq!(map.find("a"), Some(1));
        assert_eq!(map.find("missing"), None);
    }

    #[test]
    fn test_send_lru_eviction() {
        let mut map = TopicAliasSend::new(2);
        map.assign("a");
        map.assign("b");
        // Touch "a" so "b" becomes the eviction victim.
        map.find("a");
        assert_eq!(map.assign("c"), Some(2));
        assert_eq!(map.find("b"), None);
        assert_eq!(map.find("a"), Some(1));
    }

    #[test]
    fn test_send_zero_max() {
        let mut map = TopicAliasSend::new(0);
        assert_eq!(map.assign("a"), None);
        assert!(!map.bind(1, "a"));
    }

    #[test]
    fn test_recv_register_and_resolve() {
        let mut map = TopicAliasRecv::new(10);
        assert!(map.register(3, "long/topic"));
        assert_eq!(map.resolve(3), Some("long/topic"));
        assert_eq!(map.resolve(4), None);

        // Re-register replaces the binding.
        assert!(map.register(3, "other"));
        assert_eq!(map.resolve(3), Some("other"));
    }

    #[test]
    fn test_recv_range_checks() {
        let mut map = TopicAliasRecv::new(2);
        assert!(!map.register(0, "t"));
        assert!(!map.register(3, "t"));
    }
}
