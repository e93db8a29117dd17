// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscription trie, one node per topic level.

use codec::v5::SubscribeOptions;
use std::collections::HashMap;

use crate::types::SessionGid;

/// One subscription as stored in the trie.
///
/// A subscription is uniquely keyed within a session by its share name
/// (empty for non-shared) and topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    gid: SessionGid,
    share_name: String,
    topic_filter: String,
    options: SubscribeOptions,
    sub_id: Option<usize>,
}

impl Subscription {
    #[must_use]
    pub fn new(
        gid: SessionGid,
        share_name: &str,
        topic_filter: &str,
        options: SubscribeOptions,
        sub_id: Option<usize>,
    ) -> Self {
        Self {
            gid,
            share_name: share_name.to_string(),
            topic_filter: topic_filter.to_string(),
            options,
            sub_id,
        }
    }

    #[must_use]
    pub const fn gid(&self) -> &SessionGid {
        &self.gid
    }

    #[must_use]
    pub fn share_name(&self) -> &str {
        &self.share_name
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        !self.share_name.is_empty()
    }

    #[must_use]
    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    #[must_use]
    pub const fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    #[must_use]
    pub const fn sub_id(&self) -> Option<usize> {
        self.sub_id
    }
}

/// Node handle returned by insert, making unsubscribe walk only the
/// filter's own path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubHandle {
    levels: Vec<String>,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,

    /// Subscriptions ending at this node, keyed by session and share name.
    subs: HashMap<(SessionGid, String), Subscription>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subs.is_empty()
    }
}

/// Topic-filter indexed map over all subscriptions of all sessions.
///
/// Lookup walks the trie once per publish; `+` and `#` children are
/// chased alongside the literal child. Wildcards never match topics whose
/// first level starts with `$`.
#[derive(Debug, Default)]
pub struct SubTrie {
    root: TrieNode,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a subscription under its bare (share-prefix free)
    /// topic filter.
    ///
    /// Returns the node handle and whether the subscription is new; an
    /// update replaces the stored options in place.
    pub fn insert(&mut self, subscription: Subscription) -> (SubHandle, bool) {
        let levels: Vec<String> = subscription
            .topic_filter
            .split('/')
            .map(ToString::to_string)
            .collect();

        let mut node = &mut self.root;
        for level in &levels {
            node = node.children.entry(level.clone()).or_default();
        }
        let key = (subscription.gid.clone(), subscription.share_name.clone());
        let inserted = node.subs.insert(key, subscription).is_none();
        (SubHandle { levels }, inserted)
    }

    /// Remove the subscription at `handle` for `(gid, share_name)`.
    ///
    /// Empty nodes along the path are pruned. Returns whether a
    /// subscription was removed.
    pub fn remove(&mut self, handle: &SubHandle, gid: &SessionGid, share_name: &str) -> bool {
        Self::remove_at(
            &mut self.root,
            &handle.levels,
            0,
            &(gid.clone(), share_name.to_string()),
        )
    }

    fn remove_at(
        node: &mut TrieNode,
        levels: &[String],
        depth: usize,
        key: &(SessionGid, String),
    ) -> bool {
        if depth == levels.len() {
            return node.subs.remove(key).is_some();
        }
        let Some(child) = node.children.get_mut(&levels[depth]) else {
            return false;
        };
        let removed = Self::remove_at(child, levels, depth + 1, key);
        if removed && child.is_empty() {
            node.children.remove(&levels[depth]);
        }
        removed
    }

    /// Invoke `f` for every subscription whose filter matches `topic`.
    pub fn modify<F>(&self, topic: &str, mut f: F)
    where
        F: FnMut(&Subscription),
    {
        let levels: Vec<&str> = topic.split('/').collect();
        let system_topic = topic.starts_with('$');
        Self::walk(&self.root, &levels, 0, system_topic, &mut f);
    }

    fn walk<F>(node: &TrieNode, levels: &[&str], depth: usize, system_topic: bool, f: &mut F)
    where
        F: FnMut(&Subscription),
    {
        if depth == levels.len() {
            for sub in node.subs.values() {
                f(sub);
            }
            // `a/#` also matches `a` itself [MQTT-4.7.1-2].
            if let Some(hash_child) = node.children.get("#") {
                for sub in hash_child.subs.values() {
                    f(sub);
                }
            }
            return;
        }

        let wildcards_allowed = !(depth == 0 && system_topic);
        if wildcards_allowed {
            if let Some(hash_child) = node.children.get("#") {
                for sub in hash_child.subs.values() {
                    f(sub);
                }
            }
            if let Some(plus_child) = node.children.get("+") {
                Self::walk(plus_child, levels, depth + 1, system_topic, f);
            }
        }
        if let Some(child) = node.children.get(levels[depth]) {
            Self::walk(child, levels, depth + 1, system_topic, f);
        }
    }

    /// Drop every subscription of `gid`, walking the whole trie. Used as
    /// a safety net; the per-filter [`Self::remove`] is the fast path.
    pub fn remove_session(&mut self, gid: &SessionGid) {
        Self::remove_session_at(&mut self.root, gid);
    }

    fn remove_session_at(node: &mut TrieNode, gid: &SessionGid) {
        node.subs.retain(|(sub_gid, _share), _sub| sub_gid != gid);
        node.children.retain(|_level, child| {
            Self::remove_session_at(child, gid);
            !child.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(gid: &str, filter: &str) -> Subscription {
        Subscription::new(
            SessionGid::new("u", gid),
            "",
            filter,
            SubscribeOptions::default(),
            None,
        )
    }

    fn matches(trie: &SubTrie, topic: &str) -> Vec<String> {
        let mut got = Vec::new();
        trie.modify(topic, |s| {
            got.push(format!("{}:{}", s.gid().client_id(), s.topic_filter()));
        });
        got.sort();
        got
    }

    #[test]
    fn test_insert_and_match() {
        let mut trie = SubTrie::new();
        trie.insert(sub("a", "sport/+/score"));
        trie.insert(sub("b", "sport/#"));
        trie.insert(sub("c", "sport/tennis/score"));
        trie.insert(sub("d", "other/topic"));

        assert_eq!(
            matches(&trie, "sport/tennis/score"),
            vec![
                "a:sport/+/score".to_string(),
                "b:sport/#".to_string(),
                "c:sport/tennis/score".to_string(),
            ]
        );
        assert_eq!(matches(&trie, "sport"), vec!["b:sport/#".to_string()]);
        assert_eq!(matches(&trie, "elsewhere"), Vec::<String>::new());
    }

    #[test]
    fn test_wildcards_skip_system_topics() {
        let mut trie = SubTrie::new();
        trie.insert(sub("a", "#"));
        trie.insert(sub("b", "+/broker"));
        trie.insert(sub("c", "$SYS/broker"));

        assert_eq!(matches(&trie, "$SYS/broker"), vec!["c:$SYS/broker".to_string()]);
        assert_eq!(matches(&trie, "any/broker"), {
            let mut v = vec!["a:#".to_string(), "b:+/broker".to_string()];
            v.sort();
            v
        });
    }

    #[test]
    fn test_insert_twice_updates() {
        let mut trie = SubTrie::new();
        let (_handle, inserted) = trie.insert(sub("a", "x/y"));
        assert!(inserted);
        let (_handle, inserted) = trie.insert(sub("a", "x/y"));
        assert!(!inserted);
        assert_eq!(matches(&trie, "x/y").len(), 1);
    }

    #[test]
    fn test_remove_prunes_path() {
        let mut trie = SubTrie::new();
        let gid = SessionGid::new("u", "a");
        let (handle, _) = trie.insert(sub("a", "deep/long/path"));
        assert!(trie.remove(&handle, &gid, ""));
        assert!(!trie.remove(&handle, &gid, ""));
        assert!(trie.root.children.is_empty());
    }

    #[test]
    fn test_shared_and_plain_coexist() {
        let mut trie = SubTrie::new();
        let gid = SessionGid::new("u", "a");
        trie.insert(Subscription::new(
            gid.clone(),
            "",
            "t/+",
            SubscribeOptions::default(),
            None,
        ));
        trie.insert(Subscription::new(
            gid.clone(),
            "g1",
            "t/+",
            SubscribeOptions::default(),
            None,
        ));

        let mut count = 0;
        trie.modify("t/1", |_s| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_remove_session() {
        let mut trie = SubTrie::new();
        trie.insert(sub("a", "x/+"));
        trie.insert(sub("a", "y/#"));
        trie.insert(sub("b", "x/+"));
        trie.remove_session(&SessionGid::new("u", "a"));

        assert_eq!(matches(&trie, "x/1"), vec!["b:x/+".to_string()]);
        assert_eq!(matches(&trie, "y/1"), Vec::<String>::new());
    }
}
