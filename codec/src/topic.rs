// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! Topic names, topic filters and the matching rules between them.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::io::Write;

use crate::utils::{validate_utf8_string, TopicError};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Prefix of shared subscription filters.
pub const SHARE_PREFIX: &str = "$share/";

/// Topic name in publish packets.
///
/// A topic name MUST NOT contain wildcard characters [MQTT-3.3.2-2].
/// An empty topic name is accepted here because a 5.0 publish may replace
/// the name with a topic alias; callers enforce alias presence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name from string slice.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` contains wildcards or invalid chars.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    /// Returns true if topic name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let topic = ba.read_string(len as usize)?;
        validate_pub_topic(&topic)?;
        Ok(Self(topic))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter in subscribe/unsubscribe packets.
///
/// May carry a `$share/<name>/` prefix; [`Self::share_name`] and
/// [`Self::filter`] split it off. Matching ignores the prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new topic filter from string slice.
    ///
    /// # Errors
    ///
    /// Returns error if wildcards are misplaced or the share prefix
    /// is malformed.
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        validate_sub_topic(filter)?;
        Ok(Self(filter.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    /// Share name part of a `$share/<name>/<filter>` subscription,
    /// empty for non-shared subscriptions.
    #[must_use]
    pub fn share_name(&self) -> &str {
        if let Some(rest) = self.0.strip_prefix(SHARE_PREFIX) {
            if let Some(pos) = rest.find('/') {
                return &rest[..pos];
            }
        }
        ""
    }

    /// Filter part with any share prefix removed.
    #[must_use]
    pub fn filter(&self) -> &str {
        if let Some(rest) = self.0.strip_prefix(SHARE_PREFIX) {
            if let Some(pos) = rest.find('/') {
                return &rest[pos + 1..];
            }
        }
        &self.0
    }

    /// Check whether `topic` matches this filter.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        topic_match(self.filter(), topic)
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let filter = ba.read_string(len as usize)?;
        validate_sub_topic(&filter)?;
        Ok(Self(filter))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooLong);
    }
    validate_utf8_string(topic).map_err(|_e| TopicError::InvalidChar)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::InvalidChar);
    }
    Ok(())
}

fn validate_sub_topic(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooLong);
    }
    validate_utf8_string(filter).map_err(|_e| TopicError::InvalidChar)?;

    let bare = if let Some(rest) = filter.strip_prefix(SHARE_PREFIX) {
        let Some(pos) = rest.find('/') else {
            return Err(TopicError::InvalidChar);
        };
        let share_name = &rest[..pos];
        // The ShareName MUST NOT contain the characters "/", "+" or "#"
        // [MQTT-4.8.2-2], and MUST NOT be zero length.
        if share_name.is_empty() || share_name.contains('+') || share_name.contains('#') {
            return Err(TopicError::InvalidChar);
        }
        &rest[pos + 1..]
    } else {
        filter
    };
    if bare.is_empty() {
        return Err(TopicError::Empty);
    }

    let levels: Vec<&str> = bare.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidChar);
        }
        if level.contains('#') {
            // The multi-level wildcard MUST be the last character in
            // the filter and occupy an entire level [MQTT-4.7.1-2].
            if *level != "#" || i != levels.len() - 1 {
                return Err(TopicError::InvalidChar);
            }
        }
    }
    Ok(())
}

/// Check whether `topic` matches the (bare, share-prefix free) `filter`.
///
/// `+` matches exactly one level, `#` matches any number of remaining
/// levels including the parent level. A wildcard in the first filter level
/// never matches topics starting with `$` [MQTT-4.7.2-1].
#[must_use]
pub fn topic_match(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    let mut first = true;

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), Some(level)) => {
                return !(first && level.starts_with('$'));
            }
            (Some("#"), None) => {
                // `sport/#` also matches `sport` alone [MQTT-4.7.1-2].
                return true;
            }
            (Some("+"), Some(level)) => {
                if first && level.starts_with('$') {
                    return false;
                }
            }
            (Some(f), Some(level)) => {
                if f != level {
                    return false;
                }
            }
            (Some(_), None) | (None, Some(_)) => return false,
            (None, None) => return true,
        }
        first = false;
    }
}

/// Check whether the topic set matched by `child` is a subset of the
/// topic set matched by `parent`. Used when a topic filter has to be
/// checked against filter-shaped access rules.
#[must_use]
pub fn filter_contains(parent: &str, child: &str) -> bool {
    let parent_levels: Vec<&str> = parent.split('/').collect();
    let child_levels: Vec<&str> = child.split('/').collect();

    let mut pi = 0;
    let mut ci = 0;
    loop {
        match (parent_levels.get(pi), child_levels.get(ci)) {
            (Some(&"#"), _) => return true,
            (None, None) => return true,
            (Some(&"+"), Some(child_level)) => {
                if *child_level == "#" {
                    return false;
                }
            }
            (Some(parent_level), Some(child_level)) => {
                if parent_level != child_level {
                    return false;
                }
            }
            (Some(_), None) | (None, Some(_)) => return false,
        }
        pi += 1;
        ci += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic() {
        assert!(PubTopic::new("a/b/c").is_ok());
        assert!(PubTopic::new("").is_ok());
        assert!(PubTopic::new("a/+/c").is_err());
        assert!(PubTopic::new("a/#").is_err());
    }

    #[test]
    fn test_sub_topic_validation() {
        assert!(SubTopic::new("a/b/c").is_ok());
        assert!(SubTopic::new("a/+/c").is_ok());
        assert!(SubTopic::new("#").is_ok());
        assert!(SubTopic::new("a/#").is_ok());
        assert!(SubTopic::new("").is_err());
        assert!(SubTopic::new("a/#/c").is_err());
        assert!(SubTopic::new("a/b#").is_err());
        assert!(SubTopic::new("a/b+/c").is_err());
    }

    #[test]
    fn test_share_name() {
        let filter = SubTopic::new("$share/group1/a/+").unwrap();
        assert_eq!(filter.share_name(), "group1");
        assert_eq!(filter.filter(), "a/+");
        assert!(filter.is_match("a/b"));

        let plain = SubTopic::new("a/+").unwrap();
        assert_eq!(plain.share_name(), "");
        assert_eq!(plain.filter(), "a/+");

        assert!(SubTopic::new("$share//a").is_err());
        assert!(SubTopic::new("$share/name").is_err());
    }

    #[test]
    fn test_topic_match() {
        assert!(topic_match("sport/tennis/+", "sport/tennis/player1"));
        assert!(!topic_match(
            "sport/tennis/+",
            "sport/tennis/player1/ranking"
        ));
        assert!(topic_match("sport/#", "sport"));
        assert!(topic_match("sport/#", "sport/tennis/player1"));
        assert!(topic_match("#", "a/b/c"));
        assert!(topic_match("+/+", "a/b"));
        assert!(!topic_match("+", "a/b"));
    }

    #[test]
    fn test_dollar_topics_need_explicit_filters() {
        assert!(!topic_match("#", "$SYS/broker/uptime"));
        assert!(!topic_match("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_match("$SYS/#", "$SYS/broker/uptime"));
        assert!(topic_match("$SYS/broker/+", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_filter_contains() {
        assert!(filter_contains("#", "a/b"));
        assert!(filter_contains("a/#", "a/b/c"));
        assert!(filter_contains("a/+", "a/b"));
        assert!(filter_contains("a/+/c", "a/b/c"));
        assert!(!filter_contains("a/+", "a/#"));
        assert!(!filter_contains("a/b", "a/+"));
        assert!(!filter_contains("a/b", "a/c"));
        assert!(filter_contains("a/+", "a/+"));
    }
}
