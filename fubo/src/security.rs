// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Authentication, user groups and topic access rules, loaded from the
//! json auth file.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, ErrorKind};

/// The implicit group containing every user.
pub const ANY_GROUP_NAME: &str = "@any";

/// How one user entry authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Hex sha256 digest of `salt + password`.
    Sha256 { digest: String, salt: String },

    /// Password compared verbatim.
    PlainPassword { password: String },

    /// Authenticated by a TLS client certificate field.
    ClientCert,

    /// Selected when a client connects without credentials.
    Anonymous,

    /// Selected when credential authentication failed or did not apply.
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
struct AuthRule {
    topic_filter: String,

    pub_effect: Option<RuleEffect>,
    pub_principals: HashSet<String>,

    sub_effect: Option<RuleEffect>,
    sub_principals: HashSet<String>,
}

/// Security tables of the broker: users, groups and ranked topic rules.
///
/// Rules are ranked by insertion order; the last matching rule decides.
/// With no matching rule the answer is deny.
#[derive(Debug, Default)]
pub struct Security {
    authentication: HashMap<String, AuthMethod>,

    /// Username of the single `anonymous` entry, if configured.
    anonymous: Option<String>,

    /// Username of the single `unauthenticated` entry, if configured.
    unauthenticated: Option<String>,

    /// Group name (starting with `@`) to member usernames.
    groups: HashMap<String, HashSet<String>>,

    rules: Vec<AuthRule>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    authentication: Vec<RawAuthentication>,

    #[serde(default)]
    group: Vec<RawGroup>,

    #[serde(default)]
    authorization: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawAuthentication {
    name: String,
    method: String,

    #[serde(default)]
    digest: Option<String>,

    #[serde(default)]
    password: Option<String>,

    #[serde(default)]
    salt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    name: String,
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    topic: String,

    #[serde(default)]
    allow: Option<RawPermissions>,

    #[serde(default)]
    deny: Option<RawPermissions>,
}

#[derive(Debug, Deserialize)]
struct RawPermissions {
    #[serde(default, rename = "pub")]
    publish: Option<Vec<String>>,

    #[serde(default, rename = "sub")]
    subscribe: Option<Vec<String>>,
}

impl Security {
    /// Parse the auth file content; both `//` line and `/* */` block
    /// comments are allowed around the json.
    ///
    /// # Errors
    ///
    /// Returns error if the json is invalid or the entries violate the
    /// config rules.
    pub fn from_json(content: &str) -> Result<Self, Error> {
        let stripped = strip_comments(content);
        let raw: RawConfig = serde_json::from_str(&stripped)?;

        let mut security = Self::default();
        for entry in raw.authentication {
            let method = match entry.method.as_str() {
                "sha256" => AuthMethod::Sha256 {
                    digest: entry.digest.unwrap_or_default(),
                    salt: entry.salt.unwrap_or_default(),
                },
                "plain_password" => AuthMethod::PlainPassword {
                    // The file historically stores plain passwords under
                    // either key.
                    password: entry.password.or(entry.digest).unwrap_or_default(),
                },
                "client_cert" => AuthMethod::ClientCert,
                "anonymous" => {
                    if security.anonymous.is_some() {
                        return Err(Error::new(
                            ErrorKind::ConfigError,
                            "only one anonymous user is allowed",
                        ));
                    }
                    security.anonymous = Some(entry.name.clone());
                    AuthMethod::Anonymous
                }
                "unauthenticated" => {
                    if security.unauthenticated.is_some() {
                        return Err(Error::new(
                            ErrorKind::ConfigError,
                            "only one unauthenticated user is allowed",
                        ));
                    }
                    security.unauthenticated = Some(entry.name.clone());
                    AuthMethod::Unauthenticated
                }
                other => {
                    return Err(Error::from_string(
                        ErrorKind::ConfigError,
                        format!("unknown authentication method: {other}"),
                    ));
                }
            };
            security.authentication.insert(entry.name, method);
        }

        for group in raw.group {
            if !group.name.starts_with('@') {
                return Err(Error::from_string(
                    ErrorKind::ConfigError,
                    format!("group name must start with '@': {}", group.name),
                ));
            }
            security
                .groups
                .insert(group.name, group.members.into_iter().collect());
        }

        for rule in raw.authorization {
            let mut auth_rule = AuthRule {
                topic_filter: rule.topic,
                pub_effect: None,
                pub_principals: HashSet::new(),
                sub_effect: None,
                sub_principals: HashSet::new(),
            };
            if let Some(allow) = rule.allow {
                if let Some(publish) = allow.publish {
                    auth_rule.pub_effect = Some(RuleEffect::Allow);
                    auth_rule.pub_principals.extend(publish);
                }
                if let Some(subscribe) = allow.subscribe {
                    auth_rule.sub_effect = Some(RuleEffect::Allow);
                    auth_rule.sub_principals.extend(subscribe);
                }
            }
            if let Some(deny) = rule.deny {
                if let Some(publish) = deny.publish {
                    auth_rule.pub_effect = Some(RuleEffect::Deny);
                    auth_rule.pub_principals.extend(publish);
                }
                if let Some(subscribe) = deny.subscribe {
                    auth_rule.sub_effect = Some(RuleEffect::Deny);
                    auth_rule.sub_principals.extend(subscribe);
                }
            }
            security.validate_principals(&auth_rule)?;
            security.rules.push(auth_rule);
        }

        Ok(security)
    }

    /// Default tables used when no auth file is given: anonymous logins
    /// with full access.
    #[must_use]
    pub fn default_permissive() -> Self {
        let mut security = Self::default();
        security
            .authentication
            .insert("anonymous".to_string(), AuthMethod::Anonymous);
        security.anonymous = Some("anonymous".to_string());
        security.rules.push(AuthRule {
            topic_filter: "#".to_string(),
            pub_effect: Some(RuleEffect::Allow),
            pub_principals: [ANY_GROUP_NAME.to_string()].into_iter().collect(),
            sub_effect: Some(RuleEffect::Allow),
            sub_principals: [ANY_GROUP_NAME.to_string()].into_iter().collect(),
        });
        security
    }

    fn validate_principals(&self, rule: &AuthRule) -> Result<(), Error> {
        for name in rule.pub_principals.iter().chain(&rule.sub_principals) {
            let known = if name.starts_with('@') {
                name == ANY_GROUP_NAME || self.groups.contains_key(name)
            } else {
                self.authentication.contains_key(name)
            };
            if !known {
                return Err(Error::from_string(
                    ErrorKind::ConfigError,
                    format!("unknown user or group in authorization: {name}"),
                ));
            }
        }
        Ok(())
    }

    /// Username of the anonymous entry, if any.
    #[must_use]
    pub fn login_anonymous(&self) -> Option<&str> {
        self.anonymous.as_deref()
    }

    /// Username of the unauthenticated fallback entry, if any.
    #[must_use]
    pub fn login_unauthenticated(&self) -> Option<&str> {
        self.unauthenticated.as_deref()
    }

    /// Check a username pre-authenticated by a client certificate.
    #[must_use]
    pub fn login_cert(&self, username: &str) -> bool {
        matches!(
            self.authentication.get(username),
            Some(AuthMethod::ClientCert)
        )
    }

    /// Check `username`/`password` credentials. Returns the authenticated
    /// username on success.
    #[must_use]
    pub fn login(&self, username: &str, password: &[u8]) -> Option<String> {
        match self.authentication.get(username)? {
            AuthMethod::Sha256 { digest, salt } => {
                let mut hasher = Sha256::new();
                hasher.update(salt.as_bytes());
                hasher.update(password);
                let computed = hex_encode(&hasher.finalize());
                if digest.eq_ignore_ascii_case(&computed) {
                    Some(username.to_string())
                } else {
                    None
                }
            }
            AuthMethod::PlainPassword { password: stored } => {
                if stored.as_bytes() == password {
                    Some(username.to_string())
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// May `username` publish to `topic`?
    #[must_use]
    pub fn auth_pub(&self, username: &str, topic: &str) -> bool {
        let mut decision = false;
        for rule in &self.rules {
            let Some(effect) = rule.pub_effect else {
                continue;
            };
            if codec::topic::topic_match(&rule.topic_filter, topic)
                && self.principal_matches(&rule.pub_principals, username)
            {
                decision = effect == RuleEffect::Allow;
            }
        }
        decision
    }

    /// May `username` subscribe with `filter` (bare, share-prefix free)?
    #[must_use]
    pub fn auth_sub(&self, username: &str, filter: &str) -> bool {
        let mut decision = false;
        for rule in &self.rules {
            let Some(effect) = rule.sub_effect else {
                continue;
            };
            if codec::topic::filter_contains(&rule.topic_filter, filter)
                && self.principal_matches(&rule.sub_principals, username)
            {
                decision = effect == RuleEffect::Allow;
            }
        }
        decision
    }

    /// Install the rule pair backing a response topic: anyone may publish
    /// responses, only the owner may subscribe.
    pub fn add_response_topic_rule(&mut self, topic: &str, owner: &str) {
        self.rules.push(AuthRule {
            topic_filter: topic.to_string(),
            pub_effect: Some(RuleEffect::Allow),
            pub_principals: [ANY_GROUP_NAME.to_string()].into_iter().collect(),
            sub_effect: Some(RuleEffect::Allow),
            sub_principals: [owner.to_string()].into_iter().collect(),
        });
    }

    fn principal_matches(&self, principals: &HashSet<String>, username: &str) -> bool {
        if principals.contains(ANY_GROUP_NAME) || principals.contains(username) {
            return true;
        }
        principals
            .iter()
            .filter(|name| name.starts_with('@'))
            .any(|group| {
                self.groups
                    .get(group)
                    .is_some_and(|members| members.contains(username))
            })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Remove `//` line comments and `/* */` block comments, leaving string
/// literals untouched.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r##"
// Broker auth file
{
    "authentication": [
        {
            // sha256 of "salt" + "password"
            "name": "alice",
            "method": "sha256",
            "digest": "13601bda4ea78e55a07b98866d2be6be0744e3866f13c00c811cab608a28f322",
            "salt": "salt"
        },
        {
            "name": "bob",
            "method": "plain_password",
            "password": "secret"
        },
        { "name": "gateway", "method": "client_cert" },
        { "name": "anonymous", "method": "anonymous" }
    ],
    "group": [
        { "name": "@sensors", "members": ["alice", "bob"] }
    ],
    "authorization": [
        { "topic": "#", "allow": { "pub": ["@any"], "sub": ["@any"] } },
        { "topic": "secret/#", "deny": { "pub": ["@any"], "sub": ["@any"] } },
        { "topic": "secret/sensors/#", "allow": { "pub": ["@sensors"], "sub": ["@sensors"] } }
    ]
}
/* trailing block comment */
"##;

    #[test]
    fn test_parse_with_comments() {
        let security = Security::from_json(CONFIG).unwrap();
        assert_eq!(security.login_anonymous(), Some("anonymous"));
        assert!(security.login_cert("gateway"));
        assert!(!security.login_cert("alice"));
    }

    #[test]
    fn test_login() {
        let security = Security::from_json(CONFIG).unwrap();
        assert_eq!(
            security.login("bob", b"secret"),
            Some("bob".to_string())
        );
        assert_eq!(security.login("bob", b"wrong"), None);
        assert_eq!(
            security.login("alice", b"password"),
            Some("alice".to_string())
        );
        assert_eq!(security.login("alice", b"nope"), None);
        assert_eq!(security.login("nobody", b"x"), None);
    }

    #[test]
    fn test_rule_ranking() {
        let security = Security::from_json(CONFIG).unwrap();
        // Broad allow, then deny on secret/, then allow for the group.
        assert!(security.auth_pub("anonymous", "normal/topic"));
        assert!(!security.auth_pub("anonymous", "secret/x"));
        assert!(security.auth_pub("alice", "secret/sensors/1"));
        assert!(!security.auth_pub("anonymous", "secret/sensors/1"));

        assert!(security.auth_sub("alice", "secret/sensors/#"));
        assert!(!security.auth_sub("anonymous", "secret/#"));
    }

    #[test]
    fn test_default_deny() {
        let security = Security::from_json("{}").unwrap();
        assert!(!security.auth_pub("anyone", "t"));
        assert!(!security.auth_sub("anyone", "t"));
    }

    #[test]
    fn test_response_topic_rule() {
        let mut security = Security::from_json("{}").unwrap();
        security.add_response_topic_rule("responses/abc", "alice");
        assert!(security.auth_pub("bob", "responses/abc"));
        assert!(security.auth_sub("alice", "responses/abc"));
        assert!(!security.auth_sub("bob", "responses/abc"));
    }

    #[test]
    fn test_duplicate_anonymous_rejected() {
        let config = r#"{
            "authentication": [
                { "name": "a", "method": "anonymous" },
                { "name": "b", "method": "anonymous" }
            ]
        }"#;
        assert!(Security::from_json(config).is_err());
    }

    #[test]
    fn test_unknown_principal_rejected() {
        let config = r##"{
            "authorization": [
                { "topic": "#", "allow": { "pub": ["ghost"] } }
            ]
        }"##;
        assert!(Security::from_json(config).is_err());
    }
}
