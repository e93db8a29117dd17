// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Errors about utf-8 text fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Longer than 65535 bytes.
    TooLong,

    /// Contains a forbidden code point.
    InvalidChar,
}

/// Errors about client id fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Larger than [`MAX_CLIENT_ID_LEN`] bytes.
    TooLong,

    /// Can only contain `0-9a-zA-Z`, `-` and `_`.
    InvalidChars,
}

/// Errors about topic names and topic filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic name is required but empty.
    Empty,

    /// Longer than 65535 bytes.
    TooLong,

    /// Wildcard char at an invalid position, or a forbidden code point.
    InvalidChar,
}

/// [MQTT-3.1.3-5] only promises 23 bytes, but almost every server accepts
/// longer ids. Same cap as the one used by the broker side.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Check `s` is a well-formed mqtt utf-8 string.
///
/// The character data MUST NOT include encodings of code points between
/// U+D800 and U+DFFF [MQTT-1.5.4-1], and MUST NOT include an encoding of
/// the null character U+0000 [MQTT-1.5.4-2]. Surrogates cannot occur in
/// a rust `str`, so only NUL is checked here.
///
/// # Errors
///
/// Returns error if `s` is too long or contains NUL.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooLong);
    }
    if s.chars().any(|c| c == '\u{0000}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert raw bytes into a validated mqtt utf-8 string.
///
/// # Errors
///
/// Returns error if `bytes` is not valid utf-8 or fails [`validate_utf8_string`].
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_e| StringError::InvalidChar)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Check characters in client id.
///
/// An empty client id is accepted here; whether it is allowed depends on
/// protocol version and clean session flag, which the caller checks.
///
/// # Errors
///
/// Returns error if `client_id` is too long or contains unsupported chars.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
    {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

/// Generate a random alphanumeric string, used by servers assigning
/// client ids.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("a/b/c").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::InvalidChar)
        );
        let long = "x".repeat(usize::from(u16::MAX) + 1);
        assert_eq!(validate_utf8_string(&long), Err(StringError::TooLong));
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("node-042_a").is_ok());
        assert!(validate_client_id("").is_ok());
        assert_eq!(
            validate_client_id("no spaces"),
            Err(ClientIdError::InvalidChars)
        );
        let long = "c".repeat(MAX_CLIENT_ID_LEN + 1);
        assert_eq!(validate_client_id(&long), Err(ClientIdError::TooLong));
    }

    #[test]
    fn test_random_string() {
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
