use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::protocol::DEFAULT_KEY;
use crate::crypto::parse_key;
use crate::error::IdError;

/// A named channel and its pre-shared key.
///
/// Immutable once built. `key_bytes` holds the expanded key (empty when the
/// channel is sent in the clear); `key_string` is the compact base64 form
/// used when the definition is shown to users or persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDef {
    name: String,
    key_bytes: Vec<u8>,
    key_string: Option<String>,
}

impl ChannelDef {
    /// Build a channel from its name and an optional base64 key.
    ///
    /// A one-byte key is a short PSK index: 0 disables encryption, N > 0
    /// selects the default key with its last byte bumped by N - 1.
    pub fn new(name: impl Into<String>, key: Option<&str>) -> Result<Self, IdError> {
        let mut key_bytes = match key {
            Some(k) if !k.is_empty() => parse_key(k)?,
            _ => Vec::new(),
        };
        if key_bytes.len() == 1 {
            key_bytes = expand_short_psk(key_bytes[0]);
        }
        Ok(Self {
            name: name.into(),
            key_string: compact_key(&key_bytes),
            key_bytes,
        })
    }

    /// The default public channel (`LongFast`, key index 1)
    pub fn default_channel() -> Self {
        Self {
            name: crate::constants::protocol::DEFAULT_CHANNEL_NAME.to_string(),
            key_bytes: DEFAULT_KEY.to_vec(),
            key_string: compact_key(&DEFAULT_KEY),
        }
    }

    /// A channel sent in the clear
    pub fn unencrypted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_bytes: Vec::new(),
            key_string: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    /// Compact base64 key, or an empty string for an unencrypted channel
    pub fn key_string(&self) -> &str {
        self.key_string.as_deref().unwrap_or("")
    }

    pub fn is_encrypted(&self) -> bool {
        !self.key_bytes.is_empty()
    }
}

impl fmt::Debug for ChannelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material stays out of logs
        f.debug_struct("ChannelDef")
            .field("name", &self.name)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// Expand a short PSK index into a full key. Index 0 means "no key".
pub fn expand_short_psk(index: u8) -> Vec<u8> {
    if index == 0 {
        return Vec::new();
    }
    let mut psk = DEFAULT_KEY.to_vec();
    let last = psk.len() - 1;
    psk[last] = psk[last].wrapping_add(index - 1);
    psk
}

/// Encode a key in its shortest form: keys that only differ from the
/// default key in their last byte collapse to that single byte.
pub fn compact_key(key_bytes: &[u8]) -> Option<String> {
    if key_bytes.is_empty() {
        return None;
    }
    let n = key_bytes.len();
    let encoded = if n == DEFAULT_KEY.len() && key_bytes[..n - 1] == DEFAULT_KEY[..n - 1] {
        &key_bytes[n - 1..]
    } else {
        key_bytes
    };
    Some(STANDARD.encode(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_index_one_is_default_key() {
        assert_eq!(expand_short_psk(1), DEFAULT_KEY.to_vec());
    }

    #[test]
    fn test_short_index_only_changes_last_byte() {
        for n in [2u8, 7, 128, 255] {
            let key = expand_short_psk(n);
            assert_eq!(key[..15], DEFAULT_KEY[..15]);
            assert_eq!(key[15], DEFAULT_KEY[15].wrapping_add(n - 1));
        }
    }

    #[test]
    fn test_short_index_zero_disables_encryption() {
        let ch = ChannelDef::new("Clear", Some("AA==")).unwrap();
        assert!(!ch.is_encrypted());
        assert_eq!(ch.key_string(), "");
    }

    #[test]
    fn test_default_key_compacts_to_one_byte() {
        let ch = ChannelDef::new("LongFast", Some("AQ==")).unwrap();
        assert_eq!(ch.key_bytes(), &DEFAULT_KEY);
        assert_eq!(ch.key_string(), "AQ==");
        assert_eq!(ch, ChannelDef::default_channel());
    }

    #[test]
    fn test_full_key_is_kept_verbatim() {
        let full = STANDARD.encode([7u8; 32]);
        let ch = ChannelDef::new("Private", Some(&full)).unwrap();
        assert_eq!(ch.key_bytes(), &[7u8; 32]);
        assert_eq!(ch.key_string(), full);
    }

    #[test]
    fn test_full_default_key_compacts() {
        let full = STANDARD.encode(DEFAULT_KEY);
        let ch = ChannelDef::new("LongFast", Some(&full)).unwrap();
        assert_eq!(ch.key_string(), "AQ==");
    }

    #[test]
    fn test_missing_key_is_unencrypted() {
        let ch = ChannelDef::new("Open", None).unwrap();
        assert!(ch.key_bytes().is_empty());
        let ch = ChannelDef::new("Open", Some("")).unwrap();
        assert!(ch.key_bytes().is_empty());
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        assert!(ChannelDef::new("Bad", Some("not base64!!")).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let ch = ChannelDef::default_channel();
        let dbg = format!("{:?}", ch);
        assert!(!dbg.contains("key_bytes"));
        assert!(dbg.contains("LongFast"));
    }
}
