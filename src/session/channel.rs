//! Group channels: symmetric pre-shared keys with no per-sender state.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::crypto::derive_channel_key;
use crate::identity::sha256;

use super::{SessionError, MAX_GROUP_CHANNELS};

/// A group channel: PSK hash for wire matching plus the derived AEAD key.
#[derive(Clone)]
pub struct GroupChannel {
    pub name: String,
    psk_hash: [u8; 32],
    key: [u8; 32],
}

impl GroupChannel {
    /// Import a channel from a base64-encoded 16- or 32-byte PSK.
    pub fn from_base64(name: &str, psk_base64: &str) -> Result<Self, SessionError> {
        let psk = BASE64
            .decode(psk_base64.trim())
            .map_err(|e| SessionError::InvalidChannelKey(e.to_string()))?;
        if psk.len() != 16 && psk.len() != 32 {
            return Err(SessionError::InvalidChannelKey(format!(
                "PSK must be 16 or 32 bytes, got {}",
                psk.len()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            psk_hash: sha256(&psk),
            key: derive_channel_key(&psk),
        })
    }

    /// First byte of the PSK hash, carried on the wire for matching.
    pub fn hash_prefix(&self) -> u8 {
        self.psk_hash[0]
    }

    /// The derived AEAD key.
    pub(crate) fn key(&self) -> [u8; 32] {
        self.key
    }
}

/// Fixed-capacity channel table.
pub struct ChannelTable {
    channels: Vec<GroupChannel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            channels: Vec::with_capacity(MAX_GROUP_CHANNELS),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn get(&self, idx: usize) -> Option<&GroupChannel> {
        self.channels.get(idx)
    }

    /// Add a channel; fails when the table is full or the PSK is invalid.
    pub fn add(&mut self, name: &str, psk_base64: &str) -> Result<usize, SessionError> {
        if self.channels.len() >= MAX_GROUP_CHANNELS {
            return Err(SessionError::TableFull);
        }
        let channel = GroupChannel::from_base64(name, psk_base64)?;
        self.channels.push(channel);
        Ok(self.channels.len() - 1)
    }

    /// Indexes of channels whose hash prefix matches.
    pub fn collect_by_hash(&self, hash: u8) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.hash_prefix() == hash)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSK16: &str = "AAECAwQFBgcICQoLDA0ODw=="; // 16 bytes

    #[test]
    fn test_add_and_match() {
        let mut table = ChannelTable::new();
        let idx = table.add("public", PSK16).unwrap();
        let prefix = table.get(idx).unwrap().hash_prefix();
        assert_eq!(table.collect_by_hash(prefix), vec![idx]);
    }

    #[test]
    fn test_rejects_bad_psk() {
        assert!(GroupChannel::from_base64("x", "not-base64!!!").is_err());
        // 8 bytes decodes fine but is the wrong length
        assert!(GroupChannel::from_base64("x", "AAAAAAAAAAA=").is_err());
    }

    #[test]
    fn test_table_bounded() {
        let mut table = ChannelTable::new();
        for i in 0..MAX_GROUP_CHANNELS {
            table.add(&format!("ch-{i}"), PSK16).unwrap();
        }
        assert!(matches!(
            table.add("extra", PSK16),
            Err(SessionError::TableFull)
        ));
    }

    #[test]
    fn test_key_derived_from_psk() {
        let a = GroupChannel::from_base64("a", PSK16).unwrap();
        let b = GroupChannel::from_base64("b", PSK16).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.hash_prefix(), b.hash_prefix());
    }
}
