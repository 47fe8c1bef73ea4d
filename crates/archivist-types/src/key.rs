use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Length in bytes of an [`ArchiveKey`] and a [`DiscoveryKey`].
pub const KEY_LENGTH: usize = 32;

const DISCOVERY_CONTEXT: &[u8] = b"archivist-discovery-v1";

/// Content-address of a hosted archive.
///
/// The canonical string form is 64 lowercase hex characters. That string is
/// the identity of the archive everywhere: registry map key, storage
/// directory name, and log field. Two keys are equal exactly when their
/// canonical strings are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey([u8; KEY_LENGTH]);

impl ArchiveKey {
    /// Create from raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a random key (new archives, tests, demos).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Canonical 64-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier for logs (first 8 hex characters).
    pub fn short_id(&self) -> String {
        format!("archive:{}", hex::encode(&self.0[..4]))
    }

    /// Parse from hex, with or without the `archive:` prefix.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("archive:").unwrap_or(s);
        decode_key(s).map(Self)
    }

    /// The swarm topic peers use to find each other for this archive.
    ///
    /// BLAKE3 keyed hash of a fixed context string under the archive key, so
    /// announcing the topic does not reveal the key itself.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT).as_bytes())
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", self.short_id())
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ArchiveKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ArchiveKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ArchiveKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Swarm topic derived from an [`ArchiveKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; KEY_LENGTH]);

impl DiscoveryKey {
    /// Create from raw bytes, as received on the wire.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn decode_key(s: &str) -> Result<[u8; KEY_LENGTH], TypeError> {
    let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
    if bytes.len() != KEY_LENGTH {
        return Err(TypeError::InvalidLength {
            expected: KEY_LENGTH,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; KEY_LENGTH];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn canonical_form_is_lowercase_hex() {
        let key = ArchiveKey::from_bytes([0xab; 32]);
        let s = key.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn parse_accepts_prefix_and_uppercase() {
        let key = ArchiveKey::from_bytes([0x5c; 32]);
        let upper = key.to_hex().to_uppercase();
        assert_eq!(ArchiveKey::from_hex(&upper).unwrap(), key);
        let prefixed = format!("archive:{}", key.to_hex());
        assert_eq!(prefixed.parse::<ArchiveKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = ArchiveKey::from_hex("abcd").unwrap_err();
        assert_eq!(err, TypeError::InvalidLength { expected: 32, actual: 2 });
    }

    #[test]
    fn parse_rejects_non_hex() {
        let err = ArchiveKey::from_hex(&"zz".repeat(32)).unwrap_err();
        assert!(matches!(err, TypeError::InvalidHex(_)));
    }

    #[test]
    fn short_id_format() {
        let key = ArchiveKey::from_bytes([0; 32]);
        assert_eq!(key.short_id(), "archive:00000000");
    }

    #[test]
    fn discovery_key_is_deterministic_and_distinct() {
        let a = ArchiveKey::from_bytes([1; 32]);
        let b = ArchiveKey::from_bytes([2; 32]);
        assert_eq!(a.discovery_key(), a.discovery_key());
        assert_ne!(a.discovery_key(), b.discovery_key());
        assert_ne!(a.discovery_key().as_bytes(), a.as_bytes());
    }

    #[test]
    fn serde_uses_hex_string() {
        let key = ArchiveKey::from_bytes([7; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let parsed: ArchiveKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(ArchiveKey::generate(), ArchiveKey::generate());
    }

    proptest! {
        #[test]
        fn parsing_arbitrary_input_never_panics(s in ".*") {
            let _ = ArchiveKey::from_hex(&s);
        }

        #[test]
        fn equality_matches_canonical_string(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let ka = ArchiveKey::from_bytes(a);
            let kb = ArchiveKey::from_bytes(b);
            prop_assert_eq!(ka == kb, ka.to_string() == kb.to_string());
        }
    }
}
