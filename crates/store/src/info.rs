//! Persisted log records and the metadata keyspace.
//!
//! One ordered keyspace holds three disjoint ranges:
//!
//! ```text
//! key/<hex(public key)>        -> postcard-encoded LogInfo
//! dkey/<hex(discovery key)>    -> hex(public key)
//! name/<name>                  -> hex(public key)
//! ```
//!
//! `key/` entries are the canonical records; the other two ranges are
//! pointers resolved back through `key/`. All entries for one log are
//! written and removed in single atomic batches.

use serde::{Deserialize, Serialize};

use wharf_log::ValueEncoding;
use wharf_primitives::{DiscoveryKey, PublicKey, SecretKey};

use crate::{StoreError, StoreResult};

/// Prefix of canonical log records.
pub(crate) const RECORD_PREFIX: &[u8] = b"key/";
/// Prefix of discovery-key pointers.
pub(crate) const DISCOVERY_PREFIX: &[u8] = b"dkey/";
/// Prefix of name pointers.
pub(crate) const NAME_PREFIX: &[u8] = b"name/";

/// Everything the store persists about one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    /// The log's public identity.
    pub key: PublicKey,
    /// Topic identity derived from the key.
    pub discovery_key: DiscoveryKey,
    /// Secret half, present when the log was created writable here.
    pub secret_key: Option<SecretKey>,
    /// Optional lookup name, registered at creation.
    pub name: Option<String>,
    /// Whether the log is announced to peers.
    pub seed: bool,
    /// Whether replication may leave gaps for lazily fetched entries.
    pub sparse: bool,
    /// Whether this store can append.
    pub writable: bool,
    /// Declared payload interpretation.
    pub value_encoding: ValueEncoding,
}

impl LogInfo {
    /// Encode for persistence.
    pub(crate) fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a persisted record.
    pub(crate) fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Keyspace entry for a log's canonical record.
pub(crate) fn record_key(key: &PublicKey) -> Vec<u8> {
    let mut out = RECORD_PREFIX.to_vec();
    out.extend_from_slice(key.to_string().as_bytes());
    out
}

/// Keyspace entry pointing a discovery key back at its public key.
pub(crate) fn discovery_index_key(discovery_key: &DiscoveryKey) -> Vec<u8> {
    let mut out = DISCOVERY_PREFIX.to_vec();
    out.extend_from_slice(discovery_key.to_string().as_bytes());
    out
}

/// Keyspace entry pointing a name at its public key.
pub(crate) fn name_index_key(name: &str) -> Vec<u8> {
    let mut out = NAME_PREFIX.to_vec();
    out.extend_from_slice(name.as_bytes());
    out
}

/// Value stored under both pointer ranges.
pub(crate) fn pointer_value(key: &PublicKey) -> Vec<u8> {
    key.to_string().into_bytes()
}

/// Parse a pointer value back into a public key.
pub(crate) fn parse_pointer(value: &[u8]) -> StoreResult<PublicKey> {
    let hex = std::str::from_utf8(value)
        .map_err(|_| StoreError::Corrupt("pointer value is not utf8".into()))?;
    hex.parse()
        .map_err(|err| StoreError::Corrupt(format!("pointer value is not a key: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_primitives::Keypair;

    fn record(keypair: &Keypair) -> LogInfo {
        LogInfo {
            key: keypair.public,
            discovery_key: keypair.public.discovery_key(),
            secret_key: Some(keypair.secret.clone()),
            name: Some("first".to_string()),
            seed: true,
            sparse: false,
            writable: true,
            value_encoding: ValueEncoding::Json,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let keypair = Keypair::generate();
        let info = record(&keypair);
        let decoded = LogInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_record_round_trip_minimal() {
        let keypair = Keypair::generate();
        let info = LogInfo {
            secret_key: None,
            name: None,
            writable: false,
            ..record(&keypair)
        };
        let decoded = LogInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded.secret_key, None);
        assert_eq!(decoded.name, None);
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_keyspace_ranges_are_disjoint() {
        let keypair = Keypair::generate();
        let record = record_key(&keypair.public);
        let discovery = discovery_index_key(&keypair.public.discovery_key());
        let name = name_index_key("key/sneaky");

        assert!(record.starts_with(RECORD_PREFIX));
        assert!(discovery.starts_with(DISCOVERY_PREFIX));
        assert!(name.starts_with(NAME_PREFIX));
        assert!(!name.starts_with(RECORD_PREFIX));
    }

    #[test]
    fn test_pointer_round_trip() {
        let keypair = Keypair::generate();
        let value = pointer_value(&keypair.public);
        assert_eq!(parse_pointer(&value).unwrap(), keypair.public);
        assert!(parse_pointer(b"not hex").is_err());
    }
}
