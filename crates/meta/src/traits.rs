//! Metadata storage backend trait.
//!
//! The [`MetaStore`] trait abstracts over ordered key/value backends,
//! allowing implementations like redb or in-memory for testing. Keys are
//! opaque byte strings; callers build their own keyspace out of prefixes.

use crate::MetaResult;

/// A single operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove a key. Removing an absent key is a no-op.
    Del { key: Vec<u8> },
}

impl BatchOp {
    /// Build a put operation.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put { key: key.into(), value: value.into() }
    }

    /// Build a delete operation.
    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Self::Del { key: key.into() }
    }
}

/// Ordered metadata storage backend trait.
///
/// # Ordering
///
/// Implementations must iterate keys in ascending byte order so that
/// [`MetaStore::scan_prefix`] visits a prefix range contiguously.
///
/// # Atomicity
///
/// [`MetaStore::batch`] applies all operations or none of them. Record
/// writes that span several index entries rely on this.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Send + Sync).
pub trait MetaStore: Send + Sync {
    /// Get the value stored under a key.
    ///
    /// Returns `None` if the key doesn't exist.
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>>;

    /// Insert or overwrite a key.
    fn put(&self, key: &[u8], value: &[u8]) -> MetaResult<()>;

    /// Remove a key.
    ///
    /// Returns `Ok(())` even if the key didn't exist.
    fn del(&self, key: &[u8]) -> MetaResult<()>;

    /// Apply a batch of operations atomically.
    fn batch(&self, ops: Vec<BatchOp>) -> MetaResult<()>;

    /// Collect every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<(Vec<u8>, Vec<u8>)>>;
}
