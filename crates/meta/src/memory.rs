//! In-memory metadata store.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{BatchOp, MetaResult, MetaStore};

/// In-memory metadata store.
///
/// Backed by a `BTreeMap` so prefix scans see the same byte ordering as
/// the persistent backend. State lives for the lifetime of the value;
/// useful for tests and for stores that don't outlive the process.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMetaStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> MetaResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        // One write guard covers the whole batch.
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        let mut out = Vec::new();
        for (key, value) in entries.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }
}
