//! redb-based metadata store.
//!
//! This module provides [`RedbMetaStore`], a persistent metadata store
//! backed by the redb embedded database.

use std::path::Path;

use redb::{Database, TableDefinition};
use tracing::debug;

use crate::{BatchOp, MetaResult, MetaStore};

/// Table definition for metadata entries.
/// Key: caller keyspace bytes (prefix-structured)
/// Value: opaque record bytes
const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// redb-based metadata store.
///
/// Uses redb for ACID-compliant persistence; a batch maps onto a single
/// write transaction, which is what makes multi-entry record writes atomic.
/// Thread-safe for concurrent reads and writes.
pub struct RedbMetaStore {
    db: Database,
}

impl RedbMetaStore {
    /// Open or create a metadata store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> MetaResult<Self> {
        let db = Database::create(path)?;

        // Ensure the table exists
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        debug!("Opened redb metadata store");
        Ok(Self { db })
    }
}

impl MetaStore for RedbMetaStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        match table.get(key)? {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> MetaResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Del { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;

        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            out.push((key.value().to_vec(), value.value().to_vec()));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put(b"key/aa", b"record").unwrap();
        assert_eq!(store.get(b"key/aa").unwrap(), Some(b"record".to_vec()));
        assert_eq!(store.get(b"key/bb").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let dir = tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put(b"key/aa", b"first").unwrap();
        store.put(b"key/aa", b"second").unwrap();
        assert_eq!(store.get(b"key/aa").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_del() {
        let dir = tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put(b"key/aa", b"record").unwrap();
        store.del(b"key/aa").unwrap();
        assert_eq!(store.get(b"key/aa").unwrap(), None);

        // Deleting again is a no-op
        store.del(b"key/aa").unwrap();
    }

    #[test]
    fn test_batch_applies_all() {
        let dir = tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put(b"stale", b"x").unwrap();
        store
            .batch(vec![
                BatchOp::put(b"key/aa".as_slice(), b"record".as_slice()),
                BatchOp::put(b"name/first".as_slice(), b"aa".as_slice()),
                BatchOp::del(b"stale".as_slice()),
            ])
            .unwrap();

        assert_eq!(store.get(b"key/aa").unwrap(), Some(b"record".to_vec()));
        assert_eq!(store.get(b"name/first").unwrap(), Some(b"aa".to_vec()));
        assert_eq!(store.get(b"stale").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix() {
        let dir = tempdir().unwrap();
        let store = RedbMetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put(b"dkey/01", b"aa").unwrap();
        store.put(b"key/aa", b"ra").unwrap();
        store.put(b"key/bb", b"rb").unwrap();
        store.put(b"name/n", b"aa").unwrap();

        let entries = store.scan_prefix(b"key/").unwrap();
        assert_eq!(
            entries,
            vec![
                (b"key/aa".to_vec(), b"ra".to_vec()),
                (b"key/bb".to_vec(), b"rb".to_vec()),
            ]
        );

        assert!(store.scan_prefix(b"zzz/").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");

        {
            let store = RedbMetaStore::open(&path).unwrap();
            store.put(b"key/aa", b"record").unwrap();
        }

        let store = RedbMetaStore::open(&path).unwrap();
        assert_eq!(store.get(b"key/aa").unwrap(), Some(b"record".to_vec()));
    }
}
