//! Per-log blob storage.
//!
//! A [`StorageBackend`] owns the space logs live in and hands out one
//! [`LogStorage`] per log path. Backends only see opaque named blobs;
//! entry framing is the log's business.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use crate::LogResult;

/// Storage for a single log: a namespace of named blobs.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Read a whole blob.
    ///
    /// Returns `None` if the blob doesn't exist yet.
    async fn read(&self, name: &str) -> LogResult<Option<Vec<u8>>>;

    /// Replace a blob.
    async fn write(&self, name: &str, data: &[u8]) -> LogResult<()>;

    /// Append bytes to the end of a blob, creating it if absent.
    async fn append(&self, name: &str, data: &[u8]) -> LogResult<()>;
}

/// Allocates, opens and deletes per-log storage.
///
/// The store calls `prepare` once with its root, then `create`/`delete`
/// with paths it has namespaced per log under that root.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare the storage root (called once before any log is opened).
    async fn prepare(&self, root: &Path) -> LogResult<()>;

    /// Open (or create) the storage for one log.
    async fn create(&self, path: &Path) -> LogResult<Arc<dyn LogStorage>>;

    /// Delete the storage for one log, including all of its blobs.
    ///
    /// Deleting storage that was never created is a no-op.
    async fn delete(&self, path: &Path) -> LogResult<()>;
}

/// File-system backend; each log is a directory, each blob a file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackend;

impl FileBackend {
    /// Create a new file backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn prepare(&self, root: &Path) -> LogResult<()> {
        tokio::fs::create_dir_all(root).await?;
        Ok(())
    }

    async fn create(&self, path: &Path) -> LogResult<Arc<dyn LogStorage>> {
        tokio::fs::create_dir_all(path).await?;
        Ok(Arc::new(FileLogStorage { dir: path.to_path_buf() }))
    }

    async fn delete(&self, path: &Path) -> LogResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// One log directory on disk.
struct FileLogStorage {
    dir: PathBuf,
}

#[async_trait]
impl LogStorage for FileLogStorage {
    async fn read(&self, name: &str) -> LogResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> LogResult<()> {
        tokio::fs::write(self.dir.join(name), data).await?;
        Ok(())
    }

    async fn append(&self, name: &str, data: &[u8]) -> LogResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory backend.
///
/// Clones share state, and a path reopened through the same backend sees
/// the blobs written before. Create/close/create behaves like a disk
/// backend for as long as the backend value lives.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    logs: Arc<RwLock<HashMap<PathBuf, Arc<MemoryLogStorage>>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn prepare(&self, _root: &Path) -> LogResult<()> {
        Ok(())
    }

    async fn create(&self, path: &Path) -> LogResult<Arc<dyn LogStorage>> {
        let mut logs = self.logs.write();
        let storage = logs.entry(path.to_path_buf()).or_default();
        Ok(Arc::clone(storage) as Arc<dyn LogStorage>)
    }

    async fn delete(&self, path: &Path) -> LogResult<()> {
        self.logs.write().remove(path);
        Ok(())
    }
}

/// Blob map for one in-memory log.
#[derive(Debug, Default)]
struct MemoryLogStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn read(&self, name: &str) -> LogResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    async fn write(&self, name: &str, data: &[u8]) -> LogResult<()> {
        self.blobs.write().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn append(&self, name: &str, data: &[u8]) -> LogResult<()> {
        let mut blobs = self.blobs.write();
        blobs.entry(name.to_string()).or_default().extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new();
        backend.prepare(dir.path()).await.unwrap();

        let storage = backend.create(&dir.path().join("log-a")).await.unwrap();
        assert_eq!(storage.read("entries").await.unwrap(), None);

        storage.append("entries", b"one").await.unwrap();
        storage.append("entries", b"two").await.unwrap();
        assert_eq!(storage.read("entries").await.unwrap(), Some(b"onetwo".to_vec()));

        storage.write("entries", b"reset").await.unwrap();
        assert_eq!(storage.read("entries").await.unwrap(), Some(b"reset".to_vec()));
    }

    #[tokio::test]
    async fn test_file_backend_delete() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new();
        let path = dir.path().join("log-a");

        let storage = backend.create(&path).await.unwrap();
        storage.append("entries", b"data").await.unwrap();

        backend.delete(&path).await.unwrap();
        assert!(!path.exists());

        // Deleting again is a no-op
        backend.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_survives_reopen() {
        let backend = MemoryBackend::new();
        let path = Path::new("logs/aa");

        let storage = backend.create(path).await.unwrap();
        storage.append("entries", b"data").await.unwrap();
        drop(storage);

        let storage = backend.create(path).await.unwrap();
        assert_eq!(storage.read("entries").await.unwrap(), Some(b"data".to_vec()));

        backend.delete(path).await.unwrap();
        let storage = backend.create(path).await.unwrap();
        assert_eq!(storage.read("entries").await.unwrap(), None);
    }
}
