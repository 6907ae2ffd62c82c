//! Shared log handles with explicit readiness.
//!
//! The store hands a [`LogHandle`] out synchronously while the log's
//! open and metadata write still run in the background. The handle
//! carries that background outcome as a watchable state; data
//! operations await it before touching the log.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use wharf_log::Log;
use wharf_primitives::{DiscoveryKey, PublicKey};

use crate::{StoreError, StoreResult};

/// Outcome of a log's background open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadyStatus {
    /// Open still in flight.
    #[default]
    Pending,
    /// Log is open and its record is persisted.
    Ready,
    /// Open failed; the handle is dead and has left the cache.
    Failed(String),
}

/// A shared reference to a managed log.
///
/// Clones are cheap and compare equal under [`LogHandle::ptr_eq`] when
/// they refer to the same managed instance; the store returns the same
/// instance for repeated lookups of a cached key.
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    log: Arc<dyn Log>,
    ready_tx: watch::Sender<ReadyStatus>,
}

impl LogHandle {
    pub(crate) fn new(log: Arc<dyn Log>) -> Self {
        let (ready_tx, _) = watch::channel(ReadyStatus::Pending);
        Self { inner: Arc::new(HandleInner { log, ready_tx }) }
    }

    /// The log's public identity.
    pub fn key(&self) -> PublicKey {
        self.inner.log.key()
    }

    /// The log's topic identity.
    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.log.discovery_key()
    }

    /// Whether this store can append to the log.
    pub fn writable(&self) -> bool {
        self.inner.log.writable()
    }

    /// Number of entries stored locally.
    pub fn len(&self) -> u64 {
        self.inner.log.len()
    }

    /// Whether the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.log.is_empty()
    }

    /// Number of replication channels currently attached.
    pub fn peer_count(&self) -> usize {
        self.inner.log.peer_count()
    }

    /// Current open state, without waiting.
    pub fn status(&self) -> ReadyStatus {
        self.inner.ready_tx.borrow().clone()
    }

    /// Wait until the background open has finished.
    pub async fn ready(&self) -> StoreResult<()> {
        let mut rx = self.inner.ready_tx.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                ReadyStatus::Ready => return Ok(()),
                ReadyStatus::Failed(message) => {
                    return Err(StoreError::OpenFailed(message.clone()));
                }
                ReadyStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::Closed);
            }
        }
    }

    /// Append one entry, waiting for readiness first.
    pub async fn append(&self, entry: &[u8]) -> StoreResult<u64> {
        self.ready().await?;
        Ok(self.inner.log.append(entry).await?)
    }

    /// Get the entry at `index`, waiting for readiness first.
    ///
    /// Returns `None` when the index is beyond what is stored locally.
    pub async fn entry(&self, index: u64) -> StoreResult<Option<Bytes>> {
        self.ready().await?;
        Ok(self.inner.log.entry(index).await?)
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<dyn Log> {
        &self.inner.log
    }

    /// Whether two handles refer to the same managed instance.
    pub fn ptr_eq(a: &LogHandle, b: &LogHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn mark_ready(&self) {
        self.inner.ready_tx.send_replace(ReadyStatus::Ready);
    }

    pub(crate) fn mark_failed(&self, message: String) {
        self.inner.ready_tx.send_replace(ReadyStatus::Failed(message));
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("key", &self.key())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use wharf_log::{AppendLog, CreateOptions, MemoryBackend, ValueEncoding};
    use wharf_primitives::Keypair;

    fn handle() -> LogHandle {
        let keypair = Keypair::generate();
        let log = AppendLog::new(CreateOptions {
            key: keypair.public,
            secret_key: Some(keypair.secret),
            backend: Arc::new(MemoryBackend::new()),
            path: Path::new("a").to_path_buf(),
            value_encoding: ValueEncoding::Binary,
            sparse: true,
        })
        .unwrap();
        LogHandle::new(Arc::new(log))
    }

    #[tokio::test]
    async fn test_ready_blocks_until_marked() {
        let handle = handle();
        assert_eq!(handle.status(), ReadyStatus::Pending);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.ready().await })
        };

        handle.log().ready().await.unwrap();
        handle.mark_ready();
        waiter.await.unwrap().unwrap();
        assert_eq!(handle.status(), ReadyStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_open_rejects_operations() {
        let handle = handle();
        handle.mark_failed("disk on fire".to_string());

        let err = handle.append(b"entry").await.unwrap_err();
        assert!(matches!(err, StoreError::OpenFailed(message) if message == "disk on fire"));
    }

    #[tokio::test]
    async fn test_clones_share_identity() {
        let handle = handle();
        let clone = handle.clone();
        assert!(LogHandle::ptr_eq(&handle, &clone));
        assert!(!LogHandle::ptr_eq(&handle, &self::handle()));
    }
}
