//! Store configuration.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use wharf_log::{AppendLogFactory, FileBackend, LogFactory, MemoryBackend, StorageBackend};
use wharf_meta::{MemoryMetaStore, MetaStore, RedbMetaStore};
use wharf_swarm::SwarmEndpoint;

use crate::StoreResult;

/// File name of the metadata database inside the store root.
pub const METADATA_FILE: &str = "metadata.redb";

/// Directory under the store root holding per-log storage.
pub const LOGS_DIR: &str = "logs";

/// Cache sizing and eviction policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of open logs, or `None` for an unbounded cache.
    pub capacity: Option<NonZeroUsize>,
    /// Close a log when the cache evicts it and no replication channel
    /// is attached. Off by default: evicted handles stay usable and the
    /// log closes when the last handle drops.
    pub close_on_evict: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: None, close_on_evict: false }
    }
}

/// Pluggable seams of a store.
///
/// [`StoreConfig::in_memory`] wires everything to in-memory
/// implementations for tests; [`StoreConfig::on_disk`] wires metadata
/// to redb and log storage to flat files under the store root.
pub struct StoreConfig {
    /// Metadata keyspace.
    pub meta: Arc<dyn MetaStore>,
    /// Constructs log instances.
    pub factory: Arc<dyn LogFactory>,
    /// Per-log entry storage.
    pub backend: Arc<dyn StorageBackend>,
    /// Swarm endpoint for replication, or `None` for an offline store.
    pub networking: Option<SwarmEndpoint>,
    /// Cache sizing and eviction policy.
    pub cache: CacheConfig,
}

impl StoreConfig {
    /// Fully in-memory store: nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            meta: Arc::new(MemoryMetaStore::new()),
            factory: Arc::new(AppendLogFactory),
            backend: Arc::new(MemoryBackend::new()),
            networking: None,
            cache: CacheConfig::default(),
        }
    }

    /// Durable store rooted at `root`.
    ///
    /// Creates the root directory and opens (or creates) the metadata
    /// database inside it. Pass the same `root` to [`Wharf::open`].
    ///
    /// [`Wharf::open`]: crate::Wharf::open
    pub fn on_disk(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let meta = RedbMetaStore::open(root.join(METADATA_FILE))?;
        Ok(Self {
            meta: Arc::new(meta),
            factory: Arc::new(AppendLogFactory),
            backend: Arc::new(FileBackend),
            networking: None,
            cache: CacheConfig::default(),
        })
    }

    /// Attach a swarm endpoint; the store will replicate over it.
    pub fn with_networking(mut self, endpoint: SwarmEndpoint) -> Self {
        self.networking = Some(endpoint);
        self
    }

    /// Replace the cache policy.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the metadata store.
    pub fn with_meta(mut self, meta: Arc<dyn MetaStore>) -> Self {
        self.meta = meta;
        self
    }

    /// Replace the log factory.
    pub fn with_factory(mut self, factory: Arc<dyn LogFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Replace the log storage backend.
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = backend;
        self
    }
}
