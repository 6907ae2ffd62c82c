//! The store manager.
//!
//! [`Wharf`] owns a collection of append-only logs: their metadata
//! records, the cache of open instances, and (when networking is
//! configured) the replicator that serves them to peers.
//!
//! `get` is synchronous and optimistic: the handle goes into the cache
//! immediately and a background task loads the log, persists its
//! record, and announces it to the swarm. Callers that need the log
//! loaded await [`LogHandle::ready`]; data operations do so on their
//! own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use wharf_log::{CreateOptions, LogFactory, StorageBackend, ValueEncoding};
use wharf_meta::{BatchOp, MetaStore};
use wharf_primitives::{DiscoveryKey, Keypair, PublicKey, SecretKey};

use crate::cache::{InsertOutcome, LogCache};
use crate::config::{StoreConfig, LOGS_DIR};
use crate::handle::LogHandle;
use crate::info::{self, LogInfo};
use crate::replicator::Replicator;
use crate::{StoreError, StoreResult};

/// Options for [`Wharf::get`].
///
/// Two shapes: with a `key` (or a `secret_key`, which determines one)
/// the request addresses that exact log; with neither, a fresh keypair
/// is generated. `seed`, `sparse` and `value_encoding` apply only when
/// the request creates the log; an existing record keeps its persisted
/// configuration, changeable through [`Wharf::update`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// The log's public key.
    pub key: Option<PublicKey>,
    /// Secret key, making the log writable here.
    pub secret_key: Option<SecretKey>,
    /// Name to register the log under. Names are immutable once set.
    pub name: Option<String>,
    /// Announce the log to the swarm so peers can fetch it.
    /// Defaults to `true`.
    pub seed: Option<bool>,
    /// Whether replication may leave gaps. Defaults to `true`.
    pub sparse: Option<bool>,
    /// Declared payload interpretation. Defaults to binary.
    pub value_encoding: Option<ValueEncoding>,
}

impl GetOptions {
    /// Address an exact log by public key.
    pub fn for_key(key: PublicKey) -> Self {
        Self { key: Some(key), ..Self::default() }
    }

    /// Address an exact log by its full keypair, making it writable.
    pub fn for_keypair(keypair: Keypair) -> Self {
        Self { key: Some(keypair.public), secret_key: Some(keypair.secret), ..Self::default() }
    }

    /// Create a fresh log registered under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }
}

/// Options for [`Wharf::update`]. Unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Announce (or stop announcing) the log to the swarm.
    pub seed: Option<bool>,
    /// Whether replication may leave gaps.
    pub sparse: Option<bool>,
    /// Declared payload interpretation.
    pub value_encoding: Option<ValueEncoding>,
    /// Must equal the current name when set; names are immutable.
    pub name: Option<String>,
}

/// A multi-log store.
///
/// Create one with [`Wharf::open`]; see [`StoreConfig`] for the
/// in-memory and on-disk wirings.
pub struct Wharf {
    inner: Arc<StoreInner>,
    replicator: Option<Arc<Replicator>>,
}

impl Wharf {
    /// Open a store rooted at `root`.
    ///
    /// Prepares the storage root, wires up the replicator when
    /// `config.networking` is set, and joins the swarm topic of every
    /// persisted record with `seed = true`, without opening any log.
    /// Logs open lazily, on local `get` or on remote demand.
    pub async fn open(root: impl Into<PathBuf>, config: StoreConfig) -> StoreResult<Self> {
        let root = root.into();
        let StoreConfig { meta, factory, backend, networking, cache } = config;
        backend.prepare(&root).await?;

        let inner = Arc::new(StoreInner {
            root,
            meta: RwLock::new(Some(meta)),
            factory,
            backend,
            cache: LogCache::new(cache.capacity),
            close_on_evict: cache.close_on_evict,
            closed: AtomicBool::new(false),
            replicator: RwLock::new(None),
            meta_write_lock: Mutex::new(()),
        });

        let replicator = match networking {
            Some(endpoint) => {
                let replicator = Replicator::new(Arc::clone(&inner), endpoint.swarm);
                *inner.replicator.write() = Some(Arc::downgrade(&replicator));
                Arc::clone(&replicator).spawn_accept(endpoint.connections);
                Some(replicator)
            }
            None => None,
        };

        if let Some(replicator) = &replicator {
            let mut seeded = 0usize;
            for (_, raw) in inner.meta()?.scan_prefix(info::RECORD_PREFIX)? {
                let record = LogInfo::decode(&raw)?;
                if record.seed {
                    replicator.add(record.discovery_key).await?;
                    seeded += 1;
                }
            }
            if seeded > 0 {
                debug!(topics = seeded, "Joined topics for seeded logs");
            }
        }

        debug!(root = %inner.root.display(), "Opened store");
        Ok(Self { inner, replicator })
    }

    /// Fetch or create a log.
    ///
    /// A cache hit returns the cached handle without touching storage.
    /// On a miss the handle is returned immediately while a background
    /// task loads the log and persists its record; see
    /// [`LogHandle::ready`].
    pub fn get(&self, options: GetOptions) -> StoreResult<LogHandle> {
        Arc::clone(&self.inner).get(options)
    }

    /// Fetch the log registered under `name`.
    ///
    /// Returns `Ok(None)` when no log has that name. The returned
    /// handle is ready.
    pub async fn get_by_name(
        &self,
        name: &str,
        options: GetOptions,
    ) -> StoreResult<Option<LogHandle>> {
        Arc::clone(&self.inner).get_by_name(name, options).await
    }

    /// Change a log's persisted configuration, returning the new record.
    ///
    /// The log must be loaded. Seeding transitions take effect on the
    /// swarm: `true -> false` tears down the log's replication streams
    /// before the record is written, `false -> true` announces it after.
    pub async fn update(&self, key: &PublicKey, options: UpdateOptions) -> StoreResult<LogInfo> {
        self.inner.update(key, options).await
    }

    /// Delete a log: its record, its indexes, and its stored entries.
    ///
    /// The log must have a persisted record and be loaded. Metadata is
    /// removed atomically before the storage payload is touched.
    pub async fn delete(&self, key: &PublicKey) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    /// Every persisted record, keyed by public key.
    pub fn list(&self) -> StoreResult<HashMap<PublicKey, LogInfo>> {
        self.inner.list()
    }

    /// The persisted record for `key`, if any.
    pub fn info(&self, key: &PublicKey) -> StoreResult<Option<LogInfo>> {
        self.inner.ensure_open()?;
        self.inner.info(key)
    }

    /// The persisted record registered under `name`, if any.
    pub fn info_by_name(&self, name: &str) -> StoreResult<Option<LogInfo>> {
        self.inner.ensure_open()?;
        let Some(pointer) = self.inner.meta()?.get(&info::name_index_key(name))? else {
            return Ok(None);
        };
        self.inner.info(&info::parse_pointer(&pointer)?)
    }

    /// The persisted record whose key hashes to `discovery_key`, if any.
    pub fn info_by_discovery_key(
        &self,
        discovery_key: &DiscoveryKey,
    ) -> StoreResult<Option<LogInfo>> {
        self.inner.ensure_open()?;
        let Some(pointer) = self.inner.meta()?.get(&info::discovery_index_key(discovery_key))? else {
            return Ok(None);
        };
        self.inner.info(&info::parse_pointer(&pointer)?)
    }

    /// Close the store: stop the replicator, then close every open log.
    ///
    /// Idempotent. Callers should let outstanding appends finish first;
    /// operations started after `close` fail with [`StoreError::Closed`].
    pub async fn close(&self) -> StoreResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing store");
        if let Some(replicator) = &self.replicator {
            replicator.stop().await;
        }
        let handles = self.inner.cache.handles();
        let results = join_all(handles.iter().map(|handle| handle.log().close())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(err) = result {
                warn!(key = %handle.key(), error = %err, "Failed to close log");
            }
        }
        // Release the database handle; a redb store gives up its file
        // lock here so the same root can be reopened.
        *self.inner.meta.write() = None;
        Ok(())
    }

    /// Number of logs currently open.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// Whether the log for `key` is currently open.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.inner.cache.contains(key)
    }

    /// The store's root path.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

/// What the readiness task persists once the log has loaded.
struct OpenRequest {
    /// The record a fresh log would be created with.
    desired: LogInfo,
    /// The caller-requested name, checked against an existing record.
    requested_name: Option<String>,
}

pub(crate) struct StoreInner {
    root: PathBuf,
    /// Taken on close so the database handle (and its file lock) is
    /// released even while background tasks still hold the store.
    meta: RwLock<Option<Arc<dyn MetaStore>>>,
    factory: Arc<dyn LogFactory>,
    backend: Arc<dyn StorageBackend>,
    pub(crate) cache: LogCache,
    close_on_evict: bool,
    closed: AtomicBool,
    /// Weak because the replicator holds the store.
    replicator: RwLock<Option<Weak<Replicator>>>,
    /// Serializes read-modify-write cycles over the metadata keyspace.
    meta_write_lock: Mutex<()>,
}

impl StoreInner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn meta(&self) -> StoreResult<Arc<dyn MetaStore>> {
        self.meta.read().clone().ok_or(StoreError::Closed)
    }

    fn replicator(&self) -> Option<Arc<Replicator>> {
        self.replicator.read().as_ref().and_then(Weak::upgrade)
    }

    fn log_path(&self, key: &PublicKey) -> PathBuf {
        self.root.join(LOGS_DIR).join(key.to_string())
    }

    fn read_record(&self, key: &PublicKey) -> StoreResult<Option<LogInfo>> {
        self.meta()?.get(&info::record_key(key))?.map(|raw| LogInfo::decode(&raw)).transpose()
    }

    pub(crate) fn info(&self, key: &PublicKey) -> StoreResult<Option<LogInfo>> {
        self.read_record(key)
    }

    pub(crate) fn get(self: Arc<Self>, options: GetOptions) -> StoreResult<LogHandle> {
        self.ensure_open()?;
        let GetOptions { key, secret_key, name, seed, sparse, value_encoding } = options;

        let (key, supplied_secret, generated) = match (key, secret_key) {
            (Some(key), secret) => (key, secret, false),
            (None, Some(secret)) => (secret.public_key(), Some(secret), false),
            (None, None) => {
                let keypair = Keypair::generate();
                (keypair.public, Some(keypair.secret), true)
            }
        };

        if let Some(handle) = self.cache.get(&key) {
            return Ok(handle);
        }

        // A generated key cannot have a record yet.
        let record = if generated { None } else { self.read_record(&key)? };

        let secret = record.as_ref().and_then(|r| r.secret_key.clone()).or(supplied_secret);
        let (seed, sparse, value_encoding, record_name) = match &record {
            Some(record) => (record.seed, record.sparse, record.value_encoding, record.name.clone()),
            None => (
                seed.unwrap_or(true),
                sparse.unwrap_or(true),
                value_encoding.unwrap_or_default(),
                name.clone(),
            ),
        };
        let discovery_key = key.discovery_key();

        let log = self.factory.create(CreateOptions {
            key,
            secret_key: secret.clone(),
            backend: Arc::clone(&self.backend),
            path: self.log_path(&key),
            value_encoding,
            sparse,
        })?;
        let handle = LogHandle::new(log);

        match self.cache.insert(key, discovery_key, handle.clone()) {
            InsertOutcome::Existing(raced) => return Ok(raced),
            InsertOutcome::Inserted { evicted: Some((evicted_key, evicted)) } => {
                self.handle_eviction(evicted_key, evicted);
            }
            InsertOutcome::Inserted { evicted: None } => {}
        }

        let request = OpenRequest {
            desired: LogInfo {
                key,
                discovery_key,
                writable: secret.is_some(),
                secret_key: secret,
                name: record_name,
                seed,
                sparse,
                value_encoding,
            },
            requested_name: name,
        };
        let task_handle = handle.clone();
        tokio::spawn(async move {
            self.finish_open(task_handle, request).await;
        });

        Ok(handle)
    }

    pub(crate) async fn get_by_name(
        self: Arc<Self>,
        name: &str,
        mut options: GetOptions,
    ) -> StoreResult<Option<LogHandle>> {
        self.ensure_open()?;
        let Some(pointer) = self.meta()?.get(&info::name_index_key(name))? else {
            return Ok(None);
        };
        options.key = Some(info::parse_pointer(&pointer)?);
        options.name = None;
        let handle = self.get(options)?;
        handle.ready().await?;
        Ok(Some(handle))
    }

    pub(crate) async fn update(
        &self,
        key: &PublicKey,
        options: UpdateOptions,
    ) -> StoreResult<LogInfo> {
        self.ensure_open()?;
        let handle = self.cache.get(key).ok_or(StoreError::Uninitialized(*key))?;
        handle.ready().await?;

        let _guard = self.meta_write_lock.lock().await;
        let mut record = self.read_record(key)?.ok_or(StoreError::UnknownKey(*key))?;

        if let Some(name) = &options.name {
            if record.name.as_deref() != Some(name.as_str()) {
                return Err(StoreError::NameImmutable);
            }
        }

        let was_seeded = record.seed;
        let seed = options.seed.unwrap_or(record.seed);
        if was_seeded && !seed {
            // Unseed before the record changes, so a failure here leaves
            // a retryable state.
            if let Some(replicator) = self.replicator() {
                replicator.remove(record.discovery_key).await?;
            }
        }

        record.seed = seed;
        if let Some(sparse) = options.sparse {
            record.sparse = sparse;
        }
        if let Some(encoding) = options.value_encoding {
            record.value_encoding = encoding;
        }
        self.meta()?.put(&info::record_key(key), &record.encode()?)?;
        debug!(key = %key, seed = record.seed, "Updated log record");

        if !was_seeded && seed {
            if let Some(replicator) = self.replicator() {
                if let Err(err) = replicator.add(record.discovery_key).await {
                    warn!(key = %key, error = %err, "Failed to announce seeded log");
                }
            }
        }

        Ok(record)
    }

    pub(crate) async fn delete(&self, key: &PublicKey) -> StoreResult<()> {
        self.ensure_open()?;
        let record = self.read_record(key)?.ok_or(StoreError::UnknownKey(*key))?;
        let handle = self.cache.get(key).ok_or(StoreError::Uninitialized(*key))?;
        handle.ready().await?;

        if record.seed {
            if let Some(replicator) = self.replicator() {
                replicator.remove(record.discovery_key).await?;
            }
        }
        handle.log().close().await?;

        {
            let _guard = self.meta_write_lock.lock().await;
            let mut ops = vec![
                BatchOp::del(info::record_key(key)),
                BatchOp::del(info::discovery_index_key(&record.discovery_key)),
            ];
            if let Some(name) = &record.name {
                ops.push(BatchOp::del(info::name_index_key(name)));
            }
            self.meta()?.batch(ops)?;
        }

        self.backend.delete(&self.log_path(key)).await?;
        self.cache.evict(key);
        debug!(key = %key, "Deleted log");
        Ok(())
    }

    pub(crate) fn list(&self) -> StoreResult<HashMap<PublicKey, LogInfo>> {
        self.ensure_open()?;
        let mut logs = HashMap::new();
        for (_, raw) in self.meta()?.scan_prefix(info::RECORD_PREFIX)? {
            let record = LogInfo::decode(&raw)?;
            logs.insert(record.key, record);
        }
        Ok(logs)
    }

    /// Open the seeded log behind `discovery_key` for a remote peer.
    ///
    /// `Ok(None)` when the key is unknown here or the log is not
    /// seeded; a non-seeded log is never served. The returned handle
    /// is ready.
    pub(crate) async fn seed_log(
        self: Arc<Self>,
        discovery_key: DiscoveryKey,
    ) -> StoreResult<Option<LogHandle>> {
        let Some(pointer) = self.meta()?.get(&info::discovery_index_key(&discovery_key))? else {
            return Ok(None);
        };
        let key = info::parse_pointer(&pointer)?;
        let Some(record) = self.read_record(&key)? else {
            return Ok(None);
        };
        if !record.seed {
            debug!(discovery_key = %discovery_key, "Refusing to open unseeded log for a peer");
            return Ok(None);
        }

        let handle = match self.cache.get(&key) {
            Some(handle) => handle,
            None => {
                debug!(key = %key, "Opening seeded log for a peer");
                Arc::clone(&self).get(GetOptions::for_key(key))?
            }
        };
        handle.ready().await?;
        Ok(Some(handle))
    }

    fn handle_eviction(&self, key: PublicKey, handle: LogHandle) {
        if !self.close_on_evict || handle.peer_count() > 0 {
            return;
        }
        debug!(key = %key, "Closing evicted log");
        tokio::spawn(async move {
            if let Err(err) = handle.log().close().await {
                warn!(key = %key, error = %err, "Failed to close evicted log");
            }
        });
    }

    async fn finish_open(&self, handle: LogHandle, request: OpenRequest) {
        let key = handle.key();
        match self.persist_open(&handle, request).await {
            Ok(record) => {
                handle.mark_ready();
                if record.seed {
                    if let Some(replicator) = self.replicator() {
                        if let Err(err) = replicator.add(record.discovery_key).await {
                            warn!(key = %key, error = %err, "Failed to announce seeded log");
                        }
                    }
                }
            }
            Err(err) => {
                // Both cache entries go so a later get starts clean.
                self.cache.evict_matching(&key, &handle);
                warn!(key = %key, error = %err, "Log open failed");
                handle.mark_failed(err.to_string());
            }
        }
    }

    /// Load the log, then commit its record. Readiness is only signaled
    /// after this returns.
    async fn persist_open(&self, handle: &LogHandle, request: OpenRequest) -> StoreResult<LogInfo> {
        handle.log().ready().await?;
        let OpenRequest { mut desired, requested_name } = request;

        let _guard = self.meta_write_lock.lock().await;
        let meta = self.meta()?;
        let record_key = info::record_key(&desired.key);
        match self.read_record(&desired.key)? {
            Some(mut record) => {
                if let Some(requested) = &requested_name {
                    if record.name.as_deref() != Some(requested.as_str()) {
                        return Err(StoreError::NameImmutable);
                    }
                }
                // A secret supplied for a previously read-only record
                // upgrades it.
                if record.secret_key.is_none() && desired.secret_key.is_some() {
                    record.secret_key = desired.secret_key.take();
                    record.writable = true;
                    meta.put(&record_key, &record.encode()?)?;
                    debug!(key = %record.key, "Persisted newly supplied secret key");
                }
                Ok(record)
            }
            None => {
                let mut ops = Vec::with_capacity(3);
                ops.push(BatchOp::put(record_key, desired.encode()?));
                ops.push(BatchOp::put(
                    info::discovery_index_key(&desired.discovery_key),
                    info::pointer_value(&desired.key),
                ));
                if let Some(name) = &desired.name {
                    let name_key = info::name_index_key(name);
                    if meta.get(&name_key)?.is_some() {
                        return Err(StoreError::NameTaken(name.clone()));
                    }
                    ops.push(BatchOp::put(name_key, info::pointer_value(&desired.key)));
                }
                meta.batch(ops)?;
                debug!(key = %desired.key, name = ?desired.name, "Created log record");
                Ok(desired)
            }
        }
    }
}
