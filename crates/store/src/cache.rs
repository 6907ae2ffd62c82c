//! LRU cache of open log handles.
//!
//! The [`LogCache`] is the store's working set: every open log lives
//! here, indexed by public key and by discovery key. A bounded cache
//! evicts least-recently-used handles once full; an unbounded cache
//! keeps everything until it is explicitly evicted or the store closes.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use wharf_primitives::{DiscoveryKey, PublicKey};

use crate::handle::LogHandle;

/// Result of [`LogCache::insert`].
pub(crate) enum InsertOutcome {
    /// A handle for this key was already cached; the caller's fresh
    /// handle should be dropped in favor of this one.
    Existing(LogHandle),
    /// The handle was inserted. A bounded cache may have pushed out its
    /// least-recently-used entry to make room.
    Inserted { evicted: Option<(PublicKey, LogHandle)> },
}

/// In-memory index of open logs.
///
/// Uses a `Mutex` rather than `RwLock` because `LruCache::get` mutates
/// recency order even on reads.
pub(crate) struct LogCache {
    inner: Mutex<CacheInner>,
}

enum CacheInner {
    Bounded {
        by_key: LruCache<PublicKey, LogHandle>,
        by_dkey: HashMap<DiscoveryKey, PublicKey>,
    },
    Unbounded {
        by_key: HashMap<PublicKey, LogHandle>,
        by_dkey: HashMap<DiscoveryKey, PublicKey>,
    },
}

impl LogCache {
    pub(crate) fn new(capacity: Option<NonZeroUsize>) -> Self {
        let inner = match capacity {
            Some(cap) => CacheInner::Bounded {
                by_key: LruCache::new(cap),
                by_dkey: HashMap::new(),
            },
            None => CacheInner::Unbounded {
                by_key: HashMap::new(),
                by_dkey: HashMap::new(),
            },
        };
        Self { inner: Mutex::new(inner) }
    }

    /// Look up a handle by public key, marking it recently used.
    pub(crate) fn get(&self, key: &PublicKey) -> Option<LogHandle> {
        match &mut *self.inner.lock() {
            CacheInner::Bounded { by_key, .. } => by_key.get(key).cloned(),
            CacheInner::Unbounded { by_key, .. } => by_key.get(key).cloned(),
        }
    }

    /// Whether a handle for this key is cached.
    ///
    /// Does not disturb recency order.
    pub(crate) fn contains(&self, key: &PublicKey) -> bool {
        match &*self.inner.lock() {
            CacheInner::Bounded { by_key, .. } => by_key.contains(key),
            CacheInner::Unbounded { by_key, .. } => by_key.contains_key(key),
        }
    }

    /// Whether a handle for this discovery key is cached.
    ///
    /// Does not disturb recency order.
    pub(crate) fn contains_discovery(&self, discovery_key: &DiscoveryKey) -> bool {
        match &*self.inner.lock() {
            CacheInner::Bounded { by_dkey, .. } => by_dkey.contains_key(discovery_key),
            CacheInner::Unbounded { by_dkey, .. } => by_dkey.contains_key(discovery_key),
        }
    }

    /// Insert a freshly created handle, unless one raced us in.
    ///
    /// Lookup and insert happen under one lock acquisition, so two
    /// concurrent opens of the same key converge on a single handle.
    pub(crate) fn insert(
        &self,
        key: PublicKey,
        discovery_key: DiscoveryKey,
        handle: LogHandle,
    ) -> InsertOutcome {
        match &mut *self.inner.lock() {
            CacheInner::Bounded { by_key, by_dkey } => {
                if let Some(existing) = by_key.get(&key) {
                    return InsertOutcome::Existing(existing.clone());
                }
                by_dkey.insert(discovery_key, key);
                let evicted = by_key.push(key, handle).and_then(|(old_key, old_handle)| {
                    // push returns the displaced LRU entry, or the
                    // previous value under the same key (ruled out by
                    // the lookup above).
                    by_dkey.remove(&old_handle.discovery_key());
                    (old_key != key).then_some((old_key, old_handle))
                });
                InsertOutcome::Inserted { evicted }
            }
            CacheInner::Unbounded { by_key, by_dkey } => {
                if let Some(existing) = by_key.get(&key) {
                    return InsertOutcome::Existing(existing.clone());
                }
                by_dkey.insert(discovery_key, key);
                by_key.insert(key, handle);
                InsertOutcome::Inserted { evicted: None }
            }
        }
    }

    /// Remove the handle for `key` from both indexes.
    pub(crate) fn evict(&self, key: &PublicKey) -> Option<LogHandle> {
        match &mut *self.inner.lock() {
            CacheInner::Bounded { by_key, by_dkey } => {
                let handle = by_key.pop(key)?;
                by_dkey.remove(&handle.discovery_key());
                Some(handle)
            }
            CacheInner::Unbounded { by_key, by_dkey } => {
                let handle = by_key.remove(key)?;
                by_dkey.remove(&handle.discovery_key());
                Some(handle)
            }
        }
    }

    /// Remove the handle for `key` only if it is still `handle`.
    ///
    /// A failed open evicts its own handle this way, so it never tears
    /// out a replacement that was opened after the failure.
    pub(crate) fn evict_matching(&self, key: &PublicKey, handle: &LogHandle) {
        let mut inner = self.inner.lock();
        let matches = match &mut *inner {
            CacheInner::Bounded { by_key, .. } => by_key
                .peek(key)
                .is_some_and(|cached| LogHandle::ptr_eq(cached, handle)),
            CacheInner::Unbounded { by_key, .. } => by_key
                .get(key)
                .is_some_and(|cached| LogHandle::ptr_eq(cached, handle)),
        };
        if matches {
            match &mut *inner {
                CacheInner::Bounded { by_key, by_dkey } => {
                    by_key.pop(key);
                    by_dkey.remove(&handle.discovery_key());
                }
                CacheInner::Unbounded { by_key, by_dkey } => {
                    by_key.remove(key);
                    by_dkey.remove(&handle.discovery_key());
                }
            }
        }
    }

    /// Number of cached handles.
    pub(crate) fn len(&self) -> usize {
        match &*self.inner.lock() {
            CacheInner::Bounded { by_key, .. } => by_key.len(),
            CacheInner::Unbounded { by_key, .. } => by_key.len(),
        }
    }

    /// Snapshot of every cached handle.
    pub(crate) fn handles(&self) -> Vec<LogHandle> {
        match &*self.inner.lock() {
            CacheInner::Bounded { by_key, .. } => {
                by_key.iter().map(|(_, handle)| handle.clone()).collect()
            }
            CacheInner::Unbounded { by_key, .. } => by_key.values().cloned().collect(),
        }
    }
}
