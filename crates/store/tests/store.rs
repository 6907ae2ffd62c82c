//! Store manager integration tests.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use wharf_log::{
    AppendLogFactory, CreateOptions, Log, LogError, LogFactory, LogResult, MemoryBackend,
    StorageBackend, ValueEncoding,
};
use wharf_meta::{MemoryMetaStore, MetaStore};
use wharf_primitives::Keypair;
use wharf_store::{
    CacheConfig, GetOptions, LogHandle, StoreConfig, StoreError, UpdateOptions, Wharf,
};

/// Factory that counts constructions, for cache-hit assertions.
struct CountingFactory {
    inner: AppendLogFactory,
    creates: Arc<AtomicUsize>,
}

impl LogFactory for CountingFactory {
    fn create(&self, options: CreateOptions) -> LogResult<Arc<dyn Log>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(options)
    }
}

/// Two configs sharing one in-memory metadata store and backend, for
/// close/reopen cycles without touching a disk.
fn shared_memory_configs() -> (StoreConfig, StoreConfig) {
    let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    (
        StoreConfig::in_memory().with_meta(Arc::clone(&meta)).with_backend(Arc::clone(&backend)),
        StoreConfig::in_memory().with_meta(meta).with_backend(backend),
    )
}

#[tokio::test]
async fn test_fresh_keys_are_distinct_and_derivation_deterministic() {
    let store = Wharf::open("store", StoreConfig::in_memory()).await.unwrap();

    let mut discovery_keys = HashSet::new();
    for _ in 0..16 {
        let handle = store.get(GetOptions::default()).unwrap();
        assert_eq!(handle.discovery_key(), handle.key().discovery_key());
        assert!(discovery_keys.insert(handle.discovery_key()));
    }
}

#[tokio::test]
async fn test_get_is_idempotent_before_readiness() {
    let creates = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory { inner: AppendLogFactory::new(), creates: Arc::clone(&creates) };
    let config = StoreConfig::in_memory().with_factory(Arc::new(factory));
    let store = Wharf::open("store", config).await.unwrap();

    let keypair = Keypair::generate();
    let first = store.get(GetOptions::for_keypair(keypair.clone())).unwrap();
    let second = store.get(GetOptions::for_key(keypair.public)).unwrap();

    // Same instance and one construction, without anyone awaiting ready.
    assert!(LogHandle::ptr_eq(&first, &second));
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    assert_eq!(store.cache_len(), 1);

    first.ready().await.unwrap();
    let third = store.get(GetOptions::for_key(keypair.public)).unwrap();
    assert!(LogHandle::ptr_eq(&first, &third));
    assert_eq!(creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_info_round_trips_configuration() {
    let store = Wharf::open("store", StoreConfig::in_memory()).await.unwrap();

    let options = GetOptions {
        seed: Some(false),
        sparse: Some(false),
        value_encoding: Some(ValueEncoding::Utf8),
        ..GetOptions::default()
    };
    let handle = store.get(options).unwrap();
    handle.ready().await.unwrap();

    let record = store.info(&handle.key()).unwrap().unwrap();
    assert_eq!(record.key, handle.key());
    assert_eq!(record.discovery_key, handle.discovery_key());
    assert!(!record.seed);
    assert!(!record.sparse);
    assert!(record.writable);
    assert_eq!(record.value_encoding, ValueEncoding::Utf8);

    // Unknown keys are a miss, not an error.
    let unknown = Keypair::generate().public;
    assert!(store.info(&unknown).unwrap().is_none());
    assert!(store.info_by_discovery_key(&unknown.discovery_key()).unwrap().is_none());
    assert!(store.info_by_name("nobody").unwrap().is_none());
}

#[tokio::test]
async fn test_restart_preserves_records_and_entries() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");

    let store = Wharf::open(&root, StoreConfig::on_disk(&root).unwrap()).await.unwrap();
    let handle = store.get(GetOptions::named("journal")).unwrap();
    handle.append(b"first").await.unwrap();
    handle.append(b"second").await.unwrap();
    let key = handle.key();
    store.close().await.unwrap();
    drop(handle);
    drop(store);

    let store = Wharf::open(&root, StoreConfig::on_disk(&root).unwrap()).await.unwrap();
    assert_eq!(store.cache_len(), 0);
    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed.get(&key).unwrap().name.as_deref(), Some("journal"));

    let handle = store.get_by_name("journal", GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(handle.key(), key);
    assert!(handle.writable());
    assert_eq!(handle.len(), 2);
    assert_eq!(handle.entry(0).await.unwrap().unwrap().as_ref(), b"first");
    assert_eq!(handle.entry(1).await.unwrap().unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn test_name_indirection_lifecycle() {
    let store = Wharf::open("store", StoreConfig::in_memory()).await.unwrap();

    assert!(store.get_by_name("ledger", GetOptions::default()).await.unwrap().is_none());

    let created = store.get(GetOptions::named("ledger")).unwrap();
    created.ready().await.unwrap();
    let key = created.key();

    let resolved = store.get_by_name("ledger", GetOptions::default()).await.unwrap().unwrap();
    assert!(LogHandle::ptr_eq(&created, &resolved));
    assert_eq!(store.info_by_name("ledger").unwrap().unwrap().key, key);
    assert_eq!(store.info_by_discovery_key(&key.discovery_key()).unwrap().unwrap().key, key);

    store.delete(&key).await.unwrap();
    assert!(store.get_by_name("ledger", GetOptions::default()).await.unwrap().is_none());
    assert!(store.info(&key).unwrap().is_none());
    assert!(store.info_by_name("ledger").unwrap().is_none());
    assert!(store.info_by_discovery_key(&key.discovery_key()).unwrap().is_none());
    assert!(!store.contains(&key));
    assert!(store.list().unwrap().is_empty());

    // The name is free again.
    let reused = store.get(GetOptions::named("ledger")).unwrap();
    reused.ready().await.unwrap();
    assert_ne!(reused.key(), key);
}

#[tokio::test]
async fn test_delete_removes_stored_entries() {
    let (first, second) = shared_memory_configs();
    let keypair = Keypair::generate();

    let store = Wharf::open("store", first).await.unwrap();
    let handle = store.get(GetOptions::for_keypair(keypair.clone())).unwrap();
    handle.append(b"data").await.unwrap();
    store.delete(&keypair.public).await.unwrap();
    store.close().await.unwrap();

    // Same backend: recreating the log finds no leftover entries.
    let store = Wharf::open("store", second).await.unwrap();
    let handle = store.get(GetOptions::for_keypair(keypair)).unwrap();
    handle.ready().await.unwrap();
    assert!(handle.is_empty());
}

#[tokio::test]
async fn test_bounded_cache_evicts_oldest() {
    let config = StoreConfig::in_memory()
        .with_cache(CacheConfig { capacity: NonZeroUsize::new(2), close_on_evict: false });
    let store = Wharf::open("store", config).await.unwrap();

    let first = store.get(GetOptions::default()).unwrap();
    first.ready().await.unwrap();
    let second = store.get(GetOptions::default()).unwrap();
    second.ready().await.unwrap();
    let third = store.get(GetOptions::default()).unwrap();
    third.ready().await.unwrap();

    assert_eq!(store.cache_len(), 2);
    assert!(!store.contains(&first.key()));
    assert!(store.contains(&second.key()));
    assert!(store.contains(&third.key()));

    // Eviction does not close the log; the held handle keeps working.
    first.append(b"still alive").await.unwrap();

    // Fetching the evicted key again produces a fresh instance.
    let again = store.get(GetOptions::for_key(first.key())).unwrap();
    assert!(!LogHandle::ptr_eq(&first, &again));
    again.ready().await.unwrap();
    assert!(again.writable());
}

#[tokio::test]
async fn test_eviction_closes_idle_log_when_configured() {
    let config = StoreConfig::in_memory()
        .with_cache(CacheConfig { capacity: NonZeroUsize::new(1), close_on_evict: true });
    let store = Wharf::open("store", config).await.unwrap();

    let first = store.get(GetOptions::default()).unwrap();
    first.ready().await.unwrap();
    first.append(b"kept").await.unwrap();

    let second = store.get(GetOptions::default()).unwrap();
    second.ready().await.unwrap();
    assert_eq!(store.cache_len(), 1);
    assert!(!store.contains(&first.key()));

    // The close runs on a background task; the held handle goes dead.
    let mut closed = false;
    for _ in 0..500 {
        if matches!(first.entry(0).await, Err(StoreError::Log(LogError::Closed))) {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(closed, "evicted log never closed");
    assert!(matches!(first.append(b"late").await, Err(StoreError::Log(LogError::Closed))));

    // The record survives; fetching the key again reopens the log.
    let again = store.get(GetOptions::for_key(first.key())).unwrap();
    again.ready().await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again.entry(0).await.unwrap().unwrap().as_ref(), b"kept");
}

#[tokio::test]
async fn test_update_merges_and_persists() {
    let (first, second) = shared_memory_configs();

    let store = Wharf::open("store", first).await.unwrap();
    let handle = store.get(GetOptions::default()).unwrap();
    handle.ready().await.unwrap();
    let key = handle.key();

    let options = UpdateOptions {
        sparse: Some(false),
        value_encoding: Some(ValueEncoding::Json),
        ..UpdateOptions::default()
    };
    let updated = store.update(&key, options).await.unwrap();
    assert!(!updated.sparse);
    assert_eq!(updated.value_encoding, ValueEncoding::Json);
    assert!(updated.seed);
    store.close().await.unwrap();

    let store = Wharf::open("store", second).await.unwrap();
    let record = store.info(&key).unwrap().unwrap();
    assert!(!record.sparse);
    assert_eq!(record.value_encoding, ValueEncoding::Json);
    assert!(record.seed);
}
