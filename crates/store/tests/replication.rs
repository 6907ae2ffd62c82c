//! Replication integration tests: stores exchanging logs over a local swarm.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wharf_log::{MemoryBackend, StorageBackend};
use wharf_meta::{MemoryMetaStore, MetaStore};
use wharf_store::{CacheConfig, GetOptions, StoreConfig, UpdateOptions, Wharf};
use wharf_swarm::LocalNetwork;

const POLL: Duration = Duration::from_millis(5);
const ATTEMPTS: usize = 500;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("wharf_store=debug")
        .with_test_writer()
        .try_init();
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..ATTEMPTS {
        if check() {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("timed out waiting for {what}");
}

/// A short window in which something must keep NOT happening.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn networked(network: &LocalNetwork) -> StoreConfig {
    StoreConfig::in_memory().with_networking(network.endpoint())
}

#[tokio::test]
async fn test_peer_fetches_seeded_log() {
    init_tracing();
    let network = LocalNetwork::new();
    let origin = Wharf::open("origin", networked(&network)).await.unwrap();
    let mirror = Wharf::open("mirror", networked(&network)).await.unwrap();

    let source = origin.get(GetOptions::default()).unwrap();
    source.append(b"zero").await.unwrap();
    source.append(b"one").await.unwrap();

    let copy = mirror.get(GetOptions::for_key(source.key())).unwrap();
    copy.ready().await.unwrap();
    assert!(!copy.writable());

    {
        let copy = copy.clone();
        wait_until("backfill", move || copy.len() == 2).await;
    }
    assert_eq!(copy.entry(0).await.unwrap().unwrap().as_ref(), b"zero");
    assert_eq!(copy.entry(1).await.unwrap().unwrap().as_ref(), b"one");

    // A live append flows through the open session.
    source.append(b"two").await.unwrap();
    {
        let copy = copy.clone();
        wait_until("live entry", move || copy.len() == 3).await;
    }
    assert_eq!(copy.entry(2).await.unwrap().unwrap().as_ref(), b"two");

    origin.close().await.unwrap();
    mirror.close().await.unwrap();
}

#[tokio::test]
async fn test_unseeded_log_is_never_served() {
    init_tracing();
    let network = LocalNetwork::new();
    let origin = Wharf::open("origin", networked(&network)).await.unwrap();
    let mirror = Wharf::open("mirror", networked(&network)).await.unwrap();

    let options = GetOptions { seed: Some(false), ..GetOptions::default() };
    let source = origin.get(options).unwrap();
    source.append(b"private").await.unwrap();

    let copy = mirror.get(GetOptions::for_key(source.key())).unwrap();
    copy.ready().await.unwrap();

    settle().await;
    assert!(copy.is_empty());
    assert_eq!(copy.peer_count(), 0);

    // Seeding it later serves the same waiting mirror.
    let seed = UpdateOptions { seed: Some(true), ..UpdateOptions::default() };
    origin.update(&source.key(), seed).await.unwrap();
    {
        let copy = copy.clone();
        wait_until("entry after seeding", move || copy.len() == 1).await;
    }

    origin.close().await.unwrap();
    mirror.close().await.unwrap();
}

#[tokio::test]
async fn test_unseeding_destroys_replication_streams() {
    init_tracing();
    let network = LocalNetwork::new();
    let origin = Wharf::open("origin", networked(&network)).await.unwrap();
    let mirror = Wharf::open("mirror", networked(&network)).await.unwrap();

    let source = origin.get(GetOptions::default()).unwrap();
    source.append(b"zero").await.unwrap();

    let copy = mirror.get(GetOptions::for_key(source.key())).unwrap();
    copy.ready().await.unwrap();
    {
        let copy = copy.clone();
        wait_until("initial sync", move || copy.len() == 1).await;
    }
    {
        let source = source.clone();
        wait_until("peer attached", move || source.peer_count() > 0).await;
    }

    let unseed = UpdateOptions { seed: Some(false), ..UpdateOptions::default() };
    origin.update(&source.key(), unseed).await.unwrap();

    {
        let source = source.clone();
        wait_until("origin streams torn down", move || source.peer_count() == 0).await;
    }
    {
        let copy = copy.clone();
        wait_until("mirror streams torn down", move || copy.peer_count() == 0).await;
    }

    // The mirror keeps its local copy, but new appends no longer flow.
    source.append(b"after").await.unwrap();
    settle().await;
    assert_eq!(copy.len(), 1);

    origin.close().await.unwrap();
    mirror.close().await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_destroys_the_stream() {
    init_tracing();
    let network = LocalNetwork::new();
    let origin = Wharf::open("origin", networked(&network)).await.unwrap();

    let source = origin.get(GetOptions::default()).unwrap();
    source.append(b"entry").await.unwrap();

    // Pose as a peer on the log's topic speaking a future protocol
    // version. A hello frame is a big-endian `u32` length prefix, the
    // variant tag, then the version byte.
    let mut endpoint = network.endpoint();
    endpoint.swarm.join(source.discovery_key()).await.unwrap();
    let mut connection = endpoint.connections.recv().await.unwrap();
    connection.stream.write_all(&[0, 0, 0, 2, 0, 2]).await.unwrap();

    // The store sends its own hello, then hangs up without ever
    // attaching the log.
    let mut hello = [0u8; 6];
    connection.stream.read_exact(&mut hello).await.unwrap();
    assert_eq!(hello, [0, 0, 0, 2, 0, 1]);

    let mut rest = Vec::new();
    connection.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(source.peer_count(), 0);

    origin.close().await.unwrap();
}

#[tokio::test]
async fn test_eviction_spares_replicating_logs() {
    init_tracing();
    let network = LocalNetwork::new();
    let cache = CacheConfig { capacity: NonZeroUsize::new(1), close_on_evict: true };
    let origin = Wharf::open("origin", networked(&network).with_cache(cache)).await.unwrap();
    let mirror = Wharf::open("mirror", networked(&network)).await.unwrap();

    let source = origin.get(GetOptions::default()).unwrap();
    source.append(b"zero").await.unwrap();

    let copy = mirror.get(GetOptions::for_key(source.key())).unwrap();
    copy.ready().await.unwrap();
    {
        let copy = copy.clone();
        wait_until("initial sync", move || copy.len() == 1).await;
    }
    {
        let source = source.clone();
        wait_until("peer attached", move || source.peer_count() > 0).await;
    }

    // Overflow the cache; the replicating log must survive its eviction.
    let other = origin.get(GetOptions::default()).unwrap();
    other.ready().await.unwrap();
    assert!(!origin.contains(&source.key()));

    source.append(b"one").await.unwrap();
    {
        let copy = copy.clone();
        wait_until("live entry after eviction", move || copy.len() == 2).await;
    }

    origin.close().await.unwrap();
    mirror.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_seeded_logs_resurrect_one_per_fetch() {
    init_tracing();
    let network = LocalNetwork::new();
    let meta: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let origin_config = || {
        StoreConfig::in_memory()
            .with_meta(Arc::clone(&meta))
            .with_backend(Arc::clone(&backend))
            .with_networking(network.endpoint())
    };

    let origin = Wharf::open("origin", origin_config()).await.unwrap();
    let mut keys = Vec::new();
    for i in 0..10 {
        let handle = origin.get(GetOptions::default()).unwrap();
        handle.append(format!("entry {i}").as_bytes()).await.unwrap();
        keys.push(handle.key());
    }
    origin.close().await.unwrap();

    // Reopening joins every seeded topic without opening any log.
    let origin = Wharf::open("origin", origin_config()).await.unwrap();
    assert_eq!(origin.cache_len(), 0);

    let mirror =
        Wharf::open("mirror", StoreConfig::in_memory().with_networking(network.endpoint()))
            .await
            .unwrap();

    for (fetched, key) in keys.iter().enumerate() {
        let copy = mirror.get(GetOptions::for_key(*key)).unwrap();
        copy.ready().await.unwrap();
        {
            let copy = copy.clone();
            wait_until("entry fetched", move || copy.len() == 1).await;
        }
        // Exactly one resurrection per remote fetch.
        wait_until("origin reopened the log", || origin.contains(key)).await;
        assert_eq!(origin.cache_len(), fetched + 1);
    }

    origin.close().await.unwrap();
    mirror.close().await.unwrap();
}
