//! Swarm-facing replication.
//!
//! The replicator owns everything between the swarm and the store's
//! logs: topic membership, one [`Session`](crate::session) per incoming
//! connection, and the replicating set that records which logs are
//! attached to which sessions. Logs opened purely to serve a peer are
//! closed again once their last session goes away.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use wharf_primitives::DiscoveryKey;
use wharf_swarm::{Swarm, SwarmConnection};

use crate::handle::LogHandle;
use crate::session;
use crate::store::StoreInner;
use crate::{StoreError, StoreResult};

/// State of one discovery key the replicator has dealt with.
struct ReplicatedLog {
    /// The resolved log, or `None` for a recorded resolution miss.
    log: Option<LogHandle>,
    /// Sessions currently attached to the log.
    sessions: HashSet<u64>,
}

struct SessionHandle {
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct ReplicatorState {
    /// Topics we have joined on the swarm.
    topics: HashSet<DiscoveryKey>,
    /// Resolution results, hits and misses both.
    replicating: HashMap<DiscoveryKey, ReplicatedLog>,
    /// Live sessions by id.
    sessions: HashMap<u64, SessionHandle>,
    stopped: bool,
}

pub(crate) struct Replicator {
    store: Arc<StoreInner>,
    swarm: Arc<dyn Swarm>,
    state: Mutex<ReplicatorState>,
    /// Serializes resolution across sessions; see [`Replicator::resolve`].
    resolve_lock: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    pub(crate) fn new(store: Arc<StoreInner>, swarm: Arc<dyn Swarm>) -> Arc<Self> {
        Arc::new(Self {
            store,
            swarm,
            state: Mutex::new(ReplicatorState::default()),
            resolve_lock: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(0),
            accept_task: Mutex::new(None),
        })
    }

    /// Start taking connections off the swarm endpoint.
    pub(crate) fn spawn_accept(self: Arc<Self>, mut connections: mpsc::Receiver<SwarmConnection>) {
        let replicator = Arc::clone(&self);
        let task = tokio::spawn(async move {
            while let Some(connection) = connections.recv().await {
                Arc::clone(&replicator).spawn_session(connection);
            }
            trace!("Connection receiver closed");
        });
        *self.accept_task.lock() = Some(task);
    }

    fn spawn_session(self: Arc<Self>, connection: SwarmConnection) {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.sessions.insert(session_id, SessionHandle { shutdown: shutdown_tx });
        }
        debug!(session = session_id, peer = connection.info.peer_id, "Session started");
        tokio::spawn(session::run_session(self, session_id, connection, shutdown_rx));
    }

    /// Start replicating a discovery key: join its topic and forget any
    /// recorded resolution miss, so the log resolves afresh next time a
    /// peer asks.
    pub(crate) async fn add(&self, discovery_key: DiscoveryKey) -> StoreResult<()> {
        let newly_joined = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(StoreError::Closed);
            }
            if state
                .replicating
                .get(&discovery_key)
                .is_some_and(|entry| entry.log.is_none())
            {
                state.replicating.remove(&discovery_key);
            }
            state.topics.insert(discovery_key)
        };
        if newly_joined {
            self.swarm.join(discovery_key).await?;
            trace!(discovery_key = %discovery_key, "Joined topic");
        }
        Ok(())
    }

    /// Stop replicating a discovery key: destroy every session attached
    /// to its log and leave the topic. The log itself is not closed;
    /// that stays the caller's business.
    pub(crate) async fn remove(&self, discovery_key: DiscoveryKey) -> StoreResult<()> {
        let shutdowns = {
            let mut state = self.state.lock();
            state.topics.remove(&discovery_key);
            let mut shutdowns = Vec::new();
            if let Some(entry) = state.replicating.remove(&discovery_key) {
                for session_id in &entry.sessions {
                    if let Some(session) = state.sessions.get(session_id) {
                        shutdowns.push(session.shutdown.clone());
                    }
                }
            }
            shutdowns
        };
        for shutdown in shutdowns {
            let _ = shutdown.send(true);
        }
        self.swarm.leave(discovery_key).await?;
        debug!(discovery_key = %discovery_key, "Stopped replicating");
        Ok(())
    }

    /// Resolve an announced discovery key to a log for `session_id`.
    ///
    /// One resolution at a time, process-wide: the lock keeps two
    /// sessions from racing `seed_log` for the same key and keeps
    /// resolution from interleaving with a teardown's reclaim check.
    /// `Ok(None)` means there is nothing to attach: unknown key,
    /// unseeded log, a recorded miss, or this session already has it.
    pub(crate) async fn resolve(
        &self,
        session_id: u64,
        discovery_key: DiscoveryKey,
    ) -> StoreResult<Option<LogHandle>> {
        let _resolving = self.resolve_lock.lock().await;

        {
            let mut state = self.state.lock();
            if state.stopped {
                return Ok(None);
            }
            if let Some(entry) = state.replicating.get_mut(&discovery_key) {
                return Ok(match &entry.log {
                    Some(handle) if entry.sessions.insert(session_id) => Some(handle.clone()),
                    _ => None,
                });
            }
        }

        // True miss: ask the store, which may open the log from disk.
        let resolved = Arc::clone(&self.store).seed_log(discovery_key).await?;

        let mut state = self.state.lock();
        if state.stopped {
            return Ok(None);
        }
        let entry = state
            .replicating
            .entry(discovery_key)
            .or_insert_with(|| ReplicatedLog { log: resolved, sessions: HashSet::new() });
        Ok(match &entry.log {
            Some(handle) if entry.sessions.insert(session_id) => Some(handle.clone()),
            _ => None,
        })
    }

    /// Undo a [`Replicator::resolve`] whose attach failed.
    pub(crate) async fn detach(&self, session_id: u64, discovery_key: DiscoveryKey) {
        let reclaimed = {
            let mut state = self.state.lock();
            release(&self.store, &mut state, session_id, discovery_key)
        };
        if let Some(handle) = reclaimed {
            self.close_replication_only(discovery_key, handle).await;
        }
    }

    /// Teardown after a session's stream is gone. Runs exactly once per
    /// session; `attached` are the keys the session was attached to.
    pub(crate) async fn session_closed(&self, session_id: u64, attached: &[DiscoveryKey]) {
        let reclaimed = {
            let mut state = self.state.lock();
            state.sessions.remove(&session_id);
            attached
                .iter()
                .filter_map(|discovery_key| {
                    release(&self.store, &mut state, session_id, *discovery_key)
                        .map(|handle| (*discovery_key, handle))
                })
                .collect::<Vec<_>>()
        };
        for (discovery_key, handle) in reclaimed {
            self.close_replication_only(discovery_key, handle).await;
        }
    }

    /// Destroy the swarm endpoint and every session. Logs the store
    /// still caches are left to the store's own close.
    pub(crate) async fn stop(&self) {
        let (shutdowns, leftovers) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let shutdowns: Vec<_> =
                state.sessions.drain().map(|(_, session)| session.shutdown).collect();
            let leftovers: Vec<_> = state
                .replicating
                .drain()
                .filter_map(|(discovery_key, entry)| {
                    let handle = entry.log?;
                    (!self.store.cache.contains_discovery(&discovery_key))
                        .then_some((discovery_key, handle))
                })
                .collect();
            state.topics.clear();
            (shutdowns, leftovers)
        };

        for shutdown in &shutdowns {
            let _ = shutdown.send(true);
        }
        for (discovery_key, handle) in leftovers {
            self.close_replication_only(discovery_key, handle).await;
        }
        if let Err(err) = self.swarm.destroy().await {
            warn!(error = %err, "Failed to destroy swarm endpoint");
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        debug!("Replicator stopped");
    }

    async fn close_replication_only(&self, discovery_key: DiscoveryKey, handle: LogHandle) {
        debug!(discovery_key = %discovery_key, "Closing log held only for replication");
        if let Err(err) = handle.log().close().await {
            warn!(discovery_key = %discovery_key, error = %err, "Failed to close log");
        }
    }
}

/// Drop `session_id` from a replicating entry. Returns the log when the
/// entry's last session went away and the store's cache does not hold
/// it; such a log was only ever open for replication and gets closed.
fn release(
    store: &StoreInner,
    state: &mut ReplicatorState,
    session_id: u64,
    discovery_key: DiscoveryKey,
) -> Option<LogHandle> {
    let entry = state.replicating.get_mut(&discovery_key)?;
    entry.sessions.remove(&session_id);
    if !entry.sessions.is_empty() || entry.log.is_none() {
        // Other sessions still attached, or a recorded miss; misses are
        // kept until `add` clears them.
        return None;
    }
    if store.cache.contains_discovery(&discovery_key) {
        return None;
    }
    state.replicating.remove(&discovery_key).and_then(|entry| entry.log)
}
