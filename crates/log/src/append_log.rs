//! Builtin append-only log.
//!
//! [`AppendLog`] persists entries as one length-prefixed blob and syncs
//! with remote counterparts through a small Have/Request/Data protocol
//! carried over [`LogChannel`] payloads. Construction is synchronous;
//! storage is opened on the first [`Log::ready`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use wharf_primitives::{DiscoveryKey, PublicKey};

use crate::channel::LogChannel;
use crate::storage::{LogStorage, StorageBackend};
use crate::traits::{CreateOptions, Log, LogFactory, ReplicateOptions, ValueEncoding};
use crate::{LogError, LogResult};

/// Blob holding the framed entries.
const ENTRIES_BLOB: &str = "entries";

/// Upper bound for a single entry payload.
const MAX_ENTRY_SIZE: usize = 8 * 1024 * 1024;

/// Broadcast buffer for live appends; lagging channels fall back to
/// advertising their length and serving requests.
const LIVE_BUFFER: usize = 256;

/// Wire messages of the builtin sync protocol. Opaque to transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum SyncMessage {
    /// Advertise how many entries the sender holds.
    Have { length: u64 },
    /// Ask for every entry from `from` upward.
    Request { from: u64 },
    /// A single entry.
    Data { index: u64, entry: Vec<u8> },
}

/// An entry index paired with its payload, as fanned out to live channels.
type LiveEntry = (u64, Bytes);

/// Builtin [`Log`] implementation over a [`crate::storage::StorageBackend`].
#[derive(Clone)]
pub struct AppendLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    key: PublicKey,
    discovery_key: DiscoveryKey,
    writable: bool,
    value_encoding: ValueEncoding,
    backend: Arc<dyn StorageBackend>,
    path: PathBuf,
    state: Mutex<LogState>,
    peers: AtomicUsize,
    /// Serializes opening and appends so frame order matches entry order.
    io_lock: tokio::sync::Mutex<()>,
    live_tx: broadcast::Sender<LiveEntry>,
    close_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct LogState {
    entries: Vec<Bytes>,
    storage: Option<Arc<dyn LogStorage>>,
}

impl AppendLog {
    /// Construct a log. Fails only when the secret key does not belong
    /// to the public key; IO happens later in [`Log::ready`].
    pub fn new(options: CreateOptions) -> LogResult<Self> {
        if let Some(secret) = &options.secret_key {
            if secret.public_key() != options.key {
                return Err(LogError::KeyMismatch);
            }
        }
        let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
        let (close_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(LogInner {
                discovery_key: options.key.discovery_key(),
                key: options.key,
                writable: options.secret_key.is_some(),
                value_encoding: options.value_encoding,
                backend: options.backend,
                path: options.path,
                state: Mutex::new(LogState::default()),
                peers: AtomicUsize::new(0),
                io_lock: tokio::sync::Mutex::new(()),
                live_tx,
                close_tx,
            }),
        })
    }
}

impl LogInner {
    fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    fn len(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    /// Clone out `[from..]` for serving a request.
    fn entries_from(&self, from: u64) -> Vec<LiveEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .enumerate()
            .skip(from as usize)
            .map(|(index, entry)| (index as u64, entry.clone()))
            .collect()
    }

    /// Apply an entry received from a peer.
    ///
    /// Only an entry that lands exactly at the current length extends the
    /// log; anything else returns `Ok(false)` and the channel decides
    /// whether to re-request.
    async fn apply_remote(&self, index: u64, entry: Vec<u8>) -> LogResult<bool> {
        if entry.len() > MAX_ENTRY_SIZE {
            return Err(LogError::EntryTooLarge { size: entry.len(), max: MAX_ENTRY_SIZE });
        }
        let _io = self.io_lock.lock().await;
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let (storage, len) = {
            let state = self.state.lock();
            (state.storage.clone(), state.entries.len() as u64)
        };
        let storage = storage.ok_or(LogError::NotReady)?;
        if index != len {
            return Ok(false);
        }
        storage.append(ENTRIES_BLOB, &encode_frame(&entry)).await?;
        let entry = Bytes::from(entry);
        self.state.lock().entries.push(entry.clone());
        let _ = self.live_tx.send((index, entry));
        Ok(true)
    }
}

#[async_trait]
impl Log for AppendLog {
    fn key(&self) -> PublicKey {
        self.inner.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery_key
    }

    fn writable(&self) -> bool {
        self.inner.writable
    }

    async fn ready(&self) -> LogResult<()> {
        if self.inner.is_closed() {
            return Err(LogError::Closed);
        }
        let _io = self.inner.io_lock.lock().await;
        if self.inner.state.lock().storage.is_some() {
            return Ok(());
        }
        let storage = self.inner.backend.create(&self.inner.path).await?;
        let blob = storage.read(ENTRIES_BLOB).await?;
        let entries = blob.map(|blob| decode_frames(&blob)).unwrap_or_default();
        debug!(key = %self.inner.key, entries = entries.len(), "Opened log");
        let mut state = self.inner.state.lock();
        state.entries = entries;
        state.storage = Some(storage);
        Ok(())
    }

    async fn append(&self, entry: &[u8]) -> LogResult<u64> {
        if !self.inner.writable {
            return Err(LogError::NotWritable);
        }
        if entry.len() > MAX_ENTRY_SIZE {
            return Err(LogError::EntryTooLarge { size: entry.len(), max: MAX_ENTRY_SIZE });
        }
        if self.inner.value_encoding == ValueEncoding::Utf8 && std::str::from_utf8(entry).is_err() {
            return Err(LogError::InvalidEncoding("utf8"));
        }
        let _io = self.inner.io_lock.lock().await;
        if self.inner.is_closed() {
            return Err(LogError::Closed);
        }
        let storage = self.inner.state.lock().storage.clone().ok_or(LogError::NotReady)?;
        storage.append(ENTRIES_BLOB, &encode_frame(entry)).await?;
        let entry = Bytes::copy_from_slice(entry);
        let index = {
            let mut state = self.inner.state.lock();
            state.entries.push(entry.clone());
            state.entries.len() as u64 - 1
        };
        let _ = self.inner.live_tx.send((index, entry));
        trace!(key = %self.inner.key, index, "Appended entry");
        Ok(index)
    }

    async fn entry(&self, index: u64) -> LogResult<Option<Bytes>> {
        if self.inner.is_closed() {
            return Err(LogError::Closed);
        }
        let state = self.inner.state.lock();
        if state.storage.is_none() {
            return Err(LogError::NotReady);
        }
        Ok(state.entries.get(index as usize).cloned())
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn peer_count(&self) -> usize {
        self.inner.peers.load(Ordering::SeqCst)
    }

    fn replicate(&self, channel: LogChannel, options: ReplicateOptions) -> LogResult<()> {
        if self.inner.is_closed() {
            return Err(LogError::Closed);
        }
        if self.inner.state.lock().storage.is_none() {
            return Err(LogError::NotReady);
        }
        self.inner.peers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_channel(Arc::clone(&self.inner), channel, options));
        Ok(())
    }

    async fn close(&self) -> LogResult<()> {
        if self.inner.close_tx.send_replace(true) {
            return Ok(());
        }
        debug!(key = %self.inner.key, "Closed log");
        Ok(())
    }
}

/// Factory producing [`AppendLog`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppendLogFactory;

impl AppendLogFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl LogFactory for AppendLogFactory {
    fn create(&self, options: CreateOptions) -> LogResult<Arc<dyn Log>> {
        Ok(Arc::new(AppendLog::new(options)?))
    }
}

/// Drive one replication channel until the remote hangs up or the log
/// closes.
async fn run_channel(inner: Arc<LogInner>, mut channel: LogChannel, options: ReplicateOptions) {
    let mut live_rx = inner.live_tx.subscribe();
    let mut close_rx = inner.close_tx.subscribe();
    // Highest entry count the remote is known to hold; suppresses echoes.
    let mut remote_len: u64 = 0;

    let hello = SyncMessage::Have { length: inner.len() };
    if send(&channel, &hello).await.is_ok() {
        loop {
            tokio::select! {
                payload = channel.incoming.recv() => {
                    let Some(payload) = payload else { break };
                    let message = match postcard::from_bytes::<SyncMessage>(&payload) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(key = %inner.key, %err, "Dropping undecodable sync message");
                            continue;
                        }
                    };
                    if handle_message(&inner, &channel, &options, &mut remote_len, message)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                entry = live_rx.recv() => {
                    match entry {
                        Ok((index, entry)) => {
                            if !options.live || index < remote_len {
                                continue;
                            }
                            let data = SyncMessage::Data { index, entry: entry.to_vec() };
                            if send(&channel, &data).await.is_err() {
                                break;
                            }
                            remote_len = index + 1;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            trace!(key = %inner.key, skipped, "Live feed lagged, re-advertising");
                            let have = SyncMessage::Have { length: inner.len() };
                            if send(&channel, &have).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
    }

    inner.peers.fetch_sub(1, Ordering::SeqCst);
    trace!(key = %inner.key, "Replication channel detached");
}

async fn handle_message(
    inner: &Arc<LogInner>,
    channel: &LogChannel,
    options: &ReplicateOptions,
    remote_len: &mut u64,
    message: SyncMessage,
) -> LogResult<()> {
    match message {
        SyncMessage::Have { length } => {
            *remote_len = (*remote_len).max(length);
            let len = inner.len();
            if options.download && !inner.writable && length > len {
                send(channel, &SyncMessage::Request { from: len }).await?;
            }
        }
        SyncMessage::Request { from } => {
            for (index, entry) in inner.entries_from(from) {
                send(channel, &SyncMessage::Data { index, entry: entry.to_vec() }).await?;
                *remote_len = (*remote_len).max(index + 1);
            }
        }
        SyncMessage::Data { index, entry } => {
            if inner.writable || !options.download {
                return Ok(());
            }
            *remote_len = (*remote_len).max(index + 1);
            match inner.apply_remote(index, entry).await {
                Ok(true) => {}
                Ok(false) => {
                    // Stale duplicates are dropped; a gap means we lag and
                    // must re-request from our own length.
                    let len = inner.len();
                    if index > len {
                        send(channel, &SyncMessage::Request { from: len }).await?;
                    }
                }
                Err(err) => {
                    warn!(key = %inner.key, %err, "Failed to apply replicated entry");
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

async fn send(channel: &LogChannel, message: &SyncMessage) -> LogResult<()> {
    let payload = postcard::to_allocvec(message)?;
    channel.outgoing.send(payload).await.map_err(|_| LogError::Closed)
}

fn encode_frame(entry: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + entry.len());
    frame.extend_from_slice(&(entry.len() as u32).to_be_bytes());
    frame.extend_from_slice(entry);
    frame
}

/// Split a persisted blob back into entries.
///
/// A torn trailing frame from an interrupted append is dropped so the log
/// reopens at its last complete entry.
fn decode_frames(blob: &[u8]) -> Vec<Bytes> {
    let mut entries = Vec::new();
    let mut rest = blob;
    while let Some((len_bytes, tail)) = rest.split_first_chunk::<4>() {
        let len = u32::from_be_bytes(*len_bytes) as usize;
        if tail.len() < len {
            break;
        }
        let (entry, tail) = tail.split_at(len);
        entries.push(Bytes::copy_from_slice(entry));
        rest = tail;
    }
    if !rest.is_empty() {
        warn!(dropped = rest.len(), "Dropping torn frame at end of entry blob");
    }
    entries
}
