//! Log and log-factory traits.
//!
//! A store manages many logs but never looks inside them; everything it
//! needs is behind [`Log`]. The [`LogFactory`] seam keeps construction
//! synchronous: a freshly created log is handed out immediately and
//! loads itself when [`Log::ready`] is first awaited.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use wharf_primitives::{DiscoveryKey, PublicKey, SecretKey};

use crate::channel::LogChannel;
use crate::storage::StorageBackend;
use crate::LogResult;

/// How entry payloads should be interpreted by consumers.
///
/// Carried as log metadata; `utf8` additionally rejects invalid appends.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValueEncoding {
    /// Raw bytes, no interpretation.
    #[default]
    Binary,
    /// UTF-8 text; appends are validated.
    Utf8,
    /// JSON documents; advisory only.
    Json,
}

/// Options for attaching a replication channel to a log.
#[derive(Debug, Clone)]
pub struct ReplicateOptions {
    /// Keep forwarding new entries as they are appended.
    pub live: bool,
    /// Request entries the remote side advertises.
    pub download: bool,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self { live: true, download: true }
    }
}

/// Everything a factory needs to construct a log.
#[derive(Clone)]
pub struct CreateOptions {
    /// The log's public identity.
    pub key: PublicKey,
    /// Secret half, present when the log is writable here.
    pub secret_key: Option<SecretKey>,
    /// Backend the log opens its storage from on first ready.
    pub backend: Arc<dyn StorageBackend>,
    /// Storage path for this log, already namespaced by the caller.
    pub path: std::path::PathBuf,
    /// Declared payload interpretation.
    pub value_encoding: ValueEncoding,
    /// Whether replication may leave gaps for lazily fetched entries.
    pub sparse: bool,
}

/// An append-only log of opaque entries.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Send + Sync); handles are shared
/// across sessions and store callers.
#[async_trait]
pub trait Log: Send + Sync {
    /// The log's public identity.
    fn key(&self) -> PublicKey;

    /// The topic identity derived from the key.
    fn discovery_key(&self) -> DiscoveryKey;

    /// Whether this instance holds the secret key.
    fn writable(&self) -> bool;

    /// Load the log's persisted state.
    ///
    /// Idempotent; every later call is a cheap no-op.
    async fn ready(&self) -> LogResult<()>;

    /// Append one entry, returning its index.
    async fn append(&self, entry: &[u8]) -> LogResult<u64>;

    /// Get the entry at `index`.
    ///
    /// Returns `None` when the index is beyond what is stored locally.
    async fn entry(&self, index: u64) -> LogResult<Option<Bytes>>;

    /// Number of entries stored locally.
    fn len(&self) -> u64;

    /// Whether the log has no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of replication channels currently attached.
    fn peer_count(&self) -> usize;

    /// Attach a replication channel.
    ///
    /// The log drives the channel until the remote side hangs up or the
    /// log is closed.
    fn replicate(&self, channel: LogChannel, options: ReplicateOptions) -> LogResult<()>;

    /// Close the log and detach every replication channel.
    async fn close(&self) -> LogResult<()>;
}

/// Constructs logs for a store.
///
/// `create` must not block or fail on IO; loading happens in
/// [`Log::ready`].
pub trait LogFactory: Send + Sync {
    /// Construct a log from the given options.
    fn create(&self, options: CreateOptions) -> LogResult<Arc<dyn Log>>;
}
