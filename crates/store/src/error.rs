//! Store error types.
//!
//! Lookup misses are not errors: `info*` and `get_by_name` return
//! `Ok(None)`. Errors split into caller mistakes (`UnknownKey`,
//! `Uninitialized`, `NameImmutable`, `NameTaken`), collaborator
//! failures (`Meta`, `Log`, `Swarm`, `Io`), and data problems
//! (`Corrupt`, `Protocol`).

use wharf_log::LogError;
use wharf_meta::MetaError;
use wharf_primitives::PublicKey;
use wharf_swarm::SwarmError;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// No persisted record exists for the key.
    #[error("unknown log: {0}")]
    UnknownKey(PublicKey),

    /// The operation needs the log loaded in the cache first.
    #[error("log is not loaded: {0}")]
    Uninitialized(PublicKey),

    /// A log's name cannot be changed after creation.
    #[error("log name is immutable")]
    NameImmutable,

    /// The name already points at a different log.
    #[error("name already registered: {0}")]
    NameTaken(String),

    /// The log's background open failed earlier.
    #[error("log failed to open: {0}")]
    OpenFailed(String),

    /// A persisted record or index entry could not be decoded.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// A peer broke the replication protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Metadata store failure.
    #[error("metadata: {0}")]
    Meta(#[from] MetaError),

    /// Log failure.
    #[error("log: {0}")]
    Log(#[from] LogError),

    /// Swarm failure.
    #[error("swarm: {0}")]
    Swarm(#[from] SwarmError),

    /// IO error outside any collaborator.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
