//! Append-only logs for wharf stores.
//!
//! The store side only ever sees the [`Log`] and [`LogFactory`] traits;
//! [`AppendLog`] is the builtin implementation, persisting entries through
//! a [`StorageBackend`] and syncing with peers over [`LogChannel`]
//! payloads. External log implementations plug in at the same seams.

mod append_log;
mod channel;
mod error;
mod storage;
mod traits;

pub use append_log::{AppendLog, AppendLogFactory};
pub use channel::LogChannel;
pub use error::{LogError, LogResult};
pub use storage::{FileBackend, LogStorage, MemoryBackend, StorageBackend};
pub use traits::{CreateOptions, Log, LogFactory, ReplicateOptions, ValueEncoding};
