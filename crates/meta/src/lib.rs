//! Ordered metadata storage for wharf stores.
//!
//! Log records and their secondary indexes live in one ordered keyspace;
//! everything a store persists about a log goes through the [`MetaStore`]
//! trait so deployments can pick a backend (redb on disk, memory for
//! transient stores and tests).

mod error;
mod memory;
mod redb_store;
mod traits;

pub use error::{MetaError, MetaResult};
pub use memory::MemoryMetaStore;
pub use redb_store::RedbMetaStore;
pub use traits::{BatchOp, MetaStore};
