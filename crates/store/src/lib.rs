//! Multi-log store with swarm replication.
//!
//! [`Wharf`] manages a collection of append-only logs keyed by public
//! key, persisting metadata so the collection survives restarts. Seeded
//! logs are served to peers discovered through a swarm: a log a peer
//! asks for is opened on demand and closed again when the last
//! interested connection goes away.
//!
//! The collaborators are pluggable. [`StoreConfig`] wires a metadata
//! store (`wharf-meta`), a log implementation (`wharf-log`) and a swarm
//! (`wharf-swarm`) together; the in-memory and on-disk wirings cover
//! tests and single-process deployments.

mod cache;
mod config;
mod error;
mod handle;
mod info;
mod replicator;
mod session;
mod store;

pub use config::{CacheConfig, StoreConfig, LOGS_DIR, METADATA_FILE};
pub use error::{StoreError, StoreResult};
pub use handle::{LogHandle, ReadyStatus};
pub use info::LogInfo;
pub use store::{GetOptions, UpdateOptions, Wharf};
