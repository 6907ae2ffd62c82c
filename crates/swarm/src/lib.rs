//! Peer discovery and transport for wharf stores.
//!
//! The [`Swarm`] trait is the seam a production discovery substrate
//! (DHT, mDNS) implements; [`LocalNetwork`] is the builtin in-process
//! hub used by tests and single-process deployments.

mod error;
mod local;
mod traits;

pub use error::{SwarmError, SwarmResult};
pub use local::{LocalNetwork, LocalSwarm};
pub use traits::{PeerInfo, Swarm, SwarmConnection, SwarmEndpoint, SwarmIo};
