//! Discovery and transport seam.
//!
//! A [`Swarm`] announces interest in topics and delivers one
//! [`SwarmConnection`] per discovered peer. What a topic means on the
//! wire (DHT announce, mDNS, a test hub) is entirely the
//! implementation's business; the store only joins, leaves, and reads
//! connections off the endpoint's receiver.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use wharf_primitives::DiscoveryKey;

use crate::SwarmResult;

/// Byte stream a connection rides on.
pub trait SwarmIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SwarmIo for T {}

/// Transport metadata for an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Transport-scoped identifier of the remote peer.
    pub peer_id: u64,
    /// Topic the transport paired this connection on, when it knows.
    ///
    /// Transports that discover peers per-topic fill this in; the
    /// receiver treats it like a topic announcement from the remote.
    pub topic: Option<DiscoveryKey>,
}

/// An established peer connection.
pub struct SwarmConnection {
    /// Who the remote is and how the connection came about.
    pub info: PeerInfo,
    /// The raw byte stream, ready for a protocol handshake.
    pub stream: Box<dyn SwarmIo>,
}

impl std::fmt::Debug for SwarmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmConnection").field("info", &self.info).finish()
    }
}

/// Topic membership handle.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Send + Sync); the store joins
/// and leaves topics from concurrent tasks.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Announce interest in a topic. Joining a joined topic is a no-op.
    async fn join(&self, topic: DiscoveryKey) -> SwarmResult<()>;

    /// Withdraw interest in a topic.
    ///
    /// Stops future pairings only; established connections stay up until
    /// their streams close.
    async fn leave(&self, topic: DiscoveryKey) -> SwarmResult<()>;

    /// Tear the endpoint down: leave everything and close the
    /// connection receiver.
    async fn destroy(&self) -> SwarmResult<()>;
}

/// A swarm handle together with its incoming-connection receiver.
pub struct SwarmEndpoint {
    /// Topic membership operations.
    pub swarm: Arc<dyn Swarm>,
    /// Connections the transport established, both inbound and outbound.
    pub connections: mpsc::Receiver<SwarmConnection>,
}
