//! In-process swarm hub.
//!
//! [`LocalNetwork`] stands in for a real discovery substrate: endpoints
//! register interest per topic and the hub pairs every new joiner with
//! the current members through `tokio::io::duplex` byte streams. Both
//! sides receive the connection on their accept queue, tagged with the
//! topic it was paired on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use wharf_primitives::DiscoveryKey;

use crate::traits::{PeerInfo, Swarm, SwarmConnection, SwarmEndpoint};
use crate::{SwarmError, SwarmResult};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

/// Capacity of each endpoint's accept queue.
const ACCEPT_QUEUE: usize = 64;

/// Shared hub that pairs endpoints by topic.
///
/// Clones share state; every endpoint created from any clone sees the
/// same topic membership.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_peer_id: u64,
    topics: HashMap<DiscoveryKey, Vec<Member>>,
}

#[derive(Clone)]
struct Member {
    peer_id: u64,
    accept_tx: mpsc::Sender<SwarmConnection>,
}

impl LocalNetwork {
    /// Create a new empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint on this hub.
    pub fn endpoint(&self) -> SwarmEndpoint {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        let peer_id = {
            let mut state = self.state.lock();
            state.next_peer_id += 1;
            state.next_peer_id
        };
        let swarm = LocalSwarm {
            peer_id,
            network: self.clone(),
            accept_tx: Mutex::new(Some(accept_tx)),
        };
        SwarmEndpoint { swarm: Arc::new(swarm), connections: accept_rx }
    }
}

/// One endpoint's membership handle on a [`LocalNetwork`].
pub struct LocalSwarm {
    peer_id: u64,
    network: LocalNetwork,
    /// Dropped on destroy so the endpoint's accept queue closes.
    accept_tx: Mutex<Option<mpsc::Sender<SwarmConnection>>>,
}

#[async_trait]
impl Swarm for LocalSwarm {
    async fn join(&self, topic: DiscoveryKey) -> SwarmResult<()> {
        let Some(accept_tx) = self.accept_tx.lock().clone() else {
            return Err(SwarmError::Destroyed);
        };

        let members = {
            let mut state = self.network.state.lock();
            let members = state.topics.entry(topic).or_default();
            if members.iter().any(|member| member.peer_id == self.peer_id) {
                return Ok(());
            }
            let existing = members.clone();
            members.push(Member { peer_id: self.peer_id, accept_tx: accept_tx.clone() });
            existing
        };
        debug!(%topic, peer_id = self.peer_id, "Joined topic");

        for member in members {
            let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
            let to_member = SwarmConnection {
                info: PeerInfo { peer_id: self.peer_id, topic: Some(topic) },
                stream: Box::new(theirs),
            };
            if member.accept_tx.send(to_member).await.is_err() {
                // Member endpoint is gone; the hub prunes it on destroy.
                continue;
            }
            let to_us = SwarmConnection {
                info: PeerInfo { peer_id: member.peer_id, topic: Some(topic) },
                stream: Box::new(ours),
            };
            if accept_tx.send(to_us).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> SwarmResult<()> {
        if self.accept_tx.lock().is_none() {
            return Err(SwarmError::Destroyed);
        }
        let mut state = self.network.state.lock();
        if let Some(members) = state.topics.get_mut(&topic) {
            members.retain(|member| member.peer_id != self.peer_id);
            if members.is_empty() {
                state.topics.remove(&topic);
            }
        }
        debug!(%topic, peer_id = self.peer_id, "Left topic");
        Ok(())
    }

    async fn destroy(&self) -> SwarmResult<()> {
        if self.accept_tx.lock().take().is_none() {
            return Ok(());
        }
        let mut state = self.network.state.lock();
        state.topics.retain(|_, members| {
            members.retain(|member| member.peer_id != self.peer_id);
            !members.is_empty()
        });
        debug!(peer_id = self.peer_id, "Destroyed endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn topic(n: u8) -> DiscoveryKey {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        DiscoveryKey::new(bytes)
    }

    #[tokio::test]
    async fn test_join_pairs_both_sides() {
        let network = LocalNetwork::new();
        let mut a = network.endpoint();
        let mut b = network.endpoint();

        a.swarm.join(topic(1)).await.unwrap();
        b.swarm.join(topic(1)).await.unwrap();

        let conn_a = a.connections.recv().await.unwrap();
        let conn_b = b.connections.recv().await.unwrap();
        assert_eq!(conn_a.info.topic, Some(topic(1)));
        assert_eq!(conn_b.info.topic, Some(topic(1)));
        assert_ne!(conn_a.info.peer_id, conn_b.info.peer_id);

        // The pair is a live byte stream
        let mut stream_a = conn_a.stream;
        let mut stream_b = conn_b.stream;
        stream_a.write_all(b"ping").await.unwrap();
        stream_a.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let network = LocalNetwork::new();
        let mut a = network.endpoint();

        a.swarm.join(topic(1)).await.unwrap();
        a.swarm.join(topic(1)).await.unwrap();

        assert!(timeout(Duration::from_millis(50), a.connections.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_late_joiner_pairs_with_all_members() {
        let network = LocalNetwork::new();
        let mut a = network.endpoint();
        let mut b = network.endpoint();
        let mut c = network.endpoint();

        a.swarm.join(topic(1)).await.unwrap();
        b.swarm.join(topic(1)).await.unwrap();
        c.swarm.join(topic(1)).await.unwrap();

        // c paired with both existing members
        assert!(c.connections.recv().await.is_some());
        assert!(c.connections.recv().await.is_some());
        // a got one from b and one from c
        assert!(a.connections.recv().await.is_some());
        assert!(a.connections.recv().await.is_some());
        assert!(b.connections.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_leave_stops_future_pairings() {
        let network = LocalNetwork::new();
        let mut a = network.endpoint();
        let mut b = network.endpoint();

        a.swarm.join(topic(1)).await.unwrap();
        a.swarm.leave(topic(1)).await.unwrap();
        b.swarm.join(topic(1)).await.unwrap();

        assert!(timeout(Duration::from_millis(50), a.connections.recv()).await.is_err());
        assert!(timeout(Duration::from_millis(50), b.connections.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_closes_accept_queue() {
        let network = LocalNetwork::new();
        let mut a = network.endpoint();
        let b = network.endpoint();

        a.swarm.join(topic(1)).await.unwrap();
        a.swarm.destroy().await.unwrap();

        assert_eq!(a.connections.recv().await.map(|c| c.info.peer_id), None);
        // Destroyed member no longer gets paired
        b.swarm.join(topic(1)).await.unwrap();
        assert!(matches!(a.swarm.join(topic(1)).await, Err(SwarmError::Destroyed)));
    }
}
