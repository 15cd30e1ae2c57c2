//! In-process transport for tests and simulations
//!
//! Nodes register on a shared [`MemoryNetwork`]. Frames only flow between
//! explicitly linked nodes, so partial topologies (and therefore relaying)
//! can be exercised without sockets.

use crate::framing::{Frame, FrameError, MAX_FRAME_SIZE};
use crate::handshake::HandshakeError;
use crate::peer::PeerAddr;
use crate::transport::{
    Transport, TransportError, TransportEvent, TransportHandle, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use meshkv_core::crypto::KeyPair;
use meshkv_core::types::PeerId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Shared state for the in-memory network
#[derive(Default)]
pub struct MemoryNetwork {
    /// Event channel for each registered node
    nodes: RwLock<HashMap<PeerId, mpsc::Sender<TransportEvent>>>,
    /// Undirected links, stored with the smaller id first
    links: RwLock<HashSet<(PeerId, PeerId)>>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryNetwork {
    /// Create a new memory network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its transport
    pub fn create_transport(self: &Arc<Self>, keypair: &KeyPair) -> TransportHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let local_id = keypair.peer_id();
        self.nodes.write().insert(local_id, tx);

        let transport = MemoryTransport {
            local_id,
            network: Arc::clone(self),
            closed: AtomicBool::new(false),
        };
        TransportHandle::new(Arc::new(transport), rx)
    }

    /// Whether two nodes share a link
    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.read().contains(&link_key(a, b))
    }

    /// Number of registered nodes
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    fn deliver(&self, to: PeerId, event: TransportEvent) -> Result<(), TransportError> {
        let sender = self
            .nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(to))?;
        sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure(to),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn unlink(&self, a: PeerId, b: PeerId) -> bool {
        let removed = self.links.write().remove(&link_key(a, b));
        if removed {
            let _ = self.deliver(a, TransportEvent::PeerDisconnected(b));
            let _ = self.deliver(b, TransportEvent::PeerDisconnected(a));
        }
        removed
    }
}

/// In-memory transport endpoint
pub struct MemoryTransport {
    local_id: PeerId,
    network: Arc<MemoryNetwork>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn connect(&self, addr: &PeerAddr) -> Result<PeerId, TransportError> {
        self.ensure_open()?;
        let peer = addr.peer_id.ok_or(TransportError::Unroutable(*addr))?;
        if peer == self.local_id {
            return Err(HandshakeError::SelfConnection.into());
        }
        if !self.network.nodes.read().contains_key(&peer) {
            return Err(TransportError::PeerNotFound(peer));
        }

        let newly_linked = self
            .network
            .links
            .write()
            .insert(link_key(self.local_id, peer));
        if newly_linked {
            debug!("Memory link {} <-> {}", self.local_id.short(), peer.short());
            self.network.deliver(
                self.local_id,
                TransportEvent::PeerConnected {
                    peer_id: peer,
                    addr: None,
                },
            )?;
            self.network.deliver(
                peer,
                TransportEvent::PeerConnected {
                    peer_id: self.local_id,
                    addr: None,
                },
            )?;
        }
        Ok(peer)
    }

    async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.network.is_linked(self.local_id, *to) {
            return Err(TransportError::PeerNotFound(*to));
        }
        if frame.payload.len() + 1 > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(frame.payload.len() + 1).into());
        }
        self.network.deliver(
            *to,
            TransportEvent::FrameReceived {
                from: self.local_id,
                frame,
            },
        )
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network
            .links
            .read()
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.local_id {
                    Some(*b)
                } else if *b == self.local_id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.is_linked(self.local_id, *peer)
    }

    async fn disconnect(&self, peer: &PeerId) {
        self.network.unlink(self.local_id, *peer);
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.connected_peers() {
            self.network.unlink(self.local_id, peer);
        }
        self.network.nodes.write().remove(&self.local_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameType;

    #[tokio::test]
    async fn test_link_and_send() {
        let network = MemoryNetwork::new();
        let a_keys = KeyPair::generate();
        let b_keys = KeyPair::generate();
        let mut a = network.create_transport(&a_keys);
        let mut b = network.create_transport(&b_keys);

        let b_id = b_keys.peer_id();
        assert_eq!(
            a.transport.connect(&PeerAddr::from_peer_id(b_id)).await.unwrap(),
            b_id
        );
        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::PeerConnected { peer_id, .. }) if peer_id == b_id
        ));
        assert!(matches!(
            b.events.recv().await,
            Some(TransportEvent::PeerConnected { .. })
        ));

        let frame = Frame::new(FrameType::Gossip, vec![1, 2, 3]);
        a.transport.send(&b_id, frame.clone()).await.unwrap();
        match b.events.recv().await {
            Some(TransportEvent::FrameReceived { from, frame: got }) => {
                assert_eq!(from, a_keys.peer_id());
                assert_eq!(got, frame);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unlinked_peers_cannot_talk() {
        let network = MemoryNetwork::new();
        let a_keys = KeyPair::generate();
        let b_keys = KeyPair::generate();
        let a = network.create_transport(&a_keys);
        let _b = network.create_transport(&b_keys);

        let result = a
            .transport
            .send(&b_keys.peer_id(), Frame::goodbye())
            .await;
        assert!(matches!(result, Err(TransportError::PeerNotFound(_))));
        assert!(a.transport.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_peer() {
        let network = MemoryNetwork::new();
        let hub_keys = KeyPair::generate();
        let hub = network.create_transport(&hub_keys);
        let spokes: Vec<_> = (0..3)
            .map(|_| {
                let keys = KeyPair::generate();
                let handle = network.create_transport(&keys);
                (keys.peer_id(), handle)
            })
            .collect();

        for (id, _) in &spokes {
            hub.transport.connect(&PeerAddr::from_peer_id(*id)).await.unwrap();
        }

        let sent = hub
            .transport
            .broadcast(Frame::goodbye(), Some(spokes[0].0))
            .await;
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn test_shutdown_unlinks_and_notifies() {
        let network = MemoryNetwork::new();
        let a_keys = KeyPair::generate();
        let b_keys = KeyPair::generate();
        let a = network.create_transport(&a_keys);
        let mut b = network.create_transport(&b_keys);

        a.transport
            .connect(&PeerAddr::from_peer_id(b_keys.peer_id()))
            .await
            .unwrap();
        let _ = b.events.recv().await;

        a.transport.shutdown().await;
        assert!(matches!(
            b.events.recv().await,
            Some(TransportEvent::PeerDisconnected(id)) if id == a_keys.peer_id()
        ));
        assert!(b.transport.connected_peers().is_empty());
        assert_eq!(network.node_count(), 1);
        assert!(matches!(
            a.transport.send(&b_keys.peer_id(), Frame::goodbye()).await,
            Err(TransportError::Shutdown)
        ));
    }
}
