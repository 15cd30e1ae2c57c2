//! Node counters and status snapshots

use crate::registry::PeerRegistry;
use crate::storage::Storage;
use meshkv_core::types::{NodeStatus, PeerId};
use meshkv_net::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic activity counters
#[derive(Debug, Default)]
pub struct NodeCounters {
    pub gossip_messages_received: AtomicU64,
    pub sync_operations: AtomicU64,
    pub latency_requests_sent: AtomicU64,
    pub latency_responses_received: AtomicU64,
    pub writes_accepted: AtomicU64,
}

impl NodeCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Composes a [`NodeStatus`] from the live subsystems.
///
/// Every source is an atomic or a short read lock, so snapshots never wait
/// on in-flight writes.
pub struct StatusAggregator {
    node_id: PeerId,
    started_at: Instant,
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    storage: Arc<Storage>,
    counters: Arc<NodeCounters>,
}

impl StatusAggregator {
    pub fn new(
        node_id: PeerId,
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        storage: Arc<Storage>,
        counters: Arc<NodeCounters>,
    ) -> Self {
        Self {
            node_id,
            started_at: Instant::now(),
            transport,
            registry,
            storage,
            counters,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self, is_running: bool) -> NodeStatus {
        let c = &self.counters;
        NodeStatus {
            is_running,
            node_id: Some(self.node_id.to_hex()),
            connected_peers: self.transport.connected_peers().len(),
            discovered_peers: self.registry.discovered_count(),
            uptime_seconds: self.uptime_seconds(),
            gossip_messages_received: NodeCounters::get(&c.gossip_messages_received),
            storage_size_bytes: self.storage.size_bytes(),
            total_keys: self.storage.total_key_count(),
            sync_operations: NodeCounters::get(&c.sync_operations),
            latency_requests_sent: NodeCounters::get(&c.latency_requests_sent),
            latency_responses_received: NodeCounters::get(&c.latency_responses_received),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_core::crypto::KeyPair;
    use meshkv_net::MemoryNetwork;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_snapshot_reflects_sources() {
        let dir = tempdir().unwrap();
        let keys = KeyPair::generate();
        let network = MemoryNetwork::new();
        let handle = network.create_transport(&keys);
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let registry = Arc::new(PeerRegistry::new(keys.peer_id()));
        let counters = Arc::new(NodeCounters::default());

        let status = StatusAggregator::new(
            keys.peer_id(),
            handle.transport,
            registry,
            Arc::clone(&storage),
            Arc::clone(&counters),
        );

        storage.put_local("prefs", "a", b"1", 1).unwrap();
        NodeCounters::incr(&counters.gossip_messages_received);
        NodeCounters::incr(&counters.gossip_messages_received);
        NodeCounters::incr(&counters.sync_operations);

        let snapshot = status.snapshot(true);
        assert!(snapshot.is_running);
        assert_eq!(snapshot.node_id, Some(keys.peer_id().to_hex()));
        assert_eq!(snapshot.connected_peers, 0);
        assert_eq!(snapshot.total_keys, 1);
        assert_eq!(snapshot.gossip_messages_received, 2);
        assert_eq!(snapshot.sync_operations, 1);
        assert_eq!(snapshot.latency_requests_sent, 0);
    }
}
