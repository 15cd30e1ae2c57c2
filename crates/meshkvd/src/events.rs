//! Node events delivered to subscribers

use meshkv_core::types::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the node event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something the node did or observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    Started { node_id: PeerId, public_key: String },
    Stopped,
    PeerConnected { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId },
    PeerDiscovered { peer_id: PeerId, address: Option<String> },
    PeerExpired { peer_id: PeerId },
    /// Custom-topic gossip delivered locally
    GossipReceived { topic: String, from: PeerId, content: String },
    /// A write was persisted; `from` is `None` for local submissions
    WriteAccepted {
        db_name: String,
        key: String,
        timestamp: i64,
        from: Option<PeerId>,
    },
    WriteRejected { db_name: String, key: String, reason: String },
    SyncCompleted { peer_id: PeerId, merged: usize, has_more: bool },
    LatencyMeasured { peer_id: PeerId, latency_ms: u64 },
    LatencyTimeout { peer_id: PeerId },
    Error { message: String },
}

/// Sender side of a fresh event channel
pub fn event_channel() -> broadcast::Sender<NodeEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
