//! Timestamp-windowed delta synchronization

use crate::gossip::{validate_incoming_write, WriteSource};
use crate::status::NodeCounters;
use crate::storage::{ApplyOutcome, Storage, StorageError, SyncCursor};
use meshkv_core::crypto::now_millis;
use meshkv_core::types::{
    PeerId, SignedWrite, MAX_MESSAGE_LENGTH, MAX_TIMESTAMP_TOLERANCE_SECS,
    MAX_WRITES_PER_SYNC_RESPONSE,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Byte budget for the writes in one response, leaving room for framing
pub const SYNC_RESPONSE_BYTE_BUDGET: usize = MAX_MESSAGE_LENGTH - 64 * 1024;

/// Pending requests older than this are dropped as failed
pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Incremental requests re-cover this much history below the watermark,
/// since gossip still accepts writes up to this old
const WATERMARK_OVERLAP_MS: i64 = MAX_TIMESTAMP_TOLERANCE_SECS * 1000;

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unsolicited sync response {request_id} from {from}")]
    Unsolicited { request_id: u64, from: PeerId },
}

/// Ask a peer for signed writes newer than `since`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: u64,
    pub requester: PeerId,
    /// Exclusive lower bound (unix ms); `None` asks for everything
    pub since: Option<i64>,
    /// Resume strictly after this position
    pub after: Option<SyncCursor>,
    pub limit: u32,
}

/// One page of writes answering a [`SyncRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub request_id: u64,
    pub requester: PeerId,
    pub writes: Vec<SignedWrite>,
    pub has_more: bool,
    pub next: Option<SyncCursor>,
}

/// Result of merging a response
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub merged: usize,
    pub rejected: usize,
    /// Valid writes the store could not persist
    pub failed: usize,
    /// Writes that were persisted
    pub accepted: Vec<SignedWrite>,
    /// Request for the next page, when the peer has more
    pub follow_up: Option<SyncRequest>,
}

/// Anti-entropy sync state for a peer
#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    /// Newest timestamp received from this peer
    pub high_watermark: Option<i64>,
    /// Last completed exchange
    pub last_sync: Option<Instant>,
    /// Number of completed responses
    pub sync_count: u64,
    /// Consecutive failures
    pub failures: u32,
}

#[derive(Debug)]
struct PendingSync {
    peer: PeerId,
    since: Option<i64>,
    sent: Instant,
}

/// Synchronization coordinator
pub struct SyncCoordinator {
    local_id: PeerId,
    storage: Arc<Storage>,
    counters: Arc<NodeCounters>,
    /// Outstanding requests by id
    pending: Mutex<HashMap<u64, PendingSync>>,
    /// Peer sync states
    peers: RwLock<HashMap<PeerId, PeerSyncState>>,
    /// Anti-entropy interval
    interval: Duration,
}

impl SyncCoordinator {
    pub fn new(
        local_id: PeerId,
        storage: Arc<Storage>,
        counters: Arc<NodeCounters>,
        interval: Duration,
    ) -> Self {
        Self {
            local_id,
            storage,
            counters,
            pending: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Register a peer for synchronization
    pub fn register_peer(&self, peer_id: PeerId) {
        self.peers.write().entry(peer_id).or_default();
    }

    /// Remove a peer from synchronization
    pub fn unregister_peer(&self, peer_id: &PeerId) {
        self.peers.write().remove(peer_id);
        self.pending.lock().retain(|_, p| p.peer != *peer_id);
    }

    /// Create and track a request to `peer`
    pub fn create_request(
        &self,
        peer: PeerId,
        since: Option<i64>,
        after: Option<SyncCursor>,
    ) -> SyncRequest {
        let mut pending = self.pending.lock();
        let mut rng = rand::thread_rng();
        let request_id = loop {
            let candidate: u64 = rng.gen();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            request_id,
            PendingSync {
                peer,
                since,
                sent: Instant::now(),
            },
        );
        SyncRequest {
            request_id,
            requester: self.local_id,
            since,
            after,
            limit: MAX_WRITES_PER_SYNC_RESPONSE as u32,
        }
    }

    /// Incremental anti-entropy request based on what the peer already sent
    pub fn create_incremental_request(&self, peer: PeerId) -> SyncRequest {
        let since = self
            .peers
            .read()
            .get(&peer)
            .and_then(|state| state.high_watermark)
            .map(|mark| mark.saturating_sub(WATERMARK_OVERLAP_MS));
        self.create_request(peer, since, None)
    }

    /// Answer a peer's request with one page of signed writes
    pub fn handle_request(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let limit = (request.limit as usize).clamp(1, MAX_WRITES_PER_SYNC_RESPONSE);
        let page = self.storage.writes_since(
            request.since,
            request.after.as_ref(),
            limit,
            SYNC_RESPONSE_BYTE_BUDGET,
        )?;
        debug!(
            "Serving {} writes to {} (more: {})",
            page.writes.len(),
            request.requester.short(),
            page.has_more
        );
        Ok(SyncResponse {
            request_id: request.request_id,
            requester: request.requester,
            writes: page.writes,
            has_more: page.has_more,
            next: page.next,
        })
    }

    /// Verify and merge a response from `from`
    pub fn handle_response(
        &self,
        from: PeerId,
        response: SyncResponse,
    ) -> Result<MergeOutcome, SyncError> {
        self.merge_response(from, response, |write| self.storage.apply_write(write))
    }

    fn merge_response<F>(
        &self,
        from: PeerId,
        response: SyncResponse,
        mut apply: F,
    ) -> Result<MergeOutcome, SyncError>
    where
        F: FnMut(&SignedWrite) -> Result<ApplyOutcome, StorageError>,
    {
        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&response.request_id) {
                Some(p) if p.peer == from => pending.remove(&response.request_id),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return Err(SyncError::Unsolicited {
                request_id: response.request_id,
                from,
            });
        };

        let now = now_millis();
        let mut outcome = MergeOutcome::default();
        let mut newest: Option<i64> = None;
        let mut oldest_failure: Option<i64> = None;
        for write in response.writes {
            if let Err(e) = validate_incoming_write(&write, now, WriteSource::Sync) {
                warn!(
                    "Rejected synced write {}/{} from {}: {}",
                    write.db_name,
                    write.key,
                    from.short(),
                    e
                );
                outcome.rejected += 1;
                continue;
            }
            match apply(&write) {
                Ok(applied) => {
                    newest = newest.max(Some(write.timestamp));
                    if applied.is_applied() {
                        outcome.merged += 1;
                        NodeCounters::incr(&self.counters.writes_accepted);
                        outcome.accepted.push(write);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to persist synced write {}/{} from {}: {}",
                        write.db_name,
                        write.key,
                        from.short(),
                        e
                    );
                    outcome.failed += 1;
                    let ts = write.timestamp;
                    oldest_failure = Some(oldest_failure.map_or(ts, |t| t.min(ts)));
                }
            }
        }
        // Keep failed writes inside the next incremental window
        if let Some(failed_at) = oldest_failure {
            newest = newest.map(|mark| mark.min(failed_at - 1));
        }

        if outcome.merged > 0 {
            NodeCounters::incr(&self.counters.sync_operations);
        }

        {
            let mut peers = self.peers.write();
            let state = peers.entry(from).or_default();
            state.high_watermark = state.high_watermark.max(newest);
            state.last_sync = Some(Instant::now());
            state.sync_count += 1;
            state.failures = 0;
        }

        if response.has_more {
            if let Some(next) = response.next {
                outcome.follow_up = Some(self.create_request(from, pending.since, Some(next)));
            }
        }
        Ok(outcome)
    }

    /// Drop requests that were never answered. Returns the affected peers.
    pub fn expire_pending(&self, timeout: Duration) -> Vec<PeerId> {
        let mut expired = Vec::new();
        self.pending.lock().retain(|_, p| {
            let keep = p.sent.elapsed() < timeout;
            if !keep {
                expired.push(p.peer);
            }
            keep
        });
        if !expired.is_empty() {
            let mut peers = self.peers.write();
            for peer in &expired {
                if let Some(state) = peers.get_mut(peer) {
                    state.failures += 1;
                }
            }
        }
        expired
    }

    /// Peers due for periodic anti-entropy
    pub fn peers_needing_sync(&self) -> Vec<PeerId> {
        let pending: Vec<PeerId> = self.pending.lock().values().map(|p| p.peer).collect();
        self.peers
            .read()
            .iter()
            .filter(|(id, _)| !pending.contains(id))
            .filter(|(_, state)| {
                state
                    .last_sync
                    .map_or(true, |last| last.elapsed() >= self.interval)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerSyncState> {
        self.peers.read().get(peer).cloned()
    }

    /// Abandon every in-flight request
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Get sync statistics
    pub fn stats(&self) -> SyncStats {
        let peers = self.peers.read();
        SyncStats {
            peer_count: peers.len(),
            total_syncs: peers.values().map(|s| s.sync_count).sum(),
            pending_requests: self.pending.lock().len(),
        }
    }
}

/// Sync statistics
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub peer_count: usize,
    pub total_syncs: u64,
    pub pending_requests: usize,
}
