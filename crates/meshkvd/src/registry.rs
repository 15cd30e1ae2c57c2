//! Peer registry fed by signed announcements

use meshkv_core::crypto::verify_announce;
use meshkv_core::types::{AnnounceMessage, PeerId, PeerRecord, MIN_TIMESTAMP_TOLERANCE_SECS, PEER_EXPIRY_SECS};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Why an announcement was not ingested
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Bad announcement signature")]
    BadSignature,
    #[error("Announcement from ourselves")]
    SelfAnnounce,
    #[error("Announcement not newer than the last one seen")]
    Replay,
    #[error("Announcement timestamp {0} outside the accepted window")]
    OutOfWindow(i64),
}

/// Outcome of ingesting an announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First announcement from this peer
    New,
    /// Known peer refreshed
    Refreshed,
    /// Dropped
    Ignored(RegistryError),
}

#[derive(Debug, Clone)]
struct Known {
    record: PeerRecord,
    /// Sender timestamp of the newest accepted announcement
    last_sender_ts: i64,
}

/// Registry of discovered peers
pub struct PeerRegistry {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, Known>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Verify and record an announcement received at `now` (unix ms)
    pub fn ingest_announce(&self, announce: &AnnounceMessage, now: i64) -> IngestOutcome {
        let body = &announce.body;
        if body.node_id == self.local_id {
            return IngestOutcome::Ignored(RegistryError::SelfAnnounce);
        }
        if verify_announce(announce).is_err() {
            return IngestOutcome::Ignored(RegistryError::BadSignature);
        }
        let oldest = now.saturating_sub(PEER_EXPIRY_SECS * 1000);
        let newest = now.saturating_add(MIN_TIMESTAMP_TOLERANCE_SECS * 1000);
        if body.timestamp < oldest || body.timestamp > newest {
            return IngestOutcome::Ignored(RegistryError::OutOfWindow(body.timestamp));
        }

        let mut peers = self.peers.write();
        match peers.get_mut(&body.node_id) {
            Some(known) => {
                if body.timestamp <= known.last_sender_ts {
                    return IngestOutcome::Ignored(RegistryError::Replay);
                }
                known.last_sender_ts = body.timestamp;
                let record = &mut known.record;
                record.network_address = body.network_address.clone();
                record.region = body.region.clone();
                record.client_version = body.client_version.clone();
                record.is_mobile = body.is_mobile;
                record.last_announce_at = now;
                IngestOutcome::Refreshed
            }
            None => {
                let record = PeerRecord {
                    node_id: body.node_id,
                    public_key: body.public_key,
                    network_address: body.network_address.clone(),
                    region: body.region.clone(),
                    client_version: body.client_version.clone(),
                    last_announce_at: now,
                    latency_ms: None,
                    is_mobile: body.is_mobile,
                };
                peers.insert(
                    body.node_id,
                    Known {
                        record,
                        last_sender_ts: body.timestamp,
                    },
                );
                info!("Discovered peer {}", body.node_id.short());
                IngestOutcome::New
            }
        }
    }

    /// Remove peers silent for longer than the expiry window
    pub fn sweep_expired(&self, now: i64) -> Vec<PeerId> {
        let cutoff = PEER_EXPIRY_SECS * 1000;
        let mut expired = Vec::new();
        self.peers.write().retain(|id, known| {
            let keep = now - known.record.last_announce_at <= cutoff;
            if !keep {
                expired.push(*id);
            }
            keep
        });
        for id in &expired {
            debug!("Peer {} expired", id.short());
        }
        expired
    }

    /// Record a latency measurement. Returns false for unknown peers.
    pub fn update_latency(&self, peer: &PeerId, latency_ms: u64) -> bool {
        match self.peers.write().get_mut(peer) {
            Some(known) => {
                known.record.latency_ms = Some(latency_ms);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer).map(|k| k.record.clone())
    }

    /// All known peers, most recently heard first
    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .map(|k| k.record.clone())
            .collect();
        records.sort_by(|a, b| b.last_announce_at.cmp(&a.last_announce_at));
        records
    }

    /// Number of discovered, unexpired peers
    pub fn discovered_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let peers = self.peers.read();
        RegistryStats {
            discovered: peers.len(),
            mobile: peers.values().filter(|k| k.record.is_mobile).count(),
            with_latency: peers
                .values()
                .filter(|k| k.record.latency_ms.is_some())
                .count(),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub discovered: usize,
    pub mobile: usize,
    pub with_latency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_core::crypto::{sign_announce, KeyPair};
    use meshkv_core::types::AnnounceBody;

    fn announce(keys: &KeyPair, timestamp: i64) -> AnnounceMessage {
        let body = AnnounceBody {
            node_id: keys.peer_id(),
            public_key: keys.public_key(),
            network_address: Some("10.0.0.1:9100".into()),
            region: Some("eu".into()),
            client_version: Some("test".into()),
            is_mobile: true,
            timestamp,
            known_peers: vec![],
        };
        sign_announce(keys, body).unwrap()
    }

    #[test]
    fn test_ingest_and_refresh() {
        let registry = PeerRegistry::new(KeyPair::generate().peer_id());
        let peer = KeyPair::generate();
        let now = 1_000_000;

        assert_eq!(registry.ingest_announce(&announce(&peer, now), now), IngestOutcome::New);
        assert_eq!(registry.discovered_count(), 1);

        let later = now + 10_000;
        assert_eq!(
            registry.ingest_announce(&announce(&peer, later), later),
            IngestOutcome::Refreshed
        );
        assert_eq!(registry.get(&peer.peer_id()).unwrap().last_announce_at, later);
        assert_eq!(registry.stats().mobile, 1);
    }

    #[test]
    fn test_replay_and_forgery_ignored() {
        let registry = PeerRegistry::new(KeyPair::generate().peer_id());
        let peer = KeyPair::generate();
        let now = 5_000_000;
        let msg = announce(&peer, now);

        registry.ingest_announce(&msg, now);
        assert_eq!(
            registry.ingest_announce(&msg, now + 1),
            IngestOutcome::Ignored(RegistryError::Replay)
        );

        let mut forged = announce(&peer, now + 5);
        forged.body.region = Some("us".into());
        assert_eq!(
            registry.ingest_announce(&forged, now + 5),
            IngestOutcome::Ignored(RegistryError::BadSignature)
        );

        let stale = announce(&KeyPair::generate(), now - PEER_EXPIRY_SECS * 1000 - 1);
        assert!(matches!(
            registry.ingest_announce(&stale, now),
            IngestOutcome::Ignored(RegistryError::OutOfWindow(_))
        ));
    }

    #[test]
    fn test_self_announce_ignored() {
        let me = KeyPair::generate();
        let registry = PeerRegistry::new(me.peer_id());
        assert_eq!(
            registry.ingest_announce(&announce(&me, 10), 10),
            IngestOutcome::Ignored(RegistryError::SelfAnnounce)
        );
        assert_eq!(registry.discovered_count(), 0);
    }

    #[test]
    fn test_expiry_boundary_and_reset() {
        let registry = PeerRegistry::new(KeyPair::generate().peer_id());
        let peer = KeyPair::generate();
        let t0 = 10_000_000;
        registry.ingest_announce(&announce(&peer, t0), t0);

        // Exactly at the window edge the peer survives
        assert!(registry.sweep_expired(t0 + PEER_EXPIRY_SECS * 1000).is_empty());

        // Re-announcing resets its age
        let t1 = t0 + 200_000;
        registry.ingest_announce(&announce(&peer, t1), t1);
        assert!(registry.sweep_expired(t0 + PEER_EXPIRY_SECS * 1000 + 1).is_empty());

        let expired = registry.sweep_expired(t1 + PEER_EXPIRY_SECS * 1000 + 1);
        assert_eq!(expired, vec![peer.peer_id()]);
        assert!(registry.peers().is_empty());
    }

    #[test]
    fn test_latency_update() {
        let registry = PeerRegistry::new(KeyPair::generate().peer_id());
        let peer = KeyPair::generate();
        assert!(!registry.update_latency(&peer.peer_id(), 12));
        registry.ingest_announce(&announce(&peer, 1_000), 1_000);
        assert!(registry.update_latency(&peer.peer_id(), 12));
        assert_eq!(registry.get(&peer.peer_id()).unwrap().latency_ms, Some(12));
    }
}
