//! Latency probes keyed by nonce

use meshkv_core::types::PeerId;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// How long an unanswered probe stays pending
pub const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingProbe {
    peer: PeerId,
    sent: Instant,
    /// Dropping this ends the probe's timeout task
    _cancel: oneshot::Sender<()>,
}

/// Tracks outstanding latency requests
pub struct LatencyProber {
    pending: Mutex<HashMap<u64, PendingProbe>>,
    timeout: Duration,
}

impl LatencyProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a probe to `peer`.
    ///
    /// Returns the nonce and a receiver that resolves once the probe is
    /// answered, expired or cancelled.
    pub fn register(&self, peer: PeerId) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let mut rng = rand::thread_rng();
        let nonce = loop {
            let candidate: u64 = rng.gen();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            nonce,
            PendingProbe {
                peer,
                sent: Instant::now(),
                _cancel: tx,
            },
        );
        (nonce, rx)
    }

    /// Match a response. Returns the one-way latency (RTT/2) in milliseconds.
    ///
    /// Responses from a peer other than the one probed are ignored.
    pub fn complete(&self, nonce: u64, from: &PeerId) -> Option<u64> {
        let mut pending = self.pending.lock();
        match pending.get(&nonce) {
            Some(probe) if probe.peer == *from => {}
            _ => return None,
        }
        let probe = pending.remove(&nonce)?;
        let rtt = probe.sent.elapsed();
        Some((rtt.as_millis() / 2) as u64)
    }

    /// Drop a probe that ran out of time. Returns the probed peer.
    pub fn expire(&self, nonce: u64) -> Option<PeerId> {
        self.pending.lock().remove(&nonce).map(|probe| probe.peer)
    }

    /// Abandon every pending probe
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId([byte; 32])
    }

    #[test]
    fn test_complete_matches_peer() {
        let prober = LatencyProber::new(LATENCY_PROBE_TIMEOUT);
        let (nonce, _rx) = prober.register(peer(1));

        assert_eq!(prober.complete(nonce, &peer(2)), None);
        assert_eq!(prober.pending_count(), 1);

        assert!(prober.complete(nonce, &peer(1)).is_some());
        assert_eq!(prober.pending_count(), 0);
        assert_eq!(prober.complete(nonce, &peer(1)), None);
    }

    #[test]
    fn test_expired_probe_is_not_counted() {
        let prober = LatencyProber::new(Duration::from_millis(1));
        let (nonce, _rx) = prober.register(peer(3));
        assert_eq!(prober.expire(nonce), Some(peer(3)));
        assert_eq!(prober.complete(nonce, &peer(3)), None);
    }

    #[tokio::test]
    async fn test_cancel_all_releases_waiters() {
        let prober = LatencyProber::new(LATENCY_PROBE_TIMEOUT);
        let (_, rx1) = prober.register(peer(1));
        let (_, rx2) = prober.register(peer(2));

        assert_eq!(prober.cancel_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }
}
