//! Bootstrap reconnection with per-peer exponential backoff

use meshkv_net::{PeerAddr, Transport};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// First retry delay after a failed dial
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Retry delay ceiling
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Dial attempts allowed per bootstrap cycle
pub const MAX_DIALS_PER_CYCLE: u32 = 8;
/// Length of one bootstrap cycle
pub const BOOTSTRAP_CYCLE: Duration = Duration::from_secs(30);
/// Upper bound of the random delay before each dial
pub const MAX_DIAL_JITTER: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    failures: u32,
    next_allowed: Instant,
}

/// Delay before the next attempt after `failures` consecutive failures
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    BACKOFF_BASE
        .checked_mul(factor)
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX)
}

/// Tracks failed bootstrap dials and the per-cycle dial budget
pub struct BootstrapBackoff {
    peers: Mutex<HashMap<PeerAddr, BackoffState>>,
    attempts: AtomicU32,
    max_per_cycle: u32,
    max_jitter: Duration,
}

impl Default for BootstrapBackoff {
    fn default() -> Self {
        Self::new(MAX_DIALS_PER_CYCLE, MAX_DIAL_JITTER)
    }
}

impl BootstrapBackoff {
    pub fn new(max_per_cycle: u32, max_jitter: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            attempts: AtomicU32::new(0),
            max_per_cycle,
            max_jitter,
        }
    }

    /// Whether `peer` is out of its backoff window
    pub fn is_ready(&self, peer: &PeerAddr, now: Instant) -> bool {
        self.peers
            .lock()
            .get(peer)
            .map_or(true, |state| now >= state.next_allowed)
    }

    /// Take one dial from the cycle budget
    pub fn try_acquire_attempt(&self) -> bool {
        self.attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_per_cycle).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn reset_cycle(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    pub fn record_success(&self, peer: &PeerAddr) {
        self.peers.lock().remove(peer);
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&self, peer: &PeerAddr, now: Instant) -> Duration {
        let mut peers = self.peers.lock();
        let failures = peers
            .get(peer)
            .map_or(1, |state| state.failures.saturating_add(1));
        let delay = backoff_delay(failures);
        peers.insert(
            *peer,
            BackoffState {
                failures,
                next_allowed: now + delay,
            },
        );
        delay
    }

    pub fn failures(&self, peer: &PeerAddr) -> u32 {
        self.peers.lock().get(peer).map_or(0, |state| state.failures)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run one bootstrap cycle. Returns how many new sessions were opened.
    pub async fn dial_round(&self, transport: &Arc<dyn Transport>, peers: &[PeerAddr]) -> usize {
        self.reset_cycle();
        let mut connected = 0;

        for addr in peers {
            if let Some(id) = addr.peer_id {
                if transport.is_connected(&id) {
                    self.record_success(addr);
                    continue;
                }
            }
            if !self.is_ready(addr, Instant::now()) {
                continue;
            }
            if !self.try_acquire_attempt() {
                debug!("Bootstrap dial budget exhausted for this cycle");
                break;
            }

            tokio::time::sleep(self.jitter()).await;
            match transport.connect(addr).await {
                Ok(peer) => {
                    info!("Connected to bootstrap peer {}", peer.short());
                    self.record_success(addr);
                    connected += 1;
                }
                Err(e) => {
                    let delay = self.record_failure(addr, Instant::now());
                    debug!(
                        "Bootstrap dial to {} failed: {} (retry in {:?})",
                        addr, e, delay
                    );
                }
            }
        }
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_core::crypto::KeyPair;
    use meshkv_core::types::PeerId;
    use meshkv_net::MemoryNetwork;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(9), BACKOFF_MAX);
        assert_eq!(backoff_delay(40), BACKOFF_MAX);
    }

    #[test]
    fn test_failure_window_and_reset() {
        let backoff = BootstrapBackoff::default();
        let addr = PeerAddr::from_peer_id(PeerId([1; 32]));
        let now = Instant::now();

        assert!(backoff.is_ready(&addr, now));
        backoff.record_failure(&addr, now);
        backoff.record_failure(&addr, now);
        assert_eq!(backoff.failures(&addr), 2);
        assert!(!backoff.is_ready(&addr, now + Duration::from_secs(3)));
        assert!(backoff.is_ready(&addr, now + Duration::from_secs(4)));

        backoff.record_success(&addr);
        assert_eq!(backoff.failures(&addr), 0);
        assert!(backoff.is_ready(&addr, now));
    }

    #[test]
    fn test_cycle_budget() {
        let backoff = BootstrapBackoff::new(2, Duration::ZERO);
        assert!(backoff.try_acquire_attempt());
        assert!(backoff.try_acquire_attempt());
        assert!(!backoff.try_acquire_attempt());
        backoff.reset_cycle();
        assert!(backoff.try_acquire_attempt());
    }

    #[tokio::test]
    async fn test_dial_round() {
        let network = MemoryNetwork::new();
        let local = KeyPair::generate();
        let remote = KeyPair::generate();
        let handle = network.create_transport(&local);
        let _remote = network.create_transport(&remote);

        let reachable = PeerAddr::from_peer_id(remote.peer_id());
        let missing = PeerAddr::from_peer_id(PeerId([9; 32]));
        let backoff = BootstrapBackoff::new(MAX_DIALS_PER_CYCLE, Duration::ZERO);

        let opened = backoff
            .dial_round(&handle.transport, &[reachable, missing])
            .await;
        assert_eq!(opened, 1);
        assert!(handle.transport.is_connected(&remote.peer_id()));
        assert_eq!(backoff.failures(&missing), 1);

        // Already connected and backed-off peers are skipped
        let opened = backoff
            .dial_round(&handle.transport, &[reachable, missing])
            .await;
        assert_eq!(opened, 0);
        assert_eq!(backoff.failures(&missing), 1);
    }
}
