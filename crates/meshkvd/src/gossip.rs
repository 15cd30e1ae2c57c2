//! Topic-based epidemic gossip over the transport
//!
//! Every message travels in a [`GossipEnvelope`] carried by a `Gossip` frame.
//! Unseen envelopes are delivered locally and relayed to every other
//! connected peer until their hop budget runs out. Targeted envelopes
//! (latency probes, sync traffic) go straight to the target when it is
//! directly connected and are flooded otherwise, which lets peers without a
//! direct session still reach each other through neighbours.

use crate::events::NodeEvent;
use crate::probe::LatencyProber;
use crate::registry::{IngestOutcome, PeerRegistry};
use crate::status::NodeCounters;
use crate::storage::{ApplyOutcome, Storage};
use crate::sync::{SyncCoordinator, SyncRequest, SyncResponse};
use meshkv_core::crypto::{
    now_millis, sign_announce, validate_timestamp, verify_write_owner, verify_write_signature,
    KeyPair,
};
use meshkv_core::types::{
    AnnounceBody, AnnounceMessage, Bytes32, PeerId, SignatureScheme, SignedWrite,
    MAX_MESSAGE_LENGTH, MIN_TIMESTAMP_TOLERANCE_SECS,
};
use meshkv_core::Error as CoreError;
use meshkv_net::{Frame, FrameError, FrameType, PeerAddr, Transport};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Membership announcements
pub const TOPIC_DISCOVERY: &str = "meshkv/discovery";
/// Signed write propagation
pub const TOPIC_DATA: &str = "meshkv/data";
/// Delta sync requests and responses
pub const TOPIC_SYNC: &str = "meshkv/sync";
/// Latency probes
pub const TOPIC_LATENCY: &str = "meshkv/latency";
/// Prefix reserved for built-in topics
pub const RESERVED_TOPIC_PREFIX: &str = "meshkv/";
/// Longest accepted custom topic name
pub const MAX_TOPIC_LEN: usize = 256;

/// Default hop budget for new envelopes
pub const DEFAULT_GOSSIP_TTL: u8 = 6;
/// How long envelope ids are remembered
pub const SEEN_CACHE_TTL: Duration = Duration::from_secs(600);
/// Upper bound on remembered envelope ids
pub const SEEN_CACHE_CAPACITY: usize = 16_384;
/// Peer addresses carried in one announcement
pub const MAX_ANNOUNCED_PEERS: usize = 16;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Payload carried inside an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Announce(AnnounceMessage),
    Write(SignedWrite),
    Custom {
        content: Vec<u8>,
        timestamp: i64,
    },
    LatencyRequest {
        nonce: u64,
        sent_at: i64,
    },
    LatencyResponse {
        nonce: u64,
        sent_at: i64,
        responded_at: i64,
        region: Option<String>,
    },
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

impl GossipMessage {
    /// Topic a built-in message must travel on; `None` for custom messages
    pub fn builtin_topic(&self) -> Option<&'static str> {
        match self {
            GossipMessage::Announce(_) => Some(TOPIC_DISCOVERY),
            GossipMessage::Write(_) => Some(TOPIC_DATA),
            GossipMessage::Custom { .. } => None,
            GossipMessage::LatencyRequest { .. } | GossipMessage::LatencyResponse { .. } => {
                Some(TOPIC_LATENCY)
            }
            GossipMessage::SyncRequest(_) | GossipMessage::SyncResponse(_) => Some(TOPIC_SYNC),
        }
    }
}

/// Routed gossip message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    /// BLAKE3(origin || nonce || payload)
    pub id: Bytes32,
    pub origin: PeerId,
    /// Single recipient, or `None` for everyone
    pub target: Option<PeerId>,
    pub topic: String,
    /// Remaining hops
    pub ttl: u8,
    pub nonce: u64,
    /// postcard-encoded [`GossipMessage`]
    pub payload: Vec<u8>,
}

impl GossipEnvelope {
    pub fn new(
        origin: PeerId,
        target: Option<PeerId>,
        topic: impl Into<String>,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        let nonce: u64 = rand::thread_rng().gen();
        Self {
            id: Self::compute_id(&origin, nonce, &payload),
            origin,
            target,
            topic: topic.into(),
            ttl,
            nonce,
            payload,
        }
    }

    pub fn compute_id(origin: &PeerId, nonce: u64, payload: &[u8]) -> Bytes32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(origin.as_bytes());
        hasher.update(&nonce.to_be_bytes());
        hasher.update(payload);
        *hasher.finalize().as_bytes()
    }

    pub fn verify_id(&self) -> bool {
        Self::compute_id(&self.origin, self.nonce, &self.payload) == self.id
    }

    pub fn decode_message(&self) -> Result<GossipMessage, postcard::Error> {
        postcard::from_bytes(&self.payload)
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::encode(FrameType::Gossip, self)
    }
}

// =============================================================================
// WRITE ACCEPTANCE
// =============================================================================

/// Where an incoming write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// Submitted through the control surface; content-only signatures allowed
    Client,
    /// Live propagation: full timestamp window applies
    Gossip,
    /// Anti-entropy: old writes are expected, only future skew is bounded
    Sync,
}

/// Size, timestamp, signature and ownership checks for a peer's write
pub fn validate_incoming_write(
    write: &SignedWrite,
    now: i64,
    source: WriteSource,
) -> Result<(), CoreError> {
    let size = write.encoded_len();
    if size > MAX_MESSAGE_LENGTH {
        return Err(CoreError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_LENGTH,
        });
    }
    if source != WriteSource::Client && write.scheme != SignatureScheme::Timestamped {
        return Err(CoreError::UnsignedTimestamp);
    }
    match source {
        WriteSource::Client | WriteSource::Gossip => validate_timestamp(write.timestamp, now)?,
        WriteSource::Sync => {
            if write.timestamp > now.saturating_add(MIN_TIMESTAMP_TOLERANCE_SECS * 1000) {
                return Err(CoreError::TimestampTooFarInFuture {
                    timestamp: write.timestamp,
                    now,
                });
            }
        }
    }
    verify_write_signature(write)?;
    verify_write_owner(write)?;
    Ok(())
}

/// Check a user-supplied topic name
pub fn validate_custom_topic(topic: &str) -> Result<(), GossipError> {
    if topic.is_empty()
        || topic.len() > MAX_TOPIC_LEN
        || topic.starts_with(RESERVED_TOPIC_PREFIX)
        || topic.chars().any(char::is_control)
    {
        return Err(GossipError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

// =============================================================================
// SEEN CACHE
// =============================================================================

#[derive(Default)]
struct SeenInner {
    entries: HashMap<Bytes32, Instant>,
    order: VecDeque<(Bytes32, Instant)>,
}

/// Bounded, expiring set of envelope ids
pub struct SeenCache {
    inner: Mutex<SeenInner>,
    ttl: Duration,
    capacity: usize,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            ttl,
            capacity,
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&self, id: Bytes32) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        while let Some((old_id, at)) = inner.order.front().copied() {
            if now.duration_since(at) < self.ttl && inner.order.len() < self.capacity {
                break;
            }
            inner.order.pop_front();
            if inner.entries.get(&old_id) == Some(&at) {
                inner.entries.remove(&old_id);
            }
        }

        if inner.entries.contains_key(&id) {
            return false;
        }
        inner.entries.insert(id, now);
        inner.order.push_back((id, now));
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Local announcement and routing settings
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub ttl: u8,
    /// Stop dialling exchanged peers at this many sessions
    pub max_peers: usize,
    pub region: Option<String>,
    /// Address other peers should dial; defaults to the bound address
    pub advertise: Option<String>,
    pub is_mobile: bool,
    pub client_version: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_GOSSIP_TTL,
            max_peers: 32,
            region: None,
            advertise: None,
            is_mobile: false,
            client_version: concat!("meshkv/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Shared subsystems the engine drives
pub struct GossipContext {
    pub keypair: KeyPair,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<Storage>,
    pub registry: Arc<PeerRegistry>,
    pub sync: Arc<SyncCoordinator>,
    pub prober: Arc<LatencyProber>,
    pub counters: Arc<NodeCounters>,
    pub events: broadcast::Sender<NodeEvent>,
}

/// Gossip engine
pub struct Gossip {
    keypair: KeyPair,
    local_id: PeerId,
    config: GossipConfig,
    transport: Arc<dyn Transport>,
    storage: Arc<Storage>,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncCoordinator>,
    prober: Arc<LatencyProber>,
    counters: Arc<NodeCounters>,
    events: broadcast::Sender<NodeEvent>,
    seen: SeenCache,
    /// Custom topics delivered locally; `None` delivers all
    subscriptions: RwLock<Option<HashSet<String>>>,
    /// Peer-exchange dials in flight
    dialing: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Gossip {
    pub fn new(config: GossipConfig, ctx: GossipContext) -> Self {
        Self {
            local_id: ctx.keypair.peer_id(),
            keypair: ctx.keypair,
            config,
            transport: ctx.transport,
            storage: ctx.storage,
            registry: ctx.registry,
            sync: ctx.sync,
            prober: ctx.prober,
            counters: ctx.counters,
            events: ctx.events,
            seen: SeenCache::new(SEEN_CACHE_TTL, SEEN_CACHE_CAPACITY),
            subscriptions: RwLock::new(None),
            dialing: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Restrict local delivery of custom topics to explicit subscriptions
    pub fn subscribe(&self, topic: &str) -> Result<(), GossipError> {
        validate_custom_topic(topic)?;
        self.subscriptions
            .write()
            .get_or_insert_with(HashSet::new)
            .insert(topic.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) {
        if let Some(topics) = self.subscriptions.write().as_mut() {
            topics.remove(topic);
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        match &*self.subscriptions.read() {
            Some(topics) => topics.contains(topic),
            None => true,
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Wrap and send a message. Returns how many peers it was handed to.
    pub async fn publish(
        &self,
        topic: &str,
        target: Option<PeerId>,
        message: &GossipMessage,
    ) -> Result<usize, GossipError> {
        let payload = postcard::to_allocvec(message)?;
        let envelope = GossipEnvelope::new(self.local_id, target, topic, self.config.ttl, payload);
        self.seen.insert(envelope.id);
        let frame = envelope.to_frame()?;
        Ok(self.route(frame, target, None).await)
    }

    /// Send directly to `target` when connected, otherwise flood
    async fn route(&self, frame: Frame, target: Option<PeerId>, except: Option<PeerId>) -> usize {
        if let Some(target) = target {
            if self.transport.is_connected(&target) {
                match self.transport.send(&target, frame.clone()).await {
                    Ok(()) => return 1,
                    Err(e) => debug!("Direct send to {} failed: {}", target.short(), e),
                }
            }
        }
        self.transport.broadcast(frame, except).await
    }

    /// Broadcast a signed write on the data topic
    pub async fn publish_write(&self, write: &SignedWrite) -> Result<usize, GossipError> {
        self.publish(TOPIC_DATA, None, &GossipMessage::Write(write.clone()))
            .await
    }

    /// Broadcast an application message on a custom topic
    pub async fn publish_custom(&self, topic: &str, content: Vec<u8>) -> Result<usize, GossipError> {
        validate_custom_topic(topic)?;
        if content.len() > MAX_MESSAGE_LENGTH {
            return Err(GossipError::MessageTooLarge {
                size: content.len(),
                max: MAX_MESSAGE_LENGTH,
            });
        }
        let message = GossipMessage::Custom {
            content,
            timestamp: now_millis(),
        };
        self.publish(topic, None, &message).await
    }

    /// Address other peers should dial to reach us
    pub fn advertised_address(&self) -> Option<String> {
        self.config
            .advertise
            .clone()
            .or_else(|| self.transport.local_addr().map(|addr| addr.to_string()))
    }

    fn announce_body(&self) -> AnnounceBody {
        let known_peers = self
            .registry
            .peers()
            .into_iter()
            .filter_map(|peer| {
                peer.network_address
                    .map(|addr| format!("{}@{}", peer.node_id, addr))
            })
            .take(MAX_ANNOUNCED_PEERS)
            .collect();
        AnnounceBody {
            node_id: self.local_id,
            public_key: self.keypair.public_key(),
            network_address: self.advertised_address(),
            region: self.config.region.clone(),
            client_version: Some(self.config.client_version.clone()),
            is_mobile: self.config.is_mobile,
            timestamp: now_millis(),
            known_peers,
        }
    }

    /// Announce ourselves to everyone, or to a single new peer
    pub async fn announce(&self, target: Option<PeerId>) -> Result<usize, GossipError> {
        let announce = sign_announce(&self.keypair, self.announce_body())?;
        self.publish(TOPIC_DISCOVERY, target, &GossipMessage::Announce(announce))
            .await
    }

    /// Send a latency probe to `peer`; the outcome arrives as an event
    pub async fn send_latency_request(self: &Arc<Self>, peer: PeerId) -> Result<(), GossipError> {
        let (nonce, cancelled) = self.prober.register(peer);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(this.prober.timeout()) => {
                    if let Some(peer) = this.prober.expire(nonce) {
                        debug!("Latency probe to {} timed out", peer.short());
                        this.emit(NodeEvent::LatencyTimeout { peer_id: peer });
                    }
                }
                _ = cancelled => {}
            }
        });

        let message = GossipMessage::LatencyRequest {
            nonce,
            sent_at: now_millis(),
        };
        match self.publish(TOPIC_LATENCY, Some(peer), &message).await {
            Ok(0) => {
                debug!("No route for latency probe to {}", peer.short());
                if self.prober.expire(nonce).is_some() {
                    self.emit(NodeEvent::LatencyTimeout { peer_id: peer });
                }
                Ok(())
            }
            Ok(_) => {
                NodeCounters::incr(&self.counters.latency_requests_sent);
                Ok(())
            }
            Err(e) => {
                self.prober.expire(nonce);
                Err(e)
            }
        }
    }

    /// Ask every connected peer for writes newer than `since`
    pub async fn request_sync(&self, since: Option<i64>) -> usize {
        let peers = self.transport.connected_peers();
        let mut sent = 0;
        for peer in peers {
            let request = self.sync.create_request(peer, since, None);
            if self.send_sync_request(peer, request).await {
                sent += 1;
            }
        }
        sent
    }

    /// Incremental anti-entropy round with the given peers
    pub async fn anti_entropy(&self, peers: Vec<PeerId>) -> usize {
        let mut sent = 0;
        for peer in peers {
            let request = self.sync.create_incremental_request(peer);
            if self.send_sync_request(peer, request).await {
                sent += 1;
            }
        }
        sent
    }

    async fn send_sync_request(&self, peer: PeerId, request: SyncRequest) -> bool {
        debug!(
            "Requesting sync from {} (since {:?})",
            peer.short(),
            request.since
        );
        match self
            .publish(TOPIC_SYNC, Some(peer), &GossipMessage::SyncRequest(request))
            .await
        {
            Ok(n) if n > 0 => true,
            Ok(_) => false,
            Err(e) => {
                warn!("Failed to send sync request to {}: {}", peer.short(), e);
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Session changes
    // -------------------------------------------------------------------------

    /// Greet a new session with our announcement and an incremental sync
    pub async fn on_peer_connected(&self, peer: PeerId) {
        self.sync.register_peer(peer);
        if let Err(e) = self.announce(Some(peer)).await {
            warn!("Failed to announce to {}: {}", peer.short(), e);
        }
        let request = self.sync.create_incremental_request(peer);
        self.send_sync_request(peer, request).await;
    }

    pub fn on_peer_disconnected(&self, peer: PeerId) {
        self.sync.unregister_peer(&peer);
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Process a frame received from a directly connected peer
    pub async fn handle_frame(self: &Arc<Self>, from: PeerId, frame: Frame) {
        let envelope: GossipEnvelope = match frame.decode(FrameType::Gossip) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping undecodable frame from {}: {}", from.short(), e);
                return;
            }
        };
        if !envelope.verify_id() {
            debug!("Dropping envelope with bad id from {}", from.short());
            return;
        }
        if envelope.origin == self.local_id || !self.seen.insert(envelope.id) {
            return;
        }
        NodeCounters::incr(&self.counters.gossip_messages_received);

        let for_us = envelope.target.map_or(true, |target| target == self.local_id);
        let relay = if for_us {
            self.deliver(from, &envelope).await
        } else {
            true
        };
        if relay && envelope.target != Some(self.local_id) {
            self.relay(from, envelope).await;
        }
    }

    async fn relay(&self, from: PeerId, mut envelope: GossipEnvelope) {
        if envelope.ttl <= 1 {
            return;
        }
        envelope.ttl -= 1;
        let target = envelope.target;
        match envelope.to_frame() {
            Ok(frame) => {
                let sent = self.route(frame, target, Some(from)).await;
                debug!(
                    "Relayed {} envelope from {} to {} peers",
                    envelope.topic,
                    envelope.origin.short(),
                    sent
                );
            }
            Err(e) => debug!("Cannot re-encode envelope: {}", e),
        }
    }

    /// Handle a message addressed to us. Returns whether it may be relayed.
    ///
    /// `from` is the session the envelope arrived on.
    async fn deliver(self: &Arc<Self>, from: PeerId, envelope: &GossipEnvelope) -> bool {
        let message = match envelope.decode_message() {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    "Dropping undecodable {} payload from {}: {}",
                    envelope.topic,
                    envelope.origin.short(),
                    e
                );
                return false;
            }
        };
        let topic_ok = match message.builtin_topic() {
            Some(expected) => envelope.topic == expected,
            None => validate_custom_topic(&envelope.topic).is_ok(),
        };
        if !topic_ok {
            debug!("Dropping message on mismatched topic {}", envelope.topic);
            return false;
        }

        let origin = envelope.origin;
        match message {
            GossipMessage::Announce(announce) => self.handle_announce(announce),
            GossipMessage::Write(write) => self.handle_write(origin, write).await,
            GossipMessage::Custom { content, .. } => {
                if self.is_subscribed(&envelope.topic) {
                    self.emit(NodeEvent::GossipReceived {
                        topic: envelope.topic.clone(),
                        from: origin,
                        content: String::from_utf8_lossy(&content).into_owned(),
                    });
                }
                true
            }
            GossipMessage::LatencyRequest { nonce, sent_at } => {
                let reply = GossipMessage::LatencyResponse {
                    nonce,
                    sent_at,
                    responded_at: now_millis(),
                    region: self.config.region.clone(),
                };
                if let Err(e) = self.publish(TOPIC_LATENCY, Some(origin), &reply).await {
                    debug!("Failed to answer latency probe: {}", e);
                }
                true
            }
            GossipMessage::LatencyResponse { nonce, .. } => {
                match self.prober.complete(nonce, &origin) {
                    Some(latency_ms) => {
                        self.registry.update_latency(&origin, latency_ms);
                        NodeCounters::incr(&self.counters.latency_responses_received);
                        self.emit(NodeEvent::LatencyMeasured {
                            peer_id: origin,
                            latency_ms,
                        });
                    }
                    None => debug!("Unmatched latency response from {}", origin.short()),
                }
                true
            }
            GossipMessage::SyncRequest(request) => {
                self.handle_sync_request(from, origin, request).await;
                true
            }
            GossipMessage::SyncResponse(response) => {
                if from == origin {
                    self.handle_sync_response(from, response).await;
                } else {
                    debug!("Dropping relayed sync response from {}", origin.short());
                }
                true
            }
        }
    }

    fn handle_announce(self: &Arc<Self>, announce: AnnounceMessage) -> bool {
        let peer_id = announce.body.node_id;
        match self.registry.ingest_announce(&announce, now_millis()) {
            IngestOutcome::New => {
                self.emit(NodeEvent::PeerDiscovered {
                    peer_id,
                    address: announce.body.network_address.clone(),
                });
                self.exchange_peers(&announce.body);
                true
            }
            IngestOutcome::Refreshed => {
                self.exchange_peers(&announce.body);
                true
            }
            IngestOutcome::Ignored(reason) => {
                debug!("Ignoring announcement from {}: {}", peer_id.short(), reason);
                false
            }
        }
    }

    /// Dial peers learned from an announcement, up to the session limit
    fn exchange_peers(self: &Arc<Self>, body: &AnnounceBody) {
        let own = body
            .network_address
            .as_ref()
            .map(|addr| format!("{}@{}", body.node_id, addr));
        let candidates = own.iter().chain(body.known_peers.iter());

        for candidate in candidates {
            let Ok(addr) = candidate.parse::<PeerAddr>() else {
                continue;
            };
            let (Some(peer), Some(_)) = (addr.peer_id, addr.socket_addr) else {
                continue;
            };
            if peer == self.local_id || self.transport.is_connected(&peer) {
                continue;
            }
            let connected = self.transport.connected_peers().len();
            let mut dialing = self.dialing.lock();
            if self.stopped.load(Ordering::Acquire)
                || connected + dialing.len() >= self.config.max_peers
            {
                break;
            }
            if dialing.contains_key(&peer) {
                continue;
            }

            // Inserted before the lock drops, so the task's own removal runs after
            let this = Arc::clone(self);
            let task = tokio::spawn(async move {
                match this.transport.connect(&addr).await {
                    Ok(_) => info!("Connected to exchanged peer {}", peer.short()),
                    Err(e) => debug!("Dial to exchanged peer {} failed: {}", addr, e),
                }
                this.dialing.lock().remove(&peer);
            });
            dialing.insert(peer, task);
        }
    }

    async fn handle_write(&self, origin: PeerId, write: SignedWrite) -> bool {
        if let Err(e) = validate_incoming_write(&write, now_millis(), WriteSource::Gossip) {
            warn!(
                "Rejected write {}/{} from {}: {}",
                write.db_name,
                write.key,
                origin.short(),
                e
            );
            self.emit(NodeEvent::WriteRejected {
                db_name: write.db_name,
                key: write.key,
                reason: e.to_string(),
            });
            return false;
        }

        let storage = Arc::clone(&self.storage);
        let to_apply = write.clone();
        match tokio::task::spawn_blocking(move || storage.apply_write(&to_apply)).await {
            Ok(Ok(ApplyOutcome::Applied)) => {
                NodeCounters::incr(&self.counters.writes_accepted);
                debug!("Accepted write {}/{} from {}", write.db_name, write.key, origin.short());
                self.emit(NodeEvent::WriteAccepted {
                    db_name: write.db_name,
                    key: write.key,
                    timestamp: write.timestamp,
                    from: Some(origin),
                });
            }
            Ok(Ok(outcome)) => {
                debug!("Write {}/{} not applied: {:?}", write.db_name, write.key, outcome);
            }
            Ok(Err(e)) => {
                error!("Failed to persist write {}/{}: {}", write.db_name, write.key, e);
                self.emit(NodeEvent::Error {
                    message: format!("storage: {}", e),
                });
            }
            Err(e) => error!("Storage task failed: {}", e),
        }
        true
    }

    /// Serve a sync request received directly from its requester
    async fn handle_sync_request(&self, from: PeerId, origin: PeerId, request: SyncRequest) {
        if request.requester != from || origin != from {
            debug!(
                "Ignoring sync request for {} arriving via {}",
                request.requester.short(),
                from.short()
            );
            return;
        }
        let sync = Arc::clone(&self.sync);
        let served = tokio::task::spawn_blocking(move || sync.handle_request(&request)).await;
        let response = match served {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Failed to serve sync request from {}: {}", from.short(), e);
                return;
            }
            Err(e) => {
                error!("Sync task failed: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .publish(TOPIC_SYNC, Some(from), &GossipMessage::SyncResponse(response))
            .await
        {
            warn!("Failed to send sync response to {}: {}", from.short(), e);
        }
    }

    async fn handle_sync_response(&self, origin: PeerId, response: SyncResponse) {
        let sync = Arc::clone(&self.sync);
        let merged =
            tokio::task::spawn_blocking(move || sync.handle_response(origin, response)).await;
        let outcome = match merged {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                debug!("Discarding sync response from {}: {}", origin.short(), e);
                return;
            }
            Err(e) => {
                error!("Sync task failed: {}", e);
                return;
            }
        };

        for write in &outcome.accepted {
            self.emit(NodeEvent::WriteAccepted {
                db_name: write.db_name.clone(),
                key: write.key.clone(),
                timestamp: write.timestamp,
                from: Some(origin),
            });
        }
        if outcome.merged > 0 || outcome.rejected > 0 || outcome.failed > 0 {
            info!(
                "Sync with {}: merged {}, rejected {}, failed {}",
                origin.short(),
                outcome.merged,
                outcome.rejected,
                outcome.failed
            );
        }
        self.emit(NodeEvent::SyncCompleted {
            peer_id: origin,
            merged: outcome.merged,
            has_more: outcome.follow_up.is_some(),
        });
        if let Some(follow_up) = outcome.follow_up {
            self.send_sync_request(origin, follow_up).await;
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn dials_in_flight(&self) -> usize {
        self.dialing.lock().len()
    }

    /// Stop dialling exchanged peers and wait for in-flight dials to end
    pub async fn shutdown(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let tasks: Vec<JoinHandle<()>> =
            self.dialing.lock().drain().map(|(_, task)| task).collect();
        let count = tasks.len();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        count
    }
}
