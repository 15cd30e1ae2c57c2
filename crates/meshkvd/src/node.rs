//! meshkvd node - owns the subsystems and their background loops

use crate::config::{load_or_create_identity, IdentityError, NodeConfig};
use crate::events::{event_channel, NodeEvent};
use crate::gossip::{validate_incoming_write, Gossip, GossipConfig, GossipContext, WriteSource};
use crate::probe::{LatencyProber, LATENCY_PROBE_TIMEOUT};
use crate::registry::PeerRegistry;
use crate::resilience::{BootstrapBackoff, MAX_DIALS_PER_CYCLE};
use crate::status::{NodeCounters, StatusAggregator};
use crate::storage::{ApplyOutcome, Storage, StorageError};
use crate::sync::{SyncCoordinator, SYNC_REQUEST_TIMEOUT};
use meshkv_core::crypto::{now_millis, KeyPair};
use meshkv_core::types::{NodeInfo, NodeStatus, PeerId, PeerRecord, SignatureScheme, SignedWrite};
use meshkv_net::{QuicTransport, Transport, TransportError, TransportEvent, TransportHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Write rejected: {0}")]
    Rejected(#[from] meshkv_core::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Command queue full")]
    Busy,
    #[error("Node is stopped")]
    Stopped,
}

/// Fire-and-forget network work queued by the control surface
#[derive(Debug, Clone)]
pub enum NodeCommand {
    SendGossip { topic: String, content: Vec<u8> },
    SendLatencyRequest(PeerId),
    RequestSync { since: Option<i64> },
    PublishWrite(SignedWrite),
}

/// A running node
pub struct Node {
    keypair: KeyPair,
    config: NodeConfig,
    storage: Arc<Storage>,
    registry: Arc<PeerRegistry>,
    sync: Arc<SyncCoordinator>,
    prober: Arc<LatencyProber>,
    counters: Arc<NodeCounters>,
    gossip: Arc<Gossip>,
    transport: Arc<dyn Transport>,
    status: StatusAggregator,
    events: broadcast::Sender<NodeEvent>,
    commands: mpsc::Sender<NodeCommand>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Start a node on a QUIC endpoint bound to `config.listen`
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let listen = config.listen;
        Self::start_with_transport(config, event_channel(), move |keypair| {
            QuicTransport::bind(keypair.clone(), listen)
        })
        .await
    }

    /// Start a node on a caller-supplied transport.
    ///
    /// Brings up identity, storage, transport and gossip in that order. On
    /// failure everything built so far is released.
    pub async fn start_with_transport<F>(
        config: NodeConfig,
        events: broadcast::Sender<NodeEvent>,
        make_transport: F,
    ) -> Result<Arc<Self>, NodeError>
    where
        F: FnOnce(&KeyPair) -> Result<TransportHandle, TransportError>,
    {
        let keypair = {
            let data_dir = config.data_dir.clone();
            let secret = config.secret_key.clone();
            tokio::task::spawn_blocking(move || {
                load_or_create_identity(&data_dir, secret.as_deref())
            })
            .await??
        };
        let node_id = keypair.peer_id();

        let storage = {
            let data_dir = config.data_dir.clone();
            Arc::new(tokio::task::spawn_blocking(move || Storage::open(data_dir)).await??)
        };

        let TransportHandle {
            transport,
            events: transport_events,
        } = make_transport(&keypair)?;

        let counters = Arc::new(NodeCounters::default());
        let registry = Arc::new(PeerRegistry::new(node_id));
        let sync = Arc::new(SyncCoordinator::new(
            node_id,
            Arc::clone(&storage),
            Arc::clone(&counters),
            config.sync_interval,
        ));
        let prober = Arc::new(LatencyProber::new(LATENCY_PROBE_TIMEOUT));
        let gossip = Arc::new(Gossip::new(
            GossipConfig {
                ttl: config.gossip_ttl,
                max_peers: config.max_peers,
                region: config.region.clone(),
                advertise: config.advertise.clone(),
                is_mobile: config.is_mobile,
                client_version: config.client_version.clone(),
            },
            GossipContext {
                keypair: keypair.clone(),
                transport: Arc::clone(&transport),
                storage: Arc::clone(&storage),
                registry: Arc::clone(&registry),
                sync: Arc::clone(&sync),
                prober: Arc::clone(&prober),
                counters: Arc::clone(&counters),
                events: events.clone(),
            },
        ));
        let status = StatusAggregator::new(
            node_id,
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&counters),
        );

        let (commands, command_rx) = mpsc::channel(config.command_queue.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            keypair,
            config,
            storage,
            registry,
            sync,
            prober,
            counters,
            gossip,
            transport,
            status,
            events,
            commands,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let tasks = vec![
            node.spawn_dispatch_task(transport_events),
            node.spawn_command_task(command_rx),
            node.spawn_announce_task(),
            node.spawn_sweep_task(),
            node.spawn_sync_task(),
            node.spawn_initial_sync_task(),
            node.spawn_bootstrap_task(),
        ];
        node.tasks.lock().extend(tasks);

        info!(
            "Node {} started (listening on {})",
            node_id.short(),
            node.transport
                .local_addr()
                .map_or_else(|| "memory".to_string(), |addr| addr.to_string())
        );
        node.emit(NodeEvent::Started {
            node_id,
            public_key: node.keypair.public_key_hex(),
        });
        Ok(node)
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    fn spawn_dispatch_task(
        self: &Arc<Self>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let gossip = Arc::clone(&self.gossip);
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = transport_events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            TransportEvent::PeerConnected { peer_id, addr } => {
                                info!("Peer {} connected ({:?})", peer_id.short(), addr);
                                let _ = events.send(NodeEvent::PeerConnected { peer_id });
                                gossip.on_peer_connected(peer_id).await;
                            }
                            TransportEvent::PeerDisconnected(peer_id) => {
                                info!("Peer {} disconnected", peer_id.short());
                                gossip.on_peer_disconnected(peer_id);
                                let _ = events.send(NodeEvent::PeerDisconnected { peer_id });
                            }
                            TransportEvent::FrameReceived { from, frame } => {
                                gossip.handle_frame(from, frame).await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_command_task(
        self: &Arc<Self>,
        mut command_rx: mpsc::Receiver<NodeCommand>,
    ) -> JoinHandle<()> {
        let gossip = Arc::clone(&self.gossip);
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        let result = match command {
                            NodeCommand::SendGossip { topic, content } => {
                                gossip.publish_custom(&topic, content).await.map(|sent| {
                                    debug!("Gossip on {} sent to {} peers", topic, sent);
                                })
                            }
                            NodeCommand::SendLatencyRequest(peer) => {
                                gossip.send_latency_request(peer).await
                            }
                            NodeCommand::RequestSync { since } => {
                                let sent = gossip.request_sync(since).await;
                                debug!("Sync requested from {} peers", sent);
                                Ok(())
                            }
                            NodeCommand::PublishWrite(write) => {
                                gossip.publish_write(&write).await.map(|_| ())
                            }
                        };
                        if let Err(e) = result {
                            warn!("Command failed: {}", e);
                            let _ = events.send(NodeEvent::Error { message: e.to_string() });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_announce_task(self: &Arc<Self>) -> JoinHandle<()> {
        let gossip = Arc::clone(&self.gossip);
        let period = self.config.announce_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = gossip.announce(None).await {
                            warn!("Announce failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_sweep_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let sync = Arc::clone(&self.sync);
        let events = self.events.clone();
        let period = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for peer_id in registry.sweep_expired(now_millis()) {
                            info!("Peer {} expired", peer_id.short());
                            let _ = events.send(NodeEvent::PeerExpired { peer_id });
                        }
                        for peer in sync.expire_pending(SYNC_REQUEST_TIMEOUT) {
                            debug!("Sync request to {} timed out", peer.short());
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_sync_task(self: &Arc<Self>) -> JoinHandle<()> {
        let gossip = Arc::clone(&self.gossip);
        let sync = Arc::clone(&self.sync);
        let period = self.config.sync_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if period.is_zero() {
                let _ = shutdown_rx.recv().await;
                return;
            }
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let peers = sync.peers_needing_sync();
                        if !peers.is_empty() {
                            debug!("Anti-entropy with {} peers", peers.len());
                            gossip.anti_entropy(peers).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_initial_sync_task(self: &Arc<Self>) -> JoinHandle<()> {
        let gossip = Arc::clone(&self.gossip);
        let delay = self.config.initial_sync_delay;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let sent = gossip.request_sync(None).await;
                    debug!("Initial sync requested from {} peers", sent);
                }
                _ = shutdown_rx.recv() => {}
            }
        })
    }

    fn spawn_bootstrap_task(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let peers = self.config.bootstrap_addrs();
        let backoff = BootstrapBackoff::new(MAX_DIALS_PER_CYCLE, self.config.dial_jitter);
        let period = self.config.bootstrap_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if peers.is_empty() {
                let _ = shutdown_rx.recv().await;
                return;
            }
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let connected = backoff.dial_round(&transport, &peers).await;
                        if connected > 0 {
                            debug!("Bootstrap round opened {} sessions", connected);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    pub fn node_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Queue network work without waiting for it
    pub fn enqueue(&self, command: NodeCommand) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::Stopped);
        }
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NodeError::Busy,
            mpsc::error::TrySendError::Closed(_) => NodeError::Stopped,
        })
    }

    /// Verify, persist and broadcast a client-submitted signed write
    ///
    /// Content-only writes are stored but not broadcast, since peers cannot
    /// verify their timestamp.
    pub async fn submit_write(&self, write: SignedWrite) -> Result<ApplyOutcome, NodeError> {
        if !self.is_running() {
            return Err(NodeError::Stopped);
        }
        if let Err(e) = validate_incoming_write(&write, now_millis(), WriteSource::Client) {
            warn!("Rejected local write {}/{}: {}", write.db_name, write.key, e);
            self.emit(NodeEvent::WriteRejected {
                db_name: write.db_name.clone(),
                key: write.key.clone(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        let storage = Arc::clone(&self.storage);
        let to_apply = write.clone();
        let outcome = tokio::task::spawn_blocking(move || storage.apply_write(&to_apply)).await??;
        if outcome.is_applied() {
            NodeCounters::incr(&self.counters.writes_accepted);
            self.emit(NodeEvent::WriteAccepted {
                db_name: write.db_name.clone(),
                key: write.key.clone(),
                timestamp: write.timestamp,
                from: None,
            });
            if write.scheme == SignatureScheme::Timestamped {
                let (db_name, key) = (write.db_name.clone(), write.key.clone());
                if let Err(e) = self.enqueue(NodeCommand::PublishWrite(write)) {
                    warn!("Stored {}/{} but could not queue broadcast: {}", db_name, key, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Persist an unsigned entry that never leaves this node
    pub async fn put_local(
        &self,
        db_name: String,
        key: String,
        value: Vec<u8>,
    ) -> Result<ApplyOutcome, NodeError> {
        if !self.is_running() {
            return Err(NodeError::Stopped);
        }
        let storage = Arc::clone(&self.storage);
        let timestamp = now_millis();
        Ok(tokio::task::spawn_blocking(move || {
            storage.put_local(&db_name, &key, &value, timestamp)
        })
        .await??)
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id().to_hex(),
            public_key: self.keypair.public_key_hex(),
            listen_address: self.gossip.advertised_address(),
            region: self.config.region.clone(),
            client_version: self.config.client_version.clone(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status.snapshot(self.is_running())
    }

    /// Discovered peers, most recently heard first
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.peers()
    }

    /// Stop the node. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping node {}", self.node_id().short());

        let storage = Arc::clone(&self.storage);
        match tokio::task::spawn_blocking(move || storage.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Storage flush failed: {}", e),
            Err(e) => error!("Storage flush task failed: {}", e),
        }

        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        let dials = self.gossip.shutdown().await;
        if dials > 0 {
            debug!("Abandoned {} peer-exchange dials", dials);
        }

        let probes = self.prober.cancel_all();
        let syncs = self.sync.cancel_all();
        if probes + syncs > 0 {
            debug!("Cancelled {} probes and {} sync requests", probes, syncs);
        }

        self.transport.shutdown().await;
        self.emit(NodeEvent::Stopped);
        info!("Node stopped");
    }
}
