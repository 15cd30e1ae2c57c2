//! Control surface for embedding applications
//!
//! [`ControlSurface`] is the handle a client holds for the lifetime of the
//! app. It owns at most one running [`Node`]. Every call returns a typed
//! [`ApiError`] on failure.
//!
//! Storage calls run on the blocking pool. Network calls are queued on the
//! node and return immediately; their outcomes arrive as [`NodeEvent`]s.

use crate::config::NodeConfig;
use crate::events::{event_channel, NodeEvent};
use crate::gossip::validate_custom_topic;
use crate::node::{Node, NodeCommand, NodeError};
use crate::storage::{ApplyOutcome, Storage, StorageError};
use meshkv_core::crypto::{self, KeyPair};
use meshkv_core::types::{
    Entry, KeyPairHex, NodeInfo, NodeStatus, PeerId, PeerRecord, SignatureScheme, SignedWrite,
    MAX_MESSAGE_LENGTH,
};
use meshkv_net::{PeerAddr, QuicTransport, TransportError, TransportHandle};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

/// Tagged failure of a control-surface call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum ApiError {
    #[error("node is not running")]
    NotRunning,
    #[error("node is already running")]
    AlreadyRunning,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    #[error("command queue is full")]
    Busy,
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Rejected(e) => ApiError::Rejected(e.to_string()),
            NodeError::Storage(e) => e.into(),
            NodeError::Transport(e) => ApiError::Transport(e.to_string()),
            NodeError::Identity(e) => ApiError::Lifecycle(e.to_string()),
            NodeError::Task(e) => ApiError::Lifecycle(e.to_string()),
            NodeError::Busy => ApiError::Busy,
            NodeError::Stopped => ApiError::NotRunning,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidNamespace(name) => {
                ApiError::InvalidInput(format!("invalid database name {:?}", name))
            }
            other => ApiError::Storage(other.to_string()),
        }
    }
}

impl From<meshkv_core::Error> for ApiError {
    fn from(e: meshkv_core::Error) -> Self {
        ApiError::InvalidInput(e.to_string())
    }
}

/// Owned handle to the node lifecycle
pub struct ControlSurface {
    node: RwLock<Option<Arc<Node>>>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for ControlSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSurface {
    pub fn new() -> Self {
        Self {
            node: RwLock::new(None),
            lifecycle: Mutex::new(()),
            events: event_channel(),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a node with wallet-supplied identity and settings
    pub async fn start(
        &self,
        data_dir: impl Into<PathBuf>,
        wallet_secret_key: Option<String>,
        bootstrap_peers: Vec<String>,
        region: Option<String>,
    ) -> Result<NodeInfo, ApiError> {
        if let Some(secret) = &wallet_secret_key {
            KeyPair::from_secret_hex(secret)?;
        }
        for peer in &bootstrap_peers {
            peer.parse::<PeerAddr>()
                .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        }
        let config = NodeConfig {
            secret_key: wallet_secret_key,
            bootstrap: bootstrap_peers,
            region,
            ..NodeConfig::with_data_dir(data_dir)
        };
        self.start_with_config(config).await
    }

    /// Start a QUIC node from a full config
    pub async fn start_with_config(&self, config: NodeConfig) -> Result<NodeInfo, ApiError> {
        let listen = config.listen;
        self.start_with_transport(config, move |keypair| {
            QuicTransport::bind(keypair.clone(), listen)
        })
        .await
    }

    /// Start a node on a caller-supplied transport
    pub async fn start_with_transport<F>(
        &self,
        config: NodeConfig,
        make_transport: F,
    ) -> Result<NodeInfo, ApiError>
    where
        F: FnOnce(&KeyPair) -> Result<TransportHandle, TransportError>,
    {
        let _lifecycle = self.lifecycle.lock().await;
        if self.node.read().is_some() {
            return Err(ApiError::AlreadyRunning);
        }
        let node = Node::start_with_transport(config, self.events.clone(), make_transport)
            .await
            .map_err(|e| match e {
                NodeError::Transport(e) => ApiError::Transport(e.to_string()),
                other => ApiError::Lifecycle(other.to_string()),
            })?;
        let info = node.info();
        *self.node.write() = Some(node);
        Ok(info)
    }

    /// Stop the running node, if any
    pub async fn stop(&self) -> Result<(), ApiError> {
        let _lifecycle = self.lifecycle.lock().await;
        let node = self.node.write().take();
        if let Some(node) = node {
            node.stop().await;
            info!("Control surface released node {}", node.node_id().short());
        }
        Ok(())
    }

    pub fn is_node_running(&self) -> bool {
        self.node.read().as_ref().is_some_and(|node| node.is_running())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn node(&self) -> Result<Arc<Node>, ApiError> {
        self.node
            .read()
            .as_ref()
            .filter(|node| node.is_running())
            .cloned()
            .ok_or(ApiError::NotRunning)
    }

    async fn with_storage<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Storage) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = Arc::clone(self.node()?.storage());
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| ApiError::Storage(e.to_string()))?
            .map_err(ApiError::from)
    }

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------

    /// Store a client-signed write; the node supplies the timestamp
    pub async fn store_data(
        &self,
        db_name: &str,
        key: &str,
        value: &[u8],
        public_key: &str,
        signature: &str,
    ) -> Result<ApplyOutcome, ApiError> {
        let write = client_write(
            db_name,
            key,
            value,
            public_key,
            signature,
            crypto::now_millis(),
            SignatureScheme::ContentOnly,
        )?;
        Ok(self.node()?.submit_write(write).await?)
    }

    /// Store a client-signed write carrying its own timestamp
    pub async fn store_data_at(
        &self,
        db_name: &str,
        key: &str,
        value: &[u8],
        public_key: &str,
        signature: &str,
        timestamp: i64,
    ) -> Result<ApplyOutcome, ApiError> {
        let write = client_write(
            db_name,
            key,
            value,
            public_key,
            signature,
            timestamp,
            SignatureScheme::Timestamped,
        )?;
        Ok(self.node()?.submit_write(write).await?)
    }

    /// Store an unsigned entry that is never replicated
    pub async fn store_data_local(
        &self,
        db_name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<ApplyOutcome, ApiError> {
        if db_name.is_empty() || key.is_empty() {
            return Err(ApiError::InvalidInput("empty database name or key".into()));
        }
        Ok(self
            .node()?
            .put_local(db_name.to_string(), key.to_string(), value.to_vec())
            .await?)
    }

    pub async fn get_data(&self, db_name: &str, key: &str) -> Result<Option<Entry>, ApiError> {
        let (db, k) = (db_name.to_string(), key.to_string());
        self.with_storage(move |s| Ok(s.get_entry(&db, &k)?.map(|e| e.to_entry(&db, &k))))
            .await
    }

    pub async fn get_all_entries(&self, db_name: &str) -> Result<Vec<Entry>, ApiError> {
        let db = db_name.to_string();
        self.with_storage(move |s| s.scan_all(Some(&db))).await
    }

    /// Every entry in every namespace, ordered by namespace then key
    pub async fn get_all_data(&self) -> Result<Vec<Entry>, ApiError> {
        self.with_storage(|s| s.scan_all(None)).await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, ApiError> {
        self.with_storage(|s| Ok(s.list_databases())).await
    }

    pub async fn list_keys(&self, db_name: &str) -> Result<Vec<String>, ApiError> {
        let db = db_name.to_string();
        self.with_storage(move |s| s.list_keys(&db)).await
    }

    /// Delete a key locally. Returns whether it existed.
    pub async fn delete_data(&self, db_name: &str, key: &str) -> Result<bool, ApiError> {
        let (db, k) = (db_name.to_string(), key.to_string());
        self.with_storage(move |s| s.delete(&db, &k)).await
    }

    // -------------------------------------------------------------------------
    // Network (fire-and-forget)
    // -------------------------------------------------------------------------

    pub fn send_gossip(&self, topic: &str, message: &[u8]) -> Result<(), ApiError> {
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(ApiError::InvalidInput(format!(
                "message is {} bytes (max {})",
                message.len(),
                MAX_MESSAGE_LENGTH
            )));
        }
        validate_custom_topic(topic).map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        self.node()?.enqueue(NodeCommand::SendGossip {
            topic: topic.to_string(),
            content: message.to_vec(),
        })?;
        Ok(())
    }

    pub fn send_latency_request(&self, peer_id: &str) -> Result<(), ApiError> {
        let peer: PeerId = peer_id.parse()?;
        self.node()?.enqueue(NodeCommand::SendLatencyRequest(peer))?;
        Ok(())
    }

    /// Ask connected peers for writes newer than `since` (unix ms)
    pub fn request_sync(&self, since: Option<i64>) -> Result<(), ApiError> {
        self.node()?.enqueue(NodeCommand::RequestSync { since })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn get_node_info(&self) -> Result<NodeInfo, ApiError> {
        Ok(self.node()?.info())
    }

    /// Live status, or an all-zero snapshot when no node is running
    pub fn get_node_status(&self) -> NodeStatus {
        match self.node() {
            Ok(node) => node.status(),
            Err(_) => NodeStatus::default(),
        }
    }

    pub fn get_peers(&self) -> Result<Vec<PeerRecord>, ApiError> {
        Ok(self.node()?.peers())
    }

    // -------------------------------------------------------------------------
    // Utilities
    // -------------------------------------------------------------------------

    pub fn generate_keypair() -> KeyPairHex {
        crypto::generate_keypair()
    }

    pub fn generate_peer_id_from_secret_key(secret_key: &str) -> Result<String, ApiError> {
        Ok(crypto::derive_peer_id(secret_key)?.to_hex())
    }

    /// Hex signature of `message`
    pub fn sign_message_with_key(secret_key: &str, message: &[u8]) -> Result<String, ApiError> {
        Ok(hex::encode(crypto::sign(secret_key, message)?))
    }

    pub fn verify_message_signature(public_key: &str, message: &[u8], signature: &str) -> bool {
        crypto::verify_hex(public_key, message, signature)
    }

    pub fn generate_db_name(name: &str, public_key: &str) -> Result<String, ApiError> {
        Ok(crypto::generate_db_name(name, public_key)?)
    }

    pub fn verify_db_name(db_name: &str, public_key: &str) -> bool {
        crypto::verify_db_name(db_name, public_key)
    }

    pub fn extract_name_from_db(db_name: &str) -> Option<String> {
        crypto::extract_owner_name(db_name).map(str::to_string)
    }

    /// Check `timestamp` against the acceptance window around now
    pub fn validate_timestamp(timestamp: i64) -> Result<(), ApiError> {
        crypto::validate_timestamp(timestamp, crypto::now_millis())
            .map_err(|e| ApiError::Rejected(e.to_string()))
    }

    /// Hex signature for a write.
    ///
    /// With a timestamp the signature suits [`store_data_at`](Self::store_data_at);
    /// without one it suits [`store_data`](Self::store_data).
    pub fn sign_write(
        secret_key: &str,
        db_name: &str,
        key: &str,
        value: &[u8],
        timestamp: Option<i64>,
    ) -> Result<String, ApiError> {
        let keypair = KeyPair::from_secret_hex(secret_key)?;
        let write = match timestamp {
            Some(ts) => crypto::sign_write(&keypair, db_name, key, value, ts)?,
            None => crypto::sign_write_content(&keypair, db_name, key, value, 0)?,
        };
        Ok(hex::encode(write.signature))
    }
}

fn client_write(
    db_name: &str,
    key: &str,
    value: &[u8],
    public_key: &str,
    signature: &str,
    timestamp: i64,
    scheme: SignatureScheme,
) -> Result<SignedWrite, ApiError> {
    crypto::validate_db_name(db_name)?;
    if key.is_empty() {
        return Err(ApiError::InvalidInput("empty key".into()));
    }
    Ok(SignedWrite {
        db_name: db_name.to_string(),
        key: key.to_string(),
        value: value.to_vec(),
        public_key: crypto::decode_public_key(public_key)?,
        signature: crypto::decode_signature(signature)?,
        timestamp,
        scheme,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_net::MemoryNetwork;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            initial_sync_delay: Duration::from_millis(50),
            dial_jitter: Duration::ZERO,
            ..NodeConfig::with_data_dir(dir)
        }
    }

    #[tokio::test]
    async fn test_calls_before_start() {
        let control = ControlSurface::new();
        assert!(!control.is_node_running());
        assert_eq!(control.get_node_info(), Err(ApiError::NotRunning));
        assert_eq!(control.get_data("db", "k").await, Err(ApiError::NotRunning));
        assert_eq!(control.request_sync(None), Err(ApiError::NotRunning));
        assert_eq!(control.get_node_status(), NodeStatus::default());
        // Stop without start is a no-op
        assert_eq!(control.stop().await, Ok(()));
    }

    #[tokio::test]
    async fn test_lifecycle_and_storage() {
        let dir = tempdir().unwrap();
        let network = MemoryNetwork::new();
        let control = ControlSurface::new();

        let info = control
            .start_with_transport(memory_config(dir.path()), |kp| Ok(network.create_transport(kp)))
            .await
            .unwrap();
        assert!(control.is_node_running());
        assert_eq!(
            control
                .start_with_transport(memory_config(dir.path()), |kp| {
                    Ok(network.create_transport(kp))
                })
                .await,
            Err(ApiError::AlreadyRunning)
        );

        let keys = ControlSurface::generate_keypair();
        let db = ControlSurface::generate_db_name("notes", &keys.public_key).unwrap();
        let sig = ControlSurface::sign_write(&keys.secret_key, &db, "todo", b"buy milk", None).unwrap();
        assert!(control
            .store_data(&db, "todo", b"buy milk", &keys.public_key, &sig)
            .await
            .unwrap()
            .is_applied());

        control.store_data_local("prefs", "theme", b"dark").await.unwrap();

        let entry = control.get_data(&db, "todo").await.unwrap().unwrap();
        assert_eq!(entry.value, "buy milk");
        assert!(entry.signed);
        assert_eq!(control.list_databases().await.unwrap(), vec![db.clone(), "prefs".into()]);
        assert_eq!(control.get_all_data().await.unwrap().len(), 2);
        assert_eq!(control.get_node_status().total_keys, 2);

        assert!(control.delete_data("prefs", "theme").await.unwrap());
        assert!(!control.delete_data("prefs", "theme").await.unwrap());

        // Identity persists across restart
        control.stop().await.unwrap();
        assert!(!control.is_node_running());
        let again = control
            .start_with_transport(memory_config(dir.path()), |kp| Ok(network.create_transport(kp)))
            .await
            .unwrap();
        assert_eq!(again.node_id, info.node_id);
        assert_eq!(control.get_data(&db, "todo").await.unwrap().unwrap().value, "buy milk");
        control.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_input_validation() {
        let dir = tempdir().unwrap();
        let network = MemoryNetwork::new();
        let control = ControlSurface::new();
        control
            .start_with_transport(memory_config(dir.path()), |kp| Ok(network.create_transport(kp)))
            .await
            .unwrap();

        let oversized = vec![0u8; MAX_MESSAGE_LENGTH + 1];
        assert!(matches!(
            control.send_gossip("chat", &oversized),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(matches!(
            control.send_gossip("meshkv/data", b"hi"),
            Err(ApiError::InvalidInput(_))
        ));
        assert!(control.send_gossip("chat", b"hi").is_ok());
        assert!(matches!(
            control.send_latency_request("not-hex"),
            Err(ApiError::InvalidInput(_))
        ));

        let keys = ControlSurface::generate_keypair();
        let db = ControlSurface::generate_db_name("notes", &keys.public_key).unwrap();
        assert!(matches!(
            control.store_data(&db, "k", b"v", &keys.public_key, "zz").await,
            Err(ApiError::InvalidInput(_))
        ));

        let other = ControlSurface::generate_keypair();
        let sig = ControlSurface::sign_write(&other.secret_key, &db, "k", b"v", None).unwrap();
        assert!(matches!(
            control.store_data(&db, "k", b"v", &other.public_key, &sig).await,
            Err(ApiError::Rejected(_))
        ));
        assert_eq!(control.get_data(&db, "k").await.unwrap(), None);

        let stale = crypto::now_millis() - 2 * 3600 * 1000;
        let sig = ControlSurface::sign_write(&keys.secret_key, &db, "k", b"v", Some(stale)).unwrap();
        assert!(matches!(
            control.store_data_at(&db, "k", b"v", &keys.public_key, &sig, stale).await,
            Err(ApiError::Rejected(_))
        ));
        control.stop().await.unwrap();
    }

    #[test]
    fn test_utilities() {
        let keys = ControlSurface::generate_keypair();
        let peer = ControlSurface::generate_peer_id_from_secret_key(&keys.secret_key).unwrap();
        assert_eq!(peer.len(), 64);

        let sig = ControlSurface::sign_message_with_key(&keys.secret_key, b"hello").unwrap();
        assert!(ControlSurface::verify_message_signature(&keys.public_key, b"hello", &sig));
        assert!(!ControlSurface::verify_message_signature(&keys.public_key, b"hellO", &sig));

        let db = ControlSurface::generate_db_name("my-notes", &keys.public_key).unwrap();
        assert!(ControlSurface::verify_db_name(&db, &keys.public_key));
        assert_eq!(ControlSurface::extract_name_from_db(&db).as_deref(), Some("my-notes"));

        assert!(ControlSurface::validate_timestamp(crypto::now_millis()).is_ok());
        assert!(ControlSurface::validate_timestamp(0).is_err());

        let err = serde_json::to_value(ApiError::InvalidInput("bad".into())).unwrap();
        assert_eq!(err["kind"], "InvalidInput");
    }
}
