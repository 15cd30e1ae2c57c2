//! Configuration for meshkvd

use anyhow::Context;
use clap::Parser;
use meshkv_core::crypto::KeyPair;
use meshkv_core::types::ANNOUNCE_INTERVAL_SECS;
use meshkv_net::PeerAddr;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gossip::DEFAULT_GOSSIP_TTL;

/// File under the data directory holding the node identity
pub const NODE_STATE_FILE: &str = "node_state.json";
/// Delay before the first full sync after start
pub const INITIAL_SYNC_DELAY: Duration = Duration::from_secs(5);
/// Default session limit for peer exchange
pub const DEFAULT_MAX_PEERS: usize = 32;

/// meshkvd - replicated key-value storage node
#[derive(Parser, Debug, Clone)]
#[command(name = "meshkvd")]
#[command(about = "Peer-to-peer replicated key-value storage node")]
pub struct Config {
    /// UDP listen address for QUIC sessions
    #[arg(short, long, default_value = "0.0.0.0:9400")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/meshkvd")]
    pub data_dir: PathBuf,

    /// Hex Ed25519 secret key (generated and persisted when absent)
    #[arg(long, env = "MESHKV_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Bootstrap peers (comma-separated node_id@ip:port)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Region label included in announcements
    #[arg(long)]
    pub region: Option<String>,

    /// Address peers should dial, if different from the listen address
    #[arg(long)]
    pub advertise: Option<SocketAddr>,

    /// Mark this node as a mobile client
    #[arg(long)]
    pub mobile: bool,

    /// Announce interval in seconds
    #[arg(long, default_value_t = ANNOUNCE_INTERVAL_SECS)]
    pub announce_interval_secs: u64,

    /// Peer expiry sweep interval in seconds
    #[arg(long, default_value = "30")]
    pub sweep_interval_secs: u64,

    /// Anti-entropy sync interval in seconds (0 disables)
    #[arg(long, default_value = "60")]
    pub sync_interval_secs: u64,

    /// Stop dialling exchanged peers at this many sessions
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    pub max_peers: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.announce_interval_secs == 0 {
            anyhow::bail!("Announce interval must be at least 1 second");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("Sweep interval must be at least 1 second");
        }
        if self.max_peers == 0 {
            anyhow::bail!("max-peers must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?} (expected json or pretty)", self.log_format);
        }
        if let Some(secret) = &self.secret_key {
            KeyPair::from_secret_hex(secret).context("Invalid secret key")?;
        }
        for peer in &self.bootstrap {
            peer.parse::<PeerAddr>()
                .with_context(|| format!("Invalid bootstrap peer {:?}", peer))?;
        }
        Ok(())
    }

    pub fn into_node_config(self) -> NodeConfig {
        NodeConfig {
            data_dir: self.data_dir,
            listen: self.listen,
            secret_key: self.secret_key,
            bootstrap: self.bootstrap,
            region: self.region,
            advertise: self.advertise.map(|addr| addr.to_string()),
            is_mobile: self.mobile,
            announce_interval: Duration::from_secs(self.announce_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            max_peers: self.max_peers,
            ..NodeConfig::default()
        }
    }
}

/// Library-level node settings
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    /// Wallet-supplied identity; persisted identity is used when absent
    pub secret_key: Option<String>,
    pub bootstrap: Vec<String>,
    pub region: Option<String>,
    pub advertise: Option<String>,
    pub is_mobile: bool,
    pub announce_interval: Duration,
    pub sweep_interval: Duration,
    /// Zero disables periodic anti-entropy
    pub sync_interval: Duration,
    pub initial_sync_delay: Duration,
    pub bootstrap_interval: Duration,
    /// Upper bound of the random delay before each bootstrap dial
    pub dial_jitter: Duration,
    pub max_peers: usize,
    pub gossip_ttl: u8,
    /// Capacity of the control command queue
    pub command_queue: usize,
    pub client_version: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/meshkvd"),
            listen: SocketAddr::from(([0, 0, 0, 0], 9400)),
            secret_key: None,
            bootstrap: Vec::new(),
            region: None,
            advertise: None,
            is_mobile: false,
            announce_interval: Duration::from_secs(ANNOUNCE_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(60),
            initial_sync_delay: INITIAL_SYNC_DELAY,
            bootstrap_interval: crate::resilience::BOOTSTRAP_CYCLE,
            dial_jitter: crate::resilience::MAX_DIAL_JITTER,
            max_peers: DEFAULT_MAX_PEERS,
            gossip_ttl: DEFAULT_GOSSIP_TTL,
            command_queue: 256,
            client_version: concat!("meshkv/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl NodeConfig {
    /// Config rooted at `data_dir` with everything else defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse the bootstrap list, skipping and logging malformed entries
    pub fn bootstrap_addrs(&self) -> Vec<PeerAddr> {
        self.bootstrap
            .iter()
            .filter_map(|peer| match peer.parse::<PeerAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!("Ignoring bootstrap peer {:?}: {}", peer, e);
                    None
                }
            })
            .collect()
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Hex Ed25519 seed of the node identity
    pub keypair_seed: String,
}

impl NodeState {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(NODE_STATE_FILE)
    }

    pub fn load(data_dir: &Path) -> std::io::Result<Option<Self>> {
        let path = Self::path(data_dir);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the state file, readable by the owner only on unix
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let path = Self::path(data_dir);

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        #[cfg(not(unix))]
        std::fs::write(&path, &json)?;

        Ok(())
    }
}

/// Resolve the node identity.
///
/// A supplied secret key wins. Otherwise the persisted seed is loaded, or a
/// fresh key is generated and persisted.
pub fn load_or_create_identity(
    data_dir: &Path,
    secret_key: Option<&str>,
) -> Result<KeyPair, IdentityError> {
    if let Some(secret) = secret_key {
        return Ok(KeyPair::from_secret_hex(secret)?);
    }
    if let Some(state) = NodeState::load(data_dir)? {
        return Ok(KeyPair::from_secret_hex(&state.keypair_seed)?);
    }
    let keypair = KeyPair::generate();
    NodeState {
        keypair_seed: hex::encode(keypair.seed()),
    }
    .save(data_dir)?;
    Ok(keypair)
}

/// Identity loading errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid secret key: {0}")]
    Key(#[from] meshkv_core::Error),
    #[error("Node state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("meshkvd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&[]);
        config.validate().unwrap();
        let node = config.into_node_config();
        assert_eq!(node.announce_interval, Duration::from_secs(ANNOUNCE_INTERVAL_SECS));
        assert!(node.bootstrap.is_empty());
    }

    #[test]
    fn test_bootstrap_list_and_validation() {
        let id = KeyPair::generate().peer_id();
        let peers = format!("{}@127.0.0.1:9400,10.0.0.2:9400", id);
        let config = parse(&["--bootstrap", peers.as_str(), "--region", "eu"]);
        config.validate().unwrap();
        let node = config.into_node_config();
        assert_eq!(node.bootstrap_addrs().len(), 2);
        assert_eq!(node.region.as_deref(), Some("eu"));

        assert!(parse(&["--bootstrap", "nonsense"]).validate().is_err());
        assert!(parse(&["--log-format", "xml"]).validate().is_err());
        assert!(parse(&["--secret-key", "abcd"]).validate().is_err());
    }

    #[test]
    fn test_identity_persists_across_loads() {
        let dir = tempdir().unwrap();
        let first = load_or_create_identity(dir.path(), None).unwrap();
        let second = load_or_create_identity(dir.path(), None).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        let wallet = KeyPair::generate();
        let supplied =
            load_or_create_identity(dir.path(), Some(&hex::encode(wallet.seed()))).unwrap();
        assert_eq!(supplied.peer_id(), wallet.peer_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        load_or_create_identity(dir.path(), None).unwrap();
        let mode = std::fs::metadata(NodeState::path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
