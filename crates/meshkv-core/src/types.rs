//! Core data types for meshkv
//!
//! All wire types are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 32-byte fixed-size array used for keys and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// PROTOCOL CONSTANTS
// =============================================================================

/// Maximum size of a single gossip payload or signed write (1 MiB)
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;
/// How far in the past a write timestamp may lie (seconds)
pub const MAX_TIMESTAMP_TOLERANCE_SECS: i64 = 3600;
/// How far in the future a write timestamp may lie (seconds)
pub const MIN_TIMESTAMP_TOLERANCE_SECS: i64 = 300;
/// Silence after which a peer record is dropped (seconds)
pub const PEER_EXPIRY_SECS: i64 = 300;
/// Interval between membership announcements (seconds)
pub const ANNOUNCE_INTERVAL_SECS: u64 = 10;
/// Page size for sync responses
pub const MAX_WRITES_PER_SYNC_RESPONSE: usize = 128;
/// Prefix reserved for internal storage trees
pub const RESERVED_DB_PREFIX: &str = "__";

// =============================================================================
// IDENTITY
// =============================================================================

/// Network identity: BLAKE3("meshkv-peer-id-v1" || ed25519_public_key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Bytes32);

impl PeerId {
    /// Derive from an Ed25519 public key
    pub fn from_public_key(public_key: &Bytes32) -> Self {
        crate::crypto::derive_peer_id_from_public_key(public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Full lowercase hex form (the `node_id` exposed to clients)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = crate::crypto::secure_hex_decode(s.trim(), "node_id")?;
        let array: Bytes32 = bytes.as_slice().try_into().map_err(|_| Error::InvalidLength {
            field: "node_id",
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

// =============================================================================
// SIGNED WRITES
// =============================================================================

/// Which byte layout a SignedWrite signature covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignatureScheme {
    /// Covers (db_name, key, value, timestamp)
    #[default]
    Timestamped = 1,
    /// Covers (db_name, key, value); the accepting node stamped the time
    ContentOnly = 2,
}

/// A write signed by the namespace owner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWrite {
    pub db_name: String,
    pub key: String,
    pub value: Vec<u8>,
    /// Ed25519 public key of the signer
    pub public_key: Bytes32,
    /// 64-byte Ed25519 signature over the canonical write bytes
    pub signature: Vec<u8>,
    /// Unix milliseconds
    pub timestamp: i64,
    pub scheme: SignatureScheme,
}

impl SignedWrite {
    /// Encoded wire size, used for the message length cap
    pub fn encoded_len(&self) -> usize {
        postcard::to_allocvec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// A stored key/value pair as returned to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub db_name: String,
    pub key: String,
    /// Value decoded as UTF-8 (lossy)
    pub value: String,
    pub raw_value_bytes: Vec<u8>,
    /// Unix milliseconds of the winning write
    pub timestamp: i64,
    /// Whether the entry carries an owner signature
    pub signed: bool,
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// What a peer knows about another peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: PeerId,
    pub public_key: Bytes32,
    pub network_address: Option<String>,
    pub region: Option<String>,
    pub client_version: Option<String>,
    /// Local receive time of the latest announcement (unix ms)
    pub last_announce_at: i64,
    pub latency_ms: Option<u64>,
    pub is_mobile: bool,
}

/// Signed content of a membership announcement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceBody {
    pub node_id: PeerId,
    pub public_key: Bytes32,
    pub network_address: Option<String>,
    pub region: Option<String>,
    pub client_version: Option<String>,
    pub is_mobile: bool,
    /// Sender clock, unix ms
    pub timestamp: i64,
    /// Dialable peers known to the sender, as `node_id@ip:port`
    pub known_peers: Vec<String>,
}

/// Periodic membership broadcast
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceMessage {
    pub body: AnnounceBody,
    pub signature: Vec<u8>,
}

// =============================================================================
// STATUS
// =============================================================================

/// Point-in-time snapshot of node health
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub is_running: bool,
    pub node_id: Option<String>,
    pub connected_peers: usize,
    pub discovered_peers: usize,
    pub uptime_seconds: u64,
    pub gossip_messages_received: u64,
    pub storage_size_bytes: u64,
    pub total_keys: u64,
    pub sync_operations: u64,
    pub latency_requests_sent: u64,
    pub latency_responses_received: u64,
}

/// Static identity of a running node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub public_key: String,
    pub listen_address: Option<String>,
    pub region: Option<String>,
    pub client_version: String,
}

/// Hex-encoded Ed25519 keypair handed to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairHex {
    pub public_key: String,
    pub secret_key: String,
}
