//! Networking primitives for the meshkv mesh
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Ed25519 session handshake
//! - QUIC-based secure transport
//! - In-memory transport for deterministic multi-node tests

pub mod framing;
pub mod handshake;
pub mod memory;
pub mod peer;
pub mod quic;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType, MAX_FRAME_SIZE};
pub use handshake::{HandshakeError, SessionPeer};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::{PeerAddr, PeerAddrError};
pub use quic::QuicTransport;
pub use transport::{Transport, TransportError, TransportEvent, TransportHandle};
