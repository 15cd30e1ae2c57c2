//! Transport abstraction
//!
//! A transport owns authenticated sessions to peers and exchanges frames
//! over them. Inbound activity is reported on an event channel handed out
//! when the transport is created.

use crate::framing::{Frame, FrameError};
use crate::handshake::HandshakeError;
use crate::peer::PeerAddr;
use async_trait::async_trait;
use meshkv_core::types::PeerId;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of per-transport event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("QUIC error: {0}")]
    Quic(String),
    #[error("TLS setup error: {0}")]
    Tls(String),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Peer not connected: {0}")]
    PeerNotFound(PeerId),
    #[error("Address cannot be dialed by this transport: {0}")]
    Unroutable(PeerAddr),
    #[error("Send queue full for peer {0}")]
    Backpressure(PeerId),
    #[error("Transport is shut down")]
    Shutdown,
    #[error("Timed out")]
    Timeout,
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// New authenticated session
    PeerConnected { peer_id: PeerId, addr: Option<SocketAddr> },
    /// Session ended
    PeerDisconnected(PeerId),
    /// Frame received from peer
    FrameReceived { from: PeerId, frame: Frame },
}

/// Point-to-point session layer used by the node
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our network identity
    fn local_id(&self) -> PeerId;

    /// Bound socket address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Open (or reuse) a session and return the authenticated peer
    async fn connect(&self, addr: &PeerAddr) -> Result<PeerId, TransportError>;

    /// Queue a frame for a directly connected peer
    async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError>;

    /// Peers with a live session
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Check for a live session
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected_peers().contains(peer)
    }

    /// Close the session with a peer, if any
    async fn disconnect(&self, peer: &PeerId);

    /// Close every session and stop accepting new ones
    async fn shutdown(&self);

    /// Queue a frame for every connected peer except `except`.
    /// Returns how many peers accepted it.
    async fn broadcast(&self, frame: Frame, except: Option<PeerId>) -> usize {
        let mut sent = 0;
        for peer in self.connected_peers() {
            if Some(peer) == except {
                continue;
            }
            match self.send(&peer, frame.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", peer.short(), e),
            }
        }
        sent
    }
}

/// A started transport together with its event stream
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl TransportHandle {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self { transport, events }
    }
}
