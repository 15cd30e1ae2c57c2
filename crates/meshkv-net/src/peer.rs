//! Peer dial addresses

use meshkv_core::types::PeerId;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Address parse errors
#[derive(Debug, Error)]
pub enum PeerAddrError {
    #[error("empty peer address")]
    Empty,
    #[error("invalid node id in {0:?}")]
    InvalidNodeId(String),
    #[error("invalid socket address in {0:?}")]
    InvalidSocketAddr(String),
}

/// Where to reach a peer.
///
/// Accepted forms:
/// - `<node_id_hex>@<ip:port>`: dial and require that identity
/// - `<ip:port>`: dial and accept whoever answers
/// - `<node_id_hex>`: identity only, for transports that route by id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub peer_id: Option<PeerId>,
    pub socket_addr: Option<SocketAddr>,
}

impl PeerAddr {
    pub fn new(peer_id: Option<PeerId>, socket_addr: Option<SocketAddr>) -> Self {
        Self {
            peer_id,
            socket_addr,
        }
    }

    /// Address that names only an identity
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        Self::new(Some(peer_id), None)
    }

    /// Address that names only a socket
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(None, Some(addr))
    }
}

impl FromStr for PeerAddr {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PeerAddrError::Empty);
        }

        let parse_id = |id: &str| {
            id.parse::<PeerId>()
                .map_err(|_| PeerAddrError::InvalidNodeId(s.to_string()))
        };
        let parse_socket = |addr: &str| {
            addr.parse::<SocketAddr>()
                .map_err(|_| PeerAddrError::InvalidSocketAddr(s.to_string()))
        };

        match s.split_once('@') {
            Some((id, addr)) => Ok(Self::new(Some(parse_id(id)?), Some(parse_socket(addr)?))),
            None if s.len() == 64 && !s.contains(':') => Ok(Self::from_peer_id(parse_id(s)?)),
            None => Ok(Self::from_socket(parse_socket(s)?)),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.peer_id, self.socket_addr) {
            (Some(id), Some(addr)) => write!(f, "{}@{}", id, addr),
            (Some(id), None) => write!(f, "{}", id),
            (None, Some(addr)) => write!(f, "{}", addr),
            (None, None) => write!(f, "<unroutable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let id = PeerId([0x11; 32]);

        let full: PeerAddr = format!("{}@127.0.0.1:9100", id).parse().unwrap();
        assert_eq!(full.peer_id, Some(id));
        assert_eq!(full.socket_addr, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(full.to_string(), format!("{}@127.0.0.1:9100", id));

        let bare: PeerAddr = "10.0.0.2:4000".parse().unwrap();
        assert_eq!(bare.peer_id, None);

        let id_only: PeerAddr = id.to_hex().parse().unwrap();
        assert_eq!(id_only, PeerAddr::from_peer_id(id));

        let v6: PeerAddr = "[::1]:9100".parse().unwrap();
        assert!(v6.socket_addr.is_some());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("".parse::<PeerAddr>(), Err(PeerAddrError::Empty)));
        assert!(matches!(
            "nothex@127.0.0.1:1".parse::<PeerAddr>(),
            Err(PeerAddrError::InvalidNodeId(_))
        ));
        assert!(matches!(
            format!("{}@nowhere", PeerId([1; 32])).parse::<PeerAddr>(),
            Err(PeerAddrError::InvalidSocketAddr(_))
        ));
        assert!("localhost".parse::<PeerAddr>().is_err());
    }
}
