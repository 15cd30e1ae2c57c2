//! QUIC transport
//!
//! Sessions run over quinn with a throwaway self-signed certificate for
//! encryption. Peer identity comes from the Ed25519 handshake performed on
//! the first bidirectional stream and bound to the TLS session through an
//! exported key. That stream then carries all frames for the lifetime of
//! the session.

use crate::framing::{read_frame, write_frame, Frame, FrameError, FrameType, MAX_FRAME_SIZE};
use crate::handshake::{self, HandshakeError, SessionPeer};
use crate::peer::PeerAddr;
use crate::transport::{
    Transport, TransportError, TransportEvent, TransportHandle, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use bytes::BytesMut;
use meshkv_core::crypto::KeyPair;
use meshkv_core::types::PeerId;
use parking_lot::RwLock;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, RecvStream, SendStream, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// TLS server name presented by every node
pub const SERVER_NAME: &str = "meshkv";
/// ALPN protocol identifier
pub const ALPN: &[u8] = b"meshkv/1";
/// Limit for connection setup plus identity handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SEND_QUEUE_DEPTH: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn quic_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Quic(e.to_string())
}

fn tls_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

/// Keying material both ends of this TLS session derive identically
fn channel_binding(conn: &quinn::Connection) -> Result<[u8; 32], HandshakeError> {
    let mut out = [0u8; 32];
    conn.export_keying_material(&mut out, handshake::CHANNEL_BINDING_LABEL, b"")
        .map_err(|_| HandshakeError::ChannelBinding)?;
    Ok(out)
}

/// A live, authenticated session
struct Session {
    id: u64,
    /// Which side dialed; used to settle simultaneous connects
    initiator: PeerId,
    conn: quinn::Connection,
    tx: mpsc::Sender<Frame>,
}

/// State shared with the per-session tasks
struct Shared {
    keypair: KeyPair,
    local_id: PeerId,
    sessions: RwLock<HashMap<PeerId, Arc<Session>>>,
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
    next_session_id: AtomicU64,
}

/// QUIC transport endpoint
pub struct QuicTransport {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

impl QuicTransport {
    /// Bind the endpoint and start accepting sessions.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(keypair: KeyPair, listen: SocketAddr) -> Result<TransportHandle, TransportError> {
        let (server_config, client_config) = endpoint_configs()?;
        let mut endpoint = Endpoint::server(server_config, listen)?;
        endpoint.set_default_client_config(client_config);

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let local_id = keypair.peer_id();
        let shared = Arc::new(Shared {
            keypair,
            local_id,
            sessions: RwLock::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
        });

        info!(
            "QUIC transport for {} listening on {}",
            local_id.short(),
            endpoint.local_addr()?
        );
        tokio::spawn(accept_loop(endpoint.clone(), Arc::clone(&shared)));

        let transport = Arc::new(Self { endpoint, shared });
        Ok(TransportHandle::new(transport, rx))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn local_id(&self) -> PeerId {
        self.shared.local_id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn connect(&self, addr: &PeerAddr) -> Result<PeerId, TransportError> {
        self.ensure_open()?;
        if let Some(expected) = addr.peer_id {
            if expected == self.shared.local_id {
                return Err(HandshakeError::SelfConnection.into());
            }
            if self.shared.sessions.read().contains_key(&expected) {
                return Ok(expected);
            }
        }
        let socket = addr.socket_addr.ok_or(TransportError::Unroutable(*addr))?;

        let connecting = self.endpoint.connect(socket, SERVER_NAME).map_err(quic_err)?;
        let conn = timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(quic_err)?;
        let (mut send, mut recv) = conn.open_bi().await.map_err(quic_err)?;
        let binding = match channel_binding(&conn) {
            Ok(binding) => binding,
            Err(e) => {
                conn.close(VarInt::from_u32(2), b"handshake failed");
                return Err(e.into());
            }
        };

        let mut buf = BytesMut::new();
        let result = timeout(
            HANDSHAKE_TIMEOUT,
            handshake::initiate(
                &self.shared.keypair,
                addr.peer_id,
                &binding,
                &mut recv,
                &mut send,
                &mut buf,
            ),
        )
        .await;
        let peer = match result {
            Ok(Ok(peer)) => peer,
            Ok(Err(e)) => {
                conn.close(VarInt::from_u32(2), b"handshake failed");
                return Err(e.into());
            }
            Err(_) => {
                conn.close(VarInt::from_u32(2), b"handshake timeout");
                return Err(TransportError::Timeout);
            }
        };

        let initiator = self.shared.local_id;
        install_session(&self.shared, peer, initiator, conn, send, recv, buf).await;
        Ok(peer.peer_id)
    }

    async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        self.ensure_open()?;
        if frame.payload.len() + 1 > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(frame.payload.len() + 1).into());
        }
        let session = self
            .shared
            .sessions
            .read()
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(*to))?;
        session.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure(*to),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.sessions.read().keys().copied().collect()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared.sessions.read().contains_key(peer)
    }

    async fn disconnect(&self, peer: &PeerId) {
        let removed = self.shared.sessions.write().remove(peer);
        if let Some(session) = removed {
            let _ = session.tx.try_send(Frame::goodbye());
            session.conn.close(VarInt::from_u32(0), b"disconnect");
            let _ = self
                .shared
                .events
                .send(TransportEvent::PeerDisconnected(*peer))
                .await;
        }
    }

    async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<_> = self.shared.sessions.write().drain().collect();
        for (peer, session) in sessions {
            debug!("Closing session with {}", peer.short());
            session.conn.close(VarInt::from_u32(0), b"shutdown");
        }
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        let _ = timeout(Duration::from_secs(1), self.endpoint.wait_idle()).await;
        info!("QUIC transport for {} shut down", self.shared.local_id.short());
    }
}

async fn accept_loop(endpoint: Endpoint, shared: Arc<Shared>) {
    while let Some(incoming) = endpoint.accept().await {
        if shared.closed.load(Ordering::Acquire) {
            incoming.refuse();
            continue;
        }
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            if let Err(e) = accept_session(&shared, incoming).await {
                debug!("Inbound session from {} failed: {}", remote, e);
            }
        });
    }
    debug!("Accept loop for {} finished", shared.local_id.short());
}

async fn accept_session(shared: &Arc<Shared>, incoming: quinn::Incoming) -> Result<(), TransportError> {
    let connecting = incoming.accept().map_err(quic_err)?;
    let conn = timeout(HANDSHAKE_TIMEOUT, connecting)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(quic_err)?;
    let (mut send, mut recv) = timeout(HANDSHAKE_TIMEOUT, conn.accept_bi())
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(quic_err)?;

    let binding = match channel_binding(&conn) {
        Ok(binding) => binding,
        Err(e) => {
            conn.close(VarInt::from_u32(2), b"handshake failed");
            return Err(e.into());
        }
    };

    let mut buf = BytesMut::new();
    let result = timeout(
        HANDSHAKE_TIMEOUT,
        handshake::respond(&shared.keypair, &binding, &mut recv, &mut send, &mut buf),
    )
    .await;
    let peer = match result {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            conn.close(VarInt::from_u32(2), b"handshake failed");
            return Err(e.into());
        }
        Err(_) => {
            conn.close(VarInt::from_u32(2), b"handshake timeout");
            return Err(TransportError::Timeout);
        }
    };

    install_session(shared, peer, peer.peer_id, conn, send, recv, buf).await;
    Ok(())
}

/// Register a session and start its reader/writer tasks.
///
/// If a session with the same peer already exists (both sides dialed at
/// once), both ends keep the connection dialed by the lower PeerId.
async fn install_session(
    shared: &Arc<Shared>,
    peer: SessionPeer,
    initiator: PeerId,
    conn: quinn::Connection,
    send: SendStream,
    recv: RecvStream,
    buf: BytesMut,
) {
    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let session = Arc::new(Session {
        id: shared.next_session_id.fetch_add(1, Ordering::Relaxed),
        initiator,
        conn: conn.clone(),
        tx,
    });

    let (replaced, accepted) = {
        let mut sessions = shared.sessions.write();
        match sessions.get(&peer.peer_id) {
            Some(existing) if existing.initiator <= initiator => (None, false),
            _ => (sessions.insert(peer.peer_id, Arc::clone(&session)), true),
        }
    };

    if !accepted {
        debug!("Dropping duplicate session with {}", peer.peer_id.short());
        conn.close(VarInt::from_u32(1), b"duplicate session");
        return;
    }
    if let Some(old) = &replaced {
        debug!("Replacing session with {}", peer.peer_id.short());
        old.conn.close(VarInt::from_u32(1), b"duplicate session");
    }

    tokio::spawn(write_loop(send, rx));
    tokio::spawn(read_loop(Arc::clone(shared), peer.peer_id, session.id, recv, buf));

    info!(
        "Session established with {} at {}",
        peer.peer_id.short(),
        conn.remote_address()
    );
    if replaced.is_none() {
        let _ = shared
            .events
            .send(TransportEvent::PeerConnected {
                peer_id: peer.peer_id,
                addr: Some(conn.remote_address()),
            })
            .await;
    }
}

async fn write_loop(mut send: SendStream, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let goodbye = frame.frame_type == FrameType::Goodbye;
        if let Err(e) = write_frame(&mut send, &frame).await {
            debug!("Session write failed: {}", e);
            break;
        }
        if goodbye {
            break;
        }
    }
    let _ = send.finish();
}

async fn read_loop(
    shared: Arc<Shared>,
    peer_id: PeerId,
    session_id: u64,
    mut recv: RecvStream,
    mut buf: BytesMut,
) {
    loop {
        match read_frame(&mut recv, &mut buf).await {
            Ok(Some(frame)) if frame.frame_type == FrameType::Gossip => {
                let event = TransportEvent::FrameReceived {
                    from: peer_id,
                    frame,
                };
                if shared.events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Some(frame)) if frame.frame_type == FrameType::Goodbye => break,
            Ok(Some(frame)) => {
                warn!(
                    "Unexpected {:?} frame from {} after handshake",
                    frame.frame_type,
                    peer_id.short()
                );
                break;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Session read from {} failed: {}", peer_id.short(), e);
                break;
            }
        }
    }

    let removed = {
        let mut sessions = shared.sessions.write();
        match sessions.get(&peer_id) {
            Some(current) if current.id == session_id => sessions.remove(&peer_id),
            _ => None,
        }
    };
    if let Some(session) = removed {
        session.conn.close(VarInt::from_u32(0), b"stream closed");
        info!("Session with {} closed", peer_id.short());
        let _ = shared
            .events
            .send(TransportEvent::PeerDisconnected(peer_id))
            .await;
    }
}

/// Accepts any server certificate but still checks handshake signatures.
///
/// Certificates are throwaway; the identity handshake authenticates peers.
#[derive(Debug)]
struct SessionCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for SessionCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn endpoint_configs() -> Result<(quinn::ServerConfig, quinn::ClientConfig), TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(tls_err)?;
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls_err)?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SessionCertVerifier(provider)))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(IDLE_TIMEOUT.try_into().map_err(quic_err)?));
    let transport = Arc::new(transport);

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(server_crypto).map_err(tls_err)?,
    ));
    server_config.transport_config(Arc::clone(&transport));

    let mut client_config =
        quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(client_crypto).map_err(tls_err)?));
    client_config.transport_config(transport);

    Ok((server_config, client_config))
}
