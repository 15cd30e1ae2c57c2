//! Session authentication handshake
//!
//! TLS on the QUIC connection provides encryption but uses throwaway
//! certificates, so each session additionally proves possession of the
//! node's Ed25519 identity key:
//!
//! ```text
//! initiator -> Hello    { version, public_key_i, nonce_i }
//! responder -> HelloAck { version, public_key_r, nonce_r, sig_r(nonce_i) }
//! initiator -> Proof    { sig_i(nonce_r) }
//! ```
//!
//! Each signature covers the domain prefix, the signer's role, the peer's
//! challenge, both public keys and a channel binding. Over QUIC the binding
//! is a TLS keying-material export, so a proof relayed into a different TLS
//! session fails to verify.

use crate::framing::{read_frame, write_frame, Frame, FrameError, FrameType};
use bytes::BytesMut;
use meshkv_core::crypto::{verify, KeyPair, DOMAIN_HANDSHAKE};
use meshkv_core::types::{Bytes32, PeerId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Handshake protocol version
pub const HANDSHAKE_VERSION: u8 = 2;

/// TLS exporter label for the channel binding
pub const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-meshkv-handshake";

const ROLE_RESPONDER: u8 = b'R';
const ROLE_INITIATOR: u8 = b'I';

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Stream closed during handshake")]
    Closed,
    #[error("Unsupported handshake version: {0}")]
    VersionMismatch(u8),
    #[error("Peer failed to prove its identity")]
    BadProof,
    #[error("Refusing to connect to ourselves")]
    SelfConnection,
    #[error("Cannot derive channel binding from the TLS session")]
    ChannelBinding,
    #[error("Expected peer {expected} but connected to {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u8,
    public_key: Bytes32,
    nonce: Bytes32,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    version: u8,
    public_key: Bytes32,
    nonce: Bytes32,
    signature: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Proof {
    signature: Vec<u8>,
}

/// Authenticated identity of the remote side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionPeer {
    pub peer_id: PeerId,
    pub public_key: Bytes32,
}

fn fresh_nonce() -> Bytes32 {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Bytes a side signs to answer the other side's challenge
fn proof_bytes(
    role: u8,
    challenge: &Bytes32,
    signer: &Bytes32,
    verifier: &Bytes32,
    binding: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_HANDSHAKE.len() + 1 + 96 + 4 + binding.len());
    bytes.extend_from_slice(DOMAIN_HANDSHAKE);
    bytes.push(role);
    bytes.extend_from_slice(challenge);
    bytes.extend_from_slice(signer);
    bytes.extend_from_slice(verifier);
    bytes.extend_from_slice(&(binding.len() as u32).to_be_bytes());
    bytes.extend_from_slice(binding);
    bytes
}

async fn next_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Frame, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader, buf).await?.ok_or(HandshakeError::Closed)
}

fn check_peer(
    keypair: &KeyPair,
    public_key: &Bytes32,
    expected: Option<PeerId>,
) -> Result<SessionPeer, HandshakeError> {
    if *public_key == keypair.public_key() {
        return Err(HandshakeError::SelfConnection);
    }
    let peer_id = PeerId::from_public_key(public_key);
    if let Some(expected) = expected {
        if expected != peer_id {
            return Err(HandshakeError::UnexpectedPeer {
                expected,
                actual: peer_id,
            });
        }
    }
    Ok(SessionPeer {
        peer_id,
        public_key: *public_key,
    })
}

/// Run the dialing side of the handshake.
///
/// `binding` must be the value the responder derives for the same channel.
/// Leftover bytes after the handshake remain in `buf` for the frame reader.
pub async fn initiate<R, W>(
    keypair: &KeyPair,
    expected: Option<PeerId>,
    binding: &[u8],
    reader: &mut R,
    writer: &mut W,
    buf: &mut BytesMut,
) -> Result<SessionPeer, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let our_key = keypair.public_key();
    let our_nonce = fresh_nonce();
    let hello = Hello {
        version: HANDSHAKE_VERSION,
        public_key: our_key,
        nonce: our_nonce,
    };
    write_frame(writer, &Frame::encode(FrameType::Hello, &hello)?).await?;

    let ack: HelloAck = next_frame(reader, buf).await?.decode(FrameType::HelloAck)?;
    if ack.version != HANDSHAKE_VERSION {
        return Err(HandshakeError::VersionMismatch(ack.version));
    }
    let peer = check_peer(keypair, &ack.public_key, expected)?;
    let expected_bytes =
        proof_bytes(ROLE_RESPONDER, &our_nonce, &ack.public_key, &our_key, binding);
    if !verify(&ack.public_key, &expected_bytes, &ack.signature) {
        return Err(HandshakeError::BadProof);
    }

    let proof = Proof {
        signature: keypair
            .sign(&proof_bytes(
                ROLE_INITIATOR,
                &ack.nonce,
                &our_key,
                &ack.public_key,
                binding,
            ))
            .to_vec(),
    };
    write_frame(writer, &Frame::encode(FrameType::Proof, &proof)?).await?;

    Ok(peer)
}

/// Run the accepting side of the handshake
pub async fn respond<R, W>(
    keypair: &KeyPair,
    binding: &[u8],
    reader: &mut R,
    writer: &mut W,
    buf: &mut BytesMut,
) -> Result<SessionPeer, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello: Hello = next_frame(reader, buf).await?.decode(FrameType::Hello)?;
    if hello.version != HANDSHAKE_VERSION {
        return Err(HandshakeError::VersionMismatch(hello.version));
    }
    let peer = check_peer(keypair, &hello.public_key, None)?;

    let our_key = keypair.public_key();
    let our_nonce = fresh_nonce();
    let ack = HelloAck {
        version: HANDSHAKE_VERSION,
        public_key: our_key,
        nonce: our_nonce,
        signature: keypair
            .sign(&proof_bytes(
                ROLE_RESPONDER,
                &hello.nonce,
                &our_key,
                &hello.public_key,
                binding,
            ))
            .to_vec(),
    };
    write_frame(writer, &Frame::encode(FrameType::HelloAck, &ack)?).await?;

    let proof: Proof = next_frame(reader, buf).await?.decode(FrameType::Proof)?;
    let expected_bytes =
        proof_bytes(ROLE_INITIATOR, &our_nonce, &hello.public_key, &our_key, binding);
    if !verify(&hello.public_key, &expected_bytes, &proof.signature) {
        return Err(HandshakeError::BadProof);
    }

    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::split;

    const BINDING: &[u8] = b"test-channel";

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (a, b) = tokio::io::duplex(4096);

        let bob_id = bob.peer_id();
        let alice_task = {
            let alice = alice.clone();
            tokio::spawn(async move {
                let (mut r, mut w) = split(a);
                let mut buf = BytesMut::new();
                initiate(&alice, Some(bob_id), BINDING, &mut r, &mut w, &mut buf).await
            })
        };

        let (mut r, mut w) = split(b);
        let mut buf = BytesMut::new();
        let seen_by_bob = respond(&bob, BINDING, &mut r, &mut w, &mut buf).await.unwrap();
        let seen_by_alice = alice_task.await.unwrap().unwrap();

        assert_eq!(seen_by_bob.peer_id, alice.peer_id());
        assert_eq!(seen_by_alice.peer_id, bob.peer_id());
        assert_eq!(seen_by_alice.public_key, bob.public_key());
    }

    #[tokio::test]
    async fn test_unexpected_peer_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let someone_else = KeyPair::generate().peer_id();
        let (a, b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            let (mut r, mut w) = split(b);
            let mut buf = BytesMut::new();
            respond(&bob, BINDING, &mut r, &mut w, &mut buf).await
        });

        let (mut r, mut w) = split(a);
        let mut buf = BytesMut::new();
        let result =
            initiate(&alice, Some(someone_else), BINDING, &mut r, &mut w, &mut buf).await;
        assert!(matches!(result, Err(HandshakeError::UnexpectedPeer { .. })));
        drop((r, w));

        // Initiator aborted, so the responder never receives a proof
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_forged_ack_rejected() {
        let alice = KeyPair::generate();
        let victim = KeyPair::generate();
        let (a, b) = tokio::io::duplex(4096);

        // An impostor claims the victim's key but cannot sign for it
        let impostor = tokio::spawn(async move {
            let (mut r, mut w) = split(b);
            let mut buf = BytesMut::new();
            let _hello: Hello = next_frame(&mut r, &mut buf)
                .await
                .unwrap()
                .decode(FrameType::Hello)
                .unwrap();
            let ack = HelloAck {
                version: HANDSHAKE_VERSION,
                public_key: victim.public_key(),
                nonce: [0; 32],
                signature: vec![0; 64],
            };
            write_frame(&mut w, &Frame::encode(FrameType::HelloAck, &ack).unwrap())
                .await
                .unwrap();
        });

        let (mut r, mut w) = split(a);
        let mut buf = BytesMut::new();
        let result = initiate(&alice, None, BINDING, &mut r, &mut w, &mut buf).await;
        assert!(matches!(result, Err(HandshakeError::BadProof)));
        impostor.await.unwrap();
    }

    /// Connect two parties through a forwarder that copies bytes verbatim.
    /// Each side derives its own binding, as it would for its own TLS session.
    async fn handshake_through_forwarder(
        initiator_binding: &'static [u8],
        responder_binding: &'static [u8],
    ) -> (
        Result<SessionPeer, HandshakeError>,
        Result<SessionPeer, HandshakeError>,
    ) {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (a, mut near) = tokio::io::duplex(4096);
        let (mut far, b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut near, &mut far).await;
        });

        let bob_id = bob.peer_id();
        let responder = tokio::spawn(async move {
            let (mut r, mut w) = split(b);
            let mut buf = BytesMut::new();
            respond(&bob, responder_binding, &mut r, &mut w, &mut buf).await
        });

        let (mut r, mut w) = split(a);
        let mut buf = BytesMut::new();
        let initiated =
            initiate(&alice, Some(bob_id), initiator_binding, &mut r, &mut w, &mut buf).await;
        drop((r, w));
        (initiated, responder.await.unwrap())
    }

    #[tokio::test]
    async fn test_forwarded_handshake_needs_matching_binding() {
        let (initiated, responded) = handshake_through_forwarder(b"session-1", b"session-1").await;
        assert!(initiated.is_ok());
        assert!(responded.is_ok());

        // Separate TLS sessions on each leg yield different bindings
        let (initiated, responded) = handshake_through_forwarder(b"session-1", b"session-2").await;
        assert!(matches!(initiated, Err(HandshakeError::BadProof)));
        assert!(responded.is_err());
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let alice = KeyPair::generate();
        let twin = alice.clone();
        let (a, b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            let (mut r, mut w) = split(b);
            let mut buf = BytesMut::new();
            respond(&twin, BINDING, &mut r, &mut w, &mut buf).await
        });

        let (mut r, mut w) = split(a);
        let mut buf = BytesMut::new();
        drop(tokio::time::timeout(
            std::time::Duration::from_millis(200),
            initiate(&alice, None, BINDING, &mut r, &mut w, &mut buf),
        )
        .await);
        assert!(matches!(
            responder.await.unwrap(),
            Err(HandshakeError::SelfConnection)
        ));
    }
}
