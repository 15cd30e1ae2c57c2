//! Identity and signature primitives for meshkv
//!
//! Ed25519 keys identify nodes and namespace owners. Derivations use BLAKE3
//! with domain separation prefixes. Every verification path returns `false`
//! or an error on malformed input; nothing here panics on untrusted bytes.

use crate::canonical::{announce_sign_bytes, signed_write_bytes, write_sign_bytes};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for PeerId derivation
pub const DOMAIN_PEER_ID: &[u8] = b"meshkv-peer-id-v1";
/// Domain prefix for SignedWrite signatures
pub const DOMAIN_WRITE: &[u8] = b"meshkv-write";
/// Domain prefix for announcement signatures
pub const DOMAIN_ANNOUNCE: &[u8] = b"meshkv-announce-v1";
/// Domain prefix for session handshake proofs
pub const DOMAIN_HANDSHAKE: &[u8] = b"meshkv-handshake-v1";

/// Upper bound on the human part of a namespace name
pub const MAX_DB_NAME_LEN: usize = 256;

// =============================================================================
// KEYPAIR
// =============================================================================

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes
    pub fn from_seed(seed: &Bytes32) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Parse a hex secret: either a 32-byte seed or a 64-byte `seed || public`
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = secure_hex_decode(secret_hex.trim(), "secret_key")?;
        match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                Ok(Self::from_seed(&seed))
            }
            64 => {
                let mut keypair = [0u8; 64];
                keypair.copy_from_slice(&bytes);
                let signing_key =
                    SigningKey::from_keypair_bytes(&keypair).map_err(|_| Error::KeyMismatch)?;
                Ok(Self { signing_key })
            }
            actual => Err(Error::InvalidLength {
                field: "secret_key",
                expected: 32,
                actual,
            }),
        }
    }

    /// The 32-byte seed (secret key)
    pub fn seed(&self) -> Bytes32 {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the public key as lowercase hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Network identity of this keypair
    pub fn peer_id(&self) -> PeerId {
        derive_peer_id_from_public_key(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HEX
// =============================================================================

/// Decode hex, rejecting odd lengths and non-hex characters.
pub fn secure_hex_decode(input: &str, field: &'static str) -> Result<Vec<u8>> {
    if input.len() % 2 != 0 {
        return Err(Error::InvalidHex { field });
    }
    hex::decode(input).map_err(|_| Error::InvalidHex { field })
}

/// Decode a 32-byte public key from hex
pub fn decode_public_key(public_key_hex: &str) -> Result<Bytes32> {
    let bytes = secure_hex_decode(public_key_hex.trim(), "public_key")?;
    let key: Bytes32 = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidLength {
            field: "public_key",
            expected: 32,
            actual: bytes.len(),
        })?;
    VerifyingKey::from_bytes(&key).map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    Ok(key)
}

/// Decode a 64-byte signature from hex
pub fn decode_signature(signature_hex: &str) -> Result<Vec<u8>> {
    let bytes = secure_hex_decode(signature_hex.trim(), "signature")?;
    if bytes.len() != 64 {
        return Err(Error::InvalidLength {
            field: "signature",
            expected: 64,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

// =============================================================================
// KEYS AND IDENTITY
// =============================================================================

/// Generate a fresh hex keypair. The secret is the 32-byte seed.
pub fn generate_keypair() -> KeyPairHex {
    let kp = KeyPair::generate();
    KeyPairHex {
        public_key: kp.public_key_hex(),
        secret_key: hex::encode(kp.seed()),
    }
}

/// `PeerId = BLAKE3("meshkv-peer-id-v1" || public_key)`
pub fn derive_peer_id_from_public_key(public_key: &Bytes32) -> PeerId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PEER_ID);
    hasher.update(public_key);
    PeerId(*hasher.finalize().as_bytes())
}

/// Deterministic network identity for a hex secret key
pub fn derive_peer_id(secret_key_hex: &str) -> Result<PeerId> {
    Ok(KeyPair::from_secret_hex(secret_key_hex)?.peer_id())
}

/// Sign an arbitrary message with a hex secret key
pub fn sign(secret_key_hex: &str, message: &[u8]) -> Result<[u8; 64]> {
    Ok(KeyPair::from_secret_hex(secret_key_hex)?.sign(message))
}

/// Verify a signature. Malformed or mis-sized inputs yield `false`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    verifying_key
        .verify_strict(message, &Signature::from_bytes(&sig))
        .is_ok()
}

/// Hex-input variant of [`verify`]
pub fn verify_hex(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(key) = secure_hex_decode(public_key_hex.trim(), "public_key") else {
        return false;
    };
    let Ok(sig) = secure_hex_decode(signature_hex.trim(), "signature") else {
        return false;
    };
    verify(&key, message, &sig)
}

// =============================================================================
// NAMESPACES
// =============================================================================

/// Check the human part of a namespace name
pub fn validate_name_part(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidDbName("name is empty".into()));
    }
    if name.len() > MAX_DB_NAME_LEN {
        return Err(Error::InvalidDbName(format!(
            "name longer than {MAX_DB_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::InvalidDbName("name contains control characters".into()));
    }
    if name.starts_with(RESERVED_DB_PREFIX) {
        return Err(Error::InvalidDbName(format!(
            "names starting with {RESERVED_DB_PREFIX} are reserved"
        )));
    }
    Ok(())
}

fn is_owner_suffix(suffix: &str) -> bool {
    suffix.len() == 64 && suffix.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check a full namespace name for storage use (owned or local)
///
/// Owned names are checked on their human part only; anything without an
/// owner suffix is checked as a whole.
pub fn validate_db_name(db_name: &str) -> Result<()> {
    if db_name.len() > MAX_DB_NAME_LEN + 65 {
        return Err(Error::InvalidDbName("database name too long".into()));
    }
    match db_name.rfind('-') {
        Some(idx) if is_owner_suffix(&db_name[idx + 1..]) => validate_name_part(&db_name[..idx]),
        _ => validate_name_part(db_name),
    }
}

/// `<name>-<public_key_hex>`
pub fn generate_db_name(name: &str, public_key_hex: &str) -> Result<String> {
    validate_name_part(name)?;
    let key = decode_public_key(public_key_hex)?;
    Ok(format!("{}-{}", name, hex::encode(key)))
}

/// Human name of a namespace (everything before the last `-`)
pub fn extract_owner_name(db_name: &str) -> Option<&str> {
    db_name.rfind('-').map(|idx| &db_name[..idx])
}

/// Owner key embedded in a namespace name, if well formed
pub fn db_owner_key(db_name: &str) -> Option<Bytes32> {
    let idx = db_name.rfind('-')?;
    let (name, suffix) = (&db_name[..idx], &db_name[idx + 1..]);
    if validate_name_part(name).is_err() || suffix.len() != 64 {
        return None;
    }
    let bytes = secure_hex_decode(suffix, "db_owner").ok()?;
    bytes.as_slice().try_into().ok()
}

/// True iff `db_name` is a well-formed namespace owned by `public_key_hex`
pub fn verify_db_name(db_name: &str, public_key_hex: &str) -> bool {
    let Ok(key) = secure_hex_decode(public_key_hex.trim(), "public_key") else {
        return false;
    };
    match db_owner_key(db_name) {
        Some(owner) => owner.as_slice() == key.as_slice(),
        None => false,
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Accept `now - 3600s <= timestamp <= now + 300s` (all unix ms)
pub fn validate_timestamp(timestamp: i64, now: i64) -> Result<()> {
    let oldest = now.saturating_sub(MAX_TIMESTAMP_TOLERANCE_SECS * 1000);
    let newest = now.saturating_add(MIN_TIMESTAMP_TOLERANCE_SECS * 1000);
    if timestamp < oldest {
        return Err(Error::TimestampTooOld { timestamp, now });
    }
    if timestamp > newest {
        return Err(Error::TimestampTooFarInFuture { timestamp, now });
    }
    Ok(())
}

// =============================================================================
// SIGNED WRITES
// =============================================================================

/// Produce a timestamped SignedWrite
pub fn sign_write(
    keypair: &KeyPair,
    db_name: &str,
    key: &str,
    value: &[u8],
    timestamp: i64,
) -> Result<SignedWrite> {
    let bytes = write_sign_bytes(SignatureScheme::Timestamped, db_name, key, value, timestamp)?;
    Ok(SignedWrite {
        db_name: db_name.to_string(),
        key: key.to_string(),
        value: value.to_vec(),
        public_key: keypair.public_key(),
        signature: keypair.sign(&bytes).to_vec(),
        timestamp,
        scheme: SignatureScheme::Timestamped,
    })
}

/// Produce a write whose signature leaves the timestamp to the accepting node
pub fn sign_write_content(
    keypair: &KeyPair,
    db_name: &str,
    key: &str,
    value: &[u8],
    timestamp: i64,
) -> Result<SignedWrite> {
    let bytes = write_sign_bytes(SignatureScheme::ContentOnly, db_name, key, value, timestamp)?;
    Ok(SignedWrite {
        db_name: db_name.to_string(),
        key: key.to_string(),
        value: value.to_vec(),
        public_key: keypair.public_key(),
        signature: keypair.sign(&bytes).to_vec(),
        timestamp,
        scheme: SignatureScheme::ContentOnly,
    })
}

/// Check the write signature against its embedded key
pub fn verify_write_signature(write: &SignedWrite) -> Result<()> {
    let bytes = signed_write_bytes(write)?;
    if verify(&write.public_key, &bytes, &write.signature) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// Check that the signer owns the target namespace
pub fn verify_write_owner(write: &SignedWrite) -> Result<()> {
    match db_owner_key(&write.db_name) {
        Some(owner) if owner == write.public_key => Ok(()),
        _ => Err(Error::OwnerMismatch {
            db_name: write.db_name.clone(),
        }),
    }
}

// =============================================================================
// ANNOUNCEMENTS
// =============================================================================

/// Sign an announcement body
pub fn sign_announce(keypair: &KeyPair, body: AnnounceBody) -> Result<AnnounceMessage> {
    let bytes = announce_sign_bytes(&body)?;
    Ok(AnnounceMessage {
        body,
        signature: keypair.sign(&bytes).to_vec(),
    })
}

/// Verify an announcement's signature and identity binding
pub fn verify_announce(announce: &AnnounceMessage) -> Result<()> {
    let body = &announce.body;
    if derive_peer_id_from_public_key(&body.public_key) != body.node_id {
        return Err(Error::InvalidPublicKey("node_id does not match public key".into()));
    }
    let bytes = announce_sign_bytes(body)?;
    if verify(&body.public_key, &bytes, &announce.signature) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(verify(&kp.public_key(), msg, &sig));
        assert!(!verify(&kp.public_key(), b"hello worle", &sig));
    }

    #[test]
    fn test_verify_malformed_inputs() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"m");
        assert!(!verify(&kp.public_key()[..31], b"m", &sig));
        assert!(!verify(&kp.public_key(), b"m", &sig[..63]));
        assert!(!verify(&[], b"m", &[]));
        assert!(!verify_hex("zz", b"m", &hex::encode(sig)));
        assert!(!verify_hex(&kp.public_key_hex(), b"m", "abc"));
    }

    #[test]
    fn test_secret_key_forms() {
        let kp = KeyPair::generate();
        let seed_hex = hex::encode(kp.seed());
        let mut full = kp.seed().to_vec();
        full.extend_from_slice(&kp.public_key());

        let from_seed = KeyPair::from_secret_hex(&seed_hex).unwrap();
        let from_full = KeyPair::from_secret_hex(&hex::encode(&full)).unwrap();
        assert_eq!(from_seed.public_key(), kp.public_key());
        assert_eq!(from_full.public_key(), kp.public_key());

        // Mismatched public half is refused
        let other = KeyPair::generate();
        full[32..].copy_from_slice(&other.public_key());
        assert!(matches!(
            KeyPair::from_secret_hex(&hex::encode(&full)),
            Err(Error::KeyMismatch)
        ));

        assert!(KeyPair::from_secret_hex("abc").is_err());
        assert!(KeyPair::from_secret_hex(&hex::encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_peer_id_is_deterministic() {
        let keys = generate_keypair();
        let a = derive_peer_id(&keys.secret_key).unwrap();
        let b = derive_peer_id(&keys.secret_key).unwrap();
        assert_eq!(a, b);

        let other = generate_keypair();
        assert_ne!(a, derive_peer_id(&other.secret_key).unwrap());
    }

    #[test]
    fn test_db_name_consistency() {
        let keys = generate_keypair();
        let db = generate_db_name("notes", &keys.public_key).unwrap();
        assert_eq!(db, format!("notes-{}", keys.public_key));
        assert!(verify_db_name(&db, &keys.public_key));
        assert!(verify_db_name(&db, &keys.public_key.to_uppercase()));
        assert_eq!(extract_owner_name(&db), Some("notes"));

        let other = generate_keypair();
        assert!(!verify_db_name(&db, &other.public_key));
    }

    #[test]
    fn test_db_name_with_hyphens() {
        let keys = generate_keypair();
        let db = generate_db_name("my-shopping-list", &keys.public_key).unwrap();
        assert_eq!(extract_owner_name(&db), Some("my-shopping-list"));
        assert!(verify_db_name(&db, &keys.public_key));
    }

    #[test]
    fn test_db_name_rejections() {
        let keys = generate_keypair();
        assert!(generate_db_name("", &keys.public_key).is_err());
        assert!(generate_db_name("bad\nname", &keys.public_key).is_err());
        assert!(generate_db_name("__meta", &keys.public_key).is_err());
        assert!(generate_db_name("ok", "not-hex").is_err());

        assert!(!verify_db_name("nodash", &keys.public_key));
        assert!(!verify_db_name(&format!("-{}", keys.public_key), &keys.public_key));
        assert!(!verify_db_name("notes-abcd", &keys.public_key));
    }

    #[test]
    fn test_longest_name_part_is_storable() {
        let keys = generate_keypair();
        let name = "a".repeat(MAX_DB_NAME_LEN);
        let db = generate_db_name(&name, &keys.public_key).unwrap();
        assert_eq!(db.len(), MAX_DB_NAME_LEN + 65);
        assert!(validate_db_name(&db).is_ok());
        assert!(verify_db_name(&db, &keys.public_key));

        assert!(generate_db_name(&format!("{name}a"), &keys.public_key).is_err());
        assert!(validate_db_name(&format!("a{db}")).is_err());
        // Without an owner suffix the whole name is the name part
        assert!(validate_db_name(&"b".repeat(MAX_DB_NAME_LEN + 1)).is_err());
        assert!(validate_db_name(&format!("__x-{}", keys.public_key)).is_err());
        assert!(validate_db_name("prefs").is_ok());
    }

    #[test]
    fn test_timestamp_boundaries() {
        let now = 1_700_000_000_000;
        let past = MAX_TIMESTAMP_TOLERANCE_SECS * 1000;
        let future = MIN_TIMESTAMP_TOLERANCE_SECS * 1000;

        assert!(validate_timestamp(now, now).is_ok());
        assert!(validate_timestamp(now - past, now).is_ok());
        assert!(matches!(
            validate_timestamp(now - past - 1, now),
            Err(Error::TimestampTooOld { .. })
        ));
        assert!(validate_timestamp(now + future, now).is_ok());
        assert!(matches!(
            validate_timestamp(now + future + 1, now),
            Err(Error::TimestampTooFarInFuture { .. })
        ));
    }

    #[test]
    fn test_signed_write_checks() {
        let kp = KeyPair::generate();
        let db = generate_db_name("notes", &kp.public_key_hex()).unwrap();
        let write = sign_write(&kp, &db, "todo", b"buy milk", 1000).unwrap();
        assert!(verify_write_signature(&write).is_ok());
        assert!(verify_write_owner(&write).is_ok());

        let mut tampered = write.clone();
        tampered.value = b"buy beer".to_vec();
        assert!(verify_write_signature(&tampered).is_err());

        let mut moved = write.clone();
        moved.timestamp += 1;
        assert!(verify_write_signature(&moved).is_err());

        let intruder = KeyPair::generate();
        let foreign = sign_write(&intruder, &db, "todo", b"x", 1000).unwrap();
        assert!(verify_write_signature(&foreign).is_ok());
        assert!(matches!(
            verify_write_owner(&foreign),
            Err(Error::OwnerMismatch { .. })
        ));
    }

    #[test]
    fn test_content_signature_ignores_timestamp() {
        let kp = KeyPair::generate();
        let db = generate_db_name("notes", &kp.public_key_hex()).unwrap();
        let mut write = sign_write_content(&kp, &db, "todo", b"buy milk", 0).unwrap();
        write.timestamp = now_millis();
        assert!(verify_write_signature(&write).is_ok());

        write.scheme = SignatureScheme::Timestamped;
        assert!(verify_write_signature(&write).is_err());
    }

    #[test]
    fn test_announce_sign_verify() {
        let kp = KeyPair::generate();
        let body = AnnounceBody {
            node_id: kp.peer_id(),
            public_key: kp.public_key(),
            network_address: None,
            region: Some("eu".into()),
            client_version: None,
            is_mobile: true,
            timestamp: 5,
            known_peers: vec![],
        };
        let announce = sign_announce(&kp, body).unwrap();
        assert!(verify_announce(&announce).is_ok());

        let mut spoofed = announce.clone();
        spoofed.body.node_id = PeerId([9; 32]);
        assert!(verify_announce(&spoofed).is_err());

        let mut edited = announce;
        edited.body.region = Some("us".into());
        assert!(matches!(verify_announce(&edited), Err(Error::InvalidSignature)));
    }
}
