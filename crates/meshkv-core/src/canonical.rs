//! Canonical encodings for signed objects
//!
//! Two encodings are used:
//! - SignedWrite bytes use an explicit length-prefixed layout so that clients
//!   in any language can reproduce them without a postcard implementation.
//! - Node-to-node objects (announcements) use postcard, field order being
//!   Rust struct field order.

use crate::crypto::{DOMAIN_ANNOUNCE, DOMAIN_WRITE};
use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Current SignedWrite encoding version
pub const WRITE_ENCODING_VERSION: u8 = 1;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Append-only writer for the length-prefixed layout
struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    fn field(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::MessageTooLarge {
            size: bytes.len(),
            max: u32::MAX as usize,
        })?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Bytes covered by a SignedWrite signature.
///
/// ```text
/// "meshkv-write" || version u8 || scheme u8
///   || u32_be(len) || db_name || u32_be(len) || key || u32_be(len) || value
///   || i64_be(timestamp)      (Timestamped only)
/// ```
pub fn write_sign_bytes(
    scheme: SignatureScheme,
    db_name: &str,
    key: &str,
    value: &[u8],
    timestamp: i64,
) -> Result<Vec<u8>> {
    let mut w = CanonicalWriter::with_capacity(
        DOMAIN_WRITE.len() + 2 + 12 + db_name.len() + key.len() + value.len() + 8,
    );
    w.raw(DOMAIN_WRITE)
        .u8(WRITE_ENCODING_VERSION)
        .u8(scheme as u8);
    w.field(db_name.as_bytes())?
        .field(key.as_bytes())?
        .field(value)?;
    if scheme == SignatureScheme::Timestamped {
        w.i64(timestamp);
    }
    Ok(w.finish())
}

/// Signing bytes for a complete SignedWrite
pub fn signed_write_bytes(write: &SignedWrite) -> Result<Vec<u8>> {
    write_sign_bytes(
        write.scheme,
        &write.db_name,
        &write.key,
        &write.value,
        write.timestamp,
    )
}

/// Bytes covered by an announcement signature:
/// `"meshkv-announce-v1" || postcard(body)`
pub fn announce_sign_bytes(body: &AnnounceBody) -> Result<Vec<u8>> {
    let body_bytes = canonical_bytes(body)?;
    let mut bytes = Vec::with_capacity(DOMAIN_ANNOUNCE.len() + body_bytes.len());
    bytes.extend_from_slice(DOMAIN_ANNOUNCE);
    bytes.extend_from_slice(&body_bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_deterministic() {
        let body = AnnounceBody {
            node_id: PeerId([1; 32]),
            public_key: [2; 32],
            network_address: Some("127.0.0.1:9100".into()),
            region: None,
            client_version: Some("0.1.0".into()),
            is_mobile: false,
            timestamp: 42,
            known_peers: vec![],
        };

        let bytes1 = canonical_bytes(&body).unwrap();
        let bytes2 = canonical_bytes(&body).unwrap();
        assert_eq!(bytes1, bytes2);
        assert!(announce_sign_bytes(&body).unwrap().starts_with(DOMAIN_ANNOUNCE));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // Moving a byte between adjacent fields must change the encoding
        let a = write_sign_bytes(SignatureScheme::Timestamped, "ab", "c", b"v", 1).unwrap();
        let b = write_sign_bytes(SignatureScheme::Timestamped, "a", "bc", b"v", 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scheme_changes_bytes() {
        let ts = write_sign_bytes(SignatureScheme::Timestamped, "db", "k", b"v", 7).unwrap();
        let content = write_sign_bytes(SignatureScheme::ContentOnly, "db", "k", b"v", 7).unwrap();
        assert_ne!(ts, content);
        assert_eq!(ts.len(), content.len() + 8);

        // ContentOnly ignores the timestamp entirely
        let other = write_sign_bytes(SignatureScheme::ContentOnly, "db", "k", b"v", 99).unwrap();
        assert_eq!(content, other);
    }
}
