//! Error types for meshkv core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hex input was malformed (odd length or non-hex characters)
    #[error("invalid hex for {field}")]
    InvalidHex { field: &'static str },

    /// Decoded bytes had the wrong length
    #[error("invalid length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Secret key does not match the public half it was supplied with
    #[error("secret key does not match its embedded public key")]
    KeyMismatch,

    /// Namespace name violates naming rules
    #[error("invalid database name: {0}")]
    InvalidDbName(String),

    /// Namespace owner differs from the signing key
    #[error("database {db_name} is not owned by the signing key")]
    OwnerMismatch { db_name: String },

    /// Payload exceeds the wire limit
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Timestamp older than the accepted window
    #[error("timestamp {timestamp} is older than the accepted window (now {now})")]
    TimestampTooOld { timestamp: i64, now: i64 },

    /// Signature does not cover the timestamp, so peers cannot trust it
    #[error("timestamp is not covered by the signature")]
    UnsignedTimestamp,

    /// Timestamp too far in the future
    #[error("timestamp {timestamp} is too far in the future (now {now})")]
    TimestampTooFarInFuture { timestamp: i64, now: i64 },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),
}
