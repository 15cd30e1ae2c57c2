//! meshkv core library
//!
//! This crate provides the identity primitives, canonical signing encodings,
//! and shared data types for the meshkv replicated key-value mesh.
//!
//! # Modules
//!
//! - [`types`]: Wire and data model types (PeerId, SignedWrite, PeerRecord, etc.)
//! - [`canonical`]: Deterministic byte layouts for signing
//! - [`crypto`]: Keypairs, signatures, namespace naming, timestamp windows
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use types::*;
