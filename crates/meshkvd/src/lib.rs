//! meshkvd - replicated key-value mesh node
//!
//! This crate provides:
//! - Owner-isolated, last-writer-wins storage on sled
//! - Signed membership announcements and a peer registry
//! - Epidemic gossip of signed writes and custom topics
//! - Paged delta synchronization between peers
//! - Latency probing and live status snapshots
//! - A control surface for embedding applications

pub mod config;
pub mod control;
pub mod events;
pub mod gossip;
pub mod logging;
pub mod node;
pub mod probe;
pub mod registry;
pub mod resilience;
pub mod status;
pub mod storage;
pub mod sync;

pub use config::{Config, NodeConfig};
pub use control::{ApiError, ControlSurface};
pub use events::NodeEvent;
pub use gossip::Gossip;
pub use node::{Node, NodeError};
pub use registry::PeerRegistry;
pub use storage::Storage;
pub use sync::SyncCoordinator;
