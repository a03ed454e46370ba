//! wgquota Common Library
//!
//! Peer accounting, quota lifecycle, IP pool allocation and tunnel control
//! shared by the wgquota daemon.

pub mod accounting;
pub mod config_render;
pub mod db;
pub mod error;
pub mod ippool;
pub mod keys;
pub mod lifecycle;
pub mod provisioning;
pub mod tunnel;
pub mod types;

// Re-export commonly used types
pub use accounting::{TrafficReconciler, UsageUpdate};
pub use db::Database;
pub use error::{Error, Result};
pub use ippool::{PoolRange, MAX_POOL_SIZE};
pub use keys::{KeyGenerator, X25519KeyGenerator};
pub use lifecycle::Transition;
pub use provisioning::{PeerDefaults, Provisioner};
pub use tunnel::{DryRunTunnel, TunnelControl, WgCli};
pub use types::*;

/// wgquota version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/wgquota")
}
