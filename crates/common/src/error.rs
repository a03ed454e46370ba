//! Error types for wgquota

use thiserror::Error;

/// Result type alias using the wgquota Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgquota error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid address range {cidr}: {reason}")]
    InvalidRange { cidr: String, reason: String },

    #[error("Address pool exhausted: requested {requested}, available {available}")]
    PoolExhausted { requested: usize, available: usize },

    #[error("Address pool too large: {count} addresses exceeds limit of {max}")]
    PoolTooLarge { count: u64, max: u64 },

    #[error("Failed to fetch transfer counters: {0}")]
    CounterFetch(String),

    #[error("Unparseable transfer line {line:?}: {reason}")]
    CounterParse { line: String, reason: String },

    #[error("Tunnel control error: {0}")]
    TunnelControl(String),

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Interface {name} still has {peers} peer(s)")]
    InterfaceInUse { name: String, peers: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key generation error: {0}")]
    Crypto(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },
}

impl Error {
    pub(crate) fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}
