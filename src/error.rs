//! Error types for the state store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Invalid diff at {path}: {reason}")]
    InvalidDiff { path: String, reason: String },

    #[error("Mutation failed: {0}")]
    Mutation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("State file is locked by another process")]
    Locked,

    #[error("Commits nested deeper than {0} levels")]
    NestingLimit(usize),

    #[error("Persistence queue is closed")]
    QueueClosed,

    #[error("Client not connected: {0}")]
    ClientNotConnected(u64),
}

impl StoreError {
    /// Build a mutation error from anything displayable.
    pub fn mutation(reason: impl std::fmt::Display) -> Self {
        StoreError::Mutation(reason.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
