//! Storage error kinds
//!
//! `store` requires the primary provider to succeed, `retrieve` requires any
//! provider to produce verified bytes, and `delete` requires at least one
//! provider to remove; every aggregate keeps the last underlying cause.

use lib_dht::DhtError;
use thiserror::Error;

/// Errors surfaced by the chunked storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown artifact or chunk.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or incomplete metadata document.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Chunk or artifact checksum mismatch; the caller never sees the bytes.
    #[error("chunk validation failed: {0}")]
    ChunkValidation(String),

    /// A network-backed write could not be placed.
    #[error("network store error: {0}")]
    NetworkStore(String),

    /// A network-backed read could not be satisfied.
    #[error("retrieve error: {0}")]
    Retrieve(String),

    /// The selected strategy has no backing provider (configuration error).
    #[error("no providers configured for strategy")]
    NoProviders,

    /// Version label already present in the version list.
    #[error("version already exists: {0}")]
    VersionExists(String),

    /// Malformed version label.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Component used before start or after stop.
    #[error("storage is not running")]
    NotRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
