//! DHT error kinds
//!
//! Lookup failures aggregate per-peer errors: a lookup only fails when every
//! candidate branch fails. Replay rejections are dropped silently by
//! receivers and never surface past the codec.

use thiserror::Error;

/// Errors surfaced by the routing and lookup layer.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Node has not been started, or has been stopped.
    #[error("node is not running")]
    NotRunning,

    /// Lifecycle misuse: connect while not disconnected.
    #[error("already connected")]
    AlreadyConnected,

    /// RPC or lookup deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A peer could not be reached; the peer is marked failed and the
    /// operation continues on other candidates.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// No value found after lookup convergence.
    #[error("value not found")]
    NotFound,

    /// Message failed structural validation (missing sender, bad key, ...).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Timestamp outside the replay window. Dropped silently by receivers.
    #[error("message outside replay window")]
    Replay,

    /// No peers available to run a lookup against.
    #[error("no peers available")]
    NoPeers,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
