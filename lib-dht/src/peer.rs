//! Peer records
//!
//! A peer record is created on first observation, updated on any successful
//! exchange, and removed when evicted as stale. The routing table owns all
//! peer records (arena keyed by NodeId); buckets refer to peers by id only.

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// Classification of a peer within the mesh topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Global,
    Regional,
    Local,
    #[default]
    Unknown,
}

/// Peer lifecycle states.
///
/// A peer goes stale when unseen for longer than the stale threshold
/// (default 1 hour); stale peers are evicted on the next bucket contention.
/// A successful PING returns any peer to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Stale,
    Evicted,
}

/// Descriptive peer metadata, refreshed from exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PeerMetadata {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Fraction of time the peer has been observed reachable, in [0, 1].
    #[serde(default)]
    pub uptime: f64,
}

/// Advertised storage space of a peer, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageSpace {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Observed peer performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PeerMetrics {
    /// Most recent round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Estimated bandwidth in bytes per second.
    pub bandwidth: u64,
    /// Success ratio of recent exchanges, in [0, 1].
    pub reliability: f64,
    pub storage: StorageSpace,
}

/// A known peer: identity, reachability, metadata and observed metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addresses: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub metadata: PeerMetadata,
    #[serde(default)]
    pub metrics: PeerMetrics,
    #[serde(default)]
    pub state: PeerState,
    /// Wall-clock milliseconds of the last successful exchange.
    pub last_seen: u64,
    /// Consecutive failed exchanges since the last success.
    #[serde(default)]
    pub failed_attempts: u32,
}

impl Peer {
    /// Create a record for a freshly observed peer.
    pub fn new(id: NodeId, address: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id,
            addresses: vec![address.into()],
            protocols: vec!["dht".to_string()],
            metadata: PeerMetadata::default(),
            metrics: PeerMetrics::default(),
            state: PeerState::Unknown,
            last_seen: now_ms,
            failed_attempts: 0,
        }
    }

    /// Primary reachable address, if any.
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    /// Record a successful exchange: refresh last_seen, reset failures,
    /// transition back to Connected from any state.
    pub fn mark_seen(&mut self, now_ms: u64) {
        self.last_seen = now_ms;
        self.failed_attempts = 0;
        self.state = PeerState::Connected;
    }

    /// Record a failed exchange.
    pub fn mark_failed(&mut self) {
        self.failed_attempts += 1;
    }

    /// Whether the peer has been unseen for longer than `stale_after_ms`.
    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > stale_after_ms
    }

    /// Wire contact form: identity plus primary address.
    pub fn contact(&self) -> PeerContact {
        PeerContact {
            id: self.id,
            address: self.addresses.first().cloned().unwrap_or_default(),
        }
    }
}

/// Minimal addressing tuple exchanged in FIND_NODE responses and handed to
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerContact {
    pub id: NodeId,
    pub address: String,
}
