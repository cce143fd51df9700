//! Artifact Mesh DHT
//!
//! Kademlia-style routing and lookup layer for the artifact mesh: 256-bit
//! node identity over an XOR metric, a k-bucket routing table, a JSON-framed
//! wire protocol, and iterative lookups (FIND_NODE, FIND_VALUE, STORE) with
//! bounded concurrency. Values are replicated to the k closest peers and
//! republished as membership changes; the transport is pluggable behind the
//! [`transport::Transport`] trait.

pub mod bridge;
pub mod errors;
pub mod events;
pub mod id;
pub mod message;
pub mod node;
pub mod peer;
pub mod routing;
pub mod store;
pub mod transport;

pub use bridge::{Bridge, BridgeEndpoints, BridgeState};
pub use errors::DhtError;
pub use events::{EventBus, EventHandler};
pub use id::{bucket_index, Distance, Key, NodeId};
pub use message::{DhtType, MessageKind, MessagePayload, WireMessage};
pub use node::{DhtConfig, DhtNode, DhtNodeStats};
pub use peer::{Peer, PeerContact, PeerMetadata, PeerMetrics, PeerState};
pub use routing::{AddOutcome, RoutingStats, RoutingTable};
pub use store::{Envelope, Signer, ValueStore};
pub use transport::{
    MemoryNetwork, MemoryTransport, RequestHandler, Transport, UdpTransport,
};

/// Wall clock in milliseconds since the Unix epoch. All timestamps in the
/// wire protocol and the envelope layer use this resolution.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
