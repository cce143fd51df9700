//! Wire protocol codec
//!
//! Every message on the wire is a JSON frame:
//! `{type, dht_type, protocol: "dht", version: "1.0.0", payload}` with
//! payload `{id, timestamp, sender, receiver?, key?, value?, data?}`.
//! Queries and updates are rejected when the sender is missing, when a
//! present key is not 64 hex chars, or when the timestamp falls outside the
//! replay window. Unknown `dht_type` values decode to `Unknown` and are
//! dropped silently so newer peers remain interoperable.

use serde::{Deserialize, Serialize};

use crate::errors::DhtError;
use crate::id::{Key, NodeId};
use crate::now_ms;

/// Protocol identifier carried by every frame.
pub const PROTOCOL: &str = "dht";

/// Wire protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Accepted clock skew between sender and receiver: five minutes.
pub const REPLAY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Top-level message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Query,
    Response,
    Update,
    Announce,
}

/// DHT operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DhtType {
    FindNode,
    FindValue,
    Store,
    Delete,
    Ping,
    /// Forward-compatibility: any unrecognised operation.
    #[serde(other)]
    Unknown,
}

impl DhtType {
    /// The message kind a request of this operation travels under.
    pub fn request_kind(&self) -> MessageKind {
        match self {
            DhtType::FindNode | DhtType::FindValue | DhtType::Ping => MessageKind::Query,
            DhtType::Store | DhtType::Delete => MessageKind::Update,
            DhtType::Unknown => MessageKind::Query,
        }
    }
}

/// Frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Unique message id; responses echo the originating id.
    pub id: String,
    /// Sender wall clock, milliseconds since the epoch.
    pub timestamp: u64,
    /// Sender node id, 64-hex.
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Target key, 64-hex, for FIND_NODE/FIND_VALUE/STORE/DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Value envelope for STORE and FIND_VALUE hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Auxiliary data: sender address on queries, peer lists and acks on
    /// responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A framed DHT message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub dht_type: DhtType,
    pub protocol: String,
    pub version: String,
    pub payload: MessagePayload,
}

impl WireMessage {
    /// Build a request frame; the kind follows from the operation.
    pub fn request(dht_type: DhtType, sender: &NodeId, sender_address: &str) -> Self {
        Self {
            kind: dht_type.request_kind(),
            dht_type,
            protocol: PROTOCOL.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            payload: MessagePayload {
                id: generate_message_id(),
                timestamp: now_ms(),
                sender: sender.to_hex(),
                receiver: None,
                key: None,
                value: None,
                data: Some(serde_json::json!({ "address": sender_address })),
            },
        }
    }

    /// PING liveness probe.
    pub fn ping(sender: &NodeId, sender_address: &str) -> Self {
        Self::request(DhtType::Ping, sender, sender_address)
    }

    /// FIND_NODE query for the peers closest to `target`.
    pub fn find_node(sender: &NodeId, sender_address: &str, target: &Key) -> Self {
        let mut msg = Self::request(DhtType::FindNode, sender, sender_address);
        msg.payload.key = Some(target.to_hex());
        msg
    }

    /// FIND_VALUE query.
    pub fn find_value(sender: &NodeId, sender_address: &str, key: &Key) -> Self {
        let mut msg = Self::request(DhtType::FindValue, sender, sender_address);
        msg.payload.key = Some(key.to_hex());
        msg
    }

    /// STORE update carrying a value envelope.
    pub fn store(
        sender: &NodeId,
        sender_address: &str,
        key: &Key,
        envelope: serde_json::Value,
    ) -> Self {
        let mut msg = Self::request(DhtType::Store, sender, sender_address);
        msg.payload.key = Some(key.to_hex());
        msg.payload.value = Some(envelope);
        msg
    }

    /// Response frame echoing the originating payload id.
    pub fn response_to(request: &WireMessage, sender: &NodeId) -> Self {
        Self {
            kind: MessageKind::Response,
            dht_type: request.dht_type,
            protocol: PROTOCOL.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            payload: MessagePayload {
                id: request.payload.id.clone(),
                timestamp: now_ms(),
                sender: sender.to_hex(),
                receiver: Some(request.payload.sender.clone()),
                key: request.payload.key.clone(),
                value: None,
                data: None,
            },
        }
    }

    /// Serialise to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a JSON wire frame. Structural parse only; call
    /// [`WireMessage::validate`] before acting on the message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Validate a received frame against `now_ms`.
    ///
    /// Returns `DhtError::Replay` for timestamps outside the window (the
    /// receiver drops these silently) and `InvalidMessage` for structural
    /// problems.
    pub fn validate(&self, now_ms: u64) -> Result<(), DhtError> {
        if self.payload.sender.is_empty() {
            return Err(DhtError::InvalidMessage("missing sender".to_string()));
        }
        NodeId::from_hex(&self.payload.sender)?;

        if let Some(key) = &self.payload.key {
            NodeId::from_hex(key)
                .map_err(|_| DhtError::InvalidMessage(format!("invalid key: {}", key)))?;
        }

        let delta = now_ms.abs_diff(self.payload.timestamp);
        if delta > REPLAY_WINDOW_MS {
            return Err(DhtError::Replay);
        }

        Ok(())
    }

    /// Sender id parsed from the wire form. Only valid after `validate`.
    pub fn sender_id(&self) -> Result<NodeId, DhtError> {
        NodeId::from_hex(&self.payload.sender)
    }

    /// Sender's advertised reachable address, when present.
    pub fn sender_address(&self) -> Option<String> {
        self.payload
            .data
            .as_ref()
            .and_then(|d| d.get("address"))
            .and_then(|a| a.as_str())
            .map(str::to_string)
    }

    /// Target key parsed from the wire form.
    pub fn key(&self) -> Result<Key, DhtError> {
        let key = self
            .payload
            .key
            .as_ref()
            .ok_or_else(|| DhtError::InvalidMessage("missing key".to_string()))?;
        NodeId::from_hex(key)
    }
}

fn generate_message_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
