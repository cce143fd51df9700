//! DHT value store
//!
//! Values travel and rest as UTF-8 JSON envelopes `{payload, ts, signature?}`.
//! Writes resolve last-writer-wins by `ts`; a null payload is a tombstone
//! that overrides earlier writes the same way. Signatures are optional - an
//! attached [`Signer`] fills the field on locally-owned writes, and readers
//! carry it opaquely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::Key;

/// Signing hook for value envelopes. Verification happens outside the core;
/// the DHT neither requires nor checks signatures.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> String;
}

/// The wire and at-rest form of a DHT value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Arbitrary JSON payload; `null` marks a tombstone.
    pub payload: serde_json::Value,
    /// Writer wall clock, milliseconds. Last writer wins.
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    pub fn new(payload: serde_json::Value, ts: u64) -> Self {
        Self {
            payload,
            ts,
            signature: None,
        }
    }

    /// A deletion marker that overrides earlier writes by `ts`.
    pub fn tombstone(ts: u64) -> Self {
        Self::new(serde_json::Value::Null, ts)
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_null()
    }

    /// Sign the canonical `payload || ts` bytes.
    pub fn signed(mut self, signer: &dyn Signer) -> Self {
        let mut bytes = self.payload.to_string().into_bytes();
        bytes.extend_from_slice(&self.ts.to_be_bytes());
        self.signature = Some(signer.sign(&bytes));
        self
    }

    /// Parse an envelope from raw JSON, rejecting structurally invalid
    /// documents (readers ignore these).
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Borrowing variant of [`Envelope::from_json`].
    pub fn from_json_ref(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// One stored entry.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub envelope: Envelope,
    /// Local wall-clock milliseconds at which the entry was written.
    pub stored_at: u64,
    /// Whether the local caller originated this value; owned values are
    /// republished to the current k-closest set.
    pub owned: bool,
}

/// In-memory key/value store for the envelope layer.
#[derive(Debug, Default)]
pub struct ValueStore {
    entries: HashMap<Key, StoredValue>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a write if it wins by `ts`. Returns whether the store changed.
    pub fn put(&mut self, key: Key, envelope: Envelope, owned: bool, now_ms: u64) -> bool {
        match self.entries.get(&key) {
            Some(existing) if existing.envelope.ts >= envelope.ts => false,
            _ => {
                self.entries.insert(
                    key,
                    StoredValue {
                        envelope,
                        stored_at: now_ms,
                        owned,
                    },
                );
                true
            }
        }
    }

    /// Live (non-tombstone) envelope for a key.
    pub fn get(&self, key: &Key) -> Option<&Envelope> {
        self.entries
            .get(key)
            .map(|v| &v.envelope)
            .filter(|e| !e.is_tombstone())
    }

    /// The raw entry, tombstones included.
    pub fn entry(&self, key: &Key) -> Option<&StoredValue> {
        self.entries.get(key)
    }

    /// Keys of every value the local node owns (for republish).
    pub fn owned_keys(&self) -> Vec<Key> {
        self.entries
            .iter()
            .filter(|(_, v)| v.owned && !v.envelope.is_tombstone())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries written longer than `max_age_ms` ago that the local node
    /// does not own. Returns the number removed.
    pub fn cleanup_expired(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, v| v.owned || now_ms.saturating_sub(v.stored_at) <= max_age_ms);
        before - self.entries.len()
    }
}
