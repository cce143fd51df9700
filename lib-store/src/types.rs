//! Storage data model
//!
//! Artifacts are immutable byte sequences split into ordered chunks; each
//! chunk is independently hashed and placed. Artifact ids are
//! semi-deterministic (`SHA-256(bytes || now_ms)`) so concurrent identical
//! publishes never collide, while integrity rides on the separate content
//! checksum.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use lib_dht::NodeId;

use crate::errors::StoreError;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default replica target for network placement.
pub const DEFAULT_MIN_REPLICAS: u32 = 3;

/// Providers unseen for longer than this are pruned from content records:
/// one hour in milliseconds.
pub const PROVIDER_STALE_MS: u64 = 60 * 60 * 1000;

/// Where a chunk physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Network,
    P2p,
}

/// Placement details for one chunk replica set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub node_id: NodeId,
    pub storage_type: StorageType,
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Fraction of recent fetch attempts that succeeded, in [0, 1].
    pub availability: f64,
    pub last_seen: u64,
    /// Holder-reported health, in [0, 1].
    pub health: f64,
}

/// Optional per-artifact encryption parameters; carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub iv: String,
    pub algorithm: String,
}

/// Optional compression parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub algorithm: String,
    /// Byte length before compression.
    pub original_size: u64,
}

/// One chunk of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub size: u64,
    /// SHA-256 of the chunk bytes, lowercase hex.
    pub checksum: String,
    pub location: ChunkLocation,
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
}

/// Artifact-level metadata: the unit persisted through the DHT and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub id: String,
    pub size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub created: u64,
    pub modified: u64,
    /// SHA-256 over the concatenation of all chunks in index order.
    pub checksum: String,
    pub storage_type: StorageType,
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_info: Option<EncryptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_info: Option<CompressionInfo>,
}

impl ArtifactMetadata {
    /// Check the structural invariants: chunk indexes are 0..n with no gaps,
    /// sizes sum to `size`, and the checksum is well-formed.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut total = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(StoreError::InvalidMetadata(format!(
                    "chunk index {} at position {}",
                    chunk.index, i
                )));
            }
            if chunk.checksum.len() != 64 || !chunk.checksum.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(StoreError::InvalidMetadata(format!(
                    "malformed checksum on chunk {}",
                    chunk.index
                )));
            }
            total += chunk.size;
        }
        if total != self.size {
            return Err(StoreError::InvalidMetadata(format!(
                "size {} does not match chunk total {}",
                self.size, total
            )));
        }
        if self.checksum.len() != 64 {
            return Err(StoreError::InvalidMetadata(
                "malformed artifact checksum".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial metadata update applied through `update_metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f64>,
}

impl MetadataPatch {
    /// Apply the patch in place.
    pub fn apply(&self, metadata: &mut ArtifactMetadata) {
        if let Some(modified) = self.modified {
            metadata.modified = modified;
        }
        if let Some(replicas) = self.replicas {
            metadata.replicas = replicas;
        }
        for chunk in &mut metadata.chunks {
            if let Some(availability) = self.availability {
                chunk.location.availability = availability;
            }
            if let Some(health) = self.health {
                chunk.location.health = health;
            }
        }
    }
}

/// A provider advertising an artifact in its content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub node_id: NodeId,
    pub endpoint: String,
    pub last_seen: u64,
}

/// Usage statistics carried on a content record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentStats {
    pub total_downloads: u64,
    pub active_providers: u32,
    pub total_size: u64,
    /// Aggregate provider reliability, in [0, 1].
    pub reliability: f64,
}

/// Artifact metadata plus the provider set: the discovery-facing record at
/// `content:<artifact_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub metadata: ArtifactMetadata,
    pub providers: Vec<ProviderEntry>,
    pub stats: ContentStats,
}

impl ContentRecord {
    /// Append-with-dedup of a provider entry; an existing entry for the same
    /// node just refreshes `last_seen`.
    pub fn upsert_provider(&mut self, entry: ProviderEntry) {
        match self.providers.iter_mut().find(|p| p.node_id == entry.node_id) {
            Some(existing) => {
                existing.endpoint = entry.endpoint;
                existing.last_seen = entry.last_seen;
            }
            None => self.providers.push(entry),
        }
        self.stats.active_providers = self.providers.len() as u32;
    }

    /// Drop providers unseen for longer than `stale_after_ms`.
    pub fn prune_stale_providers(&mut self, now_ms: u64, stale_after_ms: u64) {
        self.providers
            .retain(|p| now_ms.saturating_sub(p.last_seen) <= stale_after_ms);
        self.stats.active_providers = self.providers.len() as u32;
    }
}

/// Version list entry under `versions:<artifact_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub artifact_id: String,
    pub created: u64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Options controlling one store operation.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Reuse a pre-assigned artifact id (cross-provider replication).
    pub id: Option<String>,
    pub chunk_size: Option<usize>,
    pub replicas: Option<u32>,
    pub compress: bool,
}

/// Per-provider usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub storage_type: Option<StorageType>,
    pub artifact_count: u64,
    pub chunk_count: u64,
    pub total_bytes: u64,
}

/// Lowercase-hex SHA-256 of a byte slice: the checksum form used for chunks
/// and artifacts everywhere in this crate.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derive a fresh artifact id from content bytes and the current wall clock.
pub fn artifact_id(data: &[u8], now_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(now_ms.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
