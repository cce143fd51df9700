//! Storage providers
//!
//! All providers implement one chunk-level capability and differ only in
//! where chunks live: local disk, DHT-backed network placement, or a
//! peer-to-peer cache with announcements.

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::types::{
    ArtifactMetadata, CompressionInfo, MetadataPatch, ProviderStats, StorageType, StoreOptions,
};

pub mod local;
pub mod network;
pub mod p2p;

pub use local::LocalProvider;
pub use network::NetworkProvider;
pub use p2p::P2pProvider;

/// Uniform provider contract.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Which placement this provider implements.
    fn storage_type(&self) -> StorageType;

    /// Chunk, place and describe an artifact.
    async fn store(&self, data: &[u8], options: &StoreOptions)
        -> Result<ArtifactMetadata, StoreError>;

    /// Fetch and verify an artifact; never returns unverified bytes.
    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Best-effort removal. `Ok(true)` when this provider held the artifact.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError>;

    /// Apply a partial metadata update.
    async fn update_metadata(
        &self,
        id: &str,
        patch: MetadataPatch,
    ) -> Result<ArtifactMetadata, StoreError>;

    /// Re-read and re-hash the stored chunks.
    async fn validate_checksum(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_stats(&self) -> Result<ProviderStats, StoreError>;

    /// Remove orphaned data; returns how many entries were dropped.
    async fn cleanup(&self) -> Result<u64, StoreError>;
}

/// Apply the optional LZ4 compression pass ahead of chunking.
///
/// When compression is on, `size` and `checksum` in the resulting metadata
/// describe the stored representation; `CompressionInfo.original_size`
/// preserves the caller-visible length.
pub(crate) fn prepare_payload(
    data: &[u8],
    options: &StoreOptions,
) -> (Vec<u8>, Option<CompressionInfo>) {
    if !options.compress {
        return (data.to_vec(), None);
    }
    let compressed = lz4_flex::compress_prepend_size(data);
    let info = CompressionInfo {
        algorithm: "lz4".to_string(),
        original_size: data.len() as u64,
    };
    (compressed, Some(info))
}

/// Invert [`prepare_payload`] after the stored bytes have been verified.
pub(crate) fn restore_payload(
    bytes: Vec<u8>,
    compression: Option<&CompressionInfo>,
) -> Result<Vec<u8>, StoreError> {
    match compression {
        None => Ok(bytes),
        Some(info) => {
            let restored = lz4_flex::decompress_size_prepended(&bytes)
                .map_err(|e| StoreError::Retrieve(format!("lz4 decompress: {}", e)))?;
            if restored.len() as u64 != info.original_size {
                return Err(StoreError::Retrieve(format!(
                    "decompressed length {} does not match recorded {}",
                    restored.len(),
                    info.original_size
                )));
            }
            Ok(restored)
        }
    }
}
