//! Local disk provider
//!
//! Chunks at `<root>/chunks/<artifact_id>/<index>`, metadata JSON at
//! `<root>/metadata/<artifact_id>`. Single replica, synchronous writes;
//! metadata updates go through a temp file and an atomic rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use lib_dht::{now_ms, NodeId};

use crate::chunk::ChunkManager;
use crate::errors::StoreError;
use crate::provider::{prepare_payload, restore_payload, StorageProvider};
use crate::types::{
    sha256_hex, ArtifactMetadata, ChunkDescriptor, ChunkLocation, MetadataPatch, ProviderStats,
    StorageType, StoreOptions, artifact_id,
};

pub struct LocalProvider {
    root: PathBuf,
    node_id: NodeId,
    chunker: ChunkManager,
}

impl LocalProvider {
    pub async fn new(root: impl Into<PathBuf>, node_id: NodeId) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("chunks")).await?;
        tokio::fs::create_dir_all(root.join("metadata")).await?;
        Ok(Self {
            root,
            node_id,
            chunker: ChunkManager::default(),
        })
    }

    fn chunk_dir(&self, id: &str) -> PathBuf {
        self.root.join("chunks").join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join("metadata").join(id)
    }

    fn endpoint(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn read_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
        let path = self.metadata_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let metadata: ArtifactMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::InvalidMetadata(format!("{}: {}", id, e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Write metadata through a temp file and rename into place.
    async fn write_metadata(&self, metadata: &ArtifactMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(&metadata.id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(metadata)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_chunks(
        &self,
        metadata: &ArtifactMetadata,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let dir = self.chunk_dir(&metadata.id);
        let mut chunks = Vec::with_capacity(metadata.chunks.len());
        for descriptor in &metadata.chunks {
            let path = dir.join(descriptor.index.to_string());
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(format!(
                        "{} chunk {}",
                        metadata.id, descriptor.index
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            chunks.push(bytes);
        }
        Ok(chunks)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }

    async fn store(
        &self,
        data: &[u8],
        options: &StoreOptions,
    ) -> Result<ArtifactMetadata, StoreError> {
        let now = now_ms();
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| artifact_id(data, now));
        let (payload, compression) = prepare_payload(data, options);
        let chunk_size = options.chunk_size.unwrap_or(self.chunker.chunk_size());
        let pieces = self.chunker.split_with(&payload, chunk_size);

        let dir = self.chunk_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut descriptors = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            tokio::fs::write(dir.join(piece.index.to_string()), &piece.bytes).await?;
            descriptors.push(ChunkDescriptor {
                index: piece.index,
                size: piece.bytes.len() as u64,
                checksum: piece.checksum.clone(),
                location: ChunkLocation {
                    node_id: self.node_id,
                    storage_type: StorageType::Local,
                    endpoint: self.endpoint(),
                    region: None,
                    availability: 1.0,
                    last_seen: now,
                    health: 1.0,
                },
                replicas: 1,
                encryption: None,
                compression: compression.clone(),
            });
        }

        let metadata = ArtifactMetadata {
            id: id.clone(),
            size: payload.len() as u64,
            chunks: descriptors,
            created: now,
            modified: now,
            checksum: sha256_hex(&payload),
            storage_type: StorageType::Local,
            replicas: 1,
            encryption_info: None,
            compression_info: compression,
        };
        self.write_metadata(&metadata).await?;
        debug!(id = %id, chunks = metadata.chunks.len(), "stored artifact on disk");
        Ok(metadata)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let metadata = self.read_metadata(id).await?;
        let chunks = self.read_chunks(&metadata).await?;

        let pairs = chunks
            .into_iter()
            .zip(metadata.chunks.iter())
            .collect::<Vec<_>>();
        let payload = ChunkManager::combine(pairs)?;

        if sha256_hex(&payload) != metadata.checksum {
            return Err(StoreError::ChunkValidation(format!(
                "artifact {} checksum mismatch",
                id
            )));
        }
        restore_payload(payload, metadata.compression_info.as_ref())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let had_metadata = match tokio::fs::remove_file(self.metadata_path(id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_dir_all(self.chunk_dir(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(had_metadata),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
        self.read_metadata(id).await
    }

    async fn update_metadata(
        &self,
        id: &str,
        patch: MetadataPatch,
    ) -> Result<ArtifactMetadata, StoreError> {
        let mut metadata = self.read_metadata(id).await?;
        patch.apply(&mut metadata);
        if patch.modified.is_none() {
            metadata.modified = now_ms();
        }
        self.write_metadata(&metadata).await?;
        Ok(metadata)
    }

    async fn validate_checksum(&self, id: &str) -> Result<bool, StoreError> {
        let metadata = self.read_metadata(id).await?;
        let chunks = match self.read_chunks(&metadata).await {
            Ok(chunks) => chunks,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        for (bytes, descriptor) in chunks.iter().zip(metadata.chunks.iter()) {
            if bytes.len() as u64 != descriptor.size || sha256_hex(bytes) != descriptor.checksum {
                warn!(id = %id, chunk = descriptor.index, "chunk failed re-hash");
                return Ok(false);
            }
        }
        let payload: Vec<u8> = chunks.concat();
        Ok(sha256_hex(&payload) == metadata.checksum)
    }

    async fn get_stats(&self) -> Result<ProviderStats, StoreError> {
        let mut stats = ProviderStats {
            storage_type: Some(StorageType::Local),
            ..Default::default()
        };
        let mut entries = tokio::fs::read_dir(self.root.join("metadata")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id.ends_with(".tmp") {
                continue;
            }
            if let Ok(metadata) = self.read_metadata(&id).await {
                stats.artifact_count += 1;
                stats.chunk_count += metadata.chunks.len() as u64;
                stats.total_bytes += metadata.size;
            }
        }
        Ok(stats)
    }

    /// Remove chunk directories that have no metadata document.
    async fn cleanup(&self) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(self.root.join("chunks")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !Path::new(&self.metadata_path(&id)).exists() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
