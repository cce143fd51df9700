//! Network (DHT-backed) provider
//!
//! Chunk bytes are placed at `chunk:<checksum>` and artifact metadata at
//! `metadata:<artifact_id>`; the DHT's own STORE fan-out replicates each key
//! to the k closest nodes of the chunk checksum. Bulk peer transfer is the
//! transport adapter's concern; this provider only decides placement.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::debug;

use lib_dht::{now_ms, DhtNode};

use crate::chunk::ChunkManager;
use crate::errors::StoreError;
use crate::provider::{prepare_payload, restore_payload, StorageProvider};
use crate::types::{
    artifact_id, sha256_hex, ArtifactMetadata, ChunkDescriptor, ChunkLocation, MetadataPatch,
    ProviderStats, StorageType, StoreOptions, DEFAULT_MIN_REPLICAS,
};

/// Key for an artifact metadata document.
pub fn metadata_key(id: &str) -> String {
    format!("metadata:{}", id)
}

/// Key for a chunk payload, addressed by its checksum.
pub fn chunk_key(checksum: &str) -> String {
    format!("chunk:{}", checksum)
}

pub struct NetworkProvider {
    node: DhtNode,
    chunker: ChunkManager,
    min_replicas: u32,
}

impl NetworkProvider {
    pub fn new(node: DhtNode) -> Self {
        Self {
            node,
            chunker: ChunkManager::default(),
            min_replicas: DEFAULT_MIN_REPLICAS,
        }
    }

    pub fn with_min_replicas(mut self, min_replicas: u32) -> Self {
        self.min_replicas = min_replicas;
        self
    }

    async fn fetch_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
        let value = self
            .node
            .get(&metadata_key(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let metadata: ArtifactMetadata = serde_json::from_value(value)
            .map_err(|e| StoreError::InvalidMetadata(format!("{}: {}", id, e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    async fn fetch_chunk(&self, checksum: &str) -> Result<Vec<u8>, StoreError> {
        let value = self
            .node
            .get(&chunk_key(checksum))
            .await?
            .ok_or_else(|| StoreError::Retrieve(format!("no holder for chunk {}", checksum)))?;
        let encoded = value
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| StoreError::Retrieve(format!("malformed chunk value {}", checksum)))?;
        hex::decode(encoded).map_err(|e| StoreError::Retrieve(format!("chunk hex: {}", e)))
    }

    async fn retrieve_verified(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let metadata = self.fetch_metadata(id).await?;

        let fetches = metadata
            .chunks
            .iter()
            .map(|descriptor| self.fetch_chunk(&descriptor.checksum));
        let mut chunks = Vec::with_capacity(metadata.chunks.len());
        for fetched in join_all(fetches).await {
            chunks.push(fetched?);
        }

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
}

#[async_trait]
impl StorageProvider for NetworkProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::Network
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
        let replicas = options.replicas.unwrap_or(self.min_replicas);
        let (payload, compression) = prepare_payload(data, options);
        let chunk_size = options.chunk_size.unwrap_or(self.chunker.chunk_size());
        let pieces = self.chunker.split_with(&payload, chunk_size);

        let writes = pieces.iter().map(|piece| {
            let key = chunk_key(&piece.checksum);
            let value = json!({ "data": hex::encode(&piece.bytes) });
            async move { self.node.put(&key, value).await }
        });
        let mut descriptors = Vec::with_capacity(pieces.len());
        for (piece, outcome) in pieces.iter().zip(join_all(writes).await) {
            let placed = outcome
                .map_err(|e| StoreError::NetworkStore(format!("chunk {}: {}", piece.index, e)))?;
            debug!(chunk = piece.index, placed, "chunk placed in the dht");
            descriptors.push(ChunkDescriptor {
                index: piece.index,
                size: piece.bytes.len() as u64,
                checksum: piece.checksum.clone(),
                location: ChunkLocation {
                    node_id: self.node.id(),
                    storage_type: StorageType::Network,
                    endpoint: self.node.address().to_string(),
                    region: None,
                    availability: 1.0,
                    last_seen: now,
                    health: 1.0,
                },
                // The locator carries the configured replica target; actual
                // placement width is the DHT's STORE fan-out.
                replicas,
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
            storage_type: StorageType::Network,
            replicas,
            encryption_info: None,
            compression_info: compression,
        };
        self.node
            .put(&metadata_key(&id), serde_json::to_value(&metadata)?)
            .await
            .map_err(|e| StoreError::NetworkStore(format!("metadata {}: {}", id, e)))?;
        debug!(id = %id, chunks = metadata.chunks.len(), "placed artifact in the dht");
        Ok(metadata)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.retrieve_verified(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let metadata = match self.fetch_metadata(id).await {
            Ok(metadata) => metadata,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        for descriptor in &metadata.chunks {
            let _ = self.node.delete(&chunk_key(&descriptor.checksum)).await;
        }
        self.node.delete(&metadata_key(id)).await?;
        Ok(true)
    }

    async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
        self.fetch_metadata(id).await
    }

    async fn update_metadata(
        &self,
        id: &str,
        patch: MetadataPatch,
    ) -> Result<ArtifactMetadata, StoreError> {
        let mut metadata = self.fetch_metadata(id).await?;
        patch.apply(&mut metadata);
        if patch.modified.is_none() {
            metadata.modified = now_ms();
        }
        self.node
            .put(&metadata_key(id), serde_json::to_value(&metadata)?)
            .await
            .map_err(|e| StoreError::NetworkStore(format!("metadata {}: {}", id, e)))?;
        Ok(metadata)
    }

    async fn validate_checksum(&self, id: &str) -> Result<bool, StoreError> {
        match self.retrieve_verified(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::ChunkValidation(_)) | Err(StoreError::Retrieve(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_stats(&self) -> Result<ProviderStats, StoreError> {
        // Placement lives in the DHT; only the type marker is local state.
        Ok(ProviderStats {
            storage_type: Some(StorageType::Network),
            ..Default::default()
        })
    }

    async fn cleanup(&self) -> Result<u64, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_dht::{DhtConfig, MemoryNetwork};
    use std::sync::Arc;

    async fn started_node(net: &Arc<MemoryNetwork>, address: &str) -> DhtNode {
        let node = DhtNode::new(DhtConfig::new(address));
        let transport = net.attach(node.id(), address, node.handler()).await;
        node.start(Arc::new(transport)).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_store_retrieve_single_node() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;
        let provider = NetworkProvider::new(node.clone());

        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 255) as u8).collect();
        let options = StoreOptions {
            chunk_size: Some(8192),
            replicas: Some(2),
            ..Default::default()
        };
        let metadata = provider.store(&data, &options).await.unwrap();
        assert_eq!(metadata.replicas, 2);
        assert_eq!(metadata.checksum, sha256_hex(&data));

        assert_eq!(provider.retrieve(&metadata.id).await.unwrap(), data);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_and_chunks_visible_to_peer() {
        let net = MemoryNetwork::new();
        let a = started_node(&net, "a").await;
        let b = started_node(&net, "b").await;
        a.add_peer(b.contact()).await;
        b.add_peer(a.contact()).await;

        let provider_a = NetworkProvider::new(a.clone());
        let data = b"replicated artifact body".repeat(100);
        let metadata = provider_a
            .store(&data, &StoreOptions::default())
            .await
            .unwrap();

        // A second provider over the other node retrieves through the DHT.
        let provider_b = NetworkProvider::new(b.clone());
        assert_eq!(provider_b.retrieve(&metadata.id).await.unwrap(), data);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_metadata() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;
        let provider = NetworkProvider::new(node.clone());

        let metadata = provider
            .store(b"to be deleted", &StoreOptions::default())
            .await
            .unwrap();
        assert!(provider.delete(&metadata.id).await.unwrap());
        assert!(!provider.delete(&metadata.id).await.unwrap());
        assert!(matches!(
            provider.retrieve(&metadata.id).await,
            Err(StoreError::NotFound(_))
        ));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_unknown_artifact() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;
        let provider = NetworkProvider::new(node.clone());
        assert!(matches!(
            provider.retrieve("cafebabe").await,
            Err(StoreError::NotFound(_))
        ));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_checksum_detects_missing_chunk() {
        let net = MemoryNetwork::new();
        let node = started_node(&net, "n1").await;
        let provider = NetworkProvider::new(node.clone());

        let metadata = provider
            .store(&[7u8; 5000], &StoreOptions { chunk_size: Some(1024), ..Default::default() })
            .await
            .unwrap();
        assert!(provider.validate_checksum(&metadata.id).await.unwrap());

        // Drop one chunk value out of the DHT.
        node.delete(&chunk_key(&metadata.chunks[1].checksum))
            .await
            .unwrap();
        assert!(!provider.validate_checksum(&metadata.id).await.unwrap());
        node.stop().await.unwrap();
    }
}
