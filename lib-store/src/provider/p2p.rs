//! Peer-to-peer provider
//!
//! Keeps a content-addressed local chunk cache and learns which peers hold
//! which chunks from periodic announcements at `p2p:announce:<node_id>`.
//! Retrieval prefers the local cache, then advertised holders in ascending
//! observed latency. Bulk chunk transfer between peers is the transport
//! adapter's concern; the shared `chunk:<checksum>` locator stands in for it
//! here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lib_dht::{now_ms, DhtNode, NodeId};

use crate::chunk::ChunkManager;
use crate::errors::StoreError;
use crate::provider::network::{chunk_key, metadata_key};
use crate::provider::{prepare_payload, restore_payload, StorageProvider};
use crate::types::{
    artifact_id, sha256_hex, ArtifactMetadata, ChunkDescriptor, ChunkLocation, MetadataPatch,
    ProviderStats, StorageType, StoreOptions,
};

/// Default cadence for chunk announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Announcement payload at `p2p:announce:<node_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: NodeId,
    pub chunks: Vec<String>,
    pub ts: u64,
}

/// Key a node announces its cached chunks under.
pub fn announce_key(id: &NodeId) -> String {
    format!("p2p:announce:{}", id.to_hex())
}

pub struct P2pProvider {
    node: DhtNode,
    cache_root: PathBuf,
    chunker: ChunkManager,
    announce_interval: Duration,
    /// checksum -> advertised holders, learned from announcements.
    peer_chunks: Arc<RwLock<HashMap<String, HashSet<NodeId>>>>,
    /// Artifacts stored through this provider: id -> chunk checksums.
    artifacts: Arc<RwLock<HashMap<String, Vec<String>>>>,
    last_announce: Arc<Mutex<Option<Instant>>>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
}

impl P2pProvider {
    pub async fn new(
        node: DhtNode,
        cache_root: impl Into<PathBuf>,
        announce_interval: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let cache_root = cache_root.into();
        tokio::fs::create_dir_all(&cache_root).await?;
        Ok(Arc::new(Self {
            node,
            cache_root,
            chunker: ChunkManager::default(),
            announce_interval,
            peer_chunks: Arc::new(RwLock::new(HashMap::new())),
            artifacts: Arc::new(RwLock::new(HashMap::new())),
            last_announce: Arc::new(Mutex::new(None)),
            announce_task: Mutex::new(None),
        }))
    }

    /// Start the periodic announce/refresh task.
    pub async fn start(self: &Arc<Self>) {
        let provider = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(provider.announce_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = provider.announce().await {
                    warn!(error = %e, "chunk announcement failed");
                }
                provider.refresh_peer_chunks().await;
            }
        });
        *self.announce_task.lock().await = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(task) = self.announce_task.lock().await.take() {
            task.abort();
        }
    }

    fn chunk_path(&self, checksum: &str) -> PathBuf {
        self.cache_root.join(checksum)
    }

    /// Publish the cache inventory. Rate-limited to one announcement per
    /// interval.
    pub async fn announce(&self) -> Result<(), StoreError> {
        {
            let mut last = self.last_announce.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.announce_interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        let chunks = self.cached_checksums().await?;
        let announcement = Announcement {
            node_id: self.node.id(),
            chunks,
            ts: now_ms(),
        };
        self.node
            .put(
                &announce_key(&self.node.id()),
                serde_json::to_value(&announcement)?,
            )
            .await?;
        debug!(chunks = announcement.chunks.len(), "announced cached chunks");
        Ok(())
    }

    /// Ingest the announcements of every known peer.
    pub async fn refresh_peer_chunks(&self) {
        let peers = self.node.peers().await;
        let mut learned: HashMap<String, HashSet<NodeId>> = HashMap::new();
        for peer in peers {
            let Ok(Some(value)) = self.node.get(&announce_key(&peer.id)).await else {
                continue;
            };
            let Ok(announcement) = serde_json::from_value::<Announcement>(value) else {
                continue;
            };
            for checksum in announcement.chunks {
                learned.entry(checksum).or_default().insert(announcement.node_id);
            }
        }
        *self.peer_chunks.write().await = learned;
    }

    /// Advertised holders of a chunk, ascending by observed latency.
    async fn holders_by_latency(&self, checksum: &str) -> Vec<NodeId> {
        let holders: Vec<NodeId> = self
            .peer_chunks
            .read()
            .await
            .get(checksum)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if holders.is_empty() {
            return holders;
        }

        let latency: HashMap<NodeId, u64> = self
            .node
            .peers()
            .await
            .into_iter()
            .map(|p| (p.id, p.metrics.latency_ms))
            .collect();
        let mut sorted = holders;
        sorted.sort_by_key(|id| latency.get(id).copied().unwrap_or(u64::MAX));
        sorted
    }

    async fn cached_checksums(&self) -> Result<Vec<String>, StoreError> {
        let mut checksums = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.cache_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                checksums.push(name.to_string());
            }
        }
        checksums.sort();
        Ok(checksums)
    }

    async fn read_cached_chunk(&self, descriptor: &ChunkDescriptor) -> Option<Vec<u8>> {
        let bytes = tokio::fs::read(self.chunk_path(&descriptor.checksum))
            .await
            .ok()?;
        if sha256_hex(&bytes) == descriptor.checksum {
            Some(bytes)
        } else {
            warn!(chunk = descriptor.index, "cached chunk failed re-hash, discarding");
            let _ = tokio::fs::remove_file(self.chunk_path(&descriptor.checksum)).await;
            None
        }
    }

    /// Fetch one chunk from the mesh: advertised holders first, then the
    /// bare locator.
    async fn fetch_remote_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>, StoreError> {
        let holders = self.holders_by_latency(&descriptor.checksum).await;
        let attempts = holders.len().max(1);
        for attempt in 0..attempts {
            match self.fetch_via_locator(&descriptor.checksum).await {
                Ok(bytes) if sha256_hex(&bytes) == descriptor.checksum => {
                    // Cache verified bytes for future local hits.
                    let _ = tokio::fs::write(self.chunk_path(&descriptor.checksum), &bytes).await;
                    return Ok(bytes);
                }
                Ok(_) => {
                    debug!(chunk = descriptor.index, attempt, "holder returned corrupt bytes");
                }
                Err(e) => {
                    debug!(chunk = descriptor.index, attempt, error = %e, "holder fetch failed");
                }
            }
        }
        Err(StoreError::Retrieve(format!(
            "chunk {} unavailable from {} holder(s)",
            descriptor.checksum,
            holders.len()
        )))
    }

    async fn fetch_via_locator(&self, checksum: &str) -> Result<Vec<u8>, StoreError> {
        let value = self
            .node
            .get(&chunk_key(checksum))
            .await?
            .ok_or_else(|| StoreError::Retrieve(format!("no locator for chunk {}", checksum)))?;
        let encoded = value
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| StoreError::Retrieve(format!("malformed chunk value {}", checksum)))?;
        hex::decode(encoded).map_err(|e| StoreError::Retrieve(format!("chunk hex: {}", e)))
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

    async fn retrieve_verified(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let metadata = self.fetch_metadata(id).await?;
        let mut chunks = Vec::with_capacity(metadata.chunks.len());
        for descriptor in &metadata.chunks {
            let bytes = match self.read_cached_chunk(descriptor).await {
                Some(bytes) => bytes,
                None => self.fetch_remote_chunk(descriptor).await?,
            };
            chunks.push(bytes);
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
impl StorageProvider for P2pProvider {
    fn storage_type(&self) -> StorageType {
        StorageType::P2p
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

        let mut descriptors = Vec::with_capacity(pieces.len());
        let mut checksums = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            tokio::fs::write(self.chunk_path(&piece.checksum), &piece.bytes).await?;
            // Publish the locator so advertised holders are fetchable.
            self.node
                .put(
                    &chunk_key(&piece.checksum),
                    json!({ "data": hex::encode(&piece.bytes) }),
                )
                .await?;
            checksums.push(piece.checksum.clone());
            descriptors.push(ChunkDescriptor {
                index: piece.index,
                size: piece.bytes.len() as u64,
                checksum: piece.checksum.clone(),
                location: ChunkLocation {
                    node_id: self.node.id(),
                    storage_type: StorageType::P2p,
                    endpoint: self.node.address().to_string(),
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
            storage_type: StorageType::P2p,
            replicas: 1,
            encryption_info: None,
            compression_info: compression,
        };
        self.node
            .put(&metadata_key(&id), serde_json::to_value(&metadata)?)
            .await?;
        self.artifacts.write().await.insert(id.clone(), checksums);

        if let Err(e) = self.announce().await {
            warn!(error = %e, "post-store announcement failed");
        }
        Ok(metadata)
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.retrieve_verified(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(checksums) = self.artifacts.write().await.remove(id) else {
            // Not stored through this provider; try the shared metadata.
            return match self.fetch_metadata(id).await {
                Ok(_) => {
                    self.node.delete(&metadata_key(id)).await?;
                    Ok(true)
                }
                Err(StoreError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
        };

        let still_referenced: HashSet<String> = self
            .artifacts
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();
        for checksum in checksums {
            if !still_referenced.contains(&checksum) {
                let _ = tokio::fs::remove_file(self.chunk_path(&checksum)).await;
            }
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
            .await?;
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
        let mut stats = ProviderStats {
            storage_type: Some(StorageType::P2p),
            artifact_count: self.artifacts.read().await.len() as u64,
            ..Default::default()
        };
        let mut entries = tokio::fs::read_dir(&self.cache_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            stats.chunk_count += 1;
            if let Ok(meta) = entry.metadata().await {
                stats.total_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    /// Drop cached chunks no tracked artifact references.
    async fn cleanup(&self) -> Result<u64, StoreError> {
        let referenced: HashSet<String> = self
            .artifacts
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();
        let mut removed = 0u64;
        for checksum in self.cached_checksums().await? {
            if !referenced.contains(&checksum) {
                tokio::fs::remove_file(self.chunk_path(&checksum)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
