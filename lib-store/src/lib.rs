//! Artifact Mesh Storage
//!
//! Content-addressed chunked storage over the DHT: deterministic splitting
//! with per-chunk SHA-256, pluggable placement providers (local disk,
//! DHT-backed network, peer-to-peer cache), strategy-routed replication
//! across them, and artifact/content records persisted through the DHT key
//! namespace. Every retrieval path re-verifies checksums before bytes reach
//! the caller.

pub mod chunk;
pub mod errors;
pub mod manager;
pub mod provider;
pub mod publisher;
pub mod types;

pub use chunk::{ChunkManager, ChunkPiece};
pub use errors::StoreError;
pub use manager::{StorageManager, StorageManagerStats, Strategy};
pub use provider::{LocalProvider, NetworkProvider, P2pProvider, StorageProvider};
pub use publisher::{ContentPublisher, IndexEntry, PublishRequest, INDEX_CAP};
pub use types::{
    artifact_id, sha256_hex, ArtifactMetadata, ChunkDescriptor, ChunkLocation, CompressionInfo,
    ContentRecord, ContentStats, EncryptionInfo, MetadataPatch, ProviderEntry, ProviderStats,
    StorageType, StoreOptions, VersionInfo, DEFAULT_CHUNK_SIZE, DEFAULT_MIN_REPLICAS,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lib_dht::{
    DhtConfig, DhtNode, DhtNodeStats, EventBus, EventHandler, Peer, Transport,
};

use crate::provider::p2p::DEFAULT_ANNOUNCE_INTERVAL;

/// Configuration for a full artifact mesh node.
#[derive(Clone)]
pub struct MeshConfig {
    pub dht: DhtConfig,
    pub strategy: Strategy,
    /// Root for the local-disk provider; omit to run without one.
    pub local_root: Option<PathBuf>,
    /// Cache root for the peer-to-peer provider; omit to run without one.
    pub p2p_cache_root: Option<PathBuf>,
    pub announce_interval: Duration,
}

impl MeshConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            dht: DhtConfig::new(address),
            strategy: Strategy::Hybrid,
            local_root: None,
            p2p_cache_root: None,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }
}

/// Aggregated mesh statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MeshStats {
    pub dht: DhtNodeStats,
    pub storage: StorageManagerStats,
}

/// One artifact mesh node: a DHT node plus the provider stack, the storage
/// manager and the content publisher wired over a shared event bus.
pub struct ArtifactStore {
    node: DhtNode,
    manager: Arc<StorageManager>,
    publisher: ContentPublisher,
    p2p: Option<Arc<P2pProvider>>,
}

impl ArtifactStore {
    /// Build the provider stack described by the configuration.
    pub async fn new(config: MeshConfig) -> Result<Self, StoreError> {
        let node = DhtNode::new(config.dht.clone());
        let events = node.events().clone();

        let mut providers: Vec<Arc<dyn StorageProvider>> = Vec::new();
        if let Some(root) = &config.local_root {
            providers.push(Arc::new(LocalProvider::new(root.clone(), node.id()).await?));
        }
        providers.push(Arc::new(NetworkProvider::new(node.clone())));
        let p2p = match &config.p2p_cache_root {
            Some(root) => {
                let provider =
                    P2pProvider::new(node.clone(), root.clone(), config.announce_interval).await?;
                providers.push(provider.clone() as Arc<dyn StorageProvider>);
                Some(provider)
            }
            None => None,
        };

        let manager = Arc::new(StorageManager::new(
            providers,
            config.strategy,
            events.clone(),
        ));
        let publisher = ContentPublisher::new(node.clone(), Arc::clone(&manager), events);

        Ok(Self {
            node,
            manager,
            publisher,
            p2p,
        })
    }

    /// Bind to a transport and start the node plus background tasks.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<(), StoreError> {
        self.node.start(transport).await?;
        if let Some(p2p) = &self.p2p {
            p2p.start().await;
        }
        Ok(())
    }

    /// Graceful shutdown: announcements stop, the node drains and the
    /// transport closes.
    pub async fn stop(&self) -> Result<(), StoreError> {
        if let Some(p2p) = &self.p2p {
            p2p.stop().await;
        }
        self.node.stop().await?;
        Ok(())
    }

    pub fn node(&self) -> &DhtNode {
        &self.node
    }

    pub fn manager(&self) -> &Arc<StorageManager> {
        &self.manager
    }

    pub fn publisher(&self) -> &ContentPublisher {
        &self.publisher
    }

    pub fn events(&self) -> &EventBus {
        self.node.events()
    }

    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        self.node.subscribe(event, handler);
    }

    /// Lifecycle guard for the caller-facing surface.
    fn ensure_running(&self) -> Result<(), StoreError> {
        if self.node.is_running() {
            Ok(())
        } else {
            Err(StoreError::NotRunning)
        }
    }

    /// Store a raw value in the DHT overlay.
    pub async fn put(&self, key: &str, value: serde_json::Value) -> Result<usize, StoreError> {
        self.ensure_running()?;
        Ok(self.node.put(key, value).await?)
    }

    /// Fetch a raw value from the DHT overlay.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.ensure_running()?;
        Ok(self.node.get(key).await?)
    }

    /// Delete a raw value from the DHT overlay.
    pub async fn delete(&self, key: &str) -> Result<usize, StoreError> {
        self.ensure_running()?;
        Ok(self.node.delete(key).await?)
    }

    /// The k closest known peers to a logical key.
    pub async fn find_closest(&self, key: &str) -> Vec<Peer> {
        self.node.find_closest(key).await
    }

    /// Publish an artifact; returns its content id.
    pub async fn publish_content(
        &self,
        data: &[u8],
        request: PublishRequest,
    ) -> Result<String, StoreError> {
        self.ensure_running()?;
        let record = self.publisher.publish(data, request).await?;
        Ok(record.metadata.id)
    }

    /// Resolve a content id to verified bytes and metadata.
    pub async fn retrieve_content(
        &self,
        id: &str,
    ) -> Result<(Vec<u8>, ArtifactMetadata), StoreError> {
        self.ensure_running()?;
        self.publisher.retrieve(id).await
    }

    pub async fn get_stats(&self) -> MeshStats {
        MeshStats {
            dht: self.node.stats().await,
            storage: self.manager.get_stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_dht::MemoryNetwork;
    use serde_json::json;

    async fn started_store(
        net: &std::sync::Arc<MemoryNetwork>,
        address: &str,
        dir: &tempfile::TempDir,
    ) -> ArtifactStore {
        let mut config = MeshConfig::new(address);
        config.local_root = Some(dir.path().join("local"));
        config.p2p_cache_root = Some(dir.path().join("p2p"));
        let store = ArtifactStore::new(config).await.unwrap();
        let transport = net
            .attach(store.node().id(), address, store.node().handler())
            .await;
        store.start(Arc::new(transport)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_mesh_publish_retrieve() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&net, "mesh-1", &dir).await;

        let data = b"mesh facade artifact".repeat(300);
        let id = store
            .publish_content(&data, PublishRequest::default())
            .await
            .unwrap();
        let (bytes, metadata) = store.retrieve_content(&id).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(metadata.checksum, sha256_hex(&data));

        let stats = store.get_stats().await;
        assert_eq!(stats.storage.stores, 1);
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_kv_overlay() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&net, "mesh-kv", &dir).await;

        store.put("registry:alpha", json!({"v": 1})).await.unwrap();
        assert_eq!(
            store.get("registry:alpha").await.unwrap(),
            Some(json!({"v": 1}))
        );
        store.delete("registry:alpha").await.unwrap();
        assert_eq!(store.get("registry:alpha").await.unwrap(), None);
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_rejects_use_after_stop() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let store = started_store(&net, "mesh-stopped", &dir).await;
        store.stop().await.unwrap();

        assert!(matches!(
            store
                .publish_content(b"late", PublishRequest::default())
                .await,
            Err(StoreError::NotRunning)
        ));
        assert!(matches!(
            store.retrieve_content("any-id").await,
            Err(StoreError::NotRunning)
        ));
        assert!(matches!(
            store.put("k", json!(1)).await,
            Err(StoreError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_mesh_two_nodes_share_content() {
        let net = MemoryNetwork::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = started_store(&net, "mesh-a", &dir_a).await;
        let b = started_store(&net, "mesh-b", &dir_b).await;
        a.node().add_peer(b.node().contact()).await;
        b.node().add_peer(a.node().contact()).await;

        let data = b"shared across the mesh".repeat(200);
        let id = a
            .publish_content(&data, PublishRequest::default())
            .await
            .unwrap();

        // Give the hybrid secondaries a moment to replicate.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let (bytes, _) = b.retrieve_content(&id).await.unwrap();
        assert_eq!(bytes, data);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
