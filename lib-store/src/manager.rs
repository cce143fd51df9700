//! Storage manager
//!
//! Routes store/retrieve/delete across an ordered provider list per
//! strategy. `hybrid` writes the primary synchronously and replicates to the
//! rest in background tasks; a secondary failure emits `replication-failed`
//! without failing the store. Retrieval takes the first provider whose bytes
//! verify; a provider returning corrupt bytes is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use lib_dht::events::{names, EventBus};
use lib_dht::now_ms;

use crate::errors::StoreError;
use crate::provider::StorageProvider;
use crate::types::{
    artifact_id, ArtifactMetadata, MetadataPatch, ProviderStats, StorageType, StoreOptions,
};

/// Provider-set selection per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    LocalOnly,
    NetworkOnly,
    P2pOnly,
    #[default]
    Hybrid,
}

impl Strategy {
    /// Whether a provider participates under this strategy.
    fn admits(&self, storage_type: StorageType) -> bool {
        match self {
            Strategy::LocalOnly => storage_type == StorageType::Local,
            Strategy::NetworkOnly => storage_type == StorageType::Network,
            Strategy::P2pOnly => storage_type == StorageType::P2p,
            Strategy::Hybrid => true,
        }
    }
}

/// Aggregated manager statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageManagerStats {
    pub stores: u64,
    pub retrieves: u64,
    pub deletes: u64,
    pub replication_failures: u64,
    pub providers: Vec<ProviderStats>,
}

#[derive(Default)]
struct Counters {
    stores: std::sync::atomic::AtomicU64,
    retrieves: std::sync::atomic::AtomicU64,
    deletes: std::sync::atomic::AtomicU64,
    replication_failures: std::sync::atomic::AtomicU64,
}

/// Strategy-routing facade over the configured providers.
pub struct StorageManager {
    providers: Vec<Arc<dyn StorageProvider>>,
    strategy: Strategy,
    metadata_cache: Arc<RwLock<HashMap<String, ArtifactMetadata>>>,
    events: EventBus,
    counters: Arc<Counters>,
}

impl StorageManager {
    /// Build a manager over providers in priority order (first = primary
    /// under `hybrid`).
    pub fn new(providers: Vec<Arc<dyn StorageProvider>>, strategy: Strategy, events: EventBus) -> Self {
        Self {
            providers,
            strategy,
            metadata_cache: Arc::new(RwLock::new(HashMap::new())),
            events,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Providers admitted by a strategy, in configured order.
    fn selected(&self, strategy: Strategy) -> Vec<Arc<dyn StorageProvider>> {
        self.providers
            .iter()
            .filter(|p| strategy.admits(p.storage_type()))
            .cloned()
            .collect()
    }

    /// Store an artifact under the configured strategy.
    pub async fn store(
        &self,
        data: &[u8],
        options: StoreOptions,
    ) -> Result<ArtifactMetadata, StoreError> {
        self.store_with(data, options, self.strategy).await
    }

    /// Store under an explicit strategy override.
    pub async fn store_with(
        &self,
        data: &[u8],
        mut options: StoreOptions,
        strategy: Strategy,
    ) -> Result<ArtifactMetadata, StoreError> {
        let selected = self.selected(strategy);
        let Some((primary, secondaries)) = selected.split_first() else {
            return Err(StoreError::NoProviders);
        };

        // One id across every provider so replicas are addressable.
        if options.id.is_none() {
            options.id = Some(artifact_id(data, now_ms()));
        }

        let metadata = primary.store(data, &options).await?;
        self.metadata_cache
            .write()
            .await
            .insert(metadata.id.clone(), metadata.clone());
        self.counters
            .stores
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.events.emit(
            names::STORED,
            json!({
                "id": metadata.id,
                "size": metadata.size,
                "provider": format!("{:?}", primary.storage_type()),
            }),
        );

        for secondary in secondaries {
            let provider = Arc::clone(secondary);
            let data = data.to_vec();
            let options = options.clone();
            let events = self.events.clone();
            let counters = Arc::clone(&self.counters);
            let id = metadata.id.clone();
            tokio::spawn(async move {
                match provider.store(&data, &options).await {
                    Ok(_) => {
                        events.emit(
                            names::REPLICATED,
                            json!({
                                "id": id,
                                "provider": format!("{:?}", provider.storage_type()),
                            }),
                        );
                    }
                    Err(e) => {
                        counters
                            .replication_failures
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        warn!(id = %id, error = %e, "secondary replication failed");
                        events.emit(
                            names::REPLICATION_FAILED,
                            json!({
                                "id": id,
                                "provider": format!("{:?}", provider.storage_type()),
                                "error": e.to_string(),
                            }),
                        );
                    }
                }
            });
        }

        Ok(metadata)
    }

    /// Retrieve verified bytes from the first provider that can produce
    /// them. Providers whose bytes fail verification are skipped.
    pub async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let selected = self.selected(self.strategy);
        if selected.is_empty() {
            return Err(StoreError::NoProviders);
        }

        for provider in &selected {
            match provider.retrieve(id).await {
                Ok(bytes) => {
                    self.counters
                        .retrieves
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.events.emit(
                        names::RETRIEVED,
                        json!({
                            "id": id,
                            "size": bytes.len(),
                            "provider": format!("{:?}", provider.storage_type()),
                        }),
                    );
                    return Ok(bytes);
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(id = %id, provider = ?provider.storage_type(), "miss, trying next");
                }
                Err(StoreError::ChunkValidation(reason)) => {
                    warn!(id = %id, provider = ?provider.storage_type(), %reason,
                          "provider returned corrupt bytes, trying next");
                }
                Err(e) => {
                    warn!(id = %id, provider = ?provider.storage_type(), error = %e,
                          "provider retrieve failed, trying next");
                }
            }
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Best-effort delete: succeeds when at least one provider removed the
    /// artifact.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let selected = self.selected(self.strategy);
        if selected.is_empty() {
            return Err(StoreError::NoProviders);
        }

        let mut any = false;
        for provider in &selected {
            match provider.delete(id).await {
                Ok(true) => any = true,
                Ok(false) => {}
                Err(e) => {
                    warn!(id = %id, provider = ?provider.storage_type(), error = %e, "delete failed");
                }
            }
        }
        self.metadata_cache.write().await.remove(id);
        if any {
            self.counters
                .deletes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.events.emit(names::DELETED, json!({ "id": id }));
        }
        Ok(any)
    }

    /// Metadata from the cache or the first provider that knows the id.
    pub async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
        if let Some(metadata) = self.metadata_cache.read().await.get(id).cloned() {
            return Ok(metadata);
        }
        for provider in self.selected(self.strategy) {
            match provider.get_metadata(id).await {
                Ok(metadata) => {
                    self.metadata_cache
                        .write()
                        .await
                        .insert(id.to_string(), metadata.clone());
                    return Ok(metadata);
                }
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Apply a metadata patch on every provider holding the artifact.
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: MetadataPatch,
    ) -> Result<ArtifactMetadata, StoreError> {
        let mut updated = None;
        for provider in self.selected(self.strategy) {
            match provider.update_metadata(id, patch.clone()).await {
                Ok(metadata) => updated = Some(metadata),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let metadata = updated.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.metadata_cache
            .write()
            .await
            .insert(id.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Re-validate stored chunks on the first provider holding the id.
    pub async fn validate_checksum(&self, id: &str) -> Result<bool, StoreError> {
        for provider in self.selected(self.strategy) {
            match provider.validate_checksum(id).await {
                Ok(valid) => return Ok(valid),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Run provider cleanups; returns total removed entries.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        for provider in &self.providers {
            removed += provider.cleanup().await?;
        }
        Ok(removed)
    }

    pub async fn get_stats(&self) -> StorageManagerStats {
        use std::sync::atomic::Ordering;
        let mut stats = StorageManagerStats {
            stores: self.counters.stores.load(Ordering::Relaxed),
            retrieves: self.counters.retrieves.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            replication_failures: self.counters.replication_failures.load(Ordering::Relaxed),
            providers: Vec::new(),
        };
        for provider in &self.providers {
            if let Ok(provider_stats) = provider.get_stats().await {
                stats.providers.push(provider_stats);
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvider;
    use crate::types::sha256_hex;
    use async_trait::async_trait;
    use lib_dht::NodeId;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Provider stub that always fails, for replication-failure paths.
    struct FailingProvider {
        storage_type: StorageType,
        hit: AtomicBool,
    }

    #[async_trait]
    impl StorageProvider for FailingProvider {
        fn storage_type(&self) -> StorageType {
            self.storage_type
        }
        async fn store(
            &self,
            _data: &[u8],
            _options: &StoreOptions,
        ) -> Result<ArtifactMetadata, StoreError> {
            self.hit.store(true, Ordering::SeqCst);
            Err(StoreError::NetworkStore("stub down".to_string()))
        }
        async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn get_metadata(&self, id: &str) -> Result<ArtifactMetadata, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn update_metadata(
            &self,
            id: &str,
            _patch: MetadataPatch,
        ) -> Result<ArtifactMetadata, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn validate_checksum(&self, id: &str) -> Result<bool, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn get_stats(&self) -> Result<ProviderStats, StoreError> {
            Ok(ProviderStats::default())
        }
        async fn cleanup(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    async fn local_provider() -> (tempfile::TempDir, Arc<LocalProvider>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            LocalProvider::new(dir.path(), NodeId::random())
                .await
                .unwrap(),
        );
        (dir, provider)
    }

    #[tokio::test]
    async fn test_no_providers_is_config_error() {
        let manager = StorageManager::new(vec![], Strategy::LocalOnly, EventBus::new());
        assert!(matches!(
            manager.store(b"x", StoreOptions::default()).await,
            Err(StoreError::NoProviders)
        ));
        assert!(matches!(
            manager.retrieve("id").await,
            Err(StoreError::NoProviders)
        ));
    }

    #[tokio::test]
    async fn test_strategy_filters_providers() {
        let (_dir, local) = local_provider().await;
        let manager = StorageManager::new(vec![local], Strategy::NetworkOnly, EventBus::new());
        // A local provider does not back the network-only strategy.
        assert!(matches!(
            manager.store(b"x", StoreOptions::default()).await,
            Err(StoreError::NoProviders)
        ));
    }

    #[tokio::test]
    async fn test_local_only_round_trip() {
        let (_dir, local) = local_provider().await;
        let manager = StorageManager::new(vec![local], Strategy::LocalOnly, EventBus::new());

        let data = b"managed artifact".repeat(50);
        let metadata = manager.store(&data, StoreOptions::default()).await.unwrap();
        assert_eq!(metadata.checksum, sha256_hex(&data));
        assert_eq!(manager.retrieve(&metadata.id).await.unwrap(), data);

        let stats = manager.get_stats().await;
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.retrieves, 1);
    }

    #[tokio::test]
    async fn test_hybrid_secondary_failure_does_not_fail_store() {
        let (_dir, local) = local_provider().await;
        let failing = Arc::new(FailingProvider {
            storage_type: StorageType::Network,
            hit: AtomicBool::new(false),
        });
        let events = EventBus::new();
        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let failures2 = failures.clone();
        events.subscribe(
            names::REPLICATION_FAILED,
            Arc::new(move |payload| {
                failures2
                    .lock()
                    .unwrap()
                    .push(payload["error"].as_str().unwrap_or_default().to_string());
            }),
        );

        let manager = StorageManager::new(
            vec![local, failing.clone()],
            Strategy::Hybrid,
            events,
        );
        let metadata = manager
            .store(b"survives secondary failure", StoreOptions::default())
            .await
            .unwrap();

        // Wait for the background replication attempt to land.
        for _ in 0..50 {
            if failing.hit.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(failing.hit.load(Ordering::SeqCst));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(failures.lock().unwrap().len(), 1);

        // Primary copy is intact.
        assert_eq!(
            manager.retrieve(&metadata.id).await.unwrap(),
            b"survives secondary failure"
        );
    }

    #[tokio::test]
    async fn test_delete_requires_any_provider() {
        let (_dir, local) = local_provider().await;
        let manager = StorageManager::new(vec![local], Strategy::Hybrid, EventBus::new());
        let metadata = manager.store(b"doomed", StoreOptions::default()).await.unwrap();
        assert!(manager.delete(&metadata.id).await.unwrap());
        assert!(!manager.delete(&metadata.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_cache_hits_after_store() {
        let (_dir, local) = local_provider().await;
        let manager = StorageManager::new(vec![local], Strategy::Hybrid, EventBus::new());
        let metadata = manager.store(b"cached", StoreOptions::default()).await.unwrap();
        let fetched = manager.get_metadata(&metadata.id).await.unwrap();
        assert_eq!(fetched, metadata);
    }

    #[tokio::test]
    async fn test_retrieve_falls_back_past_corrupt_provider() {
        // Two local providers; the first one's copy gets corrupted on disk.
        let (dir_a, provider_a) = local_provider().await;
        let (_dir_b, provider_b) = local_provider().await;
        let manager = StorageManager::new(
            vec![provider_a, provider_b],
            Strategy::Hybrid,
            EventBus::new(),
        );

        let data = vec![0xC3u8; 8192];
        let metadata = manager
            .store(
                &data,
                StoreOptions {
                    chunk_size: Some(2048),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Wait for the secondary replica to land before corrupting.
        let mut replicated = false;
        for _ in 0..100 {
            if manager.validate_checksum(&metadata.id).await.unwrap_or(false) {
                replicated = true;
            }
            if _dir_b
                .path()
                .join("metadata")
                .join(&metadata.id)
                .exists()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(replicated);

        let victim = dir_a.path().join("chunks").join(&metadata.id).join("1");
        let mut bytes = std::fs::read(&victim).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&victim, bytes).unwrap();

        assert!(!manager.validate_checksum(&metadata.id).await.unwrap());
        assert_eq!(manager.retrieve(&metadata.id).await.unwrap(), data);
    }
}
