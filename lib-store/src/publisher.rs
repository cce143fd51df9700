//! Content publisher
//!
//! Binds artifact-level metadata to its chunk set and advertises it: a
//! `ContentRecord` at `content:<artifact_id>`, discovery indexes under
//! `index:*`, and ordered version lists under `versions:<artifact_id>`.
//! Index keys are idempotent append-with-dedup arrays capped at 1000
//! entries, sorted (score desc, ts desc).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use lib_dht::events::{names, EventBus};
use lib_dht::{now_ms, DhtNode};

use crate::errors::StoreError;
use crate::manager::{StorageManager, Strategy};
use crate::types::{
    sha256_hex, ArtifactMetadata, ContentRecord, ContentStats, ProviderEntry, StoreOptions,
    VersionInfo, PROVIDER_STALE_MS,
};

/// Cap on discovery index arrays.
pub const INDEX_CAP: usize = 1000;

/// Key for the content record of an artifact.
pub fn content_key(id: &str) -> String {
    format!("content:{}", id)
}

/// Key for the version list of an artifact.
pub fn versions_key(id: &str) -> String {
    format!("versions:{}", id)
}

/// One entry in a discovery index array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(default)]
    pub score: f64,
    pub ts: u64,
}

/// Publish-time semantic metadata.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub region: Option<String>,
    pub tags: Vec<String>,
    /// Extra field/value pairs indexed under `index:metadata:<f>:<v>`.
    pub attributes: HashMap<String, String>,
    pub options: StoreOptions,
    /// Override of the manager's configured strategy.
    pub strategy: Option<Strategy>,
}

/// Publishes artifacts into the mesh and resolves them back.
pub struct ContentPublisher {
    node: DhtNode,
    manager: Arc<StorageManager>,
    events: EventBus,
}

impl ContentPublisher {
    pub fn new(node: DhtNode, manager: Arc<StorageManager>, events: EventBus) -> Self {
        Self {
            node,
            manager,
            events,
        }
    }

    /// Publish raw bytes: chunk, place, record, index.
    pub async fn publish(
        &self,
        data: &[u8],
        request: PublishRequest,
    ) -> Result<ContentRecord, StoreError> {
        let strategy = request.strategy.unwrap_or(self.manager.strategy());
        let metadata = self
            .manager
            .store_with(data, request.options.clone(), strategy)
            .await?;
        let id = metadata.id.clone();

        let mut record = ContentRecord {
            stats: ContentStats {
                total_downloads: 0,
                active_providers: 0,
                total_size: metadata.size,
                reliability: 1.0,
            },
            providers: Vec::new(),
            metadata,
        };
        record.upsert_provider(ProviderEntry {
            node_id: self.node.id(),
            endpoint: self.node.address().to_string(),
            last_seen: now_ms(),
        });
        self.node
            .put(&content_key(&id), serde_json::to_value(&record)?)
            .await?;

        if let Some(content_type) = &request.content_type {
            // Type index is a direct id entry, one key per (type, id).
            self.node
                .put(&format!("index:type:{}:{}", content_type, id), json!(id))
                .await?;
        }
        for tag in &request.tags {
            self.append_index(&format!("index:tag:{}", tag), &id).await?;
        }
        if let Some(region) = &request.region {
            self.append_index(&format!("index:region:{}", region), &id)
                .await?;
        }
        for (field, value) in &request.attributes {
            self.append_index(&format!("index:metadata:{}:{}", field, value), &id)
                .await?;
        }

        debug!(id = %id, size = record.metadata.size, "content published");
        self.events.emit(
            names::CONTENT_PUBLISHED,
            json!({
                "id": id,
                "size": record.metadata.size,
                "name": request.name,
            }),
        );
        Ok(record)
    }

    /// Resolve an artifact id back to verified bytes and its metadata.
    pub async fn retrieve(&self, id: &str) -> Result<(Vec<u8>, ArtifactMetadata), StoreError> {
        let metadata = match self.content_record(id).await {
            Ok(record) => record.metadata,
            Err(StoreError::NotFound(_)) => self.manager.get_metadata(id).await?,
            Err(e) => return Err(e),
        };

        let bytes = self.manager.retrieve(id).await?;
        // Providers verify the stored representation; re-check the
        // caller-visible bytes when no compression transformed them.
        if metadata.compression_info.is_none() && sha256_hex(&bytes) != metadata.checksum {
            return Err(StoreError::ChunkValidation(format!(
                "artifact {} failed end-to-end verification",
                id
            )));
        }

        if let Err(e) = self.record_download(id).await {
            warn!(id = %id, error = %e, "download stat update failed");
        }
        Ok((bytes, metadata))
    }

    /// The content record at `content:<id>`.
    pub async fn content_record(&self, id: &str) -> Result<ContentRecord, StoreError> {
        let value = self
            .node
            .get(&content_key(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| StoreError::InvalidMetadata(format!("content record {}: {}", id, e)))
    }

    /// Re-advertise the local node as a provider and prune stale entries.
    pub async fn announce_provider(&self, id: &str) -> Result<ContentRecord, StoreError> {
        let mut record = self.content_record(id).await?;
        let now = now_ms();
        record.upsert_provider(ProviderEntry {
            node_id: self.node.id(),
            endpoint: self.node.address().to_string(),
            last_seen: now,
        });
        record.prune_stale_providers(now, PROVIDER_STALE_MS);
        self.node
            .put(&content_key(id), serde_json::to_value(&record)?)
            .await?;
        Ok(record)
    }

    /// Append a version to the ordered list at `versions:<artifact_id>`.
    pub async fn publish_version(
        &self,
        artifact_id: &str,
        version: &str,
        notes: Option<String>,
    ) -> Result<VersionInfo, StoreError> {
        if version.is_empty()
            || !version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
        {
            return Err(StoreError::InvalidVersion(version.to_string()));
        }

        let mut versions = self.list_versions(artifact_id).await?;
        if versions.iter().any(|v| v.version == version) {
            return Err(StoreError::VersionExists(version.to_string()));
        }

        let info = VersionInfo {
            version: version.to_string(),
            artifact_id: artifact_id.to_string(),
            created: now_ms(),
            notes,
        };
        versions.push(info.clone());
        self.node
            .put(&versions_key(artifact_id), serde_json::to_value(&versions)?)
            .await?;
        self.events.emit(
            names::VERSION_CREATED,
            json!({ "id": artifact_id, "version": version }),
        );
        Ok(info)
    }

    /// Ordered version list for an artifact (empty when none published).
    pub async fn list_versions(&self, artifact_id: &str) -> Result<Vec<VersionInfo>, StoreError> {
        match self.node.get(&versions_key(artifact_id)).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                StoreError::InvalidMetadata(format!("versions {}: {}", artifact_id, e))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Entries of a discovery index key.
    pub async fn index_entries(&self, key: &str) -> Result<Vec<IndexEntry>, StoreError> {
        match self.node.get(key).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Idempotent append into a capped, sorted index array.
    async fn append_index(&self, key: &str, id: &str) -> Result<(), StoreError> {
        let mut entries = self.index_entries(key).await?;
        entries.retain(|e| e.id != id);
        entries.push(IndexEntry {
            id: id.to_string(),
            score: 0.0,
            ts: now_ms(),
        });
        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.ts.cmp(&a.ts))
        });
        entries.truncate(INDEX_CAP);
        self.node
            .put(key, serde_json::to_value(&entries)?)
            .await?;
        Ok(())
    }

    async fn record_download(&self, id: &str) -> Result<(), StoreError> {
        let mut record = match self.content_record(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        record.stats.total_downloads += 1;
        self.node
            .put(&content_key(id), serde_json::to_value(&record)?)
            .await?;
        Ok(())
    }
}
