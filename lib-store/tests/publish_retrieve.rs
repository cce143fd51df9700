//! End-to-end publish/retrieve scenarios across providers and strategies.

use std::sync::Arc;
use std::time::Duration;

use lib_dht::{DhtConfig, DhtNode, EventBus, MemoryNetwork};
use lib_store::{
    sha256_hex, ContentPublisher, LocalProvider, NetworkProvider, P2pProvider, PublishRequest,
    StorageManager, StorageProvider, StoreError, StoreOptions, Strategy, DEFAULT_CHUNK_SIZE,
};

async fn started_node(net: &Arc<MemoryNetwork>, address: &str) -> DhtNode {
    let node = DhtNode::new(DhtConfig::new(address));
    let transport = net.attach(node.id(), address, node.handler()).await;
    node.start(Arc::new(transport)).await.unwrap();
    node
}

/// A full provider stack over one node: local disk, network, p2p cache.
async fn full_stack(
    node: &DhtNode,
) -> (tempfile::TempDir, tempfile::TempDir, Vec<Arc<dyn StorageProvider>>) {
    let local_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let local = Arc::new(
        LocalProvider::new(local_dir.path(), node.id())
            .await
            .unwrap(),
    );
    let network = Arc::new(NetworkProvider::new(node.clone()));
    let p2p = P2pProvider::new(node.clone(), cache_dir.path(), Duration::from_millis(50))
        .await
        .unwrap();
    (
        local_dir,
        cache_dir,
        vec![local, network, p2p as Arc<dyn StorageProvider>],
    )
}

#[tokio::test]
async fn test_single_node_publish_retrieve_exact_chunk_shape() {
    let net = MemoryNetwork::new();
    let node = started_node(&net, "solo").await;
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalProvider::new(dir.path(), node.id()).await.unwrap());
    let events = EventBus::new();
    let manager = Arc::new(StorageManager::new(
        vec![local],
        Strategy::LocalOnly,
        events.clone(),
    ));
    let publisher = ContentPublisher::new(node.clone(), manager, events);

    // 11-byte marker repeated 400,000 times: 4.4 MB.
    let data = b"hello world".repeat(400_000);
    assert_eq!(data.len(), 4_400_000);

    let record = publisher
        .publish(&data, PublishRequest::default())
        .await
        .unwrap();
    let metadata = &record.metadata;

    assert_eq!(metadata.size, 4_400_000);
    assert_eq!(metadata.checksum, sha256_hex(&data));
    assert_eq!(metadata.chunks.len(), 5);
    for chunk in &metadata.chunks[..4] {
        assert_eq!(chunk.size as usize, DEFAULT_CHUNK_SIZE);
    }
    assert_eq!(
        metadata.chunks[4].size as usize,
        4_400_000 - 4 * DEFAULT_CHUNK_SIZE
    );

    let (bytes, _) = publisher.retrieve(&metadata.id).await.unwrap();
    assert_eq!(bytes, data);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_round_trip_across_every_strategy() {
    let net = MemoryNetwork::new();
    let a = started_node(&net, "a").await;
    let b = started_node(&net, "b").await;
    a.add_peer(b.contact()).await;
    b.add_peer(a.contact()).await;

    let (_local_dir, _cache_dir, providers) = full_stack(&a).await;
    let manager = StorageManager::new(providers, Strategy::Hybrid, EventBus::new());

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    for strategy in [
        Strategy::LocalOnly,
        Strategy::NetworkOnly,
        Strategy::P2pOnly,
        Strategy::Hybrid,
    ] {
        let options = StoreOptions {
            chunk_size: Some(16 * 1024),
            ..Default::default()
        };
        let metadata = manager.store_with(&data, options, strategy).await.unwrap();
        let retrieved = manager.retrieve(&metadata.id).await.unwrap();
        assert_eq!(retrieved, data, "strategy {:?} lost bytes", strategy);
    }

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_node_replication_survives_origin_teardown() {
    let net = MemoryNetwork::new();
    let a = started_node(&net, "origin").await;
    let b = started_node(&net, "replica").await;
    a.add_peer(b.contact()).await;
    b.add_peer(a.contact()).await;

    // 3 MiB body published from A with two replicas requested.
    let data: Vec<u8> = (0..(3 * 1024 * 1024u32)).map(|i| (i % 241) as u8).collect();
    let provider_a = NetworkProvider::new(a.clone());
    let metadata = provider_a
        .store(
            &data,
            &StoreOptions {
                replicas: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(metadata.replicas, 2);
    assert_eq!(metadata.chunks.len(), 3);

    // A holds everything it placed.
    assert_eq!(provider_a.retrieve(&metadata.id).await.unwrap(), data);

    // Tear down the origin; the replica set must still serve the artifact.
    a.stop().await.unwrap();

    let provider_b = NetworkProvider::new(b.clone());
    let recovered = provider_b.retrieve(&metadata.id).await.unwrap();
    assert_eq!(recovered, data);
    assert_eq!(sha256_hex(&recovered), metadata.checksum);

    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_tampered_local_copy_rescued_by_network_provider() {
    let net = MemoryNetwork::new();
    let node = started_node(&net, "n1").await;

    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalProvider::new(dir.path(), node.id()).await.unwrap());
    let network = Arc::new(NetworkProvider::new(node.clone()));
    let manager = StorageManager::new(
        vec![local.clone(), network],
        Strategy::Hybrid,
        EventBus::new(),
    );

    let data = vec![0x42u8; 64 * 1024];
    let options = StoreOptions {
        chunk_size: Some(8 * 1024),
        ..Default::default()
    };
    let metadata = manager.store(&data, options).await.unwrap();

    // Wait for the background network replica before corrupting the primary.
    let mut replica_ready = false;
    for _ in 0..100 {
        if node
            .get(&format!("metadata:{}", metadata.id))
            .await
            .unwrap()
            .is_some()
        {
            replica_ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(replica_ready);

    // Corrupt one chunk of the local copy on disk.
    let victim = dir.path().join("chunks").join(&metadata.id).join("3");
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[100] ^= 0xFF;
    std::fs::write(&victim, bytes).unwrap();

    assert!(!local.validate_checksum(&metadata.id).await.unwrap());
    assert!(matches!(
        local.retrieve(&metadata.id).await,
        Err(StoreError::ChunkValidation(_))
    ));

    // The manager skips the corrupt provider and serves verified bytes.
    assert_eq!(manager.retrieve(&metadata.id).await.unwrap(), data);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_delete_is_best_effort_across_providers() {
    let net = MemoryNetwork::new();
    let node = started_node(&net, "n1").await;
    let (_local_dir, _cache_dir, providers) = full_stack(&node).await;
    let manager = StorageManager::new(providers, Strategy::Hybrid, EventBus::new());

    let metadata = manager
        .store(b"ephemeral artifact", StoreOptions::default())
        .await
        .unwrap();
    // Let the secondary replications land so delete has replicas to chase.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(manager.delete(&metadata.id).await.unwrap());
    assert!(matches!(
        manager.retrieve(&metadata.id).await,
        Err(StoreError::NotFound(_))
    ));

    node.stop().await.unwrap();
}
