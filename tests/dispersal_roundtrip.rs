//! End-to-end dispersal and recovery over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use defs::{
    AclAuthorizer, AllowAll, Authorizer, ConnectionConfig, EngineError, MemorySegmentStore, Mode,
    Node, NodeConfig, NodeError, NodeId, ParityPlan, SegmentService, SegmentStore,
};

struct StoragePeer {
    id: NodeId,
    addr: SocketAddr,
    store: Arc<MemorySegmentStore>,
    _service: SegmentService,
}

async fn spawn_storage<A: Authorizer>(authorizer: Arc<A>) -> StoragePeer {
    let store = Arc::new(MemorySegmentStore::new());
    let service = SegmentService::bind(
        "127.0.0.1:0".parse().expect("static addr"),
        Arc::clone(&store),
        authorizer,
        ConnectionConfig::default(),
    )
    .await
    .expect("bind storage service");

    let mut key = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut key[..]);
    StoragePeer {
        id: NodeId::from_public_key(&key),
        addr: service.local_addr(),
        store,
        _service: service,
    }
}

/// Three-byte segments so a ten-byte file becomes four data segments,
/// plus two parity segments.
fn tiny_segment_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.upload.segment_size = 3;
    config.upload.parity = ParityPlan::Count(2);
    config
}

async fn cluster(count: usize) -> (Node, Vec<StoragePeer>) {
    let mut peers = Vec::new();
    for _ in 0..count {
        peers.push(spawn_storage(Arc::new(AllowAll)).await);
    }
    let client = Node::start(tiny_segment_config()).await.expect("start node");
    for peer in &peers {
        client
            .add_peer(peer.id, peer.addr, Mode::Server)
            .expect("table add");
    }
    (client, peers)
}

#[tokio::test]
async fn disperse_then_recover_with_two_segments_lost() {
    let (client, peers) = cluster(6).await;

    let manifest = client
        .upload("up-1", "file-1", b"abcdefghij", Bytes::new(), Bytes::new())
        .await
        .expect("dispersal succeeds");
    assert_eq!(manifest.data_segments, 4);
    assert_eq!(manifest.total_segments(), 6);
    assert!(
        !client.pool().contains("up-1"),
        "completed task is purged from the pool"
    );

    // Every segment landed somewhere.
    let stored: usize = peers.iter().map(|peer| peer.store.len()).sum();
    assert!(stored >= 6);

    // Lose the segments at indices 1 and 4 from every holder.
    for index in [1usize, 4] {
        let gone = &manifest.segments[index].segment_id;
        for peer in &peers {
            peer.store.remove("file-1", gone).expect("remove");
        }
    }

    let recovered = client
        .download("down-1", &manifest, Bytes::new())
        .await
        .expect("recovery succeeds from any four segments");
    assert_eq!(&recovered[..], b"abcdefghij");
    assert!(!client.pool().contains("down-1"));
}

#[tokio::test]
async fn download_fails_below_the_recovery_threshold() {
    let (client, peers) = cluster(3).await;

    let manifest = client
        .upload("up-2", "file-2", b"abcdefghij", Bytes::new(), Bytes::new())
        .await
        .expect("dispersal succeeds");

    // Lose three of six segments: only three distinct segments remain,
    // one short of the threshold.
    for index in [0usize, 1, 2] {
        let gone = &manifest.segments[index].segment_id;
        for peer in &peers {
            peer.store.remove("file-2", gone).expect("remove");
        }
    }

    let error = client
        .download("down-2", &manifest, Bytes::new())
        .await
        .expect_err("three segments cannot rebuild four");
    assert!(matches!(
        error,
        NodeError::Engine(EngineError::DownloadIncomplete {
            recovered: 3,
            required: 4
        })
    ));
}

#[tokio::test]
async fn pubkey_hash_gates_segment_requests() {
    let acl = Arc::new(AclAuthorizer::new());
    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(spawn_storage(Arc::clone(&acl)).await);
    }
    let client = Node::start(tiny_segment_config()).await.expect("start node");
    for peer in &peers {
        client
            .add_peer(peer.id, peer.addr, Mode::Server)
            .expect("table add");
    }

    let manifest = client
        .upload("up-3", "file-acl", b"secret payload", Bytes::new(), Bytes::new())
        .await
        .expect("dispersal succeeds");

    // An unknown key is refused by every holder.
    let denied = client
        .download("down-3", &manifest, Bytes::from_static(b"mallory"))
        .await
        .expect_err("no grant, no bytes");
    assert!(matches!(denied, NodeError::Engine(_)));

    // Granting the key makes the same request succeed.
    acl.grant("file-acl", b"alice");
    let recovered = client
        .download("down-4", &manifest, Bytes::from_static(b"alice"))
        .await
        .expect("granted key recovers the file");
    assert_eq!(&recovered[..], b"secret payload");
}

#[tokio::test]
async fn upload_without_peers_reports_every_segment_unplaced() {
    let client = Node::start(tiny_segment_config()).await.expect("start node");

    let error = client
        .upload("up-4", "file-4", b"abcdefghij", Bytes::new(), Bytes::new())
        .await
        .expect_err("nowhere to place segments");
    assert!(matches!(
        error,
        NodeError::Engine(EngineError::UploadIncomplete {
            failed: 6,
            total: 6
        })
    ));
}

#[tokio::test]
async fn duplicate_task_ids_are_rejected() {
    let (client, _peers) = cluster(4).await;

    client
        .upload("task-dup", "file-5", b"abcdefghij", Bytes::new(), Bytes::new())
        .await
        .expect("first upload");

    // The completed task was purged, so the id is reusable; an id still
    // in the pool is not. Register a download to occupy the id.
    client
        .pool()
        .add_download("held-id", "file-5", Vec::new(), 0)
        .expect("registers");
    let error = client
        .upload("held-id", "file-6", b"abcdefghij", Bytes::new(), Bytes::new())
        .await
        .expect_err("id is taken");
    assert!(matches!(
        error,
        NodeError::Engine(EngineError::Pool(pool::PoolError::DuplicateTask(_)))
    ));
}
