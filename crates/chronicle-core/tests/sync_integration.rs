//! Full-pipeline sync tests
//!
//! Drive the coordinator end to end over the gossip and peer transports:
//! durable store on each device, records crossing the transport sealed,
//! both sides converging on the same history.

use std::sync::Arc;
use std::time::Duration;

use chronicle_core::{
    DeviceRecord, EncryptedChannelStore, GossipMesh, GossipStore, GossipTransport, HistoryRecord,
    LocalIndexedStore, MemorySignaling, PeerSyncTransport, PeerTransport, RecordCrypto,
    RecordStore, StaticDeviceProbe, SyncCoordinator, SyncOutcome, SyncStatus,
};
use tempfile::TempDir;

fn crypto() -> Arc<RecordCrypto> {
    Arc::new(RecordCrypto::derive("shared secret", "records").unwrap())
}

fn local_store(temp: &TempDir, name: &str) -> Arc<LocalIndexedStore> {
    Arc::new(LocalIndexedStore::open(temp.path().join(name), crypto()).unwrap())
}

fn probe(id: &str) -> Arc<StaticDeviceProbe> {
    Arc::new(StaticDeviceProbe::new(DeviceRecord::new(
        id,
        "linux",
        "chronicle",
        "0.1.0",
    )))
}

/// Wait until the replica holds a record, or fail.
async fn wait_for_record(store: &GossipStore, visit_id: &str) {
    for _ in 0..200 {
        if store.get_record(visit_id).await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("record {} never replicated", visit_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_devices_sync_through_gossip_replicas() {
    let temp = TempDir::new().unwrap();
    let mesh = GossipMesh::new();

    // Device A: durable store + replica + coordinator
    let store_a = local_store(&temp, "a.redb");
    let replica_a = Arc::new(GossipStore::join(&mesh, crypto()));
    let coordinator_a = SyncCoordinator::new(
        store_a.clone(),
        Arc::new(GossipTransport::new(replica_a.clone())),
        probe("device-a"),
    );

    // Device B likewise
    let store_b = local_store(&temp, "b.redb");
    let replica_b = Arc::new(GossipStore::join(&mesh, crypto()));
    let coordinator_b = SyncCoordinator::new(
        store_b.clone(),
        Arc::new(GossipTransport::new(replica_b.clone())),
        probe("device-b"),
    );

    // A records a visit and syncs
    let mut record = HistoryRecord::new("https://example.com", "Example", "device-a");
    record.visit_id = "1".to_string();
    store_a.upsert_record(record).await.unwrap();

    let outcome = coordinator_a.run_cycle(false).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    assert!(store_a.get_unsynced().await.unwrap().is_empty());

    // The push replicates through the mesh to B's replica
    wait_for_record(&replica_b, "1").await;

    // B has nothing to push, so it forces a pull cycle
    let outcome = coordinator_b.run_cycle(true).await.unwrap();
    match outcome {
        SyncOutcome::Completed(stats) => assert!(stats.received >= 1),
        other => panic!("Expected Completed, got {:?}", other),
    }

    let on_b = store_b.get_record("1").await.unwrap().unwrap();
    assert_eq!(on_b.url, "https://example.com");
    assert_eq!(on_b.sync_status, SyncStatus::Synced);

    // B also learned about device A through the exchange
    let devices: Vec<String> = store_b
        .list_devices()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.device_id)
        .collect();
    assert!(devices.contains(&"device-a".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deletion_syncs_through_gossip() {
    let temp = TempDir::new().unwrap();
    let mesh = GossipMesh::new();

    let store_a = local_store(&temp, "a.redb");
    let replica_a = Arc::new(GossipStore::join(&mesh, crypto()));
    let coordinator_a = SyncCoordinator::new(
        store_a.clone(),
        Arc::new(GossipTransport::new(replica_a)),
        probe("device-a"),
    );

    let store_b = local_store(&temp, "b.redb");
    let replica_b = Arc::new(GossipStore::join(&mesh, crypto()));
    let coordinator_b = SyncCoordinator::new(
        store_b.clone(),
        Arc::new(GossipTransport::new(replica_b.clone())),
        probe("device-b"),
    );

    // Seed both devices with the record
    let mut record = HistoryRecord::new("https://example.com", "Example", "device-a");
    record.visit_id = "1".to_string();
    store_a.upsert_record(record).await.unwrap();
    coordinator_a.run_cycle(false).await.unwrap();
    wait_for_record(&replica_b, "1").await;
    coordinator_b.run_cycle(true).await.unwrap();
    assert!(!store_b.get_record("1").await.unwrap().unwrap().deleted);

    // A tombstones the record; the deletion flows the same path
    store_a.soft_delete("1").await.unwrap();
    coordinator_a.run_cycle(false).await.unwrap();

    let mut deleted_on_b = false;
    for _ in 0..200 {
        coordinator_b.run_cycle(true).await.unwrap();
        if store_b.get_record("1").await.unwrap().unwrap().deleted {
            deleted_on_b = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(deleted_on_b, "tombstone should reach device B");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_devices_sync_over_peer_channel() {
    let temp = TempDir::new().unwrap();

    // Device A: durable store, peer transport, coordinator
    let store_a = local_store(&temp, "a.redb");
    let transport_a = Arc::new(PeerTransport::new("device-a", "shared secret").unwrap());
    transport_a.attach_store(store_a.clone());

    // Device B: channel-store-only device (no durable backend)
    let transport_b = Arc::new(PeerTransport::new("device-b", "shared secret").unwrap());
    let store_b = Arc::new(EncryptedChannelStore::new(transport_b.clone()));
    transport_b.attach_store(store_b.clone());

    // Manual out-of-band signaling
    let (sig_a, sig_b) = MemorySignaling::pair();
    let offer = transport_a.connect_to_peer("device-b", &sig_a).await.unwrap();
    let answer = transport_b
        .accept_offer("device-a", offer, &sig_b)
        .await
        .unwrap();
    transport_a
        .complete_connection("device-b", answer, &sig_a)
        .await
        .unwrap();

    // B already holds a record A has never seen
    let mut on_b = HistoryRecord::new("https://b.example", "Only on B", "device-b");
    on_b.visit_id = "b-1".to_string();
    on_b.last_modified = 500;
    store_b.upsert_record(on_b).await.unwrap();

    // A records a visit and runs a cycle over the peer transport
    let mut on_a = HistoryRecord::new("https://a.example", "Only on A", "device-a");
    on_a.visit_id = "a-1".to_string();
    store_a.upsert_record(on_a).await.unwrap();

    let coordinator_a = SyncCoordinator::new(
        store_a.clone(),
        Arc::new(PeerSyncTransport::new(transport_a.clone())),
        probe("device-a"),
    );
    let outcome = coordinator_a.run_cycle(false).await.unwrap();

    match outcome {
        SyncOutcome::Completed(stats) => {
            assert_eq!(stats.sent, 1);
            assert!(stats.received >= 1, "B's record should come back");
        }
        other => panic!("Expected Completed, got {:?}", other),
    }

    // A merged B's record
    let merged = store_a.get_record("b-1").await.unwrap().unwrap();
    assert_eq!(merged.title, "Only on B");
    assert_eq!(merged.sync_status, SyncStatus::Synced);

    // And A's push reached B's cache
    let mut arrived = false;
    for _ in 0..200 {
        if store_b.get_record("a-1").await.unwrap().is_some() {
            arrived = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(arrived, "A's record should land on B");
}

#[tokio::test]
async fn test_cycle_against_dead_transport_retries_cleanly() {
    let temp = TempDir::new().unwrap();

    let store = local_store(&temp, "a.redb");
    let transport = Arc::new(PeerTransport::new("device-a", "shared secret").unwrap());

    let mut record = HistoryRecord::new("https://example.com", "Example", "device-a");
    record.visit_id = "1".to_string();
    store.upsert_record(record).await.unwrap();

    // No peers connected: the cycle fails as a channel error
    let coordinator = SyncCoordinator::new(
        store.clone(),
        Arc::new(PeerSyncTransport::new(transport)),
        probe("device-a"),
    );
    assert!(coordinator.run_cycle(false).await.is_err());

    // Nothing was lost: the delta is intact for the next attempt
    assert_eq!(store.get_unsynced().await.unwrap().len(), 1);
    assert_eq!(coordinator.sync_state().await.unwrap().last_sync, 0);
}
