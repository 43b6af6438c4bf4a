//! Sync transport over a gossip replica
//!
//! Pushing writes the local delta into the replicated document, which
//! carries it to peers asynchronously; pulling snapshots what has
//! converged locally since the high-water mark. There is no push/pull
//! round-trip to wait on: the replica itself is the shared medium.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::SyncResult;
use crate::store::{GossipStore, RecordQuery, RecordStore};
use crate::sync::transport::{SyncExchange, SyncPush, SyncTransport};

/// [`SyncTransport`] backed by a [`GossipStore`] replica.
pub struct GossipTransport {
    replica: Arc<GossipStore>,
}

impl GossipTransport {
    /// Wrap a replica this device participates in.
    pub fn new(replica: Arc<GossipStore>) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl SyncTransport for GossipTransport {
    fn name(&self) -> &'static str {
        "gossip"
    }

    async fn exchange(&self, push: SyncPush) -> SyncResult<SyncExchange> {
        // Push: fold the local delta into the replicated document
        let pushed = push.records.len();
        self.replica.merge_remote(push.records).await?;
        self.replica.upsert_device(push.device).await?;

        // Pull: snapshot everything that converged since the watermark
        let remote_records = self
            .replica
            .query_records(RecordQuery::modified_since(push.last_sync))
            .await?;
        let remote_devices = self.replica.list_devices().await?;

        let new_high_water_mark = remote_records
            .iter()
            .map(|r| r.last_modified)
            .max()
            .unwrap_or(push.last_sync)
            .max(push.last_sync);

        debug!(
            pushed,
            pulled = remote_records.len(),
            "Exchanged with gossip replica"
        );

        Ok(SyncExchange {
            remote_records,
            remote_devices,
            new_high_water_mark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RecordCrypto;
    use crate::store::GossipMesh;
    use crate::types::{DeviceRecord, HistoryRecord};

    fn crypto() -> Arc<RecordCrypto> {
        Arc::new(RecordCrypto::derive("test secret", "records").unwrap())
    }

    fn push(records: Vec<HistoryRecord>, last_sync: i64) -> SyncPush {
        SyncPush {
            records,
            device: DeviceRecord::new("device-a", "linux", "chronicle", "0.1.0"),
            last_sync,
        }
    }

    fn record(visit_id: &str, last_modified: i64) -> HistoryRecord {
        let mut r = HistoryRecord::new("https://example.com", "Example", "device-a");
        r.visit_id = visit_id.to_string();
        r.last_modified = last_modified;
        r
    }

    #[tokio::test]
    async fn test_exchange_returns_replica_contents() {
        let mesh = GossipMesh::new();
        let replica = Arc::new(GossipStore::join(&mesh, crypto()));

        // Something already converged in the replica
        let mut remote = record("remote-1", 300);
        remote.title = "From elsewhere".to_string();
        replica.upsert_record(remote).await.unwrap();

        let transport = GossipTransport::new(replica.clone());
        let exchange = transport
            .exchange(push(vec![record("local-1", 200)], 0))
            .await
            .unwrap();

        // Pull sees both the pre-existing record and our own push
        let ids: Vec<_> = exchange
            .remote_records
            .iter()
            .map(|r| r.visit_id.as_str())
            .collect();
        assert!(ids.contains(&"remote-1"));
        assert!(ids.contains(&"local-1"));
        assert_eq!(exchange.new_high_water_mark, 300);
        assert_eq!(exchange.remote_devices.len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_respects_watermark() {
        let mesh = GossipMesh::new();
        let replica = Arc::new(GossipStore::join(&mesh, crypto()));

        replica.upsert_record(record("old", 100)).await.unwrap();
        replica.upsert_record(record("new", 500)).await.unwrap();

        let transport = GossipTransport::new(replica);
        let exchange = transport.exchange(push(vec![], 200)).await.unwrap();

        let ids: Vec<_> = exchange
            .remote_records
            .iter()
            .map(|r| r.visit_id.as_str())
            .collect();
        assert!(!ids.contains(&"old"));
        assert!(ids.contains(&"new"));
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let mesh = GossipMesh::new();
        let replica = Arc::new(GossipStore::join(&mesh, crypto()));

        let transport = GossipTransport::new(replica);
        let exchange = transport.exchange(push(vec![], 1000)).await.unwrap();

        assert_eq!(exchange.new_high_water_mark, 1000);
    }
}
