//! In-memory store projected over an active peer transport
//!
//! Not a persistent store: a cache fed by direct peer links, used when
//! no durable backend is initialized. Local writes land in the cache and
//! are immediately flushed onto the channel as `History` frames; inbound
//! frames arrive through [`PeerTransport`]'s attached-store path, which
//! calls `merge_remote`/`upsert_device` here.
//!
//! Typical wiring:
//!
//! ```ignore
//! let transport = Arc::new(PeerTransport::new(client_id, secret)?);
//! let store = Arc::new(EncryptedChannelStore::new(transport.clone()));
//! transport.attach_store(store.clone());
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::merge;
use crate::p2p::PeerTransport;
use crate::search::{search_records, SearchHit};
use crate::store::{stamp_last_modified, RecordQuery, RecordStore};
use crate::types::{DeviceRecord, HistoryRecord, SyncStatus};

/// Volatile record cache flushed onto a peer transport.
pub struct EncryptedChannelStore {
    transport: Arc<PeerTransport>,
    records: RwLock<HashMap<String, HistoryRecord>>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    meta: RwLock<HashMap<String, String>>,
}

impl EncryptedChannelStore {
    /// Create a store projected over the given transport.
    pub fn new(transport: Arc<PeerTransport>) -> Self {
        Self {
            transport,
            records: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records currently cached.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for EncryptedChannelStore {
    async fn init(&self) -> SyncResult<()> {
        // Nothing to open; the cache lives with the transport
        Ok(())
    }

    async fn upsert_record(&self, mut record: HistoryRecord) -> SyncResult<()> {
        stamp_last_modified(&mut record);
        self.records
            .write()
            .insert(record.visit_id.clone(), record.clone());

        // Flush straight onto the channel; with no peers connected the
        // record simply stays pending until a later cycle pushes it
        let sent = self.transport.broadcast_history(&[record]).await?;
        debug!(peers = sent, "Flushed record onto peer channel");
        Ok(())
    }

    async fn get_record(&self, visit_id: &str) -> SyncResult<Option<HistoryRecord>> {
        Ok(self.records.read().get(visit_id).cloned())
    }

    async fn get_unsynced(&self) -> SyncResult<Vec<HistoryRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.sync_status == SyncStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_synced(&self, visit_id: &str) -> SyncResult<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(visit_id)
            .ok_or_else(|| SyncError::RecordNotFound(visit_id.to_string()))?;
        record.sync_status = SyncStatus::Synced;
        Ok(())
    }

    async fn query_records(&self, query: RecordQuery) -> SyncResult<Vec<HistoryRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn merge_remote(&self, incoming: Vec<HistoryRecord>) -> SyncResult<usize> {
        let mut applied = 0;
        let mut records = self.records.write();
        for remote in incoming {
            let local = records.get(&remote.visit_id);
            if let Some(merged) = merge::resolve(local, &remote) {
                records.insert(merged.visit_id.clone(), merged);
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn soft_delete(&self, visit_id: &str) -> SyncResult<()> {
        let record = {
            let mut records = self.records.write();
            let record = records
                .get_mut(visit_id)
                .ok_or_else(|| SyncError::RecordNotFound(visit_id.to_string()))?;
            record.tombstone();
            record.clone()
        };
        // The tombstone propagates like any other write
        self.transport.broadcast_history(&[record]).await?;
        Ok(())
    }

    async fn upsert_device(&self, device: DeviceRecord) -> SyncResult<()> {
        let mut devices = self.devices.write();
        match devices.get_mut(&device.device_id) {
            Some(known) => known.observe(&device),
            None => {
                devices.insert(device.device_id.clone(), device);
            }
        }
        Ok(())
    }

    async fn list_devices(&self) -> SyncResult<Vec<DeviceRecord>> {
        Ok(self.devices.read().values().cloned().collect())
    }

    async fn update_page_content(&self, url: &str, summary: &str) -> SyncResult<usize> {
        let updated: Vec<HistoryRecord> = {
            let mut records = self.records.write();
            records
                .values_mut()
                .filter(|r| r.url == url)
                .map(|r| {
                    r.attach_summary(summary);
                    r.clone()
                })
                .collect()
        };
        if !updated.is_empty() {
            self.transport.broadcast_history(&updated).await?;
        }
        Ok(updated.len())
    }

    async fn search(&self, query: &str) -> SyncResult<Vec<SearchHit>> {
        let records: Vec<HistoryRecord> = self.records.read().values().cloned().collect();
        Ok(search_records(&records, query))
    }

    async fn get_meta(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.meta.read().get(key).cloned())
    }

    async fn put_meta(&self, key: &str, value: &str) -> SyncResult<()> {
        self.meta.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> EncryptedChannelStore {
        let transport = Arc::new(PeerTransport::new("device-a", "test secret").unwrap());
        EncryptedChannelStore::new(transport)
    }

    fn record(visit_id: &str, last_modified: i64) -> HistoryRecord {
        let mut r = HistoryRecord::new("https://example.com", "Example", "device-a");
        r.visit_id = visit_id.to_string();
        r.last_modified = last_modified;
        r
    }

    #[tokio::test]
    async fn test_upsert_without_peers_keeps_record_pending() {
        let store = test_store();

        store.upsert_record(record("1", 100)).await.unwrap();

        let unsynced = store.get_unsynced().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].visit_id, "1");
    }

    #[tokio::test]
    async fn test_mark_synced() {
        let store = test_store();
        store.upsert_record(record("1", 100)).await.unwrap();

        store.mark_synced("1").await.unwrap();

        assert!(store.get_unsynced().await.unwrap().is_empty());
        let loaded = store.get_record("1").await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_merge_remote_lww() {
        let store = test_store();

        let mut local = record("1", 100);
        local.title = "Local".to_string();
        store.upsert_record(local).await.unwrap();

        let mut stale = record("1", 50);
        stale.title = "Stale".to_string();
        assert_eq!(store.merge_remote(vec![stale]).await.unwrap(), 0);

        let mut fresh = record("1", 200);
        fresh.title = "Fresh".to_string();
        assert_eq!(store.merge_remote(vec![fresh]).await.unwrap(), 1);
        assert_eq!(store.get_record("1").await.unwrap().unwrap().title, "Fresh");
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_tombstone_in_cache() {
        let store = test_store();
        store.upsert_record(record("1", 100)).await.unwrap();

        store.soft_delete("1").await.unwrap();

        let loaded = store.get_record("1").await.unwrap().unwrap();
        assert!(loaded.deleted);

        // Tombstones stay visible to queries
        let all = store.query_records(RecordQuery::all()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_search_excludes_tombstones() {
        let store = test_store();

        let mut live = record("1", 100);
        live.attach_summary("unique test content here");
        store.upsert_record(live).await.unwrap();

        let mut dead = record("2", 100);
        dead.attach_summary("unique test content here");
        store.upsert_record(dead).await.unwrap();
        store.soft_delete("2").await.unwrap();

        let hits = store.search("unique test content").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.visit_id, "1");
    }

    #[tokio::test]
    async fn test_devices_and_meta() {
        let store = test_store();

        store
            .upsert_device(DeviceRecord::new("device-b", "macos", "Safari", "17.0"))
            .await
            .unwrap();
        assert_eq!(store.list_devices().await.unwrap().len(), 1);

        store.put_meta("last_sync", "42").await.unwrap();
        assert_eq!(store.get_meta("last_sync").await.unwrap().unwrap(), "42");
    }

    #[tokio::test]
    async fn test_update_page_content() {
        let store = test_store();
        store.upsert_record(record("1", 100)).await.unwrap();

        let updated = store
            .update_page_content("https://example.com", "new summary")
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let loaded = store.get_record("1").await.unwrap().unwrap();
        assert_eq!(loaded.page_content.unwrap().summary, "new summary");
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
    }
}
