//! Durable record storage using redb
//!
//! This is the source of truth on a single device and the only backend
//! with durable ACID semantics. Records are persisted in their sealed
//! form (url/title/summary as `EncryptedField`s), so plaintext never
//! touches disk. Secondary multimap tables index visit time, sync
//! status, URL (as a SHA-256 digest), owning device, and modification
//! time; all mutations update the record and its index entries inside a
//! single write transaction, and reads run on consistent snapshots.

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::crypto::RecordCrypto;
use crate::error::{SyncError, SyncResult};
use crate::merge;
use crate::search::{search_records, SearchHit};
use crate::store::{stamp_last_modified, RecordQuery, RecordStore};
use crate::types::{DeviceRecord, EncryptedHistoryRecord, HistoryRecord, SyncStatus};

// Primary tables
const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("history");
const DEVICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta");

// Secondary indexes, all mapping index key -> visit_id / device_id
const VISIT_TIME_INDEX: MultimapTableDefinition<i64, &str> =
    MultimapTableDefinition::new("idx_visit_time");
const SYNC_STATUS_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("idx_sync_status");
const URL_INDEX: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("idx_url");
const DEVICE_INDEX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("idx_device");
const LAST_MODIFIED_INDEX: MultimapTableDefinition<i64, &str> =
    MultimapTableDefinition::new("idx_last_modified");
const DEVICE_LAST_SEEN_INDEX: MultimapTableDefinition<i64, &str> =
    MultimapTableDefinition::new("idx_device_last_seen");

/// Stable index key for a sync status.
fn status_key(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Pending => "pending",
        SyncStatus::Synced => "synced",
        SyncStatus::Error => "error",
    }
}

/// SHA-256 digest of a URL, hex-encoded.
///
/// The URL index stores digests rather than plaintext so equality
/// lookups work without writing URLs to disk.
fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Durable, transactional record store backed by redb.
#[derive(Clone)]
pub struct LocalIndexedStore {
    db: Arc<RwLock<Database>>,
    crypto: Arc<RecordCrypto>,
}

impl LocalIndexedStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directory and all tables if needed.
    pub fn open(path: impl AsRef<Path>, crypto: Arc<RecordCrypto>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let store = Self {
            db: Arc::new(RwLock::new(db)),
            crypto,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables. Idempotent; redb table opens are create-if-missing.
    fn ensure_tables(&self) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(HISTORY_TABLE)?;
            let _ = write_txn.open_table(DEVICES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_multimap_table(VISIT_TIME_INDEX)?;
            let _ = write_txn.open_multimap_table(SYNC_STATUS_INDEX)?;
            let _ = write_txn.open_multimap_table(URL_INDEX)?;
            let _ = write_txn.open_multimap_table(DEVICE_INDEX)?;
            let _ = write_txn.open_multimap_table(LAST_MODIFIED_INDEX)?;
            let _ = write_txn.open_multimap_table(DEVICE_LAST_SEEN_INDEX)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write a record and refresh its index entries in one transaction.
    ///
    /// Old index entries are removed first (the previous version of the
    /// record may live under different index keys), then the sealed
    /// record and its new entries are inserted.
    fn write_record(&self, record: &HistoryRecord) -> SyncResult<()> {
        let sealed = record.seal(&self.crypto)?;
        let data =
            serde_json::to_vec(&sealed).map_err(|e| SyncError::Serialization(e.to_string()))?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut history = write_txn.open_table(HISTORY_TABLE)?;
            let mut visit_time_idx = write_txn.open_multimap_table(VISIT_TIME_INDEX)?;
            let mut status_idx = write_txn.open_multimap_table(SYNC_STATUS_INDEX)?;
            let mut url_idx = write_txn.open_multimap_table(URL_INDEX)?;
            let mut device_idx = write_txn.open_multimap_table(DEVICE_INDEX)?;
            let mut modified_idx = write_txn.open_multimap_table(LAST_MODIFIED_INDEX)?;

            let visit_id = record.visit_id.as_str();

            // Drop the previous version's index entries
            let old: Option<EncryptedHistoryRecord> = history
                .get(visit_id)?
                .map(|v| serde_json::from_slice(v.value()))
                .transpose()
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if let Some(old) = old {
                let old = old.open(&self.crypto)?;
                visit_time_idx.remove(old.visit_time, visit_id)?;
                status_idx.remove(status_key(old.sync_status), visit_id)?;
                url_idx.remove(url_digest(&old.url).as_str(), visit_id)?;
                device_idx.remove(old.device_id.as_str(), visit_id)?;
                modified_idx.remove(old.last_modified, visit_id)?;
            }

            history.insert(visit_id, data.as_slice())?;
            visit_time_idx.insert(record.visit_time, visit_id)?;
            status_idx.insert(status_key(record.sync_status), visit_id)?;
            url_idx.insert(url_digest(&record.url).as_str(), visit_id)?;
            device_idx.insert(record.device_id.as_str(), visit_id)?;
            modified_idx.insert(record.last_modified, visit_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Decode and decrypt one persisted record.
    fn decode_record(&self, bytes: &[u8]) -> SyncResult<HistoryRecord> {
        let sealed: EncryptedHistoryRecord =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))?;
        sealed.open(&self.crypto)
    }

    /// Fetch records for a list of visit ids in one consistent snapshot.
    fn load_records(&self, visit_ids: &[String]) -> SyncResult<Vec<HistoryRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let history = read_txn.open_table(HISTORY_TABLE)?;

        let mut records = Vec::with_capacity(visit_ids.len());
        for visit_id in visit_ids {
            if let Some(value) = history.get(visit_id.as_str())? {
                records.push(self.decode_record(value.value())?);
            }
        }
        Ok(records)
    }

    /// Decrypt every stored record. Used by search and unfiltered queries.
    fn load_all(&self) -> SyncResult<Vec<HistoryRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let history = read_txn.open_table(HISTORY_TABLE)?;

        let mut records = Vec::new();
        for entry in history.iter()? {
            let (_, value) = entry?;
            records.push(self.decode_record(value.value())?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for LocalIndexedStore {
    async fn init(&self) -> SyncResult<()> {
        self.ensure_tables()
    }

    async fn upsert_record(&self, mut record: HistoryRecord) -> SyncResult<()> {
        stamp_last_modified(&mut record);
        self.write_record(&record)
    }

    async fn get_record(&self, visit_id: &str) -> SyncResult<Option<HistoryRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let history = read_txn.open_table(HISTORY_TABLE)?;
        match history.get(visit_id)? {
            Some(value) => Ok(Some(self.decode_record(value.value())?)),
            None => Ok(None),
        }
    }

    async fn get_unsynced(&self) -> SyncResult<Vec<HistoryRecord>> {
        let visit_ids = {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let status_idx = read_txn.open_multimap_table(SYNC_STATUS_INDEX)?;

            let mut ids = Vec::new();
            for value in status_idx.get(status_key(SyncStatus::Pending))? {
                ids.push(value?.value().to_string());
            }
            ids
        };
        self.load_records(&visit_ids)
    }

    async fn mark_synced(&self, visit_id: &str) -> SyncResult<()> {
        let record = self
            .get_record(visit_id)
            .await?
            .ok_or_else(|| SyncError::RecordNotFound(visit_id.to_string()))?;

        if record.sync_status == SyncStatus::Synced {
            return Ok(());
        }

        let mut updated = record;
        updated.sync_status = SyncStatus::Synced;
        self.write_record(&updated)
    }

    async fn query_records(&self, query: RecordQuery) -> SyncResult<Vec<HistoryRecord>> {
        // Pick the most selective index available for the filter; the
        // residual filter still runs over the decrypted records.
        let candidates = if let Some(device_id) = &query.device_id {
            let visit_ids = {
                let db = self.db.read();
                let read_txn = db.begin_read()?;
                let device_idx = read_txn.open_multimap_table(DEVICE_INDEX)?;
                let mut ids = Vec::new();
                for value in device_idx.get(device_id.as_str())? {
                    ids.push(value?.value().to_string());
                }
                ids
            };
            self.load_records(&visit_ids)?
        } else if let Some(since) = query.since {
            let visit_ids = {
                let db = self.db.read();
                let read_txn = db.begin_read()?;
                let modified_idx = read_txn.open_multimap_table(LAST_MODIFIED_INDEX)?;
                let mut ids = Vec::new();
                for entry in modified_idx.range(since..)? {
                    let (_, values) = entry?;
                    for value in values {
                        ids.push(value?.value().to_string());
                    }
                }
                ids
            };
            self.load_records(&visit_ids)?
        } else {
            self.load_all()?
        };

        Ok(candidates
            .into_iter()
            .filter(|r| query.matches(r))
            .collect())
    }

    async fn merge_remote(&self, records: Vec<HistoryRecord>) -> SyncResult<usize> {
        let mut applied = 0;
        for remote in records {
            let local = self.get_record(&remote.visit_id).await?;
            if let Some(merged) = merge::resolve(local.as_ref(), &remote) {
                self.write_record(&merged)?;
                applied += 1;
            }
        }
        debug!(applied, "Merged remote records into local store");
        Ok(applied)
    }

    async fn soft_delete(&self, visit_id: &str) -> SyncResult<()> {
        let mut record = self
            .get_record(visit_id)
            .await?
            .ok_or_else(|| SyncError::RecordNotFound(visit_id.to_string()))?;
        record.tombstone();
        self.write_record(&record)
    }

    async fn upsert_device(&self, device: DeviceRecord) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut devices = write_txn.open_table(DEVICES_TABLE)?;
            let mut last_seen_idx = write_txn.open_multimap_table(DEVICE_LAST_SEEN_INDEX)?;

            let device_id = device.device_id.clone();
            let existing: Option<DeviceRecord> = devices
                .get(device_id.as_str())?
                .map(|v| serde_json::from_slice(v.value()))
                .transpose()
                .map_err(|e| SyncError::Serialization(e.to_string()))?;

            let merged = match existing {
                Some(mut known) => {
                    last_seen_idx.remove(known.last_seen, device_id.as_str())?;
                    known.observe(&device);
                    known
                }
                None => device,
            };

            let data = serde_json::to_vec(&merged)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            devices.insert(device_id.as_str(), data.as_slice())?;
            last_seen_idx.insert(merged.last_seen, device_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn list_devices(&self) -> SyncResult<Vec<DeviceRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let devices = read_txn.open_table(DEVICES_TABLE)?;

        let mut result = Vec::new();
        for entry in devices.iter()? {
            let (_, value) = entry?;
            let device: DeviceRecord = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            result.push(device);
        }
        Ok(result)
    }

    async fn update_page_content(&self, url: &str, summary: &str) -> SyncResult<usize> {
        let visit_ids = {
            let db = self.db.read();
            let read_txn = db.begin_read()?;
            let url_idx = read_txn.open_multimap_table(URL_INDEX)?;
            let mut ids = Vec::new();
            for value in url_idx.get(url_digest(url).as_str())? {
                ids.push(value?.value().to_string());
            }
            ids
        };

        let records = self.load_records(&visit_ids)?;
        let updated = records.len();
        for mut record in records {
            record.attach_summary(summary);
            self.write_record(&record)?;
        }
        Ok(updated)
    }

    async fn search(&self, query: &str) -> SyncResult<Vec<SearchHit>> {
        let records = self.load_all()?;
        Ok(search_records(&records, query))
    }

    async fn get_meta(&self, key: &str) -> SyncResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        Ok(meta.get(key)?.map(|v| v.value().to_string()))
    }

    async fn put_meta(&self, key: &str, value: &str) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
