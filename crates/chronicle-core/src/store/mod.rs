//! Record store backends
//!
//! One [`RecordStore`] contract, three implementations:
//!
//! - [`LocalIndexedStore`]: durable, transactional, the source of truth
//!   on a single device (redb).
//! - [`GossipStore`]: eventually-consistent replicated store shared with
//!   peers through a gossip mesh (Automerge).
//! - [`EncryptedChannelStore`]: in-memory projection over an active peer
//!   transport, used when no durable store is initialized.
//!
//! The backend is selected by explicit configuration at construction
//! time; callers hold and pass the instance. There is no global
//! singleton.

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::search::SearchHit;
use crate::types::{now_millis, DeviceRecord, HistoryRecord};

mod channel;
mod gossip;
mod local;

pub use channel::EncryptedChannelStore;
pub use gossip::{GossipMesh, GossipStore};
pub use local::LocalIndexedStore;

/// Filter for [`RecordStore::query_records`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Only records owned by this device
    pub device_id: Option<String>,
    /// Only records with `last_modified >= since` (epoch millis)
    pub since: Option<i64>,
}

impl RecordQuery {
    /// Match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one owning device.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            since: None,
        }
    }

    /// Restrict to records modified at or after `since`.
    pub fn modified_since(since: i64) -> Self {
        Self {
            device_id: None,
            since: Some(since),
        }
    }

    /// Whether a record passes this filter. Tombstones are included;
    /// visibility is the caller's decision.
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        if let Some(device_id) = &self.device_id {
            if &record.device_id != device_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.last_modified < since {
                return false;
            }
        }
        true
    }
}

/// Shared contract for all three store backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open or create the underlying storage. Idempotent.
    async fn init(&self) -> SyncResult<()>;

    /// Write or overwrite a record by `visit_id`.
    ///
    /// Stamps `last_modified` with the current time when the caller left
    /// it unset (zero). Newly created records start `pending`.
    async fn upsert_record(&self, record: HistoryRecord) -> SyncResult<()>;

    /// Fetch one record by `visit_id`.
    async fn get_record(&self, visit_id: &str) -> SyncResult<Option<HistoryRecord>>;

    /// All records with `sync_status == pending`.
    async fn get_unsynced(&self) -> SyncResult<Vec<HistoryRecord>>;

    /// Transition a record to `synced` without touching other fields.
    async fn mark_synced(&self, visit_id: &str) -> SyncResult<()>;

    /// Records filtered by owning device and/or modification time.
    /// Tombstoned records are included.
    async fn query_records(&self, query: RecordQuery) -> SyncResult<Vec<HistoryRecord>>;

    /// Fold a remote record set into this store, applying last-writer-wins
    /// resolution per record. Returns how many records were accepted.
    async fn merge_remote(&self, records: Vec<HistoryRecord>) -> SyncResult<usize>;

    /// Tombstone a record: `deleted = true`, `last_modified = now`.
    /// The record is retained so the deletion propagates.
    async fn soft_delete(&self, visit_id: &str) -> SyncResult<()>;

    /// Write or update a device record. `first_seen` of an existing
    /// device is preserved; `last_seen` only moves forward.
    async fn upsert_device(&self, device: DeviceRecord) -> SyncResult<()>;

    /// All known devices.
    async fn list_devices(&self) -> SyncResult<Vec<DeviceRecord>>;

    /// Attach a summary to every record for a URL, flagging them for
    /// re-sync. Returns how many records were updated.
    async fn update_page_content(&self, url: &str, summary: &str) -> SyncResult<usize>;

    /// Substring search over titles, URLs, and summaries with context
    /// snippets. Tombstoned records are excluded.
    async fn search(&self, query: &str) -> SyncResult<Vec<SearchHit>>;

    /// Read a metadata value (sync state such as the high-water mark).
    async fn get_meta(&self, key: &str) -> SyncResult<Option<String>>;

    /// Write a metadata value.
    async fn put_meta(&self, key: &str, value: &str) -> SyncResult<()>;
}

/// Stamp `last_modified` for records the caller did not stamp.
pub(crate) fn stamp_last_modified(record: &mut HistoryRecord) {
    if record.last_modified == 0 {
        record.last_modified = now_millis();
    }
}
