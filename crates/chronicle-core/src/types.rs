//! Core data model for the Chronicle sync engine

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::crypto::{EncryptedField, RecordCrypto};
use crate::error::SyncError;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Mint a new globally unique visit id for a locally observed visit.
///
/// ULIDs sort lexicographically by creation time, which keeps locally
/// minted ids roughly time-ordered in the store.
pub fn new_visit_id() -> String {
    Ulid::new().to_string()
}

/// Sync lifecycle state of a history record.
///
/// Mutated only by the sync machinery: records are created `Pending`,
/// move to `Synced` once a transport has accepted them, and `Error` when
/// a push was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not yet pushed to any transport
    Pending,
    /// Accepted by a transport or applied via merge
    Synced,
    /// Last push attempt failed
    Error,
}

/// Derived page content attached to a visit.
///
/// Only the summary is ever stored; raw page text is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    /// Summarized page text (output of an external summarizer)
    pub summary: String,
    /// When the summary was produced (epoch millis)
    pub extracted_at: i64,
}

/// One browsing visit, as held in memory.
///
/// `visit_id` is the primary key everywhere; updates are always
/// full-record replacements keyed by it. `last_modified` is the sole
/// conflict tie-breaker across devices. Deletion never removes a record:
/// it flips `deleted` and bumps `last_modified` so the tombstone itself
/// propagates to peers that have not seen it yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Globally unique visit id, primary key
    pub visit_id: String,
    /// Visited URL (plaintext in memory only)
    pub url: String,
    /// Page title (plaintext in memory only)
    pub title: String,
    /// When the visit happened (epoch millis); immutable once created
    pub visit_time: i64,
    /// Device that observed the visit; set at creation
    pub device_id: String,
    /// Visit that led here, if known; immutable provenance
    #[serde(default)]
    pub referring_visit_id: Option<String>,
    /// Navigation transition kind (e.g. "link", "typed"); immutable
    #[serde(default)]
    pub transition: Option<String>,
    /// Sync lifecycle state
    pub sync_status: SyncStatus,
    /// Last mutation time (epoch millis); the conflict tie-breaker
    pub last_modified: i64,
    /// Tombstone flag; tombstoned records are retained indefinitely
    #[serde(default)]
    pub deleted: bool,
    /// Derived page summary, if one was extracted
    #[serde(default)]
    pub page_content: Option<PageContent>,
}

impl HistoryRecord {
    /// Create a record for a freshly observed local visit.
    ///
    /// Mints a visit id, stamps `visit_time` and `last_modified` with the
    /// current time, and starts the record `Pending`.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            visit_id: new_visit_id(),
            url: url.into(),
            title: title.into(),
            visit_time: now,
            device_id: device_id.into(),
            referring_visit_id: None,
            transition: None,
            sync_status: SyncStatus::Pending,
            last_modified: now,
            deleted: false,
            page_content: None,
        }
    }

    /// Mark this record deleted, bumping `last_modified` so the tombstone
    /// wins over older live copies on other devices.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.sync_status = SyncStatus::Pending;
        self.last_modified = now_millis();
    }

    /// Attach a derived summary and flag the record for re-sync.
    pub fn attach_summary(&mut self, summary: impl Into<String>) {
        let now = now_millis();
        self.page_content = Some(PageContent {
            summary: summary.into(),
            extracted_at: now,
        });
        self.sync_status = SyncStatus::Pending;
        self.last_modified = now;
    }

    /// Seal the sensitive fields for persistence or transmission.
    ///
    /// url, title, and the page summary become [`EncryptedField`]s; all
    /// other fields remain plaintext metadata.
    pub fn seal(&self, crypto: &RecordCrypto) -> Result<EncryptedHistoryRecord, SyncError> {
        let page_content = match &self.page_content {
            Some(content) => Some(EncryptedPageContent {
                summary: crypto.encrypt(&content.summary)?,
                extracted_at: content.extracted_at,
            }),
            None => None,
        };

        Ok(EncryptedHistoryRecord {
            visit_id: self.visit_id.clone(),
            url: crypto.encrypt(&self.url)?,
            title: crypto.encrypt(&self.title)?,
            visit_time: self.visit_time,
            device_id: self.device_id.clone(),
            referring_visit_id: self.referring_visit_id.clone(),
            transition: self.transition.clone(),
            sync_status: self.sync_status,
            last_modified: self.last_modified,
            deleted: self.deleted,
            page_content,
        })
    }
}

/// Encrypted derived page content, as persisted and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPageContent {
    /// Encrypted summary text
    pub summary: EncryptedField,
    /// When the summary was produced (epoch millis)
    pub extracted_at: i64,
}

/// A history record in its at-rest / at-wire form.
///
/// url, title, and summary are sealed; everything else is plaintext
/// metadata the merge machinery needs without decrypting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedHistoryRecord {
    pub visit_id: String,
    pub url: EncryptedField,
    pub title: EncryptedField,
    pub visit_time: i64,
    pub device_id: String,
    #[serde(default)]
    pub referring_visit_id: Option<String>,
    #[serde(default)]
    pub transition: Option<String>,
    pub sync_status: SyncStatus,
    pub last_modified: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub page_content: Option<EncryptedPageContent>,
}

impl EncryptedHistoryRecord {
    /// Open the sealed fields back into a plaintext record.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Authentication` if any field fails to verify.
    pub fn open(&self, crypto: &RecordCrypto) -> Result<HistoryRecord, SyncError> {
        let page_content = match &self.page_content {
            Some(content) => Some(PageContent {
                summary: crypto.decrypt(&content.summary)?,
                extracted_at: content.extracted_at,
            }),
            None => None,
        };

        Ok(HistoryRecord {
            visit_id: self.visit_id.clone(),
            url: crypto.decrypt(&self.url)?,
            title: crypto.decrypt(&self.title)?,
            visit_time: self.visit_time,
            device_id: self.device_id.clone(),
            referring_visit_id: self.referring_visit_id.clone(),
            transition: self.transition.clone(),
            sync_status: self.sync_status,
            last_modified: self.last_modified,
            deleted: self.deleted,
            page_content,
        })
    }
}

/// A device participating in synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Stable device identifier
    pub device_id: String,
    /// Operating system / platform string
    pub platform: String,
    /// Browser name
    pub browser_name: String,
    /// Browser version
    pub browser_version: String,
    /// First time this device was seen (epoch millis); set once
    pub first_seen: i64,
    /// Last time this device was seen (epoch millis); never decreases
    pub last_seen: i64,
}

impl DeviceRecord {
    /// Create a device record, stamping first/last seen with now.
    pub fn new(
        device_id: impl Into<String>,
        platform: impl Into<String>,
        browser_name: impl Into<String>,
        browser_version: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            device_id: device_id.into(),
            platform: platform.into(),
            browser_name: browser_name.into(),
            browser_version: browser_version.into(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold a newer observation of the same device into this record.
    ///
    /// `first_seen` is preserved from the existing record; `last_seen`
    /// only moves forward.
    pub fn observe(&mut self, incoming: &DeviceRecord) {
        self.platform = incoming.platform.clone();
        self.browser_name = incoming.browser_name.clone();
        self.browser_version = incoming.browser_version.clone();
        self.last_seen = self.last_seen.max(incoming.last_seen);
    }

    /// Update `last_seen` to now.
    pub fn touch(&mut self) {
        self.last_seen = self.last_seen.max(now_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_visit_ids_are_unique() {
        assert_ne!(new_visit_id(), new_visit_id());
    }

    #[test]
    fn test_new_record_starts_pending() {
        let record = HistoryRecord::new("https://example.com", "Example", "device-a");
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(!record.deleted);
        assert!(!record.visit_id.is_empty());
        assert_eq!(record.visit_time, record.last_modified);
    }

    #[test]
    fn test_tombstone_bumps_last_modified() {
        let mut record = HistoryRecord::new("https://example.com", "Example", "device-a");
        record.last_modified = 100;
        record.sync_status = SyncStatus::Synced;

        record.tombstone();

        assert!(record.deleted);
        assert!(record.last_modified > 100);
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_attach_summary_flags_for_resync() {
        let mut record = HistoryRecord::new("https://example.com", "Example", "device-a");
        record.sync_status = SyncStatus::Synced;
        record.last_modified = 100;

        record.attach_summary("a page about examples");

        let content = record.page_content.as_ref().unwrap();
        assert_eq!(content.summary, "a page about examples");
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(record.last_modified > 100);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = RecordCrypto::derive("test secret", "records").unwrap();
        let mut record = HistoryRecord::new("https://example.com/page", "A Title", "device-a");
        record.attach_summary("summary text");

        let sealed = record.seal(&crypto).unwrap();

        // Sensitive fields are not present in plaintext
        assert_ne!(sealed.url.ciphertext, record.url);
        assert_ne!(sealed.title.ciphertext, record.title);

        let opened = sealed.open(&crypto).unwrap();
        assert_eq!(opened, record);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let crypto = RecordCrypto::derive("secret one", "records").unwrap();
        let other = RecordCrypto::derive("secret two", "records").unwrap();

        let record = HistoryRecord::new("https://example.com", "Example", "device-a");
        let sealed = record.seal(&crypto).unwrap();

        assert!(matches!(
            sealed.open(&other),
            Err(SyncError::Authentication(_))
        ));
    }

    #[test]
    fn test_sealed_metadata_stays_plaintext() {
        let crypto = RecordCrypto::derive("test secret", "records").unwrap();
        let record = HistoryRecord::new("https://example.com", "Example", "device-a");
        let sealed = record.seal(&crypto).unwrap();

        assert_eq!(sealed.visit_id, record.visit_id);
        assert_eq!(sealed.visit_time, record.visit_time);
        assert_eq!(sealed.device_id, record.device_id);
        assert_eq!(sealed.last_modified, record.last_modified);
    }

    #[test]
    fn test_device_observe_keeps_first_seen() {
        let mut existing = DeviceRecord::new("device-a", "linux", "Firefox", "120.0");
        existing.first_seen = 1000;
        existing.last_seen = 2000;

        let mut incoming = DeviceRecord::new("device-a", "linux", "Firefox", "121.0");
        incoming.first_seen = 5000;
        incoming.last_seen = 3000;

        existing.observe(&incoming);

        assert_eq!(existing.first_seen, 1000);
        assert_eq!(existing.last_seen, 3000);
        assert_eq!(existing.browser_version, "121.0");
    }

    #[test]
    fn test_device_last_seen_monotonic() {
        let mut existing = DeviceRecord::new("device-a", "linux", "Firefox", "120.0");
        existing.last_seen = now_millis() + 60_000;
        let frozen = existing.last_seen;

        let mut stale = existing.clone();
        stale.last_seen = 10;
        existing.observe(&stale);
        assert_eq!(existing.last_seen, frozen);

        existing.touch();
        assert_eq!(existing.last_seen, frozen);
    }

    #[test]
    fn test_sync_status_serde_lowercase() {
        let json = serde_json::to_string(&SyncStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
        let status: SyncStatus = serde_json::from_str("\"synced\"").unwrap();
        assert_eq!(status, SyncStatus::Synced);
    }
}
