//! Collaborator interfaces consumed by the engine
//!
//! The engine never probes the platform, enumerates browser history, or
//! summarizes page content itself; hosts supply these behind traits.

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::store::RecordStore;
use crate::types::DeviceRecord;

/// A raw visit as reported by a native history source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVisit {
    /// Native visit id if the source has one; minted otherwise
    pub visit_id: Option<String>,
    pub url: String,
    pub title: String,
    /// When the visit happened (epoch millis)
    pub visit_time: i64,
    /// Visit that led here, if known
    pub referring_visit_id: Option<String>,
    /// Navigation transition kind, if known
    pub transition: Option<String>,
}

/// Probes the host platform for this device's identity and details.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn device_info(&self) -> SyncResult<DeviceRecord>;
}

/// Enumerates recently observed visits from the native history layer.
#[async_trait]
pub trait VisitSource: Send + Sync {
    /// Visits observed at or after `since` (epoch millis).
    async fn recent_visits(&self, since: i64) -> SyncResult<Vec<RawVisit>>;
}

/// Black-box content summarization.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize extracted page text. The raw text is never stored;
    /// only the returned summary is.
    async fn summarize(&self, text: &str) -> SyncResult<String>;
}

/// Device probe answering with a fixed record, `last_seen` refreshed on
/// each call. Fits hosts whose details don't change while running (the
/// CLI, tests).
pub struct StaticDeviceProbe {
    device: DeviceRecord,
}

impl StaticDeviceProbe {
    pub fn new(device: DeviceRecord) -> Self {
        Self { device }
    }
}

#[async_trait]
impl DeviceProbe for StaticDeviceProbe {
    async fn device_info(&self) -> SyncResult<DeviceRecord> {
        let mut device = self.device.clone();
        device.touch();
        Ok(device)
    }
}

/// Summarize extracted page text and attach the result to every record
/// for the URL, flagging them for re-sync.
///
/// The raw text is handed to the summarizer and dropped; only the
/// summary reaches the store.
pub async fn attach_summarized_content(
    store: &dyn RecordStore,
    summarizer: &dyn Summarizer,
    url: &str,
    page_text: &str,
) -> SyncResult<usize> {
    let summary = summarizer.summarize(page_text).await?;
    store.update_page_content(url, &summary).await
}
