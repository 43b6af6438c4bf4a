//! Centralized HTTPS sync transport
//!
//! One POST per cycle: the body carries the pre-sealed local delta plus
//! device info, the response carries the remote delta and the server's
//! watermark. The server only ever sees `EncryptedField`s for urls,
//! titles, and summaries; plaintext metadata is limited to timestamps,
//! ids, and device info.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::RecordCrypto;
use crate::error::{SyncError, SyncResult};
use crate::sync::transport::{SyncExchange, SyncPush, SyncTransport};
use crate::types::{DeviceRecord, EncryptedHistoryRecord};

/// Placeholder client id that counts as unconfigured
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Per-request timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Request body for `POST {api_endpoint}?clientId={id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequestBody<'a> {
    history: &'a [EncryptedHistoryRecord],
    device_info: &'a DeviceRecord,
    last_sync: i64,
}

/// Response body; every field is optional on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponseBody {
    #[serde(default)]
    history: Option<Vec<EncryptedHistoryRecord>>,
    #[serde(default)]
    devices: Option<Vec<DeviceRecord>>,
    #[serde(default)]
    last_sync_time: Option<i64>,
}

/// HTTP client for the centralized sync endpoint.
pub struct RemoteSyncClient {
    http: reqwest::Client,
    api_endpoint: String,
    client_id: String,
    crypto: Arc<RecordCrypto>,
}

impl RemoteSyncClient {
    /// Create a client for an endpoint and client identity.
    pub fn new(
        api_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        crypto: Arc<RecordCrypto>,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SyncError::network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_endpoint: api_endpoint.into(),
            client_id: client_id.into(),
            crypto,
        })
    }

    /// Reject unconfigured identity before any network I/O happens.
    fn ensure_configured(&self) -> SyncResult<()> {
        if self.api_endpoint.is_empty() {
            return Err(SyncError::Configuration(
                "sync endpoint is not configured".to_string(),
            ));
        }
        if self.client_id.is_empty() || self.client_id == DEFAULT_CLIENT_ID {
            return Err(SyncError::Configuration(
                "client id is not configured".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for RemoteSyncClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn exchange(&self, push: SyncPush) -> SyncResult<SyncExchange> {
        self.ensure_configured()?;

        let mut sealed = Vec::with_capacity(push.records.len());
        for record in &push.records {
            sealed.push(record.seal(&self.crypto)?);
        }

        let body = SyncRequestBody {
            history: &sealed,
            device_info: &push.device,
            last_sync: push.last_sync,
        };

        debug!(
            endpoint = %self.api_endpoint,
            records = sealed.len(),
            "Pushing to sync server"
        );

        let response = self
            .http
            .post(&self.api_endpoint)
            .query(&[("clientId", self.client_id.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SyncError::http_status(status.as_u16(), detail));
        }

        let body: SyncResponseBody = response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(format!("invalid sync response: {}", e)))?;

        let mut remote_records = Vec::new();
        for sealed in body.history.unwrap_or_default() {
            match sealed.open(&self.crypto) {
                Ok(record) => remote_records.push(record),
                Err(e) => {
                    warn!(error = %e, "Discarding undecryptable record from server")
                }
            }
        }
        let remote_devices = body.devices.unwrap_or_default();

        let new_high_water_mark = body
            .last_sync_time
            .or_else(|| remote_records.iter().map(|r| r.last_modified).max())
            .unwrap_or(push.last_sync)
            .max(push.last_sync);

        debug!(
            received = remote_records.len(),
            devices = remote_devices.len(),
            new_high_water_mark,
            "Sync server exchange complete"
        );

        Ok(SyncExchange {
            remote_records,
            remote_devices,
            new_high_water_mark,
        })
    }
}
