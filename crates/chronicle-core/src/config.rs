//! Engine configuration
//!
//! Settings load from a JSON file with serde defaults; hosts layer
//! their own overrides (CLI flags, extension storage) on top. The
//! secret itself stays in the settings only as the derivation input —
//! derived keys never leave process memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::RecordCrypto;
use crate::error::{SyncError, SyncResult};
use crate::sync::DEFAULT_CLIENT_ID;

/// Which record store backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreChoice {
    /// Durable redb store (the default)
    #[default]
    Local,
    /// Replicated gossip store
    Gossip,
    /// In-memory projection over a peer transport
    Channel,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Centralized sync endpoint URL
    pub api_endpoint: String,
    /// This device's client identifier
    pub client_id: String,
    /// The user secret (mnemonic) all keys derive from
    pub secret: String,
    /// Seconds between periodic sync cycles
    pub sync_interval_secs: u64,
    /// Store backend to use
    pub backend: StoreChoice,
    /// Where the local store lives; `None` means the host decides
    pub data_dir: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            secret: String::new(),
            sync_interval_secs: 300,
            backend: StoreChoice::Local,
            data_dir: None,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file; a missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| {
            SyncError::Configuration(format!("invalid settings file {}: {}", path.display(), e))
        })
    }

    /// Write settings to a JSON file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// The configured client id, rejecting the unconfigured default.
    pub fn ensure_client_id(&self) -> SyncResult<&str> {
        if self.client_id.is_empty() || self.client_id == DEFAULT_CLIENT_ID {
            return Err(SyncError::Configuration(
                "client id is not configured".to_string(),
            ));
        }
        Ok(&self.client_id)
    }

    /// Derive the record encryption key from the configured secret.
    pub fn record_crypto(&self) -> SyncResult<Arc<RecordCrypto>> {
        Ok(Arc::new(RecordCrypto::derive(&self.secret, "records")?))
    }

    /// The periodic sync interval.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
