//! The transport contract shared by all synchronization backends
//!
//! One exchange carries the whole cycle: push the local delta, pull the
//! remote delta, and learn the new high-water mark. The three transports
//! (HTTP, gossip replica, direct peers) are interchangeable behind this
//! trait and must converge on the same eventual state.

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::types::{DeviceRecord, HistoryRecord};

/// The local delta handed to a transport.
#[derive(Debug, Clone)]
pub struct SyncPush {
    /// Unsynced local records (plaintext; transports seal as needed)
    pub records: Vec<HistoryRecord>,
    /// This device's info
    pub device: DeviceRecord,
    /// The high-water mark: remote changes before this are already known
    pub last_sync: i64,
}

/// What a transport returns from one exchange.
#[derive(Debug, Clone)]
pub struct SyncExchange {
    /// Remote records to merge (already opened by the transport)
    pub remote_records: Vec<HistoryRecord>,
    /// Remote devices to upsert
    pub remote_devices: Vec<DeviceRecord>,
    /// Candidate new high-water mark; only persisted if it advances
    pub new_high_water_mark: i64,
}

/// One synchronization backend.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Short transport name for logs ("remote", "gossip", "peer").
    fn name(&self) -> &'static str;

    /// Push the local delta and pull the remote one.
    ///
    /// Implementations handle their own wire encryption; records cross
    /// this boundary in plaintext form only in process memory.
    async fn exchange(&self, push: SyncPush) -> SyncResult<SyncExchange>;
}
