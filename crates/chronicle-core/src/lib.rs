//! Chronicle Core Library
//!
//! End-to-end encrypted, multi-device browsing history synchronization.
//!
//! ## Overview
//!
//! Chronicle keeps a user's history consistent across devices without
//! any server ever seeing plaintext URLs or titles. Records are sealed
//! with a key derived from the user's secret phrase, stored locally,
//! and reconciled across devices with last-writer-wins merges over
//! three interchangeable transports: a centralized HTTPS endpoint, a
//! replicated gossip store, and direct encrypted peer channels.
//!
//! ## Core Principles
//!
//! - **Local-first**: every store works fully offline; sync when connected
//! - **End-to-end encrypted**: urls, titles, and summaries leave the
//!   device only as AEAD ciphertext
//! - **Convergent**: merges are commutative, associative, and
//!   idempotent, so any exchange order reaches the same state
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chronicle_core::{
//!     DeviceRecord, HistoryRecord, LocalIndexedStore, RecordCrypto,
//!     RecordStore, RemoteSyncClient, SyncCoordinator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let crypto = Arc::new(RecordCrypto::derive("correct horse battery", "records")?);
//!     let store = Arc::new(LocalIndexedStore::open("~/.chronicle/history.redb", crypto.clone())?);
//!
//!     store
//!         .upsert_record(HistoryRecord::new("https://example.com", "Example", "laptop"))
//!         .await?;
//!
//!     let transport = Arc::new(RemoteSyncClient::new(
//!         "https://sync.example.com/api",
//!         "laptop",
//!         crypto,
//!     )?);
//!     let device = DeviceRecord::new("laptop", "linux", "Firefox", "120.0");
//!     let coordinator = Arc::new(SyncCoordinator::new(store, transport, device));
//!     coordinator.run_cycle(false).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod merge;
pub mod p2p;
pub mod search;
pub mod store;
pub mod sync;
pub mod system;
pub mod types;

// Re-exports
pub use config::{StoreChoice, SyncSettings};
pub use crypto::{EncryptedField, RecordCrypto, NONCE_SIZE};
pub use error::{SyncError, SyncResult};
pub use p2p::{
    ConnectionState, MemorySignaling, PeerChannel, PeerEvent, PeerMessage, PeerSyncTransport,
    PeerTransport, SessionDescription, Signaling,
};
pub use search::{SearchHit, SearchMatch};
pub use store::{
    EncryptedChannelStore, GossipMesh, GossipStore, LocalIndexedStore, RecordQuery, RecordStore,
};
pub use sync::{
    CyclePhase, GossipTransport, RemoteSyncClient, SyncCoordinator, SyncEvent, SyncExchange,
    SyncOutcome, SyncPush, SyncState, SyncStats, SyncTransport,
};
pub use system::{
    attach_summarized_content, DeviceProbe, RawVisit, StaticDeviceProbe, Summarizer, VisitSource,
};
pub use types::{
    new_visit_id, now_millis, DeviceRecord, EncryptedHistoryRecord, HistoryRecord, PageContent,
    SyncStatus,
};
