//! Synchronization: coordinator, cycle events, and the three transports
//!
//! The [`SyncCoordinator`] drives cycles against one [`RecordStore`] and
//! one [`SyncTransport`]. Three interchangeable transports exist:
//! [`RemoteSyncClient`] (centralized HTTPS), [`GossipTransport`] (over a
//! replicated gossip store), and
//! [`PeerSyncTransport`](crate::p2p::PeerSyncTransport) (direct peer
//! channels). All converge on the same eventual state.
//!
//! [`RecordStore`]: crate::store::RecordStore

mod coordinator;
mod events;
mod gossip_transport;
mod remote;
mod transport;

pub use coordinator::{SyncCoordinator, SyncOutcome, SyncState, SYNC_INTERVAL};
pub use events::{CyclePhase, SyncEvent, SyncStats};
pub use gossip_transport::GossipTransport;
pub use remote::{RemoteSyncClient, DEFAULT_CLIENT_ID};
pub use transport::{SyncExchange, SyncPush, SyncTransport};
