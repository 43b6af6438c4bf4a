//! Sync cycle phases, stats, and event notifications

use std::fmt;

/// Phase of the currently running sync cycle.
///
/// Every cycle walks Idle → FetchingLocalDelta → Pushing →
/// AwaitingRemote → Merging → Idle, with a fast exit back to Idle on
/// any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    /// No cycle running
    #[default]
    Idle,
    /// Collecting the local delta (new visits + unsynced records)
    FetchingLocalDelta,
    /// Preparing the push for the transport
    Pushing,
    /// Waiting on the transport exchange
    AwaitingRemote,
    /// Folding the remote delta into the local store
    Merging,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "idle"),
            CyclePhase::FetchingLocalDelta => write!(f, "fetching-local-delta"),
            CyclePhase::Pushing => write!(f, "pushing"),
            CyclePhase::AwaitingRemote => write!(f, "awaiting-remote"),
            CyclePhase::Merging => write!(f, "merging"),
        }
    }
}

/// Outcome counters for one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Records pushed to the transport
    pub sent: usize,
    /// Remote records accepted by the merge
    pub received: usize,
    /// Remote devices seen in the exchange
    pub devices: usize,
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle began
    CycleStarted {
        /// Whether this was a forced full sync
        forced: bool,
    },
    /// The running cycle moved to a new phase
    PhaseChanged { phase: CyclePhase },
    /// A cycle finished successfully
    CycleCompleted { stats: SyncStats },
    /// A cycle aborted; the high-water mark was left untouched
    CycleFailed { message: String },
}
