//! Sync cycle scheduling and coordination
//!
//! The coordinator owns all sync state: the high-water mark (persisted
//! through the store's metadata facility, never ambient globals), the
//! single in-flight guard, the periodic timer, and the debounced
//! activity trigger. One cycle pushes the local delta through the active
//! transport, merges what comes back, and advances the high-water mark
//! only monotonically — a failed cycle leaves it untouched so the next
//! cycle retries the same delta.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::store::RecordStore;
use crate::sync::events::{CyclePhase, SyncEvent, SyncStats};
use crate::sync::transport::{SyncPush, SyncTransport};
use crate::system::{DeviceProbe, VisitSource};
use crate::types::{HistoryRecord, SyncStatus};

/// Default interval between periodic cycles (5 minutes)
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Debounce window for activity-driven triggers
const ACTIVITY_DEBOUNCE: Duration = Duration::from_secs(1);

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the activity trigger channel; a full channel just means
/// a trigger is already queued, which is all a trigger can express
const ACTIVITY_CHANNEL_CAPACITY: usize = 8;

/// Persistent sync state, owned by the coordinator and stored through
/// the record store's metadata facility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    /// High-water mark: remote changes before this are already merged
    pub last_sync: i64,
    /// Whether a cycle has ever completed against this store
    pub initialized: bool,
}

impl SyncState {
    const LAST_SYNC_KEY: &'static str = "sync.last_sync";
    const INITIALIZED_KEY: &'static str = "sync.initialized";

    /// Load the persisted state; missing keys mean a fresh store.
    pub async fn load(store: &dyn RecordStore) -> SyncResult<Self> {
        let last_sync = match store.get_meta(Self::LAST_SYNC_KEY).await? {
            Some(value) => value.parse::<i64>().map_err(|e| {
                SyncError::Storage(format!("corrupt high-water mark {:?}: {}", value, e))
            })?,
            None => 0,
        };
        let initialized = store.get_meta(Self::INITIALIZED_KEY).await?.is_some();
        Ok(Self {
            last_sync,
            initialized,
        })
    }

    /// Persist a new high-water mark.
    async fn store_high_water_mark(store: &dyn RecordStore, value: i64) -> SyncResult<()> {
        store
            .put_meta(Self::LAST_SYNC_KEY, &value.to_string())
            .await
    }

    /// Record that a first cycle completed.
    async fn mark_initialized(store: &dyn RecordStore) -> SyncResult<()> {
        store.put_meta(Self::INITIALIZED_KEY, "true").await
    }
}

/// What a trigger accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A full cycle ran
    Completed(SyncStats),
    /// Dropped: another cycle was already in flight
    AlreadyRunning,
    /// Skipped: nothing unsynced and not forced, no network I/O done
    NothingToSync,
}

/// Schedules and runs sync cycles against one store and one transport.
pub struct SyncCoordinator {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn SyncTransport>,
    probe: Arc<dyn DeviceProbe>,
    visit_source: Option<Arc<dyn VisitSource>>,
    interval: Duration,
    /// The checked-and-set overlap guard; sufficient because cycles run
    /// on a cooperative scheduler, not in parallel threads
    in_flight: AtomicBool,
    phase: RwLock<CyclePhase>,
    event_tx: broadcast::Sender<SyncEvent>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    activity_tx: mpsc::Sender<()>,
    activity_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SyncCoordinator {
    /// Create a coordinator. Wrap it in an [`Arc`] and call
    /// [`start`](Self::start) to begin the periodic schedule, or drive
    /// cycles manually with [`run_cycle`](Self::run_cycle).
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn SyncTransport>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            probe,
            visit_source: None,
            interval: SYNC_INTERVAL,
            in_flight: AtomicBool::new(false),
            phase: RwLock::new(CyclePhase::Idle),
            event_tx,
            periodic: Mutex::new(None),
            debounce: Mutex::new(None),
            activity_tx,
            activity_rx: Mutex::new(Some(activity_rx)),
        }
    }

    /// Override the periodic interval before calling `start`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wire a native visit source harvested at the start of each cycle.
    pub fn with_visit_source(mut self, source: Arc<dyn VisitSource>) -> Self {
        self.visit_source = Some(source);
        self
    }

    /// Subscribe to cycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Phase of the cycle currently running, or `Idle`.
    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    /// The persisted sync state.
    pub async fn sync_state(&self) -> SyncResult<SyncState> {
        SyncState::load(self.store.as_ref()).await
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
        let _ = self.event_tx.send(SyncEvent::PhaseChanged { phase });
    }

    /// Run one sync cycle.
    ///
    /// A trigger while a cycle is in flight is dropped, not queued.
    /// Transport failures are returned to the caller and leave the
    /// high-water mark untouched; they are never thrown into the
    /// scheduler.
    pub async fn run_cycle(&self, force_full: bool) -> SyncResult<SyncOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync cycle already in flight; dropping trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let _ = self.event_tx.send(SyncEvent::CycleStarted { forced: force_full });
        let result = self.cycle_inner(force_full).await;

        self.set_phase(CyclePhase::Idle);
        self.in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(SyncOutcome::Completed(stats)) => {
                info!(
                    transport = self.transport.name(),
                    sent = stats.sent,
                    received = stats.received,
                    devices = stats.devices,
                    "Sync cycle completed"
                );
                let _ = self.event_tx.send(SyncEvent::CycleCompleted { stats: *stats });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(transport = self.transport.name(), error = %e, "Sync cycle failed");
                let _ = self.event_tx.send(SyncEvent::CycleFailed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn cycle_inner(&self, force_full: bool) -> SyncResult<SyncOutcome> {
        self.set_phase(CyclePhase::FetchingLocalDelta);

        let state = SyncState::load(self.store.as_ref()).await?;
        let since = if force_full { 0 } else { state.last_sync };

        // Record our own presence first so it travels with the push
        let device = self.probe.device_info().await?;
        self.store.upsert_device(device.clone()).await?;

        // Harvest newly observed visits from the native source, if wired.
        // A collaborator failure is logged, not fatal to the cycle.
        if let Some(source) = &self.visit_source {
            match source.recent_visits(since).await {
                Ok(visits) => self.ingest_visits(visits, &device.device_id).await?,
                Err(e) => warn!(error = %e, "Visit source failed; syncing stored records only"),
            }
        }

        let unsynced = self.store.get_unsynced().await?;
        if unsynced.is_empty() && !force_full {
            debug!("No unsynced records; skipping network I/O");
            return Ok(SyncOutcome::NothingToSync);
        }

        self.set_phase(CyclePhase::Pushing);
        let push = SyncPush {
            records: unsynced.clone(),
            device,
            last_sync: since,
        };

        self.set_phase(CyclePhase::AwaitingRemote);
        let exchange = self.transport.exchange(push).await?;

        self.set_phase(CyclePhase::Merging);
        let received = self.store.merge_remote(exchange.remote_records).await?;
        let devices = exchange.remote_devices.len();
        for remote_device in exchange.remote_devices {
            self.store.upsert_device(remote_device).await?;
        }
        for record in &unsynced {
            self.store.mark_synced(&record.visit_id).await?;
        }

        // Monotonic: only ever advance
        if exchange.new_high_water_mark > state.last_sync {
            SyncState::store_high_water_mark(self.store.as_ref(), exchange.new_high_water_mark)
                .await?;
        }
        if !state.initialized {
            SyncState::mark_initialized(self.store.as_ref()).await?;
        }

        Ok(SyncOutcome::Completed(SyncStats {
            sent: unsynced.len(),
            received,
            devices,
        }))
    }

    /// Store raw visits from the native source as pending records.
    async fn ingest_visits(
        &self,
        visits: Vec<crate::system::RawVisit>,
        device_id: &str,
    ) -> SyncResult<()> {
        for visit in visits {
            let visit_id = visit
                .visit_id
                .unwrap_or_else(crate::types::new_visit_id);
            // Re-enumerated visits must not clobber existing records
            if self.store.get_record(&visit_id).await?.is_some() {
                continue;
            }
            let record = HistoryRecord {
                visit_id,
                url: visit.url,
                title: visit.title,
                visit_time: visit.visit_time,
                device_id: device_id.to_string(),
                referring_visit_id: visit.referring_visit_id,
                transition: visit.transition,
                sync_status: SyncStatus::Pending,
                last_modified: crate::types::now_millis(),
                deleted: false,
                page_content: None,
            };
            self.store.upsert_record(record).await?;
        }
        Ok(())
    }

    /// Begin the periodic schedule and the debounced activity listener.
    ///
    /// Called on the `Arc` handle (`coordinator.clone().start()`); the
    /// spawned tasks keep the coordinator alive until [`stop`](Self::stop).
    pub fn start(self: Arc<Self>) {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return;
        }

        info!(interval_secs = self.interval.as_secs(), "Starting periodic sync");
        let this = self.clone();
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick; manual triggers cover startup sync
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_cycle(false).await {
                    warn!(error = %e, "Periodic sync cycle failed");
                }
            }
        }));

        if let Some(mut rx) = self.activity_rx.lock().take() {
            let this = self.clone();
            *self.debounce.lock() = Some(tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    // Let a navigation burst settle, then fold it into one cycle
                    tokio::time::sleep(ACTIVITY_DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = this.run_cycle(false).await {
                        warn!(error = %e, "Activity-triggered sync failed");
                    }
                }
            }));
        }
    }

    /// Cancel the periodic schedule and activity listener.
    pub fn stop(&self) {
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.debounce.lock().take() {
            handle.abort();
        }
        info!("Stopped periodic sync");
    }

    /// Signal user activity (e.g. a navigation); cycles are debounced
    /// about a second so bursts collapse into one.
    pub fn notify_activity(&self) {
        // A full channel already holds a pending trigger
        let _ = self.activity_tx.try_send(());
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.debounce.lock().take() {
            handle.abort();
        }
    }
}
