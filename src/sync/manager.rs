//! Sync Manager - Orchestrates the offline sync path
//!
//! Wires the local store, the connectivity monitor, the queue manager and the
//! replay worker together and exposes the operations the UI layer calls.
//! Handles:
//! - Note mutations (queued first, sent when online)
//! - Offline reads from the note cache, with pending changes overlaid
//! - Replay on reconnect, on background-sync events and on a schedule
//! - Pausing on authorization failures until the user signs in again

use super::api::{NoteBackend, RemoteError};
use super::connectivity::{spawn_probe, Connectivity, ConnectivityMonitor};
use super::error::{SyncError, SyncNotice};
use super::models::{overlay_pending, CachedNote, MutationKind, NotePayload, PendingMutation};
use super::queue::{ApplyOutcome, QueueManager, QueueStats, RetryPolicy};
use super::replay::{ReplayOutcome, ReplayTrigger, ReplayWorker, BACKGROUND_SYNC_TAG};
use super::scheduler::{BackgroundScheduler, SchedulerConfig};
use super::store::{DegradingStore, LocalStore};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Construction options for `SyncManager`
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub initial_connectivity: Connectivity,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
    /// Ping the backend at this interval to drive connectivity; `None`
    /// leaves connectivity to `set_online`
    pub probe_interval: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            initial_connectivity: Connectivity::Online,
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            probe_interval: None,
        }
    }
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn NoteBackend>,
    monitor: ConnectivityMonitor,
    queue: Arc<QueueManager>,
    worker: ReplayWorker,
    scheduler: BackgroundScheduler,
    probe_interval: Option<Duration>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl SyncManager {
    pub fn new(store: Arc<dyn LocalStore>, backend: Arc<dyn NoteBackend>, options: SyncOptions) -> Self {
        let monitor = ConnectivityMonitor::new(options.initial_connectivity);
        let worker = ReplayWorker::new(store.clone(), backend.clone(), options.retry);
        let queue = QueueManager::new(store.clone(), monitor.clone(), worker.clone());
        let scheduler = BackgroundScheduler::new(worker.clone(), options.scheduler);

        Self {
            store,
            backend,
            monitor,
            queue: Arc::new(queue),
            worker,
            scheduler,
            probe_interval: options.probe_interval,
            tasks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the reconnect bridge, the connectivity probe and the scheduler
    pub async fn start(&self) {
        let mut handles = vec![self.spawn_reconnect_bridge()];

        if let Some(interval) = self.probe_interval {
            handles.push(spawn_probe(self.monitor.clone(), self.backend.clone(), interval));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        if self.scheduler.get_config().await.enabled {
            if let Err(e) = self.scheduler.start().await {
                log::warn!("Background scheduler not started: {}", e);
            }
        }

        log::info!("Sync manager started ({})", self.monitor.current().as_str());
    }

    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        if self.scheduler.is_running() {
            let _ = self.scheduler.stop().await;
        }

        log::info!("Sync manager stopped");
    }

    /// Every Offline -> Online transition starts one replay run
    fn spawn_reconnect_bridge(&self) -> JoinHandle<()> {
        let mut reconnects = self.monitor.subscribe_reconnects();
        let worker = self.worker.clone();

        tokio::spawn(async move {
            loop {
                match reconnects.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        worker.trigger(ReplayTrigger::Connectivity).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Relay storage degradation from `store` as user notices
    pub fn watch_storage(&self, store: &DegradingStore) {
        if store.is_degraded() {
            self.worker.publish(SyncNotice::StorageDegraded {
                reason: "offline storage could not be opened".to_string(),
            });
        }

        let mut degradations = store.subscribe_degradation();
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move {
            while let Ok(reason) = degradations.recv().await {
                worker.publish(SyncNotice::StorageDegraded { reason });
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn apply_mutation(
        &self,
        kind: MutationKind,
        note_id: &str,
        payload: Option<NotePayload>,
    ) -> Result<ApplyOutcome, SyncError> {
        self.queue.apply_mutation(kind, note_id, payload).await
    }

    pub fn pending_mutations(&self) -> Result<Vec<PendingMutation>, SyncError> {
        self.queue.pending()
    }

    pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        self.queue.stats()
    }

    pub fn discard_mutation(&self, mutation_id: &str) -> Result<(), SyncError> {
        self.queue.discard(mutation_id)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Last server-confirmed note list
    pub fn get_cached_notes(&self) -> Result<Vec<CachedNote>, SyncError> {
        Ok(self.store.list_cache()?)
    }

    /// Cached notes with queued changes applied on top
    pub fn get_notes_with_pending(&self) -> Result<Vec<CachedNote>, SyncError> {
        let cached = self.store.list_cache()?;
        let pending = self.store.list_pending()?;
        Ok(overlay_pending(cached, &pending))
    }

    /// Fetch the note list and replace the cache with it.
    ///
    /// Offline, or when the fetch fails for a retryable reason, the cached
    /// list is returned unchanged.
    pub async fn refresh_cache(&self) -> Result<Vec<CachedNote>, SyncError> {
        if !self.monitor.is_online() {
            return self.get_cached_notes();
        }

        match self.backend.list_notes().await {
            Ok(notes) => {
                let cached: Vec<CachedNote> = notes.into_iter().map(CachedNote::from).collect();
                self.store.replace_cache(&cached)?;
                log::info!("Note cache refreshed ({} notes)", cached.len());
                self.get_cached_notes()
            }
            Err(RemoteError::Unauthorized) => Err(SyncError::Unauthorized),
            Err(e) => {
                log::warn!("Note list fetch failed, serving cache: {}", e);
                self.get_cached_notes()
            }
        }
    }

    // ========================================================================
    // Connectivity and replay
    // ========================================================================

    /// Feed a platform connectivity signal
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Register a UI callback for online/offline changes
    pub fn on_connectivity_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Connectivity) + Send + 'static,
    {
        self.monitor.on_change(handler)
    }

    /// Platform background-sync event
    pub async fn handle_sync_event(&self, tag: &str) -> Result<ReplayOutcome, SyncError> {
        if tag != BACKGROUND_SYNC_TAG {
            log::debug!("Ignoring background-sync event with tag {}", tag);
            return Err(SyncError::UnknownSyncTag(tag.to_string()));
        }
        Ok(self.worker.trigger(ReplayTrigger::BackgroundSync).await)
    }

    pub async fn replay_now(&self) -> ReplayOutcome {
        self.worker.trigger(ReplayTrigger::Manual).await
    }

    /// Replay whatever survived the last session
    pub async fn replay_on_startup(&self) -> ReplayOutcome {
        self.worker.trigger(ReplayTrigger::Startup).await
    }

    /// Clear the authorization pause and drain the queue
    pub async fn resume_after_login(&self) -> ReplayOutcome {
        self.worker.resume();
        self.worker.trigger(ReplayTrigger::Manual).await
    }

    pub fn is_paused(&self) -> bool {
        self.worker.is_paused()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.worker.subscribe_notices()
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }
}
