//! Background Replay Worker
//!
//! Drains the pending-mutation queue against the notes backend. Every
//! trigger (reconnect, platform background-sync event, scheduler tick,
//! manual call) goes through `ReplayWorker::trigger`, so there is exactly one
//! replay path.
//!
//! Guarantees:
//! - At most one run at a time; triggers arriving mid-run are coalesced into
//!   one extra pass
//! - Mutations for the same note are sent in queue order; a failure defers
//!   the rest of that note's mutations to a later run
//! - A mutation is removed locally only after the server confirmed it

use super::api::{NoteBackend, RemoteError};
use super::error::SyncNotice;
use super::models::{MutationKind, NewNote, PendingMutation};
use super::queue::RetryPolicy;
use super::store::LocalStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Mutex};

/// Tag the platform uses for background-sync events
pub const BACKGROUND_SYNC_TAG: &str = "background-sync-notes";

/// What started a replay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayTrigger {
    Connectivity,
    BackgroundSync,
    Periodic,
    Manual,
    Startup,
}

impl ReplayTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::BackgroundSync => "background_sync",
            Self::Periodic => "periodic",
            Self::Manual => "manual",
            Self::Startup => "startup",
        }
    }

    /// Only scheduler ticks wait out `next_attempt_at`; explicit triggers
    /// retry everything immediately.
    fn honors_backoff(&self) -> bool {
        matches!(self, Self::Periodic)
    }
}

impl std::fmt::Display for ReplayTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one replay run (all passes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub trigger: ReplayTrigger,
    pub passes: u32,
    pub attempted: usize,
    pub applied: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dropped: usize,
    /// The run stopped on an authorization failure
    pub paused: bool,
}

impl ReplayReport {
    fn new(trigger: ReplayTrigger) -> Self {
        Self {
            trigger,
            passes: 0,
            attempted: 0,
            applied: 0,
            failed: 0,
            deferred: 0,
            dropped: 0,
            paused: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed(ReplayReport),
    /// Another run was in progress; it will make one more pass
    Coalesced,
    /// Replay is paused until the user signs in again
    Paused,
}

/// How a single send attempt was settled locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Confirmed by the server and removed from the queue
    Applied { note_id: String },
    /// Failed with a retryable error; still queued
    Queued(String),
    /// Refused by the server; removed from the queue
    Dropped(String),
    /// Session rejected; still queued and replay paused
    Unauthorized,
    /// Another task is sending this mutation right now
    Busy,
    /// Another sender already finished it; nothing was sent
    Settled,
}

/// Mutation ids currently being sent
#[derive(Default)]
struct InFlight {
    ids: StdMutex<HashSet<String>>,
}

impl InFlight {
    fn claim(self: &Arc<Self>, id: &str) -> Option<InFlightClaim> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            owner: self.clone(),
            id: id.to_string(),
        })
    }
}

/// Released on drop, including when the sending future is cancelled
struct InFlightClaim {
    owner: Arc<InFlight>,
    id: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut ids = self.owner.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct ReplayWorker {
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn NoteBackend>,
    policy: RetryPolicy,
    run_lock: Arc<Mutex<()>>,
    rerun_requested: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    notices: broadcast::Sender<SyncNotice>,
}

impl ReplayWorker {
    pub fn new(store: Arc<dyn LocalStore>, backend: Arc<dyn NoteBackend>, policy: RetryPolicy) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            store,
            backend,
            policy,
            run_lock: Arc::new(Mutex::new(())),
            rerun_requested: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(InFlight::default()),
            notices,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn publish(&self, notice: SyncNotice) {
        // Nobody listening is fine
        let _ = self.notices.send(notice);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Clear the authorization pause, typically after a new sign-in
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            log::info!("Replay resumed");
        }
    }

    /// Run replay now, or fold into the run already in progress
    pub async fn trigger(&self, trigger: ReplayTrigger) -> ReplayOutcome {
        if self.is_paused() {
            log::info!("Replay ({}) skipped: paused until sign-in", trigger);
            return ReplayOutcome::Paused;
        }

        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.rerun_requested.store(true, Ordering::SeqCst);
                log::debug!("Replay ({}) coalesced into running replay", trigger);
                return ReplayOutcome::Coalesced;
            }
        };

        let mut report = ReplayReport::new(trigger);
        let mut failed_this_run = HashSet::new();

        loop {
            self.rerun_requested.store(false, Ordering::SeqCst);
            self.run_pass(trigger, &mut report, &mut failed_this_run).await;
            report.passes += 1;

            if report.paused || !self.rerun_requested.load(Ordering::SeqCst) {
                break;
            }
            log::debug!("Replay re-running for triggers received mid-run");
        }

        if report.attempted > 0 || report.dropped > 0 {
            log::info!(
                "Replay ({}) finished: applied={}, failed={}, deferred={}, dropped={}",
                trigger,
                report.applied,
                report.failed,
                report.deferred,
                report.dropped
            );
        }

        ReplayOutcome::Completed(report)
    }

    /// Fire-and-forget trigger
    pub fn request_replay(&self, trigger: ReplayTrigger) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.trigger(trigger).await;
        });
    }

    async fn run_pass(
        &self,
        trigger: ReplayTrigger,
        report: &mut ReplayReport,
        failed_this_run: &mut HashSet<String>,
    ) {
        let snapshot = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Replay ({}) could not read the queue: {}", trigger, e);
                return;
            }
        };

        if snapshot.is_empty() {
            return;
        }

        log::info!("Replaying {} pending mutations ({})", snapshot.len(), trigger);

        let now = Utc::now();
        // Notes whose earlier mutation did not go through this pass
        let mut blocked: HashSet<String> = HashSet::new();
        // Temporary ids whose create was refused
        let mut abandoned: HashSet<String> = HashSet::new();
        // Temporary id -> server id for creates confirmed this pass
        let mut remapped: HashMap<String, String> = HashMap::new();

        for mut mutation in snapshot {
            if let Some(server_id) = remapped.get(&mutation.note_id) {
                mutation.note_id = server_id.clone();
            }

            if abandoned.contains(&mutation.note_id) {
                self.drop_mutation(&mutation, "note was never created on the server".to_string());
                report.dropped += 1;
                continue;
            }

            let waiting = trigger.honors_backoff() && !mutation.is_due(now);
            if blocked.contains(&mutation.note_id) || failed_this_run.contains(&mutation.id) || waiting {
                blocked.insert(mutation.note_id.clone());
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match self.apply(&mutation).await {
                Settlement::Applied { note_id } => {
                    report.applied += 1;
                    if mutation.kind == MutationKind::Create && note_id != mutation.note_id {
                        remapped.insert(mutation.note_id.clone(), note_id);
                    }
                }
                Settlement::Queued(_) => {
                    report.failed += 1;
                    failed_this_run.insert(mutation.id.clone());
                    blocked.insert(mutation.note_id.clone());
                }
                Settlement::Dropped(_) => {
                    report.dropped += 1;
                    if mutation.kind == MutationKind::Create {
                        abandoned.insert(mutation.note_id.clone());
                    }
                }
                Settlement::Unauthorized => {
                    report.paused = true;
                    break;
                }
                Settlement::Busy => {
                    report.attempted -= 1;
                    report.deferred += 1;
                    blocked.insert(mutation.note_id.clone());
                }
                Settlement::Settled => {
                    report.attempted -= 1;
                }
            }
        }
    }

    /// Send one persisted mutation and settle it against the local queue.
    ///
    /// The stored copy is what gets sent: the caller's copy may already have
    /// been sent by someone else, or re-pointed by a confirmed create.
    pub(crate) async fn apply(&self, mutation: &PendingMutation) -> Settlement {
        let Some(_claim) = self.in_flight.claim(&mutation.id) else {
            return Settlement::Busy;
        };

        let mut current = match self.store.get_pending(&mutation.id) {
            Ok(Some(current)) => current,
            Ok(None) => {
                log::debug!("Mutation {} already settled, not sending", mutation.id);
                return Settlement::Settled;
            }
            Err(e) => {
                log::warn!("Could not re-read mutation {}: {}", mutation.id, e);
                mutation.clone()
            }
        };

        if current.kind != MutationKind::Create {
            if let Ok(Some(server_id)) = self.store.server_id_for(&current.note_id) {
                log::debug!("Mutation {} re-pointed from {} to {}", current.id, current.note_id, server_id);
                current.note_id = server_id;
                if let Err(e) = self.store.put(&current) {
                    log::error!("Failed to re-point mutation {}: {}", current.id, e);
                }
            }
        }

        let result = self.send(&current).await;
        self.settle(&current, result)
    }

    /// Remote call for one mutation; yields the server id of the note
    async fn send(&self, mutation: &PendingMutation) -> Result<String, RemoteError> {
        match mutation.kind {
            MutationKind::Create => {
                let payload = mutation
                    .payload
                    .as_ref()
                    .ok_or_else(|| RemoteError::Rejected("create without payload".to_string()))?;

                if let Some(token) = &mutation.idempotency_key {
                    if let Some(existing) = self.backend.find_by_client_token(token).await? {
                        log::info!(
                            "Create {} was already applied as note {}",
                            mutation.id,
                            existing.id
                        );
                        return Ok(existing.id);
                    }
                }

                let note = NewNote::from_payload(payload, mutation.idempotency_key.clone());
                Ok(self.backend.insert(&note).await?.id)
            }
            MutationKind::Update => {
                let payload = mutation
                    .payload
                    .as_ref()
                    .ok_or_else(|| RemoteError::Rejected("update without payload".to_string()))?;
                self.backend.update_by_id(&mutation.note_id, payload).await?;
                Ok(mutation.note_id.clone())
            }
            MutationKind::Delete => {
                self.backend.delete_by_id(&mutation.note_id).await?;
                Ok(mutation.note_id.clone())
            }
        }
    }

    fn settle(&self, mutation: &PendingMutation, result: Result<String, RemoteError>) -> Settlement {
        match result {
            Ok(note_id) => self.confirm(mutation, note_id),
            Err(RemoteError::Unauthorized) => {
                if !self.paused.swap(true, Ordering::SeqCst) {
                    log::warn!("Backend rejected the session; replay paused until sign-in");
                    self.publish(SyncNotice::Unauthorized);
                }
                Settlement::Unauthorized
            }
            Err(e) if e.is_retryable() => {
                let error = e.to_string();
                self.keep_queued(mutation, &error);
                Settlement::Queued(error)
            }
            Err(e) => {
                let reason = match e {
                    RemoteError::NotFound(_) => "note no longer exists on the server".to_string(),
                    RemoteError::Rejected(reason) => reason,
                    other => other.to_string(),
                };
                self.drop_mutation(mutation, reason.clone());
                Settlement::Dropped(reason)
            }
        }
    }

    fn confirm(&self, mutation: &PendingMutation, note_id: String) -> Settlement {
        let cleared = match mutation.kind {
            MutationKind::Create => self.store.complete_create(&mutation.id, &mutation.note_id, &note_id),
            _ => self.store.remove(&mutation.id),
        };
        if let Err(e) = cleared {
            log::error!("Mutation {} applied but not cleared locally: {}", mutation.id, e);
        }

        log::info!("Applied {} for note {}", mutation.kind, note_id);

        if mutation.kind == MutationKind::Create && note_id != mutation.note_id {
            self.publish(SyncNotice::NoteIdAssigned {
                temp_id: mutation.note_id.clone(),
                note_id: note_id.clone(),
            });
        }
        Settlement::Applied { note_id }
    }

    fn keep_queued(&self, mutation: &PendingMutation, error: &str) {
        let attempts = mutation.attempts.saturating_add(1);
        let next_attempt_at = self.policy.next_attempt_at(attempts, Utc::now());

        if let Err(e) = self.store.record_failure(&mutation.id, error, next_attempt_at) {
            log::error!("Failed to record attempt for mutation {}: {}", mutation.id, e);
        }

        log::warn!(
            "{} for note {} failed (attempt {}), will retry: {}",
            mutation.kind,
            mutation.note_id,
            attempts,
            error
        );

        if attempts == self.policy.notice_after_attempts {
            self.publish(SyncNotice::PersistentFailure {
                mutation_id: mutation.id.clone(),
                note_id: mutation.note_id.clone(),
                attempts,
                last_error: error.to_string(),
            });
        }
    }

    fn drop_mutation(&self, mutation: &PendingMutation, reason: String) {
        if let Err(e) = self.store.remove(&mutation.id) {
            log::error!("Failed to remove rejected mutation {}: {}", mutation.id, e);
        }

        log::warn!(
            "Dropped {} for note {}: {}",
            mutation.kind,
            mutation.note_id,
            reason
        );

        self.publish(SyncNotice::Rejected {
            mutation_id: mutation.id.clone(),
            note_id: mutation.note_id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::NotePayload;
    use crate::sync::store::MemoryStore;
    use crate::sync::testing::FakeBackend;
    use chrono::Duration;

    fn setup() -> (Arc<MemoryStore>, Arc<FakeBackend>, ReplayWorker) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let worker = ReplayWorker::new(store.clone(), backend.clone(), RetryPolicy::default());
        (store, backend, worker)
    }

    fn queue(store: &MemoryStore, kind: MutationKind, note_id: &str, title: &str, offset_ms: i64) -> PendingMutation {
        let payload = NotePayload::new(title, format!("{} body", title));
        let at = Utc::now() - Duration::seconds(10) + Duration::milliseconds(offset_ms);
        let mutation = PendingMutation::new(kind, note_id, Some(payload), at);
        store.put(&mutation).unwrap();
        mutation
    }

    fn report(outcome: ReplayOutcome) -> ReplayReport {
        match outcome {
            ReplayOutcome::Completed(report) => report,
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_, backend, worker) = setup();

        let report = report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(report.attempted, 0);
        assert_eq!(report.passes, 1);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_remaps_later_mutations() {
        let (store, backend, worker) = setup();
        queue(&store, MutationKind::Create, "local-a", "First", 0);
        queue(&store, MutationKind::Update, "local-a", "Second", 1);

        let report = report(worker.trigger(ReplayTrigger::Connectivity).await);
        assert_eq!(report.applied, 2);
        assert!(store.list_pending().unwrap().is_empty());

        let notes = backend.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Second");
        assert_eq!(notes[0].client_token.as_deref(), Some("local-a"));
    }

    #[tokio::test]
    async fn test_failure_defers_same_note_only() {
        let (store, backend, worker) = setup();
        backend.seed("n1", "One");
        backend.seed("n2", "Two");
        backend.fail_note("n1");

        queue(&store, MutationKind::Update, "n1", "One v2", 0);
        queue(&store, MutationKind::Update, "n2", "Two v2", 1);
        queue(&store, MutationKind::Delete, "n1", "", 2);

        let report = report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].next_attempt_at.is_some());
        assert_eq!(pending[1].kind, MutationKind::Delete);
        assert_eq!(pending[1].attempts, 0);
        assert_eq!(backend.count_calls("delete"), 0);
    }

    #[tokio::test]
    async fn test_periodic_honors_backoff() {
        let (store, backend, worker) = setup();
        backend.seed("n1", "One");
        let mutation = queue(&store, MutationKind::Update, "n1", "One v2", 0);
        store
            .record_failure(&mutation.id, "timeout", Utc::now() + Duration::minutes(5))
            .unwrap();

        let periodic = report(worker.trigger(ReplayTrigger::Periodic).await);
        assert_eq!(periodic.attempted, 0);
        assert_eq!(periodic.deferred, 1);

        let manual = report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(manual.applied, 1);
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_create_abandons_followers() {
        let (store, backend, worker) = setup();
        backend.set_rejecting(true);
        let mut notices = worker.subscribe_notices();

        queue(&store, MutationKind::Create, "local-a", "Bad", 0);
        queue(&store, MutationKind::Update, "local-a", "Still bad", 1);

        let report = report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.dropped, 2);
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(backend.count_calls("update"), 0);

        assert!(matches!(notices.try_recv(), Ok(SyncNotice::Rejected { .. })));
        assert!(matches!(notices.try_recv(), Ok(SyncNotice::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_update_of_missing_note_is_dropped() {
        let (store, _, worker) = setup();
        queue(&store, MutationKind::Update, "gone", "Edit", 0);

        let report = report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(report.dropped, 1);
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_pauses() {
        let (store, backend, worker) = setup();
        backend.set_unauthorized(true);
        let mut notices = worker.subscribe_notices();

        queue(&store, MutationKind::Create, "local-a", "A", 0);
        queue(&store, MutationKind::Create, "local-b", "B", 1);

        let report = report(worker.trigger(ReplayTrigger::Manual).await);
        assert!(report.paused);
        assert_eq!(report.attempted, 1);
        assert!(worker.is_paused());
        assert_eq!(store.list_pending().unwrap().len(), 2);
        assert_eq!(notices.try_recv().unwrap(), SyncNotice::Unauthorized);

        assert_eq!(worker.trigger(ReplayTrigger::Manual).await, ReplayOutcome::Paused);

        backend.set_unauthorized(false);
        worker.resume();
        let report = self::report(worker.trigger(ReplayTrigger::Manual).await);
        assert_eq!(report.applied, 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_notice_once() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let policy = RetryPolicy {
            notice_after_attempts: 2,
            ..RetryPolicy::default()
        };
        let worker = ReplayWorker::new(store.clone(), backend.clone(), policy);
        let mut notices = worker.subscribe_notices();

        backend.set_unreachable(true);
        queue(&store, MutationKind::Create, "local-a", "A", 0);

        for _ in 0..3 {
            worker.trigger(ReplayTrigger::Manual).await;
        }

        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].attempts, 3);
        assert!(matches!(
            notices.try_recv(),
            Ok(SyncNotice::PersistentFailure { attempts: 2, .. })
        ));
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_coalesce() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::with_delay(std::time::Duration::from_millis(50)));
        let worker = ReplayWorker::new(store.clone(), backend.clone(), RetryPolicy::default());

        queue(&store, MutationKind::Create, "local-a", "A", 0);
        queue(&store, MutationKind::Create, "local-b", "B", 1);

        let (first, second) = tokio::join!(
            worker.trigger(ReplayTrigger::Connectivity),
            worker.trigger(ReplayTrigger::BackgroundSync)
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| **o == ReplayOutcome::Coalesced).count(), 1);
        let report = outcomes
            .iter()
            .find_map(|o| match o {
                ReplayOutcome::Completed(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(backend.count_calls("insert"), 2);
        assert_eq!(backend.notes().len(), 2);
    }

    #[tokio::test]
    async fn test_settled_copy_is_not_sent_again() {
        let (store, backend, worker) = setup();
        backend.seed("n1", "One");

        let stale = queue(&store, MutationKind::Update, "n1", "Old", 0);
        assert!(matches!(worker.apply(&stale).await, Settlement::Applied { .. }));
        let newer = queue(&store, MutationKind::Update, "n1", "New", 1);
        assert!(matches!(worker.apply(&newer).await, Settlement::Applied { .. }));

        assert_eq!(worker.apply(&stale).await, Settlement::Settled);
        assert_eq!(backend.count_calls("update"), 2);
        assert_eq!(backend.notes()[0].title, "New");
    }

    #[tokio::test]
    async fn test_confirmed_create_assigns_id_to_later_mutations() {
        let (store, backend, worker) = setup();
        let mut notices = worker.subscribe_notices();

        let create = queue(&store, MutationKind::Create, "local-a", "Draft", 0);
        let server_id = match worker.apply(&create).await {
            Settlement::Applied { note_id } => note_id,
            other => panic!("expected the create to apply, got {:?}", other),
        };
        assert_eq!(
            notices.try_recv().unwrap(),
            SyncNotice::NoteIdAssigned { temp_id: "local-a".into(), note_id: server_id.clone() }
        );

        // Stored with the temporary id after the create already went through
        let edit = queue(&store, MutationKind::Update, "local-a", "Edited", 1);
        assert_eq!(worker.apply(&edit).await, Settlement::Applied { note_id: server_id.clone() });
        assert_eq!(backend.notes()[0].title, "Edited");
        assert!(backend.calls().contains(&format!("update:{}", server_id)));
    }

    #[tokio::test]
    async fn test_in_flight_claim_blocks_second_sender() {
        let (store, _, worker) = setup();
        let mutation = queue(&store, MutationKind::Create, "local-a", "A", 0);

        let claim = worker.in_flight.claim(&mutation.id).unwrap();
        assert_eq!(worker.apply(&mutation).await, Settlement::Busy);
        drop(claim);

        assert!(matches!(worker.apply(&mutation).await, Settlement::Applied { .. }));
    }
}
