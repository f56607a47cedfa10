//! Sync Queue Manager - Durable, ordered queue of note mutations
//!
//! Every note change is written to the local store before anything goes over
//! the network. When online, the mutation is sent right away; when offline
//! (or when sending fails) it stays queued for the replay worker.
//!
//! Features:
//! - Strictly increasing enqueue timestamps, so queue order is call order
//! - Per-note ordering: a new mutation never overtakes an older one
//! - Exponential backoff for periodic retries, no retry cap
//! - Queue status reporting

use super::connectivity::ConnectivityMonitor;
use super::error::SyncError;
use super::models::{MutationKind, NotePayload, PendingMutation};
use super::replay::{ReplayTrigger, ReplayWorker, Settlement};
use super::store::LocalStore;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30; // First retry: 30 seconds
const MAX_DELAY_SECS: i64 = 3600; // Backoff ceiling: 1 hour
const DEFAULT_NOTICE_AFTER: u32 = 5; // Failures before the user is told

// ============================================================================
// Retry policy
// ============================================================================

/// Backoff applied between periodic attempts of a failing mutation.
///
/// Mutations are never dropped for transport failures; after
/// `notice_after_attempts` failures the user gets one persistent-failure
/// notice and retries continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    pub notice_after_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: BASE_DELAY_SECS,
            max_delay_secs: MAX_DELAY_SECS,
            notice_after_attempts: DEFAULT_NOTICE_AFTER,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failure
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_delay_secs);
        Duration::seconds(secs)
    }

    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        (now + self.delay_for(attempts)).trunc_subsecs(6)
    }
}

// ============================================================================
// Enqueue clock
// ============================================================================

/// Hands out strictly increasing microsecond timestamps.
///
/// Two mutations enqueued within the same microsecond (or across a wall
/// clock step backwards) still get distinct, ordered `enqueued_at` values.
pub struct MonotonicClock {
    last: StdMutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::seeded(None)
    }

    /// Continue after the newest timestamp already in the queue
    pub fn seeded(last: Option<DateTime<Utc>>) -> Self {
        Self {
            last: StdMutex::new(last),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let next = match *last {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Result of `QueueManager::apply_mutation`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// True when the mutation is waiting for a later replay
    pub queued: bool,
    pub mutation_id: String,
    /// Server id once a create went through, otherwise the id given
    pub note_id: String,
}

impl ApplyOutcome {
    fn queued(mutation: &PendingMutation) -> Self {
        Self {
            queued: true,
            mutation_id: mutation.id.clone(),
            note_id: mutation.note_id.clone(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub create_count: usize,
    pub update_count: usize,
    pub delete_count: usize,
    /// Mutations that failed at least once
    pub retrying_count: usize,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn from_pending(pending: &[PendingMutation]) -> Self {
        let mut stats = Self {
            pending_count: pending.len(),
            ..Self::default()
        };

        for mutation in pending {
            match mutation.kind {
                MutationKind::Create => stats.create_count += 1,
                MutationKind::Update => stats.update_count += 1,
                MutationKind::Delete => stats.delete_count += 1,
            }
            if mutation.attempts > 0 {
                stats.retrying_count += 1;
            }
        }

        stats.oldest_enqueued_at = pending.iter().map(|m| m.enqueued_at).min();
        stats
    }
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Entry point for note mutations issued by the UI
pub struct QueueManager {
    store: Arc<dyn LocalStore>,
    monitor: ConnectivityMonitor,
    worker: ReplayWorker,
    clock: MonotonicClock,
}

impl QueueManager {
    pub fn new(store: Arc<dyn LocalStore>, monitor: ConnectivityMonitor, worker: ReplayWorker) -> Self {
        let newest = store
            .list_pending()
            .ok()
            .and_then(|pending| pending.iter().map(|m| m.enqueued_at).max());

        Self {
            store,
            monitor,
            worker,
            clock: MonotonicClock::seeded(newest),
        }
    }

    /// Persist a note mutation, then try to send it if online.
    ///
    /// Transport failures are absorbed: the mutation stays queued and
    /// `queued` is true. `RemoteRejected` means the server refused it and it
    /// was removed; `Unauthorized` means it is still queued but replay is
    /// paused until sign-in.
    ///
    /// A temporary id whose create already went through is replaced by the
    /// server id before the mutation is stored.
    pub async fn apply_mutation(
        &self,
        kind: MutationKind,
        note_id: &str,
        payload: Option<NotePayload>,
    ) -> Result<ApplyOutcome, SyncError> {
        validate(kind, note_id, payload.as_ref())?;

        let resolved = self.resolve_note_id(kind, note_id)?;
        let note_id = resolved.as_str();

        let mutation = PendingMutation::new(kind, note_id, payload, self.clock.next());
        self.store.put(&mutation)?;

        log::info!("Queued {} for note {} ({})", kind, note_id, mutation.id);

        if !self.monitor.is_online() {
            log::debug!("Offline, {} stays queued", mutation.id);
            return Ok(ApplyOutcome::queued(&mutation));
        }

        if self.worker.is_paused() {
            return Ok(ApplyOutcome::queued(&mutation));
        }

        if self.has_older_pending(&mutation)? {
            log::debug!("Note {} has older pending mutations, replaying in order", note_id);
            self.worker.request_replay(ReplayTrigger::Manual);
            return Ok(ApplyOutcome::queued(&mutation));
        }

        match self.worker.apply(&mutation).await {
            Settlement::Applied { note_id } => Ok(ApplyOutcome {
                queued: false,
                mutation_id: mutation.id,
                note_id,
            }),
            Settlement::Settled => Ok(ApplyOutcome {
                queued: false,
                note_id: self.resolve_note_id(kind, &mutation.note_id)?,
                mutation_id: mutation.id,
            }),
            Settlement::Queued(_) | Settlement::Busy => Ok(ApplyOutcome::queued(&mutation)),
            Settlement::Dropped(reason) => Err(SyncError::RemoteRejected {
                note_id: mutation.note_id,
                reason,
            }),
            Settlement::Unauthorized => Err(SyncError::Unauthorized),
        }
    }

    /// Pending mutations in replay order
    pub fn pending(&self) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.store.list_pending()?)
    }

    pub fn stats(&self) -> Result<QueueStats, SyncError> {
        Ok(QueueStats::from_pending(&self.store.list_pending()?))
    }

    /// Give up on a queued mutation without sending it
    pub fn discard(&self, mutation_id: &str) -> Result<(), SyncError> {
        self.store.remove(mutation_id)?;
        log::info!("Discarded pending mutation {}", mutation_id);
        Ok(())
    }

    fn resolve_note_id(&self, kind: MutationKind, note_id: &str) -> Result<String, SyncError> {
        if kind == MutationKind::Create {
            return Ok(note_id.to_string());
        }

        match self.store.server_id_for(note_id)? {
            Some(server_id) => {
                log::debug!("Note {} resolved to server id {}", note_id, server_id);
                Ok(server_id)
            }
            None => Ok(note_id.to_string()),
        }
    }

    fn has_older_pending(&self, mutation: &PendingMutation) -> Result<bool, SyncError> {
        let pending = self.store.list_pending()?;
        Ok(pending.iter().any(|other| {
            other.note_id == mutation.note_id && other.queue_order(mutation).is_lt()
        }))
    }
}

fn validate(kind: MutationKind, note_id: &str, payload: Option<&NotePayload>) -> Result<(), SyncError> {
    if note_id.trim().is_empty() {
        return Err(SyncError::InvalidMutation("note id is empty".to_string()));
    }

    if kind.requires_payload() {
        match payload {
            None => {
                return Err(SyncError::InvalidMutation(format!("{} requires a payload", kind)));
            }
            Some(p) if p.is_blank() => {
                return Err(SyncError::InvalidMutation(
                    "title or content is required".to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connectivity::Connectivity;
    use crate::sync::models::new_temporary_note_id;
    use crate::sync::store::MemoryStore;
    use crate::sync::testing::FakeBackend;

    fn setup(online: bool) -> (Arc<MemoryStore>, Arc<FakeBackend>, ConnectivityMonitor, QueueManager) {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let monitor = ConnectivityMonitor::new(Connectivity::from_online(online));
        let worker = ReplayWorker::new(store.clone(), backend.clone(), RetryPolicy::default());
        let queue = QueueManager::new(store.clone(), monitor.clone(), worker);
        (store, backend, monitor, queue)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::seconds(30));
        assert_eq!(policy.delay_for(2), Duration::seconds(60));
        assert_eq!(policy.delay_for(3), Duration::seconds(120));
        assert_eq!(policy.delay_for(8), Duration::seconds(3600));
        assert_eq!(policy.delay_for(u32::MAX), Duration::seconds(3600));
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut previous = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_clock_continues_after_seed() {
        let future = Utc::now().trunc_subsecs(6) + Duration::hours(1);
        let clock = MonotonicClock::seeded(Some(future));
        assert_eq!(clock.next(), future + Duration::microseconds(1));
    }

    #[tokio::test]
    async fn test_invalid_mutation_is_not_persisted() {
        let (store, _, _, queue) = setup(true);

        let blank = queue
            .apply_mutation(MutationKind::Create, "local-a", Some(NotePayload::new("", "  ")))
            .await;
        assert!(matches!(blank, Err(SyncError::InvalidMutation(_))));

        let missing = queue.apply_mutation(MutationKind::Update, "n1", None).await;
        assert!(matches!(missing, Err(SyncError::InvalidMutation(_))));

        let no_id = queue.apply_mutation(MutationKind::Delete, " ", None).await;
        assert!(matches!(no_id, Err(SyncError::InvalidMutation(_))));

        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_mutations_queue_in_call_order() {
        let (store, backend, _, queue) = setup(false);
        let temp = new_temporary_note_id();

        let created = queue
            .apply_mutation(MutationKind::Create, &temp, Some(NotePayload::new("P1", "body")))
            .await
            .unwrap();
        let updated = queue
            .apply_mutation(MutationKind::Update, &temp, Some(NotePayload::new("P2", "body")))
            .await
            .unwrap();
        let deleted = queue.apply_mutation(MutationKind::Delete, "n9", None).await.unwrap();

        assert!(created.queued && updated.queued && deleted.queued);
        assert!(backend.calls().is_empty());

        let pending = store.list_pending().unwrap();
        let ids: Vec<&str> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![
            created.mutation_id.as_str(),
            updated.mutation_id.as_str(),
            deleted.mutation_id.as_str(),
        ]);
        assert!(pending[0].enqueued_at < pending[1].enqueued_at);
        assert!(pending[2].payload.is_none());
    }

    #[tokio::test]
    async fn test_online_create_applies_immediately() {
        let (store, backend, _, queue) = setup(true);
        let temp = new_temporary_note_id();

        let outcome = queue
            .apply_mutation(MutationKind::Create, &temp, Some(NotePayload::new("Hello", "world")))
            .await
            .unwrap();

        assert!(!outcome.queued);
        assert_ne!(outcome.note_id, temp);
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(backend.notes()[0].id, outcome.note_id);
    }

    #[tokio::test]
    async fn test_transport_failure_stays_queued() {
        let (store, backend, _, queue) = setup(true);
        backend.set_unreachable(true);

        let outcome = queue
            .apply_mutation(MutationKind::Create, "local-a", Some(NotePayload::new("Hello", "")))
            .await
            .unwrap();

        assert!(outcome.queued);
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_rejection_surfaces_and_drops() {
        let (store, backend, _, queue) = setup(true);
        backend.set_rejecting(true);

        let result = queue
            .apply_mutation(MutationKind::Create, "local-a", Some(NotePayload::new("Hello", "")))
            .await;

        assert!(matches!(result, Err(SyncError::RemoteRejected { .. })));
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_keeps_mutation() {
        let (store, backend, _, queue) = setup(true);
        backend.set_unauthorized(true);

        let result = queue.apply_mutation(MutationKind::Delete, "n1", None).await;
        assert_eq!(result, Err(SyncError::Unauthorized));
        assert_eq!(store.list_pending().unwrap().len(), 1);

        // Paused: later mutations queue without touching the network
        let calls = backend.calls().len();
        let outcome = queue.apply_mutation(MutationKind::Delete, "n2", None).await.unwrap();
        assert!(outcome.queued);
        assert_eq!(backend.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_newer_mutation_waits_for_older() {
        let (store, backend, monitor, queue) = setup(false);
        backend.seed("n1", "Original");

        queue
            .apply_mutation(MutationKind::Update, "n1", Some(NotePayload::new("First", "")))
            .await
            .unwrap();

        monitor.set_online(true);
        let outcome = queue
            .apply_mutation(MutationKind::Update, "n1", Some(NotePayload::new("Second", "")))
            .await
            .unwrap();
        assert!(outcome.queued);

        // The spawned replay drains both in order
        for _ in 0..100 {
            if store.list_pending().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(backend.notes()[0].title, "Second");
    }

    #[tokio::test]
    async fn test_assigned_server_id_replaces_temporary_id() {
        let (store, backend, _, queue) = setup(false);
        let create = PendingMutation::new(
            MutationKind::Create,
            "local-a",
            Some(NotePayload::new("A", "")),
            Utc::now(),
        );
        store.put(&create).unwrap();
        store.complete_create(&create.id, "local-a", "srv-1").unwrap();

        let outcome = queue
            .apply_mutation(MutationKind::Update, "local-a", Some(NotePayload::new("A2", "")))
            .await
            .unwrap();
        assert_eq!(outcome.note_id, "srv-1");

        let deleted = queue.apply_mutation(MutationKind::Delete, "local-a", None).await.unwrap();
        assert_eq!(deleted.note_id, "srv-1");

        let pending = store.list_pending().unwrap();
        assert!(pending.iter().all(|m| m.note_id == "srv-1"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_discard() {
        let (store, backend, _, queue) = setup(true);
        backend.set_unreachable(true);

        queue
            .apply_mutation(MutationKind::Create, "local-a", Some(NotePayload::new("A", "")))
            .await
            .unwrap();
        let delete = queue.apply_mutation(MutationKind::Delete, "n1", None).await.unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.create_count, 1);
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.retrying_count, 2);
        assert_eq!(stats.oldest_enqueued_at, Some(queue.pending().unwrap()[0].enqueued_at));

        queue.discard(&delete.mutation_id).unwrap();
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }
}
