//! Local Store - durable home of the pending queue and the note cache
//!
//! `LocalStore` is the contract the queue and the replay worker use.
//! Implementations:
//! - `Database`: SQLite file, survives restarts
//! - `MemoryStore`: process memory only
//! - `DegradingStore`: SQLite until it fails, memory for the rest of the session

use super::models::{CachedNote, PendingMutation};
use crate::db::{Database, DbError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;

// ============================================================================
// Contract
// ============================================================================

/// Transactional storage for pending mutations and cached notes.
///
/// Every method is one store-level transaction. Listing is restartable and
/// keeps no cursor between calls.
pub trait LocalStore: Send + Sync {
    /// Insert or overwrite by `id`
    fn put(&self, mutation: &PendingMutation) -> StoreResult<()>;

    /// All pending mutations ordered by `enqueued_at` ascending
    fn list_pending(&self) -> StoreResult<Vec<PendingMutation>>;

    /// Current stored copy, or `None` once it left the queue
    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingMutation>>;

    /// Delete by id; absent ids are not an error
    fn remove(&self, id: &str) -> StoreResult<()>;

    /// Count a failed attempt and schedule the next one
    fn record_failure(&self, id: &str, error: &str, next_attempt_at: DateTime<Utc>) -> StoreResult<()>;

    /// Drop a confirmed create, record `temp_note_id -> server_note_id`, and
    /// re-point later mutations to the server id, atomically
    fn complete_create(&self, mutation_id: &str, temp_note_id: &str, server_note_id: &str) -> StoreResult<()>;

    /// Server id assigned to a temporary note id by an earlier create
    fn server_id_for(&self, temp_note_id: &str) -> StoreResult<Option<String>>;

    /// Clear and rewrite the cache; readers never see a partial cache
    fn replace_cache(&self, notes: &[CachedNote]) -> StoreResult<()>;

    fn list_cache(&self) -> StoreResult<Vec<CachedNote>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

// ============================================================================
// SQLite
// ============================================================================

impl LocalStore for Database {
    fn put(&self, mutation: &PendingMutation) -> StoreResult<()> {
        Ok(self.upsert_pending(mutation)?)
    }

    fn list_pending(&self) -> StoreResult<Vec<PendingMutation>> {
        Ok(Database::list_pending(self)?)
    }

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
        match Database::get_pending(self, id) {
            Ok(mutation) => Ok(Some(mutation)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        self.delete_pending(id)?;
        Ok(())
    }

    fn record_failure(&self, id: &str, error: &str, next_attempt_at: DateTime<Utc>) -> StoreResult<()> {
        Ok(self.record_pending_failure(id, error, &next_attempt_at)?)
    }

    fn complete_create(&self, mutation_id: &str, temp_note_id: &str, server_note_id: &str) -> StoreResult<()> {
        let moved = Database::complete_create(self, mutation_id, temp_note_id, server_note_id)?;
        if moved > 0 {
            log::debug!("Re-pointed {} pending mutations from {} to {}", moved, temp_note_id, server_note_id);
        }
        Ok(())
    }

    fn server_id_for(&self, temp_note_id: &str) -> StoreResult<Option<String>> {
        Ok(Database::server_id_for(self, temp_note_id)?)
    }

    fn replace_cache(&self, notes: &[CachedNote]) -> StoreResult<()> {
        Ok(self.replace_cached_notes(notes)?)
    }

    fn list_cache(&self) -> StoreResult<Vec<CachedNote>> {
        Ok(self.list_cached_notes()?)
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Default)]
struct MemoryTables {
    pending: HashMap<String, PendingMutation>,
    note_ids: HashMap<String, String>,
    cache: Vec<CachedNote>,
}

/// Volatile store used when durable storage is unavailable
#[derive(Default)]
pub struct MemoryStore {
    tables: StdMutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        // A panic while holding the lock cannot leave the maps half-written
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn put(&self, mutation: &PendingMutation) -> StoreResult<()> {
        self.tables().pending.insert(mutation.id.clone(), mutation.clone());
        Ok(())
    }

    fn list_pending(&self) -> StoreResult<Vec<PendingMutation>> {
        let mut pending: Vec<PendingMutation> = self.tables().pending.values().cloned().collect();
        pending.sort_by(|a, b| a.queue_order(b));
        Ok(pending)
    }

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
        Ok(self.tables().pending.get(id).cloned())
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        self.tables().pending.remove(id);
        Ok(())
    }

    fn record_failure(&self, id: &str, error: &str, next_attempt_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mutation) = self.tables().pending.get_mut(id) {
            mutation.attempts += 1;
            mutation.last_error = Some(error.to_string());
            mutation.next_attempt_at = Some(next_attempt_at);
        }
        Ok(())
    }

    fn complete_create(&self, mutation_id: &str, temp_note_id: &str, server_note_id: &str) -> StoreResult<()> {
        let mut tables = self.tables();
        tables.pending.remove(mutation_id);
        if temp_note_id == server_note_id {
            return Ok(());
        }

        tables
            .note_ids
            .insert(temp_note_id.to_string(), server_note_id.to_string());
        for mutation in tables.pending.values_mut() {
            if mutation.note_id == temp_note_id {
                mutation.note_id = server_note_id.to_string();
            }
        }
        Ok(())
    }

    fn server_id_for(&self, temp_note_id: &str) -> StoreResult<Option<String>> {
        Ok(self.tables().note_ids.get(temp_note_id).cloned())
    }

    fn replace_cache(&self, notes: &[CachedNote]) -> StoreResult<()> {
        self.tables().cache = notes.to_vec();
        Ok(())
    }

    fn list_cache(&self) -> StoreResult<Vec<CachedNote>> {
        let mut cache = self.tables().cache.clone();
        cache.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(cache)
    }
}

// ============================================================================
// Degrading wrapper
// ============================================================================

/// Durable store that falls back to memory after the first storage failure.
///
/// Once degraded it stays in memory for the rest of the session; whatever was
/// already on disk is picked up again by the next process.
pub struct DegradingStore {
    durable: Option<Arc<dyn LocalStore>>,
    memory: MemoryStore,
    degraded: AtomicBool,
    notices: broadcast::Sender<String>,
}

impl DegradingStore {
    pub fn new(durable: Arc<dyn LocalStore>) -> Self {
        let (notices, _) = broadcast::channel(8);
        Self {
            durable: Some(durable),
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            notices,
        }
    }

    /// Store that never had durable storage
    pub fn memory_only(reason: impl Into<String>) -> Self {
        let (notices, _) = broadcast::channel(8);
        let reason = reason.into();
        log::warn!("Offline storage degraded to memory only: {}", reason);
        Self {
            durable: None,
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(true),
            notices,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Reasons published whenever the store switches to memory
    pub fn subscribe_degradation(&self) -> broadcast::Receiver<String> {
        self.notices.subscribe()
    }

    fn active(&self) -> Option<&Arc<dyn LocalStore>> {
        if self.is_degraded() {
            None
        } else {
            self.durable.as_ref()
        }
    }

    fn degrade(&self, durable: &Arc<dyn LocalStore>, err: &StoreError) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }

        log::warn!("Offline storage failed, continuing in memory for this session: {}", err);

        // Best effort: carry over whatever is still readable
        if let Ok(pending) = durable.list_pending() {
            for mutation in &pending {
                let _ = self.memory.put(mutation);
            }
        }
        if let Ok(cache) = durable.list_cache() {
            let _ = self.memory.replace_cache(&cache);
        }

        let _ = self.notices.send(err.to_string());
    }

    fn with_fallback<T>(&self, op: impl Fn(&dyn LocalStore) -> StoreResult<T>) -> StoreResult<T> {
        if let Some(durable) = self.active() {
            match op(durable.as_ref()) {
                Ok(value) => return Ok(value),
                Err(err) => self.degrade(durable, &err),
            }
        }
        op(&self.memory as &dyn LocalStore)
    }
}

impl LocalStore for DegradingStore {
    fn put(&self, mutation: &PendingMutation) -> StoreResult<()> {
        self.with_fallback(|store| store.put(mutation))
    }

    fn list_pending(&self) -> StoreResult<Vec<PendingMutation>> {
        self.with_fallback(|store| store.list_pending())
    }

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
        self.with_fallback(|store| store.get_pending(id))
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        self.with_fallback(|store| store.remove(id))
    }

    fn record_failure(&self, id: &str, error: &str, next_attempt_at: DateTime<Utc>) -> StoreResult<()> {
        self.with_fallback(|store| store.record_failure(id, error, next_attempt_at))
    }

    fn complete_create(&self, mutation_id: &str, temp_note_id: &str, server_note_id: &str) -> StoreResult<()> {
        self.with_fallback(|store| store.complete_create(mutation_id, temp_note_id, server_note_id))
    }

    fn server_id_for(&self, temp_note_id: &str) -> StoreResult<Option<String>> {
        let found = self.with_fallback(|store| store.server_id_for(temp_note_id))?;
        if found.is_some() || !self.is_degraded() {
            return Ok(found);
        }

        // Ids assigned before the switch may still be readable on disk
        Ok(self
            .durable
            .as_ref()
            .and_then(|durable| durable.server_id_for(temp_note_id).ok().flatten()))
    }

    fn replace_cache(&self, notes: &[CachedNote]) -> StoreResult<()> {
        self.with_fallback(|store| store.replace_cache(notes))
    }

    fn list_cache(&self) -> StoreResult<Vec<CachedNote>> {
        self.with_fallback(|store| store.list_cache())
    }
}

/// Open the SQLite store at `path`, or a memory-only store if that fails
pub fn open_local_store(path: PathBuf) -> Arc<DegradingStore> {
    match Database::new(path) {
        Ok(db) => Arc::new(DegradingStore::new(Arc::new(db))),
        Err(e) => Arc::new(DegradingStore::memory_only(e.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{MutationKind, NotePayload};
    use chrono::{Duration, SubsecRound};

    /// Durable store that breaks after `ok_calls` successful calls
    struct FlakyStore {
        inner: MemoryStore,
        ok_calls: StdMutex<usize>,
    }

    impl FlakyStore {
        fn new(ok_calls: usize) -> Self {
            Self { inner: MemoryStore::new(), ok_calls: StdMutex::new(ok_calls) }
        }

        fn gate(&self) -> StoreResult<()> {
            let mut left = self.ok_calls.lock().unwrap();
            if *left == 0 {
                return Err(StoreError::StorageUnavailable("quota exceeded".into()));
            }
            *left -= 1;
            Ok(())
        }
    }

    impl LocalStore for FlakyStore {
        fn put(&self, mutation: &PendingMutation) -> StoreResult<()> {
            self.gate()?;
            self.inner.put(mutation)
        }
        fn list_pending(&self) -> StoreResult<Vec<PendingMutation>> {
            self.inner.list_pending()
        }
        fn get_pending(&self, id: &str) -> StoreResult<Option<PendingMutation>> {
            self.inner.get_pending(id)
        }
        fn remove(&self, id: &str) -> StoreResult<()> {
            self.gate()?;
            self.inner.remove(id)
        }
        fn record_failure(&self, id: &str, error: &str, at: DateTime<Utc>) -> StoreResult<()> {
            self.gate()?;
            self.inner.record_failure(id, error, at)
        }
        fn complete_create(&self, m: &str, t: &str, s: &str) -> StoreResult<()> {
            self.gate()?;
            self.inner.complete_create(m, t, s)
        }
        fn server_id_for(&self, t: &str) -> StoreResult<Option<String>> {
            self.inner.server_id_for(t)
        }
        fn replace_cache(&self, notes: &[CachedNote]) -> StoreResult<()> {
            self.gate()?;
            self.inner.replace_cache(notes)
        }
        fn list_cache(&self) -> StoreResult<Vec<CachedNote>> {
            self.inner.list_cache()
        }
    }

    fn mutation(kind: MutationKind, note_id: &str, offset_ms: i64) -> PendingMutation {
        PendingMutation::new(
            kind,
            note_id,
            Some(NotePayload::new("t", "c")),
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn test_memory_store_orders_and_overwrites() {
        let store = MemoryStore::new();
        let b = mutation(MutationKind::Update, "n1", 5);
        let mut a = mutation(MutationKind::Create, "local-1", 0);

        store.put(&b).unwrap();
        store.put(&a).unwrap();
        a.payload = Some(NotePayload::new("again", ""));
        store.put(&a).unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], a);
        assert_eq!(pending[1], b);
    }

    #[test]
    fn test_memory_store_remove_twice() {
        let store = MemoryStore::new();
        let m = mutation(MutationKind::Delete, "n1", 0);
        store.put(&m).unwrap();

        store.remove(&m.id).unwrap();
        store.remove(&m.id).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_complete_create() {
        let store = MemoryStore::new();
        let create = mutation(MutationKind::Create, "local-1", 0);
        let update = mutation(MutationKind::Update, "local-1", 5);
        store.put(&create).unwrap();
        store.put(&update).unwrap();

        store.complete_create(&create.id, "local-1", "srv-1").unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].note_id, "srv-1");
        assert!(store.get_pending(&create.id).unwrap().is_none());
        assert_eq!(store.get_pending(&update.id).unwrap().unwrap().note_id, "srv-1");
        assert_eq!(store.server_id_for("local-1").unwrap().as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_degraded_store_reads_ids_assigned_on_disk() {
        let flaky = Arc::new(FlakyStore::new(2));
        let store = DegradingStore::new(flaky.clone());

        let create = mutation(MutationKind::Create, "local-1", 0);
        store.put(&create).unwrap();
        store.complete_create(&create.id, "local-1", "srv-1").unwrap();

        // Durable store is now out of successful writes
        store.put(&mutation(MutationKind::Delete, "n2", 5)).unwrap();
        assert!(store.is_degraded());
        assert_eq!(store.server_id_for("local-1").unwrap().as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_database_implements_store() {
        let db: Arc<dyn LocalStore> = Arc::new(Database::in_memory().unwrap());
        let m = mutation(MutationKind::Update, "n1", 0);
        db.put(&m).unwrap();
        db.record_failure(&m.id, "offline", (Utc::now() + Duration::seconds(30)).trunc_subsecs(6))
            .unwrap();

        let pending = db.list_pending().unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(db.get_pending(&m.id).unwrap().unwrap().attempts, 1);

        db.remove(&m.id).unwrap();
        db.remove(&m.id).unwrap();
        assert!(db.list_pending().unwrap().is_empty());
        assert!(db.get_pending(&m.id).unwrap().is_none());
    }

    #[test]
    fn test_degrades_to_memory_on_failure() {
        let flaky = Arc::new(FlakyStore::new(1));
        let store = DegradingStore::new(flaky.clone());
        let mut degraded = store.subscribe_degradation();

        let first = mutation(MutationKind::Create, "local-1", 0);
        let second = mutation(MutationKind::Update, "n2", 5);

        store.put(&first).unwrap();
        assert!(!store.is_degraded());

        // Second write hits the broken durable store and lands in memory
        store.put(&second).unwrap();
        assert!(store.is_degraded());
        assert!(degraded.try_recv().unwrap().contains("quota exceeded"));

        let pending = store.list_pending().unwrap();
        assert_eq!(pending, vec![first, second]);
    }

    #[test]
    fn test_open_local_store_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        // The parent of the database path is a regular file
        let store = open_local_store(blocker.join("notes.db"));
        assert!(store.is_degraded());

        let m = mutation(MutationKind::Delete, "n1", 0);
        store.put(&m).unwrap();
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_open_local_store_uses_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_local_store(dir.path().join("notes.db"));
        assert!(!store.is_degraded());
    }
}
