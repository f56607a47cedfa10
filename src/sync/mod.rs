//! Sync Module - Offline-first note synchronization
//!
//! Keeps note edits working without a connection:
//! - Every mutation is persisted locally before it is sent
//! - A cache of server-confirmed notes serves offline reads
//! - Queued mutations replay in order when connectivity returns, on
//!   background-sync events, on a schedule, or on demand
//!
//! Architecture:
//! - `store`: durable local store (SQLite, memory fallback)
//! - `queue`: accepts mutations and sends them when online
//! - `replay`: the single replay path, coalescing concurrent triggers
//! - `connectivity`: online/offline signal and reconnect events
//! - `manager`: wires it together for the UI layer

pub mod api;
pub mod connectivity;
pub mod error;
pub mod manager;
pub mod models;
pub mod queue;
pub mod replay;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use api::{NoteBackend, RemoteError, RestNoteBackend, Session};
pub use connectivity::{spawn_probe, Connectivity, ConnectivityMonitor};
pub use error::{SyncError, SyncNotice};
pub use manager::{SyncManager, SyncOptions};
pub use models::{
    new_temporary_note_id, is_temporary_note_id, overlay_pending,
    CachedNote, MutationKind, NewNote, Note, NotePayload, PendingMutation, Tag,
};
pub use queue::{ApplyOutcome, MonotonicClock, QueueManager, QueueStats, RetryPolicy};
pub use replay::{ReplayOutcome, ReplayReport, ReplayTrigger, ReplayWorker, BACKGROUND_SYNC_TAG};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use store::{open_local_store, DegradingStore, LocalStore, MemoryStore, StoreError};
