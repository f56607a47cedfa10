//! Sync errors and user-facing notices
//!
//! Storage and transport problems are absorbed by the queue and the replay
//! worker. Only `Unauthorized` and `RemoteRejected` reach the caller as errors.

use super::store::StoreError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Not returned by `apply_mutation`; there the mutation just stays queued
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Unauthorized - sign in again to resume sync")]
    Unauthorized,

    #[error("Rejected by server for note {note_id}: {reason}")]
    RemoteRejected { note_id: String, reason: String },

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Unknown sync tag: {0}")]
    UnknownSyncTag(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StorageUnavailable(msg) => SyncError::StorageUnavailable(msg),
        }
    }
}

/// Conditions the UI should show to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotice {
    /// Session is gone; replay is paused until the user signs in again
    Unauthorized,

    /// The server refused a mutation; it was removed from the queue
    Rejected {
        mutation_id: String,
        note_id: String,
        reason: String,
    },

    /// A mutation keeps failing and is still queued
    PersistentFailure {
        mutation_id: String,
        note_id: String,
        attempts: u32,
        last_error: String,
    },

    /// A note created offline got its server id; re-key anything holding
    /// the temporary id
    NoteIdAssigned { temp_id: String, note_id: String },

    /// Offline storage fell back to memory for this session
    StorageDegraded { reason: String },
}
