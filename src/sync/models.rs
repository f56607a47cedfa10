//! Sync Data Models - Client-Side Structures
//!
//! Defines the data structures of the offline path:
//! - PendingMutation: a queued create/update/delete awaiting server confirmation
//! - Note: a note as the remote backend returns it
//! - CachedNote: last server-confirmed note kept for offline reads
//! - Tag: tag association embedded in notes

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for note ids minted on the device before the server assigns one.
pub const TEMPORARY_NOTE_PREFIX: &str = "local-";

// ============================================================================
// Mutations
// ============================================================================

/// Kind of note mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the mutation needs a field snapshot
    pub fn requires_payload(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the note fields a create/update carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotePayload {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

impl NotePayload {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            tag_ids: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tag_ids: Vec<String>) -> Self {
        self.tag_ids = tag_ids;
        self
    }

    /// A note needs at least a title or some content
    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.content.trim().is_empty()
    }
}

/// A note mutation persisted locally until the server confirms it.
///
/// `id` is minted once on the device and never changes across retries.
/// `enqueued_at` is the ordering key of the queue; ties break on `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: String,
    pub note_id: String,
    pub kind: MutationKind,
    pub payload: Option<NotePayload>,
    /// Token the server deduplicates creates on (the temporary note id)
    pub idempotency_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    /// Create a new pending mutation with a fresh id
    pub fn new(
        kind: MutationKind,
        note_id: impl Into<String>,
        payload: Option<NotePayload>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        let note_id = note_id.into();
        let idempotency_key = match kind {
            MutationKind::Create => Some(note_id.clone()),
            _ => None,
        };
        let payload = if kind.requires_payload() { payload } else { None };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            note_id,
            kind,
            payload,
            idempotency_key,
            enqueued_at: enqueued_at.trunc_subsecs(6),
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether a backoff-honouring run may attempt this mutation at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Queue order: `enqueued_at`, then `id`
    pub fn queue_order(&self, other: &Self) -> std::cmp::Ordering {
        self.enqueued_at
            .cmp(&other.enqueued_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Mint a device-local note id for a note that has not reached the server yet
pub fn new_temporary_note_id() -> String {
    format!("{}{}", TEMPORARY_NOTE_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_temporary_note_id(note_id: &str) -> bool {
    note_id.starts_with(TEMPORARY_NOTE_PREFIX)
}

// ============================================================================
// Notes
// ============================================================================

/// Tag associated with a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Note as returned by the remote backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Fields sent to the backend when inserting a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewNote {
    pub title: String,
    pub content: String,
    pub tag_ids: Vec<String>,
    pub client_token: Option<String>,
}

impl NewNote {
    pub fn from_payload(payload: &NotePayload, client_token: Option<String>) -> Self {
        Self {
            title: payload.title.clone(),
            content: payload.content.clone(),
            tag_ids: payload.tag_ids.clone(),
            client_token,
        }
    }
}

/// Last server-confirmed representation of a note, for offline reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedNote {
    pub id: String,
    pub title: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl From<Note> for CachedNote {
    fn from(note: Note) -> Self {
        Self {
            id: note.id,
            title: note.title,
            content: note.content,
            updated_at: note.updated_at.trunc_subsecs(6),
            tags: note.tags,
        }
    }
}

/// Lay pending mutations over the cached list for display.
///
/// Creates are appended, updates replace fields, deletes hide the note.
/// The result is ordered by `updated_at` descending like the server list.
pub fn overlay_pending(cached: Vec<CachedNote>, pending: &[PendingMutation]) -> Vec<CachedNote> {
    let mut notes = cached;
    let known_tags: Vec<Tag> = notes.iter().flat_map(|n| n.tags.iter().cloned()).collect();
    let resolve_tags = |ids: &[String]| -> Vec<Tag> {
        ids.iter()
            .map(|id| {
                known_tags
                    .iter()
                    .find(|t| &t.id == id)
                    .cloned()
                    .unwrap_or_else(|| Tag { id: id.clone(), name: String::new(), color: None })
            })
            .collect()
    };

    for mutation in pending {
        match (mutation.kind, mutation.payload.as_ref()) {
            (MutationKind::Create, Some(payload)) => {
                notes.retain(|n| n.id != mutation.note_id);
                notes.push(CachedNote {
                    id: mutation.note_id.clone(),
                    title: payload.title.clone(),
                    content: payload.content.clone(),
                    updated_at: mutation.enqueued_at,
                    tags: resolve_tags(&payload.tag_ids),
                });
            }
            (MutationKind::Update, Some(payload)) => {
                if let Some(note) = notes.iter_mut().find(|n| n.id == mutation.note_id) {
                    note.title = payload.title.clone();
                    note.content = payload.content.clone();
                    note.updated_at = mutation.enqueued_at;
                    note.tags = resolve_tags(&payload.tag_ids);
                }
            }
            (MutationKind::Delete, _) => notes.retain(|n| n.id != mutation.note_id),
            _ => {}
        }
    }

    notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    notes
}

/// RFC 3339 with fixed microsecond precision so stored strings sort in time order
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Tests
// ============================================================================
