//! In-process `NoteBackend` for tests

use super::api::{NoteBackend, RemoteError};
use super::models::{NewNote, Note, NotePayload, Tag};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    notes: BTreeMap<String, Note>,
    next_id: u64,
    calls: Vec<String>,
    unreachable: bool,
    unauthorized: bool,
    rejecting: bool,
    failing_notes: HashSet<String>,
    lose_next_insert_response: bool,
}

/// Note server kept in memory, with switches for the failure modes the
/// sync core has to handle
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    delay: Option<Duration>,
}

/// A genuine transport-level `reqwest::Error`
pub(crate) fn transport_error() -> RemoteError {
    match reqwest::Client::new().get("not a url").build() {
        Err(e) => RemoteError::Request(e),
        Ok(_) => RemoteError::Server("503 Service Unavailable".to_string()),
    }
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub(crate) fn set_unauthorized(&self, unauthorized: bool) {
        self.state().unauthorized = unauthorized;
    }

    /// Inserts and updates fail validation
    pub(crate) fn set_rejecting(&self, rejecting: bool) {
        self.state().rejecting = rejecting;
    }

    /// Calls touching `id` fail with a server error
    pub(crate) fn fail_note(&self, id: &str) {
        self.state().failing_notes.insert(id.to_string());
    }

    /// The next insert is stored but its response never arrives
    pub(crate) fn lose_next_insert_response(&self) {
        self.state().lose_next_insert_response = true;
    }

    pub(crate) fn seed(&self, id: &str, title: &str) {
        let now = Utc::now();
        self.state().notes.insert(
            id.to_string(),
            Note {
                id: id.to_string(),
                title: title.to_string(),
                content: String::new(),
                created_at: Some(now),
                updated_at: now,
                client_token: None,
                tags: Vec::new(),
            },
        );
    }

    pub(crate) fn notes(&self) -> Vec<Note> {
        self.state().notes.values().cloned().collect()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub(crate) fn count_calls(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(method))
            .count()
    }

    /// Record the call and apply the global failure switches
    async fn enter(&self, call: String, note_id: Option<&str>) -> Result<(), RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.calls.push(call);

        if state.unreachable {
            return Err(transport_error());
        }
        if state.unauthorized {
            return Err(RemoteError::Unauthorized);
        }
        if note_id.is_some_and(|id| state.failing_notes.contains(id)) {
            return Err(RemoteError::Server("500 Internal Server Error".to_string()));
        }
        Ok(())
    }

    fn tags_for(ids: &[String]) -> Vec<Tag> {
        ids.iter()
            .map(|id| Tag {
                id: id.clone(),
                name: String::new(),
                color: None,
            })
            .collect()
    }
}

#[async_trait]
impl NoteBackend for FakeBackend {
    async fn insert(&self, note: &NewNote) -> Result<Note, RemoteError> {
        self.enter(format!("insert:{}", note.client_token.as_deref().unwrap_or("")), None)
            .await?;

        let mut state = self.state();
        if state.rejecting {
            return Err(RemoteError::Rejected("title violates check constraint".to_string()));
        }
        if note.client_token.is_some()
            && state.notes.values().any(|n| n.client_token == note.client_token)
        {
            return Err(RemoteError::Rejected(
                "duplicate key value violates unique constraint".to_string(),
            ));
        }

        state.next_id += 1;
        let now = Utc::now();
        let created = Note {
            id: format!("srv-{}", state.next_id),
            title: note.title.clone(),
            content: note.content.clone(),
            created_at: Some(now),
            updated_at: now,
            client_token: note.client_token.clone(),
            tags: Self::tags_for(&note.tag_ids),
        };
        state.notes.insert(created.id.clone(), created.clone());

        if std::mem::take(&mut state.lose_next_insert_response) {
            return Err(transport_error());
        }
        Ok(created)
    }

    async fn update_by_id(&self, id: &str, fields: &NotePayload) -> Result<Note, RemoteError> {
        self.enter(format!("update:{}", id), Some(id)).await?;

        let mut state = self.state();
        if state.rejecting {
            return Err(RemoteError::Rejected("title violates check constraint".to_string()));
        }

        let note = state
            .notes
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        note.title = fields.title.clone();
        note.content = fields.content.clone();
        note.tags = Self::tags_for(&fields.tag_ids);
        note.updated_at = Utc::now();
        Ok(note.clone())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), RemoteError> {
        self.enter(format!("delete:{}", id), Some(id)).await?;
        self.state().notes.remove(id);
        Ok(())
    }

    async fn find_by_client_token(&self, token: &str) -> Result<Option<Note>, RemoteError> {
        self.enter(format!("find:{}", token), None).await?;
        Ok(self
            .state()
            .notes
            .values()
            .find(|n| n.client_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_notes(&self) -> Result<Vec<Note>, RemoteError> {
        self.enter("list".to_string(), None).await?;
        let mut notes = self.notes();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(notes)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter("ping".to_string(), None).await
    }
}
