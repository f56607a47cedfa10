//! Note Backend Client - HTTP communication with the hosted notes backend
//!
//! `NoteBackend` is the narrow CRUD contract the offline path consumes.
//! `RestNoteBackend` implements it over the backend's PostgREST endpoints:
//! - `notes` rows, scoped to the signed-in user
//! - `note_tags` association rows (replaced wholesale on write)

use super::models::{NewNote, Note, NotePayload, Tag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NOTE_SELECT: &str = "*,note_tags(tags(id,name,color))";

// ============================================================================
// Contract
// ============================================================================

/// Remote note storage as seen by the sync core.
///
/// All calls act on behalf of the current session; without one they fail
/// with `RemoteError::Unauthorized`.
#[async_trait]
pub trait NoteBackend: Send + Sync {
    async fn insert(&self, note: &NewNote) -> Result<Note, RemoteError>;

    /// Fails with `NotFound` when no such note exists for the user
    async fn update_by_id(&self, id: &str, fields: &NotePayload) -> Result<Note, RemoteError>;

    /// Deleting a note that is already gone succeeds
    async fn delete_by_id(&self, id: &str) -> Result<(), RemoteError>;

    /// Note previously inserted with this idempotency token, if any
    async fn find_by_client_token(&self, token: &str) -> Result<Option<Note>, RemoteError>;

    /// Full note list, most recently updated first
    async fn list_notes(&self) -> Result<Vec<Note>, RemoteError>;

    /// Reachability check; any HTTP answer means the backend is reachable
    async fn ping(&self) -> Result<(), RemoteError>;
}

// ============================================================================
// Session
// ============================================================================

/// Authenticated principal; the token is wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// REST client
// ============================================================================

/// PostgREST client for the hosted notes backend
pub struct RestNoteBackend {
    client: Client,
    rest_base: Url,
    api_key: String,
    /// Current session (cached in memory)
    session: Arc<RwLock<Option<Session>>>,
}

impl RestNoteBackend {
    /// Create a client for the backend at `base_url` (the project URL)
    pub fn new(base_url: &Url, api_key: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let rest_base = base
            .join("rest/v1/")
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            rest_base,
            api_key: api_key.into(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    /// Set session (after login)
    pub async fn set_session(&self, session: Session) {
        *self.session.write().await = Some(session);
    }

    /// Clear session (logout)
    pub async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn session(&self) -> Result<Session, RemoteError> {
        self.session.read().await.clone().ok_or(RemoteError::Unauthorized)
    }

    fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
        self.rest_base
            .join(table)
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }

    fn authorized(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&session.access_token)
    }

    /// Replace the note's tag associations; failures are logged, not returned
    async fn replace_tags(&self, session: &Session, note_id: &str, tag_ids: &[String], clear_first: bool) {
        let url = match self.table_url("note_tags") {
            Ok(url) => url,
            Err(e) => {
                log::error!("Cannot build note_tags URL: {}", e);
                return;
            }
        };

        if clear_first {
            let result = self
                .authorized(self.client.delete(url.clone()), session)
                .query(&[("note_id", format!("eq.{}", note_id))])
                .send()
                .await;
            if let Err(e) = expect_success(result).await {
                log::warn!("Failed to clear tags for note {}: {}", note_id, e);
            }
        }

        if tag_ids.is_empty() {
            return;
        }

        let rows: Vec<NoteTagInsert<'_>> = tag_ids
            .iter()
            .map(|tag_id| NoteTagInsert {
                note_id,
                tag_id,
                user_id: &session.user_id,
            })
            .collect();

        let result = self
            .authorized(self.client.post(url), session)
            .json(&rows)
            .send()
            .await;
        if let Err(e) = expect_success(result).await {
            log::warn!("Failed to add tags to note {}: {}", note_id, e);
        }
    }

    async fn delete_tags(&self, session: &Session, note_id: &str) -> Result<(), RemoteError> {
        let response = self
            .authorized(self.client.delete(self.table_url("note_tags")?), session)
            .query(&[("note_id", format!("eq.{}", note_id))])
            .send()
            .await;
        expect_success(response).await
    }
}

#[async_trait]
impl NoteBackend for RestNoteBackend {
    async fn insert(&self, note: &NewNote) -> Result<Note, RemoteError> {
        let session = self.session().await?;

        let body = NoteInsert {
            title: &note.title,
            content: &note.content,
            user_id: &session.user_id,
            client_token: note.client_token.as_deref(),
        };

        let response = self
            .authorized(self.client.post(self.table_url("notes")?), &session)
            .header("Prefer", "return=representation")
            .query(&[("select", NOTE_SELECT)])
            .json(&body)
            .send()
            .await?;

        let rows: Vec<NoteRow> = handle_response(response).await?;
        let created: Note = rows
            .into_iter()
            .next()
            .ok_or(RemoteError::InvalidResponse)?
            .into();

        self.replace_tags(&session, &created.id, &note.tag_ids, false).await;

        Ok(Note {
            tags: tag_stubs(&note.tag_ids),
            ..created
        })
    }

    async fn update_by_id(&self, id: &str, fields: &NotePayload) -> Result<Note, RemoteError> {
        let session = self.session().await?;

        let body = NoteUpdate {
            title: &fields.title,
            content: &fields.content,
            updated_at: Utc::now(),
        };

        let response = self
            .authorized(self.client.patch(self.table_url("notes")?), &session)
            .header("Prefer", "return=representation")
            .query(&[
                ("id", format!("eq.{}", id)),
                ("user_id", format!("eq.{}", session.user_id)),
                ("select", NOTE_SELECT.to_string()),
            ])
            .json(&body)
            .send()
            .await?;

        let rows: Vec<NoteRow> = handle_response(response).await?;
        let updated: Note = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?
            .into();

        self.replace_tags(&session, id, &fields.tag_ids, true).await;

        Ok(Note {
            tags: tag_stubs(&fields.tag_ids),
            ..updated
        })
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), RemoteError> {
        let session = self.session().await?;

        // Tag rows reference the note
        match self.delete_tags(&session, id).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let response = self
            .authorized(self.client.delete(self.table_url("notes")?), &session)
            .query(&[
                ("id", format!("eq.{}", id)),
                ("user_id", format!("eq.{}", session.user_id)),
            ])
            .send()
            .await;

        match expect_success(response).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn find_by_client_token(&self, token: &str) -> Result<Option<Note>, RemoteError> {
        let session = self.session().await?;

        let response = self
            .authorized(self.client.get(self.table_url("notes")?), &session)
            .query(&[
                ("client_token", format!("eq.{}", token)),
                ("user_id", format!("eq.{}", session.user_id)),
                ("select", NOTE_SELECT.to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;

        let rows: Vec<NoteRow> = handle_response(response).await?;
        Ok(rows.into_iter().next().map(Note::from))
    }

    async fn list_notes(&self) -> Result<Vec<Note>, RemoteError> {
        let session = self.session().await?;

        let response = self
            .authorized(self.client.get(self.table_url("notes")?), &session)
            .query(&[
                ("user_id", format!("eq.{}", session.user_id)),
                ("select", NOTE_SELECT.to_string()),
                ("order", "updated_at.desc".to_string()),
            ])
            .send()
            .await?;

        let rows: Vec<NoteRow> = handle_response(response).await?;
        Ok(rows.into_iter().map(Note::from).collect())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        // Any status proves the backend answered
        self.client
            .get(self.rest_base.clone())
            .header("apikey", &self.api_key)
            .send()
            .await?;
        Ok(())
    }
}

fn tag_stubs(tag_ids: &[String]) -> Vec<Tag> {
    tag_ids
        .iter()
        .map(|id| Tag { id: id.clone(), name: String::new(), color: None })
        .collect()
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct NoteInsert<'a> {
    title: &'a str,
    content: &'a str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct NoteUpdate<'a> {
    title: &'a str,
    content: &'a str,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct NoteTagInsert<'a> {
    note_id: &'a str,
    tag_id: &'a str,
    user_id: &'a str,
}

/// `notes` row with embedded `note_tags(tags(...))`
#[derive(Debug, Clone, Deserialize)]
struct NoteRow {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    client_token: Option<String>,
    #[serde(default)]
    note_tags: Vec<NoteTagRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct NoteTagRow {
    #[serde(default)]
    tags: Option<Tag>,
}

impl From<NoteRow> for Note {
    fn from(row: NoteRow) -> Self {
        Self {
            id: row.id,
            title: row.title.unwrap_or_default(),
            content: row.content.unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            client_token: row.client_token,
            tags: row.note_tags.into_iter().filter_map(|t| t.tags).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Anything but a lost session or a refusal of the request itself may
    /// succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthorized | Self::NotFound(_) | Self::Rejected(_))
    }

    /// The request never got an HTTP answer
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await.map_err(|_| RemoteError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Succeed on any 2xx, ignoring the body
async fn expect_success(response: Result<reqwest::Response, reqwest::Error>) -> Result<(), RemoteError> {
    let response = response?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .ok()
        .and_then(|e| e.message.or(e.error))
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text.clone() });

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::BAD_REQUEST
        | StatusCode::FORBIDDEN
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY => RemoteError::Rejected(message),
        _ => RemoteError::Server(format!("{}: {}", status, message)),
    }
}

// ============================================================================
// Tests
// ============================================================================
