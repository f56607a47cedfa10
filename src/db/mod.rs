//! Database module for the notes sync core
//!
//! Provides SQLite storage for the offline path: the pending mutation queue
//! and the cached note list. Each public operation is one transaction.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::models::{
    format_timestamp, parse_timestamp, CachedNote, MutationKind, NotePayload, PendingMutation, Tag,
};

/// Current store layout version, kept in `PRAGMA user_version`
pub const STORE_VERSION: i32 = 3;

/// Applied to every pooled connection
const CONNECTION_PRAGMAS: &str = r#"
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
"#;

const PENDING_COLUMNS: &str = "id, note_id, kind, payload, idempotency_key, enqueued_at, \
                               attempts, last_error, next_attempt_at";

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the store file and bring it to `STORE_VERSION`
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
            "#,
            )?;
            Self::initialize_schema(&conn)?;
        }

        log::info!("Local store opened at {:?}", db_path);
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite memory connection is its own database, so the pool holds one.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));

        let pool = Pool::builder().max_size(1).build(manager)?;

        {
            let conn = pool.get()?;
            Self::initialize_schema(&conn)?;
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one transaction, committing only if it returns `Ok`
    pub fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Read the layout version recorded in the file
    pub fn store_version(&self) -> DbResult<i32> {
        let conn = self.get_conn()?;
        let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(conn)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// One-time structural upgrades keyed on `PRAGMA user_version`
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 2 {
            // Version 2: retry bookkeeping on pending mutations
            let columns = [
                ("attempts", "ALTER TABLE pending_mutations ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0"),
                ("last_error", "ALTER TABLE pending_mutations ADD COLUMN last_error TEXT"),
                ("next_attempt_at", "ALTER TABLE pending_mutations ADD COLUMN next_attempt_at TEXT"),
            ];

            for (column, ddl) in columns {
                let exists: bool = conn.query_row(
                    "SELECT COUNT(*) > 0 FROM pragma_table_info('pending_mutations') WHERE name = ?1",
                    [column],
                    |row| row.get(0),
                )?;

                if !exists {
                    log::info!("Running migration: Adding {} column to pending_mutations", column);
                    conn.execute(ddl, [])?;
                }
            }
        }

        if version < 3 {
            // Version 3: server ids assigned to temporary note ids
            log::info!("Running migration: Creating note_id_map table");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS note_id_map (
                    temp_id TEXT PRIMARY KEY,
                    server_id TEXT NOT NULL,
                    assigned_at TEXT NOT NULL
                );
            "#,
            )?;
        }

        if version < STORE_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {}", STORE_VERSION))?;
            log::info!("Local store upgraded from version {} to {}", version, STORE_VERSION);
        }

        Ok(())
    }

    // =========================================================================
    // PENDING MUTATIONS
    // =========================================================================

    /// Insert or overwrite a pending mutation by id
    pub fn upsert_pending(&self, mutation: &PendingMutation) -> DbResult<()> {
        let payload = mutation
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO pending_mutations (
                id, note_id, kind, payload, idempotency_key, enqueued_at,
                attempts, last_error, next_attempt_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                note_id = excluded.note_id,
                kind = excluded.kind,
                payload = excluded.payload,
                idempotency_key = excluded.idempotency_key,
                enqueued_at = excluded.enqueued_at,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                next_attempt_at = excluded.next_attempt_at
            "#,
            params![
                mutation.id,
                mutation.note_id,
                mutation.kind.as_str(),
                payload,
                mutation.idempotency_key,
                format_timestamp(&mutation.enqueued_at),
                mutation.attempts,
                mutation.last_error,
                mutation.next_attempt_at.as_ref().map(format_timestamp),
            ],
        )?;

        Ok(())
    }

    /// All pending mutations in queue order
    pub fn list_pending(&self) -> DbResult<Vec<PendingMutation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_mutations ORDER BY enqueued_at ASC, id ASC",
            PENDING_COLUMNS
        ))?;

        let rows = stmt.query_map([], pending_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }

    /// Get one pending mutation by id
    pub fn get_pending(&self, id: &str) -> DbResult<PendingMutation> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM pending_mutations WHERE id = ?1", PENDING_COLUMNS),
            [id],
            pending_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(id.to_string()),
            other => other.into(),
        })
    }

    /// Delete a pending mutation; returns rows removed (0 if absent)
    pub fn delete_pending(&self, id: &str) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM pending_mutations WHERE id = ?1", [id])?;
        Ok(deleted)
    }

    /// Bump the attempt counter and schedule the next try
    pub fn record_pending_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: &chrono::DateTime<chrono::Utc>,
    ) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            UPDATE pending_mutations
            SET attempts = attempts + 1, last_error = ?1, next_attempt_at = ?2
            WHERE id = ?3
            "#,
            params![error, format_timestamp(next_attempt_at), id],
        )?;

        Ok(())
    }

    /// Remove a confirmed create, remember the server id, and point later
    /// mutations at it.
    ///
    /// Returns how many pending mutations were re-pointed.
    pub fn complete_create(
        &self,
        mutation_id: &str,
        temp_note_id: &str,
        server_note_id: &str,
    ) -> DbResult<usize> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM pending_mutations WHERE id = ?1", [mutation_id])?;

            if temp_note_id == server_note_id {
                return Ok(0);
            }

            tx.execute(
                r#"
                INSERT INTO note_id_map (temp_id, server_id, assigned_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(temp_id) DO UPDATE SET
                    server_id = excluded.server_id,
                    assigned_at = excluded.assigned_at
                "#,
                params![temp_note_id, server_note_id, format_timestamp(&chrono::Utc::now())],
            )?;

            let moved = tx.execute(
                "UPDATE pending_mutations SET note_id = ?1 WHERE note_id = ?2",
                params![server_note_id, temp_note_id],
            )?;
            Ok(moved)
        })
    }

    /// Server id recorded for a temporary note id
    pub fn server_id_for(&self, temp_note_id: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let server_id = conn
            .query_row(
                "SELECT server_id FROM note_id_map WHERE temp_id = ?1",
                [temp_note_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(server_id)
    }

    // =========================================================================
    // CACHED NOTES
    // =========================================================================

    /// Clear and rewrite the cached note list in one transaction
    pub fn replace_cached_notes(&self, notes: &[CachedNote]) -> DbResult<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM cached_notes", [])?;

            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO cached_notes (id, title, content, updated_at, tags)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;

            for note in notes {
                let tags = serde_json::to_string(&note.tags)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                stmt.execute(params![
                    note.id,
                    note.title,
                    note.content,
                    format_timestamp(&note.updated_at),
                    tags,
                ])?;
            }

            Ok(())
        })
    }

    /// All cached notes, most recently updated first
    pub fn list_cached_notes(&self) -> DbResult<Vec<CachedNote>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, content, updated_at, tags FROM cached_notes \
             ORDER BY updated_at DESC, id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let tags: String = row.get(4)?;
            Ok(CachedNote {
                id: row.get(0)?,
                title: row.get(1)?,
                content: row.get(2)?,
                updated_at: timestamp_column(3, &row.get::<_, String>(3)?)?,
                tags: serde_json::from_str::<Vec<Tag>>(&tags).map_err(|e| conversion_error(4, e))?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMutation> {
    let kind: String = row.get(2)?;
    let payload: Option<String> = row.get(3)?;

    Ok(PendingMutation {
        id: row.get(0)?,
        note_id: row.get(1)?,
        kind: MutationKind::parse(&kind)
            .ok_or_else(|| conversion_error(2, format!("unknown mutation kind: {}", kind)))?,
        payload: payload
            .map(|json| serde_json::from_str::<NotePayload>(&json))
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        idempotency_key: row.get(4)?,
        enqueued_at: timestamp_column(5, &row.get::<_, String>(5)?)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_attempt_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| timestamp_column(8, &s))
            .transpose()?,
    })
}

fn timestamp_column(idx: usize, value: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(value).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}
