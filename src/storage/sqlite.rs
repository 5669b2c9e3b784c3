//! SQLite Entry Store
//!
//! Provides persistent storage using SQLite with WAL mode for crash safety.

use super::{
    age_order, apply_mutation, course_order, EntryChange, EntryMutation, EntryStore, MergeFn,
    TransactionOutcome,
};
use crate::error::{Result, SyncError};
use crate::protocol::{CourseId, EntryId, EntryStatus, SyncEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite-based entry store
pub struct SqliteEntryStore {
    inner: Arc<Mutex<SqliteInner>>,
}

struct SqliteInner {
    conn: Connection,
    /// Last revision handed out; shared by every row
    revision: u64,
}

impl SqliteInner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

impl SqliteEntryStore {
    /// Open (or create) the store at the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::EntryStore(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let inner = tokio::task::spawn_blocking(move || -> Result<SqliteInner> {
            let conn = Connection::open(&path)?;

            // WAL keeps readers off the writer and survives torn writes
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            migrate(&conn)?;
            let revision = max_revision(&conn)?;

            Ok(SqliteInner { conn, revision })
        })
        .await
        .map_err(|e| SyncError::EntryStore(format!("Failed to initialize database: {}", e)))??;

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Create an in-memory SQLite database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let inner = tokio::task::spawn_blocking(move || -> Result<SqliteInner> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(SqliteInner { conn, revision: 0 })
        })
        .await
        .map_err(|e| {
            SyncError::EntryStore(format!("Failed to create in-memory database: {}", e))
        })??;

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    async fn with_inner<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SyncError::EntryStore(format!("Failed to {}: {}", what, e)))?
    }
}

/// Current schema version; bump when adding migrations
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Database schema v1
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS sync_entries (
    id TEXT PRIMARY KEY,
    course_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    remote_locator TEXT NOT NULL,
    version TEXT,
    local_path TEXT NOT NULL,

    -- Progress
    size_bytes INTEGER,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,

    -- Lifecycle
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    is_hidden_from_user INTEGER NOT NULL DEFAULT 0,
    pause_requested INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    revision INTEGER NOT NULL DEFAULT 0,

    -- Timestamps
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    touched_at TEXT NOT NULL,

    UNIQUE (course_id, kind, remote_id)
);

CREATE INDEX IF NOT EXISTS idx_entries_course ON sync_entries(course_id, position);
CREATE INDEX IF NOT EXISTS idx_entries_status ON sync_entries(status);
"#;

const ENTRY_COLUMNS: &str = "id, course_id, kind, remote_id, remote_locator, version, local_path, \
     size_bytes, bytes_transferred, status, retry_count, last_error, is_hidden_from_user, \
     pause_requested, position, next_attempt_at, revision, created_at, updated_at, touched_at";

/// Run schema migrations to bring the database up to `CURRENT_SCHEMA_VERSION`.
///
/// Uses SQLite's `PRAGMA user_version` to track the current version. Each
/// migration is applied in order, and the version is bumped after each step.
/// Calling it on an already-current database is a no-op.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap_or_default(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

fn max_revision(conn: &Connection) -> rusqlite::Result<u64> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(revision) FROM sync_entries", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) as u64)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {:?}: {}", raw, e)))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<SyncEntry> {
    let kind: String = row.get(2)?;
    let status: String = row.get(9)?;
    let next_attempt_at: Option<String> = row.get(15)?;

    Ok(SyncEntry {
        id: EntryId::from_raw(row.get::<_, String>(0)?),
        course_id: CourseId::new(row.get::<_, String>(1)?),
        kind: kind.parse().map_err(|e| conversion_error(2, e))?,
        remote_id: row.get(3)?,
        remote_locator: row.get(4)?,
        version: row.get(5)?,
        local_path: PathBuf::from(row.get::<_, String>(6)?),
        size_bytes: row.get::<_, Option<i64>>(7)?.map(|s| s as u64),
        bytes_transferred: row.get::<_, i64>(8)? as u64,
        status: status.parse().map_err(|e| conversion_error(9, e))?,
        retry_count: row.get(10)?,
        last_error: row.get(11)?,
        is_hidden_from_user: row.get(12)?,
        pause_requested: row.get(13)?,
        position: row.get(14)?,
        next_attempt_at: next_attempt_at.map(|t| parse_time(15, t)).transpose()?,
        revision: row.get::<_, i64>(16)? as u64,
        created_at: parse_time(17, row.get(17)?)?,
        updated_at: parse_time(18, row.get(18)?)?,
        touched_at: parse_time(19, row.get(19)?)?,
    })
}

fn write_entry(conn: &Connection, entry: &SyncEntry) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_entries (
            id, course_id, kind, remote_id, remote_locator, version, local_path,
            size_bytes, bytes_transferred,
            status, retry_count, last_error, is_hidden_from_user, pause_requested,
            position, next_attempt_at, revision,
            created_at, updated_at, touched_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7,
            ?8, ?9,
            ?10, ?11, ?12, ?13, ?14,
            ?15, ?16, ?17,
            ?18, ?19, ?20
        )
        ON CONFLICT(id) DO UPDATE SET
            remote_locator = excluded.remote_locator,
            version = excluded.version,
            local_path = excluded.local_path,
            size_bytes = excluded.size_bytes,
            bytes_transferred = excluded.bytes_transferred,
            status = excluded.status,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            is_hidden_from_user = excluded.is_hidden_from_user,
            pause_requested = excluded.pause_requested,
            position = excluded.position,
            next_attempt_at = excluded.next_attempt_at,
            revision = excluded.revision,
            updated_at = excluded.updated_at,
            touched_at = excluded.touched_at
        "#,
        params![
            entry.id.as_str(),
            entry.course_id.as_str(),
            entry.kind.as_str(),
            entry.remote_id,
            entry.remote_locator,
            entry.version,
            entry.local_path.to_string_lossy().to_string(),
            entry.size_bytes.map(|s| s as i64),
            entry.bytes_transferred as i64,
            entry.status.as_str(),
            entry.retry_count,
            entry.last_error,
            entry.is_hidden_from_user,
            entry.pause_requested,
            entry.position,
            entry.next_attempt_at.map(|t| t.to_rfc3339()),
            entry.revision as i64,
            entry.created_at.to_rfc3339(),
            entry.updated_at.to_rfc3339(),
            entry.touched_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn load_entry(conn: &Connection, id: &str) -> rusqlite::Result<Option<SyncEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_entries WHERE id = ?1", ENTRY_COLUMNS),
        params![id],
        row_to_entry,
    )
    .optional()
}

fn query_entries(
    conn: &Connection,
    filter: &str,
    value: Option<&str>,
) -> rusqlite::Result<Vec<SyncEntry>> {
    let sql = format!("SELECT {} FROM sync_entries {}", ENTRY_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = match value {
        Some(v) => stmt.query_map(params![v], row_to_entry)?,
        None => stmt.query_map([], row_to_entry)?,
    };
    rows.collect()
}

#[async_trait]
impl EntryStore for SqliteEntryStore {
    async fn upsert(&self, entries: &[SyncEntry]) -> Result<Vec<SyncEntry>> {
        for entry in entries {
            entry.validate()?;
        }
        let entries = entries.to_vec();

        self.with_inner("upsert entries", move |inner| {
            let now = Utc::now();
            let first = inner.revision;
            let tx = inner
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut written = Vec::with_capacity(entries.len());
            let mut revision = first;
            for mut entry in entries {
                revision += 1;
                entry.revision = revision;
                entry.updated_at = now;
                write_entry(&tx, &entry)?;
                written.push(entry);
            }
            tx.commit()?;

            inner.revision = revision;
            Ok(written)
        })
        .await
    }

    async fn merge(&self, candidates: Vec<SyncEntry>, merge: MergeFn) -> Result<Vec<EntryChange>> {
        self.with_inner("merge entries", move |inner| {
            let now = Utc::now();
            let mut revision = inner.revision;
            let tx = inner
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut changes = Vec::new();
            for candidate in candidates {
                let previous = load_entry(&tx, candidate.id.as_str())?;
                let Some(mut row) = merge(previous.as_ref(), candidate) else {
                    continue;
                };
                // Dropping `tx` on error rolls the whole batch back
                row.validate()?;
                revision += 1;
                row.revision = revision;
                row.updated_at = now;
                write_entry(&tx, &row)?;
                changes.push(EntryChange {
                    previous,
                    current: row,
                });
            }
            tx.commit()?;

            inner.revision = revision;
            Ok(changes)
        })
        .await
    }

    async fn get(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        let id = id.clone();
        self.with_inner("load entry", move |inner| {
            Ok(load_entry(&inner.conn, id.as_str())?)
        })
        .await
    }

    async fn find_by_course(&self, course_id: &CourseId) -> Result<Vec<SyncEntry>> {
        let course_id = course_id.clone();
        let mut rows = self
            .with_inner("load course entries", move |inner| {
                Ok(query_entries(
                    &inner.conn,
                    "WHERE course_id = ?1",
                    Some(course_id.as_str()),
                )?)
            })
            .await?;
        rows.sort_by(course_order);
        Ok(rows)
    }

    async fn find_by_status(&self, status: EntryStatus) -> Result<Vec<SyncEntry>> {
        let mut rows = self
            .with_inner("load entries by status", move |inner| {
                Ok(query_entries(
                    &inner.conn,
                    "WHERE status = ?1",
                    Some(status.as_str()),
                )?)
            })
            .await?;
        rows.sort_by(age_order);
        Ok(rows)
    }

    async fn load_all(&self) -> Result<Vec<SyncEntry>> {
        let mut rows = self
            .with_inner("load all entries", move |inner| {
                Ok(query_entries(&inner.conn, "", None)?)
            })
            .await?;
        rows.sort_by(age_order);
        Ok(rows)
    }

    async fn transaction(&self, id: &EntryId, mutate: EntryMutation) -> Result<TransactionOutcome> {
        let id = id.clone();
        self.with_inner("update entry", move |inner| {
            let next_revision = inner.revision + 1;
            let tx = inner
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(stored) = load_entry(&tx, id.as_str())? else {
                return Ok(TransactionOutcome::Missing);
            };

            match apply_mutation(&stored, mutate, || next_revision)? {
                Some(next) => {
                    write_entry(&tx, &next)?;
                    tx.commit()?;
                    inner.revision = next_revision;
                    Ok(TransactionOutcome::Applied(EntryChange {
                        previous: Some(stored),
                        current: next,
                    }))
                }
                None => Ok(TransactionOutcome::Unchanged(stored)),
            }
        })
        .await
    }

    async fn delete(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        let id = id.clone();
        self.with_inner("delete entry", move |inner| {
            let Some(mut removed) = load_entry(&inner.conn, id.as_str())? else {
                return Ok(None);
            };
            inner
                .conn
                .execute("DELETE FROM sync_entries WHERE id = ?1", params![id.as_str()])?;
            removed.revision = inner.next_revision();
            Ok(Some(removed))
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.with_inner("check database health", |inner| {
            let result: String =
                inner
                    .conn
                    .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            if result != "ok" {
                return Err(SyncError::EntryStore(format!(
                    "Integrity check failed: {}",
                    result
                )));
            }
            Ok(())
        })
        .await
    }

    async fn compact(&self) -> Result<()> {
        self.with_inner("compact database", |inner| {
            inner.conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }
}
