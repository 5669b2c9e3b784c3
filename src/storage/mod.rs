//! Storage Module
//!
//! Durable record of every sync entry. The entry store is the single source
//! of truth for entry state: workers, the controller and the composer all
//! mutate rows through it, never through cached copies.
//!
//! Every write is stamped with a fresh revision from one counter shared by
//! all rows, so consumers can order states of the same entry even when the
//! writes came from different tasks.

#[cfg(feature = "storage")]
pub mod sqlite;

#[cfg(feature = "storage")]
pub use sqlite::SqliteEntryStore;

use crate::error::{Result, SyncError};
use crate::protocol::{CourseId, EntryId, EntryStatus, SyncEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// In-place mutation applied by [`EntryStore::transaction`].
///
/// Returns `false` to leave the row untouched.
pub type EntryMutation = Box<dyn FnOnce(&mut SyncEntry) -> bool + Send + 'static>;

/// Per-row merge applied by [`EntryStore::merge`].
///
/// Receives the stored row (if any) and the candidate, and returns the row
/// to write, or `None` to leave the stored row as it is.
pub type MergeFn = Arc<dyn Fn(Option<&SyncEntry>, SyncEntry) -> Option<SyncEntry> + Send + Sync>;

/// A row before and after a write
#[derive(Debug, Clone)]
pub struct EntryChange {
    pub previous: Option<SyncEntry>,
    pub current: SyncEntry,
}

impl EntryChange {
    pub fn status_changed(&self) -> bool {
        self.previous.as_ref().map(|p| p.status) != Some(self.current.status)
    }
}

/// Result of a single-row read-modify-write
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    /// The mutation ran and the row was written
    Applied(EntryChange),
    /// The mutation declined to change the row
    Unchanged(SyncEntry),
    /// No row with that id exists
    Missing,
}

impl TransactionOutcome {
    pub fn applied(self) -> Option<EntryChange> {
        match self {
            Self::Applied(change) => Some(change),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<&SyncEntry> {
        match self {
            Self::Applied(change) => Some(&change.current),
            Self::Unchanged(entry) => Some(entry),
            Self::Missing => None,
        }
    }
}

/// Storage trait for sync entries
///
/// All writes validate the row before committing and stamp `revision` and
/// `updated_at`. Batch operations are all-or-nothing.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Insert or replace rows by id, atomically as a batch
    async fn upsert(&self, entries: &[SyncEntry]) -> Result<Vec<SyncEntry>>;

    /// Read-modify-write a batch of rows in one transaction
    async fn merge(&self, candidates: Vec<SyncEntry>, merge: MergeFn) -> Result<Vec<EntryChange>>;

    /// Load an entry by id
    async fn get(&self, id: &EntryId) -> Result<Option<SyncEntry>>;

    /// Entries of a course in composer order
    async fn find_by_course(&self, course_id: &CourseId) -> Result<Vec<SyncEntry>>;

    /// Entries with a status, oldest first
    async fn find_by_status(&self, status: EntryStatus) -> Result<Vec<SyncEntry>>;

    /// Every stored entry
    async fn load_all(&self) -> Result<Vec<SyncEntry>>;

    /// Atomically read-modify-write a single row
    async fn transaction(&self, id: &EntryId, mutate: EntryMutation) -> Result<TransactionOutcome>;

    /// Delete a row, returning it stamped with the deletion's revision
    async fn delete(&self, id: &EntryId) -> Result<Option<SyncEntry>>;

    /// Check if storage is healthy
    async fn health_check(&self) -> Result<()>;

    /// Compact/vacuum storage
    async fn compact(&self) -> Result<()>;
}

/// Ordering used for `find_by_course`
pub(crate) fn course_order(a: &SyncEntry, b: &SyncEntry) -> std::cmp::Ordering {
    a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id))
}

/// Ordering used for `find_by_status`
pub(crate) fn age_order(a: &SyncEntry, b: &SyncEntry) -> std::cmp::Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.course_id.cmp(&b.course_id))
        .then_with(|| course_order(a, b))
}

/// Apply a mutation to a copy of `stored`, validating the result
pub(crate) fn apply_mutation(
    stored: &SyncEntry,
    mutate: EntryMutation,
    revision: impl FnOnce() -> u64,
) -> Result<Option<SyncEntry>> {
    let mut next = stored.clone();
    if !mutate(&mut next) {
        return Ok(None);
    }
    if next.id != stored.id {
        return Err(SyncError::Internal(format!(
            "transaction on {} changed the entry id",
            stored.id
        )));
    }
    next.validate()?;
    next.revision = revision();
    next.updated_at = Utc::now();
    Ok(Some(next))
}

/// In-memory storage (for testing and ephemeral sessions)
#[derive(Default)]
pub struct MemoryEntryStore {
    inner: parking_lot::RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<EntryId, SyncEntry>,
    revision: u64,
}

impl MemoryInner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn upsert(&self, entries: &[SyncEntry]) -> Result<Vec<SyncEntry>> {
        for entry in entries {
            entry.validate()?;
        }

        let mut inner = self.inner.write();
        let now = Utc::now();
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut row = entry.clone();
            row.revision = inner.next_revision();
            row.updated_at = now;
            inner.rows.insert(row.id.clone(), row.clone());
            written.push(row);
        }
        Ok(written)
    }

    async fn merge(&self, candidates: Vec<SyncEntry>, merge: MergeFn) -> Result<Vec<EntryChange>> {
        let mut inner = self.inner.write();

        // Compute the whole batch before writing anything
        let mut pending = Vec::new();
        for candidate in candidates {
            let previous = inner.rows.get(&candidate.id).cloned();
            if let Some(row) = merge(previous.as_ref(), candidate) {
                row.validate()?;
                pending.push((previous, row));
            }
        }

        let now = Utc::now();
        let mut changes = Vec::with_capacity(pending.len());
        for (previous, mut row) in pending {
            row.revision = inner.next_revision();
            row.updated_at = now;
            inner.rows.insert(row.id.clone(), row.clone());
            changes.push(EntryChange {
                previous,
                current: row,
            });
        }
        Ok(changes)
    }

    async fn get(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        Ok(self.inner.read().rows.get(id).cloned())
    }

    async fn find_by_course(&self, course_id: &CourseId) -> Result<Vec<SyncEntry>> {
        let mut rows: Vec<SyncEntry> = self
            .inner
            .read()
            .rows
            .values()
            .filter(|e| &e.course_id == course_id)
            .cloned()
            .collect();
        rows.sort_by(course_order);
        Ok(rows)
    }

    async fn find_by_status(&self, status: EntryStatus) -> Result<Vec<SyncEntry>> {
        let mut rows: Vec<SyncEntry> = self
            .inner
            .read()
            .rows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        rows.sort_by(age_order);
        Ok(rows)
    }

    async fn load_all(&self) -> Result<Vec<SyncEntry>> {
        let mut rows: Vec<SyncEntry> = self.inner.read().rows.values().cloned().collect();
        rows.sort_by(age_order);
        Ok(rows)
    }

    async fn transaction(&self, id: &EntryId, mutate: EntryMutation) -> Result<TransactionOutcome> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.rows.get(id).cloned() else {
            return Ok(TransactionOutcome::Missing);
        };

        let next_revision = inner.revision + 1;
        match apply_mutation(&stored, mutate, || next_revision)? {
            Some(next) => {
                inner.revision = next_revision;
                inner.rows.insert(id.clone(), next.clone());
                Ok(TransactionOutcome::Applied(EntryChange {
                    previous: Some(stored),
                    current: next,
                }))
            }
            None => Ok(TransactionOutcome::Unchanged(stored)),
        }
    }

    async fn delete(&self, id: &EntryId) -> Result<Option<SyncEntry>> {
        let mut inner = self.inner.write();
        let Some(mut removed) = inner.rows.remove(id) else {
            return Ok(None);
        };
        removed.revision = inner.next_revision();
        Ok(Some(removed))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
