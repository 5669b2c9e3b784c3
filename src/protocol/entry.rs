//! Sync entries and derived course summaries

use super::types::{ContentKind, CourseId, EntryId, EntryStatus};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent record of one downloadable content unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub id: EntryId,
    pub course_id: CourseId,
    pub kind: ContentKind,
    /// Identifier of the unit on the content API
    pub remote_id: String,
    /// URL the payload is fetched from
    pub remote_locator: String,
    /// Version/etag reported by the API, used to detect changed content
    pub version: Option<String>,
    /// Deterministic location under the offline root
    pub local_path: PathBuf,
    /// Total size once known
    pub size_bytes: Option<u64>,
    /// Bytes durably written to `local_path`
    pub bytes_transferred: u64,
    pub status: EntryStatus,
    /// Consecutive transient failures since the last manual resume
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Set once the user acknowledged a finished entry
    pub is_hidden_from_user: bool,
    /// Pause intent recorded while active; survives a crash
    pub pause_requested: bool,
    /// Order within the course as produced by the composer
    pub position: u32,
    /// Earliest time a queued retry may be dispatched
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Store-assigned write sequence, strictly increasing across all writes
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time a composition pass saw this entry
    pub touched_at: DateTime<Utc>,
}

impl SyncEntry {
    /// Create a fresh queued entry
    pub fn new(
        course_id: CourseId,
        kind: ContentKind,
        remote_id: impl Into<String>,
        remote_locator: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let remote_id = remote_id.into();
        let now = Utc::now();
        Self {
            id: EntryId::compose(&course_id, kind, &remote_id),
            course_id,
            kind,
            remote_id,
            remote_locator: remote_locator.into(),
            version: None,
            local_path: local_path.into(),
            size_bytes: None,
            bytes_transferred: 0,
            status: EntryStatus::Queued,
            retry_count: 0,
            last_error: None,
            is_hidden_from_user: false,
            pause_requested: false,
            position: 0,
            next_attempt_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            touched_at: now,
        }
    }

    /// Reject rows that break the progress invariant
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.size_bytes {
            if self.bytes_transferred > size {
                return Err(SyncError::invalid_input(
                    "bytes_transferred",
                    format!(
                        "{} has {} bytes transferred but a size of {}",
                        self.id, self.bytes_transferred, size
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Record durable progress.
    ///
    /// A size reported by the API is only a hint; when more bytes arrive the
    /// size grows with them so the invariant keeps holding.
    pub fn record_progress(&mut self, bytes_transferred: u64) {
        self.bytes_transferred = bytes_transferred;
        if let Some(size) = self.size_bytes {
            if bytes_transferred > size {
                self.size_bytes = Some(bytes_transferred);
            }
        }
    }

    /// Record the size announced by the transport
    pub fn record_size(&mut self, size: u64) {
        self.size_bytes = Some(size.max(self.bytes_transferred));
    }

    /// Forget partial progress
    pub fn reset_progress(&mut self) {
        self.bytes_transferred = 0;
    }

    /// Whether a queued entry may be dispatched at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Progress percentage (0.0 - 100.0) when the size is known
    pub fn percentage(&self) -> Option<f64> {
        match self.size_bytes {
            Some(0) if self.status == EntryStatus::Completed => Some(100.0),
            Some(size) if size > 0 => Some(self.bytes_transferred as f64 / size as f64 * 100.0),
            _ => None,
        }
    }
}

/// Aggregate view of one course for progress widgets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSummary {
    pub queued_count: usize,
    pub active_count: usize,
    pub paused_count: usize,
    /// Entries needing attention: `failed` plus `serverError`
    pub failed_count: usize,
    /// The `serverError` share of `failed_count`
    pub server_error_count: usize,
    pub completed_count: usize,
    /// Sum of known sizes
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

impl CourseSummary {
    /// Fold a course's entries into counts and byte totals
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a SyncEntry>) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.status {
                EntryStatus::Queued => summary.queued_count += 1,
                EntryStatus::Active => summary.active_count += 1,
                EntryStatus::Paused => summary.paused_count += 1,
                EntryStatus::Completed => summary.completed_count += 1,
                EntryStatus::Failed => summary.failed_count += 1,
                EntryStatus::ServerError => {
                    summary.failed_count += 1;
                    summary.server_error_count += 1;
                }
            }
            summary.total_bytes += entry.size_bytes.unwrap_or(0);
            summary.transferred_bytes += entry.bytes_transferred;
        }
        summary
    }

    pub fn entry_count(&self) -> usize {
        self.queued_count
            + self.active_count
            + self.paused_count
            + self.failed_count
            + self.completed_count
    }

    /// No entry is waiting for or holding a transfer slot
    pub fn is_settled(&self) -> bool {
        self.queued_count == 0 && self.active_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: EntryStatus, size: Option<u64>, transferred: u64) -> SyncEntry {
        let mut e = SyncEntry::new(
            CourseId::new("7"),
            ContentKind::File,
            format!("{:?}-{}", status, transferred),
            "https://lms.example/files/1",
            "/tmp/offline/file",
        );
        e.status = status;
        e.size_bytes = size;
        e.bytes_transferred = transferred;
        e
    }

    #[test]
    fn test_validate_rejects_overflowing_progress() {
        assert!(entry(EntryStatus::Active, Some(100), 100).validate().is_ok());
        assert!(entry(EntryStatus::Active, None, 500).validate().is_ok());
        assert!(entry(EntryStatus::Active, Some(100), 101).validate().is_err());
    }

    #[test]
    fn test_record_progress_grows_size_hint() {
        let mut e = entry(EntryStatus::Active, Some(10), 0);
        e.record_progress(8);
        assert_eq!(e.size_bytes, Some(10));
        e.record_progress(25);
        assert_eq!(e.size_bytes, Some(25));
        assert!(e.validate().is_ok());

        e.record_size(5);
        assert_eq!(e.size_bytes, Some(25));
    }

    #[test]
    fn test_summary_counts_server_errors_as_failed() {
        let entries = vec![
            entry(EntryStatus::Queued, Some(100), 0),
            entry(EntryStatus::Active, Some(100), 40),
            entry(EntryStatus::Completed, Some(50), 50),
            entry(EntryStatus::Failed, None, 0),
            entry(EntryStatus::ServerError, Some(10), 0),
        ];
        let summary = CourseSummary::from_entries(&entries);
        assert_eq!(summary.queued_count, 1);
        assert_eq!(summary.active_count, 1);
        assert_eq!(summary.completed_count, 1);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.server_error_count, 1);
        assert_eq!(summary.total_bytes, 260);
        assert_eq!(summary.transferred_bytes, 90);
        assert_eq!(summary.entry_count(), 5);
        assert!(!summary.is_settled());
    }

    #[test]
    fn test_retry_delay_gates_dispatch() {
        let mut e = entry(EntryStatus::Queued, None, 0);
        let now = Utc::now();
        assert!(e.is_due(now));
        e.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!e.is_due(now));
        assert!(e.is_due(now + chrono::Duration::seconds(6)));
    }
}
