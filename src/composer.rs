//! Content composer
//!
//! Turns a resolved course content tree into candidate sync entries and
//! reconciles them against what the entry store already holds.

use crate::disk::OfflineLayout;
use crate::error::{Result, SyncError};
use crate::protocol::{CourseId, EntryId, EntryStatus, SyncEntry};
use crate::source::ContentSource;
use crate::storage::MergeFn;
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;

/// Builds sync entries from a content source
pub struct ContentComposer {
    source: Arc<dyn ContentSource>,
    layout: OfflineLayout,
}

impl ContentComposer {
    pub fn new(source: Arc<dyn ContentSource>, layout: OfflineLayout) -> Self {
        Self { source, layout }
    }

    pub fn layout(&self) -> &OfflineLayout {
        &self.layout
    }

    /// Lazily translate a course's content tree into candidate entries.
    ///
    /// Units without a downloadable payload are skipped and a unit seen
    /// twice yields one entry. Candidates are fresh `queued` rows in
    /// traversal order; [`reconcile`] decides what actually gets written.
    /// Each call walks the tree again.
    pub fn compose(
        &self,
        course_id: &CourseId,
        use_cache: bool,
    ) -> BoxStream<'static, Result<SyncEntry>> {
        let course = course_id.clone();
        let layout = self.layout.clone();
        let composed_at = Utc::now();
        let mut seen: HashSet<EntryId> = HashSet::new();
        let mut position: u32 = 0;

        self.source
            .resolve_course_content_tree(course_id, use_cache)
            .filter_map(move |unit| {
                let item = match unit {
                    Err(e @ SyncError::Composition { .. }) => Some(Err(e)),
                    Err(e) => Some(Err(SyncError::composition(course.as_str(), e.to_string()))),
                    Ok(unit) if !unit.is_downloadable() => {
                        tracing::trace!(
                            course = %course,
                            remote_id = %unit.remote_id,
                            kind = %unit.kind,
                            "Skipping unit without payload"
                        );
                        None
                    }
                    Ok(unit) => {
                        let id = EntryId::compose(&course, unit.kind, &unit.remote_id);
                        if seen.insert(id) {
                            let path = layout.entry_path(&course, unit.kind, &unit.remote_id);
                            let mut entry = SyncEntry::new(
                                course.clone(),
                                unit.kind,
                                unit.remote_id,
                                unit.remote_locator.unwrap_or_default(),
                                path,
                            );
                            entry.version = unit.version;
                            entry.size_bytes = unit.size_hint;
                            entry.position = position;
                            entry.created_at = composed_at;
                            entry.updated_at = composed_at;
                            entry.touched_at = composed_at;
                            position += 1;
                            Some(Ok(entry))
                        } else {
                            None
                        }
                    }
                };
                future::ready(item)
            })
            .boxed()
    }

    /// Drain [`compose`](Self::compose); any resolution error fails the whole pass
    pub async fn compose_all(&self, course_id: &CourseId, use_cache: bool) -> Result<Vec<SyncEntry>> {
        self.compose(course_id, use_cache).try_collect().await
    }

    /// Merge function committing candidates through [`reconcile`]
    pub fn merge_fn() -> MergeFn {
        Arc::new(|stored, candidate| Some(reconcile(stored, candidate, Utc::now())))
    }
}

/// Decide the row to store for `candidate` given the current row.
///
/// - New units are inserted as queued.
/// - Active rows belong to their worker and are only touched.
/// - Completed rows stay untouched unless the remote version changed, in
///   which case they are queued again from scratch.
/// - Other rows keep their status and retry count; a version change drops
///   stale partial progress.
pub fn reconcile(stored: Option<&SyncEntry>, candidate: SyncEntry, now: DateTime<Utc>) -> SyncEntry {
    let Some(stored) = stored else {
        let mut row = candidate;
        row.touched_at = now;
        return row;
    };

    let mut row = stored.clone();
    row.touched_at = now;
    if stored.status == EntryStatus::Active {
        return row;
    }

    let version_changed = candidate.version.is_some() && candidate.version != stored.version;
    row.remote_locator = candidate.remote_locator;
    row.position = candidate.position;

    match stored.status {
        EntryStatus::Completed if !version_changed => {}
        EntryStatus::Completed => {
            row.status = EntryStatus::Queued;
            row.version = candidate.version;
            row.size_bytes = candidate.size_bytes;
            row.reset_progress();
            row.retry_count = 0;
            row.last_error = None;
            row.next_attempt_at = None;
            row.is_hidden_from_user = false;
        }
        _ if version_changed => {
            row.version = candidate.version;
            row.size_bytes = candidate.size_bytes;
            row.reset_progress();
        }
        _ => {
            if row.size_bytes.is_none() {
                row.size_bytes = candidate
                    .size_bytes
                    .filter(|size| *size >= row.bytes_transferred);
            }
        }
    }

    row
}
