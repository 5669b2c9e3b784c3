//! Transfer worker
//!
//! Drives one claimed entry from its last checkpoint to a terminal or
//! resumable status. Bytes are buffered in memory and flushed to disk at
//! every checkpoint; `bytes_transferred` is only advanced after the flush
//! succeeded, so the stored progress never runs ahead of the file.
//! When the remote ignores the requested range the stream is read from
//! byte 0 and the prefix already on disk is skipped, so an active entry
//! never loses progress.

use super::{RetryDecision, SlotPermit, StopIntent, SyncContext, TransferHandle};
use crate::error::{FailureClass, NetworkErrorKind, Result, StorageErrorKind, SyncError};
use crate::protocol::{EntryStatus, SyncEntry};
use crate::storage::{EntryMutation, TransactionOutcome};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// How an attempt ended without an error
#[derive(Debug)]
enum Finish {
    Completed,
    Stopped(StopIntent),
    /// The row disappeared under the worker
    Vanished,
}

/// Run a claimed entry to the end of this attempt.
///
/// Holds the slot permit until the handle is unregistered.
pub(super) async fn run(
    ctx: Arc<SyncContext>,
    entry: SyncEntry,
    handle: Arc<TransferHandle>,
    _permit: SlotPermit,
) {
    let id = entry.id.clone();
    tracing::info!(entry = %id, offset = entry.bytes_transferred, "Transfer started");

    let mut transfer = Transfer::new(&ctx, &handle, entry);
    let result = transfer.execute().await;
    transfer.conclude(result).await;

    ctx.control.finish(&id, &handle);
}

struct Transfer<'a> {
    ctx: &'a SyncContext,
    handle: &'a TransferHandle,
    /// Latest stored state of the entry
    entry: SyncEntry,
    /// Bytes durably on disk
    offset: u64,
    total_size: Option<u64>,
    buffer: Vec<u8>,
    last_checkpoint: Instant,
}

impl<'a> Transfer<'a> {
    fn new(ctx: &'a SyncContext, handle: &'a TransferHandle, entry: SyncEntry) -> Self {
        Self {
            ctx,
            handle,
            offset: entry.bytes_transferred,
            total_size: entry.size_bytes,
            entry,
            buffer: Vec::new(),
            last_checkpoint: Instant::now(),
        }
    }

    fn stopped(&self) -> Finish {
        Finish::Stopped(self.handle.intent())
    }

    async fn execute(&mut self) -> Result<Finish> {
        let ctx = self.ctx;
        let path = self.entry.local_path.clone();

        // The claim already lowered the checkpoint to what the file holds
        let start = self.entry.bytes_transferred;
        let shrunk = |len: u64| {
            SyncError::storage(
                StorageErrorKind::NotFound,
                &path,
                format!("partial file holds {} of {} checkpointed bytes", len, start),
            )
        };
        match ctx.disk.size(&path).await? {
            Some(len) if len > start => ctx.disk.truncate(&path, start).await?,
            Some(len) if len < start => return Err(shrunk(len)),
            None if start > 0 => return Err(shrunk(0)),
            _ => {}
        }
        self.offset = start;

        let token = self.handle.token().clone();
        let chunk_timeout = ctx.config.chunk_timeout();

        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.stopped()),
            opened = tokio::time::timeout(
                chunk_timeout,
                ctx.transport.fetch(&self.entry.remote_locator, start),
            ) => opened.map_err(|_| {
                SyncError::network(NetworkErrorKind::Timeout, "no response within the chunk timeout")
            })??,
        };

        // Bytes of a full stream that are already on disk
        let mut skip = 0;
        if start > 0 && !body.resumed {
            if body.total_size.is_some_and(|total| total < start) {
                return Err(self
                    .abandon_partial("remote content is shorter than the partial file")
                    .await?);
            }
            tracing::debug!(entry = %self.entry.id, start, "Range not honoured, skipping stored prefix");
            skip = start;
        }
        if body.total_size.is_some() {
            self.total_size = body.total_size;
        }
        if !self.checkpoint().await? {
            return Ok(Finish::Vanished);
        }

        let mut stream = body.stream;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.stopped()),
                next = tokio::time::timeout(chunk_timeout, stream.next()) => next.map_err(|_| {
                    SyncError::network(NetworkErrorKind::Timeout, "no data within the chunk timeout")
                })?,
            };
            let Some(chunk) = next else {
                break;
            };
            let mut chunk = chunk?;
            if skip > 0 {
                let n = chunk.len().min(skip as usize);
                chunk = chunk.slice(n..);
                skip -= n as u64;
            }
            self.buffer.extend_from_slice(&chunk);

            if self.checkpoint_due() {
                self.flush().await?;
                if self.handle.is_stopping() {
                    return Ok(self.stopped());
                }
                if !self.checkpoint().await? {
                    return Ok(Finish::Vanished);
                }
            }
        }

        if skip > 0 {
            return Err(self
                .abandon_partial("remote content ended inside the partial file")
                .await?);
        }
        self.flush().await?;
        if self.handle.intent() == StopIntent::Remove {
            return Ok(Finish::Stopped(StopIntent::Remove));
        }
        // A zero-byte payload still gets its file
        if self.offset == 0 && ctx.disk.size(&path).await?.is_none() {
            ctx.disk.write(&path, 0, &[]).await?;
        }
        if let Some(expected) = self.total_size {
            if self.offset < expected {
                return Err(SyncError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("stream ended after {} of {} bytes", self.offset, expected),
                ));
            }
        }
        Ok(Finish::Completed)
    }

    fn checkpoint_due(&self) -> bool {
        self.buffer.len() as u64 >= self.ctx.config.progress_bytes
            || self.last_checkpoint.elapsed() >= self.ctx.config.progress_interval()
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.ctx
            .disk
            .write(&self.entry.local_path, self.offset, &self.buffer)
            .await?;
        self.offset += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Persist the flushed offset; returns `false` if the row is gone
    async fn checkpoint(&mut self) -> Result<bool> {
        let offset = self.offset;
        let total = self.total_size;
        let outcome = self
            .ctx
            .store
            .transaction(
                &self.entry.id,
                Box::new(move |e| {
                    if e.status != EntryStatus::Active {
                        return false;
                    }
                    let size = total.map(|t| t.max(offset)).or(e.size_bytes);
                    if e.bytes_transferred == offset && e.size_bytes == size {
                        return false;
                    }
                    e.record_progress(offset);
                    if let Some(total) = total {
                        e.record_size(total);
                    }
                    true
                }),
            )
            .await?;
        self.last_checkpoint = Instant::now();

        match outcome {
            TransactionOutcome::Applied(change) => {
                tracing::trace!(entry = %change.current.id, bytes = offset, "Checkpoint");
                self.ctx.emit(&change);
                self.entry = change.current;
                Ok(true)
            }
            TransactionOutcome::Unchanged(current) => {
                self.entry = current;
                Ok(true)
            }
            TransactionOutcome::Missing => Ok(false),
        }
    }

    /// Write the final status of this attempt
    async fn conclude(&mut self, result: Result<Finish>) {
        let ctx = self.ctx;
        let id = self.entry.id.clone();
        // Unflushed bytes are never counted
        self.buffer.clear();
        let offset = self.offset;

        let mutation: EntryMutation = match result {
            Ok(Finish::Completed) => Box::new(move |e| {
                if e.status != EntryStatus::Active {
                    return false;
                }
                e.status = EntryStatus::Completed;
                e.record_progress(offset);
                e.size_bytes = Some(offset);
                e.last_error = None;
                e.next_attempt_at = None;
                e.pause_requested = false;
                true
            }),
            Ok(Finish::Stopped(StopIntent::Pause)) => {
                let offset = if ctx.transport.supports_ranges() {
                    offset
                } else {
                    self.discard_partial().await;
                    0
                };
                Box::new(move |e| {
                    if e.status != EntryStatus::Active {
                        return false;
                    }
                    e.status = EntryStatus::Paused;
                    e.record_progress(offset);
                    e.pause_requested = false;
                    true
                })
            }
            Ok(Finish::Stopped(StopIntent::Shutdown)) => Box::new(move |e| {
                if e.status != EntryStatus::Active {
                    return false;
                }
                e.status = if e.pause_requested {
                    EntryStatus::Paused
                } else {
                    EntryStatus::Queued
                };
                e.record_progress(offset);
                e.pause_requested = false;
                true
            }),
            Ok(Finish::Stopped(StopIntent::Interrupt)) => Box::new(move |e| {
                if e.status != EntryStatus::Active {
                    return false;
                }
                e.status = EntryStatus::Failed;
                e.record_progress(offset);
                e.last_error = Some("interrupted".to_string());
                e.pause_requested = false;
                true
            }),
            Ok(Finish::Stopped(intent)) => {
                // Removal: the controller owns the row and the file now
                tracing::debug!(entry = %id, ?intent, "Transfer stopped");
                return;
            }
            Ok(Finish::Vanished) => {
                tracing::debug!(entry = %id, "Entry removed during transfer");
                self.discard_partial().await;
                return;
            }
            Err(error) => self.failure_mutation(error),
        };

        match ctx.store.transaction(&id, mutation).await {
            Ok(TransactionOutcome::Applied(change)) => {
                let entry = &change.current;
                match entry.status {
                    EntryStatus::Completed => {
                        ctx.record_storage_success();
                        tracing::info!(entry = %id, bytes = entry.bytes_transferred, "Transfer completed");
                    }
                    status => {
                        tracing::debug!(entry = %id, status = %status, bytes = entry.bytes_transferred, "Transfer ended");
                    }
                }
                ctx.emit(&change);
            }
            Ok(TransactionOutcome::Unchanged(_)) => {}
            Ok(TransactionOutcome::Missing) => self.discard_partial().await,
            Err(e) => {
                tracing::warn!(entry = %id, error = %e, "Failed to record transfer outcome");
                ctx.record_storage_failure(&e);
            }
        }
    }

    /// Turn a failed attempt into the entry's next status
    fn failure_mutation(&self, error: SyncError) -> EntryMutation {
        let ctx = self.ctx;
        if error.failure_class() == FailureClass::Storage {
            ctx.record_storage_failure(&error);
        }

        let decision = ctx.retry.decide(self.entry.retry_count, &error);
        let offset = if ctx.transport.supports_ranges() {
            self.offset
        } else {
            0
        };
        let message = error.to_string();
        tracing::warn!(
            entry = %self.entry.id,
            retry_count = self.entry.retry_count,
            ?decision,
            error = %message,
            "Transfer attempt failed"
        );

        Box::new(move |e| {
            if e.status != EntryStatus::Active {
                return false;
            }
            e.record_progress(offset);
            e.last_error = Some(message);
            match decision {
                RetryDecision::RetryAfter(delay) => {
                    e.retry_count += 1;
                    if e.pause_requested {
                        e.status = EntryStatus::Paused;
                        e.next_attempt_at = None;
                    } else {
                        e.status = EntryStatus::Queued;
                        let delay = chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        e.next_attempt_at = Some(Utc::now() + delay);
                    }
                }
                RetryDecision::ServerError => e.status = EntryStatus::ServerError,
                RetryDecision::Fail => e.status = EntryStatus::Failed,
            }
            e.pause_requested = false;
            true
        })
    }

    /// Drop the partial file so the next attempt starts from zero
    async fn abandon_partial(&mut self, reason: &str) -> Result<SyncError> {
        tracing::debug!(entry = %self.entry.id, offset = self.offset, reason, "Abandoning partial file");
        self.ctx.disk.truncate(&self.entry.local_path, 0).await?;
        self.offset = 0;
        Ok(SyncError::network(NetworkErrorKind::ConnectionReset, reason))
    }

    async fn discard_partial(&self) {
        if let Err(e) = self.ctx.disk.delete(&self.entry.local_path).await {
            tracing::warn!(entry = %self.entry.id, error = %e, "Failed to delete partial file");
        }
    }
}
