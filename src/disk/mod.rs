//! Disk Module
//!
//! File operations used by transfer workers, reconciliation and deletion.
//! Every operation is idempotent where it can be: deleting a missing file
//! or truncating to the current length succeeds.

pub mod layout;

pub use layout::{encode_component, OfflineLayout};

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Filesystem abstraction for offline content
#[async_trait]
pub trait Disk: Send + Sync {
    /// Write `bytes` at `offset`, creating the file and its parents.
    /// Returns once the data is durable.
    async fn write(&self, path: &Path, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Cut the file down to `len` bytes (no-op if missing)
    async fn truncate(&self, path: &Path, len: u64) -> Result<()>;

    /// Delete a file (no-op if missing)
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Size of the file, or `None` if it does not exist
    async fn size(&self, path: &Path) -> Result<Option<u64>>;

    /// Remove a directory tree (no-op if missing)
    async fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Every regular file below `dir`
    async fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Disk backed by the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalDisk;

impl LocalDisk {
    pub fn new() -> Self {
        Self
    }
}

fn ignore_missing(result: std::io::Result<()>, path: &Path) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io_at(e, path)),
    }
}

#[async_trait]
impl Disk for LocalDisk {
    async fn write(&self, path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io_at(e, parent))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| SyncError::io_at(e, path))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| SyncError::io_at(e, path))?;
        file.write_all(bytes)
            .await
            .map_err(|e| SyncError::io_at(e, path))?;
        file.sync_data()
            .await
            .map_err(|e| SyncError::io_at(e, path))?;
        Ok(())
    }

    async fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = match OpenOptions::new().write(true).open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::io_at(e, path)),
        };
        file.set_len(len)
            .await
            .map_err(|e| SyncError::io_at(e, path))?;
        file.sync_all().await.map_err(|e| SyncError::io_at(e, path))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        ignore_missing(fs::remove_file(path).await, path)
    }

    async fn size(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io_at(e, path)),
        }
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        ignore_missing(fs::remove_dir_all(path).await, path)
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::io_at(e, &current)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SyncError::io_at(e, &current))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SyncError::io_at(e, entry.path()))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
