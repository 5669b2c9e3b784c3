//! Engine configuration
//!
//! This module contains all configuration options for the sync engine.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory for offline content
    pub root_dir: PathBuf,

    /// Session (signed-in user) the content belongs to
    pub session_id: String,

    /// Database path for the entry store
    pub database_path: Option<PathBuf>,

    /// Size of the transfer pool
    pub max_concurrent_transfers: usize,

    /// Transfers a single course may hold at once
    pub max_transfers_per_course: usize,

    /// Maximum wait for the next chunk before the attempt fails
    pub chunk_timeout_ms: u64,

    /// Checkpoint progress at least this often while bytes arrive
    pub progress_interval_ms: u64,

    /// Checkpoint progress after this many new bytes
    pub progress_bytes: u64,

    /// Consecutive storage failures that halt scheduling
    pub storage_failure_threshold: u32,

    /// How long shutdown waits for workers to checkpoint
    pub shutdown_timeout_ms: u64,

    /// Retry/backoff configuration
    pub retry: RetryConfig,

    /// HTTP transport configuration
    pub http: HttpConfig,
}

/// Backoff for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Transient failures tolerated before an entry fails
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Random spread applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// User agent sent with every request
    pub user_agent: String,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Proxy URL (e.g., "http://proxy:8080" or "socks5://proxy:1080")
    pub proxy_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("course-sync"),
            session_id: "default".to_string(),
            database_path: None,
            max_concurrent_transfers: 6,
            max_transfers_per_course: 3,
            chunk_timeout_ms: 30_000,
            progress_interval_ms: 300,
            progress_bytes: 256 * 1024,
            storage_failure_threshold: 3,
            shutdown_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            user_agent: format!("course-sync/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
            proxy_url: None,
        }
    }
}

impl SyncConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the offline root directory
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = path.into();
        self
    }

    /// Set the session id
    pub fn session_id(mut self, session: impl Into<String>) -> Self {
        self.session_id = session.into();
        self
    }

    /// Set the transfer pool size
    pub fn max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    /// Set the per-course transfer cap
    pub fn max_transfers_per_course(mut self, max: usize) -> Self {
        self.max_transfers_per_course = max;
        self
    }

    /// Set the progress checkpoint thresholds
    pub fn progress_checkpoint(mut self, interval_ms: u64, bytes: u64) -> Self {
        self.progress_interval_ms = interval_ms;
        self.progress_bytes = bytes;
        self
    }

    /// Set the per-chunk timeout
    pub fn chunk_timeout_ms(mut self, ms: u64) -> Self {
        self.chunk_timeout_ms = ms;
        self
    }

    /// Set the retry configuration
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the storage failure threshold
    pub fn storage_failure_threshold(mut self, threshold: u32) -> Self {
        self.storage_failure_threshold = threshold;
        self
    }

    /// Set the database path for persistence
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.exists() && !self.root_dir.is_dir() {
            return Err(SyncError::invalid_input(
                "root_dir",
                format!("Path is not a directory: {:?}", self.root_dir),
            ));
        }

        if self.session_id.is_empty()
            || self.session_id.contains(['/', '\\'])
            || self.session_id == ".."
        {
            return Err(SyncError::invalid_input(
                "session_id",
                "Must be a non-empty single path component",
            ));
        }

        if self.max_concurrent_transfers == 0 {
            return Err(SyncError::invalid_input(
                "max_concurrent_transfers",
                "Must be at least 1",
            ));
        }

        if self.max_transfers_per_course == 0 {
            return Err(SyncError::invalid_input(
                "max_transfers_per_course",
                "Must be at least 1",
            ));
        }

        if self.chunk_timeout_ms == 0 {
            return Err(SyncError::invalid_input(
                "chunk_timeout_ms",
                "Must be at least 1",
            ));
        }

        if self.storage_failure_threshold == 0 {
            return Err(SyncError::invalid_input(
                "storage_failure_threshold",
                "Must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SyncError::invalid_input(
                "jitter_factor",
                "Must be between 0.0 and 1.0",
            ));
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(SyncError::invalid_input(
                "initial_delay_ms",
                "Must not exceed max_delay_ms",
            ));
        }

        Ok(())
    }

    /// Root of this session's offline tree
    pub fn session_root(&self) -> PathBuf {
        self.root_dir
            .join(crate::disk::encode_component(&self.session_id))
    }

    /// Get the database path, using default if not set
    pub fn get_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.session_root().join("course-sync.db"))
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
