//! Typed error hierarchy for course-sync
//!
//! Every error carries enough context to decide how the scheduler should
//! react to it: retry with backoff, park the entry as a server error, or
//! stop and wait for the user.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-related errors (connection, timeout, DNS, etc.)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// The remote server answered with an error status
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Local filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Entry store (database) failure
    #[error("Entry store error: {0}")]
    EntryStore(String),

    /// Resolving a course content tree failed; nothing was committed
    #[error("Failed to compose course {course_id}: {message}")]
    Composition { course_id: String, message: String },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Scheduling stopped after repeated local storage failures
    #[error("Sync halted: {0}")]
    SyncHalted(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset mid-transfer
    ConnectionReset,
    /// Connection or chunk timeout
    Timeout,
    /// TLS/SSL error
    Tls,
    /// Server not reachable
    Unreachable,
    /// Too many redirects
    TooManyRedirects,
    /// Locator could not be parsed
    InvalidUrl,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Disk full
    DiskFull,
    /// Path is outside the offline root
    PathTraversal,
    /// File already exists
    AlreadyExists,
    /// I/O error
    Io,
}

/// How the transfer scheduler treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff until the retry budget runs out
    Transient,
    /// Park the entry as `serverError`; only a manual resume retries it
    Server,
    /// Local disk or entry store failure; retried, and counted towards halting
    Storage,
    /// The attempt was stopped by a pause, delete or shutdown request
    Cancelled,
    /// Fail immediately without consuming retries
    Fatal,
}

impl SyncError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.failure_class(),
            FailureClass::Transient | FailureClass::Storage
        )
    }

    /// Classify this error for the retry policy
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Network { retryable, .. } => {
                if *retryable {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            Self::Server { .. } => FailureClass::Server,
            Self::Storage { .. } | Self::EntryStore(_) => FailureClass::Storage,
            Self::Shutdown => FailureClass::Cancelled,
            _ => FailureClass::Fatal,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::DnsResolution
                | NetworkErrorKind::Unreachable
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a server error from an HTTP-like status code
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Attach a path to an I/O failure
    pub fn io_at(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let mut converted = Self::from(err);
        if let Self::Storage { path: p, .. } = &mut converted {
            *p = path.into();
        }
        converted
    }

    /// Create a composition error
    pub fn composition(course_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Composition {
            course_id: course_id.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            ErrorKind::StorageFull => StorageErrorKind::DiskFull,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::server(status.as_u16(), err.to_string());
        }

        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else if err.is_redirect() {
            NetworkErrorKind::TooManyRedirects
        } else if err.is_body() || err.is_decode() {
            NetworkErrorKind::ConnectionReset
        } else if err.is_builder() {
            NetworkErrorKind::InvalidUrl
        } else {
            NetworkErrorKind::Other
        };

        Self::network(kind, err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        Self::network(NetworkErrorKind::InvalidUrl, err.to_string())
    }
}

#[cfg(feature = "storage")]
impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::EntryStore(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Task failed: {}", err))
    }
}
