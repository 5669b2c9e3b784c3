//! Transport Module
//!
//! Fetches the payload behind a remote locator as a stream of byte chunks,
//! optionally starting at a byte offset.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Chunked body of a transfer
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened transfer
pub struct TransferBody {
    /// Remaining payload, starting at the honoured offset
    pub stream: ByteStream,
    /// Total payload size if the remote reported it
    pub total_size: Option<u64>,
    /// Whether the requested range start was honoured; when `false` the
    /// stream starts at byte 0
    pub resumed: bool,
}

impl std::fmt::Debug for TransferBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBody")
            .field("total_size", &self.total_size)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Source of payload bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the payload at `locator`, asking for bytes from `range_start` on
    async fn fetch(&self, locator: &str, range_start: u64) -> Result<TransferBody>;

    /// Whether partial files are worth keeping for a later ranged fetch
    fn supports_ranges(&self) -> bool {
        true
    }
}
