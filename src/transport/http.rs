//! HTTP transport
//!
//! GETs the locator with a `Range` header when resuming, and falls back to a
//! full fetch when the server ignores or rejects the range.

use super::{TransferBody, Transport};
use crate::config::HttpConfig;
use crate::error::{NetworkErrorKind, Result, SyncError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use url::Url;

/// Transport backed by a pooled reqwest client
pub struct HttpTransport {
    client: Client,
    user_agent: String,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: &HttpConfig) -> Result<Self> {
        // No transparent decompression: byte offsets must match the stored file
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .read_timeout(Duration::from_secs(config.read_timeout))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(ref proxy_url) = config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| SyncError::Internal(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    async fn send(&self, url: &Url, range_start: u64) -> Result<Response> {
        let mut request = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent);
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={}-", range_start));
        }
        Ok(request.send().await?)
    }
}

/// Map an error status onto the scheduler's failure classes.
///
/// Request timeouts and throttling are transient; every other error status
/// is a server error.
pub fn classify_status(status: StatusCode) -> SyncError {
    let message = status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::network(
            NetworkErrorKind::Timeout,
            format!("HTTP {}: {}", status.as_u16(), message),
        ),
        _ => SyncError::server(status.as_u16(), message),
    }
}

/// Parse `Content-Range: bytes start-end/total`
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let header = header.strip_prefix("bytes ")?;
    let (range, total) = header.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, locator: &str, range_start: u64) -> Result<TransferBody> {
        let url = Url::parse(locator)?;

        let mut response = self.send(&url, range_start).await?;
        let mut requested = range_start;

        // The stored offset is past the end (content shrank): start over
        if requested > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            tracing::debug!(%url, offset = requested, "Range not satisfiable, refetching from start");
            response = self.send(&url, 0).await?;
            requested = 0;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let (resumed, total_size) = if status == StatusCode::PARTIAL_CONTENT && requested > 0 {
            let content_range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match content_range {
                Some((start, _, total)) if start == requested => (true, total),
                _ => {
                    return Err(SyncError::network(
                        NetworkErrorKind::Other,
                        format!("Resume position mismatch for offset {}", requested),
                    ))
                }
            }
        } else {
            (false, header_u64(&response, CONTENT_LENGTH))
        };

        tracing::debug!(
            %url,
            status = status.as_u16(),
            resumed,
            total_size = ?total_size,
            "Opened transfer"
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from))
            .boxed();

        Ok(TransferBody {
            stream,
            total_size,
            resumed,
        })
    }
}
