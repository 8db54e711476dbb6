//! Thin HTTP client wrapper shared by all transfers.
//!
//! One `reqwest::Client` (and thus one connection pool) serves every
//! download the scheduler runs. The wrapper pins the timeout policy, maps
//! transport failures into [`TransferError`], and knows the two request
//! shapes the engine needs: a HEAD probe and a plain or ranged GET.

use std::fmt;
use std::time::Duration;

use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::Client;
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::TransferError;

/// An HTTP byte range, formatted as the `Range` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (inclusive); `None` means "to the end".
    pub end: Option<u64>,
}

impl ByteRange {
    /// Open-ended range from `start`, used for single-part resume.
    #[must_use]
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Closed range `[start, end]`, used for part workers.
    #[must_use]
    pub fn closed(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// What a HEAD probe learned about a URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeResult {
    /// `Content-Length` when advertised.
    pub total_size: Option<u64>,
    /// Whether the server advertises `Accept-Ranges: bytes`.
    pub supports_ranges: bool,
}

/// HTTP client for download transfers.
///
/// Cheap to clone (the inner `reqwest::Client` is reference-counted); the
/// scheduler hands one clone to every transfer task.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts: 10 s connect, 30 s to the
    /// response headers, no overall deadline (large downloads run long).
    ///
    /// # Panics
    ///
    /// Panics if the client builder fails with the static configuration,
    /// which does not happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values in seconds.
    ///
    /// # Panics
    ///
    /// Panics if the client builder fails with the supplied configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, header_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(header_timeout_secs))
            .gzip(true)
            // Transfers connect directly; environment proxies do not apply.
            .no_proxy()
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Probes a URL with HEAD.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] on transport failure or a non-success
    /// status. Callers treat probe failure as non-fatal and proceed to GET.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, TransferError> {
        let response = self.client.head(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(TransferError::http_status(url, response.status().as_u16()));
        }

        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let supports_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        debug!(?total_size, supports_ranges, "HEAD probe result");

        Ok(ProbeResult {
            total_size,
            supports_ranges,
        })
    }

    /// Issues a GET, optionally with a `Range` header.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Network`] / [`TransferError::Timeout`] on
    /// transport failure and [`TransferError::HttpStatus`] for any status
    /// outside 200..300. A `206 Partial Content` is a success here; whether
    /// it was required is the caller's decision.
    #[instrument(skip(self), fields(range = ?range))]
    pub async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<reqwest::Response, TransferError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_string());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(url)
            } else {
                TransferError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(TransferError::http_status(url, response.status().as_u16()));
        }

        Ok(response)
    }
}
