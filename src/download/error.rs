//! Error types for the download module.
//!
//! Transfer errors carry the context (URL, path, byte counts) needed for
//! useful log lines and for the retry loop's classification decisions.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while transferring a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, TLS, broken stream).
    #[error("network error for {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the response headers arrived.
    #[error("timeout for {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP status (anything outside 200..300).
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The server ignored or refused a `Range` request.
    ///
    /// Never surfaced past the transfer: the multi-part coordinator reacts
    /// by falling back to a single-part attempt.
    #[error("server refused range request for {url}")]
    RangeUnsupported {
        /// The URL whose server lacks byte-range support.
        url: String,
    },

    /// Filesystem error while creating, writing, or removing the target file.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The stream ended before the advertised number of bytes arrived.
    #[error("incomplete transfer for {url}: got {downloaded} of {total} bytes")]
    IncompleteTransfer {
        /// The URL being transferred.
        url: String,
        /// Bytes received so far.
        downloaded: u64,
        /// Bytes advertised by the server.
        total: u64,
    },

    /// The transfer was cancelled by a control signal.
    ///
    /// Terminates the attempt but is not an error in the user sense.
    #[error("transfer cancelled")]
    Cancelled,

    /// All retry attempts were exhausted.
    #[error("transfer failed after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Total attempts made, including the initial one.
        attempts: u32,
        /// Message of the last underlying error.
        last: String,
    },
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a range-unsupported error.
    pub fn range_unsupported(url: impl Into<String>) -> Self {
        Self::RangeUnsupported { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an incomplete-transfer error.
    pub fn incomplete(url: impl Into<String>, downloaded: u64, total: u64) -> Self {
        Self::IncompleteTransfer {
            url: url.into(),
            downloaded,
            total,
        }
    }
}

// No blanket `From<reqwest::Error>` / `From<std::io::Error>` impls: every
// variant requires context (url, path) the source error does not carry. The
// helper constructors above are the intended construction path.

/// Classification of a transfer failure for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// May succeed on retry: network faults, bad statuses, short reads, IO.
    Transient,
    /// Retrying would not help; the download ends in `error`.
    Fatal,
    /// Cancelled by the caller; never retried.
    Cancelled,
}

/// Classifies a transfer error for retry decisions.
///
/// Everything the network or filesystem can throw mid-transfer is considered
/// transient: the retry loop owns the attempt budget. Only exhaustion itself
/// and range refusal (handled before the retry layer) are fatal.
#[must_use]
pub fn classify(error: &TransferError) -> FailureKind {
    match error {
        TransferError::Network { .. }
        | TransferError::Timeout { .. }
        | TransferError::HttpStatus { .. }
        | TransferError::Io { .. }
        | TransferError::IncompleteTransfer { .. } => FailureKind::Transient,
        TransferError::RangeUnsupported { .. } | TransferError::MaxRetriesExceeded { .. } => {
            FailureKind::Fatal
        }
        TransferError::Cancelled => FailureKind::Cancelled,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let error = TransferError::http_status("https://example.com/file.bin", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "expected status in: {msg}");
        assert!(msg.contains("example.com"), "expected URL in: {msg}");
    }

    #[test]
    fn test_io_display_contains_path() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = TransferError::io(PathBuf::from("/tmp/out.bin"), io_error);
        assert!(error.to_string().contains("/tmp/out.bin"));
    }

    #[test]
    fn test_incomplete_display_contains_counts() {
        let error = TransferError::incomplete("https://example.com/f", 512, 1024);
        let msg = error.to_string();
        assert!(msg.contains("512"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_classify_network_transient() {
        // reqwest errors are hard to fabricate; exercise the other transient arms
        assert_eq!(
            classify(&TransferError::timeout("https://example.com")),
            FailureKind::Transient
        );
        assert_eq!(
            classify(&TransferError::http_status("https://example.com", 500)),
            FailureKind::Transient
        );
        assert_eq!(
            classify(&TransferError::incomplete("https://example.com", 1, 2)),
            FailureKind::Transient
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(
            classify(&TransferError::io("/tmp/x", io)),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_classify_cancelled() {
        assert_eq!(classify(&TransferError::Cancelled), FailureKind::Cancelled);
    }

    #[test]
    fn test_classify_fatal() {
        assert_eq!(
            classify(&TransferError::range_unsupported("https://example.com")),
            FailureKind::Fatal
        );
        assert_eq!(
            classify(&TransferError::MaxRetriesExceeded {
                attempts: 4,
                last: "HTTP 500".to_string(),
            }),
            FailureKind::Fatal
        );
    }
}
