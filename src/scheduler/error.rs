//! Caller-facing error types for scheduler operations.

use thiserror::Error;

use crate::config::ConfigError;
use crate::download::DownloadStatus;

/// Errors returned synchronously by scheduler operations.
///
/// These are refusals, not failures: the operation did not apply and no
/// state changed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The named queue does not exist.
    #[error("unknown queue: {name}")]
    IllegalQueue {
        /// The queue name that failed to resolve.
        name: String,
    },

    /// The queue is already running its maximum number of downloads.
    #[error("queue {name} is at maximum capacity ({max_concurrent} downloads)")]
    QueueFull {
        /// Queue name.
        name: String,
        /// The configured concurrency bound.
        max_concurrent: usize,
    },

    /// The current time is outside the queue's admission window.
    #[error("queue {name} is outside its allowed time window ({window})")]
    OutsideWindow {
        /// Queue name.
        name: String,
        /// Window label, `HH:MM-HH:MM`.
        window: String,
    },

    /// The requested operation is not defined for the download's current
    /// status. No state change occurred.
    #[error("cannot {operation} a download in status {status}")]
    IllegalTransition {
        /// The operation that was requested.
        operation: &'static str,
        /// The status the download was in.
        status: DownloadStatus,
    },

    /// No download with this URL is tracked.
    #[error("unknown download: {url}")]
    UnknownDownload {
        /// The URL that failed to resolve.
        url: String,
    },

    /// A download with this URL is already tracked.
    #[error("download already exists: {url}")]
    DuplicateDownload {
        /// The duplicate URL.
        url: String,
    },

    /// A queue with this name already exists.
    #[error("queue already exists: {name}")]
    QueueExists {
        /// The duplicate name.
        name: String,
    },

    /// The queue still has active downloads and cannot be deleted.
    #[error("queue {name} has active downloads")]
    QueueBusy {
        /// Queue name.
        name: String,
    },

    /// The default queue cannot be deleted.
    #[error("cannot delete the default queue {name}")]
    DefaultQueue {
        /// Queue name.
        name: String,
    },

    /// The download has no retry budget left.
    #[error("retries exhausted for {url}")]
    RetriesExhausted {
        /// The download URL.
        url: String,
    },

    /// The queue or download definition failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_transition_display() {
        let error = SchedulerError::IllegalTransition {
            operation: "pause",
            status: DownloadStatus::Completed,
        };
        let msg = error.to_string();
        assert!(msg.contains("pause"));
        assert!(msg.contains("completed"));
    }

    #[test]
    fn test_outside_window_display() {
        let error = SchedulerError::OutsideWindow {
            name: "night".to_string(),
            window: "23:00-06:00".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("night"));
        assert!(msg.contains("23:00-06:00"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let error: SchedulerError = ConfigError::invalid_queue("q", "bad").into();
        assert!(error.to_string().contains("invalid queue"));
    }
}
