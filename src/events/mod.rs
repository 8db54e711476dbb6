//! Event stream emitted by the engine.
//!
//! The core reports lifecycle milestones as named events to a write-only
//! sink. Sinks are append-only and must never block the caller; the engine's
//! correctness does not depend on them. The default sink forwards events to
//! `tracing`, so the crate's log output is the event stream.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::download::DownloadStatus;

/// A named engine event with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    /// A transfer began.
    Start {
        /// Download URL.
        url: String,
        /// Owning queue.
        queue: String,
        /// Effective bandwidth cap in KiB/s; 0 means unlimited.
        max_bandwidth: u64,
    },

    /// A download changed status (including periodic progress reports,
    /// which are `downloading -> downloading`).
    Status {
        /// Download URL.
        url: String,
        /// Status before the change.
        old_status: DownloadStatus,
        /// Status after the change.
        new_status: DownloadStatus,
        /// Bytes received so far.
        downloaded: u64,
        /// Total bytes when known; 0 means unknown.
        total_size: u64,
    },

    /// A download is waiting, with the reason it cannot run yet.
    Pending {
        /// Download URL.
        url: String,
        /// Owning queue.
        queue: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A download-level error.
    Error {
        /// Download URL.
        url: String,
        /// Owning queue.
        queue: String,
        /// Error message.
        message: String,
    },

    /// A transfer finished successfully.
    Complete {
        /// Download URL.
        url: String,
        /// Final on-disk path.
        path: PathBuf,
        /// Wall time from start to completion.
        duration: Duration,
        /// Total bytes written.
        total_size: u64,
    },

    /// Queue-level activity (admission, pause routing, CRUD).
    Queue {
        /// Free-form message.
        message: String,
    },

    /// Engine lifecycle (startup, shutdown, sweeps).
    System {
        /// Free-form message.
        message: String,
    },
}

impl Event {
    /// Returns the stable event kind label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "START",
            Self::Status { .. } => "STATUS",
            Self::Pending { .. } => "PENDING",
            Self::Error { .. } => "ERROR",
            Self::Complete { .. } => "COMPLETE",
            Self::Queue { .. } => "QUEUE",
            Self::System { .. } => "SYSTEM",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start {
                url,
                queue,
                max_bandwidth,
            } => write!(
                f,
                "Download started - URL: {url}, Queue: {queue}, Bandwidth Limit: {max_bandwidth} KB/s"
            ),
            Self::Status {
                url,
                old_status,
                new_status,
                downloaded,
                total_size,
            } => {
                if *total_size > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let progress = *downloaded as f64 / *total_size as f64 * 100.0;
                    write!(
                        f,
                        "Status changed for {url}: {old_status} -> {new_status} \
                         (Progress: {progress:.2}%, Downloaded: {downloaded}/{total_size} bytes)"
                    )
                } else {
                    write!(f, "Status changed for {url}: {old_status} -> {new_status}")
                }
            }
            Self::Pending { url, queue, reason } => write!(
                f,
                "Download pending - URL: {url}, Queue: {queue}, Reason: {reason}"
            ),
            Self::Error {
                url,
                queue,
                message,
            } => write!(f, "Error for download {url} in queue {queue}: {message}"),
            Self::Complete {
                url,
                path,
                duration,
                total_size,
            } => {
                let secs = duration.as_secs_f64();
                #[allow(clippy::cast_precision_loss)]
                let avg_mbps = if secs > 0.0 {
                    *total_size as f64 / (1024.0 * 1024.0 * secs)
                } else {
                    0.0
                };
                write!(
                    f,
                    "Download complete - URL: {url}, Path: {}, Duration: {duration:?}, \
                     Size: {total_size} bytes, Avg Speed: {avg_mbps:.2} MB/s",
                    path.display()
                )
            }
            Self::Queue { message } | Self::System { message } => write!(f, "{message}"),
        }
    }
}

/// A write-only destination for engine events.
///
/// Implementations must be cheap and non-blocking; the engine emits events
/// from inside transfer loops and scheduler critical paths.
pub trait EventSink: Send + Sync {
    /// Appends one event.
    fn emit(&self, event: Event);
}

/// Sink that forwards events to `tracing` at an appropriate level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::Error { .. } => {
                tracing::warn!(target: "download_manager::events", kind = event.kind(), "{event}");
            }
            _ => {
                tracing::info!(target: "download_manager::events", kind = event.kind(), "{event}");
            }
        }
    }
}

/// Sink that records events in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of recorded events with the given kind label.
    #[must_use]
    pub fn count_kind(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}
