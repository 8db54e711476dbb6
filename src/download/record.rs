//! The download record: persisted fields, status machine, shared handle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constants::{DEFAULT_MAX_PARTS, DEFAULT_MAX_RETRIES, DEFAULT_MULTIPART_THRESHOLD};

/// Status of a download.
///
/// Legal transitions:
///
/// ```text
/// pending -> downloading -> completed | error | cancelled
/// downloading <-> paused
/// paused -> cancelled
/// error -> pending        (explicit retry)
/// ```
///
/// `completed`, `error`, and `cancelled` are terminal for the transfer;
/// only an explicit retry leaves `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a queue slot.
    Pending,
    /// A transfer task is moving bytes.
    Downloading,
    /// Suspended between reads; resumable.
    Paused,
    /// All bytes written and verified.
    Completed,
    /// Failed after retries were exhausted.
    Error,
    /// Cancelled by the caller; partial file removed.
    Cancelled,
}

impl DownloadStatus {
    /// Returns the stable string representation used in the JSON document.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for `completed`, `error`, and `cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Returns true while a transfer task owns the download.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_multipart_size() -> u64 {
    DEFAULT_MULTIPART_THRESHOLD
}

fn default_max_parts() -> usize {
    DEFAULT_MAX_PARTS
}

fn default_use_multipart() -> bool {
    true
}

/// One download: identity, placement, progress, and transfer options.
///
/// The URL is the logical identifier within the process; the scheduler
/// rejects duplicates at insertion. Serialized field names match the
/// persisted configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    /// Source URL; unique within the scheduler.
    pub url: String,

    /// Final on-disk path. Derived from the owning queue's directory and the
    /// URL basename when not supplied.
    #[serde(default)]
    pub target_path: PathBuf,

    /// Basename of the target file.
    #[serde(default)]
    pub filename: String,

    /// Name of the owning queue.
    pub queue: String,

    /// Current lifecycle status.
    #[serde(default = "pending_status")]
    pub status: DownloadStatus,

    /// Completion percentage, 0–100. Exactly 100 iff `completed`.
    #[serde(default)]
    pub progress: f64,

    /// Smoothed transfer rate in bytes per second.
    #[serde(default)]
    pub speed: u64,

    /// Total size in bytes; 0 means unknown.
    #[serde(default)]
    pub total_size: u64,

    /// Bytes received in the current attempt (plus resumed prefix).
    #[serde(default)]
    pub downloaded: u64,

    /// Last error message when `status = error`, else empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Per-download bandwidth cap in KiB/s; 0 inherits the queue limit.
    #[serde(default)]
    pub max_bandwidth: u64,

    /// When the current transfer began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the download reached `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Do not start before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_time: Option<DateTime<Utc>>,

    /// Retry attempts consumed so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether to attempt a parallel multi-part fetch for large files.
    #[serde(default = "default_use_multipart")]
    pub use_multipart: bool,

    /// Size threshold (bytes) below which multi-part is skipped.
    #[serde(default = "default_multipart_size")]
    pub multipart_size: u64,

    /// Upper bound on parallel parts.
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
}

fn pending_status() -> DownloadStatus {
    DownloadStatus::Pending
}

impl Download {
    /// Creates a pending download in the given queue with defaults for every
    /// transfer option.
    #[must_use]
    pub fn new(url: impl Into<String>, queue: impl Into<String>) -> Self {
        let url = url.into();
        let filename = filename_from_url(&url);
        Self {
            url,
            target_path: PathBuf::new(),
            filename,
            queue: queue.into(),
            status: DownloadStatus::Pending,
            progress: 0.0,
            speed: 0,
            total_size: 0,
            downloaded: 0,
            error: String::new(),
            max_bandwidth: 0,
            start_time: None,
            completion_time: None,
            scheduled_start_time: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            use_multipart: true,
            multipart_size: DEFAULT_MULTIPART_THRESHOLD,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }

    /// Sets an explicit target path.
    #[must_use]
    pub fn with_target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = path.into();
        if let Some(name) = self.target_path.file_name().and_then(|n| n.to_str()) {
            self.filename = name.to_string();
        }
        self
    }

    /// Sets a per-download bandwidth cap in KiB/s.
    #[must_use]
    pub fn with_max_bandwidth(mut self, kib_per_sec: u64) -> Self {
        self.max_bandwidth = kib_per_sec;
        self
    }

    /// Disables or enables the multi-part strategy.
    #[must_use]
    pub fn with_multipart(mut self, enabled: bool) -> Self {
        self.use_multipart = enabled;
        self
    }

    /// Defers the start until the given instant.
    #[must_use]
    pub fn with_scheduled_start(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_start_time = Some(when);
        self
    }

    /// Fills in `target_path` from the queue directory when none was given.
    pub fn resolve_target_path(&mut self, queue_dir: &Path) {
        if self.target_path.as_os_str().is_empty() {
            self.target_path = queue_dir.join(&self.filename);
        }
    }

    /// Recomputes `progress` from `downloaded` / `total_size`.
    ///
    /// With an unknown total the percentage stays at zero until completion.
    pub fn update_progress(&mut self) {
        if self.total_size > 0 {
            #[allow(clippy::cast_precision_loss)]
            let pct = self.downloaded as f64 / self.total_size as f64 * 100.0;
            self.progress = pct.min(100.0);
        }
    }

    /// Resets the fields that belong to a single attempt.
    ///
    /// Used by the explicit retry operation; the retry budget itself is
    /// untouched here.
    pub fn reset_attempt(&mut self) {
        self.downloaded = 0;
        self.progress = 0.0;
        self.speed = 0;
        self.error.clear();
        self.start_time = None;
        self.completion_time = None;
    }
}

impl fmt::Display for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Download {{ url: {}, queue: {}, status: {} }}",
            self.url, self.queue, self.status
        )
    }
}

/// Derives a filename from the last non-empty path segment of a URL.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let from_path = url::Url::parse(url).ok().and_then(|u| {
        u.path_segments().and_then(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .next_back()
                .map(ToString::to_string)
        })
    });

    match from_path {
        Some(name) => name,
        None => "download".to_string(),
    }
}

/// Shared, synchronized view of one [`Download`].
///
/// The transfer task mutates the record between reads; the scheduler and any
/// UI poller observe it through [`snapshot`](Self::snapshot), which always
/// yields a consistent `{status, downloaded, total_size, speed, error}`
/// tuple because every access holds the per-download lock.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    inner: Arc<Mutex<Download>>,
}

impl DownloadHandle {
    /// Wraps a record in a shared handle.
    #[must_use]
    pub fn new(download: Download) -> Self {
        Self {
            inner: Arc::new(Mutex::new(download)),
        }
    }

    /// Runs `f` with exclusive access to the record.
    ///
    /// The critical section must stay synchronous; callers never hold the
    /// lock across an await point.
    pub fn with<R>(&self, f: impl FnOnce(&mut Download) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Returns a point-in-time copy of the record.
    #[must_use]
    pub fn snapshot(&self) -> Download {
        self.with(|d| d.clone())
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.with(|d| d.status)
    }

    /// Returns the download URL.
    #[must_use]
    pub fn url(&self) -> String {
        self.with(|d| d.url.clone())
    }
}
