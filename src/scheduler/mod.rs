//! The queue scheduler: owns the download set and decides what runs when.
//!
//! One scheduler supervises every download in the process. It admits pending
//! downloads subject to each queue's gates (enabled, time window, concurrency
//! bound), routes pause/resume/cancel/retry commands to the owning transfer
//! task, and persists the configuration document whenever durable state
//! changes.
//!
//! All bookkeeping lives behind a single lock; transfers run concurrently
//! off the critical section and re-enter it only to report termination.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use download_manager::config::Config;
//! use download_manager::download::Download;
//! use download_manager::events::TracingSink;
//! use download_manager::scheduler::Scheduler;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let path = Config::default_path()?;
//! let config = Config::load_or_init(&path)?;
//! let scheduler = Scheduler::new(config, path, Arc::new(TracingSink));
//!
//! scheduler.start().await;
//! scheduler
//!     .add(Download::new("https://example.com/big.iso", "default"))
//!     .await?;
//! scheduler.process_all_queues().await;
//! # Ok(())
//! # }
//! ```

mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use error::SchedulerError;

use crate::config::{Config, QueueConfig};
use crate::download::{
    control_pair, Download, DownloadHandle, DownloadStatus, HttpClient, Transfer, TransferControl,
    TransferError,
};
use crate::events::{Event, EventSink};

/// Period of the background admission sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// One tracked download: the shared record plus transfer-task bookkeeping.
struct Entry {
    handle: DownloadHandle,
    /// Present while a transfer task is alive for this download.
    control: Option<TransferControl>,
    /// True while this download is counted against its queue's concurrency
    /// bound. Flipped exactly once per admission/release pair, so cancel
    /// and terminal paths cannot double-decrement.
    holds_slot: bool,
}

impl Entry {
    fn new(handle: DownloadHandle) -> Self {
        Self {
            handle,
            control: None,
            holds_slot: false,
        }
    }
}

/// Everything the scheduler lock protects.
struct State {
    config: Config,
    /// Tracked downloads in insertion order; admission order within a queue
    /// follows this.
    entries: Vec<Entry>,
    /// Live count of admitted downloads per queue.
    active: HashMap<String, usize>,
}

impl State {
    fn find(&self, url: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.handle.with(|d| d.url == url))
    }

    fn active_count(&self, queue: &str) -> usize {
        self.active.get(queue).copied().unwrap_or(0)
    }

    /// Gives back the queue slot held by `url`, exactly once.
    fn release_slot(&mut self, url: &str) {
        let Some(idx) = self.find(url) else { return };
        if !self.entries[idx].holds_slot {
            return;
        }
        self.entries[idx].holds_slot = false;
        let queue = self.entries[idx].handle.with(|d| d.queue.clone());
        if let Some(count) = self.active.get_mut(&queue) {
            *count = count.saturating_sub(1);
        }
    }

    /// The document as it should be persisted right now.
    fn document(&self) -> Config {
        let mut config = self.config.clone();
        config.downloads = self.entries.iter().map(|e| e.handle.snapshot()).collect();
        config
    }
}

struct Inner {
    state: Mutex<State>,
    client: HttpClient,
    sink: Arc<dyn EventSink>,
    config_path: PathBuf,
    retry_delay: Duration,
    sweeper: std::sync::Mutex<Option<CancellationToken>>,
}

/// The queue scheduler. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Builds a scheduler from a loaded configuration document.
    ///
    /// Downloads persisted as `downloading` are demoted to `pending`: their
    /// transfer tasks did not survive the restart, and the next sweep will
    /// re-admit them (resuming from `downloaded` where the server allows).
    #[must_use]
    pub fn new(mut config: Config, config_path: PathBuf, sink: Arc<dyn EventSink>) -> Self {
        let downloads = std::mem::take(&mut config.downloads);
        let entries: Vec<Entry> = downloads
            .into_iter()
            .map(|mut d| {
                if d.status == DownloadStatus::Downloading {
                    debug!(url = %d.url, "demoting interrupted download to pending");
                    d.status = DownloadStatus::Pending;
                    d.speed = 0;
                }
                Entry::new(DownloadHandle::new(d))
            })
            .collect();

        sink.emit(Event::System {
            message: format!("Queue scheduler initialized with {} downloads", entries.len()),
        });

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    config,
                    entries,
                    active: HashMap::new(),
                }),
                client: HttpClient::new(),
                sink,
                config_path,
                retry_delay: crate::download::constants::DEFAULT_RETRY_DELAY,
                sweeper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Overrides the transfer retry delay. Only effective before the first
    /// clone of the scheduler escapes (i.e. right after construction).
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_delay = delay;
        }
        self
    }

    fn emit(&self, event: Event) {
        self.inner.sink.emit(event);
    }

    /// Starts the background admission sweeper (one sweep immediately, then
    /// every ten seconds). Idempotent.
    pub async fn start(&self) {
        {
            let mut guard = self
                .inner
                .sweeper
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            drop(guard);

            self.emit(Event::System {
                message: "Queue scheduler started".to_string(),
            });

            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => scheduler.process_all_queues().await,
                    }
                }
            });
        }
    }

    /// Stops the background sweeper. Running transfers are not touched.
    pub fn stop(&self) {
        let token = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            self.emit(Event::System {
                message: "Queue scheduler stopped".to_string(),
            });
        }
    }

    /// Inserts a new download in `pending`.
    ///
    /// An empty queue name resolves to the configured default queue. The
    /// target path is derived from the queue directory and the URL basename
    /// when not supplied.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalQueue`] when the queue is unknown,
    /// [`SchedulerError::DuplicateDownload`] when the URL is already
    /// tracked.
    #[instrument(skip(self, download), fields(url = %download.url))]
    pub async fn add(&self, mut download: Download) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;

            if download.queue.is_empty() {
                download.queue.clone_from(&state.config.default_queue);
            }
            let Some(queue) = state.config.queue(&download.queue) else {
                return Err(SchedulerError::IllegalQueue {
                    name: download.queue,
                });
            };
            if state.find(&download.url).is_some() {
                return Err(SchedulerError::DuplicateDownload { url: download.url });
            }

            download.resolve_target_path(&queue.path);
            download.status = DownloadStatus::Pending;

            self.emit(Event::Pending {
                url: download.url.clone(),
                queue: download.queue.clone(),
                reason: "Added to queue".to_string(),
            });

            state.entries.push(Entry::new(DownloadHandle::new(download)));
        }
        self.persist().await;
        Ok(())
    }

    /// Pauses a running download.
    ///
    /// The queue slot is released immediately; the transfer task parks
    /// between reads until resumed or cancelled.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownDownload`] or
    /// [`SchedulerError::IllegalTransition`] when the download is not
    /// currently `downloading`.
    #[instrument(skip(self))]
    pub async fn pause(&self, url: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .find(url)
                .ok_or_else(|| SchedulerError::UnknownDownload {
                    url: url.to_string(),
                })?;

            let status = state.entries[idx].handle.status();
            if status != DownloadStatus::Downloading {
                return Err(SchedulerError::IllegalTransition {
                    operation: "pause",
                    status,
                });
            }

            let (queue, downloaded, total_size) = state.entries[idx].handle.with(|d| {
                d.status = DownloadStatus::Paused;
                (d.queue.clone(), d.downloaded, d.total_size)
            });
            if let Some(control) = &state.entries[idx].control {
                control.pause();
            }
            state.release_slot(url);

            self.emit(Event::Queue {
                message: format!("Pausing download {url} in queue {queue}"),
            });
            self.emit(Event::Status {
                url: url.to_string(),
                old_status: DownloadStatus::Downloading,
                new_status: DownloadStatus::Paused,
                downloaded,
                total_size,
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Resumes a paused download, subject to the queue's admission gates.
    ///
    /// A paused download whose transfer task did not survive a restart is
    /// re-admitted as a fresh transfer, which range-resumes from the bytes
    /// already on disk.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] when not `paused`,
    /// [`SchedulerError::IllegalQueue`] / [`SchedulerError::OutsideWindow`] /
    /// [`SchedulerError::QueueFull`] when the admission gates refuse.
    #[instrument(skip(self))]
    pub async fn resume(&self, url: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .find(url)
                .ok_or_else(|| SchedulerError::UnknownDownload {
                    url: url.to_string(),
                })?;

            let status = state.entries[idx].handle.status();
            if status != DownloadStatus::Paused {
                return Err(SchedulerError::IllegalTransition {
                    operation: "resume",
                    status,
                });
            }

            let queue_name = state.entries[idx].handle.with(|d| d.queue.clone());
            let Some(queue) = state.config.queue(&queue_name).cloned() else {
                return Err(SchedulerError::IllegalQueue { name: queue_name });
            };
            if !queue.is_time_allowed_at(Local::now().time()) {
                let window = queue.window_label();
                return Err(SchedulerError::OutsideWindow {
                    name: queue.name,
                    window,
                });
            }
            if state.active_count(&queue.name) >= queue.max_concurrent {
                return Err(SchedulerError::QueueFull {
                    name: queue.name,
                    max_concurrent: queue.max_concurrent,
                });
            }

            let (downloaded, total_size) = state.entries[idx].handle.with(|d| {
                d.status = DownloadStatus::Downloading;
                (d.downloaded, d.total_size)
            });

            if state.entries[idx].control.is_some() {
                state.entries[idx].holds_slot = true;
                *state.active.entry(queue.name.clone()).or_insert(0) += 1;
                if let Some(control) = &state.entries[idx].control {
                    control.resume();
                }
            } else {
                // No live task (loaded from disk paused): admit from scratch.
                self.spawn_transfer(&mut state, idx, &queue);
            }

            self.emit(Event::Queue {
                message: format!("Resuming download {url} in queue {}", queue.name),
            });
            self.emit(Event::Status {
                url: url.to_string(),
                old_status: DownloadStatus::Paused,
                new_status: DownloadStatus::Downloading,
                downloaded,
                total_size,
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Cancels a download from any non-terminal state.
    ///
    /// The queue slot is released atomically with the transition; the
    /// transfer task (when one exists) removes the partial file and records
    /// the terminal status.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownDownload`] or
    /// [`SchedulerError::IllegalTransition`] when already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, url: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .find(url)
                .ok_or_else(|| SchedulerError::UnknownDownload {
                    url: url.to_string(),
                })?;

            let status = state.entries[idx].handle.status();
            if status.is_terminal() {
                return Err(SchedulerError::IllegalTransition {
                    operation: "cancel",
                    status,
                });
            }

            state.release_slot(url);

            if let Some(control) = &state.entries[idx].control {
                // Flip the record now; the transfer task observes the signal
                // at its next checkpoint and removes the partial file.
                let (downloaded, total_size) = state.entries[idx].handle.with(|d| {
                    d.status = DownloadStatus::Cancelled;
                    d.speed = 0;
                    (d.downloaded, d.total_size)
                });
                control.cancel();
                self.emit(Event::Status {
                    url: url.to_string(),
                    old_status: status,
                    new_status: DownloadStatus::Cancelled,
                    downloaded,
                    total_size,
                });
            } else {
                let (path, downloaded, total_size) = state.entries[idx].handle.with(|d| {
                    d.status = DownloadStatus::Cancelled;
                    d.speed = 0;
                    (d.target_path.clone(), d.downloaded, d.total_size)
                });
                if downloaded > 0 {
                    if let Err(error) = std::fs::remove_file(&path) {
                        if error.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), %error, "failed to remove partial file");
                        }
                    }
                }
                self.emit(Event::Status {
                    url: url.to_string(),
                    old_status: status,
                    new_status: DownloadStatus::Cancelled,
                    downloaded,
                    total_size,
                });
            }

            self.emit(Event::Queue {
                message: format!("Cancelling download {url}"),
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Cancels (if needed) and deletes a download record.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownDownload`] when the URL is not tracked.
    #[instrument(skip(self))]
    pub async fn remove(&self, url: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .find(url)
                .ok_or_else(|| SchedulerError::UnknownDownload {
                    url: url.to_string(),
                })?;

            state.release_slot(url);
            if let Some(control) = &state.entries[idx].control {
                control.cancel();
            }
            let entry = state.entries.remove(idx);
            let queue = entry.handle.with(|d| d.queue.clone());

            self.emit(Event::Queue {
                message: format!("Removed download {url} from queue {queue}"),
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Re-enqueues a failed download as `pending`.
    ///
    /// Resets the per-attempt fields (`downloaded`, `progress`, `speed`,
    /// `error`); the retry counter itself is only ever advanced by the
    /// transfer retry loop.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] when the status is not `error`,
    /// [`SchedulerError::RetriesExhausted`] when no budget remains.
    #[instrument(skip(self))]
    pub async fn retry(&self, url: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            let idx = state
                .find(url)
                .ok_or_else(|| SchedulerError::UnknownDownload {
                    url: url.to_string(),
                })?;

            let (status, retry_count, max_retries) = state.entries[idx]
                .handle
                .with(|d| (d.status, d.retry_count, d.max_retries));
            if status != DownloadStatus::Error {
                return Err(SchedulerError::IllegalTransition {
                    operation: "retry",
                    status,
                });
            }
            if retry_count >= max_retries {
                return Err(SchedulerError::RetriesExhausted {
                    url: url.to_string(),
                });
            }

            let (queue, total_size) = state.entries[idx].handle.with(|d| {
                d.reset_attempt();
                d.status = DownloadStatus::Pending;
                (d.queue.clone(), d.total_size)
            });

            self.emit(Event::Pending {
                url: url.to_string(),
                queue,
                reason: format!("Retry requested ({retry_count} of {max_retries} attempts used)"),
            });
            self.emit(Event::Status {
                url: url.to_string(),
                old_status: DownloadStatus::Error,
                new_status: DownloadStatus::Pending,
                downloaded: 0,
                total_size,
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Runs one admission sweep over every queue, in configuration order.
    pub async fn process_all_queues(&self) {
        let started = {
            let mut state = self.inner.state.lock().await;
            self.admit_pending(&mut state)
        };
        if started > 0 {
            self.persist().await;
        }
    }

    /// Returns snapshots of every tracked download, in insertion order.
    pub async fn list_downloads(&self) -> Vec<Download> {
        let state = self.inner.state.lock().await;
        state.entries.iter().map(|e| e.handle.snapshot()).collect()
    }

    /// Returns the configured queues, in configuration order.
    pub async fn queues(&self) -> Vec<QueueConfig> {
        let state = self.inner.state.lock().await;
        state.config.queues.clone()
    }

    /// Adds a queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueExists`] on a duplicate name, or a validation
    /// error from the queue definition itself.
    #[instrument(skip(self, queue), fields(name = %queue.name))]
    pub async fn create_queue(&self, queue: QueueConfig) -> Result<(), SchedulerError> {
        queue.validate()?;
        {
            let mut state = self.inner.state.lock().await;
            if state.config.queue(&queue.name).is_some() {
                return Err(SchedulerError::QueueExists { name: queue.name });
            }
            self.emit(Event::Queue {
                message: format!("Created queue {}", queue.name),
            });
            state.config.queues.push(queue);
        }
        self.persist().await;
        Ok(())
    }

    /// Replaces a queue definition. Running downloads keep their slots; the
    /// new gates apply from the next admission decision.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalQueue`] when the name is unknown, or a
    /// validation error from the definition.
    #[instrument(skip(self, queue), fields(name = %queue.name))]
    pub async fn update_queue(&self, queue: QueueConfig) -> Result<(), SchedulerError> {
        queue.validate()?;
        {
            let mut state = self.inner.state.lock().await;
            let Some(existing) = state.config.queue_mut(&queue.name) else {
                return Err(SchedulerError::IllegalQueue { name: queue.name });
            };
            *existing = queue.clone();
            self.emit(Event::Queue {
                message: format!("Updated queue {}", queue.name),
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Deletes a queue. Its remaining downloads move to the default queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalQueue`] when unknown,
    /// [`SchedulerError::DefaultQueue`] for the default queue,
    /// [`SchedulerError::QueueBusy`] while the queue has active downloads.
    #[instrument(skip(self))]
    pub async fn delete_queue(&self, name: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.config.queue(name).is_none() {
                return Err(SchedulerError::IllegalQueue {
                    name: name.to_string(),
                });
            }
            if name == state.config.default_queue {
                return Err(SchedulerError::DefaultQueue {
                    name: name.to_string(),
                });
            }
            if state.active_count(name) > 0 {
                return Err(SchedulerError::QueueBusy {
                    name: name.to_string(),
                });
            }

            let default_queue = state.config.default_queue.clone();
            for entry in &state.entries {
                entry.handle.with(|d| {
                    if d.queue == name {
                        d.queue.clone_from(&default_queue);
                    }
                });
            }
            state.config.queues.retain(|q| q.name != name);

            self.emit(Event::Queue {
                message: format!("Deleted queue {name}, remaining downloads moved to {default_queue}"),
            });
        }
        self.persist().await;
        Ok(())
    }

    /// Admission algorithm: for each enabled queue inside its window, start
    /// pending downloads in insertion order until the concurrency bound is
    /// reached. Runs entirely under the scheduler lock.
    fn admit_pending(&self, state: &mut State) -> usize {
        let now = Local::now().time();
        let queues = state.config.queues.clone();
        let mut started = 0usize;

        for queue in &queues {
            if !queue.is_time_allowed_at(now) {
                debug!(queue = %queue.name, window = %queue.window_label(), "queue outside window");
                continue;
            }

            while state.active_count(&queue.name) < queue.max_concurrent {
                let Some(idx) = state.entries.iter().position(|e| {
                    e.control.is_none()
                        && e.handle
                            .with(|d| d.queue == queue.name && d.status == DownloadStatus::Pending)
                }) else {
                    break;
                };

                self.spawn_transfer(state, idx, queue);
                started += 1;
            }
        }

        if started > 0 {
            info!(started, "admission sweep started downloads");
        }
        started
    }

    /// Admits one entry: flips it to `downloading`, takes a queue slot, and
    /// spawns the supervised transfer task. Caller holds the lock.
    fn spawn_transfer(&self, state: &mut State, idx: usize, queue: &QueueConfig) {
        let entry = &mut state.entries[idx];
        let (url, max_bandwidth) = entry.handle.with(|d| {
            d.status = DownloadStatus::Downloading;
            (d.url.clone(), d.max_bandwidth)
        });

        let (control, signals) = control_pair();
        entry.control = Some(control);
        entry.holds_slot = true;
        *state.active.entry(queue.name.clone()).or_insert(0) += 1;

        self.emit(Event::Queue {
            message: format!("Starting download {url} in queue {}", queue.name),
        });

        let transfer = Transfer::new(
            entry.handle.clone(),
            self.inner.client.clone(),
            signals,
            effective_bandwidth(max_bandwidth, queue.speed_limit),
            Arc::clone(&self.inner.sink),
        )
        .with_retry_delay(self.inner.retry_delay);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = transfer.run().await;
            scheduler.on_transfer_finished(&url, result.err()).await;
        });
    }

    /// Called by the supervising task when a transfer reaches a terminal
    /// state. Releases the slot (at most once) and persists.
    async fn on_transfer_finished(&self, url: &str, error: Option<TransferError>) {
        {
            let mut state = self.inner.state.lock().await;
            state.release_slot(url);
            let Some(idx) = state.find(url) else {
                // Removed while terminating; nothing left to record.
                return;
            };
            state.entries[idx].control = None;

            let (queue, status) = state.entries[idx].handle.with(|d| (d.queue.clone(), d.status));
            let remaining = state.active_count(&queue);
            match &error {
                None => self.emit(Event::Queue {
                    message: format!(
                        "Download {url} completed in queue {queue} ({remaining} active)"
                    ),
                }),
                Some(error) => {
                    debug!(%url, %status, %error, "transfer finished with terminal error");
                    self.emit(Event::Queue {
                        message: format!(
                            "Download {url} finished as {status} in queue {queue} ({remaining} active)"
                        ),
                    });
                }
            }
        }
        self.persist().await;
    }

    /// Writes the current document to disk, best-effort.
    async fn persist(&self) {
        let document = {
            let state = self.inner.state.lock().await;
            state.document()
        };
        if let Err(error) = document.save(&self.inner.config_path) {
            warn!(%error, "failed to persist configuration");
        }
    }
}

/// The effective cap is the tighter of the download's own cap and the
/// queue's limit, with 0 meaning unlimited on either side.
fn effective_bandwidth(download_kib: u64, queue_kib: u64) -> u64 {
    match (download_kib, queue_kib) {
        (0, queue) => queue,
        (download, 0) => download,
        (download, queue) => download.min(queue),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use crate::events::MemorySink;

    use super::*;

    fn test_scheduler(dir: &TempDir) -> (Scheduler, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut config = Config::default();
        for queue in &mut config.queues {
            queue.path = dir.path().join(&queue.name);
        }
        let scheduler = Scheduler::new(
            config,
            dir.path().join("download-manager.json"),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        (scheduler, sink)
    }

    #[test]
    fn test_effective_bandwidth_min_rule() {
        assert_eq!(effective_bandwidth(0, 0), 0);
        assert_eq!(effective_bandwidth(0, 512), 512);
        assert_eq!(effective_bandwidth(256, 0), 256);
        assert_eq!(effective_bandwidth(256, 512), 256);
        assert_eq!(effective_bandwidth(512, 256), 256);
    }

    #[tokio::test]
    async fn test_add_unknown_queue_is_illegal() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        let result = scheduler
            .add(Download::new("https://example.com/f", "nope"))
            .await;
        assert!(matches!(result, Err(SchedulerError::IllegalQueue { .. })));
    }

    #[tokio::test]
    async fn test_add_duplicate_url_rejected() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await
            .unwrap();
        let result = scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::DuplicateDownload { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_empty_queue_uses_default() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f.bin", ""))
            .await
            .unwrap();

        let downloads = scheduler.list_downloads().await;
        assert_eq!(downloads[0].queue, "default");
        // Target path was derived from the queue directory.
        assert!(downloads[0].target_path.ends_with("default/f.bin"));
    }

    #[tokio::test]
    async fn test_pause_pending_is_illegal() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await
            .unwrap();

        let result = scheduler.pause("https://example.com/f").await;
        assert!(matches!(
            result,
            Err(SchedulerError::IllegalTransition {
                operation: "pause",
                status: DownloadStatus::Pending,
            })
        ));
    }

    #[tokio::test]
    async fn test_resume_pending_is_illegal() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await
            .unwrap();

        let result = scheduler.resume("https://example.com/f").await;
        assert!(matches!(
            result,
            Err(SchedulerError::IllegalTransition {
                operation: "resume",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_url_operations() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        for result in [
            scheduler.pause("https://nowhere.invalid/f").await,
            scheduler.resume("https://nowhere.invalid/f").await,
            scheduler.cancel("https://nowhere.invalid/f").await,
            scheduler.remove("https://nowhere.invalid/f").await,
            scheduler.retry("https://nowhere.invalid/f").await,
        ] {
            assert!(matches!(result, Err(SchedulerError::UnknownDownload { .. })));
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_without_task() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await
            .unwrap();
        scheduler.cancel("https://example.com/f").await.unwrap();

        let downloads = scheduler.list_downloads().await;
        assert_eq!(downloads[0].status, DownloadStatus::Cancelled);

        // Terminal: cancelling again is refused.
        let again = scheduler.cancel("https://example.com/f").await;
        assert!(matches!(
            again,
            Err(SchedulerError::IllegalTransition {
                operation: "cancel",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_retry_requires_error_state() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f", "default"))
            .await
            .unwrap();

        let result = scheduler.retry("https://example.com/f").await;
        assert!(matches!(
            result,
            Err(SchedulerError::IllegalTransition {
                operation: "retry",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_queue_crud_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        let mut queue = QueueConfig::new("bulk", dir.path().join("bulk"), 2);
        queue.speed_limit = 512;
        scheduler.create_queue(queue.clone()).await.unwrap();

        assert!(matches!(
            scheduler.create_queue(queue.clone()).await,
            Err(SchedulerError::QueueExists { .. })
        ));

        queue.max_concurrent = 4;
        scheduler.update_queue(queue).await.unwrap();
        let queues = scheduler.queues().await;
        assert_eq!(queues.iter().find(|q| q.name == "bulk").unwrap().max_concurrent, 4);

        scheduler.delete_queue("bulk").await.unwrap();
        assert!(scheduler.queues().await.iter().all(|q| q.name != "bulk"));
    }

    #[tokio::test]
    async fn test_delete_queue_reassigns_downloads_to_default() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .create_queue(QueueConfig::new("bulk", dir.path().join("bulk"), 2))
            .await
            .unwrap();
        scheduler
            .add(Download::new("https://example.com/f", "bulk"))
            .await
            .unwrap();

        scheduler.delete_queue("bulk").await.unwrap();
        let downloads = scheduler.list_downloads().await;
        assert_eq!(downloads[0].queue, "default");
    }

    #[tokio::test]
    async fn test_delete_default_queue_refused() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        assert!(matches!(
            scheduler.delete_queue("default").await,
            Err(SchedulerError::DefaultQueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_queue_is_illegal() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        assert!(matches!(
            scheduler.delete_queue("ghost").await,
            Err(SchedulerError::IllegalQueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_queue_validates_concurrency() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        let queue = QueueConfig::new("broken", dir.path().join("broken"), 0);
        assert!(matches!(
            scheduler.create_queue(queue).await,
            Err(SchedulerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_downloads_demoted_on_load() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());

        let mut config = Config::default();
        let mut d = Download::new("https://example.com/f", "default");
        d.status = DownloadStatus::Downloading;
        d.downloaded = 4096;
        config.downloads.push(d);

        let scheduler = Scheduler::new(
            config,
            dir.path().join("download-manager.json"),
            sink as Arc<dyn EventSink>,
        );

        let downloads = scheduler.list_downloads().await;
        assert_eq!(downloads[0].status, DownloadStatus::Pending);
        // Partial progress survives for range resume.
        assert_eq!(downloads[0].downloaded, 4096);
    }

    #[tokio::test]
    async fn test_add_persists_document() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _sink) = test_scheduler(&dir);

        scheduler
            .add(Download::new("https://example.com/f.bin", "default"))
            .await
            .unwrap();

        let path = dir.path().join("download-manager.json");
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.downloads.len(), 1);
        assert_eq!(loaded.downloads[0].url, "https://example.com/f.bin");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let (scheduler, sink) = test_scheduler(&dir);

        scheduler.stop();
        assert_eq!(sink.count_kind("SYSTEM"), 1); // only the init event
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (scheduler, sink) = test_scheduler(&dir);

        scheduler.start().await;
        scheduler.start().await;
        // init + one started
        assert_eq!(sink.count_kind("SYSTEM"), 2);
        scheduler.stop();
    }
}
