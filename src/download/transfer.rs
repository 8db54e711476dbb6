//! The transfer state machine: one supervised download from probe to a
//! terminal status.
//!
//! A [`Transfer`] owns one download for the duration of its run: it probes
//! the server, streams bytes (single-part or multi-part), honors the
//! pause/resume/cancel signals between reads, and wraps the whole thing in
//! the retry loop. Transient failures are absorbed here and never surface
//! past [`Transfer::run`]; the caller observes only the terminal status.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::events::{Event, EventSink};

use super::client::{ByteRange, HttpClient, ProbeResult};
use super::constants::{
    DEFAULT_RETRY_DELAY, NEAR_COMPLETE_PERCENT, READ_BUFFER_SIZE,
};
use super::control::ControlSignals;
use super::error::{classify, FailureKind, TransferError};
use super::multipart;
use super::progress::{ProgressLog, SpeedWindow};
use super::rate_limiter::RateLimiter;
use super::record::{DownloadHandle, DownloadStatus};

/// One supervised transfer attempt loop for a single download.
pub struct Transfer {
    handle: DownloadHandle,
    client: HttpClient,
    signals: ControlSignals,
    limiter: Option<Arc<RateLimiter>>,
    sink: Arc<dyn EventSink>,
    retry_delay: Duration,
    /// Effective bandwidth cap in KiB/s (already the min of the download's
    /// own cap and the queue limit); 0 means unlimited.
    bandwidth: u64,
    /// Whether the last probe saw `Accept-Ranges: bytes`.
    ranges_supported: bool,
}

impl Transfer {
    /// Builds a transfer with the effective bandwidth cap already resolved
    /// by the scheduler (`min` of download and queue caps, 0 = unlimited).
    #[must_use]
    pub fn new(
        handle: DownloadHandle,
        client: HttpClient,
        signals: ControlSignals,
        bandwidth_kib_per_sec: u64,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let limiter = RateLimiter::new(bandwidth_kib_per_sec.saturating_mul(1024))
            .ok()
            .map(Arc::new);
        Self {
            handle,
            client,
            signals,
            limiter,
            sink,
            retry_delay: DEFAULT_RETRY_DELAY,
            bandwidth: bandwidth_kib_per_sec,
            ranges_supported: false,
        }
    }

    /// Overrides the delay between retry attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Runs the download to a terminal status.
    ///
    /// Honors `scheduled_start_time`, then loops attempts under the retry
    /// policy. On success the record ends `completed` with the file fully on
    /// disk; on cancellation the partial file is removed; on exhausted
    /// retries the record ends `error` with the last failure message.
    ///
    /// # Errors
    ///
    /// Returns the terminal error ([`TransferError::Cancelled`] or
    /// [`TransferError::MaxRetriesExceeded`] or a fatal failure). The record
    /// status is always updated before returning.
    #[instrument(skip(self), fields(url = %self.handle.url()))]
    pub async fn run(mut self) -> Result<(), TransferError> {
        let (url, queue, scheduled) = self.handle.with(|d| {
            (d.url.clone(), d.queue.clone(), d.scheduled_start_time)
        });

        if let Some(when) = scheduled {
            let now = Utc::now();
            if when > now {
                let wait = (when - now).to_std().unwrap_or_default();
                info!(wait_secs = wait.as_secs(), "waiting for scheduled start");
                if self.signals.sleep(wait).await.is_err() {
                    return self.finish_cancelled().await;
                }
            }
        }

        let old_status = self.handle.with(|d| {
            let old = d.status;
            d.status = DownloadStatus::Downloading;
            d.start_time = Some(Utc::now());
            old
        });
        self.sink.emit(Event::Start {
            url: url.clone(),
            queue: queue.clone(),
            max_bandwidth: self.bandwidth,
        });
        self.emit_status(old_status, DownloadStatus::Downloading);

        let started = Instant::now();

        loop {
            let before = self.handle.with(|d| d.downloaded);
            let error = match self.attempt().await {
                Ok(()) => return self.finish_completed(started),
                Err(error) => error,
            };

            match classify(&error) {
                FailureKind::Cancelled => return self.finish_cancelled().await,
                FailureKind::Fatal => return self.finish_error(error),
                FailureKind::Transient => {}
            }

            // A range-capable attempt that got nearly everything resumes the
            // tail immediately without consuming a retry, as long as it is
            // still making progress.
            let after = self.handle.with(|d| d.downloaded);
            if self.ranges_supported && after > before && is_near_complete(&error) {
                debug!(%error, "attempt ended near completion, resuming tail");
                continue;
            }

            let (retry_count, max_retries) =
                self.handle.with(|d| (d.retry_count, d.max_retries));
            if retry_count >= max_retries {
                let attempts = retry_count + 1;
                return self.finish_error(TransferError::MaxRetriesExceeded {
                    attempts,
                    last: error.to_string(),
                });
            }

            // The retry loop is the one place the retry counter moves.
            let attempt_no = retry_count + 1;
            let old = self.handle.with(|d| {
                let old = d.status;
                d.retry_count = attempt_no;
                d.status = DownloadStatus::Pending;
                d.error = error.to_string();
                old
            });
            self.sink.emit(Event::Error {
                url: url.clone(),
                queue: queue.clone(),
                message: error.to_string(),
            });
            self.emit_status(old, DownloadStatus::Pending);
            self.sink.emit(Event::Pending {
                url: url.clone(),
                queue: queue.clone(),
                reason: format!(
                    "Retry attempt {attempt_no} of {max_retries} after error: {error}"
                ),
            });

            if self.signals.sleep(self.retry_delay).await.is_err() {
                return self.finish_cancelled().await;
            }

            let old = self.handle.with(|d| {
                let old = d.status;
                d.status = DownloadStatus::Downloading;
                d.error.clear();
                old
            });
            self.emit_status(old, DownloadStatus::Downloading);
        }
    }

    /// One attempt: probe, pick a strategy, move bytes.
    async fn attempt(&mut self) -> Result<(), TransferError> {
        let (url, target_path, use_multipart, threshold) = self.handle.with(|d| {
            (
                d.url.clone(),
                d.target_path.clone(),
                d.use_multipart,
                d.multipart_size,
            )
        });

        if let Some(parent) = target_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransferError::io(parent, e))?;
            }
        }

        // HEAD failure is non-fatal; the GET carries the real verdict.
        let probe = match self.client.probe(&url).await {
            Ok(probe) => probe,
            Err(error) => {
                debug!(%error, "HEAD probe failed, proceeding with GET");
                ProbeResult::default()
            }
        };
        self.ranges_supported = probe.supports_ranges;
        if let Some(total) = probe.total_size {
            self.handle.with(|d| {
                d.total_size = total;
                d.update_progress();
            });
        }

        let total = probe.total_size.unwrap_or(0);
        let multipart_eligible =
            use_multipart && probe.supports_ranges && total > 0 && total >= threshold;

        if multipart_eligible {
            match multipart::run(
                &self.handle,
                &self.client,
                &self.signals,
                self.limiter.clone(),
                &self.sink,
                total,
            )
            .await
            {
                Err(TransferError::RangeUnsupported { .. }) => {
                    // The server advertised ranges but did not honor them.
                    let (url, queue) = self.handle.with(|d| {
                        d.downloaded = 0;
                        d.progress = 0.0;
                        (d.url.clone(), d.queue.clone())
                    });
                    self.sink.emit(Event::Pending {
                        url,
                        queue,
                        reason: "Multi-part downloading not supported by server, \
                                 falling back to single part"
                            .to_string(),
                    });
                }
                other => return other,
            }
        }

        self.single_part(&url, &target_path).await
    }

    /// Single-part algorithm: one GET per connection, ranged when resuming.
    ///
    /// A pause aborts the connection; the resume issues a fresh GET with
    /// `Range: bytes=<downloaded>-` when the server supports it, or restarts
    /// from scratch when it does not.
    async fn single_part(&mut self, url: &str, path: &Path) -> Result<(), TransferError> {
        let mut downloaded = self.handle.with(|d| d.downloaded);
        let mut speed = SpeedWindow::new(downloaded);
        let mut progress_log = ProgressLog::new();

        'request: loop {
            self.signals.check_cancelled()?;
            if self.signals.is_paused() {
                self.signals.wait_while_paused().await?;
            }

            let resume = self.ranges_supported && downloaded > 0;
            let range = if resume {
                Some(ByteRange::from_offset(downloaded))
            } else {
                None
            };

            let response = self.client.get(url, range).await?;
            let status = response.status().as_u16();
            let body_length = response.content_length();
            let resumed = resume && status == 206;
            if resume && !resumed {
                debug!("server ignored range request, restarting from byte 0");
            }
            if !resumed {
                downloaded = 0;
            }

            // Fill in the total when HEAD did not provide one.
            self.handle.with(|d| {
                if d.total_size == 0 {
                    if let Some(len) = body_length {
                        d.total_size = downloaded + len;
                    }
                }
                d.downloaded = downloaded;
                d.update_progress();
            });

            let mut file = if resumed {
                debug!(start_byte = downloaded, "resuming from partial file");
                OpenOptions::new()
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| TransferError::io(path, e))?
            } else {
                File::create(path)
                    .await
                    .map_err(|e| TransferError::io(path, e))?
            };

            let mut stream = response.bytes_stream();
            speed.reset(downloaded);

            loop {
                self.signals.check_cancelled()?;
                if self.signals.is_paused() {
                    debug!(downloaded, "transfer paused between reads");
                    file.flush()
                        .await
                        .map_err(|e| TransferError::io(path, e))?;
                    // Drop the connection while parked; the resume path
                    // issues a fresh (ranged) request.
                    drop(stream);
                    self.signals.wait_while_paused().await?;
                    speed.reset(downloaded);
                    debug!("transfer resumed");
                    continue 'request;
                }

                let Some(chunk) = stream.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|e| TransferError::network(url, e))?;

                for piece in chunk.chunks(READ_BUFFER_SIZE) {
                    if let Some(limiter) = &self.limiter {
                        limiter.acquire(piece.len()).await;
                    }
                    file.write_all(piece)
                        .await
                        .map_err(|e| TransferError::io(path, e))?;
                    downloaded += piece.len() as u64;
                }

                let total = self.handle.with(|d| {
                    d.downloaded = downloaded;
                    d.update_progress();
                    if let Some(bps) = speed.tick(downloaded) {
                        d.speed = bps;
                    }
                    d.total_size
                });
                if progress_log.should_emit(downloaded, total) {
                    self.sink.emit(Event::Status {
                        url: url.to_string(),
                        old_status: DownloadStatus::Downloading,
                        new_status: DownloadStatus::Downloading,
                        downloaded,
                        total_size: total,
                    });
                }
            }

            file.flush()
                .await
                .map_err(|e| TransferError::io(path, e))?;
            break 'request;
        }

        let total = self.handle.with(|d| d.total_size);
        if total > 0 && downloaded < total {
            return Err(TransferError::incomplete(url, downloaded, total));
        }
        Ok(())
    }

    fn finish_completed(self, started: Instant) -> Result<(), TransferError> {
        let (url, path, total, old) = self.handle.with(|d| {
            let old = d.status;
            d.status = DownloadStatus::Completed;
            if d.total_size == 0 {
                d.total_size = d.downloaded;
            }
            d.progress = 100.0;
            d.completion_time = Some(Utc::now());
            (d.url.clone(), d.target_path.clone(), d.total_size, old)
        });

        self.emit_status(old, DownloadStatus::Completed);
        self.sink.emit(Event::Complete {
            url,
            path,
            duration: started.elapsed(),
            total_size: total,
        });
        Ok(())
    }

    async fn finish_cancelled(self) -> Result<(), TransferError> {
        let (path, downloaded, old) = self.handle.with(|d| {
            let old = d.status;
            d.status = DownloadStatus::Cancelled;
            d.speed = 0;
            (d.target_path.clone(), d.downloaded, old)
        });

        // The partial file goes; an attempt that never wrote a byte never
        // created one worth removing.
        if downloaded > 0 {
            remove_partial_file(&path).await;
        }

        self.emit_status(old, DownloadStatus::Cancelled);
        Err(TransferError::Cancelled)
    }

    fn finish_error(self, error: TransferError) -> Result<(), TransferError> {
        let (url, queue, old) = self.handle.with(|d| {
            let old = d.status;
            d.status = DownloadStatus::Error;
            d.error = error.to_string();
            d.speed = 0;
            (d.url.clone(), d.queue.clone(), old)
        });

        self.sink.emit(Event::Error {
            url,
            queue,
            message: error.to_string(),
        });
        self.emit_status(old, DownloadStatus::Error);
        Err(error)
    }

    fn emit_status(&self, old_status: DownloadStatus, new_status: DownloadStatus) {
        let (url, downloaded, total_size) =
            self.handle.with(|d| (d.url.clone(), d.downloaded, d.total_size));
        self.sink.emit(Event::Status {
            url,
            old_status,
            new_status,
            downloaded,
            total_size,
        });
    }
}

/// Removes a partial file, tolerating its absence.
async fn remove_partial_file(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %error, "failed to remove partial file");
        }
    }
}

/// True when an incomplete transfer already has at least 95% of the bytes.
fn is_near_complete(error: &TransferError) -> bool {
    match error {
        TransferError::IncompleteTransfer {
            downloaded, total, ..
        } if *total > 0 => {
            #[allow(clippy::cast_precision_loss)]
            let pct = *downloaded as f64 / *total as f64 * 100.0;
            pct >= NEAR_COMPLETE_PERCENT
        }
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_is_near_complete_thresholds() {
        assert!(is_near_complete(&TransferError::incomplete(
            "https://example.com/f",
            950,
            1000
        )));
        assert!(is_near_complete(&TransferError::incomplete(
            "https://example.com/f",
            999,
            1000
        )));
        assert!(!is_near_complete(&TransferError::incomplete(
            "https://example.com/f",
            949,
            1000
        )));
        assert!(!is_near_complete(&TransferError::timeout(
            "https://example.com/f"
        )));
    }
}
