//! Parallel multi-part fetch for range-capable servers.
//!
//! A large file is split into up to `max_parts` contiguous byte ranges, each
//! fetched by its own worker task with a closed `Range` request and written
//! at its absolute offset into a pre-allocated file. The coordinator folds
//! worker progress into the shared record; any worker failure tears the
//! attempt down and hands the error to the transfer retry layer.

use std::io::SeekFrom;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{Event, EventSink};

use super::client::{ByteRange, HttpClient};
use super::constants::READ_BUFFER_SIZE;
use super::control::ControlSignals;
use super::error::TransferError;
use super::progress::{ProgressLog, SpeedWindow};
use super::rate_limiter::RateLimiter;
use super::record::{DownloadHandle, DownloadStatus};

/// The inclusive byte range owned by one part worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl PartRange {
    fn as_byte_range(self) -> ByteRange {
        ByteRange::closed(self.start, self.end)
    }
}

/// Splits `total_size` bytes into `min(max_parts, ceil(total/threshold))`
/// contiguous ranges of equal size, the last absorbing the remainder.
pub(crate) fn plan_parts(total_size: u64, threshold: u64, max_parts: usize) -> Vec<PartRange> {
    debug_assert!(total_size > 0);
    let by_size = total_size.div_ceil(threshold.max(1)).max(1);
    #[allow(clippy::cast_possible_truncation)]
    let count = (by_size.min(max_parts.max(1) as u64)) as usize;
    let part_size = total_size / count as u64;

    (0..count)
        .map(|i| {
            let start = i as u64 * part_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                start + part_size - 1
            };
            PartRange { start, end }
        })
        .collect()
}

/// Message from a part worker to the coordinator.
#[derive(Debug)]
enum PartUpdate {
    Progress { delta: u64 },
    Done,
    Failed { index: usize, error: TransferError },
}

/// Runs one multi-part attempt to completion.
///
/// The caller has already verified eligibility (ranges supported, size known
/// and above threshold). The attempt always starts from scratch: the target
/// file is recreated and `downloaded` reset before workers spawn.
///
/// # Errors
///
/// Returns the first worker error after cancelling the remaining workers;
/// [`TransferError::RangeUnsupported`] signals the caller to fall back to a
/// single-part attempt. Cancellation surfaces as
/// [`TransferError::Cancelled`].
#[instrument(skip_all, fields(total_size))]
pub(crate) async fn run(
    handle: &DownloadHandle,
    client: &HttpClient,
    signals: &ControlSignals,
    limiter: Option<Arc<RateLimiter>>,
    sink: &Arc<dyn EventSink>,
    total_size: u64,
) -> Result<(), TransferError> {
    let (url, queue, path, threshold, max_parts) = handle.with(|d| {
        (
            d.url.clone(),
            d.queue.clone(),
            d.target_path.clone(),
            d.multipart_size,
            d.max_parts,
        )
    });

    let parts = plan_parts(total_size, threshold, max_parts);
    info!(parts = parts.len(), total_size, "starting multi-part download");
    sink.emit(Event::Pending {
        url: url.clone(),
        queue,
        reason: format!("Starting multi-part download with {} parts", parts.len()),
    });

    // Every multi-part attempt rebuilds the file from scratch.
    handle.with(|d| {
        d.downloaded = 0;
        d.progress = 0.0;
    });

    let file = File::create(&path)
        .await
        .map_err(|e| TransferError::io(&path, e))?;
    if let Err(error) = file.set_len(total_size).await {
        // Pre-allocation is best-effort; positional writes still work.
        warn!(%error, "failed to pre-allocate file, continuing");
    }
    drop(file);

    let abort = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<PartUpdate>(parts.len() * 4);
    let mut workers = Vec::with_capacity(parts.len());

    for (index, range) in parts.iter().copied().enumerate() {
        let worker = PartWorker {
            index,
            url: url.clone(),
            path: path.clone(),
            range,
            client: client.clone(),
            signals: signals.clone(),
            abort: abort.clone(),
            limiter: limiter.clone(),
            tx: tx.clone(),
        };
        workers.push(tokio::spawn(worker.run()));
    }
    drop(tx);

    let mut speed = SpeedWindow::new(0);
    let mut progress_log = ProgressLog::new();
    let mut downloaded: u64 = 0;
    let mut completed = 0usize;

    let outcome = loop {
        tokio::select! {
            () = signals.cancelled() => break Err(TransferError::Cancelled),
            update = rx.recv() => match update {
                Some(PartUpdate::Progress { delta }) => {
                    downloaded += delta;
                    let total = handle.with(|d| {
                        d.downloaded = downloaded;
                        d.update_progress();
                        if let Some(bps) = speed.tick(downloaded) {
                            d.speed = bps;
                        }
                        d.total_size
                    });
                    if progress_log.should_emit(downloaded, total) {
                        sink.emit(Event::Status {
                            url: url.clone(),
                            old_status: DownloadStatus::Downloading,
                            new_status: DownloadStatus::Downloading,
                            downloaded,
                            total_size: total,
                        });
                    }
                }
                Some(PartUpdate::Done) => {
                    completed += 1;
                    if completed == parts.len() {
                        break Ok(());
                    }
                }
                Some(PartUpdate::Failed { index, error }) => {
                    warn!(part = index, %error, "part failed, cancelling remaining workers");
                    break Err(error);
                }
                None => {
                    // All senders gone without every part reporting in.
                    break if signals.is_cancelled() {
                        Err(TransferError::Cancelled)
                    } else {
                        Err(TransferError::incomplete(&url, downloaded, total_size))
                    };
                }
            },
        }
    };

    abort.cancel();
    // Dropping the receiver unblocks any worker parked on a full progress
    // channel so it can observe the abort.
    drop(rx);
    for worker in workers {
        if let Err(error) = worker.await {
            warn!(%error, "part worker panicked");
        }
    }

    if outcome.is_ok() {
        debug!(downloaded, "all parts completed");
    }
    outcome
}

/// One part worker: a closed-range GET written at an absolute offset.
struct PartWorker {
    index: usize,
    url: String,
    path: std::path::PathBuf,
    range: PartRange,
    client: HttpClient,
    signals: ControlSignals,
    abort: CancellationToken,
    limiter: Option<Arc<RateLimiter>>,
    tx: mpsc::Sender<PartUpdate>,
}

impl PartWorker {
    async fn run(mut self) {
        let result = self.fetch().await;
        match result {
            Ok(()) => {
                let _ = self.tx.send(PartUpdate::Done).await;
            }
            // The coordinator observes cancellation itself; a cancelled
            // worker just goes quiet.
            Err(TransferError::Cancelled) => {}
            Err(error) => {
                let _ = self
                    .tx
                    .send(PartUpdate::Failed {
                        index: self.index,
                        error,
                    })
                    .await;
            }
        }
    }

    async fn fetch(&mut self) -> Result<(), TransferError> {
        let response = self
            .client
            .get(&self.url, Some(self.range.as_byte_range()))
            .await?;

        // Anything but 206 means the server ignored the range; writing the
        // response at this part's offset would corrupt the file.
        if response.status().as_u16() != 206 {
            return Err(TransferError::range_unsupported(&self.url));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.range.start))
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;

        let mut stream = response.bytes_stream();

        loop {
            if self.abort.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            self.signals.check_cancelled()?;
            if self.signals.is_paused() {
                self.signals.wait_while_paused().await?;
            }

            let chunk = tokio::select! {
                () = self.abort.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| TransferError::network(&self.url, e))?;

            for piece in chunk.chunks(READ_BUFFER_SIZE) {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire(piece.len()).await;
                }
                file.write_all(piece)
                    .await
                    .map_err(|e| TransferError::io(&self.path, e))?;
                let _ = self
                    .tx
                    .send(PartUpdate::Progress {
                        delta: piece.len() as u64,
                    })
                    .await;
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_single_part_when_threshold_dominates() {
        // 12 MiB at a 10 MiB threshold: ceil(12/10) = 2 parts.
        let parts = plan_parts(12 * MIB, 10 * MIB, 5);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_plan_caps_at_max_parts() {
        // 50 MiB / 10 MiB = 5, capped by max_parts = 3.
        let parts = plan_parts(50 * MIB, 10 * MIB, 3);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_plan_fifty_mib_five_parts_exact_ranges() {
        let parts = plan_parts(50 * MIB, 10 * MIB, 5);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], PartRange { start: 0, end: 10_485_759 });
        assert_eq!(
            parts[1],
            PartRange {
                start: 10_485_760,
                end: 20_971_519
            }
        );
        assert_eq!(
            parts[4],
            PartRange {
                start: 41_943_040,
                end: 52_428_799
            }
        );
    }

    #[test]
    fn test_plan_last_part_absorbs_remainder() {
        let parts = plan_parts(100, 10, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], PartRange { start: 0, end: 32 });
        assert_eq!(parts[1], PartRange { start: 33, end: 65 });
        assert_eq!(parts[2], PartRange { start: 66, end: 99 });
    }

    #[test]
    fn test_plan_ranges_are_contiguous_and_cover_everything() {
        for total in [MIB + 7, 10 * MIB, 50 * MIB + 123] {
            let parts = plan_parts(total, 10 * MIB, 5);
            assert_eq!(parts[0].start, 0);
            assert_eq!(parts[parts.len() - 1].end, total - 1);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].end + 1, pair[1].start);
            }
            let covered: u64 = parts.iter().map(|p| p.end - p.start + 1).sum();
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_plan_formats_expected_range_headers() {
        let parts = plan_parts(50 * MIB, 10 * MIB, 5);
        let headers: Vec<String> = parts
            .iter()
            .map(|p| p.as_byte_range().to_string())
            .collect();
        assert_eq!(headers[0], "bytes=0-10485759");
        assert_eq!(headers[4], "bytes=41943040-52428799");
    }
}
