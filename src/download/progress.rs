//! Progress accounting shared by the single-part loop and the multi-part
//! coordinator: speed smoothing and progress-event cadence.

use tokio::time::Instant;

use super::constants::{PROGRESS_LOG_DECILE, PROGRESS_LOG_INTERVAL, PROGRESS_TICK};

/// Sliding window for the instantaneous transfer rate.
///
/// Recomputes at most once per second from the bytes moved since the last
/// tick. Reset after a pause so the idle time does not drag the rate down.
#[derive(Debug)]
pub(crate) struct SpeedWindow {
    last_instant: Instant,
    last_bytes: u64,
}

impl SpeedWindow {
    pub(crate) fn new(bytes: u64) -> Self {
        Self {
            last_instant: Instant::now(),
            last_bytes: bytes,
        }
    }

    /// Forgets history, restarting the window at `bytes`.
    pub(crate) fn reset(&mut self, bytes: u64) {
        *self = Self::new(bytes);
    }

    /// Returns a fresh bytes-per-second figure when at least a second has
    /// passed since the last one, `None` otherwise.
    pub(crate) fn tick(&mut self, downloaded: u64) -> Option<u64> {
        let elapsed = self.last_instant.elapsed();
        if elapsed < PROGRESS_TICK {
            return None;
        }

        let delta = downloaded.saturating_sub(self.last_bytes);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bps = (delta as f64 / elapsed.as_secs_f64()) as u64;

        self.last_instant = Instant::now();
        self.last_bytes = downloaded;
        Some(bps)
    }
}

/// Decides when a progress report is worth an event.
///
/// Fires when progress crosses a 10% decile boundary, and at least every
/// 30 seconds regardless.
#[derive(Debug)]
pub(crate) struct ProgressLog {
    last_decile: u64,
    last_emit: Instant,
}

impl ProgressLog {
    pub(crate) fn new() -> Self {
        Self {
            last_decile: 0,
            last_emit: Instant::now(),
        }
    }

    pub(crate) fn should_emit(&mut self, downloaded: u64, total_size: u64) -> bool {
        let now = Instant::now();

        if total_size > 0 {
            let decile = downloaded * 100 / total_size / PROGRESS_LOG_DECILE;
            if decile > self.last_decile {
                self.last_decile = decile;
                self.last_emit = now;
                return true;
            }
        }

        if now.duration_since(self.last_emit) >= PROGRESS_LOG_INTERVAL {
            self.last_emit = now;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_speed_window_waits_a_full_tick() {
        tokio::time::pause();

        let mut window = SpeedWindow::new(0);
        assert!(window.tick(100).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let bps = window.tick(2048);
        assert_eq!(bps, Some(2048));
    }

    #[tokio::test]
    async fn test_speed_window_reset_discards_history() {
        tokio::time::pause();

        let mut window = SpeedWindow::new(0);
        tokio::time::advance(Duration::from_secs(10)).await;
        window.reset(5000);

        tokio::time::advance(Duration::from_secs(1)).await;
        // Only the post-reset delta counts.
        assert_eq!(window.tick(6000), Some(1000));
    }

    #[tokio::test]
    async fn test_progress_log_fires_on_decile() {
        let mut log = ProgressLog::new();
        assert!(!log.should_emit(50, 1000)); // 5%
        assert!(log.should_emit(100, 1000)); // 10%
        assert!(!log.should_emit(150, 1000)); // 15%, same decile
        assert!(log.should_emit(900, 1000)); // 90%
    }

    #[tokio::test]
    async fn test_progress_log_fires_on_interval_without_total() {
        tokio::time::pause();

        let mut log = ProgressLog::new();
        assert!(!log.should_emit(100, 0));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(log.should_emit(200, 0));
        assert!(!log.should_emit(300, 0));
    }
}
