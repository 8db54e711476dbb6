//! Constants for the download module (timeouts, buffers, retry defaults).

use std::time::Duration;

/// Default HTTP connect + TLS handshake timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default response-header timeout (30 seconds).
///
/// There is deliberately no overall request timeout: large downloads may
/// legitimately run for hours. Stalled reads surface as transport errors.
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Read granularity for transfer loops (32 KiB).
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Default maximum retry attempts per download.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts (5 seconds).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default file-size threshold above which multi-part download kicks in (10 MiB).
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Default maximum number of parallel parts per download.
pub const DEFAULT_MAX_PARTS: usize = 5;

/// Minimum interval between speed/progress recalculations (1 second).
pub const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Progress is logged whenever it crosses a decile boundary (every 10%).
pub const PROGRESS_LOG_DECILE: u64 = 10;

/// Progress is logged at least this often regardless of deciles (30 seconds).
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Fraction of the advertised size above which a range-capable attempt that
/// ends early is treated as resumable rather than failed (95%).
pub const NEAR_COMPLETE_PERCENT: f64 = 95.0;
