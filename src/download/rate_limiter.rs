//! Token-bucket bandwidth limiting for transfer loops.
//!
//! The limiter gates bytes, not requests: every read loop asks for as many
//! tokens as it just pulled off the wire before handing the bytes on. The
//! bucket holds at most one second of tokens (`B = R`), so a transfer can
//! burst briefly after idling but converges to the configured rate.
//!
//! A single limiter is shared between a multi-part coordinator and all of
//! its part workers (wrapped in `Arc`), giving the download one budget
//! rather than one budget per part.
//!
//! # Example
//!
//! ```
//! use download_manager::download::RateLimiter;
//!
//! # async fn example() -> Result<(), download_manager::download::LimiterError> {
//! // 64 KiB/s budget shared by every reader holding this limiter.
//! let limiter = RateLimiter::new(64 * 1024)?;
//! limiter.acquire(32 * 1024).await;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Error constructing a rate limiter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// A zero rate is not a valid limit; callers bypass the limiter entirely
    /// when bandwidth is unlimited.
    #[error("rate limiter requires a non-zero rate")]
    ZeroRate,
}

/// Byte-granular token bucket.
///
/// Tokens accrue continuously at the configured rate and are capped at one
/// second's worth. Accrual happens lazily on each `acquire` from the elapsed
/// wall time, which is equivalent to a periodic refill timer without needing
/// a background task.
///
/// # Thread Safety
///
/// `RateLimiter` is `Send + Sync`; token accounting stays correct under
/// concurrent `acquire` calls because refill and decrement happen under one
/// mutex.
#[derive(Debug)]
pub struct RateLimiter {
    /// Refill rate in bytes per second.
    rate: u64,

    /// Bucket capacity in tokens (equal to `rate`: a one-second burst).
    capacity: f64,

    /// Mutable bucket state.
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter delivering `rate_bytes_per_sec` over the long run.
    ///
    /// The bucket starts full, so the first second's worth of bytes passes
    /// without delay.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::ZeroRate`] when `rate_bytes_per_sec` is zero.
    #[instrument]
    pub fn new(rate_bytes_per_sec: u64) -> Result<Self, LimiterError> {
        if rate_bytes_per_sec == 0 {
            return Err(LimiterError::ZeroRate);
        }

        debug!(rate = rate_bytes_per_sec, "creating rate limiter");

        #[allow(clippy::cast_precision_loss)]
        let capacity = rate_bytes_per_sec as f64;
        Ok(Self {
            rate: rate_bytes_per_sec,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Returns the configured rate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Acquires `n` tokens, sleeping as long as necessary.
    ///
    /// The bucket may go into deficit: the caller is charged immediately and
    /// then held for exactly the time the deficit takes to repay. This keeps
    /// single requests larger than the bucket (e.g. a 32 KiB read against a
    /// 1 KiB/s limit) correct without splitting them.
    pub async fn acquire(&self, n: usize) {
        if n == 0 {
            return;
        }

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.last_refill = now;

            #[allow(clippy::cast_precision_loss)]
            let refill = elapsed * self.rate as f64;
            bucket.tokens = (bucket.tokens + refill).min(self.capacity);

            #[allow(clippy::cast_precision_loss)]
            let needed = n as f64;
            bucket.tokens -= needed;

            if bucket.tokens >= 0.0 {
                None
            } else {
                #[allow(clippy::cast_precision_loss)]
                let deficit_secs = -bucket.tokens / self.rate as f64;
                Some(std::time::Duration::from_secs_f64(deficit_secs))
            }
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }

    /// Reads from `source` into `buf`, charging the limiter for the bytes
    /// actually returned before they are released to the caller.
    ///
    /// Propagates the source's result unchanged; the limiter itself never
    /// fails a read.
    ///
    /// # Errors
    ///
    /// Returns whatever IO error the underlying source returned.
    pub async fn read<R>(&self, source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let n = source.read(buf).await?;
        if n > 0 {
            self.acquire(n).await;
        }
        Ok(n)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_new_rejects_zero_rate() {
        assert_eq!(RateLimiter::new(0).unwrap_err(), LimiterError::ZeroRate);
    }

    #[test]
    fn test_new_stores_rate() {
        let limiter = RateLimiter::new(4096).unwrap();
        assert_eq!(limiter.rate(), 4096);
    }

    #[tokio::test]
    async fn test_burst_passes_without_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1024).unwrap();
        let start = Instant::now();

        // One full bucket of tokens is available immediately.
        limiter.acquire(1024).await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_second_bucket_takes_a_second() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1024).unwrap();
        let start = Instant::now();

        limiter.acquire(1024).await; // burst
        limiter.acquire(1024).await; // must wait ~1s

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_oversized_request_is_paid_proportionally() {
        tokio::time::pause();

        // 4 KiB request against a 1 KiB/s limit: 1 KiB burst + 3s deficit.
        let limiter = RateLimiter::new(1024).unwrap();
        let start = Instant::now();

        limiter.acquire(4096).await;

        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_millis(3100));
    }

    #[tokio::test]
    async fn test_zero_byte_acquire_is_free() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1).unwrap();
        let start = Instant::now();
        limiter.acquire(0).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_idle_time_refills_up_to_capacity_only() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1000).unwrap();
        limiter.acquire(1000).await; // drain the burst

        // A long idle period must not bank more than one bucket.
        tokio::time::sleep(Duration::from_secs(60)).await;

        let start = Instant::now();
        limiter.acquire(1000).await; // refilled bucket
        limiter.acquire(1000).await; // must wait again
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shared_limiter_charges_one_budget() {
        tokio::time::pause();

        let limiter = Arc::new(RateLimiter::new(1000).unwrap());
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(1000).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 2000 bytes at 1000 B/s with a 1000-byte burst: at least one second.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_read_returns_source_bytes() {
        let limiter = RateLimiter::new(1024 * 1024).unwrap();
        let mut source: &[u8] = b"hello world";
        let mut buf = [0u8; 64];

        let n = limiter.read(&mut source, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");

        // EOF comes through unchanged.
        let n = limiter.read(&mut source, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_applies_rate() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1024).unwrap();
        let payload = vec![0xAAu8; 2048];
        let mut source: &[u8] = &payload;
        let mut buf = [0u8; 1024];

        let start = Instant::now();
        let mut total = 0;
        loop {
            let n = limiter.read(&mut source, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!(total, 2048);
        // 2048 bytes at 1024 B/s minus the 1024 burst: at least one second.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
