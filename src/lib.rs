//! Multi-queue HTTP download engine.
//!
//! A background engine that accepts download requests, schedules them across
//! named queues under time-window and concurrency constraints, transfers
//! bytes with optional bandwidth caps and multi-part range requests, and
//! supports pause / resume / cancel / retry on each transfer while surviving
//! process restarts.
//!
//! # Architecture
//!
//! - [`download`] — the transfer engine: records, control signals, the
//!   token-bucket rate limiter, and the single-part / multi-part state
//!   machines.
//! - [`scheduler`] — the supervising scheduler: queue gates, admission
//!   sweeps, command routing, persistence triggers.
//! - [`config`] — the persisted JSON document: queues, downloads, and the
//!   time-window logic.
//! - [`events`] — the named event stream the engine emits to a write-only
//!   sink.
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
//!
//! let scheduler = Scheduler::new(config, path, Arc::new(TracingSink));
//! scheduler.start().await;
//!
//! scheduler
//!     .add(Download::new("https://example.com/big.iso", "default"))
//!     .await?;
//! scheduler.process_all_queues().await;
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod events;
pub mod scheduler;

// Re-export commonly used types
pub use config::{Config, ConfigError, QueueConfig};
pub use download::{
    classify, control_pair, Download, DownloadHandle, DownloadStatus, FailureKind, HttpClient,
    LimiterError, RateLimiter, Transfer, TransferControl, TransferError,
};
pub use events::{Event, EventSink, MemorySink, TracingSink};
pub use scheduler::{Scheduler, SchedulerError};
