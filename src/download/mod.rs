//! HTTP transfer engine: records, control signals, rate limiting, and the
//! single-part / multi-part state machines.
//!
//! # Overview
//!
//! - [`Download`] is the persisted record; [`DownloadHandle`] its shared,
//!   lock-guarded view.
//! - [`Transfer`] runs one download to a terminal status, consulting
//!   [`ControlSignals`] between reads and a [`RateLimiter`] on every chunk
//!   when a bandwidth cap applies.
//! - Multi-part fetch is internal to the transfer: eligible downloads fan
//!   out into range workers automatically and degrade silently when the
//!   server does not cooperate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use download_manager::download::{control_pair, Download, DownloadHandle, HttpClient, Transfer};
//! use download_manager::events::TracingSink;
//!
//! # async fn example() {
//! let handle = DownloadHandle::new(
//!     Download::new("https://example.com/big.iso", "default")
//!         .with_target_path("downloads/big.iso"),
//! );
//! let (control, signals) = control_pair();
//! let transfer = Transfer::new(
//!     handle.clone(),
//!     HttpClient::new(),
//!     signals,
//!     0,
//!     Arc::new(TracingSink),
//! );
//! tokio::spawn(transfer.run());
//! // ... later:
//! control.pause();
//! # }
//! ```

mod client;
pub mod constants;
mod control;
mod error;
mod multipart;
mod progress;
pub mod rate_limiter;
mod record;
mod transfer;

pub use client::{ByteRange, HttpClient, ProbeResult};
pub use control::{control_pair, ControlSignals, ControlState, TransferControl};
pub use error::{classify, FailureKind, TransferError};
pub use rate_limiter::{LimiterError, RateLimiter};
pub use record::{filename_from_url, Download, DownloadHandle, DownloadStatus};
pub use transfer::Transfer;
