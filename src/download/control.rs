//! Control signals for a running transfer: pause, resume, cancel.
//!
//! The pause/resume pair travels over a `watch` channel, so signals coalesce
//! to the most recent state but are never lost while the transfer is
//! runnable. Cancellation is a sticky [`CancellationToken`]: once set it is
//! observed at the next checkpoint regardless of what else happened.
//!
//! The sender half ([`TransferControl`]) stays with the scheduler; the
//! receiver half ([`ControlSignals`]) is moved into the transfer task and
//! cloned into every part worker.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::TransferError;

/// Desired run state of a transfer, as last requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// The transfer should be moving bytes.
    Running,
    /// The transfer should hold between reads until resumed.
    Paused,
}

/// Sender half: issues pause/resume/cancel to one transfer.
#[derive(Debug, Clone)]
pub struct TransferControl {
    state_tx: watch::Sender<ControlState>,
    cancel: CancellationToken,
}

/// Receiver half: polled by the transfer loop between reads.
#[derive(Debug, Clone)]
pub struct ControlSignals {
    state_rx: watch::Receiver<ControlState>,
    cancel: CancellationToken,
}

/// Creates a connected control pair in the running state.
#[must_use]
pub fn control_pair() -> (TransferControl, ControlSignals) {
    let (state_tx, state_rx) = watch::channel(ControlState::Running);
    let cancel = CancellationToken::new();
    (
        TransferControl {
            state_tx,
            cancel: cancel.clone(),
        },
        ControlSignals { state_rx, cancel },
    )
}

impl TransferControl {
    /// Requests a pause. Coalesces with any earlier unobserved signal.
    pub fn pause(&self) {
        let _ = self.state_tx.send(ControlState::Paused);
    }

    /// Requests a resume.
    pub fn resume(&self) {
        let _ = self.state_tx.send(ControlState::Running);
    }

    /// Cancels the transfer. Idempotent; observed from any state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once `cancel` has been issued.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl ControlSignals {
    /// Returns true once the transfer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns true while the last requested state is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.state_rx.borrow() == ControlState::Paused
    }

    /// Completes when the transfer is cancelled. For use in `select!` arms.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fast checkpoint between reads.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] once cancellation is observed.
    pub fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Blocks until the transfer is runnable again.
    ///
    /// Returns immediately when not paused. While paused, waits for a resume
    /// or cancellation, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if the transfer is cancelled
    /// while paused, or if the control side went away entirely.
    pub async fn wait_while_paused(&mut self) -> Result<(), TransferError> {
        loop {
            self.check_cancelled()?;
            if *self.state_rx.borrow() == ControlState::Running {
                return Ok(());
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(TransferError::Cancelled);
                }
                changed = self.state_rx.changed() => {
                    // A dropped sender means the scheduler abandoned this
                    // transfer; treat it as cancellation.
                    changed.map_err(|_| TransferError::Cancelled)?;
                }
            }
        }
    }

    /// Sleeps for `duration`, waking early only on cancellation.
    ///
    /// Used for retry delays and scheduled starts, where a pause request
    /// should not interrupt the wait (it is observed at the next read).
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if cancelled during the sleep.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), TransferError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(TransferError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
