//! One-way cooperative cancellation signal.
//!
//! The flag itself is an atomic so readers never see a stale value. Waiters
//! block on a channel whose only sender is dropped on cancellation, which
//! disconnects the channel and wakes every `recv_timeout` at once.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Shared cancellation flag with an interruptible wait.
#[derive(Debug)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    // Dropped (set to None) exactly once, by the first `cancel`.
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl CancelSignal {
    /// Create a fresh, unset signal.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            wake_tx: Mutex::new(Some(tx)),
            wake_rx: rx,
        }
    }

    /// Set the signal. Returns `true` only for the call that performed the
    /// unset-to-set transition.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.wake_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    /// Whether the signal has been set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`, returning early if the signal is set.
    ///
    /// Returns `true` if the signal is set when the wait ends.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.wake_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            // Nothing is ever sent, so any other outcome is the disconnect.
            _ => true,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
