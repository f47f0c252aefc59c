//! Cooperative cancellation for maintenance operations.
//!
//! Checkpoint and vacuum poll a [`CancelSignal`] between rows and stop
//! at the next row boundary when it fires. Background runners sleep on
//! the signal between sweeps and wake immediately on `cancel()`
//! instead of waiting out their full interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A clonable, shared cancellation flag. Once cancelled it stays
/// cancelled for every clone.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelSignal {
    /// A signal in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    /// Non-blocking poll.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for at most `duration`, waking early on `cancel()`.
    /// Returns `true` if cancellation was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if *cancelled {
            return true;
        }
        let _ = self.inner.condvar.wait_for(&mut cancelled, duration);
        *cancelled
    }
}
