//! Cooperative cancellation.
//!
//! A [`CancelToken`] is shared between whatever receives the user's interrupts and the
//! scheduler/orchestrator doing the work. The first [`interrupt`](CancelToken::interrupt) asks the
//! run to stop at the next safe point: the batch in flight is finished (delivered *and* marked)
//! but no new folder, chunk or batch is started. A second interrupt forces the stop: sessions are
//! dropped without a polite `LOGOUT`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};

use crate::error::{Error, Result};

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const FORCED: u8 = 2;

/// How a [`CancelToken::sleep`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// The full duration passed.
    Elapsed,
    /// Someone asked for the sleep to end early.
    Woken,
    /// The token was interrupted.
    Cancelled,
}

#[derive(Debug)]
struct Inner {
    level: AtomicU8,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// A cloneable handle to request cancellation or an early wake-up.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token nobody has interrupted yet.
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = unbounded();
        CancelToken {
            inner: Arc::new(Inner {
                level: AtomicU8::new(RUNNING),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Request cancellation. Returns `true` when this was the second request, i.e. the stop is
    /// now forced.
    pub fn interrupt(&self) -> bool {
        let previous = self
            .inner
            .level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |level| {
                Some(match level {
                    RUNNING => CANCELLED,
                    _ => FORCED,
                })
            })
            .unwrap_or(FORCED);
        let _ = self.inner.wake_tx.send(());
        if previous == RUNNING {
            info!("interrupted, finishing the current batch");
            false
        } else {
            warn!("interrupted again, aborting immediately");
            true
        }
    }

    /// End a sleep in progress early, without cancelling anything.
    pub fn wake(&self) {
        let _ = self.inner.wake_tx.send(());
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.level.load(Ordering::SeqCst) != RUNNING
    }

    /// Whether cancellation was requested twice.
    pub fn is_forced(&self) -> bool {
        self.inner.level.load(Ordering::SeqCst) == FORCED
    }

    /// `Err(Error::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless woken or cancelled first. Wake requests made before the sleep
    /// started are discarded.
    pub fn sleep(&self, duration: Duration) -> Wakeup {
        while self.inner.wake_rx.try_recv().is_ok() {}
        if self.is_cancelled() {
            return Wakeup::Cancelled;
        }

        match self.inner.wake_rx.recv_timeout(duration) {
            Ok(()) if self.is_cancelled() => Wakeup::Cancelled,
            Ok(()) => Wakeup::Woken,
            Err(RecvTimeoutError::Timeout) => Wakeup::Elapsed,
            // we hold a sender ourselves, so this cannot happen
            Err(RecvTimeoutError::Disconnected) => Wakeup::Cancelled,
        }
    }
}
