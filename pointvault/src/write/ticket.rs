//! Per-write state tracking for the asynchronous path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why an asynchronous write did not persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Evicted by the overflow policy before a worker reached it.
    Discarded,
    /// Every attempt to persist the batch failed.
    Dropped {
        /// Attempts made.
        attempts: u32,
        /// The last backend error.
        error: String,
    },
}

/// Lifecycle of one asynchronous write.
///
/// `Queued -> Writing -> Acknowledged | Failed`; a queued value can also go
/// straight to `Failed` when it is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    /// Waiting in a pending queue.
    Queued,
    /// Taken by a worker; persistence in progress.
    Writing,
    /// Persisted and visible to new cursors.
    Acknowledged,
    /// Will never be persisted.
    Failed(FailureReason),
}

impl WriteState {
    /// Returns `true` for `Acknowledged` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed(_))
    }
}

#[derive(Debug)]
struct TicketInner {
    state: Mutex<WriteState>,
    cond: Condvar,
}

/// Handle to an asynchronous write, returned by
/// [`WriteCoordinator::write_async`](super::WriteCoordinator::write_async).
///
/// Dropping the ticket does not cancel the write.
#[derive(Debug, Clone)]
pub struct WriteTicket {
    inner: Arc<TicketInner>,
}

impl WriteTicket {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(TicketInner {
                state: Mutex::new(WriteState::Queued),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> WriteState {
        self.inner.state.lock().clone()
    }

    /// Blocks until the write is acknowledged or has failed.
    pub fn wait(&self) -> WriteState {
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            self.inner.cond.wait(&mut state);
        }
        state.clone()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning the
    /// state at that moment.
    pub fn wait_timeout(&self, timeout: Duration) -> WriteState {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.clone()
    }

    pub(crate) fn begin(&self) {
        let mut state = self.inner.state.lock();
        if *state == WriteState::Queued {
            *state = WriteState::Writing;
        }
    }

    pub(crate) fn acknowledge(&self) {
        self.finish(WriteState::Acknowledged);
    }

    pub(crate) fn fail(&self, reason: FailureReason) {
        self.finish(WriteState::Failed(reason));
    }

    fn finish(&self, terminal: WriteState) {
        let mut state = self.inner.state.lock();
        if !state.is_terminal() {
            *state = terminal;
        }
        drop(state);
        self.inner.cond.notify_all();
    }
}
