//! Bounded pending queues for the asynchronous write path.
//!
//! One [`ShardQueue`] per writer thread. Producers push values and flush
//! barriers; the shard's worker takes them off in FIFO order. Barriers are
//! never evicted and never counted against the thresholds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{OverflowPolicy, WriterConfig};
use crate::value::ValuePoint;

use super::WriteEvent;
use super::ticket::{FailureReason, WriteTicket};

/// A value waiting to be persisted.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) point: ValuePoint,
    pub(crate) ticket: WriteTicket,
}

/// Signalled by a worker once everything queued ahead of it is finished.
#[derive(Debug, Default)]
pub(crate) struct FlushBarrier {
    done: Mutex<bool>,
    cond: Condvar,
}

impl FlushBarrier {
    pub(crate) fn release(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

#[derive(Debug)]
enum Job {
    Write(Pending),
    Barrier(Arc<FlushBarrier>),
}

/// What a worker should do next.
#[derive(Debug)]
pub(crate) enum Work {
    /// Persist these values in order.
    Batch(Vec<Pending>),
    /// Release this barrier.
    Barrier(Arc<FlushBarrier>),
}

/// Result of a size check: events to raise and evicted tickets to fail.
#[derive(Debug, Default)]
pub(crate) struct SizeCheck {
    pub(crate) events: Vec<WriteEvent>,
    pub(crate) evicted: Vec<WriteTicket>,
}

#[derive(Debug)]
struct ShardState {
    jobs: VecDeque<Job>,
    /// Number of `Job::Write` entries in `jobs`.
    values: usize,
    closed: bool,
    warned: bool,
    last_check: Option<Instant>,
}

/// Limits applied by a shard.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Thresholds {
    pub(crate) warning: usize,
    pub(crate) dewarning: usize,
    pub(crate) discard: usize,
    pub(crate) check_interval: Duration,
    pub(crate) policy: OverflowPolicy,
}

impl From<&WriterConfig> for Thresholds {
    fn from(config: &WriterConfig) -> Self {
        Self {
            warning: config.warning_threshold,
            dewarning: config.dewarning_threshold,
            discard: config.discard_threshold,
            check_interval: config.size_check_interval,
            policy: config.overflow_policy,
        }
    }
}

/// One shard's pending queue.
#[derive(Debug)]
pub(crate) struct ShardQueue {
    shard: usize,
    limits: Thresholds,
    state: Mutex<ShardState>,
    /// Workers wait here for jobs.
    not_empty: Condvar,
    /// Blocked producers wait here for room.
    not_full: Condvar,
}

impl ShardQueue {
    pub(crate) fn new(shard: usize, limits: Thresholds) -> Self {
        Self {
            shard,
            limits,
            state: Mutex::new(ShardState {
                jobs: VecDeque::new(),
                values: 0,
                closed: false,
                warned: false,
                last_check: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues a value.
    ///
    /// Under [`OverflowPolicy::Block`] this waits while the shard is full.
    /// Returns the pending value back if the queue is closed.
    pub(crate) fn push(&self, pending: Pending) -> Result<SizeCheck, Pending> {
        let mut state = self.state.lock();
        if self.limits.policy == OverflowPolicy::Block {
            while !state.closed && state.values >= self.limits.discard {
                self.not_full.wait(&mut state);
            }
        }
        if state.closed {
            return Err(pending);
        }
        state.jobs.push_back(Job::Write(pending));
        state.values += 1;
        let check = self.check_size(&mut state, Instant::now());
        drop(state);
        self.not_empty.notify_one();
        Ok(check)
    }

    /// Enqueues a flush barrier. Returns `None` if the queue is closed.
    pub(crate) fn push_barrier(&self) -> Option<Arc<FlushBarrier>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let barrier = Arc::new(FlushBarrier::default());
        state.jobs.push_back(Job::Barrier(Arc::clone(&barrier)));
        drop(state);
        self.not_empty.notify_one();
        Some(barrier)
    }

    /// Waits for work. Returns `None` once the queue is closed and empty.
    ///
    /// Values are taken up to `max` at a time and never across a barrier.
    pub(crate) fn take(&self, max: usize) -> Option<(Work, SizeCheck)> {
        let mut state = self.state.lock();
        while state.jobs.is_empty() && !state.closed {
            self.not_empty.wait(&mut state);
        }
        if let Some(Job::Barrier(_)) = state.jobs.front()
            && let Some(Job::Barrier(barrier)) = state.jobs.pop_front()
        {
            return Some((Work::Barrier(barrier), SizeCheck::default()));
        }
        let mut batch = Vec::new();
        while batch.len() < max {
            match state.jobs.front() {
                Some(Job::Write(_)) => {
                    if let Some(Job::Write(pending)) = state.jobs.pop_front() {
                        batch.push(pending);
                    }
                }
                _ => break,
            }
        }
        if batch.is_empty() {
            // Closed and drained.
            return None;
        }
        state.values -= batch.len();
        let check = self.check_size(&mut state, Instant::now());
        drop(state);
        self.not_full.notify_all();
        Some((Work::Batch(batch), check))
    }

    /// Stops accepting jobs and wakes every waiter.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of values waiting.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().values
    }

    /// Applies the overflow policy and warning hysteresis if the check
    /// interval has elapsed since the last check.
    fn check_size(&self, state: &mut ShardState, now: Instant) -> SizeCheck {
        let due = state
            .last_check
            .is_none_or(|last| now.saturating_duration_since(last) >= self.limits.check_interval);
        if !due {
            return SizeCheck::default();
        }
        state.last_check = Some(now);

        let mut check = SizeCheck::default();
        if self.limits.policy == OverflowPolicy::DiscardOldest && state.values > self.limits.discard {
            let excess = state.values - self.limits.discard;
            let mut kept = VecDeque::with_capacity(state.jobs.len() - excess);
            for job in state.jobs.drain(..) {
                match job {
                    Job::Write(pending) if check.evicted.len() < excess => {
                        check.evicted.push(pending.ticket);
                    }
                    other => kept.push_back(other),
                }
            }
            state.jobs = kept;
            state.values -= excess;
            check.events.push(WriteEvent::Discarded {
                shard: self.shard,
                count: excess,
                queued: state.values,
            });
        }

        if !state.warned && state.values > self.limits.warning {
            state.warned = true;
            check.events.push(WriteEvent::QueueWarning {
                shard: self.shard,
                queued: state.values,
            });
        } else if state.warned && state.values <= self.limits.dewarning {
            state.warned = false;
            check.events.push(WriteEvent::QueueWarningCleared {
                shard: self.shard,
                queued: state.values,
            });
        }
        check
    }
}

impl SizeCheck {
    /// Marks every evicted value as discarded.
    pub(crate) fn fail_evicted(&mut self) {
        for ticket in self.evicted.drain(..) {
            ticket.fail(FailureReason::Discarded);
        }
    }
}
