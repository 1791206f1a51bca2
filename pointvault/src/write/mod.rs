//! Write coordination: synchronous and queued asynchronous persistence.
//!
//! The [`WriteCoordinator`] offers two paths into a backend:
//!
//! - [`write_sync`](WriteCoordinator::write_sync) persists immediately and
//!   returns once the value is visible to new cursors (read-your-write).
//! - [`write_async`](WriteCoordinator::write_async) validates, enqueues, and
//!   returns a [`WriteTicket`]. A fixed pool of named worker threads drains
//!   the queues in batches.
//!
//! # Sharding
//!
//! There is one queue and one worker per shard. A series always maps to the
//! same shard, so queued writes for one series persist in submission order.
//!
//! # Backpressure
//!
//! Under [`OverflowPolicy::DiscardOldest`](crate::config::OverflowPolicy) a
//! shard keeps accepting values; a periodic size check evicts the oldest down
//! to the discard threshold and raises warnings with hysteresis. Under
//! `Block`, producers wait while their shard is full. Queue pressure is
//! reported through [`WriteEvent`]s, never through errors.
//!
//! # Failures
//!
//! A batch the backend rejects is retried with exponential backoff. After the
//! last attempt its values are dropped, counted, logged at error level and
//! reported as [`WriteEvent::WriteDropped`].

mod queue;
mod rate;
mod ticket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::backend::StorageBackend;
use crate::config::WriterConfig;
use crate::error::{Result, WriteError};
use crate::value::ValuePoint;

use self::queue::{Pending, ShardQueue, Thresholds, Work};

pub use self::rate::{RateCounter, WriteMetrics, WriteMetricsSnapshot};
pub use self::ticket::{FailureReason, WriteState, WriteTicket};

/// Something the write path wants an operator to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    /// A shard's queue grew above the warning threshold.
    QueueWarning {
        /// The shard.
        shard: usize,
        /// Values waiting.
        queued: usize,
    },
    /// A warned shard drained to the dewarning threshold.
    QueueWarningCleared {
        /// The shard.
        shard: usize,
        /// Values waiting.
        queued: usize,
    },
    /// The overflow policy evicted the oldest values of a shard.
    Discarded {
        /// The shard.
        shard: usize,
        /// Values evicted.
        count: usize,
        /// Values still waiting.
        queued: usize,
    },
    /// A batch failed every attempt and its values were dropped.
    WriteDropped {
        /// The shard.
        shard: usize,
        /// Values dropped.
        count: usize,
        /// Attempts made.
        attempts: u32,
        /// The last backend error.
        error: String,
    },
}

/// Callback receiving every [`WriteEvent`].
pub type WriteEventListener = Arc<dyn Fn(&WriteEvent) + Send + Sync>;

struct Shared {
    backend: Arc<dyn StorageBackend>,
    config: WriterConfig,
    queues: Vec<ShardQueue>,
    metrics: WriteMetrics,
    listener: Option<WriteEventListener>,
}

impl Shared {
    fn emit(&self, event: WriteEvent) {
        match &event {
            WriteEvent::QueueWarning { shard, queued } => {
                tracing::warn!(shard, queued, "write queue above warning threshold");
            }
            WriteEvent::QueueWarningCleared { shard, queued } => {
                tracing::info!(shard, queued, "write queue back below dewarning threshold");
            }
            WriteEvent::Discarded {
                shard,
                count,
                queued,
            } => {
                tracing::warn!(shard, count, queued, "discarded oldest queued values");
            }
            WriteEvent::WriteDropped {
                shard,
                count,
                attempts,
                error,
            } => {
                tracing::error!(shard, count, attempts, error = %error, "dropped values after failed writes");
            }
        }
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    fn settle(&self, mut check: queue::SizeCheck) {
        let evicted = check.evicted.len() as u64;
        if evicted > 0 {
            self.metrics.discarded.fetch_add(evicted, Ordering::Relaxed);
            self.metrics.queued.fetch_sub(evicted, Ordering::Relaxed);
            check.fail_evicted();
        }
        for event in check.events {
            self.emit(event);
        }
    }

    fn shard_for(&self, point: &ValuePoint) -> usize {
        point.series_id().get() as usize % self.queues.len()
    }
}

/// Coordinates synchronous and asynchronous writes into one backend.
///
/// # Thread Safety
///
/// All methods take `&self`; share the coordinator behind an `Arc`.
/// Dropping it shuts the workers down after draining the queues.
pub struct WriteCoordinator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for WriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("backend", &self.shared.backend.name())
            .field("workers", &self.shared.queues.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl WriteCoordinator {
    /// Starts a coordinator over `backend`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`](crate::error::ConfigError::Invalid) if
    ///   `config` fails validation
    /// - [`WriteError::WorkerSpawn`] if a worker thread cannot be started
    pub fn new(backend: Arc<dyn StorageBackend>, config: WriterConfig) -> Result<Self> {
        Self::start(backend, config, None)
    }

    /// Like [`new`](Self::new), delivering every [`WriteEvent`] to `listener`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_listener(
        backend: Arc<dyn StorageBackend>,
        config: WriterConfig,
        listener: WriteEventListener,
    ) -> Result<Self> {
        Self::start(backend, config, Some(listener))
    }

    fn start(
        backend: Arc<dyn StorageBackend>,
        config: WriterConfig,
        listener: Option<WriteEventListener>,
    ) -> Result<Self> {
        config.validate()?;
        let limits = Thresholds::from(&config);
        let queues = (0..config.workers)
            .map(|shard| ShardQueue::new(shard, limits))
            .collect();
        let shared = Arc::new(Shared {
            backend,
            metrics: WriteMetrics::new(config.rate_window),
            config,
            queues,
            listener,
        });

        let coordinator = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(shared.config.workers)),
            shut_down: AtomicBool::new(false),
        };
        for shard in 0..shared.config.workers {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("pv-writer-{shard}"))
                .spawn(move || run_worker(&worker_shared, shard))
                .map_err(|e| WriteError::WorkerSpawn { source: e })?;
            coordinator.workers.lock().push(handle);
        }
        tracing::debug!(
            backend = shared.backend.name(),
            workers = shared.config.workers,
            policy = ?shared.config.overflow_policy,
            "write coordinator started"
        );
        Ok(coordinator)
    }

    /// Persists `point` before returning.
    ///
    /// The value is visible to every cursor opened after this returns.
    ///
    /// # Errors
    ///
    /// - [`WriteError`] if the point fails validation
    /// - a [`StorageError`](crate::error::StorageError) if the backend fails
    pub fn write_sync(&self, point: &ValuePoint) -> Result<()> {
        point.validate()?;
        match self.shared.backend.insert(point) {
            Ok(()) => {
                self.shared.metrics.sync_rate.add(1);
                Ok(())
            }
            Err(e) => {
                self.shared.metrics.failed_sync.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Validates and enqueues `point`, returning a ticket that tracks it.
    ///
    /// Under the blocking overflow policy this waits while the target shard
    /// is full.
    ///
    /// # Errors
    ///
    /// - [`WriteError`] if the point fails validation
    /// - [`WriteError::ShutDown`] after [`shutdown`](Self::shutdown)
    pub fn write_async(&self, point: ValuePoint) -> Result<WriteTicket> {
        point.validate()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WriteError::ShutDown.into());
        }
        let ticket = WriteTicket::new();
        let shard = self.shared.shard_for(&point);
        let pending = Pending {
            point,
            ticket: ticket.clone(),
        };
        // Count before the push so a fast worker never takes the gauge
        // below zero.
        self.shared.metrics.queued.fetch_add(1, Ordering::Relaxed);
        match self.shared.queues[shard].push(pending) {
            Ok(check) => {
                self.shared.metrics.async_rate.add(1);
                self.shared.settle(check);
                Ok(ticket)
            }
            Err(_) => {
                self.shared.metrics.queued.fetch_sub(1, Ordering::Relaxed);
                Err(WriteError::ShutDown.into())
            }
        }
    }

    /// Blocks until every value queued before this call has been
    /// acknowledged or has failed.
    pub fn flush(&self) {
        let barriers: Vec<_> = self
            .shared
            .queues
            .iter()
            .filter_map(ShardQueue::push_barrier)
            .collect();
        for barrier in barriers {
            barrier.wait();
        }
    }

    /// Stops accepting async writes, drains the queues, and joins the
    /// workers. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.shared.queues {
            queue.close();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("writer thread panicked");
            }
        }
        tracing::debug!("write coordinator shut down");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// The coordinator's counters.
    pub fn metrics(&self) -> &WriteMetrics {
        &self.shared.metrics
    }

    /// Values currently waiting in each shard.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.shared.queues.iter().map(ShardQueue::len).collect()
    }

    /// The configuration the coordinator runs with.
    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared, shard: usize) {
    let queue = &shared.queues[shard];
    while let Some((work, check)) = queue.take(shared.config.batch_size) {
        shared.settle(check);
        match work {
            Work::Barrier(barrier) => barrier.release(),
            Work::Batch(batch) => {
                shared
                    .metrics
                    .queued
                    .fetch_sub(batch.len() as u64, Ordering::Relaxed);
                persist(shared, shard, batch);
            }
        }
    }
    tracing::trace!(shard, "writer thread exiting");
}

fn persist(shared: &Shared, shard: usize, batch: Vec<Pending>) {
    let (points, tickets): (Vec<ValuePoint>, Vec<WriteTicket>) =
        batch.into_iter().map(|p| (p.point, p.ticket)).unzip();
    for ticket in &tickets {
        ticket.begin();
    }

    let max_attempts = shared.config.max_attempts;
    let mut backoff = shared.config.retry_backoff;
    let mut attempt = 1;
    let error = loop {
        match shared.backend.insert_batch(&points) {
            Ok(()) => {
                for ticket in &tickets {
                    ticket.acknowledge();
                }
                return;
            }
            Err(e) if attempt < max_attempts => {
                shared.metrics.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    shard,
                    attempt,
                    max_attempts,
                    error = %e,
                    "batch write failed, retrying in {:?}",
                    backoff
                );
                thread::sleep(backoff);
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => break e.to_string(),
        }
    };

    shared
        .metrics
        .dropped
        .fetch_add(points.len() as u64, Ordering::Relaxed);
    for ticket in &tickets {
        ticket.fail(FailureReason::Dropped {
            attempts: attempt,
            error: error.clone(),
        });
    }
    shared.emit(WriteEvent::WriteDropped {
        shard,
        count: points.len(),
        attempts: attempt,
        error,
    });
}
