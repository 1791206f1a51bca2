//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use pointvault::backend::MemoryBackend;
use pointvault::error::{Result, StorageError};
use pointvault::{Direction, SeriesCursor, SeriesId, StorageBackend, TimeRange, ValuePoint};

/// Sampling interval of the reference scenario: five minutes.
pub const INTERVAL: i64 = 5 * 60 * 1_000;

/// Samples per series over thirty days at five-minute intervals.
pub const TOTAL_SAMPLE_COUNT: i64 = 8_640;

/// First regular sample.
pub const START: i64 = 1_600_000_000_000;

/// One interval past the last regular sample.
pub const END: i64 = START + TOTAL_SAMPLE_COUNT * INTERVAL;

pub const S1: SeriesId = SeriesId(1);
pub const S2: SeriesId = SeriesId(2);

/// Timestamp of regular sample `i`.
pub fn sample(i: i64) -> i64 {
    START + i * INTERVAL
}

/// Loads the reference scenario into `backend`.
///
/// Both series hold one value every five minutes for thirty days, valued by
/// sample number. Series 2 also holds three older values (-3, -2, -1 at
/// 15, 10 and 5 minutes before `START`) and three newer ones (8640, 8641,
/// 8642 at `END`, `END + 5m`, `END + 10m`).
pub fn load_reference(backend: &dyn StorageBackend) {
    let mut points = Vec::with_capacity(2 * TOTAL_SAMPLE_COUNT as usize + 6);
    for i in 0..TOTAL_SAMPLE_COUNT {
        points.push(ValuePoint::numeric(S1, sample(i), i as f64));
        points.push(ValuePoint::numeric(S2, sample(i), i as f64));
    }
    for k in 1..=3 {
        points.push(ValuePoint::numeric(S2, START - k * INTERVAL, -(k as f64)));
    }
    for k in 0..3 {
        points.push(ValuePoint::numeric(
            S2,
            END + k * INTERVAL,
            (TOTAL_SAMPLE_COUNT + k) as f64,
        ));
    }
    backend.insert_batch(&points).unwrap();
}

/// A memory backend holding the reference scenario.
pub fn reference_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    load_reference(backend.as_ref());
    backend
}

/// The numeric reading of a point.
pub fn value_of(point: &ValuePoint) -> f64 {
    point.value().as_f64().unwrap()
}

/// Polls `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

fn unavailable(reason: &str) -> pointvault::PointVaultError {
    StorageError::Unavailable {
        reason: reason.to_string(),
    }
    .into()
}

/// A memory backend that fails on demand.
///
/// - Cursors over `failing_series` error after delivering `cursor_budget`
///   values.
/// - The first `failing_batches` calls to `insert_batch` error.
pub struct FaultyBackend {
    pub inner: MemoryBackend,
    failing_series: Option<SeriesId>,
    cursor_budget: usize,
    failing_batches: AtomicU32,
    pub batch_calls: AtomicU32,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            failing_series: None,
            cursor_budget: 0,
            failing_batches: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
        }
    }

    /// Cursors over `series` fail after `budget` values.
    pub fn failing_cursor(mut self, series: SeriesId, budget: usize) -> Self {
        self.failing_series = Some(series);
        self.cursor_budget = budget;
        self
    }

    /// The next `count` batch inserts fail.
    pub fn failing_batches(self, count: u32) -> Self {
        self.failing_batches.store(count, Ordering::SeqCst);
        self
    }
}

impl StorageBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn open_cursor(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        let inner = self.inner.open_cursor(series, range, direction)?;
        if self.failing_series == Some(series) {
            Ok(Box::new(FailingCursor {
                inner,
                remaining: self.cursor_budget,
            }))
        } else {
            Ok(inner)
        }
    }

    fn insert(&self, point: &ValuePoint) -> Result<()> {
        self.inner.insert(point)
    }

    fn insert_batch(&self, points: &[ValuePoint]) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(unavailable("injected batch failure"));
        }
        self.inner.insert_batch(points)
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        self.inner.series_ids()
    }

    fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64> {
        self.inner.delete_before(series, before)
    }

    fn delete_series(&self, series: SeriesId) -> Result<u64> {
        self.inner.delete_series(series)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct FailingCursor<'a> {
    inner: Box<dyn SeriesCursor + 'a>,
    remaining: usize,
}

impl SeriesCursor for FailingCursor<'_> {
    fn series_id(&self) -> SeriesId {
        self.inner.series_id()
    }

    fn next_point(&mut self) -> Result<Option<ValuePoint>> {
        if self.remaining == 0 {
            return Err(unavailable("injected cursor failure"));
        }
        self.remaining -= 1;
        self.inner.next_point()
    }
}

/// A memory backend whose batch inserts wait until the gate is opened.
///
/// Lets a test hold a writer thread mid-batch while it fills the queue.
#[derive(Default)]
pub struct GatedBackend {
    pub inner: MemoryBackend,
    open: Mutex<bool>,
    cond: Condvar,
    /// Batch inserts that have started.
    pub entered: AtomicUsize,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_gate(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Waits until at least `n` batch inserts have started.
    pub fn wait_entered(&self, n: usize) {
        assert!(
            wait_until(Duration::from_secs(5), || self.entered.load(Ordering::SeqCst) >= n),
            "writer never reached the backend"
        );
    }
}

impl StorageBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn open_cursor(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        self.inner.open_cursor(series, range, direction)
    }

    fn insert(&self, point: &ValuePoint) -> Result<()> {
        self.inner.insert(point)
    }

    fn insert_batch(&self, points: &[ValuePoint]) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        drop(open);
        self.inner.insert_batch(points)
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        self.inner.series_ids()
    }

    fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64> {
        self.inner.delete_before(series, before)
    }

    fn delete_series(&self, series: SeriesId) -> Result<u64> {
        self.inner.delete_series(series)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
