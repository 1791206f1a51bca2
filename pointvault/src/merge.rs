//! Multi-series merge engine.
//!
//! The [`MergeEngine`] turns several per-series cursors into one correctly
//! ordered stream pushed into a [`QuerySink`]. Three query shapes are
//! supported:
//!
//! - [`latest_values`](MergeEngine::latest_values): the newest values before a
//!   timestamp, emitted oldest first
//! - [`range_values`](MergeEngine::range_values): every value in `[from, to)`
//! - [`bookend_query`](MergeEngine::bookend_query): the body of `(from, to)`
//!   framed by boundary values stamped at `from` and `to`
//!
//! # Ordering
//!
//! Interleaved output is ordered by timestamp; equal timestamps are ordered
//! by the position of their series in [`QuerySpec::series_ids`]. Grouped
//! output (`order_by_id`) drains series one at a time in list order.
//!
//! # Limits
//!
//! A limit caps body rows only. Interleaved queries apply it to the combined
//! stream; grouped queries apply it to each series. Latest-value queries with
//! a limit read newest-first and buffer at most `limit` values before
//! emitting them in ascending order.
//!
//! # Failure
//!
//! A backend or sink error stops the query at once and is returned. Rows
//! already delivered stand. Cancellation is checked before every emission and
//! every cursor read. Cursors are owned by the invocation and released when
//! it returns, whatever the outcome.
//!
//! # Consistency
//!
//! Each invocation takes one [`Snapshot`] before opening anything and opens
//! every cursor it needs with it, bookend lookups included. Values written
//! while the query runs, even by the sink itself, never reach its output.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::ops::Bound;
use std::sync::Arc;

use crate::backend::{Snapshot, StorageBackend};
use crate::cursor::{Direction, SeriesCursor, TimeRange};
use crate::error::Result;
use crate::query::{Cancellation, QuerySpec, QueryStats, validate_distinct, validate_window};
use crate::sink::QuerySink;
use crate::value::{SeriesId, ValuePoint};

/// Merges per-series cursors into ordered, limited, bookended output.
///
/// The engine holds no per-query state; every method can run concurrently
/// from many threads.
#[derive(Clone)]
pub struct MergeEngine {
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl MergeEngine {
    /// Creates an engine reading from `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Returns the backend this engine reads from.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Emits, per series, the most recent values with timestamp `< before`.
    ///
    /// Without a limit every such value is emitted, exactly as a range scan
    /// over `(-inf, before)`. With a limit at most `limit` values are emitted
    /// (per series when grouped, in total when interleaved), always oldest
    /// first.
    ///
    /// # Errors
    ///
    /// - [`QueryError`](crate::error::QueryError) for an invalid spec or on
    ///   cancellation
    /// - any backend or sink error raised mid-stream
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use pointvault::backend::{MemoryBackend, StorageBackend};
    /// use pointvault::merge::MergeEngine;
    /// use pointvault::query::{Cancellation, QuerySpec};
    /// use pointvault::sink::CollectingSink;
    /// use pointvault::value::{SeriesId, ValuePoint};
    ///
    /// let backend = Arc::new(MemoryBackend::new());
    /// for ts in 0..10 {
    ///     backend.insert(&ValuePoint::numeric(SeriesId(1), ts, ts as f64))?;
    /// }
    /// let engine = MergeEngine::new(backend);
    ///
    /// let mut sink = CollectingSink::new();
    /// let spec = QuerySpec::new(vec![SeriesId(1)]).with_limit(3);
    /// engine.latest_values(&spec, 8, &mut sink, &Cancellation::new())?;
    ///
    /// let ts: Vec<i64> = sink.rows().map(|p| p.timestamp()).collect();
    /// assert_eq!(ts, vec![5, 6, 7]);
    /// # Ok::<(), pointvault::PointVaultError>(())
    /// ```
    pub fn latest_values(
        &self,
        spec: &QuerySpec,
        before: i64,
        sink: &mut dyn QuerySink,
        cancel: &Cancellation,
    ) -> Result<QueryStats> {
        spec.validate()?;
        let snapshot = self.backend.snapshot();
        let Some(limit) = spec.row_limit() else {
            let stats = self.scan(spec, TimeRange::before(before), sink, cancel, &snapshot)?;
            trace_done("latest_values", &stats);
            return Ok(stats);
        };

        let range = TimeRange::before(before);
        let mut out = Emitter::new(sink, cancel);
        if spec.order_by_id {
            for &id in &spec.series_ids {
                let mut cursor = self.open(id, range, Direction::Descending, cancel, &snapshot)?;
                let mut newest = Vec::new();
                while (newest.len() as u64) < limit {
                    match pull(cursor.as_mut(), cancel)? {
                        Some(point) => newest.push(point),
                        None => break,
                    }
                }
                if newest.len() as u64 == limit && pull(cursor.as_mut(), cancel)?.is_some() {
                    out.stats.truncated = true;
                }
                drop(cursor);
                for point in newest.iter().rev() {
                    out.row(point)?;
                }
            }
        } else {
            let mut merger = Merger::open(
                self,
                &spec.series_ids,
                range,
                Direction::Descending,
                cancel,
                &snapshot,
            )?;
            let mut newest = Vec::new();
            while (newest.len() as u64) < limit {
                match merger.next(cancel)? {
                    Some(entry) => newest.push(entry),
                    None => break,
                }
            }
            if merger.has_more() {
                out.stats.truncated = true;
            }
            drop(merger);
            // Reversal alone would put ties in reverse list order.
            newest.sort_by_key(|(idx, point)| (point.timestamp(), *idx));
            for (_, point) in &newest {
                out.row(point)?;
            }
        }
        trace_done("latest_values", &out.stats);
        Ok(out.stats)
    }

    /// Emits every stored value with `from <= ts < to`.
    ///
    /// # Errors
    ///
    /// - [`QueryError`](crate::error::QueryError) for an invalid spec or
    ///   window, or on cancellation
    /// - any backend or sink error raised mid-stream
    pub fn range_values(
        &self,
        spec: &QuerySpec,
        from: i64,
        to: i64,
        sink: &mut dyn QuerySink,
        cancel: &Cancellation,
    ) -> Result<QueryStats> {
        spec.validate()?;
        validate_window(from, to)?;
        let snapshot = self.backend.snapshot();
        let stats = self.scan(spec, TimeRange::half_open(from, to), sink, cancel, &snapshot)?;
        trace_done("range_values", &stats);
        Ok(stats)
    }

    /// Emits the values in `(from, to)` framed by boundary values.
    ///
    /// For each series, the last value at or before `from` is delivered
    /// through `on_first_value` stamped at `from`, then the body rows, then
    /// the state at `to` through `on_last_value` stamped at `to`. When the
    /// limit cut a series' body short, its end value repeats the last value
    /// actually delivered for it so the boundary never reports state the
    /// consumer has not seen.
    ///
    /// Interleaved queries emit every start value, then the merged body, then
    /// every end value. Grouped queries emit start, body and end per series.
    ///
    /// # Errors
    ///
    /// - [`QueryError`](crate::error::QueryError) for an invalid spec or
    ///   window, or on cancellation
    /// - any backend or sink error raised mid-stream
    pub fn bookend_query(
        &self,
        spec: &QuerySpec,
        from: i64,
        to: i64,
        sink: &mut dyn QuerySink,
        cancel: &Cancellation,
    ) -> Result<QueryStats> {
        spec.validate()?;
        validate_window(from, to)?;
        let body = TimeRange::new(Bound::Excluded(from), Bound::Excluded(to));
        let limit = spec.row_limit();
        let snapshot = self.backend.snapshot();
        let mut out = Emitter::new(sink, cancel);

        if spec.order_by_id {
            for &id in &spec.series_ids {
                let start = self.at_or_before(id, from, cancel, &snapshot)?;
                if let Some(point) = &start {
                    out.first(&point.restamped(from), point.timestamp() != from)?;
                }

                let mut cursor = self.open(id, body, Direction::Ascending, cancel, &snapshot)?;
                let mut last_row = None;
                let mut taken = 0u64;
                let mut truncated = false;
                while let Some(point) = pull(cursor.as_mut(), cancel)? {
                    if limit.is_some_and(|l| taken >= l) {
                        truncated = true;
                        break;
                    }
                    out.row(&point)?;
                    taken += 1;
                    last_row = Some(point);
                }
                drop(cursor);

                if truncated {
                    out.stats.truncated = true;
                    if let Some(point) = last_row.or(start) {
                        out.last(&point.restamped(to), true)?;
                    }
                } else {
                    self.emit_end(&mut out, id, to, cancel, &snapshot)?;
                }
            }
        } else {
            let mut starts = Vec::with_capacity(spec.series_ids.len());
            for &id in &spec.series_ids {
                starts.push(self.at_or_before(id, from, cancel, &snapshot)?);
            }
            for point in starts.iter().flatten() {
                out.first(&point.restamped(from), point.timestamp() != from)?;
            }

            let mut last_rows: Vec<Option<ValuePoint>> = vec![None; spec.series_ids.len()];
            let mut truncated_series = BTreeSet::new();
            {
                let mut merger = Merger::open(
                    self,
                    &spec.series_ids,
                    body,
                    Direction::Ascending,
                    cancel,
                    &snapshot,
                )?;
                while let Some((idx, point)) = merger.next(cancel)? {
                    if limit.is_some_and(|l| out.stats.rows >= l) {
                        truncated_series.insert(idx);
                        truncated_series.extend(merger.pending());
                        break;
                    }
                    out.row(&point)?;
                    last_rows[idx] = Some(point);
                }
            }

            for (idx, &id) in spec.series_ids.iter().enumerate() {
                if truncated_series.contains(&idx) {
                    out.stats.truncated = true;
                    let known = last_rows[idx].take().or_else(|| starts[idx].take());
                    if let Some(point) = known {
                        out.last(&point.restamped(to), true)?;
                    }
                } else {
                    self.emit_end(&mut out, id, to, cancel, &snapshot)?;
                }
            }
        }
        trace_done("bookend_query", &out.stats);
        Ok(out.stats)
    }

    /// The newest stored value of `series`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn latest_value(&self, series: SeriesId) -> Result<Option<ValuePoint>> {
        let snapshot = self.backend.snapshot();
        self.first_in(series, TimeRange::all(), Direction::Descending, &snapshot)
    }

    /// The newest value of `series` strictly before `ts`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn value_before(&self, series: SeriesId, ts: i64) -> Result<Option<ValuePoint>> {
        let snapshot = self.backend.snapshot();
        self.first_in(series, TimeRange::before(ts), Direction::Descending, &snapshot)
    }

    /// The value of `series` stored exactly at `ts`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn value_at(&self, series: SeriesId, ts: i64) -> Result<Option<ValuePoint>> {
        let snapshot = self.backend.snapshot();
        self.first_in(series, TimeRange::exactly(ts), Direction::Ascending, &snapshot)
    }

    /// The oldest value of `series` at or after `ts`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn value_after(&self, series: SeriesId, ts: i64) -> Result<Option<ValuePoint>> {
        let snapshot = self.backend.snapshot();
        self.first_in(series, TimeRange::from(ts), Direction::Ascending, &snapshot)
    }

    /// Number of stored values in `[from, to)` across `series_ids`.
    ///
    /// # Errors
    ///
    /// - [`QueryError`](crate::error::QueryError) for duplicate series or an
    ///   inverted window
    /// - a [`StorageError`](crate::error::StorageError) if the backend fails
    pub fn count_between(&self, series_ids: &[SeriesId], from: i64, to: i64) -> Result<u64> {
        validate_distinct(series_ids)?;
        validate_window(from, to)?;
        let cancel = Cancellation::new();
        let snapshot = self.backend.snapshot();
        let mut count = 0u64;
        for &id in series_ids {
            let range = TimeRange::half_open(from, to);
            let mut cursor = self.open(id, range, Direction::Ascending, &cancel, &snapshot)?;
            while cursor.next_point()?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Earliest and latest stored timestamps across `series_ids`.
    ///
    /// Returns `None` when none of the series holds data.
    ///
    /// # Errors
    ///
    /// - [`QueryError::DuplicateSeries`](crate::error::QueryError::DuplicateSeries)
    ///   if a series is listed twice
    /// - a [`StorageError`](crate::error::StorageError) if the backend fails
    pub fn time_bounds(&self, series_ids: &[SeriesId]) -> Result<Option<(i64, i64)>> {
        validate_distinct(series_ids)?;
        let snapshot = self.backend.snapshot();
        let mut bounds: Option<(i64, i64)> = None;
        for &id in series_ids {
            let earliest = self.first_in(id, TimeRange::all(), Direction::Ascending, &snapshot)?;
            let latest = self.first_in(id, TimeRange::all(), Direction::Descending, &snapshot)?;
            if let (Some(e), Some(l)) = (earliest, latest) {
                let (e, l) = (e.timestamp(), l.timestamp());
                bounds = Some(match bounds {
                    Some((lo, hi)) => (lo.min(e), hi.max(l)),
                    None => (e, l),
                });
            }
        }
        Ok(bounds)
    }

    /// Ascending scan of `range` in interleaved or grouped order.
    fn scan(
        &self,
        spec: &QuerySpec,
        range: TimeRange,
        sink: &mut dyn QuerySink,
        cancel: &Cancellation,
        snapshot: &Snapshot,
    ) -> Result<QueryStats> {
        let limit = spec.row_limit();
        let mut out = Emitter::new(sink, cancel);
        if spec.order_by_id {
            for &id in &spec.series_ids {
                let mut cursor = self.open(id, range, Direction::Ascending, cancel, snapshot)?;
                let mut taken = 0u64;
                while let Some(point) = pull(cursor.as_mut(), cancel)? {
                    if limit.is_some_and(|l| taken >= l) {
                        out.stats.truncated = true;
                        break;
                    }
                    out.row(&point)?;
                    taken += 1;
                }
            }
        } else {
            let mut merger = Merger::open(
                self,
                &spec.series_ids,
                range,
                Direction::Ascending,
                cancel,
                snapshot,
            )?;
            while let Some((_, point)) = merger.next(cancel)? {
                if limit.is_some_and(|l| out.stats.rows >= l) {
                    out.stats.truncated = true;
                    break;
                }
                out.row(&point)?;
            }
        }
        Ok(out.stats)
    }

    /// Emits the end value of a series whose body ran to completion.
    fn emit_end(
        &self,
        out: &mut Emitter<'_>,
        id: SeriesId,
        to: i64,
        cancel: &Cancellation,
        snapshot: &Snapshot,
    ) -> Result<()> {
        if let Some(point) = self.at_or_before(id, to, cancel, snapshot)? {
            out.last(&point.restamped(to), point.timestamp() != to)?;
        }
        Ok(())
    }

    fn at_or_before(
        &self,
        id: SeriesId,
        ts: i64,
        cancel: &Cancellation,
        snapshot: &Snapshot,
    ) -> Result<Option<ValuePoint>> {
        let range = TimeRange::at_or_before(ts);
        let mut cursor = self.open(id, range, Direction::Descending, cancel, snapshot)?;
        pull(cursor.as_mut(), cancel)
    }

    fn first_in(
        &self,
        id: SeriesId,
        range: TimeRange,
        direction: Direction,
        snapshot: &Snapshot,
    ) -> Result<Option<ValuePoint>> {
        let mut cursor = self.backend.open_cursor_at(id, range, direction, snapshot)?;
        cursor.next_point()
    }

    fn open(
        &self,
        id: SeriesId,
        range: TimeRange,
        direction: Direction,
        cancel: &Cancellation,
        snapshot: &Snapshot,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        cancel.check()?;
        self.backend.open_cursor_at(id, range, direction, snapshot)
    }
}

fn pull(cursor: &mut dyn SeriesCursor, cancel: &Cancellation) -> Result<Option<ValuePoint>> {
    cancel.check()?;
    cursor.next_point()
}

fn trace_done(op: &'static str, stats: &QueryStats) {
    tracing::trace!(
        op,
        rows = stats.rows,
        bookends = stats.bookends,
        truncated = stats.truncated,
        "query complete"
    );
}

/// Delivers callbacks with a running index and statistics.
struct Emitter<'a> {
    sink: &'a mut dyn QuerySink,
    cancel: &'a Cancellation,
    index: u64,
    stats: QueryStats,
}

impl<'a> Emitter<'a> {
    fn new(sink: &'a mut dyn QuerySink, cancel: &'a Cancellation) -> Self {
        Self {
            sink,
            cancel,
            index: 0,
            stats: QueryStats::default(),
        }
    }

    fn row(&mut self, point: &ValuePoint) -> Result<()> {
        self.cancel.check()?;
        self.sink.on_row(point, self.index)?;
        self.index += 1;
        self.stats.rows += 1;
        Ok(())
    }

    fn first(&mut self, point: &ValuePoint, is_bookend: bool) -> Result<()> {
        self.cancel.check()?;
        self.sink.on_first_value(point, self.index, is_bookend)?;
        self.index += 1;
        self.stats.bookends += 1;
        Ok(())
    }

    fn last(&mut self, point: &ValuePoint, is_bookend: bool) -> Result<()> {
        self.cancel.check()?;
        self.sink.on_last_value(point, self.index, is_bookend)?;
        self.index += 1;
        self.stats.bookends += 1;
        Ok(())
    }
}

/// Heap entry keyed by timestamp, then series index.
///
/// Ascending merges pop the oldest timestamp first, descending merges the
/// newest. Either way ties pop in series list order.
struct HeapEntry {
    idx: usize,
    point: ValuePoint,
    direction: Direction,
}

impl HeapEntry {
    fn key(&self) -> (i64, usize) {
        (self.point.timestamp(), self.idx)
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the greatest entry pops first.
        let by_time = self.point.timestamp().cmp(&other.point.timestamp());
        let by_time = match self.direction {
            Direction::Ascending => by_time.reverse(),
            Direction::Descending => by_time,
        };
        by_time.then_with(|| other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapEntry {}

/// K-way merge over one cursor per series.
///
/// The heap holds at most one buffered value per cursor.
struct Merger<'a> {
    cursors: Vec<Box<dyn SeriesCursor + 'a>>,
    heap: BinaryHeap<HeapEntry>,
    direction: Direction,
}

impl<'a> Merger<'a> {
    fn open(
        engine: &'a MergeEngine,
        ids: &[SeriesId],
        range: TimeRange,
        direction: Direction,
        cancel: &Cancellation,
        snapshot: &Snapshot,
    ) -> Result<Self> {
        let mut cursors = Vec::with_capacity(ids.len());
        for &id in ids {
            cursors.push(engine.open(id, range, direction, cancel, snapshot)?);
        }
        let mut heap = BinaryHeap::with_capacity(ids.len());
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some(point) = pull(cursor.as_mut(), cancel)? {
                heap.push(HeapEntry {
                    idx,
                    point,
                    direction,
                });
            }
        }
        Ok(Self {
            cursors,
            heap,
            direction,
        })
    }

    /// Pops the next value in merge order and refills from its cursor.
    fn next(&mut self, cancel: &Cancellation) -> Result<Option<(usize, ValuePoint)>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(point) = pull(self.cursors[top.idx].as_mut(), cancel)? {
            self.heap.push(HeapEntry {
                idx: top.idx,
                point,
                direction: self.direction,
            });
        }
        Ok(Some((top.idx, top.point)))
    }

    fn has_more(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Series indexes that still have values buffered.
    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.heap.iter().map(|entry| entry.idx)
    }
}
