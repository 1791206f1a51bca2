//! Time ranges and ordered per-series cursors.
//!
//! A [`SeriesCursor`] walks one series' stored values inside a [`TimeRange`] in
//! a fixed [`Direction`]. Backends hand cursors out from
//! [`StorageBackend::open_cursor`](crate::backend::StorageBackend::open_cursor);
//! the merge engine owns every cursor it opens and drops it when the query
//! finishes, fails, or is cancelled.
//!
//! Cursors read in batches of [`CURSOR_BATCH_SIZE`] points. No backend lock is
//! held between batches, so a slow consumer never blocks writers.

use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use crate::value::{SeriesId, ValuePoint};

/// Number of points a cursor pulls from its backend per fetch.
pub const CURSOR_BATCH_SIZE: usize = 256;

/// Iteration order of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// A pair of timestamp bounds.
///
/// Each end is an explicit [`Bound`], so inclusive and exclusive edges are
/// never confused.
///
/// # Examples
///
/// ```
/// use pointvault::cursor::TimeRange;
///
/// let r = TimeRange::half_open(100, 200);
/// assert!(r.contains(100));
/// assert!(!r.contains(200));
/// assert!(TimeRange::half_open(5, 5).is_empty());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: Bound<i64>,
    end: Bound<i64>,
}

impl TimeRange {
    /// Creates a range from explicit bounds.
    pub fn new(start: Bound<i64>, end: Bound<i64>) -> Self {
        Self { start, end }
    }

    /// `[from, to)`
    pub fn half_open(from: i64, to: i64) -> Self {
        Self::new(Bound::Included(from), Bound::Excluded(to))
    }

    /// `(-inf, t)`
    pub fn before(t: i64) -> Self {
        Self::new(Bound::Unbounded, Bound::Excluded(t))
    }

    /// `(-inf, t]`
    pub fn at_or_before(t: i64) -> Self {
        Self::new(Bound::Unbounded, Bound::Included(t))
    }

    /// `[t, +inf)`
    pub fn from(t: i64) -> Self {
        Self::new(Bound::Included(t), Bound::Unbounded)
    }

    /// `(t, +inf)`
    pub fn after(t: i64) -> Self {
        Self::new(Bound::Excluded(t), Bound::Unbounded)
    }

    /// `[t, t]`
    pub fn exactly(t: i64) -> Self {
        Self::new(Bound::Included(t), Bound::Included(t))
    }

    /// Every timestamp.
    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Returns `true` if `ts` lies inside the range.
    pub fn contains(&self, ts: i64) -> bool {
        let above_start = match self.start {
            Bound::Included(s) => ts >= s,
            Bound::Excluded(s) => ts > s,
            Bound::Unbounded => true,
        };
        let below_end = match self.end {
            Bound::Included(e) => ts <= e,
            Bound::Excluded(e) => ts < e,
            Bound::Unbounded => true,
        };
        above_start && below_end
    }

    /// Returns `true` if no timestamp can lie inside the range.
    pub fn is_empty(&self) -> bool {
        // Normalise to an inclusive [lo, hi] pair; an exclusive bound at the
        // edge of the i64 domain leaves nothing.
        let lo = match self.start {
            Bound::Included(s) => s,
            Bound::Excluded(s) => match s.checked_add(1) {
                Some(lo) => lo,
                None => return true,
            },
            Bound::Unbounded => i64::MIN,
        };
        let hi = match self.end {
            Bound::Included(e) => e,
            Bound::Excluded(e) => match e.checked_sub(1) {
                Some(hi) => hi,
                None => return true,
            },
            Bound::Unbounded => i64::MAX,
        };
        lo > hi
    }

    /// The remainder of this range after `ts` has been consumed in `direction`.
    pub(crate) fn past(&self, ts: i64, direction: Direction) -> Self {
        match direction {
            Direction::Ascending => Self::new(Bound::Excluded(ts), self.end),
            Direction::Descending => Self::new(self.start, Bound::Excluded(ts)),
        }
    }
}

impl RangeBounds<i64> for TimeRange {
    fn start_bound(&self) -> Bound<&i64> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&i64> {
        self.end.as_ref()
    }
}

/// An ordered iterator over one series' stored values.
///
/// Values come back strictly monotone in the cursor's direction and always
/// inside the range it was opened with. A cursor only sees values that were
/// stored when it was opened.
pub trait SeriesCursor {
    /// The series this cursor reads.
    fn series_id(&self) -> SeriesId;

    /// Returns the next value, or `None` once the range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails while fetching the next batch.
    fn next_point(&mut self) -> Result<Option<ValuePoint>>;
}

/// A backend-side source of cursor batches.
///
/// Each call fetches up to `max` values of one series inside `range`, ordered
/// in `direction`. Implementations take whatever lock they need for the
/// duration of the call only.
pub(crate) trait BatchSource {
    fn fetch(
        &mut self,
        range: TimeRange,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<ValuePoint>>;
}

/// A cursor that refills a local buffer from a [`BatchSource`].
pub(crate) struct BatchedCursor<S> {
    source: S,
    series_id: SeriesId,
    backend: &'static str,
    remaining: TimeRange,
    direction: Direction,
    buffer: VecDeque<ValuePoint>,
    exhausted: bool,
    delivered: u64,
}

impl<S: BatchSource> BatchedCursor<S> {
    pub(crate) fn new(
        source: S,
        series_id: SeriesId,
        backend: &'static str,
        range: TimeRange,
        direction: Direction,
    ) -> Self {
        Self {
            source,
            series_id,
            backend,
            remaining: range,
            direction,
            buffer: VecDeque::new(),
            exhausted: range.is_empty(),
            delivered: 0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let batch = self
            .source
            .fetch(self.remaining, self.direction, CURSOR_BATCH_SIZE)?;
        if batch.len() < CURSOR_BATCH_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = batch.last() {
            self.remaining = self.remaining.past(last.timestamp(), self.direction);
            if self.remaining.is_empty() {
                self.exhausted = true;
            }
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl<S: BatchSource> SeriesCursor for BatchedCursor<S> {
    fn series_id(&self) -> SeriesId {
        self.series_id
    }

    fn next_point(&mut self) -> Result<Option<ValuePoint>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill()?;
        }
        let next = self.buffer.pop_front();
        if next.is_some() {
            self.delivered += 1;
        }
        Ok(next)
    }
}

impl<S> Drop for BatchedCursor<S> {
    fn drop(&mut self) {
        tracing::trace!(
            backend = self.backend,
            series = %self.series_id,
            delivered = self.delivered,
            "released cursor"
        );
    }
}
