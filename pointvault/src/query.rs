//! Query specifications, cancellation, and per-invocation statistics.
//!
//! A [`QuerySpec`] names the series to read, whether output is grouped by
//! series, and an optional result limit. Validation happens in
//! [`QuerySpec::validate`] before any backend I/O so that caller mistakes are
//! reported as [`QueryError`]s rather than half-delivered results.
//!
//! # Example Usage
//!
//! ```rust
//! use pointvault::query::QuerySpec;
//! use pointvault::value::SeriesId;
//!
//! let spec = QuerySpec::new(vec![SeriesId(1), SeriesId(2)])
//!     .with_limit(100)
//!     .ordered_by_id(true);
//! assert!(spec.validate().is_ok());
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::QueryError;
use crate::value::SeriesId;

/// What to read and how to shape the output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuerySpec {
    /// Series to read, in output order. Ties between series are broken by
    /// position in this list.
    pub series_ids: Vec<SeriesId>,

    /// Group output by series in `series_ids` order instead of interleaving
    /// by time. When set, the limit applies to each series separately.
    pub order_by_id: bool,

    /// Maximum number of body rows. Must be strictly positive when present.
    pub limit: Option<u32>,
}

impl QuerySpec {
    /// Creates an interleaved, unlimited query over `series_ids`.
    pub fn new(series_ids: Vec<SeriesId>) -> Self {
        Self {
            series_ids,
            order_by_id: false,
            limit: None,
        }
    }

    /// Sets the result limit.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets grouped (per-series) output.
    #[must_use]
    pub fn ordered_by_id(mut self, order_by_id: bool) -> Self {
        self.order_by_id = order_by_id;
        self
    }

    /// Checks the limit and the series list.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidLimit`] for a zero limit and
    /// [`QueryError::DuplicateSeries`] if a series is listed twice.
    pub fn validate(&self) -> Result<(), QueryError> {
        if let Some(limit) = self.limit
            && limit == 0
        {
            return Err(QueryError::InvalidLimit { limit });
        }
        validate_distinct(&self.series_ids)
    }

    /// The limit as a row count, or `None` when unbounded.
    pub(crate) fn row_limit(&self) -> Option<u64> {
        self.limit.map(u64::from)
    }
}

/// Checks that no series is listed twice.
///
/// # Errors
///
/// Returns [`QueryError::DuplicateSeries`] naming the first repeat.
pub fn validate_distinct(series_ids: &[SeriesId]) -> Result<(), QueryError> {
    let mut seen = HashSet::with_capacity(series_ids.len());
    for id in series_ids {
        if !seen.insert(*id) {
            return Err(QueryError::DuplicateSeries { series_id: *id });
        }
    }
    Ok(())
}

/// Checks that `from <= to`.
///
/// # Errors
///
/// Returns [`QueryError::InvalidTimeRange`] when the range is inverted.
pub fn validate_window(from: i64, to: i64) -> Result<(), QueryError> {
    if from > to {
        return Err(QueryError::InvalidTimeRange { from, to });
    }
    Ok(())
}

/// A cloneable flag that asks a running query to stop.
///
/// The merge engine checks the flag before every emission and every cursor
/// fetch, then returns [`QueryError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns an error if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<(), QueryError> {
        if self.is_cancelled() {
            Err(QueryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counts from one completed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryStats {
    /// Body rows delivered through `on_row`.
    pub rows: u64,
    /// Boundary values delivered through `on_first_value`/`on_last_value`.
    pub bookends: u64,
    /// Whether the limit cut the body short.
    pub truncated: bool,
}

impl QueryStats {
    /// Total number of callbacks made.
    pub fn callbacks(&self) -> u64 {
        self.rows + self.bookends
    }
}
