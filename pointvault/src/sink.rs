//! Streaming consumers of query output.
//!
//! The merge engine never collects a result set; it pushes each value into a
//! [`QuerySink`] as soon as its position in the output is known. Every
//! callback carries a 0-based `index` that counts all callbacks made by the
//! invocation, body rows and bookends alike.

use crate::error::{Result, SinkError};
use crate::value::ValuePoint;

/// Receives the output of a query as it is produced.
///
/// Returning an error from any callback aborts the query: no further
/// callbacks are made and the error is returned to the caller.
pub trait QuerySink {
    /// Receives a body row.
    ///
    /// # Errors
    ///
    /// Implementations return an error to abort the query.
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()>;

    /// Receives a start boundary value, stamped at the start of the window.
    ///
    /// `is_bookend` is `false` when a real stored value sits exactly on the
    /// boundary.
    ///
    /// # Errors
    ///
    /// Implementations return an error to abort the query.
    fn on_first_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        let _ = (point, index, is_bookend);
        Ok(())
    }

    /// Receives an end boundary value, stamped at the end of the window.
    ///
    /// # Errors
    ///
    /// Implementations return an error to abort the query.
    fn on_last_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        let _ = (point, index, is_bookend);
        Ok(())
    }
}

impl<S: QuerySink + ?Sized> QuerySink for &mut S {
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()> {
        (**self).on_row(point, index)
    }

    fn on_first_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        (**self).on_first_value(point, index, is_bookend)
    }

    fn on_last_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        (**self).on_last_value(point, index, is_bookend)
    }
}

/// Which callback produced an [`Emission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionKind {
    /// `on_first_value`
    First,
    /// `on_row`
    Row,
    /// `on_last_value`
    Last,
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// The callback that fired.
    pub kind: EmissionKind,
    /// The delivered value.
    pub point: ValuePoint,
    /// The callback index.
    pub index: u64,
    /// Bookend flag; always `false` for rows.
    pub is_bookend: bool,
}

/// A sink that records every callback in order.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    emissions: Vec<Emission>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded callback, in delivery order.
    pub fn emissions(&self) -> &[Emission] {
        &self.emissions
    }

    /// Only the body rows.
    pub fn rows(&self) -> impl Iterator<Item = &ValuePoint> {
        self.of_kind(EmissionKind::Row).map(|e| &e.point)
    }

    /// Only the emissions of one kind.
    pub fn of_kind(&self, kind: EmissionKind) -> impl Iterator<Item = &Emission> {
        self.emissions.iter().filter(move |e| e.kind == kind)
    }

    /// Consumes the sink and returns the recording.
    pub fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }

    /// Number of recorded callbacks.
    pub fn len(&self) -> usize {
        self.emissions.len()
    }

    /// Returns `true` if nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }

    fn record(&mut self, kind: EmissionKind, point: &ValuePoint, index: u64, is_bookend: bool) {
        self.emissions.push(Emission {
            kind,
            point: point.clone(),
            index,
            is_bookend,
        });
    }
}

impl QuerySink for CollectingSink {
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()> {
        self.record(EmissionKind::Row, point, index, false);
        Ok(())
    }

    fn on_first_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.record(EmissionKind::First, point, index, is_bookend);
        Ok(())
    }

    fn on_last_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.record(EmissionKind::Last, point, index, is_bookend);
        Ok(())
    }
}

/// Adapts a closure into a row-only sink.
///
/// Bookend callbacks are ignored.
///
/// # Examples
///
/// ```
/// use pointvault::sink::{FnSink, QuerySink};
/// use pointvault::value::{SeriesId, ValuePoint};
///
/// let mut total = 0.0;
/// let mut sink = FnSink::new(|p: &ValuePoint, _index| {
///     total += p.value().as_f64().unwrap_or(0.0);
///     Ok(())
/// });
/// sink.on_row(&ValuePoint::numeric(SeriesId(1), 0, 2.5), 0).unwrap();
/// drop(sink);
/// assert_eq!(total, 2.5);
/// ```
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: FnMut(&ValuePoint, u64) -> std::result::Result<(), SinkError>,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> QuerySink for FnSink<F>
where
    F: FnMut(&ValuePoint, u64) -> std::result::Result<(), SinkError>,
{
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()> {
        (self.f)(point, index).map_err(Into::into)
    }
}
