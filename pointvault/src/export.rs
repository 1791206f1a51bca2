//! Streaming export sinks.
//!
//! [`CsvSink`] and [`JsonLinesSink`] serialize each callback to their writer
//! as it arrives. Nothing is collected first, so exporting a long range costs
//! the same memory as exporting one row.
//!
//! Both formats carry the callback kind and index so bookends can be told
//! apart from body rows:
//!
//! ```text
//! kind,index,series_id,timestamp_ms,type,value,annotation,is_bookend
//! first,0,1,1000,numeric,4.5,,true
//! row,1,1,1200,numeric,4.7,,false
//! ```
//!
//! # Example
//!
//! ```rust
//! use pointvault::export::CsvSink;
//! use pointvault::sink::QuerySink;
//! use pointvault::value::{SeriesId, ValuePoint};
//!
//! let mut sink = CsvSink::new(Vec::new())?;
//! sink.on_row(&ValuePoint::numeric(SeriesId(1), 1_000, 2.5), 0)?;
//! let bytes = sink.finish()?;
//! let text = String::from_utf8(bytes).unwrap();
//! assert!(text.ends_with("row,0,1,1000,numeric,2.5,,false\n"));
//! # Ok::<(), pointvault::PointVaultError>(())
//! ```

use std::io::Write;

use serde::Serialize;

use crate::error::{Result, SinkError};
use crate::sink::{EmissionKind, QuerySink};
use crate::value::ValuePoint;

const CSV_HEADER: [&str; 8] = [
    "kind",
    "index",
    "series_id",
    "timestamp_ms",
    "type",
    "value",
    "annotation",
    "is_bookend",
];

fn kind_label(kind: EmissionKind) -> &'static str {
    match kind {
        EmissionKind::First => "first",
        EmissionKind::Row => "row",
        EmissionKind::Last => "last",
    }
}

/// Writes every callback as one CSV record.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    records: u64,
}

impl<W: Write> CsvSink<W> {
    /// Wraps `inner` and writes the header record.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Csv`] if the header cannot be written.
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        writer.write_record(CSV_HEADER).map_err(SinkError::from)?;
        Ok(Self { writer, records: 0 })
    }

    /// Records written so far, excluding the header.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes buffered records and returns the inner writer.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the final flush fails.
    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()).into())
    }

    fn write(&mut self, kind: EmissionKind, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        let index = index.to_string();
        let series = point.series_id().to_string();
        let timestamp = point.timestamp().to_string();
        let value = point.value().to_string();
        self.writer
            .write_record([
                kind_label(kind),
                index.as_str(),
                series.as_str(),
                timestamp.as_str(),
                point.value().kind(),
                value.as_str(),
                point.annotation().unwrap_or(""),
                if is_bookend { "true" } else { "false" },
            ])
            .map_err(SinkError::from)?;
        self.records += 1;
        Ok(())
    }
}

impl<W: Write> QuerySink for CsvSink<W> {
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()> {
        self.write(EmissionKind::Row, point, index, false)
    }

    fn on_first_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.write(EmissionKind::First, point, index, is_bookend)
    }

    fn on_last_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.write(EmissionKind::Last, point, index, is_bookend)
    }
}

#[derive(Serialize)]
struct JsonRow<'a> {
    kind: &'static str,
    index: u64,
    is_bookend: bool,
    point: &'a ValuePoint,
}

/// Writes every callback as one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> JsonLinesSink<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Lines written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the inner writer.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the flush fails.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush().map_err(SinkError::from)?;
        Ok(self.inner)
    }

    fn write(&mut self, kind: EmissionKind, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        let row = JsonRow {
            kind: kind_label(kind),
            index,
            is_bookend,
            point,
        };
        serde_json::to_writer(&mut self.inner, &row).map_err(SinkError::from)?;
        self.inner.write_all(b"\n").map_err(SinkError::from)?;
        self.records += 1;
        Ok(())
    }
}

impl<W: Write> QuerySink for JsonLinesSink<W> {
    fn on_row(&mut self, point: &ValuePoint, index: u64) -> Result<()> {
        self.write(EmissionKind::Row, point, index, false)
    }

    fn on_first_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.write(EmissionKind::First, point, index, is_bookend)
    }

    fn on_last_value(&mut self, point: &ValuePoint, index: u64, is_bookend: bool) -> Result<()> {
        self.write(EmissionKind::Last, point, index, is_bookend)
    }
}
