//! Error types for the pointvault storage and query engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::SeriesId;

/// The main error type for all pointvault operations.
///
/// This enum covers all possible error conditions, from caller-input
/// validation on the query and write paths to backend I/O failures and
/// errors raised by a consumer's sink.
#[derive(Error, Debug)]
pub enum PointVaultError {
    /// The query was rejected or aborted.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A write was rejected by the write coordinator.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The consumer's sink failed while receiving rows.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

impl PointVaultError {
    /// Returns `true` if this error was raised by query cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Query(QueryError::Cancelled))
    }
}

/// Errors detected on the read path.
///
/// Everything except [`QueryError::Cancelled`] is a caller-input error that is
/// reported before any backend I/O happens.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A result limit of zero was supplied.
    #[error("invalid limit {limit}: must be > 0")]
    InvalidLimit {
        /// The rejected limit.
        limit: u32,
    },

    /// The time range is inverted.
    #[error("invalid time range: from {from} > to {to}")]
    InvalidTimeRange {
        /// The start of the range.
        from: i64,
        /// The end of the range.
        to: i64,
    },

    /// The same series was listed more than once.
    #[error("series {series_id} listed more than once")]
    DuplicateSeries {
        /// The repeated series.
        series_id: SeriesId,
    },

    /// The caller cancelled the query before it completed.
    #[error("query cancelled")]
    Cancelled,
}

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store directory could not be created or accessed.
    #[error("failed to access store directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to read from a series log.
    #[error("failed to read '{}' at offset {offset}: {source}", path.display())]
    ReadFailed {
        /// The log file path.
        path: PathBuf,
        /// The byte offset where the read failed.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to append to a series log.
    #[error("failed to write '{}' at offset {offset}: {source}", path.display())]
    WriteFailed {
        /// The log file path.
        path: PathBuf,
        /// The byte offset where the write failed.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync a series log to disk.
    #[error("failed to sync '{}' to disk: {source}", path.display())]
    SyncFailed {
        /// The log file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping a series log failed.
    #[error("memory mapping failed for '{}': {source}", path.display())]
    MemoryMap {
        /// The file path that failed to map.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A series log has an invalid header or record.
    #[error("log '{}' is corrupted at offset {offset}: {reason}", path.display())]
    CorruptedLog {
        /// The log file path.
        path: PathBuf,
        /// The byte offset of the bad header or record.
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// The store manifest (meta.json) is corrupted or invalid.
    #[error("corrupted metadata file: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// Failed to serialize or parse the store manifest.
    #[error("failed to (de)serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// The series was purged while a cursor was reading it.
    #[error("series {series_id} was rewritten while a cursor was open")]
    SnapshotInvalidated {
        /// The affected series.
        series_id: SeriesId,
    },

    /// The backend is temporarily unable to serve the request.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors raised by the write coordinator before a value is persisted.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The annotation exceeds the maximum stored length.
    #[error("annotation is {len} bytes (max {max})")]
    AnnotationTooLong {
        /// The annotation length in bytes.
        len: usize,
        /// The maximum allowed length.
        max: usize,
    },

    /// The value cannot be stored.
    #[error("invalid value for series {series_id}: {reason}")]
    InvalidValue {
        /// The target series.
        series_id: SeriesId,
        /// Why the value is invalid.
        reason: String,
    },

    /// The coordinator has been shut down.
    #[error("write coordinator is shut down")]
    ShutDown,

    /// A writer thread could not be started.
    #[error("failed to spawn writer thread: {source}")]
    WorkerSpawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration field has an invalid value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Load {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a [`QuerySink`](crate::sink::QuerySink) implementation.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing to the sink's output failed.
    #[error("sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing a row failed.
    #[error("failed to serialize row: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Writing a CSV record failed.
    #[error("failed to write CSV record: {0}")]
    Csv(#[from] csv::Error),

    /// The consumer refused further rows.
    #[error("sink rejected row: {reason}")]
    Rejected {
        /// Why the row was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, PointVaultError>`.
pub type Result<T> = std::result::Result<T, PointVaultError>;
