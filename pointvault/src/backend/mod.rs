//! Pluggable persistence for point values.
//!
//! Every backend implements [`StorageBackend`]: per-series ordered storage
//! with last-write-wins at equal timestamps, snapshot cursors and purge
//! operations. The backend is chosen once at construction through
//! [`BackendConfig`] and [`open_backend`]; nothing downstream knows which one
//! is in use.
//!
//! - [`MemoryBackend`] keeps ordered maps in memory.
//! - [`LogBackend`] keeps one append-only log file per series on disk.

mod codec;
mod log;
mod memory;
mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cursor::{Direction, SeriesCursor, TimeRange};
use crate::error::Result;
use crate::value::{SeriesId, ValuePoint};

pub use self::log::{LogBackend, SeriesLogInfo};
pub use self::memory::MemoryBackend;
pub use self::snapshot::Snapshot;

/// Storage for per-series ordered values.
///
/// Implementations must be safe to share between threads. Cursors returned by
/// [`open_cursor`](Self::open_cursor) see the values stored at the moment they
/// were opened and never hold a backend lock between fetches. Cursors opened
/// through [`open_cursor_at`](Self::open_cursor_at) with one [`Snapshot`] all
/// see the same cut, including values overwritten after it was taken.
///
/// Purges are not versioned: values removed by
/// [`delete_before`](Self::delete_before) or
/// [`delete_series`](Self::delete_series) disappear for every snapshot.
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Takes a read snapshot of every series.
    ///
    /// Backends that do not version their values return
    /// [`Snapshot::latest`].
    fn snapshot(&self) -> Snapshot {
        Snapshot::latest()
    }

    /// Opens a cursor over `series` that sees exactly the values visible in
    /// `snapshot`.
    ///
    /// The default ignores the snapshot and opens a plain cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backing
    /// data cannot be accessed.
    fn open_cursor_at(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
        snapshot: &Snapshot,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        let _ = snapshot;
        self.open_cursor(series, range, direction)
    }

    /// Opens a cursor over `series` restricted to `range`.
    ///
    /// Unknown series yield an empty cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backing
    /// data cannot be accessed.
    fn open_cursor(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
    ) -> Result<Box<dyn SeriesCursor + '_>>;

    /// Stores one value, replacing any value at the same timestamp.
    ///
    /// The value is visible to cursors opened after this returns. Cursors and
    /// snapshots taken earlier keep seeing the value it replaced.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure,
    /// or a [`WriteError`](crate::error::WriteError) if the backend cannot
    /// represent the value.
    fn insert(&self, point: &ValuePoint) -> Result<()>;

    /// Stores several values in order.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure.
    /// Values before the failing one may already be stored.
    fn insert_batch(&self, points: &[ValuePoint]) -> Result<()> {
        for point in points {
            self.insert(point)?;
        }
        Ok(())
    }

    /// Every series that currently holds data, ascending.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure.
    fn series_ids(&self) -> Result<Vec<SeriesId>>;

    /// Deletes values of `series` with timestamp `< before`.
    ///
    /// Returns the number of values removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure.
    fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64>;

    /// Deletes every value of `series`.
    ///
    /// Returns the number of values removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure.
    fn delete_series(&self, series: SeriesId) -> Result<u64>;

    /// Makes every stored value durable.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) on I/O failure.
    fn flush(&self) -> Result<()>;
}

/// Which backend to construct.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory ordered maps.
    #[default]
    Memory,
    /// One append-only log per series under `path`.
    Log {
        /// Store directory; created if missing.
        path: PathBuf,
        /// `fsync` after every write.
        #[serde(default)]
        sync_writes: bool,
    },
}

/// Constructs the configured backend.
///
/// # Errors
///
/// Returns a [`StorageError`](crate::error::StorageError) if a log store
/// cannot be created or opened.
///
/// # Examples
///
/// ```
/// use pointvault::backend::{open_backend, BackendConfig};
///
/// let backend = open_backend(&BackendConfig::Memory)?;
/// assert_eq!(backend.name(), "memory");
/// # Ok::<(), pointvault::PointVaultError>(())
/// ```
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::Log { path, sync_writes } => {
            Ok(Arc::new(LogBackend::open(path, *sync_writes)?))
        }
    }
}
