//! The top-level facade tying a backend, the merge engine and the write
//! coordinator together.
//!
//! # Example Usage
//!
//! ```rust
//! use pointvault::config::EngineConfig;
//! use pointvault::query::{Cancellation, QuerySpec};
//! use pointvault::sink::CollectingSink;
//! use pointvault::store::PointValueStore;
//! use pointvault::value::{SeriesId, ValuePoint};
//!
//! let store = PointValueStore::open(EngineConfig::default())?;
//! store.writer().write_sync(&ValuePoint::numeric(SeriesId(1), 1_000, 20.5))?;
//!
//! let mut sink = CollectingSink::new();
//! store.engine().range_values(
//!     &QuerySpec::new(vec![SeriesId(1)]),
//!     0,
//!     2_000,
//!     &mut sink,
//!     &Cancellation::new(),
//! )?;
//! assert_eq!(sink.rows().count(), 1);
//! # Ok::<(), pointvault::PointVaultError>(())
//! ```

use std::sync::Arc;

use crate::backend::{StorageBackend, open_backend};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::merge::MergeEngine;
use crate::value::SeriesId;
use crate::write::{WriteCoordinator, WriteEventListener};

/// An open point-value store.
///
/// Dropping the store shuts the write coordinator down, draining any queued
/// values into the backend first.
pub struct PointValueStore {
    config: EngineConfig,
    backend: Arc<dyn StorageBackend>,
    engine: MergeEngine,
    writer: WriteCoordinator,
}

impl std::fmt::Debug for PointValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointValueStore")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl PointValueStore {
    /// Validates `config`, opens its backend, and starts the writers.
    ///
    /// # Errors
    ///
    /// - [`ConfigError`](crate::error::ConfigError) if validation fails
    /// - [`StorageError`](crate::error::StorageError) if the backend cannot
    ///   be opened
    /// - [`WriteError::WorkerSpawn`](crate::error::WriteError::WorkerSpawn)
    ///   if a writer thread cannot start
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.backend)?;
        let writer = WriteCoordinator::new(Arc::clone(&backend), config.writer.clone())?;
        Ok(Self::assemble(config, backend, writer))
    }

    /// Like [`open`](Self::open), delivering write events to `listener`.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_listener(config: EngineConfig, listener: WriteEventListener) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.backend)?;
        let writer =
            WriteCoordinator::with_listener(Arc::clone(&backend), config.writer.clone(), listener)?;
        Ok(Self::assemble(config, backend, writer))
    }

    fn assemble(
        config: EngineConfig,
        backend: Arc<dyn StorageBackend>,
        writer: WriteCoordinator,
    ) -> Self {
        tracing::info!(
            backend = backend.name(),
            workers = config.writer.workers,
            "point value store opened"
        );
        Self {
            engine: MergeEngine::new(Arc::clone(&backend)),
            config,
            backend,
            writer,
        }
    }

    /// The read side.
    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// The write side.
    pub fn writer(&self) -> &WriteCoordinator {
        &self.writer
    }

    /// The backend both sides share.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Deletes values of `series` older than `before`.
    ///
    /// Queued writes are flushed first so a value queued before the call
    /// cannot reappear after it.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64> {
        self.writer.flush();
        self.backend.delete_before(series, before)
    }

    /// Deletes every value of `series`, flushing queued writes first.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// fails.
    pub fn delete_series(&self, series: SeriesId) -> Result<u64> {
        self.writer.flush();
        self.backend.delete_series(series)
    }

    /// Waits for queued writes, then makes the backend durable.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::error::StorageError) if the backend
    /// cannot sync.
    pub fn flush(&self) -> Result<()> {
        self.writer.flush();
        self.backend.flush()
    }
}

impl Drop for PointValueStore {
    fn drop(&mut self) {
        self.writer.shutdown();
        if let Err(e) = self.backend.flush() {
            tracing::error!(error = %e, "failed to flush backend on close");
        }
    }
}
