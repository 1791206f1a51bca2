//! # pointvault
//!
//! Multi-series point-value storage and streaming query engine.
//!
//! pointvault stores timestamped values for many independent series and
//! answers queries that merge those series into one correctly ordered
//! stream. Output is pushed into a caller-supplied sink as it is produced,
//! never collected into a result set first.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Time-ordered merge across series with deterministic tie-breaking
//! - Global or per-series result limits
//! - Bookend synthesis: boundary values stamped at the window edges
//! - Snapshot cursors that never hold a backend lock across sink calls
//! - Synchronous read-your-write and queued asynchronous write paths
//! - Pluggable persistence: in-memory maps or append-only logs on disk
//!
//! ## Quick Start
//!
//! ```rust
//! use pointvault::{
//!     Cancellation, CollectingSink, EngineConfig, PointValueStore, QuerySpec, SeriesId,
//!     ValuePoint,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PointValueStore::open(EngineConfig::default())?;
//!
//! // Two series sampled at different times
//! for (series, ts, v) in [(1, 100, 1.0), (2, 150, 2.0), (1, 200, 3.0)] {
//!     store.writer().write_sync(&ValuePoint::numeric(SeriesId(series), ts, v))?;
//! }
//!
//! // Bookended window: state at 120, changes inside, state at 250
//! let mut sink = CollectingSink::new();
//! let spec = QuerySpec::new(vec![SeriesId(1), SeriesId(2)]);
//! store
//!     .engine()
//!     .bookend_query(&spec, 120, 250, &mut sink, &Cancellation::new())?;
//!
//! for e in sink.emissions() {
//!     println!("{:?} {} {}", e.kind, e.point.series_id(), e.point.timestamp());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`PointValueStore`]: Facade; wires one backend to the engine and writer
//! - [`MergeEngine`]: Latest, range and bookend queries over many series
//! - [`WriteCoordinator`]: Sync and async write paths with rate metrics
//! - [`StorageBackend`]: Pluggable per-series ordered storage
//! - [`QuerySink`]: Streaming consumer of query output
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`store`]: Store facade
//! - [`merge`]: K-way merge, limits, bookends
//! - [`backend`]: Memory and log backends
//! - [`cursor`]: Time ranges and snapshot cursors
//! - [`write`]: Write coordinator, queues, tickets, rates
//! - [`sink`]: Sink trait and in-memory sinks
//! - [`export`]: CSV and JSON-lines sinks
//! - [`query`]: Query specs, cancellation, stats
//! - [`value`]: The point-value data model
//! - [`config`]: Engine configuration
//! - [`error`]: Error types

pub mod backend;
pub mod config;
pub mod cursor;
pub mod error;
pub mod export;
pub mod merge;
pub mod query;
pub mod sink;
pub mod store;
pub mod value;
pub mod write;

// Re-export primary API types at crate root for convenience.
pub use backend::{BackendConfig, StorageBackend};
pub use config::{EngineConfig, OverflowPolicy, WriterConfig};
pub use cursor::{Direction, SeriesCursor, TimeRange};
pub use error::{PointVaultError, Result};
pub use merge::MergeEngine;
pub use query::{Cancellation, QuerySpec, QueryStats};
pub use sink::{CollectingSink, EmissionKind, QuerySink};
pub use store::PointValueStore;
pub use value::{DataValue, SeriesId, ValuePoint};
pub use write::{WriteCoordinator, WriteEvent, WriteState, WriteTicket};
