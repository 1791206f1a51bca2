//! CLI for the pointvault point-value storage engine.
//!
//! Provides commands for inspecting, querying, loading, and benchmarking
//! pointvault log stores.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use pointvault::backend::LogBackend;
use pointvault::export::{CsvSink, JsonLinesSink};
use pointvault::{
    BackendConfig, Cancellation, EngineConfig, MergeEngine, PointValueStore, QuerySink,
    QuerySpec, QueryStats, SeriesId, ValuePoint, WriterConfig,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// pointvault: embedded point-value store with k-way merged queries.
#[derive(Parser)]
#[command(name = "pointvault", version, about)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset (e.g. "info", "pointvault=debug").
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display the store manifest, series, value counts, and file sizes.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Query values from a store, streaming results to stdout.
    Query {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Comma-separated series ids, in output order (e.g. "1,2").
        #[arg(long, value_delimiter = ',', required = true)]
        series: Vec<u32>,

        /// Query shape.
        #[arg(long, default_value = "range")]
        mode: QueryMode,

        /// Window start in epoch milliseconds (defaults to the oldest value).
        #[arg(long, allow_negative_numbers = true)]
        from: Option<i64>,

        /// Window end in epoch milliseconds (defaults past the newest value).
        #[arg(long, allow_negative_numbers = true)]
        to: Option<i64>,

        /// Cutoff for latest mode in epoch milliseconds (defaults to no cutoff).
        #[arg(long, allow_negative_numbers = true)]
        before: Option<i64>,

        /// Maximum number of rows.
        #[arg(long)]
        limit: Option<u32>,

        /// Apply the limit per series and emit series one after another.
        #[arg(long)]
        order_by_id: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Load values from a CSV file of `series_id,timestamp_ms,value[,annotation]` rows.
    Ingest {
        /// Path to the store directory; created if missing.
        store_path: PathBuf,

        /// CSV file with a header row.
        csv_path: PathBuf,

        /// Queue values on the async write path instead of writing them directly.
        #[arg(long = "async")]
        use_async: bool,
    },

    /// Run a write-path microbenchmark.
    Bench {
        /// Number of values to write.
        #[arg(long, default_value = "1000000")]
        points: u64,

        /// Number of series to spread them across.
        #[arg(long, default_value = "30")]
        series: u32,

        /// Write path to exercise.
        #[arg(long, default_value = "async")]
        mode: WriteMode,
    },
}

/// Query shapes offered by `pointvault query`.
#[derive(Clone, Copy, ValueEnum)]
enum QueryMode {
    /// Values in `[from, to)`.
    Range,
    /// Newest values before `--before`, oldest first.
    Latest,
    /// Values in `(from, to)` with synthesized boundary values.
    Bookend,
}

/// Output format for query results.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// One JSON object per line.
    Json,
}

/// Write path used by `pointvault bench`.
#[derive(Clone, Copy, ValueEnum)]
enum WriteMode {
    /// `write_sync`, one backend call per value.
    Sync,
    /// `write_async` through the sharded queues.
    Async,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path),
        Commands::Query {
            store_path,
            series,
            mode,
            from,
            to,
            before,
            limit,
            order_by_id,
            format,
        } => {
            let request = QueryRequest {
                series: series.into_iter().map(SeriesId).collect(),
                mode,
                from,
                to,
                before,
                limit,
                order_by_id,
            };
            cmd_query(&store_path, &request, format)
        }
        Commands::Ingest {
            store_path,
            csv_path,
            use_async,
        } => cmd_ingest(&store_path, &csv_path, use_async),
        Commands::Bench {
            points,
            series,
            mode,
        } => cmd_bench(points, series, mode),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Logs go to stderr so query output on stdout stays clean.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Opens an existing log store without creating one.
fn open_existing(store_path: &Path) -> Result<LogBackend, Box<dyn std::error::Error>> {
    if !store_path.join("meta.json").exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(LogBackend::open(store_path, false)?)
}

/// Implements `pointvault info <store_path>`.
fn cmd_info(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_existing(store_path)?;

    let meta_data = std::fs::read_to_string(store_path.join("meta.json"))?;
    let meta: serde_json::Value = serde_json::from_str(&meta_data)?;
    let version = meta.get("version").and_then(serde_json::Value::as_u64).unwrap_or(0);

    println!("Store: {}", store_path.display());
    println!("Manifest version: {version}");
    println!();

    let infos = backend.series_info();
    println!("Series: {}", infos.len());
    let mut total_values = 0u64;
    let mut total_bytes = 0u64;
    for info in &infos {
        let bounds = match (info.earliest, info.latest) {
            (Some(first), Some(last)) => format!("{first}..={last}"),
            _ => "empty".to_string(),
        };
        println!(
            "  - series {}: {} values, {bounds}, {} ({})",
            info.series_id,
            info.values,
            format_bytes(info.file_bytes),
            info.path.display()
        );
        total_values += info.values;
        total_bytes += info.file_bytes;
    }

    println!();
    println!("Total values: {total_values}");
    println!("Total log size: {} ({total_bytes} bytes)", format_bytes(total_bytes));
    Ok(())
}

/// Parsed arguments of `pointvault query`.
struct QueryRequest {
    series: Vec<SeriesId>,
    mode: QueryMode,
    from: Option<i64>,
    to: Option<i64>,
    before: Option<i64>,
    limit: Option<u32>,
    order_by_id: bool,
}

/// Implements `pointvault query <store_path> --series ...`.
fn cmd_query(
    store_path: &Path,
    request: &QueryRequest,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = MergeEngine::new(Arc::new(open_existing(store_path)?));

    let mut spec = QuerySpec::new(request.series.clone()).ordered_by_id(request.order_by_id);
    if let Some(limit) = request.limit {
        spec = spec.with_limit(limit);
    }

    let out = BufWriter::new(io::stdout().lock());
    let stats = match format {
        OutputFormat::Csv => {
            let mut sink = CsvSink::new(out)?;
            let stats = run_query(&engine, &spec, request, &mut sink)?;
            sink.finish()?.flush()?;
            stats
        }
        OutputFormat::Json => {
            let mut sink = JsonLinesSink::new(out);
            let stats = run_query(&engine, &spec, request, &mut sink)?;
            sink.finish()?.flush()?;
            stats
        }
    };

    tracing::info!(
        rows = stats.rows,
        bookends = stats.bookends,
        truncated = stats.truncated,
        "query complete"
    );
    Ok(())
}

fn run_query(
    engine: &MergeEngine,
    spec: &QuerySpec,
    request: &QueryRequest,
    sink: &mut dyn QuerySink,
) -> Result<QueryStats, Box<dyn std::error::Error>> {
    let cancel = Cancellation::new();
    let stats = match request.mode {
        QueryMode::Latest => {
            let before = request.before.unwrap_or(i64::MAX);
            engine.latest_values(spec, before, sink, &cancel)?
        }
        QueryMode::Range | QueryMode::Bookend => {
            let Some((from, to)) = resolve_window(engine, request)? else {
                // Nothing stored for these series and no window given.
                return Ok(QueryStats::default());
            };
            if matches!(request.mode, QueryMode::Range) {
                engine.range_values(spec, from, to, sink, &cancel)?
            } else {
                engine.bookend_query(spec, from, to, sink, &cancel)?
            }
        }
    };
    Ok(stats)
}

/// Fills in missing window ends from the stored time bounds.
fn resolve_window(
    engine: &MergeEngine,
    request: &QueryRequest,
) -> Result<Option<(i64, i64)>, Box<dyn std::error::Error>> {
    if let (Some(from), Some(to)) = (request.from, request.to) {
        return Ok(Some((from, to)));
    }
    let Some((earliest, latest)) = engine.time_bounds(&request.series)? else {
        return match (request.from, request.to) {
            (Some(from), None) => Ok(Some((from, from.saturating_add(1)))),
            (None, Some(to)) => Ok(Some((to.saturating_sub(1), to))),
            _ => Ok(None),
        };
    };
    let from = request.from.unwrap_or(earliest);
    let to = request.to.unwrap_or_else(|| latest.saturating_add(1));
    Ok(Some((from, to)))
}

/// One row of an ingest file.
#[derive(Debug, Deserialize)]
struct IngestRow {
    series_id: u32,
    timestamp_ms: i64,
    value: f64,
    #[serde(default)]
    annotation: Option<String>,
}

impl IngestRow {
    fn into_point(self) -> ValuePoint {
        let point = ValuePoint::numeric(SeriesId(self.series_id), self.timestamp_ms, self.value);
        match self.annotation {
            Some(text) if !text.is_empty() => point.with_annotation(text),
            _ => point,
        }
    }
}

/// Implements `pointvault ingest <store_path> <csv_path>`.
fn cmd_ingest(
    store_path: &Path,
    csv_path: &Path,
    use_async: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = PointValueStore::open(EngineConfig {
        backend: BackendConfig::Log {
            path: store_path.to_path_buf(),
            sync_writes: false,
        },
        ..EngineConfig::default()
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(File::open(csv_path)?);

    let start = Instant::now();
    let mut ingested = 0u64;
    for (line, record) in reader.deserialize::<IngestRow>().enumerate() {
        let row = record.map_err(|e| format!("{}: row {}: {e}", csv_path.display(), line + 1))?;
        let point = row.into_point();
        if use_async {
            store.writer().write_async(point)?;
        } else {
            store.writer().write_sync(&point)?;
        }
        ingested += 1;
    }
    store.flush()?;

    let snap = store.writer().metrics().snapshot();
    println!("Ingested {ingested} values in {:.3?}", start.elapsed());
    if snap.discarded > 0 || snap.dropped > 0 {
        println!(
            "  Lost: {} discarded by overflow, {} dropped after retries",
            snap.discarded, snap.dropped
        );
    }
    Ok(())
}

/// Implements `pointvault bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(points: u64, series_count: u32, mode: WriteMode) -> Result<(), Box<dyn std::error::Error>> {
    if series_count == 0 {
        return Err("--series must be at least 1".into());
    }
    let mode_name = match mode {
        WriteMode::Sync => "sync",
        WriteMode::Async => "async",
    };
    println!("pointvault write-path benchmark");
    println!("  Points: {points}");
    println!("  Series: {series_count}");
    println!("  Mode: {mode_name}");
    println!();

    let temp_dir = std::env::temp_dir().join("pointvault_bench");
    let _ = std::fs::remove_dir_all(&temp_dir);

    let store = PointValueStore::open(EngineConfig {
        backend: BackendConfig::Log {
            path: temp_dir.clone(),
            sync_writes: false,
        },
        writer: WriterConfig {
            // Keep every value: the benchmark measures throughput, not shedding.
            discard_threshold: usize::MAX,
            ..WriterConfig::default()
        },
    })?;

    println!("Writing {points} values across {series_count} series...");

    let base_time = 1_700_000_000_000i64;
    let points_per_series = points / u64::from(series_count);

    let start = Instant::now();
    let mut ts = base_time;
    for _ in 0..points_per_series {
        ts += 1_000;
        for i in 0..series_count {
            let point = ValuePoint::numeric(SeriesId(i), ts, f64::from(i));
            match mode {
                WriteMode::Sync => store.writer().write_sync(&point)?,
                WriteMode::Async => {
                    store.writer().write_async(point)?;
                }
            }
        }
    }
    let submitted = start.elapsed();
    store.flush()?;
    let elapsed = start.elapsed();

    let snap = store.writer().metrics().snapshot();
    let total_writes = points_per_series * u64::from(series_count);
    let ns_per_write = elapsed.as_nanos() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Submitted in: {submitted:.3?}");
    println!("  Persisted in: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Sync rate: {:.0} values/sec (totals {})", snap.sync_rate, snap.sync_total);
    println!("  Async rate: {:.0} values/sec (totals {})", snap.async_rate, snap.async_total);
    println!("  Retries: {}, dropped: {}", snap.retries, snap.dropped);
    println!();

    drop(store);
    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
