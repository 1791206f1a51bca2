//! The log backend end to end: persistence, recovery, and parity with the
//! memory backend.

mod common;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use common::*;
use pointvault::backend::{LogBackend, MemoryBackend};
use pointvault::value::{ImageFormat, ImageRef};
use pointvault::{
    BackendConfig, Cancellation, CollectingSink, DataValue, EngineConfig, MergeEngine,
    PointValueStore, QuerySpec, SeriesId, StorageBackend, ValuePoint,
};
use tempfile::tempdir;

fn open_store(path: &Path) -> PointValueStore {
    PointValueStore::open(EngineConfig {
        backend: BackendConfig::Log {
            path: path.to_path_buf(),
            sync_writes: false,
        },
        ..EngineConfig::default()
    })
    .unwrap()
}

#[test]
fn test_every_value_kind_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store");
    let points = vec![
        ValuePoint::new(SeriesId(1), 10, DataValue::Numeric(-0.25)),
        ValuePoint::new(SeriesId(1), 20, DataValue::Binary(true)).with_annotation("tripped"),
        ValuePoint::new(SeriesId(1), 30, DataValue::Multistate(-7)),
        ValuePoint::new(SeriesId(1), 40, DataValue::Alphanumeric("pump ünits".to_string())),
        ValuePoint::new(
            SeriesId(1),
            50,
            DataValue::Image(ImageRef {
                id: 991,
                format: ImageFormat::Png,
            }),
        )
        .with_annotation(""),
    ];
    {
        let store = open_store(&path);
        for point in &points {
            store.writer().write_sync(point).unwrap();
        }
    }

    let store = open_store(&path);
    let mut sink = CollectingSink::new();
    store
        .engine()
        .range_values(
            &QuerySpec::new(vec![SeriesId(1)]),
            0,
            100,
            &mut sink,
            &Cancellation::new(),
        )
        .unwrap();
    let read: Vec<ValuePoint> = sink.rows().cloned().collect();
    assert_eq!(read, points);
}

#[test]
fn test_last_write_wins_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store");
    {
        let store = open_store(&path);
        for v in 0..5 {
            store
                .writer()
                .write_sync(&ValuePoint::numeric(SeriesId(2), 1_000, f64::from(v)))
                .unwrap();
        }
    }
    let store = open_store(&path);
    let point = store.engine().value_at(SeriesId(2), 1_000).unwrap().unwrap();
    assert_eq!(point.value(), &DataValue::Numeric(4.0));
    assert_eq!(store.engine().count_between(&[SeriesId(2)], 0, 2_000).unwrap(), 1);
}

#[test]
fn test_torn_tail_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store");
    {
        let store = open_store(&path);
        for ts in 0..10 {
            store
                .writer()
                .write_sync(&ValuePoint::numeric(SeriesId(7), ts, 1.0))
                .unwrap();
        }
    }

    // A length prefix promising a body that never made it to disk.
    let log = path.join("series_7.log");
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[64, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(file);

    let store = open_store(&path);
    assert_eq!(store.engine().count_between(&[SeriesId(7)], 0, 100).unwrap(), 10);
    store
        .writer()
        .write_sync(&ValuePoint::numeric(SeriesId(7), 10, 2.0))
        .unwrap();
    drop(store);

    let store = open_store(&path);
    assert_eq!(store.engine().count_between(&[SeriesId(7)], 0, 100).unwrap(), 11);
    assert_eq!(
        store.engine().latest_value(SeriesId(7)).unwrap().unwrap().timestamp(),
        10
    );
}

#[test]
fn test_purge_persists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store");
    {
        let store = open_store(&path);
        for ts in 0..100 {
            store
                .writer()
                .write_async(ValuePoint::numeric(SeriesId(4), ts, 0.0))
                .unwrap();
        }
        assert_eq!(store.delete_before(SeriesId(4), 60).unwrap(), 60);
        store
            .writer()
            .write_sync(&ValuePoint::numeric(SeriesId(5), 0, 0.0))
            .unwrap();
        assert_eq!(store.delete_series(SeriesId(5)).unwrap(), 1);
    }

    let backend = LogBackend::open(&path, false).unwrap();
    assert_eq!(backend.series_ids().unwrap(), vec![SeriesId(4)]);
    let info = backend.series_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].values, 40);
    assert_eq!(info[0].earliest, Some(60));
    assert_eq!(info[0].latest, Some(99));
    assert!(!path.join("series_5.log").exists());
}

#[test]
fn test_log_and_memory_backends_agree() {
    let dir = tempdir().unwrap();
    let log: Arc<dyn StorageBackend> = Arc::new(LogBackend::open(dir.path(), false).unwrap());
    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    load_reference(log.as_ref());
    load_reference(memory.as_ref());
    let engines = [MergeEngine::new(log), MergeEngine::new(memory)];

    let spec = QuerySpec::new(vec![S2, S1]).with_limit(700);
    let grouped = spec.clone().ordered_by_id(true);
    let from = START - 2 * INTERVAL - 1;
    let to = sample(400) + 1;

    let run = |engine: &MergeEngine| {
        let cancel = Cancellation::new();
        let mut sinks = vec![CollectingSink::new(); 4];
        engine.bookend_query(&spec, from, to, &mut sinks[0], &cancel).unwrap();
        engine.bookend_query(&grouped, from, to, &mut sinks[1], &cancel).unwrap();
        engine.latest_values(&spec, to, &mut sinks[2], &cancel).unwrap();
        engine.range_values(&grouped, from, to, &mut sinks[3], &cancel).unwrap();
        sinks
            .into_iter()
            .map(CollectingSink::into_emissions)
            .collect::<Vec<_>>()
    };
    let [log_engine, memory_engine] = &engines;
    let from_log = run(log_engine);
    let from_memory = run(memory_engine);
    assert_eq!(from_log, from_memory);
    // One start value (series 1 has none yet), the limited body, two ends.
    assert_eq!(from_log[0].len(), 1 + 700 + 2);
}
