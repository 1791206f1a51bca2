//! Write coordinator behaviour: visibility, rates, backpressure, retries.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use pointvault::error::WriteError;
use pointvault::write::{FailureReason, WriteEventListener};
use pointvault::{
    Direction, EngineConfig, OverflowPolicy, PointValueStore, PointVaultError, SeriesId,
    StorageBackend, TimeRange, ValuePoint, WriteCoordinator, WriteEvent, WriteState, WriterConfig,
};

fn quick_retries() -> WriterConfig {
    WriterConfig {
        workers: 1,
        batch_size: 1,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        ..WriterConfig::default()
    }
}

fn recording_listener() -> (WriteEventListener, Arc<Mutex<Vec<WriteEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: WriteEventListener = Arc::new(move |event: &WriteEvent| {
        sink.lock().push(event.clone());
    });
    (listener, events)
}

#[test]
fn test_sync_write_visible_from_another_thread() {
    let store = Arc::new(PointValueStore::open(EngineConfig::default()).unwrap());
    let (tx, rx) = mpsc::channel();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for ts in 0..100 {
                let point = ValuePoint::numeric(SeriesId(9), ts, ts as f64);
                store.writer().write_sync(&point).unwrap();
                tx.send(ts).unwrap();
            }
        })
    };
    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for ts in rx {
                let found = store.engine().value_at(SeriesId(9), ts).unwrap();
                assert_eq!(found.map(|p| p.timestamp()), Some(ts));
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_sync_and_async_rates_are_independent() {
    let store = PointValueStore::open(EngineConfig::default()).unwrap();
    for ts in 0..30 {
        store
            .writer()
            .write_sync(&ValuePoint::numeric(SeriesId(1), ts, 0.0))
            .unwrap();
    }
    for ts in 0..6 {
        store
            .writer()
            .write_async(ValuePoint::numeric(SeriesId(2), ts, 0.0))
            .unwrap();
    }
    store.flush().unwrap();

    let snap = store.writer().metrics().snapshot();
    assert_eq!(snap.sync_total, 30);
    assert_eq!(snap.async_total, 6);
    assert!(snap.sync_rate > snap.async_rate);
    assert!(snap.async_rate > 0.0);
    assert_eq!(snap.queued, 0);
}

#[test]
fn test_discard_oldest_with_warning_hysteresis() {
    let backend = Arc::new(GatedBackend::new());
    let (listener, events) = recording_listener();
    let writer = WriteCoordinator::with_listener(
        backend.clone(),
        WriterConfig {
            workers: 1,
            batch_size: 1,
            warning_threshold: 4,
            dewarning_threshold: 2,
            discard_threshold: 6,
            size_check_interval: Duration::ZERO,
            overflow_policy: OverflowPolicy::DiscardOldest,
            ..WriterConfig::default()
        },
        listener,
    )
    .unwrap();

    // Hold the worker inside its first batch.
    let first = writer
        .write_async(ValuePoint::numeric(SeriesId(1), 0, 0.0))
        .unwrap();
    backend.wait_entered(1);

    let tickets: Vec<_> = (1..20)
        .map(|ts| {
            writer
                .write_async(ValuePoint::numeric(SeriesId(1), ts, 0.0))
                .unwrap()
        })
        .collect();
    assert_eq!(writer.queue_depths(), vec![6]);
    assert_eq!(writer.metrics().snapshot().discarded, 13);

    backend.open_gate();
    writer.flush();

    assert_eq!(first.state(), WriteState::Acknowledged);
    for ticket in &tickets[..13] {
        assert_eq!(ticket.state(), WriteState::Failed(FailureReason::Discarded));
    }
    for ticket in &tickets[13..] {
        assert_eq!(ticket.state(), WriteState::Acknowledged);
    }
    // The survivors are the newest values.
    let stored: Vec<i64> = (0..20).filter(|ts| is_stored(&backend, *ts)).collect();
    assert_eq!(stored, vec![0, 14, 15, 16, 17, 18, 19]);

    let events = events.lock().clone();
    assert_eq!(events[0], WriteEvent::QueueWarning { shard: 0, queued: 5 });
    assert_eq!(
        events[1..14].to_vec(),
        vec![
            WriteEvent::Discarded {
                shard: 0,
                count: 1,
                queued: 6
            };
            13
        ]
    );
    assert_eq!(
        events[14],
        WriteEvent::QueueWarningCleared { shard: 0, queued: 2 }
    );
    assert_eq!(events.len(), 15);
}

fn is_stored(backend: &GatedBackend, ts: i64) -> bool {
    let mut cursor = backend
        .open_cursor(SeriesId(1), TimeRange::exactly(ts), Direction::Ascending)
        .unwrap();
    cursor.next_point().unwrap().is_some()
}

#[test]
fn test_block_policy_makes_producers_wait() {
    let backend = Arc::new(GatedBackend::new());
    let writer = Arc::new(
        WriteCoordinator::new(
            backend.clone(),
            WriterConfig {
                workers: 1,
                batch_size: 1,
                warning_threshold: 2,
                dewarning_threshold: 1,
                discard_threshold: 3,
                overflow_policy: OverflowPolicy::Block,
                ..WriterConfig::default()
            },
        )
        .unwrap(),
    );

    writer
        .write_async(ValuePoint::numeric(SeriesId(1), 0, 0.0))
        .unwrap();
    backend.wait_entered(1);
    for ts in 1..=3 {
        writer
            .write_async(ValuePoint::numeric(SeriesId(1), ts, 0.0))
            .unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let writer = Arc::clone(&writer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let ticket = writer
                .write_async(ValuePoint::numeric(SeriesId(1), 4, 0.0))
                .unwrap();
            done.store(true, Ordering::SeqCst);
            ticket
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "producer should be blocked");

    backend.open_gate();
    let ticket = producer.join().unwrap();
    assert_eq!(ticket.wait(), WriteState::Acknowledged);
    writer.flush();
    assert_eq!(backend.inner.len(SeriesId(1)), 5);
    assert_eq!(writer.metrics().snapshot().discarded, 0);
}

#[test]
fn test_retry_then_drop_is_reported() {
    let backend = Arc::new(FaultyBackend::new().failing_batches(u32::MAX));
    let (listener, events) = recording_listener();
    let writer = WriteCoordinator::with_listener(backend.clone(), quick_retries(), listener).unwrap();

    let ticket = writer
        .write_async(ValuePoint::numeric(SeriesId(3), 10, 1.0))
        .unwrap();
    match ticket.wait() {
        WriteState::Failed(FailureReason::Dropped { attempts, error }) => {
            assert_eq!(attempts, 3);
            assert!(error.contains("injected batch failure"));
        }
        other => panic!("Expected Dropped, got: {other:?}"),
    }
    writer.flush();

    let snap = writer.metrics().snapshot();
    assert_eq!(snap.dropped, 1);
    assert_eq!(snap.retries, 2);
    assert_eq!(backend.batch_calls.load(Ordering::SeqCst), 3);
    assert!(matches!(
        events.lock().as_slice(),
        [WriteEvent::WriteDropped { count: 1, attempts: 3, .. }]
    ));
}

#[test]
fn test_transient_failure_recovers_on_retry() {
    let backend = Arc::new(FaultyBackend::new().failing_batches(2));
    let writer = WriteCoordinator::new(backend.clone(), quick_retries()).unwrap();

    let ticket = writer
        .write_async(ValuePoint::numeric(SeriesId(3), 10, 1.0))
        .unwrap();
    assert_eq!(ticket.wait(), WriteState::Acknowledged);

    let snap = writer.metrics().snapshot();
    assert_eq!(snap.retries, 2);
    assert_eq!(snap.dropped, 0);
    assert_eq!(backend.inner.len(SeriesId(3)), 1);
}

#[test]
fn test_per_series_order_preserved_across_shards() {
    let store = PointValueStore::open(EngineConfig {
        writer: WriterConfig {
            workers: 4,
            batch_size: 7,
            ..WriterConfig::default()
        },
        ..EngineConfig::default()
    })
    .unwrap();

    // Same timestamp written repeatedly: the last submission must win.
    for round in 0..50 {
        for series in 0..8 {
            store
                .writer()
                .write_async(ValuePoint::numeric(SeriesId(series), 1_000, f64::from(round)))
                .unwrap();
        }
    }
    store.flush().unwrap();
    for series in 0..8 {
        let point = store.engine().value_at(SeriesId(series), 1_000).unwrap().unwrap();
        assert_eq!(point.value().as_f64(), Some(49.0));
    }
}

#[test]
fn test_shutdown_rejects_async_but_allows_sync() {
    let store = PointValueStore::open(EngineConfig::default()).unwrap();
    store.writer().shutdown();
    match store
        .writer()
        .write_async(ValuePoint::numeric(SeriesId(1), 0, 0.0))
        .unwrap_err()
    {
        PointVaultError::Write(WriteError::ShutDown) => {}
        other => panic!("Expected ShutDown, got: {other:?}"),
    }
    store
        .writer()
        .write_sync(&ValuePoint::numeric(SeriesId(1), 0, 0.0))
        .unwrap();
    assert!(store.engine().latest_value(SeriesId(1)).unwrap().is_some());
}

#[test]
fn test_sync_validation_failure_skips_backend() {
    let backend: Arc<dyn StorageBackend> = Arc::new(FaultyBackend::new());
    let writer = WriteCoordinator::new(backend, WriterConfig::default()).unwrap();
    let err = writer
        .write_sync(&ValuePoint::numeric(SeriesId(1), 0, f64::INFINITY))
        .unwrap_err();
    assert!(matches!(err, PointVaultError::Write(WriteError::InvalidValue { .. })));
    // Validation failures never reach the backend.
    assert_eq!(writer.metrics().snapshot().failed_sync, 0);
}
