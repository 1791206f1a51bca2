//! In-memory backend: one ordered map per series.
//!
//! Every stored value carries the sequence number of the write that stored
//! it. Overwriting a timestamp appends to that timestamp's version chain
//! instead of replacing it, so a cursor keeps seeing the value that was
//! current at its snapshot. Versions no live snapshot can reach are pruned on
//! the next write to the same timestamp.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::cursor::{BatchSource, BatchedCursor, Direction, SeriesCursor, TimeRange};
use crate::error::Result;
use crate::value::{SeriesId, ValuePoint};

use super::StorageBackend;
use super::snapshot::{Snapshot, SnapshotClock, Versions};

type SeriesMap = BTreeMap<i64, Versions<ValuePoint>>;

/// Ordered in-memory storage.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    series: RwLock<HashMap<SeriesId, SeriesMap>>,
    clock: SnapshotClock,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timestamps stored for `series`.
    pub fn len(&self, series: SeriesId) -> usize {
        self.series.read().get(&series).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if no series holds data.
    pub fn is_empty(&self) -> bool {
        self.series.read().values().all(BTreeMap::is_empty)
    }

    /// Must be called with the series write lock held so sequence order
    /// matches the order values land in the map.
    fn store(&self, map: &mut HashMap<SeriesId, SeriesMap>, point: &ValuePoint) {
        let (seq, oldest_live) = self.clock.next_seq();
        let values = map.entry(point.series_id()).or_default();
        match values.get_mut(&point.timestamp()) {
            Some(versions) => versions.push(seq, point.clone(), oldest_live),
            None => {
                values.insert(point.timestamp(), Versions::new(seq, point.clone()));
            }
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn snapshot(&self) -> Snapshot {
        self.clock.pin()
    }

    fn open_cursor(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        self.open_cursor_at(series, range, direction, &self.snapshot())
    }

    fn open_cursor_at(
        &self,
        series: SeriesId,
        range: TimeRange,
        direction: Direction,
        snapshot: &Snapshot,
    ) -> Result<Box<dyn SeriesCursor + '_>> {
        let source = MemorySource {
            backend: self,
            series,
            snapshot: snapshot.clone(),
        };
        Ok(Box::new(BatchedCursor::new(
            source,
            series,
            self.name(),
            range,
            direction,
        )))
    }

    fn insert(&self, point: &ValuePoint) -> Result<()> {
        let mut map = self.series.write();
        self.store(&mut map, point);
        Ok(())
    }

    fn insert_batch(&self, points: &[ValuePoint]) -> Result<()> {
        let mut map = self.series.write();
        for point in points {
            self.store(&mut map, point);
        }
        Ok(())
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        let map = self.series.read();
        let mut ids: Vec<SeriesId> = map
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64> {
        let mut map = self.series.write();
        let Some(values) = map.get_mut(&series) else {
            return Ok(0);
        };
        let kept = values.split_off(&before);
        let removed = values.len() as u64;
        *values = kept;
        Ok(removed)
    }

    fn delete_series(&self, series: SeriesId) -> Result<u64> {
        let removed = self.series.write().remove(&series);
        Ok(removed.map_or(0, |values| values.len() as u64))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySource<'a> {
    backend: &'a MemoryBackend,
    series: SeriesId,
    /// Held for the cursor's lifetime so the versions it reads stay retained.
    snapshot: Snapshot,
}

impl BatchSource for MemorySource<'_> {
    fn fetch(
        &mut self,
        range: TimeRange,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<ValuePoint>> {
        let map = self.backend.series.read();
        let Some(values) = map.get(&self.series) else {
            return Ok(Vec::new());
        };
        let seq = self.snapshot.seq();
        let visible = |(_, versions): (&i64, &Versions<ValuePoint>)| versions.visible(seq).cloned();
        let batch = match direction {
            Direction::Ascending => values.range(range).filter_map(visible).take(max).collect(),
            Direction::Descending => values
                .range(range)
                .rev()
                .filter_map(visible)
                .take(max)
                .collect(),
        };
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(cursor: &mut dyn SeriesCursor) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(p) = cursor.next_point().unwrap() {
            out.push(p.timestamp());
        }
        out
    }

    fn backend_with(series: SeriesId, timestamps: &[i64]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for &ts in timestamps {
            backend
                .insert(&ValuePoint::numeric(series, ts, ts as f64))
                .unwrap();
        }
        backend
    }

    #[test]
    fn test_cursor_bounds_and_direction() {
        let backend = backend_with(SeriesId(1), &[10, 20, 30, 40]);

        let mut asc = backend
            .open_cursor(SeriesId(1), TimeRange::half_open(20, 40), Direction::Ascending)
            .unwrap();
        assert_eq!(drain(asc.as_mut()), vec![20, 30]);

        let mut desc = backend
            .open_cursor(SeriesId(1), TimeRange::at_or_before(30), Direction::Descending)
            .unwrap();
        assert_eq!(drain(desc.as_mut()), vec![30, 20, 10]);
    }

    #[test]
    fn test_unknown_series_is_empty() {
        let backend = backend_with(SeriesId(1), &[10]);
        let mut cursor = backend
            .open_cursor(SeriesId(9), TimeRange::all(), Direction::Ascending)
            .unwrap();
        assert!(cursor.next_point().unwrap().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let backend = MemoryBackend::new();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 10, 1.0))
            .unwrap();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 10, 2.0))
            .unwrap();
        assert_eq!(backend.len(SeriesId(1)), 1);

        let mut cursor = backend
            .open_cursor(SeriesId(1), TimeRange::all(), Direction::Ascending)
            .unwrap();
        let p = cursor.next_point().unwrap().unwrap();
        assert_eq!(p.value().as_f64(), Some(2.0));
    }

    #[test]
    fn test_open_cursor_keeps_overwritten_value() {
        let backend = MemoryBackend::new();
        for ts in [10, 20, 30] {
            backend
                .insert(&ValuePoint::numeric(SeriesId(1), ts, 1.0))
                .unwrap();
        }
        let mut cursor = backend
            .open_cursor(SeriesId(1), TimeRange::all(), Direction::Ascending)
            .unwrap();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 20, 5.0))
            .unwrap();

        let mut seen = Vec::new();
        while let Some(p) = cursor.next_point().unwrap() {
            seen.push((p.timestamp(), p.value().as_f64().unwrap()));
        }
        assert_eq!(seen, vec![(10, 1.0), (20, 1.0), (30, 1.0)]);
        drop(cursor);

        let mut fresh = backend
            .open_cursor(SeriesId(1), TimeRange::exactly(20), Direction::Ascending)
            .unwrap();
        let p = fresh.next_point().unwrap().unwrap();
        assert_eq!(p.value().as_f64(), Some(5.0));
    }

    #[test]
    fn test_shared_snapshot_spans_series_and_time() {
        let backend = backend_with(SeriesId(1), &[10]);
        let snapshot = backend.snapshot();
        backend
            .insert(&ValuePoint::numeric(SeriesId(2), 10, 0.0))
            .unwrap();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 10, 99.0))
            .unwrap();

        // Opened after both writes, yet neither is visible.
        let mut s2 = backend
            .open_cursor_at(SeriesId(2), TimeRange::all(), Direction::Ascending, &snapshot)
            .unwrap();
        assert!(s2.next_point().unwrap().is_none());
        let mut s1 = backend
            .open_cursor_at(SeriesId(1), TimeRange::all(), Direction::Ascending, &snapshot)
            .unwrap();
        let p = s1.next_point().unwrap().unwrap();
        assert_eq!(p.value().as_f64(), Some(10.0));
    }

    #[test]
    fn test_overwrites_pruned_once_snapshots_close() {
        let backend = backend_with(SeriesId(1), &[10]);
        let snapshot = backend.snapshot();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 10, 1.0))
            .unwrap();
        let retained = |b: &MemoryBackend| b.series.read()[&SeriesId(1)][&10_i64].retained();
        assert_eq!(retained(&backend), 2);

        drop(snapshot);
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 10, 2.0))
            .unwrap();
        assert_eq!(retained(&backend), 1);
        assert_eq!(backend.len(SeriesId(1)), 1);
    }

    #[test]
    fn test_snapshot_hides_later_inserts() {
        let backend = backend_with(SeriesId(1), &[10, 20]);
        let mut cursor = backend
            .open_cursor(SeriesId(1), TimeRange::all(), Direction::Ascending)
            .unwrap();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 15, 0.0))
            .unwrap();
        backend
            .insert(&ValuePoint::numeric(SeriesId(1), 30, 0.0))
            .unwrap();
        assert_eq!(drain(cursor.as_mut()), vec![10, 20]);
    }

    #[test]
    fn test_delete_before_and_series() {
        let backend = backend_with(SeriesId(1), &[10, 20, 30]);
        assert_eq!(backend.delete_before(SeriesId(1), 25).unwrap(), 2);
        assert_eq!(backend.len(SeriesId(1)), 1);
        assert_eq!(backend.delete_before(SeriesId(7), 25).unwrap(), 0);

        assert_eq!(backend.series_ids().unwrap(), vec![SeriesId(1)]);
        assert_eq!(backend.delete_series(SeriesId(1)).unwrap(), 1);
        assert!(backend.series_ids().unwrap().is_empty());
        assert!(backend.is_empty());
    }
}
