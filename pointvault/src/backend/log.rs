//! On-disk backend: one append-only log file per series.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── meta.json          <- Manifest: format version and known series
//! ├── series_1.log       <- Header + records for series 1
//! ├── series_2.log
//! └── ...
//! ```
//!
//! Each log starts with an 8-byte header (`PVLG`, version) followed by
//! length-prefixed records in append order. Writing a timestamp that already
//! exists appends a new record and pushes its offset onto that timestamp's
//! version chain in the in-memory index. Older records stay reachable while a
//! live snapshot may still read them and are garbage after that, until the
//! next purge rewrites the file.
//!
//! # Recovery
//!
//! The `timestamp -> offset` index is rebuilt by scanning each log on open. A
//! record cut short by a crash is truncated away; a complete but malformed
//! record is reported as [`StorageError::CorruptedLog`]. If a failed append
//! cannot be rolled back, the stray bytes are cut off before the next append
//! and that append fails if they still cannot be.
//!
//! # Cursors
//!
//! A cursor maps the log read-only when it opens and reads the version of each
//! timestamp visible in its [`Snapshot`]. A purge replaces the file and bumps
//! the series generation, after which open cursors fail with
//! [`StorageError::SnapshotInvalidated`].

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cursor::{BatchSource, BatchedCursor, Direction, SeriesCursor, TimeRange};
use crate::error::{Result, StorageError};
use crate::value::{SeriesId, ValuePoint};

use super::StorageBackend;
use super::codec::{self, Decoded, HEADER_SIZE};
use super::snapshot::{Snapshot, SnapshotClock, Versions};

/// Manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// Name of the manifest file in the store directory.
const MANIFEST_FILE: &str = "meta.json";

/// Contents of `meta.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    /// Manifest format version.
    version: u32,
    /// Series with a log file, ascending.
    series: Vec<SeriesId>,
}

/// Summary of one series log, for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLogInfo {
    /// The series.
    pub series_id: SeriesId,
    /// Path of the log file.
    pub path: PathBuf,
    /// Number of live values.
    pub values: u64,
    /// Size of the log file in bytes, garbage records included.
    pub file_bytes: u64,
    /// Oldest stored timestamp.
    pub earliest: Option<i64>,
    /// Newest stored timestamp.
    pub latest: Option<i64>,
}

/// Append-only log storage.
///
/// # Thread Safety
///
/// Each series log has its own lock. Writers to different series never
/// contend; cursors only take a series' read lock while fetching a batch of
/// offsets. Sequence numbers come from one clock shared by every series, so a
/// [`Snapshot`] is a consistent cut across the whole store.
#[derive(Debug)]
pub struct LogBackend {
    /// Path to the store directory.
    path: PathBuf,
    /// Whether every append is followed by `fsync`.
    sync_writes: bool,
    /// Open series logs.
    series: RwLock<HashMap<SeriesId, Arc<RwLock<SeriesLog>>>>,
    clock: SnapshotClock,
}

#[derive(Debug)]
struct SeriesLog {
    id: SeriesId,
    path: PathBuf,
    /// Handle opened for reading and appending.
    file: File,
    /// Logical length; everything below it is complete records.
    len: u64,
    /// Record offsets of each timestamp, newest last.
    index: BTreeMap<i64, Versions<u64>>,
    /// Bumped whenever the file is replaced or removed.
    generation: u64,
    /// Set when bytes past `len` could not be truncated after a failed append.
    dirty_tail: bool,
}

impl LogBackend {
    /// Opens the store at `path`, creating it if it has no manifest yet.
    ///
    /// Opening an existing store rebuilds every series index and truncates
    /// torn records left by a crash.
    ///
    /// # Errors
    ///
    /// - [`StorageError::DirectoryAccess`] if the directory cannot be created
    ///   or the manifest cannot be read or written
    /// - [`StorageError::CorruptedMetadata`] if the manifest version is
    ///   unsupported
    /// - [`StorageError::CorruptedLog`] if a log holds a malformed record
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use pointvault::backend::{LogBackend, StorageBackend};
    /// use pointvault::value::{SeriesId, ValuePoint};
    ///
    /// let backend = LogBackend::open("./data", false)?;
    /// backend.insert(&ValuePoint::numeric(SeriesId(1), 1_700_000_000_000, 21.5))?;
    /// # Ok::<(), pointvault::PointVaultError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.join(MANIFEST_FILE).exists() {
            Self::open_existing(path, sync_writes)
        } else {
            Self::create_new(path, sync_writes)
        }
    }

    fn create_new(path: PathBuf, sync_writes: bool) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| StorageError::DirectoryAccess {
            path: path.clone(),
            source: e,
        })?;
        let backend = Self {
            path,
            sync_writes,
            series: RwLock::new(HashMap::new()),
            clock: SnapshotClock::new(),
        };
        backend.save_manifest(&HashMap::new())?;
        tracing::debug!(path = %backend.path.display(), "created log store");
        Ok(backend)
    }

    fn open_existing(path: PathBuf, sync_writes: bool) -> Result<Self> {
        let manifest_path = path.join(MANIFEST_FILE);
        let manifest_json =
            fs::read_to_string(&manifest_path).map_err(|e| StorageError::DirectoryAccess {
                path: manifest_path.clone(),
                source: e,
            })?;
        let manifest: StoreManifest =
            serde_json::from_str(&manifest_json).map_err(StorageError::MetadataSerialize)?;

        if manifest.version != MANIFEST_VERSION {
            return Err(StorageError::CorruptedMetadata {
                reason: format!(
                    "unsupported manifest version: expected {}, found {}",
                    MANIFEST_VERSION, manifest.version
                ),
            }
            .into());
        }

        let mut series = HashMap::with_capacity(manifest.series.len());
        for id in manifest.series {
            let log_path = log_path(&path, id);
            let log = if log_path.exists() {
                SeriesLog::open(id, log_path)?
            } else {
                tracing::warn!(series = %id, path = %log_path.display(), "series log missing, starting empty");
                SeriesLog::create(id, log_path, sync_writes)?
            };
            series.insert(id, Arc::new(RwLock::new(log)));
        }

        tracing::debug!(
            path = %path.display(),
            series = series.len(),
            "opened log store"
        );
        Ok(Self {
            path,
            sync_writes,
            series: RwLock::new(series),
            clock: SnapshotClock::new(),
        })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Summaries of every series log, ascending by series.
    pub fn series_info(&self) -> Vec<SeriesLogInfo> {
        let map = self.series.read();
        let mut infos: Vec<SeriesLogInfo> = map
            .values()
            .map(|state| {
                let log = state.read();
                SeriesLogInfo {
                    series_id: log.id,
                    path: log.path.clone(),
                    values: log.index.len() as u64,
                    file_bytes: log.len,
                    earliest: log.index.keys().next().copied(),
                    latest: log.index.keys().next_back().copied(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.series_id);
        infos
    }

    fn save_manifest(&self, series: &HashMap<SeriesId, Arc<RwLock<SeriesLog>>>) -> Result<()> {
        let mut ids: Vec<SeriesId> = series.keys().copied().collect();
        ids.sort_unstable();
        let manifest = StoreManifest {
            version: MANIFEST_VERSION,
            series: ids,
        };
        let manifest_path = self.path.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_string_pretty(&manifest).map_err(StorageError::MetadataSerialize)?;
        fs::write(&manifest_path, manifest_json).map_err(|e| StorageError::DirectoryAccess {
            path: manifest_path,
            source: e,
        })?;
        Ok(())
    }

    fn existing(&self, id: SeriesId) -> Option<Arc<RwLock<SeriesLog>>> {
        self.series.read().get(&id).cloned()
    }

    fn get_or_create(&self, id: SeriesId) -> Result<Arc<RwLock<SeriesLog>>> {
        if let Some(state) = self.existing(id) {
            return Ok(state);
        }
        let mut map = self.series.write();
        if let Some(state) = map.get(&id) {
            return Ok(Arc::clone(state));
        }
        let log = SeriesLog::create(id, log_path(&self.path, id), self.sync_writes)?;
        let state = Arc::new(RwLock::new(log));
        map.insert(id, Arc::clone(&state));
        if let Err(e) = self.save_manifest(&map) {
            map.remove(&id);
            return Err(e);
        }
        tracing::debug!(series = %id, "created series log");
        Ok(state)
    }
}

impl StorageBackend for LogBackend {
    fn name(&self) -> &'static str {
        "log"
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
        let Some(state) = self.existing(series) else {
            return Ok(Box::new(BatchedCursor::new(
                EmptySource,
                series,
                self.name(),
                range,
                direction,
            )));
        };
        // Every version this snapshot can see was appended under the series
        // lock before the mapping is taken, so it lies inside the mapping.
        let (map, generation) = {
            let log = state.read();
            (map_file(&log.file, &log.path)?, log.generation)
        };
        let source = LogSource {
            state,
            map,
            generation,
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
        let mut buf = Vec::with_capacity(64);
        codec::encode_record(point, &mut buf)?;
        let state = self.get_or_create(point.series_id())?;
        state.write().append(
            &buf,
            &[(point.timestamp(), 0)],
            self.sync_writes,
            &self.clock,
        )
    }

    fn insert_batch(&self, points: &[ValuePoint]) -> Result<()> {
        // Encode everything first so one unencodable value rejects the batch
        // before any series is touched.
        let mut pending: BTreeMap<SeriesId, (Vec<u8>, Vec<(i64, u64)>)> = BTreeMap::new();
        for point in points {
            let (buf, entries) = pending.entry(point.series_id()).or_default();
            let rel = buf.len() as u64;
            codec::encode_record(point, buf)?;
            entries.push((point.timestamp(), rel));
        }
        for (id, (buf, entries)) in pending {
            let state = self.get_or_create(id)?;
            state
                .write()
                .append(&buf, &entries, self.sync_writes, &self.clock)?;
        }
        Ok(())
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        let map = self.series.read();
        let mut ids: Vec<SeriesId> = map
            .iter()
            .filter(|(_, state)| !state.read().index.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete_before(&self, series: SeriesId, before: i64) -> Result<u64> {
        let Some(state) = self.existing(series) else {
            return Ok(0);
        };
        let mut log = state.write();
        let removed = log.index.range(..before).count() as u64;
        if removed > 0 {
            log.rewrite(before, self.clock.oldest_live())?;
            tracing::debug!(series = %series, removed, before, "purged series log");
        }
        Ok(removed)
    }

    fn delete_series(&self, series: SeriesId) -> Result<u64> {
        let mut map = self.series.write();
        let Some(state) = map.remove(&series) else {
            return Ok(0);
        };
        if let Err(e) = self.save_manifest(&map) {
            map.insert(series, state);
            return Err(e);
        }
        drop(map);

        let mut log = state.write();
        log.generation += 1;
        let removed = log.index.len() as u64;
        log.index.clear();
        fs::remove_file(&log.path).map_err(|e| StorageError::WriteFailed {
            path: log.path.clone(),
            offset: 0,
            source: e,
        })?;
        tracing::debug!(series = %series, removed, "deleted series log");
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        let states: Vec<_> = self.series.read().values().cloned().collect();
        for state in states {
            let log = state.read();
            log.file
                .sync_data()
                .map_err(|e| StorageError::SyncFailed {
                    path: log.path.clone(),
                    source: e,
                })?;
        }
        Ok(())
    }
}

impl SeriesLog {
    /// Creates an empty log, replacing any file already at `path`.
    fn create(id: SeriesId, path: PathBuf, sync: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::WriteFailed {
                path: path.clone(),
                offset: 0,
                source: e,
            })?;
        Self::write_header(&mut file, &path, sync)?;
        Ok(Self {
            id,
            path,
            file,
            len: HEADER_SIZE as u64,
            index: BTreeMap::new(),
            generation: 0,
            dirty_tail: false,
        })
    }

    fn write_header(file: &mut File, path: &Path, sync: bool) -> Result<()> {
        let write_failed = |e| StorageError::WriteFailed {
            path: path.to_path_buf(),
            offset: 0,
            source: e,
        };
        file.set_len(0).map_err(write_failed)?;
        file.write_all(&codec::encode_header())
            .map_err(write_failed)?;
        if sync {
            file.sync_data().map_err(|e| StorageError::SyncFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Opens an existing log, rebuilding its index and dropping a torn tail.
    fn open(id: SeriesId, path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::ReadFailed {
                path: path.clone(),
                offset: 0,
                source: e,
            })?;
        let file_len = file
            .metadata()
            .map_err(|e| StorageError::ReadFailed {
                path: path.clone(),
                offset: 0,
                source: e,
            })?
            .len();

        if file_len < HEADER_SIZE as u64 {
            tracing::warn!(series = %id, path = %path.display(), file_len, "log header incomplete, resetting");
            Self::write_header(&mut file, &path, true)?;
            return Ok(Self {
                id,
                path,
                file,
                len: HEADER_SIZE as u64,
                index: BTreeMap::new(),
                generation: 0,
                dirty_tail: false,
            });
        }

        let (index, valid_len) = {
            let map = map_file(&file, &path)?;
            codec::check_header(&map).map_err(|reason| StorageError::CorruptedLog {
                path: path.clone(),
                offset: 0,
                reason,
            })?;
            scan(&map, id, &path)?
        };

        if valid_len < file_len {
            tracing::warn!(
                series = %id,
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn record at end of log"
            );
            file.set_len(valid_len)
                .map_err(|e| StorageError::WriteFailed {
                    path: path.clone(),
                    offset: valid_len,
                    source: e,
                })?;
        }

        tracing::debug!(series = %id, values = index.len(), "recovered series log");
        Ok(Self {
            id,
            path,
            file,
            len: valid_len,
            index,
            generation: 0,
            dirty_tail: false,
        })
    }

    /// Appends encoded records. `entries` maps timestamps to offsets relative
    /// to the start of `buf`.
    ///
    /// A failed append leaves the index unchanged and cuts the file back to
    /// its logical length, or marks the tail for cutting before the next
    /// append if that fails too. Each appended record takes its sequence
    /// number from `clock` while the series lock is held.
    fn append(
        &mut self,
        buf: &[u8],
        entries: &[(i64, u64)],
        sync: bool,
        clock: &SnapshotClock,
    ) -> Result<()> {
        self.clear_dirty_tail()?;
        let offset = self.len;
        if let Err(e) = self.file.write_all(buf) {
            self.roll_back(offset);
            return Err(StorageError::WriteFailed {
                path: self.path.clone(),
                offset,
                source: e,
            }
            .into());
        }
        if sync && let Err(e) = self.file.sync_data() {
            self.roll_back(offset);
            return Err(StorageError::SyncFailed {
                path: self.path.clone(),
                source: e,
            }
            .into());
        }
        for &(ts, rel) in entries {
            let (seq, oldest_live) = clock.next_seq();
            match self.index.get_mut(&ts) {
                Some(versions) => versions.push(seq, offset + rel, oldest_live),
                None => {
                    self.index.insert(ts, Versions::new(seq, offset + rel));
                }
            }
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Cuts the file back to `offset` after a failed append.
    fn roll_back(&mut self, offset: u64) {
        if let Err(e) = self.file.set_len(offset) {
            tracing::error!(
                series = %self.id,
                path = %self.path.display(),
                offset,
                error = %e,
                "failed to roll back partial append"
            );
            self.dirty_tail = true;
        }
    }

    /// Drops bytes left past the logical length by an earlier failed
    /// rollback. The file is opened for append, so any stray tail would
    /// otherwise shift every later record away from its indexed offset.
    fn clear_dirty_tail(&mut self) -> Result<()> {
        if !self.dirty_tail {
            return Ok(());
        }
        self.file
            .set_len(self.len)
            .map_err(|e| StorageError::WriteFailed {
                path: self.path.clone(),
                offset: self.len,
                source: e,
            })?;
        self.dirty_tail = false;
        tracing::info!(series = %self.id, len = self.len, "repaired log tail");
        Ok(())
    }

    /// Rewrites the log keeping only records with timestamp `>= keep_from`.
    ///
    /// Versions still visible to a snapshot at `oldest_live` are carried over
    /// with their sequence numbers, so snapshots taken before the purge keep
    /// reading the values they saw for the timestamps that survive it.
    fn rewrite(&mut self, keep_from: i64, oldest_live: Option<u64>) -> Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");
        let mut buf = codec::encode_header().to_vec();
        let mut index: BTreeMap<i64, Versions<u64>> = BTreeMap::new();
        {
            let map = map_file(&self.file, &self.path)?;
            for (&ts, versions) in self.index.range_mut(keep_from..) {
                versions.prune(oldest_live);
                for (seq, &offset) in versions.iter() {
                    let start = usize::try_from(offset).unwrap_or(usize::MAX);
                    let len = codec::record_len(&map, start).ok_or_else(|| {
                        StorageError::CorruptedLog {
                            path: self.path.clone(),
                            offset,
                            reason: "indexed record runs past end of file".to_string(),
                        }
                    })?;
                    let moved = buf.len() as u64;
                    match index.get_mut(&ts) {
                        Some(kept) => kept.push_retained(seq, moved),
                        None => {
                            index.insert(ts, Versions::new(seq, moved));
                        }
                    }
                    buf.extend_from_slice(&map[start..start + len]);
                }
            }
        }

        let write_failed = |path: &Path, e| StorageError::WriteFailed {
            path: path.to_path_buf(),
            offset: 0,
            source: e,
        };
        let mut tmp = File::create(&tmp_path).map_err(|e| write_failed(&tmp_path, e))?;
        tmp.write_all(&buf).map_err(|e| write_failed(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| StorageError::SyncFailed {
            path: tmp_path.clone(),
            source: e,
        })?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).map_err(|e| write_failed(&self.path, e))?;

        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| write_failed(&self.path, e))?;
        self.len = buf.len() as u64;
        self.index = index;
        self.generation += 1;
        self.dirty_tail = false;
        Ok(())
    }
}

fn log_path(dir: &Path, id: SeriesId) -> PathBuf {
    dir.join(format!("series_{id}.log"))
}

fn map_file(file: &File, path: &Path) -> Result<Mmap> {
    // SAFETY: log files are only ever appended to while open. Bytes below the
    // logical length are never modified in place, and purges swap in a new
    // file by rename, so existing mappings keep reading the old inode.
    let map = unsafe {
        Mmap::map(file).map_err(|e| StorageError::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    Ok(map)
}

/// Walks the records after the header and returns the index plus the length
/// of the valid prefix.
///
/// Only the newest record of each timestamp is indexed, at sequence number 0
/// so every snapshot sees it.
fn scan(buf: &[u8], id: SeriesId, path: &Path) -> Result<(BTreeMap<i64, Versions<u64>>, u64)> {
    let mut index = BTreeMap::new();
    let mut offset = HEADER_SIZE;
    while offset < buf.len() {
        match codec::decode_record(buf, offset, id) {
            Ok(Decoded::Record { point, len }) => {
                index.insert(point.timestamp(), Versions::new(0, offset as u64));
                offset += len;
            }
            Ok(Decoded::Torn) => break,
            Err(reason) => {
                return Err(StorageError::CorruptedLog {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason,
                }
                .into());
            }
        }
    }
    Ok((index, offset as u64))
}

struct EmptySource;

impl BatchSource for EmptySource {
    fn fetch(&mut self, _: TimeRange, _: Direction, _: usize) -> Result<Vec<ValuePoint>> {
        Ok(Vec::new())
    }
}

struct LogSource {
    state: Arc<RwLock<SeriesLog>>,
    map: Mmap,
    generation: u64,
    /// Held for the cursor's lifetime so the versions it reads stay retained.
    snapshot: Snapshot,
}

impl BatchSource for LogSource {
    fn fetch(
        &mut self,
        range: TimeRange,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<ValuePoint>> {
        let (id, path, offsets) = {
            let log = self.state.read();
            if log.generation != self.generation {
                return Err(StorageError::SnapshotInvalidated { series_id: log.id }.into());
            }
            let seq = self.snapshot.seq();
            let visible = |(_, versions): (&i64, &Versions<u64>)| versions.visible(seq).copied();
            let offsets: Vec<u64> = match direction {
                Direction::Ascending => log
                    .index
                    .range(range)
                    .filter_map(visible)
                    .take(max)
                    .collect(),
                Direction::Descending => log
                    .index
                    .range(range)
                    .rev()
                    .filter_map(visible)
                    .take(max)
                    .collect(),
            };
            (log.id, log.path.clone(), offsets)
        };

        let mut batch = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            match codec::decode_record(&self.map, start, id) {
                Ok(Decoded::Record { point, .. }) => batch.push(point),
                Ok(Decoded::Torn) => {
                    return Err(StorageError::CorruptedLog {
                        path,
                        offset,
                        reason: "indexed record runs past end of mapping".to_string(),
                    }
                    .into());
                }
                Err(reason) => {
                    return Err(StorageError::CorruptedLog {
                        path,
                        offset,
                        reason,
                    }
                    .into());
                }
            }
        }
        Ok(batch)
    }
}
