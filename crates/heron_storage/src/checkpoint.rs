//! Durable checkpointing: flush committed versions up to a watermark
//! through the [`DurableStore`] trait and persist a resumable cursor.
//!
//! The watermark is captured by the engine inside the commit critical
//! section, so no commit can land "inside" it. Flushing itself runs
//! without any table-wide lock; each version is marked durable in
//! memory only after its flush call returns, which together with the
//! persisted cursor makes reruns and crash recovery idempotent.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use heron_common::{CancelSignal, OwnedRow, RowId, SequenceNumber, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::version_store::VersionStore;

/// Payload of one flushed version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlushPayload {
    Row(OwnedRow),
    Tombstone,
}

impl FlushPayload {
    fn from_version(payload: &Option<OwnedRow>) -> FlushPayload {
        match payload {
            Some(row) => FlushPayload::Row(row.clone()),
            None => FlushPayload::Tombstone,
        }
    }
}

/// Downstream durable storage. Flushes must be overwrite-idempotent:
/// writing the same `(row_id, commit_sequence)` twice leaves the same
/// durable state as writing it once.
pub trait DurableStore: Send + Sync {
    fn flush(
        &self,
        row_id: RowId,
        payload: &FlushPayload,
        commit_sequence: SequenceNumber,
    ) -> Result<(), StorageError>;

    fn load_cursor(&self) -> Result<SequenceNumber, StorageError>;

    fn persist_cursor(&self, cursor: SequenceNumber) -> Result<(), StorageError>;
}

/// Cumulative checkpoint counters.
#[derive(Debug, Default)]
pub struct CheckpointStats {
    runs: AtomicU64,
    versions_flushed: AtomicU64,
    cancellations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStatsSnapshot {
    pub runs: u64,
    pub versions_flushed: u64,
    pub cancellations: u64,
}

impl CheckpointStats {
    pub fn snapshot(&self) -> CheckpointStatsSnapshot {
        CheckpointStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            versions_flushed: self.versions_flushed.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Report of a single checkpoint run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    pub watermark: SequenceNumber,
    pub versions_flushed: u64,
    /// False when the watermark was at or below the persisted cursor
    /// and the run had nothing to do.
    pub advanced: bool,
}

/// Drives checkpoint runs against one durable store. The in-memory
/// cursor mirrors the persisted one.
pub struct CheckpointCoordinator {
    store: Arc<dyn DurableStore>,
    cursor: AtomicU64,
    stats: CheckpointStats,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<dyn DurableStore>) -> Result<Self, StorageError> {
        let cursor = store.load_cursor()?;
        Ok(CheckpointCoordinator {
            store,
            cursor: AtomicU64::new(cursor.0),
            stats: CheckpointStats::default(),
        })
    }

    pub fn cursor(&self) -> SequenceNumber {
        SequenceNumber(self.cursor.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> CheckpointStatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush every committed version with sequence at or below
    /// `watermark` across the given stores, then advance the cursor.
    ///
    /// Cancellation is observed between rows; a cancelled run leaves
    /// the cursor untouched and already-flushed versions marked
    /// durable, so re-issuing the checkpoint picks up where it left
    /// off.
    pub fn run<'a, I>(
        &self,
        stores: I,
        watermark: SequenceNumber,
        cancel: &CancelSignal,
        cancel_check_rows: usize,
    ) -> Result<CheckpointReport, StorageError>
    where
        I: IntoIterator<Item = &'a VersionStore>,
    {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        let cursor = self.cursor();
        if watermark <= cursor {
            debug!(
                watermark = watermark.0,
                cursor = cursor.0,
                "checkpoint watermark already durable"
            );
            return Ok(CheckpointReport {
                watermark,
                versions_flushed: 0,
                advanced: false,
            });
        }

        let mut flushed = 0;
        let check_every = cancel_check_rows.max(1);
        for store in stores {
            let mut visited = 0usize;
            let result = store.for_each_unflushed(
                watermark,
                cursor,
                || {
                    visited += 1;
                    visited % check_every == 0 && cancel.is_cancelled()
                },
                |row_id, seq, payload| {
                    self.store
                        .flush(row_id, &FlushPayload::from_version(payload), seq)
                },
            );
            match result {
                Ok(n) => flushed += n,
                Err(err) => {
                    if matches!(err, StorageError::Cancelled { .. }) {
                        self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .versions_flushed
                            .fetch_add(flushed, Ordering::Relaxed);
                    }
                    return Err(err);
                }
            }
        }

        self.store.persist_cursor(watermark)?;
        self.cursor.store(watermark.0, Ordering::Release);
        self.stats
            .versions_flushed
            .fetch_add(flushed, Ordering::Relaxed);
        info!(
            watermark = watermark.0,
            versions = flushed,
            "checkpoint complete"
        );
        Ok(CheckpointReport {
            watermark,
            versions_flushed: flushed,
            advanced: true,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlushRecord {
    row_id: u64,
    commit_sequence: u64,
    payload: FlushPayload,
}

/// File-backed durable store: an append-only record log plus a cursor
/// file written via temp-and-rename. Appending a duplicate
/// `(row_id, sequence)` record is harmless because replay keys records
/// and keeps the last one, which is identical.
pub struct FileDurableStore {
    data_path: PathBuf,
    cursor_path: PathBuf,
    writer: Mutex<()>,
}

impl FileDurableStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        Ok(FileDurableStore {
            data_path: dir.join("versions.log"),
            cursor_path: dir.join("cursor.bin"),
            writer: Mutex::new(()),
        })
    }

    /// Replay the log into the last flushed payload per
    /// `(row_id, sequence)` pair. Test and recovery helper.
    pub fn replay(&self) -> Result<Vec<(RowId, SequenceNumber, FlushPayload)>, StorageError> {
        let file = match File::open(&self.data_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records: std::collections::BTreeMap<(u64, u64), FlushPayload> =
            std::collections::BTreeMap::new();
        loop {
            match bincode::deserialize_from::<_, FlushRecord>(&mut reader) {
                Ok(rec) => {
                    records.insert((rec.row_id, rec.commit_sequence), rec.payload);
                }
                Err(err) => {
                    if let bincode::ErrorKind::Io(ref io) = *err {
                        if io.kind() == ErrorKind::UnexpectedEof {
                            break;
                        }
                    }
                    return Err(StorageError::Serialization(format!(
                        "replaying {}: {err}",
                        self.data_path.display()
                    )));
                }
            }
        }
        Ok(records
            .into_iter()
            .map(|((row, seq), payload)| (RowId(row), SequenceNumber(seq), payload))
            .collect())
    }
}

impl DurableStore for FileDurableStore {
    fn flush(
        &self,
        row_id: RowId,
        payload: &FlushPayload,
        commit_sequence: SequenceNumber,
    ) -> Result<(), StorageError> {
        let record = FlushRecord {
            row_id: row_id.0,
            commit_sequence: commit_sequence.0,
            payload: payload.clone(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| StorageError::Serialization(format!("flush record: {e}")))?;
        let _guard = self.writer.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn load_cursor(&self) -> Result<SequenceNumber, StorageError> {
        match std::fs::read(&self.cursor_path) {
            Ok(bytes) => {
                let cursor: u64 = bincode::deserialize(&bytes).map_err(|e| {
                    StorageError::Serialization(format!("cursor file: {e}"))
                })?;
                Ok(SequenceNumber(cursor))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(SequenceNumber(0)),
            Err(e) => Err(e.into()),
        }
    }

    fn persist_cursor(&self, cursor: SequenceNumber) -> Result<(), StorageError> {
        let bytes = bincode::serialize(&cursor.0)
            .map_err(|e| StorageError::Serialization(format!("cursor: {e}")))?;
        let _guard = self.writer.lock();
        let tmp = self.cursor_path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        std::fs::rename(&tmp, &self.cursor_path)?;
        Ok(())
    }
}

/// In-memory durable store for embedding and tests.
#[derive(Default)]
pub struct MemoryDurableStore {
    records: Mutex<std::collections::BTreeMap<(u64, u64), FlushPayload>>,
    cursor: AtomicU64,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<(RowId, SequenceNumber, FlushPayload)> {
        self.records
            .lock()
            .iter()
            .map(|(&(row, seq), payload)| (RowId(row), SequenceNumber(seq), payload.clone()))
            .collect()
    }
}

impl DurableStore for MemoryDurableStore {
    fn flush(
        &self,
        row_id: RowId,
        payload: &FlushPayload,
        commit_sequence: SequenceNumber,
    ) -> Result<(), StorageError> {
        self.records
            .lock()
            .insert((row_id.0, commit_sequence.0), payload.clone());
        Ok(())
    }

    fn load_cursor(&self) -> Result<SequenceNumber, StorageError> {
        Ok(SequenceNumber(self.cursor.load(Ordering::Acquire)))
    }

    fn persist_cursor(&self, cursor: SequenceNumber) -> Result<(), StorageError> {
        self.cursor.store(cursor.0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::{Datum, TransactionData, TxnId};

    fn seeded_store(rows: &[(u64, i64, u64)]) -> VersionStore {
        let store = VersionStore::new();
        for &(row_id, value, seq) in rows {
            let txn = TransactionData::new(TxnId(seq), SequenceNumber(seq - 1));
            store
                .put(RowId(row_id), &txn, OwnedRow::new(vec![Datum::Int64(value)]))
                .unwrap();
            assert!(store.stamp_commit(RowId(row_id), txn.txn_id, SequenceNumber(seq)));
        }
        store
    }

    #[test]
    fn test_flushes_up_to_watermark() {
        let durable = Arc::new(MemoryDurableStore::new());
        let coordinator = CheckpointCoordinator::new(durable.clone()).unwrap();
        let store = seeded_store(&[(1, 10, 2), (2, 20, 4), (3, 30, 9)]);

        let report = coordinator
            .run([&store], SequenceNumber(5), &CancelSignal::new(), 4)
            .unwrap();
        assert!(report.advanced);
        assert_eq!(report.versions_flushed, 2);
        assert_eq!(coordinator.cursor(), SequenceNumber(5));
        assert_eq!(durable.record_count(), 2);
    }

    #[test]
    fn test_rerun_at_same_watermark_is_noop() {
        let durable = Arc::new(MemoryDurableStore::new());
        let coordinator = CheckpointCoordinator::new(durable.clone()).unwrap();
        let store = seeded_store(&[(1, 10, 2)]);

        let first = coordinator
            .run([&store], SequenceNumber(5), &CancelSignal::new(), 4)
            .unwrap();
        assert_eq!(first.versions_flushed, 1);

        let second = coordinator
            .run([&store], SequenceNumber(5), &CancelSignal::new(), 4)
            .unwrap();
        assert!(!second.advanced);
        assert_eq!(second.versions_flushed, 0);
        assert_eq!(durable.record_count(), 1);

        let lower = coordinator
            .run([&store], SequenceNumber(3), &CancelSignal::new(), 4)
            .unwrap();
        assert!(!lower.advanced);
    }

    #[test]
    fn test_tombstones_are_flushed() {
        let durable = Arc::new(MemoryDurableStore::new());
        let coordinator = CheckpointCoordinator::new(durable.clone()).unwrap();
        let store = seeded_store(&[(1, 10, 2)]);
        let deleter = TransactionData::new(TxnId(50), SequenceNumber(2));
        store.delete(RowId(1), &deleter).unwrap();
        store.stamp_commit(RowId(1), deleter.txn_id, SequenceNumber(3));

        coordinator
            .run([&store], SequenceNumber(5), &CancelSignal::new(), 4)
            .unwrap();
        let records = durable.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].2, FlushPayload::Tombstone);
    }

    #[test]
    fn test_cancelled_run_is_resumable() {
        let durable = Arc::new(MemoryDurableStore::new());
        let coordinator = CheckpointCoordinator::new(durable.clone()).unwrap();
        let store = seeded_store(&[(1, 10, 1), (2, 20, 2), (3, 30, 3), (4, 40, 4)]);

        let cancel = CancelSignal::new();
        cancel.cancel();
        // Check every row: the first poll stops the run.
        let err = coordinator
            .run([&store], SequenceNumber(10), &cancel, 1)
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled { .. }));
        assert_eq!(coordinator.cursor(), SequenceNumber(0));

        // Re-issue without cancellation: everything lands, nothing is
        // flushed twice.
        let report = coordinator
            .run([&store], SequenceNumber(10), &CancelSignal::new(), 4)
            .unwrap();
        assert!(report.advanced);
        assert_eq!(durable.record_count(), 4);
        assert_eq!(coordinator.cursor(), SequenceNumber(10));
        assert_eq!(coordinator.stats().cancellations, 1);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let durable = FileDurableStore::open(dir.path()).unwrap();
        durable
            .flush(
                RowId(1),
                &FlushPayload::Row(OwnedRow::new(vec![Datum::Int64(7)])),
                SequenceNumber(3),
            )
            .unwrap();
        durable.flush(RowId(2), &FlushPayload::Tombstone, SequenceNumber(4)).unwrap();
        // Duplicate flush of the same version: replay keeps one copy.
        durable
            .flush(
                RowId(1),
                &FlushPayload::Row(OwnedRow::new(vec![Datum::Int64(7)])),
                SequenceNumber(3),
            )
            .unwrap();
        durable.persist_cursor(SequenceNumber(4)).unwrap();

        let reopened = FileDurableStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_cursor().unwrap(), SequenceNumber(4));
        let records = reopened.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, RowId(1));
        assert_eq!(records[1].2, FlushPayload::Tombstone);
    }

    #[test]
    fn test_coordinator_resumes_from_persisted_cursor() {
        let dir = tempfile::tempdir().unwrap();
        {
            let durable = Arc::new(FileDurableStore::open(dir.path()).unwrap());
            let coordinator = CheckpointCoordinator::new(durable).unwrap();
            let store = seeded_store(&[(1, 10, 2)]);
            coordinator
                .run([&store], SequenceNumber(2), &CancelSignal::new(), 4)
                .unwrap();
        }
        // New coordinator (fresh process): the cursor survives, and a
        // store whose versions are all at or below it flushes nothing.
        let durable = Arc::new(FileDurableStore::open(dir.path()).unwrap());
        let coordinator = CheckpointCoordinator::new(durable.clone()).unwrap();
        assert_eq!(coordinator.cursor(), SequenceNumber(2));
        let store = seeded_store(&[(1, 10, 2)]);
        let report = coordinator
            .run([&store], SequenceNumber(2), &CancelSignal::new(), 4)
            .unwrap();
        assert!(!report.advanced);
        assert_eq!(durable.replay().unwrap().len(), 1);
    }
}
