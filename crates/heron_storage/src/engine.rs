//! Storage engine facade: collection registry, the shared commit
//! sequence counter and the CHECKPOINT / VACUUM control operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use heron_common::{
    CancelSignal, CollectionFullName, CompressionConfig, Datum, EngineConfig, ExecutionContext,
    OwnedRow, RowId, SequenceNumber, StorageError, TransactionData, TxnError, TxnId,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::checkpoint::{CheckpointCoordinator, CheckpointReport, DurableStore};
use crate::compression::EncodedChunk;
use crate::constraint::{self, TableConstraint};
use crate::schema::Schema;
use crate::vacuum::{HorizonProvider, VacuumCoordinator, VacuumSweepReport};
use crate::version_store::VersionStore;

/// The engine-owned commit sequence counter. Holds the sequence of the
/// most recent commit; snapshots read it, commits advance it inside
/// the commit critical section.
pub struct SequenceCounter {
    committed: AtomicU64,
}

impl SequenceCounter {
    fn new(start: SequenceNumber) -> Self {
        SequenceCounter {
            committed: AtomicU64::new(start.0),
        }
    }

    /// Sequence of the newest commit; also the snapshot bound handed
    /// to new transactions.
    pub fn current(&self) -> SequenceNumber {
        SequenceNumber(self.committed.load(Ordering::Acquire))
    }

    /// Next sequence to assign. Caller must hold the commit critical
    /// section; the value stays invisible to new snapshots until
    /// `publish`.
    fn reserve(&self) -> SequenceNumber {
        SequenceNumber(self.committed.load(Ordering::Acquire) + 1)
    }

    /// Make a reserved sequence visible to new snapshots. Must only be
    /// called once every pending version carries it, still inside the
    /// commit critical section.
    fn publish(&self, seq: SequenceNumber) {
        self.committed.store(seq.0, Ordering::Release);
    }
}

/// One collection: schema, constraints, version chains and the encoded
/// column chunks derived from them.
pub struct Collection {
    name: CollectionFullName,
    schema: Schema,
    constraints: Vec<TableConstraint>,
    store: VersionStore,
    chunks: RwLock<HashMap<String, EncodedChunk>>,
}

impl Collection {
    fn new(name: CollectionFullName, schema: Schema, constraints: Vec<TableConstraint>) -> Self {
        Collection {
            name,
            schema,
            constraints,
            store: VersionStore::new(),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &CollectionFullName {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn constraints(&self) -> &[TableConstraint] {
        &self.constraints
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Re-encode every column chunk from the newest committed rows.
    /// Returns the number of chunks rebuilt.
    pub fn rebuild_chunks(&self, config: &CompressionConfig) -> Result<usize, StorageError> {
        let rows = self.store.latest_committed_rows();
        let mut chunks = self.chunks.write();
        let mut rebuilt = 0;
        for (idx, column) in self.schema.columns().iter().enumerate() {
            let values: Vec<Datum> = rows
                .iter()
                .map(|(_, row)| row.get(idx).cloned().unwrap_or(Datum::Null))
                .collect();
            match chunks.get(column) {
                Some(chunk) => {
                    chunk.reencode(&values, config)?;
                }
                None => {
                    chunks.insert(column.clone(), EncodedChunk::build(column, &values, config)?);
                }
            }
            rebuilt += 1;
        }
        Ok(rebuilt)
    }

    /// Decode one column chunk, building it first if the collection
    /// has never been chunked.
    pub fn read_column(
        &self,
        column: &str,
        config: &CompressionConfig,
    ) -> Result<Vec<Datum>, StorageError> {
        if self.schema.index_of(column).is_none() {
            return Err(StorageError::Serialization(format!(
                "collection `{}` has no column `{column}`",
                self.name
            )));
        }
        if !self.chunks.read().contains_key(column) {
            self.rebuild_chunks(config)?;
        }
        let chunks = self.chunks.read();
        match chunks.get(column) {
            Some(chunk) => chunk.read(),
            None => Ok(Vec::new()),
        }
    }

    pub fn chunk_tag(&self, column: &str) -> Option<crate::compression::CompressionType> {
        self.chunks.read().get(column).map(|c| c.tag())
    }
}

/// The storage engine. One per process; all shared state hangs off an
/// `Arc<StorageEngine>` handle, there are no globals.
pub struct StorageEngine {
    config: EngineConfig,
    collections: DashMap<CollectionFullName, Arc<Collection>>,
    sequence: Arc<SequenceCounter>,
    /// Serializes commit sequence assignment with checkpoint watermark
    /// capture. Held only for validation plus stamping, never for I/O.
    commit_lock: Mutex<()>,
    write_sets: DashMap<TxnId, Vec<(CollectionFullName, RowId)>>,
    checkpoint: CheckpointCoordinator,
    vacuum: VacuumCoordinator,
}

impl StorageEngine {
    pub fn new(config: EngineConfig, durable: Arc<dyn DurableStore>) -> Result<Self, StorageError> {
        let checkpoint = CheckpointCoordinator::new(durable)?;
        // Restart from the durable cursor so new commit sequences
        // never collide with flushed ones.
        let start = checkpoint.cursor();
        let vacuum = VacuumCoordinator::new(config.vacuum.clone());
        Ok(StorageEngine {
            config,
            collections: DashMap::new(),
            sequence: Arc::new(SequenceCounter::new(start)),
            commit_lock: Mutex::new(()),
            write_sets: DashMap::new(),
            checkpoint,
            vacuum,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sequence(&self) -> &Arc<SequenceCounter> {
        &self.sequence
    }

    pub fn checkpoint_coordinator(&self) -> &CheckpointCoordinator {
        &self.checkpoint
    }

    pub fn vacuum_coordinator(&self) -> &VacuumCoordinator {
        &self.vacuum
    }

    pub fn create_collection(
        &self,
        name: CollectionFullName,
        schema: Schema,
        constraints: Vec<TableConstraint>,
    ) -> Result<Arc<Collection>, StorageError> {
        let collection = Arc::new(Collection::new(name.clone(), schema, constraints));
        match self.collections.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::CollectionExists {
                name: name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(collection.clone());
                debug!(collection = %name, "collection created");
                Ok(collection)
            }
        }
    }

    pub fn collection(&self, name: &CollectionFullName) -> Result<Arc<Collection>, StorageError> {
        self.collections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StorageError::CollectionNotFound {
                name: name.to_string(),
            })
    }

    pub fn collections_snapshot(&self) -> Vec<Arc<Collection>> {
        self.collections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot read of one row.
    pub fn get(&self, ctx: &ExecutionContext, row_id: RowId) -> Result<OwnedRow, StorageError> {
        let collection = self.collection(&ctx.collection)?;
        collection.store().get(row_id, &ctx.txn)
    }

    /// Insert or update one row. Constraints run against the writing
    /// transaction's snapshot before the pending version is linked; a
    /// violation rejects only this mutation.
    pub fn put(
        &self,
        ctx: &ExecutionContext,
        row_id: RowId,
        row: OwnedRow,
    ) -> Result<(), TxnError> {
        let collection = self.collection(&ctx.collection).map_err(TxnError::from)?;
        collection
            .schema()
            .check_row(row_id, &row)
            .map_err(TxnError::from)?;
        constraint::validate(
            collection.constraints(),
            collection.schema(),
            &row,
            |indices, values| {
                collection
                    .store()
                    .any_visible_match(&ctx.txn, row_id, indices, values)
            },
        )?;
        collection
            .store()
            .put(row_id, &ctx.txn, row)
            .map_err(TxnError::from)?;
        self.track_write(ctx.txn.txn_id, &ctx.collection, row_id);
        debug!(ctx = %ctx.as_context_str(), row = %row_id, "put");
        Ok(())
    }

    /// Delete one row (pending tombstone).
    pub fn delete(&self, ctx: &ExecutionContext, row_id: RowId) -> Result<(), StorageError> {
        let collection = self.collection(&ctx.collection)?;
        collection.store().delete(row_id, &ctx.txn)?;
        self.track_write(ctx.txn.txn_id, &ctx.collection, row_id);
        debug!(ctx = %ctx.as_context_str(), row = %row_id, "delete");
        Ok(())
    }

    fn track_write(&self, txn_id: TxnId, collection: &CollectionFullName, row_id: RowId) {
        let mut entry = self.write_sets.entry(txn_id).or_default();
        let key = (collection.clone(), row_id);
        if !entry.contains(&key) {
            entry.push(key);
        }
    }

    pub fn written_rows(&self, txn_id: TxnId) -> usize {
        self.write_sets.get(&txn_id).map(|e| e.len()).unwrap_or(0)
    }

    /// Commit a transaction's pending versions.
    ///
    /// Under the commit critical section: first-committer-wins
    /// validation over the whole write set, then stamping with a
    /// reserved sequence that is published only after every version
    /// carries it. A snapshot taken mid-stamp still reads the previous
    /// sequence, so no reader can observe half a commit. Validation
    /// failure leaves the write set intact so the caller can abort and
    /// discard it.
    pub fn commit_txn(&self, txn: &TransactionData) -> Result<SequenceNumber, TxnError> {
        let guard = self.commit_lock.lock();
        let writes = self
            .write_sets
            .get(&txn.txn_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        for (collection_name, row_id) in &writes {
            let collection = self.collection(collection_name).map_err(TxnError::from)?;
            collection.store().check_commit(*row_id, txn)?;
        }

        let seq = self.sequence.reserve();
        for (collection_name, row_id) in &writes {
            if let Ok(collection) = self.collection(collection_name) {
                collection.store().stamp_commit(*row_id, txn.txn_id, seq);
            }
        }
        self.sequence.publish(seq);
        drop(guard);
        self.write_sets.remove(&txn.txn_id);
        debug!(txn = %txn.txn_id, seq = seq.0, rows = writes.len(), "commit stamped");
        Ok(seq)
    }

    /// Discard a transaction's pending versions.
    pub fn abort_txn(&self, txn_id: TxnId) {
        if let Some((_, writes)) = self.write_sets.remove(&txn_id) {
            for (collection_name, row_id) in writes {
                if let Ok(collection) = self.collection(&collection_name) {
                    collection.store().discard(row_id, txn_id);
                }
            }
        }
        debug!(txn = %txn_id, "pending versions discarded");
    }

    /// CHECKPOINT control command. The watermark is the committed
    /// sequence captured under the commit critical section, so it can
    /// never split a commit.
    pub fn run_checkpoint(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<CheckpointReport, StorageError> {
        let watermark = {
            let _guard = self.commit_lock.lock();
            self.sequence.current()
        };
        debug!(ctx = %ctx.as_context_str(), watermark = watermark.0, "checkpoint requested");
        let collections = self.collections_snapshot();
        self.checkpoint.run(
            collections.iter().map(|c| c.store()),
            watermark,
            cancel,
            self.config.checkpoint.cancel_check_rows,
        )
    }

    /// VACUUM control command.
    pub fn run_vacuum(
        &self,
        ctx: &ExecutionContext,
        provider: &dyn HorizonProvider,
        cancel: &CancelSignal,
    ) -> Result<VacuumSweepReport, StorageError> {
        debug!(ctx = %ctx.as_context_str(), "vacuum requested");
        self.vacuum_sweep(provider, cancel)
    }

    /// One vacuum sweep at the provider's horizon. Also the entry
    /// point for the background runner.
    pub fn vacuum_sweep(
        &self,
        provider: &dyn HorizonProvider,
        cancel: &CancelSignal,
    ) -> Result<VacuumSweepReport, StorageError> {
        let collections = self.collections_snapshot();
        self.vacuum.run(
            collections.iter().map(|c| c.as_ref()),
            provider,
            cancel,
            &self.config.compression,
        )
    }
}
