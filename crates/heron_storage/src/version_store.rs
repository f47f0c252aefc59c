//! Row version manager: per-row MVCC version chains with snapshot
//! visibility.
//!
//! Each row maps to a chain of versions ordered newest to oldest. A
//! chain stores its versions in a small arena (`Vec` of slots plus a
//! free list); links between versions are plain slot indices, so the
//! arena is the only owner and truncation never walks ownership cycles.
//!
//! Commit state lives in an `AtomicU64` per slot: `0` means pending,
//! `u64::MAX` means discarded (aborted), anything else is the commit
//! sequence. Readers resolve visibility through atomic loads under the
//! chain's shared lock; only put/delete, commit finalization, abort and
//! vacuum removal take the exclusive lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use heron_common::{
    OwnedRow, RowId, SequenceNumber, StorageError, TransactionData, TxnError, TxnId,
};
use parking_lot::RwLock;

/// Sentinel for a version whose transaction has not committed yet.
const SEQ_PENDING: u64 = 0;
/// Sentinel for a version whose transaction aborted.
const SEQ_DISCARDED: u64 = u64::MAX;

/// One version in a chain arena.
struct VersionSlot {
    writer_txn: TxnId,
    commit_sequence: AtomicU64,
    /// `None` is a tombstone (the row was deleted at this version).
    payload: Option<OwnedRow>,
    /// Index of the next-older slot in the same arena.
    next: Option<u32>,
    /// Set once the checkpoint coordinator has flushed this version.
    durable: AtomicBool,
}

impl VersionSlot {
    fn sequence(&self) -> u64 {
        self.commit_sequence.load(Ordering::Acquire)
    }

    fn is_pending(&self) -> bool {
        self.sequence() == SEQ_PENDING
    }

    fn is_discarded(&self) -> bool {
        self.sequence() == SEQ_DISCARDED
    }

    fn is_committed(&self) -> bool {
        let seq = self.sequence();
        seq != SEQ_PENDING && seq != SEQ_DISCARDED
    }

    /// Visible to `txn` iff written by it (and not discarded) or
    /// committed at or before the snapshot.
    fn visible_to(&self, txn: &TransactionData) -> bool {
        if self.writer_txn == txn.txn_id {
            return !self.is_discarded();
        }
        let seq = self.sequence();
        seq != SEQ_PENDING && seq != SEQ_DISCARDED && seq <= txn.start_sequence.0
    }
}

struct ChainArena {
    head: Option<u32>,
    slots: Vec<Option<VersionSlot>>,
    free: Vec<u32>,
    /// Consecutive vacuum sweeps the current pending head has survived.
    pending_sweeps: u32,
}

impl ChainArena {
    fn new() -> Self {
        ChainArena {
            head: None,
            slots: Vec::new(),
            free: Vec::new(),
            pending_sweeps: 0,
        }
    }

    fn slot(&self, idx: u32) -> &VersionSlot {
        self.slots[idx as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling chain index {idx}"))
    }

    fn alloc(&mut self, slot: VersionSlot) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            (self.slots.len() - 1) as u32
        }
    }

    fn release(&mut self, idx: u32) {
        self.slots[idx as usize] = None;
        self.free.push(idx);
    }

    fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(idx) = cur {
            n += 1;
            cur = self.slot(idx).next;
        }
        n
    }
}

/// Outcome of sweeping a single chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChainSweepOutcome {
    pub versions_removed: u64,
    /// The chain head is a pending version that has survived at least
    /// the configured number of sweeps.
    pub stale_pending: bool,
    /// The chain has no versions left.
    pub emptied: bool,
}

/// A version chain for one row.
pub struct RowChain {
    arena: RwLock<ChainArena>,
}

impl RowChain {
    fn new() -> Self {
        RowChain {
            arena: RwLock::new(ChainArena::new()),
        }
    }

    /// Link a new pending version at the head.
    ///
    /// If the head is already this transaction's pending version the
    /// payload is replaced in place, keeping the one-pending-head
    /// invariant. A pending head owned by another transaction is a
    /// write conflict.
    fn prepend(
        &self,
        row_id: RowId,
        txn: &TransactionData,
        payload: Option<OwnedRow>,
    ) -> Result<(), StorageError> {
        let mut arena = self.arena.write();
        if let Some(head_idx) = arena.head {
            let head = arena.slot(head_idx);
            if head.is_pending() {
                if head.writer_txn != txn.txn_id {
                    return Err(StorageError::WriteConflict {
                        row_id,
                        holder: head.writer_txn,
                    });
                }
                // Same transaction overwrites its own pending head.
                if let Some(slot) = arena.slots[head_idx as usize].as_mut() {
                    slot.payload = payload;
                }
                return Ok(());
            }
        }
        let next = arena.head;
        let idx = arena.alloc(VersionSlot {
            writer_txn: txn.txn_id,
            commit_sequence: AtomicU64::new(SEQ_PENDING),
            payload,
            next,
            durable: AtomicBool::new(false),
        });
        arena.head = Some(idx);
        arena.pending_sweeps = 0;
        Ok(())
    }

    /// Newest-to-oldest walk; first visible version wins.
    ///
    /// `Some(None)` means the visible version is a tombstone.
    fn read_for_txn(&self, txn: &TransactionData) -> Option<Option<OwnedRow>> {
        let arena = self.arena.read();
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.visible_to(txn) {
                return Some(slot.payload.clone());
            }
            cur = slot.next;
        }
        None
    }

    /// Newest sequence committed by a transaction other than
    /// `exclude` after `after`. Used for first-committer-wins
    /// validation at commit.
    fn committed_after(&self, exclude: TxnId, after: SequenceNumber) -> Option<SequenceNumber> {
        let arena = self.arena.read();
        let mut newest: Option<u64> = None;
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.writer_txn != exclude && slot.is_committed() {
                let seq = slot.sequence();
                if seq > after.0 && newest.map_or(true, |n| seq > n) {
                    newest = Some(seq);
                }
            }
            cur = slot.next;
        }
        newest.map(SequenceNumber)
    }

    /// Stamp this transaction's pending versions with the commit
    /// sequence. Atomic store under the shared lock; readers racing the
    /// stamp see either pending or the final sequence.
    fn stamp_commit(&self, txn_id: TxnId, seq: SequenceNumber) -> bool {
        let arena = self.arena.read();
        let mut stamped = false;
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.writer_txn == txn_id && slot.is_pending() {
                slot.commit_sequence.store(seq.0, Ordering::Release);
                stamped = true;
            }
            cur = slot.next;
        }
        stamped
    }

    /// Discard this transaction's pending versions. The head is
    /// unlinked and released immediately; any interior stragglers are
    /// marked discarded for the next vacuum sweep.
    fn discard(&self, txn_id: TxnId) -> bool {
        let mut arena = self.arena.write();
        let mut removed = false;
        while let Some(head_idx) = arena.head {
            let (is_own_pending, next) = {
                let head = arena.slot(head_idx);
                (head.writer_txn == txn_id && head.is_pending(), head.next)
            };
            if is_own_pending {
                arena.head = next;
                arena.release(head_idx);
                removed = true;
            } else {
                break;
            }
        }
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.writer_txn == txn_id && slot.is_pending() {
                slot.commit_sequence.store(SEQ_DISCARDED, Ordering::Release);
                removed = true;
            }
            cur = slot.next;
        }
        if removed {
            arena.pending_sweeps = 0;
        }
        removed
    }

    /// Vacuum one chain: drop discarded versions anywhere, then drop
    /// every committed version older than the newest committed version
    /// at or below the horizon. The newest committed version always
    /// survives; a pending head is never touched, only aged.
    fn sweep(&self, horizon: SequenceNumber, stale_after: u32) -> ChainSweepOutcome {
        let mut arena = self.arena.write();
        let mut outcome = ChainSweepOutcome::default();

        // Unlink discarded versions wherever they sit.
        let mut cur = arena.head;
        let mut prev: Option<u32> = None;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            let next = slot.next;
            if slot.is_discarded() {
                match prev {
                    Some(p) => {
                        if let Some(p_slot) = arena.slots[p as usize].as_mut() {
                            p_slot.next = next;
                        }
                    }
                    None => arena.head = next,
                }
                arena.release(idx);
                outcome.versions_removed += 1;
            } else {
                prev = Some(idx);
            }
            cur = next;
        }

        // Find the newest committed version visible at the horizon and
        // truncate everything older than it.
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            let seq = slot.sequence();
            if slot.is_committed() && seq <= horizon.0 {
                let mut old = slot.next;
                if let Some(keep) = arena.slots[idx as usize].as_mut() {
                    keep.next = None;
                }
                while let Some(old_idx) = old {
                    old = arena.slot(old_idx).next;
                    arena.release(old_idx);
                    outcome.versions_removed += 1;
                }
                break;
            }
            cur = slot.next;
        }

        match arena.head {
            Some(head_idx) if arena.slot(head_idx).is_pending() => {
                arena.pending_sweeps += 1;
                outcome.stale_pending = arena.pending_sweeps >= stale_after;
            }
            Some(_) => arena.pending_sweeps = 0,
            None => outcome.emptied = true,
        }
        outcome
    }

    /// Newest committed payload regardless of snapshot. `Some(None)`
    /// is a committed tombstone.
    fn latest_committed(&self) -> Option<Option<OwnedRow>> {
        let arena = self.arena.read();
        let mut newest: Option<(u64, Option<OwnedRow>)> = None;
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.is_committed() {
                let seq = slot.sequence();
                if newest.as_ref().map_or(true, |(n, _)| seq > *n) {
                    newest = Some((seq, slot.payload.clone()));
                }
            }
            cur = slot.next;
        }
        newest.map(|(_, payload)| payload)
    }

    /// Committed versions at or below `watermark` that still need a
    /// flush. Collected under the read lock so the caller can run its
    /// I/O with no chain lock held.
    fn unflushed(
        &self,
        watermark: SequenceNumber,
        cursor: SequenceNumber,
    ) -> Vec<(SequenceNumber, Option<OwnedRow>)> {
        let arena = self.arena.read();
        let mut out = Vec::new();
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.is_committed() {
                let seq = slot.sequence();
                let already_durable =
                    seq <= cursor.0 || slot.durable.load(Ordering::Acquire);
                if seq <= watermark.0 && !already_durable {
                    out.push((SequenceNumber(seq), slot.payload.clone()));
                }
            }
            cur = slot.next;
        }
        out
    }

    /// Mark the version committed at `seq` durable. A sequence appears
    /// at most once per chain; the version may have been vacuumed away
    /// since staging, in which case there is nothing to mark.
    fn mark_durable(&self, seq: SequenceNumber) {
        let arena = self.arena.read();
        let mut cur = arena.head;
        while let Some(idx) = cur {
            let slot = arena.slot(idx);
            if slot.sequence() == seq.0 {
                slot.durable.store(true, Ordering::Release);
                return;
            }
            cur = slot.next;
        }
    }

    fn len(&self) -> usize {
        self.arena.read().len()
    }
}

/// Result of sweeping a whole store.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreSweepResult {
    pub rows_visited: u64,
    pub versions_removed: u64,
    pub stale_pending_heads: u64,
}

/// All version chains of one collection.
pub struct VersionStore {
    chains: DashMap<RowId, Arc<RowChain>>,
}

impl VersionStore {
    pub fn new() -> Self {
        VersionStore {
            chains: DashMap::new(),
        }
    }

    /// Snapshot read. NotFound covers both "no visible version" and
    /// "newest visible version is a tombstone".
    pub fn get(&self, row_id: RowId, txn: &TransactionData) -> Result<OwnedRow, StorageError> {
        let visible = self
            .chains
            .get(&row_id)
            .and_then(|chain| chain.read_for_txn(txn));
        match visible {
            Some(Some(row)) => Ok(row),
            Some(None) | None => Err(StorageError::NotFound { row_id }),
        }
    }

    /// Visible payload without the tombstone-to-error mapping. Used by
    /// constraint checks that scan for matches.
    pub fn visible_payload(&self, row_id: RowId, txn: &TransactionData) -> Option<OwnedRow> {
        self.chains
            .get(&row_id)
            .and_then(|chain| chain.read_for_txn(txn))
            .flatten()
    }

    /// Insert or update: links a pending version at the chain head.
    pub fn put(
        &self,
        row_id: RowId,
        txn: &TransactionData,
        row: OwnedRow,
    ) -> Result<(), StorageError> {
        let chain = Arc::clone(
            self.chains
                .entry(row_id)
                .or_insert_with(|| Arc::new(RowChain::new()))
                .value(),
        );
        chain.prepend(row_id, txn, Some(row))
    }

    /// Delete: links a pending tombstone. The row must be visible to
    /// the deleting transaction.
    pub fn delete(&self, row_id: RowId, txn: &TransactionData) -> Result<(), StorageError> {
        let chain = self
            .chains
            .get(&row_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(StorageError::NotFound { row_id })?;
        match chain.read_for_txn(txn) {
            Some(Some(_)) => chain.prepend(row_id, txn, None),
            Some(None) | None => Err(StorageError::NotFound { row_id }),
        }
    }

    /// First-committer-wins validation for one written row.
    pub fn check_commit(&self, row_id: RowId, txn: &TransactionData) -> Result<(), TxnError> {
        if let Some(chain) = self.chains.get(&row_id) {
            if let Some(committed_at) = chain.committed_after(txn.txn_id, txn.start_sequence) {
                return Err(TxnError::CommitConflict {
                    txn_id: txn.txn_id,
                    row_id,
                    committed_at,
                });
            }
        }
        Ok(())
    }

    /// Stamp the transaction's pending version of this row.
    pub fn stamp_commit(&self, row_id: RowId, txn_id: TxnId, seq: SequenceNumber) -> bool {
        self.chains
            .get(&row_id)
            .map(|chain| chain.stamp_commit(txn_id, seq))
            .unwrap_or(false)
    }

    /// Discard the transaction's pending version of this row.
    pub fn discard(&self, row_id: RowId, txn_id: TxnId) -> bool {
        self.chains
            .get(&row_id)
            .map(|chain| chain.discard(txn_id))
            .unwrap_or(false)
    }

    /// Sweep every chain, yielding between rows via `should_stop`.
    /// Returns early (partial result) when stopped; state stays
    /// consistent because each chain sweep is atomic.
    pub fn sweep<F>(
        &self,
        horizon: SequenceNumber,
        min_chain_length: usize,
        stale_after: u32,
        mut should_stop: F,
    ) -> (StoreSweepResult, bool)
    where
        F: FnMut() -> bool,
    {
        let mut result = StoreSweepResult::default();
        let mut emptied: Vec<RowId> = Vec::new();
        let mut stopped = false;
        for entry in self.chains.iter() {
            if should_stop() {
                stopped = true;
                break;
            }
            if entry.value().len() <= min_chain_length && !self.needs_visit(entry.value()) {
                continue;
            }
            let outcome = entry.value().sweep(horizon, stale_after);
            result.rows_visited += 1;
            result.versions_removed += outcome.versions_removed;
            if outcome.stale_pending {
                result.stale_pending_heads += 1;
            }
            if outcome.emptied {
                emptied.push(*entry.key());
            }
        }
        // Removal happens after iteration so the shard locks held by
        // the iterator are released first.
        self.drop_emptied(&emptied);
        (result, stopped)
    }

    /// Short chains are normally skipped, but a discarded, pending or
    /// absent head still needs the sweep (reclaim or staleness aging).
    fn needs_visit(&self, chain: &Arc<RowChain>) -> bool {
        let arena = chain.arena.read();
        match arena.head {
            Some(idx) => {
                let head = arena.slot(idx);
                head.is_discarded() || head.is_pending()
            }
            None => true,
        }
    }

    fn drop_emptied(&self, row_ids: &[RowId]) {
        for row_id in row_ids {
            // Re-check emptiness under the entry lock; a writer may
            // have prepended since the sweep.
            self.chains
                .remove_if(row_id, |_, chain| chain.arena.read().head.is_none());
        }
    }

    /// Visit every unflushed committed version at or below `watermark`.
    ///
    /// Payloads are staged per chain under its read lock and handed to
    /// the visitor with no map or chain lock held, so flush I/O never
    /// blocks foreground writers. The durable flag is set per version
    /// after the visitor succeeds; a failed flush is retried on the
    /// next run.
    pub fn for_each_unflushed<F>(
        &self,
        watermark: SequenceNumber,
        cursor: SequenceNumber,
        mut should_stop: impl FnMut() -> bool,
        mut visit: F,
    ) -> Result<u64, StorageError>
    where
        F: FnMut(RowId, SequenceNumber, &Option<OwnedRow>) -> Result<(), StorageError>,
    {
        let chains: Vec<(RowId, Arc<RowChain>)> = self
            .chains
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut flushed = 0;
        for (row_id, chain) in chains {
            if should_stop() {
                return Err(StorageError::Cancelled {
                    operation: "checkpoint",
                });
            }
            for (seq, payload) in chain.unflushed(watermark, cursor) {
                visit(row_id, seq, &payload)?;
                chain.mark_durable(seq);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Whether any row other than `exclude` is visible to `txn` with
    /// the given values at the given column indices. Used by unique
    /// and primary key checks; NULL values never match.
    pub fn any_visible_match(
        &self,
        txn: &TransactionData,
        exclude: RowId,
        indices: &[usize],
        values: &[heron_common::Datum],
    ) -> bool {
        self.chains.iter().any(|entry| {
            if *entry.key() == exclude {
                return false;
            }
            match entry.value().read_for_txn(txn) {
                Some(Some(row)) => indices.iter().zip(values.iter()).all(|(&idx, value)| {
                    row.get(idx).map_or(false, |existing| existing == value)
                }),
                _ => false,
            }
        })
    }

    /// Newest committed non-tombstone payloads, for column chunk
    /// rebuilds. Sorted by row id so chunk contents are deterministic.
    pub fn latest_committed_rows(&self) -> Vec<(RowId, OwnedRow)> {
        let mut rows: Vec<(RowId, OwnedRow)> = self
            .chains
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .latest_committed()
                    .flatten()
                    .map(|row| (*entry.key(), row))
            })
            .collect();
        rows.sort_by_key(|(row_id, _)| *row_id);
        rows
    }

    pub fn row_count(&self) -> usize {
        self.chains.len()
    }

    pub fn version_count(&self) -> usize {
        self.chains.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn chain_len(&self, row_id: RowId) -> usize {
        self.chains.get(&row_id).map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}
