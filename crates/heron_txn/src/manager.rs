//! Transaction manager: issues transaction identities and snapshots,
//! tracks active transactions and drives commit/abort through the
//! storage engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use heron_common::{SequenceNumber, TransactionData, TxnError, TxnId};
use heron_storage::{HorizonProvider, StorageEngine};
use tracing::debug;

/// Cumulative transaction counters.
#[derive(Debug, Default)]
struct TxnStats {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    commit_conflicts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub commit_conflicts: u64,
}

/// Hands out transaction data and owns the active transaction set.
///
/// The active set is the source of the vacuum horizon: versions older
/// than the oldest active snapshot are reclaimable.
pub struct TxnManager {
    engine: Arc<StorageEngine>,
    txn_counter: AtomicU64,
    active: DashMap<TxnId, TransactionData>,
    stats: TxnStats,
}

impl TxnManager {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        TxnManager {
            engine,
            txn_counter: AtomicU64::new(0),
            active: DashMap::new(),
            stats: TxnStats::default(),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Start a transaction: fresh id, snapshot at the current
    /// committed sequence.
    pub fn begin(&self) -> TransactionData {
        let txn_id = TxnId(self.txn_counter.fetch_add(1, Ordering::AcqRel) + 1);
        let txn = TransactionData::new(txn_id, self.engine.sequence().current());
        self.active.insert(txn_id, txn);
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %txn_id, start = txn.start_sequence.0, "txn begin");
        txn
    }

    /// Commit. On a first-committer-wins conflict the transaction is
    /// aborted (its pending versions discarded) and the conflict is
    /// returned to the caller for retry with a fresh transaction.
    pub fn commit(&self, txn_id: TxnId) -> Result<SequenceNumber, TxnError> {
        let txn = match self.active.get(&txn_id) {
            Some(entry) => *entry.value(),
            None => return Err(TxnError::NotFound(txn_id)),
        };
        match self.engine.commit_txn(&txn) {
            Ok(seq) => {
                self.active.remove(&txn_id);
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                debug!(txn = %txn_id, seq = seq.0, "txn committed");
                Ok(seq)
            }
            Err(err) => {
                if matches!(err, TxnError::CommitConflict { .. }) {
                    self.stats.commit_conflicts.fetch_add(1, Ordering::Relaxed);
                    self.engine.abort_txn(txn_id);
                    self.active.remove(&txn_id);
                    self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                    debug!(txn = %txn_id, "txn aborted on commit conflict");
                }
                Err(err)
            }
        }
    }

    /// Abort. Idempotent: aborting an unknown or already finished
    /// transaction is a no-op.
    pub fn abort(&self, txn_id: TxnId) {
        if self.active.remove(&txn_id).is_some() {
            self.engine.abort_txn(txn_id);
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            debug!(txn = %txn_id, "txn aborted");
        }
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Oldest snapshot among active transactions.
    pub fn min_active_start_sequence(&self) -> Option<SequenceNumber> {
        self.active
            .iter()
            .map(|entry| entry.value().start_sequence)
            .min()
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.stats.begun.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            commit_conflicts: self.stats.commit_conflicts.load(Ordering::Relaxed),
        }
    }
}

impl HorizonProvider for TxnManager {
    /// With no active transactions everything up to the committed
    /// sequence is fair game (the newest committed version of each
    /// chain survives regardless).
    fn vacuum_horizon(&self) -> SequenceNumber {
        self.min_active_start_sequence()
            .unwrap_or_else(|| self.engine.sequence().current())
    }
}
