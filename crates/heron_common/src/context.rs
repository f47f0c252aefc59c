//! Per-request execution context threaded through every storage
//! operation for log and error correlation.

use std::fmt;

use crate::types::{CollectionFullName, SequenceNumber, SessionId, TxnId};

/// Immutable identity of a transaction's snapshot.
///
/// `start_sequence` is the committed sequence captured at `begin`; it
/// never changes for the life of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionData {
    pub txn_id: TxnId,
    pub start_sequence: SequenceNumber,
}

impl TransactionData {
    pub fn new(txn_id: TxnId, start_sequence: SequenceNumber) -> Self {
        TransactionData {
            txn_id,
            start_sequence,
        }
    }
}

impl fmt::Display for TransactionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.txn_id, self.start_sequence)
    }
}

/// Whether a request carries data mutations or a maintenance command.
///
/// CHECKPOINT and VACUUM run under a control context: their
/// transaction identity is used for logging only and never writes
/// versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Data,
    Control,
}

/// The context every operation receives by reference: who is asking
/// (session), under which snapshot (transaction), against which
/// collection.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session: SessionId,
    pub txn: TransactionData,
    pub collection: CollectionFullName,
    pub kind: RequestKind,
}

impl ExecutionContext {
    pub fn new(session: SessionId, txn: TransactionData, collection: CollectionFullName) -> Self {
        ExecutionContext {
            session,
            txn,
            collection,
            kind: RequestKind::Data,
        }
    }

    /// Context for CHECKPOINT / VACUUM control commands.
    pub fn control(
        session: SessionId,
        txn: TransactionData,
        collection: CollectionFullName,
    ) -> Self {
        ExecutionContext {
            session,
            txn,
            collection,
            kind: RequestKind::Control,
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == RequestKind::Control
    }

    /// Compact single-line form for structured log fields.
    pub fn as_context_str(&self) -> String {
        format!(
            "[{} {} {} start={}]",
            self.session, self.collection, self.txn.txn_id, self.txn.start_sequence
        )
    }
}
