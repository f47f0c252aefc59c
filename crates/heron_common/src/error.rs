//! Layered error taxonomy: storage-level and transaction-level errors
//! converge into the top-level [`HeronError`].

use thiserror::Error;

use crate::types::{RowId, SequenceNumber, TxnId};

pub type HeronResult<T> = Result<T, HeronError>;

/// Errors raised by the storage layer (version store, checkpoint,
/// vacuum, compression).
#[derive(Error, Debug)]
pub enum StorageError {
    /// No version of the row is visible in the caller's snapshot, or
    /// the newest visible version is a tombstone.
    #[error("{row_id} not found in snapshot")]
    NotFound { row_id: RowId },

    /// The chain head is a pending version owned by another open
    /// transaction.
    #[error("write conflict on {row_id}: pending version held by {holder}")]
    WriteConflict { row_id: RowId, holder: TxnId },

    /// The stored compression tag does not match the encoded bytes.
    #[error("corrupt chunk for column `{column}`: stored tag {stored}, encoded bytes carry {encoded}")]
    CorruptChunk {
        column: String,
        stored: String,
        encoded: String,
    },

    /// A maintenance operation observed its cancel signal and stopped
    /// at a row boundary. State is consistent; the operation may be
    /// re-issued.
    #[error("operation `{operation}` cancelled")]
    Cancelled { operation: &'static str },

    #[error("unknown collection `{name}`")]
    CollectionNotFound { name: String },

    #[error("collection `{name}` already exists")]
    CollectionExists { name: String },

    #[error("invalid collection name `{name}`: {reason}")]
    InvalidCollectionName { name: String, reason: String },

    #[error("row {row_id} has {actual} values but schema has {expected} columns")]
    SchemaMismatch {
        row_id: RowId,
        expected: usize,
        actual: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Errors raised by the transaction lifecycle.
#[derive(Error, Debug)]
pub enum TxnError {
    /// First-committer-wins validation failed: another transaction
    /// committed a conflicting version of the row after this
    /// transaction's snapshot was taken.
    #[error("{txn_id} commit conflict on {row_id}: committed by another transaction at {committed_at}")]
    CommitConflict {
        txn_id: TxnId,
        row_id: RowId,
        committed_at: SequenceNumber,
    },

    /// A table constraint rejected the proposed row.
    #[error("constraint `{name}` violated on columns {columns:?}: {detail}")]
    ConstraintViolation {
        name: String,
        columns: Vec<String>,
        detail: String,
    },

    #[error("{0} is not active")]
    NotFound(TxnId),

    #[error("{0} has already committed")]
    AlreadyCommitted(TxnId),

    #[error("{0} has been aborted")]
    Aborted(TxnId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Top-level error type for the workspace.
#[derive(Error, Debug)]
pub enum HeronError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("internal error: {0}")]
    Internal(String),
}
