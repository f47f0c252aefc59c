//! Shared building blocks for the HeronDB storage core: identifier
//! newtypes, the datum model, the error taxonomy, engine configuration,
//! execution context and cooperative cancellation.

pub mod cancel;
pub mod config;
pub mod context;
pub mod datum;
pub mod error;
pub mod types;

pub use cancel::CancelSignal;
pub use config::{CheckpointConfig, CompressionConfig, EngineConfig, VacuumConfig};
pub use context::{ExecutionContext, TransactionData};
pub use datum::{Datum, OwnedRow};
pub use error::{HeronError, HeronResult, StorageError, TxnError};
pub use types::{CollectionFullName, RowId, SequenceNumber, SessionId, TxnId};
