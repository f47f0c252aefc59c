//! Transaction lifecycle for HeronDB: begin/commit/abort, active
//! transaction tracking and the vacuum horizon derived from it.

pub mod manager;


pub use manager::{TxnManager, TxnStatsSnapshot};
