//! HeronDB storage layer: MVCC row version chains with snapshot
//! visibility, durable checkpointing, vacuum garbage collection,
//! per-column compression and table constraint enforcement.

pub mod checkpoint;
pub mod compression;
pub mod constraint;
pub mod engine;
pub mod schema;
pub mod vacuum;
pub mod version_store;

#[cfg(test)]
mod tests;

pub use checkpoint::{
    CheckpointCoordinator, CheckpointReport, DurableStore, FileDurableStore, FlushPayload,
    MemoryDurableStore,
};
pub use compression::{ChunkStats, CompressionType, EncodedChunk};
pub use constraint::{CheckExpr, TableConstraint};
pub use engine::{Collection, SequenceCounter, StorageEngine};
pub use schema::Schema;
pub use vacuum::{
    FixedHorizon, HorizonProvider, VacuumCoordinator, VacuumRunner, VacuumStats, VacuumSweepReport,
};
pub use version_store::VersionStore;
