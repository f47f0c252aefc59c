//! Vacuum: background garbage collection of row versions no active
//! snapshot can reach.
//!
//! The horizon is the minimum `start_sequence` over active
//! transactions, supplied through [`HorizonProvider`] so the storage
//! layer stays decoupled from the transaction manager. A sweep visits
//! chains one at a time, never holding a table-wide lock, and yields
//! to cancellation between rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use heron_common::{CancelSignal, CompressionConfig, SequenceNumber, StorageError, VacuumConfig};
use tracing::{debug, info, warn};

use crate::engine::{Collection, StorageEngine};

/// Source of the vacuum horizon. Implemented by the transaction
/// manager as the minimum start sequence over active transactions.
pub trait HorizonProvider: Send + Sync {
    fn vacuum_horizon(&self) -> SequenceNumber;
}

/// Cumulative vacuum counters, updated per sweep.
#[derive(Debug, Default)]
pub struct VacuumStats {
    sweeps: AtomicU64,
    rows_visited: AtomicU64,
    versions_removed: AtomicU64,
    /// Pending chain heads observed past the staleness threshold in
    /// the most recent sweep. Reported, never reclaimed.
    stale_pending_heads: AtomicU64,
    cancellations: AtomicU64,
    chunk_rebuilds: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumStatsSnapshot {
    pub sweeps: u64,
    pub rows_visited: u64,
    pub versions_removed: u64,
    pub stale_pending_heads: u64,
    pub cancellations: u64,
    pub chunk_rebuilds: u64,
}

impl VacuumStats {
    pub fn snapshot(&self) -> VacuumStatsSnapshot {
        VacuumStatsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            rows_visited: self.rows_visited.load(Ordering::Relaxed),
            versions_removed: self.versions_removed.load(Ordering::Relaxed),
            stale_pending_heads: self.stale_pending_heads.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            chunk_rebuilds: self.chunk_rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// Result of one vacuum sweep across all collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumSweepReport {
    pub horizon: SequenceNumber,
    pub rows_visited: u64,
    pub versions_removed: u64,
    pub stale_pending_heads: u64,
    pub chunks_rebuilt: u64,
}

/// Runs sweeps over collections and keeps cumulative stats.
pub struct VacuumCoordinator {
    config: VacuumConfig,
    stats: VacuumStats,
}

impl VacuumCoordinator {
    pub fn new(config: VacuumConfig) -> Self {
        VacuumCoordinator {
            config,
            stats: VacuumStats::default(),
        }
    }

    pub fn stats(&self) -> VacuumStatsSnapshot {
        self.stats.snapshot()
    }

    /// One sweep. Removes discarded versions and committed versions
    /// shadowed at the horizon, then re-encodes column chunks of
    /// collections that lost versions (best effort: a failed rebuild
    /// is logged and skipped).
    pub fn run<'a, I>(
        &self,
        collections: I,
        provider: &dyn HorizonProvider,
        cancel: &CancelSignal,
        compression: &CompressionConfig,
    ) -> Result<VacuumSweepReport, StorageError>
    where
        I: IntoIterator<Item = &'a Collection>,
    {
        let horizon = provider.vacuum_horizon();
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        let mut report = VacuumSweepReport {
            horizon,
            rows_visited: 0,
            versions_removed: 0,
            stale_pending_heads: 0,
            chunks_rebuilt: 0,
        };
        let budget = self.config.batch_size;

        for collection in collections {
            let remaining = if budget == 0 {
                usize::MAX
            } else {
                budget.saturating_sub(report.rows_visited as usize)
            };
            if remaining == 0 {
                break;
            }
            let mut visited = 0usize;
            let (result, stopped) = collection.store().sweep(
                horizon,
                self.config.min_chain_length,
                self.config.stale_pending_sweeps,
                || {
                    if cancel.is_cancelled() {
                        return true;
                    }
                    visited += 1;
                    visited > remaining
                },
            );
            report.rows_visited += result.rows_visited;
            report.versions_removed += result.versions_removed;
            report.stale_pending_heads += result.stale_pending_heads;
            self.record(&result);

            if stopped && cancel.is_cancelled() {
                self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
                debug!(
                    horizon = horizon.0,
                    rows = report.rows_visited,
                    "vacuum sweep cancelled"
                );
                return Err(StorageError::Cancelled {
                    operation: "vacuum",
                });
            }

            if result.versions_removed > 0 {
                match collection.rebuild_chunks(compression) {
                    Ok(rebuilt) => {
                        report.chunks_rebuilt += rebuilt as u64;
                        self.stats
                            .chunk_rebuilds
                            .fetch_add(rebuilt as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(
                            collection = %collection.name(),
                            error = %err,
                            "chunk rebuild after vacuum failed, keeping stale chunks"
                        );
                    }
                }
            }

            if stopped {
                break; // row budget exhausted
            }
        }

        if report.stale_pending_heads > 0 {
            warn!(
                count = report.stale_pending_heads,
                horizon = horizon.0,
                "pending chain heads exceed staleness threshold"
            );
        }
        self.stats
            .stale_pending_heads
            .store(report.stale_pending_heads, Ordering::Relaxed);
        debug!(
            horizon = horizon.0,
            rows = report.rows_visited,
            removed = report.versions_removed,
            "vacuum sweep complete"
        );
        Ok(report)
    }

    fn record(&self, result: &crate::version_store::StoreSweepResult) {
        self.stats
            .rows_visited
            .fetch_add(result.rows_visited, Ordering::Relaxed);
        self.stats
            .versions_removed
            .fetch_add(result.versions_removed, Ordering::Relaxed);
    }
}

/// Background vacuum thread. Sleeps on the cancel signal between
/// sweeps so `stop()` takes effect immediately.
pub struct VacuumRunner {
    cancel: CancelSignal,
    handle: Option<JoinHandle<()>>,
}

impl VacuumRunner {
    pub fn start(engine: Arc<StorageEngine>, provider: Arc<dyn HorizonProvider>) -> VacuumRunner {
        let cancel = CancelSignal::new();
        if !engine.config().vacuum.enabled {
            debug!("vacuum runner disabled by config");
            return VacuumRunner {
                cancel,
                handle: None,
            };
        }
        let thread_cancel = cancel.clone();
        let interval = Duration::from_millis(engine.config().vacuum.interval_ms);
        let handle = std::thread::Builder::new()
            .name("heron-vacuum".to_string())
            .spawn(move || {
                info!("vacuum runner started");
                loop {
                    if thread_cancel.wait_timeout(interval) {
                        break;
                    }
                    match engine.vacuum_sweep(provider.as_ref(), &thread_cancel) {
                        Ok(report) => {
                            if report.versions_removed > 0 {
                                debug!(
                                    removed = report.versions_removed,
                                    "background vacuum reclaimed versions"
                                );
                            }
                        }
                        Err(StorageError::Cancelled { .. }) => break,
                        Err(err) => {
                            warn!(error = %err, "background vacuum sweep failed");
                        }
                    }
                }
                info!("vacuum runner stopped");
            })
            .ok();
        if handle.is_none() {
            warn!("failed to spawn vacuum runner thread");
        }
        VacuumRunner { cancel, handle }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VacuumRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fixed horizon, for direct sweeps and tests.
pub struct FixedHorizon(pub SequenceNumber);

impl HorizonProvider for FixedHorizon {
    fn vacuum_horizon(&self) -> SequenceNumber {
        self.0
    }
}
