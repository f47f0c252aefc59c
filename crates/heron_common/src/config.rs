//! Engine configuration. All sections deserialize with serde and fall
//! back to defaults for missing fields, so partial config files work.

use serde::{Deserialize, Serialize};

/// Vacuum (version garbage collection) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    /// Whether the background vacuum runner is started at all.
    pub enabled: bool,
    /// Interval between background sweeps, in milliseconds.
    pub interval_ms: u64,
    /// Maximum number of rows visited per sweep. 0 means unbounded.
    pub batch_size: usize,
    /// Chains at or below this length are skipped by the sweep.
    pub min_chain_length: usize,
    /// A pending chain head that survives this many consecutive sweeps
    /// is counted as stale (metric only, never reclaimed).
    pub stale_pending_sweeps: u32,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        VacuumConfig {
            enabled: true,
            interval_ms: 1_000,
            batch_size: 0,
            min_chain_length: 1,
            stale_pending_sweeps: 3,
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Rows flushed between cancellation checks.
    pub cancel_check_rows: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            cancel_check_rows: 64,
        }
    }
}

/// Column compression selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Dictionary encoding is chosen when distinct/count is below this.
    pub dictionary_max_ratio: f64,
    /// RLE is chosen when the average run length is at least this.
    pub rle_min_avg_run: f64,
    /// Bit packing is chosen for integer chunks whose value range
    /// (max - min) does not exceed this.
    pub bitpack_max_range: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            dictionary_max_ratio: 0.5,
            rle_min_avg_run: 4.0,
            bitpack_max_range: 65_535,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vacuum: VacuumConfig,
    pub checkpoint: CheckpointConfig,
    pub compression: CompressionConfig,
}
