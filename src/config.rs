//! Engine tuning constants and runtime configuration.
//!
//! The constants bound the scratch allocations every core makes up front;
//! the [`EngineConfig`] is what deployments tweak, loadable from a JSON file
//! or constructed programmatically.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Capacity of each core's job queue.
pub const DEFAULT_SEARCH_QUEUE_SIZE: usize = 10_000;

/// Largest supported vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Smallest dimension the core output scratch is pre-sized for; smaller
/// dimensions grow the scratch on first use.
pub const MIN_DIMENSION: usize = 256;

/// Largest scalar width in bytes (float64).
pub const MAX_PRECISION: usize = 8;

/// Global upper bound on a set's search batch.
pub const MAX_BATCH: usize = 16;

/// Default byte size of one block (and of one core's device window).
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024 * 1024;

/// Command-line arguments for the demo binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "vecscan", about = "GPU brute-force vector search demo")]
pub struct Cli {
    /// Path to the engine configuration file (JSON).
    #[arg(short, long, default_value = "vecscan.json")]
    pub config: PathBuf,

    /// Vector dimension of the demo set.
    #[arg(long, default_value_t = 512)]
    pub dims: usize,

    /// Number of random features to load.
    #[arg(long, default_value_t = 10_000)]
    pub count: usize,

    /// Queries per search call.
    #[arg(long, default_value_t = 4)]
    pub batch: usize,

    /// Number of search rounds to run.
    #[arg(long, default_value_t = 100)]
    pub rounds: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Engine sizing: which device to use and how the block pools are cut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// GPU device ordinal.
    pub gpu_id: usize,

    /// Device memory reserved for core windows, in bytes. Zero disables
    /// search (set/block management still works).
    pub gpu_mem: usize,

    /// Number of host blocks in the cache.
    pub block_num: usize,

    /// Byte size of each block.
    pub block_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            gpu_mem: 4 * DEFAULT_BLOCK_SIZE,
            block_num: 8,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: EngineConfig = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            Ok(EngineConfig::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.block_size > 0, "block_size must be positive");
        anyhow::ensure!(self.block_num > 0, "block_num must be positive");
        if self.gpu_mem > 0 {
            anyhow::ensure!(
                self.gpu_mem >= self.block_size,
                "gpu_mem must fit at least one block"
            );
        }
        Ok(())
    }

    /// Number of core windows the device pool is cut into.
    pub fn core_num(&self) -> usize {
        self.gpu_mem / self.block_size
    }
}
