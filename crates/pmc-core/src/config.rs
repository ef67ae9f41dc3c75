//! Filesystem configuration.

use pmc_alloc::DEFAULT_QUEUE_CAPACITY;
use pmc_error::{PmcError, Result};
use pmc_pmem::LatencyModel;
use pmc_types::BlockType;
use serde::{Deserialize, Serialize};

/// Probabilistic crash injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub enabled: bool,
    /// Size of the outcome space each roll draws from.
    /// Default: 10,000,000.
    pub total_outcomes: u32,
    /// A roll at or below this value crashes.
    /// Default: 50.
    pub likelihood: u32,
    /// Fixed RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            total_outcomes: 10_000_000,
            likelihood: 50,
            seed: None,
        }
    }
}

/// Geometry and tuning of one filesystem instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Device size in 4 KiB blocks.
    /// Default: 4096 (16 MiB).
    pub block_count: u64,
    /// Blocks at the start of the device never handed out (superblock,
    /// log area).
    /// Default: 16.
    pub reserved_blocks: u64,
    /// Total log entries open transactions may reserve at once.
    /// Default: 4096.
    pub log_capacity_entries: usize,
    /// Capacity of the deferred free-request queue.
    /// Default: 100.
    pub free_queue_capacity: usize,
    /// Block type assigned to new files.
    pub default_block_type: BlockType,
    pub latency: LatencyModel,
    pub crash: CrashConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_count: 4096,
            reserved_blocks: 16,
            log_capacity_entries: 4096,
            free_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_block_type: BlockType::FourK,
            latency: LatencyModel::default(),
            crash: CrashConfig::default(),
        }
    }
}

impl FsConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| PmcError::InvalidArgument(format!("config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reserved_blocks >= self.block_count {
            return Err(PmcError::InvalidArgument(format!(
                "reserved_blocks ({}) must be below block_count ({})",
                self.reserved_blocks, self.block_count
            )));
        }
        if self.log_capacity_entries == 0 {
            return Err(PmcError::InvalidArgument(
                "log_capacity_entries must be non-zero".to_owned(),
            ));
        }
        if self.crash.enabled && self.crash.total_outcomes == 0 {
            return Err(PmcError::InvalidArgument(
                "crash.total_outcomes must be non-zero".to_owned(),
            ));
        }
        self.latency.validate()
    }
}
