//! Spooler configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `RESULTSPOOL__<SECTION>__<KEY>` environment
//! variables.
//!
//! ```toml
//! [spool]
//! threshold_bytes = 20971520
//! max_spool_to_disk_bytes = -1   # negative disables the disk cap
//! directory = "/var/tmp/resultspool"
//!
//! [memory]
//! max_memory_bytes = 0           # 0 = unbounded
//! max_wait_ms = 10000
//! ```

use crate::error::{Error, Result};
use crate::memory::GlobalMemoryManager;
use crate::spool::builder::{
    SpoolOptions, DEFAULT_MAX_SPOOL_TO_DISK_BYTES, DEFAULT_SPOOL_THRESHOLD_BYTES,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default time an allocation waits for memory to be released
pub const DEFAULT_MAX_MEMORY_WAIT_MS: u64 = 10_000;

/// Complete spooler configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub spool: SpoolSettings,
    pub memory: MemorySettings,
}

/// Per-operation spooling limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    /// Bytes held in memory before overflowing to disk
    pub threshold_bytes: usize,
    /// Extra bytes allowed on disk past the threshold; negative = unbounded
    pub max_spool_to_disk_bytes: i64,
    /// Directory for spool files
    pub directory: PathBuf,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_SPOOL_THRESHOLD_BYTES,
            max_spool_to_disk_bytes: DEFAULT_MAX_SPOOL_TO_DISK_BYTES as i64,
            directory: std::env::temp_dir(),
        }
    }
}

/// Process-wide memory budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Total bytes all spoolers may hold in memory; 0 = unbounded
    pub max_memory_bytes: usize,
    /// How long an allocation waits for memory before failing
    pub max_wait_ms: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_memory_bytes: 0,
            max_wait_ms: DEFAULT_MAX_MEMORY_WAIT_MS,
        }
    }
}

impl SpoolConfig {
    /// Load defaults, an optional config file, and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RESULTSPOOL")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: SpoolConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let parsed: SpoolConfig = toml::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.spool.directory.as_os_str().is_empty() {
            return Err(Error::Config("spool.directory must not be empty".to_string()));
        }
        if self.memory.max_memory_bytes > 0 && self.memory.max_memory_bytes < self.spool.threshold_bytes {
            warn!(
                max_memory_bytes = self.memory.max_memory_bytes,
                threshold_bytes = self.spool.threshold_bytes,
                "Memory budget is smaller than the spool threshold; spools will overflow early"
            );
        }
        Ok(())
    }

    /// Limits for a single spooling operation
    pub fn spool_options(&self) -> SpoolOptions {
        let max_spool = u64::try_from(self.spool.max_spool_to_disk_bytes).ok();
        SpoolOptions::new(self.spool.threshold_bytes, max_spool, self.spool.directory.clone())
    }

    /// Memory manager sized from the `[memory]` section
    pub fn memory_manager(&self) -> GlobalMemoryManager {
        match self.memory.max_memory_bytes {
            0 => GlobalMemoryManager::unbounded(),
            max => GlobalMemoryManager::new(max, Duration::from_millis(self.memory.max_wait_ms)),
        }
    }
}
