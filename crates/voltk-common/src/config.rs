//! Configuration types for voltk
//!
//! This module defines the I/O manager configuration and the logging
//! section of the tool's configuration file.

use crate::error::{Error, Result};
use crate::types::MAX_SECTORS_PER_BLOCK;
use serde::{Deserialize, Serialize};

/// Which I/O engine backs the manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Native asynchronous I/O (io_uring), synchronous fallback for misaligned requests
    #[default]
    Async,
    /// Every request performed inline with pread/pwrite
    Sync,
}

/// I/O manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoConfig {
    /// Engine backing the cache
    #[serde(default)]
    pub engine: EngineKind,
    /// Discard writes instead of issuing them (validation runs)
    #[serde(default)]
    pub dry_run: bool,
    /// Sectors per cache block (1..=64)
    #[serde(default = "default_sectors_per_block")]
    pub sectors_per_block: u32,
    /// Number of blocks in the cache pool
    #[serde(default = "default_cache_blocks")]
    pub cache_blocks: usize,
    /// Maximum number of devices kept open at once
    #[serde(default = "default_max_open_devices")]
    pub max_open_devices: usize,
    /// Open devices with O_DIRECT when the filesystem allows it
    #[serde(default = "default_use_direct_io")]
    pub use_direct_io: bool,
    /// Maximum I/Os in flight in the engine; also the batch size
    #[serde(default = "default_max_concurrent_io")]
    pub max_concurrent_io: usize,
    /// Preemptive writeback starts when fewer than this percent of blocks are available
    #[serde(default = "default_writeback_low_percent")]
    pub writeback_low_percent: u8,
    /// Preemptive writeback issues enough writes to reach this percent
    #[serde(default = "default_writeback_high_percent")]
    pub writeback_high_percent: u8,
}

const fn default_sectors_per_block() -> u32 {
    64
}

const fn default_cache_blocks() -> usize {
    256
}

const fn default_max_open_devices() -> usize {
    1024
}

const fn default_use_direct_io() -> bool {
    true
}

const fn default_max_concurrent_io() -> usize {
    256
}

const fn default_writeback_low_percent() -> u8 {
    33
}

const fn default_writeback_high_percent() -> u8 {
    66
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            dry_run: false,
            sectors_per_block: default_sectors_per_block(),
            cache_blocks: default_cache_blocks(),
            max_open_devices: default_max_open_devices(),
            use_direct_io: default_use_direct_io(),
            max_concurrent_io: default_max_concurrent_io(),
            writeback_low_percent: default_writeback_low_percent(),
            writeback_high_percent: default_writeback_high_percent(),
        }
    }
}

impl IoConfig {
    /// Block size in bytes
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.sectors_per_block as usize * crate::types::SECTOR_SIZE as usize
    }

    /// Check the configuration for values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sectors_per_block == 0 || self.sectors_per_block > MAX_SECTORS_PER_BLOCK {
            return Err(Error::configuration(format!(
                "sectors_per_block must be in 1..={MAX_SECTORS_PER_BLOCK}, got {}",
                self.sectors_per_block
            )));
        }
        if self.cache_blocks == 0 {
            return Err(Error::configuration("cache_blocks must be non-zero"));
        }
        if self.max_open_devices == 0 {
            return Err(Error::configuration("max_open_devices must be non-zero"));
        }
        if self.max_concurrent_io == 0 {
            return Err(Error::configuration("max_concurrent_io must be non-zero"));
        }
        if self.writeback_low_percent > self.writeback_high_percent
            || self.writeback_high_percent > 100
        {
            return Err(Error::configuration(format!(
                "writeback watermarks {}%/{}% are not ordered within 0..=100",
                self.writeback_low_percent, self.writeback_high_percent
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IoConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_size(), 32 * 1024);
        assert_eq!(config.writeback_low_percent, 33);
        assert_eq!(config.writeback_high_percent, 66);
    }

    #[test]
    fn test_rejects_oversized_blocks() {
        let config = IoConfig {
            sectors_per_block: 128,
            ..IoConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let config = IoConfig {
            writeback_low_percent: 70,
            writeback_high_percent: 50,
            ..IoConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: IoConfig = toml::from_str(
            r#"
            engine = "sync"
            cache_blocks = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.engine, EngineKind::Sync);
        assert_eq!(config.cache_blocks, 16);
        assert_eq!(config.sectors_per_block, 64);
        assert!(config.use_direct_io);
    }
}
