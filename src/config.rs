//! Configuration for fatwal
//!
//! Centralized configuration with sensible defaults.

use crate::error::{FatWalError, Result};
use crate::log::BASE_SIZE;

/// Main configuration for a fault tolerant log
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Log File Configuration
    // -------------------------------------------------------------------------
    /// Maximum size of the whole log file in bytes.
    /// Layout:
    ///   Header | FAT chain | Content header | Entries...
    /// The header stores the total size in 16 bits, so this cannot exceed 65535.
    pub log_capacity: usize,

    /// Byte offset in the boot sector where the log start cluster is recorded
    pub boot_index: usize,

    // -------------------------------------------------------------------------
    // Cleanup Configuration
    // -------------------------------------------------------------------------
    /// Size of the chain cleanup scratch cache in bytes (4 bytes per cluster)
    pub cleanup_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_capacity: 3072,
            boot_index: 116,
            cleanup_cache_size: 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Number of clusters one cleanup session may cache
    pub fn cleanup_session_clusters(&self) -> usize {
        self.cleanup_cache_size / 4
    }

    /// Check that the values describe a usable log
    pub fn validate(&self) -> Result<()> {
        if self.log_capacity < BASE_SIZE {
            return Err(FatWalError::Config(format!(
                "log capacity {} is below the {} byte log base",
                self.log_capacity, BASE_SIZE
            )));
        }

        if self.log_capacity > u16::MAX as usize {
            return Err(FatWalError::Config(format!(
                "log capacity {} exceeds the 16-bit size field",
                self.log_capacity
            )));
        }

        if self.cleanup_session_clusters() == 0 {
            return Err(FatWalError::Config(format!(
                "cleanup cache of {} bytes holds no clusters",
                self.cleanup_cache_size
            )));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum log file size (in bytes)
    pub fn log_capacity(mut self, bytes: usize) -> Self {
        self.config.log_capacity = bytes;
        self
    }

    /// Set the boot sector offset of the log start cluster
    pub fn boot_index(mut self, offset: usize) -> Self {
        self.config.boot_index = offset;
        self
    }

    /// Set the cleanup cache size (in bytes)
    pub fn cleanup_cache_size(mut self, bytes: usize) -> Self {
        self.config.cleanup_cache_size = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
