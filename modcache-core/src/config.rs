//! Configuration for the module source cache.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the module source cache.
///
/// `enabled` carries the runtime-mode flag: when false, bulk checks report
/// every id as absent and writes are dropped, without touching storage.
/// The flag is fixed at construction for the lifetime of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether caching is active for this process.
    pub enabled: bool,
    /// Directory backing the persistent store. With no directory the
    /// persistent engine reports itself unavailable and the cache degrades
    /// to always-miss.
    pub dir: Option<PathBuf>,
    /// How long buffered writes wait before a flush is attempted.
    pub flush_delay: Duration,
    /// Maximum size of the memory-mapped store in megabytes.
    pub map_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            flush_delay: Duration::from_millis(100),
            map_size_mb: 512,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the store directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Set the flush delay.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Set the maximum store size in megabytes.
    pub fn with_map_size_mb(mut self, mb: usize) -> Self {
        self.map_size_mb = mb;
        self
    }
}
