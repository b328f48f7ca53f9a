//! Error types for module source cache operations

use thiserror::Error;

/// Errors raised by the module source cache and its storage engines.
///
/// `Unavailable` and `Open` mean the persistent store could not be reached
/// at all; the cache degrades to always-miss for the rest of the process and
/// neither error is ever surfaced to a user of the module loader. `Read`
/// aborts a single bulk check, `Write` a single flush cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("No storage engine available: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to open module source store: {reason}")]
    Open { reason: String },

    #[error("Storage read failed: {reason}")]
    Read { reason: String },

    #[error("Storage write failed: {reason}")]
    Write { reason: String },
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
