//! MODCACHE Core - Module Source Cache Types
//!
//! Pure data structures with no behavior. The storage crate depends on this.
//! This crate contains ONLY data types, configuration, and errors - no
//! caching logic.

pub mod config;
pub mod error;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};

use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Stable identifier for a loadable unit of code, independent of its content.
pub type ModuleId = String;

/// Opaque caller-supplied token identifying a specific content revision.
/// Compared only for equality - typically a content hash or fingerprint.
pub type VersionTag = String;

/// Cached module source payload.
pub type SourceBlob = String;

// ============================================================================
// PERSISTENT RECORDS
// ============================================================================

/// One record per module id, keyed by `id` in the `versions_by_id` container.
///
/// Holds the most recently cached version tag for that id, not the source
/// itself. The source lives in a [`SourceRecord`] keyed by the tag, so ids
/// that resolve to identical content share one stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// The module id this record belongs to.
    pub id: ModuleId,
    /// The version tag that was current when the source was cached.
    pub version: VersionTag,
}

/// One record per distinct version tag, keyed by `version` in the
/// `sources_by_version` container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// The version tag identifying this payload.
    pub version: VersionTag,
    /// The cached source.
    pub source: SourceBlob,
}

/// A buffered cache write: the version tag and source to remember for one
/// module id at the next flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSource {
    /// The version tag to record for the module id.
    pub version: VersionTag,
    /// The source to store under that tag.
    pub source: SourceBlob,
}

impl PendingSource {
    /// Create a pending entry from a version tag and its source.
    pub fn new(version: impl Into<VersionTag>, source: impl Into<SourceBlob>) -> Self {
        Self {
            version: version.into(),
            source: source.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
