//! MODCACHE Storage - Engines and the Persistent Module Source Cache
//!
//! A lazy module loader asks this crate, in bulk, whether it already holds
//! the source matching a given version of each module id, and hands it
//! freshly fetched sources to remember for next time. Storage follows a
//! two-level indirection: `versions_by_id` maps each id to the version tag
//! it was last cached at, and `sources_by_version` maps each distinct tag
//! to the source itself, so identical content cached under many ids is
//! stored once.
//!
//! The cache degrades, never fails: without a usable store every check is a
//! miss and every write a no-op, and the module loader falls back to its
//! non-cached path.

pub mod cache;
pub mod engine;

pub use cache::{CacheStats, ModuleSourceCache};
pub use engine::{
    Container, LmdbEngine, MemoryEngine, ReadTransaction, StorageEngine, StoreHandle,
    WriteTransaction,
};

// Re-export the core types callers need to build requests and entries.
pub use modcache_core::{
    CacheConfig, CacheError, CacheResult, ModuleId, PendingSource, SourceBlob, SourceRecord,
    VersionRecord, VersionTag,
};
