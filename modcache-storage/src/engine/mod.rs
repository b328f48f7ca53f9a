//! Storage engine boundary.
//!
//! The cache consumes a persistent key-value engine through the traits in
//! this module: named containers with a unique key per record, and two
//! transaction isolation levels (readonly, readwrite) spanning both
//! containers. [`LmdbEngine`] is the shipped persistent implementation;
//! [`MemoryEngine`] backs tests and engine-less environments.
//!
//! # Transaction lifetime
//!
//! A [`ReadTransaction`] stays open for as long as the value is referenced;
//! dropping the last reference closes it. A [`WriteTransaction`] persists
//! nothing until [`WriteTransaction::commit`] and aborts if dropped without
//! committing.

pub mod lmdb;
pub mod memory;

pub use lmdb::LmdbEngine;
pub use memory::MemoryEngine;

use std::sync::Arc;

use async_trait::async_trait;
use modcache_core::CacheResult;

/// The two persistent containers, related by a shared version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// `versions_by_id`: one record per module id, keyed by id.
    VersionsById,
    /// `sources_by_version`: one record per version tag, keyed by tag.
    SourcesByVersion,
}

impl Container {
    /// Stable container name used by persistent engines.
    pub fn name(&self) -> &'static str {
        match self {
            Container::VersionsById => "versions_by_id",
            Container::SourcesByVersion => "sources_by_version",
        }
    }
}

/// A persistent key-value engine that can open a store handle.
///
/// `open` is the engine-level operation behind the cache's lazy open-once
/// contract; the cache calls it at most once per process and memoizes the
/// outcome, so implementations need not cache the handle themselves.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Open the store, creating both containers if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] when no engine is present in the
    /// environment and [`CacheError::Open`] when the open itself fails.
    /// Either error disables caching for the session.
    ///
    /// [`CacheError::Unavailable`]: modcache_core::CacheError::Unavailable
    /// [`CacheError::Open`]: modcache_core::CacheError::Open
    async fn open(&self) -> CacheResult<Arc<dyn StoreHandle>>;
}

/// An opened store. Never closed once opened; lives for the process.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Open a readonly transaction spanning both containers.
    async fn begin_read(&self) -> CacheResult<Arc<dyn ReadTransaction>>;

    /// Open a readwrite transaction spanning both containers.
    async fn begin_write(&self) -> CacheResult<Box<dyn WriteTransaction>>;
}

/// A readonly transaction over both containers.
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Get the record stored under `key`, or `None` if absent.
    async fn get(&self, container: Container, key: &str) -> CacheResult<Option<Vec<u8>>>;
}

/// A readwrite transaction over both containers.
#[async_trait]
pub trait WriteTransaction: Send {
    /// Insert or overwrite the record stored under `key`.
    async fn put(&mut self, container: Container, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Durably commit every put issued against this transaction.
    async fn commit(self: Box<Self>) -> CacheResult<()>;
}
