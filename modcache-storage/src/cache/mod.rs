//! The module source cache.
//!
//! This module implements the cache over the engine boundary: the lazy
//! open-once store handle, the shared read transaction coordinator, the
//! bulk check path, and the debounced write-back buffer.
//!
//! # Concurrency design
//!
//! Overlapping [`ModuleSourceCache::check_many`] calls share one readonly
//! transaction, reference-counted by the coordinator; each call releases
//! only after all of its own per-id reads have settled. Writes never race
//! reads: the flush task re-schedules itself for as long as any bulk check
//! is in flight, trading write freshness for read latency.

pub mod source_cache;

mod buffer;
mod coordinator;

pub use source_cache::{CacheStats, ModuleSourceCache};
