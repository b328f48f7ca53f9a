//! The persistent module source cache.
//!
//! [`ModuleSourceCache`] answers bulk "do you already have the source
//! matching version V for module id M?" queries and accepts bulk writes of
//! newly computed (id, version, source) triples. Reads share one readonly
//! transaction across overlapping calls; writes accumulate in a pending
//! buffer and flush on a debounce timer that stands aside while reads are
//! in flight.
//!
//! Caching is an optimization, never a correctness requirement: a store
//! that cannot be opened silently degrades every check to a miss and every
//! write to a no-op, and a loader using this cache must treat a rejected
//! `check_many` the same as an all-miss batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use modcache_core::{
    CacheConfig, CacheError, CacheResult, ModuleId, PendingSource, SourceBlob, SourceRecord,
    VersionRecord, VersionTag,
};

use crate::engine::{
    Container, LmdbEngine, ReadTransaction, StorageEngine, StoreHandle, WriteTransaction,
};

use super::buffer::WriteBuffer;
use super::coordinator::ReadCoordinator;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requested ids answered with a cached source.
    pub hits: u64,
    /// Requested ids answered as absent.
    pub misses: u64,
    /// Flush cycles that committed.
    pub flushes: u64,
    /// Flush cycles abandoned on a storage error.
    pub flush_failures: u64,
    /// Entries durably written across all flushes.
    pub entries_written: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    entries_written: AtomicU64,
}

/// Persistent, version-keyed cache for compiled module sources.
///
/// # Example
///
/// ```ignore
/// let cache = ModuleSourceCache::persistent(
///     CacheConfig::new().with_dir("/var/cache/modcache"),
/// );
///
/// // Which of these do we already have?
/// let cached = cache.check_many(&requested_versions).await?;
///
/// // Remember freshly fetched sources for next time.
/// cache.set_many(fetched);
/// ```
pub struct ModuleSourceCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    engine: Arc<dyn StorageEngine>,
    config: CacheConfig,
    handle: OnceCell<Option<Arc<dyn StoreHandle>>>,
    readers: ReadCoordinator,
    buffer: WriteBuffer,
    stats: StatCounters,
}

impl ModuleSourceCache {
    /// Create a cache over the given storage engine.
    pub fn new(engine: Arc<dyn StorageEngine>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                engine,
                config,
                handle: OnceCell::new(),
                readers: ReadCoordinator::new(),
                buffer: WriteBuffer::new(),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Create a cache over the LMDB engine described by the configuration.
    ///
    /// The store opens lazily on first use; a configuration without a store
    /// directory yields a cache that degrades to always-miss.
    pub fn persistent(config: CacheConfig) -> Self {
        let engine = Arc::new(LmdbEngine::from_config(&config));
        Self::new(engine, config)
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get a snapshot of the usage statistics.
    pub fn stats(&self) -> CacheStats {
        let stats = &self.inner.stats;
        CacheStats {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            flushes: stats.flushes.load(Ordering::Relaxed),
            flush_failures: stats.flush_failures.load(Ordering::Relaxed),
            entries_written: stats.entries_written.load(Ordering::Relaxed),
        }
    }

    /// Report, for every requested id, the cached source matching the
    /// requested version tag, or `None`.
    ///
    /// An absent id, a differing stored tag, and a version record whose
    /// source record is missing are all identical misses. A storage read
    /// error aborts the whole call; the caller must treat that the same as
    /// an all-miss batch.
    pub async fn check_many(
        &self,
        requested: &HashMap<ModuleId, VersionTag>,
    ) -> CacheResult<HashMap<ModuleId, Option<SourceBlob>>> {
        // Every id starts absent; lookups below only ever upgrade to a hit.
        let mut sources: HashMap<ModuleId, Option<SourceBlob>> =
            requested.keys().map(|id| (id.clone(), None)).collect();

        if !self.inner.config.enabled {
            return Ok(sources);
        }
        let Some(handle) = self.inner.store_handle().await else {
            return Ok(sources);
        };

        let txn = self.inner.readers.acquire(&handle).await?;

        let lookups = requested.iter().map(|(id, version)| {
            let txn = Arc::clone(&txn);
            async move {
                let source = lookup_one(txn.as_ref(), id, version).await?;
                Ok::<(ModuleId, Option<SourceBlob>), CacheError>((id.clone(), source))
            }
        });
        let results = future::join_all(lookups).await;

        // Release only after every lookup for this call has settled, errors
        // included; other callers may keep the shared transaction alive.
        drop(txn);
        self.inner.readers.release().await;

        let mut hits = 0u64;
        for result in results {
            let (id, source) = result?;
            if let Some(source) = source {
                hits += 1;
                sources.insert(id, Some(source));
            }
        }

        let misses = sources.len() as u64 - hits;
        self.inner.stats.hits.fetch_add(hits, Ordering::Relaxed);
        self.inner.stats.misses.fetch_add(misses, Ordering::Relaxed);
        debug!(requested = sources.len(), hits, "bulk checked module sources");

        Ok(sources)
    }

    /// Buffer (id, version, source) triples for write-back.
    ///
    /// Fire-and-forget: entries merge into the pending buffer (last write
    /// per id wins) and a debounced flush persists them later, so the
    /// caller's module-load path never waits on a storage write. Must be
    /// called within a tokio runtime.
    pub fn set_many(&self, entries: HashMap<ModuleId, PendingSource>) {
        if !self.inner.config.enabled || entries.is_empty() {
            return;
        }
        if self.inner.buffer.merge(entries) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run_flush(inner));
        }
    }
}

impl Clone for ModuleSourceCache {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheInner {
    /// The memoized store handle, or `None` once an open has failed.
    ///
    /// Concurrent first calls share one open; the outcome, failure
    /// included, is memoized for the process lifetime.
    async fn store_handle(&self) -> Option<Arc<dyn StoreHandle>> {
        self.handle
            .get_or_init(|| async {
                match self.engine.open().await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "module source cache disabled: store unavailable");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn flush_batch(&self, batch: HashMap<ModuleId, PendingSource>) {
        let total = batch.len();
        let Some(handle) = self.store_handle().await else {
            // Store unavailable: the entries are dropped, the cache stays
            // best-effort.
            return;
        };

        match self.write_batch(handle.as_ref(), batch).await {
            Ok(written) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .entries_written
                    .fetch_add(written, Ordering::Relaxed);
                debug!(entries = written, "flushed module sources");
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, entries = total, "flush cycle abandoned; entries not cached");
            }
        }
    }

    async fn write_batch(
        &self,
        handle: &dyn StoreHandle,
        batch: HashMap<ModuleId, PendingSource>,
    ) -> CacheResult<u64> {
        let mut txn = handle.begin_write().await?;
        let mut written = 0u64;
        for (id, entry) in batch {
            if let Err(e) = write_entry(txn.as_mut(), &id, &entry).await {
                // Best-effort: this id is simply not cached this cycle.
                warn!(error = %e, module = %id, "failed to write cache entry; skipped");
                continue;
            }
            written += 1;
        }
        txn.commit().await?;
        Ok(written)
    }
}

/// The debounced flush task. Exactly one runs while the buffer is armed.
async fn run_flush(inner: Arc<CacheInner>) {
    loop {
        // Debounce, then stand aside for as long as a read transaction is
        // active: updating the cache matters less than reading from it.
        tokio::time::sleep(inner.config.flush_delay).await;
        if inner.readers.active().await {
            debug!("flush deferred: read transaction active");
            continue;
        }

        let batch = inner.buffer.take_batch();
        if !batch.is_empty() {
            inner.flush_batch(batch).await;
        }

        if !inner.buffer.disarm_or_continue() {
            return;
        }
    }
}

async fn lookup_one(
    txn: &dyn ReadTransaction,
    id: &str,
    requested: &str,
) -> CacheResult<Option<SourceBlob>> {
    let Some(bytes) = txn.get(Container::VersionsById, id).await? else {
        return Ok(None);
    };
    let record: VersionRecord = serde_json::from_slice(&bytes).map_err(|e| CacheError::Read {
        reason: format!("undecodable version record for {id}: {e}"),
    })?;

    // A tag that differs from the requested one is the same miss as no
    // record at all; the stored source belongs to a version the caller no
    // longer wants.
    if record.version != requested {
        return Ok(None);
    }

    let Some(bytes) = txn.get(Container::SourcesByVersion, &record.version).await? else {
        return Ok(None);
    };
    let record: SourceRecord = serde_json::from_slice(&bytes).map_err(|e| CacheError::Read {
        reason: format!("undecodable source record for {requested}: {e}"),
    })?;
    Ok(Some(record.source))
}

async fn write_entry(
    txn: &mut dyn WriteTransaction,
    id: &str,
    entry: &PendingSource,
) -> CacheResult<()> {
    let version_record = VersionRecord {
        id: id.to_owned(),
        version: entry.version.clone(),
    };
    let bytes = serde_json::to_vec(&version_record).map_err(|e| CacheError::Write {
        reason: format!("unencodable version record for {id}: {e}"),
    })?;
    txn.put(Container::VersionsById, id, &bytes).await?;

    let source_record = SourceRecord {
        version: entry.version.clone(),
        source: entry.source.clone(),
    };
    let bytes = serde_json::to_vec(&source_record).map_err(|e| CacheError::Write {
        reason: format!("unencodable source record for {}: {e}", entry.version),
    })?;
    txn.put(Container::SourcesByVersion, &entry.version, &bytes)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::time::Duration;

    const FLUSH_DELAY: Duration = Duration::from_millis(25);

    fn make_cache(engine: &MemoryEngine) -> ModuleSourceCache {
        let config = CacheConfig::new().with_flush_delay(FLUSH_DELAY);
        ModuleSourceCache::new(Arc::new(engine.clone()), config)
    }

    fn request(pairs: &[(&str, &str)]) -> HashMap<ModuleId, VersionTag> {
        pairs
            .iter()
            .map(|(id, version)| (id.to_string(), version.to_string()))
            .collect()
    }

    fn entries(pairs: &[(&str, &str, &str)]) -> HashMap<ModuleId, PendingSource> {
        pairs
            .iter()
            .map(|(id, version, source)| (id.to_string(), PendingSource::new(*version, *source)))
            .collect()
    }

    async fn wait_for_commits(engine: &MemoryEngine, commits: usize) {
        for _ in 0..400 {
            if engine.commits() >= commits {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("flush did not commit within timeout");
    }

    #[tokio::test]
    async fn test_never_written_ids_are_absent() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        let result = cache
            .check_many(&request(&[("m1", "v1"), ("m2", "v2")]))
            .await
            .expect("check_many should succeed");

        assert_eq!(result.len(), 2);
        assert_eq!(result["m1"], None);
        assert_eq!(result["m2"], None);
        assert_eq!(engine.read_transactions_opened(), 1);
    }

    #[tokio::test]
    async fn test_set_then_check_returns_exact_source() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        cache.set_many(entries(&[("m1", "vA", "export default 1;")]));
        wait_for_commits(&engine, 1).await;

        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"].as_deref(), Some("export default 1;"));
    }

    #[tokio::test]
    async fn test_last_write_before_flush_wins() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        // Both writes land before the debounce fires, so one flush cycle
        // persists only the later pair.
        cache.set_many(entries(&[("m1", "v1", "old source")]));
        cache.set_many(entries(&[("m1", "v2", "new source")]));
        wait_for_commits(&engine, 1).await;

        assert_eq!(engine.write_transactions_opened(), 1);
        assert_eq!(engine.puts(), 2, "one version record and one source record");

        let result = cache
            .check_many(&request(&[("m1", "v2")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"].as_deref(), Some("new source"));

        let stale = cache
            .check_many(&request(&[("m1", "v1")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(stale["m1"], None);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_miss_not_an_error() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        cache.set_many(entries(&[("m1", "v1", "first")]));
        wait_for_commits(&engine, 1).await;
        cache.set_many(entries(&[("m1", "v2", "second")]));
        wait_for_commits(&engine, 2).await;

        let result = cache
            .check_many(&request(&[("m1", "v1")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"], None);

        let current = cache
            .check_many(&request(&[("m1", "v2")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(current["m1"].as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_overlapping_checks_share_one_transaction() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        cache.set_many(entries(&[("m1", "vA", "one"), ("m2", "vB", "two")]));
        wait_for_commits(&engine, 1).await;

        // Slow every get so the first call still holds the shared
        // transaction when the second call acquires.
        engine.set_op_delay(Some(Duration::from_millis(40)));
        let opened_before = engine.read_transactions_opened();

        let req_first = request(&[("m1", "vA")]);
        let req_second = request(&[("m2", "vB"), ("m3", "vC")]);
        let (first, second) = tokio::join!(
            cache.check_many(&req_first),
            cache.check_many(&req_second),
        );

        let first = first.expect("check_many should succeed");
        let second = second.expect("check_many should succeed");
        assert_eq!(first["m1"].as_deref(), Some("one"));
        assert_eq!(second["m2"].as_deref(), Some("two"));
        assert_eq!(second["m3"], None);

        assert_eq!(
            engine.read_transactions_opened() - opened_before,
            1,
            "overlapping calls must share one read transaction"
        );
        assert_eq!(engine.live_read_transactions(), 0);
    }

    #[tokio::test]
    async fn test_flush_defers_until_reads_finish() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        // A slow bulk check holds the shared read transaction well past
        // several debounce periods.
        engine.set_op_delay(Some(Duration::from_millis(200)));
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.check_many(&request(&[("m1", "vA")])).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.set_many(entries(&[("m1", "vA", "deferred source")]));

        let result = reader
            .await
            .expect("reader task should not panic")
            .expect("check_many should succeed");
        assert_eq!(result["m1"], None, "written entry had not flushed yet");

        engine.set_op_delay(None);
        wait_for_commits(&engine, 1).await;

        assert_eq!(
            engine.writes_begun_during_read(),
            0,
            "flush must never contend with an in-flight read transaction"
        );

        // Deferral delayed the entry but did not drop it.
        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"].as_deref(), Some("deferred source"));
    }

    #[tokio::test]
    async fn test_disabled_mode_never_touches_storage() {
        let engine = MemoryEngine::new();
        let config = CacheConfig::new()
            .with_enabled(false)
            .with_flush_delay(FLUSH_DELAY);
        let cache = ModuleSourceCache::new(Arc::new(engine.clone()), config);

        let result = cache
            .check_many(&request(&[("m1", "v1")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"], None);

        cache.set_many(entries(&[("m1", "v1", "never stored")]));
        tokio::time::sleep(FLUSH_DELAY * 4).await;

        assert_eq!(engine.opens(), 0);
        assert_eq!(engine.read_transactions_opened(), 0);
        assert_eq!(engine.write_transactions_opened(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_degrades_to_always_miss() {
        let engine = MemoryEngine::new();
        engine.set_fail_open(true);
        let cache = make_cache(&engine);

        let result = cache
            .check_many(&request(&[("m1", "v1")]))
            .await
            .expect("a degraded cache reports misses, not errors");
        assert_eq!(result["m1"], None);

        // The open is not retried; the failure is memoized.
        let result = cache
            .check_many(&request(&[("m2", "v2")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m2"], None);
        assert_eq!(engine.opens(), 1);

        cache.set_many(entries(&[("m1", "v1", "dropped")]));
        tokio::time::sleep(FLUSH_DELAY * 4).await;
        assert_eq!(engine.write_transactions_opened(), 0);
        assert_eq!(engine.opens(), 1);
    }

    #[tokio::test]
    async fn test_read_error_aborts_the_whole_batch() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        cache.set_many(entries(&[("m1", "vA", "cached")]));
        wait_for_commits(&engine, 1).await;

        engine.set_fail_reads(true);
        let err = cache
            .check_many(&request(&[("m1", "vA"), ("m2", "vB")]))
            .await
            .expect_err("check_many should fail");
        assert!(matches!(err, CacheError::Read { .. }));
        assert_eq!(engine.live_read_transactions(), 0, "release still happened");

        // The failure does not poison later batches.
        engine.set_fail_reads(false);
        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"].as_deref(), Some("cached"));
    }

    #[tokio::test]
    async fn test_failed_flush_drops_entries_without_poisoning_later_cycles() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        engine.set_fail_writes(true);
        cache.set_many(entries(&[("m1", "vA", "lost this cycle")]));
        wait_for_commits(&engine, 1).await;

        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"], None, "failed cycle cached nothing");

        engine.set_fail_writes(false);
        cache.set_many(entries(&[("m1", "vA", "cached this cycle")]));
        wait_for_commits(&engine, 2).await;

        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"].as_deref(), Some("cached this cycle"));
    }

    #[tokio::test]
    async fn test_version_record_without_source_record_is_a_miss() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        // Write a version record whose source record is missing, as a flush
        // interrupted between containers could leave behind.
        let handle = engine.open().await.expect("open should succeed");
        let mut wtxn = handle.begin_write().await.expect("begin_write should succeed");
        let record = VersionRecord {
            id: "m1".to_string(),
            version: "vA".to_string(),
        };
        let bytes = serde_json::to_vec(&record).expect("encode should succeed");
        wtxn.put(Container::VersionsById, "m1", &bytes)
            .await
            .expect("put should succeed");
        wtxn.commit().await.expect("commit should succeed");

        let result = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["m1"], None);
    }

    #[tokio::test]
    async fn test_dynamic_import_scenario() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        cache.set_many(entries(&[("m1", "vA", "console.log(1)")]));
        wait_for_commits(&engine, 1).await;

        let hit = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(hit["m1"].as_deref(), Some("console.log(1)"));

        let miss = cache
            .check_many(&request(&[("m1", "vB")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(miss["m1"], None);
    }

    #[tokio::test]
    async fn test_shared_source_is_stored_once() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        // Two ids resolving to identical content share one source record.
        cache.set_many(entries(&[
            ("pkg/a.js", "hash-1", "shared body"),
            ("pkg/b.js", "hash-1", "shared body"),
        ]));
        wait_for_commits(&engine, 1).await;

        // Two version records, one source record (same key written twice).
        assert_eq!(engine.puts(), 4);

        let result = cache
            .check_many(&request(&[("pkg/a.js", "hash-1"), ("pkg/b.js", "hash-1")]))
            .await
            .expect("check_many should succeed");
        assert_eq!(result["pkg/a.js"].as_deref(), Some("shared body"));
        assert_eq!(result["pkg/b.js"].as_deref(), Some("shared body"));
    }

    #[tokio::test]
    async fn test_stats_track_hits_misses_and_flushes() {
        let engine = MemoryEngine::new();
        let cache = make_cache(&engine);

        let _ = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");

        cache.set_many(entries(&[("m1", "vA", "body")]));
        wait_for_commits(&engine, 1).await;

        let _ = cache
            .check_many(&request(&[("m1", "vA")]))
            .await
            .expect("check_many should succeed");

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.flush_failures, 0);
        assert_eq!(stats.entries_written, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
    }
}
