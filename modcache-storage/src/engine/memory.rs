//! In-memory storage engine.
//!
//! HashMap-backed engine used by tests and by environments without a
//! persistent store. Read transactions take a snapshot of both containers
//! when they open, mirroring the snapshot isolation of the LMDB engine, and
//! write transactions stage puts until commit.
//!
//! The engine counts opens, transactions, and individual operations, and can
//! inject failures and per-operation latency, so tests can assert exactly
//! how the cache drives its storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use modcache_core::{CacheError, CacheResult};

use super::{Container, ReadTransaction, StorageEngine, StoreHandle, WriteTransaction};

#[derive(Default)]
struct MemoryState {
    versions: HashMap<String, Vec<u8>>,
    sources: HashMap<String, Vec<u8>>,
}

impl MemoryState {
    fn container(&self, container: Container) -> &HashMap<String, Vec<u8>> {
        match container {
            Container::VersionsById => &self.versions,
            Container::SourcesByVersion => &self.sources,
        }
    }

    fn container_mut(&mut self, container: Container) -> &mut HashMap<String, Vec<u8>> {
        match container {
            Container::VersionsById => &mut self.versions,
            Container::SourcesByVersion => &mut self.sources,
        }
    }
}

#[derive(Default)]
struct MemoryCounters {
    opens: AtomicUsize,
    read_txns: AtomicUsize,
    write_txns: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
    commits: AtomicUsize,
    live_read_txns: AtomicUsize,
    writes_begun_during_read: AtomicUsize,
}

struct MemoryInner {
    state: RwLock<MemoryState>,
    counters: MemoryCounters,
    op_delay: Mutex<Option<Duration>>,
    fail_open: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// In-memory storage engine with operation counters and failure injection.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an empty in-memory engine.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: RwLock::new(MemoryState::default()),
                counters: MemoryCounters::default(),
                op_delay: Mutex::new(None),
                fail_open: AtomicBool::new(false),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Sleep this long inside every get (or stop sleeping with `None`), so
    /// tests can hold transactions open across interleavings.
    pub fn set_op_delay(&self, delay: Option<Duration>) {
        *self.inner.op_delay.lock().expect("op_delay lock poisoned") = delay;
    }

    /// Make the next `open` call fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every get fail while set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every put fail while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `open` calls the engine has served.
    pub fn opens(&self) -> usize {
        self.inner.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of read transactions ever opened.
    pub fn read_transactions_opened(&self) -> usize {
        self.inner.counters.read_txns.load(Ordering::SeqCst)
    }

    /// Number of write transactions ever opened.
    pub fn write_transactions_opened(&self) -> usize {
        self.inner.counters.write_txns.load(Ordering::SeqCst)
    }

    /// Number of get operations served.
    pub fn gets(&self) -> usize {
        self.inner.counters.gets.load(Ordering::SeqCst)
    }

    /// Number of put operations served.
    pub fn puts(&self) -> usize {
        self.inner.counters.puts.load(Ordering::SeqCst)
    }

    /// Number of write transactions committed.
    pub fn commits(&self) -> usize {
        self.inner.counters.commits.load(Ordering::SeqCst)
    }

    /// Read transactions currently open.
    pub fn live_read_transactions(&self) -> usize {
        self.inner.counters.live_read_txns.load(Ordering::SeqCst)
    }

    /// Write transactions that were begun while a read transaction was
    /// still open. The cache's flush deferral keeps this at zero.
    pub fn writes_begun_during_read(&self) -> usize {
        self.inner
            .counters
            .writes_begun_during_read
            .load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(&self) -> CacheResult<Arc<dyn StoreHandle>> {
        self.inner.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(CacheError::Open {
                reason: "injected open failure".to_string(),
            });
        }
        Ok(Arc::new(MemoryHandle {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryHandle {
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn begin_read(&self) -> CacheResult<Arc<dyn ReadTransaction>> {
        let counters = &self.inner.counters;
        counters.read_txns.fetch_add(1, Ordering::SeqCst);
        counters.live_read_txns.fetch_add(1, Ordering::SeqCst);

        let snapshot = {
            let state = self.inner.state.read().map_err(|_| CacheError::Read {
                reason: "engine state lock poisoned".to_string(),
            })?;
            MemoryState {
                versions: state.versions.clone(),
                sources: state.sources.clone(),
            }
        };

        Ok(Arc::new(MemoryReadTxn {
            snapshot,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn begin_write(&self) -> CacheResult<Box<dyn WriteTransaction>> {
        let counters = &self.inner.counters;
        counters.write_txns.fetch_add(1, Ordering::SeqCst);
        if counters.live_read_txns.load(Ordering::SeqCst) > 0 {
            counters
                .writes_begun_during_read
                .fetch_add(1, Ordering::SeqCst);
        }

        Ok(Box::new(MemoryWriteTxn {
            staged: Vec::new(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryReadTxn {
    snapshot: MemoryState,
    inner: Arc<MemoryInner>,
}

impl Drop for MemoryReadTxn {
    fn drop(&mut self) {
        self.inner
            .counters
            .live_read_txns
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadTransaction for MemoryReadTxn {
    async fn get(&self, container: Container, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let delay = *self.inner.op_delay.lock().map_err(|_| CacheError::Read {
            reason: "op_delay lock poisoned".to_string(),
        })?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.inner.counters.gets.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Read {
                reason: "injected read failure".to_string(),
            });
        }

        Ok(self.snapshot.container(container).get(key).cloned())
    }
}

struct MemoryWriteTxn {
    staged: Vec<(Container, String, Vec<u8>)>,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl WriteTransaction for MemoryWriteTxn {
    async fn put(&mut self, container: Container, key: &str, value: &[u8]) -> CacheResult<()> {
        self.inner.counters.puts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Write {
                reason: "injected write failure".to_string(),
            });
        }
        self.staged
            .push((container, key.to_owned(), value.to_vec()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> CacheResult<()> {
        let MemoryWriteTxn { staged, inner } = *self;
        {
            let mut state = inner.state.write().map_err(|_| CacheError::Write {
                reason: "engine state lock poisoned".to_string(),
            })?;
            for (container, key, value) in staged {
                state.container_mut(container).insert(key, value);
            }
        }
        inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
