//! LMDB-backed storage engine.
//!
//! Uses the heed crate to provide a memory-mapped, transactional store with
//! the two cache containers as named databases. LMDB transactions are bound
//! to the thread that opened them, so each [`ReadTransaction`] and
//! [`WriteTransaction`] is serviced by a dedicated worker thread that owns
//! the `RoTxn`/`RwTxn` and answers get/put/commit requests over a channel.
//! The transaction closes when the worker's channel does: for reads that is
//! when the last reference to the transaction object is dropped, for writes
//! on commit (or abort-on-drop).
//!
//! LMDB read transactions never expire on their own, so a shared read
//! transaction needs no keep-alive traffic; holding the object is the lease.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use modcache_core::{CacheConfig, CacheError, CacheResult};

use super::{Container, ReadTransaction, StorageEngine, StoreHandle, WriteTransaction};

/// Error type for LMDB engine internals.
#[derive(Debug, thiserror::Error)]
pub enum LmdbEngineError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// I/O error preparing the store directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbEngineError> for CacheError {
    fn from(e: LmdbEngineError) -> Self {
        CacheError::Open {
            reason: e.to_string(),
        }
    }
}

/// LMDB-backed storage engine.
///
/// Construction is cheap and infallible; the environment is opened on the
/// first (and only) [`StorageEngine::open`] call. An engine configured
/// without a store directory reports [`CacheError::Unavailable`] from that
/// call, which the cache treats as caching-disabled for the session.
pub struct LmdbEngine {
    dir: Option<PathBuf>,
    map_size_mb: usize,
}

impl LmdbEngine {
    /// Create an engine backed by the given directory.
    pub fn new(dir: impl Into<PathBuf>, map_size_mb: usize) -> Self {
        Self {
            dir: Some(dir.into()),
            map_size_mb,
        }
    }

    /// Create an engine from a cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            map_size_mb: config.map_size_mb,
        }
    }
}

#[async_trait]
impl StorageEngine for LmdbEngine {
    async fn open(&self) -> CacheResult<Arc<dyn StoreHandle>> {
        let Some(dir) = self.dir.clone() else {
            return Err(CacheError::Unavailable {
                reason: "no store directory configured".to_string(),
            });
        };

        let map_size = self.map_size_mb * 1024 * 1024;
        let handle = tokio::task::spawn_blocking(move || open_store(&dir, map_size))
            .await
            .map_err(|e| CacheError::Open {
                reason: e.to_string(),
            })??;

        Ok(Arc::new(handle))
    }
}

fn open_store(dir: &Path, map_size: usize) -> Result<LmdbHandle, LmdbEngineError> {
    std::fs::create_dir_all(dir)?;

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(2)
            .open(dir)
    }
    .map_err(|e| LmdbEngineError::EnvOpen(e.to_string()))?;

    let mut wtxn = env
        .write_txn()
        .map_err(|e| LmdbEngineError::EnvOpen(e.to_string()))?;

    let versions: Database<Str, Bytes> = env
        .create_database(&mut wtxn, Some(Container::VersionsById.name()))
        .map_err(|e| LmdbEngineError::DbOpen(e.to_string()))?;

    let sources: Database<Str, Bytes> = env
        .create_database(&mut wtxn, Some(Container::SourcesByVersion.name()))
        .map_err(|e| LmdbEngineError::DbOpen(e.to_string()))?;

    wtxn.commit()
        .map_err(|e| LmdbEngineError::EnvOpen(e.to_string()))?;

    debug!(dir = %dir.display(), "opened module source store");

    Ok(LmdbHandle {
        env,
        versions,
        sources,
    })
}

struct LmdbHandle {
    env: Env,
    versions: Database<Str, Bytes>,
    sources: Database<Str, Bytes>,
}

#[async_trait]
impl StoreHandle for LmdbHandle {
    async fn begin_read(&self) -> CacheResult<Arc<dyn ReadTransaction>> {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let env = self.env.clone();
        let versions = self.versions;
        let sources = self.sources;

        thread::Builder::new()
            .name("modcache-lmdb-read".to_string())
            .spawn(move || read_worker(env, versions, sources, ops_rx, ready_tx))
            .map_err(|e| CacheError::Read {
                reason: e.to_string(),
            })?;

        ready_rx
            .await
            .map_err(|_| CacheError::Read {
                reason: "read transaction worker exited before opening".to_string(),
            })?
            .map_err(|reason| CacheError::Read { reason })?;

        Ok(Arc::new(LmdbReadTxn { ops: ops_tx }))
    }

    async fn begin_write(&self) -> CacheResult<Box<dyn WriteTransaction>> {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let env = self.env.clone();
        let versions = self.versions;
        let sources = self.sources;

        thread::Builder::new()
            .name("modcache-lmdb-write".to_string())
            .spawn(move || write_worker(env, versions, sources, ops_rx, ready_tx))
            .map_err(|e| CacheError::Write {
                reason: e.to_string(),
            })?;

        ready_rx
            .await
            .map_err(|_| CacheError::Write {
                reason: "write transaction worker exited before opening".to_string(),
            })?
            .map_err(|reason| CacheError::Write { reason })?;

        Ok(Box::new(LmdbWriteTxn { ops: ops_tx }))
    }
}

enum ReadOp {
    Get {
        container: Container,
        key: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, String>>,
    },
}

fn read_worker(
    env: Env,
    versions: Database<Str, Bytes>,
    sources: Database<Str, Bytes>,
    mut ops: mpsc::UnboundedReceiver<ReadOp>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let rtxn = match env.read_txn() {
        Ok(rtxn) => rtxn,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Some(ReadOp::Get {
        container,
        key,
        reply,
    }) = ops.blocking_recv()
    {
        let db = match container {
            Container::VersionsById => versions,
            Container::SourcesByVersion => sources,
        };
        let result = db
            .get(&rtxn, &key)
            .map(|value| value.map(<[u8]>::to_vec))
            .map_err(|e| e.to_string());
        let _ = reply.send(result);
    }
    // Channel closed: the last reference was dropped and the transaction
    // ends with this thread.
}

struct LmdbReadTxn {
    ops: mpsc::UnboundedSender<ReadOp>,
}

#[async_trait]
impl ReadTransaction for LmdbReadTxn {
    async fn get(&self, container: Container, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(ReadOp::Get {
                container,
                key: key.to_owned(),
                reply: reply_tx,
            })
            .map_err(|_| CacheError::Read {
                reason: "read transaction already closed".to_string(),
            })?;
        reply_rx
            .await
            .map_err(|_| CacheError::Read {
                reason: "read transaction worker exited".to_string(),
            })?
            .map_err(|reason| CacheError::Read { reason })
    }
}

enum WriteOp {
    Put {
        container: Container,
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Commit {
        reply: oneshot::Sender<Result<(), String>>,
    },
}

fn write_worker(
    env: Env,
    versions: Database<Str, Bytes>,
    sources: Database<Str, Bytes>,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut wtxn = match env.write_txn() {
        Ok(wtxn) => wtxn,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Some(op) = ops.blocking_recv() {
        match op {
            WriteOp::Put {
                container,
                key,
                value,
                reply,
            } => {
                let db = match container {
                    Container::VersionsById => versions,
                    Container::SourcesByVersion => sources,
                };
                let result = db
                    .put(&mut wtxn, &key, &value)
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            WriteOp::Commit { reply } => {
                let _ = reply.send(wtxn.commit().map_err(|e| e.to_string()));
                return;
            }
        }
    }
    // Channel closed without a commit: the transaction aborts when wtxn
    // drops, discarding every put.
}

struct LmdbWriteTxn {
    ops: mpsc::UnboundedSender<WriteOp>,
}

#[async_trait]
impl WriteTransaction for LmdbWriteTxn {
    async fn put(&mut self, container: Container, key: &str, value: &[u8]) -> CacheResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(WriteOp::Put {
                container,
                key: key.to_owned(),
                value: value.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| CacheError::Write {
                reason: "write transaction already closed".to_string(),
            })?;
        reply_rx
            .await
            .map_err(|_| CacheError::Write {
                reason: "write transaction worker exited".to_string(),
            })?
            .map_err(|reason| CacheError::Write { reason })
    }

    async fn commit(self: Box<Self>) -> CacheResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(WriteOp::Commit { reply: reply_tx })
            .map_err(|_| CacheError::Write {
                reason: "write transaction already closed".to_string(),
            })?;
        reply_rx
            .await
            .map_err(|_| CacheError::Write {
                reason: "write transaction worker exited".to_string(),
            })?
            .map_err(|reason| CacheError::Write { reason })
    }
}
