//! Shared read transaction coordination.
//!
//! Many overlapping bulk checks share one readonly transaction instead of
//! paying per-call transaction setup. The coordinator owns the transaction
//! reference and a count of in-flight callers: the 0→1 acquire opens the
//! transaction, the count-reaching-zero release drops it. Engines whose read
//! transactions live until dropped (LMDB, the memory engine) need nothing
//! more than this lease to keep the transaction alive.

use std::sync::Arc;

use tokio::sync::Mutex;

use modcache_core::CacheResult;

use crate::engine::{ReadTransaction, StoreHandle};

pub(crate) struct ReadCoordinator {
    state: Mutex<CoordinatorState>,
}

#[derive(Default)]
struct CoordinatorState {
    readers: usize,
    txn: Option<Arc<dyn ReadTransaction>>,
}

impl ReadCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Join the shared read transaction, opening it on the 0→1 transition.
    ///
    /// The coordinator mutex is held across the open, so concurrent callers
    /// arriving during it wait and then share the one transaction rather
    /// than opening their own.
    pub(crate) async fn acquire(
        &self,
        handle: &Arc<dyn StoreHandle>,
    ) -> CacheResult<Arc<dyn ReadTransaction>> {
        let mut state = self.state.lock().await;
        if let Some(txn) = state.txn.clone() {
            state.readers += 1;
            return Ok(txn);
        }

        let txn = handle.begin_read().await?;
        state.txn = Some(Arc::clone(&txn));
        state.readers = 1;
        Ok(txn)
    }

    /// Leave the shared read transaction, dropping it on the last release.
    ///
    /// Every successful [`acquire`](Self::acquire) must be paired with
    /// exactly one release, after all of the caller's reads have settled.
    pub(crate) async fn release(&self) {
        let mut state = self.state.lock().await;
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            state.txn = None;
        }
    }

    /// Whether any caller currently holds the shared transaction. Flushes
    /// consult this and stand aside while reads are in flight.
    pub(crate) async fn active(&self) -> bool {
        self.state.lock().await.readers > 0
    }
}
