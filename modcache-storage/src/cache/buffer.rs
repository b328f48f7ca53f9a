//! Pending write buffer and flush scheduler state.
//!
//! `set_many` merges entries here and the debounced flush task drains them.
//! The armed flag is the single piece of scheduler state: exactly one flush
//! task exists while it is set, so repeated `set_many` calls before the
//! flush fires never stack additional timers, and flush cycles are strictly
//! serialized.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use modcache_core::{ModuleId, PendingSource};

pub(crate) struct WriteBuffer {
    state: Mutex<BufferState>,
}

#[derive(Default)]
struct BufferState {
    pending: HashMap<ModuleId, PendingSource>,
    flush_armed: bool,
}

impl WriteBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Merge entries into the pending buffer, last write per id winning.
    ///
    /// Returns true when the caller must spawn the flush task; false when
    /// one is already armed and will pick these entries up.
    pub(crate) fn merge(&self, entries: HashMap<ModuleId, PendingSource>) -> bool {
        let mut state = self.lock();
        state.pending.extend(entries);
        if state.flush_armed {
            false
        } else {
            state.flush_armed = true;
            true
        }
    }

    /// Hand the accumulated batch to a flush, leaving a fresh buffer so
    /// `set_many` calls arriving during the write accumulate separately.
    pub(crate) fn take_batch(&self) -> HashMap<ModuleId, PendingSource> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Disarm after a flush cycle. Returns true when entries arrived during
    /// the write, in which case the buffer stays armed and the caller must
    /// run another cycle instead of exiting.
    pub(crate) fn disarm_or_continue(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_empty() {
            state.flush_armed = false;
            false
        } else {
            true
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Nothing panics while holding this lock.
        self.state.lock().expect("pending buffer lock poisoned")
    }
}
