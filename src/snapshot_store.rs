//! A thread-safe in-memory slot for the currently active [`Snapshot`].
use std::sync::{Arc, RwLock};

use crate::toggles::Snapshot;

/// `SnapshotStore` provides concurrent access for readers (evaluation) and a writer (the
/// repository).
///
/// A `Snapshot` is immutable and only ever replaced completely, so readers see either the old or
/// the new snapshot, never a mix of both. The lock is held only for the pointer swap.
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Get the active snapshot. Returns `None` if nothing was loaded or fetched yet.
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding snapshot lock should not panic");

        snapshot.clone()
    }

    /// Set a new snapshot, returning the previous one.
    pub fn set(&self, snapshot: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding snapshot lock should not panic");

        std::mem::replace(&mut *slot, Some(snapshot))
    }
}
