//! Checkpoint reference tracking.
//!
//! The real checkpoint stream is out of scope; what the pager needs from
//! it is reference counting: an item referenced by the open checkpoint is
//! pinned in memory and must not be ejected. Pins are tracked by key, and
//! closing the open checkpoint releases all of them.

use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct CheckpointManager {
    open: Mutex<HashSet<Bytes>>,
    next_id: AtomicU64,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record a mutation in the open checkpoint, pinning the key.
    pub fn pin(&self, key: Bytes) {
        self.open.lock().insert(key);
    }

    /// Does the open checkpoint still hold a reference to this key?
    pub fn is_pinned(&self, key: &[u8]) -> bool {
        self.open.lock().contains(key)
    }

    pub fn num_pinned(&self) -> usize {
        self.open.lock().len()
    }

    /// Close the open checkpoint, releasing every reference it held, and
    /// start a new one. Returns the new checkpoint id.
    pub fn create_new_checkpoint(&self) -> u64 {
        self.open.lock().clear();
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}
