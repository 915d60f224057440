//! vBucket: one partition of the keyspace.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use super::checkpoint::CheckpointManager;
use super::clock;
use super::hashtable::ItemTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VBucketState {
    Active = 0,
    Replica = 1,
    Pending = 2,
    Dead = 3,
}

impl VBucketState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Replica,
            2 => Self::Pending,
            _ => Self::Dead,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Replica => "replica",
            Self::Pending => "pending",
            Self::Dead => "dead",
        }
    }
}

pub struct VBucket {
    pub id: u16,
    state: AtomicU8,
    pub ht: ItemTable,
    pub checkpoints: CheckpointManager,
    num_non_resident: AtomicU64,
    /// High CAS issued by this vBucket; item age derives from the
    /// distance to this.
    max_cas: AtomicU64,
}

impl VBucket {
    /// New vBuckets start dead and must be brought online with a state
    /// change before use.
    pub fn new(id: u16, ht_shards: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(VBucketState::Dead as u8),
            ht: ItemTable::with_shard_amount(ht_shards),
            checkpoints: CheckpointManager::new(),
            num_non_resident: AtomicU64::new(0),
            max_cas: AtomicU64::new((clock::now_ms() as u64) << 16),
        }
    }

    #[inline]
    pub fn state(&self) -> VBucketState {
        VBucketState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, state: VBucketState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.state() != VBucketState::Dead
    }

    /// Live (non-deleted) items
    #[inline]
    pub fn num_items(&self) -> usize {
        self.ht.num_items()
    }

    #[inline]
    pub fn num_non_resident(&self) -> u64 {
        self.num_non_resident.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn incr_non_resident(&self) {
        self.num_non_resident.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr_non_resident(&self) {
        let _ = self
            .num_non_resident
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
    }

    /// Issue the next CAS for a mutation in this vBucket.
    #[inline]
    pub fn next_cas(&self) -> u64 {
        self.max_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Relaxed)
    }
}
