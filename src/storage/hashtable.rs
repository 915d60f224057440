//! Sharded hash table of stored items.
//!
//! One power-of-two set of shards, each a `hashbrown::HashTable` behind a
//! cache-padded `parking_lot::RwLock`. A visitor walking the table holds
//! exactly one shard lock at a time; writers on other shards proceed
//! concurrently.

use ahash::RandomState;
use bytes::Bytes;
use crossbeam_utils::CachePadded;
use hashbrown::{HashTable, hash_table};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::item::StoredItem;

static HASHER: RandomState = RandomState::with_seeds(11, 17, 23, 31);

/// Calculate the hash of a key using stable ahash seeds.
#[inline(always)]
pub fn hash_key(key: &[u8]) -> u64 {
    HASHER.hash_one(key)
}

/// Decision a visitor makes for one item. The table applies structural
/// changes (`Remove`) under the shard lock it already holds; in-place
/// mutations are made by the visitor itself.
pub enum VisitAction {
    Keep,
    Remove,
    Stop,
}

/// How a table walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// Every shard was walked to the end
    Exhausted,
    /// The visitor asked to stop
    Stopped,
    /// The shared availability flag was cleared mid-walk
    Cancelled,
    /// The time budget ran out; resume from the returned shard
    Paused,
}

/// Per-vBucket item table
pub struct ItemTable {
    shift: u32,
    shards: Box<[CachePadded<RwLock<HashTable<StoredItem>>>]>,
    /// All entries, tombstones included
    entries: AtomicUsize,
    tombstones: AtomicUsize,
}

/// What an upsert displaced, if anything
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    pub old_mem_size: Option<usize>,
    pub replaced_tombstone: bool,
    pub replaced_non_resident: bool,
}

impl ItemTable {
    /// `shard_amount` must be a power of two.
    pub fn with_shard_amount(shard_amount: usize) -> Self {
        assert!(shard_amount.is_power_of_two());
        let shard_shift = shard_amount.ilog2();
        let shift = usize::BITS - shard_shift;

        let shards = (0..shard_amount)
            .map(|_| CachePadded::new(RwLock::new(HashTable::new())))
            .collect();

        Self {
            shift,
            shards,
            entries: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
        }
    }

    // Use high bits for sharding to keep low bits for hashbrown
    #[inline(always)]
    fn determine_shard(&self, hash: u64) -> usize {
        if self.shards.len() == 1 {
            return 0;
        }
        (hash as usize) >> self.shift
    }

    /// All entries, tombstones included
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_tombstones(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// Live (non-deleted) items
    pub fn num_items(&self) -> usize {
        self.len().saturating_sub(self.num_tombstones())
    }

    /// Insert or replace. The incoming item's revision is advanced past
    /// the one it displaces.
    pub fn upsert(&self, mut item: StoredItem) -> UpsertOutcome {
        let key = item.key_bytes();
        let hash = hash_key(&key);
        let shard_idx = self.determine_shard(hash);
        let mut guard = self.shards[shard_idx].write();

        match guard.entry(hash, |it| it.key() == &key[..], |it| hash_key(it.key())) {
            hash_table::Entry::Occupied(mut e) => {
                let old = e.get();
                let outcome = UpsertOutcome {
                    old_mem_size: Some(old.mem_size()),
                    replaced_tombstone: old.is_deleted(),
                    replaced_non_resident: !old.is_resident(),
                };
                item.set_rev_seqno(old.rev_seqno() + 1);
                if outcome.replaced_tombstone {
                    self.tombstones.fetch_sub(1, Ordering::Relaxed);
                }
                *e.get_mut() = item;
                outcome
            }
            hash_table::Entry::Vacant(e) => {
                e.insert(item);
                self.entries.fetch_add(1, Ordering::Relaxed);
                UpsertOutcome::default()
            }
        }
    }

    /// Get a read-only reference to an item.
    pub fn get<'a>(&'a self, key: &[u8]) -> Option<ReadOnlyRef<'a>> {
        let hash = hash_key(key);
        let shard_idx = self.determine_shard(hash);
        let guard = self.shards[shard_idx].read();

        // Safety: the reference stays valid for as long as the guard held
        // alongside it in ReadOnlyRef.
        let shard: &HashTable<StoredItem> = &guard;
        let item = shard.find(hash, |it| it.key() == key)?;
        let item: &'a StoredItem = unsafe { &*(item as *const StoredItem) };

        Some(ReadOnlyRef {
            _guard: guard,
            item,
        })
    }

    /// Run `f` against an item under its shard write lock.
    pub fn mutate<R>(&self, key: &[u8], f: impl FnOnce(&mut StoredItem) -> R) -> Option<R> {
        let hash = hash_key(key);
        let shard_idx = self.determine_shard(hash);
        let mut guard = self.shards[shard_idx].write();

        let item = guard.find_mut(hash, |it| it.key() == key)?;
        let was_deleted = item.is_deleted();
        let out = f(item);
        match (was_deleted, item.is_deleted()) {
            (false, true) => {
                self.tombstones.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.tombstones.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Some(out)
    }

    /// Remove an entry and return it.
    pub fn remove(&self, key: &[u8]) -> Option<StoredItem> {
        let hash = hash_key(key);
        let shard_idx = self.determine_shard(hash);
        let mut guard = self.shards[shard_idx].write();

        match guard.find_entry(hash, |it| it.key() == key) {
            Ok(entry) => {
                let (item, _) = entry.remove();
                self.entries.fetch_sub(1, Ordering::Relaxed);
                if item.is_deleted() {
                    self.tombstones.fetch_sub(1, Ordering::Relaxed);
                }
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Walk every entry, one shard lock at a time, applying the actions
    /// the visitor returns. `available` is checked between shards;
    /// clearing it cancels the walk.
    pub fn visit<F>(&self, available: &AtomicBool, f: F) -> VisitOutcome
    where
        F: FnMut(&mut StoredItem) -> VisitAction,
    {
        self.visit_range(0, None, available, f).0
    }

    /// Resumable walk starting at `start_shard`. With a deadline, the
    /// walk yields between shards once the deadline passes (always
    /// making progress on at least one shard) and reports the shard to
    /// resume from.
    pub fn visit_range<F>(
        &self,
        start_shard: usize,
        deadline_ms: Option<i64>,
        available: &AtomicBool,
        mut f: F,
    ) -> (VisitOutcome, usize)
    where
        F: FnMut(&mut StoredItem) -> VisitAction,
    {
        for idx in start_shard..self.shards.len() {
            if !available.load(Ordering::Relaxed) {
                return (VisitOutcome::Cancelled, idx);
            }
            if let Some(deadline) = deadline_ms
                && idx > start_shard
                && super::clock::now_ms() >= deadline
            {
                return (VisitOutcome::Paused, idx);
            }

            let shard_lock = &self.shards[idx];
            let mut guard = shard_lock.write();
            let mut to_remove: Vec<(u64, Bytes)> = Vec::new();
            let mut stopped = false;

            for item in guard.iter_mut() {
                let was_deleted = item.is_deleted();
                match f(item) {
                    VisitAction::Keep => {
                        if !was_deleted && item.is_deleted() {
                            self.tombstones.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    VisitAction::Remove => {
                        to_remove.push((hash_key(item.key()), item.key_bytes()));
                    }
                    VisitAction::Stop => {
                        stopped = true;
                        break;
                    }
                }
            }

            for (hash, key) in to_remove {
                if let Ok(entry) = guard.find_entry(hash, |it| it.key() == &key[..]) {
                    let (removed, _) = entry.remove();
                    self.entries.fetch_sub(1, Ordering::Relaxed);
                    if removed.is_deleted() {
                        self.tombstones.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }

            if stopped {
                return (VisitOutcome::Stopped, idx);
            }
        }
        (VisitOutcome::Exhausted, 0)
    }
}

pub struct ReadOnlyRef<'a> {
    _guard: RwLockReadGuard<'a, HashTable<StoredItem>>,
    item: &'a StoredItem,
}

impl std::ops::Deref for ReadOnlyRef<'_> {
    type Target = StoredItem;

    fn deref(&self) -> &StoredItem {
        self.item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::item::datatype;

    fn item(key: &str, value: &str) -> StoredItem {
        StoredItem::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            0,
            datatype::RAW,
            0,
            1,
        )
    }

    fn always() -> AtomicBool {
        AtomicBool::new(true)
    }

    #[test]
    fn upsert_replaces_and_bumps_rev() {
        let ht = ItemTable::with_shard_amount(4);
        assert!(ht.upsert(item("a", "one")).old_mem_size.is_none());
        let outcome = ht.upsert(item("a", "two"));
        assert!(outcome.old_mem_size.is_some());
        assert_eq!(ht.len(), 1);
        assert_eq!(ht.get(b"a").unwrap().rev_seqno(), 2);
        assert_eq!(ht.get(b"a").unwrap().value().unwrap().as_ref(), b"two");
    }

    #[test]
    fn tombstone_counting() {
        let ht = ItemTable::with_shard_amount(4);
        ht.upsert(item("a", "v"));
        ht.upsert(item("b", "v"));
        assert_eq!(ht.num_items(), 2);

        ht.mutate(b"a", |it| it.make_tombstone(None));
        assert_eq!(ht.len(), 2);
        assert_eq!(ht.num_tombstones(), 1);
        assert_eq!(ht.num_items(), 1);

        // A new write over the tombstone brings the item back.
        ht.upsert(item("a", "v2"));
        assert_eq!(ht.num_tombstones(), 0);
        assert_eq!(ht.num_items(), 2);

        ht.mutate(b"b", |it| it.make_tombstone(None));
        assert!(ht.remove(b"b").is_some());
        assert_eq!(ht.num_tombstones(), 0);
        assert_eq!(ht.len(), 1);
    }

    #[test]
    fn visit_applies_removals() {
        let ht = ItemTable::with_shard_amount(4);
        for i in 0..32 {
            ht.upsert(item(&format!("key{}", i), "v"));
        }
        let flag = always();
        let outcome = ht.visit(&flag, |it| {
            if it.key().ends_with(b"0") {
                VisitAction::Remove
            } else {
                VisitAction::Keep
            }
        });
        assert_eq!(outcome, VisitOutcome::Exhausted);
        // key0, key10, key20, key30 removed
        assert_eq!(ht.len(), 28);
        assert!(ht.get(b"key10").is_none());
        assert!(ht.get(b"key11").is_some());
    }

    #[test]
    fn visit_stops_and_cancels() {
        let ht = ItemTable::with_shard_amount(4);
        for i in 0..16 {
            ht.upsert(item(&format!("key{}", i), "v"));
        }

        let flag = always();
        let mut seen = 0;
        let outcome = ht.visit(&flag, |_| {
            seen += 1;
            if seen == 3 {
                VisitAction::Stop
            } else {
                VisitAction::Keep
            }
        });
        assert_eq!(outcome, VisitOutcome::Stopped);
        assert_eq!(seen, 3);

        let cancelled = AtomicBool::new(false);
        let outcome = ht.visit(&cancelled, |_| VisitAction::Keep);
        assert_eq!(outcome, VisitOutcome::Cancelled);
    }

    #[test]
    fn visit_range_pauses_on_deadline_and_resumes() {
        let _clock = crate::testing::clock_guard();
        let ht = ItemTable::with_shard_amount(4);
        for i in 0..64 {
            ht.upsert(item(&format!("key{}", i), "v"));
        }
        let flag = always();

        // A deadline already in the past: one shard of progress, then a
        // pause.
        let deadline = crate::storage::clock::now_ms() - 1;
        let mut seen = 0;
        let (outcome, resume) = ht.visit_range(0, Some(deadline), &flag, |_| {
            seen += 1;
            VisitAction::Keep
        });
        assert_eq!(outcome, VisitOutcome::Paused);
        assert_eq!(resume, 1);
        assert!(seen > 0);

        let mut rest = 0;
        let (outcome, _) = ht.visit_range(resume, None, &flag, |_| {
            rest += 1;
            VisitAction::Keep
        });
        assert_eq!(outcome, VisitOutcome::Exhausted);
        assert_eq!(seen + rest, 64);
    }
}
