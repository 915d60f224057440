//! Item pager: high-watermark triggered eviction orchestrator.
//!
//! The parent task ("Paging out items.") decides whether a pass is
//! needed, picks the phase order for the configured policy, and hands a
//! per-vBucket adapter child to the task queue. The child visits one
//! vBucket per run, advancing through the phase waves until memory drops
//! past the pageout target or every phase is exhausted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::EvictionPolicy;
use crate::pager::PagerPhase;
use crate::pager::paging_visitor::{PagerType, PagingVisitor};
use crate::storage::bucket::Bucket;
use crate::tasks::{IDLE_SLEEP_SECS, NonIoTask, TaskId, TaskOutcome, TaskQueue};

/// Phase waves for a policy, in visiting order.
pub fn phase_order(policy: EvictionPolicy, ephemeral: bool) -> &'static [PagerPhase] {
    match (policy, ephemeral) {
        (EvictionPolicy::HifiMfu, false) => {
            &[PagerPhase::ReplicaOnly, PagerPhase::ActiveAndPendingOnly]
        }
        (EvictionPolicy::TwoBitLru, false) => &[
            PagerPhase::PagingUnreferenced,
            PagerPhase::ReplicaOnly,
            PagerPhase::ActiveAndPendingOnly,
        ],
        // Ephemeral replicas are never paged, whatever the policy.
        (EvictionPolicy::HifiMfu, true) => &[PagerPhase::ActiveAndPendingOnly],
        (EvictionPolicy::TwoBitLru, true) => &[
            PagerPhase::PagingUnreferenced,
            PagerPhase::ActiveAndPendingOnly,
        ],
    }
}

pub fn initial_phase(policy: EvictionPolicy, ephemeral: bool) -> PagerPhase {
    phase_order(policy, ephemeral)[0]
}

pub struct ItemPager {
    bucket: Weak<Bucket>,
    phase: Arc<AtomicU8>,
    /// True while the pager is idle; cleared for the duration of a pass
    /// so repeated wakes coalesce.
    available: Arc<AtomicBool>,
    last_policy: Mutex<EvictionPolicy>,
    task_id: AtomicU64,
}

impl ItemPager {
    pub fn new(bucket: &Arc<Bucket>) -> Arc<Self> {
        let (policy, ephemeral) = {
            let config = bucket.config.read();
            (config.ht_eviction_policy, config.is_ephemeral())
        };
        Arc::new(Self {
            bucket: Arc::downgrade(bucket),
            phase: Arc::new(AtomicU8::new(initial_phase(policy, ephemeral) as u8)),
            available: Arc::new(AtomicBool::new(true)),
            last_policy: Mutex::new(policy),
            task_id: AtomicU64::new(0),
        })
    }

    pub fn phase(&self) -> PagerPhase {
        PagerPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    fn set_phase(&self, phase: PagerPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub(crate) fn set_task_id(&self, id: TaskId) {
        self.task_id.store(id, Ordering::Relaxed);
    }

    /// Move the parent task to the ready queue. Idempotent.
    pub fn wake(&self, queue: &TaskQueue) {
        let id = self.task_id.load(Ordering::Relaxed);
        if id != 0 {
            queue.wake(id);
        }
    }
}

impl NonIoTask for ItemPager {
    fn description(&self) -> String {
        "Paging out items.".to_string()
    }

    fn run(&self, queue: &Arc<TaskQueue>) -> TaskOutcome {
        let Some(bucket) = self.bucket.upgrade() else {
            return TaskOutcome::Done;
        };
        let (policy, ephemeral) = {
            let config = bucket.config.read();
            (config.ht_eviction_policy, config.is_ephemeral())
        };

        {
            let mut last = self.last_policy.lock();
            if *last != policy {
                *last = policy;
                let phase = initial_phase(policy, ephemeral);
                log::info!(
                    "Item pager re-initialising phase to {} after policy change to {}",
                    phase.as_str(),
                    policy.as_str()
                );
                self.set_phase(phase);
            }
        }

        if !bucket.stats.above_high_watermark() {
            return TaskOutcome::Snooze(IDLE_SLEEP_SECS);
        }
        if !self.available.swap(false, Ordering::AcqRel) {
            // A pass is already in flight.
            return TaskOutcome::Snooze(IDLE_SLEEP_SECS);
        }

        bucket.stats.pager_runs.fetch_add(1, Ordering::Relaxed);
        let ratio = bucket.stats.eviction_ratio();
        log::info!(
            "Paging out items: mem_used {} above mem_high_wat {}, eviction ratio {:.2}",
            bucket.stats.mem_used(),
            bucket.stats.mem_high_wat.load(Ordering::Relaxed),
            ratio
        );

        bucket.allow_visits();
        let visitor = PagingVisitor::new(
            Arc::clone(&bucket),
            PagerType::ItemPager,
            policy,
            Arc::clone(&self.phase),
            bucket.visit_flag(),
            ratio,
        );
        let adapter = Arc::new(PagingAdapter {
            bucket: Arc::downgrade(&bucket),
            phase: Arc::clone(&self.phase),
            idle: Arc::clone(&self.available),
            visitor: Mutex::new(visitor),
            pending: Mutex::new(VecDeque::new()),
            waves: Mutex::new(phase_order(policy, ephemeral).iter().copied().collect()),
            ratio,
        });

        if adapter.prime(&bucket) {
            queue.schedule(adapter, 0);
        } else {
            // Nothing online to visit.
            self.available.store(true, Ordering::Release);
        }

        TaskOutcome::Snooze(IDLE_SLEEP_SECS)
    }
}

/// Per-vBucket child task: "Item pager on vb N". Visits one vBucket per
/// run and reschedules itself while work remains.
struct PagingAdapter {
    bucket: Weak<Bucket>,
    phase: Arc<AtomicU8>,
    idle: Arc<AtomicBool>,
    visitor: Mutex<PagingVisitor>,
    pending: Mutex<VecDeque<u16>>,
    waves: Mutex<VecDeque<PagerPhase>>,
    ratio: f64,
}

impl PagingAdapter {
    /// Advance to the next wave that has vBuckets to visit. Returns
    /// false when every phase is exhausted.
    fn advance_wave(&self, bucket: &Arc<Bucket>) -> bool {
        loop {
            let Some(next) = self.waves.lock().pop_front() else {
                return false;
            };
            self.phase.store(next as u8, Ordering::Relaxed);
            let pending = bucket.vbuckets_for_phase(next);
            if !pending.is_empty() {
                log::debug!("Item pager entering phase {}", next.as_str());
                *self.pending.lock() = pending;
                return true;
            }
        }
    }

    /// Fill the first wave. Returns false when no phase has any vBucket.
    fn prime(&self, bucket: &Arc<Bucket>) -> bool {
        self.advance_wave(bucket)
    }

    fn finish(&self, bucket: &Arc<Bucket>) -> TaskOutcome {
        if !bucket.stats.below_low_watermark() {
            bucket.stats.pager_exhausted.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Item pager exhausted all phases with mem_used {} still at or above mem_low_wat {}",
                bucket.stats.mem_used(),
                bucket.stats.mem_low_wat.load(Ordering::Relaxed)
            );
        }
        {
            let visitor = self.visitor.lock();
            log::info!(
                "Item pager pass complete: visited {} ejected {} expired {}",
                visitor.visited(),
                visitor.ejected(),
                visitor.expired()
            );
        }
        self.idle.store(true, Ordering::Release);
        TaskOutcome::Done
    }
}

impl NonIoTask for PagingAdapter {
    fn description(&self) -> String {
        let vbid = self.pending.lock().front().copied().unwrap_or(0);
        format!("Item pager on vb {}", vbid)
    }

    fn run(&self, _queue: &Arc<TaskQueue>) -> TaskOutcome {
        let Some(bucket) = self.bucket.upgrade() else {
            self.idle.store(true, Ordering::Release);
            return TaskOutcome::Done;
        };

        let vbid = loop {
            if let Some(vbid) = self.pending.lock().pop_front() {
                break vbid;
            }
            if !self.advance_wave(&bucket) {
                return self.finish(&bucket);
            }
        };

        if let Some(vb) = bucket.vbucket(vbid)
            && vb.is_online()
        {
            let mut visitor = self.visitor.lock();
            if visitor.visit_vbucket(vb) == crate::storage::hashtable::VisitOutcome::Paused {
                // Time slice spent; come back to the same vBucket.
                self.pending.lock().push_front(vbid);
                return TaskOutcome::Reschedule;
            }
            visitor.complete_vbucket();
        }

        let target = bucket.stats.pageout_target(self.ratio);
        if target > 0 && bucket.stats.mem_used() < target {
            return self.finish(&bucket);
        }

        // Keep the front of `pending` pointing at a real vBucket so the
        // task name stays accurate, and detect exhaustion eagerly.
        if !self.pending.lock().is_empty() || self.advance_wave(&bucket) {
            TaskOutcome::Reschedule
        } else {
            self.finish(&bucket)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketType, EphemeralFullPolicy};
    use crate::storage::bucket::StoreOptions;
    use crate::storage::item::MAX_NRU;
    use crate::storage::vbucket::VBucketState;
    use crate::testing;

    // Changing ht_eviction_policy between runs must re-initialise the
    // phase; state from the previous algorithm never leaks.
    #[test]
    fn phase_reinitialised_when_policy_changes() {
        let bucket = testing::quota_bucket(BucketType::Persistent, Default::default());
        let pager = bucket.item_pager().unwrap();
        let queue = bucket.task_queue();
        assert_eq!(pager.phase(), PagerPhase::ReplicaOnly);

        bucket.config.write().ht_eviction_policy = EvictionPolicy::TwoBitLru;
        pager.run(&queue);
        assert_eq!(pager.phase(), PagerPhase::PagingUnreferenced);

        bucket.config.write().ht_eviction_policy = EvictionPolicy::HifiMfu;
        pager.run(&queue);
        assert_eq!(pager.phase(), PagerPhase::ReplicaOnly);
    }

    #[test]
    fn phase_reinitialised_when_policy_changes_ephemeral() {
        let bucket = testing::quota_bucket(BucketType::Ephemeral, EphemeralFullPolicy::AutoDelete);
        let pager = bucket.item_pager().unwrap();
        let queue = bucket.task_queue();
        assert_eq!(pager.phase(), PagerPhase::ActiveAndPendingOnly);

        bucket.config.write().ht_eviction_policy = EvictionPolicy::TwoBitLru;
        pager.run(&queue);
        assert_eq!(pager.phase(), PagerPhase::PagingUnreferenced);

        bucket.config.write().ht_eviction_policy = EvictionPolicy::HifiMfu;
        pager.run(&queue);
        assert_eq!(pager.phase(), PagerPhase::ActiveAndPendingOnly);
    }

    fn evictable() -> StoreOptions {
        StoreOptions {
            freq_counter: Some(0),
            nru: Some(MAX_NRU),
            ..Default::default()
        }
    }

    // Persistent hifi_mfu visits replica vBuckets before active/pending
    // ones, preserving the working set on the source of truth.
    #[test]
    fn replica_items_visited_first_persistent() {
        let bucket = testing::quota_bucket(BucketType::Persistent, Default::default());
        for vbid in 0..3 {
            bucket.set_vbucket_state(vbid, VBucketState::Active).unwrap();
        }

        let payload = testing::value(512);
        for i in 0..10 {
            testing::store(&bucket, 0, &format!("key_{}", i), &payload, evictable()).unwrap();
            testing::store(&bucket, 1, &format!("key_{}", i), &payload, evictable()).unwrap();
        }
        bucket.set_vbucket_state(1, VBucketState::Pending).unwrap();

        testing::populate_until_tmp_fail(&bucket, 2, 0);
        bucket.set_vbucket_state(2, VBucketState::Replica).unwrap();
        // The active/pending items must be clean too, or they would be
        // skipped for the wrong reason.
        bucket.create_new_checkpoint(0);
        bucket.create_new_checkpoint(1);
        bucket.flush_vbucket(0).unwrap();
        bucket.flush_vbucket(1).unwrap();

        let queue = bucket.task_queue();
        assert_eq!(queue.run_next_ready().as_deref(), Some("Paging out items."));
        assert_eq!(queue.run_next_ready().as_deref(), Some("Item pager on vb 2"));
        assert_eq!(queue.ready_len(), 0, "replica wave alone should suffice");

        let replica = bucket.vbucket(2).unwrap();
        assert!(replica.num_non_resident() > 0);
        let active_and_pending = bucket.vbucket(0).unwrap().num_non_resident()
            + bucket.vbucket(1).unwrap().num_non_resident();
        assert_eq!(active_and_pending, 0);
        assert!(bucket.stats.mem_used() < bucket.stats.mem_low_wat.load(Ordering::Relaxed));
    }

    // Ephemeral buckets never page replicas: the replica wave is skipped
    // outright and paging drains the active/pending vBuckets instead.
    #[test]
    fn replica_items_skipped_ephemeral() {
        let bucket = testing::quota_bucket(BucketType::Ephemeral, EphemeralFullPolicy::AutoDelete);
        for vbid in 0..3 {
            bucket.set_vbucket_state(vbid, VBucketState::Active).unwrap();
        }

        let payload = testing::value(512);
        for i in 0..10 {
            testing::store(&bucket, 0, &format!("key_{}", i), &payload, evictable()).unwrap();
            testing::store(&bucket, 1, &format!("key_{}", i), &payload, evictable()).unwrap();
        }
        bucket.set_vbucket_state(1, VBucketState::Pending).unwrap();

        let replica_count = testing::populate_until_tmp_fail(&bucket, 2, 0);
        bucket.set_vbucket_state(2, VBucketState::Replica).unwrap();
        bucket.create_new_checkpoint(0);
        bucket.create_new_checkpoint(1);

        let queue = bucket.task_queue();
        assert_eq!(queue.run_next_ready().as_deref(), Some("Paging out items."));
        // Most of the memory sits in the untouchable replica, so both
        // remaining vBuckets get a visit.
        assert_eq!(queue.run_next_ready().as_deref(), Some("Item pager on vb 0"));
        assert_eq!(queue.run_next_ready().as_deref(), Some("Item pager on vb 1"));
        assert_eq!(queue.ready_len(), 0);

        assert_eq!(bucket.vbucket(2).unwrap().num_items(), replica_count);
        let active_and_pending =
            bucket.vbucket(0).unwrap().num_items() + bucket.vbucket(1).unwrap().num_items();
        assert_ne!(active_and_pending, 20);

        // Everything evictable is gone and memory is still above the low
        // watermark: that run counts as exhausted.
        assert_eq!(bucket.stats.pager_exhausted.load(Ordering::Relaxed), 1);
        assert!(bucket.stats.mem_used() >= bucket.stats.mem_low_wat.load(Ordering::Relaxed));
    }

    // Replica item counts never change across an item pager run on an
    // ephemeral bucket; the active vBucket pays instead.
    #[test]
    fn replica_not_paged_ephemeral_auto_delete() {
        let bucket = testing::quota_bucket(BucketType::Ephemeral, EphemeralFullPolicy::AutoDelete);
        bucket.set_vbucket_state(0, VBucketState::Active).unwrap();
        bucket.set_vbucket_state(1, VBucketState::Active).unwrap();

        let active_count = testing::populate_to_low_wat(&bucket, 0, 1024, evictable());
        assert!(active_count >= 10);
        let replica_count = testing::populate_until_tmp_fail(&bucket, 1, 0);
        assert!(replica_count >= 10);
        bucket.set_vbucket_state(1, VBucketState::Replica).unwrap();
        bucket.create_new_checkpoint(0);

        testing::run_high_memory_pager(&bucket, 1);

        assert_eq!(bucket.vbucket(1).unwrap().num_items(), replica_count);
        assert!(bucket.vbucket(0).unwrap().num_items() < active_count);
        assert!(bucket.stats.mem_used() < bucket.stats.mem_low_wat.load(Ordering::Relaxed));
    }

    #[test]
    fn replica_not_paged_ephemeral_fail_new_data() {
        let bucket =
            testing::quota_bucket(BucketType::Ephemeral, EphemeralFullPolicy::FailNewData);
        bucket.set_vbucket_state(0, VBucketState::Active).unwrap();
        bucket.set_vbucket_state(1, VBucketState::Active).unwrap();

        let active_count = testing::populate_to_low_wat(&bucket, 0, 1024, evictable());
        let replica_count = testing::populate_until_tmp_fail(&bucket, 1, 0);
        bucket.set_vbucket_state(1, VBucketState::Replica).unwrap();

        // No item pager exists; the expiry pager runs and finds nothing
        // with a TTL.
        testing::run_high_memory_pager(&bucket, 2);

        assert_eq!(bucket.vbucket(1).unwrap().num_items(), replica_count);
        assert_eq!(bucket.vbucket(0).unwrap().num_items(), active_count);
        assert!(bucket.stats.mem_used() > bucket.stats.mem_high_wat.load(Ordering::Relaxed));
    }

    // Notifications arriving while a pass is in flight coalesce; only
    // one pass is dispatched.
    #[test]
    fn wakes_coalesce_while_paging() {
        let bucket = testing::quota_bucket(BucketType::Persistent, Default::default());
        bucket.set_vbucket_state(0, VBucketState::Active).unwrap();
        testing::populate_until_tmp_fail(&bucket, 0, 0);

        let queue = bucket.task_queue();
        let pager = bucket.item_pager().unwrap();
        assert_eq!(queue.run_next_ready().as_deref(), Some("Paging out items."));
        assert!(!pager.is_available());
        assert_eq!(queue.ready_len(), 1); // just the child

        // Another memory condition runs the parent again while the child
        // is still pending; the run must not dispatch a second pass.
        pager.run(&queue);
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(bucket.stats.pager_runs.load(Ordering::Relaxed), 1);

        assert_eq!(queue.run_next_ready().as_deref(), Some("Item pager on vb 0"));
        assert!(pager.is_available());
        assert_eq!(queue.ready_len(), 0);
    }
}
