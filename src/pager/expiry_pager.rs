//! Expiry pager: periodic TTL sweep.
//!
//! The parent task ("Paging expired items.") ticks every
//! `exp_pager_stime` seconds and dispatches an expiry-only visitor over
//! every online vBucket, one child run per vBucket ("Expired item
//! remover on vb N"). For ephemeral fail_new_data buckets this is the
//! only memory-reclamation mechanism, so the memory watcher wakes it in
//! place of the item pager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::pager::PagerPhase;
use crate::pager::paging_visitor::{PagerType, PagingVisitor};
use crate::storage::bucket::Bucket;
use crate::tasks::{NonIoTask, TaskOutcome, TaskQueue};

pub struct ExpiryPager {
    bucket: Weak<Bucket>,
    enabled: AtomicBool,
    task_id: AtomicU64,
}

impl ExpiryPager {
    pub fn new(bucket: &Arc<Bucket>) -> Arc<Self> {
        Arc::new(Self {
            bucket: Arc::downgrade(bucket),
            enabled: AtomicBool::new(false),
            task_id: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Schedule the sweep. The first tick lands after the configured
    /// initial delay, or after one period with a little jitter so a
    /// fleet of buckets does not sweep in lockstep.
    pub fn enable(self: &Arc<Self>, queue: &TaskQueue) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(bucket) = self.bucket.upgrade() else {
            return;
        };
        let (stime, initial_delay) = {
            let config = bucket.config.read();
            (config.exp_pager_stime, config.exp_pager_initial_delay)
        };
        let delay = if initial_delay > 0 {
            initial_delay
        } else {
            stime + fastrand::u64(..=stime / 10 + 1)
        };
        let id = queue.schedule(Arc::clone(self) as Arc<dyn NonIoTask>, delay);
        self.task_id.store(id, Ordering::Relaxed);
        log::info!("Expiry pager enabled, first sweep in {}s", delay);
    }

    /// Unschedule the sweep. A later enable() re-schedules at the
    /// current period.
    pub fn disable(&self, queue: &TaskQueue) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        queue.cancel(self.task_id.swap(0, Ordering::Relaxed));
        log::info!("Expiry pager disabled");
    }

    /// Pull the next sweep forward to now. Idempotent.
    pub fn wake(&self, queue: &TaskQueue) {
        let id = self.task_id.load(Ordering::Relaxed);
        if id != 0 {
            queue.wake(id);
        }
    }
}

impl NonIoTask for ExpiryPager {
    fn description(&self) -> String {
        "Paging expired items.".to_string()
    }

    fn run(&self, queue: &Arc<TaskQueue>) -> TaskOutcome {
        let Some(bucket) = self.bucket.upgrade() else {
            return TaskOutcome::Done;
        };
        if !self.enabled.load(Ordering::Relaxed) {
            return TaskOutcome::Done;
        }

        bucket.stats.expiry_pager_runs.fetch_add(1, Ordering::Relaxed);
        let policy = bucket.config.read().ht_eviction_policy;

        bucket.allow_visits();
        let pending = bucket.online_vbuckets();
        if !pending.is_empty() {
            log::debug!("Expiry pager sweeping {} vbuckets", pending.len());
            let visitor = PagingVisitor::new(
                Arc::clone(&bucket),
                PagerType::ExpiryPager,
                policy,
                Arc::new(AtomicU8::new(PagerPhase::ActiveAndPendingOnly as u8)),
                bucket.visit_flag(),
                0.0,
            );
            queue.schedule(
                Arc::new(ExpiryAdapter {
                    bucket: Arc::downgrade(&bucket),
                    visitor: Mutex::new(visitor),
                    pending: Mutex::new(pending),
                }),
                0,
            );
        }

        let stime = bucket.config.read().exp_pager_stime;
        TaskOutcome::Snooze(stime)
    }
}

/// Per-vBucket child task: "Expired item remover on vb N".
struct ExpiryAdapter {
    bucket: Weak<Bucket>,
    visitor: Mutex<PagingVisitor>,
    pending: Mutex<VecDeque<u16>>,
}

impl NonIoTask for ExpiryAdapter {
    fn description(&self) -> String {
        let vbid = self.pending.lock().front().copied().unwrap_or(0);
        format!("Expired item remover on vb {}", vbid)
    }

    fn run(&self, _queue: &Arc<TaskQueue>) -> TaskOutcome {
        let Some(bucket) = self.bucket.upgrade() else {
            return TaskOutcome::Done;
        };
        let Some(vbid) = self.pending.lock().pop_front() else {
            return TaskOutcome::Done;
        };

        if let Some(vb) = bucket.vbucket(vbid)
            && vb.is_online()
        {
            let mut visitor = self.visitor.lock();
            if visitor.visit_vbucket(vb) == crate::storage::hashtable::VisitOutcome::Paused {
                self.pending.lock().push_front(vbid);
                return TaskOutcome::Reschedule;
            }
            visitor.complete_vbucket();
        }

        if self.pending.lock().is_empty() {
            let visitor = self.visitor.lock();
            log::debug!(
                "Expiry pager sweep complete: visited {} expired {}",
                visitor.visited(),
                visitor.expired()
            );
            TaskOutcome::Done
        } else {
            TaskOutcome::Reschedule
        }
    }
}
