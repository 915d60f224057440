//! Per-vBucket paging visitor.
//!
//! Walks one vBucket hash table deciding, item by item, whether to
//! expire, evict, decay or skip. Shared by the item pager and the expiry
//! pager; the latter runs it in expiry-only mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::{EphemeralFullPolicy, EvictionPolicy};
use crate::pager::PagerPhase;
use crate::pager::item_eviction::ItemEviction;
use crate::storage::bucket::{Bucket, ExpirySource};
use crate::storage::clock;
use crate::storage::hashtable::{VisitAction, VisitOutcome};
use crate::storage::item::{INITIAL_FREQ_COUNT, MAX_NRU, StoredItem};
use crate::storage::vbucket::{VBucket, VBucketState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerType {
    ItemPager,
    ExpiryPager,
}

/// Time slice for one visit before yielding back to the executor.
const VISIT_SLICE_MS: i64 = 25;

pub struct PagingVisitor {
    bucket: Arc<Bucket>,
    pager_type: PagerType,
    policy: EvictionPolicy,
    /// Phase snapshot shared with the owning pager
    phase: Arc<AtomicU8>,
    /// Cleared when the visit must abort (vBucket going away)
    available: Arc<AtomicBool>,
    eviction_ratio: f64,
    freq_percentile: f64,
    age_percentile: f64,
    is_ephemeral: bool,
    full_policy: EphemeralFullPolicy,

    item_eviction: ItemEviction,
    freq_threshold: u8,
    age_threshold: u64,
    /// Shard to resume from after a paused visit
    resume_shard: usize,

    ejected: u64,
    expired: u64,
    visited: u64,
}

impl PagingVisitor {
    pub fn new(
        bucket: Arc<Bucket>,
        pager_type: PagerType,
        policy: EvictionPolicy,
        phase: Arc<AtomicU8>,
        available: Arc<AtomicBool>,
        eviction_ratio: f64,
    ) -> Self {
        let (age_percentile, freq_cap) = {
            let config = bucket.config.read();
            (
                config.item_eviction_age_percentage as f64,
                config.item_eviction_freq_counter_age_threshold as f64,
            )
        };
        let freq_percentile = (eviction_ratio * 100.0).min(freq_cap).clamp(0.0, 100.0);
        let is_ephemeral = bucket.is_ephemeral();
        let full_policy = bucket.ephemeral_full_policy();

        Self {
            bucket,
            pager_type,
            policy,
            phase,
            available,
            eviction_ratio,
            freq_percentile,
            age_percentile,
            is_ephemeral,
            full_policy,
            item_eviction: ItemEviction::new(),
            freq_threshold: 0,
            age_threshold: 0,
            resume_shard: 0,
            ejected: 0,
            expired: 0,
            visited: 0,
        }
    }

    pub fn phase(&self) -> PagerPhase {
        PagerPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn ejected(&self) -> u64 {
        self.ejected
    }

    pub fn expired(&self) -> u64 {
        self.expired
    }

    pub fn visited(&self) -> u64 {
        self.visited
    }

    pub fn item_eviction(&self) -> &ItemEviction {
        &self.item_eviction
    }

    pub fn set_freq_counter_threshold(&mut self, threshold: u8) {
        self.freq_threshold = threshold;
    }

    pub fn set_age_threshold(&mut self, threshold: u64) {
        self.age_threshold = threshold;
    }

    pub fn reset_histogram(&mut self) {
        self.item_eviction.reset();
    }

    /// Called by the adapter when it moves on to another vBucket: the
    /// learned distribution belongs to the population just walked.
    pub fn complete_vbucket(&mut self) {
        self.item_eviction.reset();
        self.resume_shard = 0;
    }

    /// Walk one vBucket. Expiry is processed for every item seen; the
    /// eviction side stops contributing once memory reaches the pageout
    /// target, but the scan keeps going so no expired item is missed.
    pub fn visit_vbucket(&mut self, vb: &Arc<VBucket>) -> VisitOutcome {
        if !vb.is_online() {
            return VisitOutcome::Cancelled;
        }

        let now = clock::now_secs();
        let hi_cas = vb.max_cas();
        let state = vb.state();
        let phase = self.phase();
        let target = self.bucket.stats.pageout_target(self.eviction_ratio);
        let is_item_pager = self.pager_type == PagerType::ItemPager;
        let available = Arc::clone(&self.available);
        let bucket = Arc::clone(&self.bucket);
        let start_shard = self.resume_shard;
        let deadline = clock::now_ms() + VISIT_SLICE_MS;

        let (outcome, next_shard) = vb.ht.visit_range(start_shard, Some(deadline), &available, |item| {
            self.visited += 1;

            if item.is_deleted() {
                return VisitAction::Keep;
            }

            // Expiry precedes eviction, for both pager types.
            if item.is_expired(now) {
                self.expired += 1;
                return if bucket.expire_in_place(vb, item, ExpirySource::Pager) {
                    VisitAction::Keep
                } else {
                    VisitAction::Remove
                };
            }

            if !is_item_pager {
                return VisitAction::Keep;
            }

            // Enough reclaimed; keep scanning for expiry only.
            if target > 0 && bucket.stats.mem_used() < target {
                return VisitAction::Keep;
            }

            if !self.is_eligible(vb, state, phase, item) {
                // An ineligible item keeps its counters untouched so a
                // transient pin or dirty window cannot cool it down.
                return VisitAction::Keep;
            }

            match self.policy {
                EvictionPolicy::TwoBitLru => {
                    if item.nru() == MAX_NRU {
                        self.page_out(vb, item)
                    } else {
                        item.age_nru();
                        VisitAction::Keep
                    }
                }
                EvictionPolicy::HifiMfu => {
                    let freq = item.freq_counter();
                    let age = hi_cas.saturating_sub(item.cas());
                    self.item_eviction.add(freq, age);
                    if self.item_eviction.should_learn() {
                        let (f, a) = self
                            .item_eviction
                            .thresholds(self.freq_percentile, self.age_percentile);
                        self.freq_threshold = f;
                        self.age_threshold = a;
                    }

                    if freq <= self.freq_threshold
                        && (age >= self.age_threshold || freq < INITIAL_FREQ_COUNT)
                    {
                        self.page_out(vb, item)
                    } else {
                        item.decr_freq_counter();
                        VisitAction::Keep
                    }
                }
            }
        });

        self.resume_shard = if outcome == VisitOutcome::Paused {
            next_shard
        } else {
            0
        };
        outcome
    }

    fn is_eligible(
        &self,
        vb: &VBucket,
        state: VBucketState,
        phase: PagerPhase,
        item: &StoredItem,
    ) -> bool {
        if !item.is_resident() || item.is_deleted() {
            return false;
        }
        if !self.is_ephemeral && item.is_dirty() {
            return false;
        }
        if vb.checkpoints.is_pinned(item.key()) {
            return false;
        }
        match state {
            VBucketState::Replica => {
                // Paging an ephemeral replica would diverge its history
                // from the active copy.
                !self.is_ephemeral
                    && matches!(
                        phase,
                        PagerPhase::ReplicaOnly | PagerPhase::PagingUnreferenced
                    )
            }
            VBucketState::Active | VBucketState::Pending => matches!(
                phase,
                PagerPhase::ActiveAndPendingOnly | PagerPhase::PagingUnreferenced
            ),
            VBucketState::Dead => false,
        }
    }

    fn page_out(&mut self, vb: &VBucket, item: &mut StoredItem) -> VisitAction {
        if !self.is_ephemeral {
            if let Some(freed) = item.eject() {
                self.bucket.stats.account(-(freed as i64));
                self.bucket
                    .stats
                    .num_value_ejects
                    .fetch_add(1, Ordering::Relaxed);
                vb.incr_non_resident();
                self.ejected += 1;
            }
            VisitAction::Keep
        } else if self.full_policy == EphemeralFullPolicy::AutoDelete {
            self.bucket.stats.account(-(item.mem_size() as i64));
            self.bucket
                .stats
                .num_ephemeral_deletes
                .fetch_add(1, Ordering::Relaxed);
            self.ejected += 1;
            VisitAction::Remove
        } else {
            VisitAction::Keep
        }
    }
}
