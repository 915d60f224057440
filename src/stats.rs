//! Aggregate engine statistics
//!
//! Lock-free counters only; everything here is read from hot paths and
//! mutated concurrently by the write path, the pagers and the flusher.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fraction of the low watermark the pager overshoots per unit of
/// eviction ratio, so a run leaves some headroom before the next trigger.
pub const PAGEOUT_SLACK: f64 = 0.02;

/// Aggregate bucket statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Estimated total resident bytes. Signed so transient races in
    /// account() can never wrap.
    mem_used: AtomicI64,
    pub max_size: AtomicU64,
    pub mem_low_wat: AtomicU64,
    pub mem_high_wat: AtomicU64,

    /// Values ejected from memory by the pager (persistent buckets)
    pub num_value_ejects: AtomicU64,
    /// Items deleted outright by the pager (ephemeral auto_delete)
    pub num_ephemeral_deletes: AtomicU64,

    /// TTL removals by source
    pub expired_pager: AtomicU64,
    pub expired_access: AtomicU64,
    pub expired_compactor: AtomicU64,

    /// Writes refused with a temporary failure
    pub tmp_fail: AtomicU64,

    pub pager_runs: AtomicU64,
    /// Pager runs that exhausted every phase while still above the low
    /// watermark
    pub pager_exhausted: AtomicU64,
    pub expiry_pager_runs: AtomicU64,
}

impl EngineStats {
    pub fn new(max_size: u64, low_wat: u64, high_wat: u64) -> Self {
        let stats = Self::default();
        stats.max_size.store(max_size, Ordering::Relaxed);
        stats.mem_low_wat.store(low_wat, Ordering::Relaxed);
        stats.mem_high_wat.store(high_wat, Ordering::Relaxed);
        stats
    }

    #[inline]
    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed).max(0) as u64
    }

    /// Account a resident-memory delta (positive on allocation, negative
    /// on release).
    #[inline]
    pub fn account(&self, delta: i64) {
        self.mem_used.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn above_high_watermark(&self) -> bool {
        let high = self.mem_high_wat.load(Ordering::Relaxed);
        high != 0 && self.mem_used() > high
    }

    #[inline]
    pub fn below_low_watermark(&self) -> bool {
        self.mem_used() < self.mem_low_wat.load(Ordering::Relaxed)
    }

    /// Would allocating `incoming` more bytes cross the quota?
    #[inline]
    pub fn would_exceed_quota(&self, incoming: u64) -> bool {
        let max = self.max_size.load(Ordering::Relaxed);
        max != 0 && self.mem_used() + incoming > max
    }

    /// Fraction of current memory that must be reclaimed to land on the
    /// low watermark. Zero when already below it.
    pub fn eviction_ratio(&self) -> f64 {
        let used = self.mem_used();
        let low = self.mem_low_wat.load(Ordering::Relaxed);
        if used == 0 || used <= low {
            return 0.0;
        }
        ((used - low) as f64 / used as f64).clamp(0.0, 1.0)
    }

    /// Memory level at which a paging pass stops evicting: strictly past
    /// the low watermark, scaled by how aggressive the pass is.
    pub fn pageout_target(&self, eviction_ratio: f64) -> u64 {
        let low = self.mem_low_wat.load(Ordering::Relaxed) as f64;
        (low * (1.0 - eviction_ratio * PAGEOUT_SLACK)) as u64
    }

    /// Total items removed because their TTL elapsed, across all sources.
    pub fn total_expired(&self) -> u64 {
        self.expired_pager.load(Ordering::Relaxed)
            + self.expired_access.load(Ordering::Relaxed)
            + self.expired_compactor.load(Ordering::Relaxed)
    }
}
