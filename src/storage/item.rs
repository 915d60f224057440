//! Stored items and their paging metadata.

use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::compression;
use crate::storage::xattr;

/// Value datatype bit flags
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    pub const XATTR: u8 = 0x04;

    #[inline]
    pub fn is_json(dt: u8) -> bool {
        dt & JSON != 0
    }

    #[inline]
    pub fn is_compressed(dt: u8) -> bool {
        dt & COMPRESSED != 0
    }

    #[inline]
    pub fn is_xattr(dt: u8) -> bool {
        dt & XATTR != 0
    }
}

/// Saturation point of the frequency counter
pub const MAX_FREQ_COUNT: u8 = 255;

/// Counter value given to freshly stored items. Chosen so a fresh,
/// untouched item survives this many graceful-decay passes before the
/// age requirement can be waived for it.
pub const INITIAL_FREQ_COUNT: u8 = 4;

/// NRU values run 0 (just used) to 3 (coldest)
pub const MAX_NRU: u8 = 3;
pub const INITIAL_NRU: u8 = 2;

/// Fixed per-item bookkeeping charge in the memory estimate
pub const ITEM_OVERHEAD: usize = 64;

/// A document living in a vBucket hash table.
///
/// Structural fields are guarded by the owning table's shard lock; the
/// frequency counter and NRU are atomic because the read path touches
/// them through shared references.
#[derive(Debug)]
pub struct StoredItem {
    key: Bytes,
    value: Option<Bytes>,
    datatype: u8,
    flags: u32,
    /// Absolute expiry in seconds; 0 = no TTL
    exptime: i64,
    cas: u64,
    rev_seqno: u64,
    dirty: bool,
    deleted: bool,
    resident: bool,
    freq: AtomicU8,
    nru: AtomicU8,
}

impl StoredItem {
    pub fn new(key: Bytes, value: Bytes, exptime: i64, datatype: u8, flags: u32, cas: u64) -> Self {
        Self {
            key,
            value: Some(value),
            datatype,
            flags,
            exptime,
            cas,
            rev_seqno: 1,
            dirty: true,
            deleted: false,
            resident: true,
            freq: AtomicU8::new(INITIAL_FREQ_COUNT),
            nru: AtomicU8::new(INITIAL_NRU),
        }
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    pub fn key_bytes(&self) -> Bytes {
        self.key.clone()
    }

    #[inline]
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    #[inline]
    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn exptime(&self) -> i64 {
        self.exptime
    }

    #[inline]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    #[inline]
    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    #[inline]
    pub fn set_rev_seqno(&mut self, rev: u64) {
        self.rev_seqno = rev;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    #[inline]
    pub fn is_expired(&self, now_secs: i64) -> bool {
        !self.deleted && self.exptime != 0 && self.exptime <= now_secs
    }

    /// Estimated resident memory charge for this item
    #[inline]
    pub fn mem_size(&self) -> usize {
        ITEM_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Drop the value blob, keeping metadata. Only clean, resident, live
    /// items can be ejected. Returns the bytes freed.
    pub fn eject(&mut self) -> Option<usize> {
        if !self.resident || self.dirty || self.deleted {
            return None;
        }
        let freed = self.value.take().map(|v| v.len())?;
        self.resident = false;
        Some(freed)
    }

    /// Replace the value after a fetch from disk.
    pub fn restore_value(&mut self, value: Bytes) {
        self.value = Some(value);
        self.resident = true;
    }

    /// Turn this item into a tombstone carrying only the given
    /// system-xattr blob (or nothing at all).
    pub fn make_tombstone(&mut self, system_xattrs: Option<Bytes>) {
        self.datatype = if system_xattrs.is_some() {
            datatype::XATTR
        } else {
            datatype::RAW
        };
        self.value = system_xattrs;
        self.deleted = true;
        self.resident = true;
        self.rev_seqno += 1;
    }

    /// Swap the value in place (compressor, in-place mutation).
    pub fn replace_value(&mut self, value: Bytes, datatype: u8) {
        self.value = Some(value);
        self.datatype = datatype;
    }

    // ==================== Paging metadata ====================

    #[inline]
    pub fn freq_counter(&self) -> u8 {
        self.freq.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_freq_counter(&self, v: u8) {
        self.freq.store(v, Ordering::Relaxed);
    }

    /// Graceful decay applied by the pager when it passes over an
    /// eligible item without evicting it.
    #[inline]
    pub fn decr_freq_counter(&self) {
        let cur = self.freq.load(Ordering::Relaxed);
        if cur > 0 {
            let _ = self
                .freq
                .compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Probabilistic saturating increment applied on access. The chance
    /// of an increment falls off as the counter grows, so the counter
    /// approximates log access frequency.
    #[inline]
    pub fn incr_freq_counter(&self) {
        let counter = self.freq.load(Ordering::Relaxed);
        if counter < MAX_FREQ_COUNT {
            let base = counter.saturating_sub(INITIAL_FREQ_COUNT) as f64;
            if fastrand::f64() < 1.0 / (base + 1.0) {
                let _ = self.freq.compare_exchange(
                    counter,
                    counter.saturating_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        }
    }

    #[inline]
    pub fn nru(&self) -> u8 {
        self.nru.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_nru(&self, v: u8) {
        self.nru.store(v.min(MAX_NRU), Ordering::Relaxed);
    }

    /// Cool the item by one NRU step (pager pass without eviction).
    #[inline]
    pub fn age_nru(&self) {
        let cur = self.nru.load(Ordering::Relaxed);
        if cur < MAX_NRU {
            let _ = self
                .nru
                .compare_exchange(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Record an access: warms the NRU and bumps the frequency counter.
    #[inline]
    pub fn touch(&self) {
        self.nru.store(0, Ordering::Relaxed);
        self.incr_freq_counter();
    }
}

/// Extract the encoded system xattrs from a raw value, decompressing if
/// needed. None when the value has no xattr section or no system keys.
pub fn system_xattrs(value: &[u8], dt: u8) -> Option<Bytes> {
    if !datatype::is_xattr(dt) {
        return None;
    }
    if datatype::is_compressed(dt) {
        let raw = compression::decompress(value).ok()?;
        xattr::system_only(&raw)
    } else {
        xattr::system_only(value)
    }
}
