//! Flusher and disk-store stand-in for persistent buckets.
//!
//! The real disk format is out of scope; what the pager needs is the
//! flush contract: dirty items become clean (and thus ejectable), and the
//! value of a non-resident item can be read back when expiry has to
//! rebuild its xattrs.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::AtomicBool;

use super::hashtable::VisitAction;
use super::vbucket::VBucket;

#[derive(Debug, Clone)]
pub struct DiskRecord {
    pub value: Option<Bytes>,
    pub datatype: u8,
    pub flags: u32,
    pub exptime: i64,
    pub cas: u64,
    pub rev_seqno: u64,
    pub deleted: bool,
}

pub struct Flusher {
    disk: DashMap<(u16, Bytes), DiskRecord>,
}

impl Flusher {
    pub fn new() -> Self {
        Self {
            disk: DashMap::new(),
        }
    }

    /// Persist every dirty item in the vBucket and mark it clean.
    /// Returns `(more_work, flushed_count)`; a full pass never leaves
    /// work behind, so `more_work` is always false.
    pub fn flush_vbucket(&self, vb: &VBucket) -> (bool, usize) {
        let mut flushed = 0usize;
        let available = AtomicBool::new(true);
        vb.ht.visit(&available, |item| {
            if !item.is_dirty() {
                return VisitAction::Keep;
            }
            self.disk.insert(
                (vb.id, item.key_bytes()),
                DiskRecord {
                    value: item.value().cloned(),
                    datatype: item.datatype(),
                    flags: item.flags(),
                    exptime: item.exptime(),
                    cas: item.cas(),
                    rev_seqno: item.rev_seqno(),
                    deleted: item.is_deleted(),
                },
            );
            item.clear_dirty();
            flushed += 1;
            VisitAction::Keep
        });
        (false, flushed)
    }

    /// Read back the persisted value of a live document.
    pub fn value(&self, vbid: u16, key: &[u8]) -> Option<Bytes> {
        let record = self.disk.get(&(vbid, Bytes::copy_from_slice(key)))?;
        if record.deleted {
            return None;
        }
        record.value.clone()
    }

    pub fn remove(&self, vbid: u16, key: &[u8]) {
        self.disk.remove(&(vbid, Bytes::copy_from_slice(key)));
    }

    pub fn contains(&self, vbid: u16, key: &[u8]) -> bool {
        self.disk.contains_key(&(vbid, Bytes::copy_from_slice(key)))
    }

    pub fn len(&self) -> usize {
        self.disk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disk.is_empty()
    }
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new()
    }
}
