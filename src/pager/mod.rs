//! Item paging and expiry.

pub mod expiry_pager;
pub mod item_eviction;
pub mod item_pager;
pub mod paging_visitor;

pub use expiry_pager::ExpiryPager;
pub use item_eviction::ItemEviction;
pub use item_pager::ItemPager;
pub use paging_visitor::{PagerType, PagingVisitor};

/// Which vBucket states the item pager currently considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PagerPhase {
    ReplicaOnly = 0,
    ActiveAndPendingOnly = 1,
    /// 2-bit LRU warm-up wave: any online vBucket, but only items whose
    /// NRU has aged to the maximum.
    PagingUnreferenced = 2,
}

impl PagerPhase {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ReplicaOnly,
            1 => Self::ActiveAndPendingOnly,
            _ => Self::PagingUnreferenced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplicaOnly => "replica_only",
            Self::ActiveAndPendingOnly => "active_and_pending_only",
            Self::PagingUnreferenced => "paging_unreferenced",
        }
    }
}
