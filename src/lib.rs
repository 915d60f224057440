// Allow certain clippy lints that are intentional design decisions
#![allow(clippy::too_many_arguments)] // paging visitors thread a lot of state

pub mod compression;
pub mod config;
pub mod error;
pub mod logging;
pub mod pager;
pub mod stats;
pub mod storage;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use pager::{ExpiryPager, ItemPager, PagerPhase, PagingVisitor};
pub use stats::EngineStats;
pub use storage::{Bucket, GetValue, StoreOptions, VBucketState};

#[cfg(test)]
use mimalloc::MiMalloc;

#[cfg(test)]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
