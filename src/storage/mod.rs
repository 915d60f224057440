//! Storage layer: items, hash tables, vBuckets and the bucket façade.

pub mod bucket;
pub mod checkpoint;
pub mod clock;
pub mod flusher;
pub mod hashtable;
pub mod item;
pub mod vbucket;
pub mod xattr;

pub use bucket::{Bucket, GetValue, StoreOptions};
pub use hashtable::ItemTable;
pub use item::StoredItem;
pub use vbucket::{VBucket, VBucketState};
