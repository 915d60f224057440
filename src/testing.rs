//! Shared helpers for the paging and expiry tests.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::config::{BucketType, EngineConfig, EphemeralFullPolicy};
use crate::error::{Error, Result};
use crate::storage::bucket::{Bucket, StoreOptions};
use crate::storage::clock;
use crate::storage::item::MAX_NRU;
use crate::storage::xattr::Blob;

/// The engine clock offset is process-global; tests that travel time or
/// store near-future TTLs serialise on this.
static CLOCK_LOCK: Mutex<()> = Mutex::new(());

pub fn clock_guard() -> MutexGuard<'static, ()> {
    CLOCK_LOCK.lock()
}

pub fn bucket(config: EngineConfig) -> Arc<Bucket> {
    Bucket::new(config)
}

/// The quota fixture every paging scenario uses: 200 KiB quota,
/// 120 KiB / 160 KiB watermarks.
pub fn quota_config(bucket_type: BucketType, full_policy: EphemeralFullPolicy) -> EngineConfig {
    EngineConfig {
        max_size: 200 * 1024,
        mem_low_wat: 120 * 1024,
        mem_high_wat: 160 * 1024,
        bucket_type,
        ephemeral_full_policy: full_policy,
        max_vbuckets: 4,
        ht_shards: 4,
        ..Default::default()
    }
}

pub fn quota_bucket(bucket_type: BucketType, full_policy: EphemeralFullPolicy) -> Arc<Bucket> {
    Bucket::new(quota_config(bucket_type, full_policy))
}

pub fn value(len: usize) -> Vec<u8> {
    vec![b'x'; len]
}

pub fn store(
    bucket: &Arc<Bucket>,
    vbid: u16,
    key: &str,
    value: &[u8],
    opts: StoreOptions,
) -> Result<u64> {
    bucket.store(vbid, key.as_bytes(), value, opts)
}

/// A value with user, meta and `_sync` xattrs in front of `body`, the
/// shape expiry must prune down to the `_sync` segment.
pub fn xattr_value(body: &[u8]) -> Vec<u8> {
    let blob = Blob::from_pairs([
        (&b"user"[..], &b"{\"author\":\"bubba\"}"[..]),
        (&b"meta"[..], &b"{\"content-type\":\"text\"}"[..]),
        (&b"_sync"[..], &b"{\"cas\":\"0xdeadbeefcafefeed\"}"[..]),
    ]);
    let mut out = blob.encode().to_vec();
    out.extend_from_slice(body);
    out
}

/// Write 512-byte documents (immediately evictable: max NRU, zero
/// frequency) until the quota refuses one. Closes the open checkpoint
/// and, on persistent buckets, flushes so the items become clean.
pub fn populate_until_tmp_fail(bucket: &Arc<Bucket>, vbid: u16, ttl_secs: i64) -> usize {
    let payload = value(512);
    let exptime = if ttl_secs != 0 {
        clock::now_secs() + ttl_secs
    } else {
        0
    };
    let mut count = 0usize;
    loop {
        let key = format!("xxx_{}_{}", vbid, count);
        match store(
            bucket,
            vbid,
            &key,
            &payload,
            StoreOptions {
                exptime,
                freq_counter: Some(0),
                nru: Some(MAX_NRU),
                ..Default::default()
            },
        ) {
            Ok(_) => count += 1,
            Err(Error::TempFail) => break,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }
    assert!(
        bucket.stats.mem_used() > bucket.stats.mem_low_wat.load(std::sync::atomic::Ordering::Relaxed),
        "expected to exceed the low watermark after TMPFAIL"
    );

    // Release checkpoint references so the blobs become evictable, and
    // make everything clean on persistent buckets.
    bucket.create_new_checkpoint(vbid);
    if !bucket.is_ephemeral() {
        bucket.flush_vbucket(vbid).unwrap();
    }
    count
}

/// Write documents until the low watermark is reached.
pub fn populate_to_low_wat(
    bucket: &Arc<Bucket>,
    vbid: u16,
    value_len: usize,
    opts: StoreOptions,
) -> usize {
    let payload = value(value_len);
    let low = bucket
        .stats
        .mem_low_wat
        .load(std::sync::atomic::Ordering::Relaxed);
    let mut count = 0usize;
    while bucket.stats.mem_used() < low {
        let key = format!("key_{}_{}", vbid, count);
        store(bucket, vbid, &key, &payload, opts.clone()).unwrap();
        count += 1;
    }
    count
}

/// Run the pager pass that a high-watermark crossing scheduled: the
/// parent task, then one child run per expected vBucket visit.
pub fn run_high_memory_pager(bucket: &Arc<Bucket>, online_vb_count: usize) {
    let queue = bucket.task_queue();
    let has_item_pager = bucket.config.read().has_item_pager();

    if has_item_pager {
        assert_eq!(queue.run_next_ready().as_deref(), Some("Paging out items."));
        for _ in 0..online_vb_count {
            let name = queue.run_next_ready().expect("expected an item pager child");
            assert!(
                name.starts_with("Item pager on vb "),
                "unexpected task: {name}"
            );
        }
    } else {
        assert_eq!(
            queue.run_next_ready().as_deref(),
            Some("Paging expired items.")
        );
        for _ in 0..online_vb_count {
            let name = queue.run_next_ready().expect("expected an expiry child");
            assert!(
                name.starts_with("Expired item remover on vb "),
                "unexpected task: {name}"
            );
        }
    }
    assert_eq!(queue.ready_len(), 0, "pager left tasks in the ready queue");

    if !bucket.is_ephemeral() {
        for vbid in bucket.online_vbuckets() {
            bucket.flush_vbucket(vbid).unwrap();
        }
    }
}

/// Run every ready task to completion, returning the names in order.
pub fn drain_ready(bucket: &Arc<Bucket>) -> Vec<String> {
    let queue = bucket.task_queue();
    let mut names = Vec::new();
    while let Some(name) = queue.run_next_ready() {
        names.push(name);
    }
    names
}

/// Wake the expiry pager and run its sweep over `online_vb_count`
/// vBuckets.
pub fn run_expiry_pager(bucket: &Arc<Bucket>, online_vb_count: usize) {
    let queue = bucket.task_queue();
    bucket.wake_expiry_pager();
    assert_eq!(
        queue.run_next_ready().as_deref(),
        Some("Paging expired items.")
    );
    for _ in 0..online_vb_count {
        let name = queue.run_next_ready().expect("expected an expiry child");
        assert!(
            name.starts_with("Expired item remover on vb "),
            "unexpected task: {name}"
        );
    }
    assert_eq!(queue.ready_len(), 0);
    if !bucket.is_ephemeral() {
        for vbid in bucket.online_vbuckets() {
            bucket.flush_vbucket(vbid).unwrap();
        }
    }
}
