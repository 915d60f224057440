//! Engine wall clock.
//!
//! All expiry decisions read through this module so that tests can move
//! time forward without sleeping. The offset is process-global.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static OFFSET_SECS: AtomicI64 = AtomicI64::new(0);

/// Get current time in milliseconds since UNIX epoch
#[inline(always)]
pub fn now_ms() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    wall + OFFSET_SECS.load(Ordering::Relaxed) * 1000
}

/// Get current time in seconds since UNIX epoch
#[inline(always)]
pub fn now_secs() -> i64 {
    now_ms() / 1000
}

/// Advance the engine clock by `secs`. Test support; affects every reader
/// of [`now_ms`]/[`now_secs`] in the process.
pub fn travel(secs: i64) {
    OFFSET_SECS.fetch_add(secs, Ordering::Relaxed);
}
