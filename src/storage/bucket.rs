//! The bucket: vBuckets, quota enforcement and pager wiring.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::compression;
use crate::config::{BucketType, CompressionMode, EngineConfig, EphemeralFullPolicy,
    PersistentEvictionMode};
use crate::error::{Error, Result};
use crate::pager::expiry_pager::ExpiryPager;
use crate::pager::item_pager::ItemPager;
use crate::pager::PagerPhase;
use crate::stats::EngineStats;
use crate::storage::clock;
use crate::storage::flusher::Flusher;
use crate::storage::item::{self, ITEM_OVERHEAD, StoredItem, datatype};
use crate::storage::vbucket::{VBucket, VBucketState};
use crate::tasks::{IDLE_SLEEP_SECS, NonIoTask, TaskQueue};

/// Write-path options beyond key and value
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Absolute expiry in seconds; 0 = no TTL
    pub exptime: i64,
    pub flags: u32,
    pub datatype: u8,
    /// Initial frequency counter (warmup/replication hint)
    pub freq_counter: Option<u8>,
    /// Initial NRU value (warmup/replication hint)
    pub nru: Option<u8>,
}

/// Read-path result
#[derive(Debug, Clone)]
pub struct GetValue {
    pub value: Option<Bytes>,
    pub cas: u64,
    pub flags: u32,
    pub datatype: u8,
    pub deleted: bool,
}

/// Who noticed the expired item
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExpirySource {
    Pager,
    Access,
}

pub struct Bucket {
    pub config: RwLock<EngineConfig>,
    pub stats: EngineStats,
    vbuckets: Box<[Arc<VBucket>]>,
    flusher: Option<Flusher>,
    queue: Arc<TaskQueue>,
    /// Cleared to cancel in-flight visits when a vBucket goes away;
    /// re-armed by the pagers at dispatch.
    visit_flag: Arc<AtomicBool>,
    item_pager: RwLock<Option<Arc<ItemPager>>>,
    expiry_pager: RwLock<Option<Arc<ExpiryPager>>>,
    bucket_type: BucketType,
    full_policy: EphemeralFullPolicy,
    eviction_mode: PersistentEvictionMode,
}

impl Bucket {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let stats = EngineStats::new(
            config.max_size,
            config.low_watermark(),
            config.high_watermark(),
        );
        let vbuckets = (0..config.max_vbuckets)
            .map(|id| Arc::new(VBucket::new(id, config.ht_shards)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let flusher = (config.bucket_type == BucketType::Persistent).then(Flusher::new);
        let has_item_pager = config.has_item_pager();
        let exp_pager_enabled = config.exp_pager_enabled;
        let bucket_type = config.bucket_type;
        let full_policy = config.ephemeral_full_policy;
        let eviction_mode = config.item_eviction_policy;

        let bucket = Arc::new(Self {
            config: RwLock::new(config),
            stats,
            vbuckets,
            flusher,
            queue: TaskQueue::new(),
            visit_flag: Arc::new(AtomicBool::new(true)),
            item_pager: RwLock::new(None),
            expiry_pager: RwLock::new(None),
            bucket_type,
            full_policy,
            eviction_mode,
        });

        // Ephemeral fail_new_data buckets have no item pager; the expiry
        // pager carries the memory-condition wakeups instead.
        if has_item_pager {
            let pager = ItemPager::new(&bucket);
            let id = bucket
                .queue
                .schedule(Arc::clone(&pager) as Arc<dyn NonIoTask>, IDLE_SLEEP_SECS);
            pager.set_task_id(id);
            *bucket.item_pager.write() = Some(pager);
        }
        let expiry = ExpiryPager::new(&bucket);
        if exp_pager_enabled {
            expiry.enable(&bucket.queue);
        }
        *bucket.expiry_pager.write() = Some(expiry);

        log::info!(
            "Created {:?} bucket: max_size {} mem_low_wat {} mem_high_wat {}",
            bucket.bucket_type,
            bucket.stats.max_size.load(Ordering::Relaxed),
            bucket.stats.mem_low_wat.load(Ordering::Relaxed),
            bucket.stats.mem_high_wat.load(Ordering::Relaxed)
        );
        bucket
    }

    // ==================== Topology ====================

    pub fn vbucket(&self, vbid: u16) -> Option<&Arc<VBucket>> {
        self.vbuckets.get(vbid as usize)
    }

    fn online_vbucket(&self, vbid: u16) -> Result<&Arc<VBucket>> {
        match self.vbucket(vbid) {
            Some(vb) if vb.is_online() => Ok(vb),
            Some(_) => Err(Error::VBucketDead(vbid)),
            None => Err(Error::NotMyVBucket(vbid)),
        }
    }

    pub fn set_vbucket_state(&self, vbid: u16, state: VBucketState) -> Result<()> {
        let vb = self.vbucket(vbid).ok_or(Error::NotMyVBucket(vbid))?;
        if state == VBucketState::Dead {
            // Cancel any in-flight visit at its next yield point.
            self.visit_flag.store(false, Ordering::Relaxed);
        }
        log::debug!("vb {} {} -> {}", vbid, vb.state().as_str(), state.as_str());
        vb.set_state(state);
        Ok(())
    }

    pub fn online_vbuckets(&self) -> VecDeque<u16> {
        self.vbuckets
            .iter()
            .filter(|vb| vb.is_online())
            .map(|vb| vb.id)
            .collect()
    }

    /// vBuckets an item pager wave should visit in the given phase.
    pub(crate) fn vbuckets_for_phase(&self, phase: PagerPhase) -> VecDeque<u16> {
        let ephemeral = self.is_ephemeral();
        self.vbuckets
            .iter()
            .filter(|vb| {
                let state = vb.state();
                match phase {
                    PagerPhase::ReplicaOnly => state == VBucketState::Replica && !ephemeral,
                    PagerPhase::ActiveAndPendingOnly => {
                        matches!(state, VBucketState::Active | VBucketState::Pending)
                    }
                    PagerPhase::PagingUnreferenced => {
                        state != VBucketState::Dead
                            && !(ephemeral && state == VBucketState::Replica)
                    }
                }
            })
            .map(|vb| vb.id)
            .collect()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.bucket_type == BucketType::Ephemeral
    }

    pub fn ephemeral_full_policy(&self) -> EphemeralFullPolicy {
        self.full_policy
    }

    pub fn persistent_eviction_mode(&self) -> PersistentEvictionMode {
        self.eviction_mode
    }

    // ==================== Pager wiring ====================

    pub fn task_queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn item_pager(&self) -> Option<Arc<ItemPager>> {
        self.item_pager.read().clone()
    }

    pub fn expiry_pager(&self) -> Option<Arc<ExpiryPager>> {
        self.expiry_pager.read().clone()
    }

    pub(crate) fn visit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.visit_flag)
    }

    pub(crate) fn allow_visits(&self) {
        self.visit_flag.store(true, Ordering::Relaxed);
    }

    pub fn wake_item_pager(&self) {
        if let Some(pager) = self.item_pager.read().as_ref() {
            pager.wake(&self.queue);
        }
    }

    pub fn wake_expiry_pager(&self) {
        if let Some(pager) = self.expiry_pager.read().as_ref() {
            pager.wake(&self.queue);
        }
    }

    pub fn enable_expiry_pager(&self) {
        if let Some(pager) = self.expiry_pager.read().as_ref() {
            pager.enable(&self.queue);
        }
    }

    pub fn disable_expiry_pager(&self) {
        if let Some(pager) = self.expiry_pager.read().as_ref() {
            pager.disable(&self.queue);
        }
    }

    /// Run the task queue on a tokio background task.
    pub fn start_background(&self) -> tokio::task::JoinHandle<()> {
        crate::tasks::spawn_driver(Arc::clone(&self.queue))
    }

    // ==================== Memory watcher ====================

    fn check_memory_for(&self, incoming: u64) -> Result<()> {
        if self.stats.would_exceed_quota(incoming) {
            self.stats.tmp_fail.fetch_add(1, Ordering::Relaxed);
            self.memory_condition();
            return Err(Error::TempFail);
        }
        Ok(())
    }

    /// Memory is tight: wake whichever pager can reclaim for this bucket
    /// flavour. Wakes coalesce at the pager.
    fn memory_condition(&self) {
        if let Some(pager) = self.item_pager.read().as_ref() {
            pager.wake(&self.queue);
        } else if let Some(pager) = self.expiry_pager.read().as_ref() {
            pager.wake(&self.queue);
        }
    }

    /// Adjust the quota at runtime; unset watermarks re-derive.
    pub fn set_max_size(&self, bytes: u64) {
        let mut config = self.config.write();
        config.max_size = bytes;
        self.stats.max_size.store(bytes, Ordering::Relaxed);
        self.stats
            .mem_low_wat
            .store(config.low_watermark(), Ordering::Relaxed);
        self.stats
            .mem_high_wat
            .store(config.high_watermark(), Ordering::Relaxed);
    }

    // ==================== Front-end operations ====================

    pub fn store(&self, vbid: u16, key: &[u8], value: &[u8], opts: StoreOptions) -> Result<u64> {
        let vb = self.online_vbucket(vbid)?;
        if vb.state() != VBucketState::Active {
            return Err(Error::NotStored);
        }

        let incoming = (ITEM_OVERHEAD + key.len() + value.len()) as u64;
        self.check_memory_for(incoming)?;

        let cas = vb.next_cas();
        let stored = StoredItem::new(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            opts.exptime,
            opts.datatype,
            opts.flags,
            cas,
        );
        if let Some(freq) = opts.freq_counter {
            stored.set_freq_counter(freq);
        }
        if let Some(nru) = opts.nru {
            stored.set_nru(nru);
        }
        let new_size = stored.mem_size() as i64;

        let outcome = vb.ht.upsert(stored);
        self.stats
            .account(new_size - outcome.old_mem_size.unwrap_or(0) as i64);
        if outcome.replaced_non_resident {
            vb.decr_non_resident();
        }
        vb.checkpoints.pin(Bytes::copy_from_slice(key));

        if self.stats.above_high_watermark() {
            self.memory_condition();
        }
        Ok(cas)
    }

    pub fn get(&self, vbid: u16, key: &[u8]) -> Result<GetValue> {
        let vb = self.online_vbucket(vbid)?;

        enum Out {
            Found(GetValue),
            Tombstone,
            Expired { keep: bool },
        }

        let out = vb.ht.mutate(key, |item| {
            if item.is_deleted() {
                return Out::Tombstone;
            }
            if item.is_expired(clock::now_secs()) {
                let keep = self.expire_in_place(vb, item, ExpirySource::Access);
                return Out::Expired { keep };
            }
            item.touch();
            let value = if item.is_resident() {
                item.value().cloned()
            } else {
                self.disk_value(vbid, key)
            };
            Out::Found(GetValue {
                value,
                cas: item.cas(),
                flags: item.flags(),
                datatype: item.datatype(),
                deleted: false,
            })
        });

        match out {
            Some(Out::Found(gv)) => Ok(gv),
            Some(Out::Expired { keep }) => {
                if !keep {
                    vb.ht.remove(key);
                }
                Err(Error::KeyNotFound)
            }
            Some(Out::Tombstone) | None => Err(Error::KeyNotFound),
        }
    }

    /// Fetch a document even if it is a tombstone (deleted-value read).
    pub fn get_deleted(&self, vbid: u16, key: &[u8]) -> Result<GetValue> {
        let vb = self.online_vbucket(vbid)?;
        let item = vb.ht.get(key).ok_or(Error::KeyNotFound)?;
        Ok(GetValue {
            value: item.value().cloned(),
            cas: item.cas(),
            flags: item.flags(),
            datatype: item.datatype(),
            deleted: item.is_deleted(),
        })
    }

    /// Explicitly page out one document's value. Persistent buckets only.
    pub fn evict_key(&self, vbid: u16, key: &[u8]) -> Result<()> {
        if self.is_ephemeral() {
            return Err(Error::NotSupported);
        }
        let vb = self.online_vbucket(vbid)?;
        vb.ht
            .mutate(key, |item| {
                if item.is_deleted() {
                    return Err(Error::KeyNotFound);
                }
                if item.is_dirty() {
                    return Err(Error::NotEvictable("dirty"));
                }
                if vb.checkpoints.is_pinned(item.key()) {
                    return Err(Error::NotEvictable("pinned by checkpoint"));
                }
                match item.eject() {
                    Some(freed) => {
                        self.stats.account(-(freed as i64));
                        self.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
                        vb.incr_non_resident();
                        Ok(())
                    }
                    None => Err(Error::NotEvictable("already non-resident")),
                }
            })
            .unwrap_or(Err(Error::KeyNotFound))
    }

    pub fn create_new_checkpoint(&self, vbid: u16) {
        if let Some(vb) = self.vbucket(vbid) {
            vb.checkpoints.create_new_checkpoint();
        }
    }

    // ==================== Persistence ====================

    pub fn flush_vbucket(&self, vbid: u16) -> Result<(bool, usize)> {
        let flusher = self.flusher.as_ref().ok_or(Error::NotSupported)?;
        let vb = self.vbucket(vbid).ok_or(Error::NotMyVBucket(vbid))?;
        Ok(flusher.flush_vbucket(vb))
    }

    pub(crate) fn disk_value(&self, vbid: u16, key: &[u8]) -> Option<Bytes> {
        self.flusher.as_ref().and_then(|f| f.value(vbid, key))
    }

    // ==================== Expiry ====================

    /// Delete an expired item in place, pruning user xattrs and keeping a
    /// tombstone only when system xattrs exist. Returns whether the entry
    /// stays in the table (as a tombstone) or should be removed.
    pub(crate) fn expire_in_place(
        &self,
        vb: &VBucket,
        item: &mut StoredItem,
        source: ExpirySource,
    ) -> bool {
        let raw = if item.is_resident() {
            item.value().cloned()
        } else {
            self.disk_value(vb.id, item.key())
        };
        let sys = raw.and_then(|v| item::system_xattrs(&v, item.datatype()));

        match source {
            ExpirySource::Pager => self.stats.expired_pager.fetch_add(1, Ordering::Relaxed),
            ExpirySource::Access => self.stats.expired_access.fetch_add(1, Ordering::Relaxed),
        };

        if !item.is_resident() {
            vb.decr_non_resident();
        }

        let before = item.mem_size() as i64;
        match sys {
            Some(blob) => {
                item.make_tombstone(Some(blob));
                if self.flusher.is_some() {
                    item.mark_dirty();
                }
                self.stats.account(item.mem_size() as i64 - before);
                true
            }
            None => {
                self.stats.account(-before);
                if let Some(flusher) = &self.flusher {
                    flusher.remove(vb.id, item.key());
                }
                false
            }
        }
    }

    // ==================== Item compressor ====================

    /// One sweep of the item compressor over every online vBucket.
    /// Active mode only; returns how many values were compressed.
    pub fn run_compressor_pass(&self) -> usize {
        if self.config.read().compression_mode != CompressionMode::Active {
            return 0;
        }
        let mut compressed = 0usize;
        let available = AtomicBool::new(true);
        for vb in self.vbuckets.iter().filter(|vb| vb.is_online()) {
            vb.ht.visit(&available, |item| {
                if item.is_deleted()
                    || !item.is_resident()
                    || datatype::is_compressed(item.datatype())
                {
                    return crate::storage::hashtable::VisitAction::Keep;
                }
                let Some(value) = item.value() else {
                    return crate::storage::hashtable::VisitAction::Keep;
                };
                if let Some(packed) = compression::compress(value) {
                    let before = item.mem_size() as i64;
                    let dt = item.datatype() | datatype::COMPRESSED;
                    item.replace_value(Bytes::from(packed), dt);
                    self.stats.account(item.mem_size() as i64 - before);
                    compressed += 1;
                }
                crate::storage::hashtable::VisitAction::Keep
            });
        }
        if compressed > 0 {
            log::debug!("Item compressor packed {} values", compressed);
        }
        compressed
    }
}
