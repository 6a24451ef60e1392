//! Region layout and attachment.
//!
//! One named instance is a single fixed-size `shared_memory` mapping reached
//! through the file link `<data_dir>/<name>.shf`. The mapping is carved into
//! a header, a block of process-shared mutexes, the hash bucket array, the
//! slot table, the queue table and the data area. All cross-process
//! references are 32-bit UIDs or byte offsets, never pointers, so the same
//! region is valid at different base addresses in different processes.

use std::cell::RefCell;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info};

use crate::errors::{lock_err, Result, ShfError};
use crate::queue::{QueueDesc, QUEUE_DESC_SIZE};
use crate::store::SLOT_DESC_SIZE;

pub(crate) mod arena;

pub(crate) const SHF_MAGIC: u64 = 0x5348_4652_4547_4e31; // "SHFREGN1"
pub(crate) const LAYOUT_VERSION: u32 = 1;
const READY: u32 = 0x5245_4459; // "REDY"

/// Raw in-region value of the `none` sentinel.
pub(crate) const NONE: u32 = u32::MAX;

/// Bytes reserved per process-shared mutex. `raw_sync` needs less than this
/// on every supported platform; checked at region creation.
pub(crate) const LOCK_SPAN: usize = 128;
const HEADER_SPAN: usize = 256;

/// Handle to a value slot or queue item. `0xFFFF_FFFF` is reserved and never
/// issued; the public API uses `Option<Uid>` instead of the raw sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Uid(pub u32);

/// Handle to a queue in the queue table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Qid(pub u32);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShfConfig {
    pub data_dir: String,
    pub name: String,
    /// Reserved size of the data area in bytes. The arena commits blocks out
    /// of this reservation on demand; exhausting it is the capacity failure.
    pub data_capacity: u64,
    pub block_size: u32,
    /// Hash bucket count, power of two.
    pub buckets: u32,
    /// Index stripe-lock count, power of two, `<= buckets`.
    pub stripes: u32,
    pub max_slots: u32,
    pub max_queues: u32,
}

impl Default for ShfConfig {
    fn default() -> ShfConfig {
        ShfConfig {
            data_dir: "/dev/shm".to_string(),
            name: "shfile".to_string(),
            data_capacity: 16 * 1024 * 1024,
            block_size: 4096,
            buckets: 4096,
            stripes: 16,
            max_slots: 65536,
            max_queues: 64,
        }
    }
}

impl ShfConfig {
    pub fn builder() -> ShfConfigBuilder {
        ShfConfigBuilder {
            cfg: ShfConfig::default(),
        }
    }

    pub fn region_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(format!("{}.shf", self.name))
    }

    fn validate(&self) -> Result<()> {
        if !self.buckets.is_power_of_two() || !self.stripes.is_power_of_two() {
            return Err(ShfError::Config(
                "buckets and stripes must be powers of two".to_string(),
            ));
        }
        if self.stripes > self.buckets {
            return Err(ShfError::Config("stripes must be <= buckets".to_string()));
        }
        if self.block_size < 512 {
            return Err(ShfError::Config("block_size must be >= 512".to_string()));
        }
        if self.data_capacity < self.block_size as u64 {
            return Err(ShfError::Config(
                "data_capacity must hold at least one block".to_string(),
            ));
        }
        if self.max_slots == 0 || self.max_slots == u32::MAX || self.max_queues == 0 {
            return Err(ShfError::Config(
                "max_slots and max_queues must be non-zero (and below the sentinel)".to_string(),
            ));
        }
        if self.name.is_empty() || self.name.contains('/') {
            return Err(ShfError::Config("invalid region name".to_string()));
        }
        Ok(())
    }
}

pub struct ShfConfigBuilder {
    cfg: ShfConfig,
}

impl ShfConfigBuilder {
    pub fn data_dir(mut self, v: impl Into<String>) -> Self {
        self.cfg.data_dir = v.into();
        self
    }
    pub fn name(mut self, v: impl Into<String>) -> Self {
        self.cfg.name = v.into();
        self
    }
    pub fn data_capacity(mut self, v: u64) -> Self {
        self.cfg.data_capacity = v;
        self
    }
    pub fn block_size(mut self, v: u32) -> Self {
        self.cfg.block_size = v;
        self
    }
    pub fn buckets(mut self, v: u32) -> Self {
        self.cfg.buckets = v;
        self
    }
    pub fn stripes(mut self, v: u32) -> Self {
        self.cfg.stripes = v;
        self
    }
    pub fn max_slots(mut self, v: u32) -> Self {
        self.cfg.max_slots = v;
        self
    }
    pub fn max_queues(mut self, v: u32) -> Self {
        self.cfg.max_queues = v;
        self
    }
    pub fn build(self) -> Result<ShfConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Geometry is fixed at region creation and read back from the header by
/// every opener, so processes never need to agree on configuration out of
/// band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub block_size: u32,
    pub buckets: u32,
    pub stripes: u32,
    pub max_slots: u32,
    pub max_queues: u32,
    pub data_capacity: u64,
}

impl Geometry {
    fn from_config(cfg: &ShfConfig) -> Geometry {
        Geometry {
            block_size: cfg.block_size,
            buckets: cfg.buckets,
            stripes: cfg.stripes,
            max_slots: cfg.max_slots,
            max_queues: cfg.max_queues,
            data_capacity: cfg.data_capacity,
        }
    }

    fn from_header(hdr: &RegionHeader) -> Geometry {
        Geometry {
            block_size: hdr.block_size,
            buckets: hdr.buckets,
            stripes: hdr.stripes,
            max_slots: hdr.max_slots,
            max_queues: hdr.max_queues,
            data_capacity: hdr.data_capacity,
        }
    }

    pub(crate) fn layout(&self) -> RegionLayout {
        let locks_off = HEADER_SPAN;
        let n_locks = 2 + self.stripes as usize + self.max_queues as usize;
        let buckets_off = locks_off + n_locks * LOCK_SPAN;
        let slots_off = align8(buckets_off + self.buckets as usize * mem::size_of::<u32>());
        let queues_off = align8(slots_off + self.max_slots as usize * SLOT_DESC_SIZE);
        let data_off = align8(queues_off + self.max_queues as usize * QUEUE_DESC_SIZE);
        RegionLayout {
            locks_off,
            buckets_off,
            slots_off,
            queues_off,
            data_off,
            total_size: data_off + self.data_capacity as usize,
            geo: *self,
        }
    }
}

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RegionLayout {
    pub locks_off: usize,
    pub buckets_off: usize,
    pub slots_off: usize,
    pub queues_off: usize,
    pub data_off: usize,
    pub total_size: usize,
    pub geo: Geometry,
}

impl RegionLayout {
    fn lock_off(&self, idx: usize) -> usize {
        self.locks_off + idx * LOCK_SPAN
    }
}

// Lock block indices. Stripe locks follow the fixed pair, queue locks follow
// the stripes.
const LOCK_ALLOC: usize = 0;
const LOCK_NAMES: usize = 1;
const LOCK_STRIPE0: usize = 2;

#[repr(C)]
pub(crate) struct RegionHeader {
    pub magic: u64,
    pub version: u32,
    pub block_size: u32,
    pub buckets: u32,
    pub stripes: u32,
    pub max_slots: u32,
    pub max_queues: u32,
    pub data_capacity: u64,
    pub data_used: AtomicU64,
    pub data_committed: AtomicU64,
    pub garbage: AtomicU64,
    pub slots_used: AtomicU32,
    pub queues_used: AtomicU32,
    pub need_factor: AtomicU32,
    pub ready: AtomicU32,
}

/// Snapshot of the region counters, for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct ShfStats {
    pub data_used: u64,
    pub data_committed: u64,
    pub data_capacity: u64,
    pub garbage_bytes: u64,
    pub slots_used: u32,
    pub queues_used: u32,
}

/// Handle to one attached region.
///
/// The handle is not `Send`/`Sync`: the engine is a passive shared structure
/// and every thread or process attaches its own handle. Any number of
/// handles, in any mix of processes, may operate on the same region
/// concurrently.
pub struct Shf {
    // Field order matters for drop: locks reference the mapping.
    alloc_lock: Box<dyn LockImpl>,
    names_lock: Box<dyn LockImpl>,
    stripe_locks: Vec<Box<dyn LockImpl>>,
    queue_locks: RefCell<Vec<Option<Box<dyn LockImpl>>>>,
    base: *mut u8,
    layout: RegionLayout,
    shmem: Shmem,
}

impl Shf {
    /// Attach to the named region, creating it if absent. Never fails on a
    /// pre-existing region; the creator's geometry wins and later callers
    /// read it from the header.
    pub fn attach(cfg: &ShfConfig) -> Result<Shf> {
        cfg.validate()?;
        let geo = Geometry::from_config(cfg);
        let layout = geo.layout();
        let flink = cfg.region_path();
        match ShmemConf::new()
            .size(layout.total_size)
            .flink(&flink)
            .create()
        {
            Ok(shmem) => {
                info!(name = %cfg.name, size = layout.total_size, "creating region");
                Shf::init_region(shmem, layout)
            }
            Err(ShmemError::LinkExists) => Shf::open_region(cfg, &flink),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach to the named region only if it already exists. Performs no
    /// creation side effect; a missing region is an attachment failure.
    pub fn attach_existing(cfg: &ShfConfig) -> Result<Shf> {
        let flink = cfg.region_path();
        if !flink.exists() {
            return Err(ShfError::Attach(
                cfg.name.clone(),
                "region does not exist".to_string(),
            ));
        }
        Shf::open_region(cfg, &flink)
    }

    fn init_region(mut shmem: Shmem, layout: RegionLayout) -> Result<Shf> {
        // The region outlives every attached process; teardown is an
        // explicit external deletion of the .shf link, never a detach.
        shmem.set_owner(false);
        let base = shmem.as_ptr();
        let geo = layout.geo;

        unsafe {
            let hdr = &mut *(base as *mut RegionHeader);
            hdr.magic = SHF_MAGIC;
            hdr.version = LAYOUT_VERSION;
            hdr.block_size = geo.block_size;
            hdr.buckets = geo.buckets;
            hdr.stripes = geo.stripes;
            hdr.max_slots = geo.max_slots;
            hdr.max_queues = geo.max_queues;
            hdr.data_capacity = geo.data_capacity;
            hdr.need_factor.store(1, Ordering::Relaxed);

            // Zero is a valid UID, so empty bucket heads and queue ends must
            // hold the sentinel explicitly.
            for b in 0..geo.buckets {
                *(base.add(layout.buckets_off + b as usize * 4) as *mut u32) = NONE;
            }
            for q in 0..geo.max_queues {
                let desc = base.add(layout.queues_off + q as usize * QUEUE_DESC_SIZE)
                    as *mut QueueDesc;
                (*desc).head = NONE;
                (*desc).tail = NONE;
                (*desc).count = 0;
            }
        }

        let first = unsafe { base.add(layout.lock_off(0)) };
        if Mutex::size_of(Some(first)) > LOCK_SPAN {
            return Err(ShfError::Config(
                "platform mutex does not fit the reserved lock span".to_string(),
            ));
        }

        let alloc_lock = new_lock(base, &layout, LOCK_ALLOC)?;
        let names_lock = new_lock(base, &layout, LOCK_NAMES)?;
        let mut stripe_locks = Vec::with_capacity(geo.stripes as usize);
        for s in 0..geo.stripes as usize {
            stripe_locks.push(new_lock(base, &layout, LOCK_STRIPE0 + s)?);
        }
        // Queue locks are fully initialized by the creator so that openers
        // only ever need from_existing.
        let mut queue_locks = Vec::with_capacity(geo.max_queues as usize);
        for q in 0..geo.max_queues as usize {
            queue_locks.push(Some(new_lock(
                base,
                &layout,
                LOCK_STRIPE0 + geo.stripes as usize + q,
            )?));
        }

        unsafe {
            (*(base as *mut RegionHeader))
                .ready
                .store(READY, Ordering::Release);
        }
        debug!(total = layout.total_size, "region initialized");

        Ok(Shf {
            alloc_lock,
            names_lock,
            stripe_locks,
            queue_locks: RefCell::new(queue_locks),
            base,
            layout,
            shmem,
        })
    }

    fn open_region(cfg: &ShfConfig, flink: &Path) -> Result<Shf> {
        let mut shmem = ShmemConf::new().flink(flink).open()?;
        shmem.set_owner(false);
        let base = shmem.as_ptr();
        let hdr = unsafe { &*(base as *const RegionHeader) };

        // A racing creator publishes the header last; wait briefly for it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while hdr.ready.load(Ordering::Acquire) != READY {
            if Instant::now() > deadline {
                return Err(ShfError::Attach(
                    cfg.name.clone(),
                    "region initialization timed out".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
        if hdr.magic != SHF_MAGIC {
            return Err(ShfError::Corrupt("bad magic".to_string()));
        }
        if hdr.version != LAYOUT_VERSION {
            return Err(ShfError::Attach(
                cfg.name.clone(),
                format!("layout version {} != {}", hdr.version, LAYOUT_VERSION),
            ));
        }

        let geo = Geometry::from_header(hdr);
        let layout = geo.layout();
        if shmem.len() < layout.total_size {
            return Err(ShfError::Corrupt(format!(
                "mapping is {} bytes, layout needs {}",
                shmem.len(),
                layout.total_size
            )));
        }

        let alloc_lock = open_lock(base, &layout, LOCK_ALLOC)?;
        let names_lock = open_lock(base, &layout, LOCK_NAMES)?;
        let mut stripe_locks = Vec::with_capacity(geo.stripes as usize);
        for s in 0..geo.stripes as usize {
            stripe_locks.push(open_lock(base, &layout, LOCK_STRIPE0 + s)?);
        }
        // Opened lazily on first use of each queue.
        let mut queue_locks = Vec::with_capacity(geo.max_queues as usize);
        queue_locks.resize_with(geo.max_queues as usize, || None);

        debug!(name = %cfg.name, "attached existing region");
        Ok(Shf {
            alloc_lock,
            names_lock,
            stripe_locks,
            queue_locks: RefCell::new(queue_locks),
            base,
            layout,
            shmem,
        })
    }

    pub(crate) fn header(&self) -> &RegionHeader {
        unsafe { &*(self.base as *const RegionHeader) }
    }

    pub(crate) fn geo(&self) -> &Geometry {
        &self.layout.geo
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn data_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.layout.geo.data_capacity);
        unsafe { self.base.add(self.layout.data_off + offset as usize) }
    }

    pub(crate) fn bucket_ptr(&self, bucket: u32) -> *mut u32 {
        debug_assert!(bucket < self.layout.geo.buckets);
        unsafe { self.base.add(self.layout.buckets_off + bucket as usize * 4) as *mut u32 }
    }

    pub(crate) fn slot_desc_ptr(&self, idx: u32) -> *mut crate::store::SlotDesc {
        debug_assert!(idx < self.layout.geo.max_slots);
        unsafe {
            self.base.add(self.layout.slots_off + idx as usize * SLOT_DESC_SIZE)
                as *mut crate::store::SlotDesc
        }
    }

    pub(crate) fn queue_desc_ptr(&self, qid: u32) -> *mut QueueDesc {
        debug_assert!(qid < self.layout.geo.max_queues);
        unsafe {
            self.base.add(self.layout.queues_off + qid as usize * QUEUE_DESC_SIZE)
                as *mut QueueDesc
        }
    }

    pub(crate) fn lock_alloc(&self) -> Result<LockGuard<'_>> {
        self.alloc_lock.lock().map_err(lock_err)
    }

    pub(crate) fn lock_names(&self) -> Result<LockGuard<'_>> {
        self.names_lock.lock().map_err(lock_err)
    }

    /// Lock the stripe guarding `bucket`.
    pub(crate) fn lock_stripe(&self, bucket: u32) -> Result<LockGuard<'_>> {
        let stripe = (bucket & (self.layout.geo.stripes - 1)) as usize;
        self.stripe_locks[stripe].lock().map_err(lock_err)
    }

    /// Run `f` with the locks of every queue in `qids` held. Locks are taken
    /// in ascending qid order so concurrent combined operations on the same
    /// queue pair cannot deadlock.
    pub(crate) fn with_queue_locks<R>(
        &self,
        qids: &[u32],
        f: impl FnOnce(&Shf) -> Result<R>,
    ) -> Result<R> {
        let mut order: Vec<u32> = qids.to_vec();
        order.sort_unstable();
        order.dedup();
        for &qid in &order {
            if qid >= self.layout.geo.max_queues {
                return Err(ShfError::Usage(format!("qid {} out of range", qid)));
            }
            self.ensure_queue_lock(qid)?;
        }
        let locks = self.queue_locks.borrow();
        let mut guards = Vec::with_capacity(order.len());
        for &qid in &order {
            match locks[qid as usize].as_ref() {
                Some(lock) => guards.push(lock.lock().map_err(lock_err)?),
                None => return Err(ShfError::Lock(format!("queue {} lock unopened", qid))),
            }
        }
        f(self)
    }

    fn ensure_queue_lock(&self, qid: u32) -> Result<()> {
        if self.queue_locks.borrow()[qid as usize].is_some() {
            return Ok(());
        }
        let idx = LOCK_STRIPE0 + self.layout.geo.stripes as usize + qid as usize;
        let lock = open_lock(self.base, &self.layout, idx)?;
        self.queue_locks.borrow_mut()[qid as usize] = Some(lock);
        Ok(())
    }

    /// Multiplier applied to every arena growth so repeated small writes
    /// over-reserve proportionally. Factor 1 grows exactly to need.
    pub fn set_data_need_factor(&self, factor: u32) {
        self.header()
            .need_factor
            .store(factor.max(1), Ordering::Relaxed);
    }

    /// Bytes freed by deletion but not yet reclaimed. Advisory; grows on
    /// every delete and is never decremented by growth.
    pub fn debug_get_garbage(&self) -> u64 {
        self.header().garbage.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ShfStats {
        let hdr = self.header();
        ShfStats {
            data_used: hdr.data_used.load(Ordering::Relaxed),
            data_committed: hdr.data_committed.load(Ordering::Relaxed),
            data_capacity: hdr.data_capacity,
            garbage_bytes: hdr.garbage.load(Ordering::Relaxed),
            slots_used: hdr.slots_used.load(Ordering::Relaxed).min(hdr.max_slots),
            queues_used: hdr.queues_used.load(Ordering::Relaxed).min(hdr.max_queues),
        }
    }
}

fn new_lock(base: *mut u8, layout: &RegionLayout, idx: usize) -> Result<Box<dyn LockImpl>> {
    let ptr = unsafe { base.add(layout.lock_off(idx)) };
    let (lock, _) = unsafe { Mutex::new(ptr, ptr) }.map_err(lock_err)?;
    Ok(lock)
}

fn open_lock(base: *mut u8, layout: &RegionLayout, idx: usize) -> Result<Box<dyn LockImpl>> {
    let ptr = unsafe { base.add(layout.lock_off(idx)) };
    let (lock, _) = unsafe { Mutex::from_existing(ptr, ptr) }.map_err(lock_err)?;
    Ok(lock)
}
