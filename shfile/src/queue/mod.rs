//! Queue engine.
//!
//! Queues are doubly linked lists of item slots threaded through the item
//! headers. `next` points toward the head (newer), `last` toward the tail
//! (older); push lands at the head and pull takes the tail, so each queue is
//! FIFO. An item is in at most one queue at a time; between a pull and the
//! following push it is owned by the caller and both links hold the
//! sentinel.
//!
//! Item slots come from two strategies over the same engine: dynamic
//! allocation one item at a time, or a pool that carves every item up front
//! over one contiguous extent so UIDs are consecutive and item payloads are
//! arithmetically addressable by any process.

use std::mem;
use std::slice;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::core::{Qid, Shf, Uid, NONE};
use crate::errors::{Result, ShfError};
use crate::index::RESERVED_PREFIX;
use crate::store::SLOT_ITEM;

pub(crate) const QUEUE_DESC_SIZE: usize = mem::size_of::<QueueDesc>();
const ITEM_HDR: usize = mem::size_of::<ItemHdr>();

/// Index key under which the pool geometry is published.
const POOL_KEY: &[u8] = &[RESERVED_PREFIX, b'p', b'o', b'o', b'l'];

/// Per-queue state in the queue table. The queue's mutex lives in the lock
/// block at the same index, not here.
#[repr(C)]
pub(crate) struct QueueDesc {
    /// Raw UID of the newest item, `NONE` when empty.
    pub head: u32,
    /// Raw UID of the oldest item, `NONE` when empty.
    pub tail: u32,
    pub count: u64,
}

#[repr(C)]
struct ItemHdr {
    /// Toward the tail (older), raw UID or `NONE`.
    last: u32,
    /// Toward the head (newer), raw UID or `NONE`.
    next: u32,
    /// Raw qid of the queue holding the item, `NONE` while a caller owns
    /// it. The links alone cannot carry this: a queue's only member has
    /// both links at the sentinel, exactly like an owned item.
    owner: u32,
    used: u32,
}

/// View of a batch-allocated item pool. Plain geometry, freely clonable;
/// every process reconstructs it from the region via [`Shf::queue_pool_get`].
#[derive(Clone, Copy, Debug)]
pub struct QueuePool {
    first_qid: u32,
    queues: u32,
    first_uid: u32,
    items: u32,
    item_size: u32,
}

impl QueuePool {
    /// Qid of the `i`-th pool queue. Queue 0 is conventionally the free
    /// queue and starts out holding every item.
    pub fn qid(&self, i: u32) -> Qid {
        debug_assert!(i < self.queues);
        Qid(self.first_qid + i)
    }

    pub fn queues(&self) -> u32 {
        self.queues
    }

    /// UID of the `i`-th pool item. Pool UIDs are consecutive.
    pub fn item_uid(&self, i: u32) -> Uid {
        debug_assert!(i < self.items);
        Uid(self.first_uid + i)
    }

    pub fn items(&self) -> u32 {
        self.items
    }

    pub fn item_size(&self) -> u32 {
        self.item_size
    }

    fn encode(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        for (i, v) in [
            self.first_qid,
            self.queues,
            self.first_uid,
            self.items,
            self.item_size,
        ]
        .into_iter()
        .enumerate()
        {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<QueuePool> {
        if buf.len() != 20 {
            return Err(ShfError::Corrupt("pool descriptor size".to_string()));
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(b)
        };
        Ok(QueuePool {
            first_qid: word(0),
            queues: word(1),
            first_uid: word(2),
            items: word(3),
            item_size: word(4),
        })
    }
}

impl Shf {
    /// Allocate an unqueued item with `size` payload bytes.
    pub fn queue_new_item(&self, size: u32) -> Result<Uid> {
        let uid = self.alloc_slot(ITEM_HDR as u32 + size, SLOT_ITEM)?;
        unsafe {
            let hdr = self.item_hdr(uid);
            hdr.last = NONE;
            hdr.next = NONE;
            hdr.owner = NONE;
            hdr.used = 0;
        }
        trace!(uid = uid.0, size, "item allocated");
        Ok(uid)
    }

    /// Write `bytes` into an item the caller owns (not currently queued).
    pub fn queue_put_item(&self, uid: Uid, bytes: &[u8]) -> Result<()> {
        let cap = self.owned_item_capacity(uid)?;
        if bytes.len() > cap as usize {
            return Err(ShfError::Usage(format!(
                "{} bytes do not fit a {}-byte item",
                bytes.len(),
                cap
            )));
        }
        unsafe {
            let dst = self.item_payload(uid);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            self.item_hdr(uid).used = bytes.len() as u32;
        }
        Ok(())
    }

    /// Push an owned item at the head of `qid`.
    pub fn queue_push_head(&self, qid: Qid, uid: Uid) -> Result<()> {
        self.with_queue_locks(&[qid.0], |shf| shf.push_locked(qid, uid))
    }

    /// Pull the oldest item of `qid`. The caller owns the returned item.
    pub fn queue_pull_tail(&self, qid: Qid) -> Result<Option<Uid>> {
        self.with_queue_locks(&[qid.0], |shf| Ok(shf.pull_locked(qid)))
    }

    /// Write `bytes` into the item and push it, in that order; the payload
    /// is complete before any other process can pull the item.
    pub fn queue_push_head_with(&self, qid: Qid, uid: Uid, bytes: &[u8]) -> Result<()> {
        self.queue_put_item(uid, bytes)?;
        self.queue_push_head(qid, uid)
    }

    /// Pull the oldest item and copy its payload out.
    pub fn queue_pull_tail_copy(&self, qid: Qid) -> Result<Option<(Uid, Vec<u8>)>> {
        let uid = match self.queue_pull_tail(qid)? {
            Some(uid) => uid,
            None => return Ok(None),
        };
        let bytes = self
            .with_item(uid, |b| b.to_vec())?
            .unwrap_or_default();
        Ok(Some((uid, bytes)))
    }

    /// Atomically push an item onto `push_qid` (when given) and pull the
    /// oldest item of `pull_qid`. Both queue locks are held for the whole
    /// step, so no other process can observe the push without the pull. With
    /// `push = None` this is a plain pull; with `push_qid == pull_qid` on an
    /// empty queue the pushed item comes straight back.
    pub fn queue_push_head_pull_tail(
        &self,
        push: Option<Uid>,
        push_qid: Qid,
        pull_qid: Qid,
    ) -> Result<Option<Uid>> {
        self.with_queue_locks(&[push_qid.0, pull_qid.0], |shf| {
            if let Some(uid) = push {
                shf.push_locked(push_qid, uid)?;
            }
            Ok(shf.pull_locked(pull_qid))
        })
    }

    /// Number of items currently in `qid`.
    pub fn queue_size(&self, qid: Qid) -> Result<u64> {
        self.with_queue_locks(&[qid.0], |shf| {
            Ok(unsafe { (*shf.queue_desc_ptr(qid.0)).count })
        })
    }

    /// Take a specific item out of `qid`, wherever it sits in the queue.
    /// The caller owns the item afterwards. Returns false when the item is
    /// not a member of that queue.
    pub fn queue_take_item(&self, qid: Qid, uid: Uid) -> Result<bool> {
        self.with_queue_locks(&[qid.0], |shf| {
            if shf.live_slot(uid, SLOT_ITEM).is_none() {
                return Ok(false);
            }
            unsafe {
                let ih = shf.item_hdr(uid);
                if ih.owner != qid.0 {
                    return Ok(false);
                }
                let qd = &mut *shf.queue_desc_ptr(qid.0);
                if ih.next != NONE {
                    shf.item_hdr(Uid(ih.next)).last = ih.last;
                } else {
                    qd.head = ih.last;
                }
                if ih.last != NONE {
                    shf.item_hdr(Uid(ih.last)).next = ih.next;
                } else {
                    qd.tail = ih.next;
                }
                ih.last = NONE;
                ih.next = NONE;
                ih.owner = NONE;
                qd.count -= 1;
            }
            trace!(qid = qid.0, uid = uid.0, "take item");
            Ok(true)
        })
    }

    /// Read access to an item's written payload. Absent for stale or
    /// non-item UIDs. The item should be owned by the caller or its queue
    /// otherwise quiesced; item payloads are not locked.
    pub fn with_item<R>(&self, uid: Uid, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        if self.live_slot(uid, SLOT_ITEM).is_none() {
            return Ok(None);
        }
        let bytes = unsafe {
            let used = (*self.item_hdr(uid)).used as usize;
            slice::from_raw_parts(self.item_payload(uid), used)
        };
        Ok(Some(f(bytes)))
    }

    /// Write access to an item's full payload capacity. Marks the whole
    /// capacity as written, the fixed-size pool convention.
    pub fn with_item_mut<R>(&self, uid: Uid, f: impl FnOnce(&mut [u8]) -> R) -> Result<Option<R>> {
        let cap = match self.live_slot(uid, SLOT_ITEM) {
            Some(desc) => desc.capacity - ITEM_HDR as u32,
            None => return Ok(None),
        };
        let r = unsafe {
            let bytes = slice::from_raw_parts_mut(self.item_payload(uid), cap as usize);
            let r = f(bytes);
            self.item_hdr(uid).used = cap;
            r
        };
        Ok(Some(r))
    }

    /// Carve a pool: `queues` consecutive qids and `items` consecutive item
    /// UIDs over one contiguous extent, with every item seeded into queue 0.
    /// `prefill_factor` is applied as the arena need factor while the extent
    /// is carved, so the growth that backs the pool over-commits
    /// proportionally. One pool per region; publishing it twice is a usage
    /// error.
    pub fn queue_pool_new(
        &self,
        queues: u32,
        items: u32,
        item_size: u32,
        prefill_factor: u32,
    ) -> Result<QueuePool> {
        if queues == 0 || items == 0 {
            return Err(ShfError::Usage("empty pool".to_string()));
        }
        let _names = self.lock_names()?;
        if self.get_key_val(POOL_KEY)?.is_some() {
            return Err(ShfError::Usage("pool already exists".to_string()));
        }

        let hdr = self.header();
        let saved_factor = hdr.need_factor.load(Ordering::Relaxed);
        hdr.need_factor
            .store(prefill_factor.max(1), Ordering::Relaxed);
        let carved = (|| -> Result<(u32, Uid)> {
            let first_qid = self.alloc_qids(queues)?;
            let first = self.alloc_slot_batch(items, ITEM_HDR as u32 + item_size, SLOT_ITEM)?;
            Ok((first_qid, first))
        })();
        hdr.need_factor.store(saved_factor, Ordering::Relaxed);
        let (first_qid, first) = carved?;

        let pool = QueuePool {
            first_qid,
            queues,
            first_uid: first.0,
            items,
            item_size,
        };

        // Seed the free queue before the pool key is published; nothing can
        // reach these qids or UIDs until the key resolves.
        for i in 0..items {
            unsafe {
                let ih = self.item_hdr(Uid(first.0 + i));
                ih.last = if i == 0 { NONE } else { first.0 + i - 1 };
                ih.next = if i == items - 1 { NONE } else { first.0 + i + 1 };
                ih.owner = first_qid;
                ih.used = item_size;
            }
        }
        unsafe {
            let qd = &mut *self.queue_desc_ptr(first_qid);
            qd.tail = first.0;
            qd.head = first.0 + items - 1;
            qd.count = items as u64;
        }

        self.put_key_val(POOL_KEY, &pool.encode())?;
        debug!(first_qid, queues, items, item_size, "pool created");
        Ok(pool)
    }

    /// View of the region's pool, if one was published.
    pub fn queue_pool_get(&self) -> Result<Option<QueuePool>> {
        match self.get_key_val(POOL_KEY)? {
            Some(bytes) => Ok(Some(QueuePool::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn push_locked(&self, qid: Qid, uid: Uid) -> Result<()> {
        if self.live_slot(uid, SLOT_ITEM).is_none() {
            return Err(ShfError::Usage(format!("uid {} is not an item", uid.0)));
        }
        unsafe {
            let ih = self.item_hdr(uid);
            if ih.owner != NONE {
                return Err(ShfError::Usage(format!(
                    "item {} is already in queue {}",
                    uid.0, ih.owner
                )));
            }
            let qd = &mut *self.queue_desc_ptr(qid.0);
            ih.last = qd.head;
            ih.owner = qid.0;
            if qd.head != NONE {
                self.item_hdr(Uid(qd.head)).next = uid.0;
            } else {
                qd.tail = uid.0;
            }
            qd.head = uid.0;
            qd.count += 1;
        }
        trace!(qid = qid.0, uid = uid.0, "push head");
        Ok(())
    }

    fn pull_locked(&self, qid: Qid) -> Option<Uid> {
        unsafe {
            let qd = &mut *self.queue_desc_ptr(qid.0);
            if qd.tail == NONE {
                return None;
            }
            let uid = Uid(qd.tail);
            let ih = self.item_hdr(uid);
            qd.tail = ih.next;
            if qd.tail != NONE {
                self.item_hdr(Uid(qd.tail)).last = NONE;
            } else {
                qd.head = NONE;
            }
            ih.last = NONE;
            ih.next = NONE;
            ih.owner = NONE;
            qd.count -= 1;
            trace!(qid = qid.0, uid = uid.0, "pull tail");
            Some(uid)
        }
    }

    /// Reserve `count` consecutive qids. Takes the allocator lock.
    pub(crate) fn alloc_qids(&self, count: u32) -> Result<u32> {
        let _guard = self.lock_alloc()?;
        let hdr = self.header();
        let first = hdr.queues_used.load(Ordering::Relaxed);
        if first + count > self.geo().max_queues {
            return Err(ShfError::QueuesExhausted(self.geo().max_queues));
        }
        hdr.queues_used.store(first + count, Ordering::Release);
        Ok(first)
    }

    fn owned_item_capacity(&self, uid: Uid) -> Result<u32> {
        let desc = self
            .live_slot(uid, SLOT_ITEM)
            .ok_or_else(|| ShfError::Usage(format!("uid {} is not an item", uid.0)))?;
        unsafe {
            let ih = &*(self.item_hdr(uid) as *const ItemHdr);
            if ih.owner != NONE {
                return Err(ShfError::Usage(format!(
                    "item {} is in queue {} and cannot be written",
                    uid.0, ih.owner
                )));
            }
        }
        Ok(desc.capacity - ITEM_HDR as u32)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn item_hdr(&self, uid: Uid) -> &mut ItemHdr {
        let desc = &*self.slot_desc_ptr(uid.0);
        &mut *(self.data_ptr(desc.offset) as *mut ItemHdr)
    }

    unsafe fn item_payload(&self, uid: Uid) -> *mut u8 {
        let desc = &*self.slot_desc_ptr(uid.0);
        self.data_ptr(desc.offset).add(ITEM_HDR)
    }
}
