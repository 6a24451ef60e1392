//! Slot table: the value store underneath the index and the queues.
//!
//! A slot is a descriptor plus a span of data-area bytes. The descriptor
//! index is the slot's UID, the one handle that crosses process boundaries.
//! Descriptors are handed out monotonically and never recycled; a deleted
//! slot keeps its descriptor forever in the `Retired` state, so a stale UID
//! held by another process can only ever read as absent, never as somebody
//! else's data.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::core::{Shf, Uid};
use crate::errors::{Result, ShfError};

pub(crate) const SLOT_DESC_SIZE: usize = mem::size_of::<SlotDesc>();

// Slot lifecycle. Unused descriptors are all-zero, so `UNUSED` must be 0.
pub(crate) const SLOT_UNUSED: u32 = 0;
pub(crate) const SLOT_ENTRY: u32 = 1;
pub(crate) const SLOT_ITEM: u32 = 2;
pub(crate) const SLOT_RETIRED: u32 = 3;

#[repr(C)]
pub(crate) struct SlotDesc {
    pub offset: u64,
    pub capacity: u32,
    pub used: AtomicU32,
    /// Published last with Release when the slot is allocated; readers load
    /// it with Acquire before trusting `offset`/`capacity`.
    pub state: AtomicU32,
    _pad: u32,
}

impl Shf {
    /// Allocate one slot of `capacity` payload bytes. Takes the allocator
    /// lock.
    pub(crate) fn alloc_slot(&self, capacity: u32, kind: u32) -> Result<Uid> {
        let _guard = self.lock_alloc()?;
        self.alloc_slot_locked(capacity, kind)
    }

    /// Allocate `count` slots of `capacity` bytes each, with consecutive
    /// UIDs over one contiguous data extent. Takes the allocator lock; the
    /// batch is what makes pool item UIDs arithmetically addressable.
    pub(crate) fn alloc_slot_batch(&self, count: u32, capacity: u32, kind: u32) -> Result<Uid> {
        let _guard = self.lock_alloc()?;
        let hdr = self.header();
        let first = hdr.slots_used.load(Ordering::Relaxed);
        if first + count > self.geo().max_slots {
            return Err(ShfError::SlotsExhausted(self.geo().max_slots));
        }
        let span = align8_u32(capacity) as u64;
        let base = self.arena_alloc(span * count as u64)?;
        for i in 0..count {
            unsafe {
                let desc = &mut *self.slot_desc_ptr(first + i);
                desc.offset = base + span * i as u64;
                desc.capacity = capacity;
                desc.used.store(0, Ordering::Relaxed);
                desc.state.store(kind, Ordering::Release);
            }
        }
        hdr.slots_used.store(first + count, Ordering::Release);
        trace!(first, count, capacity, "slot batch allocated");
        Ok(Uid(first))
    }

    /// Allocation body for callers that already hold the allocator lock.
    pub(crate) fn alloc_slot_locked(&self, capacity: u32, kind: u32) -> Result<Uid> {
        let hdr = self.header();
        let idx = hdr.slots_used.load(Ordering::Relaxed);
        if idx >= self.geo().max_slots {
            return Err(ShfError::SlotsExhausted(self.geo().max_slots));
        }
        let offset = self.arena_alloc(capacity as u64)?;
        unsafe {
            let desc = &mut *self.slot_desc_ptr(idx);
            desc.offset = offset;
            desc.capacity = capacity;
            desc.used.store(0, Ordering::Relaxed);
            desc.state.store(kind, Ordering::Release);
        }
        hdr.slots_used.store(idx + 1, Ordering::Release);
        trace!(uid = idx, capacity, kind, "slot allocated");
        Ok(Uid(idx))
    }

    /// Retire a live slot. The payload bytes become garbage; the descriptor
    /// stays, permanently `Retired`. Returns false if the UID was never
    /// allocated or is already retired.
    pub(crate) fn free_slot(&self, uid: Uid, expected_kind: u32) -> bool {
        let desc = match self.live_slot(uid, expected_kind) {
            Some(d) => d,
            None => return false,
        };
        if desc
            .state
            .compare_exchange(
                expected_kind,
                SLOT_RETIRED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        self.arena_retire(desc.capacity as u64);
        trace!(uid = uid.0, "slot retired");
        true
    }

    /// Descriptor of a UID that is currently allocated with `kind`, or None
    /// for unallocated, retired and wrong-kind UIDs alike.
    pub(crate) fn live_slot(&self, uid: Uid, kind: u32) -> Option<&SlotDesc> {
        if uid.0 >= self.header().slots_used.load(Ordering::Acquire) {
            return None;
        }
        let desc = unsafe { &*self.slot_desc_ptr(uid.0) };
        if desc.state.load(Ordering::Acquire) != kind {
            return None;
        }
        Some(desc)
    }

}

pub(crate) fn align8_u32(v: u32) -> u32 {
    (v + 7) & !7
}
