//! Block-addressed bump allocation over the data area.
//!
//! The data area is reserved in full when the region is created; "growth"
//! moves the committed watermark forward in block multiples and can never
//! relocate anything, so offsets handed out here stay valid for the life of
//! the region. All functions here require the caller to hold the allocator
//! lock; the counters are atomics only so other processes can read them
//! without it.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::core::Shf;
use crate::errors::{Result, ShfError};

impl Shf {
    /// Carve `len` bytes out of the data area, growing the committed
    /// watermark if the cursor would pass it. Returns the byte offset of the
    /// allocation, always 8-aligned.
    pub(crate) fn arena_alloc(&self, len: u64) -> Result<u64> {
        let hdr = self.header();
        let offset = align_up(hdr.data_used.load(Ordering::Relaxed), 8);
        let end = offset + len;
        if end > hdr.data_committed.load(Ordering::Relaxed) {
            self.arena_grow(end)?;
        }
        hdr.data_used.store(end, Ordering::Relaxed);
        trace!(offset, len, "arena alloc");
        Ok(offset)
    }

    /// Advance the committed watermark to at least `target` bytes. The need
    /// factor over-commits proportionally; when the factored size would pass
    /// the reservation, fall back to the exact need before giving up.
    fn arena_grow(&self, target: u64) -> Result<()> {
        let hdr = self.header();
        let committed = hdr.data_committed.load(Ordering::Relaxed);
        let block = self.geo().block_size as u64;
        let capacity = self.geo().data_capacity;
        let need = target - committed;

        let factor = hdr.need_factor.load(Ordering::Relaxed).max(1) as u64;
        let mut step = align_up(need * factor, block);
        if committed + step > capacity {
            step = align_up(need, block);
        }
        if committed + step > capacity {
            if target <= capacity {
                step = capacity - committed;
            } else {
                return Err(ShfError::Capacity {
                    needed: need,
                    available: capacity - committed,
                });
            }
        }
        hdr.data_committed.store(committed + step, Ordering::Relaxed);
        debug!(
            committed = committed + step,
            step, capacity, "arena growth"
        );
        Ok(())
    }

    /// Count `len` bytes as garbage. Retired space is never compacted or
    /// preferentially reused; the counter exists so operators can decide
    /// when a region is worth rebuilding.
    pub(crate) fn arena_retire(&self, len: u64) {
        self.header().garbage.fetch_add(len, Ordering::Relaxed);
    }
}

fn align_up(v: u64, to: u64) -> u64 {
    (v + to - 1) & !(to - 1)
}
