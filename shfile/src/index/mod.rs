//! Hash index over the slot table.
//!
//! Buckets hold a `u32` chain head; the chain link lives in the entry
//! header, so one slot carries header, key and value in a single span.
//! Bucket chains are guarded by stripe locks: `stripe = bucket & (stripes -
//! 1)`. Everything immutable about an entry (hash, key, link position aside)
//! is written before the slot is published, so only chain surgery and value
//! overwrites need the stripe lock.
//!
//! Keys are arbitrary byte strings, hashed with xxh3. Keys beginning with
//! the `\u{1}` byte are reserved for the engine's own records (queue names,
//! pool descriptors); callers should not use that prefix.

use std::mem;
use std::ptr;
use std::slice;

use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::{Shf, Uid, NONE};
use crate::errors::{Result, ShfError};
use crate::store::SLOT_ENTRY;

pub(crate) const ENTRY_HDR: usize = mem::size_of::<EntryHdr>();

/// Prefix under which the engine stores its own keys.
pub(crate) const RESERVED_PREFIX: u8 = 0x01;

#[repr(C)]
struct EntryHdr {
    hash: u64,
    /// Raw UID of the next entry in the bucket chain, `NONE` at the end.
    next: u32,
    key_len: u32,
    val_used: u32,
    _pad: u32,
}

impl Shf {
    /// Insert a new entry for `key`. Duplicates are permitted and shadow the
    /// older entries: lookups walk newest-first, so the latest insert wins
    /// until it is deleted.
    pub fn put_key_val(&self, key: &[u8], val: &[u8]) -> Result<Uid> {
        let hash = xxh3_64(key);
        let uid = self.new_entry(hash, key, val, NONE)?;
        let bucket = self.bucket_of(hash);
        let _stripe = self.lock_stripe(bucket)?;
        unsafe {
            let head = self.bucket_ptr(bucket);
            self.entry_hdr(uid).next = *head;
            *head = uid.0;
        }
        trace!(uid = uid.0, key_len = key.len(), "put");
        Ok(uid)
    }

    /// Insert `key` or overwrite its newest entry. The value is replaced in
    /// place when it fits the existing slot (the UID survives); otherwise a
    /// new slot takes the entry's chain position and the old one is retired.
    /// The returned UID is authoritative either way.
    pub fn put_or_replace(&self, key: &[u8], val: &[u8]) -> Result<Uid> {
        let hash = xxh3_64(key);
        let bucket = self.bucket_of(hash);
        let _stripe = self.lock_stripe(bucket)?;

        if let Some((prev, uid)) = self.chain_find(bucket, hash, key) {
            let desc = match self.live_slot(uid, SLOT_ENTRY) {
                Some(d) => d,
                None => return Err(ShfError::Corrupt("chained UID not live".to_string())),
            };
            let room = desc.capacity as usize - ENTRY_HDR - key.len();
            if val.len() <= room {
                unsafe {
                    let hdr = self.entry_hdr(uid);
                    let dst = self
                        .data_ptr(desc.offset)
                        .add(ENTRY_HDR + key.len());
                    ptr::copy_nonoverlapping(val.as_ptr(), dst, val.len());
                    hdr.val_used = val.len() as u32;
                }
                trace!(uid = uid.0, "replace in place");
                return Ok(uid);
            }
            // Splice a bigger slot into the same chain position, then retire
            // the old one. Stripe lock is held throughout, so no lookup can
            // see the key vanish.
            let next = unsafe { self.entry_hdr(uid).next };
            let fresh = self.new_entry(hash, key, val, next)?;
            unsafe {
                match prev {
                    Some(p) => self.entry_hdr(p).next = fresh.0,
                    None => *self.bucket_ptr(bucket) = fresh.0,
                }
            }
            self.free_slot(uid, SLOT_ENTRY);
            trace!(old = uid.0, new = fresh.0, "replace by realloc");
            return Ok(fresh);
        }

        let uid = self.new_entry(hash, key, val, NONE)?;
        unsafe {
            let head = self.bucket_ptr(bucket);
            self.entry_hdr(uid).next = *head;
            *head = uid.0;
        }
        Ok(uid)
    }

    /// Copying lookup by key.
    pub fn get_key_val(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_key_val(key, |v| v.to_vec())
    }

    /// Zero-copy lookup by key: `f` runs over the value bytes in place,
    /// under the stripe lock.
    pub fn with_key_val<R>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        let hash = xxh3_64(key);
        let bucket = self.bucket_of(hash);
        let _stripe = self.lock_stripe(bucket)?;
        match self.chain_find(bucket, hash, key) {
            Some((_, uid)) => Ok(Some(f(self.entry_val(uid)))),
            None => Ok(None),
        }
    }

    /// Copying lookup by UID. Only hash-entry UIDs resolve; item and extent
    /// UIDs, retired UIDs and never-issued UIDs all read as absent.
    pub fn get_uid_val(&self, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.with_uid_val(uid, |v| v.to_vec())
    }

    /// Zero-copy lookup by UID, under the stripe lock of the entry's bucket.
    pub fn with_uid_val<R>(&self, uid: Uid, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        let hash = match self.live_slot(uid, SLOT_ENTRY) {
            Some(_) => unsafe { self.entry_hdr(uid).hash },
            None => return Ok(None),
        };
        let _stripe = self.lock_stripe(self.bucket_of(hash))?;
        // Re-check under the lock: a concurrent delete may have won.
        if self.live_slot(uid, SLOT_ENTRY).is_none() {
            return Ok(None);
        }
        Ok(Some(f(self.entry_val(uid))))
    }

    /// Delete the newest entry for `key`. Returns whether one existed.
    pub fn del_key_val(&self, key: &[u8]) -> Result<bool> {
        let hash = xxh3_64(key);
        let bucket = self.bucket_of(hash);
        let _stripe = self.lock_stripe(bucket)?;
        match self.chain_find(bucket, hash, key) {
            Some((prev, uid)) => {
                self.chain_unlink(bucket, prev, uid);
                self.free_slot(uid, SLOT_ENTRY);
                trace!(uid = uid.0, "del by key");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete the entry a UID points at. Stale and foreign UIDs are a no-op.
    pub fn del_uid_val(&self, uid: Uid) -> Result<bool> {
        let hash = match self.live_slot(uid, SLOT_ENTRY) {
            Some(_) => unsafe { self.entry_hdr(uid).hash },
            None => return Ok(false),
        };
        let bucket = self.bucket_of(hash);
        let _stripe = self.lock_stripe(bucket)?;
        // Walk for the chain predecessor; the entry may be gone by now.
        let mut prev: Option<Uid> = None;
        let mut cur = unsafe { *self.bucket_ptr(bucket) };
        while cur != NONE {
            if cur == uid.0 {
                self.chain_unlink(bucket, prev, uid);
                self.free_slot(uid, SLOT_ENTRY);
                trace!(uid = uid.0, "del by uid");
                return Ok(true);
            }
            prev = Some(Uid(cur));
            cur = unsafe { self.entry_hdr(Uid(cur)).next };
        }
        Ok(false)
    }

    fn bucket_of(&self, hash: u64) -> u32 {
        (hash as u32) & (self.geo().buckets - 1)
    }

    /// Allocate and fill an entry slot. The slot is fully written (header,
    /// key, value) before anything links to it.
    fn new_entry(&self, hash: u64, key: &[u8], val: &[u8], next: u32) -> Result<Uid> {
        let total = ENTRY_HDR + key.len() + val.len();
        if total > u32::MAX as usize {
            return Err(ShfError::Usage(format!(
                "entry of {} bytes is not representable",
                total
            )));
        }
        let uid = self.alloc_slot(total as u32, SLOT_ENTRY)?;
        let desc = unsafe { &*self.slot_desc_ptr(uid.0) };
        unsafe {
            let hdr = self.entry_hdr(uid);
            hdr.hash = hash;
            hdr.next = next;
            hdr.key_len = key.len() as u32;
            hdr.val_used = val.len() as u32;
            hdr._pad = 0;
            let base = self.data_ptr(desc.offset);
            ptr::copy_nonoverlapping(key.as_ptr(), base.add(ENTRY_HDR), key.len());
            ptr::copy_nonoverlapping(
                val.as_ptr(),
                base.add(ENTRY_HDR + key.len()),
                val.len(),
            );
        }
        desc.used.store(total as u32, std::sync::atomic::Ordering::Release);
        Ok(uid)
    }

    /// Walk the bucket chain for `key`, newest first. Returns the match and
    /// its predecessor. Caller holds the stripe lock.
    fn chain_find(&self, bucket: u32, hash: u64, key: &[u8]) -> Option<(Option<Uid>, Uid)> {
        let mut prev: Option<Uid> = None;
        let mut cur = unsafe { *self.bucket_ptr(bucket) };
        while cur != NONE {
            let uid = Uid(cur);
            let hdr = unsafe { &*(self.entry_hdr(uid) as *const EntryHdr) };
            if hdr.hash == hash && hdr.key_len as usize == key.len() && self.entry_key(uid) == key
            {
                return Some((prev, uid));
            }
            prev = Some(uid);
            cur = hdr.next;
        }
        None
    }

    /// Point `prev` (or the bucket head) past `uid`. Caller holds the stripe
    /// lock.
    fn chain_unlink(&self, bucket: u32, prev: Option<Uid>, uid: Uid) {
        unsafe {
            let next = self.entry_hdr(uid).next;
            match prev {
                Some(p) => self.entry_hdr(p).next = next,
                None => *self.bucket_ptr(bucket) = next,
            }
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn entry_hdr(&self, uid: Uid) -> &mut EntryHdr {
        let desc = &*self.slot_desc_ptr(uid.0);
        &mut *(self.data_ptr(desc.offset) as *mut EntryHdr)
    }

    fn entry_key(&self, uid: Uid) -> &[u8] {
        unsafe {
            let desc = &*self.slot_desc_ptr(uid.0);
            let hdr = &*(self.data_ptr(desc.offset) as *const EntryHdr);
            slice::from_raw_parts(
                self.data_ptr(desc.offset).add(ENTRY_HDR),
                hdr.key_len as usize,
            )
        }
    }

    fn entry_val(&self, uid: Uid) -> &[u8] {
        unsafe {
            let desc = &*self.slot_desc_ptr(uid.0);
            let hdr = &*(self.data_ptr(desc.offset) as *const EntryHdr);
            slice::from_raw_parts(
                self.data_ptr(desc.offset).add(ENTRY_HDR + hdr.key_len as usize),
                hdr.val_used as usize,
            )
        }
    }
}
