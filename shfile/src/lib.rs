//! Shared-memory key/value store and queue engine for multi-process IPC.
//!
//! A named region lives in one memory-mapped file link; any number of
//! processes attach to it and share a hash index, a slot-based value store
//! and a set of FIFO queues, all addressed by 32-bit UIDs instead of
//! pointers. Values and queue items can be read and written in place, so
//! data crosses process boundaries without copies.
//!
//! ```no_run
//! use shfile::{Shf, ShfConfig};
//!
//! # fn main() -> shfile::Result<()> {
//! let cfg = ShfConfig::builder().data_dir("/dev/shm").name("demo").build()?;
//! let shf = Shf::attach(&cfg)?;
//! let uid = shf.put_key_val(b"key", b"value")?;
//! assert_eq!(shf.get_uid_val(uid)?.as_deref(), Some(&b"value"[..]));
//!
//! let q = shf.queue_new_name("work")?;
//! let item = shf.queue_new_item(64)?;
//! shf.queue_push_head_with(q, item, b"job 1")?;
//! # Ok(())
//! # }
//! ```

mod core;
pub mod errors;
mod index;
mod names;
mod queue;
mod store;

#[cfg(test)]
mod tests;

pub use crate::core::{Qid, Shf, ShfConfig, ShfConfigBuilder, ShfStats, Uid};
pub use crate::errors::{Result, ShfError};
pub use crate::queue::QueuePool;
