use std::io;

use thiserror::Error;

/// Failures a caller can observe. Absence of a key, UID or queue item is
/// never an error; lookup-like operations return `Option`/`bool` instead.
#[derive(Debug, Error)]
pub enum ShfError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    /// Process-shared lock could not be created, opened or acquired.
    /// `raw_sync` reports these as boxed errors; the message is kept.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("region '{0}' cannot be attached: {1}")]
    Attach(String, String),

    /// The reserved data area of the region is exhausted. This is the only
    /// condition that aborts a put/allocate once a region is attached.
    #[error("data area exhausted: {needed} bytes needed, {available} reserved bytes left")]
    Capacity { needed: u64, available: u64 },

    #[error("slot table exhausted: all {0} slots allocated")]
    SlotsExhausted(u32),

    #[error("queue table exhausted: all {0} queues in use")]
    QueuesExhausted(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("corrupt region: {0}")]
    Corrupt(String),

    /// API contract violation that was cheap enough to detect, e.g. pushing
    /// an item that is already linked into a queue.
    #[error("usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, ShfError>;

/// `raw_sync` surfaces `Box<dyn Error>`, which cannot implement `From`
/// without conflicting impls; every lock call site maps through this.
pub(crate) fn lock_err(e: Box<dyn std::error::Error>) -> ShfError {
    ShfError::Lock(e.to_string())
}
