//! Queue name registry and the process race barrier.
//!
//! Both are plain records in the hash index under the reserved `\u{1}`
//! prefix, so discovery needs nothing but the shared region itself: a
//! process that can attach can resolve every name any other process
//! registered.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::core::{Qid, Shf};
use crate::errors::{Result, ShfError};
use crate::index::RESERVED_PREFIX;

fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + name.len());
    key.push(RESERVED_PREFIX);
    key.extend_from_slice(b"q:");
    key.extend_from_slice(name.as_bytes());
    key
}

fn race_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + name.len());
    key.push(RESERVED_PREFIX);
    key.extend_from_slice(b"race:");
    key.extend_from_slice(name.as_bytes());
    key
}

impl Shf {
    /// Resolve or create the queue called `name`. Racing first-time
    /// creators converge on one queue: resolution and registration happen
    /// under the registry mutex, so the name is bound exactly once and every
    /// caller gets the same qid back.
    pub fn queue_new_name(&self, name: &str) -> Result<Qid> {
        let key = name_key(name);
        let _names = self.lock_names()?;
        if let Some(qid) = self.resolve(&key)? {
            return Ok(qid);
        }
        let qid = self.alloc_qids(1)?;
        self.put_key_val(&key, &qid.to_le_bytes())?;
        debug!(name, qid, "queue name registered");
        Ok(Qid(qid))
    }

    /// Resolve `name` without side effects.
    pub fn queue_get_name(&self, name: &str) -> Result<Option<Qid>> {
        self.resolve(&name_key(name))
    }

    fn resolve(&self, key: &[u8]) -> Result<Option<Qid>> {
        match self.get_key_val(key)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ShfError::Corrupt("queue name record size".to_string()))?;
                Ok(Some(Qid(u32::from_le_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    /// Set up a start-line barrier for `horses` participants. Any process
    /// may call this; re-initialization resets the barrier.
    pub fn race_init(&self, name: &str, horses: u32) -> Result<()> {
        let mut rec = [0u8; 8];
        rec[..4].copy_from_slice(&horses.to_le_bytes());
        let _names = self.lock_names()?;
        self.put_or_replace(&race_key(name), &rec)?;
        Ok(())
    }

    /// Arrive at the barrier and block until every horse has. The one
    /// deliberate spin in the engine; test drivers use it to line processes
    /// up before a timed section.
    pub fn race_start(&self, name: &str) -> Result<()> {
        let key = race_key(name);
        let horses = {
            let _names = self.lock_names()?;
            let (horses, arrived) = self.read_race(&key)?;
            let mut rec = [0u8; 8];
            rec[..4].copy_from_slice(&horses.to_le_bytes());
            rec[4..].copy_from_slice(&(arrived + 1).to_le_bytes());
            // Same size, so this is an in-place overwrite.
            self.put_or_replace(&key, &rec)?;
            horses
        };
        loop {
            let arrived = {
                let _names = self.lock_names()?;
                self.read_race(&key)?.1
            };
            if arrived >= horses {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_race(&self, key: &[u8]) -> Result<(u32, u32)> {
        match self.get_key_val(key)? {
            Some(bytes) if bytes.len() == 8 => {
                let word = |s: &[u8]| {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(s);
                    u32::from_le_bytes(b)
                };
                Ok((word(&bytes[..4]), word(&bytes[4..])))
            }
            Some(_) => Err(ShfError::Corrupt("race record size".to_string())),
            None => Err(ShfError::Usage("race was never initialized".to_string())),
        }
    }
}
