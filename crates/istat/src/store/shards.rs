//! Lock-sharded map from counter name to value.
//!
//! Names hash into one of [`SHARD_COUNT`] shards, each an ordered map
//! behind its own mutex, so writers to different counters rarely contend.
//! A [`ShardCursor`] walks every entry round-robin without holding more
//! than one shard lock at a time.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::{Mutex, MutexGuard};

/// Number of shards.
pub const SHARD_COUNT: usize = 256;

/// Shard index of `key`.
pub fn shard_of(key: &str) -> usize {
    let mut val: u32 = 0;
    for b in key.bytes() {
        val = val
            .wrapping_mul(19)
            .wrapping_add(u32::from(b))
            .wrapping_add(127);
    }
    (val & 0xff) as usize
}

/// Position of a round-robin walk over a [`ShardedMap`].
#[derive(Debug, Clone, Default)]
pub struct ShardCursor {
    shard: usize,
    last: Option<String>,
}

impl ShardCursor {
    /// Creates a cursor at the start of the map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves back to the start of the map.
    pub fn reset(&mut self) {
        self.shard = 0;
        self.last = None;
    }

    /// Shard the cursor is in.
    pub fn shard(&self) -> usize {
        self.shard
    }
}

/// Map of names to values, split into [`SHARD_COUNT`] locked shards.
#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Vec<Mutex<BTreeMap<String, V>>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(BTreeMap::new()))
                .collect(),
        }
    }
}

impl<V: Clone> ShardedMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the shard holding `key`.
    pub fn lock(&self, key: &str) -> MutexGuard<'_, BTreeMap<String, V>> {
        self.shards[shard_of(key)].lock()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.lock(key).get(key).cloned()
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.lock(&key).insert(key, value)
    }

    /// Number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Returns true if every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Copies every entry, shard by shard.
    pub fn entries(&self) -> Vec<(String, V)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Returns the entry after `cursor` and advances it.
    ///
    /// At the end of the map the cursor is reset and `None` is returned, so
    /// the next call starts over.
    pub fn advance(&self, cursor: &mut ShardCursor) -> Option<(String, V)> {
        while cursor.shard < SHARD_COUNT {
            let shard = self.shards[cursor.shard].lock();
            let found = match cursor.last.as_deref() {
                Some(last) => shard
                    .range::<str, _>((Bound::Excluded(last), Bound::Unbounded))
                    .next(),
                None => shard.iter().next(),
            }
            .map(|(k, v)| (k.clone(), v.clone()));
            drop(shard);

            match found {
                Some(entry) => {
                    cursor.last = Some(entry.0.clone());
                    return Some(entry);
                }
                None => {
                    cursor.shard += 1;
                    cursor.last = None;
                }
            }
        }
        cursor.reset();
        None
    }
}
