//! The counter registry and its name handling.

pub mod keys;
pub mod names;
pub mod pattern;
pub mod shards;
pub mod stat_store;

pub use keys::{CounterMatch, DisplayType, KeyEntry, KeyIndex};
pub use names::{ancestry, collapse_dots, munge, strip_ext, CounterName, COLLATED_PREFIX};
pub use pattern::pattern_match;
pub use shards::{shard_of, ShardCursor, ShardedMap, SHARD_COUNT};
pub use stat_store::{
    flush_delay, AsyncCounter, CounterSlot, StatStore, StoreConfig, UniqueId,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MIN_AVAILABLE_SPACE, DEFAULT_PRUNE_INTERVAL,
    DEFAULT_RETENTION, DEFAULT_ROOT, DEFAULT_SPACE_CHECK_INTERVAL,
};
