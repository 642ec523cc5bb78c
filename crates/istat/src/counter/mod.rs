//! Counters: retention tiers, on-disk layout and per-counter orchestration.

pub mod layout;
pub mod retention;
pub mod stat_counter;

pub use layout::{CounterLayout, BACKUP_SUFFIX};
pub use retention::{format_duration, parse_duration, RetentionInterval, RetentionPolicy};
pub use stat_counter::{
    CollationSlot, NormalizedRange, RecordOutcome, Selection, StatCounter, TierFile, TierPick,
    TrailingPick, COLLATION_WINDOW, DEFAULT_SELECT_SPAN, REDUCTION_LADDER,
};
