//! Observability sink for engine-internal events.
//!
//! Storage code never talks to a metrics system directly; it reports
//! [`Stat`] increments to an injected [`StatsSink`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An engine-internal event that is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// A record was rejected because its time is in the future.
    FromFuture,
    /// A collated record was rejected because it predates the collation window.
    FromPast,
    /// A direct record was rejected for an empty count or bad min/avg/max.
    Rejected,
    /// A counter directory was created.
    CounterCreated,
    /// A counter was dropped.
    CounterClosed,
    /// A tier file of a counter was flushed.
    CounterFlushed,
    /// A data page was already mapped in a stat file's page cache.
    PageHit,
    /// A data page had to be mapped, evicting a cache slot.
    PageMiss,
}

const STAT_COUNT: usize = 8;

impl Stat {
    /// All stats, in a stable order.
    pub const ALL: [Stat; STAT_COUNT] = [
        Stat::FromFuture,
        Stat::FromPast,
        Stat::Rejected,
        Stat::CounterCreated,
        Stat::CounterClosed,
        Stat::CounterFlushed,
        Stat::PageHit,
        Stat::PageMiss,
    ];

    /// Dotted name under which the stat is reported.
    pub fn name(self) -> &'static str {
        match self {
            Stat::FromFuture => "counter.from_future",
            Stat::FromPast => "counter.from_past",
            Stat::Rejected => "counter.rejected",
            Stat::CounterCreated => "counter.created",
            Stat::CounterClosed => "counter.closed",
            Stat::CounterFlushed => "counter.flushed",
            Stat::PageHit => "file.page_hit",
            Stat::PageMiss => "file.page_miss",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of engine stat increments.
pub trait StatsSink: Send + Sync + fmt::Debug {
    /// Adds `by` to `stat`.
    fn increment(&self, stat: Stat, by: u64);
}

/// Shared, dynamically dispatched stats sink.
pub type SharedStats = Arc<dyn StatsSink>;

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn increment(&self, _stat: Stat, _by: u64) {}
}

/// Lock-free in-process counters, one per [`Stat`].
#[derive(Debug, Default)]
pub struct AtomicStats {
    values: [AtomicU64; STAT_COUNT],
}

impl AtomicStats {
    /// Creates zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the current value of `stat`.
    pub fn get(&self, stat: Stat) -> u64 {
        self.values[stat.index()].load(Ordering::Relaxed)
    }

    /// Returns `(name, value)` for every stat.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Stat::ALL
            .iter()
            .map(|stat| (stat.name(), self.get(*stat)))
            .collect()
    }
}

impl StatsSink for AtomicStats {
    fn increment(&self, stat: Stat, by: u64) {
        self.values[stat.index()].fetch_add(by, Ordering::Relaxed);
    }
}
