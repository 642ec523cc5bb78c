//! Storage environment shared by files, counters and the store.

use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::file::{MmapBackend, SystemMmap};
use crate::stats::{NullStats, SharedStats, Stat};

/// Collaborators injected into every storage component.
///
/// Cloning is cheap; clones share the same backend, clock and sink.
#[derive(Clone)]
pub struct StorageEnv {
    /// Page mapping backend.
    pub mmap: Arc<dyn MmapBackend>,
    /// Wall clock.
    pub clock: SharedClock,
    /// Stats sink.
    pub stats: SharedStats,
}

impl Default for StorageEnv {
    fn default() -> Self {
        Self {
            mmap: Arc::new(SystemMmap::new()),
            clock: Arc::new(SystemClock),
            stats: Arc::new(NullStats),
        }
    }
}

impl std::fmt::Debug for StorageEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEnv")
            .field("mmap", &self.mmap)
            .field("now", &self.clock.now())
            .field("stats", &self.stats)
            .finish()
    }
}

impl StorageEnv {
    /// Creates the default environment: system mmap, system clock, no stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mmap backend.
    pub fn with_mmap(mut self, mmap: Arc<dyn MmapBackend>) -> Self {
        self.mmap = mmap;
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the stats sink.
    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = stats;
        self
    }

    /// Current unix time according to the injected clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub(crate) fn count(&self, stat: Stat) {
        self.stats.increment(stat, 1);
    }
}
