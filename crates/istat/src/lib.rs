//! Istat - Alopex Counter Storage Engine
//!
//! This crate stores numeric counters in fixed-size, multi-resolution
//! ring-buffer files. Samples are written once into every retention tier
//! and read back with automatic down-sampling.
//!
//! # Components
//!
//! - [`Bucket`]: aggregate of samples over one interval
//! - [`StatFile`]: one memory-mapped ring of buckets for one tier
//! - [`RetentionPolicy`]: ordered list of tiers, e.g. `10s:10d,5m:1y`
//! - [`StatCounter`]: collation and fan-out over a counter's tiers
//! - [`StatStore`]: sharded registry of counters with background flushing
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_istat::{RetentionPolicy, StatStore, StorageEnv, StoreConfig};
//!
//! let policy = RetentionPolicy::parse("10s:1d,5m:1y")?;
//! let store = StatStore::open(StoreConfig::new("/var/db/istat", policy), StorageEnv::default())?;
//! store.start()?;
//!
//! // plain gauge and a collated event counter
//! store.record_now("host.load", 0.75)?;
//! store.record_now("*web.requests", 1.0)?;
//!
//! if let Some(counter) = store.find("host.load") {
//!     let selected = counter.with(|c| c.select(0, 0, false, 100));
//! }
//!
//! store.flush_all().await?;
//! store.shutdown().await;
//! ```

#![deny(missing_docs)]

pub mod clock;
pub mod counter;
pub mod env;
pub mod error;
pub mod file;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use counter::{RecordOutcome, RetentionInterval, RetentionPolicy, Selection, StatCounter};
pub use env::StorageEnv;
pub use error::{Result, StatError};
pub use file::{Bucket, FileHeader, MmapBackend, OpenMode, StatFile, StatFileSettings, SystemMmap};
pub use stats::{AtomicStats, NullStats, Stat, StatsSink};
pub use store::{CounterMatch, DisplayType, StatStore, StoreConfig, UniqueId};
