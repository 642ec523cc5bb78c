//! The counter registry.
//!
//! A [`StatStore`] owns every live counter of one data directory. Counters
//! are created on first write and looked up by munged name through a
//! [`ShardedMap`]. Each counter sits behind its own mutex, which is the
//! only place its files are touched:
//!
//! ```text
//! record("web.req.get")
//!   ├─► shard[hash("web.req.get")] ─► AsyncCounter ─► StatCounter::record
//!   ├─► shard[hash("web.req")]     ─► AsyncCounter ─► StatCounter::record
//!   └─► ...                           (up to aggregate_count parents)
//!
//! background tasks (after start):
//!   flusher      one counter per tick, round-robin
//!   space check  logs an error when the disk runs low
//!   prune        removes empty counter directories
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::keys::{CounterMatch, KeyEntry, KeyIndex};
use super::names::{strip_ext, CounterName};
use super::shards::{ShardCursor, ShardedMap};
use crate::counter::{CounterLayout, RecordOutcome, RetentionPolicy, StatCounter};
use crate::env::StorageEnv;
use crate::error::{Result, StatError};

/// Default time to flush every counter once.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(300);

/// Default free space below which the space check complains.
pub const DEFAULT_MIN_AVAILABLE_SPACE: u64 = 100 * 1024 * 1024;

/// Default period of the free space check.
pub const DEFAULT_SPACE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default period of empty directory pruning.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Default retention tiers.
pub const DEFAULT_RETENTION: &str = "10s:10d,5m:1y9d,1h:6y12d,5m:7d:ret-7d:0.9";

/// Default data directory.
pub const DEFAULT_ROOT: &str = "istat-data";

const MIN_FLUSH_DELAY: Duration = Duration::from_millis(2);
const MAX_FLUSH_DELAY: Duration = Duration::from_millis(3000);

/// Configuration of a [`StatStore`].
///
/// # Examples
/// ```rust,ignore
/// use alopex_istat::store::StoreConfig;
///
/// let config = StoreConfig::default()
///     .with_root("/var/db/istat")
///     .with_aggregate_count(2);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Data directory holding one subdirectory per counter.
    pub root: PathBuf,
    /// Tiers every new counter is created with.
    pub retention: RetentionPolicy,
    /// Number of parent names each record also goes to.
    pub aggregate_count: usize,
    /// Create parent counters whenever a counter is created.
    pub recursive_create: bool,
    /// Time in which the flusher visits every counter once.
    pub flush_interval: Duration,
    /// Free bytes below which the space check logs an error.
    pub min_available_space: u64,
    /// Period of the space check.
    pub space_check_interval: Duration,
    /// Period of empty directory pruning.
    pub prune_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            retention: RetentionPolicy::parse(DEFAULT_RETENTION).unwrap_or_default(),
            aggregate_count: 0,
            recursive_create: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            min_available_space: DEFAULT_MIN_AVAILABLE_SPACE,
            space_check_interval: DEFAULT_SPACE_CHECK_INTERVAL,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for `root` with the given tiers.
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            root: root.into(),
            retention,
            ..Self::default()
        }
    }

    /// Sets the data directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the retention tiers.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets how many parent names each record also goes to.
    pub fn with_aggregate_count(mut self, aggregate_count: usize) -> Self {
        self.aggregate_count = aggregate_count;
        self
    }

    /// Enables creation of parent counters.
    pub fn with_recursive_create(mut self, recursive_create: bool) -> Self {
        self.recursive_create = recursive_create;
        self
    }

    /// Sets the time in which every counter is flushed once.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets the free space threshold.
    pub fn with_min_available_space(mut self, bytes: u64) -> Self {
        self.min_available_space = bytes;
        self
    }

    /// Sets the period of the space check.
    pub fn with_space_check_interval(mut self, interval: Duration) -> Self {
        self.space_check_interval = interval;
        self
    }

    /// Sets the period of empty directory pruning.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }
}

/// Contents of a registry slot.
#[derive(Debug)]
pub enum CounterSlot {
    /// An open counter.
    Live(StatCounter),
    /// A deleted counter. Operations on it do nothing.
    Deleted,
}

/// A registered counter and its serialized execution context.
///
/// All access to the underlying [`StatCounter`] goes through
/// [`AsyncCounter::with`], which holds the counter's mutex.
#[derive(Debug)]
pub struct AsyncCounter {
    name: String,
    collated: bool,
    slot: Mutex<CounterSlot>,
}

impl AsyncCounter {
    fn new(name: String, counter: StatCounter) -> Self {
        Self {
            name,
            collated: counter.is_collated(),
            slot: Mutex::new(CounterSlot::Live(counter)),
        }
    }

    /// Munged counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the counter collates events.
    pub fn is_collated(&self) -> bool {
        self.collated
    }

    /// Returns true once the counter was deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(*self.slot.lock(), CounterSlot::Deleted)
    }

    /// Runs `f` on the counter while holding its lock.
    ///
    /// Returns `None` for a deleted counter.
    pub fn with<R>(&self, f: impl FnOnce(&mut StatCounter) -> R) -> Option<R> {
        match &mut *self.slot.lock() {
            CounterSlot::Live(counter) => Some(f(counter)),
            CounterSlot::Deleted => None,
        }
    }

    fn tombstone(&self) -> Option<StatCounter> {
        match std::mem::replace(&mut *self.slot.lock(), CounterSlot::Deleted) {
            CounterSlot::Live(counter) => Some(counter),
            CounterSlot::Deleted => None,
        }
    }
}

/// Identity of a store instance.
///
/// Sixteen random bytes with the process id in the first four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; 16]);

impl UniqueId {
    /// Generates a new id.
    pub fn generate() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        bytes[..4].copy_from_slice(&std::process::id().to_le_bytes());
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
struct StoreInner {
    config: StoreConfig,
    env: StorageEnv,
    layout: CounterLayout,
    counters: ShardedMap<Arc<AsyncCounter>>,
    keys: KeyIndex,
    unique_id: UniqueId,
}

/// Registry of all counters under one data directory.
///
/// # Examples
/// ```rust,ignore
/// use alopex_istat::store::{StatStore, StoreConfig};
/// use alopex_istat::StorageEnv;
///
/// let store = StatStore::open(StoreConfig::default(), StorageEnv::default())?;
/// store.record_now("*web.hits", 1.0)?;
/// store.flush_all().await?;
/// ```
#[derive(Debug)]
pub struct StatStore {
    inner: Arc<StoreInner>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl StatStore {
    /// Opens the store under `config.root`, loading every complete counter
    /// found there.
    ///
    /// Counters that fail to load are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the retention policy is empty or the root
    /// directory cannot be created.
    pub fn open(config: StoreConfig, env: StorageEnv) -> Result<Self> {
        if config.retention.is_empty() {
            return Err(StatError::InvalidRetention(
                "the store needs at least one retention interval".to_string(),
            ));
        }
        fs::create_dir_all(&config.root).map_err(|source| StatError::CounterDirectory {
            path: config.root.clone(),
            source,
        })?;
        let inner = StoreInner {
            layout: CounterLayout::new(&config.root),
            config,
            env,
            counters: ShardedMap::new(),
            keys: KeyIndex::new(),
            unique_id: UniqueId::generate(),
        };
        info!(
            "Opening stat store {} ({})",
            inner.config.root.display(),
            inner.config.retention
        );
        inner.load_existing();
        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(None),
        })
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Records one aggregated sample into `name` and up to
    /// `aggregate_count` of its parents.
    ///
    /// A leading `*` makes a new counter collated. Empty names are ignored.
    /// Returns the outcome for `name` itself, or `None` if it was ignored
    /// or deleted.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while creating or writing any of the
    /// counters; the others are still written.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        name: &str,
        time: i64,
        value: f64,
        value_sq: f64,
        min: f64,
        max: f64,
        count: u64,
    ) -> Result<Option<RecordOutcome>> {
        self.inner
            .record(name, time, value, value_sq, min, max, count)
    }

    /// Records a single value at `time`.
    ///
    /// # Errors
    ///
    /// See [`StatStore::record`].
    pub fn record_value(&self, name: &str, time: i64, value: f64) -> Result<Option<RecordOutcome>> {
        self.record(name, time, value, value * value, value, value, 1)
    }

    /// Records a single value at the current time.
    ///
    /// # Errors
    ///
    /// See [`StatStore::record`].
    pub fn record_now(&self, name: &str, value: f64) -> Result<Option<RecordOutcome>> {
        self.record_value(name, self.inner.env.now(), value)
    }

    /// Looks up a counter without creating it.
    pub fn find(&self, name: &str) -> Option<Arc<AsyncCounter>> {
        let parsed = CounterName::parse(name)?;
        self.inner.counters.get(&parsed.name)
    }

    /// Lists counters and their parents matching a glob pattern, sorted by
    /// name.
    pub fn list_matching_counters(&self, pattern: &str) -> Vec<CounterMatch> {
        self.inner.keys.matches(pattern)
    }

    /// Deletes a counter, moving its files into the backup tree.
    ///
    /// Returns false if no live counter has that name.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter's files cannot be moved.
    pub fn delete_counter(&self, name: &str) -> Result<bool> {
        let result = self.inner.delete_one(name);
        self.inner.layout.prune_empty_dirs(self.inner.layout.root());
        self.refresh_keys();
        result
    }

    /// Deletes every counter matching a glob pattern.
    ///
    /// Returns the number of counters deleted.
    ///
    /// # Errors
    ///
    /// Returns the first error hit; the remaining matches are still
    /// deleted.
    pub fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let mut deleted = 0;
        let mut first_err = None;
        for found in self.inner.keys.matches(pattern) {
            match self.inner.delete_one(&found.name) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to delete counter {}: {:?}", found.name, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        info!("Deleted {} counters matching '{}'", deleted, pattern);
        self.inner.layout.prune_empty_dirs(self.inner.layout.root());
        self.refresh_keys();
        first_err.map_or(Ok(deleted), Err)
    }

    /// Rebuilds the key index from live counters.
    pub fn refresh_keys(&self) {
        self.inner.refresh_keys();
    }

    /// Force-flushes every counter on a blocking thread.
    ///
    /// # Errors
    ///
    /// See [`StatStore::flush_all_blocking`].
    pub async fn flush_all(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.flush_all())
            .await
            .map_err(|e| StatError::IoError(io::Error::other(e)))?
    }

    /// Force-flushes every counter, one after the other.
    ///
    /// # Errors
    ///
    /// Returns the first flush error after all counters were visited.
    pub fn flush_all_blocking(&self) -> Result<()> {
        self.inner.flush_all()
    }

    /// Returns true if the data directory has at least
    /// `min_available_space` free bytes.
    pub fn has_available_space(&self) -> bool {
        self.inner.has_available_space()
    }

    /// Identity of this store instance.
    pub fn unique_id(&self) -> UniqueId {
        self.inner.unique_id
    }

    /// Number of registry entries, deleted counters included.
    pub fn counter_count(&self) -> usize {
        self.inner.counters.len()
    }

    /// Starts the flusher, space check and prune tasks on the current
    /// tokio runtime. Does nothing if they already run.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::InvalidSettings`] outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StatError::InvalidSettings(format!("no tokio runtime: {}", e)))?;
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!("Background tasks already running");
            return Ok(());
        }

        let (shutdown, rx) = watch::channel(false);
        let inner = &self.inner;
        let handles = vec![
            runtime.spawn(run_flusher(Arc::clone(inner), rx.clone())),
            runtime.spawn(run_periodic(
                Arc::clone(inner),
                inner.config.space_check_interval,
                rx.clone(),
                "space check",
                StoreInner::check_space,
            )),
            runtime.spawn(run_periodic(
                Arc::clone(inner),
                inner.config.prune_interval,
                rx,
                "prune",
                StoreInner::prune,
            )),
        ];
        info!("Started background tasks for {}", inner.config.root.display());
        *tasks = Some(BackgroundTasks { shutdown, handles });
        Ok(())
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        let _ = tasks.shutdown.send(true);
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {:?}", e);
            }
        }
        info!("Stopped background tasks for {}", self.inner.config.root.display());
    }
}

impl Drop for StatStore {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            let _ = tasks.shutdown.send(true);
        }
    }
}

impl StoreInner {
    fn load_existing(&self) {
        let found = self.layout.scan(&self.config.retention);
        let only_existing = !self.config.recursive_create;
        let mut reported = 0usize;
        for (name, dir) in found {
            if let Err(e) = self.open_counter(&name, true, only_existing, 0) {
                error!("Failed to load counter {}: {:?}", dir.display(), e);
            }
            let loaded = self.counters.len();
            if loaded as f64 > reported as f64 * 1.2 + 9.0 || loaded > reported + 1000 {
                info!("Loaded {} counters", loaded);
                reported = loaded;
            }
        }
        info!(
            "Loaded {} counters from {}",
            self.counters.len(),
            self.layout.root().display()
        );
    }

    fn open_counter(
        &self,
        raw: &str,
        create: bool,
        only_existing: bool,
        zero_time: i64,
    ) -> Result<Option<Arc<AsyncCounter>>> {
        let Some(parsed) = CounterName::parse(raw) else {
            return Ok(None);
        };
        let full = parsed.to_raw();
        let counter = {
            // held while creating so two writers cannot open the same files
            let mut shard = self.counters.lock(&parsed.name);
            if let Some(existing) = shard.get(&parsed.name) {
                return Ok(Some(Arc::clone(existing)));
            }
            if !create {
                return Ok(None);
            }
            let dir = self.layout.counter_dir(&parsed.name);
            if only_existing && !CounterLayout::files_exist(&dir, &self.config.retention) {
                return Ok(None);
            }
            debug!("Creating counter {}", parsed.name);
            let stat_counter = StatCounter::open(
                &dir,
                parsed.collated,
                zero_time,
                &self.config.retention,
                &self.env,
            )?;
            let counter = Arc::new(AsyncCounter::new(parsed.name.clone(), stat_counter));
            shard.insert(parsed.name.clone(), Arc::clone(&counter));
            self.keys.add(parsed.name, counter.is_collated());
            counter
        };

        if self.config.recursive_create {
            if let Some(parent) = strip_ext(&full) {
                if let Err(e) = self.open_counter(parent, create, only_existing, zero_time) {
                    warn!("Failed to create parent counter {}: {:?}", parent, e);
                }
            }
        }
        Ok(Some(counter))
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        name: &str,
        time: i64,
        value: f64,
        value_sq: f64,
        min: f64,
        max: f64,
        count: u64,
    ) -> Result<Option<RecordOutcome>> {
        let Some(parsed) = CounterName::parse(name) else {
            return Ok(None);
        };
        let full = parsed.to_raw();
        let mut outcome = None;
        let mut first_err = None;
        let mut current = full.as_str();
        for level in 0..=self.config.aggregate_count {
            let result = self
                .open_counter(current, true, false, time)
                .and_then(|counter| {
                    counter
                        .and_then(|c| c.with(|sc| sc.record(time, value, value_sq, min, max, count)))
                        .transpose()
                });
            match result {
                Ok(recorded) if level == 0 => outcome = recorded,
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to record into {}: {:?}", current, e);
                    first_err.get_or_insert(e);
                }
            }
            match strip_ext(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        first_err.map_or(Ok(outcome), Err)
    }

    fn delete_one(&self, name: &str) -> Result<bool> {
        let Some(parsed) = CounterName::parse(name) else {
            return Ok(false);
        };
        let Some(counter) = self.counters.get(&parsed.name) else {
            return Ok(false);
        };
        let Some(live) = counter.tombstone() else {
            return Ok(false);
        };
        info!("Deleting counter {}", parsed.name);
        live.purge(self.layout.root())?;
        Ok(true)
    }

    fn refresh_keys(&self) {
        let keys: Vec<KeyEntry> = self
            .counters
            .entries()
            .into_iter()
            .filter(|(_, counter)| !counter.is_deleted())
            .map(|(name, counter)| KeyEntry {
                name,
                collated: counter.is_collated(),
            })
            .collect();
        self.keys.replace(keys);
    }

    fn flush_all(&self) -> Result<()> {
        let mut flushed = 0usize;
        let mut failed = 0usize;
        let mut first_err = None;
        for (name, counter) in self.counters.entries() {
            match counter.with(|c| c.force_flush()) {
                Some(Ok(())) => flushed += 1,
                Some(Err(e)) => {
                    error!("Failed to flush counter {}: {:?}", name, e);
                    failed += 1;
                    first_err.get_or_insert(e);
                }
                None => {}
            }
        }
        debug!("Flushed {} counters, {} failed", flushed, failed);
        first_err.map_or(Ok(()), Err)
    }

    fn flush_one(&self, cursor: &mut ShardCursor) {
        let Some((name, counter)) = self.counters.advance(cursor) else {
            return;
        };
        if let Some(Err(e)) = counter.with(|c| c.flush()) {
            error!("Failed to flush counter {}: {:?}", name, e);
        }
    }

    fn flush_delay(&self) -> Duration {
        flush_delay(self.config.flush_interval, self.counters.len())
    }

    fn has_available_space(&self) -> bool {
        match self.env.mmap.available_space(self.layout.root()) {
            Ok(available) => available >= self.config.min_available_space,
            Err(e) => {
                warn!(
                    "Cannot read free space of {}: {:?}",
                    self.layout.root().display(),
                    e
                );
                false
            }
        }
    }

    fn check_space(&self) {
        if !self.has_available_space() {
            error!(
                "{}: not enough free space on device (need {} bytes)",
                self.layout.root().display(),
                self.config.min_available_space
            );
        }
    }

    fn prune(&self) {
        let removed = self.layout.prune_empty_dirs(self.layout.root());
        debug!("Pruned {} empty directories", removed);
    }
}

/// Delay between two flusher ticks so that `counters` counters are visited
/// once per `flush_interval`, clamped to [2ms, 3s].
pub fn flush_delay(flush_interval: Duration, counters: usize) -> Duration {
    let per_counter = flush_interval / (counters as u32).saturating_add(1);
    per_counter.clamp(MIN_FLUSH_DELAY, MAX_FLUSH_DELAY)
}

async fn run_flusher(inner: Arc<StoreInner>, mut shutdown: watch::Receiver<bool>) {
    let mut cursor = ShardCursor::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(inner.flush_delay()) => {}
        }
        let worker = Arc::clone(&inner);
        let mut next = std::mem::take(&mut cursor);
        match tokio::task::spawn_blocking(move || {
            worker.flush_one(&mut next);
            next
        })
        .await
        {
            Ok(next) => cursor = next,
            Err(e) => error!("Flusher tick failed: {:?}", e),
        }
    }
    debug!("Flusher stopped");
}

async fn run_periodic(
    inner: Arc<StoreInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    job: fn(&StoreInner),
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(period) => {}
        }
        let worker = Arc::clone(&inner);
        if let Err(e) = tokio::task::spawn_blocking(move || job(&worker)).await {
            error!("{} task failed: {:?}", name, e);
        }
    }
    debug!("{} task stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir, config: StoreConfig) -> (StatStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let env = StorageEnv::new().with_clock(clock.clone());
        let config = config.with_root(temp_dir.path().join("db"));
        (StatStore::open(config, env).unwrap(), clock)
    }

    fn small_config() -> StoreConfig {
        StoreConfig::default().with_retention(RetentionPolicy::parse("10s:1h,5m:1d").unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.retention.len(), 4);
        assert_eq!(config.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(config.min_available_space, 100 * 1024 * 1024);
        assert_eq!(config.aggregate_count, 0);
        assert!(!config.recursive_create);
    }

    #[test]
    fn test_flush_delay_bounds() {
        let interval = Duration::from_secs(300);
        assert_eq!(flush_delay(interval, 0), Duration::from_millis(3000));
        assert_eq!(flush_delay(interval, 999), Duration::from_millis(300));
        assert_eq!(flush_delay(interval, 1_000_000), Duration::from_millis(2));
    }

    #[test]
    fn test_unique_id_format() {
        let id = UniqueId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 35);
        let groups: Vec<&str> = text.split(':').collect();
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.len() == 8));
        assert!(text
            .chars()
            .all(|c| c == ':' || c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(&id.as_bytes()[..4], &std::process::id().to_le_bytes());
    }

    #[test]
    fn test_record_with_rollups() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = open_store(&temp_dir, small_config().with_aggregate_count(1));
        let now = clock.now();

        let outcome = store.record_value("Web.Req.Get", now, 2.0).unwrap();
        assert!(outcome.unwrap().is_accepted());
        assert!(store.find("web.req.get").is_some());
        assert!(store.find("web.req").is_some());
        assert!(store.find("web").is_none());
        assert_eq!(store.counter_count(), 2);

        assert_eq!(store.record_value("", now, 1.0).unwrap(), None);
        assert_eq!(store.record_value("*", now, 1.0).unwrap(), None);
        assert_eq!(store.counter_count(), 2);
    }

    #[test]
    fn test_recursive_create_makes_parents() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = open_store(&temp_dir, small_config().with_recursive_create(true));
        store.record_value("a.b.c", clock.now(), 1.0).unwrap();
        assert_eq!(store.counter_count(), 3);

        let now = clock.now();
        let parent = store.find("a.b").unwrap();
        let selected = parent
            .with(|c| c.select(now - 60, now, false, 0).unwrap())
            .unwrap();
        assert!(selected.buckets.is_empty());
        assert!(store.find("a").is_some());
    }

    #[test]
    fn test_collated_prefix_sticks_to_counter() {
        let temp_dir = TempDir::new().unwrap();
        let (store, clock) = open_store(&temp_dir, small_config());
        store.record_value("*hits", clock.now(), 1.0).unwrap();
        let counter = store.find("*hits").unwrap();
        assert!(counter.is_collated());
        assert_eq!(counter.name(), "hits");
        assert!(store.find("hits").unwrap().is_collated());
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _clock) = open_store(&temp_dir, small_config());
        assert!(matches!(store.start(), Err(StatError::InvalidSettings(_))));
    }
}
