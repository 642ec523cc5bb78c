//! One counter: a set of tier files plus the collation window.
//!
//! ## Direct counters
//!
//! Every accepted sample is merged into every tier immediately.
//!
//! ## Collated counters
//!
//! Event counts are summed per collation interval (the finest tier's
//! interval) in a sliding window of five slots:
//!
//! ```text
//!            window[0]   window[1]   window[2]   window[3]   window[4]
//! time:      t-4ci       t-3ci       t-2ci       t-ci        t
//!            ▲ oldest, merged into coarser tiers when shifted out
//! ```
//!
//! The finest tier is written whenever a slot's write count reaches a power
//! of two, and for every slot on each shift. Coarser tiers only receive a
//! slot once it leaves the window, so they see each interval exactly once.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::layout::CounterLayout;
use super::retention::RetentionPolicy;
use crate::env::StorageEnv;
use crate::error::{Result, StatError};
use crate::file::{Bucket, FileFlags, StatFile, StatFileSettings};
use crate::stats::Stat;

/// Number of slots in the collation window.
pub const COLLATION_WINDOW: usize = 5;

/// Seconds a direct sample may be ahead of now.
pub const MAX_FUTURE_SECS: i64 = 60;

/// Span used by `select` when a bound is missing.
pub const DEFAULT_SELECT_SPAN: i64 = 900;

/// Idle time after which a dropped collated counter flushes its whole window.
pub const IDLE_SHIFT_SECS: i64 = 300;

/// Intervals a selection may be coarsened to, finest first.
pub const REDUCTION_LADDER: [i64; 18] = [
    10,
    20,
    30,
    60,
    120,
    300,
    600,
    900,
    1200,
    1800,
    3600,
    2 * 3600,
    3 * 3600,
    4 * 3600,
    6 * 3600,
    8 * 3600,
    12 * 3600,
    86_400,
];

const MIN_MAX_EPSILON: f64 = 0.0001;

/// Result of recording one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The sample was stored.
    Accepted,
    /// The sample is too far in the future.
    FromFuture,
    /// The sample predates the collation window.
    FromPast,
    /// The sample has a zero count.
    Empty,
    /// The sample's min, average and max are inconsistent.
    BadRange,
}

impl RecordOutcome {
    /// Returns true if the sample was stored.
    pub fn is_accepted(self) -> bool {
        self == RecordOutcome::Accepted
    }
}

/// One tier of a counter.
#[derive(Debug)]
pub struct TierFile {
    /// Tier name, which is also the file name.
    pub suffix: String,
    /// The tier's file.
    pub file: StatFile,
}

/// One slot of the collation window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollationSlot {
    /// Collated value for the slot.
    pub bucket: Bucket,
    /// Number of records merged into the slot.
    pub writes: u32,
    /// Start time of the slot.
    pub time: i64,
}

impl CollationSlot {
    fn at(time: i64) -> Self {
        Self {
            bucket: Bucket::empty_at(time),
            writes: 0,
            time,
        }
    }
}

/// Buckets returned by [`StatCounter::select`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    /// Buckets in time order.
    pub buckets: Vec<Bucket>,
    /// Normalized start of the range.
    pub start: i64,
    /// Normalized end of the range.
    pub end: i64,
    /// Interval of the returned buckets.
    pub interval: i64,
}

/// Tier chosen for a regular query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPick {
    /// Index of the tier holding the start time, if any does.
    pub tier: Option<usize>,
    /// Interval of the picked tier, or the best guess when none matched.
    pub interval: i64,
}

/// Tier chosen for a trailing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingPick {
    /// Index of the first trailing tier whose season is long enough.
    pub tier: Option<usize>,
    /// Interval of the picked tier, or of the last trailing tier seen.
    pub interval: i64,
    /// Season of the picked tier, or of the last trailing tier seen.
    pub season: i64,
}

/// A query range aligned to an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedRange {
    /// Aligned start.
    pub start: i64,
    /// Aligned end.
    pub end: i64,
    /// Interval the range is aligned to.
    pub interval: i64,
}

/// A counter's tier files and collation state.
///
/// A counter is not internally synchronized; the store serializes access.
#[derive(Debug)]
pub struct StatCounter {
    path: PathBuf,
    tiers: Vec<TierFile>,
    collated: bool,
    collation_interval: i64,
    window: [CollationSlot; COLLATION_WINDOW],
    env: StorageEnv,
}

impl StatCounter {
    /// Opens the counter stored in `dir`, creating the directory and any
    /// missing tier files.
    ///
    /// The finest tier's on-disk flags decide whether an existing counter is
    /// collated; `collated` only applies to new files.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is empty, the directory cannot be
    /// created, or a tier file cannot be opened.
    pub fn open(
        dir: impl AsRef<Path>,
        collated: bool,
        zero_time: i64,
        policy: &RetentionPolicy,
        env: &StorageEnv,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        debug!("StatCounter::open {}", dir.display());
        if policy.is_empty() {
            return Err(StatError::InvalidRetention(
                "a counter needs at least one retention interval".to_string(),
            ));
        }
        if !dir.exists() {
            info!("Creating new counter {}", dir.display());
            fs::create_dir_all(dir).map_err(|source| StatError::CounterDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
            env.count(Stat::CounterCreated);
        }

        let mut flags = if collated {
            FileFlags::new().with(FileFlags::COLLATED)
        } else {
            FileFlags::new()
        };
        let mut collation_interval = 1;
        let mut is_collated = collated;
        let mut tiers = Vec::with_capacity(policy.len());

        for (i, ri) in policy.iter().enumerate() {
            let mut settings = StatFileSettings::new(ri.interval_secs(), ri.samples as i64)
                .with_zero_time(zero_time)
                .with_flags(flags);
            if flags.is_counter_aggregate() {
                settings.fixed_count = ri.interval_secs() / collation_interval;
            }
            if ri.is_trailing() {
                settings = settings.with_trailing(ri.lambda, ri.span().as_secs());
            }

            let file = StatFile::open_or_create(CounterLayout::tier_path(dir, ri), &settings, env)?;
            if i == 0 {
                collation_interval = file.interval();
                is_collated = file.flags().is_collated();
                flags = if is_collated {
                    flags
                        .without(FileFlags::COLLATED)
                        .with(FileFlags::COUNTER_AGGREGATE)
                } else {
                    flags.without(FileFlags::COLLATED)
                };
            }
            tiers.push(TierFile {
                suffix: ri.name.clone(),
                file,
            });
        }

        Ok(Self {
            path: dir.to_path_buf(),
            tiers,
            collated: is_collated,
            collation_interval,
            window: [CollationSlot::default(); COLLATION_WINDOW],
            env: env.clone(),
        })
    }

    /// Directory holding the tier files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the counter collates events.
    pub fn is_collated(&self) -> bool {
        self.collated
    }

    /// Interval of the finest tier.
    pub fn collation_interval(&self) -> i64 {
        self.collation_interval
    }

    /// Number of tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Tier file at `index`, finest first.
    pub fn tier(&self, index: usize) -> Option<&StatFile> {
        self.tiers.get(index).map(|t| &t.file)
    }

    /// Name of the tier at `index`.
    pub fn tier_name(&self, index: usize) -> Option<&str> {
        self.tiers.get(index).map(|t| t.suffix.as_str())
    }

    /// Current collation window, oldest first.
    pub fn collation_window(&self) -> &[CollationSlot; COLLATION_WINDOW] {
        &self.window
    }

    /// Records one sample.
    ///
    /// Direct counters store `value` as the sum of `count` samples with the
    /// given sum of squares, min and max. Collated counters add `value` to
    /// the event total of its collation interval and ignore the rest.
    ///
    /// Rejected samples are reported through the outcome and the stats sink.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier file cannot be written.
    pub fn record(
        &mut self,
        time: i64,
        value: f64,
        value_sq: f64,
        min: f64,
        max: f64,
        count: u64,
    ) -> Result<RecordOutcome> {
        let now = self.env.now();
        if self.collated {
            self.record_collated(now, time, value)
        } else {
            self.record_direct(now, time, value, value_sq, min, max, count)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_direct(
        &mut self,
        now: i64,
        time: i64,
        value: f64,
        value_sq: f64,
        min: f64,
        max: f64,
        count: u64,
    ) -> Result<RecordOutcome> {
        if time > now + MAX_FUTURE_SECS {
            debug!("Rejected sample from the future: {} > {}: {}", time, now, self.path.display());
            self.env.count(Stat::FromFuture);
            return Ok(RecordOutcome::FromFuture);
        }
        if count == 0 {
            debug!("Rejected sample with 0 count: {}", self.path.display());
            self.env.count(Stat::Rejected);
            return Ok(RecordOutcome::Empty);
        }
        let avg = value / count as f64;
        let slack_max = max + max.abs() * MIN_MAX_EPSILON;
        if min > slack_max || avg + avg.abs() * MIN_MAX_EPSILON < min || avg > slack_max {
            debug!(
                "Rejected sample with bad min/avg/max: {} {} {} {}",
                self.path.display(),
                min,
                avg,
                max
            );
            self.env.count(Stat::Rejected);
            return Ok(RecordOutcome::BadRange);
        }

        let count = count.min(i32::MAX as u64) as i32;
        let bucket = Bucket::new(value, value_sq, min, max, count, time);
        for tier in &mut self.tiers {
            tier.file.update_bucket(&bucket)?;
        }
        Ok(RecordOutcome::Accepted)
    }

    fn record_collated(&mut self, now: i64, time: i64, value: f64) -> Result<RecordOutcome> {
        let ci = self.collation_interval;
        if time > now + ci {
            debug!("Rejected event from the future: {} > {}: {}", time, now, self.path.display());
            self.env.count(Stat::FromFuture);
            return Ok(RecordOutcome::FromFuture);
        }
        if time < self.window[0].time {
            debug!(
                "Rejected event from the past: {} < {}: {}",
                time,
                self.window[0].time,
                self.path.display()
            );
            self.env.count(Stat::FromPast);
            return Ok(RecordOutcome::FromPast);
        }

        let time = time - time % ci;
        let slot = match self.find_collation_slot(time) {
            Some(i) => i,
            None => {
                if self.window[0].time == 0 {
                    for i in 0..COLLATION_WINDOW {
                        self.window[COLLATION_WINDOW - 1 - i] =
                            CollationSlot::at(time - i as i64 * ci);
                    }
                } else {
                    self.maybe_shift_collated(time)?;
                }
                match self.find_collation_slot(time) {
                    Some(i) => i,
                    None => return Ok(RecordOutcome::FromPast),
                }
            }
        };

        let entry = &mut self.window[slot];
        entry.bucket.collated_update(value, time);
        entry.writes += 1;
        if entry.writes.is_power_of_two() {
            let bucket = entry.bucket;
            if let Some(finest) = self.tiers.first_mut() {
                finest.file.update_bucket(&bucket)?;
            }
        }
        Ok(RecordOutcome::Accepted)
    }

    fn find_collation_slot(&self, time: i64) -> Option<usize> {
        let ci = self.collation_interval;
        self.window
            .iter()
            .position(|s| s.time <= time && time < s.time + ci)
    }

    /// Shifts the collation window until it covers `time`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier file cannot be written.
    pub fn maybe_shift_collated(&mut self, time: i64) -> Result<()> {
        if !self.collated {
            return Ok(());
        }
        while time >= self.window[COLLATION_WINDOW - 1].time + self.collation_interval {
            if !self.shift_collated()? {
                break;
            }
        }
        Ok(())
    }

    /// Shifts every slot of the window out.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier file cannot be written.
    pub fn fully_shift_collated(&mut self) -> Result<()> {
        let top = self.window[COLLATION_WINDOW - 1].time;
        self.maybe_shift_collated(top + self.collation_interval * COLLATION_WINDOW as i64)
    }

    fn shift_collated(&mut self) -> Result<bool> {
        if self.window[0].time == 0 || self.tiers.is_empty() {
            return Ok(false);
        }
        debug!(
            "Shifting collation window of {} (time {} shifted out)",
            self.path.display(),
            self.window[0].time
        );

        let (finest, coarser) = self.tiers.split_at_mut(1);
        for slot in &self.window {
            finest[0].file.update_bucket(&slot.bucket)?;
        }
        let oldest = self.window[0].bucket;
        for tier in coarser {
            tier.file.update_bucket(&oldest)?;
        }

        self.window.rotate_left(1);
        let top = self.window[COLLATION_WINDOW - 2].time + self.collation_interval;
        self.window[COLLATION_WINDOW - 1] = CollationSlot::at(top);
        Ok(true)
    }

    /// Moves due collation slots out and schedules every tier file for
    /// writeback.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier file cannot be written or flushed.
    pub fn flush(&mut self) -> Result<()> {
        debug!("StatCounter::flush {}", self.path.display());
        if self.collated {
            let half_window = (COLLATION_WINDOW / 2) as i64;
            self.maybe_shift_collated(self.env.now() + self.collation_interval * half_window)?;
        }
        for tier in &mut self.tiers {
            tier.file.flush()?;
            self.env.count(Stat::CounterFlushed);
        }
        Ok(())
    }

    /// Moves the whole collation window out, then flushes.
    ///
    /// # Errors
    ///
    /// See [`StatCounter::flush`].
    pub fn force_flush(&mut self) -> Result<()> {
        if self.collated {
            self.fully_shift_collated()?;
        }
        self.flush()
    }

    /// Picks the finest regular tier that still holds `start`.
    ///
    /// When no tier does and `start` is past the finest tier's newest bucket,
    /// the finest interval is reported; otherwise the coarsest.
    pub fn pick_stat_file(&self, start: i64, _end: i64) -> TierPick {
        let mut interval = 0;
        for (i, tier) in self.tiers.iter().enumerate() {
            let file = &tier.file;
            if file.flags().is_trailing() {
                continue;
            }
            interval = file.interval();
            if file.is_bucket_index_in_file(file.map_time_to_bucket_index(start, false)) {
                return TierPick {
                    tier: Some(i),
                    interval,
                };
            }
        }
        if let Some(finest) = self.tiers.first() {
            if start > finest.file.last_bucket_time() {
                interval = finest.file.interval();
            }
        }
        TierPick {
            tier: None,
            interval,
        }
    }

    /// Picks the first trailing tier whose season is at least `season`.
    pub fn pick_trailing_stat_file(&self, season: i64) -> TrailingPick {
        let mut pick = TrailingPick {
            tier: None,
            interval: 0,
            season: 0,
        };
        for (i, tier) in self.tiers.iter().enumerate() {
            let header = tier.file.header();
            if !header.flags.is_trailing() {
                continue;
            }
            pick.interval = i64::from(header.cfg_interval);
            pick.season = header.season as i64;
            if pick.season >= season {
                pick.tier = Some(i);
                return pick;
            }
        }
        pick
    }

    /// Aligns a query range to `interval`, coarsening the interval along
    /// [`REDUCTION_LADDER`] until at most `max_samples` buckets remain.
    ///
    /// `max_samples == 0` means no limit; `max_samples == 1` asks for a single
    /// bucket spanning the range.
    pub fn normalize_range(start: i64, end: i64, interval: i64, max_samples: usize) -> NormalizedRange {
        if max_samples == 1 {
            let span = (end - start).max(1);
            let (start, end) = align_range(start, end, span);
            return NormalizedRange {
                start,
                end,
                interval: (end - start).max(1),
            };
        }

        let interval = if interval <= 0 {
            debug!("0 interval passed, using 10");
            10
        } else {
            interval
        };
        let (start, end) = align_range(start, end, interval);
        let max = max_samples as i64;
        if max_samples == 0 || (end - start) / interval <= max {
            return NormalizedRange {
                start,
                end,
                interval,
            };
        }

        let mut target = 0;
        for &candidate in REDUCTION_LADDER.iter() {
            if candidate <= interval || candidate % interval != 0 {
                continue;
            }
            target = candidate;
            let (s, e) = align_range(start, end, candidate);
            if (e - s) / candidate <= max {
                break;
            }
        }

        if target == 0 {
            warn!(
                "Cannot reduce samples of interval {} in range {} to {} evenly below {}",
                interval, start, end, max_samples
            );
            target = (end - start) / max;
            if target < interval * 2 {
                return NormalizedRange {
                    start,
                    end,
                    interval,
                };
            }
        }

        let (start, end) = align_range(start, end, target);
        NormalizedRange {
            start,
            end,
            interval: target,
        }
    }

    /// Reads the buckets between `start` and `end`.
    ///
    /// A zero bound defaults to [`DEFAULT_SELECT_SPAN`] seconds from the
    /// other bound, or before now when both are zero. Trailing queries read
    /// the first trailing tier whose season reaches back to `start`.
    /// Collated counters report missing intervals as zero-valued buckets;
    /// direct counters omit them.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier file cannot be read.
    pub fn select(
        &self,
        start: i64,
        end: i64,
        trailing: bool,
        max_samples: usize,
    ) -> Result<Selection> {
        let now = self.env.now();
        let (start, end) = match (start, end) {
            (0, 0) => (now - DEFAULT_SELECT_SPAN, now),
            (start, 0) => (start, start + DEFAULT_SELECT_SPAN),
            (0, end) => (end - DEFAULT_SELECT_SPAN, end),
            bounds => bounds,
        };
        if end < start {
            return Ok(Selection {
                start,
                end,
                ..Selection::default()
            });
        }

        let (tier, interval) = if trailing {
            let pick = self.pick_trailing_stat_file(now - start);
            (pick.tier, pick.interval)
        } else {
            let pick = self.pick_stat_file(start, end);
            (pick.tier, pick.interval)
        };
        let range = Self::normalize_range(start, end, interval, max_samples);
        let mut selection = Selection {
            buckets: Vec::new(),
            start: range.start,
            end: range.end,
            interval: range.interval,
        };

        let Some(tier) = tier else {
            debug!("No data found in range {} to {}", range.start, range.end);
            return Ok(selection);
        };
        let file = &self.tiers[tier].file;
        selection.buckets = self.read_range(file, range.start, range.end)?;

        if file.interval() < range.interval {
            debug!(
                "Reducing from interval {} to {}",
                file.interval(),
                range.interval
            );
            let collated_count = if self.collated {
                let multiplier = if file.flags().is_counter_aggregate() {
                    file.header().fixed_count
                } else {
                    1
                };
                (range.interval / file.interval() * multiplier) as i32
            } else {
                0
            };
            selection.buckets = Self::reduce(
                std::mem::take(&mut selection.buckets),
                range.start,
                range.interval,
                collated_count,
            );
        }
        Ok(selection)
    }

    fn read_range(&self, file: &StatFile, start: i64, end: i64) -> Result<Vec<Bucket>> {
        let start_index = file.map_time_to_bucket_index(start, false);
        let count = file.num_buckets_between(start, end, false);
        if count <= 0 {
            return Ok(Vec::new());
        }
        let mut buckets = vec![Bucket::default(); count.min(file.bucket_count()) as usize];
        let n = file.read_buckets(&mut buckets, start_index)?;
        buckets.truncate(n);

        let interval = file.interval();
        if self.collated {
            let mut next = start;
            for b in &mut buckets {
                if b.time() >= start && b.time() < end {
                    next = b.time() + interval;
                } else {
                    *b = Bucket::new(0.0, 0.0, 0.0, 0.0, 1, next);
                    next += interval;
                }
            }
        } else {
            buckets.retain(|b| b.time() >= start && b.time() <= end);
        }
        Ok(buckets)
    }

    /// Merges time-ordered buckets into groups of `interval` seconds starting
    /// at `start`.
    ///
    /// With a non-zero `collated_count`, a group holding fewer samples also
    /// merges in a zero and every group reports exactly `collated_count`.
    pub fn reduce(buckets: Vec<Bucket>, start: i64, interval: i64, collated_count: i32) -> Vec<Bucket> {
        let mut result = Vec::new();
        let mut current = start;
        let mut next = current + interval;
        let mut reduction = Bucket::default();

        for bucket in &buckets {
            if bucket.time() >= next {
                append_reduced(&mut result, reduction, current, collated_count);
                reduction = Bucket::default();
                if interval > 0 {
                    let steps = (bucket.time() - next) / interval + 1;
                    current = next + (steps - 1) * interval;
                    next = current + interval;
                }
            }
            if reduction.is_empty() {
                reduction = bucket.retimed(current);
            } else {
                reduction.update(bucket);
            }
        }
        if reduction.time() > 0 {
            append_reduced(&mut result, reduction, current, collated_count);
        }
        result
    }

    /// Moves every tier file into the backup tree under `<root>.bak` and
    /// removes the counter directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a tier cannot be flushed or moved.
    pub fn purge(mut self, root: impl AsRef<Path>) -> Result<()> {
        let layout = CounterLayout::new(root);
        if self.collated {
            self.fully_shift_collated()?;
        }
        let mut tiers = std::mem::take(&mut self.tiers);
        let mut paths = Vec::with_capacity(tiers.len());
        for tier in &mut tiers {
            tier.file.flush()?;
            self.env.count(Stat::CounterFlushed);
            paths.push(tier.file.path().to_path_buf());
        }
        drop(tiers);

        for path in &paths {
            let target = layout.move_to_backup(path)?;
            info!("Moved counter file {} to {}", path.display(), target.display());
        }
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!(
                "Counter directory still exists at {}: {:?}",
                self.path.display(),
                err
            );
        }
        Ok(())
    }
}

impl Drop for StatCounter {
    fn drop(&mut self) {
        self.env.count(Stat::CounterClosed);
        if !self.collated || self.tiers.is_empty() {
            return;
        }
        let now = self.env.now();
        let result = if now - self.window[COLLATION_WINDOW - 1].time > IDLE_SHIFT_SECS {
            self.fully_shift_collated()
        } else {
            let ahead = self.collation_interval * COLLATION_WINDOW as i64 / 2;
            self.maybe_shift_collated(now + ahead)
        };
        if let Err(e) = result {
            warn!("Failed to shift collation window of {} on drop: {:?}", self.path.display(), e);
        }
    }
}

fn align_range(start: i64, end: i64, interval: i64) -> (i64, i64) {
    let start = start - start % interval;
    let overrun = end % interval;
    let end = end - overrun + if overrun != 0 { interval } else { 0 };
    (start, end)
}

fn append_reduced(result: &mut Vec<Bucket>, mut reduction: Bucket, current: i64, collated_count: i32) {
    if collated_count != 0 {
        if reduction.count() < collated_count {
            reduction.update(&Bucket::empty_at(current));
        }
        reduction.set_count(collated_count);
    }
    result.push(reduction);
}
