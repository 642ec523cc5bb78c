//! Ring-buffer stat file for one retention tier.
//!
//! ## File Layout
//!
//! ```text
//! ┌───────────────┬───────────────┬───────────────┬─────┬───────────────┐
//! │ page 0        │ page 1        │ page 2        │ ... │ page N        │
//! │ FileHeader    │ buckets       │ buckets       │     │ buckets       │
//! │ (464 bytes)   │ 0..bpp        │ bpp..2*bpp    │     │               │
//! └───────────────┴───────────────┴───────────────┴─────┴───────────────┘
//! ```
//!
//! Bucket indices are quantized time: `(time - create_time) / interval`. They
//! grow forever and are reduced modulo the ring capacity
//! (`page_count * buckets_per_page`) only when a slot is touched. Slots are
//! never cleared eagerly, so a stored bucket is valid only if its time
//! matches the slot's expected time.
//!
//! Data pages are accessed through a three-slot round-robin cache of
//! mappings. Bulk reads use positional reads and then overlay any bytes held
//! in writable cached pages.
//!
//! Trailing files keep a three-bucket decay cache in memory. When an entry
//! leaves the cache it is blended with the bucket one season earlier before
//! it is written to the ring.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::bucket::{Bucket, BUCKET_SIZE};
use super::header::{FileFlags, FileHeader, CUR_HDR_VERSION, HEADER_SIZE, RD_HDR_VERSION};
use super::mmap::MappedRegion;
use crate::env::StorageEnv;
use crate::error::{Result, StatError};
use crate::stats::Stat;

/// Smallest page size used for new files.
pub const MIN_PAGE_SIZE: usize = 8192;

/// Smallest season accepted for trailing files, in seconds.
pub const MIN_SEASON: u64 = 10;

/// Largest season accepted for trailing files, in seconds.
pub const MAX_SEASON: u64 = 373 * 24 * 60 * 60;

/// Default bucket interval of [`StatFileSettings`], in seconds.
pub const DEFAULT_INTERVAL: i64 = 10;

/// Default sample count of [`StatFileSettings`] (one day of 10s buckets).
pub const DEFAULT_NUM_SAMPLES: i64 = 8640;

/// Largest page size accepted from a file header.
pub const MAX_PAGE_SIZE: usize = 1 << 24;

/// Largest page count accepted from a file header.
pub const MAX_PAGE_COUNT: i64 = 1 << 20;

const PAGE_CACHE_SLOTS: usize = 3;
const TRAILING_SLOTS: usize = 3;

/// How a stat file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; every mutation fails with [`StatError::ReadOnly`].
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// How [`StatFile::raw_update_bucket`] combines new data with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawUpdateMode {
    /// Merge into the slot.
    Aggregate,
    /// Replace the slot.
    Overwrite,
    /// Replace the slot if it is empty, otherwise merge.
    FillEmpty,
    /// Replace the slot if it is empty, otherwise leave it alone.
    OnlyIfEmpty,
}

/// Parameters for creating a new stat file.
#[derive(Debug, Clone, PartialEq)]
pub struct StatFileSettings {
    /// Seconds per bucket.
    pub interval: i64,
    /// Minimum number of buckets the ring must hold.
    pub num_samples: i64,
    /// Time of bucket index zero; 0 means now.
    pub zero_time: i64,
    /// Mode flags.
    pub flags: FileFlags,
    /// Blend factor for trailing files.
    pub lambda: f64,
    /// Season for trailing files, in seconds.
    pub season: u64,
    /// Count reported by counter-aggregate buckets.
    pub fixed_count: i64,
    /// Free-form unit label.
    pub unit: String,
}

impl Default for StatFileSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            num_samples: DEFAULT_NUM_SAMPLES,
            zero_time: 0,
            flags: FileFlags::new(),
            lambda: 0.0,
            season: 0,
            fixed_count: 0,
            unit: String::new(),
        }
    }
}

impl StatFileSettings {
    /// Creates settings for `num_samples` buckets of `interval` seconds.
    pub fn new(interval: i64, num_samples: i64) -> Self {
        Self {
            interval,
            num_samples,
            ..Self::default()
        }
    }

    /// Sets the time of bucket index zero.
    pub fn with_zero_time(mut self, zero_time: i64) -> Self {
        self.zero_time = zero_time;
        self
    }

    /// Sets the mode flags.
    pub fn with_flags(mut self, flags: FileFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Enables trailing mode with the given blend factor and season.
    pub fn with_trailing(mut self, lambda: f64, season: u64) -> Self {
        self.flags = self.flags.with(FileFlags::TRAILING);
        self.lambda = lambda;
        self.season = season;
        self
    }

    /// Enables counter-aggregate mode with the given fixed count.
    pub fn with_fixed_count(mut self, fixed_count: i64) -> Self {
        self.flags = self.flags.with(FileFlags::COUNTER_AGGREGATE);
        self.fixed_count = fixed_count;
        self
    }

    /// Sets the unit label.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// Running totals of everything merged into a file.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cumulative {
    /// Sum of values.
    pub sum: f64,
    /// Sum of squared values.
    pub sum_sq: f64,
    /// Number of samples.
    pub count: i64,
    /// Time the totals were last cleared.
    pub reset_time: i64,
}

#[derive(Debug)]
struct CachedPage {
    /// File page, counting the header page as 0.
    file_page: i64,
    region: MappedRegion,
}

#[derive(Debug, Default)]
struct PageCache {
    slots: [Option<CachedPage>; PAGE_CACHE_SLOTS],
    next: usize,
}

/// One ring-buffer file holding a single retention tier of a counter.
#[derive(Debug)]
pub struct StatFile {
    path: PathBuf,
    file: Option<File>,
    header: FileHeader,
    header_region: Option<MappedRegion>,
    cache: PageCache,
    trailing: [Bucket; TRAILING_SLOTS],
    writable: bool,
    buckets_per_page: i64,
    bucket_count: i64,
    env: StorageEnv,
}

impl StatFile {
    /// Opens an existing stat file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, or if its
    /// header is not a valid, readable stat file header.
    pub fn open(path: impl AsRef<Path>, env: &StorageEnv, mode: OpenMode) -> Result<Self> {
        Self::open_inner(path.as_ref(), env, mode == OpenMode::ReadWrite, None, false)
    }

    /// Creates a new stat file, replacing whatever is at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the file cannot be
    /// written.
    pub fn create(
        path: impl AsRef<Path>,
        settings: &StatFileSettings,
        env: &StorageEnv,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), env, true, Some(settings), true)
    }

    /// Opens the stat file at `path`, creating it if it is missing or empty.
    ///
    /// # Errors
    ///
    /// See [`StatFile::open`] and [`StatFile::create`].
    pub fn open_or_create(
        path: impl AsRef<Path>,
        settings: &StatFileSettings,
        env: &StorageEnv,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), env, true, Some(settings), false)
    }

    fn open_inner(
        path: &Path,
        env: &StorageEnv,
        writable: bool,
        init: Option<&StatFileSettings>,
        force_create: bool,
    ) -> Result<Self> {
        debug!("StatFile::open opening {}", path.display());
        let file = env.mmap.open(path, writable, init.is_some())?;
        match Self::load_header(&file, path, env, writable, init, force_create) {
            Ok(header) => Self::map_header(file, path, env, writable, header),
            Err(e) => {
                env.mmap.close(file);
                Err(e)
            }
        }
    }

    fn load_header(
        file: &File,
        path: &Path,
        env: &StorageEnv,
        writable: bool,
        init: Option<&StatFileSettings>,
        force_create: bool,
    ) -> Result<FileHeader> {
        let mm = &env.mmap;
        let mut len = mm.file_len(file)?;
        if let Some(settings) = init {
            if len == 0 || force_create {
                Self::write_new_header(file, path, settings, env)?;
                len = mm.file_len(file)?;
            }
        }

        let mut buf = [0u8; HEADER_SIZE];
        if len < HEADER_SIZE as u64 || mm.read_at(file, &mut buf, 0)? < HEADER_SIZE {
            return Err(StatError::FileTooSmall {
                path: path.to_path_buf(),
                len,
            });
        }
        let mut header = FileHeader::decode(&buf);

        if !header.has_valid_magic() {
            return Err(StatError::InvalidMagic(path.to_path_buf()));
        }
        if header.rd_version > CUR_HDR_VERSION {
            return Err(StatError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: header.rd_version,
            });
        }
        let system = mm.page_size();
        if header.page_size < system as i64
            || header.page_size > MAX_PAGE_SIZE as i64
            || header.page_size % system as i64 != 0
        {
            return Err(StatError::PageSizeMismatch {
                path: path.to_path_buf(),
                page_size: header.page_size,
                system,
            });
        }
        if header.hdr_size != HEADER_SIZE as i32 && header.cr_version == CUR_HDR_VERSION {
            return Err(StatError::HeaderSizeMismatch {
                path: path.to_path_buf(),
                expected: HEADER_SIZE as i32,
                actual: header.hdr_size,
            });
        }
        if header.page_count < 1 || header.cfg_interval < 1 {
            return Err(StatError::InvalidSettings(format!(
                "{}: page_count {} interval {}",
                path.display(),
                header.page_count,
                header.cfg_interval
            )));
        }

        let want = header
            .page_count
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(header.page_size))
            .filter(|_| header.page_count <= MAX_PAGE_COUNT)
            .ok_or_else(|| {
                StatError::InvalidSettings(format!(
                    "{}: page_count {} of {} bytes is out of range",
                    path.display(),
                    header.page_count,
                    header.page_size
                ))
            })? as u64;
        if len < want {
            if !writable {
                return Err(StatError::FileTooSmall {
                    path: path.to_path_buf(),
                    len,
                });
            }
            warn!(
                "File {} is too short; extending from {} to {}",
                path.display(),
                len,
                want
            );
            mm.truncate(file, want)?;
        }

        if header.refresh() {
            debug!("Upgraded header of {} to version {}", path.display(), CUR_HDR_VERSION);
        }
        header.name = path.display().to_string();
        Ok(header)
    }

    fn map_header(
        file: File,
        path: &Path,
        env: &StorageEnv,
        writable: bool,
        header: FileHeader,
    ) -> Result<Self> {
        let buckets_per_page = header.page_size / BUCKET_SIZE as i64;
        let Some(bucket_count) = header.page_count.checked_mul(buckets_per_page) else {
            env.mmap.close(file);
            return Err(StatError::InvalidSettings(format!(
                "{}: {} pages of {} buckets overflow",
                path.display(),
                header.page_count,
                buckets_per_page
            )));
        };
        let mut region = match env.mmap.map(&file, 0, HEADER_SIZE, writable) {
            Ok(region) => region,
            Err(source) => {
                error!("Could not map header of {}: {:?}", path.display(), source);
                env.mmap.close(file);
                return Err(StatError::MapFailed {
                    path: path.to_path_buf(),
                    offset: 0,
                    len: HEADER_SIZE,
                    source,
                });
            }
        };
        if let Some(buf) = region.as_mut_slice() {
            header.encode(buf);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            header,
            header_region: Some(region),
            cache: PageCache::default(),
            trailing: [Bucket::default(); TRAILING_SLOTS],
            writable,
            buckets_per_page,
            bucket_count,
            env: env.clone(),
        })
    }

    fn write_new_header(
        file: &File,
        path: &Path,
        settings: &StatFileSettings,
        env: &StorageEnv,
    ) -> Result<()> {
        let flags = settings.flags;
        if flags.has_unknown() {
            return Err(StatError::InvalidSettings(format!(
                "bad file flags {:#x} for {}",
                flags.bits(),
                path.display()
            )));
        }
        if flags.is_trailing() {
            if settings.lambda <= 0.0 || settings.lambda > 1.0 {
                return Err(StatError::InvalidSettings(
                    "lambda must be in (0,1] for trailing files".to_string(),
                ));
            }
            if settings.season < MIN_SEASON || settings.season > MAX_SEASON {
                return Err(StatError::InvalidSettings(
                    "season must be in [10s,373d] for trailing files".to_string(),
                ));
            }
        }

        let interval = settings.interval.max(1);
        let mut create_time = if settings.zero_time == 0 {
            env.now()
        } else {
            settings.zero_time
        };
        create_time -= create_time % interval;

        let page_size = env.mmap.page_size().max(MIN_PAGE_SIZE) as i64;
        let bpp = page_size / BUCKET_SIZE as i64;
        let mut np = (settings.num_samples.max(0) + bpp - 1) / bpp;
        if flags.is_trailing() && np * bpp * interval < settings.season as i64 {
            np = settings.season as i64 / bpp / interval + 1;
        }
        np = np.max(2);
        if np > MAX_PAGE_COUNT {
            return Err(StatError::InvalidSettings(format!(
                "{} samples need {} pages, more than {}",
                settings.num_samples, np, MAX_PAGE_COUNT
            )));
        }

        let header = FileHeader {
            cfg_interval: interval as i32,
            flags,
            cr_version: CUR_HDR_VERSION,
            rd_version: RD_HDR_VERSION,
            page_size,
            page_count: np,
            file_create_time: create_time,
            last_cumulative_clear_time: create_time,
            unit: settings.unit.clone(),
            name: path.display().to_string(),
            lambda: settings.lambda,
            season: settings.season,
            fixed_count: settings.fixed_count,
            ..FileHeader::default()
        };

        let mm = &env.mmap;
        mm.truncate(file, 0)?;
        mm.truncate(file, page_size as u64 * (np as u64 + 1))?;
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        mm.write_at(file, &buf, 0)?;
        debug!(
            "Created {} with {} pages of {} bytes",
            path.display(),
            np,
            page_size
        );
        Ok(())
    }

    /// Path the file was opened under.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory header, written back on flush and drop.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The settings this file behaves as if it was created with.
    ///
    /// `num_samples` reports the actual ring capacity.
    pub fn settings(&self) -> StatFileSettings {
        StatFileSettings {
            interval: self.interval(),
            num_samples: self.bucket_count,
            zero_time: self.header.file_create_time,
            flags: self.header.flags,
            lambda: self.header.lambda,
            season: self.header.season,
            fixed_count: self.header.fixed_count,
            unit: self.header.unit.clone(),
        }
    }

    /// Returns true if the file was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Seconds per bucket.
    pub fn interval(&self) -> i64 {
        i64::from(self.header.cfg_interval)
    }

    /// Mode flags.
    pub fn flags(&self) -> FileFlags {
        self.header.flags
    }

    /// Ring capacity in buckets.
    pub fn bucket_count(&self) -> i64 {
        self.bucket_count
    }

    /// Buckets per data page.
    pub fn buckets_per_page(&self) -> i64 {
        self.buckets_per_page
    }

    /// Oldest bucket index held by the ring.
    pub fn first_bucket(&self) -> i64 {
        self.header.first_bucket
    }

    /// Newest bucket index written.
    pub fn last_bucket(&self) -> i64 {
        self.header.last_bucket
    }

    /// Time of the oldest bucket the ring can hold, relative to the newest.
    pub fn first_bucket_time(&self) -> i64 {
        self.header.last_time - (self.bucket_count - 1) * self.interval()
    }

    /// Time of the newest bucket written.
    pub fn last_bucket_time(&self) -> i64 {
        self.header.last_time
    }

    /// Time of bucket index zero.
    pub fn create_time(&self) -> i64 {
        self.header.file_create_time
    }

    /// Cumulative totals since the last reset.
    pub fn cumulative(&self) -> Cumulative {
        Cumulative {
            sum: self.header.cumulative_sum,
            sum_sq: self.header.cumulative_sum_sq,
            count: self.header.cumulative_count,
            reset_time: self.header.last_cumulative_clear_time,
        }
    }

    /// Clears the cumulative totals; a `time` of 0 means now.
    pub fn reset_cumulative(&mut self, time: i64) {
        self.header.cumulative_sum = 0.0;
        self.header.cumulative_sum_sq = 0.0;
        self.header.cumulative_count = 0;
        self.header.last_cumulative_clear_time = if time == 0 { self.env.now() } else { time };
    }

    /// Maps a time to its bucket index, optionally rounding a partial
    /// interval up.
    pub fn map_time_to_bucket_index(&self, time: i64, round_up: bool) -> i64 {
        let interval = self.interval();
        let round = i64::from(round_up && time % interval != 0);
        (time - self.header.file_create_time) / interval + round
    }

    /// Maps a bucket index to the time of its bucket.
    pub fn map_bucket_index_to_time(&self, index: i64) -> i64 {
        self.header.file_create_time + index * self.interval()
    }

    /// Returns true if `index` may be held by the ring.
    ///
    /// Indices at or before `last_bucket - capacity` have been overwritten.
    /// Indices after `last_bucket` are accepted only by collated files, and
    /// only while the bucket's time is in the past.
    pub fn is_bucket_index_in_file(&self, index: i64) -> bool {
        let last = self.header.last_bucket;
        if index <= last - self.bucket_count {
            debug!(
                "Bucket {} is older than {} - {} in {}",
                index, last, self.bucket_count, self.header.name
            );
            return false;
        }
        if index > last {
            if self.header.flags.is_collated()
                && self.map_bucket_index_to_time(index) < self.env.now()
            {
                return true;
            }
            debug!(
                "Bucket {} is newer than {} in {}",
                index, last, self.header.name
            );
            return false;
        }
        true
    }

    /// Maps a bucket index to its ring slot, or -1 if it is not in the file.
    pub fn map_bucket_index_to_file_index(&self, index: i64) -> i64 {
        if !self.is_bucket_index_in_file(index) {
            return -1;
        }
        index.rem_euclid(self.bucket_count)
    }

    /// Number of buckets from `start` to `end`, never less than one.
    pub fn num_buckets_between(&self, start: i64, end: i64, round_up: bool) -> i64 {
        let interval = self.interval();
        let round = if round_up && end % interval != 0 {
            interval
        } else {
            0
        };
        let start = start - start % interval;
        let end = end - end % interval + round;
        let delta = end - start;
        if delta != 0 {
            delta / interval
        } else {
            1
        }
    }

    /// Merges `data` into the bucket for its time.
    ///
    /// # Errors
    ///
    /// See [`StatFile::raw_update_bucket`].
    pub fn update_bucket(&mut self, data: &Bucket) -> Result<bool> {
        self.raw_update_bucket(data, RawUpdateMode::Aggregate)
    }

    /// Writes `data` into the bucket for its time using `mode`.
    ///
    /// Returns `Ok(false)` if the time has already rotated out of the ring.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::ReadOnly`] for read-only files, or an error if the
    /// page cannot be mapped.
    pub fn raw_update_bucket(&mut self, data: &Bucket, mode: RawUpdateMode) -> Result<bool> {
        if !self.writable {
            return Err(StatError::ReadOnly(self.path.clone()));
        }

        let time = data.time();
        let target = self.map_time_to_bucket_index(time, false);
        let target_time = time - time % self.interval();

        if target > self.header.last_bucket {
            // Skipped slots keep stale data; readers discard by time.
            self.header.last_bucket = target;
            self.header.last_time = target_time;
            if self.header.first_bucket + self.bucket_count <= self.header.last_bucket {
                self.header.first_bucket = self.header.last_bucket - self.bucket_count + 1;
            }
        }

        if !self.is_bucket_index_in_file(target) {
            warn!(
                "Cannot go back to time {} when at {}: {}",
                time, self.header.last_time, self.header.name
            );
            return Ok(false);
        }

        if target < self.header.first_bucket {
            self.header.first_bucket = target;
        }

        let trailing_slot = if self.header.flags.is_trailing() {
            Some(self.trailing_slot(target_time)?)
        } else {
            None
        };
        let mut slot = match trailing_slot {
            Some(i) => self.trailing[i],
            None => {
                let stored = self.read_slot(target, true)?;
                if stored.time() != target_time {
                    Bucket::default()
                } else {
                    stored
                }
            }
        };

        let flags = self.header.flags;
        let mutated = match mode {
            RawUpdateMode::OnlyIfEmpty => {
                if slot.is_empty() {
                    slot = *data;
                    true
                } else {
                    false
                }
            }
            _ if flags.is_collated()
                || mode == RawUpdateMode::Overwrite
                || (mode == RawUpdateMode::FillEmpty && slot.is_empty()) =>
            {
                slot = *data;
                true
            }
            _ => {
                slot.update(&data.retimed(target_time));
                if flags.is_counter_aggregate() {
                    slot.set_count(self.header.fixed_count as i32);
                }
                true
            }
        };

        match trailing_slot {
            Some(i) => self.trailing[i] = slot,
            None => self.write_slot(target, &slot)?,
        }

        if mutated {
            self.header.cumulative_sum += data.sum();
            self.header.cumulative_sum_sq += f64::from(data.sum_sq());
            self.header.cumulative_count += i64::from(data.count());
        }
        Ok(true)
    }

    /// Reads the raw ring slot for `index`.
    ///
    /// The slot may hold data for an older index that shares it; compare the
    /// bucket's time with [`StatFile::map_bucket_index_to_time`].
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be mapped.
    pub fn bucket(&mut self, index: i64) -> Result<Bucket> {
        let writable = self.writable;
        self.read_slot(index, writable)
    }

    /// Reads up to `out.len()` consecutive slots starting at `start_index`,
    /// wrapping around the ring, and returns how many were read.
    ///
    /// At most one full ring is read. Data still sitting in writable cached
    /// pages takes precedence over what the file returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_buckets(&self, out: &mut [Bucket], start_index: i64) -> Result<usize> {
        let file = open_file(&self.file)?;
        let bpp = self.buckets_per_page;
        let count = out.len().min(self.bucket_count as usize);
        let mut raw = vec![0u8; bpp as usize * BUCKET_SIZE];
        let mut file_index = start_index.rem_euclid(self.bucket_count);
        let mut done = 0usize;

        while done < count {
            let page = file_index / bpp;
            let off = file_index % bpp;
            let want = ((bpp - off) as usize).min(count - done);
            let pos = (page as u64 + 1) * self.header.page_size as u64 + off as u64 * BUCKET_SIZE as u64;
            let n = self
                .env
                .mmap
                .read_at(file, &mut raw[..want * BUCKET_SIZE], pos)?;
            let got = n / BUCKET_SIZE;
            let dst = &mut out[done..done + got];
            for (i, b) in dst.iter_mut().enumerate() {
                *b = Bucket::decode(&raw[i * BUCKET_SIZE..(i + 1) * BUCKET_SIZE]);
            }
            self.copy_aliased_buckets(dst, page, off as usize);
            done += got;
            if got < want {
                break;
            }
            file_index = (file_index + want as i64) % self.bucket_count;
        }
        Ok(done)
    }

    fn copy_aliased_buckets(&self, out: &mut [Bucket], page: i64, off: usize) {
        let file_page = page + 1;
        let cached = self
            .cache
            .slots
            .iter()
            .flatten()
            .find(|p| p.file_page == file_page && p.region.is_writable());
        if let Some(p) = cached {
            let bytes = p.region.as_slice();
            for (i, b) in out.iter_mut().enumerate() {
                let at = (off + i) * BUCKET_SIZE;
                *b = Bucket::decode(&bytes[at..at + BUCKET_SIZE]);
            }
        }
    }

    /// Writes the header back and schedules the mapped pages for writeback.
    ///
    /// Trailing files first move one bucket out of the decay cache.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be mapped or flushed.
    pub fn flush(&mut self) -> Result<()> {
        debug!("StatFile::flush {}", self.path.display());
        if !self.writable {
            return Ok(());
        }
        if self.header.flags.is_trailing() {
            self.flush_one_trailing()?;
        }
        self.sync_header();
        if let Some(region) = &self.header_region {
            self.env.mmap.flush(region, false)?;
        }
        for page in self.cache.slots.iter().flatten() {
            self.env.mmap.flush(&page.region, false)?;
        }
        Ok(())
    }

    fn sync_header(&mut self) {
        if let Some(buf) = self.header_region.as_mut().and_then(|r| r.as_mut_slice()) {
            self.header.encode(buf);
        }
    }

    fn trailing_slot(&mut self, time: i64) -> Result<usize> {
        if let Some(i) = self.trailing.iter().position(|b| b.time() == time) {
            return Ok(i);
        }
        self.flush_one_trailing()?;
        self.trailing[TRAILING_SLOTS - 1] = Bucket::empty_at(time);
        Ok(TRAILING_SLOTS - 1)
    }

    fn flush_one_trailing(&mut self) -> Result<()> {
        let eb0 = self.trailing[0];
        if eb0.time() > 0 {
            let season = self.header.season as i64;
            let index = self.map_time_to_bucket_index(eb0.time(), false);
            let old_index = self.map_time_to_bucket_index(eb0.time() - season, false);
            let old = self.read_slot(old_index, true)?;
            // the slot may still hold a bucket from an earlier lap of the ring
            let out = if old.time() == eb0.time() - season && !old.is_empty() {
                let mut blended = old;
                blended.exp_update(&eb0, self.header.lambda);
                blended
            } else {
                eb0
            };
            self.write_slot(index, &out)?;
        }
        self.trailing.rotate_left(1);
        self.trailing[TRAILING_SLOTS - 1] = Bucket::default();
        Ok(())
    }

    fn slot_position(&self, index: i64) -> (i64, usize) {
        let file_index = index.rem_euclid(self.bucket_count);
        let page = file_index / self.buckets_per_page;
        let off = (file_index % self.buckets_per_page) as usize * BUCKET_SIZE;
        (page, off)
    }

    fn read_slot(&mut self, index: i64, to_write: bool) -> Result<Bucket> {
        let (page, off) = self.slot_position(index);
        let region = self.map_bucket_page(page, to_write)?;
        Ok(Bucket::decode(&region.as_slice()[off..off + BUCKET_SIZE]))
    }

    fn write_slot(&mut self, index: i64, bucket: &Bucket) -> Result<()> {
        let (page, off) = self.slot_position(index);
        let region = self.map_bucket_page(page, true)?;
        let written = match region.as_mut_slice() {
            Some(buf) => {
                bucket.encode(&mut buf[off..off + BUCKET_SIZE]);
                true
            }
            None => false,
        };
        if written {
            Ok(())
        } else {
            Err(StatError::ReadOnly(self.path.clone()))
        }
    }

    /// Returns the cached mapping of data page `page`, mapping it if needed.
    fn map_bucket_page(&mut self, page: i64, to_write: bool) -> Result<&mut MappedRegion> {
        if to_write && !self.writable {
            return Err(StatError::ReadOnly(self.path.clone()));
        }
        let file_page = if page == 0 {
            1
        } else {
            page % self.header.page_count + 1
        };

        let hit = self.cache.slots.iter().position(|slot| {
            matches!(slot, Some(p) if p.file_page == file_page
                && (!to_write || p.region.is_writable()))
        });
        let index = match hit {
            Some(i) => {
                self.env.count(Stat::PageHit);
                i
            }
            None => {
                let i = self.cache.next;
                self.replace_map(i, file_page, to_write)?;
                self.cache.next = (i + 1) % PAGE_CACHE_SLOTS;
                i
            }
        };

        match self.cache.slots[index].as_mut() {
            Some(p) => Ok(&mut p.region),
            None => Err(closed_error()),
        }
    }

    fn replace_map(&mut self, slot: usize, file_page: i64, to_write: bool) -> Result<()> {
        if let Some(old) = self.cache.slots[slot].take() {
            self.env.mmap.unmap(old.region);
        }
        self.env.count(Stat::PageMiss);

        let len = self.header.page_size as usize;
        let offset = file_page as u64 * len as u64;
        let file = open_file(&self.file)?;
        let region = self
            .env
            .mmap
            .map(file, offset, len, to_write)
            .map_err(|source| {
                error!(
                    "mmap({}, offset={}, size={}) failed: {:?}",
                    self.path.display(),
                    offset,
                    len,
                    source
                );
                StatError::MapFailed {
                    path: self.path.clone(),
                    offset,
                    len,
                    source,
                }
            })?;
        self.cache.slots[slot] = Some(CachedPage { file_page, region });
        Ok(())
    }
}

impl Drop for StatFile {
    fn drop(&mut self) {
        if self.writable {
            self.sync_header();
        }
        let mm = Arc::clone(&self.env.mmap);
        for slot in self.cache.slots.iter_mut() {
            if let Some(page) = slot.take() {
                mm.unmap(page.region);
            }
        }
        if let Some(region) = self.header_region.take() {
            mm.unmap(region);
        }
        if let Some(file) = self.file.take() {
            mm.close(file);
        }
    }
}

fn open_file(file: &Option<File>) -> Result<&File> {
    file.as_ref().ok_or_else(closed_error)
}

fn closed_error() -> StatError {
    StatError::IoError(io::Error::new(io::ErrorKind::NotConnected, "stat file is closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stats::AtomicStats;
    use tempfile::TempDir;

    const ZERO: i64 = 1_000_000_000;

    fn test_env(now: i64) -> (StorageEnv, Arc<AtomicStats>) {
        let stats = Arc::new(AtomicStats::new());
        let env = StorageEnv::new()
            .with_clock(Arc::new(ManualClock::new(now)))
            .with_stats(stats.clone());
        (env, stats)
    }

    #[test]
    fn test_create_sizes_file() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let path = temp_dir.path().join("10s");
        let settings = StatFileSettings::new(10, 100).with_zero_time(ZERO + 7);

        let file = StatFile::create(&path, &settings, &env).unwrap();
        let page_size = file.header().page_size;
        assert!(page_size >= MIN_PAGE_SIZE as i64);
        assert_eq!(file.header().page_count, 2);
        assert_eq!(file.create_time(), ZERO);
        assert_eq!(file.bucket_count(), 2 * page_size / 32);
        drop(file);

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, page_size as u64 * 3);
    }

    #[test]
    fn test_update_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let path = temp_dir.path().join("10s");
        let settings = StatFileSettings::new(10, 100).with_zero_time(ZERO);
        let mut file = StatFile::create(&path, &settings, &env).unwrap();

        assert!(file.update_bucket(&Bucket::new(4.0, 16.0, 4.0, 4.0, 1, ZERO + 12)).unwrap());
        assert!(file.update_bucket(&Bucket::new(6.0, 36.0, 6.0, 6.0, 1, ZERO + 15)).unwrap());

        let b = file.bucket(1).unwrap();
        assert_eq!(b.time(), ZERO + 10);
        assert_eq!(b.sum(), 10.0);
        assert_eq!(b.count(), 2);
        assert_eq!(file.last_bucket(), 1);
        assert_eq!(file.last_bucket_time(), ZERO + 10);
        assert_eq!(file.cumulative().count, 2);
        assert_eq!(file.cumulative().sum, 10.0);
    }

    #[test]
    fn test_stale_slot_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();
        let cap = file.bucket_count();

        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO)).unwrap();
        let later = ZERO + cap * 10;
        file.update_bucket(&Bucket::new(5.0, 25.0, 5.0, 5.0, 1, later)).unwrap();

        let b = file.bucket(0).unwrap();
        assert_eq!(b.time(), later);
        assert_eq!(b.sum(), 5.0);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_too_old_write_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();
        let cap = file.bucket_count();

        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO + cap * 10)).unwrap();
        assert!(!file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO)).unwrap());
        assert!(file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO + 10)).unwrap());
        assert_eq!(file.first_bucket(), 1);
    }

    #[test]
    fn test_raw_update_modes() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();
        let one = Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO);
        let two = Bucket::new(2.0, 4.0, 2.0, 2.0, 1, ZERO);

        file.raw_update_bucket(&one, RawUpdateMode::OnlyIfEmpty).unwrap();
        file.raw_update_bucket(&two, RawUpdateMode::OnlyIfEmpty).unwrap();
        assert_eq!(file.bucket(0).unwrap().sum(), 1.0);

        file.raw_update_bucket(&two, RawUpdateMode::FillEmpty).unwrap();
        assert_eq!(file.bucket(0).unwrap().sum(), 3.0);

        file.raw_update_bucket(&two, RawUpdateMode::Overwrite).unwrap();
        assert_eq!(file.bucket(0).unwrap().sum(), 2.0);
        assert_eq!(file.bucket(0).unwrap().count(), 1);
    }

    #[test]
    fn test_counter_aggregate_forces_count() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let settings = StatFileSettings::new(60, 10)
            .with_zero_time(ZERO)
            .with_fixed_count(6);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();

        // ZERO is not minute aligned, so the file starts 40s earlier
        assert_eq!(file.create_time(), ZERO - 40);
        let index = file.map_time_to_bucket_index(ZERO + 20, false);
        assert_eq!(index, 1);
        assert_eq!(file.map_time_to_bucket_index(ZERO + 30, false), index);

        assert!(file.update_bucket(&Bucket::new(3.0, 9.0, 3.0, 3.0, 1, ZERO + 20)).unwrap());
        assert!(file.update_bucket(&Bucket::new(2.0, 4.0, 2.0, 2.0, 1, ZERO + 30)).unwrap());
        let b = file.bucket(index).unwrap();
        assert_eq!(b.time(), file.map_bucket_index_to_time(index));
        assert_eq!(b.sum(), 5.0);
        assert_eq!(b.count(), 6);
        assert!(file.bucket(0).unwrap().is_empty());
    }

    #[test]
    fn test_index_arithmetic() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();

        assert_eq!(file.map_time_to_bucket_index(ZERO + 15, false), 1);
        assert_eq!(file.map_time_to_bucket_index(ZERO + 15, true), 2);
        assert_eq!(file.map_time_to_bucket_index(ZERO + 20, true), 2);
        assert_eq!(file.map_bucket_index_to_time(3), ZERO + 30);
        assert_eq!(file.num_buckets_between(ZERO, ZERO, false), 1);
        assert_eq!(file.num_buckets_between(ZERO + 10, ZERO + 22, true), 2);
        assert_eq!(file.num_buckets_between(ZERO + 10, ZERO + 22, false), 1);

        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO + 50)).unwrap();
        let cap = file.bucket_count();
        assert_eq!(file.map_bucket_index_to_file_index(5), 5);
        assert_eq!(file.map_bucket_index_to_file_index(6), -1);
        assert_eq!(file.map_bucket_index_to_file_index(5 - cap), -1);
        assert_eq!(file.map_bucket_index_to_file_index(6 - cap), (6 - cap).rem_euclid(cap));
        assert_eq!(file.first_bucket_time(), ZERO + 50 - (cap - 1) * 10);
    }

    #[test]
    fn test_collated_accepts_past_future_index() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO + 100);
        let settings = StatFileSettings::new(10, 10)
            .with_zero_time(ZERO)
            .with_flags(FileFlags::new().with(FileFlags::COLLATED));
        let file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();

        assert!(file.is_bucket_index_in_file(5));
        assert!(!file.is_bucket_index_in_file(10));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let path = temp_dir.path().join("f");
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(&path, &settings, &env).unwrap();
        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO)).unwrap();
        drop(file);

        let mut ro = StatFile::open(&path, &env, OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            ro.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO)),
            Err(StatError::ReadOnly(_))
        ));
        assert_eq!(ro.bucket(0).unwrap().sum(), 1.0);
        ro.flush().unwrap();
    }

    #[test]
    fn test_page_cache_hits_and_misses() {
        let temp_dir = TempDir::new().unwrap();
        let (env, stats) = test_env(ZERO);
        let settings = StatFileSettings::new(10, 10).with_zero_time(ZERO);
        let mut file = StatFile::create(temp_dir.path().join("f"), &settings, &env).unwrap();

        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO)).unwrap();
        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO + 10)).unwrap();
        assert_eq!(stats.get(Stat::PageMiss), 1);
        assert!(stats.get(Stat::PageHit) >= 1);

        let bpp = file.buckets_per_page();
        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, ZERO + bpp * 10)).unwrap();
        assert_eq!(stats.get(Stat::PageMiss), 2);
    }

    #[test]
    fn test_reopen_keeps_header_state() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let path = temp_dir.path().join("f");
        let settings = StatFileSettings::new(10, 10)
            .with_zero_time(ZERO)
            .with_unit("ms");
        let mut file = StatFile::create(&path, &settings, &env).unwrap();
        file.update_bucket(&Bucket::new(2.0, 4.0, 2.0, 2.0, 1, ZERO + 30)).unwrap();
        drop(file);

        let mut file = StatFile::open_or_create(&path, &StatFileSettings::default(), &env).unwrap();
        assert_eq!(file.interval(), 10);
        assert_eq!(file.last_bucket(), 3);
        assert_eq!(file.header().unit, "ms");
        assert_eq!(file.bucket(3).unwrap().sum(), 2.0);
        file.reset_cumulative(0);
        assert_eq!(file.cumulative().count, 0);
        assert_eq!(file.cumulative().reset_time, ZERO);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(ZERO);
        let bad_lambda = StatFileSettings::new(60, 60).with_trailing(0.0, 3600);
        assert!(matches!(
            StatFile::create(temp_dir.path().join("a"), &bad_lambda, &env),
            Err(StatError::InvalidSettings(_))
        ));
        let bad_season = StatFileSettings::new(60, 60).with_trailing(0.5, 5);
        assert!(StatFile::create(temp_dir.path().join("b"), &bad_season, &env).is_err());
        let bad_flags = StatFileSettings::new(60, 60).with_flags(FileFlags::from_bits(0x40));
        assert!(StatFile::create(temp_dir.path().join("c"), &bad_flags, &env).is_err());
    }

    #[test]
    fn test_trailing_blends_with_previous_season() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(13_720);
        let settings = StatFileSettings::new(60, 60)
            .with_zero_time(10_000)
            .with_trailing(0.875, 3600);
        let mut file = StatFile::create(temp_dir.path().join("ma"), &settings, &env).unwrap();
        assert_eq!(file.create_time(), 9960);

        for (t, v) in [(10_000, 1.0), (13_600, 2.0), (13_660, 2.0)] {
            file.update_bucket(&Bucket::new(v, v * v, v, v, 1, t)).unwrap();
            file.flush().unwrap();
        }

        let first = file.bucket(0).unwrap();
        assert_eq!(first.time(), 9960);
        assert_eq!(first.sum(), 1.0);

        let blended = file.bucket(60).unwrap();
        assert_eq!(blended.time(), 13_560);
        assert_eq!(blended.sum(), 1.0 * 0.875 + 2.0 * 0.125);
        assert_eq!(blended.count(), 1);
    }

    #[test]
    fn test_trailing_skips_stale_season_slot() {
        let temp_dir = TempDir::new().unwrap();
        let (env, _) = test_env(50_000);
        let settings = StatFileSettings::new(60, 60)
            .with_zero_time(10_000)
            .with_trailing(0.875, 3600);
        let mut file = StatFile::create(temp_dir.path().join("ma"), &settings, &env).unwrap();
        let cap = file.bucket_count();

        let flush_all = |file: &mut StatFile| {
            for _ in 0..TRAILING_SLOTS {
                file.flush().unwrap();
            }
        };
        file.update_bucket(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, 10_000)).unwrap();
        flush_all(&mut file);

        // one season after index `cap`, whose slot still holds index 0
        let index = cap + 60;
        let t = file.map_bucket_index_to_time(index);
        file.update_bucket(&Bucket::new(2.0, 4.0, 2.0, 2.0, 1, t)).unwrap();
        flush_all(&mut file);

        let stale = file.bucket(cap).unwrap();
        assert_eq!(stale.time(), 9960);
        assert_ne!(stale.time(), t - 3600);

        let written = file.bucket(index).unwrap();
        assert_eq!(written.time(), t);
        assert_eq!(written.sum(), 2.0);
        assert_eq!(written.count(), 1);
    }
}
