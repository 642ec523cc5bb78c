//! On-disk ring-buffer files.
//!
//! A stat file holds one retention tier of one counter: a fixed-size ring of
//! 32-byte [`Bucket`]s behind a versioned [`FileHeader`]. All file access
//! goes through an injected [`MmapBackend`].

pub mod bucket;
pub mod header;
pub mod mmap;
pub mod stat_file;

pub use bucket::{Bucket, BUCKET_SIZE};
pub use header::{FileFlags, FileHeader, CUR_HDR_VERSION, FILE_MAGIC, HEADER_SIZE, RD_HDR_VERSION};
pub use mmap::{MappedRegion, MmapBackend, MmapCounters, SystemMmap};
pub use stat_file::{
    Cumulative, OpenMode, RawUpdateMode, StatFile, StatFileSettings, DEFAULT_INTERVAL,
    DEFAULT_NUM_SAMPLES, MAX_PAGE_COUNT, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
