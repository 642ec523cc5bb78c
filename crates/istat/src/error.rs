//! Error and Result types for istat storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for istat operations.
pub type Result<T> = std::result::Result<T, StatError>;

/// The error type for stat file, counter and store operations.
#[derive(Debug, Error)]
pub enum StatError {
    /// The file does not start with the stat file magic bytes.
    #[error("Not an istat file: {0}")]
    InvalidMagic(PathBuf),

    /// The file was written by a newer, incompatible format version.
    #[error("File version is too new: {path} (rd_version {version})")]
    UnsupportedVersion {
        /// Path of the offending file.
        path: PathBuf,
        /// Read-compatibility version found in the header.
        version: i32,
    },

    /// The page size recorded in the header cannot be mapped on this system.
    #[error("Page size inconsistent: {path} (file {page_size}, system {system})")]
    PageSizeMismatch {
        /// Path of the offending file.
        path: PathBuf,
        /// Page size stored in the header.
        page_size: i64,
        /// System page size.
        system: usize,
    },

    /// The header size changed within the current format version.
    #[error("Header size changed within the current version: {path} (expected {expected}, got {actual})")]
    HeaderSizeMismatch {
        /// Path of the offending file.
        path: PathBuf,
        /// Header size of the current version.
        expected: i32,
        /// Header size stored in the file.
        actual: i32,
    },

    /// The file is too short to hold its header or its pages.
    #[error("File too small: {path} ({len} bytes)")]
    FileTooSmall {
        /// Path of the offending file.
        path: PathBuf,
        /// Actual file length in bytes.
        len: u64,
    },

    /// Stat file settings are invalid (flags, lambda, season).
    #[error("Invalid file settings: {0}")]
    InvalidSettings(String),

    /// A retention policy could not be built or parsed.
    #[error("Invalid retention: {0}")]
    InvalidRetention(String),

    /// A mutation was attempted on a file opened read-only.
    #[error("Attempt to update read-only stat file: {0}")]
    ReadOnly(PathBuf),

    /// Mapping a region of a stat file failed.
    #[error("mmap({path}, offset={offset}, size={len}) failed: {source}")]
    MapFailed {
        /// Path of the mapped file.
        path: PathBuf,
        /// Offset of the requested region.
        offset: u64,
        /// Length of the requested region.
        len: usize,
        /// Underlying OS error.
        source: io::Error,
    },

    /// A counter directory could not be created.
    #[error("Could not create counter directory {path}: {source}")]
    CounterDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Moving a counter file into the backup tree failed.
    #[error("Backup of {path} failed: {reason}")]
    BackupFailed {
        /// File that could not be backed up.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
