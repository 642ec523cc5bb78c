//! Page-mapping backend consumed by [`StatFile`](super::StatFile).
//!
//! The engine only needs a handful of POSIX-like primitives: positional
//! read/write, truncate (which may grow a sparse file), shared mappings of
//! page-aligned regions, and advisory flushing. [`SystemMmap`] provides them
//! with `memmap2` and `libc`; tests may wrap it to observe mapping traffic
//! through [`MmapCounters`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};

/// Aggregate mapping traffic of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapCounters {
    /// Regions mapped.
    pub maps: u64,
    /// Regions unmapped.
    pub unmaps: u64,
    /// Files opened.
    pub opens: u64,
    /// Files closed.
    pub closes: u64,
}

/// A mapped region of a file.
pub struct MappedRegion {
    map: Mapping,
    offset: u64,
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl MappedRegion {
    /// Wraps a read-only mapping that starts at `offset` in its file.
    pub fn read_only(map: Mmap, offset: u64) -> Self {
        Self {
            map: Mapping::ReadOnly(map),
            offset,
        }
    }

    /// Wraps a writable shared mapping that starts at `offset` in its file.
    pub fn writable(map: MmapMut, offset: u64) -> Self {
        Self {
            map: Mapping::Writable(map),
            offset,
        }
    }

    /// File offset of the first mapped byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if the mapping is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if writes through this mapping are allowed.
    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::Writable(_))
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::Writable(m) => &m[..],
        }
    }

    /// The mapped bytes for writing, or `None` for a read-only mapping.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.map {
            Mapping::ReadOnly(_) => None,
            Mapping::Writable(m) => Some(&mut m[..]),
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("offset", &self.offset)
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// File and page-mapping primitives used by stat files.
pub trait MmapBackend: Send + Sync + fmt::Debug {
    /// Opens `path` for reading, or for reading and writing, optionally
    /// creating it.
    fn open(&self, path: &Path, writable: bool, create: bool) -> io::Result<File>;

    /// Closes a file previously returned by [`open`](Self::open).
    fn close(&self, file: File);

    /// Reads at `offset`, returning the number of bytes read.
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes all of `buf` at `offset`.
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Current length of the file (the end-of-file seek position).
    fn file_len(&self, file: &File) -> io::Result<u64>;

    /// Sets the file length, growing it sparsely if needed.
    fn truncate(&self, file: &File, len: u64) -> io::Result<()>;

    /// Maps `len` bytes at page-aligned `offset`.
    fn map(&self, file: &File, offset: u64, len: usize, writable: bool)
        -> io::Result<MappedRegion>;

    /// Releases a mapping.
    fn unmap(&self, region: MappedRegion);

    /// Flushes a writable mapping. When `immediate` is false the flush is
    /// only scheduled.
    fn flush(&self, region: &MappedRegion, immediate: bool) -> io::Result<()>;

    /// Bytes available to unprivileged users on the file system holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    /// System virtual memory page size.
    fn page_size(&self) -> usize;

    /// Mapping traffic so far.
    fn counters(&self) -> MmapCounters;
}

/// [`MmapBackend`] over the operating system.
#[derive(Debug, Default)]
pub struct SystemMmap {
    maps: AtomicU64,
    unmaps: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl SystemMmap {
    /// Creates a backend with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MmapBackend for SystemMmap {
    fn open(&self, path: &Path, writable: bool, create: bool) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable && create)
            .truncate(false)
            .open(path)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(file)
    }

    fn close(&self, file: File) {
        drop(file);
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(unix)]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    #[cfg(not(unix))]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    #[cfg(unix)]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn file_len(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    fn truncate(&self, file: &File, len: u64) -> io::Result<()> {
        file.set_len(len)
    }

    fn map(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        writable: bool,
    ) -> io::Result<MappedRegion> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        // SAFETY: the mapping is shared and file-backed. Stat files are only
        // mutated through these mappings by the counter that owns them, and
        // the region never outlives the `File` it was created from because
        // the owning StatFile unmaps before closing.
        let region = unsafe {
            if writable {
                MappedRegion::writable(options.map_mut(file)?, offset)
            } else {
                MappedRegion::read_only(options.map(file)?, offset)
            }
        };
        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(region)
    }

    fn unmap(&self, region: MappedRegion) {
        drop(region);
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn flush(&self, region: &MappedRegion, immediate: bool) -> io::Result<()> {
        match &region.map {
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::Writable(m) if immediate => m.flush(),
            Mapping::Writable(m) => m.flush_async(),
        }
    }

    #[cfg(unix)]
    #[allow(clippy::unnecessary_cast)] // statvfs fields are u32 on macOS, u64 on Linux
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `stat` is plain old data and `c_path` is NUL-terminated.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(not(unix))]
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }

    #[cfg(unix)]
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    #[cfg(not(unix))]
    fn page_size(&self) -> usize {
        4096
    }

    fn counters(&self) -> MmapCounters {
        MmapCounters {
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}
