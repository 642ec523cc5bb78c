//! Stat file header.
//!
//! ## Layout (464 bytes, little endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  0   magic[16]                  "ISTAT-STATFILE\r\n"         │
//! │  16  hdr_size, cfg_interval, flags, cr_version, rd_version  │
//! │      (i32 each) + 4 bytes padding                           │
//! │  40  page_size, page_count, first_bucket, last_bucket,      │
//! │      last_time (i64 each)                                   │
//! │  80  cumulative_sum f64, cumulative_sum_sq f64,             │
//! │      cumulative_count i64, last_cumulative_clear_time i64,  │
//! │      file_create_time i64                                   │
//! │  120 unit[64], NUL padded                                   │
//! │  184 name[256], NUL padded                                  │
//! │  440 lambda f64, season u64         (trailing files)        │
//! │  456 fixed_count i64                (counter aggregates)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Page 0 of a stat file holds the header; bucket pages follow.

/// Magic bytes at the start of every stat file.
pub const FILE_MAGIC: [u8; 16] = *b"ISTAT-STATFILE\r\n";

/// Header format version written by this crate.
pub const CUR_HDR_VERSION: i32 = 8;

/// Oldest reader version able to read files written by this crate.
pub const RD_HDR_VERSION: i32 = 4;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 464;

/// Size of the `unit` field.
pub const UNIT_SIZE: usize = 64;

/// Size of the `name` field.
pub const NAME_SIZE: usize = 256;

/// Lambda given to files written before trailing mode existed.
pub const LEGACY_LAMBDA: f64 = 0.9;

/// Season given to files written before trailing mode existed.
pub const LEGACY_SEASON: u64 = 86_400;

/// Stat file mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileFlags(i32);

impl FileFlags {
    /// Buckets hold collated event sums and are overwritten, not merged.
    pub const COLLATED: i32 = 0x1;
    /// Buckets are exponentially blended against the previous season.
    pub const TRAILING: i32 = 0x2;
    /// Merged buckets report the tier's fixed sample count.
    pub const COUNTER_AGGREGATE: i32 = 0x4;
    /// Every flag this version understands.
    pub const ALL: i32 = Self::COLLATED | Self::TRAILING | Self::COUNTER_AGGREGATE;

    /// Creates flags with nothing set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Creates flags from a raw value, keeping unknown bits.
    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    /// Returns the raw value.
    pub fn bits(self) -> i32 {
        self.0
    }

    /// Returns true if bits outside [`FileFlags::ALL`] are set.
    pub fn has_unknown(self) -> bool {
        self.0 & !Self::ALL != 0
    }

    /// Returns true if the collated flag is set.
    pub fn is_collated(self) -> bool {
        self.0 & Self::COLLATED != 0
    }

    /// Returns true if the trailing flag is set.
    pub fn is_trailing(self) -> bool {
        self.0 & Self::TRAILING != 0
    }

    /// Returns true if the counter-aggregate flag is set.
    pub fn is_counter_aggregate(self) -> bool {
        self.0 & Self::COUNTER_AGGREGATE != 0
    }

    /// Returns these flags with `flag` set.
    pub fn with(self, flag: i32) -> Self {
        Self(self.0 | flag)
    }

    /// Returns these flags with `flag` cleared.
    pub fn without(self, flag: i32) -> Self {
        Self(self.0 & !flag)
    }
}

/// Decoded stat file header.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    /// Magic bytes.
    pub magic: [u8; 16],
    /// Size of the header when it was written.
    pub hdr_size: i32,
    /// Seconds per bucket.
    pub cfg_interval: i32,
    /// Mode flags.
    pub flags: FileFlags,
    /// Version that created (or last upgraded) the file.
    pub cr_version: i32,
    /// Minimum version needed to read the file.
    pub rd_version: i32,
    /// Bytes per page; page 0 is the header.
    pub page_size: i64,
    /// Number of bucket pages.
    pub page_count: i64,
    /// Oldest bucket index held by the ring.
    pub first_bucket: i64,
    /// Newest bucket index written.
    pub last_bucket: i64,
    /// Bucket-aligned time of `last_bucket`.
    pub last_time: i64,
    /// Sum of every value merged since the last clear.
    pub cumulative_sum: f64,
    /// Sum of squares merged since the last clear.
    pub cumulative_sum_sq: f64,
    /// Sample count merged since the last clear.
    pub cumulative_count: i64,
    /// Time the cumulative totals were last cleared.
    pub last_cumulative_clear_time: i64,
    /// Time of bucket index zero.
    pub file_create_time: i64,
    /// Free-form unit label.
    pub unit: String,
    /// Path the file was last opened under.
    pub name: String,
    /// Blend factor of trailing files.
    pub lambda: f64,
    /// Season length of trailing files, in seconds.
    pub season: u64,
    /// Count reported by counter-aggregate buckets.
    pub fixed_count: i64,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: FILE_MAGIC,
            hdr_size: HEADER_SIZE as i32,
            cfg_interval: 1,
            flags: FileFlags::default(),
            cr_version: CUR_HDR_VERSION,
            rd_version: RD_HDR_VERSION,
            page_size: 0,
            page_count: 0,
            first_bucket: 0,
            last_bucket: 0,
            last_time: 0,
            cumulative_sum: 0.0,
            cumulative_sum_sq: 0.0,
            cumulative_count: 0,
            last_cumulative_clear_time: 0,
            file_create_time: 0,
            unit: String::new(),
            name: String::new(),
            lambda: 0.0,
            season: 0,
            fixed_count: 0,
        }
    }
}

impl FileHeader {
    /// Returns true if the magic bytes match [`FILE_MAGIC`].
    pub fn has_valid_magic(&self) -> bool {
        self.magic == FILE_MAGIC
    }

    /// Upgrades a header written by an older version in place.
    ///
    /// Returns true if anything changed.
    pub fn refresh(&mut self) -> bool {
        if self.cr_version >= CUR_HDR_VERSION {
            return false;
        }
        if self.cr_version < 5 {
            self.lambda = LEGACY_LAMBDA;
            self.season = LEGACY_SEASON;
        }
        self.cr_version = CUR_HDR_VERSION;
        true
    }

    /// Encodes the header into `buf[..HEADER_SIZE]`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].fill(0);
        buf[0..16].copy_from_slice(&self.magic);
        buf[16..20].copy_from_slice(&self.hdr_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.cfg_interval.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[28..32].copy_from_slice(&self.cr_version.to_le_bytes());
        buf[32..36].copy_from_slice(&self.rd_version.to_le_bytes());
        // 36..40 padding
        buf[40..48].copy_from_slice(&self.page_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.page_count.to_le_bytes());
        buf[56..64].copy_from_slice(&self.first_bucket.to_le_bytes());
        buf[64..72].copy_from_slice(&self.last_bucket.to_le_bytes());
        buf[72..80].copy_from_slice(&self.last_time.to_le_bytes());
        buf[80..88].copy_from_slice(&self.cumulative_sum.to_le_bytes());
        buf[88..96].copy_from_slice(&self.cumulative_sum_sq.to_le_bytes());
        buf[96..104].copy_from_slice(&self.cumulative_count.to_le_bytes());
        buf[104..112].copy_from_slice(&self.last_cumulative_clear_time.to_le_bytes());
        buf[112..120].copy_from_slice(&self.file_create_time.to_le_bytes());
        put_str(&mut buf[120..120 + UNIT_SIZE], &self.unit);
        put_str(&mut buf[184..184 + NAME_SIZE], &self.name);
        buf[440..448].copy_from_slice(&self.lambda.to_le_bytes());
        buf[448..456].copy_from_slice(&self.season.to_le_bytes());
        buf[456..464].copy_from_slice(&self.fixed_count.to_le_bytes());
    }

    /// Decodes a header from `buf[..HEADER_SIZE]`.
    ///
    /// No validation happens here; see [`FileHeader::has_valid_magic`] and
    /// the checks in `StatFile::open`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut magic = [0u8; 16];
        magic.copy_from_slice(&buf[0..16]);

        Self {
            magic,
            hdr_size: le_i32(buf, 16),
            cfg_interval: le_i32(buf, 20),
            flags: FileFlags::from_bits(le_i32(buf, 24)),
            cr_version: le_i32(buf, 28),
            rd_version: le_i32(buf, 32),
            page_size: le_i64(buf, 40),
            page_count: le_i64(buf, 48),
            first_bucket: le_i64(buf, 56),
            last_bucket: le_i64(buf, 64),
            last_time: le_i64(buf, 72),
            cumulative_sum: f64::from_bits(le_u64(buf, 80)),
            cumulative_sum_sq: f64::from_bits(le_u64(buf, 88)),
            cumulative_count: le_i64(buf, 96),
            last_cumulative_clear_time: le_i64(buf, 104),
            file_create_time: le_i64(buf, 112),
            unit: get_str(&buf[120..120 + UNIT_SIZE]),
            name: get_str(&buf[184..184 + NAME_SIZE]),
            lambda: f64::from_bits(le_u64(buf, 440)),
            season: le_u64(buf, 448),
            fixed_count: le_i64(buf, 456),
        }
    }
}

fn le_i32(buf: &[u8], off: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    i32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn le_i64(buf: &[u8], off: usize) -> i64 {
    le_u64(buf, off) as i64
}

/// Writes `s` NUL padded, truncated so at least one NUL remains.
fn put_str(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let mut n = s.len().min(dst.len() - 1);
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FileHeader {
        FileHeader {
            cfg_interval: 10,
            flags: FileFlags::new().with(FileFlags::TRAILING),
            page_size: 8192,
            page_count: 40,
            first_bucket: 3,
            last_bucket: 7,
            last_time: 1_000_000_070,
            cumulative_sum: 14.5,
            cumulative_count: 3,
            file_create_time: 1_000_000_000,
            unit: "ms".to_string(),
            name: "/tmp/x/10s".to_string(),
            lambda: 0.875,
            season: 3600,
            fixed_count: 6,
            ..FileHeader::default()
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(&buf[0..16], &FILE_MAGIC);
        assert_eq!(FileHeader::decode(&buf), header);
    }

    #[test]
    fn test_header_field_offsets() {
        let header = sample_header();
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(le_i32(&buf, 16), HEADER_SIZE as i32);
        assert_eq!(le_i32(&buf, 20), 10);
        assert_eq!(le_i64(&buf, 40), 8192);
        assert_eq!(le_i64(&buf, 112), 1_000_000_000);
        assert_eq!(&buf[120..122], b"ms");
        assert_eq!(buf[122], 0);
        assert_eq!(le_u64(&buf, 448), 3600);
    }

    #[test]
    fn test_long_name_truncated_with_nul() {
        let header = FileHeader {
            name: "n".repeat(400),
            ..FileHeader::default()
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(buf[184 + NAME_SIZE - 1], 0);
        assert_eq!(FileHeader::decode(&buf).name.len(), NAME_SIZE - 1);
    }

    #[test]
    fn test_refresh_upgrades_old_headers() {
        let mut header = FileHeader {
            cr_version: 4,
            ..FileHeader::default()
        };
        assert!(header.refresh());
        assert_eq!(header.lambda, LEGACY_LAMBDA);
        assert_eq!(header.season, LEGACY_SEASON);
        assert_eq!(header.cr_version, CUR_HDR_VERSION);

        let mut v6 = FileHeader {
            cr_version: 6,
            lambda: 0.5,
            ..FileHeader::default()
        };
        assert!(v6.refresh());
        assert_eq!(v6.lambda, 0.5);
        assert!(!v6.refresh());
    }

    #[test]
    fn test_flags() {
        let flags = FileFlags::new()
            .with(FileFlags::COLLATED)
            .with(FileFlags::COUNTER_AGGREGATE);
        assert!(flags.is_collated());
        assert!(flags.is_counter_aggregate());
        assert!(!flags.is_trailing());
        assert!(!flags.without(FileFlags::COLLATED).is_collated());
        assert!(FileFlags::from_bits(0x10).has_unknown());
        assert!(!flags.has_unknown());
    }
}
