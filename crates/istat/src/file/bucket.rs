//! Aggregate sample value stored in every ring-buffer slot.
//!
//! ## On-disk record (32 bytes, little endian)
//!
//! ```text
//! ┌──────────┬──────────┬────────┬────────┬──────────┬──────────┐
//! │ time i64 │ sum f64  │ min f32│ max f32│ count i32│ sum_sq f32│
//! │  0..8    │  8..16   │ 16..20 │ 20..24 │  24..28  │  28..32  │
//! └──────────┴──────────┴────────┴────────┴──────────┴──────────┘
//! ```
//!
//! A bucket with `count == 0` is empty. Slots are never cleared eagerly, so a
//! stored bucket is only meaningful when its `time` matches the slot's
//! expected time.

/// Size of one encoded bucket in bytes.
pub const BUCKET_SIZE: usize = 32;

/// One aggregated sample slot for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bucket {
    time: i64,
    sum: f64,
    min: f32,
    max: f32,
    count: i32,
    sum_sq: f32,
}

impl Bucket {
    /// Creates a bucket from its aggregate parts.
    pub fn new(sum: f64, sum_sq: f64, min: f64, max: f64, count: i32, time: i64) -> Self {
        Self {
            time,
            sum,
            min: min as f32,
            max: max as f32,
            count,
            sum_sq: sum_sq as f32,
        }
    }

    /// Creates an empty bucket stamped with `time`.
    pub fn empty_at(time: i64) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Returns a copy of this bucket with a different time.
    pub fn retimed(&self, time: i64) -> Self {
        Self { time, ..*self }
    }

    /// Bucket-aligned unix time.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Sum of all samples.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Sum of squares of all samples.
    pub fn sum_sq(&self) -> f32 {
        self.sum_sq
    }

    /// Smallest sample.
    pub fn min(&self) -> f32 {
        self.min
    }

    /// Largest sample.
    pub fn max(&self) -> f32 {
        self.max
    }

    /// Number of samples.
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Returns true if no sample has been merged in.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Overrides the sample count.
    pub fn set_count(&mut self, count: i32) {
        self.count = count;
    }

    /// Mean of the samples, or 0 for an empty bucket.
    pub fn avg(&self) -> f64 {
        if self.count > 0 {
            self.sum / f64::from(self.count)
        } else {
            0.0
        }
    }

    /// Sample standard deviation.
    ///
    /// Cancellation can push the variance numerator slightly below zero; it
    /// is clamped.
    pub fn sdev(&self) -> f32 {
        if self.count < 2 {
            return 0.0;
        }
        let n = f64::from(self.count);
        let diff = (n * f64::from(self.sum_sq) - self.sum * self.sum).max(0.0);
        (diff / (n * (n - 1.0))).sqrt() as f32
    }

    /// Merges `other` into this bucket, replacing it if this one is empty.
    pub fn update(&mut self, other: &Bucket) {
        if self.count == 0 {
            *self = *other;
        } else {
            self.sum += other.sum;
            self.sum_sq += other.sum_sq;
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
            self.count += other.count;
        }
    }

    /// Blends `self * lambda + other * (1 - lambda)` element-wise.
    ///
    /// The count rounds half up and never drops below one. The result takes
    /// `other`'s time.
    pub fn exp_update(&mut self, other: &Bucket, lambda: f64) {
        if self.count == 0 {
            *self = *other;
            return;
        }
        let me = lambda;
        let you = 1.0 - lambda;
        self.sum = self.sum * me + other.sum * you;
        self.sum_sq = (f64::from(self.sum_sq) * me + f64::from(other.sum_sq) * you) as f32;
        self.min = (f64::from(self.min) * me + f64::from(other.min) * you) as f32;
        self.max = (f64::from(self.max) * me + f64::from(other.max) * you) as f32;
        let count = (f64::from(self.count) * me + f64::from(other.count) * you + 0.5) as i32;
        self.count = count.max(1);
        self.time = other.time;
    }

    /// Accumulates one event value into a collated bucket.
    ///
    /// A collated bucket always reports a single sample whose value is the
    /// running sum.
    pub fn collated_update(&mut self, value: f64, time: i64) {
        if self.count == 0 {
            self.time = time;
        }
        self.sum += value;
        self.min = self.sum as f32;
        self.max = self.sum as f32;
        self.sum_sq = (self.sum * self.sum) as f32;
        self.count = 1;
    }

    /// Encodes the bucket into `buf[..BUCKET_SIZE]`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sum.to_le_bytes());
        buf[16..20].copy_from_slice(&self.min.to_le_bytes());
        buf[20..24].copy_from_slice(&self.max.to_le_bytes());
        buf[24..28].copy_from_slice(&self.count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.sum_sq.to_le_bytes());
    }

    /// Decodes a bucket from `buf[..BUCKET_SIZE]`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut b8 = [0u8; 8];
        let mut b4 = [0u8; 4];

        b8.copy_from_slice(&buf[0..8]);
        let time = i64::from_le_bytes(b8);
        b8.copy_from_slice(&buf[8..16]);
        let sum = f64::from_le_bytes(b8);
        b4.copy_from_slice(&buf[16..20]);
        let min = f32::from_le_bytes(b4);
        b4.copy_from_slice(&buf[20..24]);
        let max = f32::from_le_bytes(b4);
        b4.copy_from_slice(&buf[24..28]);
        let count = i32::from_le_bytes(b4);
        b4.copy_from_slice(&buf[28..32]);
        let sum_sq = f32::from_le_bytes(b4);

        Self {
            time,
            sum,
            min,
            max,
            count,
            sum_sq,
        }
    }
}
