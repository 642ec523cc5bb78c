//! Retention tiers of a counter.
//!
//! A policy is an ordered list of tiers, finest first. Each tier becomes one
//! stat file. The textual form is a comma separated list of
//! `interval:span[:name[:lambda]]`, for example:
//!
//! ```text
//! 10s:1d,5m:2w,1h:1y,1h:1w:weekly:0.9
//! ```
//!
//! Durations are sums of `<number><unit>` terms with units `s`, `m`, `h`,
//! `d`, `w` and `y` (365 days), e.g. `1h30m`. A tier with a lambda is a
//! trailing tier whose season is its whole span.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StatError};

/// One retention tier.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionInterval {
    /// Bucket width.
    pub interval: Duration,
    /// Number of buckets kept.
    pub samples: u64,
    /// File name of the tier inside the counter directory.
    pub name: String,
    /// Trailing blend factor; 0 for a regular tier.
    pub lambda: f64,
}

impl RetentionInterval {
    /// Bucket width in seconds.
    pub fn interval_secs(&self) -> i64 {
        self.interval.as_secs() as i64
    }

    /// Returns true for a trailing tier.
    pub fn is_trailing(&self) -> bool {
        self.lambda > 0.0
    }

    /// Time covered by the tier, which is also the season of a trailing tier.
    pub fn span(&self) -> Duration {
        self.interval.saturating_mul(self.samples.min(u64::from(u32::MAX)) as u32)
    }
}

impl fmt::Display for RetentionInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interval = format_duration(self.interval.as_secs());
        write!(
            f,
            "{}:{}",
            interval,
            format_duration(self.interval.as_secs().saturating_mul(self.samples))
        )?;
        if self.is_trailing() {
            write!(f, ":{}:{}", self.name, self.lambda)
        } else if self.name != interval {
            write!(f, ":{}", self.name)
        } else {
            Ok(())
        }
    }
}

/// Ordered list of retention tiers, finest first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetentionPolicy {
    intervals: Vec<RetentionInterval>,
}

impl RetentionPolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma separated list of tiers.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::InvalidRetention`] if any tier is malformed or
    /// out of order.
    pub fn parse(text: &str) -> Result<Self> {
        let mut policy = Self::new();
        policy.add_intervals(text)?;
        Ok(policy)
    }

    /// Appends a regular tier.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::InvalidRetention`] if the interval is zero, no
    /// samples are kept, the interval is not longer than the previous tier,
    /// a trailing tier was already added, or the name is taken.
    pub fn add_interval(
        &mut self,
        interval: Duration,
        samples: u64,
        name: impl Into<String>,
    ) -> Result<()> {
        if let Some(last) = self.intervals.last() {
            if last.is_trailing() {
                return Err(StatError::InvalidRetention(
                    "trailing intervals must be specified after regular intervals".to_string(),
                ));
            }
        }
        self.push(RetentionInterval {
            interval,
            samples,
            name: name.into(),
            lambda: 0.0,
        })
    }

    /// Appends a trailing tier.
    ///
    /// # Errors
    ///
    /// As [`RetentionPolicy::add_interval`], except that trailing tiers need
    /// not be longer than the tier before them, and if `lambda` is not in
    /// (0,1).
    pub fn add_trailing_interval(
        &mut self,
        interval: Duration,
        samples: u64,
        name: impl Into<String>,
        lambda: f64,
    ) -> Result<()> {
        if !(lambda > 0.0 && lambda < 1.0) {
            return Err(StatError::InvalidRetention(format!(
                "lambda must be > 0 and < 1: {}",
                lambda
            )));
        }
        self.push(RetentionInterval {
            interval,
            samples,
            name: name.into(),
            lambda,
        })
    }

    fn push(&mut self, ri: RetentionInterval) -> Result<()> {
        if ri.interval.as_secs() == 0 {
            return Err(StatError::InvalidRetention(format!(
                "interval cannot be 0: {}",
                ri.name
            )));
        }
        if ri.samples == 0 {
            return Err(StatError::InvalidRetention(format!(
                "interval samples cannot be 0: {}",
                ri.name
            )));
        }
        if !ri.is_trailing() {
            if let Some(last) = self.intervals.last() {
                if last.interval >= ri.interval {
                    return Err(StatError::InvalidRetention(format!(
                        "each retention interval must be longer than the previous: {}",
                        ri.name
                    )));
                }
            }
        }
        if self.intervals.iter().any(|other| other.name == ri.name) {
            return Err(StatError::InvalidRetention(format!(
                "retention interval names must be unique: {}",
                ri.name
            )));
        }
        self.intervals.push(ri);
        Ok(())
    }

    /// Parses and appends one `interval:span[:name[:lambda]]` tier.
    ///
    /// # Errors
    ///
    /// Returns [`StatError::InvalidRetention`] for malformed text or an
    /// out-of-order tier.
    pub fn add_interval_str(&mut self, text: &str) -> Result<()> {
        let mut parts = text.trim().splitn(4, ':');
        let interval_text = parts.next().unwrap_or_default();
        let span_text = parts.next().ok_or_else(|| {
            StatError::InvalidRetention(format!(
                "must specify at least interval:retention: {}",
                text
            ))
        })?;
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => interval_text.to_string(),
        };

        let interval = parse_duration(interval_text)?;
        let span = parse_duration(span_text)?;
        if interval.as_secs() == 0 {
            return Err(StatError::InvalidRetention(format!(
                "interval cannot be 0: {}",
                interval_text
            )));
        }
        let samples = span.as_secs() / interval.as_secs();

        match parts.next() {
            Some(lambda_text) if !lambda_text.is_empty() => {
                let lambda = lambda_text.parse::<f64>().map_err(|_| {
                    StatError::InvalidRetention(format!("bad lambda '{}'", lambda_text))
                })?;
                self.add_trailing_interval(interval, samples, name, lambda)
            }
            _ => self.add_interval(interval, samples, name),
        }
    }

    /// Parses and appends a comma separated list of tiers.
    ///
    /// # Errors
    ///
    /// See [`RetentionPolicy::add_interval_str`].
    pub fn add_intervals(&mut self, text: &str) -> Result<()> {
        for part in text.split(',').filter(|p| !p.trim().is_empty()) {
            self.add_interval_str(part)?;
        }
        Ok(())
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Returns true if there are no tiers.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Tier at `index`.
    pub fn get(&self, index: usize) -> Option<&RetentionInterval> {
        self.intervals.get(index)
    }

    /// Iterates over the tiers, finest first.
    pub fn iter(&self) -> std::slice::Iter<'_, RetentionInterval> {
        self.intervals.iter()
    }
}

impl FromStr for RetentionPolicy {
    type Err = StatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ri) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", ri)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a RetentionPolicy {
    type Item = &'a RetentionInterval;
    type IntoIter = std::slice::Iter<'a, RetentionInterval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

const UNITS: [(char, u64); 6] = [
    ('y', 365 * 86_400),
    ('w', 7 * 86_400),
    ('d', 86_400),
    ('h', 3600),
    ('m', 60),
    ('s', 1),
];

/// Parses a duration such as `10s`, `5m` or `1h30m`.
///
/// # Errors
///
/// Returns [`StatError::InvalidRetention`] for empty text, a number without
/// a unit, or an unknown unit.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let bad = || StatError::InvalidRetention(format!("bad duration '{}'", text));
    let text = text.trim();
    if text.is_empty() {
        return Err(bad());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let scale = UNITS
            .iter()
            .find(|(unit, _)| *unit == c.to_ascii_lowercase())
            .map(|(_, scale)| *scale)
            .ok_or_else(bad)?;
        let n: u64 = digits.parse().map_err(|_| bad())?;
        total = n
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(bad)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(bad());
    }
    Ok(Duration::from_secs(total))
}

/// Formats seconds as the shortest composed duration, e.g. `1h30m`.
pub fn format_duration(mut secs: u64) -> String {
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, scale) in UNITS {
        // weeks only when they divide evenly
        if unit == 'w' && secs % scale != 0 {
            continue;
        }
        if secs >= scale {
            out.push_str(&format!("{}{}", secs / scale, unit));
            secs %= scale;
        }
    }
    out
}
