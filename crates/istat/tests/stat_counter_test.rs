//! Integration tests for counters over several retention tiers.

use alopex_istat::counter::{RecordOutcome, RetentionPolicy, StatCounter};
use alopex_istat::file::Bucket;
use alopex_istat::{AtomicStats, ManualClock, Stat, StorageEnv};
use std::sync::Arc;
use tempfile::TempDir;

/// Aligned to both 10s and 5m.
const T0: i64 = 999_900;

struct Fixture {
    temp_dir: TempDir,
    clock: Arc<ManualClock>,
    stats: Arc<AtomicStats>,
    env: StorageEnv,
}

impl Fixture {
    fn new(now: i64) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let stats = Arc::new(AtomicStats::new());
        let env = StorageEnv::new()
            .with_clock(clock.clone())
            .with_stats(stats.clone());
        Self {
            temp_dir: TempDir::new().unwrap(),
            clock,
            stats,
            env,
        }
    }

    fn open(&self, name: &str, collated: bool, policy: &str) -> StatCounter {
        let policy = RetentionPolicy::parse(policy).unwrap();
        StatCounter::open(self.temp_dir.path().join(name), collated, T0, &policy, &self.env)
            .unwrap()
    }
}

fn record_value(counter: &mut StatCounter, time: i64, v: f64) -> RecordOutcome {
    counter.record(time, v, v * v, v, v, 1).unwrap()
}

fn read_slot(counter: &StatCounter, tier: usize, index: i64) -> Bucket {
    let mut out = [Bucket::default(); 1];
    counter
        .tier(tier)
        .unwrap()
        .read_buckets(&mut out, index)
        .unwrap();
    out[0]
}

#[test]
fn test_gauge_writes_every_tier_and_selects() {
    let fx = Fixture::new(T0 + 100);
    let mut counter = fx.open("load", false, "10s:1h,5m:1d");
    assert!(!counter.is_collated());
    assert_eq!(counter.tier_count(), 2);
    assert_eq!(counter.tier_name(1), Some("5m"));

    assert!(record_value(&mut counter, T0 + 5, 1.0).is_accepted());
    assert!(record_value(&mut counter, T0 + 15, 3.0).is_accepted());

    let coarse = read_slot(&counter, 1, 0);
    assert_eq!(coarse.time(), T0);
    assert_eq!(coarse.sum(), 4.0);
    assert_eq!(coarse.count(), 2);

    let selection = counter.select(T0, T0 + 20, false, 0).unwrap();
    assert_eq!(selection.interval, 10);
    assert_eq!(selection.buckets.len(), 2);
    assert_eq!(selection.buckets[0].time(), T0);
    assert_eq!(selection.buckets[0].sum(), 1.0);
    assert_eq!(selection.buckets[1].time(), T0 + 10);
    assert_eq!(selection.buckets[1].sum(), 3.0);

    let single = counter.select(T0, T0 + 20, false, 1).unwrap();
    assert_eq!(single.interval, 20);
    assert_eq!(single.buckets.len(), 1);
    assert_eq!(single.buckets[0].sum(), 4.0);
    assert_eq!(single.buckets[0].count(), 2);
}

#[test]
fn test_gauge_end_to_end_select() {
    const E: i64 = 1_000_000_000;
    let fx = Fixture::new(E + 30);
    let policy = RetentionPolicy::parse("10s:1h,5m:1d").unwrap();
    let mut counter =
        StatCounter::open(fx.temp_dir.path().join("gauge"), false, E, &policy, &fx.env).unwrap();

    for t in [E, E + 10, E + 20] {
        assert_eq!(record_value(&mut counter, t, 1.0), RecordOutcome::Accepted);
    }

    let selection = counter.select(E + 10, E + 22, false, 0).unwrap();
    assert_eq!(selection.interval, 10);
    assert_eq!(selection.start, E + 10);
    assert_eq!(selection.end, E + 30);
    let times: Vec<i64> = selection.buckets.iter().map(|b| b.time()).collect();
    assert_eq!(times, vec![E + 10, E + 20]);
    assert!(selection.buckets.iter().all(|b| b.sum() == 1.0 && b.count() == 1));
}

#[test]
fn test_select_reduces_to_max_samples() {
    // aligned to 120s
    let start = T0 + 60;
    let fx = Fixture::new(start + 1800);
    let mut counter = fx.open("load", false, "10s:1h,5m:1d");
    for i in 0..180 {
        assert!(record_value(&mut counter, start + i * 10, 1.0).is_accepted());
    }

    let full = counter.select(start, start + 1800, false, 0).unwrap();
    assert_eq!(full.interval, 10);
    assert_eq!(full.buckets.len(), 180);

    // 180 raw buckets, ladder 20, 30, 60 still too many, 120 gives 15
    let reduced = counter.select(start, start + 1800, false, 20).unwrap();
    assert_eq!(reduced.interval, 120);
    assert_eq!(reduced.start, start);
    assert_eq!(reduced.end, start + 1800);
    assert_eq!(reduced.buckets.len(), 15);
    for (k, b) in reduced.buckets.iter().enumerate() {
        assert_eq!(b.time(), start + k as i64 * 120);
        assert_eq!(b.sum(), 12.0);
        assert_eq!(b.count(), 12);
    }
}

#[test]
fn test_select_moves_to_coarser_tier() {
    let start = T0 + 60;
    let fx = Fixture::new(start + 7200);
    let mut counter = fx.open("load", false, "10s:1h,5m:1d");
    for i in 0..720 {
        assert!(record_value(&mut counter, start + i * 10, 1.0).is_accepted());
    }
    let finest = counter.tier(0).unwrap();
    assert!(!finest.is_bucket_index_in_file(finest.map_time_to_bucket_index(start, false)));
    assert_eq!(counter.pick_stat_file(start, start + 3600).tier, Some(1));

    let selection = counter.select(start, start + 3600, false, 20).unwrap();
    assert_eq!(selection.interval, 300);
    assert_eq!(selection.start, T0);
    assert_eq!(selection.buckets.len(), 13);
    assert_eq!(selection.buckets[0].time(), T0);
    assert_eq!(selection.buckets[0].count(), 24);
    assert_eq!(selection.buckets[1].count(), 30);

    for max_samples in [2usize, 5, 10, 20] {
        let selection = counter.select(start, start + 7200, false, max_samples).unwrap();
        assert!(selection.interval >= 300);
        assert!(
            selection.buckets.len() <= max_samples,
            "{} buckets for max {}",
            selection.buckets.len(),
            max_samples
        );
        let total: i32 = selection.buckets.iter().map(|b| b.count()).sum();
        assert_eq!(total, 720);
    }
}

#[test]
fn test_select_defaults_to_recent_window() {
    let fx = Fixture::new(T0 + 100);
    let mut counter = fx.open("load", false, "10s:1h,5m:1d");
    record_value(&mut counter, T0 + 5, 1.0);
    record_value(&mut counter, T0 + 15, 3.0);

    let selection = counter.select(0, 0, false, 0).unwrap();
    assert_eq!(selection.start, T0 + 100 - 900);
    assert_eq!(selection.end, T0 + 100);
    assert_eq!(selection.buckets.len(), 2);

    let backwards = counter.select(T0 + 50, T0, false, 0).unwrap();
    assert!(backwards.buckets.is_empty());
}

#[test]
fn test_rejections_are_outcomes() {
    let fx = Fixture::new(T0 + 100);
    let mut counter = fx.open("load", false, "10s:1h");

    assert_eq!(
        record_value(&mut counter, T0 + 100 + 61, 1.0),
        RecordOutcome::FromFuture
    );
    assert_eq!(
        counter.record(T0, 1.0, 1.0, 1.0, 1.0, 0).unwrap(),
        RecordOutcome::Empty
    );
    assert_eq!(
        counter.record(T0, 3.0, 9.0, 5.0, 1.0, 1).unwrap(),
        RecordOutcome::BadRange
    );
    assert_eq!(fx.stats.get(Stat::FromFuture), 1);
    assert_eq!(fx.stats.get(Stat::Rejected), 2);
    assert!(read_slot(&counter, 0, 0).is_empty());
}

#[test]
fn test_collated_events_sum_per_interval() {
    let fx = Fixture::new(T0 + 100);
    let mut counter = fx.open("hits", true, "10s:1h,5m:1d");
    assert!(counter.is_collated());
    assert_eq!(counter.collation_interval(), 10);

    for _ in 0..3 {
        assert!(record_value(&mut counter, T0 + 50, 1.0).is_accepted());
    }
    // written through on the first and second event only
    assert_eq!(read_slot(&counter, 0, 5).sum(), 2.0);

    counter.force_flush().unwrap();
    let fine = read_slot(&counter, 0, 5);
    assert_eq!(fine.time(), T0 + 50);
    assert_eq!(fine.sum(), 3.0);
    assert_eq!(fine.count(), 1);

    let coarse = read_slot(&counter, 1, 0);
    assert_eq!(coarse.sum(), 3.0);
    assert_eq!(coarse.count(), 30);

    let selection = counter.select(T0 + 10, T0 + 60, false, 0).unwrap();
    assert_eq!(selection.buckets.len(), 5);
    assert_eq!(selection.buckets[4].sum(), 3.0);
    let earlier: f64 = selection.buckets[..4].iter().map(|b| b.sum()).sum();
    assert_eq!(earlier, 0.0);

    assert_eq!(
        record_value(&mut counter, T0 + 100 + 11, 1.0),
        RecordOutcome::FromFuture
    );
    assert_eq!(record_value(&mut counter, T0, 1.0), RecordOutcome::FromPast);
    assert_eq!(fx.stats.get(Stat::FromPast), 1);
}

#[test]
fn test_collated_flag_survives_reopen() {
    let fx = Fixture::new(T0 + 100);
    {
        let mut counter = fx.open("hits", true, "10s:1h,5m:1d");
        record_value(&mut counter, T0 + 50, 2.0);
    }
    let counter = fx.open("hits", false, "10s:1h,5m:1d");
    assert!(counter.is_collated());
    assert_eq!(read_slot(&counter, 0, 5).sum(), 2.0);
    assert_eq!(fx.stats.get(Stat::CounterCreated), 1);
}

#[test]
fn test_trailing_tier_blends_seasons() {
    let fx = Fixture::new(10_000);
    let policy = RetentionPolicy::parse("10s:1h,1m:1h:ma-1h:0.875").unwrap();
    let mut counter =
        StatCounter::open(fx.temp_dir.path().join("ma"), false, 10_000, &policy, &fx.env)
            .unwrap();

    for (t, v) in [(10_000, 1.0), (13_600, 2.0), (13_660, 2.0)] {
        fx.clock.set(t);
        assert!(record_value(&mut counter, t, v).is_accepted());
        counter.flush().unwrap();
    }
    fx.clock.set(13_720);
    assert_eq!(
        counter.record(13_720, 0.0, 0.0, 0.0, 0.0, 0).unwrap(),
        RecordOutcome::Empty
    );

    let selection = counter.select(13_720 - 3600, 13_720, true, 100).unwrap();
    assert_eq!(selection.interval, 60);
    assert_eq!(selection.buckets.len(), 1);
    assert_eq!(selection.buckets[0].time(), 13_560);
    assert_eq!(selection.buckets[0].sum(), 1.0 * 0.875 + 2.0 * 0.125);
}

#[test]
fn test_purge_moves_files_to_backup() {
    let fx = Fixture::new(T0 + 100);
    let root = fx.temp_dir.path().join("db");
    let policy = RetentionPolicy::parse("10s:1h,5m:1d").unwrap();
    let dir = root.join("web").join("req");
    let mut counter = StatCounter::open(&dir, false, T0, &policy, &fx.env).unwrap();
    record_value(&mut counter, T0 + 5, 1.0);

    counter.purge(&root).unwrap();
    assert!(!dir.exists());
    let backup = fx.temp_dir.path().join("db.bak").join("web").join("req");
    assert!(backup.join("10s").is_file());
    assert!(backup.join("5m").is_file());
    assert_eq!(fx.stats.get(Stat::CounterClosed), 1);
}
