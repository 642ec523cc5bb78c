//! Benchmarks for Istat storage components.
//!
//! Run with: cargo bench --package alopex-istat
//!
//! ## Benchmark Categories
//!
//! - **StatFile**: bucket updates and ring reads
//! - **StatCounter**: direct and collated record paths, select
//! - **StatStore**: end-to-end record with rollups, glob listing

use alopex_istat::counter::{RetentionPolicy, StatCounter};
use alopex_istat::file::{Bucket, StatFile, StatFileSettings};
use alopex_istat::store::{pattern_match, StatStore, StoreConfig};
use alopex_istat::{ManualClock, StorageEnv};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

const T0: i64 = 1_000_000_200;

fn bench_env() -> StorageEnv {
    StorageEnv::new().with_clock(Arc::new(ManualClock::new(T0 + 86_400)))
}

fn bench_file_update(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let env = bench_env();
    let settings = StatFileSettings::new(10, 8640).with_zero_time(T0);
    let mut file = StatFile::create(temp_dir.path().join("10s"), &settings, &env).unwrap();

    let mut group = c.benchmark_group("stat_file");
    group.throughput(Throughput::Elements(1));
    let mut t = T0;
    group.bench_function("update_bucket", |b| {
        b.iter(|| {
            t += 3;
            file.update_bucket(black_box(&Bucket::new(1.0, 1.0, 1.0, 1.0, 1, t)))
                .unwrap()
        })
    });

    let mut out = vec![Bucket::default(); 360];
    group.throughput(Throughput::Elements(out.len() as u64));
    group.bench_function("read_buckets_360", |b| {
        b.iter(|| file.read_buckets(black_box(&mut out), 0).unwrap())
    });
    group.finish();
}

fn bench_counter_record(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let env = bench_env();
    let policy = RetentionPolicy::parse("10s:1d,5m:1y,1h:5y").unwrap();

    let mut group = c.benchmark_group("stat_counter");
    group.throughput(Throughput::Elements(1));
    for collated in [false, true] {
        let name = if collated { "collated" } else { "direct" };
        let mut counter =
            StatCounter::open(temp_dir.path().join(name), collated, T0, &policy, &env).unwrap();
        let mut i = 0i64;
        group.bench_with_input(BenchmarkId::new("record", name), &collated, |b, _| {
            b.iter(|| {
                i += 1;
                let t = T0 + 86_400 - 40 + (i % 40);
                counter.record(black_box(t), 2.0, 4.0, 2.0, 2.0, 1).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_counter_select(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let env = bench_env();
    let policy = RetentionPolicy::parse("10s:1d,5m:1y").unwrap();
    let mut counter = StatCounter::open(temp_dir.path().join("c"), false, T0, &policy, &env).unwrap();
    for i in 0..8640 {
        counter
            .record(T0 + i * 10, 1.0, 1.0, 1.0, 1.0, 1)
            .unwrap();
    }

    let mut group = c.benchmark_group("select");
    for max_samples in [0usize, 100, 1] {
        group.bench_with_input(
            BenchmarkId::new("day", max_samples),
            &max_samples,
            |b, &max| b.iter(|| counter.select(T0, T0 + 86_400, false, black_box(max)).unwrap()),
        );
    }
    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::new(
        temp_dir.path().join("db"),
        RetentionPolicy::parse("10s:1d,5m:1y").unwrap(),
    )
    .with_aggregate_count(2);
    let store = StatStore::open(config, bench_env()).unwrap();
    let names: Vec<String> = (0..100).map(|i| format!("web.host{}.req{}", i % 10, i)).collect();
    for name in &names {
        store.record_value(name, T0 + 86_400, 1.0).unwrap();
    }

    let mut group = c.benchmark_group("stat_store");
    group.throughput(Throughput::Elements(1));
    let mut i = 0usize;
    group.bench_function("record_with_rollups", |b| {
        b.iter(|| {
            i = (i + 1) % names.len();
            store
                .record_value(black_box(&names[i]), T0 + 86_400, 1.0)
                .unwrap()
        })
    });
    group.bench_function("list_matching", |b| {
        b.iter(|| store.list_matching_counters(black_box("web.?.req1*")))
    });
    group.bench_function("pattern_match", |b| {
        b.iter(|| pattern_match(black_box("web.host3.req13.latency"), black_box("web.*.req1?.*")))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_file_update,
    bench_counter_record,
    bench_counter_select,
    bench_store
);
criterion_main!(benches);
