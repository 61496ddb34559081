// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Throughput benchmarks for the shm-backed cache.
//
// Run with:
//   cargo bench --bench cache
//
// Groups:
//   set_miss   — set() on a key never seen before, at three value sizes
//   set_hit    — set() overwriting an existing key in place
//   get_hit    — get() on a present key
//   get_miss   — get() on an absent key

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmcache::{CacheConfig, OpenMode, ShmCache, ShmHandle};

const SMALL: usize = 48;
const MEDIUM: usize = 4096;
const LARGE: usize = 65536;

const SIZES: &[(&str, usize)] = &[
    ("small_48", SMALL),
    ("medium_4096", MEDIUM),
    ("large_65536", LARGE),
];

fn open_bench_cache(name: &str) -> ShmCache {
    ShmHandle::unlink_by_name(name);
    let config = CacheConfig::new(name).with_mode(OpenMode::CreateOrAttach);
    ShmCache::open(&config).expect("open bench cache")
}

fn bench_set_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_miss");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let cache = open_bench_cache("shmcache_bench_set_miss");
            let value = vec![0xABu8; sz];
            let mut i: u64 = 0;
            b.iter(|| {
                let key = format!("key-{i}");
                i += 1;
                cache.set(key.as_bytes(), black_box(&value)).unwrap();
            });
            cache.destroy();
        });
    }

    group.finish();
}

fn bench_set_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_hit");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let cache = open_bench_cache("shmcache_bench_set_hit");
            let value = vec![0xABu8; sz];
            cache.set(b"steady-key", &value).unwrap();
            b.iter(|| {
                cache.set(b"steady-key", black_box(&value)).unwrap();
            });
            cache.destroy();
        });
    }

    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let cache = open_bench_cache("shmcache_bench_get_hit");
            let value = vec![0xABu8; sz];
            cache.set(b"steady-key", &value).unwrap();
            b.iter(|| {
                black_box(cache.get(b"steady-key"));
            });
            cache.destroy();
        });
    }

    group.finish();
}

fn bench_get_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_miss");
    group.throughput(Throughput::Elements(1));

    group.bench_function("absent_key", |b| {
        let cache = open_bench_cache("shmcache_bench_get_miss");
        b.iter(|| {
            black_box(cache.get(b"never-set"));
        });
        cache.destroy();
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set_miss,
    bench_set_hit,
    bench_get_hit,
    bench_get_miss,
);
criterion_main!(benches);
