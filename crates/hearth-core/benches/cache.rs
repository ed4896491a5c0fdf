//! Expiring cache benchmarks.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hearth_core::{CacheConfig, CacheKey, ExpiringCache, TtlTable};

fn populated(size: usize) -> (ExpiringCache<u64>, Vec<CacheKey>) {
    let config = CacheConfig::new()
        .with_max_entries(size)
        .with_ttl_table(TtlTable::new(Duration::from_secs(3600)));
    let cache = ExpiringCache::new(config);

    let keys: Vec<CacheKey> = (0..size)
        .map(|i| CacheKey::new(format!("fam{}", i % 16), format!("kind{i}")).unwrap())
        .collect();
    for (i, key) in keys.iter().enumerate() {
        cache.set(key.clone(), i as u64, None);
    }

    (cache, keys)
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/get");

    for size in [16, 128, 512] {
        let (cache, keys) = populated(size);
        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(cache.get(&keys[i]));
            });
        });

        let missing = CacheKey::new("nobody", "nothing").unwrap();
        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, _| {
            b.iter(|| {
                black_box(cache.get(&missing));
            });
        });
    }

    group.finish();
}

fn bench_set_at_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache/evict");

    // Every insert is a new key at capacity, so every insert pays the O(n)
    // oldest-entry scan.
    for size in [16, 128, 512] {
        let (cache, _) = populated(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let key = CacheKey::new("bench", format!("new{i}")).unwrap();
                cache.set(key, i, None);
            });
        });
    }

    group.finish();
}

fn bench_invalidate_scope(c: &mut Criterion) {
    c.bench_function("cache/invalidate_scope", |b| {
        b.iter_batched(
            || populated(256).0,
            |cache| {
                black_box(cache.invalidate_scope("fam3"));
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_get, bench_set_at_capacity, bench_invalidate_scope);
criterion_main!(benches);
