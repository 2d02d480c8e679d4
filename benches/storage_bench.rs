//! Benchmarks for indexio storage
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use indexio::index::{KeyToValueContainerStore, StoreOptions};
use indexio::storage::*;
use std::sync::Arc;
use tempfile::tempdir;

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("symbol_{:08}", i)).collect()
}

fn bench_enumerator(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumerator");

    for size in [1_000, 10_000] {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("enumerate_new", size), &keys, |b, keys| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let enumerator = Enumerator::open(
                        dir.path().join("bench"),
                        KeyRepresentation::indirect(StringDescriptor),
                        &EnumeratorOptions::default(),
                        None,
                    )
                    .unwrap();
                    (dir, enumerator)
                },
                |(_dir, enumerator)| {
                    for key in keys {
                        black_box(enumerator.enumerate(key).unwrap());
                    }
                },
            )
        });

        let dir = tempdir().unwrap();
        let cache = Arc::new(EnumerationCache::new(size));
        let enumerator = Enumerator::open(
            dir.path().join("bench"),
            KeyRepresentation::indirect(StringDescriptor),
            &EnumeratorOptions::default(),
            Some(cache),
        )
        .unwrap();
        for key in &keys {
            enumerator.enumerate(key).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("try_enumerate_cached", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(enumerator.try_enumerate(key).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_value_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_log");
    let payload = vec![0x5Au8; 256];

    for compression in [false, true] {
        let name = if compression { "compressed" } else { "plain" };

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(format!("append_{}", name), |b| {
            let dir = tempdir().unwrap();
            let mut log = ValueLog::open(
                dir.path().join("values"),
                CreationOptions::default().with_compression(compression),
            )
            .unwrap();
            b.iter(|| log.append_bytes(black_box(&payload), 0).unwrap());
        });

        group.bench_function(format!("read_chain_of_8_{}", name), |b| {
            let dir = tempdir().unwrap();
            let mut log = ValueLog::open(
                dir.path().join("values"),
                CreationOptions::default().with_compression(compression),
            )
            .unwrap();
            let mut tail = 0;
            for _ in 0..8 {
                tail = log.append_bytes(&payload[..32], tail).unwrap();
            }
            log.force().unwrap();
            b.iter(|| black_box(log.read_bytes(tail).unwrap()));
        });
    }

    group.finish();
}

fn bench_container_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_store");
    let keys = keys(2_000);

    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("add_and_flush_2000", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let store: KeyToValueContainerStore<String, u32> = KeyToValueContainerStore::open(
                    dir.path().join("store"),
                    KeyRepresentation::indirect(StringDescriptor),
                    Arc::new(U32Externalizer),
                    StoreOptions::default().cache_size(256),
                    None,
                )
                .unwrap();
                (dir, store)
            },
            |(_dir, store)| {
                for (i, key) in keys.iter().enumerate() {
                    store.add_value(key, (i % 97) as u32, i as u32).unwrap();
                }
                store.flush().unwrap();
            },
        )
    });

    group.finish();
}

criterion_group!(benches, bench_enumerator, bench_value_log, bench_container_store);
criterion_main!(benches);
