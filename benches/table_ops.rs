//! Benchmark suite for cuckoo table operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use tcuckoo::{CuckooTable, TableBuilder};

/// Benchmark insertion of new entries into a table sized for them.
fn insert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [100_u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let table = CuckooTable::new(size as usize);
                let handle = table.handle();
                for i in 0..size {
                    handle.insert(black_box(i), black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark insertion into a table that starts tiny and has to grow
/// repeatedly.
fn insert_with_resize_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_with_resize");

    for size in [1_000_u64, 10_000].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let table = TableBuilder::new(16).slot_per_bucket(4).build();
                let handle = table.handle();
                for i in 0..size {
                    handle.insert(black_box(i), black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark lookups, half of them for absent keys.
fn find_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for size in [100_u64, 1_000, 10_000].iter() {
        let table = CuckooTable::new(*size as usize);
        let handle = table.handle();
        for i in 0..*size {
            handle.insert(i, format!("value-{i}"));
        }

        group.throughput(Throughput::Elements(*size * 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..(size * 2) {
                    let _ = handle.find(&black_box(i));
                }
            });
        });
    }
    group.finish();
}

/// Benchmark small read-modify-write transactions.
fn transaction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");

    let size = 1_000_u64;
    let table = CuckooTable::new(size as usize);
    let handle = table.handle();
    for i in 0..size {
        handle.insert(i, i);
    }

    group.throughput(Throughput::Elements(size));
    group.bench_function("overwrite", |b| {
        b.iter(|| {
            for i in 0..size {
                let mut txn = handle.transaction();
                let value = txn.get(&i).ok().flatten().unwrap_or_default();
                let _ = txn.remove(&i);
                let _ = txn.insert(i, black_box(value + 1));
                let _ = txn.commit();
            }
        });
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(100);
    targets = insert_benchmark, insert_with_resize_benchmark, find_benchmark, transaction_benchmark
}

criterion_main!(benches);
