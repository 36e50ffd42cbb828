//! Performance benchmarks for the record store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shelf::{Blob, Database, StoreConfig, Value};
use tempfile::TempDir;

fn create_database(dir: &TempDir) -> Database {
    Database::open_or_create(
        &StoreConfig {
            root: dir.path().join("data"),
            blob_cache_size: 1000,
            sync_interval: 100,
        },
        "bench",
    )
    .unwrap()
}

/// Benchmark appending text records
fn bench_put_text(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir);
    let value = Value::from("a short text record");

    c.bench_function("put_text", |b| {
        b.iter(|| db.put(black_box(&value)).unwrap());
    });
}

/// Benchmark storing blobs of varying sizes
fn bench_put_blob(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_blob");

    for size in [64usize, 4 * 1024, 256 * 1024] {
        group.bench_with_input(BenchmarkId::new("bytes", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let db = create_database(&dir);
            let mut counter = 0u64;

            b.iter(|| {
                // Distinct content each time so deduplication does not kick in
                counter += 1;
                let mut content = vec![0u8; size];
                content[..8].copy_from_slice(&counter.to_le_bytes());
                db.put(&Value::Blob(Blob::from_bytes(content))).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark lookup by value and full enumeration at varying store sizes
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for records in [100u64, 1000, 10_000] {
        let dir = TempDir::new().unwrap();
        let db = create_database(&dir);
        for i in 0..records {
            db.put(&Value::from(format!("record {}", i))).unwrap();
        }
        let target = Value::from(format!("record {}", records / 2));

        group.bench_with_input(BenchmarkId::new("find", records), &records, |b, _| {
            b.iter(|| db.find(black_box(&target)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("get_all", records), &records, |b, _| {
            b.iter(|| db.get_all().unwrap().len());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put_text, bench_put_blob, bench_lookup);
criterion_main!(benches);
