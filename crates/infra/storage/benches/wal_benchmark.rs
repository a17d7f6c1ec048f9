//! Performance benchmarks for durable store commits and replay

#![allow(clippy::expect_used)] // Benchmarks can use expect for simplicity

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use storage::{KeyRange, MemDb, StorageError, kvutil, with_reader};
use tempfile::TempDir;

fn bucket_key(i: u64) -> String {
    format!("/bench/filled/2024-01-{:02}/{:02}", 1 + (i / 24) % 28, i % 24)
}

fn benchmark_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_commit");

    group.bench_function("volatile_set", |b| {
        let db = MemDb::new();
        let mut i = 0u64;
        b.iter(|| {
            kvutil::set_db(&db, &bucket_key(i), &i).expect("set");
            i += 1;
        });
    });

    group.bench_function("durable_set_with_fsync", |b| {
        let temp_dir = TempDir::new().expect("temp dir");
        let db = MemDb::open(temp_dir.path()).expect("open store");
        let mut i = 0u64;
        b.iter(|| {
            kvutil::set_db(&db, &bucket_key(i), &i).expect("set");
            i += 1;
        });
    });

    group.finish();
}

fn benchmark_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_replay");

    for size in &[1000u64, 10000] {
        let temp_dir = TempDir::new().expect("temp dir");
        {
            let db = MemDb::open(temp_dir.path()).expect("open store");
            for i in 0..*size {
                kvutil::set_db(&db, &bucket_key(i), &i).expect("set");
            }
        }

        group.throughput(Throughput::Elements(*size));
        group.bench_function(format!("open_{size}"), |b| {
            b.iter(|| {
                let db = MemDb::open(temp_dir.path()).expect("open store");
                let n = with_reader(&db, |r| Ok::<_, StorageError>(r.ascend(&KeyRange::all())?.count()))
                    .expect("scan");
                black_box(n);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_commit, benchmark_replay);
criterion_main!(benches);
