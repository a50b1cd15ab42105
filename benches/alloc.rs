//! Allocation throughput benchmarks for fileheap
//!
//! These benchmarks measure the two allocation regimes (shared-page slots
//! and exclusive extents) plus the churn pattern where freed space is
//! recycled through the free lists.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fileheap::{Allocator, FileStorage};

fn fresh_heap(dir: &tempfile::TempDir, name: &str) -> Allocator<FileStorage> {
    let store = FileStorage::create(dir.path().join(name)).unwrap();
    Allocator::new(store).unwrap()
}

fn bench_small_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_alloc");

    for size in [16i64, 128, 1024] {
        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let mut heap = fresh_heap(&dir, "bench.db");
            b.iter(|| {
                let off = heap.alloc(black_box(size)).unwrap();
                heap.free(black_box(off)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_big_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("big_alloc");

    for size in [4096i64, 65536, 1 << 20] {
        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let mut heap = fresh_heap(&dir, "bench.db");
            b.iter(|| {
                let off = heap.alloc(black_box(size)).unwrap();
                heap.free(black_box(off)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_slot_churn(c: &mut Criterion) {
    c.bench_function("slot_churn_64", |b| {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = fresh_heap(&dir, "bench.db");
        let mut offs: Vec<i64> = (0..256).map(|_| heap.alloc(64).unwrap()).collect();
        b.iter(|| {
            for off in offs.drain(..) {
                heap.free(off).unwrap();
            }
            for _ in 0..256 {
                offs.push(heap.alloc(64).unwrap());
            }
        });
    });
}

fn bench_realloc_grow(c: &mut Criterion) {
    c.bench_function("realloc_16_to_4096", |b| {
        let dir = tempfile::tempdir().unwrap();
        let mut heap = fresh_heap(&dir, "bench.db");
        b.iter(|| {
            let off = heap.alloc(16).unwrap();
            let off = heap.realloc(off, 4096).unwrap();
            heap.free(black_box(off)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_small_alloc,
    bench_big_alloc,
    bench_slot_churn,
    bench_realloc_grow
);
criterion_main!(benches);
