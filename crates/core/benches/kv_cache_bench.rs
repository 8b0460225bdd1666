//! Criterion benchmarks for the KV cache operations on the decode path.
//!
//! Covers beam expansion, prefix broadcast and beam reorder, all on CPU.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device};
use tandem_core::kv_cache::KvCacheManager;

const LAYERS: usize = 4;
const HEADS: usize = 8;
const HEAD_DIM: usize = 64;
const CAPACITY: usize = 1024;

fn manager(batch_beam: usize) -> KvCacheManager {
    let mut kv = KvCacheManager::new(LAYERS, DType::F16, Device::Cpu);
    kv.resize(CAPACITY, batch_beam, HEADS, HEAD_DIM, false)
        .expect("resize failed");
    kv
}

// ---------------------------------------------------------------------------
// Beam expansion
// ---------------------------------------------------------------------------

fn bench_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_cache");
    for &beam in &[2usize, 4, 8] {
        let kv = manager(2 * beam);
        group.bench_with_input(BenchmarkId::new("beam", beam), &beam, |b, &beam| {
            b.iter(|| {
                for layer in 0..LAYERS {
                    kv.expand_cache(layer, 2, black_box(beam), 256)
                        .expect("expand failed");
                }
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Prefix broadcast
// ---------------------------------------------------------------------------

fn bench_prefix_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_prefix_cache");
    for &prefix_len in &[64usize, 256] {
        let mut kv = manager(8);
        kv.resize(prefix_len, 1, HEADS, HEAD_DIM, true)
            .expect("prefix resize failed");
        group.bench_with_input(
            BenchmarkId::new("prefix_len", prefix_len),
            &prefix_len,
            |b, &prefix_len| {
                b.iter(|| {
                    for layer in 0..LAYERS {
                        kv.expand_prefix_cache(layer, 8, black_box(prefix_len))
                            .expect("prefix broadcast failed");
                    }
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Beam reorder
// ---------------------------------------------------------------------------

fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder_cache");
    let kv = manager(8);
    let idx: Vec<u32> = vec![1, 1, 0, 3, 5, 5, 7, 6];
    for &generated in &[16usize, 128] {
        group.bench_with_input(
            BenchmarkId::new("generated", generated),
            &generated,
            |b, &generated| {
                b.iter(|| {
                    kv.reorder_cache(black_box(&idx), 8, 256, 256 + generated)
                        .expect("reorder failed");
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_expand, bench_prefix_broadcast, bench_reorder);
criterion_main!(benches);
