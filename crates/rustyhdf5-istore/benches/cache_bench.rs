//! Benchmark: chunk cache hits, eviction churn and strided vector reads.
//!
//!   cargo bench -p rustyhdf5-istore

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustyhdf5_istore::{
    ChunkCacheProps, ChunkStorage, DatasetCreateProps, FilterPipeline, IoVec, MemBlockStore,
};

/// 64x64 chunks of f64: 32 KiB each.
fn dataset(cache_bytes: usize, filters: FilterPipeline) -> ChunkStorage<MemBlockStore> {
    let dcpl = DatasetCreateProps::new(&[64, 64], 8).filters(filters);
    let cache = ChunkCacheProps::new().bytes(cache_bytes);
    let mut ds = ChunkStorage::create(MemBlockStore::new(), &[512, 512], dcpl, cache).unwrap();
    for i in 0..8u64 {
        for j in 0..8u64 {
            let data: Vec<u8> = (0..64 * 64)
                .flat_map(|e| ((i * 8 + j) as f64 + e as f64 * 0.5).to_le_bytes())
                .collect();
            ds.write_chunk(&[i * 64, j * 64], &data).unwrap();
        }
    }
    ds.flush().unwrap();
    ds
}

fn bench_hits(c: &mut Criterion) {
    let mut ds = dataset(4 << 20, FilterPipeline::new());
    c.bench_function("read_chunk_hit", |b| {
        b.iter(|| ds.read_chunk(black_box(&[64, 64])).unwrap())
    });
}

fn bench_churn(c: &mut Criterion) {
    // room for two chunks while cycling through all 64
    let mut ds = dataset(64 << 10, FilterPipeline::new().with_shuffle().with_deflate(1));
    let mut next = 0u64;
    c.bench_function("read_chunk_evicting (deflate)", |b| {
        b.iter(|| {
            let (i, j) = (next / 8, next % 8);
            next = (next + 1) % 64;
            ds.read_chunk(&[i * 64, j * 64]).unwrap()
        })
    });
}

fn bench_column(c: &mut Criterion) {
    let mut ds = dataset(4 << 20, FilterPipeline::new());
    // one f64 column: 64 segments of 8 bytes, 512 bytes apart
    let pairs: Vec<(u64, usize)> = (0..64).map(|r| (r * 512, 8)).collect();
    let mut out = vec![0u8; 64 * 8];
    c.bench_function("read_vectors_column", |b| {
        b.iter(|| {
            ds.read_vectors(
                &[0, 0],
                &mut IoVec::from_pairs(&pairs),
                &mut IoVec::single(0, out.len()),
                &mut out,
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_hits, bench_churn, bench_column);
criterion_main!(benches);
