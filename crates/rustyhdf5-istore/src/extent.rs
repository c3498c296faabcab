//! Keeping chunk storage consistent with a changing dataset extent.
//!
//! Only the dataset dimensions take part in the range tests; the trailing
//! element dimension of a chunk offset is always zero.

use std::collections::BTreeSet;

use tracing::debug;

use crate::btree::IterStep;
use crate::chunk_cache::{ChunkCache, ChunkContext};
use crate::error::{Error, Result};

/// Whether the chunk at `offset` starts at or past `extent` in any dimension.
fn outside(offset: &[u64], extent: &[u64]) -> bool {
    offset.iter().zip(extent).any(|(&o, &e)| o >= e)
}

/// Whether the chunk at `offset` is inside `extent` but runs past its end.
fn straddles(offset: &[u64], dims: &[u32], extent: &[u64]) -> bool {
    !outside(offset, extent)
        && offset
            .iter()
            .zip(dims)
            .zip(extent)
            .any(|((&o, &d), &e)| o + u64::from(d) > e)
}

fn check_rank(ctx: &ChunkContext<'_>, extent: &[u64]) -> Result<()> {
    let rank = ctx.layout.rank();
    if extent.len() != rank {
        return Err(Error::InvalidArgument(format!(
            "extent {extent:?} does not match rank {rank}"
        )));
    }
    Ok(())
}

/// Drop every chunk lying wholly outside `extent`, from the cache without
/// flushing and from the index, freeing its storage. Returns the number of
/// chunks removed from the index.
pub fn prune_by_extent(
    cache: &mut ChunkCache,
    ctx: &mut ChunkContext<'_>,
    extent: &[u64],
) -> Result<usize> {
    check_rank(ctx, extent)?;
    let evicted = cache.discard_where(|offset| outside(offset, extent));

    let mut victims = Vec::new();
    ctx.index.iterate(|info| {
        if outside(&info.offsets, extent) {
            victims.push(info.offsets.clone());
        }
        Ok(IterStep::Continue)
    })?;
    for offset in &victims {
        ctx.index.remove(&mut *ctx.store, offset)?;
    }
    debug!(?extent, evicted, removed = victims.len(), "chunks pruned by extent");
    Ok(victims.len())
}

/// Overwrite the part of every allocated or cached chunk that runs past
/// `extent` with the fill value, so growing the dataset again exposes fill
/// and not stale data. Returns the number of chunks rewritten.
pub fn initialize_by_extent(
    cache: &mut ChunkCache,
    ctx: &mut ChunkContext<'_>,
    extent: &[u64],
) -> Result<usize> {
    check_rank(ctx, extent)?;
    let layout = ctx.layout;
    let rank = layout.rank();
    let dims = &layout.dims[..rank];

    let mut targets = BTreeSet::new();
    ctx.index.iterate(|info| {
        if straddles(&info.offsets, dims, extent) {
            targets.insert(info.offsets.clone());
        }
        Ok(IterStep::Continue)
    })?;
    for entry in cache.entries() {
        if straddles(entry.offset(), dims, extent) {
            targets.insert(entry.offset().to_vec());
        }
    }

    let elem_size = layout.element_size();
    let mut fill = vec![0u8; elem_size];
    ctx.fill.value.fill(&mut fill);
    let nelems = layout.chunk_size() / elem_size;

    for offset in &targets {
        let mut lock = cache.lock(ctx, offset, false)?;
        let rewritten = cache.chunk_bytes_mut(&mut lock).map(|buf| {
            let mut n = 0;
            for (e, elem) in buf.chunks_exact_mut(elem_size).enumerate().take(nelems) {
                let mut rem = e as u64;
                let mut past_end = false;
                for i in (0..rank).rev() {
                    let d = u64::from(dims[i]);
                    past_end |= offset[i] + rem % d >= extent[i];
                    rem /= d;
                }
                if past_end {
                    elem.copy_from_slice(&fill);
                    n += elem_size;
                }
            }
            n
        });
        let naccessed = rewritten.as_ref().map_or(0, |n| *n);
        let unlocked = cache.unlock(ctx, lock, rewritten.is_ok(), naccessed);
        rewritten?;
        unlocked?;
    }
    debug!(?extent, chunks = targets.len(), "chunks initialized past extent");
    Ok(targets.len())
}

/// Move the dataset from `old` to `new` extent: prune and reinitialize on
/// shrink, and always re-slot the cache.
pub fn set_extent(
    cache: &mut ChunkCache,
    ctx: &mut ChunkContext<'_>,
    old: &[u64],
    new: &[u64],
) -> Result<()> {
    check_rank(ctx, old)?;
    check_rank(ctx, new)?;
    let shrink = old.iter().zip(new).any(|(&o, &n)| n < o);
    if shrink {
        prune_by_extent(cache, ctx, new)?;
    }
    cache.rehash(ctx, new)?;
    if shrink {
        initialize_by_extent(cache, ctx, new)?;
    }
    debug!(?old, ?new, shrink, "extent changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustyhdf5_filters::{FilterPipeline, FilterRegistry};

    use crate::block_store::{BlockStore, MemBlockStore};
    use crate::chunk_index::ChunkIndex;
    use crate::fill::{FillPolicy, FillTime, FillValue};
    use crate::layout::ChunkLayout;
    use crate::property_list::{ChunkCacheProps, DatasetXferProps};

    struct Fixture {
        store: MemBlockStore,
        index: ChunkIndex,
        layout: ChunkLayout,
        pipeline: FilterPipeline,
        registry: FilterRegistry,
        fill: FillValue,
        xfer: DatasetXferProps,
    }

    impl Fixture {
        /// 2x2 chunks of 1-byte elements, fill value 0xF0.
        fn new() -> Self {
            let layout = ChunkLayout::new(vec![2, 2, 1]).unwrap();
            Self {
                store: MemBlockStore::new(),
                index: ChunkIndex::create(&layout, 2),
                layout,
                pipeline: FilterPipeline::new(),
                registry: FilterRegistry::new(),
                fill: FillValue::User(vec![0xF0]),
                xfer: DatasetXferProps::new(),
            }
        }

        fn ctx(&mut self) -> ChunkContext<'_> {
            ChunkContext {
                store: &mut self.store,
                index: &mut self.index,
                layout: &self.layout,
                pipeline: &self.pipeline,
                registry: &self.registry,
                fill: FillPolicy::new(FillTime::IfSet, &self.fill),
                xfer: &self.xfer,
            }
        }
    }

    fn put(cache: &mut ChunkCache, ctx: &mut ChunkContext<'_>, offset: &[u64], byte: u8) {
        let mut lock = cache.lock(ctx, offset, true).unwrap();
        cache.chunk_bytes_mut(&mut lock).unwrap().fill(byte);
        cache.unlock(ctx, lock, true, 4).unwrap();
    }

    /// Fill a 4x4 dataset with one chunk per byte value, flushed to storage.
    fn populated(fx: &mut Fixture) -> ChunkCache {
        let mut cache = ChunkCache::new(ChunkCacheProps::new(), &fx.layout, &[4, 4]);
        let mut ctx = fx.ctx();
        for (i, off) in [[0, 0, 0], [0, 2, 0], [2, 0, 0], [2, 2, 0]].iter().enumerate() {
            put(&mut cache, &mut ctx, off, i as u8 + 1);
        }
        cache.flush_all(&mut ctx, false).unwrap();
        cache
    }

    #[test]
    fn prune_removes_from_cache_and_index() {
        let mut fx = Fixture::new();
        let mut cache = populated(&mut fx);
        let removed = prune_by_extent(&mut cache, &mut fx.ctx(), &[2, 4]).unwrap();
        assert_eq!(removed, 2);
        assert!(!cache.contains(&[2, 0, 0]));
        assert!(!cache.contains(&[2, 2, 0]));
        assert!(cache.contains(&[0, 2, 0]));
        assert!(fx.index.get(&[2, 0, 0]).is_none());
        assert!(fx.index.get(&[0, 0, 0]).is_some());
        assert_eq!(fx.index.len(), 2);
    }

    #[test]
    fn pruned_chunks_are_not_flushed() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(ChunkCacheProps::new(), &fx.layout, &[4, 4]);
        put(&mut cache, &mut fx.ctx(), &[2, 2, 0], 9);
        prune_by_extent(&mut cache, &mut fx.ctx(), &[2, 2]).unwrap();
        cache.flush_all(&mut fx.ctx(), true).unwrap();
        assert!(fx.index.is_empty());
        assert_eq!(fx.store.writes(), 0);
    }

    #[test]
    fn straddling_chunk_gets_fill() {
        let mut fx = Fixture::new();
        let mut cache = populated(&mut fx);
        // new extent [3, 3]: every chunk except [0,0] straddles
        let n = initialize_by_extent(&mut cache, &mut fx.ctx(), &[3, 3]).unwrap();
        assert_eq!(n, 3);
        cache.flush_all(&mut fx.ctx(), true).unwrap();

        let read = |fx: &mut Fixture, off: &[u64]| {
            let info = fx.index.get(off).unwrap();
            let mut buf = [0u8; 4];
            fx.store.read(info.address, &mut buf).unwrap();
            buf
        };
        assert_eq!(read(&mut fx, &[0, 0, 0]), [1, 1, 1, 1]);
        assert_eq!(read(&mut fx, &[0, 2, 0]), [2, 0xF0, 2, 0xF0]);
        assert_eq!(read(&mut fx, &[2, 0, 0]), [3, 3, 0xF0, 0xF0]);
        assert_eq!(read(&mut fx, &[2, 2, 0]), [4, 0xF0, 0xF0, 0xF0]);
    }

    #[test]
    fn shrink_then_grow_exposes_fill() {
        let mut fx = Fixture::new();
        let mut cache = populated(&mut fx);
        set_extent(&mut cache, &mut fx.ctx(), &[4, 4], &[3, 2]).unwrap();
        assert_eq!(fx.index.len(), 2);
        set_extent(&mut cache, &mut fx.ctx(), &[3, 2], &[4, 4]).unwrap();

        let mut ctx = fx.ctx();
        let lock = cache.lock(&mut ctx, &[2, 0, 0], false).unwrap();
        assert_eq!(cache.chunk_bytes(&lock).unwrap(), &[3, 3, 0xF0, 0xF0]);
        cache.unlock(&mut ctx, lock, false, 0).unwrap();
        let lock = cache.lock(&mut ctx, &[2, 2, 0], false).unwrap();
        assert_eq!(cache.chunk_bytes(&lock).unwrap(), &[0xF0; 4]);
        cache.unlock(&mut ctx, lock, false, 0).unwrap();
    }

    #[test]
    fn growth_only_rehashes() {
        let mut fx = Fixture::new();
        let mut cache = populated(&mut fx);
        set_extent(&mut cache, &mut fx.ctx(), &[4, 4], &[8, 8]).unwrap();
        assert_eq!(fx.index.len(), 4);
        assert_eq!(cache.nused(), 4);
        assert!(cache.contains(&[2, 2, 0]));
    }
}
