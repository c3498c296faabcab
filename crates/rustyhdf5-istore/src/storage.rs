//! Per-dataset handle for chunked storage.
//!
//! [`ChunkStorage`] owns the block store, the chunk index and the chunk
//! cache of one dataset and exposes the chunk-level operations on them.
//! Chunk offsets may be given with `rank` coordinates or with the trailing
//! zero element coordinate; both are accepted everywhere.
//!
//! Dirty chunks are only written by [`flush`](ChunkStorage::flush),
//! [`close`](ChunkStorage::close) or eviction. Dropping the handle without
//! closing it loses them.

use rustyhdf5_filters::FilterRegistry;
use tracing::debug;

use crate::allocate;
use crate::block_store::BlockStore;
use crate::btree::IterStep;
use crate::chunk_cache::{CacheStats, ChunkCache, ChunkContext, ChunkLock};
use crate::chunk_index::{ChunkIndex, ChunkInfo};
use crate::chunk_io;
use crate::error::{Error, Result};
use crate::extent;
use crate::fill::AllocTime;
use crate::io_vec::IoVec;
use crate::layout::ChunkLayout;
use crate::property_list::{ChunkCacheProps, DatasetCreateProps, DatasetXferProps};

/// Chunked storage of one dataset.
#[derive(Debug)]
pub struct ChunkStorage<S: BlockStore> {
    store: S,
    layout: ChunkLayout,
    extent: Vec<u64>,
    dcpl: DatasetCreateProps,
    xfer: DatasetXferProps,
    registry: FilterRegistry,
    index: ChunkIndex,
    cache: ChunkCache,
}

impl<S: BlockStore> ChunkStorage<S> {
    /// Create storage for a new dataset of `extent` in `store`.
    ///
    /// With [`AllocTime::Early`] every chunk is allocated (and filled as the
    /// fill policy says) before this returns.
    pub fn create(
        store: S,
        extent: &[u64],
        dcpl: DatasetCreateProps,
        cache_props: ChunkCacheProps,
    ) -> Result<Self> {
        dcpl.validate()?;
        cache_props.validate()?;
        let layout = ChunkLayout::new(dcpl.layout_dims())?;
        check_extent(&layout, extent)?;
        let index = ChunkIndex::create(&layout, dcpl.index_k);
        let cache = ChunkCache::new(cache_props, &layout, extent);
        let mut storage = Self {
            store,
            layout,
            extent: extent.to_vec(),
            dcpl,
            xfer: DatasetXferProps::new(),
            registry: FilterRegistry::new(),
            index,
            cache,
        };
        debug!(dims = ?storage.layout.dims, ?extent, "chunked storage created");
        if storage.dcpl.alloc_time == AllocTime::Early {
            storage.allocate_all(false)?;
        }
        Ok(storage)
    }

    /// Reattach to a dataset whose layout record was returned by
    /// [`flush`](Self::flush) or [`close`](Self::close).
    pub fn open(
        mut store: S,
        layout: ChunkLayout,
        extent: &[u64],
        dcpl: DatasetCreateProps,
        cache_props: ChunkCacheProps,
    ) -> Result<Self> {
        dcpl.validate()?;
        cache_props.validate()?;
        if layout.dims != dcpl.layout_dims() {
            return Err(Error::Layout(format!(
                "layout dims {:?} do not match creation properties {:?}",
                layout.dims,
                dcpl.layout_dims()
            )));
        }
        check_extent(&layout, extent)?;
        let index = ChunkIndex::open(&mut store, &layout, dcpl.index_k)?;
        let cache = ChunkCache::new(cache_props, &layout, extent);
        debug!(index_addr = ?layout.index_addr, chunks = index.len(), "chunked storage opened");
        Ok(Self {
            store,
            layout,
            extent: extent.to_vec(),
            dcpl,
            xfer: DatasetXferProps::new(),
            registry: FilterRegistry::new(),
            index,
            cache,
        })
    }

    /// Use `registry` to resolve filter ids.
    pub fn with_registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Transfer properties for the calls that follow. In multi-writer mode a
    /// cached chunk is flushed and evicted before it is accessed directly.
    pub fn set_xfer(&mut self, xfer: DatasetXferProps) {
        self.xfer = xfer;
    }

    /// Chunk geometry and the index address of the last flush.
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Current dataset dimensions.
    pub fn extent(&self) -> &[u64] {
        &self.extent
    }

    pub fn dcpl(&self) -> &DatasetCreateProps {
        &self.dcpl
    }

    /// The underlying block store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the block store. Writing over chunk extents
    /// bypasses the cache.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// The chunk cache, for inspection.
    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    /// The chunk index as of the last write-back.
    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Chunk cache counters.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn split(&mut self) -> (&mut ChunkCache, ChunkContext<'_>) {
        let ctx = ChunkContext {
            store: &mut self.store,
            index: &mut self.index,
            layout: &self.layout,
            pipeline: &self.dcpl.filters,
            registry: &self.registry,
            fill: self.dcpl.fill_policy(),
            xfer: &self.xfer,
        };
        (&mut self.cache, ctx)
    }

    /// Where the chunk at `offset` is stored, if it has storage. Chunks
    /// that are only cached have none yet.
    pub fn get_addr(&self, offset: &[u64]) -> Result<Option<ChunkInfo>> {
        let offset = self.layout.normalize_offset(offset)?;
        Ok(self.index.get(&offset))
    }

    // -----------------------------------------------------------------------
    // Lock-level access
    // -----------------------------------------------------------------------

    /// Lock the chunk at `offset` for direct access to its bytes. With
    /// `relax` the caller promises to overwrite all of it. Every lock must
    /// be handed back to [`unlock`](Self::unlock).
    pub fn lock(&mut self, offset: &[u64], relax: bool) -> Result<ChunkLock> {
        let offset = self.layout.normalize_offset(offset)?;
        let (cache, mut ctx) = self.split();
        cache.lock(&mut ctx, &offset, relax)
    }

    /// Bytes of a locked chunk.
    pub fn chunk_bytes<'a>(&'a self, lock: &'a ChunkLock) -> Result<&'a [u8]> {
        self.cache.chunk_bytes(lock)
    }

    /// Mutable bytes of a locked chunk; pass `dirty` to `unlock` after writing.
    pub fn chunk_bytes_mut<'a>(&'a mut self, lock: &'a mut ChunkLock) -> Result<&'a mut [u8]> {
        self.cache.chunk_bytes_mut(lock)
    }

    /// Release a lock. `naccessed` bytes were read, or written when `dirty`;
    /// the count steers eviction only.
    pub fn unlock(&mut self, lock: ChunkLock, dirty: bool, naccessed: usize) -> Result<()> {
        let (cache, mut ctx) = self.split();
        cache.unlock(&mut ctx, lock, dirty, naccessed)
    }

    // -----------------------------------------------------------------------
    // Vector I/O
    // -----------------------------------------------------------------------

    /// See [`chunk_io::read_vectors`].
    pub fn read_vectors(
        &mut self,
        offset: &[u64],
        chunk_vec: &mut IoVec,
        mem_vec: &mut IoVec,
        mem: &mut [u8],
    ) -> Result<usize> {
        let offset = self.layout.normalize_offset(offset)?;
        let (cache, mut ctx) = self.split();
        chunk_io::read_vectors(cache, &mut ctx, &offset, chunk_vec, mem_vec, mem)
    }

    /// See [`chunk_io::write_vectors`].
    pub fn write_vectors(
        &mut self,
        offset: &[u64],
        chunk_vec: &mut IoVec,
        mem_vec: &mut IoVec,
        mem: &[u8],
    ) -> Result<usize> {
        let offset = self.layout.normalize_offset(offset)?;
        let (cache, mut ctx) = self.split();
        chunk_io::write_vectors(cache, &mut ctx, &offset, chunk_vec, mem_vec, mem)
    }

    /// The whole decoded chunk at `offset`.
    ///
    /// Under a fill policy where unwritten data is undefined, a chunk with
    /// no storage comes back as zeros.
    pub fn read_chunk(&mut self, offset: &[u64]) -> Result<Vec<u8>> {
        let size = self.layout.chunk_size();
        let mut buf = vec![0u8; size];
        self.read_vectors(
            offset,
            &mut IoVec::single(0, size),
            &mut IoVec::single(0, size),
            &mut buf,
        )?;
        Ok(buf)
    }

    /// Overwrite the whole chunk at `offset`.
    pub fn write_chunk(&mut self, offset: &[u64], data: &[u8]) -> Result<()> {
        let size = self.layout.chunk_size();
        if data.len() != size {
            return Err(Error::InvalidArgument(format!(
                "chunk data is {} bytes, chunk size is {size}",
                data.len()
            )));
        }
        self.write_vectors(
            offset,
            &mut IoVec::single(0, size),
            &mut IoVec::single(0, size),
            data,
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dataset-wide operations
    // -----------------------------------------------------------------------

    /// Allocate every chunk of the current extent. See
    /// [`allocate::allocate_all`].
    pub fn allocate_all(&mut self, full_overwrite: bool) -> Result<usize> {
        let extent = self.extent.clone();
        let (cache, mut ctx) = self.split();
        allocate::allocate_all(cache, &mut ctx, &extent, full_overwrite)
    }

    /// Change the dataset extent. Shrinking discards chunks past the new
    /// end and refills the trimmed part of straddling chunks.
    pub fn set_extent(&mut self, new: &[u64]) -> Result<()> {
        let old = self.extent.clone();
        {
            let (cache, mut ctx) = self.split();
            extent::set_extent(cache, &mut ctx, &old, new)?;
        }
        self.extent = new.to_vec();
        if self.dcpl.alloc_time == AllocTime::Early {
            self.allocate_all(false)?;
        }
        Ok(())
    }

    /// Write every dirty chunk, persist the index and flush the store.
    /// Returns the layout record to pass to [`open`](Self::open).
    pub fn flush(&mut self) -> Result<ChunkLayout> {
        {
            let (cache, mut ctx) = self.split();
            cache.flush_all(&mut ctx, false)?;
        }
        self.layout.index_addr = self.index.persist(&mut self.store)?;
        self.store.flush()?;
        Ok(self.layout.clone())
    }

    /// Write every dirty chunk; with `invalidate` also empty the cache.
    pub fn flush_cache(&mut self, invalidate: bool) -> Result<()> {
        let (cache, mut ctx) = self.split();
        cache.flush_all(&mut ctx, invalidate)
    }

    /// Forget pending modifications of cached chunks.
    pub fn clear_cache_dirty(&mut self) {
        self.cache.clear_dirty();
    }

    /// Flush and hand back the store with the final layout record.
    pub fn close(mut self) -> Result<(S, ChunkLayout)> {
        let layout = self.flush()?;
        debug!(index_addr = ?layout.index_addr, chunks = self.index.len(), "chunked storage closed");
        Ok((self.store, layout))
    }

    /// Bytes of storage used by chunks, after writing out dirty ones.
    pub fn allocated_bytes(&mut self) -> Result<u64> {
        self.flush_cache(false)?;
        Ok(self.index.allocated_bytes())
    }

    /// Free every chunk and index node without writing anything back.
    pub fn delete(mut self) -> Result<S> {
        self.cache.discard_all();
        self.index.delete(&mut self.store)?;
        self.layout.index_addr = None;
        self.store.flush()?;
        debug!("chunked storage deleted");
        Ok(self.store)
    }

    /// Log the cache and index contents at debug level.
    pub fn dump(&self) -> Result<()> {
        let stats = self.cache.stats();
        debug!(
            nused = self.cache.nused(),
            nbytes = self.cache.nbytes(),
            hits = stats.hits,
            misses = stats.misses,
            "chunk cache"
        );
        for entry in self.cache.entries() {
            debug!(
                offset = ?entry.offset(),
                dirty = entry.is_dirty(),
                locked = entry.is_locked(),
                rd_count = entry.rd_count(),
                wr_count = entry.wr_count(),
                "cached chunk"
            );
        }
        self.index.iterate(|info| {
            debug!(
                offset = ?info.offsets,
                addr = info.address,
                bytes = info.chunk_size,
                filter_mask = info.filter_mask,
                "indexed chunk"
            );
            Ok(IterStep::Continue)
        })
    }
}

fn check_extent(layout: &ChunkLayout, extent: &[u64]) -> Result<()> {
    if extent.len() != layout.rank() {
        return Err(Error::InvalidArgument(format!(
            "extent {extent:?} does not match rank {}",
            layout.rank()
        )));
    }
    Ok(())
}
