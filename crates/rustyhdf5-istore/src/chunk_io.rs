//! Vectorized reads and writes of a single chunk.
//!
//! Each call moves bytes between one chunk and a caller buffer, following a
//! chunk-side [`IoVec`] (offsets relative to the chunk start) and a
//! memory-side [`IoVec`] (offsets into the caller buffer). Both vectors are
//! advanced past whatever was transferred.

use tracing::trace;

use crate::block_store::addr_defined;
use crate::chunk_cache::{ChunkCache, ChunkContext};
use crate::error::{Error, Result};
use crate::io_vec::{block_readvv, block_writevv, memcpy_vv, skip_vv, IoVec};

/// Read from the chunk at `offset` into `mem`. Returns bytes transferred.
pub fn read_vectors(
    cache: &mut ChunkCache,
    ctx: &mut ChunkContext<'_>,
    offset: &[u64],
    chunk_vec: &mut IoVec,
    mem_vec: &mut IoVec,
    mem: &mut [u8],
) -> Result<usize> {
    let chunk_size = ctx.layout.chunk_size();
    let multi = ctx.xfer.is_multi_writer();
    if multi && !ctx.pipeline.is_empty() {
        return Err(Error::MultiWriterFilters);
    }
    if multi {
        // Storage must hold the latest bytes before bypassing the cache.
        cache.evict(ctx, offset)?;
    }
    let addr = ctx.index.get_addr(offset);

    // Too big to cache and nothing to decode, or the cache is off limits.
    let direct = multi || (chunk_size > cache.props().nbytes && ctx.pipeline.is_empty());
    if direct && addr_defined(addr) {
        trace!(?offset, addr, "direct chunk read");
        return block_readvv(&mut *ctx.store, addr, chunk_size, chunk_vec, mem_vec, mem);
    }

    if !addr_defined(addr) && !cache.contains(offset) && ctx.fill.is_undefined_read() {
        let n = skip_vv(chunk_vec, mem_vec);
        trace!(?offset, bytes = n, "unallocated chunk read skipped");
        return Ok(n);
    }

    if multi {
        // Never allocated and the cache is not in play: all fill.
        let mut fill = vec![0u8; chunk_size];
        ctx.fill.value.fill(&mut fill);
        return memcpy_vv(mem_vec, mem, chunk_vec, &fill);
    }

    let lock = cache.lock(ctx, offset, false)?;
    let copied = cache
        .chunk_bytes(&lock)
        .and_then(|buf| memcpy_vv(mem_vec, mem, chunk_vec, buf));
    let naccessed = copied.as_ref().map_or(0, |n| *n);
    let unlocked = cache.unlock(ctx, lock, false, naccessed);
    let n = copied?;
    unlocked?;
    Ok(n)
}

/// Write from `mem` into the chunk at `offset`. Returns bytes transferred.
pub fn write_vectors(
    cache: &mut ChunkCache,
    ctx: &mut ChunkContext<'_>,
    offset: &[u64],
    chunk_vec: &mut IoVec,
    mem_vec: &mut IoVec,
    mem: &[u8],
) -> Result<usize> {
    let chunk_size = ctx.layout.chunk_size();
    let multi = ctx.xfer.is_multi_writer();
    if multi && !ctx.pipeline.is_empty() {
        return Err(Error::MultiWriterFilters);
    }
    if multi {
        // A cached copy would later overwrite what goes to storage here.
        cache.evict(ctx, offset)?;
    }
    let addr = ctx.index.get_addr(offset);

    let direct = multi
        || (chunk_size > cache.props().nbytes && ctx.pipeline.is_empty() && addr_defined(addr));
    if direct {
        // Concurrent writers need the chunk allocated up front.
        if !addr_defined(addr) {
            return Err(Error::NotFound {
                offset: offset.to_vec(),
            });
        }
        trace!(?offset, addr, "direct chunk write");
        return block_writevv(&mut *ctx.store, addr, chunk_size, chunk_vec, mem_vec, mem);
    }

    // Covering every byte of the chunk means nothing needs reading first.
    let relax = chunk_vec.remaining() == chunk_size && mem_vec.remaining() >= chunk_size;
    let mut lock = cache.lock(ctx, offset, relax)?;
    let copied = cache
        .chunk_bytes_mut(&mut lock)
        .and_then(|buf| memcpy_vv(chunk_vec, buf, mem_vec, mem));
    let naccessed = copied.as_ref().map_or(0, |n| *n);
    let unlocked = cache.unlock(ctx, lock, copied.is_ok(), naccessed);
    if copied.is_err() && relax {
        // The entry holds placeholder bytes, not the chunk.
        cache.discard_where(|o| o == offset);
    }
    let n = copied?;
    unlocked?;
    Ok(n)
}
