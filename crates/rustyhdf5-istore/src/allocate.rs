//! Eager allocation of every chunk covering a dataset extent.

use std::borrow::Cow;

use rustyhdf5_filters::FilterDirection;
use tracing::debug;

use crate::block_store::addr_defined;
use crate::chunk_cache::{ChunkCache, ChunkContext};
use crate::error::{Error, Result};

/// Allocate storage for every chunk of `extent` that has none yet and, when
/// the fill policy or the filter pipeline calls for it, write the fill
/// value there. Returns the number of chunks allocated.
///
/// `full_overwrite` tells that the caller is about to write every element,
/// so plain fill values need not be written.
pub fn allocate_all(
    cache: &ChunkCache,
    ctx: &mut ChunkContext<'_>,
    extent: &[u64],
    full_overwrite: bool,
) -> Result<usize> {
    let layout = ctx.layout;
    let rank = layout.rank();
    if extent.len() != rank {
        return Err(Error::InvalidArgument(format!(
            "extent {extent:?} does not match rank {rank}"
        )));
    }
    let per_dim = layout.chunks_per_dim(extent);
    if per_dim.contains(&0) {
        return Ok(0);
    }

    // Filters need defined input even when nobody asked for fill values.
    let should_fill = (!full_overwrite && ctx.fill.fills_on_alloc()) || !ctx.pipeline.is_empty();
    let mut fill = vec![0u8; layout.chunk_size()];
    if ctx.fill.fills_on_alloc() {
        ctx.fill.value.fill(&mut fill);
    }
    let mut mask = 0u32;
    let stored: Cow<'_, [u8]> = if ctx.pipeline.is_empty() {
        Cow::Borrowed(&fill)
    } else {
        Cow::Owned(ctx.pipeline.apply(
            ctx.registry,
            FilterDirection::Forward,
            layout.element_size(),
            &mut mask,
            &fill,
        )?)
    };
    let nbytes = u32::try_from(stored.len())
        .map_err(|_| Error::Internal(format!("filtered fill chunk of {} bytes", stored.len())))?;

    let group = ctx.xfer.multi_writer.clone();
    let writes_fill = should_fill && group.as_ref().map_or(true, |g| g.is_fill_writer());

    let mut coords = vec![0u64; rank];
    let mut offset = vec![0u64; rank + 1];
    let mut allocated = 0usize;
    loop {
        for (i, (&c, &d)) in coords.iter().zip(layout.dims.iter()).enumerate() {
            offset[i] = c * u64::from(d);
        }
        if !cache.contains(&offset) && !addr_defined(ctx.index.get_addr(&offset)) {
            let addr = ctx.index.insert(&mut *ctx.store, &offset, nbytes, mask)?;
            if writes_fill {
                ctx.store.write(addr, &stored)?;
            }
            allocated += 1;
        }

        // Odometer: bump the fastest dimension, carry into slower ones.
        let mut carry = true;
        for i in (0..rank).rev() {
            coords[i] += 1;
            if coords[i] < per_dim[i] {
                carry = false;
                break;
            }
            coords[i] = 0;
        }
        if carry {
            break;
        }
    }
    debug!(allocated, bytes = nbytes, should_fill, "chunks allocated");

    if let Some(group) = group {
        if should_fill && allocated > 0 {
            group.barrier()?;
        }
    }
    Ok(allocated)
}
