//! Offset/length sequences and ragged scatter-gather copies.
//!
//! An [`IoVec`] is a list of `(offset, len)` segments with a cursor. Two
//! vectors are walked in lockstep, each step moving
//! `min(left in current segment of A, left in current segment of B)` bytes,
//! so their segment boundaries never have to line up. Offsets within a
//! vector are expected to increase; that is not checked.

use tracing::trace;

use crate::block_store::BlockStore;
use crate::error::{Error, Result};

/// One contiguous byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub len: usize,
}

/// Segments plus a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoVec {
    segments: Vec<Segment>,
    idx: usize,
    used: usize,
}

impl IoVec {
    /// Vector over `segments`, cursor at the start.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            idx: 0,
            used: 0,
        }
    }

    /// One segment of `len` bytes at `offset`.
    pub fn single(offset: u64, len: usize) -> Self {
        Self::new(vec![Segment { offset, len }])
    }

    /// Segments from `(offset, len)` pairs.
    pub fn from_pairs(pairs: &[(u64, usize)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|&(offset, len)| Segment { offset, len })
                .collect(),
        )
    }

    /// All segments, including those already consumed.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Bytes left past the cursor.
    pub fn remaining(&self) -> usize {
        self.segments
            .get(self.idx..)
            .map_or(0, |rest| rest.iter().map(|s| s.len).sum::<usize>())
            - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Offset and length left in the current segment, skipping empty ones.
    fn current(&mut self) -> Option<(u64, usize)> {
        while let Some(seg) = self.segments.get(self.idx) {
            if self.used < seg.len {
                return Some((seg.offset + self.used as u64, seg.len - self.used));
            }
            self.idx += 1;
            self.used = 0;
        }
        None
    }

    fn advance(&mut self, n: usize) {
        self.used += n;
        if let Some(seg) = self.segments.get(self.idx) {
            if self.used >= seg.len {
                self.idx += 1;
                self.used = 0;
            }
        }
    }
}

/// Walk `a` and `b` together, calling `step(a_offset, b_offset, len)` for
/// every overlapping run.
fn walk<F>(a: &mut IoVec, b: &mut IoVec, mut step: F) -> Result<usize>
where
    F: FnMut(u64, u64, usize) -> Result<()>,
{
    let mut total = 0;
    while let (Some((ao, al)), Some((bo, bl))) = (a.current(), b.current()) {
        let n = al.min(bl);
        step(ao, bo, n)?;
        a.advance(n);
        b.advance(n);
        total += n;
    }
    Ok(total)
}

fn range(offset: u64, len: usize, bound: usize, what: &str) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| Error::Internal(format!("{what} offset {offset} out of range")))?;
    match start.checked_add(len) {
        Some(end) if end <= bound => Ok(start..end),
        _ => Err(Error::Internal(format!(
            "{what} segment [{start}, +{len}) exceeds buffer of {bound} bytes"
        ))),
    }
}

/// Copy from `src` to `dst` following the two vectors. Returns bytes copied.
pub fn memcpy_vv(
    dst_vec: &mut IoVec,
    dst: &mut [u8],
    src_vec: &mut IoVec,
    src: &[u8],
) -> Result<usize> {
    let (dst_len, src_len) = (dst.len(), src.len());
    let total = walk(dst_vec, src_vec, |d, s, n| {
        let d = range(d, n, dst_len, "destination")?;
        let s = range(s, n, src_len, "source")?;
        dst[d].copy_from_slice(&src[s]);
        Ok(())
    })?;
    trace!(bytes = total, "vectored copy");
    Ok(total)
}

/// Advance both vectors over their overlap without copying.
pub fn skip_vv(a: &mut IoVec, b: &mut IoVec) -> usize {
    let mut total = 0;
    while let (Some((_, al)), Some((_, bl))) = (a.current(), b.current()) {
        let n = al.min(bl);
        a.advance(n);
        b.advance(n);
        total += n;
    }
    total
}

/// Read straight from the `chunk_size`-byte chunk stored at `addr` into
/// `mem`. Chunk segments must stay inside the chunk.
pub fn block_readvv(
    store: &mut dyn BlockStore,
    addr: u64,
    chunk_size: usize,
    chunk_vec: &mut IoVec,
    mem_vec: &mut IoVec,
    mem: &mut [u8],
) -> Result<usize> {
    let mem_len = mem.len();
    walk(chunk_vec, mem_vec, |c, m, n| {
        let c = range(c, n, chunk_size, "chunk")?;
        let m = range(m, n, mem_len, "memory")?;
        store.read(addr + c.start as u64, &mut mem[m])
    })
}

/// Write straight from `mem` to the `chunk_size`-byte chunk stored at
/// `addr`. Chunk segments must stay inside the chunk.
pub fn block_writevv(
    store: &mut dyn BlockStore,
    addr: u64,
    chunk_size: usize,
    chunk_vec: &mut IoVec,
    mem_vec: &mut IoVec,
    mem: &[u8],
) -> Result<usize> {
    let mem_len = mem.len();
    walk(chunk_vec, mem_vec, |c, m, n| {
        let c = range(c, n, chunk_size, "chunk")?;
        let m = range(m, n, mem_len, "memory")?;
        store.write(addr + c.start as u64, &mem[m])
    })
}
