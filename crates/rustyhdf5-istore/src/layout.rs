//! Persisted chunked-layout record and chunk geometry.
//!
//! Encoded as a version 3 data layout message of class 2 (chunked):
//!
//! ```text
//! version (1) = 3 | class (1) = 2 | ndims (1) | index address (8) | ndims x u32 dims
//! ```
//!
//! The last dimension is the element size in bytes, so a dataset of rank
//! `r` has `ndims = r + 1`.

use crate::block_store::UNDEFINED_ADDR;
use crate::error::{Error, Result};

const LAYOUT_VERSION: u8 = 3;
const LAYOUT_CLASS_CHUNKED: u8 = 2;

/// Highest supported `ndims` (rank 32 plus the element dimension).
pub const MAX_NDIMS: usize = 33;

/// Chunk geometry and index root of one chunked dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Root of the chunk index, `None` until the index is first written.
    pub index_addr: Option<u64>,
    /// Chunk size per dimension; the last entry is the element size.
    pub dims: Vec<u32>,
}

impl ChunkLayout {
    /// Layout with no index yet. `dims` ends with the element size.
    pub fn new(dims: Vec<u32>) -> Result<Self> {
        let layout = Self {
            index_addr: None,
            dims,
        };
        layout.validate()?;
        Ok(layout)
    }

    fn validate(&self) -> Result<()> {
        if self.dims.len() < 2 || self.dims.len() > MAX_NDIMS {
            return Err(Error::Layout(format!(
                "chunk layout needs 2..={MAX_NDIMS} dimensions, got {}",
                self.dims.len()
            )));
        }
        if self.dims.contains(&0) {
            return Err(Error::Layout(format!("zero chunk dimension in {:?}", self.dims)));
        }
        Ok(())
    }

    /// Number of key dimensions, element dimension included.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Dataset rank.
    pub fn rank(&self) -> usize {
        self.dims.len() - 1
    }

    pub fn element_size(&self) -> usize {
        self.dims[self.rank()] as usize
    }

    /// Bytes in one decoded chunk.
    pub fn chunk_size(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// Number of chunks along each rank dimension needed to cover `extent`.
    pub fn chunks_per_dim(&self, extent: &[u64]) -> Vec<u64> {
        self.dims[..self.rank()]
            .iter()
            .zip(extent)
            .map(|(&d, &e)| e.div_ceil(u64::from(d)))
            .collect()
    }

    /// Row-major strides, in chunks, for linearizing chunk coordinates.
    pub fn down_chunks(&self, extent: &[u64]) -> Vec<u64> {
        let per_dim = self.chunks_per_dim(extent);
        let mut down = vec![1u64; per_dim.len()];
        for i in (0..per_dim.len().saturating_sub(1)).rev() {
            down[i] = down[i + 1].saturating_mul(per_dim[i + 1]);
        }
        down
    }

    /// Linear index of the chunk at `offset` given the strides from
    /// [`down_chunks`](Self::down_chunks).
    pub fn chunk_index(&self, offset: &[u64], down: &[u64]) -> u64 {
        self.dims[..self.rank()]
            .iter()
            .zip(offset)
            .zip(down)
            .fold(0u64, |acc, ((&d, &o), &s)| {
                acc.wrapping_add((o / u64::from(d)).wrapping_mul(s))
            })
    }

    /// Turn a caller-supplied chunk offset into a full `ndims` key offset.
    ///
    /// Accepts either `rank` coordinates or `ndims` coordinates with a zero
    /// element coordinate. Each coordinate must be a multiple of the chunk
    /// size in that dimension.
    pub fn normalize_offset(&self, offset: &[u64]) -> Result<Vec<u64>> {
        let rank = self.rank();
        let mut full = match offset.len() {
            n if n == rank => offset.to_vec(),
            n if n == rank + 1 && offset[rank] == 0 => offset[..rank].to_vec(),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "chunk offset {offset:?} does not match rank {rank}"
                )))
            }
        };
        for (i, (&o, &d)) in full.iter().zip(&self.dims).enumerate() {
            if o % u64::from(d) != 0 {
                return Err(Error::InvalidArgument(format!(
                    "chunk offset {offset:?} not aligned to chunk size {d} in dimension {i}"
                )));
            }
        }
        full.push(0);
        Ok(full)
    }

    /// Encode as a version 3 chunked layout message.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + 4 * self.dims.len());
        buf.push(LAYOUT_VERSION);
        buf.push(LAYOUT_CLASS_CHUNKED);
        buf.push(self.dims.len() as u8);
        buf.extend_from_slice(&self.index_addr.unwrap_or(UNDEFINED_ADDR).to_le_bytes());
        for d in &self.dims {
            buf.extend_from_slice(&d.to_le_bytes());
        }
        buf
    }

    /// Decode and validate a layout message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 11 {
            return Err(Error::Layout(format!("layout record too short: {} bytes", data.len())));
        }
        if data[0] != LAYOUT_VERSION {
            return Err(Error::Layout(format!("unsupported layout version {}", data[0])));
        }
        if data[1] != LAYOUT_CLASS_CHUNKED {
            return Err(Error::Layout(format!("layout class {} is not chunked", data[1])));
        }
        let ndims = data[2] as usize;
        let expected = 11 + 4 * ndims;
        if data.len() != expected {
            return Err(Error::Layout(format!(
                "layout record is {} bytes, expected {expected}",
                data.len()
            )));
        }
        let mut addr_bytes = [0u8; 8];
        addr_bytes.copy_from_slice(&data[3..11]);
        let addr = u64::from_le_bytes(addr_bytes);
        let dims = data[11..]
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let layout = Self {
            index_addr: (addr != UNDEFINED_ADDR).then_some(addr),
            dims,
        };
        layout.validate()?;
        Ok(layout)
    }
}
