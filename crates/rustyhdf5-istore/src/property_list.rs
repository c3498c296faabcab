//! Property lists for chunked datasets.
//!
//! Each list is a plain struct with builder-style setters and a
//! `validate()` that reports bad values as [`Error::Config`].

use std::fmt;
use std::sync::Arc;

use rustyhdf5_filters::FilterPipeline;

use crate::btree::MAX_K;
use crate::error::{Error, Result};
use crate::fill::{AllocTime, FillPolicy, FillTime, FillValue};

/// Default number of chunk cache hash slots.
pub const DEFAULT_CACHE_SLOTS: usize = 521;
/// Default chunk cache capacity, 1 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 1024 * 1024;
/// Default preemption weight.
pub const DEFAULT_CACHE_W0: f64 = 0.75;
/// Default B-tree half-width for the chunk index.
pub const DEFAULT_INDEX_K: u16 = 32;

/// Chunk cache properties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkCacheProps {
    /// Number of hash slots. Zero disables caching.
    pub nslots: usize,
    /// Maximum bytes of decoded chunk data held.
    pub nbytes: usize,
    /// Share of the LRU list, oldest first, that is searched for fully
    /// consumed chunks before plain LRU eviction starts.
    pub w0: f64,
}

impl Default for ChunkCacheProps {
    fn default() -> Self {
        Self {
            nslots: DEFAULT_CACHE_SLOTS,
            nbytes: DEFAULT_CACHE_BYTES,
            w0: DEFAULT_CACHE_W0,
        }
    }
}

impl ChunkCacheProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots(mut self, nslots: usize) -> Self {
        self.nslots = nslots;
        self
    }

    pub fn bytes(mut self, nbytes: usize) -> Self {
        self.nbytes = nbytes;
        self
    }

    /// Share of the LRU list searched first for fully consumed chunks.
    pub fn w0(mut self, w0: f64) -> Self {
        self.w0 = w0;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.w0) {
            return Err(Error::Config(format!(
                "cache w0 must be within [0, 1], got {}",
                self.w0
            )));
        }
        Ok(())
    }
}

/// Dataset creation properties for chunked storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetCreateProps {
    /// Chunk size in elements along each dataset dimension.
    pub chunk_dims: Vec<u32>,
    /// Bytes per element.
    pub element_size: u32,
    /// Filters applied to every chunk.
    pub filters: FilterPipeline,
    pub fill_time: FillTime,
    pub alloc_time: AllocTime,
    pub fill_value: FillValue,
    /// Chunk index B-tree half-width; leaves hold at most `2 * index_k` chunks.
    pub index_k: u16,
}

impl DatasetCreateProps {
    pub fn new(chunk_dims: &[u32], element_size: u32) -> Self {
        Self {
            chunk_dims: chunk_dims.to_vec(),
            element_size,
            filters: FilterPipeline::new(),
            fill_time: FillTime::default(),
            alloc_time: AllocTime::default(),
            fill_value: FillValue::default(),
            index_k: DEFAULT_INDEX_K,
        }
    }

    pub fn filters(mut self, pipeline: FilterPipeline) -> Self {
        self.filters = pipeline;
        self
    }

    pub fn fill_time(mut self, ft: FillTime) -> Self {
        self.fill_time = ft;
        self
    }

    pub fn alloc_time(mut self, at: AllocTime) -> Self {
        self.alloc_time = at;
        self
    }

    /// Set a user fill value; must be exactly one element long.
    pub fn fill_value(mut self, value: &[u8]) -> Self {
        self.fill_value = FillValue::User(value.to_vec());
        self
    }

    /// Chunk index half-width for newly written nodes.
    pub fn index_k(mut self, k: u16) -> Self {
        self.index_k = k;
        self
    }

    pub fn fill_policy(&self) -> FillPolicy<'_> {
        FillPolicy::new(self.fill_time, &self.fill_value)
    }

    /// Chunk dims followed by the element size, as stored in the layout.
    pub fn layout_dims(&self) -> Vec<u32> {
        let mut dims = self.chunk_dims.clone();
        dims.push(self.element_size);
        dims
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_dims.is_empty() {
            return Err(Error::Config("chunk rank must be at least 1".into()));
        }
        if self.chunk_dims.contains(&0) {
            return Err(Error::Config(format!(
                "chunk dimensions must be non-zero: {:?}",
                self.chunk_dims
            )));
        }
        if self.element_size == 0 {
            return Err(Error::Config("element size must be non-zero".into()));
        }
        if self.index_k == 0 || self.index_k > MAX_K {
            return Err(Error::Config(format!(
                "index_k must be in 1..={MAX_K}, got {}",
                self.index_k
            )));
        }
        if let FillValue::User(value) = &self.fill_value {
            if value.len() != self.element_size as usize {
                return Err(Error::Config(format!(
                    "fill value is {} bytes, element size is {}",
                    value.len(),
                    self.element_size
                )));
            }
        }
        self.filters
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let size = self
            .layout_dims()
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(u64::from(d)))
            .filter(|&n| n <= u64::from(u32::MAX));
        if size.is_none() {
            return Err(Error::Config("chunk size exceeds 4 GiB".into()));
        }
        Ok(())
    }
}

/// A set of cooperating writers sharing one dataset.
///
/// Only the fill writer puts fill values on disk during bulk allocation;
/// everyone meets at `barrier()` afterwards.
pub trait WriterGroup: Send + Sync {
    fn is_fill_writer(&self) -> bool;

    fn barrier(&self) -> Result<()>;
}

/// Data transfer properties.
#[derive(Clone, Default)]
pub struct DatasetXferProps {
    /// Set when several writers may touch the dataset concurrently. Chunk
    /// I/O then bypasses the cache.
    pub multi_writer: Option<Arc<dyn WriterGroup>>,
}

impl DatasetXferProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn multi_writer(mut self, group: Arc<dyn WriterGroup>) -> Self {
        self.multi_writer = Some(group);
        self
    }

    pub fn is_multi_writer(&self) -> bool {
        self.multi_writer.is_some()
    }
}

impl fmt::Debug for DatasetXferProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetXferProps")
            .field("multi_writer", &self.is_multi_writer())
            .finish()
    }
}

/// Block allocator alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorProps {
    /// Requests of at least this many bytes are aligned.
    pub threshold: u64,
    /// Alignment in bytes; 1 disables alignment.
    pub alignment: u64,
}

impl Default for AllocatorProps {
    fn default() -> Self {
        Self {
            threshold: 1,
            alignment: 1,
        }
    }
}

impl AllocatorProps {
    pub fn new(threshold: u64, alignment: u64) -> Self {
        Self {
            threshold,
            alignment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 {
            return Err(Error::Config("alignment must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults() {
        let p = ChunkCacheProps::new();
        assert_eq!(p.nslots, 521);
        assert_eq!(p.nbytes, 1 << 20);
        assert_eq!(p.w0, 0.75);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn cache_w0_range() {
        assert!(ChunkCacheProps::new().w0(1.5).validate().is_err());
        assert!(ChunkCacheProps::new().w0(-0.1).validate().is_err());
        assert!(ChunkCacheProps::new().w0(f64::NAN).validate().is_err());
        assert!(ChunkCacheProps::new().w0(0.0).validate().is_ok());
    }

    #[test]
    fn dcpl_builder() {
        let p = DatasetCreateProps::new(&[4, 4], 8)
            .fill_time(FillTime::Alloc)
            .fill_value(&[1; 8])
            .index_k(4);
        assert_eq!(p.layout_dims(), vec![4, 4, 8]);
        assert!(p.fill_policy().fills_on_alloc());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn dcpl_rejects_bad_fill_value() {
        let p = DatasetCreateProps::new(&[4], 8).fill_value(&[1, 2]);
        assert!(matches!(p.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn dcpl_rejects_zero_dims() {
        assert!(DatasetCreateProps::new(&[4, 0], 1).validate().is_err());
        assert!(DatasetCreateProps::new(&[], 1).validate().is_err());
        assert!(DatasetCreateProps::new(&[4], 0).validate().is_err());
        assert!(DatasetCreateProps::new(&[65536, 65536], 8).validate().is_err());
    }

    #[test]
    fn dcpl_index_k_range() {
        let p = DatasetCreateProps::new(&[4], 1);
        assert!(matches!(p.clone().index_k(0).validate(), Err(Error::Config(_))));
        assert!(matches!(p.clone().index_k(MAX_K + 1).validate(), Err(Error::Config(_))));
        assert!(p.index_k(MAX_K).validate().is_ok());
    }

    #[test]
    fn xfer_default_is_single_writer() {
        assert!(!DatasetXferProps::new().is_multi_writer());
    }
}
