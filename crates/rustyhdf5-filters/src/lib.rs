//! Chunk filter pipeline for HDF5 chunked datasets.
//!
//! A [`FilterPipeline`] is an ordered list of filter ids plus parameters.
//! Filters are resolved through a [`FilterRegistry`], which starts out with
//! the built-in deflate, shuffle and fletcher32 filters and accepts
//! user-defined [`Filter`] implementations.
//!
//! Deflate uses `flate2` (zlib-ng with the `fast-deflate` feature, otherwise
//! miniz_oxide). The raw miniz_oxide functions stay available for
//! comparison and testing.

pub mod error;
pub mod fast_deflate;
pub mod filter;
pub mod pipeline;

pub use error::FilterError;
pub use filter::{
    fletcher32, Deflate, Filter, FilterDirection, FilterRegistry, Fletcher32, Shuffle,
    DEFAULT_DEFLATE_LEVEL, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE,
};
pub use pipeline::{FilterDescription, FilterPipeline, FLAG_OPTIONAL, MAX_FILTERS};

/// Decompress zlib data with the active backend.
///
/// When `max_output_size` > 0 the output buffer is pre-allocated.
pub fn deflate_decompress(data: &[u8], max_output_size: usize) -> Result<Vec<u8>, String> {
    fast_deflate::decompress(data, max_output_size)
}

/// Compress data with zlib using the active backend.
pub fn deflate_compress(data: &[u8], level: u32) -> Result<Vec<u8>, String> {
    fast_deflate::compress(data, level)
}

/// Name of the active deflate backend.
pub fn deflate_backend() -> &'static str {
    fast_deflate::active_backend()
}
