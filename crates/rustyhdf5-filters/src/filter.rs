//! Individual filter stages and the registry that resolves filter ids.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::FilterError;
use crate::fast_deflate;

/// Deflate (zlib) filter id.
pub const FILTER_DEFLATE: u16 = 1;
/// Byte shuffle filter id.
pub const FILTER_SHUFFLE: u16 = 2;
/// Fletcher32 checksum filter id.
pub const FILTER_FLETCHER32: u16 = 3;

/// Default zlib level when the pipeline entry carries no client data.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Which way data flows through a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    /// Memory to storage (compress, checksum, ...).
    Forward,
    /// Storage to memory.
    Reverse,
}

/// A single transform stage.
///
/// Implementations take the input by reference and return a freshly
/// allocated output buffer, so a failing stage never disturbs its input.
pub trait Filter: Send + Sync {
    /// Filter identification value.
    fn id(&self) -> u16;

    /// Human readable name, used in log output.
    fn name(&self) -> &str;

    /// Run the filter over `input`.
    fn apply(
        &self,
        direction: FilterDirection,
        client_data: &[u32],
        element_size: usize,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError>;

    /// Like [`apply`](Self::apply), with `max_output` as an upper bound on
    /// what a correct reverse pass can produce. Filters that expand their
    /// input should stop and fail past it; the default ignores the bound.
    fn apply_bounded(
        &self,
        direction: FilterDirection,
        client_data: &[u32],
        element_size: usize,
        input: &[u8],
        max_output: usize,
    ) -> Result<Vec<u8>, FilterError> {
        let _ = max_output;
        self.apply(direction, client_data, element_size, input)
    }
}

/// Maps filter ids to implementations.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<u16, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// Registry with deflate, shuffle and fletcher32 registered.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Deflate));
        registry.register(Arc::new(Shuffle));
        registry.register(Arc::new(Fletcher32));
        registry
    }

    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Register a filter, replacing any previous filter with the same id.
    pub fn register(&mut self, filter: Arc<dyn Filter>) -> Option<Arc<dyn Filter>> {
        self.filters.insert(filter.id(), filter)
    }

    pub fn unregister(&mut self, id: u16) -> Option<Arc<dyn Filter>> {
        self.filters.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&Arc<dyn Filter>> {
        self.filters.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.filters.contains_key(&id)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u16> = self.filters.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

/// zlib compression. Level comes from `client_data[0]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deflate;

impl Filter for Deflate {
    fn id(&self) -> u16 {
        FILTER_DEFLATE
    }

    fn name(&self) -> &str {
        "deflate"
    }

    fn apply(
        &self,
        direction: FilterDirection,
        client_data: &[u32],
        _element_size: usize,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError> {
        match direction {
            FilterDirection::Forward => {
                let level = client_data.first().copied().unwrap_or(DEFAULT_DEFLATE_LEVEL);
                fast_deflate::compress(input, level).map_err(|e| FilterError::failed(FILTER_DEFLATE, e))
            }
            FilterDirection::Reverse => {
                fast_deflate::decompress(input, 0).map_err(|e| FilterError::failed(FILTER_DEFLATE, e))
            }
        }
    }

    fn apply_bounded(
        &self,
        direction: FilterDirection,
        client_data: &[u32],
        element_size: usize,
        input: &[u8],
        max_output: usize,
    ) -> Result<Vec<u8>, FilterError> {
        match direction {
            FilterDirection::Forward => self.apply(direction, client_data, element_size, input),
            FilterDirection::Reverse => fast_deflate::decompress_bounded(input, max_output)
                .map_err(|e| FilterError::failed(FILTER_DEFLATE, e)),
        }
    }
}

/// Byte shuffle: groups byte `j` of every element together.
///
/// The element size comes from `client_data[0]` when present, else from the
/// dataset's element size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shuffle;

impl Filter for Shuffle {
    fn id(&self) -> u16 {
        FILTER_SHUFFLE
    }

    fn name(&self) -> &str {
        "shuffle"
    }

    fn apply(
        &self,
        direction: FilterDirection,
        client_data: &[u32],
        element_size: usize,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError> {
        let size = client_data
            .first()
            .map(|&s| s as usize)
            .unwrap_or(element_size);
        match direction {
            FilterDirection::Forward => shuffle(input, size),
            FilterDirection::Reverse => unshuffle(input, size),
        }
    }
}

fn shuffle(data: &[u8], element_size: usize) -> Result<Vec<u8>, FilterError> {
    if element_size <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % element_size != 0 {
        return Err(FilterError::failed(
            FILTER_SHUFFLE,
            "data length not a multiple of element size",
        ));
    }
    let n = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..element_size {
            out[j * n + i] = data[i * element_size + j];
        }
    }
    Ok(out)
}

fn unshuffle(data: &[u8], element_size: usize) -> Result<Vec<u8>, FilterError> {
    if element_size <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % element_size != 0 {
        return Err(FilterError::failed(
            FILTER_SHUFFLE,
            "data length not a multiple of element size",
        ));
    }
    let n = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..element_size {
            out[i * element_size + j] = data[j * n + i];
        }
    }
    Ok(out)
}

/// HDF5 Fletcher32. Forward appends a little-endian checksum, reverse
/// verifies and strips it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fletcher32;

impl Filter for Fletcher32 {
    fn id(&self) -> u16 {
        FILTER_FLETCHER32
    }

    fn name(&self) -> &str {
        "fletcher32"
    }

    fn apply(
        &self,
        direction: FilterDirection,
        _client_data: &[u32],
        _element_size: usize,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError> {
        match direction {
            FilterDirection::Forward => {
                let mut out = Vec::with_capacity(input.len() + 4);
                out.extend_from_slice(input);
                out.extend_from_slice(&fletcher32(input).to_le_bytes());
                Ok(out)
            }
            FilterDirection::Reverse => {
                if input.len() < 4 {
                    return Err(FilterError::failed(
                        FILTER_FLETCHER32,
                        "data too short for checksum",
                    ));
                }
                let (payload, tail) = input.split_at(input.len() - 4);
                let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
                let computed = fletcher32(payload);
                if expected != computed {
                    return Err(FilterError::Fletcher32Mismatch { expected, computed });
                }
                Ok(payload.to_vec())
            }
        }
    }
}

/// Fletcher32 over big-endian 16-bit words, odd trailing byte padded with zero.
pub fn fletcher32(data: &[u8]) -> u32 {
    // 360 words is the largest block whose sums cannot overflow u32.
    const BLOCK_BYTES: usize = 720;

    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut blocks = data.chunks_exact(BLOCK_BYTES);
    for block in &mut blocks {
        for pair in block.chunks_exact(2) {
            sum1 += (u32::from(pair[0]) << 8) | u32::from(pair[1]);
            sum2 += sum1;
        }
        sum1 %= 65535;
        sum2 %= 65535;
    }
    for pair in blocks.remainder().chunks(2) {
        let hi = u32::from(pair[0]) << 8;
        let lo = pair.get(1).map_or(0, |&b| u32::from(b));
        sum1 = (sum1 + (hi | lo)) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}
