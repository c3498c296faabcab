//! Ordered filter pipelines with per-chunk skip masks.
//!
//! Bit `i` of a chunk's filter mask is set when filter `i` was not applied
//! to that chunk. Optional filters that fail on the forward path set their
//! bit and are skipped; mandatory filters fail the whole operation. On the
//! reverse path every unmasked filter must succeed.

use std::borrow::Cow;

use tracing::{trace, warn};

use crate::error::FilterError;
use crate::filter::{
    FilterDirection, FilterRegistry, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE,
};

/// Flag bit marking a filter as optional.
pub const FLAG_OPTIONAL: u16 = 0x0001;

/// Widest supported pipeline; bounded by the 32-bit skip mask.
pub const MAX_FILTERS: usize = 32;

/// One pipeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    /// Filter identification value.
    pub filter_id: u16,
    /// Optional name override.
    pub name: Option<String>,
    /// Flags; see [`FLAG_OPTIONAL`].
    pub flags: u16,
    /// Filter-specific parameters.
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    pub fn new(filter_id: u16, flags: u16, client_data: Vec<u32>) -> Self {
        Self {
            filter_id,
            name: None,
            flags,
            client_data,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.flags & FLAG_OPTIONAL != 0
    }
}

/// An ordered list of filters applied to every chunk of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescription>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Append an arbitrary filter.
    pub fn with_filter(mut self, filter_id: u16, flags: u16, client_data: Vec<u32>) -> Self {
        self.filters
            .push(FilterDescription::new(filter_id, flags, client_data));
        self
    }

    pub fn with_shuffle(self) -> Self {
        self.with_filter(FILTER_SHUFFLE, 0, Vec::new())
    }

    pub fn with_deflate(self, level: u32) -> Self {
        self.with_filter(FILTER_DEFLATE, 0, vec![level])
    }

    pub fn with_fletcher32(self) -> Self {
        self.with_filter(FILTER_FLETCHER32, 0, Vec::new())
    }

    /// Check the pipeline fits in a skip mask.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.filters.len() > MAX_FILTERS {
            return Err(FilterError::TooManyFilters(self.filters.len()));
        }
        Ok(())
    }

    /// Run `input` through the pipeline.
    ///
    /// Forward runs filters in order and updates `mask` with any optional
    /// filters that were skipped. Reverse runs filters backwards, skipping
    /// those already set in `mask`. The input is never modified.
    pub fn apply(
        &self,
        registry: &FilterRegistry,
        direction: FilterDirection,
        element_size: usize,
        mask: &mut u32,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError> {
        self.validate()?;
        match direction {
            FilterDirection::Forward => self.forward(registry, element_size, mask, input),
            FilterDirection::Reverse => self.reverse(registry, element_size, *mask, input, None),
        }
    }

    /// Reverse pass for a chunk known to decode to `decoded_size` bytes.
    ///
    /// Each stage is told how much it may produce: `decoded_size` for the
    /// first filter, then twice the previous bound plus 64 bytes for each
    /// later one, which covers the growth of every built-in filter. A
    /// corrupt stored chunk fails there instead of inflating without limit.
    pub fn reverse_bounded(
        &self,
        registry: &FilterRegistry,
        element_size: usize,
        mask: u32,
        input: &[u8],
        decoded_size: usize,
    ) -> Result<Vec<u8>, FilterError> {
        self.validate()?;
        self.reverse(registry, element_size, mask, input, Some(decoded_size))
    }

    fn forward(
        &self,
        registry: &FilterRegistry,
        element_size: usize,
        mask: &mut u32,
        input: &[u8],
    ) -> Result<Vec<u8>, FilterError> {
        let mut buf = Cow::Borrowed(input);
        for (i, desc) in self.filters.iter().enumerate() {
            let bit = 1u32 << i;
            if *mask & bit != 0 {
                continue;
            }
            let outcome = match registry.get(desc.filter_id) {
                Some(filter) => filter
                    .apply(FilterDirection::Forward, &desc.client_data, element_size, &buf)
                    .and_then(|out| {
                        if out.is_empty() && !buf.is_empty() {
                            Err(FilterError::EmptyOutput { id: desc.filter_id })
                        } else {
                            Ok(out)
                        }
                    }),
                None => Err(FilterError::Unsupported(desc.filter_id)),
            };
            match outcome {
                Ok(out) => {
                    trace!(filter = desc.filter_id, in_len = buf.len(), out_len = out.len(), "filter applied");
                    buf = Cow::Owned(out);
                }
                Err(err) if desc.is_optional() => {
                    warn!(filter = desc.filter_id, error = %err, "optional filter skipped");
                    *mask |= bit;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(buf.into_owned())
    }

    fn reverse(
        &self,
        registry: &FilterRegistry,
        element_size: usize,
        mask: u32,
        input: &[u8],
        decoded_size: Option<usize>,
    ) -> Result<Vec<u8>, FilterError> {
        // bounds[i]: most that reversing filter i can legitimately yield
        let bounds: Vec<Option<usize>> = self
            .filters
            .iter()
            .scan(decoded_size, |bound, _| {
                let this = *bound;
                *bound = bound.map(|b| b.saturating_mul(2).saturating_add(64));
                Some(this)
            })
            .collect();

        let mut buf = Cow::Borrowed(input);
        for (i, desc) in self.filters.iter().enumerate().rev() {
            if mask & (1u32 << i) != 0 {
                continue;
            }
            let filter = registry
                .get(desc.filter_id)
                .ok_or(FilterError::Unsupported(desc.filter_id))?;
            let out = match bounds[i] {
                Some(max) => filter.apply_bounded(
                    FilterDirection::Reverse,
                    &desc.client_data,
                    element_size,
                    &buf,
                    max,
                )?,
                None => filter.apply(FilterDirection::Reverse, &desc.client_data, element_size, &buf)?,
            };
            if out.is_empty() && !buf.is_empty() {
                return Err(FilterError::EmptyOutput { id: desc.filter_id });
            }
            buf = Cow::Owned(out);
        }
        Ok(buf.into_owned())
    }
}
