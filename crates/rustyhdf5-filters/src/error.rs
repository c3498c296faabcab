//! Error type for filter pipeline operations.

use thiserror::Error;

/// Errors produced while running a chunk through the filter pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// No filter with this id is registered.
    #[error("filter {0} is not registered")]
    Unsupported(u16),
    /// A filter stage reported failure.
    #[error("filter {id} failed: {reason}")]
    Failed {
        /// Filter identification value.
        id: u16,
        /// What went wrong.
        reason: String,
    },
    /// A filter turned a non-empty buffer into zero bytes.
    #[error("filter {id} produced no output")]
    EmptyOutput {
        /// Filter identification value.
        id: u16,
    },
    /// Fletcher32 checksum mismatch on the reverse path.
    #[error("fletcher32 mismatch: stored {expected:#010x}, computed {computed:#010x}")]
    Fletcher32Mismatch {
        /// The checksum stored with the chunk.
        expected: u32,
        /// The checksum we computed.
        computed: u32,
    },
    /// The skip mask is 32 bits wide, so a pipeline holds at most 32 filters.
    #[error("pipeline has {0} filters, at most 32 are supported")]
    TooManyFilters(usize),
}

impl FilterError {
    pub(crate) fn failed(id: u16, reason: impl Into<String>) -> Self {
        FilterError::Failed {
            id,
            reason: reason.into(),
        }
    }
}
