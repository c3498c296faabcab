//! Error type for chunked storage operations.

use std::io;

use rustyhdf5_filters::FilterError;
use thiserror::Error;

/// Errors from the chunk index, chunk cache and chunk I/O paths.
#[derive(Debug, Error)]
pub enum Error {
    /// The block allocator could not satisfy a request.
    #[error("out of file space allocating {requested} bytes")]
    NoSpace { requested: u64 },

    #[error("block read of {len} bytes at {addr:#x} failed")]
    Read {
        addr: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("block write of {len} bytes at {addr:#x} failed")]
    Write {
        addr: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    /// A mandatory filter failed, or any filter failed while decoding.
    #[error("filter pipeline failed")]
    FilterFailed(#[from] FilterError),

    /// The chunk has no storage where storage was required.
    #[error("chunk at offset {offset:?} not found")]
    NotFound { offset: Vec<u64> },

    /// The chunk is already locked by the caller.
    #[error("chunk at offset {offset:?} is already locked")]
    ChunkLocked { offset: Vec<u64> },

    /// Filtered chunk I/O requested while multiple writers share the dataset.
    #[error("filtered chunk I/O is not allowed with multiple writers")]
    MultiWriterFilters,

    /// Malformed layout record or index node.
    #[error("invalid chunk layout: {0}")]
    Layout(String),

    /// Invalid property value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A geometry or bookkeeping invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = Error::NoSpace { requested: 64 };
        assert_eq!(e.to_string(), "out of file space allocating 64 bytes");
        let e = Error::NotFound { offset: vec![4, 0] };
        assert_eq!(e.to_string(), "chunk at offset [4, 0] not found");
        let e = Error::Read {
            addr: 0x40,
            len: 8,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        };
        assert_eq!(e.to_string(), "block read of 8 bytes at 0x40 failed");
    }

    #[test]
    fn filter_error_converts() {
        let e: Error = FilterError::Unsupported(7).into();
        assert!(matches!(e, Error::FilterFailed(FilterError::Unsupported(7))));
        assert!(std::error::Error::source(&e).is_some());
    }
}
