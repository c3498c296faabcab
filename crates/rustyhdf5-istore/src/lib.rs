//! Chunked ("indexed") dataset storage for HDF5.
//!
//! A chunked dataset is split into equally sized hyper-rectangular chunks.
//! This crate keeps track of where each chunk lives in the file and moves
//! chunk bytes between the file and caller buffers:
//!
//! - [`chunk_index`] maps chunk offsets to file addresses with a B-tree
//!   ([`btree`]) keyed by [`chunk_key::ChunkKey`].
//! - [`chunk_cache`] holds decoded chunks in direct-mapped hash slots with
//!   LRU eviction, running the filter pipeline on load and write-back.
//! - [`chunk_io`] performs ragged scatter/gather reads and writes of one
//!   chunk through the cache or straight to storage.
//! - [`allocate`] and [`extent`] handle eager allocation and extent changes.
//! - [`storage::ChunkStorage`] ties them together for one dataset.
//!
//! File space comes from a [`block_store::BlockStore`].
//!
//! ```no_run
//! use rustyhdf5_istore::{ChunkCacheProps, ChunkStorage, DatasetCreateProps, MemBlockStore};
//!
//! let dcpl = DatasetCreateProps::new(&[4, 4], 8);
//! let mut ds = ChunkStorage::create(MemBlockStore::new(), &[16, 16], dcpl, ChunkCacheProps::new())?;
//! ds.write_chunk(&[0, 0], &[0x11; 128])?;
//! assert_eq!(ds.read_chunk(&[0, 0])?, vec![0x11; 128]);
//! let (_store, _layout) = ds.close()?;
//! # Ok::<(), rustyhdf5_istore::Error>(())
//! ```

pub mod allocate;
pub mod block_store;
pub mod btree;
pub mod chunk_cache;
pub mod chunk_index;
pub mod chunk_io;
pub mod chunk_key;
pub mod error;
pub mod extent;
pub mod fill;
pub mod io_vec;
pub mod layout;
pub mod property_list;
pub mod storage;

pub use block_store::{BlockStore, FileBlockStore, FreeSpace, MemBlockStore, UNDEFINED_ADDR};
pub use chunk_cache::{CacheEntry, CacheStats, ChunkCache, ChunkContext, ChunkLock, EntryId};
pub use chunk_index::{ChunkIndex, ChunkInfo};
pub use chunk_key::ChunkKey;
pub use error::{Error, Result};
pub use fill::{AllocTime, FillPolicy, FillTime, FillValue};
pub use io_vec::{IoVec, Segment};
pub use layout::ChunkLayout;
pub use property_list::{
    AllocatorProps, ChunkCacheProps, DatasetCreateProps, DatasetXferProps, WriterGroup,
};
pub use storage::ChunkStorage;

pub use rustyhdf5_filters::{Filter, FilterDirection, FilterPipeline, FilterRegistry};
