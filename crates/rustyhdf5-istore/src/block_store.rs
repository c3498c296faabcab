//! Byte-range block storage with a first-fit extent allocator.
//!
//! The chunk engine sees storage as opaque 64-bit addresses. A
//! [`BlockStore`] reads and writes byte ranges at those addresses and hands
//! out new extents. [`MemBlockStore`] keeps everything in a `Vec<u8>`;
//! [`FileBlockStore`] is backed by a regular file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::trace;

use crate::error::{Error, Result};
use crate::property_list::AllocatorProps;

/// The undefined address.
pub const UNDEFINED_ADDR: u64 = u64::MAX;

/// Returns true unless `addr` is [`UNDEFINED_ADDR`].
#[inline]
pub fn addr_defined(addr: u64) -> bool {
    addr != UNDEFINED_ADDR
}

/// A byte-range device with extent allocation.
pub trait BlockStore {
    /// Fill `buf` from `addr`.
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Reserve `len` bytes and return the start address.
    fn allocate(&mut self, len: u64) -> Result<u64>;

    /// Return an extent to the allocator.
    fn free(&mut self, addr: u64, len: u64) -> Result<()>;

    /// Push buffered writes down to the backing medium.
    fn flush(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// FreeSpace
// ---------------------------------------------------------------------------

/// First-fit allocator over a growing address space.
///
/// Free extents are kept sorted by start address and coalesced with their
/// neighbours. An extent that ends at the end of allocated space shrinks
/// that space instead of going on the free list.
#[derive(Debug, Clone)]
pub struct FreeSpace {
    free: BTreeMap<u64, u64>,
    eoa: u64,
    limit: Option<u64>,
    props: AllocatorProps,
}

impl FreeSpace {
    pub fn new(props: AllocatorProps) -> Self {
        Self::with_eoa(props, 0)
    }

    /// Allocator whose first `eoa` bytes are already in use.
    pub fn with_eoa(props: AllocatorProps, eoa: u64) -> Self {
        Self {
            free: BTreeMap::new(),
            eoa,
            limit: None,
            props,
        }
    }

    /// Cap the end of allocated space; requests past it fail with `NoSpace`.
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    /// End of allocated space.
    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Total bytes on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    fn align(&self, addr: u64, len: u64) -> u64 {
        let a = self.props.alignment;
        if a > 1 && len >= self.props.threshold {
            addr.div_ceil(a) * a
        } else {
            addr
        }
    }

    /// First free extent that fits `len` bytes, else the end of space.
    pub fn allocate(&mut self, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(Error::Internal("zero-length allocation".into()));
        }

        let fit = self.free.iter().find_map(|(&start, &size)| {
            let addr = self.align(start, len);
            (addr + len <= start + size).then_some((start, size, addr))
        });
        if let Some((start, size, addr)) = fit {
            self.free.remove(&start);
            if addr > start {
                self.free.insert(start, addr - start);
            }
            let end = start + size;
            if addr + len < end {
                self.free.insert(addr + len, end - addr - len);
            }
            trace!(addr, len, "allocated from free list");
            return Ok(addr);
        }

        let addr = self.align(self.eoa, len);
        let new_eoa = addr
            .checked_add(len)
            .ok_or(Error::NoSpace { requested: len })?;
        if self.limit.is_some_and(|limit| new_eoa > limit) {
            return Err(Error::NoSpace { requested: len });
        }
        if addr > self.eoa {
            let gap_start = self.eoa;
            self.eoa = new_eoa;
            self.insert_free(gap_start, addr - gap_start)?;
        } else {
            self.eoa = new_eoa;
        }
        trace!(addr, len, eoa = self.eoa, "allocated at end of space");
        Ok(addr)
    }

    /// Return `[addr, addr + len)`; double frees are `Internal` errors.
    pub fn free(&mut self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !addr_defined(addr) || addr + len > self.eoa {
            return Err(Error::Internal(format!(
                "free of [{addr:#x}, +{len}) outside allocated space"
            )));
        }
        self.insert_free(addr, len)?;
        trace!(addr, len, "freed");
        Ok(())
    }

    fn insert_free(&mut self, mut addr: u64, mut len: u64) -> Result<()> {
        if let Some((&prev, &prev_len)) = self.free.range(..=addr).next_back() {
            if prev + prev_len > addr {
                return Err(Error::Internal(format!("double free at {addr:#x}")));
            }
            if prev + prev_len == addr {
                self.free.remove(&prev);
                addr = prev;
                len += prev_len;
            }
        }
        if let Some((&next, &next_len)) = self.free.range(addr..).next() {
            if next < addr + len {
                return Err(Error::Internal(format!("double free at {next:#x}")));
            }
            if next == addr + len {
                self.free.remove(&next);
                len += next_len;
            }
        }
        if addr + len == self.eoa {
            self.eoa = addr;
        } else {
            self.free.insert(addr, len);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemBlockStore
// ---------------------------------------------------------------------------

/// In-memory block store.
///
/// Space that was allocated but never written reads back as zeros. Read and
/// write calls are counted so callers can observe how much I/O happened.
#[derive(Debug, Clone)]
pub struct MemBlockStore {
    data: Vec<u8>,
    space: FreeSpace,
    reads: usize,
    writes: usize,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::with_props(AllocatorProps::default())
    }

    /// Empty store whose allocator follows `props`.
    pub fn with_props(props: AllocatorProps) -> Self {
        Self {
            data: Vec::new(),
            space: FreeSpace::new(props),
            reads: 0,
            writes: 0,
        }
    }

    /// Store that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        let mut store = Self::new();
        store.space.set_limit(Some(limit));
        store
    }

    /// Number of `read` calls so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of `write` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    pub fn eoa(&self) -> u64 {
        self.space.eoa()
    }

    pub fn free_bytes(&self) -> u64 {
        self.space.free_bytes()
    }

    /// Raw bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn check_range(&self, addr: u64, len: usize) -> io::Result<usize> {
        let end = addr.checked_add(len as u64);
        match end {
            Some(end) if addr_defined(addr) && end <= self.space.eoa() => Ok(addr as usize),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "range outside allocated space",
            )),
        }
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(addr, buf.len()).map_err(|source| Error::Read {
            addr,
            len: buf.len(),
            source,
        })?;
        self.reads += 1;
        let avail = self.data.len().saturating_sub(start).min(buf.len());
        buf[..avail].copy_from_slice(&self.data[start..start + avail]);
        buf[avail..].fill(0);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let start = self.check_range(addr, data.len()).map_err(|source| Error::Write {
            addr,
            len: data.len(),
            source,
        })?;
        self.writes += 1;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn allocate(&mut self, len: u64) -> Result<u64> {
        self.space.allocate(len)
    }

    fn free(&mut self, addr: u64, len: u64) -> Result<()> {
        self.space.free(addr, len)?;
        // Keep the backing vector no longer than allocated space.
        let eoa = self.space.eoa() as usize;
        if self.data.len() > eoa {
            self.data.truncate(eoa);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileBlockStore
// ---------------------------------------------------------------------------

/// Block store backed by a file.
///
/// The free list lives in memory only; extents freed before the file is
/// closed are reused, anything still free at close is lost space.
#[derive(Debug)]
pub struct FileBlockStore {
    file: File,
    space: FreeSpace,
}

impl FileBlockStore {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_props(path, AllocatorProps::default())
    }

    pub fn create_with_props<P: AsRef<Path>>(path: P, props: AllocatorProps) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            space: FreeSpace::new(props),
        })
    }

    /// Open an existing file; new extents are appended after its current end.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            space: FreeSpace::with_eoa(AllocatorProps::default(), len),
        })
    }

    pub fn eoa(&self) -> u64 {
        self.space.eoa()
    }
}

impl BlockStore for FileBlockStore {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.file
            .seek(SeekFrom::Start(addr))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|source| Error::Read { addr, len, source })
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        self.file
            .seek(SeekFrom::Start(addr))
            .and_then(|_| self.file.write_all(data))
            .map_err(|source| Error::Write { addr, len, source })
    }

    fn allocate(&mut self, len: u64) -> Result<u64> {
        let addr = self.space.allocate(len)?;
        let eoa = self.space.eoa();
        if self.file.metadata()?.len() < eoa {
            self.file.set_len(eoa)?;
        }
        Ok(addr)
    }

    fn free(&mut self, addr: u64, len: u64) -> Result<()> {
        self.space.free(addr, len)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_and_reuses() {
        let mut fs = FreeSpace::new(AllocatorProps::default());
        let a = fs.allocate(100).unwrap();
        let b = fs.allocate(50).unwrap();
        assert_eq!((a, b), (0, 100));
        fs.free(a, 100).unwrap();
        assert_eq!(fs.free_bytes(), 100);
        let c = fs.allocate(60).unwrap();
        assert_eq!(c, 0);
        assert_eq!(fs.free_bytes(), 40);
        assert_eq!(fs.eoa(), 150);
    }

    #[test]
    fn free_at_end_shrinks_eoa() {
        let mut fs = FreeSpace::new(AllocatorProps::default());
        let a = fs.allocate(10).unwrap();
        let b = fs.allocate(10).unwrap();
        fs.free(a, 10).unwrap();
        fs.free(b, 10).unwrap();
        assert_eq!(fs.eoa(), 0);
        assert_eq!(fs.free_bytes(), 0);
    }

    #[test]
    fn neighbours_coalesce() {
        let mut fs = FreeSpace::new(AllocatorProps::default());
        let a = fs.allocate(10).unwrap();
        let b = fs.allocate(10).unwrap();
        let c = fs.allocate(10).unwrap();
        let _guard = fs.allocate(10).unwrap();
        fs.free(a, 10).unwrap();
        fs.free(c, 10).unwrap();
        fs.free(b, 10).unwrap();
        assert_eq!(fs.free_bytes(), 30);
        assert_eq!(fs.allocate(30).unwrap(), 0);
    }

    #[test]
    fn double_free_rejected() {
        let mut fs = FreeSpace::new(AllocatorProps::default());
        let a = fs.allocate(10).unwrap();
        fs.allocate(10).unwrap();
        fs.free(a, 10).unwrap();
        assert!(matches!(fs.free(a + 2, 4), Err(Error::Internal(_))));
    }

    #[test]
    fn alignment_above_threshold() {
        let props = AllocatorProps {
            alignment: 64,
            threshold: 32,
        };
        let mut fs = FreeSpace::new(props);
        assert_eq!(fs.allocate(8).unwrap(), 0);
        assert_eq!(fs.allocate(32).unwrap(), 64);
        // the gap went on the free list and small requests use it
        assert_eq!(fs.free_bytes(), 56);
        assert_eq!(fs.allocate(8).unwrap(), 8);
    }

    #[test]
    fn zero_length_is_internal() {
        let mut fs = FreeSpace::new(AllocatorProps::default());
        assert!(matches!(fs.allocate(0), Err(Error::Internal(_))));
    }

    #[test]
    fn mem_store_limit() {
        let mut store = MemBlockStore::with_limit(64);
        store.allocate(64).unwrap();
        assert!(matches!(
            store.allocate(1),
            Err(Error::NoSpace { requested: 1 })
        ));
    }

    #[test]
    fn mem_store_unwritten_reads_zero() {
        let mut store = MemBlockStore::new();
        let a = store.allocate(16).unwrap();
        store.write(a, &[7; 4]).unwrap();
        let mut buf = [0xFFu8; 16];
        store.read(a, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[7; 4]);
        assert_eq!(&buf[4..], &[0; 12]);
        assert_eq!((store.reads(), store.writes()), (1, 1));
    }

    #[test]
    fn mem_store_rejects_out_of_range() {
        let mut store = MemBlockStore::new();
        store.allocate(8).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(store.read(0, &mut buf), Err(Error::Read { .. })));
        assert!(matches!(store.write(4, &[0; 8]), Err(Error::Write { .. })));
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let mut store = FileBlockStore::create(&path).unwrap();
        let a = store.allocate(8).unwrap();
        let b = store.allocate(8).unwrap();
        store.write(b, b"abcdefgh").unwrap();
        store.write(a, b"01234567").unwrap();
        store.flush().unwrap();
        drop(store);

        let mut store = FileBlockStore::open(&path).unwrap();
        assert_eq!(store.eoa(), 16);
        let mut buf = [0u8; 8];
        store.read(b, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        assert_eq!(store.allocate(4).unwrap(), 16);
    }
}
