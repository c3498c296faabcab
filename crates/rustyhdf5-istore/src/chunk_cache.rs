//! Raw data chunk cache.
//!
//! Decoded chunks are held in a fixed array of hash slots. A chunk's slot
//! is its linear chunk index modulo the slot count; when two chunks map to
//! the same slot the older one is evicted. Entries also sit on an LRU list
//! (head is least recently used) that drives eviction when the byte budget
//! runs out.
//!
//! Entries live in an arena and are addressed by [`EntryId`]; the LRU list
//! links ids, not pointers. A chunk is read or written between
//! [`ChunkCache::lock`] and [`ChunkCache::unlock`]. Locked entries are never
//! evicted. Chunks that cannot be cached are handed out as detached buffers
//! and written back on unlock.

use std::borrow::Cow;
use std::collections::HashSet;

use rustyhdf5_filters::{FilterDirection, FilterPipeline, FilterRegistry};
use tracing::{debug, error, trace, warn};

use crate::block_store::BlockStore;
use crate::chunk_index::ChunkIndex;
use crate::error::{Error, Result};
use crate::fill::FillPolicy;
use crate::layout::ChunkLayout;
use crate::property_list::{ChunkCacheProps, DatasetXferProps};

/// Handle of a cache entry.
pub type EntryId = usize;

/// Everything the cache needs from the dataset to load and write back
/// chunks.
pub struct ChunkContext<'a> {
    pub store: &'a mut dyn BlockStore,
    pub index: &'a mut ChunkIndex,
    pub layout: &'a ChunkLayout,
    pub pipeline: &'a FilterPipeline,
    pub registry: &'a FilterRegistry,
    pub fill: FillPolicy<'a>,
    pub xfer: &'a DatasetXferProps,
}

impl ChunkContext<'_> {
    /// Filter `buf` into a fresh buffer, record it in the index and write
    /// it. `buf` is left untouched whatever happens.
    pub fn write_back(&mut self, offset: &[u64], buf: &[u8]) -> Result<()> {
        let mut mask = 0u32;
        let filtered: Cow<'_, [u8]> = if self.pipeline.is_empty() {
            Cow::Borrowed(buf)
        } else {
            Cow::Owned(self.pipeline.apply(
                self.registry,
                FilterDirection::Forward,
                self.layout.element_size(),
                &mut mask,
                buf,
            )?)
        };
        let nbytes = u32::try_from(filtered.len())
            .map_err(|_| Error::Internal(format!("filtered chunk of {} bytes", filtered.len())))?;
        let addr = self.index.insert(&mut *self.store, offset, nbytes, mask)?;
        self.store.write(addr, &filtered)?;
        debug!(?offset, addr, bytes = nbytes, filter_mask = mask, "chunk written");
        Ok(())
    }

    /// Produce the decoded bytes of the chunk at `offset`, from storage or
    /// from the fill value. Returns the buffer and whether storage was read.
    fn load(&mut self, offset: &[u64]) -> Result<(Vec<u8>, bool)> {
        let chunk_size = self.layout.chunk_size();
        let Some(info) = self.index.get(offset) else {
            let mut buf = vec![0u8; chunk_size];
            if self.fill.fills_on_alloc() {
                self.fill.value.fill(&mut buf);
            }
            return Ok((buf, false));
        };

        let mut raw = vec![0u8; info.chunk_size as usize];
        self.store.read(info.address, &mut raw)?;
        let buf = if self.pipeline.is_empty() {
            raw
        } else {
            self.pipeline.reverse_bounded(
                self.registry,
                self.layout.element_size(),
                info.filter_mask,
                &raw,
                chunk_size,
            )?
        };
        if buf.len() != chunk_size {
            return Err(Error::Internal(format!(
                "chunk at {offset:?} decoded to {} bytes, expected {chunk_size}",
                buf.len()
            )));
        }
        Ok((buf, true))
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lock requests served from the cache, plus relaxed misses.
    pub hits: u64,
    /// Chunks read from storage.
    pub misses: u64,
    /// Chunks created from the fill value.
    pub inits: u64,
    /// Chunks written back.
    pub flushes: u64,
    /// Entries removed from the cache.
    pub evictions: u64,
}

/// One cached chunk.
#[derive(Debug)]
pub struct CacheEntry {
    offset: Vec<u64>,
    buf: Vec<u8>,
    chunk_size: usize,
    dirty: bool,
    locked: bool,
    /// Bytes not yet read. Eviction hint only.
    rd_count: usize,
    /// Bytes not yet written. Eviction hint only.
    wr_count: usize,
    slot: usize,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

impl CacheEntry {
    /// Chunk offset, element dimension included.
    pub fn offset(&self) -> &[u64] {
        &self.offset
    }

    /// Decoded chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether the buffer holds writes not yet in storage.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a caller holds the chunk between `lock` and `unlock`.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Bytes of the chunk not yet read since it was cached.
    pub fn rd_count(&self) -> usize {
        self.rd_count
    }

    /// Bytes of the chunk not yet written since it was cached.
    pub fn wr_count(&self) -> usize {
        self.wr_count
    }

    /// Fully read, fully written, or both.
    fn is_consumed(&self) -> bool {
        let size = self.chunk_size;
        (self.rd_count == 0 && self.wr_count == 0)
            || (self.rd_count == 0 && self.wr_count == size)
            || (self.rd_count == size && self.wr_count == 0)
    }
}

/// A locked chunk, returned by [`ChunkCache::lock`].
#[derive(Debug)]
pub enum ChunkLock {
    /// The chunk lives in the cache.
    Cached(EntryId),
    /// The chunk could not be cached; the caller holds the only copy.
    Detached { offset: Vec<u64>, buf: Vec<u8> },
}

/// The per-dataset chunk cache.
#[derive(Debug)]
pub struct ChunkCache {
    props: ChunkCacheProps,
    geometry: ChunkLayout,
    down_chunks: Vec<u64>,
    slots: Vec<Option<EntryId>>,
    entries: Vec<Option<CacheEntry>>,
    free_ids: Vec<EntryId>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    nbytes: usize,
    nused: usize,
    detached: HashSet<Vec<u64>>,
    stats: CacheStats,
}

impl ChunkCache {
    /// Empty cache for chunks of `layout` in a dataset of `extent`.
    pub fn new(props: ChunkCacheProps, layout: &ChunkLayout, extent: &[u64]) -> Self {
        Self {
            props,
            geometry: layout.clone(),
            down_chunks: layout.down_chunks(extent),
            slots: vec![None; props.nslots],
            entries: Vec::new(),
            free_ids: Vec::new(),
            head: None,
            tail: None,
            nbytes: 0,
            nused: 0,
            detached: HashSet::new(),
            stats: CacheStats::default(),
        }
    }

    /// The properties the cache was built with.
    pub fn props(&self) -> &ChunkCacheProps {
        &self.props
    }

    /// Bytes of chunk data currently cached.
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Number of cached chunks.
    pub fn nused(&self) -> usize {
        self.nused
    }

    /// Counters since the cache was created.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn slot_of(&self, offset: &[u64]) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = self.geometry.chunk_index(offset, &self.down_chunks);
        Some((idx % self.slots.len() as u64) as usize)
    }

    fn lookup(&self, offset: &[u64]) -> Option<EntryId> {
        let id = self.slots[self.slot_of(offset)?]?;
        let entry = self.entries[id].as_ref()?;
        (entry.offset == offset).then_some(id)
    }

    /// Whether the chunk at `offset` is in the cache.
    pub fn contains(&self, offset: &[u64]) -> bool {
        self.lookup(offset).is_some()
    }

    /// The entry behind `id`, if it is still cached.
    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(id)?.as_ref()
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Internal(format!("no cache entry {id}")))
    }

    /// Entry ids from least to most recently used.
    pub fn lru_ids(&self) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(self.nused);
        let mut cur = self.head;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.entries[id].as_ref().and_then(|e| e.next);
        }
        ids
    }

    /// Entries from least to most recently used.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> + '_ {
        self.lru_ids()
            .into_iter()
            .filter_map(move |id| self.entries[id].as_ref())
    }

    // -----------------------------------------------------------------------
    // LRU list
    // -----------------------------------------------------------------------

    fn unlink(&mut self, id: EntryId) {
        let (prev, next) = match self.entries[id].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.entries[p].as_mut() {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entries[n].as_mut() {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(e) = self.entries[id].as_mut() {
            e.prev = None;
            e.next = None;
        }
    }

    fn link_tail(&mut self, id: EntryId) {
        let old_tail = self.tail;
        if let Some(e) = self.entries[id].as_mut() {
            e.prev = old_tail;
            e.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(e) = self.entries[t].as_mut() {
                    e.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn touch(&mut self, id: EntryId) {
        if self.tail != Some(id) {
            self.unlink(id);
            self.link_tail(id);
        }
    }

    fn insert_entry(&mut self, offset: Vec<u64>, buf: Vec<u8>, slot: usize) -> EntryId {
        let chunk_size = buf.len();
        let entry = CacheEntry {
            offset,
            buf,
            chunk_size,
            dirty: false,
            locked: true,
            rd_count: chunk_size,
            wr_count: chunk_size,
            slot,
            prev: None,
            next: None,
        };
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.entries[id] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.link_tail(id);
        self.slots[slot] = Some(id);
        self.nbytes += chunk_size;
        self.nused += 1;
        id
    }

    // -----------------------------------------------------------------------
    // Lock / unlock
    // -----------------------------------------------------------------------

    /// Lock the chunk at `offset` (full `ndims` offset).
    ///
    /// With `relax` the caller promises to overwrite the whole chunk, so a
    /// miss skips both the storage read and fill.
    pub fn lock(&mut self, ctx: &mut ChunkContext<'_>, offset: &[u64], relax: bool) -> Result<ChunkLock> {
        if let Some(id) = self.lookup(offset) {
            let entry = self.entry_mut(id)?;
            if entry.locked {
                return Err(Error::ChunkLocked {
                    offset: offset.to_vec(),
                });
            }
            entry.locked = true;
            self.touch(id);
            self.stats.hits += 1;
            trace!(?offset, "chunk cache hit");
            return Ok(ChunkLock::Cached(id));
        }
        if self.detached.contains(offset) {
            return Err(Error::ChunkLocked {
                offset: offset.to_vec(),
            });
        }

        let chunk_size = ctx.layout.chunk_size();
        let buf = if relax {
            self.stats.hits += 1;
            vec![0u8; chunk_size]
        } else {
            let (buf, from_storage) = ctx.load(offset)?;
            if from_storage {
                self.stats.misses += 1;
                debug!(?offset, "chunk cache miss");
            } else {
                self.stats.inits += 1;
                debug!(?offset, "chunk initialized from fill value");
            }
            buf
        };

        if let Some(slot) = self.slot_of(offset) {
            if chunk_size <= self.props.nbytes {
                let occupant = self.slots[slot];
                let occupant_locked = occupant
                    .and_then(|id| self.entry(id))
                    .is_some_and(CacheEntry::is_locked);
                if !occupant_locked {
                    if let Some(old) = occupant {
                        self.preempt(ctx, old, true)?;
                    }
                    self.prune(ctx, chunk_size)?;
                    if self.nbytes + chunk_size <= self.props.nbytes {
                        let id = self.insert_entry(offset.to_vec(), buf, slot);
                        return Ok(ChunkLock::Cached(id));
                    }
                }
                warn!(?offset, "no unlocked cache entry to evict; chunk not cached");
            } else {
                debug!(?offset, chunk_size, capacity = self.props.nbytes, "chunk larger than cache");
            }
        }

        self.detached.insert(offset.to_vec());
        Ok(ChunkLock::Detached {
            offset: offset.to_vec(),
            buf,
        })
    }

    /// Bytes of a locked chunk.
    pub fn chunk_bytes<'a>(&'a self, lock: &'a ChunkLock) -> Result<&'a [u8]> {
        match lock {
            ChunkLock::Cached(id) => self
                .entry(*id)
                .map(|e| e.buf.as_slice())
                .ok_or_else(|| Error::Internal(format!("no cache entry {id}"))),
            ChunkLock::Detached { buf, .. } => Ok(buf),
        }
    }

    /// Mutable bytes of a locked chunk.
    pub fn chunk_bytes_mut<'a>(&'a mut self, lock: &'a mut ChunkLock) -> Result<&'a mut [u8]> {
        match lock {
            ChunkLock::Cached(id) => Ok(self.entry_mut(*id)?.buf.as_mut_slice()),
            ChunkLock::Detached { buf, .. } => Ok(buf),
        }
    }

    /// Release a chunk. `naccessed` bytes were read (or written when
    /// `dirty`). Detached dirty chunks are written back immediately.
    pub fn unlock(
        &mut self,
        ctx: &mut ChunkContext<'_>,
        lock: ChunkLock,
        dirty: bool,
        naccessed: usize,
    ) -> Result<()> {
        match lock {
            ChunkLock::Detached { offset, buf } => {
                self.detached.remove(&offset);
                if dirty {
                    ctx.write_back(&offset, &buf)?;
                    self.stats.flushes += 1;
                }
                Ok(())
            }
            ChunkLock::Cached(id) => {
                let entry = self.entry_mut(id)?;
                if dirty {
                    entry.dirty = true;
                    entry.wr_count = entry.wr_count.saturating_sub(naccessed);
                } else {
                    entry.rd_count = entry.rd_count.saturating_sub(naccessed);
                }
                entry.locked = false;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flush and eviction
    // -----------------------------------------------------------------------

    /// Write back entry `id` if dirty. With `reset` the buffer is released
    /// afterwards whether or not the write succeeded; only [`preempt`]
    /// resets, right before removing the entry.
    ///
    /// [`preempt`]: Self::preempt
    fn flush_entry(&mut self, ctx: &mut ChunkContext<'_>, id: EntryId, reset: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Internal(format!("no cache entry {id}")))?;
        let mut result = Ok(());
        if entry.dirty {
            result = ctx.write_back(&entry.offset, &entry.buf);
            if result.is_ok() {
                entry.dirty = false;
                self.stats.flushes += 1;
            }
        }
        if reset {
            if let Err(err) = &result {
                error!(offset = ?entry.offset, error = %err, "dirty chunk discarded after failed flush");
            }
            entry.buf = Vec::new();
        }
        result
    }

    /// Remove an unlocked entry, flushing it first when `flush` is set. The
    /// entry is gone even if the flush fails; the flush error is returned.
    pub fn preempt(&mut self, ctx: &mut ChunkContext<'_>, id: EntryId, flush: bool) -> Result<()> {
        if self.entry_mut(id)?.locked {
            return Err(Error::Internal(format!("attempt to evict locked cache entry {id}")));
        }
        let result = if flush {
            self.flush_entry(ctx, id, true)
        } else {
            Ok(())
        };
        self.remove_entry(id);
        result
    }

    fn remove_entry(&mut self, id: EntryId) {
        self.unlink(id);
        if let Some(entry) = self.entries[id].take() {
            if self.slots.get(entry.slot) == Some(&Some(id)) {
                self.slots[entry.slot] = None;
            }
            self.nbytes -= entry.chunk_size;
            self.nused -= 1;
            self.stats.evictions += 1;
            self.free_ids.push(id);
            debug!(offset = ?entry.offset, "chunk evicted");
        }
    }

    /// Evict entries until `size` more bytes fit.
    ///
    /// The oldest `w0` share of the LRU list is searched first for chunks
    /// that are fully consumed; after that any unlocked entry goes, oldest
    /// first.
    fn prune(&mut self, ctx: &mut ChunkContext<'_>, size: usize) -> Result<()> {
        let cap = self.props.nbytes;
        if self.nbytes + size <= cap {
            return Ok(());
        }
        let lru = self.lru_ids();
        let hinted = (self.nused as f64 * self.props.w0).floor() as usize;
        let mut first_err = None;

        for &id in lru.iter().take(hinted) {
            if self.nbytes + size <= cap {
                break;
            }
            let evict = self
                .entry(id)
                .is_some_and(|e| !e.locked && e.is_consumed());
            if evict {
                if let Err(e) = self.preempt(ctx, id, true) {
                    first_err.get_or_insert(e);
                }
            }
        }
        for &id in &lru {
            if self.nbytes + size <= cap {
                break;
            }
            if self.entry(id).is_some_and(|e| !e.locked) {
                if let Err(e) = self.preempt(ctx, id, true) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush every entry. With `invalidate` every entry is also evicted.
    /// Keeps going past failures and returns the first.
    pub fn flush_all(&mut self, ctx: &mut ChunkContext<'_>, invalidate: bool) -> Result<()> {
        let mut first_err = None;
        for id in self.lru_ids() {
            let result = if invalidate {
                self.preempt(ctx, id, true)
            } else {
                self.flush_entry(ctx, id, false)
            };
            if let Err(e) = result {
                warn!(error = %e, "chunk flush failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush and evict the chunk at `offset` if it is cached. Returns
    /// whether there was an entry.
    pub fn evict(&mut self, ctx: &mut ChunkContext<'_>, offset: &[u64]) -> Result<bool> {
        match self.lookup(offset) {
            Some(id) => self.preempt(ctx, id, true).map(|()| true),
            None => Ok(false),
        }
    }

    /// Mark every entry clean without writing anything.
    pub fn clear_dirty(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.dirty = false;
        }
    }

    /// Drop every entry without writing anything.
    pub fn discard_all(&mut self) {
        for id in self.lru_ids() {
            self.remove_entry(id);
        }
    }

    /// Evict, without flushing, every unlocked entry matching `pred`.
    pub fn discard_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&[u64]) -> bool,
    {
        let mut n = 0;
        for id in self.lru_ids() {
            let hit = self
                .entry(id)
                .is_some_and(|e| !e.locked && pred(&e.offset));
            if hit {
                self.remove_entry(id);
                n += 1;
            }
        }
        n
    }

    /// Re-slot every entry for a new dataset extent. An entry moving into
    /// an occupied slot evicts the occupant with a flush; when the occupant
    /// is locked the moving entry is flushed and evicted instead. Every
    /// entry is visited even after a failure; the first error is returned.
    pub fn rehash(&mut self, ctx: &mut ChunkContext<'_>, extent: &[u64]) -> Result<()> {
        self.down_chunks = self.geometry.down_chunks(extent);
        let mut first_err = None;
        for id in self.lru_ids() {
            let Some(entry) = self.entry(id) else {
                continue;
            };
            let (old_slot, offset, locked) = (entry.slot, entry.offset.clone(), entry.locked);
            let Some(new_slot) = self.slot_of(&offset) else {
                continue;
            };
            if new_slot == old_slot {
                continue;
            }
            if let Some(other) = self.slots[new_slot].filter(|&other| other != id) {
                let victim = match (self.entry(other).is_some_and(CacheEntry::is_locked), locked) {
                    (false, _) => other,
                    (true, false) => id,
                    (true, true) => {
                        warn!(?offset, new_slot, "both chunks locked; cache entry not moved");
                        first_err.get_or_insert(Error::Internal(format!(
                            "cannot re-slot locked chunk {offset:?}"
                        )));
                        continue;
                    }
                };
                if let Err(e) = self.preempt(ctx, victim, true) {
                    first_err.get_or_insert(e);
                }
                if victim == id {
                    continue;
                }
            }
            if self.slots[old_slot] == Some(id) {
                self.slots[old_slot] = None;
            }
            self.slots[new_slot] = Some(id);
            self.entry_mut(id)?.slot = new_slot;
            trace!(?offset, old_slot, new_slot, "cache entry moved");
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::MemBlockStore;
    use crate::fill::{FillTime, FillValue};

    struct Fixture {
        store: MemBlockStore,
        index: ChunkIndex,
        layout: ChunkLayout,
        pipeline: FilterPipeline,
        registry: FilterRegistry,
        fill: FillValue,
        xfer: DatasetXferProps,
    }

    impl Fixture {
        /// 2-D dataset, 2x2 chunks of 4-byte elements (16 bytes per chunk).
        fn new() -> Self {
            let layout = ChunkLayout::new(vec![2, 2, 4]).unwrap();
            Self {
                store: MemBlockStore::new(),
                index: ChunkIndex::create(&layout, 4),
                layout,
                pipeline: FilterPipeline::new(),
                registry: FilterRegistry::new(),
                fill: FillValue::User(vec![0xAB; 4]),
                xfer: DatasetXferProps::new(),
            }
        }

        fn ctx(&mut self) -> ChunkContext<'_> {
            ChunkContext {
                store: &mut self.store,
                index: &mut self.index,
                layout: &self.layout,
                pipeline: &self.pipeline,
                registry: &self.registry,
                fill: FillPolicy::new(FillTime::IfSet, &self.fill),
                xfer: &self.xfer,
            }
        }
    }

    fn props(nslots: usize, nbytes: usize) -> ChunkCacheProps {
        ChunkCacheProps::new().slots(nslots).bytes(nbytes)
    }

    fn write_chunk(cache: &mut ChunkCache, ctx: &mut ChunkContext<'_>, offset: &[u64], byte: u8) {
        let mut lock = cache.lock(ctx, offset, true).unwrap();
        cache.chunk_bytes_mut(&mut lock).unwrap().fill(byte);
        cache.unlock(ctx, lock, true, 16).unwrap();
    }

    fn read_chunk(cache: &mut ChunkCache, ctx: &mut ChunkContext<'_>, offset: &[u64]) -> Vec<u8> {
        let lock = cache.lock(ctx, offset, false).unwrap();
        let bytes = cache.chunk_bytes(&lock).unwrap().to_vec();
        cache.unlock(ctx, lock, false, 16).unwrap();
        bytes
    }

    #[test]
    fn miss_then_hit() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[0, 0, 0]), vec![0xAB; 16]);
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[0, 0, 0]), vec![0xAB; 16]);
        let stats = cache.stats();
        assert_eq!((stats.inits, stats.hits, stats.misses), (1, 1, 0));
        assert_eq!(cache.nused(), 1);
        assert_eq!(cache.nbytes(), 16);
    }

    #[test]
    fn relock_is_rejected() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        let lock = cache.lock(&mut ctx, &[0, 2, 0], false).unwrap();
        assert!(matches!(
            cache.lock(&mut ctx, &[0, 2, 0], false),
            Err(Error::ChunkLocked { .. })
        ));
        cache.unlock(&mut ctx, lock, false, 0).unwrap();
        assert!(cache.lock(&mut ctx, &[0, 2, 0], false).is_ok());
    }

    #[test]
    fn slot_collision_evicts_and_flushes() {
        let mut fx = Fixture::new();
        // one slot: every chunk collides
        let mut cache = ChunkCache::new(props(1, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[0, 0, 0], 1);
        write_chunk(&mut cache, &mut ctx, &[2, 0, 0], 2);
        assert_eq!(cache.nused(), 1);
        assert!(!cache.contains(&[0, 0, 0]));
        assert_eq!(fx.index.len(), 1);
        assert!(fx.index.get(&[0, 0, 0]).is_some());
    }

    #[test]
    fn capacity_is_respected() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(64, 48), &fx.layout, &[16, 16]);
        let mut ctx = fx.ctx();
        for i in 0..8u64 {
            write_chunk(&mut cache, &mut ctx, &[i * 2, 0, 0], i as u8);
            assert!(cache.nbytes() <= 48);
        }
        assert_eq!(cache.nused(), 3);
        cache.flush_all(&mut ctx, true).unwrap();
        assert_eq!(cache.nused(), 0);
        for i in 0..8u64 {
            assert_eq!(read_chunk(&mut cache, &mut ctx, &[i * 2, 0, 0]), vec![i as u8; 16]);
        }
    }

    #[test]
    fn lru_order_follows_access() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(64, 1024), &fx.layout, &[16, 16]);
        let mut ctx = fx.ctx();
        for i in 0..3u64 {
            read_chunk(&mut cache, &mut ctx, &[i * 2, 0, 0]);
        }
        read_chunk(&mut cache, &mut ctx, &[0, 0, 0]);
        let order: Vec<u64> = cache.entries().map(|e| e.offset()[0]).collect();
        assert_eq!(order, vec![2, 4, 0]);
    }

    #[test]
    fn flush_keeps_entries_usable() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[0, 0, 0], 5);
        cache.flush_all(&mut ctx, false).unwrap();
        assert_eq!(cache.nused(), 1);
        assert!(cache.entries().all(|e| !e.is_dirty() && e.chunk_size() == 16));

        // the buffer survived the flush: a partial write keeps the rest
        let mut lock = cache.lock(&mut ctx, &[0, 0, 0], false).unwrap();
        cache.chunk_bytes_mut(&mut lock).unwrap()[..4].fill(6);
        cache.unlock(&mut ctx, lock, true, 4).unwrap();
        cache.flush_all(&mut ctx, true).unwrap();
        assert_eq!(cache.nused(), 0);

        let mut expect = vec![5u8; 16];
        expect[..4].fill(6);
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[0, 0, 0]), expect);
        assert_eq!(cache.stats().flushes, 2);
    }

    #[test]
    fn consumed_chunks_go_first() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(64, 48).w0(1.0), &fx.layout, &[16, 16]);
        let mut ctx = fx.ctx();
        // A: partially read (not consumed), B: fully read (consumed), C: partially read
        for (i, n) in [(0u64, 4usize), (2, 16), (4, 4)] {
            let lock = cache.lock(&mut ctx, &[i, 0, 0], false).unwrap();
            cache.unlock(&mut ctx, lock, false, n).unwrap();
        }
        read_chunk(&mut cache, &mut ctx, &[6, 0, 0]);
        assert!(cache.contains(&[0, 0, 0]));
        assert!(!cache.contains(&[2, 0, 0]));
        assert!(cache.contains(&[4, 0, 0]));
    }

    #[test]
    fn pure_lru_when_w0_is_zero() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(64, 48).w0(0.0), &fx.layout, &[16, 16]);
        let mut ctx = fx.ctx();
        for (i, n) in [(0u64, 4usize), (2, 16), (4, 4)] {
            let lock = cache.lock(&mut ctx, &[i, 0, 0], false).unwrap();
            cache.unlock(&mut ctx, lock, false, n).unwrap();
        }
        read_chunk(&mut cache, &mut ctx, &[6, 0, 0]);
        assert!(!cache.contains(&[0, 0, 0]));
        assert!(cache.contains(&[2, 0, 0]));
    }

    #[test]
    fn oversized_chunk_is_detached_and_written_on_unlock() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 8), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        let mut lock = cache.lock(&mut ctx, &[0, 0, 0], true).unwrap();
        assert!(matches!(lock, ChunkLock::Detached { .. }));
        assert!(matches!(
            cache.lock(&mut ctx, &[0, 0, 0], false),
            Err(Error::ChunkLocked { .. })
        ));
        cache.chunk_bytes_mut(&mut lock).unwrap().fill(5);
        cache.unlock(&mut ctx, lock, true, 16).unwrap();
        assert_eq!(cache.nused(), 0);
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[0, 0, 0]), vec![5; 16]);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn locked_occupant_forces_detached() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(1, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        let held = cache.lock(&mut ctx, &[0, 0, 0], false).unwrap();
        let other = cache.lock(&mut ctx, &[2, 0, 0], false).unwrap();
        assert!(matches!(other, ChunkLock::Detached { .. }));
        cache.unlock(&mut ctx, other, false, 0).unwrap();
        cache.unlock(&mut ctx, held, false, 0).unwrap();
        assert!(cache.contains(&[0, 0, 0]));
    }

    #[test]
    fn preempt_locked_is_internal() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        let ChunkLock::Cached(id) = cache.lock(&mut ctx, &[0, 0, 0], false).unwrap() else {
            panic!("expected cached lock");
        };
        assert!(matches!(cache.preempt(&mut ctx, id, true), Err(Error::Internal(_))));
    }

    #[test]
    fn flush_keeps_entries_clean() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[0, 0, 0], 9);
        assert!(cache.entries().all(CacheEntry::is_dirty));
        cache.flush_all(&mut ctx, false).unwrap();
        assert_eq!(cache.nused(), 1);
        assert!(cache.entries().all(|e| !e.is_dirty()));
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn clear_dirty_writes_nothing() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(7, 1024), &fx.layout, &[8, 8]);
        {
            let mut ctx = fx.ctx();
            write_chunk(&mut cache, &mut ctx, &[0, 0, 0], 9);
            cache.clear_dirty();
            cache.flush_all(&mut ctx, true).unwrap();
        }
        assert!(fx.index.is_empty());
        assert_eq!(fx.store.writes(), 0);
    }

    #[test]
    fn rehash_moves_entries() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(5, 1024), &fx.layout, &[4, 4]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[0, 2, 0], 1);
        write_chunk(&mut cache, &mut ctx, &[2, 0, 0], 2);
        cache.rehash(&mut ctx, &[4, 8]).unwrap();
        assert!(cache.contains(&[0, 2, 0]));
        assert!(cache.contains(&[2, 0, 0]));
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[2, 0, 0]), vec![2; 16]);
        assert_eq!(cache.stats().hits, 3);
    }

    #[test]
    fn rehash_collision_flushes_occupant() {
        let mut fx = Fixture::new();
        // extent [4, 4]: chunks (0,0)->0 (0,1)->1 (1,0)->2 (1,1)->3
        let mut cache = ChunkCache::new(props(3, 1024), &fx.layout, &[4, 4]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[0, 2, 0], 1); // index 1, slot 1
        write_chunk(&mut cache, &mut ctx, &[2, 0, 0], 2); // index 2, slot 2
        // extent [4, 2]: (0,0)->0 (1,0)->1, so [2,0] moves onto [0,2]'s slot
        cache.rehash(&mut ctx, &[4, 2]).unwrap();
        assert!(cache.contains(&[2, 0, 0]));
        assert!(!cache.contains(&[0, 2, 0]));
        assert!(fx.index.get(&[0, 2, 0]).is_some());
    }

    #[test]
    fn rehash_onto_locked_occupant_evicts_mover() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(3, 1024), &fx.layout, &[4, 4]);
        let mut ctx = fx.ctx();
        write_chunk(&mut cache, &mut ctx, &[2, 0, 0], 2); // index 2, slot 2
        write_chunk(&mut cache, &mut ctx, &[0, 0, 0], 3); // index 0, slot 0
        let held = cache.lock(&mut ctx, &[0, 2, 0], false).unwrap(); // index 1, slot 1
        assert!(matches!(held, ChunkLock::Cached(_)));

        // [2,0] wants slot 1, held by the locked [0,2]
        cache.rehash(&mut ctx, &[4, 2]).unwrap();
        assert!(cache.contains(&[0, 2, 0]));
        assert!(cache.contains(&[0, 0, 0]));
        assert!(!cache.contains(&[2, 0, 0]));
        assert!(ctx.index.get(&[2, 0, 0]).is_some());

        cache.unlock(&mut ctx, held, false, 0).unwrap();
        assert_eq!(read_chunk(&mut cache, &mut ctx, &[2, 0, 0]), vec![2; 16]);
    }

    #[test]
    fn rehash_visits_every_entry_when_stuck() {
        let mut fx = Fixture::new();
        let mut cache = ChunkCache::new(props(3, 1024), &fx.layout, &[4, 4]);
        let mut ctx = fx.ctx();
        let mover = cache.lock(&mut ctx, &[2, 0, 0], false).unwrap(); // slot 2
        let occupant = cache.lock(&mut ctx, &[0, 2, 0], false).unwrap(); // slot 1
        write_chunk(&mut cache, &mut ctx, &[2, 2, 0], 4); // index 3, slot 0

        // extent [4, 2]: [2,0] wants slot 1 (both locked, stays put);
        // [2,2] wants slot 2, held by the locked [2,0], so [2,2] is flushed out
        assert!(matches!(cache.rehash(&mut ctx, &[4, 2]), Err(Error::Internal(_))));
        assert_eq!(cache.nused(), 2);
        assert!(cache.contains(&[0, 2, 0]));
        assert!(!cache.contains(&[2, 2, 0]));
        assert!(ctx.index.get(&[2, 2, 0]).is_some());

        cache.unlock(&mut ctx, occupant, false, 0).unwrap();
        cache.unlock(&mut ctx, mover, false, 0).unwrap();
    }
}
