//! The chunk index: a B-tree from chunk offset to stored extent.
//!
//! Chunks are sparse. A chunk gets an entry the first time it is flushed or
//! bulk-allocated; chunks that were never written have no entry and read
//! back as fill.

use std::cmp::Ordering;

use tracing::debug;

use crate::block_store::{BlockStore, UNDEFINED_ADDR};
use crate::btree::{BTree, BTreeClass, InsertOutcome, IterStep, NewNodeOp};
use crate::chunk_key::{self, hyper_disjoint, ChunkKey};
use crate::error::{Error, Result};
use crate::layout::ChunkLayout;

/// Where a chunk lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Stored (filtered) size in bytes.
    pub chunk_size: u32,
    pub filter_mask: u32,
    /// Chunk offset, element dimension included.
    pub offsets: Vec<u64>,
    pub address: u64,
}

impl ChunkInfo {
    fn from_key(key: &ChunkKey, address: u64) -> Self {
        Self {
            chunk_size: key.nbytes,
            filter_mask: key.filter_mask,
            offsets: key.offset.clone(),
            address,
        }
    }
}

/// Search and insert state passed through the tree.
#[derive(Debug, Clone)]
pub struct IstoreUdata {
    pub key: ChunkKey,
    pub addr: u64,
}

impl IstoreUdata {
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            addr: UNDEFINED_ADDR,
        }
    }
}

/// B-tree callbacks for raw data chunks.
#[derive(Debug, Clone)]
pub struct IstoreClass {
    /// Chunk size per dimension, element dimension included.
    dims: Vec<u64>,
}

impl IstoreClass {
    pub fn new(layout: &ChunkLayout) -> Self {
        Self {
            dims: layout.dims.iter().map(|&d| u64::from(d)).collect(),
        }
    }

    fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Zero-width key marking the end of the chunk that starts at `offset`.
    fn right_of(&self, offset: &[u64]) -> ChunkKey {
        ChunkKey::at(
            &offset
                .iter()
                .zip(&self.dims)
                .map(|(&o, &d)| o.saturating_add(d))
                .collect::<Vec<_>>(),
        )
    }
}

impl BTreeClass for IstoreClass {
    type Key = ChunkKey;
    type Udata = IstoreUdata;

    const NODE_TYPE: u8 = 1;

    fn key_size(&self) -> usize {
        ChunkKey::encoded_size(self.ndims())
    }

    fn encode_key(&self, key: &ChunkKey, buf: &mut Vec<u8>) {
        key.encode_into(buf);
    }

    fn decode_key(&self, raw: &[u8]) -> Result<ChunkKey> {
        ChunkKey::decode(raw, self.ndims())
    }

    fn cmp2(&self, a: &ChunkKey, b: &ChunkKey) -> Ordering {
        chunk_key::cmp2(a, b)
    }

    fn cmp3(&self, lt: &ChunkKey, udata: &IstoreUdata, rt: &ChunkKey) -> Ordering {
        chunk_key::cmp3(lt, &udata.key, rt)
    }

    fn found(&self, addr: u64, lt: &ChunkKey, udata: &mut IstoreUdata) -> bool {
        // The search may land between two sparse chunks.
        let inside = udata
            .key
            .offset
            .iter()
            .zip(&lt.offset)
            .zip(&self.dims)
            .all(|((&t, &l), &d)| t >= l && t < l.saturating_add(d));
        if !inside {
            return false;
        }
        udata.addr = addr;
        udata.key.nbytes = lt.nbytes;
        udata.key.filter_mask = lt.filter_mask;
        true
    }

    fn new_node(
        &self,
        store: &mut dyn BlockStore,
        op: NewNodeOp,
        udata: &mut IstoreUdata,
    ) -> Result<(ChunkKey, u64, ChunkKey)> {
        let addr = store.allocate(u64::from(udata.key.nbytes))?;
        udata.addr = addr;
        debug!(offset = ?udata.key.offset, bytes = udata.key.nbytes, addr, ?op, "chunk allocated");
        let rt = self.right_of(&udata.key.offset);
        Ok((udata.key.clone(), addr, rt))
    }

    fn insert(
        &self,
        store: &mut dyn BlockStore,
        addr: u64,
        lt: &mut ChunkKey,
        udata: &mut IstoreUdata,
        rt: &ChunkKey,
    ) -> Result<InsertOutcome<ChunkKey>> {
        if lt.offset == udata.key.offset && lt.nbytes > 0 {
            lt.filter_mask = udata.key.filter_mask;
            if lt.nbytes == udata.key.nbytes {
                udata.addr = addr;
                return Ok(InsertOutcome::Noop);
            }
            // Stored size changed: move the chunk rather than grow in place.
            store.free(addr, u64::from(lt.nbytes))?;
            let new_addr = store.allocate(u64::from(udata.key.nbytes))?;
            debug!(
                offset = ?lt.offset,
                old = lt.nbytes,
                new = udata.key.nbytes,
                addr = new_addr,
                "chunk reallocated"
            );
            lt.nbytes = udata.key.nbytes;
            udata.addr = new_addr;
            return Ok(InsertOutcome::Change { addr: new_addr });
        }

        if hyper_disjoint(&lt.offset, &self.dims, &udata.key.offset, &self.dims)
            && hyper_disjoint(&rt.offset, &self.dims, &udata.key.offset, &self.dims)
        {
            let new_addr = store.allocate(u64::from(udata.key.nbytes))?;
            udata.addr = new_addr;
            debug!(offset = ?udata.key.offset, bytes = udata.key.nbytes, addr = new_addr, "chunk allocated");
            return Ok(InsertOutcome::Right {
                md_key: udata.key.clone(),
                addr: new_addr,
            });
        }

        Err(Error::Internal(format!(
            "chunk at {:?} overlaps index entries {:?} / {:?}",
            udata.key.offset, lt.offset, rt.offset
        )))
    }

    fn remove(
        &self,
        store: &mut dyn BlockStore,
        addr: u64,
        lt: &ChunkKey,
        udata: &mut IstoreUdata,
    ) -> Result<bool> {
        if lt.offset != udata.key.offset {
            return Ok(false);
        }
        store.free(addr, u64::from(lt.nbytes))?;
        udata.addr = addr;
        Ok(true)
    }
}

/// Index of every allocated chunk of one dataset.
#[derive(Debug)]
pub struct ChunkIndex {
    tree: BTree<IstoreClass>,
}

impl ChunkIndex {
    /// An empty index.
    pub fn create(layout: &ChunkLayout, k: u16) -> Self {
        Self {
            tree: BTree::new(IstoreClass::new(layout), k),
        }
    }

    /// Attach to the index recorded in `layout`, or start empty.
    pub fn open(store: &mut dyn BlockStore, layout: &ChunkLayout, k: u16) -> Result<Self> {
        let class = IstoreClass::new(layout);
        let tree = match layout.index_addr {
            Some(root) => BTree::load(class, k, store, root)?,
            None => BTree::new(class, k),
        };
        Ok(Self { tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Look up the chunk at `offset` (full `ndims` offset).
    pub fn get(&self, offset: &[u64]) -> Option<ChunkInfo> {
        let mut udata = IstoreUdata::new(ChunkKey::at(offset));
        self.tree
            .find(&mut udata)
            .then(|| ChunkInfo::from_key(&udata.key, udata.addr))
    }

    /// Address of the chunk at `offset`, or [`UNDEFINED_ADDR`].
    pub fn get_addr(&self, offset: &[u64]) -> u64 {
        self.get(offset).map_or(UNDEFINED_ADDR, |info| info.address)
    }

    /// Record that the chunk at `offset` is stored in `nbytes` bytes with
    /// `filter_mask`, allocating or moving its extent as needed. Returns
    /// the address to write the chunk at.
    pub fn insert(
        &mut self,
        store: &mut dyn BlockStore,
        offset: &[u64],
        nbytes: u32,
        filter_mask: u32,
    ) -> Result<u64> {
        let mut udata = IstoreUdata::new(ChunkKey {
            nbytes,
            filter_mask,
            offset: offset.to_vec(),
        });
        self.tree.insert(store, &mut udata)?;
        if udata.addr == UNDEFINED_ADDR {
            return Err(Error::Internal(format!(
                "index insert at {offset:?} produced no address"
            )));
        }
        Ok(udata.addr)
    }

    /// Remove the chunk at `offset` and free its extent.
    pub fn remove(&mut self, store: &mut dyn BlockStore, offset: &[u64]) -> Result<bool> {
        let mut udata = IstoreUdata::new(ChunkKey::at(offset));
        let removed = self.tree.remove(store, &mut udata)?;
        if removed {
            debug!(?offset, addr = udata.addr, "chunk removed from index");
        }
        Ok(removed)
    }

    /// Visit every chunk in offset order.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&ChunkInfo) -> Result<IterStep>,
    {
        self.tree
            .iterate(|lt, addr, _rt| visit(&ChunkInfo::from_key(lt, addr)))
    }

    pub fn entries(&self) -> Vec<ChunkInfo> {
        let mut out = Vec::with_capacity(self.len());
        // The visitor never fails.
        let _ = self.iterate(|info| {
            out.push(info.clone());
            Ok(IterStep::Continue)
        });
        out
    }

    /// Sum of stored chunk sizes.
    pub fn allocated_bytes(&self) -> u64 {
        self.entries()
            .iter()
            .map(|info| u64::from(info.chunk_size))
            .sum()
    }

    /// Write the index out; returns the root address.
    pub fn persist(&mut self, store: &mut dyn BlockStore) -> Result<Option<u64>> {
        self.tree.persist(store)
    }

    /// Free every chunk extent and every index node.
    pub fn delete(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let chunks = self.len();
        self.tree
            .delete(store, |store, key, addr| store.free(addr, u64::from(key.nbytes)))?;
        debug!(chunks, "chunk index deleted");
        Ok(())
    }
}
