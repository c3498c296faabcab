//! Generic ordered index with HDF5 version 1 B-tree persistence.
//!
//! The tree holds `n` children separated by `n + 1` keys; child `i` covers
//! keys in `[keys[i], keys[i + 1])`. What a key means, how it compares, and
//! what happens on insert and remove is decided by a [`BTreeClass`].
//!
//! In memory the tree is kept flat. When persisted it is written as
//! `TREE` nodes of at most `2K` entries per node, leaves first, with
//! internal levels above them until a single root remains. Each node takes
//! exactly the bytes its entry count needs, so a tree can be loaded without
//! knowing the `K` it was written with:
//!
//! ```text
//! "TREE" | node type (1) | level (1) | entries used (u16)
//!        | left sibling (u64) | right sibling (u64)
//!        | key 0 | child 0 | key 1 | child 1 | ... | key n
//! ```

use std::cmp::Ordering;

use tracing::debug;

use crate::block_store::{BlockStore, UNDEFINED_ADDR};
use crate::error::{Error, Result};

const NODE_MAGIC: &[u8; 4] = b"TREE";
const NODE_HEADER_SIZE: usize = 24;

/// Largest `K` whose `2K` entries still fit the node header's `u16` count.
pub const MAX_K: u16 = u16::MAX / 2;

/// Where a new child goes relative to existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewNodeOp {
    /// The tree is empty.
    First,
    /// Left of every existing child.
    Left,
    /// Right of every existing child.
    Right,
}

/// Result of [`BTreeClass::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<K> {
    /// Nothing structural changed.
    Noop,
    /// The child moved to a new address.
    Change { addr: u64 },
    /// A new child goes right of the current one, starting at `md_key`.
    Right { md_key: K, addr: u64 },
}

/// Whether [`BTree::iterate`] should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStep {
    Continue,
    Stop,
}

/// Callbacks that give a [`BTree`] its meaning.
pub trait BTreeClass {
    type Key: Clone + std::fmt::Debug;
    type Udata;

    /// Node type byte written to every node.
    const NODE_TYPE: u8;

    /// Raw size of one key.
    fn key_size(&self) -> usize;

    fn encode_key(&self, key: &Self::Key, buf: &mut Vec<u8>);

    fn decode_key(&self, raw: &[u8]) -> Result<Self::Key>;

    fn cmp2(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Place the search target in `udata` relative to `[lt, rt)`.
    fn cmp3(&self, lt: &Self::Key, udata: &Self::Udata, rt: &Self::Key) -> Ordering;

    /// The search landed on child `addr`; return whether it really holds
    /// the target, filling `udata` when it does.
    fn found(&self, addr: u64, lt: &Self::Key, udata: &mut Self::Udata) -> bool;

    /// Create a child for a target that lies outside every existing child.
    /// Returns the child's left key, address and right key.
    fn new_node(
        &self,
        store: &mut dyn BlockStore,
        op: NewNodeOp,
        udata: &mut Self::Udata,
    ) -> Result<(Self::Key, u64, Self::Key)>;

    /// The target falls within child `addr`. May rewrite `lt`.
    fn insert(
        &self,
        store: &mut dyn BlockStore,
        addr: u64,
        lt: &mut Self::Key,
        udata: &mut Self::Udata,
        rt: &Self::Key,
    ) -> Result<InsertOutcome<Self::Key>>;

    /// Release child `addr`. Returns false when the child does not hold
    /// the target and must stay.
    fn remove(
        &self,
        store: &mut dyn BlockStore,
        addr: u64,
        lt: &Self::Key,
        udata: &mut Self::Udata,
    ) -> Result<bool>;
}

enum Position {
    Within(usize),
    Before,
    After,
}

/// Ordered index over child addresses.
#[derive(Debug)]
pub struct BTree<C: BTreeClass> {
    class: C,
    k: u16,
    keys: Vec<C::Key>,
    children: Vec<u64>,
    /// Extents of the nodes last written or loaded, as (addr, len).
    nodes: Vec<(u64, u64)>,
    root: Option<u64>,
    dirty: bool,
}

impl<C: BTreeClass> BTree<C> {
    /// An empty tree whose nodes hold at most `2 * k` children. `k` is
    /// clamped to `1..=MAX_K`.
    pub fn new(class: C, k: u16) -> Self {
        Self {
            class,
            k: k.clamp(1, MAX_K),
            keys: Vec::new(),
            children: Vec::new(),
            nodes: Vec::new(),
            root: None,
            dirty: false,
        }
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Root node address as of the last persist or load.
    pub fn root(&self) -> Option<u64> {
        self.root
    }

    /// True when the in-memory tree differs from what was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn locate(&self, udata: &C::Udata) -> Position {
        let n = self.children.len();
        let (mut lo, mut hi) = (0, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.class.cmp3(&self.keys[mid], udata, &self.keys[mid + 1]) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Position::Within(mid),
            }
        }
        if lo == 0 {
            Position::Before
        } else {
            Position::After
        }
    }

    /// Look up the target in `udata`.
    pub fn find(&self, udata: &mut C::Udata) -> bool {
        if self.children.is_empty() {
            return false;
        }
        match self.locate(udata) {
            Position::Within(i) => self.class.found(self.children[i], &self.keys[i], udata),
            Position::Before | Position::After => false,
        }
    }

    /// Insert or update the target in `udata`.
    pub fn insert(&mut self, store: &mut dyn BlockStore, udata: &mut C::Udata) -> Result<()> {
        if self.children.is_empty() {
            let (lt, addr, rt) = self.class.new_node(store, NewNodeOp::First, udata)?;
            self.keys = vec![lt, rt];
            self.children = vec![addr];
            self.dirty = true;
            return Ok(());
        }

        match self.locate(udata) {
            Position::Within(i) => {
                let (left, right) = self.keys.split_at_mut(i + 1);
                let outcome =
                    self.class
                        .insert(store, self.children[i], &mut left[i], udata, &right[0])?;
                match outcome {
                    InsertOutcome::Noop => {}
                    InsertOutcome::Change { addr } => self.children[i] = addr,
                    InsertOutcome::Right { md_key, addr } => {
                        self.keys.insert(i + 1, md_key);
                        self.children.insert(i + 1, addr);
                    }
                }
            }
            Position::Before => {
                let (lt, addr, _rt) = self.class.new_node(store, NewNodeOp::Left, udata)?;
                self.keys.insert(0, lt);
                self.children.insert(0, addr);
            }
            Position::After => {
                let (lt, addr, rt) = self.class.new_node(store, NewNodeOp::Right, udata)?;
                let last = self.keys.len() - 1;
                self.keys[last] = lt;
                self.keys.push(rt);
                self.children.push(addr);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove the target in `udata`. Returns whether a child was removed.
    pub fn remove(&mut self, store: &mut dyn BlockStore, udata: &mut C::Udata) -> Result<bool> {
        if self.children.is_empty() {
            return Ok(false);
        }
        let Position::Within(i) = self.locate(udata) else {
            return Ok(false);
        };
        if !self
            .class
            .remove(store, self.children[i], &self.keys[i], udata)?
        {
            return Ok(false);
        }
        self.children.remove(i);
        self.keys.remove(i);
        if self.children.is_empty() {
            self.keys.clear();
        }
        self.dirty = true;
        Ok(true)
    }

    /// Visit every child in key order with its left and right keys.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&C::Key, u64, &C::Key) -> Result<IterStep>,
    {
        for (i, &addr) in self.children.iter().enumerate() {
            if visit(&self.keys[i], addr, &self.keys[i + 1])? == IterStep::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Drop every child, calling `on_child` for each, and free all nodes.
    pub fn delete<F>(&mut self, store: &mut dyn BlockStore, mut on_child: F) -> Result<()>
    where
        F: FnMut(&mut dyn BlockStore, &C::Key, u64) -> Result<()>,
    {
        for (i, &addr) in self.children.iter().enumerate() {
            on_child(store, &self.keys[i], addr)?;
        }
        self.children.clear();
        self.keys.clear();
        self.free_nodes(store)?;
        self.dirty = false;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn node_capacity(&self) -> usize {
        2 * self.k as usize
    }

    /// Bytes of a node holding `entries` children.
    fn node_size(&self, entries: usize) -> usize {
        NODE_HEADER_SIZE + entries * 8 + (entries + 1) * self.class.key_size()
    }

    fn free_nodes(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        for (addr, len) in self.nodes.drain(..) {
            store.free(addr, len)?;
        }
        self.root = None;
        Ok(())
    }

    /// Write the tree out, replacing the previous copy. Returns the root
    /// address, or `None` for an empty tree.
    pub fn persist(&mut self, store: &mut dyn BlockStore) -> Result<Option<u64>> {
        if !self.dirty && (self.root.is_some() || self.children.is_empty()) {
            return Ok(self.root);
        }
        self.free_nodes(store)?;
        if self.children.is_empty() {
            self.dirty = false;
            return Ok(None);
        }

        let cap = self.node_capacity();
        let mut level: u8 = 0;
        let mut keys = self.keys.clone();
        let mut children = self.children.clone();

        loop {
            let groups: Vec<(usize, usize)> = (0..children.len())
                .step_by(cap)
                .map(|start| (start, (start + cap).min(children.len())))
                .collect();
            let mut addrs = Vec::with_capacity(groups.len());
            for &(start, end) in &groups {
                let node_size = self.node_size(end - start) as u64;
                let addr = store.allocate(node_size)?;
                self.nodes.push((addr, node_size));
                addrs.push(addr);
            }

            let mut parent_keys = Vec::with_capacity(groups.len() + 1);
            for (g, &(start, end)) in groups.iter().enumerate() {
                let left = if g > 0 { addrs[g - 1] } else { UNDEFINED_ADDR };
                let right = addrs.get(g + 1).copied().unwrap_or(UNDEFINED_ADDR);
                let raw = self.encode_node(level, left, right, &keys[start..=end], &children[start..end])?;
                store.write(addrs[g], &raw)?;
                parent_keys.push(keys[start].clone());
            }
            parent_keys.push(keys[children.len()].clone());
            debug!(level, nodes = addrs.len(), entries = children.len(), "index level written");

            if addrs.len() == 1 {
                self.root = Some(addrs[0]);
                break;
            }
            keys = parent_keys;
            children = addrs;
            level = level
                .checked_add(1)
                .ok_or_else(|| Error::Internal("index tree too deep".into()))?;
        }
        self.dirty = false;
        Ok(self.root)
    }

    fn encode_node(
        &self,
        level: u8,
        left: u64,
        right: u64,
        keys: &[C::Key],
        children: &[u64],
    ) -> Result<Vec<u8>> {
        let entries = u16::try_from(children.len())
            .map_err(|_| Error::Internal(format!("{} entries in one index node", children.len())))?;
        let mut raw = Vec::with_capacity(self.node_size(children.len()));
        raw.extend_from_slice(NODE_MAGIC);
        raw.push(C::NODE_TYPE);
        raw.push(level);
        raw.extend_from_slice(&entries.to_le_bytes());
        raw.extend_from_slice(&left.to_le_bytes());
        raw.extend_from_slice(&right.to_le_bytes());
        for (key, child) in keys.iter().zip(children) {
            self.class.encode_key(key, &mut raw);
            raw.extend_from_slice(&child.to_le_bytes());
        }
        if let Some(last) = keys.last() {
            self.class.encode_key(last, &mut raw);
        }
        Ok(raw)
    }

    /// Load a tree previously written by [`persist`](Self::persist). `k`
    /// only bounds the nodes of later persists.
    pub fn load(class: C, k: u16, store: &mut dyn BlockStore, root: u64) -> Result<Self> {
        let mut tree = Self::new(class, k);
        tree.load_node(store, root, None)?;
        tree.root = Some(root);
        tree.dirty = false;
        Ok(tree)
    }

    fn load_node(&mut self, store: &mut dyn BlockStore, addr: u64, expect_level: Option<u8>) -> Result<()> {
        let mut header = [0u8; NODE_HEADER_SIZE];
        store.read(addr, &mut header)?;
        if &header[..4] != NODE_MAGIC {
            return Err(Error::Layout(format!("bad index node signature at {addr:#x}")));
        }
        if header[4] != C::NODE_TYPE {
            return Err(Error::Layout(format!(
                "index node at {addr:#x} has type {}, expected {}",
                header[4],
                C::NODE_TYPE
            )));
        }
        let level = header[5];
        if expect_level.is_some_and(|l| l != level) {
            return Err(Error::Layout(format!(
                "index node at {addr:#x} has level {level}, expected {expect_level:?}"
            )));
        }
        let entries = u16::from_le_bytes([header[6], header[7]]) as usize;
        if entries == 0 {
            return Err(Error::Layout(format!("index node at {addr:#x} is empty")));
        }

        let size = self.node_size(entries);
        let mut raw = vec![0u8; size];
        store.read(addr, &mut raw)?;
        self.nodes.push((addr, size as u64));

        let key_size = self.class.key_size();
        let mut pos = NODE_HEADER_SIZE;
        let mut keys = Vec::with_capacity(entries + 1);
        let mut children = Vec::with_capacity(entries);
        for _ in 0..entries {
            keys.push(self.class.decode_key(&raw[pos..pos + key_size])?);
            pos += key_size;
            let mut child = [0u8; 8];
            child.copy_from_slice(&raw[pos..pos + 8]);
            children.push(u64::from_le_bytes(child));
            pos += 8;
        }
        keys.push(self.class.decode_key(&raw[pos..pos + key_size])?);

        if level == 0 {
            // Consecutive leaves share a boundary key.
            if !self.keys.is_empty() {
                self.keys.pop();
            }
            self.keys.extend(keys);
            self.children.extend(children);
        } else {
            for child in children {
                self.load_node(store, child, Some(level - 1))?;
            }
        }
        Ok(())
    }
}
