//! Chunk keys: ordering and raw encoding.
//!
//! A key is a chunk's minimum corner plus its stored size and filter mask.
//! Only the offset takes part in comparisons. On disk a key is
//!
//! ```text
//! stored size (u32) | filter mask (u32) | ndims x offset (u64)
//! ```
//!
//! with `ndims` taken from the index, not from the key.

use std::cmp::Ordering;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkKey {
    /// Bytes the chunk occupies on disk after filtering.
    pub nbytes: u32,
    /// Bit `i` set means filter `i` was skipped for this chunk.
    pub filter_mask: u32,
    /// Logical offset of the chunk's minimum corner, one entry per
    /// dimension including the element dimension.
    pub offset: Vec<u64>,
}

impl ChunkKey {
    /// A search key carrying only an offset.
    pub fn at(offset: &[u64]) -> Self {
        Self {
            nbytes: 0,
            filter_mask: 0,
            offset: offset.to_vec(),
        }
    }

    /// Raw key size for an index of `ndims` dimensions.
    pub fn encoded_size(ndims: usize) -> usize {
        8 + 8 * ndims
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.nbytes.to_le_bytes());
        buf.extend_from_slice(&self.filter_mask.to_le_bytes());
        for o in &self.offset {
            buf.extend_from_slice(&o.to_le_bytes());
        }
    }

    /// Decode a key of `ndims` offsets.
    pub fn decode(raw: &[u8], ndims: usize) -> Result<Self> {
        if raw.len() < Self::encoded_size(ndims) {
            return Err(Error::Layout(format!(
                "chunk key needs {} bytes, got {}",
                Self::encoded_size(ndims),
                raw.len()
            )));
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let offset = raw[8..8 + 8 * ndims]
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        Ok(Self {
            nbytes: word(0),
            filter_mask: word(4),
            offset,
        })
    }
}

/// Compare two keys by offset.
pub fn cmp2(a: &ChunkKey, b: &ChunkKey) -> Ordering {
    a.offset.cmp(&b.offset)
}

/// Place `target` relative to the half-open key range `[lt, rt)`.
///
/// `Less` when it sorts before `lt`, `Greater` when at or after `rt`,
/// `Equal` when it falls inside.
pub fn cmp3(lt: &ChunkKey, target: &ChunkKey, rt: &ChunkKey) -> Ordering {
    // Rank-1 datasets: the element coordinate is always zero.
    if target.offset.len() == 2 {
        return if target.offset[0] < lt.offset[0] {
            Ordering::Less
        } else if target.offset[0] >= rt.offset[0] {
            Ordering::Greater
        } else {
            Ordering::Equal
        };
    }
    if target.offset < lt.offset {
        Ordering::Less
    } else if target.offset >= rt.offset {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// True when the boxes `[o1, o1 + s1)` and `[o2, o2 + s2)` do not overlap
/// in at least one dimension. Empty boxes are disjoint from everything.
pub fn hyper_disjoint(o1: &[u64], s1: &[u64], o2: &[u64], s2: &[u64]) -> bool {
    if s1.contains(&0) || s2.contains(&0) {
        return true;
    }
    o1.iter()
        .zip(s1)
        .zip(o2.iter().zip(s2))
        .any(|((&a, &sa), (&b, &sb))| a.saturating_add(sa) <= b || b.saturating_add(sb) <= a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: &[u64]) -> ChunkKey {
        ChunkKey::at(offset)
    }

    #[test]
    fn lexicographic_order() {
        assert_eq!(cmp2(&key(&[0, 4, 0]), &key(&[4, 0, 0])), Ordering::Less);
        assert_eq!(cmp2(&key(&[4, 0, 0]), &key(&[0, 4, 0])), Ordering::Greater);
        assert_eq!(cmp2(&key(&[4, 4, 0]), &key(&[4, 4, 0])), Ordering::Equal);
    }

    #[test]
    fn payload_is_not_key_material() {
        let mut a = key(&[8, 0]);
        a.nbytes = 100;
        a.filter_mask = 3;
        assert_eq!(cmp2(&a, &key(&[8, 0])), Ordering::Equal);
    }

    #[test]
    fn three_way_general() {
        let lt = key(&[0, 4, 0]);
        let rt = key(&[4, 0, 0]);
        assert_eq!(cmp3(&lt, &key(&[0, 0, 0]), &rt), Ordering::Less);
        assert_eq!(cmp3(&lt, &key(&[0, 4, 0]), &rt), Ordering::Equal);
        assert_eq!(cmp3(&lt, &key(&[0, 8, 0]), &rt), Ordering::Equal);
        assert_eq!(cmp3(&lt, &key(&[4, 0, 0]), &rt), Ordering::Greater);
    }

    #[test]
    fn three_way_rank_one() {
        let lt = key(&[16, 0]);
        let rt = key(&[32, 0]);
        assert_eq!(cmp3(&lt, &key(&[8, 0]), &rt), Ordering::Less);
        assert_eq!(cmp3(&lt, &key(&[16, 0]), &rt), Ordering::Equal);
        assert_eq!(cmp3(&lt, &key(&[32, 0]), &rt), Ordering::Greater);
    }

    #[test]
    fn disjoint_boxes() {
        assert!(hyper_disjoint(&[0, 0], &[4, 4], &[4, 0], &[4, 4]));
        assert!(!hyper_disjoint(&[0, 0], &[4, 4], &[2, 2], &[4, 4]));
        assert!(hyper_disjoint(&[0, 0], &[0, 4], &[0, 0], &[4, 4]));
    }

    #[test]
    fn raw_layout() {
        let k = ChunkKey {
            nbytes: 0x10,
            filter_mask: 0x2,
            offset: vec![4, 0],
        };
        let mut raw = Vec::new();
        k.encode_into(&mut raw);
        assert_eq!(raw.len(), ChunkKey::encoded_size(2));
        assert_eq!(&raw[..8], &[0x10, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(ChunkKey::decode(&raw, 2).unwrap(), k);
        assert!(ChunkKey::decode(&raw[..10], 2).is_err());
    }
}
