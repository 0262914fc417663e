//! Tag trees (B.10.2): quad-trees over the code-block grid of a
//! precinct, coding code-block inclusion and zero-bit-plane counts in
//! packet headers.

use super::bitio::{PacketBitReader, PacketBitWriter};
use crate::error::Result;

const UNKNOWN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    value: u32,
    low: u32,
    known: bool,
    parent: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<Node>,
    leaves_w: u32,
    leaves_h: u32,
}

impl TagTree {
    /// Build a tree over a `w x h` leaf grid. Each level halves the
    /// grid (rounding up) until a single root remains.
    pub fn new(w: u32, h: u32) -> Self {
        let (w, h) = (w.max(1), h.max(1));
        let mut level_dims = vec![(w, h)];
        let (mut lw, mut lh) = (w, h);
        while lw > 1 || lh > 1 {
            lw = lw.div_ceil(2);
            lh = lh.div_ceil(2);
            level_dims.push((lw, lh));
        }
        let total: u32 = level_dims.iter().map(|&(a, b)| a * b).sum();
        let mut nodes = Vec::with_capacity(total as usize);
        let mut level_start = 0u32;
        for (lvl, &(cw, ch)) in level_dims.iter().enumerate() {
            let parent_start = level_start + cw * ch;
            for y in 0..ch {
                for x in 0..cw {
                    let parent = if lvl + 1 < level_dims.len() {
                        let (pw, _) = level_dims[lvl + 1];
                        Some(parent_start + (y / 2) * pw + x / 2)
                    } else {
                        None
                    };
                    nodes.push(Node {
                        value: UNKNOWN,
                        low: 0,
                        known: false,
                        parent,
                    });
                }
            }
            level_start = parent_start;
        }
        Self {
            nodes,
            leaves_w: w,
            leaves_h: h,
        }
    }

    pub fn num_leaves(&self) -> u32 {
        self.leaves_w * self.leaves_h
    }

    pub fn reset(&mut self) {
        for n in &mut self.nodes {
            n.value = UNKNOWN;
            n.low = 0;
            n.known = false;
        }
    }

    fn path_to_root(&self, leafno: u32) -> Vec<u32> {
        debug_assert!(leafno < self.num_leaves());
        let mut path = vec![leafno];
        let mut node = leafno;
        while let Some(p) = self.nodes[node as usize].parent {
            path.push(p);
            node = p;
        }
        path.reverse();
        path
    }

    /// Encoder side: record a leaf value and propagate the minimum up
    /// the tree.
    pub fn set_value(&mut self, leafno: u32, value: u32) {
        let mut node = Some(leafno);
        while let Some(i) = node {
            let n = &mut self.nodes[i as usize];
            if n.value != UNKNOWN && n.value <= value {
                break;
            }
            n.value = value;
            node = n.parent;
        }
    }

    pub fn value(&self, leafno: u32) -> u32 {
        self.nodes[leafno as usize].value
    }

    /// Emit the bits that resolve `leafno` against `threshold`.
    pub fn encode(&mut self, bio: &mut PacketBitWriter, leafno: u32, threshold: u32) {
        let mut low = 0u32;
        for i in self.path_to_root(leafno) {
            let node = &mut self.nodes[i as usize];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        bio.write_bit(1);
                        node.known = true;
                    }
                    break;
                }
                bio.write_bit(0);
                low += 1;
            }
            node.low = low;
        }
    }

    /// Consume bits resolving `leafno` against `threshold`; returns
    /// whether the leaf value is known to be below the threshold.
    pub fn decode(
        &mut self,
        bio: &mut PacketBitReader<'_>,
        leafno: u32,
        threshold: u32,
    ) -> Result<bool> {
        let path = self.path_to_root(leafno);
        let mut low = 0u32;
        let mut leaf_value = UNKNOWN;
        for i in path {
            let node = &mut self.nodes[i as usize];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if bio.read_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
            leaf_value = node.value;
        }
        Ok(leaf_value < threshold)
    }

    /// Fully resolve a leaf by raising the threshold until the value is
    /// pinned (used for zero-bit-plane counts).
    pub fn decode_value(&mut self, bio: &mut PacketBitReader<'_>, leafno: u32) -> Result<u32> {
        // No sane codestream carries values anywhere near this bound;
        // it only stops runaway zero runs in corrupt headers.
        const CAP: u32 = 1024;
        let mut k = 0u32;
        while !self.decode(bio, leafno, k)? {
            k += 1;
            if k > CAP {
                return Err(crate::error::CodecError::ParameterOutOfRange(
                    "tag tree value exceeds sanity bound".into(),
                ));
            }
        }
        Ok(k - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(w: u32, h: u32, values: &[u32]) {
        let mut enc = TagTree::new(w, h);
        for (i, &v) in values.iter().enumerate() {
            enc.set_value(i as u32, v);
        }
        let mut bio = PacketBitWriter::new();
        for i in 0..values.len() as u32 {
            enc.encode(&mut bio, i, u32::MAX);
        }
        let bytes = bio.finish();

        let mut dec = TagTree::new(w, h);
        let mut reader = PacketBitReader::new(&bytes);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(
                dec.decode_value(&mut reader, i as u32).unwrap(),
                v,
                "leaf {i}"
            );
        }
    }

    #[test]
    fn single_leaf() {
        round_trip(1, 1, &[3]);
    }

    #[test]
    fn square_grid() {
        round_trip(2, 2, &[1, 3, 2, 0]);
    }

    #[test]
    fn ragged_grid() {
        round_trip(3, 2, &[2, 2, 1, 0, 4, 3]);
    }

    #[test]
    fn thresholded_decode_matches_encode() {
        // Values decided only up to the threshold: leaf 0 (value 1) is
        // below threshold 2, leaf 1 (value 5) is not.
        let mut enc = TagTree::new(2, 1);
        enc.set_value(0, 1);
        enc.set_value(1, 5);
        let mut bio = PacketBitWriter::new();
        enc.encode(&mut bio, 0, 2);
        enc.encode(&mut bio, 1, 2);
        let bytes = bio.finish();

        let mut dec = TagTree::new(2, 1);
        let mut reader = PacketBitReader::new(&bytes);
        assert!(dec.decode(&mut reader, 0, 2).unwrap());
        assert!(!dec.decode(&mut reader, 1, 2).unwrap());
    }

    #[test]
    fn incremental_thresholds_share_state() {
        let mut enc = TagTree::new(1, 1);
        enc.set_value(0, 2);
        let mut bio = PacketBitWriter::new();
        // Emitting at rising thresholds reuses previously sent bits.
        enc.encode(&mut bio, 0, 1);
        enc.encode(&mut bio, 0, 2);
        enc.encode(&mut bio, 0, 3);
        let bytes = bio.finish();

        let mut dec = TagTree::new(1, 1);
        let mut reader = PacketBitReader::new(&bytes);
        assert!(!dec.decode(&mut reader, 0, 1).unwrap());
        assert!(!dec.decode(&mut reader, 0, 2).unwrap());
        assert!(dec.decode(&mut reader, 0, 3).unwrap());
    }
}
