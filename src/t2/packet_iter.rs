//! Packet iterator: enumerates (component, resolution, precinct,
//! layer) in the progression order, including compound orders from POC
//! markers applied in declaration order.
//!
//! Position-based orders (RPCL, PCRL, CPRL) walk precincts in canvas
//! raster order; the iterator carries an include set so overlapping
//! POC segments never emit the same packet twice. `next()` is a pull
//! operation returning false at exhaustion.

use crate::params::{Poc, ProgressionOrder, TileCodingParams};
use std::collections::HashSet;

/// Per-resolution precinct grid of one component, as seen by the
/// iterator.
#[derive(Debug, Clone)]
pub struct PiResolution {
    pub pw: u32,
    pub ph: u32,
    /// Canvas step between precinct origins.
    pub pdx: u64,
    pub pdy: u64,
    /// Canvas origin of precinct (0, 0).
    pub px0: u64,
    pub py0: u64,
}

#[derive(Debug, Clone)]
pub struct PiComponent {
    pub resolutions: Vec<PiResolution>,
}

/// One emitted packet coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCoord {
    pub compno: u16,
    pub resno: u8,
    pub precno: u64,
    pub layno: u16,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    compno: u16,
    resno: u8,
    precno: u64,
    pos_x: u64,
    pos_y: u64,
}

/// Where the layer loop sits relative to the precinct entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerPos {
    /// LRCP: layer outermost.
    Outer,
    /// RLCP: layer between the resolution groups and their entries.
    Middle,
    /// RPCL / PCRL / CPRL: layer innermost.
    Inner,
}

struct Segment {
    groups: Vec<Vec<Entry>>,
    layer_pos: LayerPos,
    lay_e: u16,
}

pub struct PacketIter {
    segments: Vec<Segment>,
    seg_idx: usize,
    group_idx: usize,
    entry_idx: usize,
    layno: u16,
    /// Dedup across POC segments; unused for a single segment.
    include: Option<HashSet<(u16, u8, u64, u16)>>,
    started: bool,
    current: PacketCoord,
}

impl PacketIter {
    /// Build the iterator for one tile from its TCP and precinct grids.
    pub fn new(tcp: &TileCodingParams, comps: &[PiComponent]) -> Self {
        // every signalled layer is iterated; a decode-layer cap only
        // stops data retention downstream, never header parsing
        let default_poc = Poc {
            res_s: 0,
            comp_s: 0,
            lay_e: tcp.numlayers,
            res_e: crate::params::MAX_RES as u8,
            comp_e: comps.len() as u16,
            order: tcp.prg,
        };
        let pocs: Vec<Poc> = if tcp.pocs.is_empty() {
            vec![default_poc]
        } else {
            tcp.pocs.clone()
        };
        let multi = pocs.len() > 1;
        let segments = pocs
            .iter()
            .map(|poc| Self::build_segment(poc, tcp, comps))
            .collect();
        Self {
            segments,
            seg_idx: 0,
            group_idx: 0,
            entry_idx: 0,
            layno: 0,
            include: if multi { Some(HashSet::new()) } else { None },
            started: false,
            current: PacketCoord {
                compno: 0,
                resno: 0,
                precno: 0,
                layno: 0,
            },
        }
    }

    fn build_segment(poc: &Poc, tcp: &TileCodingParams, comps: &[PiComponent]) -> Segment {
        let mut entries = Vec::new();
        let comp_e = (poc.comp_e as usize).min(comps.len());
        for compno in poc.comp_s as usize..comp_e {
            let comp = &comps[compno];
            let res_e = (poc.res_e as usize).min(comp.resolutions.len());
            for resno in poc.res_s as usize..res_e {
                let res = &comp.resolutions[resno];
                for py in 0..res.ph {
                    for px in 0..res.pw {
                        entries.push(Entry {
                            compno: compno as u16,
                            resno: resno as u8,
                            precno: py as u64 * res.pw as u64 + px as u64,
                            pos_x: res.px0 + px as u64 * res.pdx,
                            pos_y: res.py0 + py as u64 * res.pdy,
                        });
                    }
                }
            }
        }
        let lay_e = poc.lay_e.min(tcp.numlayers).max(1);
        let (layer_pos, groups) = match poc.order {
            ProgressionOrder::Lrcp => {
                entries.sort_by_key(|e| (e.resno, e.compno, e.precno));
                (LayerPos::Outer, vec![entries])
            }
            ProgressionOrder::Rlcp => {
                entries.sort_by_key(|e| (e.resno, e.compno, e.precno));
                let mut groups: Vec<Vec<Entry>> = Vec::new();
                for e in entries {
                    match groups.last_mut() {
                        Some(g) if g[0].resno == e.resno => g.push(e),
                        _ => groups.push(vec![e]),
                    }
                }
                (LayerPos::Middle, groups)
            }
            ProgressionOrder::Rpcl => {
                entries.sort_by_key(|e| (e.resno, e.pos_y, e.pos_x, e.compno));
                let mut groups: Vec<Vec<Entry>> = Vec::new();
                for e in entries {
                    match groups.last_mut() {
                        Some(g) if g[0].resno == e.resno => g.push(e),
                        _ => groups.push(vec![e]),
                    }
                }
                (LayerPos::Inner, groups)
            }
            ProgressionOrder::Pcrl => {
                entries.sort_by_key(|e| (e.pos_y, e.pos_x, e.compno, e.resno));
                (LayerPos::Inner, vec![entries])
            }
            ProgressionOrder::Cprl => {
                entries.sort_by_key(|e| (e.compno, e.pos_y, e.pos_x, e.resno));
                (LayerPos::Inner, vec![entries])
            }
        };
        Segment {
            groups,
            layer_pos,
            lay_e,
        }
    }

    /// Current packet coordinate; valid after `next()` returned true.
    pub fn current(&self) -> PacketCoord {
        self.current
    }

    /// Advance to the next packet. Returns false at exhaustion.
    pub fn next(&mut self) -> bool {
        loop {
            let Some(seg) = self.segments.get(self.seg_idx) else {
                return false;
            };
            if seg.groups.is_empty() || seg.groups.iter().all(|g| g.is_empty()) {
                self.advance_segment();
                continue;
            }
            if self.started {
                if !self.step_within_segment() {
                    self.advance_segment();
                    continue;
                }
            } else {
                self.started = true;
            }
            let seg = &self.segments[self.seg_idx];
            let entry = &seg.groups[self.group_idx][self.entry_idx];
            let coord = PacketCoord {
                compno: entry.compno,
                resno: entry.resno,
                precno: entry.precno,
                layno: self.layno,
            };
            if let Some(include) = self.include.as_mut() {
                if !include.insert((coord.compno, coord.resno, coord.precno, coord.layno)) {
                    continue; // already emitted by an earlier segment
                }
            }
            self.current = coord;
            return true;
        }
    }

    fn advance_segment(&mut self) {
        self.seg_idx += 1;
        self.group_idx = 0;
        self.entry_idx = 0;
        self.layno = 0;
        self.started = false;
    }

    /// One step of the three-axis odometer; false when the segment is
    /// exhausted.
    fn step_within_segment(&mut self) -> bool {
        let seg = &self.segments[self.seg_idx];
        match seg.layer_pos {
            LayerPos::Outer => {
                // entries innermost, layers outermost, single group
                self.entry_idx += 1;
                if self.entry_idx < seg.groups[0].len() {
                    return true;
                }
                self.entry_idx = 0;
                self.layno += 1;
                self.layno < seg.lay_e
            }
            LayerPos::Middle => {
                self.entry_idx += 1;
                if self.entry_idx < seg.groups[self.group_idx].len() {
                    return true;
                }
                self.entry_idx = 0;
                self.layno += 1;
                if self.layno < seg.lay_e {
                    return true;
                }
                self.layno = 0;
                self.group_idx += 1;
                self.group_idx < seg.groups.len()
            }
            LayerPos::Inner => {
                self.layno += 1;
                if self.layno < seg.lay_e {
                    return true;
                }
                self.layno = 0;
                self.entry_idx += 1;
                if self.entry_idx < seg.groups[self.group_idx].len() {
                    return true;
                }
                self.entry_idx = 0;
                self.group_idx += 1;
                self.group_idx < seg.groups.len()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TileCodingParams;

    fn grid(numres: usize, pw: u32, ph: u32) -> Vec<PiComponent> {
        vec![PiComponent {
            resolutions: (0..numres)
                .map(|r| PiResolution {
                    pw,
                    ph,
                    pdx: 64 << (numres - 1 - r),
                    pdy: 64 << (numres - 1 - r),
                    px0: 0,
                    py0: 0,
                })
                .collect(),
        }]
    }

    fn collect(iter: &mut PacketIter) -> Vec<PacketCoord> {
        let mut v = Vec::new();
        while iter.next() {
            v.push(iter.current());
        }
        v
    }

    #[test]
    fn lrcp_order_layer_outermost() {
        let mut tcp = TileCodingParams::new(1);
        tcp.numlayers = 2;
        let comps = grid(2, 1, 1);
        let mut it = PacketIter::new(&tcp, &comps);
        let seq = collect(&mut it);
        assert_eq!(seq.len(), 4);
        assert_eq!((seq[0].layno, seq[0].resno), (0, 0));
        assert_eq!((seq[1].layno, seq[1].resno), (0, 1));
        assert_eq!((seq[2].layno, seq[2].resno), (1, 0));
        assert_eq!((seq[3].layno, seq[3].resno), (1, 1));
    }

    #[test]
    fn rlcp_order_resolution_outermost() {
        let mut tcp = TileCodingParams::new(1);
        tcp.numlayers = 2;
        tcp.prg = crate::params::ProgressionOrder::Rlcp;
        let comps = grid(2, 1, 1);
        let mut it = PacketIter::new(&tcp, &comps);
        let seq = collect(&mut it);
        assert_eq!(seq.len(), 4);
        assert_eq!((seq[0].resno, seq[0].layno), (0, 0));
        assert_eq!((seq[1].resno, seq[1].layno), (0, 1));
        assert_eq!((seq[2].resno, seq[2].layno), (1, 0));
        assert_eq!((seq[3].resno, seq[3].layno), (1, 1));
    }

    #[test]
    fn rpcl_walks_precincts_in_raster_order() {
        let mut tcp = TileCodingParams::new(1);
        tcp.prg = crate::params::ProgressionOrder::Rpcl;
        let comps = grid(1, 2, 2);
        let mut it = PacketIter::new(&tcp, &comps);
        let seq = collect(&mut it);
        assert_eq!(seq.len(), 4);
        assert_eq!(
            seq.iter().map(|c| c.precno).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn total_packet_count() {
        let mut tcp = TileCodingParams::new(1);
        tcp.numlayers = 3;
        let comps = grid(3, 2, 1);
        let mut it = PacketIter::new(&tcp, &comps);
        // 3 layers x 3 resolutions x 2 precincts
        assert_eq!(collect(&mut it).len(), 18);
    }

    #[test]
    fn poc_segments_do_not_repeat_packets() {
        let mut tcp = TileCodingParams::new(1);
        tcp.numlayers = 1;
        tcp.pocs = vec![
            crate::params::Poc {
                res_s: 0,
                comp_s: 0,
                lay_e: 1,
                res_e: 1,
                comp_e: 1,
                order: crate::params::ProgressionOrder::Lrcp,
            },
            crate::params::Poc {
                res_s: 0,
                comp_s: 0,
                lay_e: 1,
                res_e: 2,
                comp_e: 1,
                order: crate::params::ProgressionOrder::Lrcp,
            },
        ];
        let comps = grid(2, 1, 1);
        let mut it = PacketIter::new(&tcp, &comps);
        let seq = collect(&mut it);
        // segment 1 emits res 0; segment 2 emits res 0 (deduped) + res 1
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].resno, 0);
        assert_eq!(seq[1].resno, 1);
    }
}
