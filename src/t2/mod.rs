//! Tier-2 coding: packet headers (code-block inclusion, zero bit
//! planes, pass counts, segment lengths) over the precinct tag trees,
//! for both the decoder and the encoder.

pub mod bitio;
pub mod packet_iter;
pub mod tag_tree;

use crate::error::{CodecError, Result};
use crate::tile::{Precinct, ResolutionLevel};
use bitio::{PacketBitReader, PacketBitWriter};
use tag_tree::TagTree;

/// One code-block's contribution signalled by a packet header.
#[derive(Debug, Clone, Copy)]
pub struct BlockContribution {
    pub band_index: u8,
    pub cblkno: u32,
    pub num_passes: u32,
    pub data_len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PacketHeader {
    pub empty: bool,
    pub contributions: Vec<BlockContribution>,
}

#[inline]
fn floor_log2(v: u32) -> u32 {
    debug_assert!(v > 0);
    31 - v.leading_zeros()
}

/// Coding-pass count code (Table B.4).
pub fn read_num_passes(bio: &mut PacketBitReader<'_>) -> Result<u32> {
    if bio.read_bit()? == 0 {
        return Ok(1);
    }
    if bio.read_bit()? == 0 {
        return Ok(2);
    }
    let n = bio.read_bits(2)?;
    if n != 3 {
        return Ok(3 + n);
    }
    let n = bio.read_bits(5)?;
    if n != 31 {
        return Ok(6 + n);
    }
    Ok(37 + bio.read_bits(7)?)
}

pub fn write_num_passes(bio: &mut PacketBitWriter, n: u32) {
    debug_assert!((1..=164).contains(&n));
    match n {
        1 => bio.write_bit(0),
        2 => {
            bio.write_bit(1);
            bio.write_bit(0);
        }
        3..=5 => {
            bio.write_bits(0b11, 2);
            bio.write_bits(n - 3, 2);
        }
        6..=36 => {
            bio.write_bits(0b11, 2);
            bio.write_bits(3, 2);
            bio.write_bits(n - 6, 5);
        }
        _ => {
            bio.write_bits(0b11, 2);
            bio.write_bits(3, 2);
            bio.write_bits(31, 5);
            bio.write_bits(n - 37, 7);
        }
    }
}

/// Parse one packet header for precinct `precno` of resolution `res`.
/// Creates the precinct state lazily on first touch and updates each
/// touched code-block's inclusion, bit-plane and pass bookkeeping.
/// With `keep` false the header is parsed for stream synchronisation
/// only: tag-tree and Lblock state advance but no passes are retained.
pub fn read_packet_header(
    bio: &mut PacketBitReader<'_>,
    res: &mut ResolutionLevel,
    resno: u8,
    precno: u64,
    layno: u16,
    keep: bool,
) -> Result<PacketHeader> {
    let mut header = PacketHeader::default();

    // zero-length packet bit
    if bio.read_bit()? == 0 {
        header.empty = true;
        bio.align()?;
        return Ok(header);
    }

    let num_bands = res.bands.len();
    for band_index in 0..num_bands {
        let prec_rect = res.precinct_rect(resno, band_index, precno);
        let (cbw_exp, cbh_exp) = (res.cbw_exp, res.cbh_exp);
        let band = &mut res.bands[band_index];
        if band.rect.is_empty() {
            continue;
        }
        let precinct = band.precincts[precno as usize]
            .get_or_insert_with(|| Precinct::new(prec_rect, cbw_exp, cbh_exp));
        let band_num_bps = band.num_bps;

        for cblkno in 0..precinct.cblks.len() as u32 {
            let first_time = !precinct.cblks[cblkno as usize].included;
            let included = if first_time {
                precinct
                    .incl_tree
                    .decode(bio, cblkno, layno as u32 + 1)?
            } else {
                bio.read_bit()? == 1
            };
            if !included {
                continue;
            }
            if first_time {
                let k_msbs = precinct.imsb_tree.decode_value(bio, cblkno)?;
                let cblk = &mut precinct.cblks[cblkno as usize];
                cblk.included = true;
                cblk.num_bps = (band_num_bps as u32).saturating_sub(k_msbs) as u8;
            }
            let num_passes = read_num_passes(bio)?;
            let cblk = &mut precinct.cblks[cblkno as usize];
            while bio.read_bit()? == 1 {
                cblk.lblock += 1;
            }
            let len_bits = cblk.lblock as u32 + floor_log2(num_passes);
            if len_bits > 32 {
                return Err(CodecError::malformed(
                    "packet",
                    bio.position() as u64,
                    format!("segment length of {len_bits} bits"),
                ));
            }
            let data_len = bio.read_bits(len_bits as u8)?;
            if keep {
                cblk.num_passes += num_passes;
            }
            header.contributions.push(BlockContribution {
                band_index: band_index as u8,
                cblkno,
                num_passes,
                data_len,
            });
        }
    }
    bio.align()?;
    Ok(header)
}

/// Encoder-side view of one code-block inside a precinct packet.
#[derive(Debug, Clone, Default)]
pub struct EncBlockInfo {
    pub included: bool,
    pub k_msbs: u32,
    pub num_passes: u32,
    pub data_len: u32,
    pub lblock: u8,
}

/// Encoder-side per-band packet state (single layer).
#[derive(Debug)]
pub struct EncBandPackets {
    pub incl_tree: TagTree,
    pub imsb_tree: TagTree,
    pub blocks: Vec<EncBlockInfo>,
}

impl EncBandPackets {
    pub fn new(grid_w: u32, grid_h: u32) -> Self {
        Self {
            incl_tree: TagTree::new(grid_w, grid_h),
            imsb_tree: TagTree::new(grid_w, grid_h),
            blocks: vec![EncBlockInfo::default(); (grid_w * grid_h) as usize],
        }
    }
}

/// Write one layer-0 packet header covering `bands`.
pub fn write_packet_header(bio: &mut PacketBitWriter, bands: &mut [EncBandPackets]) {
    let any = bands
        .iter()
        .any(|b| b.blocks.iter().any(|blk| blk.included));
    if !any {
        bio.write_bit(0);
        bio.flush();
        return;
    }
    bio.write_bit(1);
    for band in bands.iter_mut() {
        // all leaf values must be recorded before any encode so the
        // interior minima are final
        for cblkno in 0..band.blocks.len() as u32 {
            let info = band.blocks[cblkno as usize].clone();
            band.incl_tree
                .set_value(cblkno, if info.included { 0 } else { 1 });
            if info.included {
                band.imsb_tree.set_value(cblkno, info.k_msbs);
            }
        }
        for cblkno in 0..band.blocks.len() as u32 {
            let info = band.blocks[cblkno as usize].clone();
            band.incl_tree.encode(bio, cblkno, 1);
            if !info.included {
                continue;
            }
            band.imsb_tree.encode(bio, cblkno, u32::MAX);
            write_num_passes(bio, info.num_passes.max(1));

            let lblock = &mut band.blocks[cblkno as usize].lblock;
            if *lblock == 0 {
                *lblock = 3;
            }
            let pass_bits = floor_log2(info.num_passes.max(1));
            let needed = 32 - info.data_len.leading_zeros();
            let have = *lblock as u32 + pass_bits;
            let increment = needed.saturating_sub(have);
            for _ in 0..increment {
                bio.write_bit(1);
            }
            bio.write_bit(0);
            *lblock += increment as u8;
            bio.write_bits(info.data_len, (*lblock as u32 + pass_bits) as u8);
        }
    }
    bio.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::params::TileComponentCodingParams;
    use crate::tile::build_resolutions;

    #[test]
    fn pass_count_round_trip() {
        for n in [1u32, 2, 3, 4, 5, 6, 20, 36, 37, 100, 164] {
            let mut w = PacketBitWriter::new();
            write_num_passes(&mut w, n);
            let bytes = w.finish();
            let mut r = PacketBitReader::new(&bytes);
            assert_eq!(read_num_passes(&mut r).unwrap(), n, "n = {n}");
        }
    }

    fn one_res_level() -> ResolutionLevel {
        let tccp = TileComponentCodingParams {
            numresolutions: 1,
            cblkw: 4,
            cblkh: 4,
            numgbits: 1,
            ..Default::default()
        };
        let mut res = build_resolutions(Rect::new(0, 0, 16, 16), &tccp, 8).unwrap();
        res.remove(0)
    }

    #[test]
    fn empty_packet_header_round_trip() {
        let mut bio = PacketBitWriter::new();
        let mut bands = vec![EncBandPackets::new(1, 1)];
        write_packet_header(&mut bio, &mut bands);
        let bytes = bio.finish();
        assert_eq!(bytes, vec![0x00]);

        let mut res = one_res_level();
        let mut reader = PacketBitReader::new(&bytes);
        let header = read_packet_header(&mut reader, &mut res, 0, 0, 0, true).unwrap();
        assert!(header.empty);
    }

    #[test]
    fn single_block_header_round_trip() {
        let mut bio = PacketBitWriter::new();
        let mut bands = vec![EncBandPackets::new(1, 1)];
        bands[0].blocks[0] = EncBlockInfo {
            included: true,
            k_msbs: 2,
            num_passes: 7,
            data_len: 345,
            lblock: 0,
        };
        write_packet_header(&mut bio, &mut bands);
        let bytes = bio.finish();

        let mut res = one_res_level();
        let mut reader = PacketBitReader::new(&bytes);
        let header = read_packet_header(&mut reader, &mut res, 0, 0, 0, true).unwrap();
        assert!(!header.empty);
        assert_eq!(header.contributions.len(), 1);
        let c = header.contributions[0];
        assert_eq!(c.num_passes, 7);
        assert_eq!(c.data_len, 345);
        // band M_b is numgbits + expn - 1 = 0 for the default zero
        // exponent; saturation keeps the plane count at zero
        let band = &res.bands[0];
        let prec = band.precincts[0].as_ref().unwrap();
        assert!(prec.cblks[0].included);
        assert_eq!(prec.cblks[0].num_passes, 7);
    }
}
