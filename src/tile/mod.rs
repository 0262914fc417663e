//! Per-tile structures: resolutions, sub-bands, precincts and
//! code-blocks, built from the tile-component coding parameters.

pub mod processor;
pub mod window;

use crate::error::{CodecError, Result};
use crate::geometry::Rect;
use crate::params::{TileComponentCodingParams, cblk_sty};
use crate::t2::tag_tree::TagTree;

/// One code-block within a precinct. Compressed segments accumulate
/// across layers; the decoded buffer is owned by the precinct until the
/// window blits it.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    /// Band-coordinate rectangle.
    pub rect: Rect,
    /// Block has appeared in some packet.
    pub included: bool,
    /// Magnitude bit planes: band M_b minus the signalled missing
    /// planes; valid once `included`.
    pub num_bps: u8,
    /// Segment-length state (B.10.7.1), starts at 3.
    pub lblock: u8,
    /// Total coding passes accumulated.
    pub num_passes: u32,
    /// Concatenated compressed segments.
    pub data: Vec<u8>,
}

impl CodeBlock {
    fn new(rect: Rect) -> Self {
        Self {
            rect,
            included: false,
            num_bps: 0,
            lblock: 3,
            num_passes: 0,
            data: Vec::new(),
        }
    }
}

/// A precinct of one band: the code-block grid plus the two tag trees
/// that code inclusion and zero-bit-plane counts.
#[derive(Debug, Clone)]
pub struct Precinct {
    /// Band-coordinate rectangle.
    pub rect: Rect,
    pub grid_w: u32,
    pub grid_h: u32,
    pub cblks: Vec<CodeBlock>,
    pub incl_tree: TagTree,
    pub imsb_tree: TagTree,
}

impl Precinct {
    pub fn new(rect: Rect, cbw_exp: u8, cbh_exp: u8) -> Self {
        let (grid_w, grid_h) = if rect.is_empty() {
            (0, 0)
        } else {
            let cbw = 1u32 << cbw_exp;
            let cbh = 1u32 << cbh_exp;
            (
                rect.x1.div_ceil(cbw) - (rect.x0 >> cbw_exp),
                rect.y1.div_ceil(cbh) - (rect.y0 >> cbh_exp),
            )
        };
        let mut cblks = Vec::with_capacity((grid_w * grid_h) as usize);
        for gy in 0..grid_h {
            for gx in 0..grid_w {
                let cbw = 1u32 << cbw_exp;
                let cbh = 1u32 << cbh_exp;
                let x0 = ((rect.x0 >> cbw_exp) + gx) << cbw_exp;
                let y0 = ((rect.y0 >> cbh_exp) + gy) << cbh_exp;
                let r = Rect::new(x0, y0, x0 + cbw, y0 + cbh).intersection(&rect);
                cblks.push(CodeBlock::new(r));
            }
        }
        Self {
            rect,
            grid_w,
            grid_h,
            cblks,
            incl_tree: TagTree::new(grid_w, grid_h),
            imsb_tree: TagTree::new(grid_w, grid_h),
        }
    }
}

/// One band of a resolution level.
#[derive(Debug, Clone)]
pub struct Band {
    /// Orientation: 0=LL (resolution 0 only), 1=HL, 2=LH, 3=HH.
    pub orientation: u8,
    /// Band-coordinate rectangle (equation B-15).
    pub rect: Rect,
    /// M_b magnitude bit planes signalled for the band.
    pub num_bps: u8,
    /// Irreversible reconstruction step size.
    pub stepsize: f32,
    /// Precincts by precinct index, created lazily when a packet
    /// touches them.
    pub precincts: Vec<Option<Precinct>>,
}

/// One resolution level of a tile component.
#[derive(Debug, Clone)]
pub struct ResolutionLevel {
    /// Resolution-coordinate rectangle.
    pub rect: Rect,
    /// Precinct exponents at this resolution (resolution coordinates).
    pub ppx: u8,
    pub ppy: u8,
    /// Precinct grid dimensions.
    pub pw: u32,
    pub ph: u32,
    /// Effective code-block exponents in band coordinates.
    pub cbw_exp: u8,
    pub cbh_exp: u8,
    pub bands: Vec<Band>,
}

impl ResolutionLevel {
    pub fn num_precincts(&self) -> u64 {
        self.pw as u64 * self.ph as u64
    }

    /// Band-coordinate rectangle of precinct `precno` within band
    /// `band_index` of this resolution.
    pub fn precinct_rect(&self, resno: u8, band_index: usize, precno: u64) -> Rect {
        let band = &self.bands[band_index];
        let px = (precno % self.pw as u64) as u32;
        let py = (precno / self.pw as u64) as u32;
        // band-domain precinct exponents: one less than the resolution
        // exponents except at resolution 0
        let (ppx, ppy) = if resno == 0 {
            (self.ppx, self.ppy)
        } else {
            (self.ppx - 1, self.ppy - 1)
        };
        let x0 = ((self.band_anchor_x(band) >> ppx) + px) << ppx;
        let y0 = ((self.band_anchor_y(band) >> ppy) + py) << ppy;
        Rect::new(x0, y0, x0 + (1 << ppx), y0 + (1 << ppy)).intersection(&band.rect)
    }

    fn band_anchor_x(&self, band: &Band) -> u32 {
        band.rect.x0
    }

    fn band_anchor_y(&self, band: &Band) -> u32 {
        band.rect.y0
    }
}

/// Build the resolution/band tree for one tile component.
pub fn build_resolutions(
    tilec_rect: Rect,
    tccp: &TileComponentCodingParams,
    comp_prec: u8,
) -> Result<Vec<ResolutionLevel>> {
    let numres = tccp.numresolutions;
    if numres == 0 || numres as usize > crate::params::MAX_RES {
        return Err(CodecError::ParameterOutOfRange(format!(
            "resolution count {numres}"
        )));
    }
    if !(2..=10).contains(&tccp.cblkw)
        || !(2..=10).contains(&tccp.cblkh)
        || tccp.cblkw + tccp.cblkh > 12
    {
        if tccp.cblk_sty & cblk_sty::HT == 0 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block exponents ({}, {})",
                tccp.cblkw, tccp.cblkh
            )));
        }
    }
    let mut resolutions = Vec::with_capacity(numres as usize);
    for resno in 0..numres {
        let n = (numres - 1 - resno) as u32;
        let rect = tilec_rect.scale_down_ceil_pow2(n);
        let ppx = tccp.precinct_width_exp[resno as usize];
        let ppy = tccp.precinct_height_exp[resno as usize];
        if resno != 0 && (ppx == 0 || ppy == 0) {
            // precinct exponent 0 only legal at the lowest resolution
            return Err(CodecError::ParameterOutOfRange(format!(
                "precinct exponent 0 at resolution {resno}"
            )));
        }
        let (pw, ph) = if rect.is_empty() {
            (0, 0)
        } else {
            (
                rect.x1.div_ceil(1 << ppx) - (rect.x0 >> ppx),
                rect.y1.div_ceil(1 << ppy) - (rect.y0 >> ppy),
            )
        };
        // effective code-block size never exceeds the band-domain
        // precinct size
        let band_ppx = if resno == 0 { ppx } else { ppx - 1 };
        let band_ppy = if resno == 0 { ppy } else { ppy - 1 };
        let cbw_exp = tccp.cblkw.min(band_ppx);
        let cbh_exp = tccp.cblkh.min(band_ppy);

        let orientations: &[u8] = if resno == 0 { &[0] } else { &[1, 2, 3] };
        let num_prec = pw as u64 * ph as u64;
        let mut bands = Vec::with_capacity(orientations.len());
        for &orientation in orientations {
            let nb = if resno == 0 {
                (numres - 1) as u32
            } else {
                (numres - resno) as u32
            };
            let band_rect = tilec_rect.band_window(nb, orientation);
            bands.push(Band {
                orientation,
                rect: band_rect,
                num_bps: tccp.band_num_bps(resno, orientation),
                stepsize: tccp.band_stepsize(comp_prec, resno, orientation),
                precincts: vec![None; num_prec as usize],
            });
        }
        resolutions.push(ResolutionLevel {
            rect,
            ppx,
            ppy,
            pw,
            ph,
            cbw_exp,
            cbh_exp,
            bands,
        });
    }
    Ok(resolutions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TileComponentCodingParams;

    fn tccp(numres: u8) -> TileComponentCodingParams {
        TileComponentCodingParams {
            numresolutions: numres,
            cblkw: 4,
            cblkh: 4,
            numgbits: 1,
            ..Default::default()
        }
    }

    #[test]
    fn single_resolution_has_only_ll() {
        let res = build_resolutions(Rect::new(0, 0, 16, 16), &tccp(1), 8).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].bands.len(), 1);
        assert_eq!(res[0].bands[0].orientation, 0);
        assert_eq!(res[0].bands[0].rect, Rect::new(0, 0, 16, 16));
    }

    #[test]
    fn two_level_band_geometry() {
        let res = build_resolutions(Rect::new(0, 0, 16, 16), &tccp(3), 8).unwrap();
        assert_eq!(res.len(), 3);
        // res 0: LL after two decompositions
        assert_eq!(res[0].rect, Rect::new(0, 0, 4, 4));
        // res 1 detail bands are 4x4, res 2 are 8x8
        assert_eq!(res[1].bands[0].rect.width(), 4);
        assert_eq!(res[2].bands[0].rect.width(), 8);
        // resolution rect doubles each level
        assert_eq!(res[1].rect, Rect::new(0, 0, 8, 8));
        assert_eq!(res[2].rect, Rect::new(0, 0, 16, 16));
    }

    #[test]
    fn default_precincts_are_one_per_resolution() {
        let res = build_resolutions(Rect::new(0, 0, 100, 80), &tccp(2), 8).unwrap();
        for r in &res {
            assert_eq!((r.pw, r.ph), (1, 1));
        }
    }

    #[test]
    fn explicit_precincts_partition_the_resolution() {
        let mut t = tccp(2);
        t.csty = crate::params::csty::PRT;
        t.precinct_width_exp = [5; crate::params::MAX_RES];
        t.precinct_height_exp = [5; crate::params::MAX_RES];
        let res = build_resolutions(Rect::new(0, 0, 100, 80), &t, 8).unwrap();
        // res 1 is 100x80: 4x3 precincts of 32
        assert_eq!((res[1].pw, res[1].ph), (4, 3));
        let rect = res[1].precinct_rect(1, 0, 5);
        // precinct 5 -> (px,py)=(1,1); band-domain exponent 4
        assert_eq!(rect, Rect::new(16, 16, 32, 32));
    }

    #[test]
    fn precinct_code_block_grid() {
        let p = Precinct::new(Rect::new(0, 0, 40, 24), 4, 4);
        assert_eq!((p.grid_w, p.grid_h), (3, 2));
        assert_eq!(p.cblks[0].rect, Rect::new(0, 0, 16, 16));
        assert_eq!(p.cblks[2].rect, Rect::new(32, 0, 40, 16));
        assert_eq!(p.cblks[5].rect, Rect::new(32, 16, 40, 24));
    }

    #[test]
    fn oversized_code_blocks_rejected() {
        let mut t = tccp(2);
        t.cblkw = 7;
        t.cblkh = 7;
        assert!(build_resolutions(Rect::new(0, 0, 8, 8), &t, 8).is_err());
    }
}
