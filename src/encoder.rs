//! JPEG 2000 encoder: forward DC shift and MCT, forward DWT,
//! quantization, EBCOT block coding and tag-tree packet headers.
//! Produces single-layer LRCP codestreams with default precincts,
//! enough for sample-exact reversible round trips over tile grids.

use crate::dwt::{self, LevelGeometry};
use crate::error::{CodecError, Result};
use crate::geometry::Rect;
use crate::image::J2kImage;
use crate::mct;
use crate::params::{QuantStyle, StepSize, BAND_GAIN};
use crate::quantization::quantize_scalar;
use crate::t1::block_coder::{num_bit_planes, BlockCoder};
use crate::t2::bitio::PacketBitWriter;
use crate::t2::{write_packet_header, EncBandPackets, EncBlockInfo};
use crate::tile::Precinct;
use crate::writer::J2kStreamWriter;
use log::warn;

#[derive(Debug, Clone)]
pub struct EncoderParams {
    /// DWT decomposition levels.
    pub decomposition_levels: u8,
    /// true = 5/3 reversible, false = 9/7 irreversible.
    pub reversible: bool,
    /// Apply the multi-component transform over the first three
    /// components.
    pub mct: bool,
    /// Code-block exponents (width, height), each 2..=10, sum <= 12.
    pub cblk_exp: (u8, u8),
    /// Guard bits signalled in the QCD marker.
    pub numgbits: u8,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            decomposition_levels: 5,
            reversible: true,
            mct: false,
            cblk_exp: (6, 6),
            numgbits: 2,
        }
    }
}

pub struct J2kEncoder {
    params: EncoderParams,
}

/// Sample plane handed to the wavelet stage; the irreversible colour
/// transform keeps floats to avoid a rounding step before the DWT.
enum PlaneInput {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

/// Coefficients of one band of one component, quantized to integers.
struct BandCoeffs {
    resno: u8,
    orientation: u8,
    rect: Rect,
    /// M_b the QCD marker signals for this band.
    num_bps: u8,
    data: Vec<i32>,
}

impl J2kEncoder {
    pub fn new(params: EncoderParams) -> Self {
        Self { params }
    }

    /// Step-size exponent signalled for a band. The reversible path
    /// carries two extra bits of headroom for the colour transform and
    /// the lifting growth; the irreversible path picks a step of 1/16
    /// so quantization noise stays below the rounding error.
    fn band_expn(&self, prec: u8, orientation: u8) -> u8 {
        let gain = BAND_GAIN[orientation as usize];
        let expn = if self.params.reversible {
            prec as u32 + gain as u32 + 2
        } else {
            prec as u32 + gain as u32 + 4
        };
        expn.min(31) as u8
    }

    fn stepsizes_for(&self, prec: u8) -> Vec<StepSize> {
        let mut v = vec![StepSize {
            expn: self.band_expn(prec, 0),
            mant: 0,
        }];
        for _ in 0..self.params.decomposition_levels {
            for orientation in 1..4u8 {
                v.push(StepSize {
                    expn: self.band_expn(prec, orientation),
                    mant: 0,
                });
            }
        }
        v
    }

    /// Encode a complete image (sample planes must be filled in).
    pub fn encode(&self, image: &J2kImage) -> Result<Vec<u8>> {
        image.validate()?;
        let (cbw, cbh) = self.params.cblk_exp;
        if !(2..=10).contains(&cbw) || !(2..=10).contains(&cbh) || cbw + cbh > 12 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block exponents ({cbw}, {cbh})"
            )));
        }
        for (i, c) in image.comps.iter().enumerate() {
            if c.data.len() != c.rect.area() as usize {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "component {i} sample plane does not cover its grid"
                )));
            }
        }
        let mct_on = self.params.mct && image.comps.len() >= 3;
        if self.params.mct && !mct_on {
            warn!("MCT requested with fewer than three components; encoding without it");
        }

        let mut w = J2kStreamWriter::new();
        w.write_soc();
        w.write_siz(image);
        w.write_cod(
            0, // LRCP
            1,
            mct_on as u8,
            self.params.decomposition_levels,
            cbw,
            cbh,
            self.params.reversible,
        );
        let qntsty = if self.params.reversible {
            QuantStyle::NoQnt
        } else {
            QuantStyle::SeQnt
        };
        // the QCD scope covers every component: signal exponents for
        // the deepest precision so M_b has headroom everywhere
        let pmax = image.comps.iter().map(|c| c.prec).max().unwrap_or(8);
        w.write_qcd(qntsty, self.params.numgbits, &self.stepsizes_for(pmax));

        let num_tiles = image.num_tiles() as u16;
        for t in 0..num_tiles {
            let packets = self.encode_tile(image, t, mct_on)?;
            let sot = w.write_sot(t, 0, 0, 1);
            w.write_sod();
            w.write_bytes(&packets);
            w.patch_psot(sot)?;
        }
        w.write_eoc();
        Ok(w.into_bytes())
    }

    /// DC shift, MCT, DWT and quantization for one tile, then packet
    /// assembly in LRCP order.
    fn encode_tile(&self, image: &J2kImage, tile_index: u16, mct_on: bool) -> Result<Vec<u8>> {
        let numres = self.params.decomposition_levels + 1;

        // extract and level-shift the tile planes
        let mut planes: Vec<Vec<i32>> = Vec::with_capacity(image.comps.len());
        let mut rects = Vec::with_capacity(image.comps.len());
        for (compno, comp) in image.comps.iter().enumerate() {
            let rect = image.tile_comp_rect(tile_index, compno);
            let mut plane = Vec::with_capacity(rect.area() as usize);
            let cw = comp.rect.width() as usize;
            for y in rect.y0..rect.y1 {
                let row = (y - comp.rect.y0) as usize * cw;
                for x in rect.x0..rect.x1 {
                    plane.push(comp.data[row + (x - comp.rect.x0) as usize]);
                }
            }
            if !comp.sgnd {
                let shift = 1i32 << (comp.prec - 1);
                for v in &mut plane {
                    *v -= shift;
                }
            }
            planes.push(plane);
            rects.push(rect);
        }

        let mut inputs: Vec<PlaneInput> = Vec::with_capacity(planes.len());
        if mct_on {
            let coincident = rects[0] == rects[1] && rects[1] == rects[2];
            if coincident && self.params.reversible {
                let (a, rest) = planes.split_at_mut(1);
                let (b, c) = rest.split_at_mut(1);
                mct::forward_rct(&mut a[0], &mut b[0], &mut c[0]);
            } else if coincident {
                let mut f: Vec<Vec<f32>> = planes
                    .iter()
                    .take(3)
                    .map(|p| p.iter().map(|&v| v as f32).collect())
                    .collect();
                let (a, rest) = f.split_at_mut(1);
                let (b, c) = rest.split_at_mut(1);
                mct::forward_ict(&mut a[0], &mut b[0], &mut c[0]);
                for p in f {
                    inputs.push(PlaneInput::Float(p));
                }
            } else {
                warn!("tile {tile_index}: components not coincident, MCT skipped");
            }
        }
        for plane in planes.into_iter().skip(inputs.len()) {
            inputs.push(PlaneInput::Int(plane));
        }

        // forward DWT into per-band coefficient buffers
        let pmax = image.comps.iter().map(|c| c.prec).max().unwrap_or(8);
        let mut all_bands: Vec<Vec<BandCoeffs>> = Vec::with_capacity(inputs.len());
        for (compno, input) in inputs.into_iter().enumerate() {
            let prec = image.comps[compno].prec;
            all_bands.push(self.transform_component(input, rects[compno], numres, prec, pmax));
        }

        // packets: single layer, LRCP => resolution then component
        let mut out = Vec::new();
        let mut coder = BlockCoder::new();
        for resno in 0..numres {
            for bands in all_bands.iter() {
                let packet = self.encode_packet(
                    bands.iter().filter(|b| b.resno == resno),
                    &mut coder,
                )?;
                out.extend_from_slice(&packet);
            }
        }
        Ok(out)
    }

    /// Multi-level forward transform of one component plane; returns
    /// the quantized band coefficients lowest resolution first.
    fn transform_component(
        &self,
        plane: PlaneInput,
        rect: Rect,
        numres: u8,
        prec: u8,
        pmax: u8,
    ) -> Vec<BandCoeffs> {
        // M_b follows the signalled exponents, which cover the deepest
        // component precision
        let mb = |orientation: u8| {
            self.params.numgbits + self.band_expn(pmax, orientation) - 1
        };
        let mut bands = Vec::new();
        if self.params.reversible {
            let mut current = match plane {
                PlaneInput::Int(v) => v,
                PlaneInput::Float(v) => v.iter().map(|&f| f.round() as i32).collect(),
            };
            let mut cur_rect = rect;
            for resno in (1..numres).rev() {
                let geo = LevelGeometry::of(cur_rect);
                let mut ll = vec![0i32; geo.ll.area() as usize];
                let mut hl = vec![0i32; geo.hl.area() as usize];
                let mut lh = vec![0i32; geo.lh.area() as usize];
                let mut hh = vec![0i32; geo.hh.area() as usize];
                dwt::forward_level_53(&geo, &current, &mut ll, &mut hl, &mut lh, &mut hh);
                for (orientation, (r, data)) in
                    [(geo.hl, hl), (geo.lh, lh), (geo.hh, hh)].into_iter().enumerate()
                {
                    bands.push(BandCoeffs {
                        resno,
                        orientation: orientation as u8 + 1,
                        rect: r,
                        num_bps: mb(orientation as u8 + 1),
                        data,
                    });
                }
                current = ll;
                cur_rect = geo.ll;
            }
            bands.push(BandCoeffs {
                resno: 0,
                orientation: 0,
                rect: cur_rect,
                num_bps: mb(0),
                data: current,
            });
        } else {
            let mut current: Vec<f32> = match plane {
                PlaneInput::Int(v) => v.iter().map(|&i| i as f32).collect(),
                PlaneInput::Float(v) => v,
            };
            let mut cur_rect = rect;
            for resno in (1..numres).rev() {
                let geo = LevelGeometry::of(cur_rect);
                let mut ll = vec![0f32; geo.ll.area() as usize];
                let mut hl = vec![0f32; geo.hl.area() as usize];
                let mut lh = vec![0f32; geo.lh.area() as usize];
                let mut hh = vec![0f32; geo.hh.area() as usize];
                dwt::forward_level_97(&geo, &current, &mut ll, &mut hl, &mut lh, &mut hh);
                for (orientation, (r, data)) in
                    [(geo.hl, hl), (geo.lh, lh), (geo.hh, hh)].into_iter().enumerate()
                {
                    let gain = BAND_GAIN[orientation + 1];
                    let expn = self.band_expn(pmax, orientation as u8 + 1);
                    let delta = 2f32.powi(prec as i32 + gain as i32 - expn as i32);
                    bands.push(BandCoeffs {
                        resno,
                        orientation: orientation as u8 + 1,
                        rect: r,
                        num_bps: mb(orientation as u8 + 1),
                        data: data.iter().map(|&v| quantize_scalar(v, delta)).collect(),
                    });
                }
                current = ll;
                cur_rect = geo.ll;
            }
            let expn = self.band_expn(pmax, 0);
            let delta = 2f32.powi(prec as i32 - expn as i32);
            bands.push(BandCoeffs {
                resno: 0,
                orientation: 0,
                rect: cur_rect,
                num_bps: mb(0),
                data: current.iter().map(|&v| quantize_scalar(v, delta)).collect(),
            });
        }
        // packet order: lowest resolution first, bands HL, LH, HH
        bands.sort_by_key(|b| (b.resno, b.orientation));
        bands
    }

    /// One packet: tag-tree header plus code-block bodies for all the
    /// bands of one resolution of one component.
    fn encode_packet<'b>(
        &self,
        bands: impl Iterator<Item = &'b BandCoeffs>,
        coder: &mut BlockCoder,
    ) -> Result<Vec<u8>> {
        let (cbw, cbh) = self.params.cblk_exp;
        let mut enc_bands = Vec::new();
        let mut bodies = Vec::new();
        for band in bands {
            if band.rect.is_empty() {
                continue;
            }
            let grid = Precinct::new(band.rect, cbw, cbh);
            let mut enc = EncBandPackets::new(grid.grid_w.max(1), grid.grid_h.max(1));
            let band_w = band.rect.width() as usize;
            for (cblkno, cblk) in grid.cblks.iter().enumerate() {
                let r = cblk.rect;
                if r.is_empty() {
                    continue;
                }
                let (w, h) = (r.width(), r.height());
                let mut coeffs = vec![0i32; (w * h) as usize];
                for y in r.y0..r.y1 {
                    let src = (y - band.rect.y0) as usize * band_w + (r.x0 - band.rect.x0) as usize;
                    let dst = (y - r.y0) as usize * w as usize;
                    coeffs[dst..dst + w as usize]
                        .copy_from_slice(&band.data[src..src + w as usize]);
                }
                let planes = num_bit_planes(&coeffs);
                if planes == 0 {
                    continue; // stays excluded from the packet
                }
                if planes > band.num_bps {
                    return Err(CodecError::ParameterOutOfRange(format!(
                        "code-block needs {planes} bit planes but the band signals {}",
                        band.num_bps
                    )));
                }
                let (data, passes) = coder.encode_block(&coeffs, w, h, planes, band.orientation);
                enc.blocks[cblkno] = EncBlockInfo {
                    included: true,
                    k_msbs: band.num_bps as u32 - planes as u32,
                    num_passes: passes,
                    data_len: data.len() as u32,
                    lblock: 0,
                };
                bodies.extend_from_slice(&data);
            }
            enc_bands.push(enc);
        }
        let mut bio = PacketBitWriter::new();
        write_packet_header(&mut bio, &mut enc_bands);
        let mut packet = bio.finish();
        packet.extend_from_slice(&bodies);
        Ok(packet)
    }
}
