//! Per tile-component buffer manager.
//!
//! Four coordinate systems meet here: canvas (global), tile-component
//! (canvas with sub-sampling applied), band (offset from a sub-band's
//! origin) and buffer (a resolution translated to its own origin).
//! Each resolution owns its reconstruction buffer; band windows own
//! coefficient buffers that feed the inverse DWT level by level.

use crate::dwt::{self, filter_pad, LevelGeometry};
use crate::error::{CodecError, Result};
use crate::geometry::Rect;
use crate::runtime::Runtime;
use crate::t1::BlockResult;

/// Sanity cap on a single buffer allocation (samples).
const MAX_BUFFER_SAMPLES: u64 = 1 << 30;

/// Coefficient storage: integers on the reversible path, floats on the
/// irreversible one.
#[derive(Debug, Clone)]
pub enum CoeffBuf {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

impl CoeffBuf {
    fn alloc(reversible: bool, len: u64) -> Result<Self> {
        if len > MAX_BUFFER_SAMPLES {
            return Err(CodecError::AllocationFailure(format!(
                "coefficient buffer of {len} samples"
            )));
        }
        Ok(if reversible {
            CoeffBuf::Int(vec![0; len as usize])
        } else {
            CoeffBuf::Float(vec![0.0; len as usize])
        })
    }

    pub fn as_int(&self) -> Option<&[i32]> {
        match self {
            CoeffBuf::Int(v) => Some(v),
            CoeffBuf::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<&[f32]> {
        match self {
            CoeffBuf::Float(v) => Some(v),
            CoeffBuf::Int(_) => None,
        }
    }
}

/// Buffers and window geometry for one tile component.
#[derive(Debug, Clone)]
pub struct TileComponentWindow {
    /// Tile-component rectangle (tile-component coordinates).
    pub bounds: Rect,
    /// Decode window clipped to `bounds`; equals `bounds` for
    /// whole-tile decoding.
    pub window: Rect,
    pub whole_tile: bool,
    pub reversible: bool,
    pub numres: u8,
    /// Resolution rectangles, lowest first.
    pub res_rects: Vec<Rect>,
    /// Per-resolution reconstruction window, padded for the filter.
    padded_res_windows: Vec<Rect>,
    /// Per-resolution padded band windows indexed by orientation.
    padded_band_windows: Vec<[Rect; 4]>,
    /// Reconstruction buffer per resolution (buffer coordinates).
    res_bufs: Vec<CoeffBuf>,
    /// Detail-band buffers per resolution above zero: HL, LH, HH.
    band_bufs: Vec<[CoeffBuf; 3]>,
}

impl TileComponentWindow {
    /// `window` is the caller's decode window in tile-component
    /// coordinates; `None` selects whole-tile decoding.
    pub fn new(
        bounds: Rect,
        window: Option<Rect>,
        numres: u8,
        band_rects: &[Vec<Rect>],
        reversible: bool,
    ) -> Result<Self> {
        let whole_tile = window.is_none();
        let window = window
            .map(|w| w.intersection(&bounds))
            .unwrap_or(bounds);
        let pad = filter_pad(reversible);

        let mut res_rects = Vec::with_capacity(numres as usize);
        let mut padded_res_windows = Vec::with_capacity(numres as usize);
        let mut padded_band_windows = Vec::with_capacity(numres as usize);
        let mut res_bufs = Vec::with_capacity(numres as usize);
        let mut band_bufs = Vec::new();
        for resno in 0..numres {
            let n = (numres - 1 - resno) as u32;
            let rect = bounds.scale_down_ceil_pow2(n);
            let padded = if whole_tile {
                rect
            } else {
                window.scale_down_ceil_pow2(n).grow(pad).intersection(&rect)
            };
            let mut bands = [Rect::default(); 4];
            let orientations: std::ops::Range<usize> = if resno == 0 { 0..1 } else { 1..4 };
            for orientation in orientations {
                let nb = if resno == 0 { n } else { n + 1 };
                let band_rect = band_rects[resno as usize]
                    [if resno == 0 { 0 } else { orientation - 1 }];
                bands[orientation] = if whole_tile {
                    band_rect
                } else {
                    window
                        .band_window(nb, orientation as u8)
                        .grow(pad)
                        .intersection(&band_rect)
                };
            }
            res_rects.push(rect);
            padded_res_windows.push(padded);
            padded_band_windows.push(bands);
            res_bufs.push(CoeffBuf::alloc(reversible, rect.area())?);
            if resno > 0 {
                let r = &band_rects[resno as usize];
                band_bufs.push([
                    CoeffBuf::alloc(reversible, r[0].area())?,
                    CoeffBuf::alloc(reversible, r[1].area())?,
                    CoeffBuf::alloc(reversible, r[2].area())?,
                ]);
            }
        }
        Ok(Self {
            bounds,
            window,
            whole_tile,
            reversible,
            numres,
            res_rects,
            padded_res_windows,
            padded_band_windows,
            res_bufs,
            band_bufs,
        })
    }

    /// Padded band window used to decide which precincts and
    /// code-blocks take part in a windowed decode.
    pub fn padded_band_window(&self, resno: u8, orientation: u8) -> Rect {
        self.padded_band_windows[resno as usize][orientation as usize]
    }

    /// Whether a band-coordinate rectangle contributes to the decode.
    pub fn covers(&self, resno: u8, orientation: u8, rect: &Rect) -> bool {
        self.whole_tile || self.padded_band_window(resno, orientation).intersects(rect)
    }

    /// Blit one decoded code-block (band coordinates) into its band
    /// buffer.
    pub fn write_block(
        &mut self,
        resno: u8,
        orientation: u8,
        band_rect: Rect,
        block_rect: Rect,
        result: &BlockResult,
    ) -> Result<()> {
        let (dst, dst_rect) = if resno == 0 {
            (&mut self.res_bufs[0], self.res_rects[0])
        } else {
            (
                &mut self.band_bufs[resno as usize - 1][orientation as usize - 1],
                band_rect,
            )
        };
        let w = dst_rect.width() as usize;
        let clipped = block_rect.intersection(&dst_rect);
        if clipped.is_empty() {
            return Ok(());
        }
        let bw = block_rect.width() as usize;
        match (dst, result) {
            (CoeffBuf::Int(buf), BlockResult::Int(src)) => {
                for y in clipped.y0..clipped.y1 {
                    let dst_off =
                        (y - dst_rect.y0) as usize * w + (clipped.x0 - dst_rect.x0) as usize;
                    let src_off = (y - block_rect.y0) as usize * bw
                        + (clipped.x0 - block_rect.x0) as usize;
                    let n = clipped.width() as usize;
                    buf[dst_off..dst_off + n].copy_from_slice(&src[src_off..src_off + n]);
                }
            }
            (CoeffBuf::Float(buf), BlockResult::Float(src)) => {
                for y in clipped.y0..clipped.y1 {
                    let dst_off =
                        (y - dst_rect.y0) as usize * w + (clipped.x0 - dst_rect.x0) as usize;
                    let src_off = (y - block_rect.y0) as usize * bw
                        + (clipped.x0 - block_rect.x0) as usize;
                    let n = clipped.width() as usize;
                    buf[dst_off..dst_off + n].copy_from_slice(&src[src_off..src_off + n]);
                }
            }
            _ => {
                return Err(CodecError::ParameterOutOfRange(
                    "code-block result type does not match the transform path".into(),
                ))
            }
        }
        Ok(())
    }

    /// Run the inverse DWT across all levels. Band rectangles are
    /// re-derived from the bounds, which the construction guarantees to
    /// match the buffer shapes.
    pub fn inverse_dwt(&mut self, runtime: &Runtime) {
        for resno in 1..self.numres {
            let geo = LevelGeometry {
                out: self.res_rects[resno as usize],
                ll: self.res_rects[resno as usize - 1],
                hl: self.res_rects[resno as usize].band_window(1, 1),
                lh: self.res_rects[resno as usize].band_window(1, 2),
                hh: self.res_rects[resno as usize].band_window(1, 3),
            };
            let win = if self.whole_tile {
                None
            } else {
                let p = self.padded_res_windows[resno as usize];
                let out = geo.out;
                if p.is_empty() {
                    Some(Rect::default())
                } else {
                    Some(Rect::new(
                        p.x0 - out.x0,
                        p.y0 - out.y0,
                        p.x1 - out.x0,
                        p.y1 - out.y0,
                    ))
                }
            };
            // split the borrow: lower resolution is input, current is
            // output
            let (lower, upper) = self.res_bufs.split_at_mut(resno as usize);
            let ll = &lower[resno as usize - 1];
            let out = &mut upper[0];
            let bands = &self.band_bufs[resno as usize - 1];
            match (ll, out) {
                (CoeffBuf::Int(ll), CoeffBuf::Int(out)) => {
                    let hl = bands[0].as_int().unwrap_or(&[]);
                    let lh = bands[1].as_int().unwrap_or(&[]);
                    let hh = bands[2].as_int().unwrap_or(&[]);
                    dwt::inverse_level_53(&geo, ll, hl, lh, hh, out, win, runtime);
                }
                (CoeffBuf::Float(ll), CoeffBuf::Float(out)) => {
                    let hl = bands[0].as_float().unwrap_or(&[]);
                    let lh = bands[1].as_float().unwrap_or(&[]);
                    let hh = bands[2].as_float().unwrap_or(&[]);
                    dwt::inverse_level_97(&geo, ll, hl, lh, hh, out, win, runtime);
                }
                _ => unreachable!("all buffers share the transform path"),
            }
        }
    }

    /// Highest-resolution reconstruction as integer samples (floats
    /// round to nearest).
    pub fn into_samples(mut self) -> Vec<i32> {
        match self.res_bufs.pop() {
            Some(CoeffBuf::Int(v)) => v,
            Some(CoeffBuf::Float(v)) => v.iter().map(|&f| f.round() as i32).collect(),
            None => Vec::new(),
        }
    }

    /// Highest-resolution reconstruction buffer, keeping the float
    /// representation on the irreversible path (the inverse MCT wants
    /// floats before rounding).
    pub fn into_top_buffer(mut self) -> CoeffBuf {
        self.res_bufs
            .pop()
            .unwrap_or(CoeffBuf::Int(Vec::new()))
    }

    /// Rectangle of the highest-resolution buffer.
    pub fn top_rect(&self) -> Rect {
        self.res_rects[self.numres as usize - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TileComponentCodingParams;
    use crate::tile::build_resolutions;

    fn band_rects(tilec: Rect, numres: u8) -> Vec<Vec<Rect>> {
        let tccp = TileComponentCodingParams {
            numresolutions: numres,
            cblkw: 4,
            cblkh: 4,
            ..Default::default()
        };
        let res = build_resolutions(tilec, &tccp, 8).unwrap();
        res.iter()
            .map(|r| r.bands.iter().map(|b| b.rect).collect())
            .collect()
    }

    #[test]
    fn whole_tile_band_windows_are_full_bands() {
        let bounds = Rect::new(0, 0, 16, 16);
        let rects = band_rects(bounds, 3);
        let w = TileComponentWindow::new(bounds, None, 3, &rects, true).unwrap();
        assert!(w.whole_tile);
        assert_eq!(w.window, bounds);
        assert_eq!(w.padded_band_window(1, 1), rects[1][0]);
        assert!(w.covers(2, 3, &Rect::new(0, 0, 1, 1)));
    }

    #[test]
    fn windowed_band_windows_are_padded_and_clipped() {
        let bounds = Rect::new(0, 0, 16, 16);
        let rects = band_rects(bounds, 3);
        let win = Rect::new(0, 0, 2, 2);
        let w = TileComponentWindow::new(bounds, Some(win), 3, &rects, true).unwrap();
        // at the highest resolution the padded window is the window
        // grown by the reversible pad
        let pb = w.padded_band_window(2, 1);
        assert!(pb.width() <= rects[2][0].width());
        assert!(pb.width() >= 1);
        // far-away blocks are not covered
        assert!(!w.covers(2, 1, &Rect::new(6, 6, 8, 8)));
    }

    #[test]
    fn zero_coefficients_reconstruct_to_zero() {
        let bounds = Rect::new(0, 0, 8, 8);
        let rects = band_rects(bounds, 2);
        let mut w = TileComponentWindow::new(bounds, None, 2, &rects, true).unwrap();
        w.inverse_dwt(&Runtime::single_threaded());
        let samples = w.into_samples();
        assert_eq!(samples.len(), 64);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn block_write_lands_in_band_buffer() {
        let bounds = Rect::new(0, 0, 8, 8);
        let rects = band_rects(bounds, 2);
        let mut w = TileComponentWindow::new(bounds, None, 2, &rects, true).unwrap();
        let band = rects[1][0]; // HL of res 1: [0,4)x[0,4)
        let block = Rect::new(0, 0, 4, 4);
        let result = BlockResult::Int((1..=16).collect());
        w.write_block(1, 1, band, block, &result).unwrap();
        let buf = w.band_bufs[0][0].as_int().unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[15], 16);
    }
}
