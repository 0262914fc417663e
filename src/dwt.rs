//! Discrete wavelet transforms: reversible 5/3 integer lifting and
//! irreversible 9/7 floating-point lifting (Annex F).
//!
//! One decomposition level is inverted by a horizontal pass over the
//! (LL|HL) and (LH|HH) row planes followed by a vertical pass over
//! columns; the forward transform runs vertically then horizontally so
//! the two are exact inverses. The `cas` parity flags carry the odd
//! canvas origins of a resolution (`x0 & 1`, `y0 & 1`), which decide
//! whether the first interleaved sample is low- or high-pass.

use crate::geometry::Rect;
use crate::runtime::Runtime;
use rayon::prelude::*;

/// Filter pad for windowed reconstruction: the 5/3 kernel reaches one
/// sample beyond a window edge, the 9/7 kernel two.
pub fn filter_pad(reversible: bool) -> u32 {
    if reversible {
        1
    } else {
        2
    }
}

#[inline]
fn clamp_idx(i: i64, n: usize) -> usize {
    if i < 0 {
        0
    } else if i as usize >= n {
        n - 1
    } else {
        i as usize
    }
}

pub struct Dwt53;

impl Dwt53 {
    /// Inverse 1-D lifting: `low` and `high` halves into `out`
    /// (length `low.len() + high.len()`), `cas` = parity of the first
    /// output sample (1 when it is high-pass).
    pub fn inverse_1d(low: &[i32], high: &[i32], out: &mut [i32], cas: u8) {
        let (sn, dn) = (low.len(), high.len());
        debug_assert_eq!(sn + dn, out.len());
        if out.is_empty() {
            return;
        }
        if sn + dn == 1 {
            out[0] = if cas == 0 { low[0] } else { high[0] / 2 };
            return;
        }
        let mut l: Vec<i32> = low.to_vec();
        let mut h: Vec<i32> = high.to_vec();
        let ld = |v: &[i32], i: i64| v[clamp_idx(i, v.len())];

        if cas == 0 {
            for i in 0..sn {
                l[i] -= (ld(&h, i as i64 - 1) + ld(&h, i as i64) + 2) >> 2;
            }
            for i in 0..dn {
                h[i] += (ld(&l, i as i64) + ld(&l, i as i64 + 1)) >> 1;
            }
        } else {
            for i in 0..sn {
                l[i] -= (ld(&h, i as i64) + ld(&h, i as i64 + 1) + 2) >> 2;
            }
            for i in 0..dn {
                h[i] += (ld(&l, i as i64 - 1) + ld(&l, i as i64)) >> 1;
            }
        }
        for (i, &v) in l.iter().enumerate() {
            out[2 * i + cas as usize] = v;
        }
        for (i, &v) in h.iter().enumerate() {
            out[2 * i + 1 - cas as usize] = v;
        }
    }

    /// Forward 1-D lifting, splitting `signal` into `low`/`high`.
    pub fn forward_1d(signal: &[i32], low: &mut [i32], high: &mut [i32], cas: u8) {
        let (sn, dn) = (low.len(), high.len());
        debug_assert_eq!(sn + dn, signal.len());
        if signal.is_empty() {
            return;
        }
        if sn + dn == 1 {
            if cas == 0 {
                low[0] = signal[0];
            } else {
                high[0] = signal[0] * 2;
            }
            return;
        }
        for i in 0..sn {
            low[i] = signal[2 * i + cas as usize];
        }
        for i in 0..dn {
            high[i] = signal[2 * i + 1 - cas as usize];
        }
        let ld = |v: &[i32], i: i64| v[clamp_idx(i, v.len())];
        if cas == 0 {
            for i in 0..dn {
                high[i] -= (ld(low, i as i64) + ld(low, i as i64 + 1)) >> 1;
            }
            for i in 0..sn {
                low[i] += (ld(high, i as i64 - 1) + ld(high, i as i64) + 2) >> 2;
            }
        } else {
            for i in 0..dn {
                high[i] -= (ld(low, i as i64 - 1) + ld(low, i as i64)) >> 1;
            }
            for i in 0..sn {
                low[i] += (ld(high, i as i64) + ld(high, i as i64 + 1) + 2) >> 2;
            }
        }
    }
}

pub struct Dwt97;

impl Dwt97 {
    const ALPHA: f32 = -1.586_134_3;
    const BETA: f32 = -0.052_980_118;
    const GAMMA: f32 = 0.882_911_1;
    const DELTA: f32 = 0.443_506_85;
    const K: f32 = 1.230_174_1;
    const INV_K: f32 = 1.0 / 1.230_174_1;

    pub fn inverse_1d(low: &[f32], high: &[f32], out: &mut [f32], cas: u8) {
        let (sn, dn) = (low.len(), high.len());
        debug_assert_eq!(sn + dn, out.len());
        if out.is_empty() {
            return;
        }
        if sn + dn == 1 {
            out[0] = if cas == 0 { low[0] } else { high[0] };
            return;
        }
        let mut l: Vec<f32> = low.iter().map(|&v| v * Self::K).collect();
        let mut h: Vec<f32> = high.iter().map(|&v| v * Self::INV_K).collect();
        let ld = |v: &[f32], i: i64| v[clamp_idx(i, v.len())];

        // lifting steps applied in reverse with negated coefficients
        if cas == 0 {
            for i in 0..sn {
                l[i] -= Self::DELTA * (ld(&h, i as i64 - 1) + ld(&h, i as i64));
            }
            for i in 0..dn {
                h[i] -= Self::GAMMA * (ld(&l, i as i64) + ld(&l, i as i64 + 1));
            }
            for i in 0..sn {
                l[i] -= Self::BETA * (ld(&h, i as i64 - 1) + ld(&h, i as i64));
            }
            for i in 0..dn {
                h[i] -= Self::ALPHA * (ld(&l, i as i64) + ld(&l, i as i64 + 1));
            }
        } else {
            for i in 0..sn {
                l[i] -= Self::DELTA * (ld(&h, i as i64) + ld(&h, i as i64 + 1));
            }
            for i in 0..dn {
                h[i] -= Self::GAMMA * (ld(&l, i as i64 - 1) + ld(&l, i as i64));
            }
            for i in 0..sn {
                l[i] -= Self::BETA * (ld(&h, i as i64) + ld(&h, i as i64 + 1));
            }
            for i in 0..dn {
                h[i] -= Self::ALPHA * (ld(&l, i as i64 - 1) + ld(&l, i as i64));
            }
        }
        for (i, &v) in l.iter().enumerate() {
            out[2 * i + cas as usize] = v;
        }
        for (i, &v) in h.iter().enumerate() {
            out[2 * i + 1 - cas as usize] = v;
        }
    }

    pub fn forward_1d(signal: &[f32], low: &mut [f32], high: &mut [f32], cas: u8) {
        let (sn, dn) = (low.len(), high.len());
        debug_assert_eq!(sn + dn, signal.len());
        if signal.is_empty() {
            return;
        }
        if sn + dn == 1 {
            if cas == 0 {
                low[0] = signal[0];
            } else {
                high[0] = signal[0];
            }
            return;
        }
        for i in 0..sn {
            low[i] = signal[2 * i + cas as usize];
        }
        for i in 0..dn {
            high[i] = signal[2 * i + 1 - cas as usize];
        }
        let ld = |v: &[f32], i: i64| v[clamp_idx(i, v.len())];
        if cas == 0 {
            for i in 0..dn {
                high[i] += Self::ALPHA * (ld(low, i as i64) + ld(low, i as i64 + 1));
            }
            for i in 0..sn {
                low[i] += Self::BETA * (ld(high, i as i64 - 1) + ld(high, i as i64));
            }
            for i in 0..dn {
                high[i] += Self::GAMMA * (ld(low, i as i64) + ld(low, i as i64 + 1));
            }
            for i in 0..sn {
                low[i] += Self::DELTA * (ld(high, i as i64 - 1) + ld(high, i as i64));
            }
        } else {
            for i in 0..dn {
                high[i] += Self::ALPHA * (ld(low, i as i64 - 1) + ld(low, i as i64));
            }
            for i in 0..sn {
                low[i] += Self::BETA * (ld(high, i as i64) + ld(high, i as i64 + 1));
            }
            for i in 0..dn {
                high[i] += Self::GAMMA * (ld(low, i as i64 - 1) + ld(low, i as i64));
            }
            for i in 0..sn {
                low[i] += Self::DELTA * (ld(high, i as i64) + ld(high, i as i64 + 1));
            }
        }
        for v in low.iter_mut() {
            *v *= Self::INV_K;
        }
        for v in high.iter_mut() {
            *v *= Self::K;
        }
    }
}

/// Geometry of one decomposition level: the output resolution rectangle
/// and its four input band rectangles.
#[derive(Debug, Clone, Copy)]
pub struct LevelGeometry {
    pub out: Rect,
    pub ll: Rect,
    pub hl: Rect,
    pub lh: Rect,
    pub hh: Rect,
}

impl LevelGeometry {
    /// Derive the band partition of `out` (one decomposition).
    pub fn of(out: Rect) -> Self {
        Self {
            out,
            ll: out.band_window(1, 0),
            hl: out.band_window(1, 1),
            lh: out.band_window(1, 2),
            hh: out.band_window(1, 3),
        }
    }

    pub fn cas_h(&self) -> u8 {
        (self.out.x0 & 1) as u8
    }

    pub fn cas_v(&self) -> u8 {
        (self.out.y0 & 1) as u8
    }
}

macro_rules! level_transforms {
    ($inverse_name:ident, $forward_name:ident, $t:ty, $dwt:ident, $zero:expr) => {
        /// Invert one decomposition level. Buffers are row-major over
        /// their rectangles; `win` (output-local coordinates) restricts
        /// reconstruction to a padded window.
        #[allow(clippy::too_many_arguments)]
        pub fn $inverse_name(
            geo: &LevelGeometry,
            ll: &[$t],
            hl: &[$t],
            lh: &[$t],
            hh: &[$t],
            out: &mut [$t],
            win: Option<Rect>,
            runtime: &Runtime,
        ) {
            let rw = geo.out.width() as usize;
            let rh = geo.out.height() as usize;
            if rw == 0 || rh == 0 {
                return;
            }
            let (cas_h, cas_v) = (geo.cas_h(), geo.cas_v());
            let top_h = geo.ll.height() as usize;
            let bot_h = geo.lh.height() as usize;
            let (ll_w, hl_w) = (geo.ll.width() as usize, geo.hl.width() as usize);

            // row ranges feeding the vertical window, with slack for
            // the interleave parity
            let (row_lo, row_hi, col_lo, col_hi) = match win {
                Some(w) => (
                    (w.y0 as usize / 2).saturating_sub(2),
                    (w.y1 as usize).div_ceil(2) + 2,
                    w.x0 as usize,
                    (w.x1 as usize).min(rw),
                ),
                None => (0, rh, 0, rw),
            };

            let mut low_plane = vec![$zero; rw * top_h];
            let mut high_plane = vec![$zero; rw * bot_h];

            let hrows = |plane: &mut [$t], a: &[$t], aw: usize, b: &[$t], bw: usize| {
                let run = |(y, row): (usize, &mut [$t])| {
                    if y < row_lo || y >= row_hi {
                        return;
                    }
                    let arow = &a[y * aw..(y + 1) * aw];
                    let brow = &b[y * bw..(y + 1) * bw];
                    $dwt::inverse_1d(arow, brow, row, cas_h);
                };
                if runtime.workers() > 1 {
                    runtime.install(|| plane.par_chunks_mut(rw).enumerate().for_each(run));
                } else {
                    plane.chunks_mut(rw).enumerate().for_each(run);
                }
            };
            hrows(&mut low_plane, ll, ll_w, hl, hl_w);
            hrows(&mut high_plane, lh, ll_w, hh, hl_w);

            // vertical pass per column
            let column = |x: usize| {
                let mut col_l = vec![$zero; top_h];
                let mut col_h = vec![$zero; bot_h];
                for y in 0..top_h {
                    col_l[y] = low_plane[y * rw + x];
                }
                for y in 0..bot_h {
                    col_h[y] = high_plane[y * rw + x];
                }
                let mut col_out = vec![$zero; rh];
                $dwt::inverse_1d(&col_l, &col_h, &mut col_out, cas_v);
                col_out
            };
            if runtime.workers() > 1 {
                let cols: Vec<(usize, Vec<$t>)> = runtime.install(|| {
                    (col_lo..col_hi)
                        .into_par_iter()
                        .map(|x| (x, column(x)))
                        .collect()
                });
                for (x, col) in cols {
                    for (y, v) in col.into_iter().enumerate() {
                        out[y * rw + x] = v;
                    }
                }
            } else {
                for x in col_lo..col_hi {
                    let col = column(x);
                    for (y, v) in col.into_iter().enumerate() {
                        out[y * rw + x] = v;
                    }
                }
            }
        }

        /// Forward-transform one level: `src` (over `geo.out`) into the
        /// four band buffers. Vertical first, then horizontal, so the
        /// inverse above undoes it exactly.
        pub fn $forward_name(
            geo: &LevelGeometry,
            src: &[$t],
            ll: &mut [$t],
            hl: &mut [$t],
            lh: &mut [$t],
            hh: &mut [$t],
        ) {
            let rw = geo.out.width() as usize;
            let rh = geo.out.height() as usize;
            if rw == 0 || rh == 0 {
                return;
            }
            let (cas_h, cas_v) = (geo.cas_h(), geo.cas_v());
            let top_h = geo.ll.height() as usize;
            let bot_h = geo.lh.height() as usize;
            let (ll_w, hl_w) = (geo.ll.width() as usize, geo.hl.width() as usize);

            let mut low_plane = vec![$zero; rw * top_h];
            let mut high_plane = vec![$zero; rw * bot_h];
            let mut col = vec![$zero; rh];
            let mut col_l = vec![$zero; top_h];
            let mut col_h = vec![$zero; bot_h];
            for x in 0..rw {
                for y in 0..rh {
                    col[y] = src[y * rw + x];
                }
                $dwt::forward_1d(&col, &mut col_l, &mut col_h, cas_v);
                for y in 0..top_h {
                    low_plane[y * rw + x] = col_l[y];
                }
                for y in 0..bot_h {
                    high_plane[y * rw + x] = col_h[y];
                }
            }
            for y in 0..top_h {
                let row = &low_plane[y * rw..(y + 1) * rw];
                $dwt::forward_1d(
                    row,
                    &mut ll[y * ll_w..(y + 1) * ll_w],
                    &mut hl[y * hl_w..(y + 1) * hl_w],
                    cas_h,
                );
            }
            for y in 0..bot_h {
                let row = &high_plane[y * rw..(y + 1) * rw];
                $dwt::forward_1d(
                    row,
                    &mut lh[y * ll_w..(y + 1) * ll_w],
                    &mut hh[y * hl_w..(y + 1) * hl_w],
                    cas_h,
                );
            }
        }
    };
}

level_transforms!(inverse_level_53, forward_level_53, i32, Dwt53, 0i32);
level_transforms!(inverse_level_97, forward_level_97, f32, Dwt97, 0.0f32);

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_1d_53(input: &[i32], cas: u8) {
        let n = input.len();
        let sn = (n + 1 - cas as usize) / 2;
        let dn = n - sn;
        let mut low = vec![0i32; sn];
        let mut high = vec![0i32; dn];
        Dwt53::forward_1d(input, &mut low, &mut high, cas);
        let mut out = vec![0i32; n];
        Dwt53::inverse_1d(&low, &high, &mut out, cas);
        assert_eq!(input, &out[..], "cas {cas} len {n}");
    }

    #[test]
    fn dwt53_round_trip_even_odd_lengths() {
        round_trip_1d_53(&[10, 20, 30, 40, 50, 60, 70, 80], 0);
        round_trip_1d_53(&[10, 20, 30, 40, 50], 0);
        round_trip_1d_53(&[-3, 7, 2, 0, 5, -1], 1);
        round_trip_1d_53(&[9, -9, 4], 1);
        round_trip_1d_53(&[42], 0);
        round_trip_1d_53(&[42], 1);
    }

    #[test]
    fn dwt97_round_trip_within_tolerance() {
        for cas in [0u8, 1] {
            let input: Vec<f32> = (0..17).map(|i| (i as f32 * 0.7).sin() * 100.0).collect();
            let n = input.len();
            let sn = (n + 1 - cas as usize) / 2;
            let dn = n - sn;
            let mut low = vec![0f32; sn];
            let mut high = vec![0f32; dn];
            Dwt97::forward_1d(&input, &mut low, &mut high, cas);
            let mut out = vec![0f32; n];
            Dwt97::inverse_1d(&low, &high, &mut out, cas);
            for (a, b) in input.iter().zip(out.iter()) {
                assert!((a - b).abs() < 1e-3, "{a} vs {b} (cas {cas})");
            }
        }
    }

    fn round_trip_level_53(rect: Rect) {
        let geo = LevelGeometry::of(rect);
        let n = rect.area() as usize;
        let src: Vec<i32> = (0..n).map(|i| ((i * 31 + 7) % 251) as i32 - 125).collect();
        let mut ll = vec![0i32; geo.ll.area() as usize];
        let mut hl = vec![0i32; geo.hl.area() as usize];
        let mut lh = vec![0i32; geo.lh.area() as usize];
        let mut hh = vec![0i32; geo.hh.area() as usize];
        forward_level_53(&geo, &src, &mut ll, &mut hl, &mut lh, &mut hh);
        let mut out = vec![0i32; n];
        inverse_level_53(
            &geo,
            &ll,
            &hl,
            &lh,
            &hh,
            &mut out,
            None,
            &Runtime::single_threaded(),
        );
        assert_eq!(src, out, "rect {rect:?}");
    }

    #[test]
    fn level_round_trip_various_rects() {
        round_trip_level_53(Rect::new(0, 0, 8, 8));
        round_trip_level_53(Rect::new(0, 0, 9, 7));
        round_trip_level_53(Rect::new(1, 1, 10, 8));
        round_trip_level_53(Rect::new(3, 5, 4, 9));
    }

    #[test]
    fn parallel_level_matches_sequential() {
        let rect = Rect::new(0, 0, 33, 17);
        let geo = LevelGeometry::of(rect);
        let n = rect.area() as usize;
        let src: Vec<i32> = (0..n).map(|i| ((i * 13 + 3) % 200) as i32 - 100).collect();
        let mut ll = vec![0i32; geo.ll.area() as usize];
        let mut hl = vec![0i32; geo.hl.area() as usize];
        let mut lh = vec![0i32; geo.lh.area() as usize];
        let mut hh = vec![0i32; geo.hh.area() as usize];
        forward_level_53(&geo, &src, &mut ll, &mut hl, &mut lh, &mut hh);
        let mut seq = vec![0i32; n];
        let mut par = vec![0i32; n];
        inverse_level_53(&geo, &ll, &hl, &lh, &hh, &mut seq, None, &Runtime::single_threaded());
        inverse_level_53(&geo, &ll, &hl, &lh, &hh, &mut par, None, &Runtime::new(4).unwrap());
        assert_eq!(seq, par);
    }

    #[test]
    fn windowed_inverse_matches_full_inside_window() {
        let rect = Rect::new(0, 0, 16, 16);
        let geo = LevelGeometry::of(rect);
        let n = rect.area() as usize;
        let src: Vec<i32> = (0..n).map(|i| ((i * 17) % 121) as i32 - 60).collect();
        let mut ll = vec![0i32; geo.ll.area() as usize];
        let mut hl = vec![0i32; geo.hl.area() as usize];
        let mut lh = vec![0i32; geo.lh.area() as usize];
        let mut hh = vec![0i32; geo.hh.area() as usize];
        forward_level_53(&geo, &src, &mut ll, &mut hl, &mut lh, &mut hh);

        let mut full = vec![0i32; n];
        inverse_level_53(&geo, &ll, &hl, &lh, &hh, &mut full, None, &Runtime::single_threaded());

        let win = Rect::new(2, 2, 8, 8);
        let mut windowed = vec![0i32; n];
        inverse_level_53(
            &geo,
            &ll,
            &hl,
            &lh,
            &hh,
            &mut windowed,
            Some(win),
            &Runtime::single_threaded(),
        );
        for y in win.y0..win.y1 {
            for x in win.x0..win.x1 {
                let i = (y * 16 + x) as usize;
                assert_eq!(full[i], windowed[i], "({x},{y})");
            }
        }
    }
}
