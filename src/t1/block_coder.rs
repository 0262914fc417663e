//! EBCOT Tier-1 bit-plane coding (ISO/IEC 15444-1 Annex D): context
//! modelling over stripe-ordered scans driving the MQ coder.

use super::mq_coder::MqCoder;
use crate::error::{CodecError, Result};
use crate::params::cblk_sty;
use log::warn;

// Per-sample state flags.
const SIG: u8 = 1 << 0;
const VISITED: u8 = 1 << 1;
const REFINE: u8 = 1 << 2;
const SIGN: u8 = 1 << 3; // 0 = positive, 1 = negative

// Context numbering: 0..=8 zero coding, 9..=13 sign coding,
// 14..=16 magnitude refinement, 17 run-length, 18 uniform.
const CTX_RUN: usize = 17;
const CTX_UNIFORM: usize = 18;
const NUM_CTXS: usize = 19;

const STRIPE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    SigProp,
    MagRef,
    Cleanup,
}

/// Reusable bit-plane coder for one code-block at a time. A scheduler
/// worker owns one instance and calls `decode_block` per task.
pub struct BlockCoder {
    width: u32,
    height: u32,
    state: Vec<u8>,
    pub(crate) mq: MqCoder,
    coefficients: Vec<i32>,
    vsc: bool,
}

impl BlockCoder {
    pub fn new() -> Self {
        let mut mq = MqCoder::new();
        mq.init_contexts(NUM_CTXS);
        Self {
            width: 0,
            height: 0,
            state: Vec::new(),
            mq,
            coefficients: Vec::new(),
            vsc: false,
        }
    }

    fn reset(&mut self, width: u32, height: u32, vsc: bool) {
        self.width = width;
        self.height = height;
        self.vsc = vsc;
        let size = (width * height) as usize;
        self.state.clear();
        self.state.resize(size, 0);
        self.coefficients.clear();
        self.coefficients.resize(size, 0);
        self.reset_contexts();
    }

    /// Standard initial states: uniform at 46, run-length at 3, the
    /// all-zero-neighbour ZC context at 4, everything else at 0.
    fn reset_contexts(&mut self) {
        self.mq.reset_contexts();
        self.mq.set_context(CTX_UNIFORM, 46, 0);
        self.mq.set_context(CTX_RUN, 3, 0);
        self.mq.set_context(0, 4, 0);
    }

    #[inline]
    fn idx(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    #[inline]
    fn sig_at(&self, x: i64, y: i64, stripe_top: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return false;
        }
        // Vertically causal mode: samples below the current stripe are
        // treated as insignificant.
        if self.vsc && y >= stripe_top + STRIPE as i64 {
            return false;
        }
        self.state[(y * self.width as i64 + x) as usize] & SIG != 0
    }

    /// Count significant neighbours (horizontal, vertical, diagonal).
    fn neighbors(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let (xi, yi) = (x as i64, y as i64);
        let stripe_top = (yi / STRIPE as i64) * STRIPE as i64;
        let h = self.sig_at(xi - 1, yi, stripe_top) as u8 + self.sig_at(xi + 1, yi, stripe_top) as u8;
        let v = self.sig_at(xi, yi - 1, stripe_top) as u8 + self.sig_at(xi, yi + 1, stripe_top) as u8;
        let d = self.sig_at(xi - 1, yi - 1, stripe_top) as u8
            + self.sig_at(xi + 1, yi - 1, stripe_top) as u8
            + self.sig_at(xi - 1, yi + 1, stripe_top) as u8
            + self.sig_at(xi + 1, yi + 1, stripe_top) as u8;
        (h, v, d)
    }

    /// Zero-coding context (Table D-1) by band orientation
    /// (0=LL, 1=HL, 2=LH, 3=HH).
    fn zc_context(&self, orientation: u8, h: u8, v: u8, d: u8) -> usize {
        match orientation {
            0 | 2 => match (h, v, d) {
                (2, _, _) => 8,
                (1, v, _) if v >= 1 => 7,
                (1, 0, d) if d >= 1 => 6,
                (1, 0, 0) => 5,
                (0, 2, _) => 4,
                (0, 1, _) => 3,
                (0, 0, d) if d >= 2 => 2,
                (0, 0, 1) => 1,
                _ => 0,
            },
            1 => match (v, h, d) {
                (2, _, _) => 8,
                (1, h, _) if h >= 1 => 7,
                (1, 0, d) if d >= 1 => 6,
                (1, 0, 0) => 5,
                (0, 2, _) => 4,
                (0, 1, _) => 3,
                (0, 0, d) if d >= 2 => 2,
                (0, 0, 1) => 1,
                _ => 0,
            },
            _ => match (d, h + v) {
                (d, _) if d >= 3 => 8,
                (2, hv) if hv >= 1 => 7,
                (2, 0) => 6,
                (1, hv) if hv >= 2 => 5,
                (1, 1) => 4,
                (1, 0) => 3,
                (0, hv) if hv >= 2 => 2,
                (0, 1) => 1,
                _ => 0,
            },
        }
    }

    fn sign_contrib(&self, x: i64, y: i64, stripe_top: i64) -> i8 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return 0;
        }
        if self.vsc && y >= stripe_top + STRIPE as i64 {
            return 0;
        }
        let s = self.state[(y * self.width as i64 + x) as usize];
        if s & SIG == 0 {
            0
        } else if s & SIGN != 0 {
            -1
        } else {
            1
        }
    }

    /// Sign-coding context and XOR bit (Table D-3), packed as
    /// `ctx | (xor << 8)`.
    fn sign_context(&self, x: u32, y: u32) -> usize {
        let (xi, yi) = (x as i64, y as i64);
        let stripe_top = (yi / STRIPE as i64) * STRIPE as i64;
        let h = (self.sign_contrib(xi - 1, yi, stripe_top)
            + self.sign_contrib(xi + 1, yi, stripe_top))
        .clamp(-1, 1);
        let v = (self.sign_contrib(xi, yi - 1, stripe_top)
            + self.sign_contrib(xi, yi + 1, stripe_top))
        .clamp(-1, 1);
        let (ctx, xor) = match (h, v) {
            (1, 1) => (13, 0),
            (1, 0) => (12, 0),
            (1, -1) => (11, 0),
            (0, 1) => (10, 0),
            (0, 0) => (9, 0),
            (0, -1) => (10, 1),
            (-1, 1) => (11, 1),
            (-1, 0) => (12, 1),
            _ => (13, 1),
        };
        ctx | (xor << 8)
    }

    /// Magnitude-refinement context (Table D-2).
    fn mr_context(&self, x: u32, y: u32) -> usize {
        let s = self.state[self.idx(x, y)];
        if s & REFINE != 0 {
            16
        } else {
            let (h, v, d) = self.neighbors(x, y);
            if h + v + d > 0 {
                15
            } else {
                14
            }
        }
    }

    fn clear_visited(&mut self) {
        for s in &mut self.state {
            *s &= !VISITED;
        }
    }

    // --- decoding ---

    /// Decode one code-block.
    ///
    /// `num_bps` is the magnitude bit-plane count for this block
    /// (band M_b minus the signalled missing planes); `num_passes` is
    /// the total coding-pass count across all layers. Returns the
    /// sign-magnitude coefficients; on arithmetic failure the partial
    /// result is delivered and a warning logged by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn decode_block(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        num_bps: u8,
        num_passes: u32,
        orientation: u8,
        style: u8,
    ) -> Result<Vec<i32>> {
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        if num_bps > 31 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block with {num_bps} bit planes"
            )));
        }
        self.reset(width, height, style & cblk_sty::VSC != 0);
        if num_bps == 0 || num_passes == 0 {
            return Ok(self.coefficients.clone());
        }
        if style & (cblk_sty::LAZY | cblk_sty::TERMALL) != 0 {
            warn!(
                "code-block style 0x{style:02X} requests bypass/termall segmentation, \
                 which this decoder does not implement; decoding as a single segment"
            );
        }

        self.mq.init_decoder(data);

        for pass_idx in 0..num_passes {
            let (plane, pass) = if pass_idx == 0 {
                (num_bps - 1, Pass::Cleanup)
            } else {
                let plane_offset = (pass_idx - 1) / 3 + 1;
                if plane_offset >= num_bps as u32 {
                    break;
                }
                let plane = num_bps - 1 - plane_offset as u8;
                match (pass_idx - 1) % 3 {
                    0 => (plane, Pass::SigProp),
                    1 => (plane, Pass::MagRef),
                    _ => (plane, Pass::Cleanup),
                }
            };
            match pass {
                Pass::SigProp => self.decode_sig_prop(plane, orientation),
                Pass::MagRef => self.decode_mag_ref(plane),
                Pass::Cleanup => {
                    self.decode_cleanup(plane, orientation);
                    if style & cblk_sty::SEGSYM != 0 {
                        self.check_segment_symbol()?;
                    }
                    self.clear_visited();
                }
            }
            if style & cblk_sty::RESET != 0 {
                self.reset_contexts();
            }
        }

        Ok(self.coefficients.clone())
    }

    fn decode_sig_prop(&mut self, plane: u8, orientation: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                for y in stripe..(stripe + STRIPE).min(h) {
                    let i = self.idx(x, y);
                    if self.state[i] & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let (hc, vc, dc) = self.neighbors(x, y);
                    if hc == 0 && vc == 0 && dc == 0 {
                        continue;
                    }
                    let cx = self.zc_context(orientation, hc, vc, dc);
                    if self.mq.decode_bit(cx) != 0 {
                        self.decode_sign_into(x, y, plane);
                    }
                    self.state[i] |= VISITED;
                }
            }
        }
    }

    fn decode_mag_ref(&mut self, plane: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                for y in stripe..(stripe + STRIPE).min(h) {
                    let i = self.idx(x, y);
                    if self.state[i] & SIG == 0 || self.state[i] & VISITED != 0 {
                        continue;
                    }
                    let cx = self.mr_context(x, y);
                    let bit = self.mq.decode_bit(cx);
                    if bit != 0 {
                        if self.state[i] & SIGN != 0 {
                            self.coefficients[i] -= 1 << plane;
                        } else {
                            self.coefficients[i] += 1 << plane;
                        }
                    }
                    self.state[i] |= VISITED | REFINE;
                }
            }
        }
    }

    fn decode_cleanup(&mut self, plane: u8, orientation: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                let stripe_h = (stripe + STRIPE).min(h) - stripe;
                let mut y = stripe;
                if stripe_h == STRIPE && self.rlc_eligible(x, stripe) {
                    if self.mq.decode_bit(CTX_RUN) == 0 {
                        // whole column stays insignificant
                        continue;
                    }
                    let hi = self.mq.decode_bit(CTX_UNIFORM) as u32;
                    let lo = self.mq.decode_bit(CTX_UNIFORM) as u32;
                    let pos = (hi << 1) | lo;
                    let yy = stripe + pos;
                    self.decode_sign_into(x, yy, plane);
                    y = yy + 1;
                }
                while y < stripe + stripe_h {
                    let i = self.idx(x, y);
                    if self.state[i] & VISITED == 0 && self.state[i] & SIG == 0 {
                        let (hc, vc, dc) = self.neighbors(x, y);
                        let cx = self.zc_context(orientation, hc, vc, dc);
                        if self.mq.decode_bit(cx) != 0 {
                            self.decode_sign_into(x, y, plane);
                        }
                    }
                    y += 1;
                }
            }
        }
    }

    /// A stripe column qualifies for run-length coding when every
    /// sample is insignificant, unvisited and without significant
    /// neighbours.
    fn rlc_eligible(&self, x: u32, stripe: u32) -> bool {
        for y in stripe..stripe + STRIPE {
            let i = self.idx(x, y);
            if self.state[i] & (SIG | VISITED) != 0 {
                return false;
            }
            let (hc, vc, dc) = self.neighbors(x, y);
            if hc + vc + dc != 0 {
                return false;
            }
        }
        true
    }

    fn decode_sign_into(&mut self, x: u32, y: u32, plane: u8) {
        let sc = self.sign_context(x, y);
        let sym = self.mq.decode_bit(sc & 0xFF);
        let sign = sym ^ ((sc >> 8) as u8 & 1);
        let i = self.idx(x, y);
        self.state[i] |= SIG;
        if sign != 0 {
            self.state[i] |= SIGN;
            self.coefficients[i] = -(1i32 << plane);
        } else {
            self.coefficients[i] = 1i32 << plane;
        }
    }

    /// The optional segmentation symbol is the uniform-context sequence
    /// 1010 at the end of each cleanup pass.
    fn check_segment_symbol(&mut self) -> Result<()> {
        let mut v = 0u32;
        for _ in 0..4 {
            v = (v << 1) | self.mq.decode_bit(CTX_UNIFORM) as u32;
        }
        if v != 0xA {
            return Err(CodecError::T1DecodeFailure(format!(
                "segmentation symbol mismatch (0x{v:X})"
            )));
        }
        Ok(())
    }

    // --- encoding ---

    /// Encode a code-block of sign-magnitude coefficients; returns the
    /// MQ byte segment and the number of coding passes produced.
    pub fn encode_block(
        &mut self,
        coeffs: &[i32],
        width: u32,
        height: u32,
        num_bps: u8,
        orientation: u8,
    ) -> (Vec<u8>, u32) {
        self.reset(width, height, false);
        self.mq.restart_encoder();
        if num_bps == 0 {
            return (Vec::new(), 0);
        }

        let mut passes = 0u32;
        self.encode_cleanup(coeffs, num_bps - 1, orientation);
        self.clear_visited();
        passes += 1;
        for plane in (0..num_bps - 1).rev() {
            self.encode_sig_prop(coeffs, plane, orientation);
            self.encode_mag_ref(coeffs, plane);
            self.encode_cleanup(coeffs, plane, orientation);
            self.clear_visited();
            passes += 3;
        }
        self.mq.flush();
        (self.mq.take_buffer(), passes)
    }

    fn encode_sig_prop(&mut self, coeffs: &[i32], plane: u8, orientation: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                for y in stripe..(stripe + STRIPE).min(h) {
                    let i = self.idx(x, y);
                    if self.state[i] & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let (hc, vc, dc) = self.neighbors(x, y);
                    if hc == 0 && vc == 0 && dc == 0 {
                        continue;
                    }
                    let bit = ((coeffs[i].unsigned_abs() >> plane) & 1) as u8;
                    let cx = self.zc_context(orientation, hc, vc, dc);
                    self.mq.encode(bit, cx);
                    if bit == 1 {
                        self.encode_sign_of(coeffs, x, y);
                    }
                    self.state[i] |= VISITED;
                }
            }
        }
    }

    fn encode_mag_ref(&mut self, coeffs: &[i32], plane: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                for y in stripe..(stripe + STRIPE).min(h) {
                    let i = self.idx(x, y);
                    if self.state[i] & SIG == 0 || self.state[i] & VISITED != 0 {
                        continue;
                    }
                    let bit = ((coeffs[i].unsigned_abs() >> plane) & 1) as u8;
                    let cx = self.mr_context(x, y);
                    self.mq.encode(bit, cx);
                    self.state[i] |= VISITED | REFINE;
                }
            }
        }
    }

    fn encode_cleanup(&mut self, coeffs: &[i32], plane: u8, orientation: u8) {
        let (w, h) = (self.width, self.height);
        for stripe in (0..h).step_by(STRIPE as usize) {
            for x in 0..w {
                let stripe_h = (stripe + STRIPE).min(h) - stripe;
                let mut y = stripe;
                if stripe_h == STRIPE && self.rlc_eligible(x, stripe) {
                    let first_sig = (stripe..stripe + STRIPE).find(|&yy| {
                        (coeffs[self.idx(x, yy)].unsigned_abs() >> plane) & 1 == 1
                    });
                    match first_sig {
                        None => {
                            self.mq.encode(0, CTX_RUN);
                            continue;
                        }
                        Some(yy) => {
                            self.mq.encode(1, CTX_RUN);
                            let pos = yy - stripe;
                            self.mq.encode(((pos >> 1) & 1) as u8, CTX_UNIFORM);
                            self.mq.encode((pos & 1) as u8, CTX_UNIFORM);
                            self.encode_sign_of(coeffs, x, yy);
                            y = yy + 1;
                        }
                    }
                }
                while y < stripe + stripe_h {
                    let i = self.idx(x, y);
                    if self.state[i] & VISITED == 0 && self.state[i] & SIG == 0 {
                        let bit = ((coeffs[i].unsigned_abs() >> plane) & 1) as u8;
                        let (hc, vc, dc) = self.neighbors(x, y);
                        let cx = self.zc_context(orientation, hc, vc, dc);
                        self.mq.encode(bit, cx);
                        if bit == 1 {
                            self.encode_sign_of(coeffs, x, y);
                        }
                    }
                    y += 1;
                }
            }
        }
    }

    fn encode_sign_of(&mut self, coeffs: &[i32], x: u32, y: u32) {
        let i = self.idx(x, y);
        let sign = (coeffs[i] < 0) as u8;
        // significance must be set after computing the sign context of
        // the sample itself but the neighbours see it from now on
        let sc = self.sign_context(x, y);
        let sym = sign ^ ((sc >> 8) as u8 & 1);
        self.state[i] |= SIG;
        if sign != 0 {
            self.state[i] |= SIGN;
        }
        self.mq.encode(sym, sc & 0xFF);
    }
}

impl Default for BlockCoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit planes needed to represent the largest magnitude.
pub fn num_bit_planes(coeffs: &[i32]) -> u8 {
    let max = coeffs.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0);
    (32 - max.leading_zeros()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(coeffs: &[i32], w: u32, h: u32, orientation: u8) {
        let bps = num_bit_planes(coeffs);
        let mut enc = BlockCoder::new();
        let (data, passes) = enc.encode_block(coeffs, w, h, bps, orientation);
        let mut dec = BlockCoder::new();
        let out = dec
            .decode_block(&data, w, h, bps, passes, orientation, 0)
            .unwrap();
        assert_eq!(coeffs, &out[..], "block {w}x{h} orientation {orientation}");
    }

    #[test]
    fn sparse_block_round_trip() {
        let mut coeffs = vec![0i32; 16];
        coeffs[0] = 10;
        coeffs[5] = 5;
        coeffs[10] = -3;
        coeffs[15] = 1;
        round_trip(&coeffs, 4, 4, 0);
    }

    #[test]
    fn dense_block_round_trip() {
        let coeffs = [
            -128i32, -64, 32, 16, -32, 64, -16, 8, 0, -8, 4, -4, 2, -2, 1, -1,
        ];
        round_trip(&coeffs, 4, 4, 0);
    }

    #[test]
    fn all_orientations_round_trip() {
        let coeffs = [3i32, 0, -7, 1, 0, 0, 2, -1, 5, 0, 0, -6, 1, 1, 0, 9];
        for orientation in 0..4 {
            round_trip(&coeffs, 4, 4, orientation);
        }
    }

    #[test]
    fn non_multiple_of_stripe_height() {
        let coeffs = [7i32, -2, 0, 0, 3, 0, 0, 0, 0, -1, 0, 4, 0, 0, 5, 0, 0, -9];
        round_trip(&coeffs, 3, 6, 2);
    }

    #[test]
    fn all_zero_block_produces_no_passes() {
        let coeffs = vec![0i32; 64];
        let mut enc = BlockCoder::new();
        let (data, passes) = enc.encode_block(&coeffs, 8, 8, 0, 0);
        assert!(data.is_empty());
        assert_eq!(passes, 0);
    }

    #[test]
    fn wider_block_round_trip() {
        // Deterministic pseudo-random 16x8 block.
        let mut x: u32 = 0x9E3779B9;
        let coeffs: Vec<i32> = (0..128)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                ((x >> 24) as i32) - 128
            })
            .collect();
        round_trip(&coeffs, 16, 8, 3);
    }

    #[test]
    fn excessive_bit_planes_rejected() {
        let mut dec = BlockCoder::new();
        assert!(dec.decode_block(&[], 4, 4, 40, 1, 0, 0).is_err());
    }

    #[test]
    fn truncated_passes_give_partial_magnitudes() {
        let coeffs = [100i32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -100];
        let bps = num_bit_planes(&coeffs);
        let mut enc = BlockCoder::new();
        let (data, passes) = enc.encode_block(&coeffs, 4, 4, bps, 0);
        let mut dec = BlockCoder::new();
        // Decoding fewer passes must not fail and yields magnitudes
        // truncated at the undecoded planes.
        let out = dec
            .decode_block(&data, 4, 4, bps, passes.saturating_sub(3), 0, 0)
            .unwrap();
        assert!(out[0] > 0 && out[0] <= 100);
        assert!(out[15] < 0 && out[15] >= -100);
    }
}
