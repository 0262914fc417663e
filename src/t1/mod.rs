//! Tier-1 block coding: the EBCOT coefficient coder, the MQ arithmetic
//! coder underneath it, and the parallel code-block scheduler.

pub mod block_coder;
pub mod mq_coder;
pub mod scheduler;

use crate::quantization::{dequantize_scalar, roi_shift_down};

/// Which Tier-1 implementation a code-block requires. The HT (Part 15)
/// coder is a pluggable variant; its bit-decoder is not implemented
/// here and blocks carrying it decode to an empty (zero) block with a
/// warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T1Kind {
    Standard,
    Ht,
}

/// Decoded coefficients of one code-block, integer for the reversible
/// path and dequantized floats for the irreversible path.
#[derive(Debug, Clone)]
pub enum BlockResult {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

impl BlockResult {
    pub fn is_empty(&self) -> bool {
        match self {
            BlockResult::Int(v) => v.is_empty(),
            BlockResult::Float(v) => v.is_empty(),
        }
    }
}

/// One decode task: everything a worker needs to decode a single
/// code-block, plus the slot receiving the output. Tasks are
/// independent because their outputs are disjoint.
#[derive(Debug, Clone)]
pub struct DecompressBlockExec {
    pub kind: T1Kind,
    /// Concatenated compressed segments across the included layers.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Band-coordinate position of the block inside its band window.
    pub x0: u32,
    pub y0: u32,
    pub compno: u16,
    pub resno: u8,
    /// Band orientation (0=LL, 1=HL, 2=LH, 3=HH).
    pub orientation: u8,
    /// Magnitude bit planes for this block: band M_b minus the
    /// signalled missing planes.
    pub num_bps: u8,
    pub num_passes: u32,
    pub cblk_sty: u8,
    pub reversible: bool,
    pub stepsize: f32,
    pub roishift: u8,
    /// Output slot, filled by the scheduler.
    pub result: Option<BlockResult>,
}

impl DecompressBlockExec {
    /// Post-process raw sign-magnitude coefficients: undo the ROI
    /// upshift, then dequantize on the irreversible path.
    pub(crate) fn post_process(&self, raw: Vec<i32>) -> BlockResult {
        if self.reversible {
            let out = if self.roishift == 0 {
                raw
            } else {
                raw.into_iter()
                    .map(|v| roi_shift_down(v, self.roishift))
                    .collect()
            };
            BlockResult::Int(out)
        } else {
            let out = raw
                .into_iter()
                .map(|v| dequantize_scalar(roi_shift_down(v, self.roishift), self.stepsize))
                .collect();
            BlockResult::Float(out)
        }
    }
}
