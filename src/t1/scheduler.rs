//! Parallel dispatch of code-block decode tasks.
//!
//! Workers pull tasks from an immutable task list; each worker owns one
//! `BlockCoder` for reuse across its tasks. Failure is published
//! through a shared atomic flag read at task entry: once set, remaining
//! tasks free their inputs and return without decoding, so the whole
//! list always drains.

use super::block_coder::BlockCoder;
use super::{BlockResult, DecompressBlockExec, T1Kind};
use crate::error::CodecError;
use crate::runtime::Runtime;
use log::{error, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct T1Scheduler;

impl T1Scheduler {
    /// Decode every block in place. Returns false when a fatal error
    /// occurred (the tile is then marked failed by the caller).
    pub fn decompress(runtime: &Runtime, blocks: &mut [DecompressBlockExec]) -> bool {
        if blocks.is_empty() {
            return true;
        }
        let failed = AtomicBool::new(false);
        if runtime.workers() == 1 {
            let mut coder = BlockCoder::new();
            for block in blocks.iter_mut() {
                Self::run_task(&mut coder, block, &failed);
            }
        } else {
            runtime.install(|| {
                blocks
                    .par_iter_mut()
                    .for_each_init(BlockCoder::new, |coder, block| {
                        Self::run_task(coder, block, &failed);
                    });
            });
        }
        !failed.load(Ordering::Acquire)
    }

    fn run_task(coder: &mut BlockCoder, block: &mut DecompressBlockExec, failed: &AtomicBool) {
        if failed.load(Ordering::Acquire) {
            // a task observed after failure only frees its input
            block.data = Vec::new();
            return;
        }
        match block.kind {
            T1Kind::Ht => {
                warn!(
                    "HT code-block at comp {} res {} ({},{}): the high-throughput \
                     bit-decoder is not implemented; emitting an empty block",
                    block.compno, block.resno, block.x0, block.y0
                );
                let n = (block.width * block.height) as usize;
                block.result = Some(if block.reversible {
                    BlockResult::Int(vec![0; n])
                } else {
                    BlockResult::Float(vec![0.0; n])
                });
            }
            T1Kind::Standard => {
                let decoded = coder.decode_block(
                    &block.data,
                    block.width,
                    block.height,
                    block.num_bps,
                    block.num_passes,
                    block.orientation,
                    block.cblk_sty,
                );
                match decoded {
                    Ok(raw) => {
                        block.result = Some(block.post_process(raw));
                    }
                    Err(CodecError::T1DecodeFailure(msg)) => {
                        // partial block delivered, tile continues
                        warn!(
                            "code-block at comp {} res {} ({},{}): {msg}; delivering partial block",
                            block.compno, block.resno, block.x0, block.y0
                        );
                        let n = (block.width * block.height) as usize;
                        block.result = Some(block.post_process(vec![0; n]));
                    }
                    Err(e) => {
                        error!(
                            "code-block at comp {} res {} ({},{}): {e}",
                            block.compno, block.resno, block.x0, block.y0
                        );
                        failed.store(true, Ordering::Release);
                    }
                }
            }
        }
        block.data = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t1::block_coder::num_bit_planes;

    fn make_block(coeffs: &[i32], w: u32, h: u32) -> DecompressBlockExec {
        let bps = num_bit_planes(coeffs);
        let mut enc = BlockCoder::new();
        let (data, passes) = enc.encode_block(coeffs, w, h, bps, 0);
        DecompressBlockExec {
            kind: T1Kind::Standard,
            data,
            width: w,
            height: h,
            x0: 0,
            y0: 0,
            compno: 0,
            resno: 0,
            orientation: 0,
            num_bps: bps,
            num_passes: passes,
            cblk_sty: 0,
            reversible: true,
            stepsize: 1.0,
            roishift: 0,
            result: None,
        }
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let coeffs: Vec<i32> = (0..64).map(|i| (i * 7 % 23) - 11).collect();
        let mut seq: Vec<_> = (0..8).map(|_| make_block(&coeffs, 8, 8)).collect();
        let mut par = seq.clone();

        assert!(T1Scheduler::decompress(&Runtime::single_threaded(), &mut seq));
        assert!(T1Scheduler::decompress(&Runtime::new(4).unwrap(), &mut par));

        for (a, b) in seq.iter().zip(par.iter()) {
            match (a.result.as_ref().unwrap(), b.result.as_ref().unwrap()) {
                (BlockResult::Int(x), BlockResult::Int(y)) => {
                    assert_eq!(x, y);
                    assert_eq!(x, &coeffs);
                }
                _ => panic!("expected integer results"),
            }
        }
    }

    #[test]
    fn fatal_error_drains_remaining_tasks() {
        let coeffs = vec![1i32; 16];
        let mut blocks = vec![make_block(&coeffs, 4, 4), make_block(&coeffs, 4, 4)];
        // poison the first block with an impossible plane count
        blocks[0].num_bps = 40;
        let ok = T1Scheduler::decompress(&Runtime::single_threaded(), &mut blocks);
        assert!(!ok);
        // every task freed its input even after the failure
        assert!(blocks.iter().all(|b| b.data.is_empty()));
    }

    #[test]
    fn ht_blocks_decode_to_zeros() {
        let mut blocks = vec![DecompressBlockExec {
            kind: T1Kind::Ht,
            data: vec![1, 2, 3],
            width: 4,
            height: 4,
            x0: 0,
            y0: 0,
            compno: 0,
            resno: 0,
            orientation: 0,
            num_bps: 8,
            num_passes: 1,
            cblk_sty: crate::params::cblk_sty::HT,
            reversible: true,
            stepsize: 1.0,
            roishift: 0,
            result: None,
        }];
        assert!(T1Scheduler::decompress(&Runtime::single_threaded(), &mut blocks));
        match blocks[0].result.as_ref().unwrap() {
            BlockResult::Int(v) => assert!(v.iter().all(|&x| x == 0)),
            _ => panic!("expected integer result"),
        }
    }
}
