//! MQ arithmetic coder (ISO/IEC 15444-1 Annex C).

/// One row of the probability state table (Table C-2).
#[derive(Clone, Copy)]
struct MqState {
    qe: u16,
    nmps: u8,
    nlps: u8,
    switch: u8,
}

macro_rules! st {
    ($qe:expr, $nmps:expr, $nlps:expr, $sw:expr) => {
        MqState {
            qe: $qe,
            nmps: $nmps,
            nlps: $nlps,
            switch: $sw,
        }
    };
}

#[rustfmt::skip]
const MQ_TABLE: [MqState; 47] = [
    st!(0x5601,  1,  1, 1), st!(0x3401,  2,  6, 0), st!(0x1801,  3,  9, 0),
    st!(0x0AC1,  4, 12, 0), st!(0x0521,  5, 29, 0), st!(0x0221, 38, 33, 0),
    st!(0x5601,  7,  6, 1), st!(0x5401,  8, 14, 0), st!(0x4801,  9, 14, 0),
    st!(0x3801, 10, 14, 0), st!(0x3001, 11, 17, 0), st!(0x2401, 12, 18, 0),
    st!(0x1C01, 13, 20, 0), st!(0x1601, 29, 21, 0), st!(0x5601, 15, 14, 1),
    st!(0x5401, 16, 14, 0), st!(0x5101, 17, 15, 0), st!(0x4801, 18, 16, 0),
    st!(0x3801, 19, 17, 0), st!(0x3401, 20, 18, 0), st!(0x3001, 21, 19, 0),
    st!(0x2801, 22, 19, 0), st!(0x2401, 23, 19, 0), st!(0x2201, 24, 19, 0),
    st!(0x1C01, 25, 20, 0), st!(0x1801, 26, 21, 0), st!(0x1601, 27, 22, 0),
    st!(0x1401, 28, 23, 0), st!(0x1201, 29, 24, 0), st!(0x1101, 30, 25, 0),
    st!(0x0AC1, 31, 26, 0), st!(0x09C1, 32, 27, 0), st!(0x08A1, 33, 28, 0),
    st!(0x0521, 34, 29, 0), st!(0x0441, 35, 30, 0), st!(0x02A1, 36, 31, 0),
    st!(0x0221, 37, 32, 0), st!(0x0141, 38, 33, 0), st!(0x0111, 39, 34, 0),
    st!(0x0085, 40, 35, 0), st!(0x0049, 41, 36, 0), st!(0x0025, 42, 37, 0),
    st!(0x0015, 43, 38, 0), st!(0x0009, 44, 39, 0), st!(0x0005, 45, 40, 0),
    st!(0x0001, 45, 41, 0), st!(0x5601, 46, 46, 0),
];

/// MQ coder holding both the encoder and decoder register set. A
/// context byte packs the state index in bits 7..1 and the MPS in bit 0.
pub struct MqCoder {
    a: u16,
    c: u32,
    ct: u8,

    // encoder output
    bp: Vec<u8>,

    // decoder input
    source: Vec<u8>,
    src_pos: usize,

    contexts: Vec<u8>,
}

impl Default for MqCoder {
    fn default() -> Self {
        Self {
            a: 0x8000,
            c: 0,
            ct: 12,
            // leading scratch byte absorbs a carry before the first
            // real output byte; buffer() skips it
            bp: vec![0],
            contexts: vec![0; 19],
            source: Vec::new(),
            src_pos: 0,
        }
    }
}

impl MqCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_contexts(&mut self, size: usize) {
        self.contexts = vec![0; size];
    }

    /// Pin a context to a table state and MPS value.
    pub fn set_context(&mut self, cx: usize, state_idx: u8, mps: u8) {
        if cx < self.contexts.len() {
            self.contexts[cx] = (state_idx << 1) | (mps & 1);
        }
    }

    /// Reset every context to state 0 / MPS 0 (callers then pin the
    /// standard exceptions).
    pub fn reset_contexts(&mut self) {
        for c in &mut self.contexts {
            *c = 0;
        }
    }

    // --- decoder (C.3) ---

    /// INITDEC.
    pub fn init_decoder(&mut self, data: &[u8]) {
        self.source = data.to_vec();
        self.src_pos = 0;
        self.ct = 0;
        self.c = if data.is_empty() {
            0xFF << 16
        } else {
            (data[0] as u32) << 16
        };
        self.byte_in();
        self.c <<= 7;
        self.ct = self.ct.saturating_sub(7);
        self.a = 0x8000;
    }

    /// BYTEIN with marker detection: a byte pair 0xFF, >0x8F marks the
    /// end of the segment and feeds 1-bits from then on.
    fn byte_in(&mut self) {
        if self.src_pos >= self.source.len() {
            self.c += 0xFF00;
            self.ct = 8;
            return;
        }
        let current = self.source[self.src_pos];
        if current == 0xFF {
            let next = if self.src_pos + 1 < self.source.len() {
                self.source[self.src_pos + 1]
            } else {
                0xFF
            };
            if next > 0x8F {
                self.c += 0xFF00;
                self.ct = 8;
            } else {
                self.src_pos += 1;
                self.c += (self.source[self.src_pos] as u32) << 9;
                self.ct = 7;
            }
        } else {
            self.src_pos += 1;
            if self.src_pos < self.source.len() {
                self.c += (self.source[self.src_pos] as u32) << 8;
                self.ct = 8;
            } else {
                self.c += 0xFF00;
                self.ct = 8;
            }
        }
    }

    /// DECODE (C.3.2). The LPS sub-interval sits at the base of the
    /// interval with size Qe; the MPS occupies [Qe, A).
    pub fn decode_bit(&mut self, cx: usize) -> u8 {
        let ctx = self.contexts[cx];
        let idx = (ctx >> 1) as usize;
        let mps = ctx & 1;
        let qe = MQ_TABLE[idx].qe;

        self.a -= qe;
        let chigh = (self.c >> 16) as u16;

        if chigh < qe {
            // lower sub-interval, size Qe
            let d = if self.a < qe {
                // conditional exchange: the MPS took the smaller interval
                self.contexts[cx] = (MQ_TABLE[idx].nmps << 1) | mps;
                mps
            } else {
                let next_mps = if MQ_TABLE[idx].switch == 1 { 1 - mps } else { mps };
                self.contexts[cx] = (MQ_TABLE[idx].nlps << 1) | next_mps;
                1 - mps
            };
            self.a = qe;
            self.renorm_decode();
            d
        } else {
            self.c -= (qe as u32) << 16;
            if self.a < 0x8000 {
                let d = if self.a < qe {
                    // conditional exchange: the LPS took the larger interval
                    let next_mps = if MQ_TABLE[idx].switch == 1 { 1 - mps } else { mps };
                    self.contexts[cx] = (MQ_TABLE[idx].nlps << 1) | next_mps;
                    1 - mps
                } else {
                    self.contexts[cx] = (MQ_TABLE[idx].nmps << 1) | mps;
                    mps
                };
                self.renorm_decode();
                d
            } else {
                mps
            }
        }
    }

    fn renorm_decode(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_in();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct = self.ct.saturating_sub(1);
            if self.a >= 0x8000 {
                break;
            }
        }
    }

    // --- encoder (C.2) ---

    /// ENCODE: code decision `d` in context `cx`.
    pub fn encode(&mut self, d: u8, cx: usize) {
        let ctx = self.contexts[cx];
        let idx = (ctx >> 1) as usize;
        let mps = ctx & 1;
        let qe = MQ_TABLE[idx].qe;

        self.a -= qe;
        if d == mps {
            if self.a & 0x8000 == 0 {
                if self.a < qe {
                    // conditional exchange: MPS takes the lower Qe interval
                    self.a = qe;
                } else {
                    self.c += qe as u32;
                }
                self.contexts[cx] = (MQ_TABLE[idx].nmps << 1) | mps;
                self.renorm_encode();
            } else {
                self.c += qe as u32;
            }
        } else {
            if self.a < qe {
                // conditional exchange: LPS takes the upper interval
                self.c += qe as u32;
            } else {
                self.a = qe;
            }
            let next_mps = if MQ_TABLE[idx].switch == 1 { 1 - mps } else { mps };
            self.contexts[cx] = (MQ_TABLE[idx].nlps << 1) | next_mps;
            self.renorm_encode();
        }
    }

    fn renorm_encode(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.ct == 0 {
                self.byte_out();
            }
            if self.a >= 0x8000 {
                break;
            }
        }
    }

    /// BYTEOUT with carry propagation into the previous byte and bit
    /// stuffing after 0xFF.
    fn byte_out(&mut self) {
        let last = *self.bp.last().unwrap_or(&0);
        if last == 0xFF {
            self.bp.push((self.c >> 20) as u8);
            self.c &= 0xFFFFF;
            self.ct = 7;
        } else if self.c < 0x800_0000 {
            self.bp.push((self.c >> 19) as u8);
            self.c &= 0x7FFFF;
            self.ct = 8;
        } else {
            // carry
            if let Some(b) = self.bp.last_mut() {
                *b = last + 1;
            }
            if last + 1 == 0xFF {
                self.c &= 0x7FF_FFFF;
                self.bp.push((self.c >> 20) as u8);
                self.c &= 0xFFFFF;
                self.ct = 7;
            } else {
                self.bp.push((self.c >> 19) as u8);
                self.c &= 0x7FFFF;
                self.ct = 8;
            }
        }
    }

    /// FLUSH (C.2.9): push out the remaining code register bytes and
    /// strip a trailing 0xFF (the decoder regenerates it).
    pub fn flush(&mut self) {
        // SETBITS
        let temp = self.c + self.a as u32;
        self.c |= 0xFFFF;
        if self.c >= temp {
            self.c -= 0x8000;
        }
        self.c <<= self.ct;
        self.byte_out();
        self.c <<= self.ct;
        self.byte_out();
        if let Some(&0xFF) = self.bp.last() {
            self.bp.pop();
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.bp[1..]
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        let mut out = std::mem::replace(&mut self.bp, vec![0]);
        out.remove(0);
        out
    }

    /// Reset registers for a new encode run, keeping contexts.
    pub fn restart_encoder(&mut self) {
        self.a = 0x8000;
        self.c = 0;
        self.ct = 12;
        self.bp.clear();
        self.bp.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(bits: &[(u8, usize)], num_ctx: usize) {
        let mut enc = MqCoder::new();
        enc.init_contexts(num_ctx);
        enc.set_context(17, 3, 0);
        enc.set_context(18, 46, 0);
        for &(b, cx) in bits {
            enc.encode(b, cx);
        }
        enc.flush();
        let data = enc.buffer().to_vec();

        let mut dec = MqCoder::new();
        dec.init_contexts(num_ctx);
        dec.set_context(17, 3, 0);
        dec.set_context(18, 46, 0);
        dec.init_decoder(&data);
        for (i, &(b, cx)) in bits.iter().enumerate() {
            assert_eq!(dec.decode_bit(cx), b, "symbol {i}");
        }
    }

    #[test]
    fn initial_registers() {
        let mq = MqCoder::new();
        assert_eq!(mq.a, 0x8000);
        assert_eq!(mq.ct, 12);
    }

    #[test]
    fn single_context_round_trip() {
        round_trip(
            &[0, 0, 1, 0, 1, 1, 0, 1, 0, 0]
                .iter()
                .map(|&b| (b, 0usize))
                .collect::<Vec<_>>(),
            19,
        );
    }

    #[test]
    fn run_and_uniform_context_round_trip() {
        round_trip(&[(0, 17), (0, 17), (1, 17), (0, 17), (1, 18), (0, 18)], 19);
    }

    #[test]
    fn long_mixed_sequence_round_trip() {
        // Deterministic pseudo-random symbol stream across contexts.
        let mut bits = Vec::new();
        let mut x: u32 = 0x2545F491;
        for _ in 0..400 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            bits.push(((x >> 7) & 1) as u8);
        }
        let seq: Vec<(u8, usize)> = bits
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, i % 14))
            .collect();
        round_trip(&seq, 19);
    }

    #[test]
    fn empty_segment_decodes_zeros_forever() {
        let mut dec = MqCoder::new();
        dec.init_contexts(19);
        dec.init_decoder(&[]);
        // With no data the decoder keeps producing the MPS.
        for _ in 0..32 {
            let _ = dec.decode_bit(0);
        }
    }
}
