//! Codestream marker emission for the encoder.

use crate::error::Result;
use crate::image::J2kImage;
use crate::marker::{Marker, LSOT};
use crate::params::{QuantStyle, StepSize};

/// Growable big-endian codestream writer.
#[derive(Default)]
pub struct J2kStreamWriter {
    out: Vec<u8>,
}

impl J2kStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    pub fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    pub fn write_marker(&mut self, m: Marker) {
        self.write_u16(m.code());
    }

    pub fn write_soc(&mut self) {
        self.write_marker(Marker::Soc);
    }

    pub fn write_eoc(&mut self) {
        self.write_marker(Marker::Eoc);
    }

    pub fn write_siz(&mut self, image: &J2kImage) {
        self.write_marker(Marker::Siz);
        self.write_u16(38 + 3 * image.comps.len() as u16);
        self.write_u16(0); // Rsiz
        self.write_u32(image.x1);
        self.write_u32(image.y1);
        self.write_u32(image.x0);
        self.write_u32(image.y0);
        self.write_u32(image.tdx);
        self.write_u32(image.tdy);
        self.write_u32(image.tx0);
        self.write_u32(image.ty0);
        self.write_u16(image.comps.len() as u16);
        for c in &image.comps {
            let ssiz = (c.prec - 1) | if c.sgnd { 0x80 } else { 0 };
            self.write_u8(ssiz);
            self.write_u8(c.dx as u8);
            self.write_u8(c.dy as u8);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_cod(
        &mut self,
        prog: u8,
        numlayers: u16,
        mct: u8,
        decomps: u8,
        cblkw_exp: u8,
        cblkh_exp: u8,
        reversible: bool,
    ) {
        self.write_marker(Marker::Cod);
        self.write_u16(12);
        self.write_u8(0); // Scod: default precincts, no SOP/EPH
        self.write_u8(prog);
        self.write_u16(numlayers);
        self.write_u8(mct);
        self.write_u8(decomps);
        self.write_u8(cblkw_exp - 2);
        self.write_u8(cblkh_exp - 2);
        self.write_u8(0); // code-block style
        self.write_u8(if reversible { 1 } else { 0 });
    }

    pub fn write_qcd(&mut self, qntsty: QuantStyle, numgbits: u8, stepsizes: &[StepSize]) {
        self.write_marker(Marker::Qcd);
        let per = if qntsty == QuantStyle::NoQnt { 1 } else { 2 };
        self.write_u16(3 + per * stepsizes.len() as u16);
        self.write_u8((numgbits << 5) | qntsty as u8);
        for s in stepsizes {
            if qntsty == QuantStyle::NoQnt {
                self.write_u8(s.expn << 3);
            } else {
                self.write_u16(((s.expn as u16) << 11) | s.mant);
            }
        }
    }

    pub fn write_com(&mut self, text: &str) {
        self.write_marker(Marker::Com);
        self.write_u16(4 + text.len() as u16);
        self.write_u16(1); // Latin text
        self.write_bytes(text.as_bytes());
    }

    /// Write a SOT segment; `psot` may be patched later via
    /// `patch_psot` using the returned marker offset.
    pub fn write_sot(&mut self, tile_index: u16, psot: u32, tpsot: u8, tnsot: u8) -> usize {
        let pos = self.out.len();
        self.write_marker(Marker::Sot);
        self.write_u16(LSOT);
        self.write_u16(tile_index);
        self.write_u32(psot);
        self.write_u8(tpsot);
        self.write_u8(tnsot);
        pos
    }

    /// Fix up Psot once the tile-part length is known. `sot_pos` is
    /// the offset returned by `write_sot`.
    pub fn patch_psot(&mut self, sot_pos: usize) -> Result<()> {
        let psot = (self.out.len() - sot_pos) as u32;
        let field = sot_pos + 6;
        self.out[field..field + 4].copy_from_slice(&psot.to_be_bytes());
        Ok(())
    }

    pub fn write_sod(&mut self) {
        self.write_marker(Marker::Sod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::J2kComponent;

    #[test]
    fn header_sequence_contains_expected_markers() {
        let mut image = J2kImage {
            x1: 512,
            y1: 512,
            tdx: 128,
            tdy: 128,
            comps: vec![J2kComponent {
                dx: 1,
                dy: 1,
                prec: 8,
                ..Default::default()
            }],
            ..Default::default()
        };
        image.update_component_rects();

        let mut w = J2kStreamWriter::new();
        w.write_soc();
        w.write_siz(&image);
        w.write_cod(0, 1, 0, 5, 6, 6, true);
        w.write_qcd(
            QuantStyle::NoQnt,
            2,
            &[StepSize { expn: 9, mant: 0 }; 16],
        );
        let sot = w.write_sot(0, 0, 0, 1);
        w.write_sod();
        w.write_bytes(&[0x00]);
        w.patch_psot(sot).unwrap();
        w.write_eoc();

        let bytes = w.into_bytes();
        assert_eq!(&bytes[..2], &[0xFF, 0x4F]);
        assert_eq!(&bytes[2..4], &[0xFF, 0x51]);
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0x52]));
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0x5C]));
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0x90]));
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
        // Psot covers SOT(12) + SOD(2) + one packet byte
        let psot = u32::from_be_bytes([bytes[sot + 6], bytes[sot + 7], bytes[sot + 8], bytes[sot + 9]]);
        assert_eq!(psot, 15);
    }
}
