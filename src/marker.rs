//! JPEG 2000 codestream marker codes and the registry of legal decoder
//! states for each marker handler.

use crate::error::CodecError;

/// Decoder state bits. The reader holds a current state word; each
/// marker handler declares the set of states in which it is legal.
pub mod state {
    /// Before SOC has been read.
    pub const MH_SOC: u16 = 0x0001;
    /// SOC read, expecting SIZ.
    pub const MH_SIZ: u16 = 0x0002;
    /// Inside the main header (after SIZ, before first SOT).
    pub const MH_MAIN: u16 = 0x0004;
    /// Expecting a SOT marker (a new tile-part header).
    pub const TPH_SOT: u16 = 0x0008;
    /// Inside a tile-part header (after SOT, before SOD).
    pub const TPH: u16 = 0x0010;
    /// Inside tile-part data.
    pub const DATA: u16 = 0x0020;
    /// EOC read.
    pub const EOC: u16 = 0x0040;
    /// Stream ended with no EOC marker.
    pub const NO_EOC: u16 = 0x0080;
}

/// Marker codes recognised by this decoder (ISO/IEC 15444-1 Annex A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Marker {
    /// SOC: Start of codestream.
    Soc = 0xFF4F,
    /// CAP: Extended capability (Part 2 / Part 15 signalling).
    Cap = 0xFF50,
    /// SIZ: Image and tile size.
    Siz = 0xFF51,
    /// COD: Coding style default.
    Cod = 0xFF52,
    /// COC: Coding style component.
    Coc = 0xFF53,
    /// TLM: Tile-part lengths.
    Tlm = 0xFF55,
    /// PLM: Packet lengths, main header.
    Plm = 0xFF57,
    /// PLT: Packet lengths, tile-part header.
    Plt = 0xFF58,
    /// QCD: Quantization default.
    Qcd = 0xFF5C,
    /// QCC: Quantization component.
    Qcc = 0xFF5D,
    /// RGN: Region of interest.
    Rgn = 0xFF5E,
    /// POC: Progression order change.
    Poc = 0xFF5F,
    /// PPM: Packed packet headers, main header.
    Ppm = 0xFF60,
    /// PPT: Packed packet headers, tile-part header.
    Ppt = 0xFF61,
    /// CRG: Component registration.
    Crg = 0xFF63,
    /// COM: Comment.
    Com = 0xFF64,
    /// MCT: Multiple component transform definition.
    Mct = 0xFF74,
    /// MCC: Multiple component collection.
    Mcc = 0xFF75,
    /// MCO: Multiple component transform ordering.
    Mco = 0xFF77,
    /// CBD: Component bit depth definition.
    Cbd = 0xFF78,
    /// SOT: Start of tile-part.
    Sot = 0xFF90,
    /// SOP: Start of packet.
    Sop = 0xFF91,
    /// EPH: End of packet header.
    Eph = 0xFF92,
    /// SOD: Start of data.
    Sod = 0xFF93,
    /// EOC: End of codestream.
    Eoc = 0xFFD9,
}

impl Marker {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Markers carrying no length field (A.4.1): everything else is
    /// followed by a 2-byte big-endian segment length.
    pub fn is_delimiting(self) -> bool {
        matches!(
            self,
            Marker::Soc | Marker::Eoc | Marker::Sod | Marker::Sop | Marker::Eph
        )
    }
}

impl TryFrom<u16> for Marker {
    type Error = CodecError;

    fn try_from(code: u16) -> Result<Self, CodecError> {
        Ok(match code {
            0xFF4F => Marker::Soc,
            0xFF50 => Marker::Cap,
            0xFF51 => Marker::Siz,
            0xFF52 => Marker::Cod,
            0xFF53 => Marker::Coc,
            0xFF55 => Marker::Tlm,
            0xFF57 => Marker::Plm,
            0xFF58 => Marker::Plt,
            0xFF5C => Marker::Qcd,
            0xFF5D => Marker::Qcc,
            0xFF5E => Marker::Rgn,
            0xFF5F => Marker::Poc,
            0xFF60 => Marker::Ppm,
            0xFF61 => Marker::Ppt,
            0xFF63 => Marker::Crg,
            0xFF64 => Marker::Com,
            0xFF74 => Marker::Mct,
            0xFF75 => Marker::Mcc,
            0xFF77 => Marker::Mco,
            0xFF78 => Marker::Cbd,
            0xFF90 => Marker::Sot,
            0xFF91 => Marker::Sop,
            0xFF92 => Marker::Eph,
            0xFF93 => Marker::Sod,
            0xFFD9 => Marker::Eoc,
            _ => {
                return Err(CodecError::UnsupportedFeature(format!(
                    "unknown marker 0x{code:04X}"
                )))
            }
        })
    }
}

/// Legal decoder states for a marker, i.e. the MarkerRegistry.
///
/// A handler invoked while the reader state has no bit in common with
/// this mask fails with `MarkerOutOfPlace`.
pub fn legal_states(marker: Marker) -> u16 {
    use state::*;
    match marker {
        Marker::Soc => MH_SOC,
        Marker::Siz => MH_SIZ,
        Marker::Cap => MH_MAIN,
        Marker::Cod | Marker::Coc | Marker::Qcd | Marker::Qcc | Marker::Poc | Marker::Rgn => {
            MH_MAIN | TPH
        }
        Marker::Com | Marker::Mct | Marker::Mcc | Marker::Mco => MH_MAIN | TPH,
        Marker::Crg | Marker::Cbd | Marker::Tlm | Marker::Plm | Marker::Ppm => MH_MAIN,
        Marker::Plt | Marker::Ppt => TPH,
        Marker::Sot => MH_MAIN | TPH_SOT,
        Marker::Sod => TPH,
        Marker::Sop | Marker::Eph => DATA,
        Marker::Eoc => TPH_SOT | DATA,
    }
}

/// Fixed size of the Scod/SGcod prefix of a COD segment: Scod(1) +
/// progression(1) + layers(2) + MCT(1).
pub const COD_COC_LEN: u16 = 5;
/// Fixed size of the SPcod/SPcoc block: decompositions(1) + cblkw(1) +
/// cblkh(1) + cblk style(1) + transformation(1).
pub const SPCOD_SPCOC_LEN: u16 = 5;
/// TLM(2) + Ltlm(2) + Ztlm(1) + Stlm(1).
pub const TLM_MARKER_START_BYTES: u16 = 6;
/// Lsot value: Isot(2) + Psot(4) + TPsot(1) + TNsot(1) + Lsot itself(2).
pub const LSOT: u16 = 10;
/// Lsop value for a SOP marker segment.
pub const LSOP: u16 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip() {
        for code in [0xFF4Fu16, 0xFF51, 0xFF52, 0xFF5C, 0xFF90, 0xFF93, 0xFFD9] {
            let m = Marker::try_from(code).unwrap();
            assert_eq!(m.code(), code);
        }
        assert!(Marker::try_from(0xFF99).is_err());
    }

    #[test]
    fn delimiting_markers_have_no_length() {
        assert!(Marker::Soc.is_delimiting());
        assert!(Marker::Eoc.is_delimiting());
        assert!(Marker::Sod.is_delimiting());
        assert!(!Marker::Siz.is_delimiting());
        assert!(!Marker::Sot.is_delimiting());
    }

    #[test]
    fn siz_only_legal_after_soc() {
        assert_eq!(legal_states(Marker::Siz), state::MH_SIZ);
        assert_eq!(legal_states(Marker::Siz) & state::MH_MAIN, 0);
    }
}
