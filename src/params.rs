//! Persistent decoded coding parameters: image-wide values, per-tile
//! TCPs and per-component TCCPs, with the QCD/QCC and COD/COC scoping
//! flags that govern marker precedence.

use crate::error::{CodecError, Result};
use crate::length::{PacketLengthMarkers, TileLengthMarkers};

/// Maximum number of decomposition levels allowed by the standard.
pub const MAX_DECOMP_LVLS: u8 = 32;
/// Maximum resolution count (decompositions + 1).
pub const MAX_RES: usize = MAX_DECOMP_LVLS as usize + 1;
/// Maximum sub-band count: 3 per decomposition plus the LL band.
pub const MAX_BANDS: usize = 3 * MAX_DECOMP_LVLS as usize + 1;
/// Comments retained from COM markers.
pub const MAX_COMMENTS: usize = 256;

/// Progression orders (Table A.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProgressionOrder {
    #[default]
    Lrcp = 0,
    Rlcp = 1,
    Rpcl = 2,
    Pcrl = 3,
    Cprl = 4,
}

pub const NUM_PROGRESSION_ORDERS: u8 = 5;

impl TryFrom<u8> for ProgressionOrder {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ProgressionOrder::Lrcp,
            1 => ProgressionOrder::Rlcp,
            2 => ProgressionOrder::Rpcl,
            3 => ProgressionOrder::Pcrl,
            4 => ProgressionOrder::Cprl,
            _ => {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "progression order {v} (must be < {NUM_PROGRESSION_ORDERS})"
                )))
            }
        })
    }
}

/// Quantization styles (Sqcd low bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QuantStyle {
    /// No quantization (reversible path).
    #[default]
    NoQnt = 0,
    /// Scalar derived: one step size, others derived per band.
    SiQnt = 1,
    /// Scalar expounded: one step size per band.
    SeQnt = 2,
}

/// One quantization step size: 5-bit exponent, 11-bit mantissa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSize {
    pub expn: u8,
    pub mant: u16,
}

/// One progression order change (POC marker entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poc {
    pub res_s: u8,
    pub comp_s: u16,
    pub lay_e: u16,
    pub res_e: u8,
    pub comp_e: u16,
    pub order: ProgressionOrder,
}

/// MCT data array (MCT marker). Referenced from MCC records by index
/// into the per-tile record vector, so relocating the vector is safe.
#[derive(Debug, Clone, Default)]
pub struct MctRecord {
    pub index: u8,
    /// 0=dependency, 1=decorrelation, 2=offset.
    pub array_type: u8,
    /// 0=i16, 1=i32, 2=f32, 3=f64.
    pub element_type: u8,
    pub data: Vec<u8>,
}

impl MctRecord {
    pub fn element_size(&self) -> usize {
        match self.element_type {
            0 => 2,
            1 | 2 => 4,
            _ => 8,
        }
    }

    /// Interpret the raw array as f32 elements.
    pub fn to_f32(&self) -> Vec<f32> {
        let es = self.element_size();
        self.data
            .chunks_exact(es)
            .map(|c| match self.element_type {
                0 => i16::from_be_bytes([c[0], c[1]]) as f32,
                1 => i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f32,
                2 => f32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                _ => f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32,
            })
            .collect()
    }

    /// Interpret the raw array as i32 elements (offset arrays).
    pub fn to_i32(&self) -> Vec<i32> {
        let es = self.element_size();
        self.data
            .chunks_exact(es)
            .map(|c| match self.element_type {
                0 => i16::from_be_bytes([c[0], c[1]]) as i32,
                1 => i32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                2 => f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as i32,
                _ => f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as i32,
            })
            .collect()
    }
}

/// MCC record: a component collection binding decorrelation and offset
/// arrays (by MCT record index) to the tile.
#[derive(Debug, Clone, Default)]
pub struct MccRecord {
    pub index: u8,
    pub num_comps: u16,
    pub irreversible: bool,
    /// Index into `TileCodingParams::mct_records`.
    pub decorrelation: Option<usize>,
    /// Index into `TileCodingParams::mct_records`.
    pub offsets: Option<usize>,
}

/// Code-block style bits (SPcod G).
pub mod cblk_sty {
    /// Selective arithmetic coding bypass.
    pub const LAZY: u8 = 0x01;
    /// Reset context probabilities on each coding pass.
    pub const RESET: u8 = 0x02;
    /// Terminate on each coding pass.
    pub const TERMALL: u8 = 0x04;
    /// Vertically causal context formation.
    pub const VSC: u8 = 0x08;
    /// Predictable termination.
    pub const PTERM: u8 = 0x10;
    /// Segmentation symbols at the end of each cleanup pass.
    pub const SEGSYM: u8 = 0x20;
    /// High-throughput (Part 15) block coder.
    pub const HT: u8 = 0x40;
}

/// Coding style bits (Scod / Scoc).
pub mod csty {
    /// Precinct sizes are signalled explicitly.
    pub const PRT: u8 = 0x01;
    /// SOP markers precede every packet.
    pub const SOP: u8 = 0x02;
    /// EPH markers terminate every packet header.
    pub const EPH: u8 = 0x04;
}

/// Sub-band log2 gain for reversible dynamic-range bookkeeping:
/// LL=0, HL=LH=1, HH=2.
pub const BAND_GAIN: [u8; 4] = [0, 1, 1, 2];

/// Per tile-component coding parameters.
#[derive(Debug, Clone)]
pub struct TileComponentCodingParams {
    /// Component coding style (precinct bit only).
    pub csty: u8,
    /// Resolution level count, 1..=33.
    pub numresolutions: u8,
    /// Code-block width exponent, 2..=10.
    pub cblkw: u8,
    /// Code-block height exponent, 2..=10; `cblkw + cblkh <= 12`.
    pub cblkh: u8,
    pub cblk_sty: u8,
    /// 1 = reversible 5/3, 0 = irreversible 9/7.
    pub qmfbid: u8,
    pub precinct_width_exp: [u8; MAX_RES],
    pub precinct_height_exp: [u8; MAX_RES],
    pub qntsty: QuantStyle,
    pub numgbits: u8,
    pub num_step_sizes: u8,
    pub stepsizes: [StepSize; MAX_BANDS],
    /// ROI upshift from an RGN marker, < 32.
    pub roishift: u8,
    /// DC offset override from an MCO/MCC offset array.
    pub dc_level_shift: i32,

    // Scoping state. Precedence (low to high):
    // main QCD < main QCC < tile QCD < tile QCC, and identically for
    // COD/COC. An incoming marker is ignored when the recorded origin
    // outranks it.
    pub quant_marker_set: bool,
    pub from_qcc: bool,
    pub from_tile_header: bool,
    pub cod_marker_set: bool,
    pub from_coc: bool,
    pub cod_from_tile_header: bool,
}

impl Default for TileComponentCodingParams {
    fn default() -> Self {
        Self {
            csty: 0,
            numresolutions: 1,
            cblkw: 6,
            cblkh: 6,
            cblk_sty: 0,
            qmfbid: 1,
            precinct_width_exp: [15; MAX_RES],
            precinct_height_exp: [15; MAX_RES],
            qntsty: QuantStyle::NoQnt,
            numgbits: 2,
            num_step_sizes: 0,
            stepsizes: [StepSize::default(); MAX_BANDS],
            roishift: 0,
            dc_level_shift: 0,
            quant_marker_set: false,
            from_qcc: false,
            from_tile_header: false,
            cod_marker_set: false,
            from_coc: false,
            cod_from_tile_header: false,
        }
    }
}

impl TileComponentCodingParams {
    pub fn num_decomps(&self) -> u8 {
        self.numresolutions - 1
    }

    pub fn reversible(&self) -> bool {
        self.qmfbid == 1
    }

    /// Sub-band index into the step size table: 0 for the LL band,
    /// then `3 * (decomp_level - 1) + orientation` for the detail bands.
    pub fn band_step_index(&self, resno: u8, orientation: u8) -> usize {
        if resno == 0 {
            0
        } else {
            3 * (resno as usize - 1) + orientation as usize
        }
    }

    /// Expand scalar-derived quantization: all step sizes derive from
    /// band zero with exponents reduced by the decomposition distance.
    pub fn expand_derived_stepsizes(&mut self) {
        if self.qntsty != QuantStyle::SiQnt {
            return;
        }
        let base = self.stepsizes[0];
        for band_no in 1..MAX_BANDS {
            let decomp = ((band_no - 1) / 3) as u8;
            let expn = base.expn.saturating_sub(decomp);
            self.stepsizes[band_no] = StepSize {
                expn,
                mant: base.mant,
            };
        }
    }

    /// Number of magnitude bit planes M_b signalled for a band:
    /// `numgbits + expn - 1`.
    pub fn band_num_bps(&self, resno: u8, orientation: u8) -> u8 {
        let ss = self.stepsizes[self.band_step_index(resno, orientation)];
        (self.numgbits + ss.expn).saturating_sub(1)
    }

    /// Irreversible reconstruction step size for a band:
    /// `2^(R_b - expn) * (1 + mant / 2^11)` with `R_b = prec + gain_b`.
    pub fn band_stepsize(&self, prec: u8, resno: u8, orientation: u8) -> f32 {
        let ss = self.stepsizes[self.band_step_index(resno, orientation)];
        if self.reversible() {
            return 1.0;
        }
        let gain = BAND_GAIN[orientation as usize];
        let rb = prec as i32 + gain as i32;
        (1.0 + ss.mant as f32 / 2048.0) * 2f32.powi(rb - ss.expn as i32)
    }
}

/// Packed-packet-header marker store (Zppt/Zppm indexed segments that
/// are concatenated in index order once the tile header is complete).
#[derive(Debug, Clone, Default)]
pub struct PackedHeaders {
    pub segments: Vec<Option<Vec<u8>>>,
    pub merged: Option<Vec<u8>>,
}

impl PackedHeaders {
    pub fn insert(&mut self, z: u8, data: Vec<u8>) -> Result<()> {
        if self.segments.len() <= z as usize {
            self.segments.resize(z as usize + 1, None);
        }
        if self.segments[z as usize].is_some() {
            return Err(CodecError::ParameterOutOfRange(format!(
                "packed header segment {z} already read"
            )));
        }
        self.segments[z as usize] = Some(data);
        Ok(())
    }

    /// Concatenate the segments. The standard does not require
    /// contiguous Z indices; gaps are simply skipped.
    pub fn merge(&mut self) {
        if self.merged.is_some() {
            return;
        }
        let mut buf = Vec::new();
        for seg in self.segments.iter().flatten() {
            buf.extend_from_slice(seg);
        }
        self.segments.clear();
        self.merged = Some(buf);
    }
}

/// Per-tile coding parameters.
#[derive(Debug, Clone)]
pub struct TileCodingParams {
    /// Tile coding style (Scod).
    pub csty: u8,
    pub prg: ProgressionOrder,
    /// Quality layer count, 1..=65535.
    pub numlayers: u16,
    /// Layers actually decoded (caller cap, defaults to all).
    pub num_layers_to_decode: u16,
    /// Multiple component transform flag from SGcod.
    pub mct: u8,
    pub pocs: Vec<Poc>,
    pub tccps: Vec<TileComponentCodingParams>,

    /// Quantization style recorded when the main QCD applied, for the
    /// step-size count sanity check.
    pub main_qcd_qntsty: QuantStyle,
    pub main_qcd_num_step_sizes: u8,

    /// One COD already seen for this tile.
    pub cod: bool,
    /// PPT markers present; headers come from the merged buffer.
    pub ppt: bool,
    pub ppt_headers: PackedHeaders,

    pub mct_records: Vec<MctRecord>,
    pub mcc_records: Vec<MccRecord>,
    /// Custom decorrelation matrix (numcomps x numcomps, row major).
    pub mct_decoding_matrix: Option<Vec<f32>>,

    /// Merged compressed payload of all tile-parts read so far.
    pub data: Vec<u8>,
    pub num_tile_parts_read: u8,
    /// Per-tile-part PLT index.
    pub plt_markers: Option<PacketLengthMarkers>,
}

impl TileCodingParams {
    pub fn new(numcomps: usize) -> Self {
        Self {
            csty: 0,
            prg: ProgressionOrder::Lrcp,
            numlayers: 1,
            num_layers_to_decode: u16::MAX,
            mct: 0,
            pocs: Vec::new(),
            tccps: vec![TileComponentCodingParams::default(); numcomps],
            main_qcd_qntsty: QuantStyle::NoQnt,
            main_qcd_num_step_sizes: 0,
            cod: false,
            ppt: false,
            ppt_headers: PackedHeaders::default(),
            mct_records: Vec::new(),
            mcc_records: Vec::new(),
            mct_decoding_matrix: None,
            data: Vec::new(),
            num_tile_parts_read: 0,
            plt_markers: None,
        }
    }

    pub fn layers_to_decode(&self) -> u16 {
        self.num_layers_to_decode.min(self.numlayers)
    }

    /// Rebuild the custom decoding matrix and per-component DC offsets
    /// from an MCC record (MCO marker application).
    pub fn apply_mcc_record(&mut self, mcc_index: usize, numcomps: u16) -> Result<()> {
        let record = self.mcc_records[mcc_index].clone();
        if record.num_comps != numcomps {
            // Collections over a component subset are not applied.
            return Ok(());
        }
        if let Some(deco) = record.decorrelation {
            let mct = &self.mct_records[deco];
            let expected = mct.element_size() * numcomps as usize * numcomps as usize;
            if mct.data.len() != expected {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "MCT decorrelation array has {} bytes, expected {expected}",
                    mct.data.len()
                )));
            }
            self.mct_decoding_matrix = Some(mct.to_f32());
        }
        if let Some(off) = record.offsets {
            let mct = &self.mct_records[off];
            let expected = mct.element_size() * numcomps as usize;
            if mct.data.len() != expected {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "MCT offset array has {} bytes, expected {expected}",
                    mct.data.len()
                )));
            }
            let offsets = mct.to_i32();
            for (tccp, &offset) in self.tccps.iter_mut().zip(offsets.iter()) {
                tccp.dc_level_shift = offset;
            }
        }
        Ok(())
    }
}

/// A retained COM marker.
#[derive(Debug, Clone)]
pub struct Comment {
    pub binary: bool,
    pub data: Vec<u8>,
}

/// Everything decoded from the main header plus per-tile state. Frozen
/// (read-only) once the main header has been parsed; workers only read.
#[derive(Debug, Clone, Default)]
pub struct CodingParams {
    /// Rsiz capability field.
    pub rsiz: u16,
    /// Pcap from the CAP marker, 0 when absent.
    pub pcap: u32,
    pub ccap: Vec<u16>,
    pub comments: Vec<Comment>,

    /// Template TCP accumulated from main-header markers; each tile's
    /// TCP starts as a clone of this.
    pub default_tcp: Option<Box<TileCodingParams>>,
    pub tcps: Vec<TileCodingParams>,

    /// Global PLM index.
    pub plm_markers: Option<PacketLengthMarkers>,
    /// TLM index.
    pub tlm_markers: Option<TileLengthMarkers>,
    /// Packed packet headers from the main header (PPM).
    pub ppm_headers: Option<PackedHeaders>,
}

impl CodingParams {
    pub fn tcp(&self, tile_index: u16) -> &TileCodingParams {
        &self.tcps[tile_index as usize]
    }
}
