//! Codestream reader: the marker-driven state machine over the byte
//! stream. Parses the main header into `CodingParams`, then iterates
//! tile-part headers (SOT..SOD) collecting compressed payloads, with
//! unknown-marker recovery and the QCD/QCC & COD/COC scoping rules.

use crate::error::{CodecError, Result};
use crate::image::{J2kComponent, J2kImage};
use crate::length::{PacketLengthMarkers, TileLengthMarkers};
use crate::marker::{self, legal_states, state, Marker, COD_COC_LEN, SPCOD_SPCOC_LEN};
use crate::params::{
    cblk_sty, csty, CodingParams, Comment, MccRecord, MctRecord, PackedHeaders, Poc,
    ProgressionOrder, QuantStyle, StepSize, TileCodingParams, MAX_BANDS, MAX_COMMENTS,
    MAX_DECOMP_LVLS, MAX_RES, NUM_PROGRESSION_ORDERS,
};
use crate::stream::ByteStream;
use log::{debug, warn};
use std::collections::HashSet;

/// Outcome of one `parse_tile_part` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePartEvent {
    /// A tile-part header and payload were consumed for this tile.
    TilePart(u16),
    /// EOC reached.
    Eoc,
    /// Stream ended without EOC; partial tiles are not decodable.
    NoEoc,
}

/// Cursor over a marker segment body.
struct Body<'b> {
    data: &'b [u8],
    pos: usize,
    offset: u64,
    marker: &'static str,
}

impl<'b> Body<'b> {
    fn new(data: &'b [u8], offset: u64, marker: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            offset,
            marker,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn err(&self, reason: impl Into<String>) -> CodecError {
        CodecError::malformed(self.marker, self.offset, reason)
    }

    fn u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(self.err("segment too short"));
        }
        self.pos += 1;
        Ok(self.data[self.pos - 1])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(((self.u16()? as u32) << 16) | self.u16()? as u32)
    }

    /// Big-endian integer of 1 or 2 bytes (component-index fields).
    fn comp_no(&mut self, room: usize) -> Result<u16> {
        if room == 1 {
            Ok(self.u8()? as u16)
        } else {
            self.u16()
        }
    }

    fn rest(&mut self) -> &'b [u8] {
        let r = &self.data[self.pos..];
        self.pos = self.data.len();
        r
    }
}

pub struct CodestreamReader<'a> {
    stream: ByteStream<'a>,
    st: u16,
    curr_marker: u16,
    cp: CodingParams,
    image: J2kImage,
    /// Tile whose tile-part header is being read.
    current_tile: Option<u16>,
    /// Start of the current SOT marker, for Psot accounting.
    sot_marker_pos: u64,
    psot: u64,
    /// Greatest SOT offset seen.
    last_sot_pos: u64,
    first_sot_pos: Option<u64>,
    /// Restrict decoding to one tile: other payloads are skipped.
    selected_tile: Option<u16>,
    /// Tiles whose payload was truncated.
    incomplete: HashSet<u16>,
    sot_seen: u32,
}

impl<'a> CodestreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            stream: ByteStream::new(data),
            st: state::MH_SOC,
            curr_marker: 0,
            cp: CodingParams::default(),
            image: J2kImage::default(),
            current_tile: None,
            sot_marker_pos: 0,
            psot: 0,
            last_sot_pos: 0,
            first_sot_pos: None,
            selected_tile: None,
            incomplete: HashSet::new(),
            sot_seen: 0,
        }
    }

    pub fn select_tile(&mut self, tile: Option<u16>) {
        self.selected_tile = tile;
    }

    pub fn coding_params(&self) -> &CodingParams {
        &self.cp
    }

    pub fn coding_params_mut(&mut self) -> &mut CodingParams {
        &mut self.cp
    }

    pub fn image(&self) -> &J2kImage {
        &self.image
    }

    pub fn take_image(&mut self) -> J2kImage {
        std::mem::take(&mut self.image)
    }

    pub fn state(&self) -> u16 {
        self.st
    }

    /// Number of SOT markers encountered.
    pub fn sot_count(&self) -> u32 {
        self.sot_seen
    }

    fn in_tile_header(&self) -> bool {
        self.current_tile.is_some()
    }

    fn current_tcp_mut(&mut self) -> Result<&mut TileCodingParams> {
        match self.current_tile {
            Some(t) => Ok(&mut self.cp.tcps[t as usize]),
            None => self
                .cp
                .default_tcp
                .as_deref_mut()
                .ok_or(CodecError::MarkerOutOfPlace {
                    marker: self.curr_marker,
                    offset: 0,
                }),
        }
    }

    fn read_marker(&mut self) -> Result<()> {
        self.curr_marker = self.stream.read_u16()?;
        Ok(())
    }

    fn check_state(&self, m: Marker) -> Result<()> {
        if legal_states(m) & self.st == 0 {
            return Err(CodecError::MarkerOutOfPlace {
                marker: m.code(),
                offset: self.stream.tell().saturating_sub(2),
            });
        }
        Ok(())
    }

    /// Read the 2-byte length and the body of the current marker.
    /// Length values 0..=2 are malformed (L >= 3).
    fn read_segment(&mut self, name: &'static str) -> Result<(Vec<u8>, u64)> {
        let offset = self.stream.tell().saturating_sub(2);
        let len = self.stream.read_u16()?;
        if len < 3 {
            return Err(CodecError::malformed(
                name,
                offset,
                format!("marker length {len} is less than 3"),
            ));
        }
        let body = self.stream.read(len as usize - 2)?.to_vec();
        Ok((body, offset))
    }

    /// Read the main header: SOC, SIZ, then markers until the first
    /// SOT. Afterwards every tile's TCP is a clone of the accumulated
    /// default TCP.
    pub fn read_main_header(&mut self) -> Result<()> {
        // SOC
        self.read_marker()?;
        if self.curr_marker != Marker::Soc.code() {
            return Err(CodecError::malformed(
                "SOC",
                0,
                format!("expected SOC, found 0x{:04X}", self.curr_marker),
            ));
        }
        self.st = state::MH_SIZ;
        self.read_marker()?;
        if self.curr_marker != Marker::Siz.code() {
            return Err(CodecError::MarkerOutOfPlace {
                marker: self.curr_marker,
                offset: self.stream.tell().saturating_sub(2),
            });
        }
        self.handle_known(Marker::Siz)?;
        self.st = state::MH_MAIN;

        let mut have_marker = false;
        loop {
            if !have_marker {
                self.read_marker()?;
            }
            have_marker = false;
            match Marker::try_from(self.curr_marker) {
                Ok(Marker::Sot) => {
                    self.st = state::TPH_SOT;
                    break;
                }
                Ok(Marker::Eoc) => {
                    return Err(CodecError::malformed(
                        "EOC",
                        self.stream.tell().saturating_sub(2),
                        "EOC before any tile-part",
                    ));
                }
                Ok(m) => {
                    self.check_state(m)?;
                    self.handle_known(m)?;
                }
                Err(_) => {
                    self.skip_unknown()?;
                    have_marker = true;
                }
            }
        }

        // freeze the template into per-tile TCPs
        let n = self.image.num_tiles() as usize;
        let default = self
            .cp
            .default_tcp
            .as_deref()
            .ok_or_else(|| CodecError::malformed("SIZ", 0, "no SIZ marker seen"))?;
        self.cp.tcps = vec![default.clone(); n];
        if let Some(tlm) = self.cp.tlm_markers.as_mut() {
            tlm.validate(n as u16);
        }
        Ok(())
    }

    /// Unknown marker recovery: consume 2-byte words until a known
    /// marker appears or the stream ends. Leaves `curr_marker` at the
    /// recovered marker; the caller re-dispatches it.
    fn skip_unknown(&mut self) -> Result<()> {
        let start = self.stream.tell().saturating_sub(2);
        let unknown = self.curr_marker;
        loop {
            if self.stream.bytes_left() < 2 {
                return Err(CodecError::Truncated(self.stream.tell()));
            }
            self.read_marker()?;
            if Marker::try_from(self.curr_marker).is_ok() {
                warn!(
                    "unknown marker 0x{unknown:04X} at offset {start}: skipped {} bytes \
                     to next known marker",
                    self.stream.tell().saturating_sub(2) - start
                );
                return Ok(());
            }
        }
    }

    /// Parse one tile-part: SOT body, tile-part header markers until
    /// SOD, then the payload.
    pub fn parse_tile_part(&mut self) -> Result<TilePartEvent> {
        if self.st & state::EOC != 0 {
            return Ok(TilePartEvent::Eoc);
        }
        if self.st & state::NO_EOC != 0 {
            return Ok(TilePartEvent::NoEoc);
        }
        if self.st & state::TPH_SOT == 0 {
            return Err(CodecError::MarkerOutOfPlace {
                marker: self.curr_marker,
                offset: self.stream.tell(),
            });
        }
        if self.curr_marker != Marker::Sot.code() {
            // main header left us on the SOT marker already; later
            // tile-parts arrive here after read_marker
            return Err(CodecError::MarkerOutOfPlace {
                marker: self.curr_marker,
                offset: self.stream.tell().saturating_sub(2),
            });
        }
        self.handle_sot()?;
        let tile = match self.current_tile {
            Some(t) => t,
            None => {
                return Err(CodecError::malformed("SOT", self.sot_marker_pos, "no tile"))
            }
        };

        // tile-part header loop
        let mut have_marker = false;
        loop {
            if self.stream.bytes_left() == 0 {
                self.st = state::NO_EOC;
                self.incomplete.insert(tile);
                return Ok(TilePartEvent::NoEoc);
            }
            if !have_marker {
                self.read_marker()?;
            }
            have_marker = false;
            match Marker::try_from(self.curr_marker) {
                Ok(Marker::Sod) => break,
                Ok(Marker::Eoc) => {
                    // tile-part without SOD
                    self.st = state::EOC;
                    self.incomplete.insert(tile);
                    return Ok(TilePartEvent::Eoc);
                }
                Ok(m) => {
                    self.check_state(m)?;
                    self.handle_known(m)?;
                }
                Err(_) => {
                    self.skip_unknown()?;
                    have_marker = true;
                }
            }
        }

        // SOD: read or skip the payload
        self.st = state::TPH | state::DATA;
        let consumed = self.stream.tell() - self.sot_marker_pos;
        let payload_len = if self.psot == 0 {
            self.stream.bytes_left().saturating_sub(2)
        } else {
            self.psot.saturating_sub(consumed)
        };
        let skip = matches!(self.selected_tile, Some(t) if t != tile);
        let available = self.stream.bytes_left();
        let truncated = payload_len > available;
        let take = payload_len.min(available);
        if skip {
            self.stream.skip(take)?;
        } else {
            let data = self.stream.read(take as usize)?;
            self.cp.tcps[tile as usize].data.extend_from_slice(data);
        }
        self.cp.tcps[tile as usize].num_tile_parts_read =
            self.cp.tcps[tile as usize].num_tile_parts_read.saturating_add(1);
        self.current_tile = None;

        if truncated {
            self.st = state::NO_EOC;
            self.incomplete.insert(tile);
            return Ok(TilePartEvent::NoEoc);
        }

        // position for the next tile-part or EOC
        if self.stream.bytes_left() < 2 {
            self.st = state::NO_EOC;
            return Ok(TilePartEvent::TilePart(tile));
        }
        self.read_marker()?;
        match Marker::try_from(self.curr_marker) {
            Ok(Marker::Sot) => self.st = state::TPH_SOT,
            Ok(Marker::Eoc) => self.st = state::EOC,
            _ => {
                // scan forward for the next SOT or EOC
                self.st = state::TPH_SOT;
                if let Err(e) = self.scan_for_sot_or_eoc() {
                    debug!("tile {tile}: {e}; treating stream as ended");
                    self.st = state::NO_EOC;
                }
            }
        }
        Ok(TilePartEvent::TilePart(tile))
    }

    fn scan_for_sot_or_eoc(&mut self) -> Result<()> {
        let start = self.stream.tell().saturating_sub(2);
        loop {
            if self.curr_marker == Marker::Sot.code() {
                self.st = state::TPH_SOT;
                break;
            }
            if self.curr_marker == Marker::Eoc.code() {
                self.st = state::EOC;
                break;
            }
            if self.stream.bytes_left() < 2 {
                return Err(CodecError::Truncated(self.stream.tell()));
            }
            self.read_marker()?;
        }
        let skipped = self.stream.tell().saturating_sub(2) - start;
        if skipped > 0 {
            warn!("skipped {skipped} unexpected bytes at offset {start} while seeking SOT/EOC");
        }
        Ok(())
    }

    /// Whether a tile can be handed to the tile processor, applying the
    /// post-header validation.
    pub fn can_decompress(&self, tile: u16) -> bool {
        if self.incomplete.contains(&tile) {
            return false;
        }
        let tcp = &self.cp.tcps[tile as usize];
        !tcp.data.is_empty()
    }

    /// Post-header validation before any tile decodes: irreversible
    /// components need quantization, and the main/tile QCD step-size
    /// counts must cover the decomposition counts.
    pub fn validate_quantization(&self, tile: u16) -> Result<()> {
        let tcp = &self.cp.tcps[tile as usize];
        for (k, tccp) in tcp.tccps.iter().enumerate() {
            if tccp.qmfbid == 0 && tccp.qntsty == QuantStyle::NoQnt {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "tile {tile} component {k}: irreversible wavelet without \
                     quantization parameters (QCD/QCC)"
                )));
            }
        }
        if tcp.main_qcd_qntsty != QuantStyle::SiQnt {
            // main QCD scope
            let mut max_decomps = 0u8;
            for tccp in &tcp.tccps {
                if tccp.numresolutions == 0 || tccp.from_qcc || tccp.from_tile_header {
                    continue;
                }
                max_decomps = max_decomps.max(tccp.numresolutions - 1);
            }
            if (tcp.main_qcd_num_step_sizes as u32) < 3 * max_decomps as u32 + 1 {
                return Err(CodecError::QuantizationScopeViolation(format!(
                    "main QCD signals {} step sizes, fewer than 3 * {max_decomps} + 1",
                    tcp.main_qcd_num_step_sizes
                )));
            }
            // tile QCD scope
            let tile_qcd = tcp
                .tccps
                .iter()
                .find(|t| t.from_tile_header && !t.from_qcc);
            if let Some(qcd) = tile_qcd {
                if qcd.qntsty != QuantStyle::SiQnt {
                    let mut max_tile_decomps = 0u8;
                    for tccp in &tcp.tccps {
                        if tccp.numresolutions == 0 || (tccp.from_qcc && tccp.from_tile_header) {
                            continue;
                        }
                        max_tile_decomps = max_tile_decomps.max(tccp.numresolutions - 1);
                    }
                    if (qcd.num_step_sizes as u32) < 3 * max_tile_decomps as u32 + 1 {
                        return Err(CodecError::QuantizationScopeViolation(format!(
                            "tile QCD signals {} step sizes, fewer than 3 * {max_tile_decomps} + 1",
                            qcd.num_step_sizes
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge the tile's packed packet headers (PPT) once all its
    /// tile-parts have been read.
    pub fn merge_ppt(&mut self, tile: u16) {
        let tcp = &mut self.cp.tcps[tile as usize];
        if tcp.ppt {
            tcp.ppt_headers.merge();
        }
    }

    // --- marker handlers ---

    fn handle_known(&mut self, m: Marker) -> Result<()> {
        match m {
            Marker::Siz => self.read_siz(),
            Marker::Cap => self.read_cap(),
            Marker::Cod => self.read_cod(),
            Marker::Coc => self.read_coc(),
            Marker::Qcd => self.read_qcd(),
            Marker::Qcc => self.read_qcc(),
            Marker::Poc => self.read_poc(),
            Marker::Crg => self.read_crg(),
            Marker::Com => self.read_com(),
            Marker::Tlm => self.read_tlm(),
            Marker::Plm => self.read_plm(),
            Marker::Plt => self.read_plt(),
            Marker::Ppm => self.read_ppm(),
            Marker::Ppt => self.read_ppt(),
            Marker::Mct => self.read_mct(),
            Marker::Mcc => self.read_mcc(),
            Marker::Mco => self.read_mco(),
            Marker::Cbd => self.read_cbd(),
            Marker::Rgn => self.read_rgn(),
            Marker::Sot | Marker::Sod | Marker::Soc | Marker::Eoc | Marker::Sop | Marker::Eph => {
                Err(CodecError::MarkerOutOfPlace {
                    marker: m.code(),
                    offset: self.stream.tell(),
                })
            }
        }
    }

    fn read_siz(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("SIZ")?;
        let mut b = Body::new(&body, offset, "SIZ");
        self.cp.rsiz = b.u16()?;
        self.image.x1 = b.u32()?;
        self.image.y1 = b.u32()?;
        self.image.x0 = b.u32()?;
        self.image.y0 = b.u32()?;
        self.image.tdx = b.u32()?;
        self.image.tdy = b.u32()?;
        self.image.tx0 = b.u32()?;
        self.image.ty0 = b.u32()?;
        let numcomps = b.u16()?;
        if numcomps == 0 {
            return Err(b.err("zero components"));
        }
        if b.remaining() < numcomps as usize * 3 {
            return Err(b.err("component table shorter than Csiz"));
        }
        self.image.comps.clear();
        for _ in 0..numcomps {
            let ssiz = b.u8()?;
            let dx = b.u8()? as u32;
            let dy = b.u8()? as u32;
            self.image.comps.push(J2kComponent {
                dx,
                dy,
                prec: (ssiz & 0x7F) + 1,
                sgnd: ssiz & 0x80 != 0,
                ..Default::default()
            });
        }
        self.image.validate()?;
        self.image.update_component_rects();
        self.cp.default_tcp = Some(Box::new(TileCodingParams::new(numcomps as usize)));
        Ok(())
    }

    fn read_cap(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("CAP")?;
        let mut b = Body::new(&body, offset, "CAP");
        let pcap = b.u32()?;
        if pcap & 0xFFFD_FFFF != 0 {
            warn!("CAP marker carries unsupported Pcap options 0x{pcap:08X}; ignoring them");
        }
        self.cp.pcap = pcap;
        let count = pcap.count_ones();
        self.cp.ccap.clear();
        for _ in 0..count {
            if b.remaining() < 2 {
                return Err(b.err("Ccap list shorter than the Pcap population count"));
            }
            let c = b.u16()?;
            self.cp.ccap.push(c);
        }
        Ok(())
    }

    /// Shared SPcod/SPcoc element (COD and COC markers).
    fn read_spcod_spcoc(
        &mut self,
        b: &mut Body<'_>,
        compno: u16,
        from_coc: bool,
        explicit_precincts: bool,
    ) -> Result<()> {
        let from_tile = self.in_tile_header();
        let pcap = self.cp.pcap;
        let tcp = self.current_tcp_mut()?;
        let tccp = &mut tcp.tccps[compno as usize];

        if b.remaining() < SPCOD_SPCOC_LEN as usize {
            return Err(b.err("SPcod/SPcoc element too short"));
        }
        let decomps = b.u8()?;
        if decomps > MAX_DECOMP_LVLS {
            return Err(CodecError::ParameterOutOfRange(format!(
                "{decomps} decomposition levels exceed the maximum of {MAX_DECOMP_LVLS}"
            )));
        }
        tccp.numresolutions = decomps + 1;
        let cblkw = b.u8()?;
        let cblkh = b.u8()?;
        if cblkw > 8 || cblkh > 8 || cblkw + cblkh > 8 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block exponents (2^{}, 2^{}): dimensions must lie in 4..=1024 \
                 with area at most 4096",
                cblkw as u32 + 2,
                cblkh as u32 + 2
            )));
        }
        tccp.cblkw = cblkw + 2;
        tccp.cblkh = cblkh + 2;

        let sty = b.u8()?;
        if sty & cblk_sty::HT != 0 && sty != cblk_sty::HT {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block style 0x{sty:02X}: with the HT bit set all original \
                 mode flags must be clear"
            )));
        }
        if (sty >> 6) == 2 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "code-block style 0x{sty:02X}: top bits 10 are not defined"
            )));
        }
        if sty & cblk_sty::HT != 0 && pcap == 0 {
            warn!("HT code-block style without a CAP marker");
        }
        tccp.cblk_sty = sty;

        let qmfbid = b.u8()?;
        if qmfbid > 1 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "qmfbid {qmfbid} (must be 0 or 1)"
            )));
        }
        tccp.qmfbid = qmfbid;
        tccp.cod_marker_set = true;
        tccp.from_coc = from_coc;
        tccp.cod_from_tile_header = from_tile;

        if explicit_precincts {
            let n = tccp.numresolutions as usize;
            if b.remaining() < n {
                return Err(b.err("precinct size list shorter than the resolution count"));
            }
            for i in 0..n {
                let v = b.u8()?;
                let pw = v & 0x0F;
                let ph = v >> 4;
                // exponent 0 only legal at the lowest resolution
                if i != 0 && (pw == 0 || ph == 0) {
                    return Err(CodecError::ParameterOutOfRange(
                        "precinct exponent 0 above resolution 0".into(),
                    ));
                }
                tccp.precinct_width_exp[i] = pw;
                tccp.precinct_height_exp[i] = ph;
            }
        } else {
            for i in 0..MAX_RES {
                tccp.precinct_width_exp[i] = 15;
                tccp.precinct_height_exp[i] = 15;
            }
        }
        Ok(())
    }

    fn read_cod(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("COD")?;
        let mut b = Body::new(&body, offset, "COD");
        let from_tile = self.in_tile_header();
        let numcomps = self.image.comps.len();
        {
            let tcp = self.current_tcp_mut()?;
            if tcp.cod {
                warn!(
                    "multiple COD markers for one tile; the standard allows only one per tile"
                );
            }
            tcp.cod = true;
        }

        if b.remaining() < COD_COC_LEN as usize {
            return Err(b.err("segment shorter than Scod + SGcod"));
        }
        let scod = b.u8()?;
        if scod & !(csty::PRT | csty::SOP | csty::EPH) != 0 {
            return Err(b.err(format!("unknown Scod value 0x{scod:02X}")));
        }
        let prog = b.u8()?;
        let prg = ProgressionOrder::try_from(prog)?;
        let numlayers = b.u16()?;
        if numlayers == 0 {
            return Err(b.err("layer count must be positive"));
        }
        let mct = b.u8()?;
        if mct > 1 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "MCT value {mct} (must be 0 or 1)"
            )));
        }
        {
            let tcp = self.current_tcp_mut()?;
            tcp.csty = scod;
            tcp.prg = prg;
            tcp.numlayers = numlayers;
            tcp.mct = mct;
            for tccp in &mut tcp.tccps {
                tccp.csty = scod & csty::PRT;
            }
        }

        self.read_spcod_spcoc(&mut b, 0, false, scod & csty::PRT != 0)?;
        if b.remaining() != 0 {
            return Err(b.err("trailing bytes after the SPcod element"));
        }

        // apply component zero's style to the others, honouring the
        // COD/COC scope precedence
        let tcp = self.current_tcp_mut()?;
        let src = tcp.tccps[0].clone();
        for i in 1..numcomps {
            let dest = &mut tcp.tccps[i];
            let ignore = dest.from_coc && (!src.cod_from_tile_header || dest.cod_from_tile_header);
            if ignore && dest.cod_marker_set {
                continue;
            }
            dest.numresolutions = src.numresolutions;
            dest.cblkw = src.cblkw;
            dest.cblkh = src.cblkh;
            dest.cblk_sty = src.cblk_sty;
            dest.qmfbid = src.qmfbid;
            dest.precinct_width_exp = src.precinct_width_exp;
            dest.precinct_height_exp = src.precinct_height_exp;
            dest.cod_marker_set = true;
            dest.from_coc = false;
            dest.cod_from_tile_header = from_tile;
        }
        Ok(())
    }

    fn read_coc(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("COC")?;
        let mut b = Body::new(&body, offset, "COC");
        let numcomps = self.image.comps.len();
        let room = if numcomps <= 256 { 1 } else { 2 };
        if b.remaining() < room + 1 {
            return Err(b.err("segment shorter than Ccoc + Scoc"));
        }
        let compno = b.comp_no(room)?;
        if compno as usize >= numcomps {
            return Err(b.err(format!("component {compno} out of range")));
        }
        let scoc = b.u8()?;
        {
            let tcp = self.current_tcp_mut()?;
            tcp.tccps[compno as usize].csty = scoc & csty::PRT;
        }
        self.read_spcod_spcoc(&mut b, compno, true, scoc & csty::PRT != 0)?;
        if b.remaining() != 0 {
            return Err(b.err("trailing bytes after the SPcoc element"));
        }
        Ok(())
    }

    /// Shared SQcd/SQcc element with the scoping rules: an incoming
    /// marker is ignored when the existing binding outranks it
    /// (main QCD < main QCC < tile QCD < tile QCC).
    fn read_sqcd_sqcc(&mut self, b: &mut Body<'_>, compno: u16, from_qcc: bool) -> Result<()> {
        let from_tile = self.in_tile_header();

        let sqcx = b.u8()?;
        let qntsty = match sqcx & 0x1F {
            0 => QuantStyle::NoQnt,
            1 => QuantStyle::SiQnt,
            2 => QuantStyle::SeQnt,
            v => {
                return Err(b.err(format!("undefined quantization style {v}")));
            }
        };
        let numgbits = sqcx >> 5;
        let main_qcd = !from_qcc && !from_tile;

        let num_step_sizes = match qntsty {
            QuantStyle::SiQnt => 1usize,
            QuantStyle::NoQnt => b.remaining(),
            QuantStyle::SeQnt => b.remaining() / 2,
        };
        if num_step_sizes > MAX_BANDS {
            warn!(
                "QCD/QCC signals {num_step_sizes} step sizes; keeping the first {MAX_BANDS}"
            );
        }

        let tcp = self.current_tcp_mut()?;
        let ignore = {
            let tccp = &tcp.tccps[compno as usize];
            if tccp.quant_marker_set {
                let tile_header_qcc = from_qcc && from_tile;
                let set_main_qcd = !tccp.from_qcc && !tccp.from_tile_header;
                let set_main_qcc = tccp.from_qcc && !tccp.from_tile_header;
                let set_tile_qcd = !tccp.from_qcc && tccp.from_tile_header;
                let set_tile_qcc = tccp.from_qcc && tccp.from_tile_header;
                if !from_tile {
                    set_main_qcc || (main_qcd && set_main_qcd)
                } else {
                    set_tile_qcc || (set_tile_qcd && !tile_header_qcc)
                }
            } else {
                false
            }
        };

        {
            let tccp = &mut tcp.tccps[compno as usize];
            if !ignore {
                tccp.quant_marker_set = true;
                tccp.from_qcc = from_qcc;
                tccp.from_tile_header = from_tile;
                tccp.qntsty = qntsty;
                tccp.numgbits = numgbits;
                tccp.num_step_sizes = num_step_sizes.min(MAX_BANDS) as u8;
            }
            match qntsty {
                QuantStyle::NoQnt => {
                    for band_no in 0..num_step_sizes {
                        let v = b.u8()?;
                        if !ignore && band_no < MAX_BANDS {
                            tccp.stepsizes[band_no] = StepSize {
                                expn: v >> 3,
                                mant: 0,
                            };
                        }
                    }
                }
                _ => {
                    for band_no in 0..num_step_sizes {
                        let v = b.u16()?;
                        if !ignore && band_no < MAX_BANDS {
                            tccp.stepsizes[band_no] = StepSize {
                                expn: (v >> 11) as u8,
                                mant: v & 0x7FF,
                            };
                        }
                    }
                }
            }
            if !ignore {
                tccp.expand_derived_stepsizes();
            }
        }
        if !ignore && main_qcd {
            tcp.main_qcd_qntsty = qntsty;
            tcp.main_qcd_num_step_sizes = num_step_sizes.min(MAX_BANDS) as u8;
        }
        Ok(())
    }

    fn read_qcd(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("QCD")?;
        let mut b = Body::new(&body, offset, "QCD");
        let numcomps = self.image.comps.len();
        self.read_sqcd_sqcc(&mut b, 0, false)?;
        if b.remaining() != 0 {
            return Err(b.err("trailing bytes after the SQcd element"));
        }
        // apply to the other components, honouring the scope rules
        let tcp = self.current_tcp_mut()?;
        let src = tcp.tccps[0].clone();
        for i in 1..numcomps {
            let dest = &mut tcp.tccps[i];
            let ignore = dest.from_qcc && (!src.from_tile_header || dest.from_tile_header);
            if ignore && dest.quant_marker_set {
                continue;
            }
            dest.qntsty = src.qntsty;
            dest.numgbits = src.numgbits;
            dest.num_step_sizes = src.num_step_sizes;
            dest.stepsizes = src.stepsizes;
            dest.quant_marker_set = true;
            dest.from_qcc = false;
            dest.from_tile_header = src.from_tile_header;
        }
        Ok(())
    }

    fn read_qcc(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("QCC")?;
        let mut b = Body::new(&body, offset, "QCC");
        let numcomps = self.image.comps.len();
        let room = if numcomps <= 256 { 1 } else { 2 };
        if b.remaining() < room {
            return Err(b.err("segment shorter than Cqcc"));
        }
        let compno = b.comp_no(room)?;
        if compno as usize >= numcomps {
            return Err(b.err(format!(
                "component {compno} must be less than the component count {numcomps}"
            )));
        }
        self.read_sqcd_sqcc(&mut b, compno, true)?;
        if b.remaining() != 0 {
            return Err(b.err("trailing bytes after the SQcc element"));
        }
        Ok(())
    }

    fn read_poc(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("POC")?;
        let mut b = Body::new(&body, offset, "POC");
        let numcomps = self.image.comps.len() as u16;
        let room = if numcomps <= 256 { 1 } else { 2 };
        let chunk = 5 + 2 * room;
        let count = b.remaining() / chunk;
        if count == 0 || b.remaining() % chunk != 0 {
            return Err(b.err("body is not a whole number of progressions"));
        }
        let tcp = self.current_tcp_mut()?;
        let max_res: u8 = tcp
            .tccps
            .iter()
            .map(|t| t.numresolutions)
            .max()
            .unwrap_or(1);
        let numlayers = tcp.numlayers;
        if tcp.pocs.len() + count > MAX_RES {
            return Err(CodecError::ParameterOutOfRange(format!(
                "{} progressions exceed the supported maximum {MAX_RES}",
                tcp.pocs.len() + count
            )));
        }
        for _ in 0..count {
            let res_s = b.u8()?;
            if res_s >= max_res {
                return Err(b.err(format!("start resolution {res_s} out of range")));
            }
            let comp_s = b.comp_no(room)?;
            if comp_s > numcomps {
                return Err(b.err(format!("start component {comp_s} out of range")));
            }
            let lay_e = b.u16()?.min(numlayers);
            let res_e = b.u8()?;
            if res_e <= res_s {
                return Err(b.err(format!("end resolution {res_e} not above start {res_s}")));
            }
            let comp_e = b.comp_no(room)?.min(numcomps);
            if comp_e <= comp_s {
                return Err(b.err(format!("end component {comp_e} not above start {comp_s}")));
            }
            let order = b.u8()?;
            if order >= NUM_PROGRESSION_ORDERS {
                return Err(b.err(format!("unknown progression order {order}")));
            }
            let tcp = self.current_tcp_mut()?;
            tcp.pocs.push(Poc {
                res_s,
                comp_s,
                lay_e,
                res_e,
                comp_e,
                order: ProgressionOrder::try_from(order)?,
            });
        }
        Ok(())
    }

    fn read_crg(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("CRG")?;
        let mut b = Body::new(&body, offset, "CRG");
        let numcomps = self.image.comps.len();
        if b.remaining() != numcomps * 4 {
            return Err(b.err("body size is not 4 bytes per component"));
        }
        for i in 0..numcomps {
            let x = b.u16()?;
            let y = b.u16()?;
            self.image.comps[i].crg_x = x;
            self.image.comps[i].crg_y = y;
        }
        Ok(())
    }

    fn read_com(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("COM")?;
        let mut b = Body::new(&body, offset, "COM");
        if b.remaining() < 2 {
            return Err(b.err("corrupt COM segment"));
        }
        let rcom = b.u16()?;
        if rcom > 1 {
            warn!("unrecognized COM registration 0x{rcom:04X}; assuming Latin text");
        }
        if b.remaining() == 0 {
            warn!("empty COM segment ignored");
            return Ok(());
        }
        if self.cp.comments.len() >= MAX_COMMENTS {
            warn!("only {MAX_COMMENTS} comments are retained; ignoring");
            return Ok(());
        }
        self.cp.comments.push(Comment {
            binary: rcom == 0,
            data: b.rest().to_vec(),
        });
        Ok(())
    }

    fn read_tlm(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("TLM")?;
        let tlm = self.cp.tlm_markers.get_or_insert_with(TileLengthMarkers::new);
        tlm.read(&body, offset)
    }

    fn read_plm(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("PLM")?;
        let plm = self
            .cp
            .plm_markers
            .get_or_insert_with(PacketLengthMarkers::new);
        plm.read_plm(&body, offset)
    }

    fn read_plt(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("PLT")?;
        let tile = self.current_tile.ok_or(CodecError::MarkerOutOfPlace {
            marker: Marker::Plt.code(),
            offset,
        })?;
        let tcp = &mut self.cp.tcps[tile as usize];
        let plt = tcp.plt_markers.get_or_insert_with(PacketLengthMarkers::new);
        plt.read_plt(&body, offset)
    }

    fn read_ppm(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("PPM")?;
        let mut b = Body::new(&body, offset, "PPM");
        if b.remaining() < 2 {
            return Err(b.err("segment too short"));
        }
        let z = b.u8()?;
        let headers = self.cp.ppm_headers.get_or_insert_with(PackedHeaders::default);
        headers.insert(z, b.rest().to_vec())?;
        Ok(())
    }

    fn read_ppt(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("PPT")?;
        let mut b = Body::new(&body, offset, "PPT");
        if b.remaining() < 2 {
            return Err(b.err("segment too short"));
        }
        if self.cp.ppm_headers.is_some() {
            return Err(b.err(
                "PPT marker after packet headers were found in the main header (PPM)",
            ));
        }
        let z = b.u8()?;
        let data = b.rest().to_vec();
        let tcp = self.current_tcp_mut()?;
        tcp.ppt = true;
        tcp.ppt_headers.insert(z, data)?;
        Ok(())
    }

    fn read_mct(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("MCT")?;
        let mut b = Body::new(&body, offset, "MCT");
        if b.remaining() < 6 {
            return Err(b.err("segment too short"));
        }
        let zmct = b.u16()?;
        if zmct != 0 {
            warn!("MCT data spanning multiple records is not supported; marker ignored");
            return Ok(());
        }
        let imct = b.u16()?;
        let index = (imct & 0xFF) as u8;
        let array_type = ((imct >> 8) & 3) as u8;
        let element_type = ((imct >> 10) & 3) as u8;
        let ymct = b.u16()?;
        if ymct != 0 {
            warn!("multiple MCT markers for one array are not supported; marker ignored");
            return Ok(());
        }
        if b.remaining() == 0 {
            return Err(b.err("MCT record carries no data"));
        }
        let data = b.rest().to_vec();
        let tcp = self.current_tcp_mut()?;
        match tcp.mct_records.iter_mut().find(|r| r.index == index) {
            Some(rec) => {
                rec.array_type = array_type;
                rec.element_type = element_type;
                rec.data = data;
            }
            None => tcp.mct_records.push(MctRecord {
                index,
                array_type,
                element_type,
                data,
            }),
        }
        Ok(())
    }

    fn read_mcc(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("MCC")?;
        let mut b = Body::new(&body, offset, "MCC");
        if b.remaining() < 7 {
            return Err(b.err("segment too short"));
        }
        let zmcc = b.u16()?;
        if zmcc != 0 {
            warn!("MCC data spanning multiple markers is not supported; marker ignored");
            return Ok(());
        }
        let index = b.u8()?;
        let ymcc = b.u16()?;
        if ymcc != 0 {
            warn!("MCC data spanning multiple markers is not supported; marker ignored");
            return Ok(());
        }
        let nb_collections = b.u16()?;
        if nb_collections > 1 {
            warn!("multiple MCC collections are not supported; marker ignored");
            return Ok(());
        }
        let mut record = MccRecord {
            index,
            ..Default::default()
        };
        for _ in 0..nb_collections {
            if b.remaining() < 3 {
                return Err(b.err("collection header too short"));
            }
            let xmcc = b.u8()?;
            if xmcc != 1 {
                warn!("only array-based decorrelation collections are supported; marker ignored");
                return Ok(());
            }
            let raw = b.u16()?;
            let room = 1 + (raw >> 15) as usize;
            let nb_comps = raw & 0x7FFF;
            record.num_comps = nb_comps;
            for j in 0..nb_comps {
                let c = b.comp_no(room)?;
                if c != j {
                    warn!("MCC collections with index shuffle are not supported; marker ignored");
                    return Ok(());
                }
            }
            let raw = b.u16()?;
            let room = 1 + (raw >> 15) as usize;
            let out_comps = raw & 0x7FFF;
            if out_comps != nb_comps {
                warn!("MCC collections with differing index counts are not supported; ignored");
                return Ok(());
            }
            for j in 0..out_comps {
                let c = b.comp_no(room)?;
                if c != j {
                    warn!("MCC collections with index shuffle are not supported; marker ignored");
                    return Ok(());
                }
            }
            if b.remaining() < 3 {
                return Err(b.err("transform descriptor too short"));
            }
            let tmcc =
                ((b.u8()? as u32) << 16) | ((b.u8()? as u32) << 8) | b.u8()? as u32;
            record.irreversible = (tmcc >> 16) & 1 == 0;
            let deco_index = (tmcc & 0xFF) as u8;
            let offset_index = ((tmcc >> 8) & 0xFF) as u8;
            let tcp = self.current_tcp_mut()?;
            if deco_index != 0 {
                record.decorrelation = tcp
                    .mct_records
                    .iter()
                    .position(|r| r.index == deco_index);
                if record.decorrelation.is_none() {
                    return Err(CodecError::malformed(
                        "MCC",
                        offset,
                        format!("decorrelation array {deco_index} not found"),
                    ));
                }
            }
            if offset_index != 0 {
                record.offsets = tcp.mct_records.iter().position(|r| r.index == offset_index);
                if record.offsets.is_none() {
                    return Err(CodecError::malformed(
                        "MCC",
                        offset,
                        format!("offset array {offset_index} not found"),
                    ));
                }
            }
        }
        if b.remaining() != 0 {
            return Err(b.err("trailing bytes after the collection"));
        }
        let tcp = self.current_tcp_mut()?;
        match tcp.mcc_records.iter_mut().find(|r| r.index == index) {
            Some(existing) => *existing = record,
            None => tcp.mcc_records.push(record),
        }
        Ok(())
    }

    fn read_mco(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("MCO")?;
        let mut b = Body::new(&body, offset, "MCO");
        if b.remaining() < 1 {
            return Err(b.err("segment too short"));
        }
        let nb_stages = b.u8()?;
        if nb_stages > 1 {
            warn!("multiple MCT stages are not supported; MCO marker ignored");
            return Ok(());
        }
        if b.remaining() != nb_stages as usize {
            return Err(b.err("body size does not match Nmco"));
        }
        let numcomps = self.image.comps.len() as u16;
        let tcp = self.current_tcp_mut()?;
        for tccp in &mut tcp.tccps {
            tccp.dc_level_shift = 0;
        }
        tcp.mct_decoding_matrix = None;
        for _ in 0..nb_stages {
            let index = b.u8()?;
            let tcp = self.current_tcp_mut()?;
            if let Some(pos) = tcp.mcc_records.iter().position(|r| r.index == index) {
                tcp.apply_mcc_record(pos, numcomps)?;
            }
        }
        Ok(())
    }

    fn read_cbd(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("CBD")?;
        let mut b = Body::new(&body, offset, "CBD");
        let numcomps = self.image.comps.len();
        if b.remaining() != 2 + numcomps {
            return Err(b.err("body size does not match the component count"));
        }
        let ncbd = b.u16()?;
        if ncbd as usize != numcomps {
            return Err(b.err(format!("Ncbd {ncbd} does not match {numcomps} components")));
        }
        for i in 0..numcomps {
            let def = b.u8()?;
            let comp = &mut self.image.comps[i];
            comp.sgnd = def & 0x80 != 0;
            comp.prec = (def & 0x7F) + 1;
        }
        Ok(())
    }

    fn read_rgn(&mut self) -> Result<()> {
        let (body, offset) = self.read_segment("RGN")?;
        let mut b = Body::new(&body, offset, "RGN");
        let numcomps = self.image.comps.len();
        let room = if numcomps <= 256 { 1 } else { 2 };
        if b.remaining() != 2 + room {
            return Err(b.err("unexpected segment size"));
        }
        let compno = b.comp_no(room)?;
        if compno as usize >= numcomps {
            return Err(b.err(format!("component {compno} out of range")));
        }
        let srgn = b.u8()?;
        if srgn != 0 {
            warn!("RGN style {srgn} is not defined in Part 1; marker ignored");
            return Ok(());
        }
        let shift = b.u8()?;
        if shift >= 32 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "ROI shift {shift} (must be below 32)"
            )));
        }
        let tcp = self.current_tcp_mut()?;
        tcp.tccps[compno as usize].roishift = shift;
        Ok(())
    }

    fn handle_sot(&mut self) -> Result<()> {
        self.sot_marker_pos = self.stream.tell().saturating_sub(2);
        if self.sot_marker_pos > self.last_sot_pos {
            self.last_sot_pos = self.sot_marker_pos;
        }
        if self.first_sot_pos.is_none() {
            self.first_sot_pos = Some(self.sot_marker_pos);
        }
        let (body, offset) = self.read_segment("SOT")?;
        let mut b = Body::new(&body, offset, "SOT");
        if body.len() != marker::LSOT as usize - 2 {
            return Err(b.err(format!("Lsot {} is not 10", body.len() + 2)));
        }
        let isot = b.u16()?;
        let psot = b.u32()?;
        let tpsot = b.u8()?;
        let _tnsot = b.u8()?;
        let num_tiles = self.image.num_tiles();
        if isot as u32 >= num_tiles {
            return Err(b.err(format!(
                "tile index {isot} out of range for a {num_tiles}-tile grid"
            )));
        }
        if psot != 0 && (psot as u64) < marker::LSOT as u64 + 2 {
            return Err(b.err(format!("Psot {psot} too small")));
        }
        self.sot_seen += 1;
        self.current_tile = Some(isot);
        self.psot = psot as u64;
        self.st = state::TPH;
        debug!(
            "SOT: tile {isot}, tile-part {tpsot}, Psot {psot}, offset {}",
            self.sot_marker_pos
        );
        Ok(())
    }

    /// First SOT offset, the base for TLM-driven seeks.
    pub fn first_sot_pos(&self) -> Option<u64> {
        self.first_sot_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn minimal_main_header_parses() {
        let cs = minimal_codestream();
        let mut r = CodestreamReader::new(&cs);
        r.read_main_header().unwrap();
        assert_eq!(r.image().x1, 1);
        assert_eq!(r.image().comps.len(), 1);
        assert_eq!(r.state(), state::TPH_SOT);
        let tcp = r.coding_params().tcp(0);
        assert_eq!(tcp.numlayers, 1);
        assert_eq!(tcp.tccps[0].numresolutions, 1);
    }

    #[test]
    fn missing_soc_is_malformed() {
        let mut r = CodestreamReader::new(&[0x00, 0x01, 0x02, 0x03]);
        assert!(matches!(
            r.read_main_header(),
            Err(CodecError::MalformedMarker { marker: "SOC", .. })
        ));
    }

    #[test]
    fn siz_must_follow_soc() {
        // SOC then COD: out of place
        let mut data = vec![0xFF, 0x4F];
        data.extend_from_slice(&[0xFF, 0x52, 0x00, 0x0C]);
        data.extend_from_slice(&[0u8; 10]);
        let mut r = CodestreamReader::new(&data);
        assert!(matches!(
            r.read_main_header(),
            Err(CodecError::MarkerOutOfPlace { .. })
        ));
    }

    #[test]
    fn marker_length_below_three_is_malformed() {
        let mut cs = vec![0xFF, 0x4F];
        // SIZ with L = 2
        cs.extend_from_slice(&[0xFF, 0x51, 0x00, 0x02]);
        let mut r = CodestreamReader::new(&cs);
        assert!(matches!(
            r.read_main_header(),
            Err(CodecError::MalformedMarker { marker: "SIZ", .. })
        ));
    }

    #[test]
    fn unknown_marker_recovery_reaches_sot() {
        // build a stream with an unknown 0xFF99 marker (plus 4 junk
        // bytes that do not look like markers) between QCD and SOT
        let cs = codestream_with_unknown_marker();
        let mut r = CodestreamReader::new(&cs);
        r.read_main_header().unwrap();
        assert_eq!(r.state(), state::TPH_SOT);
    }

    #[test]
    fn two_qcd_markers_are_idempotent() {
        let cs = codestream_with_double_qcd();
        let mut r = CodestreamReader::new(&cs);
        r.read_main_header().unwrap();
        let tccp = &r.coding_params().tcp(0).tccps[0];
        assert_eq!(tccp.stepsizes[0].expn, 9);
        assert_eq!(tccp.qntsty, QuantStyle::NoQnt);
    }

    #[test]
    fn tile_part_payload_is_collected() {
        let cs = minimal_codestream();
        let mut r = CodestreamReader::new(&cs);
        r.read_main_header().unwrap();
        let ev = r.parse_tile_part().unwrap();
        assert_eq!(ev, TilePartEvent::TilePart(0));
        assert_eq!(r.coding_params().tcp(0).data, vec![0x00]);
        assert_eq!(r.parse_tile_part().unwrap(), TilePartEvent::Eoc);
        assert_eq!(r.sot_count(), 1);
        assert!(r.can_decompress(0));
        r.validate_quantization(0).unwrap();
    }
}
