//! Packet-length (PLT/PLM) and tile-part-length (TLM) marker stores.

use crate::error::{CodecError, Result};
use crate::marker::TLM_MARKER_START_BYTES;
use crate::stream::ByteStream;
use log::warn;
use std::collections::BTreeMap;

/// Marker index store for PLT (per tile-part) or PLM (global) packet
/// lengths. Lengths are base-128 varints, seven bits per byte with the
/// high bit as continuation.
///
/// The store accepts the non-standard "sequential mod 256" encoding:
/// once more than 256 markers have been read with indices that remain
/// sequential modulo 256, the signalled index is ignored and the marker
/// count is used instead. This is a liberal read; the writer always
/// emits strictly sequential indices.
#[derive(Debug, Clone, Default)]
pub struct PacketLengthMarkers {
    markers: BTreeMap<u32, Vec<u32>>,
    marker_index: u32,
    sequential: bool,
    /// Varint accumulator; non-zero at a marker boundary is malformed.
    accum: u32,
    // pop cursor (position within the ordered marker map)
    read_marker_pos: usize,
    read_packet: usize,
}

impl PacketLengthMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Total number of stored packet lengths.
    pub fn len(&self) -> usize {
        self.markers.values().map(Vec::len).sum()
    }

    fn read_init(&mut self, index: u8, is_plm: bool, offset: u64) -> Result<()> {
        if is_plm && self.markers.len() == 255 {
            return Err(CodecError::malformed(
                "PLM",
                offset,
                "only 255 PLM markers are supported",
            ));
        }
        self.marker_index = index as u32;
        if self.markers.is_empty() {
            self.sequential = index == 0;
        } else if self.sequential {
            // once sequential becomes false it never returns to true
            self.sequential = self.markers.len() % 256 == index as usize;
            if !self.sequential && self.markers.len() > 256 {
                return Err(CodecError::malformed(
                    "PLT",
                    offset,
                    "sequential marker assumption has been broken",
                ));
            }
        }
        if self.sequential {
            if self.markers.len() == 256 {
                warn!(
                    "PLT: 257 markers with indices sequential mod 256; \
                     ignoring signalled indices and using the marker count instead"
                );
            }
            if self.markers.len() >= 256 {
                self.marker_index = self.markers.len() as u32;
            }
        }
        debug_assert_eq!(self.accum, 0);
        self.markers.entry(self.marker_index).or_default();
        Ok(())
    }

    fn read_next(&mut self, byte: u8) {
        self.accum |= (byte & 0x7F) as u32;
        if byte & 0x80 != 0 {
            self.accum <<= 7;
        } else {
            // read_init inserted the entry for the current marker
            if let Some(v) = self.markers.get_mut(&self.marker_index) {
                v.push(self.accum);
            }
            self.accum = 0;
        }
    }

    /// Parse one PLT marker body (after the length field): Zplt then
    /// packed packet lengths.
    pub fn read_plt(&mut self, body: &[u8], offset: u64) -> Result<()> {
        if body.is_empty() {
            return Err(CodecError::malformed("PLT", offset, "segment too short"));
        }
        self.read_init(body[0], false, offset)?;
        for &b in &body[1..] {
            self.read_next(b);
        }
        if self.accum != 0 {
            self.accum = 0;
            return Err(CodecError::malformed(
                "PLT",
                offset,
                "packet length continues past the marker boundary",
            ));
        }
        Ok(())
    }

    /// Parse one PLM marker body: Zplm, then (Nplm, lengths) groups.
    pub fn read_plm(&mut self, body: &[u8], offset: u64) -> Result<()> {
        if body.is_empty() {
            return Err(CodecError::malformed("PLM", offset, "segment too short"));
        }
        self.read_init(body[0], true, offset)?;
        let mut rest = &body[1..];
        while !rest.is_empty() {
            let nplm = rest[0] as usize;
            if rest.len() < 1 + nplm {
                return Err(CodecError::malformed(
                    "PLM",
                    offset,
                    "Nplm exceeds the marker boundary",
                ));
            }
            for &b in &rest[1..1 + nplm] {
                self.read_next(b);
            }
            if self.accum != 0 {
                self.accum = 0;
                return Err(CodecError::malformed(
                    "PLM",
                    offset,
                    "packet length continues past an Nplm boundary",
                ));
            }
            rest = &rest[1 + nplm..];
        }
        Ok(())
    }

    /// Record a packet length on the write path.
    pub fn push_next_packet_length(&mut self, len: u32) {
        debug_assert!(len > 0);
        self.markers.entry(self.marker_index).or_default().push(len);
    }

    pub fn rewind(&mut self) {
        self.read_marker_pos = 0;
        self.read_packet = 0;
    }

    /// Next stored packet length; 0 signals exhaustion (a packet length
    /// is at least 1).
    pub fn pop_next_packet_length(&mut self) -> u32 {
        loop {
            let Some(v) = self.markers.values().nth(self.read_marker_pos) else {
                return 0;
            };
            if self.read_packet < v.len() {
                let len = v[self.read_packet];
                self.read_packet += 1;
                return len;
            }
            self.read_marker_pos += 1;
            self.read_packet = 0;
        }
    }
}

/// One TLM entry: the tile the tile-part belongs to and its byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePartLength {
    pub tile_index: u16,
    pub length: u32,
}

/// TLM (tile-part length) marker store.
#[derive(Debug, Clone, Default)]
pub struct TileLengthMarkers {
    markers: BTreeMap<u8, Vec<TilePartLength>>,
    valid: bool,
    has_tile_indices: bool,
    /// Synthesized tile index for streams without explicit indices.
    tile_count: u16,
    // iteration cursor
    read_marker_pos: usize,
    read_part: usize,
}

impl TileLengthMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Parse one TLM marker body: Ztlm, Stlm (the L parameter with bit
    /// layout `0 L_LTP L_iT[2] 0000`), then tile-part records.
    pub fn read(&mut self, body: &[u8], offset: u64) -> Result<()> {
        if body.len() < TLM_MARKER_START_BYTES as usize - 4 {
            return Err(CodecError::malformed("TLM", offset, "segment too short"));
        }
        let i_tlm = body[0];
        let l = body[1];
        if l & !0x70 != 0 {
            return Err(CodecError::malformed(
                "TLM",
                offset,
                format!("illegal Stlm value 0x{l:02X}"),
            ));
        }
        // 0 => 16-bit tile-part lengths, 1 => 32-bit
        let l_ltp = (l >> 6) & 0x1;
        let bytes_per_length: usize = if l_ltp == 1 { 4 } else { 2 };
        // 0/1/2-byte tile indices
        let l_it = ((l >> 4) & 0x3) as usize;
        if l_it == 3 {
            return Err(CodecError::malformed("TLM", offset, "ST value 3 is reserved"));
        }

        if self.markers.is_empty() {
            self.has_tile_indices = l_it != 0;
        } else if (self.has_tile_indices && l_it == 0) || (!self.has_tile_indices && l_it != 0) {
            warn!("cannot mix TLM markers with and without tile indices; disabling TLM index");
            self.valid = false;
        }

        let rest = &body[2..];
        let quotient = bytes_per_length + l_it;
        if rest.len() % quotient != 0 {
            return Err(CodecError::malformed(
                "TLM",
                offset,
                "body is not a whole number of tile-part records",
            ));
        }
        for rec in rest.chunks_exact(quotient) {
            let tile_index = match l_it {
                0 => {
                    let t = self.tile_count;
                    self.tile_count = self.tile_count.wrapping_add(1);
                    t
                }
                1 => rec[0] as u16,
                _ => ((rec[0] as u16) << 8) | rec[1] as u16,
            };
            let lb = &rec[l_it..];
            let length = if bytes_per_length == 2 {
                ((lb[0] as u32) << 8) | lb[1] as u32
            } else {
                ((lb[0] as u32) << 24) | ((lb[1] as u32) << 16) | ((lb[2] as u32) << 8) | lb[3] as u32
            };
            self.markers
                .entry(i_tlm)
                .or_default()
                .push(TilePartLength { tile_index, length });
        }
        Ok(())
    }

    /// The index is usable iff the recorded tile indices increase
    /// monotonically and cover exactly `[0, num_tiles)`.
    pub fn validate(&mut self, num_tiles: u16) -> bool {
        if num_tiles == 0 {
            self.valid = false;
            return false;
        }
        let mut tile_index: u16 = 0;
        let mut ok = true;
        'outer: for lengths in self.markers.values() {
            for info in lengths {
                if info.tile_index == tile_index {
                    continue;
                }
                if info.tile_index != tile_index + 1 {
                    warn!("corrupt TLM marker: tile index {} after {}", info.tile_index, tile_index);
                    ok = false;
                    break 'outer;
                }
                tile_index += 1;
            }
        }
        self.valid = ok && !self.markers.is_empty() && tile_index == num_tiles - 1;
        self.valid
    }

    pub fn rewind(&mut self) {
        self.read_marker_pos = 0;
        self.read_part = 0;
    }

    pub fn next(&mut self) -> Option<TilePartLength> {
        if !self.valid {
            warn!("attempt to iterate an invalid TLM index");
            return None;
        }
        loop {
            let vec = self.markers.values().nth(self.read_marker_pos)?;
            if self.read_part < vec.len() {
                let info = vec[self.read_part];
                self.read_part += 1;
                return Some(info);
            }
            self.read_marker_pos += 1;
            self.read_part = 0;
        }
    }

    /// Seek the stream to the first tile-part of `tile_index`, relative
    /// to the position of the first SOT marker.
    pub fn skip_to(
        &mut self,
        tile_index: u16,
        stream: &mut ByteStream<'_>,
        first_sot_pos: u64,
    ) -> Result<bool> {
        self.rewind();
        let mut skip: u64 = 0;
        while let Some(tl) = self.next() {
            if tl.tile_index == tile_index {
                stream.seek(first_sot_pos + skip)?;
                return Ok(true);
            }
            if tl.length == 0 {
                return Err(CodecError::malformed(
                    "TLM",
                    first_sot_pos + skip,
                    "zero tile-part length",
                ));
            }
            skip += tl.length as u64;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plt_varint_lengths() {
        let mut pl = PacketLengthMarkers::new();
        // Zplt=0; lengths 5, 300 (= 0x82 0x2C), 1
        pl.read_plt(&[0x00, 0x05, 0x82, 0x2C, 0x01], 0).unwrap();
        pl.rewind();
        assert_eq!(pl.pop_next_packet_length(), 5);
        assert_eq!(pl.pop_next_packet_length(), 300);
        assert_eq!(pl.pop_next_packet_length(), 1);
        assert_eq!(pl.pop_next_packet_length(), 0);
    }

    #[test]
    fn plt_dangling_continuation_is_malformed() {
        let mut pl = PacketLengthMarkers::new();
        let err = pl.read_plt(&[0x00, 0x85], 7).unwrap_err();
        assert!(matches!(err, CodecError::MalformedMarker { marker: "PLT", .. }));
    }

    #[test]
    fn plt_markers_concatenate_in_index_order() {
        let mut pl = PacketLengthMarkers::new();
        pl.read_plt(&[0x00, 0x02], 0).unwrap();
        pl.read_plt(&[0x01, 0x03, 0x04], 0).unwrap();
        pl.rewind();
        assert_eq!(pl.pop_next_packet_length(), 2);
        assert_eq!(pl.pop_next_packet_length(), 3);
        assert_eq!(pl.pop_next_packet_length(), 4);
        assert_eq!(pl.pop_next_packet_length(), 0);
    }

    #[test]
    fn plm_groups_respect_nplm() {
        let mut pl = PacketLengthMarkers::new();
        // Zplm=0, then a group of 2 bytes holding lengths 6 and 7
        pl.read_plm(&[0x00, 0x02, 0x06, 0x07], 0).unwrap();
        pl.rewind();
        assert_eq!(pl.pop_next_packet_length(), 6);
        assert_eq!(pl.pop_next_packet_length(), 7);
        // length split across an Nplm group boundary is malformed
        let mut bad = PacketLengthMarkers::new();
        assert!(bad.read_plm(&[0x00, 0x01, 0x85], 0).is_err());
    }

    #[test]
    fn tlm_with_explicit_indices_validates() {
        let mut tlm = TileLengthMarkers::new();
        // Ztlm=0, Stlm=0x10 (1-byte tile index, 16-bit lengths),
        // entries (0, 100), (1, 200)
        tlm.read(&[0x00, 0x10, 0x00, 0x00, 100, 0x01, 0x00, 200], 0)
            .unwrap();
        assert!(tlm.validate(2));
        assert!(!tlm.validate(3));
    }

    #[test]
    fn tlm_without_indices_counts_sequentially() {
        let mut tlm = TileLengthMarkers::new();
        // Stlm=0x00: no indices, 16-bit lengths; two entries
        tlm.read(&[0x00, 0x00, 0x00, 50, 0x00, 60], 0).unwrap();
        assert!(tlm.validate(2));
        tlm.rewind();
        assert_eq!(
            tlm.next(),
            Some(TilePartLength { tile_index: 0, length: 50 })
        );
        assert_eq!(
            tlm.next(),
            Some(TilePartLength { tile_index: 1, length: 60 })
        );
        assert_eq!(tlm.next(), None);
    }

    #[test]
    fn mixing_tlm_index_styles_invalidates() {
        let mut tlm = TileLengthMarkers::new();
        tlm.read(&[0x00, 0x10, 0x00, 0x00, 10], 0).unwrap();
        tlm.validate(1);
        tlm.read(&[0x01, 0x00, 0x00, 20], 0).unwrap();
        assert!(!tlm.is_valid());
    }

    #[test]
    fn tlm_skip_to_accumulates_lengths() {
        let data = vec![0u8; 400];
        let mut stream = ByteStream::new(&data);
        let mut tlm = TileLengthMarkers::new();
        tlm.read(&[0x00, 0x10, 0x00, 0x00, 100, 0x01, 0x00, 200], 0)
            .unwrap();
        assert!(tlm.validate(2));
        assert!(tlm.skip_to(1, &mut stream, 10).unwrap());
        assert_eq!(stream.tell(), 110);
    }
}
