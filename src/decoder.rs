//! Top-level decoder: drives the codestream reader over the main
//! header and tile-parts, then runs a tile processor per decodable
//! tile and assembles the output image.

use crate::error::Result;
use crate::geometry::Rect;
use crate::image::J2kImage;
use crate::reader::{CodestreamReader, TilePartEvent};
use crate::runtime::Runtime;
use crate::tile::processor::{TilePlane, TileProcessor};
use log::{error, warn};

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Decode window in canvas coordinates; `None` decodes everything.
    pub window: Option<Rect>,
    /// Cap on quality layers (0 = all).
    pub layers: u16,
    /// Worker threads (0 = all available).
    pub threads: usize,
    /// Restrict decoding to a single tile; other tile payloads are
    /// skipped rather than stored.
    pub tile: Option<u16>,
}

/// Statistics of one decode run.
#[derive(Debug, Clone, Default)]
pub struct DecodeStats {
    pub tiles_decoded: u32,
    pub tiles_failed: u32,
    pub tiles_skipped: u32,
}

pub struct J2kDecoder<'a> {
    data: &'a [u8],
    options: DecodeOptions,
}

impl<'a> J2kDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            options: DecodeOptions::default(),
        }
    }

    pub fn with_options(data: &'a [u8], options: DecodeOptions) -> Self {
        Self { data, options }
    }

    pub fn decode(&self) -> Result<J2kImage> {
        Ok(self.decode_with_stats()?.0)
    }

    pub fn decode_with_stats(&self) -> Result<(J2kImage, DecodeStats)> {
        let runtime = if self.options.threads == 1 {
            Runtime::single_threaded()
        } else if self.options.threads == 0 {
            Runtime::default_parallel()?
        } else {
            Runtime::new(self.options.threads)?
        };

        let mut reader = CodestreamReader::new(self.data);
        reader.select_tile(self.options.tile);
        reader.read_main_header()?;
        if self.options.layers != 0 {
            for tcp in &mut reader.coding_params_mut().tcps {
                tcp.num_layers_to_decode = self.options.layers;
            }
        }

        // collect every tile-part; tile decoding is independent of the
        // tile-part order in the stream
        loop {
            match reader.parse_tile_part()? {
                TilePartEvent::TilePart(_) => {}
                TilePartEvent::Eoc => break,
                TilePartEvent::NoEoc => {
                    warn!("codestream ended without an EOC marker");
                    break;
                }
            }
        }

        let mut image = reader.take_image();
        for comp in &mut image.comps {
            comp.alloc_data()?;
        }

        let mut stats = DecodeStats::default();
        let num_tiles = image.num_tiles() as u16;
        for t in 0..num_tiles {
            if matches!(self.options.tile, Some(sel) if sel != t) {
                stats.tiles_skipped += 1;
                continue;
            }
            if !reader.can_decompress(t) {
                warn!("tile {t}: no decodable data");
                stats.tiles_skipped += 1;
                continue;
            }
            reader.merge_ppt(t);
            if let Err(e) = reader.validate_quantization(t) {
                error!("tile {t}: {e}");
                stats.tiles_failed += 1;
                continue;
            }
            let planes = {
                let cp = reader.coding_params();
                TileProcessor::new(cp, &image, t, self.options.window).decompress(&runtime)
            };
            match planes {
                Ok(planes) => {
                    for plane in &planes {
                        blit_plane(&mut image, plane);
                    }
                    stats.tiles_decoded += 1;
                }
                Err(e) => {
                    error!("tile {t}: {e}");
                    stats.tiles_failed += 1;
                }
            }
        }
        Ok((image, stats))
    }
}

/// Copy a decoded tile plane into the component's sample plane,
/// restricted to the plane's decoded window.
fn blit_plane(image: &mut J2kImage, plane: &TilePlane) {
    let comp = &mut image.comps[plane.compno];
    let target = plane.window.intersection(&comp.rect);
    if target.is_empty() {
        return;
    }
    let cw = comp.rect.width() as usize;
    let pw = plane.rect.width() as usize;
    for y in target.y0..target.y1 {
        let src = (y - plane.rect.y0) as usize * pw + (target.x0 - plane.rect.x0) as usize;
        let dst = (y - comp.rect.y0) as usize * cw + (target.x0 - comp.rect.x0) as usize;
        let n = target.width() as usize;
        comp.data[dst..dst + n].copy_from_slice(&plane.data[src..src + n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::minimal_codestream;

    #[test]
    fn minimal_stream_decodes_to_dc_level() {
        let cs = minimal_codestream();
        let image = J2kDecoder::new(&cs).decode().unwrap();
        assert_eq!(image.comps.len(), 1);
        assert_eq!(image.comps[0].data, vec![128]);
    }

    #[test]
    fn stats_count_decoded_tiles() {
        let cs = minimal_codestream();
        let (_, stats) = J2kDecoder::new(&cs).decode_with_stats().unwrap();
        assert_eq!(stats.tiles_decoded, 1);
        assert_eq!(stats.tiles_failed, 0);
    }
}
