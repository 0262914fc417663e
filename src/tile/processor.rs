//! Per-tile decompression: T2 packet parsing, Tier-1 scheduling, the
//! inverse wavelet transform, the inverse multi-component transform and
//! the DC level shift. A failure marks this tile as failed; other tiles
//! are still attempted by the caller.

use crate::error::{CodecError, Result};
use crate::geometry::{ceil_div, Rect};
use crate::image::J2kImage;
use crate::marker::{Marker, LSOP};
use crate::mct;
use crate::params::{csty, cblk_sty, CodingParams, TileCodingParams};
use crate::runtime::Runtime;
use crate::t1::{scheduler::T1Scheduler, DecompressBlockExec, T1Kind};
use crate::t2::bitio::PacketBitReader;
use crate::t2::packet_iter::{PacketIter, PiComponent, PiResolution};
use crate::t2::read_packet_header;
use crate::tile::window::{CoeffBuf, TileComponentWindow};
use crate::tile::{build_resolutions, ResolutionLevel};
use log::{debug, warn};

/// Decoded samples of one tile component.
pub struct TilePlane {
    pub compno: usize,
    /// Tile-component rectangle the samples cover.
    pub rect: Rect,
    /// Sub-rectangle that actually carries decoded content (differs
    /// from `rect` for windowed decoding).
    pub window: Rect,
    pub data: Vec<i32>,
}

struct TileComponent {
    resolutions: Vec<ResolutionLevel>,
    window: TileComponentWindow,
    rect: Rect,
}

pub struct TileProcessor<'a> {
    tile_index: u16,
    cp: &'a CodingParams,
    image: &'a J2kImage,
    /// Decode window in canvas coordinates.
    window: Option<Rect>,
    comps: Vec<TileComponent>,
}

impl<'a> TileProcessor<'a> {
    pub fn new(
        cp: &'a CodingParams,
        image: &'a J2kImage,
        tile_index: u16,
        window: Option<Rect>,
    ) -> Self {
        Self {
            tile_index,
            cp,
            image,
            window,
            comps: Vec::new(),
        }
    }

    fn tcp(&self) -> &'a TileCodingParams {
        self.cp.tcp(self.tile_index)
    }

    /// Build the per-component resolution trees and buffer windows.
    pub fn init(&mut self) -> Result<()> {
        let tcp = self.tcp();
        for (compno, comp) in self.image.comps.iter().enumerate() {
            let tccp = &tcp.tccps[compno];
            let rect = self.image.tile_comp_rect(self.tile_index, compno);
            let resolutions = build_resolutions(rect, tccp, comp.prec)?;
            let band_rects: Vec<Vec<Rect>> = resolutions
                .iter()
                .map(|r| r.bands.iter().map(|b| b.rect).collect())
                .collect();
            let window_tc = self.window.map(|w| {
                Rect::new(
                    ceil_div(w.x0, comp.dx),
                    ceil_div(w.y0, comp.dy),
                    ceil_div(w.x1, comp.dx),
                    ceil_div(w.y1, comp.dy),
                )
            });
            let window = TileComponentWindow::new(
                rect,
                window_tc,
                tccp.numresolutions,
                &band_rects,
                tccp.reversible(),
            )?;
            self.comps.push(TileComponent {
                resolutions,
                window,
                rect,
            });
        }
        Ok(())
    }

    /// Full tile pipeline; returns the decoded per-component planes.
    pub fn decompress(mut self, runtime: &Runtime) -> Result<Vec<TilePlane>> {
        self.init()?;
        self.decompress_t2()?;
        self.schedule_t1(runtime)?;
        self.inverse_dwt(runtime);
        self.inverse_mct_and_shift()
    }

    fn pi_components(&self) -> Vec<PiComponent> {
        self.comps
            .iter()
            .enumerate()
            .map(|(compno, tc)| {
                let comp = &self.image.comps[compno];
                let numres = tc.resolutions.len() as u8;
                PiComponent {
                    resolutions: tc
                        .resolutions
                        .iter()
                        .enumerate()
                        .map(|(resno, r)| {
                            let n = (numres - 1 - resno as u8) as u32;
                            PiResolution {
                                pw: r.pw,
                                ph: r.ph,
                                pdx: (1u64 << (r.ppx as u32 + n)) * comp.dx as u64,
                                pdy: (1u64 << (r.ppy as u32 + n)) * comp.dy as u64,
                                px0: (((r.rect.x0 >> r.ppx) as u64) << (r.ppx as u32 + n))
                                    * comp.dx as u64,
                                py0: (((r.rect.y0 >> r.ppy) as u64) << (r.ppy as u32 + n))
                                    * comp.dy as u64,
                            }
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Parse every packet of the merged tile-part payload, attaching
    /// body bytes to the covered code-blocks.
    pub fn decompress_t2(&mut self) -> Result<()> {
        let tcp = self.tcp();
        if self.cp.ppm_headers.is_some() {
            warn!(
                "tile {}: PPM packed packet headers are stored but not used for decoding",
                self.tile_index
            );
        }
        let data: &[u8] = &tcp.data;
        let mut pos = 0usize;

        // headers come from the merged PPT buffer when present
        let ppt_buf = tcp.ppt_headers.merged.as_deref();
        let mut ppt_pos = 0usize;

        let mut plt = tcp.plt_markers.clone();
        if let Some(p) = plt.as_mut() {
            p.rewind();
        }

        let pi_comps = self.pi_components();
        let mut iter = PacketIter::new(tcp, &pi_comps);
        let use_sop = tcp.csty & csty::SOP != 0;
        let use_eph = tcp.csty & csty::EPH != 0;

        let layer_cap = tcp.layers_to_decode();
        while iter.next() {
            let coord = iter.current();
            if pos >= data.len() && ppt_buf.is_none() {
                break;
            }
            // past the layer cap headers still parse (the tag-tree and
            // Lblock state must advance) but nothing is retained
            let keep = coord.layno < layer_cap;
            let packet_start = pos;
            let plt_len = plt.as_mut().map(|p| p.pop_next_packet_length());

            if use_sop
                && pos + 6 <= data.len()
                && data[pos] == 0xFF
                && data[pos + 1] == (Marker::Sop.code() & 0xFF) as u8
            {
                // SOP: marker(2) + Lsop(2) + Nsop(2)
                pos += 2 + LSOP as usize;
            }

            let tc = &mut self.comps[coord.compno as usize];
            let tc_window = &tc.window;
            let res = &mut tc.resolutions[coord.resno as usize];
            let header = if let Some(ppt) = ppt_buf {
                let mut bio = PacketBitReader::new(&ppt[ppt_pos..]);
                let h = read_packet_header(&mut bio, res, coord.resno, coord.precno, coord.layno, keep)?;
                ppt_pos += bio.position();
                if use_eph {
                    ppt_pos += eph_len(&ppt[ppt_pos..]);
                }
                h
            } else {
                let mut bio = PacketBitReader::new(&data[pos..]);
                let h = read_packet_header(&mut bio, res, coord.resno, coord.precno, coord.layno, keep)?;
                pos += bio.position();
                if use_eph {
                    pos += eph_len(&data[pos..]);
                }
                h
            };

            for c in &header.contributions {
                let end = pos + c.data_len as usize;
                if end > data.len() {
                    return Err(CodecError::Truncated(end as u64));
                }
                let covered = {
                    let band = &res.bands[c.band_index as usize];
                    let prec = band.precincts[coord.precno as usize]
                        .as_ref()
                        .map(|p| p.cblks[c.cblkno as usize].rect);
                    match prec {
                        Some(rect) => tc_window.covers(coord.resno, band.orientation, &rect),
                        None => false,
                    }
                };
                if covered && keep {
                    let band = &mut res.bands[c.band_index as usize];
                    if let Some(prec) = band.precincts[coord.precno as usize].as_mut() {
                        prec.cblks[c.cblkno as usize]
                            .data
                            .extend_from_slice(&data[pos..end]);
                    }
                }
                pos = end;
            }

            if let Some(expected) = plt_len {
                if expected != 0 {
                    let consumed = (pos - packet_start) as u32;
                    if consumed != expected {
                        warn!(
                            "tile {}: packet at offset {packet_start} consumed {consumed} bytes \
                             but the PLT index signalled {expected}",
                            self.tile_index
                        );
                        // trust the index: packets are delimited by it
                        pos = packet_start + expected as usize;
                    }
                }
            }
        }

        if pos < data.len() {
            debug!(
                "tile {}: {} residual bytes after the last packet",
                self.tile_index,
                data.len() - pos
            );
        }
        Ok(())
    }

    /// Gather the Tier-1 tasks and run them on the worker pool, then
    /// blit decoded blocks into the band windows.
    pub fn schedule_t1(&mut self, runtime: &Runtime) -> Result<()> {
        let tcp = self.tcp();
        let mut blocks: Vec<DecompressBlockExec> = Vec::new();
        // (compno, resno, orientation, band rect, block rect) per task
        let mut targets: Vec<(usize, u8, u8, Rect, Rect)> = Vec::new();

        for (compno, tc) in self.comps.iter_mut().enumerate() {
            let tccp = &tcp.tccps[compno];
            let tc_window = &tc.window;
            for (resno, res) in tc.resolutions.iter_mut().enumerate() {
                for band in &mut res.bands {
                    for precinct in band.precincts.iter_mut().flatten() {
                        for cblk in &mut precinct.cblks {
                            if !cblk.included || cblk.rect.is_empty() {
                                continue;
                            }
                            if !tc_window.covers(resno as u8, band.orientation, &cblk.rect) {
                                continue;
                            }
                            let kind = if tccp.cblk_sty & cblk_sty::HT != 0 {
                                T1Kind::Ht
                            } else {
                                T1Kind::Standard
                            };
                            blocks.push(DecompressBlockExec {
                                kind,
                                data: std::mem::take(&mut cblk.data),
                                width: cblk.rect.width(),
                                height: cblk.rect.height(),
                                x0: cblk.rect.x0,
                                y0: cblk.rect.y0,
                                compno: compno as u16,
                                resno: resno as u8,
                                orientation: band.orientation,
                                num_bps: cblk.num_bps,
                                num_passes: cblk.num_passes,
                                cblk_sty: tccp.cblk_sty,
                                reversible: tccp.reversible(),
                                stepsize: band.stepsize,
                                roishift: tccp.roishift,
                                result: None,
                            });
                            targets.push((
                                compno,
                                resno as u8,
                                band.orientation,
                                band.rect,
                                cblk.rect,
                            ));
                        }
                    }
                }
            }
        }

        if !T1Scheduler::decompress(runtime, &mut blocks) {
            return Err(CodecError::T1DecodeFailure(format!(
                "tile {}: block decoding failed",
                self.tile_index
            )));
        }

        for (block, (compno, resno, orientation, band_rect, rect)) in
            blocks.into_iter().zip(targets)
        {
            if let Some(result) = block.result {
                self.comps[compno]
                    .window
                    .write_block(resno, orientation, band_rect, rect, &result)?;
            }
        }
        Ok(())
    }

    pub fn inverse_dwt(&mut self, runtime: &Runtime) {
        for tc in &mut self.comps {
            tc.window.inverse_dwt(runtime);
        }
    }

    /// Inverse multi-component transform followed by the DC level
    /// shift, yielding the final sample planes.
    pub fn inverse_mct_and_shift(self) -> Result<Vec<TilePlane>> {
        let tcp = self.tcp();
        let tile_index = self.tile_index;
        let image = self.image;
        let mct_enabled = tcp.mct == 1;
        let custom = tcp.mct_decoding_matrix.clone();
        let dc_offsets: Vec<i32> = tcp.tccps.iter().map(|t| t.dc_level_shift).collect();
        let reversible0 = tcp.tccps.first().map(|t| t.reversible()).unwrap_or(true);

        let mut rects = Vec::new();
        let mut windows = Vec::new();
        let mut bufs: Vec<CoeffBuf> = Vec::new();
        for tc in self.comps {
            rects.push(tc.rect);
            windows.push(tc.window.window);
            bufs.push(tc.window.into_top_buffer());
        }

        if mct_enabled {
            if let Some(matrix) = custom {
                let mut planes: Vec<Vec<i32>> = bufs.iter().map(buf_to_int).collect();
                if same_size(&rects, planes.len()) {
                    mct::inverse_custom(&matrix, &mut planes)?;
                    bufs = planes.into_iter().map(CoeffBuf::Int).collect();
                } else {
                    warn!(
                        "tile {tile_index}: custom MCT skipped, components are not coincident"
                    );
                }
            } else if bufs.len() >= 3 && same_size(&rects[..3], 3) {
                if reversible0 {
                    let mut planes: Vec<Vec<i32>> = bufs.iter().take(3).map(buf_to_int).collect();
                    let (a, rest) = planes.split_at_mut(1);
                    let (b, c) = rest.split_at_mut(1);
                    mct::inverse_rct(&mut a[0], &mut b[0], &mut c[0]);
                    for (i, p) in planes.into_iter().enumerate() {
                        bufs[i] = CoeffBuf::Int(p);
                    }
                } else {
                    let mut planes: Vec<Vec<f32>> =
                        bufs.iter().take(3).map(buf_to_float).collect();
                    let (a, rest) = planes.split_at_mut(1);
                    let (b, c) = rest.split_at_mut(1);
                    mct::inverse_ict(&mut a[0], &mut b[0], &mut c[0]);
                    for (i, p) in planes.into_iter().enumerate() {
                        bufs[i] = CoeffBuf::Float(p);
                    }
                }
            } else {
                warn!(
                    "tile {tile_index}: MCT requested but the first three components \
                     are unavailable or not coincident; skipping"
                );
            }
        }

        let mut planes = Vec::with_capacity(bufs.len());
        for (compno, buf) in bufs.into_iter().enumerate() {
            let comp = &image.comps[compno];
            let mut data = buf_to_int(&buf);
            mct::dc_level_shift(&mut data, comp.prec, comp.sgnd, dc_offsets[compno]);
            planes.push(TilePlane {
                compno,
                rect: rects[compno],
                window: windows[compno],
                data,
            });
        }
        Ok(planes)
    }
}

fn buf_to_int(buf: &CoeffBuf) -> Vec<i32> {
    match buf {
        CoeffBuf::Int(v) => v.clone(),
        CoeffBuf::Float(v) => v.iter().map(|&f| f.round() as i32).collect(),
    }
}

fn buf_to_float(buf: &CoeffBuf) -> Vec<f32> {
    match buf {
        CoeffBuf::Int(v) => v.iter().map(|&i| i as f32).collect(),
        CoeffBuf::Float(v) => v.clone(),
    }
}

fn same_size(rects: &[Rect], n: usize) -> bool {
    rects.len() >= n
        && rects[..n]
            .windows(2)
            .all(|w| w[0].width() == w[1].width() && w[0].height() == w[1].height())
}

/// Length of an EPH marker at the head of `data`, 0 when absent.
fn eph_len(data: &[u8]) -> usize {
    if data.len() >= 2 && data[0] == 0xFF && data[1] == 0x92 {
        2
    } else {
        0
    }
}
