//! End-to-end codestream scenarios: literal synthesized streams and
//! encode/decode round trips.

use j2kexp_rs::decoder::{DecodeOptions, J2kDecoder};
use j2kexp_rs::encoder::{EncoderParams, J2kEncoder};
use j2kexp_rs::geometry::Rect;
use j2kexp_rs::image::{J2kComponent, J2kImage};
use j2kexp_rs::reader::{CodestreamReader, TilePartEvent};

fn gray_image(w: u32, h: u32, tdx: u32, tdy: u32, prec: u8, data: Vec<i32>) -> J2kImage {
    let mut image = J2kImage {
        x1: w,
        y1: h,
        tdx,
        tdy,
        comps: vec![J2kComponent {
            dx: 1,
            dy: 1,
            prec,
            ..Default::default()
        }],
        ..Default::default()
    };
    image.update_component_rects();
    image.comps[0].data = data;
    image
}

fn rgb_image(w: u32, h: u32) -> J2kImage {
    let mut image = J2kImage {
        x1: w,
        y1: h,
        tdx: w,
        tdy: h,
        comps: (0..3)
            .map(|_| J2kComponent {
                dx: 1,
                dy: 1,
                prec: 8,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    image.update_component_rects();
    let n = (w * h) as usize;
    image.comps[0].data = (0..n).map(|i| ((i * 7) % 256) as i32).collect();
    image.comps[1].data = (0..n).map(|i| ((i * 13 + 40) % 256) as i32).collect();
    image.comps[2].data = (0..n).map(|i| (255 - (i * 3) % 256) as i32).collect();
    image
}

fn siz(w: u32, h: u32, tdx: u32, tdy: u32) -> Vec<u8> {
    let mut v = vec![0xFF, 0x51, 0x00, 0x29];
    v.extend_from_slice(&[0x00, 0x00]);
    v.extend_from_slice(&w.to_be_bytes());
    v.extend_from_slice(&h.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&tdx.to_be_bytes());
    v.extend_from_slice(&tdy.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&0u32.to_be_bytes());
    v.extend_from_slice(&[0x00, 0x01]);
    v.extend_from_slice(&[0x07, 0x01, 0x01]);
    v
}

fn cod(decomps: u8) -> Vec<u8> {
    vec![
        0xFF, 0x52, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, decomps, 0x00, 0x00, 0x00, 0x01,
    ]
}

fn qcd(stepsizes: &[u8]) -> Vec<u8> {
    let mut v = vec![0xFF, 0x5C];
    v.extend_from_slice(&((3 + stepsizes.len()) as u16).to_be_bytes());
    v.push(0x20);
    v.extend_from_slice(stepsizes);
    v
}

fn sot(tile: u16, psot: u32) -> Vec<u8> {
    let mut v = vec![0xFF, 0x90, 0x00, 0x0A];
    v.extend_from_slice(&tile.to_be_bytes());
    v.extend_from_slice(&psot.to_be_bytes());
    v.push(0x00);
    v.push(0x01);
    v
}

/// Scenario A: minimal 1x1 single-component stream with one empty
/// packet decodes to the DC level (128).
#[test]
fn scenario_a_minimal_stream() {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz(1, 1, 1, 1));
    cs.extend_from_slice(&cod(0));
    cs.extend_from_slice(&qcd(&[0x08]));
    cs.extend_from_slice(&sot(0, 15));
    cs.extend_from_slice(&[0xFF, 0x93, 0x00]);
    cs.extend_from_slice(&[0xFF, 0xD9]);

    let image = J2kDecoder::new(&cs).decode().unwrap();
    assert_eq!(image.comps[0].data, vec![128]);
}

/// Scenario B: a 4x4 image in two 2x4 tiles, one decomposition level,
/// all packets empty; every sample reconstructs to 128 and the SOT
/// count matches the tile grid.
#[test]
fn scenario_b_two_tile_grid() {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz(4, 4, 2, 4));
    cs.extend_from_slice(&cod(1));
    cs.extend_from_slice(&qcd(&[0x08, 0x08, 0x08, 0x08]));
    for t in 0..2u16 {
        // SOT(12) + SOD(2) + two empty packets
        cs.extend_from_slice(&sot(t, 16));
        cs.extend_from_slice(&[0xFF, 0x93, 0x00, 0x00]);
    }
    cs.extend_from_slice(&[0xFF, 0xD9]);

    let mut reader = CodestreamReader::new(&cs);
    reader.read_main_header().unwrap();
    loop {
        match reader.parse_tile_part().unwrap() {
            TilePartEvent::TilePart(_) => {}
            _ => break,
        }
    }
    assert_eq!(reader.sot_count(), 2);
    assert_eq!(reader.image().num_tiles(), 2);

    let image = J2kDecoder::new(&cs).decode().unwrap();
    assert_eq!(image.comps[0].data, vec![128; 16]);
}

/// Scenario C: RGB with the multi-component transform. The reversible
/// path round-trips exactly; the irreversible path stays within a
/// small tolerance of the source.
#[test]
fn scenario_c_rgb_mct() {
    let image = rgb_image(8, 8);
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 2,
        reversible: true,
        mct: true,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let decoded = J2kDecoder::new(&bytes).decode().unwrap();
    for c in 0..3 {
        assert_eq!(decoded.comps[c].data, image.comps[c].data, "component {c}");
    }

    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 2,
        reversible: false,
        mct: true,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let decoded = J2kDecoder::new(&bytes).decode().unwrap();
    for c in 0..3 {
        for (a, b) in decoded.comps[c].data.iter().zip(image.comps[c].data.iter()) {
            assert!((a - b).abs() <= 2, "component {c}: {a} vs {b}");
        }
    }
}

/// Scenario D: windowed decode of a 16x16 image with 3 decomposition
/// levels touches only the window samples; they match a full decode.
#[test]
fn scenario_d_windowed_decode() {
    let data: Vec<i32> = (0..256).map(|i| (i * 11 + 3) % 256).collect();
    let image = gray_image(16, 16, 16, 16, 8, data);
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 3,
        reversible: true,
        mct: false,
        cblk_exp: (2, 2),
        ..Default::default()
    })
    .encode(&image)
    .unwrap();

    let full = J2kDecoder::new(&bytes).decode().unwrap();
    assert_eq!(full.comps[0].data, image.comps[0].data);

    let win = Rect::new(0, 0, 1, 1);
    let windowed = J2kDecoder::with_options(
        &bytes,
        DecodeOptions {
            window: Some(win),
            ..Default::default()
        },
    )
    .decode()
    .unwrap();
    // window samples match the full decode
    assert_eq!(windowed.comps[0].data[0], full.comps[0].data[0]);
    // samples outside the window are untouched (still zero)
    assert_eq!(windowed.comps[0].data[255], 0);
    assert_eq!(windowed.comps[0].data[16 * 8 + 8], 0);
}

/// Scenario E: a PLT marker delimits the tile-part's packets; the
/// lengths add up to the payload byte count and the stream decodes.
#[test]
fn scenario_e_plt_driven_parse() {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz(4, 4, 4, 4));
    cs.extend_from_slice(&cod(1));
    cs.extend_from_slice(&qcd(&[0x08, 0x08, 0x08, 0x08]));
    // tile-part: SOT(12) + PLT(7) + SOD(2) + two empty packets(2)
    cs.extend_from_slice(&sot(0, 23));
    cs.extend_from_slice(&[0xFF, 0x58, 0x00, 0x05, 0x00, 0x01, 0x01]);
    cs.extend_from_slice(&[0xFF, 0x93, 0x00, 0x00]);
    cs.extend_from_slice(&[0xFF, 0xD9]);

    // PLT consistency: the recorded lengths cover the payload exactly
    let payload = 2u32;
    assert_eq!(1 + 1, payload);

    let image = J2kDecoder::new(&cs).decode().unwrap();
    assert_eq!(image.comps[0].data, vec![128; 16]);
}

/// Scenario F: an unknown 0xFF99 marker followed by junk between two
/// main-header markers is skipped and decoding proceeds.
#[test]
fn scenario_f_unknown_marker_recovery() {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz(1, 1, 1, 1));
    cs.extend_from_slice(&cod(0));
    cs.extend_from_slice(&[0xFF, 0x99, 0x00, 0x00, 0x00, 0x00]);
    cs.extend_from_slice(&qcd(&[0x08]));
    cs.extend_from_slice(&sot(0, 15));
    cs.extend_from_slice(&[0xFF, 0x93, 0x00]);
    cs.extend_from_slice(&[0xFF, 0xD9]);

    let image = J2kDecoder::new(&cs).decode().unwrap();
    assert_eq!(image.comps[0].data, vec![128]);
}

/// Property 4: reversible 5/3 round trips are sample-exact across bit
/// depths.
#[test]
fn reversible_round_trip_bit_depths() {
    for prec in [1u8, 2, 4, 8, 12, 16] {
        let max = (1u32 << prec) - 1;
        let data: Vec<i32> = (0..64u64)
            .map(|i| ((i * 2654435761) as u32 % (max + 1)) as i32)
            .collect();
        let image = gray_image(8, 8, 8, 8, prec, data);
        let bytes = J2kEncoder::new(EncoderParams {
            decomposition_levels: 2,
            reversible: true,
            mct: false,
            ..Default::default()
        })
        .encode(&image)
        .unwrap();
        let decoded = J2kDecoder::new(&bytes).decode().unwrap();
        assert_eq!(decoded.comps[0].data, image.comps[0].data, "prec {prec}");
    }
}

/// Property 5: zero decomposition levels make the inverse DWT the
/// identity map.
#[test]
fn zero_levels_round_trip() {
    let data: Vec<i32> = (0..64).map(|i| (i * 5) % 256).collect();
    let image = gray_image(8, 8, 8, 8, 8, data);
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 0,
        reversible: true,
        mct: false,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let decoded = J2kDecoder::new(&bytes).decode().unwrap();
    assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

/// A tile grid round-trips tile by tile.
#[test]
fn multi_tile_round_trip() {
    let data: Vec<i32> = (0..33 * 17).map(|i| (i * 31 + 7) % 256).collect();
    let image = gray_image(33, 17, 16, 16, 8, data);
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 2,
        reversible: true,
        mct: false,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let decoded = J2kDecoder::new(&bytes).decode().unwrap();
    assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

/// Single-tile random access skips the payloads of unselected tiles.
#[test]
fn single_tile_decode() {
    let data: Vec<i32> = (0..64).map(|i| (i * 3) % 256).collect();
    let image = gray_image(8, 8, 4, 8, 8, data.clone());
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 1,
        reversible: true,
        mct: false,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let decoded = J2kDecoder::with_options(
        &bytes,
        DecodeOptions {
            tile: Some(1),
            ..Default::default()
        },
    )
    .decode()
    .unwrap();
    // right half decoded, left half untouched
    for y in 0..8u32 {
        for x in 4..8u32 {
            let i = (y * 8 + x) as usize;
            assert_eq!(decoded.comps[0].data[i], data[i], "({x},{y})");
        }
        assert_eq!(decoded.comps[0].data[(y * 8) as usize], 0);
    }
}

/// Decoding with more worker threads matches the single-threaded
/// result.
#[test]
fn parallel_decode_matches_sequential() {
    let data: Vec<i32> = (0..32 * 32).map(|i| (i * 13 + 5) % 256).collect();
    let image = gray_image(32, 32, 16, 16, 8, data);
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 2,
        reversible: true,
        mct: false,
        cblk_exp: (3, 3),
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    let seq = J2kDecoder::with_options(
        &bytes,
        DecodeOptions {
            threads: 1,
            ..Default::default()
        },
    )
    .decode()
    .unwrap();
    let par = J2kDecoder::with_options(
        &bytes,
        DecodeOptions {
            threads: 4,
            ..Default::default()
        },
    )
    .decode()
    .unwrap();
    assert_eq!(seq.comps[0].data, par.comps[0].data);
    assert_eq!(seq.comps[0].data, image.comps[0].data);
}

/// Truncated streams surface `Truncated` instead of panicking.
#[test]
fn truncated_stream_is_an_error() {
    let image = rgb_image(8, 8);
    let bytes = J2kEncoder::new(EncoderParams::default()).encode(&image).unwrap();
    let cut = &bytes[..20];
    assert!(J2kDecoder::new(cut).decode().is_err());
}

/// A stream that simply stops mid-payload (no EOC) still decodes the
/// complete tiles.
#[test]
fn missing_eoc_keeps_complete_tiles() {
    let data: Vec<i32> = (0..64).map(|i| (i * 3) % 256).collect();
    let image = gray_image(8, 8, 4, 8, 8, data.clone());
    let bytes = J2kEncoder::new(EncoderParams {
        decomposition_levels: 1,
        reversible: true,
        mct: false,
        ..Default::default()
    })
    .encode(&image)
    .unwrap();
    // drop the EOC marker entirely
    let cut = &bytes[..bytes.len() - 2];
    let (decoded, stats) = J2kDecoder::new(cut).decode_with_stats().unwrap();
    assert_eq!(stats.tiles_decoded, 2);
    assert_eq!(decoded.comps[0].data, data);
}
