//! Hand-built codestreams shared by the unit tests.

/// Minimal 1x1 single-component codestream: SOC, SIZ, COD, QCD, one
/// tile-part with a single empty packet, EOC. Decodes to one sample at
/// the DC level (128).
pub fn minimal_codestream() -> Vec<u8> {
    let mut cs = vec![0xFF, 0x4F]; // SOC
    cs.extend_from_slice(&siz_1x1());
    cs.extend_from_slice(&cod_single_res());
    cs.extend_from_slice(&qcd_noqnt(&[0x08]));
    cs.extend_from_slice(&sot(0, 15, 0, 1));
    cs.extend_from_slice(&[0xFF, 0x93]); // SOD
    cs.push(0x00); // empty packet
    cs.extend_from_slice(&[0xFF, 0xD9]); // EOC
    cs
}

/// Same header sequence with an unknown 0xFF99 marker plus four junk
/// bytes injected before the SOT.
pub fn codestream_with_unknown_marker() -> Vec<u8> {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz_1x1());
    cs.extend_from_slice(&cod_single_res());
    cs.extend_from_slice(&qcd_noqnt(&[0x08]));
    cs.extend_from_slice(&[0xFF, 0x99, 0x00, 0x00, 0x00, 0x00]);
    cs.extend_from_slice(&sot(0, 15, 0, 1));
    cs.extend_from_slice(&[0xFF, 0x93]);
    cs.push(0x00);
    cs.extend_from_slice(&[0xFF, 0xD9]);
    cs
}

/// Two identical QCD markers in the main header (scope idempotence).
pub fn codestream_with_double_qcd() -> Vec<u8> {
    let mut cs = vec![0xFF, 0x4F];
    cs.extend_from_slice(&siz_1x1());
    cs.extend_from_slice(&cod_single_res());
    cs.extend_from_slice(&qcd_noqnt(&[0x48]));
    cs.extend_from_slice(&qcd_noqnt(&[0x48]));
    cs.extend_from_slice(&sot(0, 15, 0, 1));
    cs.extend_from_slice(&[0xFF, 0x93]);
    cs.push(0x00);
    cs.extend_from_slice(&[0xFF, 0xD9]);
    cs
}

pub fn siz_1x1() -> Vec<u8> {
    let mut v = vec![0xFF, 0x51, 0x00, 0x29]; // SIZ, Lsiz = 41
    v.extend_from_slice(&[0x00, 0x00]); // Rsiz
    v.extend_from_slice(&1u32.to_be_bytes()); // Xsiz
    v.extend_from_slice(&1u32.to_be_bytes()); // Ysiz
    v.extend_from_slice(&0u32.to_be_bytes()); // XOsiz
    v.extend_from_slice(&0u32.to_be_bytes()); // YOsiz
    v.extend_from_slice(&1u32.to_be_bytes()); // XTsiz
    v.extend_from_slice(&1u32.to_be_bytes()); // YTsiz
    v.extend_from_slice(&0u32.to_be_bytes()); // XTOsiz
    v.extend_from_slice(&0u32.to_be_bytes()); // YTOsiz
    v.extend_from_slice(&[0x00, 0x01]); // Csiz
    v.extend_from_slice(&[0x07, 0x01, 0x01]); // 8-bit unsigned, 1x1
    v
}

/// COD: LRCP, 1 layer, no MCT, zero decompositions, 4x4 code-blocks,
/// reversible.
pub fn cod_single_res() -> Vec<u8> {
    vec![
        0xFF, 0x52, 0x00, 0x0C, // Lcod = 12
        0x00, // Scod
        0x00, // progression LRCP
        0x00, 0x01, // layers
        0x00, // MCT off
        0x00, // decompositions
        0x00, 0x00, // 4x4 code-blocks
        0x00, // style
        0x01, // 5/3 reversible
    ]
}

pub fn qcd_noqnt(stepsizes: &[u8]) -> Vec<u8> {
    let mut v = vec![0xFF, 0x5C];
    v.extend_from_slice(&((3 + stepsizes.len()) as u16).to_be_bytes());
    v.push(0x20); // one guard bit, no quantization
    v.extend_from_slice(stepsizes);
    v
}

pub fn sot(tile: u16, psot: u32, tpsot: u8, tnsot: u8) -> Vec<u8> {
    let mut v = vec![0xFF, 0x90, 0x00, 0x0A];
    v.extend_from_slice(&tile.to_be_bytes());
    v.extend_from_slice(&psot.to_be_bytes());
    v.push(tpsot);
    v.push(tnsot);
    v
}
