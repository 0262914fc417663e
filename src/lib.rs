/*!
# j2kexp-rs

`j2kexp-rs` is a pure Rust JPEG 2000 (ISO/IEC 15444-1) codec. The
decompression pipeline is a marker-driven state machine over the raw
codestream: main-header parsing into persistent coding parameters,
tile-part iteration, tag-tree packet decoding (Tier-2), the EBCOT
bit-plane coder over an MQ arithmetic decoder (Tier-1), windowed
inverse wavelet transforms and the inverse multi-component transform
with DC level shifting. A compression path mirrors it far enough for
sample-exact reversible round trips.

## Decoding

```no_run
use j2kexp_rs::decoder::J2kDecoder;

let data = std::fs::read("image.j2k").unwrap();
let image = J2kDecoder::new(&data).decode().unwrap();
let plane = &image.comps[0].data;
# let _ = plane;
```

## Encoding

```no_run
use j2kexp_rs::encoder::{EncoderParams, J2kEncoder};
use j2kexp_rs::image::{J2kComponent, J2kImage};

let mut image = J2kImage {
    x1: 64, y1: 64, tdx: 64, tdy: 64,
    comps: vec![J2kComponent { dx: 1, dy: 1, prec: 8, ..Default::default() }],
    ..Default::default()
};
image.update_component_rects();
image.comps[0].data = vec![0; 64 * 64];
let bytes = J2kEncoder::new(EncoderParams::default()).encode(&image).unwrap();
# let _ = bytes;
```

Concurrency is explicit: a [`runtime::Runtime`] value carries the
worker pool through the tile, block-decoder and wavelet stages.
*/

pub mod decoder;
pub mod dwt;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod image;
pub mod length;
pub mod marker;
pub mod mct;
pub mod params;
pub mod quantization;
pub mod reader;
pub mod runtime;
pub mod stream;
pub mod t1;
pub mod t2;
pub mod tile;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use decoder::{DecodeOptions, J2kDecoder};
pub use encoder::{EncoderParams, J2kEncoder};
pub use error::{CodecError, Result};
pub use image::{J2kComponent, J2kImage};
