//! j2kexp CLI - JPEG 2000 codestream utility.
//!
//! Decodes raw codestreams to raw planes or PGM/PPM, encodes raw pixel
//! data, and dumps codestream metadata.

use clap::{Parser, Subcommand, ValueEnum};
use j2kexp_rs::decoder::{DecodeOptions, J2kDecoder};
use j2kexp_rs::encoder::{EncoderParams, J2kEncoder};
use j2kexp_rs::geometry::Rect;
use j2kexp_rs::image::{J2kComponent, J2kImage};
use j2kexp_rs::reader::CodestreamReader;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

/// JPEG 2000 codec for encoding and decoding raw codestreams
#[derive(Parser)]
#[command(name = "j2kexp")]
#[command(author = "j2kexp-rs contributors")]
#[command(version)]
#[command(about = "JPEG 2000 (ISO/IEC 15444-1) encoder/decoder", long_about = None)]
#[command(after_help = "EXAMPLES:
    j2kexp decode -i image.j2k -o pixels.raw
    j2kexp decode -i image.j2k -o image.pgm -f pnm
    j2kexp decode -i image.j2k -o crop.raw --window 0,0,256,256
    j2kexp encode -i pixels.raw -o image.j2k -w 512 -H 512
    j2kexp info -i image.j2k")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw JPEG 2000 codestream
    #[command(visible_alias = "d")]
    Decode {
        /// Input codestream (.j2k / .j2c)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the decoded samples
        #[arg(short, long)]
        output: PathBuf,

        /// Output format: raw interleaved bytes or PGM/PPM
        #[arg(short, long, default_value = "raw", value_enum)]
        format: OutputFormat,

        /// Decode window as x0,y0,x1,y1 in canvas coordinates
        #[arg(long, value_parser = parse_window)]
        window: Option<Rect>,

        /// Only decode this tile index
        #[arg(long)]
        tile: Option<u16>,

        /// Cap on quality layers (0 = all)
        #[arg(long, default_value = "0")]
        layers: u16,

        /// Worker threads (0 = all cores)
        #[arg(short, long, default_value = "0")]
        threads: usize,
    },

    /// Encode raw 8-bit pixel data to a JPEG 2000 codestream
    #[command(visible_alias = "e")]
    Encode {
        /// Input raw pixel file (row-major, interleaved components)
        #[arg(short, long)]
        input: PathBuf,

        /// Output codestream
        #[arg(short, long)]
        output: PathBuf,

        /// Image width in pixels
        #[arg(short, long)]
        width: u32,

        /// Image height in pixels
        #[arg(short = 'H', long)]
        height: u32,

        /// Number of components (1 = grayscale, 3 = RGB)
        #[arg(short = 'n', long, default_value = "1")]
        components: u32,

        /// Tile size (0 = single tile)
        #[arg(long, default_value = "0")]
        tile_size: u32,

        /// DWT decomposition levels
        #[arg(long, default_value = "5")]
        levels: u8,

        /// Use the irreversible 9/7 transform
        #[arg(long)]
        irreversible: bool,

        /// Apply the multi-component transform (needs 3 components)
        #[arg(long)]
        mct: bool,
    },

    /// Print codestream metadata
    #[command(visible_alias = "i")]
    Info {
        /// Input codestream
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Interleaved raw bytes
    Raw,
    /// PGM for one component, PPM for three
    Pnm,
}

fn parse_window(s: &str) -> Result<Rect, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    if parts.len() != 4 {
        return Err("window must be x0,y0,x1,y1".into());
    }
    Ok(Rect::new(parts[0], parts[1], parts[2], parts[3]))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Decode {
            input,
            output,
            format,
            window,
            tile,
            layers,
            threads,
        } => {
            let data = fs::read(&input)?;
            let options = DecodeOptions {
                window,
                layers,
                threads,
                tile,
            };
            let (image, stats) = J2kDecoder::with_options(&data, options).decode_with_stats()?;
            if stats.tiles_failed > 0 {
                eprintln!("{} tile(s) failed to decode", stats.tiles_failed);
            }
            let bytes = match format {
                OutputFormat::Raw => interleave(&image),
                OutputFormat::Pnm => pnm(&image)?,
            };
            fs::write(&output, bytes)?;
            println!(
                "decoded {}x{} with {} component(s), {} tile(s)",
                image.x1 - image.x0,
                image.y1 - image.y0,
                image.comps.len(),
                stats.tiles_decoded
            );
            Ok(())
        }
        Commands::Encode {
            input,
            output,
            width,
            height,
            components,
            tile_size,
            levels,
            irreversible,
            mct,
        } => {
            let pixels = fs::read(&input)?;
            let expected = (width * height * components) as usize;
            if pixels.len() < expected {
                return Err(format!(
                    "raw input holds {} bytes, {expected} required",
                    pixels.len()
                )
                .into());
            }
            let (tdx, tdy) = if tile_size == 0 {
                (width, height)
            } else {
                (tile_size, tile_size)
            };
            let mut image = J2kImage {
                x1: width,
                y1: height,
                tdx,
                tdy,
                comps: (0..components)
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
            for (c, comp) in image.comps.iter_mut().enumerate() {
                comp.data = pixels
                    .chunks_exact(components as usize)
                    .map(|px| px[c] as i32)
                    .collect();
            }
            let params = EncoderParams {
                decomposition_levels: levels,
                reversible: !irreversible,
                mct,
                ..Default::default()
            };
            let bytes = J2kEncoder::new(params).encode(&image)?;
            fs::write(&output, &bytes)?;
            println!("encoded {} bytes", bytes.len());
            Ok(())
        }
        Commands::Info { input } => {
            let data = fs::read(&input)?;
            let mut reader = CodestreamReader::new(&data);
            reader.read_main_header()?;
            let image = reader.image();
            println!(
                "canvas: ({},{})..({},{})",
                image.x0, image.y0, image.x1, image.y1
            );
            println!(
                "tiles: {}x{} of {}x{}",
                image.t_grid_w(),
                image.t_grid_h(),
                image.tdx,
                image.tdy
            );
            for (i, c) in image.comps.iter().enumerate() {
                println!(
                    "component {i}: {}x{}, {} bit {}, subsampling {}x{}",
                    c.width(),
                    c.height(),
                    c.prec,
                    if c.sgnd { "signed" } else { "unsigned" },
                    c.dx,
                    c.dy
                );
            }
            let tcp = reader.coding_params().tcp(0);
            println!(
                "progression {:?}, {} layer(s), MCT {}",
                tcp.prg,
                tcp.numlayers,
                if tcp.mct == 1 { "on" } else { "off" }
            );
            let tccp = &tcp.tccps[0];
            println!(
                "resolutions {}, code-blocks 2^{}x2^{}, {}",
                tccp.numresolutions,
                tccp.cblkw,
                tccp.cblkh,
                if tccp.reversible() {
                    "reversible 5/3"
                } else {
                    "irreversible 9/7"
                }
            );
            Ok(())
        }
    }
}

fn interleave(image: &J2kImage) -> Vec<u8> {
    let n = image.comps.len();
    let len = image.comps[0].data.len();
    let mut out = Vec::with_capacity(len * n);
    for i in 0..len {
        for c in &image.comps {
            let v = c.data.get(i).copied().unwrap_or(0);
            out.push(v.clamp(0, 255) as u8);
        }
    }
    out
}

fn pnm(image: &J2kImage) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let w = image.comps[0].width();
    let h = image.comps[0].height();
    let mut out = match image.comps.len() {
        1 => format!("P5\n{w} {h}\n255\n").into_bytes(),
        3 => format!("P6\n{w} {h}\n255\n").into_bytes(),
        n => return Err(format!("PNM output supports 1 or 3 components, image has {n}").into()),
    };
    out.extend(interleave(image));
    Ok(out)
}
