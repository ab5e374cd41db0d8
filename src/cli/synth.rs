use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::command::{Cli, SynthArgs};
use crate::input::is_pipe;
use framepipe::structs::frame::FourCc;
use framepipe::structs::rawv::RawvHeader;

pub fn cmd_synth(args: &SynthArgs, _cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let fourcc = FourCc::from(args.fourcc);
    if args.width == 0 || args.height == 0 {
        bail!("Frame size {}x{} is empty", args.width, args.height);
    }
    if fourcc == FourCc::Nv12 && (args.width % 2 != 0 || args.height % 2 != 0) {
        bail!("NV12 needs even dimensions, got {}x{}", args.width, args.height);
    }
    if args.corrupt_every == Some(0) {
        bail!("--corrupt-every must be at least 1");
    }

    log::info!(
        "Writing {} frames of {}x{} {fourcc} to {}",
        args.frames,
        args.width,
        args.height,
        args.output.display()
    );

    let mut out: Box<dyn Write> = if is_pipe(&args.output) {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("Failed to create {}", args.output.display()))?;
        Box::new(BufWriter::new(file))
    };

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new(args.frames));
            pb.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} frames ({percent}%) | elapsed: {elapsed_precise}",
            )?);
            Some(pb)
        }
        None => None,
    };

    let mut corrupted = 0;
    for index in 0..args.frames {
        let header = RawvHeader {
            width: args.width,
            height: args.height,
            fourcc,
            corrupted: is_corrupted(index, args.corrupt_every),
        };
        corrupted += u64::from(header.corrupted);
        header.write_frame(&gradient_frame(&header, index), &mut out)?;

        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }
    out.flush()?;

    if let Some(pb) = pb {
        pb.finish();
    }
    log::info!("Wrote {} frames ({corrupted} flagged corrupted)", args.frames);
    Ok(())
}

fn is_corrupted(index: u64, every: Option<u64>) -> bool {
    every.is_some_and(|k| (index + 1) % k == 0)
}

/// Diagonal gradient drifting by four pixels per frame.
fn gradient_frame(header: &RawvHeader, index: u64) -> Vec<u8> {
    let (w, h) = (usize::from(header.width), usize::from(header.height));
    let shift = (index as usize).wrapping_mul(4);
    let mut payload = Vec::with_capacity(header.payload_len());

    match header.fourcc {
        FourCc::Nv12 => {
            for y in 0..h {
                payload.extend((0..w).map(|x| ((x + y + shift) % 220 + 16) as u8));
            }
            for y in 0..h / 2 {
                for x in 0..w / 2 {
                    payload.push((x * 255 / w.max(1) + 16) as u8);
                    payload.push((y * 255 / h.max(1) + 16) as u8);
                }
            }
        }
        FourCc::Rgb4 => {
            for y in 0..h {
                for x in 0..w {
                    let level = ((x + y + shift) % 256) as u8;
                    payload.extend_from_slice(&[level, (y % 256) as u8, (x % 256) as u8, 0xFF]);
                }
            }
        }
    }
    payload
}
