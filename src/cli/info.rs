use anyhow::{Result, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::Level;

use super::command::{Cli, InfoArgs};
use crate::input::InputReader;
use crate::timestamp::{frames_duration, time_str};
use framepipe::log_or_err;
use framepipe::structs::frame::{FrameInfo, PicStruct};
use framepipe::structs::rawv::{StreamSummary, summarize};

struct InfoState {
    fail_level: Level,
}

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing RAWV stream: {}", args.input.display());

    let input = InputReader::new(&args.input)?;

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb.set_message("Scanning frames...");
            Some(pb)
        }
        None => None,
    };

    let summary = summarize(input);
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let summary = summary?;

    if summary.first.is_none() {
        println!("No RAWV sync found in the input.");
        println!("This doesn't appear to be a RAWV stream.");
        return Ok(());
    }

    display_summary(&summary);

    let state = InfoState {
        fail_level: if cli.strict { Level::Warn } else { Level::Error },
    };
    check_stream(&summary, &state)
}

fn check_stream(summary: &StreamSummary, state: &InfoState) -> Result<()> {
    if summary.geometry_changes > 0 {
        log_or_err!(
            state,
            Level::Warn,
            anyhow::anyhow!("Geometry changes {} times", summary.geometry_changes)
        );
    }
    if summary.trailing_bytes > 0 {
        log_or_err!(
            state,
            Level::Warn,
            anyhow::anyhow!("Stream ends with {} bytes of a partial frame", summary.trailing_bytes)
        );
    }
    if summary.frames == summary.corrupted {
        bail!("Every frame in the stream is flagged corrupted");
    }
    Ok(())
}

fn display_summary(summary: &StreamSummary) {
    let Some(first) = summary.first else {
        return;
    };
    let info = FrameInfo::with_crop(
        first.fourcc,
        u32::from(first.width),
        u32::from(first.height),
        PicStruct::Progressive,
    );

    println!();
    println!("RAWV Stream Information");
    println!("=======================");
    println!();
    println!("Stream Information");
    println!("  Geometry                  {}x{}", first.width, first.height);
    println!("  Pixel format              {}", first.fourcc);
    println!("  Surface size              {}x{}", info.width, info.height);
    println!("  Frame size                {} bytes", first.payload_len());
    println!();

    println!("Analysis Summary");
    println!("  Frames                    {}", summary.frames);
    println!("  Corrupted frames          {}", summary.corrupted);
    println!("  Geometry changes          {}", summary.geometry_changes);
    if summary.skipped_bytes > 0 {
        println!("  Skipped bytes             {}", summary.skipped_bytes);
    }
    if summary.trailing_bytes > 0 {
        println!("  Trailing bytes            {}", summary.trailing_bytes);
    }

    let size_mb = summary.bytes as f64 / 1_000_000.0;
    println!("  Size                      {size_mb:.2} MB ({} bytes)", summary.bytes);
    let duration = frames_duration(summary.frames, info.frame_rate());
    println!(
        "  Duration                  {} at {} fps",
        time_str(duration),
        info.frame_rate()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> StreamSummary {
        StreamSummary {
            frames: 4,
            geometry_changes: 1,
            ..StreamSummary::default()
        }
    }

    #[test]
    fn geometry_changes_fail_only_in_strict_mode() {
        let relaxed = InfoState {
            fail_level: Level::Error,
        };
        assert!(check_stream(&summary(), &relaxed).is_ok());

        let strict = InfoState {
            fail_level: Level::Warn,
        };
        assert!(check_stream(&summary(), &strict).is_err());
    }

    #[test]
    fn all_corrupted_is_an_error() {
        let state = InfoState {
            fail_level: Level::Error,
        };
        let all_bad = StreamSummary {
            frames: 2,
            corrupted: 2,
            ..StreamSummary::default()
        };
        assert!(check_stream(&all_bad, &state).is_err());
    }
}
