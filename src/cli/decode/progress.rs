use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::input::InputReader;
use crate::timestamp::time_str;
use framepipe::structs::rawv::summarize;

/// Scans the whole input once. Frames flagged corrupted are counted too: the
/// decoder resets on them but they still pass through the pipeline.
pub fn estimate_total_frames(input_path: &Path) -> Result<u64> {
    let reader = InputReader::new(input_path)?;
    if reader.is_pipe() {
        bail!("Cannot estimate frames of a pipe input");
    }
    let expected_bytes = reader.size();

    let scan_start = Instant::now();
    let summary = summarize(reader)?;
    let scan_time = scan_start.elapsed();

    if expected_bytes.is_some_and(|size| size != summary.bytes) {
        log::warn!("Input changed size while counting frames");
    }
    let throughput = summary.bytes as f64 / 1_000_000.0 / scan_time.as_secs_f64().max(1e-9);
    log::info!(
        "Estimated {} frames ({} corrupted, {} bytes skipped) in {} at {throughput:.1} MB/s",
        summary.frames,
        summary.corrupted,
        summary.skipped_bytes,
        time_str(scan_time)
    );

    Ok(summary.frames)
}

fn bar_style(bounded: bool) -> Result<ProgressStyle> {
    let template = if bounded {
        "{prefix} {wide_bar:.cyan/blue} {pos}/{len} ({percent}%)\n{msg} | {elapsed_precise} | ETA {eta}"
    } else {
        "{prefix} {spinner:.green} {pos} frames\n{msg} | {elapsed_precise}"
    };
    Ok(ProgressStyle::with_template(template)?.progress_chars("=> "))
}

pub fn create_progress_bar(multi: &MultiProgress, total_frames: Option<u64>) -> Result<ProgressBar> {
    let pb = match total_frames {
        Some(total) => multi.add(ProgressBar::new(total)),
        None => multi.add(ProgressBar::new_spinner()),
    };
    pb.set_style(bar_style(total_frames.is_some())?);
    pb.set_prefix("decode");
    pb.set_message("starting pipelines");
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

pub fn finalize_progress_bar(pb: &Option<ProgressBar>, frames: u64, elapsed: Duration) {
    let Some(pb) = pb else {
        return;
    };
    let fps = frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    pb.finish_with_message(format!("{frames} frames at {fps:.1} fps in {}", time_str(elapsed)));
}
