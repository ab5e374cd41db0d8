use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use indicatif::MultiProgress;
use log::Level;

use super::consumer::{ChannelReport, Consumer};
use super::output::{FrameWriter, RunReport, output_path, write_report};
use super::progress::{create_progress_bar, estimate_total_frames, finalize_progress_bar};
use crate::cli::command::{Cli, DecodeArgs};
use crate::config::Settings;
use crate::input::is_pipe;
use crate::timestamp::time_str;
use framepipe::device::Device;
use framepipe::process::pipeline::Pipeline;
use framepipe::process::soft::SoftSessionFactory;
use framepipe::process::stage::SessionFactory;

pub fn cmd_decode(args: &DecodeArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    settings.apply_args(args);
    settings.validate()?;

    let pipe = is_pipe(&args.input);
    if pipe && settings.channels > 1 {
        bail!("Standard input can feed only one channel");
    }
    if pipe && args.repeat {
        bail!("--repeat needs a seekable input file");
    }

    log::info!(
        "Decoding RAWV stream: {} ({} channel(s), output {}x{} {:?}, strict mode: {})",
        args.input.display(),
        settings.channels,
        settings.width,
        settings.height,
        settings.fourcc,
        cli.strict
    );

    let total_frames = if args.repeat || pipe || args.no_estimate_progress || multi.is_none() {
        args.frames.filter(|_| args.repeat)
    } else {
        let estimate = estimate_total_frames(&args.input)?;
        Some(args.frames.map_or(estimate, |limit| limit.min(estimate)))
    };
    let pb = multi
        .map(|multi| create_progress_bar(multi, total_frames))
        .transpose()?;

    let writer = args
        .output_path
        .as_deref()
        .map(|base| {
            let path = output_path(base, args.output_format, settings.fourcc.into());
            FrameWriter::create(&path, args.output_format)
        })
        .transpose()?;

    let fail_level = if cli.strict { Level::Warn } else { Level::Error };
    let device = Device::open(settings.implementation.into());
    let factory: Arc<dyn SessionFactory> = Arc::new(SoftSessionFactory::default());
    let config = settings.pipeline_config(cli.strict, args.repeat);

    let mut pipelines = Vec::with_capacity(settings.channels);
    for _ in 0..settings.channels {
        let mut pipeline = Pipeline::new(device.clone(), factory.clone(), config.clone());
        pipeline.start(args.input.as_path(), device.implementation(), settings.drop_on_overflow)?;
        pipelines.push(pipeline);
    }

    let start_time = Instant::now();
    let last = settings.channels - 1;

    // every channel but the last is drained on its own thread
    let workers = pipelines[..last]
        .iter()
        .enumerate()
        .map(|(channel, pipeline)| {
            let queue = pipeline.output();
            let consumer = Consumer::new(channel, args.frames, fail_level);
            thread::Builder::new()
                .name(format!("consumer-{channel}"))
                .spawn(move || consumer.run(&queue))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let main_result = Consumer::new(last, args.frames, fail_level)
        .with_writer(writer)
        .with_progress(pb.clone())
        .run(&pipelines[last].output());

    // a failed writer must not leave the other channels running forever
    if main_result.is_err() {
        for pipeline in &mut pipelines {
            pipeline.output().close();
        }
    }

    let mut results: Vec<Result<ChannelReport>> = workers
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| anyhow!("Consumer thread panicked"))
                .and_then(|result| result)
        })
        .collect();
    results.push(main_result);

    let elapsed = start_time.elapsed();
    let mut reports = Vec::with_capacity(results.len());
    let mut failures = 0;
    for (channel, (pipeline, result)) in pipelines.iter_mut().zip(results).enumerate() {
        let stopped = pipeline.stop();
        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                log::error!("Channel {channel}: {e:#}");
                ChannelReport {
                    channel,
                    error: Some(format!("{e:#}")),
                    ..ChannelReport::default()
                }
            }
        };
        report.apply_stats(&pipeline.stats());

        if let Err(e) = stopped {
            if e.is_stage_fault() {
                log::error!("Channel {channel}: stage fault: {e}");
            } else {
                log::error!("Channel {channel}: pipeline failed: {e}");
            }
            report.error.get_or_insert_with(|| e.to_string());
        } else if let Some(expected) = args.frames.filter(|&n| report.frames < n) {
            let message = format!("produced {} of {expected} frames", report.frames);
            log::error!("Channel {channel}: {message}");
            report.error.get_or_insert(message);
        }
        if report.error.is_some() {
            failures += 1;
        }
        reports.push(report);
    }

    let frames: u64 = reports.iter().map(|r| r.frames).sum();
    let fps = frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    finalize_progress_bar(&pb, reports.last().map_or(0, |r| r.frames), elapsed);
    log::info!(
        "Processed {frames} frames over {} channel(s) in {} ({fps:.1} fps)",
        reports.len(),
        time_str(elapsed)
    );
    for report in &reports {
        log::debug!("Channel {}: {report:?}", report.channel);
    }

    if let Some(path) = &args.report {
        write_report(
            path,
            &RunReport {
                input: args.input.display().to_string(),
                elapsed_secs: elapsed.as_secs_f64(),
                fps,
                channels: reports,
            },
        )?;
    }

    drop(pipelines);
    device.close();

    if failures > 0 {
        bail!("{failures} of {} channel(s) failed", settings.channels);
    }
    Ok(())
}
