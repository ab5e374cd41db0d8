use std::time::Instant;

use anyhow::{Result, anyhow};
use indicatif::ProgressBar;
use log::Level;
use serde::Serialize;

use super::output::FrameWriter;
use framepipe::log_or_err;
use framepipe::process::pipeline::StatsSnapshot;
use framepipe::structs::surface::FramePair;
use framepipe::utils::queue::BlockingQueue;

pub struct ConsumerState {
    pub fail_level: Level,
}

/// Per-channel totals, serialized into the run report.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelReport {
    pub channel: usize,
    pub frames: u64,
    pub mismatches: u64,
    pub bytes_written: u64,
    pub decoded: u64,
    pub processed: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub busy_retries: u64,
    pub queue_high_water: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelReport {
    pub fn apply_stats(&mut self, stats: &StatsSnapshot) {
        self.decoded = stats.decoded;
        self.processed = stats.processed;
        self.dropped = stats.dropped;
        self.corrupted = stats.corrupted;
        self.busy_retries = stats.busy_retries;
        self.queue_high_water = stats.queue_high_water;
    }
}

/// Takes frame pairs from one channel's output queue until it closes or
/// `limit` pairs have been seen.
pub struct Consumer {
    channel: usize,
    limit: Option<u64>,
    writer: Option<FrameWriter>,
    pb: Option<ProgressBar>,
    state: ConsumerState,
}

impl Consumer {
    pub fn new(channel: usize, limit: Option<u64>, fail_level: Level) -> Self {
        Self {
            channel,
            limit,
            writer: None,
            pb: None,
            state: ConsumerState { fail_level },
        }
    }

    pub fn with_writer(mut self, writer: Option<FrameWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_progress(mut self, pb: Option<ProgressBar>) -> Self {
        self.pb = pb;
        self
    }

    pub fn run(mut self, queue: &BlockingQueue<FramePair>) -> Result<ChannelReport> {
        let mut report = ChannelReport {
            channel: self.channel,
            ..ChannelReport::default()
        };
        let start = Instant::now();

        while self.limit.is_none_or(|limit| report.frames < limit) {
            let Some(pair) = queue.get() else {
                break;
            };
            self.handle(&pair, &mut report)?;

            if let Some(pb) = &self.pb {
                pb.inc(1);
                if report.frames % 30 == 0 {
                    let fps = report.frames as f64 / start.elapsed().as_secs_f64().max(f64::EPSILON);
                    pb.set_message(format!("speed: {fps:.1} fps"));
                }
            }
        }

        if let Some(writer) = self.writer.take() {
            report.bytes_written = writer.finish()?;
        }
        log::debug!(
            "Channel {}: consumed {} frames ({} mismatched)",
            self.channel,
            report.frames,
            report.mismatches
        );
        Ok(report)
    }

    fn handle(&mut self, pair: &FramePair, report: &mut ChannelReport) -> Result<()> {
        let decoded = pair.decoded.frame_number();
        let processed = pair.processed.frame_number();
        log::debug!(
            "Channel {}: frame (decode {decoded}, vpp {processed})",
            self.channel
        );

        if !pair.is_matched() {
            report.mismatches += 1;
            log_or_err!(
                self.state,
                Level::Warn,
                anyhow!(
                    "Channel {}: decode frame {decoded} paired with vpp frame {processed}",
                    self.channel
                )
            );
        }

        if let Some(writer) = &mut self.writer {
            writer.write_surface(&pair.processed)?;
        }
        report.frames += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::command::OutputFormat;
    use framepipe::device::{Device, Implementation};
    use framepipe::process::pipeline::{Pipeline, PipelineConfig};
    use framepipe::process::soft::SoftSessionFactory;
    use framepipe::process::stage;
    use framepipe::structs::frame::FourCc;
    use framepipe::structs::rawv::{RawvHeader, summarize};
    use std::sync::Arc;

    fn stream(frames: usize) -> Vec<u8> {
        let header = RawvHeader {
            width: 32,
            height: 16,
            fourcc: FourCc::Nv12,
            corrupted: false,
        };
        let mut out = Vec::new();
        for i in 0..frames {
            header
                .write_frame(&vec![(i * 8) as u8; header.payload_len()], &mut out)
                .unwrap();
        }
        out
    }

    fn pipeline() -> Pipeline {
        let config = PipelineConfig {
            queue_size: 2,
            output: stage::OutputFormat {
                width: 24,
                height: 8,
                fourcc: FourCc::Rgb4,
            },
            bitstream_capacity: 256,
            ..PipelineConfig::default()
        };
        Pipeline::new(
            Device::open(Implementation::Software),
            Arc::new(SoftSessionFactory::default()),
            config,
        )
    }

    #[test]
    fn writes_every_frame_as_rawv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.rawv");

        let mut p = pipeline();
        p.start(stream(6), Implementation::Software, false).unwrap();
        let writer = FrameWriter::create(&path, OutputFormat::Rawv).unwrap();
        let report = Consumer::new(0, None, Level::Error)
            .with_writer(Some(writer))
            .run(&p.output())
            .unwrap();
        p.stop().unwrap();

        assert_eq!(report.frames, 6);
        assert_eq!(report.mismatches, 0);

        let summary = summarize(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.bytes, report.bytes_written);
        let first = summary.first.unwrap();
        assert_eq!((first.width, first.height, first.fourcc), (24, 8, FourCc::Rgb4));
    }

    #[test]
    fn limit_stops_early() {
        let mut p = pipeline();
        p.start(stream(10), Implementation::Software, false).unwrap();
        let report = Consumer::new(1, Some(3), Level::Error)
            .run(&p.output())
            .unwrap();
        p.stop().unwrap();

        assert_eq!(report.channel, 1);
        assert_eq!(report.frames, 3);
        assert_eq!(report.bytes_written, 0);
    }
}
