use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::super::command::OutputFormat;
use super::consumer::ChannelReport;
use framepipe::structs::frame::FourCc;
use framepipe::structs::rawv::RawvHeader;
use framepipe::structs::surface::Surface;

pub fn create_path_with_extension(base_path: &Path, expected_ext: &str) -> PathBuf {
    match (base_path.extension(), base_path.file_name()) {
        (Some(ext), _) if ext == expected_ext => base_path.to_path_buf(),
        (Some(_), Some(name)) => {
            base_path.with_file_name(format!("{}.{expected_ext}", name.to_string_lossy()))
        }
        _ => base_path.with_extension(expected_ext),
    }
}

pub fn output_path(base_path: &Path, format: OutputFormat, fourcc: FourCc) -> PathBuf {
    let ext = match (format, fourcc) {
        (OutputFormat::Rawv, _) => "rawv",
        (OutputFormat::Raw, FourCc::Nv12) => "nv12",
        (OutputFormat::Raw, FourCc::Rgb4) => "rgb4",
    };
    create_path_with_extension(base_path, ext)
}

/// Writes the visible picture of processed surfaces.
pub struct FrameWriter {
    out: BufWriter<File>,
    format: OutputFormat,
    frames: u64,
    bytes: u64,
}

impl FrameWriter {
    pub fn create(path: &Path, format: OutputFormat) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        log::info!("Writing frames to {}", path.display());
        Ok(Self {
            out: BufWriter::new(file),
            format,
            frames: 0,
            bytes: 0,
        })
    }

    pub fn write_surface(&mut self, surface: &Surface) -> Result<()> {
        let info = *surface.info();
        let payload = surface.with_data(|data| info.pack_visible(&data.bytes(), data.pitch))?;

        match self.format {
            OutputFormat::Rawv => {
                let header = RawvHeader {
                    width: u16::try_from(info.crop_w)?,
                    height: u16::try_from(info.crop_h)?,
                    fourcc: info.fourcc,
                    corrupted: surface.is_corrupted(),
                };
                header.write_frame(&payload, &mut self.out)?;
                self.bytes += header.frame_len() as u64;
            }
            OutputFormat::Raw => {
                self.out.write_all(&payload)?;
                self.bytes += payload.len() as u64;
            }
        }
        self.frames += 1;
        Ok(())
    }

    /// Flushes the output. Returns the number of bytes written.
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        log::debug!("Wrote {} frames, {} bytes", self.frames, self.bytes);
        Ok(self.bytes)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunReport {
    pub input: String,
    pub elapsed_secs: f64,
    pub fps: f64,
    pub channels: Vec<ChannelReport>,
}

pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(report)?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    log::info!("Run report written to {}", path.display());
    Ok(())
}
