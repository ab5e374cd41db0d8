use std::path::PathBuf;
use std::sync::LazyLock;

use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};
use framepipe::alloc::MemType;
use framepipe::device::Implementation;
use framepipe::structs::frame::FourCc;
use serde::{Deserialize, Serialize};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}\nframepipe {}\nbuilt {}\ngit {}",
        env!("CARGO_PKG_VERSION"),
        env!("FRAMEPIPE_VERSION"),
        env!("BUILD_TIMESTAMP"),
        option_env!("VERGEN_GIT_DESCRIBE").unwrap_or("unknown"),
    )
});

#[derive(Debug, ClapParser)]
#[command(
    name         = env!("CARGO_PKG_NAME"),
    version      = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION.as_str(),
    author       = env!("CARGO_PKG_AUTHORS"),
    about        = "Runs decode and video post-processing pipelines over RAWV streams",
    long_about   = None,
)]
pub struct Cli {
    /// Set the log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Treat warnings as fatal errors (fail on first warning).
    #[arg(long, global = true)]
    pub strict: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    /// Show progress bars during operations.
    #[arg(long, global = true)]
    pub progress: bool,

    /// YAML file with pipeline settings; command line flags take precedence.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Choose an operation to perform.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Decode and post-process a RAWV stream.
    Decode(DecodeArgs),

    /// Print stream information
    Info(InfoArgs),

    /// Write a synthetic RAWV stream.
    Synth(SynthArgs),
}

#[derive(Debug, Default, Args)]
pub struct DecodeArgs {
    /// Input RAWV stream (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output path for processed frames of the last channel.
    #[arg(long, value_name = "PATH")]
    pub output_path: Option<PathBuf>,

    /// Layout of the written frames.
    #[arg(long, value_enum, default_value_t = OutputFormat::Rawv)]
    pub output_format: OutputFormat,

    /// Number of independent pipelines decoding the input.
    #[arg(long, value_name = "N")]
    pub channels: Option<usize>,

    /// Stop after N frames per channel; fewer frames is an error.
    #[arg(long, value_name = "N")]
    pub frames: Option<u64>,

    /// Drop frames instead of blocking when the output queue is full.
    #[arg(long)]
    pub drop_on_overflow: bool,

    /// Capacity of each channel's output queue.
    #[arg(long, value_name = "N")]
    pub queue_size: Option<usize>,

    /// Output width in pixels.
    #[arg(long, value_name = "W")]
    pub width: Option<u32>,

    /// Output height in pixels.
    #[arg(long, value_name = "H")]
    pub height: Option<u32>,

    /// Output pixel format.
    #[arg(long, value_enum)]
    pub fourcc: Option<Fourcc>,

    /// Memory type backing the surfaces.
    #[arg(long, value_enum)]
    pub memory: Option<Memory>,

    /// Session implementation.
    #[arg(long = "impl", value_enum)]
    pub implementation: Option<Impl>,

    /// Restart the input file from the beginning when it ends.
    #[arg(long)]
    pub repeat: bool,

    /// Write a YAML run report to FILE.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Disable progress estimation
    #[arg(long)]
    pub no_estimate_progress: bool,
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Input RAWV stream.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct SynthArgs {
    /// Output RAWV file (use "-" for stdout).
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Number of frames to write.
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub frames: u64,

    #[arg(long, value_name = "W", default_value_t = 320)]
    pub width: u16,

    #[arg(long, value_name = "H", default_value_t = 240)]
    pub height: u16,

    /// Pixel format of the stream.
    #[arg(long, value_enum, default_value_t = Fourcc::Nv12)]
    pub fourcc: Fourcc,

    /// Flag every K-th frame as corrupted.
    #[arg(long, value_name = "K")]
    pub corrupt_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Disable logging output.
    Off,
    /// No output except errors.
    Error,
    /// Show warnings and errors.
    Warn,
    /// Show info, warnings and errors (default).
    Info,
    /// Show debug, info, warnings and errors.
    Debug,
    /// Show all log messages including trace.
    Trace,
}

impl LogLevel {
    /// Convert LogLevel to log::LevelFilter
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Colorized human-readable text.
    Plain,
    /// Structured JSON per log record.
    Json,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq)]
pub enum OutputFormat {
    /// RAWV framed stream, readable by `info`.
    #[default]
    Rawv,
    /// Headerless frames, rows tightly packed.
    Raw,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fourcc {
    Nv12,
    /// Packed B, G, R, A (default output).
    #[default]
    Rgb4,
}

impl From<Fourcc> for FourCc {
    fn from(value: Fourcc) -> Self {
        match value {
            Fourcc::Nv12 => FourCc::Nv12,
            Fourcc::Rgb4 => FourCc::Rgb4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Memory {
    #[default]
    System,
    /// Device memory, mapped through a staging copy.
    Device,
}

impl From<Memory> for MemType {
    fn from(value: Memory) -> Self {
        match value {
            Memory::System => MemType::System,
            Memory::Device => MemType::Device,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impl {
    #[default]
    Auto,
    Software,
}

impl From<Impl> for Implementation {
    fn from(value: Impl) -> Self {
        match value {
            Impl::Auto => Implementation::Auto,
            Impl::Software => Implementation::Software,
        }
    }
}
