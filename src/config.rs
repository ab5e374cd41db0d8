use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use framepipe::process::bitstream::BITSTREAM_CAPACITY;
use framepipe::process::pipeline::PipelineConfig;
use framepipe::process::stage::OutputFormat;
use framepipe::process::sync::SyncPolicy;
use serde::{Deserialize, Serialize};

use crate::cli::command::{DecodeArgs, Fourcc, Impl, Memory};

/// Decode settings as read from `--config`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub channels: usize,
    pub queue_size: usize,
    pub drop_on_overflow: bool,
    pub width: u32,
    pub height: u32,
    pub fourcc: Fourcc,
    pub memory: Memory,
    #[serde(rename = "impl")]
    pub implementation: Impl,
    pub decode_reserve_extra: usize,
    pub vpp_reserve_extra: usize,
    pub sync_timeout_ms: u64,
    pub busy_sleep_ms: u64,
    pub stats_interval_secs: Option<u64>,
    pub bitstream_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            channels: 1,
            queue_size: pipeline.queue_size,
            drop_on_overflow: false,
            width: pipeline.output.width,
            height: pipeline.output.height,
            fourcc: Fourcc::Rgb4,
            memory: Memory::System,
            implementation: Impl::Auto,
            decode_reserve_extra: pipeline.decode_reserve_extra,
            vpp_reserve_extra: pipeline.vpp_reserve_extra,
            sync_timeout_ms: pipeline.sync.timeout.as_millis() as u64,
            busy_sleep_ms: pipeline.busy_sleep.as_millis() as u64,
            stats_interval_secs: None,
            bitstream_capacity: BITSTREAM_CAPACITY,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let settings = Self::from_yaml(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // an empty document is a valid, all-default config
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(text)?)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Overrides file values with the flags given on the command line.
    pub fn apply_args(&mut self, args: &DecodeArgs) {
        if let Some(channels) = args.channels {
            self.channels = channels;
        }
        if let Some(queue_size) = args.queue_size {
            self.queue_size = queue_size;
        }
        self.drop_on_overflow |= args.drop_on_overflow;
        if let Some(width) = args.width {
            self.width = width;
        }
        if let Some(height) = args.height {
            self.height = height;
        }
        if let Some(fourcc) = args.fourcc {
            self.fourcc = fourcc;
        }
        if let Some(memory) = args.memory {
            self.memory = memory;
        }
        if let Some(implementation) = args.implementation {
            self.implementation = implementation;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            bail!("At least one channel is required");
        }
        if self.queue_size == 0 {
            bail!("Queue size must be at least 1");
        }
        if self.width == 0 || self.height == 0 {
            bail!("Output size {}x{} is empty", self.width, self.height);
        }
        if self.fourcc == Fourcc::Nv12 && (self.width % 2 != 0 || self.height % 2 != 0) {
            bail!("NV12 output needs even dimensions, got {}x{}", self.width, self.height);
        }
        Ok(())
    }

    pub fn pipeline_config(&self, strict: bool, repeat: bool) -> PipelineConfig {
        PipelineConfig {
            queue_size: self.queue_size,
            output: OutputFormat {
                width: self.width,
                height: self.height,
                fourcc: self.fourcc.into(),
            },
            mem_type: self.memory.into(),
            decode_reserve_extra: self.decode_reserve_extra,
            vpp_reserve_extra: self.vpp_reserve_extra,
            sync: SyncPolicy {
                timeout: Duration::from_millis(self.sync_timeout_ms),
                ..SyncPolicy::default()
            },
            busy_sleep: Duration::from_millis(self.busy_sleep_ms),
            strict,
            stats_interval: self.stats_interval_secs.map(Duration::from_secs),
            bitstream_capacity: self.bitstream_capacity,
            repeat,
        }
    }
}
