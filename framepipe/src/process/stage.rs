//! Contracts of the hardware collaborators driven by the pipeline.
//!
//! A [`Session`] bundles one decode stage, one VPP stage and the synchronizer
//! for their completion tokens. The pipeline only ever talks to these traits;
//! the software reference implementation lives in [`super::soft`].

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::alloc::{AllocRequest, MemType};
use crate::device::{Device, Implementation};
use crate::process::bitstream::Bitstream;
use crate::structs::frame::{FourCc, FrameInfo};
use crate::structs::surface::Surface;
use crate::utils::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Vpp,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Decode => write!(f, "decode"),
            Stage::Vpp => write!(f, "vpp"),
        }
    }
}

/// Result code of a stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,

    // warnings
    DeviceBusy,
    VideoParamChanged,
    PartialAcceleration,
    InExecution,

    // requests
    MoreData,
    MoreSurface,

    // errors
    Timeout,
    Unsupported,
    NotInitialized,
    InvalidHandle,
    MemoryAlloc,
    DeviceFailed,
    Aborted,
    Undefined(i32),
}

impl Status {
    /// Non-fatal status that may still come with a completion token.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Status::DeviceBusy
                | Status::VideoParamChanged
                | Status::PartialAcceleration
                | Status::InExecution
        )
    }

    /// `Ok` or a warning.
    pub fn is_success(self) -> bool {
        self == Status::Ok || self.is_warning()
    }

    pub fn is_error(self) -> bool {
        !self.is_success() && !matches!(self, Status::MoreData | Status::MoreSurface)
    }
}

/// Completion token of an asynchronous stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncPoint(pub u64);

/// Stream parameters found by [`DecodeStage::decode_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoParams {
    pub frame_info: FrameInfo,
    pub mem_type: MemType,
}

/// Output geometry requested from the VPP stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            width: 448,
            height: 448,
            fourcc: FourCc::Rgb4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppParams {
    pub input: FrameInfo,
    pub output: FrameInfo,
    pub mem_type: MemType,
}

impl VppParams {
    /// VPP parameters converting decoded frames described by `video` into
    /// `output`.
    pub fn for_decode(video: &VideoParams, output: &OutputFormat) -> Self {
        let decoded = &video.frame_info;
        let input = FrameInfo::with_crop(
            decoded.fourcc,
            decoded.crop_w,
            decoded.crop_h,
            decoded.pic_struct,
        );
        let output = FrameInfo::with_crop(
            output.fourcc,
            output.width,
            output.height,
            decoded.pic_struct,
        );
        Self {
            input,
            output,
            mem_type: video.mem_type,
        }
    }
}

/// What a decode call produced.
#[derive(Debug, Clone)]
pub struct DecodeCall {
    pub status: Status,
    pub output: Option<Arc<Surface>>,
    pub sync: Option<SyncPoint>,
}

impl DecodeCall {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            output: None,
            sync: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppCall {
    pub status: Status,
    pub sync: Option<SyncPoint>,
}

impl VppCall {
    pub fn status(status: Status) -> Self {
        Self { status, sync: None }
    }
}

pub trait DecodeStage: Send {
    /// Parses stream parameters from the start of `bitstream`.
    fn decode_header(&mut self, bitstream: &mut Bitstream) -> Result<VideoParams, StageError>;

    /// Surfaces the decoder needs to work with `params`.
    fn query_io_surf(&mut self, params: &VideoParams) -> Result<AllocRequest, StageError>;

    fn init(&mut self, params: &VideoParams) -> Result<(), StageError>;

    /// Decodes into `work`. `bitstream` is `None` once input is exhausted,
    /// asking the decoder to drain buffered frames.
    fn decode_frame_async(
        &mut self,
        bitstream: Option<&mut Bitstream>,
        work: &Arc<Surface>,
    ) -> DecodeCall;

    /// Restarts decoding after a corrupted frame.
    fn reset(&mut self, params: &VideoParams) -> Result<(), StageError>;

    fn close(&mut self);
}

pub trait VppStage: Send {
    /// Input and output surface requirements, in that order.
    fn query_io_surf(&mut self, params: &VppParams) -> Result<[AllocRequest; 2], StageError>;

    fn init(&mut self, params: &VppParams) -> Result<(), StageError>;

    /// Processes `input` into `output`. `input` is `None` when decode is done.
    fn run_frame_async(&mut self, input: Option<&Arc<Surface>>, output: &Arc<Surface>) -> VppCall;

    fn close(&mut self);
}

pub trait Synchronize: Send {
    /// Waits up to `wait` for `sync` to complete. Returns `InExecution` if the
    /// operation is still pending.
    fn sync_operation(&mut self, sync: SyncPoint, wait: Duration) -> Status;
}

pub struct Session {
    pub decoder: Box<dyn DecodeStage>,
    pub vpp: Box<dyn VppStage>,
    pub sync: Box<dyn Synchronize>,
}

impl Session {
    /// Closes both stages. Safe to call more than once.
    pub fn close(&mut self) {
        self.vpp.close();
        self.decoder.close();
    }
}

/// Creates sessions on a device.
pub trait SessionFactory: Send + Sync {
    fn create_session(
        &self,
        device: &Arc<Device>,
        implementation: Implementation,
    ) -> Result<Session, StageError>;
}
