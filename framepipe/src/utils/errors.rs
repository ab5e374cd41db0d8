#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err);
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

use crate::alloc::MemType;
use crate::process::stage::{Stage, Status};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Allocation request for zero frames")]
    ZeroFrames,

    #[error("No allocator registered for {0} memory")]
    Unsupported(MemType),

    #[error("Unknown memory id {0}")]
    NotFound(u64),

    #[error("Memory id {0} is not mapped")]
    NotLocked(u64),

    #[error("Allocator out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Device has been closed")]
    DeviceClosed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RawvError {
    #[error("Insufficient data")]
    InsufficientData,

    #[error("Sync word mismatch: {0:#010x}")]
    BadSync(u32),

    #[error("Unknown fourcc {0:#010x}")]
    UnknownFourcc(u32),

    #[error("Empty frame geometry {width}x{height}")]
    EmptyGeometry { width: u16, height: u16 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Surface allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("Allocator returned {actual} surfaces, at least {expected} required")]
    ShortAllocation { expected: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} returned {status:?}")]
    Status { stage: Stage, status: Status },

    #[error("Stream header not found in the first {0} bytes")]
    HeaderNotFound(usize),

    #[error("Unsupported frame format: {0}")]
    UnsupportedFormat(String),

    #[error("Decoder wants more data but its {0} byte input window is full")]
    InputStalled(usize),

    #[error("Surface memory error: {0}")]
    Alloc(#[from] AllocError),
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Surface pool setup failed: {0}")]
    Pool(#[from] PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No free surface in the {0} pool")]
    PoolExhausted(Stage),

    #[error("{stage} failed with {status:?}")]
    StageFailed { stage: Stage, status: Status },

    #[error("VPP requested more output surfaces, only 1:1 processing is supported")]
    MoreSurfaceUnsupported,

    #[error("No decode surface matches VPP frame order {0}")]
    FrameOrderNotFound(u32),

    #[error("Video parameters changed mid-stream")]
    ParamChanged,

    #[error("Pipeline thread panicked")]
    Panicked,
}

impl PipelineError {
    /// Returns `true` for faults raised by the hardware stages rather than by
    /// pool sizing or setup.
    pub fn is_stage_fault(&self) -> bool {
        matches!(
            self,
            PipelineError::StageFailed { .. }
                | PipelineError::MoreSurfaceUnsupported
                | PipelineError::FrameOrderNotFound(_)
                | PipelineError::ParamChanged
        )
    }
}
