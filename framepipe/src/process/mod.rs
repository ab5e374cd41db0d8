/// Input window handed to the decode stage.
pub mod bitstream;

/// The producer loop threading surfaces from decode through VPP to the
/// output queue.
pub(crate) mod driver;

/// Consumer-facing pipeline with its own thread.
///
/// Provides [`Pipeline`](pipeline::Pipeline), configured through
/// [`PipelineConfig`](pipeline::PipelineConfig).
pub mod pipeline;

/// Reservation-counted surface pools.
pub mod pool;

/// Software session decoding RAWV streams.
pub mod soft;

/// Contracts of the decode, VPP and synchronisation stages.
pub mod stage;

/// Bounded waits on completion tokens.
pub mod sync;
